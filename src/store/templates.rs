//! Template registry rows, blueprint runs, and the feedback streams that
//! feed performance aggregation.

use chrono::Utc;
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::instrument;
use uuid::Uuid;

use super::{
    PipelineStore, Result, StoreError, parse_json, parse_json_opt, parse_string_list, parse_ts,
    parse_ts_opt, parse_uuid, ts,
};
use crate::model::{BlueprintRun, BlueprintRunStatus, TemplateRecord};

fn template_from_row(row: &SqliteRow) -> Result<TemplateRecord> {
    let id: String = row.get("id");
    Ok(TemplateRecord {
        id: parse_uuid(&id, "templates.id")?,
        slug: row.get("slug"),
        name: row.get("name"),
        category: row.get("category"),
        style: row.get("style"),
        version: row.get("version"),
        status: row.get("status"),
        is_active: row.get::<i64, _>("is_active") != 0,
        feature_tags: parse_string_list(&row.get::<String, _>("feature_tags_json")),
        default_config: parse_json_opt(row.get("default_config_json")),
        meta: parse_json_opt(row.get("meta_json")),
        blueprint: parse_json_opt(row.get("blueprint_json")),
        blueprint_hash: row.get("blueprint_hash"),
        blueprint_quality: parse_json_opt(row.get("blueprint_quality_json")),
        prompt_log: parse_json(&row.get::<String, _>("prompt_log_json")),
        preview_url: row.get("preview_url"),
        preview_thumbnail_url: row.get("preview_thumbnail_url"),
        preview_status: row.get("preview_status"),
        preview_error: row.get("preview_error"),
        preview_last_generated_at: parse_ts_opt(row.get("preview_last_generated_at")),
        validation_status: row.get("validation_status"),
        validation_results: parse_json_opt(row.get("validation_results_json")),
        validation_hash: row.get("validation_hash"),
        validation_last_run_at: parse_ts_opt(row.get("validation_last_run_at")),
        performance_metrics: parse_json_opt(row.get("performance_metrics_json")),
        created_at: parse_ts(&row.get::<String, _>("created_at")),
    })
}

const TEMPLATE_COLUMNS: &str = "id, slug, name, category, style, version, status, is_active, \
     feature_tags_json, default_config_json, meta_json, blueprint_json, blueprint_hash, \
     blueprint_quality_json, prompt_log_json, preview_url, preview_thumbnail_url, \
     preview_status, preview_error, preview_last_generated_at, validation_status, \
     validation_results_json, validation_hash, validation_last_run_at, \
     performance_metrics_json, created_at";

impl PipelineStore {
    #[instrument(skip(self), err)]
    pub async fn create_template(
        &self,
        slug: &str,
        name: &str,
        category: Option<&str>,
        style: Option<&str>,
    ) -> Result<TemplateRecord> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO templates (id, slug, name, category, style, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(id.to_string())
        .bind(slug)
        .bind(name)
        .bind(category)
        .bind(style)
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        self.get_template(id).await?.ok_or_else(|| StoreError::Corrupt {
            what: format!("template {id} vanished after insert"),
        })
    }

    pub async fn get_template(&self, template_id: Uuid) -> Result<Option<TemplateRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM templates WHERE id = ?1"
        ))
        .bind(template_id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(template_from_row).transpose()
    }

    pub async fn list_active_templates(&self) -> Result<Vec<TemplateRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM templates WHERE is_active = 1 ORDER BY created_at ASC"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(template_from_row).collect()
    }

    /// Persist the outcome of a blueprint pipeline run on the template row.
    /// Resets validation state: a new blueprint invalidates prior validation.
    #[instrument(skip(self, blueprint, quality, prompt_log), err)]
    pub async fn save_template_blueprint(
        &self,
        template_id: Uuid,
        blueprint: &Value,
        blueprint_hash: &str,
        quality: &Value,
        prompt_log: &Value,
        status: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE templates SET blueprint_json = ?2, blueprint_hash = ?3, \
             blueprint_quality_json = ?4, prompt_log_json = ?5, status = ?6, \
             validation_status = 'not_run', validation_hash = NULL WHERE id = ?1",
        )
        .bind(template_id.to_string())
        .bind(blueprint.to_string())
        .bind(blueprint_hash)
        .bind(quality.to_string())
        .bind(prompt_log.to_string())
        .bind(status)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Record a preview result. Success resets validation state since the
    /// bundle changed.
    pub async fn save_template_preview(
        &self,
        template_id: Uuid,
        preview_url: Option<&str>,
        thumbnail_url: Option<&str>,
        preview_status: &str,
        preview_error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE templates SET preview_url = COALESCE(?2, preview_url), \
             preview_thumbnail_url = ?3, preview_status = ?4, preview_error = ?5, \
             preview_last_generated_at = ?6, \
             validation_status = CASE WHEN ?4 = 'ready' THEN 'not_run' ELSE validation_status END, \
             validation_hash = CASE WHEN ?4 = 'ready' THEN NULL ELSE validation_hash END \
             WHERE id = ?1",
        )
        .bind(template_id.to_string())
        .bind(preview_url)
        .bind(thumbnail_url)
        .bind(preview_status)
        .bind(preview_error)
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn save_template_validation(
        &self,
        template_id: Uuid,
        validation_status: &str,
        results: &Value,
        validation_hash: Option<&str>,
        preview_error: Option<&str>,
        promote_to_validated: bool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE templates SET validation_status = ?2, validation_results_json = ?3, \
             validation_hash = ?4, validation_last_run_at = ?5, preview_error = ?6, \
             status = CASE WHEN ?7 THEN 'validated' ELSE status END \
             WHERE id = ?1",
        )
        .bind(template_id.to_string())
        .bind(validation_status)
        .bind(results.to_string())
        .bind(validation_hash)
        .bind(ts(Utc::now()))
        .bind(preview_error)
        .bind(promote_to_validated)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn save_template_metrics(&self, template_id: Uuid, metrics: &Value) -> Result<()> {
        sqlx::query("UPDATE templates SET performance_metrics_json = ?2 WHERE id = ?1")
            .bind(template_id.to_string())
            .bind(metrics.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // -- Blueprint runs ---------------------------------------------------

    pub async fn create_blueprint_run(&self, template_id: Uuid, payload: &Value) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO blueprint_runs (id, template_id, status, payload_json, created_at) \
             VALUES (?1, ?2, 'queued', ?3, ?4)",
        )
        .bind(id.to_string())
        .bind(template_id.to_string())
        .bind(payload.to_string())
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(id)
    }

    pub async fn get_blueprint_run(&self, run_id: Uuid) -> Result<Option<BlueprintRun>> {
        let row = sqlx::query(
            "SELECT id, template_id, status, payload_json, result_json, error_text, \
             started_at, finished_at, created_at FROM blueprint_runs WHERE id = ?1",
        )
        .bind(run_id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.map(|row| {
            let id: String = row.get("id");
            let template_id: String = row.get("template_id");
            let status_raw: String = row.get("status");
            Ok(BlueprintRun {
                id: parse_uuid(&id, "blueprint_runs.id")?,
                template_id: parse_uuid(&template_id, "blueprint_runs.template_id")?,
                status: BlueprintRunStatus::decode(&status_raw).ok_or_else(|| {
                    StoreError::Corrupt {
                        what: format!("blueprint_runs.status '{status_raw}'"),
                    }
                })?,
                payload: parse_json(&row.get::<String, _>("payload_json")),
                result: parse_json_opt(row.get("result_json")),
                error_text: row.get("error_text"),
                started_at: parse_ts_opt(row.get("started_at")),
                finished_at: parse_ts_opt(row.get("finished_at")),
                created_at: parse_ts(&row.get::<String, _>("created_at")),
            })
        })
        .transpose()
    }

    pub async fn update_blueprint_run(
        &self,
        run_id: Uuid,
        status: BlueprintRunStatus,
        result: Option<&Value>,
        error_text: Option<&str>,
    ) -> Result<()> {
        let now = ts(Utc::now());
        sqlx::query(
            "UPDATE blueprint_runs SET status = ?2, result_json = ?3, error_text = ?4, \
             started_at = CASE WHEN ?2 = 'running' AND started_at IS NULL THEN ?5 ELSE started_at END, \
             finished_at = CASE WHEN ?2 IN ('success', 'failed') THEN ?5 ELSE finished_at END \
             WHERE id = ?1",
        )
        .bind(run_id.to_string())
        .bind(status.encode())
        .bind(result.map(Value::to_string))
        .bind(error_text)
        .bind(&now)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    // -- Feedback streams -------------------------------------------------

    pub async fn add_client_sentiment(
        &self,
        project_id: Uuid,
        template_id: Option<Uuid>,
        rating: Option<f64>,
        overall_score: Option<f64>,
        tags: &[String],
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO client_sentiments (id, project_id, template_id, rating, overall_score, tags_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(id.to_string())
        .bind(project_id.to_string())
        .bind(template_id.map(|t| t.to_string()))
        .bind(rating)
        .bind(overall_score)
        .bind(serde_json::to_string(tags)?)
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(id)
    }

    /// `(project_id, rating, overall_score, tags)` tuples for one template.
    pub async fn list_template_sentiments(
        &self,
        template_id: Uuid,
    ) -> Result<Vec<(Uuid, Option<f64>, Option<f64>, Vec<String>)>> {
        let rows = sqlx::query(
            "SELECT project_id, rating, overall_score, tags_json FROM client_sentiments \
             WHERE template_id = ?1 ORDER BY created_at ASC",
        )
        .bind(template_id.to_string())
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let project_id: String = row.get("project_id");
                (
                    Uuid::parse_str(&project_id).unwrap_or_default(),
                    row.get("rating"),
                    row.get("overall_score"),
                    parse_string_list(&row.get::<String, _>("tags_json")),
                )
            })
            .collect())
    }

    pub async fn add_delivery_outcome(
        &self,
        project_id: Uuid,
        template_id: Option<Uuid>,
        cycle_time_days: Option<f64>,
        defect_count: i64,
        on_time_delivery: Option<bool>,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO delivery_outcomes (id, project_id, template_id, cycle_time_days, defect_count, on_time_delivery, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(id.to_string())
        .bind(project_id.to_string())
        .bind(template_id.map(|t| t.to_string()))
        .bind(cycle_time_days)
        .bind(defect_count)
        .bind(on_time_delivery.map(i64::from))
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(id)
    }

    /// `(project_id, cycle_time_days, defect_count, on_time)` for a template.
    pub async fn list_template_outcomes(
        &self,
        template_id: Uuid,
    ) -> Result<Vec<(Uuid, Option<f64>, i64, Option<bool>)>> {
        let rows = sqlx::query(
            "SELECT project_id, cycle_time_days, defect_count, on_time_delivery \
             FROM delivery_outcomes WHERE template_id = ?1 ORDER BY created_at ASC",
        )
        .bind(template_id.to_string())
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let project_id: String = row.get("project_id");
                (
                    Uuid::parse_str(&project_id).unwrap_or_default(),
                    row.get("cycle_time_days"),
                    row.get("defect_count"),
                    row.get::<Option<i64>, _>("on_time_delivery").map(|v| v != 0),
                )
            })
            .collect())
    }

    pub async fn add_evolution_proposal(
        &self,
        template_id: Uuid,
        proposal: &Value,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO evolution_proposals (id, template_id, proposal_json, status, created_at) \
             VALUES (?1, ?2, ?3, 'open', ?4)",
        )
        .bind(id.to_string())
        .bind(template_id.to_string())
        .bind(proposal.to_string())
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(id)
    }

    pub async fn list_evolution_proposals(&self, template_id: Uuid) -> Result<Vec<Value>> {
        let rows = sqlx::query(
            "SELECT proposal_json FROM evolution_proposals WHERE template_id = ?1 \
             ORDER BY created_at ASC",
        )
        .bind(template_id.to_string())
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| parse_json(&row.get::<String, _>("proposal_json")))
            .collect())
    }

    // -- Project template instances ---------------------------------------

    pub async fn create_template_instance(
        &self,
        project_id: Uuid,
        template: &TemplateRecord,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO project_template_instances \
             (id, project_id, template_id, template_version, blueprint_json, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'selected', ?6)",
        )
        .bind(id.to_string())
        .bind(project_id.to_string())
        .bind(template.id.to_string())
        .bind(template.version)
        .bind(template.blueprint.as_ref().map(Value::to_string))
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(id)
    }
}
