//! User rows and assignment counters.

use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::instrument;
use uuid::Uuid;

use super::{PipelineStore, Result, StoreError, parse_string_list, parse_ts, parse_uuid, ts};
use crate::model::{Availability, Role, User};

#[derive(Clone, Debug)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub role: Role,
    pub region: Option<String>,
    pub skills: Vec<String>,
    pub capacity: i64,
    pub availability: Availability,
    pub performance_score: Option<f64>,
}

impl NewUser {
    /// Minimal constructor used heavily in tests.
    #[must_use]
    pub fn new(name: &str, role: Role) -> Self {
        Self {
            name: name.to_string(),
            email: format!("{}@example.test", name.to_ascii_lowercase().replace(' ', ".")),
            role,
            region: None,
            skills: Vec::new(),
            capacity: 2,
            availability: Availability::Available,
            performance_score: None,
        }
    }
}

fn user_from_row(row: &SqliteRow) -> Result<User> {
    let id: String = row.get("id");
    let role_raw: String = row.get("role");
    let availability_raw: String = row.get("availability");
    Ok(User {
        id: parse_uuid(&id, "users.id")?,
        name: row.get("name"),
        email: row.get("email"),
        role: Role::decode(&role_raw).ok_or_else(|| StoreError::Corrupt {
            what: format!("users.role '{role_raw}'"),
        })?,
        region: row.get("region"),
        skills: parse_string_list(&row.get::<String, _>("skills_json")),
        capacity: row.get("capacity"),
        availability: Availability::decode(&availability_raw).unwrap_or_default(),
        performance_score: row.get("performance_score"),
        active_assignments_count: row.get("active_assignments_count"),
        is_active: row.get::<i64, _>("is_active") != 0,
        is_archived: row.get::<i64, _>("is_archived") != 0,
        created_at: parse_ts(&row.get::<String, _>("created_at")),
    })
}

const USER_COLUMNS: &str = "id, name, email, role, region, skills_json, capacity, availability, \
     performance_score, active_assignments_count, is_active, is_archived, created_at";

impl PipelineStore {
    #[instrument(skip(self, new), err)]
    pub async fn create_user(&self, new: NewUser) -> Result<User> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO users (id, name, email, role, region, skills_json, capacity, \
             availability, performance_score, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(id.to_string())
        .bind(&new.name)
        .bind(&new.email)
        .bind(new.role.encode())
        .bind(&new.region)
        .bind(serde_json::to_string(&new.skills)?)
        .bind(new.capacity)
        .bind(new.availability.encode())
        .bind(new.performance_score)
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        self.get_user(id).await?.ok_or_else(|| StoreError::Corrupt {
            what: format!("user {id} vanished after insert"),
        })
    }

    pub async fn get_user(&self, user_id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"))
            .bind(user_id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    /// Active, non-archived users of a role. Out-of-office users are
    /// excluded here; the assignment engine never sees them.
    pub async fn list_eligible_users(&self, role: Role) -> Result<Vec<User>> {
        let rows = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE role = ?1 AND is_active = 1 AND is_archived = 0 \
             AND availability != 'out_of_office' \
             ORDER BY created_at ASC"
        ))
        .bind(role.encode())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(user_from_row).collect()
    }

    /// Adjust `active_assignments_count` by `delta`, clamped at zero.
    pub async fn bump_assignment_count(&self, user_id: Uuid, delta: i64) -> Result<()> {
        sqlx::query(
            "UPDATE users SET active_assignments_count = \
             MAX(0, active_assignments_count + ?2) WHERE id = ?1",
        )
        .bind(user_id.to_string())
        .bind(delta)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_user_availability(
        &self,
        user_id: Uuid,
        availability: Availability,
    ) -> Result<()> {
        sqlx::query("UPDATE users SET availability = ?2 WHERE id = ?1")
            .bind(user_id.to_string())
            .bind(availability.encode())
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
