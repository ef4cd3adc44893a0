//! Preview rendering: blueprint + demo/client dataset → a single-page HTML
//! bundle uploaded to object storage.
//!
//! The preview is a single page so one presigned URL serves the whole thing;
//! nav links use `#section-N` anchors. Bundle size is capped; renders are
//! bounded by a semaphore owned by the job handler.

use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::collaborators::{ObjectStore, template_prefix};
use crate::store::{PipelineStore, StoreError};

/// Hard cap on the rendered bundle (bytes).
pub const PREVIEW_BUNDLE_MAX_BYTES: usize = 5 * 1024 * 1024;

/// Render the blueprint into one self-contained HTML page.
///
/// This is intentionally plain: sections become labeled blocks filled from
/// the dataset. Real styling comes from the build pipeline; previews exist
/// so humans can judge structure and content.
#[must_use]
pub fn render_single_page(blueprint: &Value, dataset: &Value, images: Option<&Value>) -> String {
    let title = blueprint
        .pointer("/meta/name")
        .and_then(Value::as_str)
        .unwrap_or("Preview");
    let mut body = String::new();
    let pages = blueprint
        .get("pages")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut section_index = 0usize;
    for page in &pages {
        let page_title = page.get("title").and_then(Value::as_str).unwrap_or("");
        if !page_title.is_empty() {
            body.push_str(&format!("<h1>{page_title}</h1>\n"));
        }
        for section in page
            .get("sections")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            section_index += 1;
            let kind = section.get("type").and_then(Value::as_str).unwrap_or("section");
            let headline = section
                .get("headline")
                .and_then(Value::as_str)
                .unwrap_or(kind);
            body.push_str(&format!(
                "<section id=\"section-{section_index}\" data-kind=\"{kind}\">\
                 <h2>{headline}</h2></section>\n"
            ));
        }
    }
    let nav: String = blueprint
        .pointer("/navigation/items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("label").and_then(Value::as_str))
                .enumerate()
                .map(|(i, label)| format!("<a href=\"#section-{}\">{label}</a>", i + 1))
                .collect::<Vec<_>>()
                .join(" | ")
        })
        .unwrap_or_default();
    let client = dataset
        .get("client_name")
        .and_then(Value::as_str)
        .unwrap_or("Demo Client");
    let image_note = images
        .and_then(Value::as_object)
        .map(|m| format!("<!-- {} image slots -->", m.len()))
        .unwrap_or_default();
    format!(
        "<!doctype html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
         <title>{title} — {client}</title>\n</head>\n<body>\n<nav>{nav}</nav>\n{image_note}\n\
         {body}</body>\n</html>\n"
    )
}

/// Minimal SVG thumbnail for the template card. Best effort only.
#[must_use]
pub fn render_thumbnail(title: &str, subtitle: &str) -> Vec<u8> {
    format!(
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"320\" height=\"200\">\
         <rect width=\"320\" height=\"200\" fill=\"#1a1a2e\"/>\
         <text x=\"16\" y=\"96\" fill=\"#ffffff\" font-size=\"20\">{title}</text>\
         <text x=\"16\" y=\"128\" fill=\"#9aa0b5\" font-size=\"14\">{subtitle}</text>\
         </svg>",
    )
    .into_bytes()
}

/// Render, upload, and record a template preview.
///
/// On any failure the template row carries `preview_status = "failed"` and
/// the error text. A successful render resets validation state (the bundle
/// changed, so prior validation no longer applies).
#[instrument(skip(store, objects), err)]
pub async fn run_template_preview_pipeline(
    store: &PipelineStore,
    objects: Arc<dyn ObjectStore>,
    template_id: Uuid,
) -> Result<Value, StoreError> {
    let Some(template) = store.get_template(template_id).await? else {
        return Ok(json!({"status": "failed", "error": "Template not found"}));
    };
    let Some(blueprint) = template.blueprint.as_ref() else {
        let error = "No blueprint. Generate blueprint first.";
        store
            .save_template_preview(template_id, None, None, "failed", Some(error))
            .await?;
        return Ok(json!({"status": "failed", "error": error}));
    };

    let dataset = template
        .default_config
        .as_ref()
        .and_then(|c| c.get("demo_dataset").cloned())
        .unwrap_or_else(|| json!({"client_name": "Demo Client"}));
    let images = template.meta.as_ref().and_then(|m| m.get("images").cloned());

    let page = render_single_page(blueprint, &dataset, images.as_ref());
    let total_size = page.len();
    if total_size > PREVIEW_BUNDLE_MAX_BYTES {
        let error = format!("Bundle size {total_size} exceeds max {PREVIEW_BUNDLE_MAX_BYTES}");
        store
            .save_template_preview(template_id, None, None, "failed", Some(&error))
            .await?;
        return Ok(json!({"status": "failed", "error": error}));
    }

    let prefix = template_prefix(&template.slug, template.version);
    if let Err(err) = objects.delete_prefix(&prefix).await {
        warn!(%err, "stale preview bundle cleanup failed");
    }
    let page_key = format!("{prefix}/index.html");
    if let Err(err) = objects.put(&page_key, page.into_bytes()).await {
        let error = format!("Upload failed: {err}");
        store
            .save_template_preview(template_id, None, None, "failed", Some(&error))
            .await?;
        return Ok(json!({"status": "failed", "error": error}));
    }
    let preview_url = objects.presign(&page_key);

    let thumbnail = render_thumbnail(
        blueprint
            .pointer("/meta/name")
            .and_then(Value::as_str)
            .unwrap_or(&template.name),
        blueprint
            .pointer("/meta/category")
            .and_then(Value::as_str)
            .unwrap_or(""),
    );
    let thumbnail_key = format!("{prefix}/thumbnail.svg");
    let thumbnail_url = match objects.put(&thumbnail_key, thumbnail).await {
        Ok(()) => Some(objects.presign(&thumbnail_key)),
        Err(err) => {
            warn!(%err, "thumbnail upload failed (continuing)");
            None
        }
    };

    store
        .save_template_preview(
            template_id,
            Some(&preview_url),
            thumbnail_url.as_deref(),
            "ready",
            None,
        )
        .await?;
    Ok(json!({
        "status": "ready",
        "preview_url": preview_url,
        "thumbnail_url": thumbnail_url,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_sections_and_anchors() {
        let blueprint = json!({
            "meta": {"name": "Harbor"},
            "navigation": {"items": [{"label": "Home", "href": "home"}]},
            "pages": [{"slug": "home", "title": "Home", "sections": [
                {"type": "hero", "headline": "Welcome aboard"},
                {"type": "contact_form"},
            ]}],
        });
        let html = render_single_page(&blueprint, &json!({"client_name": "Acme"}), None);
        assert!(html.contains("id=\"section-1\""));
        assert!(html.contains("data-kind=\"contact_form\""));
        assert!(html.contains("Welcome aboard"));
        assert!(html.contains("Harbor — Acme"));
        assert!(html.contains("href=\"#section-1\""));
        assert!(html.contains("viewport"));
    }
}
