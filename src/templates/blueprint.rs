//! Blueprint schema v1: strict, versioned, deterministic template structure.

use serde_json::Value;

pub const BLUEPRINT_SCHEMA_VERSION: i64 = 1;

pub const ALLOWED_SECTION_TYPES: [&str; 13] = [
    "hero",
    "trust_bar",
    "amenities_grid",
    "gallery_grid",
    "floorplan_cards",
    "location_map",
    "testimonials",
    "faq",
    "feature_split",
    "cta_banner",
    "contact_form",
    "pricing_table",
    "blog_teasers",
];

pub const NAV_STYLES: [&str; 3] = ["topbar", "sidebar", "minimal"];
pub const WCAG_TARGETS: [&str; 3] = ["A", "AA", "AAA"];

fn err(path: &str, msg: &str) -> String {
    format!("{path}: {msg}")
}

/// Validate a blueprint against the v1 schema.
///
/// Returns `(valid, errors)` where each error carries its field path.
/// `schema_version` accepts `1`, `"1"`, `"v1"`, or missing (treated as v1);
/// callers normalize it to `1` before storing.
#[must_use]
pub fn validate_blueprint_v1(blueprint: &Value) -> (bool, Vec<String>) {
    let mut errors: Vec<String> = Vec::new();
    let Some(root) = blueprint.as_object() else {
        return (false, vec!["root: must be an object".to_string()]);
    };

    match root.get("schema_version") {
        None | Some(Value::Null) => {}
        Some(v) => {
            let ok = v == &Value::from(1)
                || v.as_str().is_some_and(|s| s == "1" || s == "v1");
            if !ok {
                errors.push(err("schema_version", "must be 1"));
            }
        }
    }

    match root.get("meta").and_then(Value::as_object) {
        None => errors.push(err("meta", "required object")),
        Some(meta) => {
            for field in ["name", "category", "style"] {
                let present = meta
                    .get(field)
                    .and_then(Value::as_str)
                    .is_some_and(|s| !s.is_empty());
                if !present {
                    errors.push(err(&format!("meta.{field}"), "required"));
                }
            }
        }
    }

    match root.get("tokens").and_then(Value::as_object) {
        None => errors.push(err("tokens", "required object")),
        Some(tokens) => {
            for field in ["colors", "typography", "spacing"] {
                if !tokens.contains_key(field) {
                    errors.push(err(&format!("tokens.{field}"), "required"));
                }
            }
        }
    }

    let nav = root.get("navigation").and_then(Value::as_object);
    match nav {
        None => errors.push(err("navigation", "required object")),
        Some(nav) => {
            let style_ok = nav
                .get("style")
                .and_then(Value::as_str)
                .is_some_and(|s| NAV_STYLES.contains(&s));
            if !style_ok {
                errors.push(err("navigation.style", "must be one of topbar, sidebar, minimal"));
            }
            if !nav.get("items").is_some_and(Value::is_array) {
                errors.push(err("navigation.items", "required list"));
            }
        }
    }

    if !root.get("footer").is_some_and(Value::is_object) {
        errors.push(err("footer", "required object"));
    }

    let mut slugs: Vec<String> = Vec::new();
    let mut has_home = false;
    let mut has_cta = false;
    let mut has_contact_form = false;
    match root.get("pages").and_then(Value::as_array) {
        None => errors.push(err("pages", "required list")),
        Some(pages) if pages.is_empty() => {
            errors.push(err("pages", "at least one page required"));
        }
        Some(pages) => {
            for (i, page) in pages.iter().enumerate() {
                let Some(page) = page.as_object() else {
                    errors.push(err(&format!("pages[{i}]"), "must be object"));
                    continue;
                };
                let slug = page
                    .get("slug")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .trim()
                    .to_string();
                if slug.is_empty() {
                    errors.push(err(&format!("pages[{i}].slug"), "required"));
                }
                if slug == "home" || i == 0 {
                    has_home = true;
                }
                slugs.push(slug);
                match page.get("sections").and_then(Value::as_array) {
                    None => errors.push(err(&format!("pages[{i}].sections"), "required list")),
                    Some(sections) if sections.is_empty() => {
                        errors.push(err(
                            &format!("pages[{i}].sections"),
                            "at least one section required",
                        ));
                    }
                    Some(sections) => {
                        for (j, section) in sections.iter().enumerate() {
                            let Some(kind) =
                                section.get("type").and_then(Value::as_str)
                            else {
                                continue;
                            };
                            if !ALLOWED_SECTION_TYPES.contains(&kind) {
                                errors.push(err(
                                    &format!("pages[{i}].sections[{j}].type"),
                                    "not an allowed section type",
                                ));
                            }
                            if kind == "cta_banner" || kind == "hero" {
                                has_cta = true;
                            }
                            if kind == "contact_form" {
                                has_contact_form = true;
                            }
                        }
                    }
                }
            }
            if !has_home {
                errors.push(err("pages", "home page required (slug='home' or first page)"));
            }
            if !has_cta {
                errors.push(err(
                    "pages",
                    "at least one CTA section required (cta_banner or hero)",
                ));
            }
            // Nav items must link to existing slugs.
            if let Some(items) = nav.and_then(|n| n.get("items")).and_then(Value::as_array) {
                for item in items {
                    let Some(href) = item.get("href").and_then(Value::as_str) else {
                        continue;
                    };
                    let href = href.trim().trim_start_matches('/');
                    if !href.is_empty()
                        && href != "#"
                        && !slugs.iter().any(|s| s == href)
                    {
                        errors.push(err(
                            "navigation.items",
                            &format!("href '{href}' does not match any page slug"),
                        ));
                    }
                }
            }
        }
    }

    let forms = root.get("forms").and_then(Value::as_object);
    if forms.is_none() {
        errors.push(err("forms", "required object"));
    }
    let lead_enabled = forms
        .and_then(|f| f.get("lead"))
        .and_then(|l| l.get("enabled"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !has_contact_form && !lead_enabled {
        errors.push(err("forms", "contact_form section or lead form enabled required"));
    }

    match root.get("constraints").and_then(Value::as_object) {
        None => errors.push(err("constraints", "required object")),
        Some(constraints) => {
            let wcag_ok = constraints
                .get("wcag_target")
                .and_then(Value::as_str)
                .is_some_and(|t| WCAG_TARGETS.contains(&t));
            if !wcag_ok {
                errors.push(err("constraints.wcag_target", "must be one of A, AA, AAA"));
            }
        }
    }

    (errors.is_empty(), errors)
}

/// Normalize `schema_version` to the integer `1` before storage.
pub fn normalize_schema_version(blueprint: &mut Value) {
    if let Some(root) = blueprint.as_object_mut() {
        root.insert("schema_version".to_string(), Value::from(BLUEPRINT_SCHEMA_VERSION));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_valid() -> Value {
        json!({
            "schema_version": 1,
            "meta": {"name": "Test", "category": "general", "style": "modern"},
            "tokens": {"colors": {}, "typography": {}, "spacing": {}},
            "navigation": {"style": "topbar", "items": [{"label": "Home", "href": "home"}]},
            "footer": {},
            "pages": [
                {"slug": "home", "title": "Home", "sections": [{"type": "hero"}]},
            ],
            "forms": {"lead": {"enabled": true}},
            "constraints": {"mobile_first": true, "wcag_target": "AA"},
        })
    }

    #[test]
    fn minimal_blueprint_validates() {
        let (valid, errors) = validate_blueprint_v1(&minimal_valid());
        assert!(valid, "unexpected errors: {errors:?}");
    }

    #[test]
    fn schema_version_accepts_aliases() {
        for version in [json!(1), json!("1"), json!("v1"), Value::Null] {
            let mut bp = minimal_valid();
            bp["schema_version"] = version;
            let (valid, errors) = validate_blueprint_v1(&bp);
            assert!(valid, "errors: {errors:?}");
        }
        let mut bp = minimal_valid();
        bp["schema_version"] = json!(2);
        let (valid, errors) = validate_blueprint_v1(&bp);
        assert!(!valid);
        assert!(errors.iter().any(|e| e.starts_with("schema_version")));
    }

    #[test]
    fn rejects_unknown_section_type() {
        let mut bp = minimal_valid();
        bp["pages"][0]["sections"] = json!([{"type": "carousel_of_doom"}]);
        let (valid, errors) = validate_blueprint_v1(&bp);
        assert!(!valid);
        assert!(errors.iter().any(|e| e.contains("sections[0].type")));
    }

    #[test]
    fn requires_cta_and_contact_or_lead() {
        let mut bp = minimal_valid();
        bp["pages"][0]["sections"] = json!([{"type": "faq"}]);
        bp["forms"] = json!({});
        let (valid, errors) = validate_blueprint_v1(&bp);
        assert!(!valid);
        assert!(errors.iter().any(|e| e.contains("CTA")));
        assert!(errors.iter().any(|e| e.contains("contact_form section or lead form")));
    }

    #[test]
    fn nav_href_must_match_a_slug() {
        let mut bp = minimal_valid();
        bp["navigation"]["items"] = json!([{"label": "About", "href": "/about"}]);
        let (valid, errors) = validate_blueprint_v1(&bp);
        assert!(!valid);
        assert!(errors.iter().any(|e| e.contains("'about' does not match")));
    }

    #[test]
    fn first_page_counts_as_home() {
        let mut bp = minimal_valid();
        bp["pages"][0]["slug"] = json!("landing");
        bp["navigation"]["items"] = json!([{"label": "Landing", "href": "landing"}]);
        let (valid, errors) = validate_blueprint_v1(&bp);
        assert!(valid, "errors: {errors:?}");
    }

    #[test]
    fn wcag_target_is_constrained() {
        let mut bp = minimal_valid();
        bp["constraints"]["wcag_target"] = json!("AAAA");
        let (valid, errors) = validate_blueprint_v1(&bp);
        assert!(!valid);
        assert!(errors.iter().any(|e| e.contains("wcag_target")));
    }
}
