use anyhow::{Context, Result};
use handlebars::Handlebars;
use serde_json::{Map, Value};

/// Render a template body against a notification payload.
///
/// Pure function over its inputs: no template registry survives between
/// calls, and unknown placeholders render as empty strings rather than
/// failing the attempt.
pub fn render(template_body: &str, data: &Map<String, Value>) -> Result<String> {
    let handlebars = Handlebars::new();
    handlebars
        .render_template(template_body, data)
        .context("Failed to render template")
}
