//! Pieces shared by the Ollama clients.

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Deserialize)]
struct ModelTag {
    name: String,
}

/// Names match by prefix so `llama3.1` also accepts `llama3.1:latest`.
fn has_model(names: &[String], model: &str) -> bool {
    names.iter().any(|name| name.starts_with(model))
}

/// Fails unless Ollama at `base_url` answers `/api/tags` and lists `model`.
/// `role` only shapes the error message ("embedding", "rerank", ...).
pub async fn ensure_model_pulled(
    client: &reqwest::Client,
    base_url: &str,
    model: &str,
    role: &str,
) -> Result<()> {
    let response = client
        .get(format!("{base_url}/api/tags"))
        .send()
        .await
        .with_context(|| format!("Ollama is not reachable at {base_url}; is it running?"))?;

    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(anyhow::anyhow!("Listing Ollama models failed ({}): {}", status, detail));
    }

    let tags: TagsResponse = response
        .json()
        .await
        .context("Malformed /api/tags response")?;
    let names: Vec<String> = tags.models.into_iter().map(|m| m.name).collect();

    if !has_model(&names, model) {
        return Err(anyhow::anyhow!(
            "{} model '{}' is not pulled (have: {}). Run: ollama pull {}",
            role,
            model,
            names.join(", "),
            model
        ));
    }

    tracing::info!("{} model '{}' verified", role, model);
    Ok(())
}

/// Turns a non-success response into an error carrying the body text.
pub async fn error_for_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let detail = response.text().await.unwrap_or_default();
    Err(anyhow::anyhow!("{} returned {}: {}", what, status, detail))
}
