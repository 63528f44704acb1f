use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::{Answer, ContextPack};
use crate::ollama;

/// Produces an answer from a fully rendered context pack.
#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, query: &str, context: &ContextPack) -> Result<Answer>;
}

const SYSTEM_PROMPT: &str = "You are a precise assistant. Use only the provided CONTEXT. \
                             If the answer cannot be found in the CONTEXT, say you don't know.";

const ABSTENTION_PHRASES: [&str; 5] = [
    "i don't know",
    "i do not know",
    "not enough information",
    "cannot determine",
    "no information",
];

pub fn user_prompt(query: &str, context: &ContextPack) -> String {
    format!(
        "{}\nQUESTION:\n{}\n\nAnswer clearly and cite chunk numbers like [1], [2] where relevant.",
        context.rendered_context, query
    )
}

/// True when the model admits the context does not support an answer.
pub fn is_abstention(text: &str) -> bool {
    let lowered = text.to_lowercase();
    ABSTENTION_PHRASES.iter().any(|p| lowered.contains(p))
}

/// Wraps raw model text with the pack's citations.
pub fn build_answer(query: &str, text: &str, context: &ContextPack, model: &str) -> Answer {
    let text = text.trim().to_string();
    Answer {
        query: query.to_string(),
        abstained: is_abstention(&text),
        text,
        citations: context.citations.clone(),
        model: Some(model.to_string()),
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

/// Chat generator on Ollama's `/api/chat`.
pub struct OllamaGenerator {
    client: reqwest::Client,
    ollama_url: String,
    model: String,
    temperature: f32,
}

impl OllamaGenerator {
    pub fn new(ollama_url: &str, model: &str) -> Result<Self> {
        tracing::info!("Ollama chat model: {}", model);
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(300))
                .build()
                .context("Failed to build HTTP client")?,
            ollama_url: ollama_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            temperature: 0.2,
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, query: &str, context: &ContextPack) -> Result<Answer> {
        let user = user_prompt(query, context);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &user,
                },
            ],
            stream: false,
            options: ChatOptions {
                temperature: self.temperature,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.ollama_url))
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to contact Ollama at {}", self.ollama_url))?;

        let payload: ChatResponse = ollama::error_for_status(response, "Chat model")
            .await?
            .json()
            .await
            .context("Failed to parse chat response")?;

        Ok(build_answer(query, &payload.message.content, context, &self.model))
    }
}
