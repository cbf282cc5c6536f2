//! # AI Summarizer Example
//!
//! Shows how to call the Anthropic API directly inside an oban-core worker.
//! No special adapter - just reqwest + serde.

use anyhow::{bail, Result};
use async_trait::async_trait;
use oban_core::{AlwaysLeader, Config, EngineBuilder, Job, JobChangeset, LocalNotifier, Outcome, TestingMode, Worker};
use oban_testing::InMemoryJobStore;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;

// ============================================================================
// Worker (Execution - Calls Anthropic API directly)
// ============================================================================

struct SummarizeWorker {
    http_client: reqwest::Client,
    api_key: String,
}

#[async_trait]
impl Worker for SummarizeWorker {
    const NAME: &'static str = "summarize_text";

    async fn perform(&self, job: &Job) -> Outcome {
        let Some(text) = job.args.get("text").and_then(|v| v.as_str()) else {
            return Outcome::Discard("missing text argument".into());
        };

        let request = AnthropicRequest {
            model: "claude-3-5-sonnet-20241022".to_string(),
            max_tokens: 1024,
            messages: vec![Message {
                role: "user".to_string(),
                content: format!("Summarize this text in 2-3 sentences:\n\n{text}"),
            }],
        };

        match call_anthropic(&self.http_client, &self.api_key, request).await {
            Ok(response) => {
                let summary = response
                    .content
                    .first()
                    .and_then(|c| c.text.clone())
                    .unwrap_or_default();
                let tokens_used = response.usage.input_tokens + response.usage.output_tokens;
                println!("summary: {summary}");
                Outcome::CompleteWithValue(serde_json::json!({
                    "summary": summary,
                    "tokens_used": tokens_used,
                }))
            }
            Err(e) => Outcome::Error(e.to_string()),
        }
    }
}

// ============================================================================
// Anthropic API Types (Just plain structs)
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

/// Call Anthropic API - just a plain function
async fn call_anthropic(
    client: &reqwest::Client,
    api_key: &str,
    request: AnthropicRequest,
) -> Result<AnthropicResponse> {
    let response = client
        .post("https://api.anthropic.com/v1/messages")
        .header("x-api-key", api_key)
        .header("anthropic-version", "2023-06-01")
        .header("content-type", "application/json")
        .json(&request)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await?;
        bail!("API error {}: {}", status, body);
    }

    Ok(response.json().await?)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let api_key = env::var("ANTHROPIC_API_KEY")
        .expect("ANTHROPIC_API_KEY environment variable required");

    let config = Config::builder().testing(TestingMode::Inline).build()?;
    let store = Arc::new(InMemoryJobStore::new());
    let notifier = Arc::new(LocalNotifier::new());
    let peer = Arc::new(AlwaysLeader::new(&config.node));

    let engine = EngineBuilder::new(config, store, notifier, peer)
        .register(SummarizeWorker {
            http_client: reqwest::Client::new(),
            api_key,
        })
        .build();

    let text = r#"
        Rust is a multi-paradigm, general-purpose programming language that emphasizes
        performance, type safety, and concurrency. It enforces memory safety, meaning that
        all references point to valid memory, without a garbage collector. To simultaneously
        enforce memory safety and prevent data races, its "borrow checker" tracks the object
        lifetime of all references in a program during compilation.
    "#;

    println!("Summarizing text...");

    engine
        .insert(
            JobChangeset::new("default", "summarize_text", serde_json::json!({"text": text})),
            None,
        )
        .await?;

    println!("Summary complete!");

    Ok(())
}
