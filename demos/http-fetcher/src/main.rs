//! # HTTP Fetcher Example
//!
//! Shows how to use `reqwest` directly inside an oban-core worker.
//! No adapter crate, no ceremony - just standard library usage plus
//! whatever the worker itself needs.

use anyhow::Result;
use async_trait::async_trait;
use oban_core::{AlwaysLeader, Config, EngineBuilder, Job, JobChangeset, LocalNotifier, Outcome, TestingMode, Worker};
use oban_testing::InMemoryJobStore;
use std::sync::Arc;

// ============================================================================
// Worker (Execution - Uses reqwest directly)
// ============================================================================

struct FetchWorker {
    http_client: reqwest::Client,
}

#[async_trait]
impl Worker for FetchWorker {
    const NAME: &'static str = "fetch_url";

    async fn perform(&self, job: &Job) -> Outcome {
        let Some(url) = job.args.get("url").and_then(|v| v.as_str()) else {
            return Outcome::Discard("missing url argument".into());
        };

        // Use reqwest directly - no adapter needed!
        match self.http_client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    match response.text().await {
                        Ok(content) => {
                            println!("fetched {url}: {} bytes", content.len());
                            Outcome::CompleteWithValue(serde_json::json!({"status": status.as_u16()}))
                        }
                        Err(e) => Outcome::Error(e.to_string()),
                    }
                } else {
                    Outcome::Discard(format!("HTTP {status}"))
                }
            }
            Err(e) => Outcome::Error(e.to_string()),
        }
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()?;

    let config = Config::builder().testing(TestingMode::Inline).build()?;
    let store = Arc::new(InMemoryJobStore::new());
    let notifier = Arc::new(LocalNotifier::new());
    let peer = Arc::new(AlwaysLeader::new(&config.node));

    let engine = EngineBuilder::new(config, store, notifier, peer)
        .register(FetchWorker { http_client })
        .build();

    let urls = vec![
        "https://example.com",
        "https://httpbin.org/status/200",
        "https://httpbin.org/status/404",
    ];

    for url in urls {
        println!("Fetching: {url}");
        engine
            .insert(
                JobChangeset::new("default", "fetch_url", serde_json::json!({"url": url})),
                None,
            )
            .await?;
    }

    println!("All fetches complete!");

    Ok(())
}
