//! Streaming HTTP client for the LLM synthesis service

use crate::error::{classify_status, LaneError};
use crate::retrievers::{Synthesizer, TokenStream};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    budget_ms: u64,
}

/// One line of the newline-delimited token stream
#[derive(Debug, Deserialize)]
struct TokenLine {
    #[serde(default)]
    token: String,
    #[serde(default)]
    done: bool,
}

/// HTTP synthesizer speaking newline-delimited JSON. Dropping the returned
/// stream aborts the request, which is how cancellation propagates.
pub struct HttpSynthesizer {
    provider: String,
    base_url: String,
    client: reqwest::Client,
}

impl HttpSynthesizer {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(1000))
            .build()
            .unwrap_or_default();
        Self { provider: "llm".to_string(), base_url: base_url.into(), client }
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn generate(&self, prompt: &str, budget_ms: u64) -> Result<TokenStream, LaneError> {
        let response = self
            .client
            .post(format!("{}/generate", self.base_url))
            .json(&GenerateRequest { prompt, budget_ms })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(LaneError::new(
                classify_status(status.as_u16()),
                format!("synthesizer returned {}", status),
            ));
        }

        // Re-chunk the byte stream into newline-delimited token records.
        let bytes = response.bytes_stream();
        let stream = futures::stream::unfold(
            (bytes, String::new(), false),
            |(mut bytes, mut buffer, mut done)| async move {
                loop {
                    if let Some(pos) = buffer.find('\n') {
                        let line: String = buffer.drain(..=pos).collect();
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<TokenLine>(line) {
                            Ok(parsed) if parsed.done => {
                                done = true;
                                continue;
                            }
                            Ok(parsed) => return Some((Ok(parsed.token), (bytes, buffer, done))),
                            Err(e) => {
                                return Some((
                                    Err(LaneError::network(format!("bad token line: {}", e))),
                                    (bytes, buffer, done),
                                ))
                            }
                        }
                    }
                    if done {
                        return None;
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            buffer.push_str(&String::from_utf8_lossy(&chunk));
                        }
                        Some(Err(e)) => {
                            return Some((Err(LaneError::from(e)), (bytes, buffer, done)))
                        }
                        None => return None,
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }

    async fn healthy(&self) -> bool {
        match self.client.get(format!("{}/health", self.base_url)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
