//! AI provider backed by an Ollama-compatible chat endpoint.

use crate::config::ProviderConfig;
use crate::models::{Iocs, ProviderResult, ThreatLevel};
use crate::providers::retry::{with_retry, RetryPolicy, Transient};
use crate::providers::{AiProvider, ProviderRequest};
use anyhow::{Context, Result};
use reqwest::StatusCode;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Message in the chat history.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Ollama chat API request.
#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    format: &'static str,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

/// Ollama chat API response.
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ChatMessage,
}

pub struct OllamaProvider {
    config: ProviderConfig,
    retry: RetryPolicy,
    http_client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            retry: config.retry_policy(),
            config,
            http_client,
        })
    }

    async fn send_prompt(&self, prompt: String) -> Result<String> {
        let url = format!("{}/api/chat", self.config.url.trim_end_matches('/'));

        let request = OllamaChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt,
                },
            ],
            stream: false,
            format: "json",
            options: OllamaOptions {
                temperature: self.config.temperature,
            },
        };

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow::Error::new(Transient(format!(
                        "Request timed out after {}s",
                        self.config.timeout_secs
                    )))
                } else if e.is_connect() {
                    anyhow::Error::new(Transient(format!(
                        "Cannot connect to Ollama at {}",
                        self.config.url
                    )))
                } else {
                    anyhow::anyhow!("Failed to send request: {}", e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let chat_response: OllamaChatResponse = response
            .json()
            .await
            .context("Failed to parse Ollama response")?;

        Ok(chat_response.message.content)
    }
}

#[async_trait]
impl AiProvider for OllamaProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn analyze(&self, request: &ProviderRequest) -> Result<ProviderResult> {
        debug!("Asking {} ({}) about {}", self.config.name, self.config.model, request.sha256);
        let prompt = build_prompt(request);
        let content = with_retry(&self.retry, &self.config.name, || {
            self.send_prompt(prompt.clone())
        })
        .await?;
        parse_verdict(&self.config.name, &content)
    }
}

/// Rate limiting and server-side failures are worth retrying; the rest are not.
fn status_error(status: StatusCode, body: &str) -> anyhow::Error {
    let message = format!("Ollama API error {}: {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Transient(message).into()
    } else {
        anyhow::anyhow!(message)
    }
}

fn build_prompt(request: &ProviderRequest) -> String {
    let mut prompt = format!(
        "Assess this potentially malicious file.\n\n\
         File Information:\n\
         - Name: {}\n\
         - Size: {} bytes\n\
         - Type: {}\n\
         - SHA-256: {}\n\
         - Header: {}\n",
        request.file_name, request.file_size, request.declared_type, request.sha256, request.header_hex
    );

    if !request.strings.is_empty() {
        prompt.push_str("\nEmbedded strings:\n");
        for s in &request.strings {
            prompt.push_str("- ");
            prompt.push_str(s);
            prompt.push('\n');
        }
    }

    prompt.push_str("\nRespond with the JSON object only.");
    prompt
}

/// Extract a verdict from a model reply that should contain one JSON object.
fn parse_verdict(provider: &str, response: &str) -> Result<ProviderResult> {
    let start = response
        .find('{')
        .context("No JSON object in provider response")?;
    let end = response
        .rfind('}')
        .context("No closing brace in provider response")?;
    if end < start {
        anyhow::bail!("Malformed JSON object in provider response");
    }

    let json: Value = serde_json::from_str(&response[start..=end])
        .context("Provider response is not valid JSON")?;

    let threat_level = json["threat_level"]
        .as_str()
        .and_then(|s| s.parse::<ThreatLevel>().ok())
        .unwrap_or(ThreatLevel::Suspicious);
    let confidence = json["confidence"].as_f64().unwrap_or(0.5);

    let mut result = ProviderResult::new(provider, threat_level, confidence);
    result.malware_family = non_empty_str(&json["malware_family"]);
    result.malware_type = non_empty_str(&json["malware_type"]);
    result.signatures = string_list(&json["signatures"]);
    result.behaviors = string_list(&json["behaviors"]);

    let iocs = &json["iocs"];
    result.iocs = Iocs {
        domains: string_list(&iocs["domains"]),
        ips: string_list(&iocs["ips"]),
        files: string_list(&iocs["files"]),
        registry: string_list(&iocs["registry"]),
        processes: string_list(&iocs["processes"]),
    };

    Ok(result)
}

fn non_empty_str(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null") && !s.eq_ignore_ascii_case("unknown"))
        .map(String::from)
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

const SYSTEM_PROMPT: &str = r#"You are a malware analyst. Classify the described file and reply with a single JSON object:

{
  "threat_level": "safe" | "suspicious" | "malicious" | "critical",
  "confidence": <number between 0 and 1>,
  "malware_family": "<family or null>",
  "malware_type": "<type or null>",
  "signatures": ["..."],
  "behaviors": ["..."],
  "iocs": {"domains": [], "ips": [], "files": [], "registry": [], "processes": []}
}

Base the verdict only on the evidence given. Use low confidence when evidence is thin."#;
