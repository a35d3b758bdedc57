//! Text-generation lookup against an OpenAI-compatible chat endpoint.
//!
//! Sends the stage's system prompt plus one field of the row and writes the
//! answer into the target field. Works with any aggregator or on-prem server
//! that speaks the `/chat/completions` schema.

use super::{Lookup, LookupResult, Precheck, transport_failure};
use crate::models::{CompletionConfig, Result, Row, StageConfig, StagehandError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Message in a chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// API error response (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Chat-completion lookup over one field.
#[derive(Debug, Clone)]
pub struct CompletionLookup {
    endpoint: CompletionConfig,
    /// Resolved key; `None` for local endpoints without auth
    api_key: Option<String>,
    system_prompt: String,
    source_field: String,
    target_field: String,
}

impl CompletionLookup {
    pub fn new(endpoint: CompletionConfig, api_key: Option<String>, stage: &StageConfig) -> Self {
        Self {
            endpoint,
            api_key,
            system_prompt: stage.system_prompt.clone().unwrap_or_default(),
            source_field: stage.source_field.clone(),
            target_field: stage.target_field.clone(),
        }
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.endpoint.base_url.trim_end_matches('/'))
    }
}

impl Lookup<reqwest::Client> for CompletionLookup {
    fn precheck(&self, row: &Row) -> Precheck {
        if row.get_trimmed(&self.source_field).is_empty() {
            Precheck::skip()
        } else {
            Precheck::Proceed
        }
    }

    async fn lookup(&mut self, session: &reqwest::Client, row: &Row) -> Result<LookupResult> {
        let request = ChatCompletionRequest {
            model: &self.endpoint.model,
            messages: vec![
                Message::system(&self.system_prompt),
                Message::user(row.get_trimmed(&self.source_field)),
            ],
            max_tokens: self.endpoint.max_tokens,
            temperature: self.endpoint.temperature,
        };

        let mut builder = session.post(self.url()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => return Ok(transport_failure(&e)),
        };

        let status = response.status();
        if status.as_u16() == 429 {
            return Ok(LookupResult::rate_limited("rate_limited"));
        }
        if status.is_server_error() {
            return Ok(LookupResult::transient("server_error"));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(StagehandError::Session(format!(
                "completion endpoint returned {}: {message}",
                status.as_u16()
            )));
        }

        let body: ChatCompletionResponse = match response.json().await {
            Ok(body) => body,
            Err(e) if e.is_decode() => {
                return Err(StagehandError::ParseError(format!(
                    "Failed to parse completion response: {e}"
                )));
            }
            Err(e) => return Ok(transport_failure(&e)),
        };

        let answer = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .unwrap_or_default();

        if answer.is_empty() {
            debug!(field = %self.source_field, "Empty completion");
            return Ok(LookupResult::invalid("no_result"));
        }
        Ok(LookupResult::found("found").with_field(&self.target_field, answer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::Outcome;
    use crate::lookup::tests::serve;
    use crate::models::StageKind;
    use std::path::PathBuf;

    fn stage() -> StageConfig {
        StageConfig {
            kind: StageKind::Completion,
            input_dir: None,
            output_dir: PathBuf::from("out"),
            output_prefix: String::new(),
            required_columns: Vec::new(),
            source_field: "Full Name".into(),
            target_field: "Normalized Name".into(),
            prune_status: None,
            use_circuit: false,
            system_prompt: Some("Return first and last name.".into()),
            block_markers: Vec::new(),
        }
    }

    fn lookup_for(base_url: String) -> CompletionLookup {
        let endpoint = CompletionConfig {
            base_url,
            ..Default::default()
        };
        CompletionLookup::new(endpoint, Some("sk-test".into()), &stage())
    }

    fn row(name: &str) -> Row {
        Row::from_pairs([("Full Name", name)])
    }

    #[test]
    fn test_empty_source_is_skipped() {
        let lookup = lookup_for("http://unused".into());
        assert_eq!(lookup.precheck(&row("   ")), Precheck::skip());
        assert_eq!(lookup.precheck(&row("Dr. Ada Lovelace")), Precheck::Proceed);
    }

    #[tokio::test]
    async fn test_answer_is_written_to_target() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":" Ada Lovelace \n"}}]}"#;
        let base = serve(vec![(200, body.to_string())]).await;
        let mut lookup = lookup_for(base);

        let result = lookup
            .lookup(&reqwest::Client::new(), &row("Dr. Ada Lovelace PhD"))
            .await
            .unwrap();
        assert_eq!(result.outcome, Outcome::Found);
        assert_eq!(
            result.fields,
            vec![("Normalized Name".to_string(), "Ada Lovelace".to_string())]
        );
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let base = serve(vec![
            (429, "slow down".to_string()),
            (503, "unavailable".to_string()),
            (200, r#"{"choices":[{"message":{"content":""}}]}"#.to_string()),
            (
                401,
                r#"{"error":{"message":"bad key","type":"auth"}}"#.to_string(),
            ),
        ])
        .await;
        let mut lookup = lookup_for(base);
        let client = reqwest::Client::new();
        let row = row("Grace Hopper");

        let r = lookup.lookup(&client, &row).await.unwrap();
        assert_eq!(r.outcome, Outcome::RateLimited);
        let r = lookup.lookup(&client, &row).await.unwrap();
        assert_eq!(r.outcome, Outcome::Transient);
        let r = lookup.lookup(&client, &row).await.unwrap();
        assert_eq!((r.outcome, r.status.as_str()), (Outcome::Invalid, "no_result"));
        let err = lookup.lookup(&client, &row).await.unwrap_err();
        assert!(err.to_string().contains("bad key"));
    }
}
