//! Model gateway client: send a transcript, get text back.
//!
//! The [`ModelClient`] trait is the seam the orchestrator talks to. The real
//! implementation posts to `<api_base>/gateway/chat`; tests use scripted clients.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::types::{Message, Mode, TargetOs};

/// Body of one gateway call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub mode: Mode,
    pub os: TargetOs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Failures the caller may want to tell apart.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("authentication rejected by gateway (HTTP {status}); run `brain auth`")]
    Unauthorized { status: u16 },
    #[error("gateway returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("gateway request failed: {0}")]
    Transport(String),
    #[error("gateway response had no text")]
    EmptyResponse,
}

pub trait ModelClient {
    fn complete(&self, request: &ModelRequest) -> Result<String>;
}

/// HTTP client for the hosted gateway.
pub struct GatewayClient {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl GatewayClient {
    pub fn new(api_base: &str, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/gateway/chat", api_base.trim_end_matches('/')),
            api_key: api_key.into(),
        })
    }
}

impl ModelClient for GatewayClient {
    #[instrument(skip_all, fields(model = %request.model, mode = %request.mode, messages = request.messages.len()))]
    fn complete(&self, request: &ModelRequest) -> Result<String> {
        debug!(endpoint = %self.endpoint, "calling model gateway");
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .map_err(|err| ModelError::Transport(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|err| ModelError::Transport(err.to_string()))?;
        if !status.is_success() {
            warn!(status = status.as_u16(), "gateway call failed");
            return Err(status_error(status, &body).into());
        }

        let value: Value = serde_json::from_str(&body).context("decode gateway response")?;
        let text = response_text(&value).ok_or(ModelError::EmptyResponse)?;
        debug!(chars = text.len(), "model responded");
        Ok(text)
    }
}

fn status_error(status: StatusCode, body: &str) -> ModelError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return ModelError::Unauthorized {
            status: status.as_u16(),
        };
    }
    let body: String = body.trim().chars().take(300).collect();
    ModelError::Status {
        status: status.as_u16(),
        body,
    }
}

/// Text of a gateway reply: `choices[0].message.content`, else `response`.
pub fn response_text(value: &Value) -> Option<String> {
    value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .or_else(|| value.get("response").and_then(Value::as_str))
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_support::serve_once;

    fn request() -> ModelRequest {
        ModelRequest {
            model: "glm-4.7-flash".to_string(),
            messages: vec![Message::system("sys"), Message::user("list files")],
            mode: Mode::Default,
            os: TargetOs::Linux,
            context: None,
        }
    }

    #[test]
    fn reads_openai_style_and_plain_replies() {
        let openai = json!({"choices": [{"message": {"role": "assistant", "content": " hi "}}]});
        assert_eq!(response_text(&openai).as_deref(), Some("hi"));
        let plain = json!({"response": "hello"});
        assert_eq!(response_text(&plain).as_deref(), Some("hello"));
        assert_eq!(response_text(&json!({"choices": []})), None);
        assert_eq!(response_text(&json!({"response": "  "})), None);
    }

    #[test]
    fn request_body_omits_missing_context() {
        let body = serde_json::to_value(request()).expect("serialize");
        assert_eq!(body["mode"], "default");
        assert_eq!(body["os"], "linux");
        assert_eq!(body["messages"][1]["role"], "user");
        assert!(body.get("context").is_none());
    }

    #[test]
    fn posts_transcript_with_bearer_key() {
        let server = serve_once(200, r#"{"response":"```bash\nls\n```"}"#);
        let client =
            GatewayClient::new(&server.url, "sk-test", Duration::from_secs(5)).expect("client");

        let text = client.complete(&request()).expect("complete");

        assert_eq!(text, "```bash\nls\n```");
        let captured = server.finish();
        assert!(captured.starts_with("POST /gateway/chat "));
        assert!(captured.to_lowercase().contains("authorization: bearer sk-test"));
        assert!(captured.contains("\"list files\""));
    }

    #[test]
    fn unauthorized_is_typed() {
        let server = serve_once(401, r#"{"error":"bad key"}"#);
        let client =
            GatewayClient::new(&server.url, "sk-bad", Duration::from_secs(5)).expect("client");

        let err = client.complete(&request()).expect_err("401");
        assert!(matches!(
            err.downcast_ref::<ModelError>(),
            Some(ModelError::Unauthorized { status: 401 })
        ));
        server.finish();
    }

    #[test]
    fn unreachable_gateway_is_a_transport_error() {
        let client = GatewayClient::new("http://127.0.0.1:9", "k", Duration::from_secs(2))
            .expect("client");
        let err = client.complete(&request()).expect_err("unreachable");
        assert!(matches!(
            err.downcast_ref::<ModelError>(),
            Some(ModelError::Transport(_))
        ));
    }
}
