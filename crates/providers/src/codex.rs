//! OpenAI Codex adapter: the Responses frame shape against the ChatGPT
//! backend.
//!
//! Same request body and SSE grammar as the Responses API, plus the
//! ChatGPT-specific headers: `chatgpt-account-id` (decoded from the bearer
//! JWT), `openai-beta: responses=experimental`, and `originator`. When a
//! session id is supplied the request carries it as `conversation_id` /
//! `session_id` headers and keys the prompt cache on it.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde_json::Value;

use wuhu_domain::error::{Error, Result};
use wuhu_domain::stream::{AssistantEvent, BoxStream};

use crate::openai::{build_client, build_responses_body, parse_responses_sse, ResponsesStreamState};
use crate::request_log::RequestLogger;
use crate::traits::{ModelRequest, Provider};
use crate::{from_reqwest, sse};

const DEFAULT_BASE_URL: &str = "https://chatgpt.com/backend-api/codex";
const ORIGINATOR: &str = "pi";

pub struct CodexProvider {
    access_token: String,
    account_id: String,
    base_url: String,
    client: reqwest::Client,
    logger: RequestLogger,
}

impl CodexProvider {
    pub fn new(
        access_token: String,
        base_url: Option<String>,
        logger: RequestLogger,
    ) -> Result<Self> {
        let account_id = chatgpt_account_id(&access_token)?;
        Ok(Self {
            access_token,
            account_id,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.into())
                .trim_end_matches('/')
                .to_string(),
            client: build_client()?,
            logger,
        })
    }
}

/// Decode the `https://api.openai.com/auth.chatgpt_account_id` claim from
/// the bearer JWT's payload segment.
pub(crate) fn chatgpt_account_id(access_token: &str) -> Result<String> {
    let payload = access_token
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::Config("codex access token is not a JWT".into()))?;
    let decoded = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| Error::Config(format!("codex access token payload: {e}")))?;
    let claims: Value = serde_json::from_slice(&decoded)
        .map_err(|e| Error::Config(format!("codex access token claims: {e}")))?;
    claims
        .get("https://api.openai.com/auth")
        .and_then(|auth| auth.get("chatgpt_account_id"))
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| Error::Config("codex access token is missing chatgpt_account_id".into()))
}

pub(crate) fn build_codex_body(req: &ModelRequest) -> Value {
    let mut body = build_responses_body(req);
    if let Some(session_id) = &req.session_id {
        body["prompt_cache_key"] = Value::String(session_id.clone());
        body["prompt_cache_retention"] = Value::String("in-memory".into());
    }
    body
}

#[async_trait::async_trait]
impl Provider for CodexProvider {
    async fn stream(
        &self,
        req: &ModelRequest,
    ) -> Result<BoxStream<'static, Result<AssistantEvent>>> {
        let url = format!("{}/responses", self.base_url);
        let body = build_codex_body(req);
        self.logger.log("openai-codex", &req.model, &body);

        tracing::debug!(model = %req.model, url = %url, "codex stream request");

        let mut request = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.access_token))
            .header("chatgpt-account-id", &self.account_id)
            .header("openai-beta", "responses=experimental")
            .header("originator", ORIGINATOR)
            .header("Content-Type", "application/json");

        if let Some(session_id) = &req.session_id {
            request = request
                .header("conversation_id", session_id)
                .header("session_id", session_id);
        }

        let resp = request.json(&body).send().await.map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider {
                provider: "openai-codex".into(),
                status: status.as_u16(),
                message: err_text,
            });
        }

        let mut state = ResponsesStreamState::new();
        Ok(sse::sse_response_stream(resp, move |data| {
            parse_responses_sse(data, &mut state, "openai-codex")
        }))
    }

    fn provider_id(&self) -> &str {
        "openai-codex"
    }
}
