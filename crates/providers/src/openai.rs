//! OpenAI Responses adapter.
//!
//! Encodes the conversation as an `input[]` item array (`message`,
//! `function_call`, `function_call_output`, `reasoning`) and parses the
//! Responses SSE event stream. Captured reasoning items (`id` +
//! `encrypted_content`) are replayed verbatim on the next request so the
//! model resumes its chain; `function_call` items replay both `call_id`
//! and the provider item `id` (the item id is stripped upstream when the
//! recorded model differs from the current one).

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use wuhu_domain::entry::{ContentItem, StopReason, Usage};
use wuhu_domain::error::{Error, Result};
use wuhu_domain::stream::{AssistantDraft, AssistantEvent, BoxStream};
use wuhu_domain::tool::ToolCall;

use crate::request_log::RequestLogger;
use crate::traits::{ContextMessage, ModelRequest, Provider};
use crate::{from_reqwest, sse};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiProvider {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
    logger: RequestLogger,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: Option<String>, logger: RequestLogger) -> Result<Self> {
        Ok(Self {
            api_key,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.into())
                .trim_end_matches('/')
                .to_string(),
            client: build_client()?,
            logger,
        })
    }
}

pub(crate) fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(120))
        .read_timeout(std::time::Duration::from_secs(300))
        .build()
        .map_err(from_reqwest)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request serialization (shared with the Codex variant)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) fn build_responses_body(req: &ModelRequest) -> Value {
    let mut input: Vec<Value> = Vec::new();

    for msg in &req.messages {
        match msg {
            ContextMessage::User { content } => {
                input.push(serde_json::json!({
                    "type": "message",
                    "role": "user",
                    "content": [{
                        "type": "input_text",
                        "text": ContentItem::joined_text(content),
                    }],
                }));
            }
            ContextMessage::Assistant { content } => {
                for item in content {
                    match item {
                        ContentItem::Text { text, .. } => {
                            input.push(serde_json::json!({
                                "type": "message",
                                "role": "assistant",
                                "content": [{ "type": "output_text", "text": text }],
                            }));
                        }
                        ContentItem::Reasoning {
                            id,
                            encrypted_content,
                            summary,
                            ..
                        } => {
                            // Replay only items the provider can key: an
                            // id or an encrypted blob.
                            if id.is_none() && encrypted_content.is_none() {
                                continue;
                            }
                            let mut reasoning = serde_json::json!({
                                "type": "reasoning",
                                "summary": summary
                                    .as_deref()
                                    .map(|s| {
                                        vec![serde_json::json!({
                                            "type": "summary_text",
                                            "text": s,
                                        })]
                                    })
                                    .unwrap_or_default(),
                            });
                            if let Some(id) = id {
                                reasoning["id"] = Value::String(id.clone());
                            }
                            if let Some(enc) = encrypted_content {
                                reasoning["encrypted_content"] = Value::String(enc.clone());
                            }
                            input.push(reasoning);
                        }
                        ContentItem::ToolCall {
                            id,
                            name,
                            arguments,
                            item_id,
                        } => {
                            let mut call = serde_json::json!({
                                "type": "function_call",
                                "call_id": id,
                                "name": name,
                                "arguments": arguments.to_string(),
                            });
                            if let Some(item_id) = item_id {
                                call["id"] = Value::String(item_id.clone());
                            }
                            input.push(call);
                        }
                    }
                }
            }
            ContextMessage::ToolResult {
                tool_call_id,
                content,
                ..
            } => {
                let output = content
                    .iter()
                    .filter_map(|c| match c {
                        wuhu_domain::tool::ToolContent::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                input.push(serde_json::json!({
                    "type": "function_call_output",
                    "call_id": tool_call_id,
                    "output": output,
                }));
            }
        }
    }

    let mut body = serde_json::json!({
        "model": req.model,
        "input": input,
        "stream": true,
        "store": false,
        "include": ["reasoning.encrypted_content"],
    });

    if let Some(system) = &req.system_prompt {
        body["instructions"] = Value::String(system.clone());
    }

    if !req.tools.is_empty() {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                    "strict": false,
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
    }

    if let Some(effort) = req.reasoning_effort {
        body["reasoning"] = serde_json::json!({
            "effort": serde_json::to_value(effort).expect("effort serializes"),
        });
    }

    if let Some(max) = req.max_output_tokens {
        body["max_output_tokens"] = serde_json::json!(max);
    }

    body
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming state machine (shared with the Codex variant)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum ItemState {
    Message {
        text: String,
    },
    Reasoning {
        id: Option<String>,
        encrypted_content: Option<String>,
        summary: String,
    },
    FunctionCall {
        item_id: Option<String>,
        call_id: String,
        name: String,
        args: String,
    },
}

pub(crate) struct ResponsesStreamState {
    items: BTreeMap<u64, ItemState>,
    /// `item_id` → output index, for argument deltas keyed by item id.
    index_by_item_id: HashMap<String, u64>,
    usage: Option<Usage>,
    done_emitted: bool,
}

impl ResponsesStreamState {
    pub(crate) fn new() -> Self {
        Self {
            items: BTreeMap::new(),
            index_by_item_id: HashMap::new(),
            usage: None,
            done_emitted: false,
        }
    }

    fn final_content(&self) -> Vec<ContentItem> {
        self.items
            .values()
            .map(|item| match item {
                ItemState::Message { text } => ContentItem::text(text.clone()),
                ItemState::Reasoning {
                    id,
                    encrypted_content,
                    summary,
                } => ContentItem::Reasoning {
                    id: id.clone(),
                    encrypted_content: encrypted_content.clone(),
                    summary: (!summary.is_empty()).then(|| summary.clone()),
                    signature: None,
                },
                ItemState::FunctionCall {
                    item_id,
                    call_id,
                    name,
                    args,
                } => ContentItem::ToolCall {
                    id: call_id.clone(),
                    name: name.clone(),
                    arguments: parse_args(args),
                    item_id: item_id.clone(),
                },
            })
            .collect()
    }

    fn register(&mut self, index: u64, item: &Value) {
        let item_id = item.get("id").and_then(Value::as_str).map(str::to_string);
        if let Some(id) = &item_id {
            self.index_by_item_id.insert(id.clone(), index);
        }
        let state = match item.get("type").and_then(Value::as_str).unwrap_or("") {
            "message" => ItemState::Message {
                text: message_text(item),
            },
            "reasoning" => ItemState::Reasoning {
                id: item_id,
                encrypted_content: item
                    .get("encrypted_content")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                summary: summary_text(item),
            },
            "function_call" => ItemState::FunctionCall {
                item_id,
                call_id: item
                    .get("call_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: item
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                args: item
                    .get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            _ => return,
        };
        self.items.insert(index, state);
    }

    fn resolve_index(&self, output_index: Option<u64>, item_id: Option<&str>) -> Option<u64> {
        output_index.or_else(|| {
            item_id.and_then(|id| self.index_by_item_id.get(id).copied())
        })
    }
}

fn message_text(item: &Value) -> String {
    item.get("content")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|p| {
                    matches!(
                        p.get("type").and_then(Value::as_str),
                        Some("output_text") | Some("text")
                    )
                })
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn summary_text(item: &Value) -> String {
    item.get("summary")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

fn parse_args(raw: &str) -> Value {
    if raw.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(raw).unwrap_or(Value::Object(Default::default()))
    }
}

fn parse_usage(usage: &Value) -> Option<Usage> {
    let input = usage.get("input_tokens")?.as_u64()?;
    let output = usage
        .get("output_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Some(Usage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: usage
            .get("total_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(input + output),
        cache_read_tokens: usage
            .get("input_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(Value::as_u64),
    })
}

/// Parse one Responses SSE payload into zero or more stream events.
pub(crate) fn parse_responses_sse(
    data: &str,
    state: &mut ResponsesStreamState,
    provider: &str,
) -> Vec<Result<AssistantEvent>> {
    let mut events = Vec::new();

    if data == "[DONE]" {
        return events;
    }

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            events.push(Err(Error::Decoding(format!("{provider} SSE: {e}"))));
            return events;
        }
    };

    let output_index = v.get("output_index").and_then(Value::as_u64);
    let item_id = v.get("item_id").and_then(Value::as_str);

    match v.get("type").and_then(Value::as_str).unwrap_or("") {
        "response.created" => {
            events.push(Ok(AssistantEvent::Start));
        }

        "response.output_item.added" | "response.output_item.done" => {
            if let Some(item) = v.get("item") {
                let index = output_index.unwrap_or(state.items.len() as u64);
                state.register(index, item);

                // A completed function_call item has its full arguments.
                if v["type"] == "response.output_item.done" {
                    if let Some(ItemState::FunctionCall {
                        item_id,
                        call_id,
                        name,
                        args,
                    }) = state.items.get(&index)
                    {
                        events.push(Ok(AssistantEvent::ToolCall {
                            call: ToolCall {
                                id: call_id.clone(),
                                name: name.clone(),
                                arguments: parse_args(args),
                                item_id: item_id.clone(),
                            },
                        }));
                    }
                }
            }
        }

        "response.output_text.delta" => {
            if let Some(delta) = v.get("delta").and_then(Value::as_str) {
                if let Some(index) = state.resolve_index(output_index, item_id) {
                    if let Some(ItemState::Message { text }) = state.items.get_mut(&index) {
                        text.push_str(delta);
                    }
                }
                if !delta.is_empty() {
                    events.push(Ok(AssistantEvent::TextDelta {
                        delta: delta.to_string(),
                    }));
                }
            }
        }

        "response.reasoning_summary_text.delta" => {
            if let Some(delta) = v.get("delta").and_then(Value::as_str) {
                if let Some(index) = state.resolve_index(output_index, item_id) {
                    if let Some(ItemState::Reasoning { summary, .. }) =
                        state.items.get_mut(&index)
                    {
                        summary.push_str(delta);
                    }
                }
                events.push(Ok(AssistantEvent::ReasoningDelta {
                    delta: delta.to_string(),
                }));
            }
        }

        "response.function_call_arguments.delta" => {
            if let Some(delta) = v.get("delta").and_then(Value::as_str) {
                if let Some(index) = state.resolve_index(output_index, item_id) {
                    if let Some(ItemState::FunctionCall { args, .. }) =
                        state.items.get_mut(&index)
                    {
                        args.push_str(delta);
                    }
                }
            }
        }

        "response.completed" | "response.incomplete" => {
            let response = v.get("response").cloned().unwrap_or(Value::Null);

            // Prefer the authoritative output array over assembled deltas.
            if let Some(output) = response.get("output").and_then(Value::as_array) {
                state.items.clear();
                state.index_by_item_id.clear();
                for (idx, item) in output.iter().enumerate() {
                    state.register(idx as u64, item);
                }
            }

            if let Some(usage) = response.get("usage").and_then(parse_usage) {
                state.usage = Some(usage.clone());
                events.push(Ok(AssistantEvent::Usage { usage }));
            }

            let content = state.final_content();
            let has_calls = content
                .iter()
                .any(|c| matches!(c, ContentItem::ToolCall { .. }));
            let stop_reason = if v["type"] == "response.incomplete" {
                StopReason::Length
            } else if has_calls {
                StopReason::ToolUse
            } else {
                StopReason::Stop
            };

            state.done_emitted = true;
            events.push(Ok(AssistantEvent::Done {
                message: AssistantDraft {
                    content,
                    usage: state.usage.clone(),
                    stop_reason,
                },
            }));
        }

        "response.failed" | "error" => {
            let message = v
                .get("response")
                .and_then(|r| r.get("error"))
                .or_else(|| v.get("error"))
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("response failed");
            events.push(Err(Error::Provider {
                provider: provider.to_string(),
                status: 0,
                message: message.to_string(),
            }));
        }

        _ => {}
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl Provider for OpenAiProvider {
    async fn stream(
        &self,
        req: &ModelRequest,
    ) -> Result<BoxStream<'static, Result<AssistantEvent>>> {
        let url = format!("{}/v1/responses", self.base_url);
        let body = build_responses_body(req);
        self.logger.log("openai", &req.model, &body);

        tracing::debug!(model = %req.model, url = %url, "openai stream request");

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider {
                provider: "openai".into(),
                status: status.as_u16(),
                message: err_text,
            });
        }

        let mut state = ResponsesStreamState::new();
        Ok(sse::sse_response_stream(resp, move |data| {
            parse_responses_sse(data, &mut state, "openai")
        }))
    }

    fn provider_id(&self) -> &str {
        "openai"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
