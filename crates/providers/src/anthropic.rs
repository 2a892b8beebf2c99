//! Anthropic Messages adapter.
//!
//! Implements the Messages API including tool use, thinking blocks,
//! streaming, and the Anthropic-specific message structure where system
//! prompts go in a separate top-level `system` field and tool results are
//! user messages with `tool_result` content blocks.

use std::collections::BTreeMap;

use serde_json::Value;

use wuhu_domain::entry::{ContentItem, StopReason, Usage};
use wuhu_domain::error::{Error, Result};
use wuhu_domain::stream::{AssistantDraft, AssistantEvent, BoxStream};
use wuhu_domain::tool::{ToolCall, ToolContent, ToolDefinition};

use crate::request_log::RequestLogger;
use crate::traits::{CacheMode, ContextMessage, ModelRequest, Provider};
use crate::{from_reqwest, sse};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 8192;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AnthropicProvider {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
    logger: RequestLogger,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>, logger: RequestLogger) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(120))
            .read_timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            api_key,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.into())
                .trim_end_matches('/')
                .to_string(),
            client,
            logger,
        })
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) fn build_messages_body(req: &ModelRequest) -> Value {
    let mut api_messages: Vec<Value> = Vec::new();
    let mut last_user_idx: Option<usize> = None;

    for msg in &req.messages {
        match msg {
            ContextMessage::User { content } => {
                api_messages.push(serde_json::json!({
                    "role": "user",
                    "content": content_items_to_blocks(content),
                }));
                last_user_idx = Some(api_messages.len() - 1);
            }
            ContextMessage::Assistant { content } => {
                api_messages.push(serde_json::json!({
                    "role": "assistant",
                    "content": content_items_to_blocks(content),
                }));
            }
            ContextMessage::ToolResult {
                tool_call_id,
                content,
                is_error,
                ..
            } => {
                // Tool results are user messages with tool_result blocks.
                api_messages.push(serde_json::json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": tool_call_id,
                        "content": tool_content_to_blocks(content),
                        "is_error": is_error,
                    }],
                }));
            }
        }
    }

    let mut body = serde_json::json!({
        "model": req.model,
        "messages": api_messages,
        "max_tokens": req.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "stream": true,
    });

    if let Some(system) = &req.system_prompt {
        body["system"] = serde_json::json!([{ "type": "text", "text": system }]);
    }

    if !req.tools.is_empty() {
        let tools: Vec<Value> = req.tools.iter().map(tool_to_anthropic).collect();
        body["tools"] = Value::Array(tools);
    }

    match req.cache_mode {
        CacheMode::Automatic => {
            body["cache_control"] = serde_json::json!({ "type": "ephemeral" });
        }
        CacheMode::ExplicitBreakpoints => {
            apply_cache_breakpoints(&mut body, last_user_idx);
        }
    }

    body
}

fn content_items_to_blocks(items: &[ContentItem]) -> Vec<Value> {
    items
        .iter()
        .map(|item| match item {
            ContentItem::Text { text, .. } => serde_json::json!({
                "type": "text",
                "text": text,
            }),
            ContentItem::ToolCall {
                id, name, arguments, ..
            } => serde_json::json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": arguments,
            }),
            ContentItem::Reasoning {
                summary, signature, ..
            } => serde_json::json!({
                "type": "thinking",
                "thinking": summary.clone().unwrap_or_default(),
                "signature": signature.clone().unwrap_or_default(),
            }),
        })
        .collect()
}

fn tool_content_to_blocks(content: &[ToolContent]) -> Vec<Value> {
    content
        .iter()
        .map(|c| match c {
            ToolContent::Text { text } => serde_json::json!({
                "type": "text",
                "text": text,
            }),
            ToolContent::Image { data, media_type } => serde_json::json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": media_type,
                    "data": data,
                }
            }),
        })
        .collect()
}

fn tool_to_anthropic(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters,
    })
}

/// Explicit-breakpoints caching: mark the last system block and the last
/// content block of the most recent user message as cache boundaries.
fn apply_cache_breakpoints(body: &mut Value, last_user_idx: Option<usize>) {
    let ephemeral = serde_json::json!({ "type": "ephemeral" });

    if let Some(blocks) = body["system"].as_array_mut() {
        if let Some(last) = blocks.last_mut() {
            last["cache_control"] = ephemeral.clone();
        }
    }

    if let Some(idx) = last_user_idx {
        if let Some(blocks) = body["messages"][idx]["content"].as_array_mut() {
            if let Some(last) = blocks.last_mut() {
                last["cache_control"] = ephemeral;
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming state machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum BlockState {
    Text { text: String },
    Thinking { text: String, signature: Option<String> },
    ToolUse { id: String, name: String, args: String },
}

struct StreamState {
    /// Content blocks by index; BTreeMap keeps content order stable.
    blocks: BTreeMap<u64, BlockState>,
    usage: Option<Usage>,
    stop_reason: Option<StopReason>,
    done_emitted: bool,
}

impl StreamState {
    fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
            usage: None,
            stop_reason: None,
            done_emitted: false,
        }
    }

    fn final_content(&self) -> Vec<ContentItem> {
        self.blocks
            .values()
            .filter_map(|block| match block {
                BlockState::Text { text } => Some(ContentItem::text(text.clone())),
                BlockState::Thinking { text, signature } => Some(ContentItem::Reasoning {
                    id: None,
                    encrypted_content: None,
                    summary: Some(text.clone()),
                    signature: signature.clone(),
                }),
                BlockState::ToolUse { id, name, args } => Some(ContentItem::ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: parse_args(args),
                    item_id: None,
                }),
            })
            .collect()
    }
}

fn parse_args(raw: &str) -> Value {
    if raw.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(raw).unwrap_or(Value::Object(Default::default()))
    }
}

fn normalize_stop_reason(raw: &str) -> StopReason {
    match raw {
        "tool_use" => StopReason::ToolUse,
        "max_tokens" => StopReason::Length,
        // end_turn, stop_sequence, pause_turn all end the turn normally.
        _ => StopReason::Stop,
    }
}

fn parse_usage(v: &Value) -> Option<Usage> {
    let input = v.get("input_tokens")?.as_u64()?;
    let output = v.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
    Some(Usage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: input + output,
        cache_read_tokens: v.get("cache_read_input_tokens").and_then(Value::as_u64),
    })
}

/// Parse one Anthropic SSE payload into zero or more stream events.
fn parse_sse(data: &str, state: &mut StreamState) -> Vec<Result<AssistantEvent>> {
    let mut events = Vec::new();

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            events.push(Err(Error::Decoding(format!("anthropic SSE: {e}"))));
            return events;
        }
    };

    match v.get("type").and_then(Value::as_str).unwrap_or("") {
        "message_start" => {
            if let Some(msg) = v.get("message") {
                state.usage = msg.get("usage").and_then(parse_usage);
            }
            events.push(Ok(AssistantEvent::Start));
        }

        "content_block_start" => {
            let idx = v.get("index").and_then(Value::as_u64).unwrap_or(0);
            if let Some(block) = v.get("content_block") {
                let block_state = match block.get("type").and_then(Value::as_str).unwrap_or("") {
                    "text" => BlockState::Text {
                        text: block
                            .get("text")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    },
                    "thinking" => BlockState::Thinking {
                        text: String::new(),
                        signature: None,
                    },
                    "tool_use" => BlockState::ToolUse {
                        id: block
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        name: block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        args: String::new(),
                    },
                    _ => return events,
                };
                state.blocks.insert(idx, block_state);
            }
        }

        "content_block_delta" => {
            let idx = v.get("index").and_then(Value::as_u64).unwrap_or(0);
            let Some(delta) = v.get("delta") else {
                return events;
            };
            match delta.get("type").and_then(Value::as_str).unwrap_or("") {
                "text_delta" => {
                    if let Some(text) = delta.get("text").and_then(Value::as_str) {
                        if let Some(BlockState::Text { text: buf }) = state.blocks.get_mut(&idx) {
                            buf.push_str(text);
                        }
                        if !text.is_empty() {
                            events.push(Ok(AssistantEvent::TextDelta {
                                delta: text.to_string(),
                            }));
                        }
                    }
                }
                "thinking_delta" => {
                    if let Some(text) = delta.get("thinking").and_then(Value::as_str) {
                        if let Some(BlockState::Thinking { text: buf, .. }) =
                            state.blocks.get_mut(&idx)
                        {
                            buf.push_str(text);
                        }
                        events.push(Ok(AssistantEvent::ReasoningDelta {
                            delta: text.to_string(),
                        }));
                    }
                }
                "signature_delta" => {
                    if let Some(sig) = delta.get("signature").and_then(Value::as_str) {
                        if let Some(BlockState::Thinking { signature, .. }) =
                            state.blocks.get_mut(&idx)
                        {
                            *signature = Some(sig.to_string());
                        }
                    }
                }
                "input_json_delta" => {
                    if let Some(partial) = delta.get("partial_json").and_then(Value::as_str) {
                        if let Some(BlockState::ToolUse { args, .. }) = state.blocks.get_mut(&idx)
                        {
                            args.push_str(partial);
                        }
                    }
                }
                _ => {}
            }
        }

        "content_block_stop" => {
            let idx = v.get("index").and_then(Value::as_u64).unwrap_or(0);
            if let Some(BlockState::ToolUse { id, name, args }) = state.blocks.get(&idx) {
                events.push(Ok(AssistantEvent::ToolCall {
                    call: ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: parse_args(args),
                        item_id: None,
                    },
                }));
            }
        }

        "message_delta" => {
            if let Some(usage_val) = v.get("usage") {
                if let Some(output) = usage_val.get("output_tokens").and_then(Value::as_u64) {
                    let usage = state.usage.get_or_insert_with(Usage::default);
                    usage.output_tokens = output;
                    usage.total_tokens = usage.input_tokens + output;
                }
            }
            if let Some(raw) = v
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(Value::as_str)
            {
                state.stop_reason = Some(normalize_stop_reason(raw));
            }
            if let Some(usage) = &state.usage {
                events.push(Ok(AssistantEvent::Usage {
                    usage: usage.clone(),
                }));
            }
        }

        "message_stop" => {
            if !state.done_emitted {
                state.done_emitted = true;
                events.push(Ok(AssistantEvent::Done {
                    message: AssistantDraft {
                        content: state.final_content(),
                        usage: state.usage.clone(),
                        stop_reason: state.stop_reason.unwrap_or(StopReason::Stop),
                    },
                }));
            }
        }

        "error" => {
            let msg = v
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            events.push(Err(Error::Provider {
                provider: "anthropic".into(),
                status: 0,
                message: msg.to_string(),
            }));
        }

        // ping and unknown event types.
        _ => {}
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl Provider for AnthropicProvider {
    async fn stream(
        &self,
        req: &ModelRequest,
    ) -> Result<BoxStream<'static, Result<AssistantEvent>>> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = build_messages_body(req);
        self.logger.log("anthropic", &req.model, &body);

        tracing::debug!(model = %req.model, url = %url, "anthropic stream request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider {
                provider: "anthropic".into(),
                status: status.as_u16(),
                message: err_text,
            });
        }

        let mut state = StreamState::new();
        Ok(sse::sse_response_stream(resp, move |data| {
            parse_sse(data, &mut state)
        }))
    }

    fn provider_id(&self) -> &str {
        "anthropic"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_tools() -> ModelRequest {
        let mut req = ModelRequest::new("claude-sonnet-4-20250514");
        req.system_prompt = Some("You are a coding agent.".into());
        req.messages = vec![
            ContextMessage::user_text("read the readme"),
            ContextMessage::Assistant {
                content: vec![ContentItem::ToolCall {
                    id: "t1".into(),
                    name: "read".into(),
                    arguments: serde_json::json!({"path": "README.md"}),
                    item_id: None,
                }],
            },
            ContextMessage::ToolResult {
                tool_call_id: "t1".into(),
                tool_name: "read".into(),
                content: vec![ToolContent::Text {
                    text: "# Hello".into(),
                }],
                is_error: false,
            },
            ContextMessage::user_text("thanks"),
        ];
        req.tools = vec![ToolDefinition {
            name: "read".into(),
            description: "Read a file".into(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        req
    }

    #[test]
    fn body_maps_roles_and_tool_results() {
        let body = build_messages_body(&request_with_tools());
        assert_eq!(body["system"][0]["text"], "You are a coding agent.");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1]["content"][0]["type"], "tool_use");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"][0]["type"], "tool_result");
        assert_eq!(messages[2]["content"][0]["tool_use_id"], "t1");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
    }

    #[test]
    fn automatic_cache_mode_sets_top_level_control() {
        let body = build_messages_body(&request_with_tools());
        assert_eq!(body["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn explicit_breakpoints_mark_system_and_last_user() {
        let mut req = request_with_tools();
        req.cache_mode = CacheMode::ExplicitBreakpoints;
        let body = build_messages_body(&req);
        assert!(body.get("cache_control").is_none());
        assert_eq!(body["system"][0]["cache_control"]["type"], "ephemeral");
        // The most recent user message is index 3 ("thanks").
        assert_eq!(
            body["messages"][3]["content"][0]["cache_control"]["type"],
            "ephemeral"
        );
        // Earlier user messages are untouched.
        assert!(body["messages"][0]["content"][0].get("cache_control").is_none());
    }

    fn feed(state: &mut StreamState, payloads: &[Value]) -> Vec<AssistantEvent> {
        let mut events = Vec::new();
        for p in payloads {
            for e in parse_sse(&p.to_string(), state) {
                events.push(e.unwrap());
            }
        }
        events
    }

    #[test]
    fn stream_assembles_text_and_tool_call() {
        let mut state = StreamState::new();
        let events = feed(
            &mut state,
            &[
                serde_json::json!({"type": "message_start", "message": {"usage": {"input_tokens": 12, "output_tokens": 0}}}),
                serde_json::json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
                serde_json::json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Let me look."}}),
                serde_json::json!({"type": "content_block_stop", "index": 0}),
                serde_json::json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "t1", "name": "read"}}),
                serde_json::json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"path\":"}}),
                serde_json::json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "\"README.md\"}"}}),
                serde_json::json!({"type": "content_block_stop", "index": 1}),
                serde_json::json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 9}}),
                serde_json::json!({"type": "message_stop"}),
            ],
        );

        let done = events
            .iter()
            .find_map(|e| match e {
                AssistantEvent::Done { message } => Some(message.clone()),
                _ => None,
            })
            .expect("no done event");
        assert_eq!(done.stop_reason, StopReason::ToolUse);
        assert_eq!(done.content.len(), 2);
        match &done.content[1] {
            ContentItem::ToolCall { id, name, arguments, .. } => {
                assert_eq!(id, "t1");
                assert_eq!(name, "read");
                assert_eq!(arguments["path"], "README.md");
            }
            other => panic!("unexpected content: {other:?}"),
        }
        let usage = done.usage.unwrap();
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 9);

        assert!(events.iter().any(|e| matches!(
            e,
            AssistantEvent::ToolCall { call } if call.name == "read"
        )));
    }

    #[test]
    fn stop_reason_normalization() {
        assert_eq!(normalize_stop_reason("end_turn"), StopReason::Stop);
        assert_eq!(normalize_stop_reason("max_tokens"), StopReason::Length);
        assert_eq!(normalize_stop_reason("tool_use"), StopReason::ToolUse);
        assert_eq!(normalize_stop_reason("stop_sequence"), StopReason::Stop);
    }

    #[test]
    fn thinking_blocks_become_reasoning_items() {
        let mut state = StreamState::new();
        feed(
            &mut state,
            &[
                serde_json::json!({"type": "message_start", "message": {"usage": {"input_tokens": 1, "output_tokens": 0}}}),
                serde_json::json!({"type": "content_block_start", "index": 0, "content_block": {"type": "thinking"}}),
                serde_json::json!({"type": "content_block_delta", "index": 0, "delta": {"type": "thinking_delta", "thinking": "hmm"}}),
                serde_json::json!({"type": "content_block_delta", "index": 0, "delta": {"type": "signature_delta", "signature": "sig_1"}}),
                serde_json::json!({"type": "content_block_stop", "index": 0}),
            ],
        );
        let content = state.final_content();
        match &content[0] {
            ContentItem::Reasoning { summary, signature, .. } => {
                assert_eq!(summary.as_deref(), Some("hmm"));
                assert_eq!(signature.as_deref(), Some("sig_1"));
            }
            other => panic!("unexpected content: {other:?}"),
        }
    }
}
