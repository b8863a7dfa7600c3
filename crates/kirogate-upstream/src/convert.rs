//! Translation from inbound OpenAI chat requests to the upstream
//! `conversationState` payload.
//!
//! The conversion is a pure function of the request and the static model
//! map: no ids, clocks, or randomness. The client stamps a conversation id
//! just before sending.

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use kirogate_core::openai::{ChatCompletionRequest, ChatMessage};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub model_id: String,
    pub system_prompt: String,
    pub current_message: Turn,
    pub history: Vec<Turn>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
}

/// One conversation turn as the upstream sees it.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolUse>,
    /// Set on synthetic user turns that carry a tool result back: the id of
    /// the call being answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolUse {
    pub tool_use_id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Build the upstream conversation from an inbound request.
///
/// Rules, in order: system prompts are extracted and concatenated; adjacent
/// same-role user/assistant turns merge (tool messages never merge — each
/// answers one call); tool-role messages become synthetic user turns keyed
/// by the `tool_call_id` they answer; the final turn is the current message
/// and everything before it is history.
pub fn convert(req: &ChatCompletionRequest, model_id: &str) -> ConversationState {
    let mut system_parts: Vec<String> = Vec::new();
    let mut flat: Vec<FlatMessage> = Vec::new();
    let mut dropped_parts = 0usize;

    for msg in &req.messages {
        let (text, dropped) = msg
            .content
            .as_ref()
            .map(|c| c.flatten())
            .unwrap_or((String::new(), 0));
        dropped_parts += dropped;

        if msg.role == "system" {
            system_parts.push(text);
        } else {
            flat.push(FlatMessage {
                role: msg.role.clone(),
                text,
                tool_calls: convert_tool_calls(msg),
                tool_call_id: msg.tool_call_id.clone(),
            });
        }
    }
    if dropped_parts > 0 {
        warn!(dropped = dropped_parts, "dropped non-text content parts");
    }

    let merged = merge_adjacent(flat);

    let mut turns: Vec<Turn> = merged.into_iter().map(thread_turn).collect();

    let current_message = turns.pop().unwrap_or(Turn {
        role: "user".to_string(),
        content: String::new(),
        tool_calls: Vec::new(),
        tool_use_id: None,
    });

    let tools = req
        .tools
        .iter()
        .map(|t| ToolSpec {
            name: t.function.name.clone(),
            description: t.function.description.clone().unwrap_or_default(),
            input_schema: t.function.parameters.clone(),
        })
        .collect();

    ConversationState {
        conversation_id: None,
        model_id: model_id.to_string(),
        system_prompt: system_parts.join("\n"),
        current_message,
        history: turns,
        tools,
    }
}

struct FlatMessage {
    role: String,
    text: String,
    tool_calls: Vec<ToolUse>,
    tool_call_id: Option<String>,
}

fn convert_tool_calls(msg: &ChatMessage) -> Vec<ToolUse> {
    msg.tool_calls
        .as_ref()
        .map(|calls| {
            calls
                .iter()
                .map(|tc| ToolUse {
                    tool_use_id: tc.id.clone(),
                    name: tc.function.name.clone(),
                    // arguments arrive as a JSON string; keep the raw text
                    // when it does not parse
                    input: serde_json::from_str(&tc.function.arguments)
                        .unwrap_or_else(|_| Value::String(tc.function.arguments.clone())),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Merge consecutive same-role user/assistant entries: texts concatenate
/// with a newline, assistant tool_calls arrays concatenate. Tool messages
/// each carry their own call id and are left alone.
fn merge_adjacent(flat: Vec<FlatMessage>) -> Vec<FlatMessage> {
    let mut merged: Vec<FlatMessage> = Vec::with_capacity(flat.len());
    for msg in flat {
        match merged.last_mut() {
            Some(prev) if prev.role == msg.role && msg.role != "tool" => {
                if prev.text.is_empty() {
                    prev.text = msg.text;
                } else if !msg.text.is_empty() {
                    prev.text.push('\n');
                    prev.text.push_str(&msg.text);
                }
                prev.tool_calls.extend(msg.tool_calls);
            }
            _ => merged.push(msg),
        }
    }
    merged
}

/// Tool-result threading: a tool message becomes a synthetic user turn that
/// references the call it answers; other roles pass through.
fn thread_turn(msg: FlatMessage) -> Turn {
    if msg.role == "tool" {
        Turn {
            role: "user".to_string(),
            content: msg.text,
            tool_calls: Vec::new(),
            tool_use_id: msg.tool_call_id,
        }
    } else {
        Turn {
            role: msg.role,
            content: msg.text,
            tool_calls: msg.tool_calls,
            tool_use_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kirogate_core::openai::ChatCompletionRequest;

    fn request(json: &str) -> ChatCompletionRequest {
        serde_json::from_str(json).unwrap()
    }

    const MODEL: &str = "CLAUDE_SONNET_4_5_20250929_V1_0";

    #[test]
    fn system_prompts_concatenate_and_leave_history() {
        let req = request(
            r#"{
                "model": "claude-sonnet-4-5",
                "messages": [
                    {"role": "system", "content": "Be terse."},
                    {"role": "user", "content": "Hi"},
                    {"role": "system", "content": "Answer in French."}
                ]
            }"#,
        );
        let state = convert(&req, MODEL);
        assert_eq!(state.system_prompt, "Be terse.\nAnswer in French.");
        assert!(state.history.is_empty());
        assert_eq!(state.current_message.content, "Hi");
    }

    #[test]
    fn adjacent_same_role_messages_merge() {
        let req = request(
            r#"{
                "model": "claude-sonnet-4-5",
                "messages": [
                    {"role": "user", "content": "first"},
                    {"role": "user", "content": "second"},
                    {"role": "assistant", "content": "reply"},
                    {"role": "user", "content": "third"}
                ]
            }"#,
        );
        let state = convert(&req, MODEL);
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.history[0].content, "first\nsecond");
        assert_eq!(state.history[1].content, "reply");
        assert_eq!(state.current_message.content, "third");
    }

    #[test]
    fn merged_assistant_turns_concatenate_tool_calls() {
        let req = request(
            r#"{
                "model": "claude-sonnet-4-5",
                "messages": [
                    {"role": "assistant", "content": "a",
                     "tool_calls": [{"id": "c1", "type": "function",
                        "function": {"name": "f", "arguments": "{\"x\":1}"}}]},
                    {"role": "assistant", "content": "b",
                     "tool_calls": [{"id": "c2", "type": "function",
                        "function": {"name": "g", "arguments": "{}"}}]},
                    {"role": "user", "content": "go"}
                ]
            }"#,
        );
        let state = convert(&req, MODEL);
        assert_eq!(state.history.len(), 1);
        let merged = &state.history[0];
        assert_eq!(merged.content, "a\nb");
        assert_eq!(merged.tool_calls.len(), 2);
        assert_eq!(merged.tool_calls[0].tool_use_id, "c1");
        assert_eq!(merged.tool_calls[0].input, serde_json::json!({"x": 1}));
        assert_eq!(merged.tool_calls[1].tool_use_id, "c2");
    }

    #[test]
    fn tool_results_thread_as_user_turns_in_order() {
        let req = request(
            r#"{
                "model": "claude-sonnet-4-5",
                "messages": [
                    {"role": "user", "content": "weather?"},
                    {"role": "assistant", "content": "",
                     "tool_calls": [{"id": "call_1", "type": "function",
                        "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}}]},
                    {"role": "tool", "tool_call_id": "call_1", "content": "18C, sunny"},
                    {"role": "user", "content": "thanks"}
                ]
            }"#,
        );
        let state = convert(&req, MODEL);
        assert_eq!(state.history.len(), 3);
        let threaded = &state.history[2];
        assert_eq!(threaded.role, "user");
        assert_eq!(threaded.content, "18C, sunny");
        assert_eq!(threaded.tool_use_id.as_deref(), Some("call_1"));
        assert_eq!(state.current_message.content, "thanks");
    }

    #[test]
    fn adjacent_tool_results_do_not_merge() {
        let req = request(
            r#"{
                "model": "claude-sonnet-4-5",
                "messages": [
                    {"role": "tool", "tool_call_id": "c1", "content": "r1"},
                    {"role": "tool", "tool_call_id": "c2", "content": "r2"},
                    {"role": "user", "content": "go"}
                ]
            }"#,
        );
        let state = convert(&req, MODEL);
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.history[0].tool_use_id.as_deref(), Some("c1"));
        assert_eq!(state.history[1].tool_use_id.as_deref(), Some("c2"));
    }

    #[test]
    fn tool_declarations_rewrite_to_upstream_schema() {
        let req = request(
            r#"{
                "model": "claude-sonnet-4-5",
                "messages": [{"role": "user", "content": "hi"}],
                "tools": [{"type": "function", "function": {
                    "name": "get_weather",
                    "description": "Look up weather",
                    "parameters": {"type": "object"}
                }}]
            }"#,
        );
        let state = convert(&req, MODEL);
        assert_eq!(state.tools.len(), 1);
        let json = serde_json::to_string(&state.tools[0]).unwrap();
        assert!(json.contains(r#""inputSchema":{"type":"object"}"#));
        assert!(json.contains(r#""name":"get_weather""#));
    }

    #[test]
    fn empty_messages_yield_empty_current_and_history() {
        let req = request(r#"{"model": "claude-sonnet-4-5", "messages": []}"#);
        let state = convert(&req, MODEL);
        assert!(state.history.is_empty());
        assert_eq!(state.current_message.content, "");
        assert_eq!(state.current_message.role, "user");
    }

    #[test]
    fn conversion_is_pure() {
        let json = r#"{
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "system", "content": "sys"},
                {"role": "user", "content": "a"},
                {"role": "assistant", "content": "b"},
                {"role": "user", "content": "c"}
            ]
        }"#;
        let a = convert(&request(json), MODEL);
        let b = convert(&request(json), MODEL);
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }

    #[test]
    fn per_role_text_order_survives_conversion() {
        // Round-trip law: the ordered concatenation of message texts per
        // role is preserved modulo the adjacent-merge normal form.
        let req = request(
            r#"{
                "model": "claude-sonnet-4-5",
                "messages": [
                    {"role": "user", "content": "u1"},
                    {"role": "user", "content": "u2"},
                    {"role": "assistant", "content": "a1"},
                    {"role": "user", "content": "u3"}
                ]
            }"#,
        );
        let state = convert(&req, MODEL);

        let mut user_text = String::new();
        let mut assistant_text = String::new();
        for turn in state.history.iter().chain(std::iter::once(&state.current_message)) {
            let target = match turn.role.as_str() {
                "user" => &mut user_text,
                _ => &mut assistant_text,
            };
            if !target.is_empty() {
                target.push('\n');
            }
            target.push_str(&turn.content);
        }
        assert_eq!(user_text, "u1\nu2\nu3");
        assert_eq!(assistant_text, "a1");
    }

    #[test]
    fn multipart_content_concatenates_text_parts() {
        let req = request(
            r#"{
                "model": "claude-sonnet-4-5",
                "messages": [
                    {"role": "user", "content": [
                        {"type": "text", "text": "part one "},
                        {"type": "image_url", "image_url": {"url": "http://x"}},
                        {"type": "text", "text": "part two"}
                    ]}
                ]
            }"#,
        );
        let state = convert(&req, MODEL);
        assert_eq!(state.current_message.content, "part one part two");
    }
}
