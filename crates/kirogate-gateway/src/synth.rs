//! Response synthesizer: parser events in, OpenAI protocol out.
//!
//! Streaming mode maps each event to at most one chunk and guarantees
//! exactly one terminal chunk with a non-null finish_reason before the
//! `[DONE]` frame. Non-streaming mode buffers the whole event sequence into
//! a single completion object.

use std::collections::HashMap;
use std::convert::Infallible;

use axum::response::sse::Event;
use tokio::sync::mpsc;
use tracing::debug;

use kirogate_core::openai::{
    ChatCompletion, ChatCompletionChunk, Choice, ChunkChoice, Delta, FunctionCall, FunctionDelta,
    ResponseMessage, ToolCallDelta, ToolCallRef, Usage,
};
use kirogate_core::{GatewayError, Result};
use kirogate_upstream::events::StreamEvent;

/// Turns parser events into OpenAI chunks, one request's worth of state.
struct ChunkSynthesizer {
    id: String,
    model: String,
    created: i64,
    tool_indices: HashMap<String, u32>,
    next_tool_index: u32,
    usage: Option<Usage>,
    finished: bool,
}

impl ChunkSynthesizer {
    fn new(id: String, model: String, created: i64) -> Self {
        Self {
            id,
            model,
            created,
            tool_indices: HashMap::new(),
            next_tool_index: 0,
            usage: None,
            finished: false,
        }
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<String>, usage: Option<Usage>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        }
    }

    /// Chunk for one parser event, if the event surfaces at all.
    fn on_event(&mut self, event: StreamEvent) -> Option<ChatCompletionChunk> {
        match event {
            StreamEvent::TextDelta { text } => Some(self.chunk(
                Delta {
                    role: Some("assistant".to_string()),
                    content: Some(text),
                    tool_calls: None,
                },
                None,
                None,
            )),

            StreamEvent::ToolCallStart { tool_use_id, name } => {
                let index = self.next_tool_index;
                self.next_tool_index += 1;
                self.tool_indices.insert(tool_use_id.clone(), index);
                Some(self.chunk(
                    Delta {
                        role: Some("assistant".to_string()),
                        content: None,
                        tool_calls: Some(vec![ToolCallDelta {
                            index,
                            id: Some(tool_use_id),
                            kind: Some("function".to_string()),
                            function: FunctionDelta {
                                name: Some(name),
                                arguments: None,
                            },
                        }]),
                    },
                    None,
                    None,
                ))
            }

            StreamEvent::ToolCallInputDelta {
                tool_use_id,
                fragment,
            } => {
                let index = *self.tool_indices.get(&tool_use_id)?;
                Some(self.chunk(
                    Delta {
                        role: None,
                        content: None,
                        tool_calls: Some(vec![ToolCallDelta {
                            index,
                            id: None,
                            kind: None,
                            function: FunctionDelta {
                                name: None,
                                arguments: Some(fragment),
                            },
                        }]),
                    },
                    None,
                    None,
                ))
            }

            // The stop carries no outbound field; the terminal chunk's
            // finish_reason reflects it.
            StreamEvent::ToolCallStop { .. } => None,

            StreamEvent::Usage {
                prompt_tokens,
                completion_tokens,
                credits,
            } => {
                self.usage = Some(Usage {
                    prompt_tokens,
                    completion_tokens,
                    total_tokens: prompt_tokens + completion_tokens,
                    credits,
                });
                None
            }

            StreamEvent::ContextUsage { percent } => {
                debug!(percent, "upstream context usage");
                None
            }

            StreamEvent::StreamEnd { finish_reason } => Some(self.terminal(&finish_reason)),
        }
    }

    /// The single chunk with a non-null finish_reason.
    fn terminal(&mut self, finish_reason: &str) -> ChatCompletionChunk {
        self.finished = true;
        let usage = self.usage.take();
        self.chunk(Delta::default(), Some(finish_reason.to_string()), usage)
    }
}

/// SSE body for a streaming completion. Pulls from the parser channel only
/// as the client drains, and always terminates with a finish-bearing chunk
/// followed by the `[DONE]` frame.
pub fn sse_stream(
    mut rx: mpsc::Receiver<StreamEvent>,
    id: String,
    model: String,
    created: i64,
) -> impl futures_util::Stream<Item = std::result::Result<Event, Infallible>> {
    let mut synth = ChunkSynthesizer::new(id, model, created);

    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            if let Some(chunk) = synth.on_event(event) {
                let json = serde_json::to_string(&chunk).unwrap_or_default();
                yield Ok(Event::default().data(json));
            }
            if synth.finished {
                break;
            }
        }

        // Producer died without a StreamEnd: still close the protocol.
        if !synth.finished {
            let chunk = synth.terminal("error");
            let json = serde_json::to_string(&chunk).unwrap_or_default();
            yield Ok(Event::default().data(json));
        }

        yield Ok(Event::default().data("[DONE]"));
    }
}

/// Buffer the whole event sequence into one `chat.completion` object.
pub async fn aggregate(
    mut rx: mpsc::Receiver<StreamEvent>,
    id: String,
    model: String,
    created: i64,
) -> Result<ChatCompletion> {
    let mut text = String::new();
    let mut calls: Vec<(String, String, String)> = Vec::new(); // id, name, arguments
    let mut usage: Option<Usage> = None;
    let mut finish_reason = "error".to_string();

    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::TextDelta { text: t } => text.push_str(&t),
            StreamEvent::ToolCallStart { tool_use_id, name } => {
                calls.push((tool_use_id, name, String::new()));
            }
            StreamEvent::ToolCallInputDelta {
                tool_use_id,
                fragment,
            } => {
                if let Some(call) = calls.iter_mut().find(|(cid, _, _)| *cid == tool_use_id) {
                    call.2.push_str(&fragment);
                }
            }
            StreamEvent::ToolCallStop { .. } => {}
            StreamEvent::Usage {
                prompt_tokens,
                completion_tokens,
                credits,
            } => {
                usage = Some(Usage {
                    prompt_tokens,
                    completion_tokens,
                    total_tokens: prompt_tokens + completion_tokens,
                    credits,
                });
            }
            StreamEvent::ContextUsage { percent } => {
                debug!(percent, "upstream context usage");
            }
            StreamEvent::StreamEnd { finish_reason: f } => {
                finish_reason = f;
                break;
            }
        }
    }

    if finish_reason == "error" {
        return Err(GatewayError::Parse(
            "upstream stream terminated abnormally".into(),
        ));
    }

    let tool_calls: Vec<ToolCallRef> = calls
        .into_iter()
        .map(|(call_id, name, arguments)| ToolCallRef {
            id: call_id,
            kind: "function".to_string(),
            function: FunctionCall { name, arguments },
        })
        .collect();

    Ok(ChatCompletion {
        id,
        object: "chat.completion".to_string(),
        created,
        model,
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: if text.is_empty() && !tool_calls.is_empty() {
                    None
                } else {
                    Some(text)
                },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
            },
            finish_reason: Some(finish_reason),
        }],
        usage,
    })
}
