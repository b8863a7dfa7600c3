use serde_json::Value;

/// Semantic events decoded from the upstream event stream.
///
/// A closed set: the synthesizer matches exhaustively, so adding a variant
/// forces every consumer to decide what it means for the outbound protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incremental assistant text.
    TextDelta { text: String },

    /// A tool call opened; input fragments for `tool_use_id` follow.
    ToolCallStart { tool_use_id: String, name: String },

    /// Partial JSON for a tool call's arguments.
    ToolCallInputDelta { tool_use_id: String, fragment: String },

    /// The tool call's argument stream is complete.
    ToolCallStop { tool_use_id: String },

    /// Token accounting. `credits` is upstream-defined and carried opaquely.
    Usage {
        prompt_tokens: u32,
        completion_tokens: u32,
        credits: Option<Value>,
    },

    /// Context-window consumption as a percentage.
    ContextUsage { percent: f64 },

    /// The upstream body ended. `finish_reason` is "stop", "tool_calls",
    /// or "error" for truncated/malformed streams.
    StreamEnd { finish_reason: String },
}
