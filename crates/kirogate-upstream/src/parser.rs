//! Incremental parser for the upstream framed event stream.
//!
//! The body is a concatenation of length-prefixed frames: a 12-byte prelude
//! (big-endian total length, big-endian header-block length, prelude CRC),
//! a header block, a JSON payload, and a 4-byte message CRC. Frames arrive
//! split at arbitrary transport chunk boundaries, so the parser accumulates
//! bytes and decodes whole frames as they complete. CRC words are length-
//! accounted but not verified.
//!
//! Payloads come in two dialects. Structured payloads classify themselves by
//! their top-level fields (`content`, `toolUseId` + `name`/`input`/`stop`,
//! `usage`, `contextUsage`). The bracketed dialect embeds tool calls as
//! literal `[Called name(...)]` text, with the argument JSON potentially
//! spanning many frames; a bracket-depth counter decides where it ends.

use std::collections::{HashMap, VecDeque};

use bytes::{Buf, BytesMut};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::events::StreamEvent;

const PRELUDE_LEN: usize = 12;
const TRAILER_LEN: usize = 4;

/// Only this literal prefix enters bracket mode; all other bracketed text
/// passes through as plain content.
const BRACKET_TRIGGER: &str = "[Called ";

/// Sliding dedup window: fingerprints of the most recent emitted text deltas.
const DEDUP_WINDOW: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq)]
enum ToolState {
    Started,
    Receiving,
    Stopped,
}

/// Scanner state for the bracketed dialect, persisted across frames.
enum Scan {
    /// Plain text; `carry` holds a trailing partial match of the trigger.
    Idle { carry: String },
    /// Inside `[Called `, reading the tool name up to `(`.
    Name { name: String },
    /// Inside the argument brackets. `depth` counts open brackets including
    /// the outer `[` and the call's `(`.
    Args { name: String, buf: String, depth: u32 },
}

pub struct EventStreamParser {
    buf: BytesMut,
    pending: VecDeque<StreamEvent>,
    recent: VecDeque<[u8; 8]>,
    tool_states: HashMap<String, ToolState>,
    /// Structured tool call currently between start and stop, if any.
    open_tool: Option<String>,
    scan: Scan,
    synth_seq: u32,
    saw_tool: bool,
    error: Option<String>,
    closed: bool,
}

impl Default for EventStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            pending: VecDeque::new(),
            recent: VecDeque::new(),
            tool_states: HashMap::new(),
            open_tool: None,
            scan: Scan::Idle {
                carry: String::new(),
            },
            synth_seq: 0,
            saw_tool: false,
            error: None,
            closed: false,
        }
    }

    /// Append a transport chunk and decode every frame that is now complete.
    pub fn feed(&mut self, chunk: &[u8]) {
        if self.closed || self.error.is_some() {
            return;
        }
        self.buf.extend_from_slice(chunk);
        self.decode_frames();
    }

    /// Pop the next complete event, if any.
    pub fn next_event(&mut self) -> Option<StreamEvent> {
        self.pending.pop_front()
    }

    /// Whether a malformed frame stopped decoding.
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn parse_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Record a transport-level failure so `close` terminates with an error.
    pub fn mark_error(&mut self, message: String) {
        if self.error.is_none() {
            self.error = Some(message);
        }
    }

    /// The body ended. Flushes scanner state, balances unstopped tool calls,
    /// and queues the terminal `StreamEnd`.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        // A partial frame left in the buffer means the body was truncated.
        if self.error.is_none() && !self.buf.is_empty() {
            self.error = Some(format!(
                "stream ended mid-frame ({} bytes pending)",
                self.buf.len()
            ));
        }

        // Flush whatever the bracket scanner was holding as literal text.
        match std::mem::replace(
            &mut self.scan,
            Scan::Idle {
                carry: String::new(),
            },
        ) {
            Scan::Idle { carry } => self.emit_text(&carry),
            Scan::Name { name } => self.emit_text(&format!("{BRACKET_TRIGGER}{name}")),
            Scan::Args { name, buf, .. } => {
                self.emit_text(&format!("{BRACKET_TRIGGER}{name}({buf}"))
            }
        }

        // Balance any structured tool call the upstream never stopped.
        if let Some(id) = self.open_tool.take() {
            self.tool_states.insert(id.clone(), ToolState::Stopped);
            self.pending
                .push_back(StreamEvent::ToolCallStop { tool_use_id: id });
        }

        let finish_reason = if let Some(ref msg) = self.error {
            warn!(error = %msg, "event stream terminated abnormally");
            "error".to_string()
        } else if self.saw_tool {
            "tool_calls".to_string()
        } else {
            "stop".to_string()
        };
        self.pending.push_back(StreamEvent::StreamEnd { finish_reason });
    }

    // ── Frame layer ──────────────────────────────────────────────────────────

    fn decode_frames(&mut self) {
        while self.error.is_none() {
            if self.buf.len() < PRELUDE_LEN {
                return;
            }
            let total = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
            let header_len =
                u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;

            if total < PRELUDE_LEN + TRAILER_LEN
                || header_len > total - PRELUDE_LEN - TRAILER_LEN
            {
                self.error = Some(format!(
                    "invalid frame prelude (total {total}, headers {header_len})"
                ));
                return;
            }
            if self.buf.len() < total {
                return;
            }

            let payload_start = PRELUDE_LEN + header_len;
            let payload_end = total - TRAILER_LEN;
            let payload = self.buf[payload_start..payload_end].to_vec();
            self.buf.advance(total);
            self.handle_payload(&payload);
        }
    }

    fn handle_payload(&mut self, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        let value: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                self.error = Some(format!("malformed frame payload: {e}"));
                return;
            }
        };
        let Some(obj) = value.as_object() else {
            self.error = Some("frame payload is not a JSON object".to_string());
            return;
        };

        if let Some(id) = obj.get("toolUseId").and_then(|v| v.as_str()) {
            let id = id.to_string();
            if let Some(name) = obj.get("name").and_then(|v| v.as_str()) {
                self.tool_start(id.clone(), name.to_string());
            }
            if let Some(input) = obj.get("input").and_then(|v| v.as_str()) {
                self.tool_input(&id, input.to_string());
            }
            if obj.get("stop").and_then(|v| v.as_bool()).unwrap_or(false) {
                self.tool_stop(&id);
            }
            return;
        }

        if let Some(content) = obj.get("content").and_then(|v| v.as_str()) {
            let decoded = decode_escapes(content);
            // While a structured tool call is open, text belongs to its
            // argument stream, not the assistant text channel.
            if let Some(id) = self.open_tool.clone() {
                self.tool_input(&id, decoded);
            } else {
                self.scan_text(&decoded);
            }
            return;
        }

        if let Some(usage) = obj.get("usage") {
            let prompt = usage
                .get("promptTokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32;
            let completion = usage
                .get("completionTokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32;
            let credits = usage.get("credits").cloned();
            self.pending.push_back(StreamEvent::Usage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                credits,
            });
            return;
        }

        if let Some(ctx) = obj.get("contextUsage") {
            let percent = ctx
                .as_f64()
                .or_else(|| ctx.get("percent").and_then(|v| v.as_f64()));
            if let Some(percent) = percent {
                self.pending.push_back(StreamEvent::ContextUsage { percent });
            }
            return;
        }

        debug!(keys = ?obj.keys().collect::<Vec<_>>(), "ignoring unrecognized frame payload");
    }

    // ── Structured tool-call state machine ───────────────────────────────────

    fn tool_start(&mut self, id: String, name: String) {
        match self.tool_states.get(&id) {
            Some(_) => {
                warn!(tool_use_id = %id, "duplicate tool call start ignored");
            }
            None => {
                self.tool_states.insert(id.clone(), ToolState::Started);
                self.open_tool = Some(id.clone());
                self.saw_tool = true;
                self.pending.push_back(StreamEvent::ToolCallStart {
                    tool_use_id: id,
                    name,
                });
            }
        }
    }

    fn tool_input(&mut self, id: &str, fragment: String) {
        match self.tool_states.get(id) {
            Some(ToolState::Started) | Some(ToolState::Receiving) => {
                self.tool_states.insert(id.to_string(), ToolState::Receiving);
                self.pending.push_back(StreamEvent::ToolCallInputDelta {
                    tool_use_id: id.to_string(),
                    fragment,
                });
            }
            _ => {
                warn!(tool_use_id = %id, "input delta outside start/stop window ignored");
            }
        }
    }

    fn tool_stop(&mut self, id: &str) {
        match self.tool_states.get(id) {
            Some(ToolState::Started) | Some(ToolState::Receiving) => {
                self.tool_states.insert(id.to_string(), ToolState::Stopped);
                if self.open_tool.as_deref() == Some(id) {
                    self.open_tool = None;
                }
                self.pending.push_back(StreamEvent::ToolCallStop {
                    tool_use_id: id.to_string(),
                });
            }
            _ => {
                warn!(tool_use_id = %id, "tool stop without start ignored");
            }
        }
    }

    // ── Bracketed dialect ────────────────────────────────────────────────────

    fn scan_text(&mut self, incoming: &str) {
        let mut state = std::mem::replace(
            &mut self.scan,
            Scan::Idle {
                carry: String::new(),
            },
        );
        let mut data = match state {
            Scan::Idle { ref mut carry } => {
                let mut d = std::mem::take(carry);
                d.push_str(incoming);
                d
            }
            _ => incoming.to_string(),
        };

        loop {
            match state {
                Scan::Idle { .. } => {
                    if let Some(pos) = data.find(BRACKET_TRIGGER) {
                        let before = data[..pos].to_string();
                        self.emit_text(&before);
                        data = data[pos + BRACKET_TRIGGER.len()..].to_string();
                        state = Scan::Name {
                            name: String::new(),
                        };
                    } else {
                        let keep = trailing_trigger_prefix(&data);
                        let split = data.len() - keep;
                        let before = data[..split].to_string();
                        self.emit_text(&before);
                        self.scan = Scan::Idle {
                            carry: data[split..].to_string(),
                        };
                        return;
                    }
                }
                Scan::Name { mut name } => {
                    let mut next = None;
                    let mut consumed = data.len();
                    for (i, c) in data.char_indices() {
                        if c == '(' {
                            next = Some(Scan::Args {
                                name: std::mem::take(&mut name),
                                buf: String::new(),
                                depth: 2,
                            });
                            consumed = i + 1;
                            break;
                        } else if c.is_whitespace() || "[]{})".contains(c) {
                            // Not a tool call after all: the trigger text is
                            // plain content. Re-emit it and rescan from here.
                            let literal = format!("{BRACKET_TRIGGER}{name}");
                            self.emit_text(&literal);
                            next = Some(Scan::Idle {
                                carry: String::new(),
                            });
                            consumed = i;
                            break;
                        } else {
                            name.push(c);
                        }
                    }
                    data = data[consumed..].to_string();
                    match next {
                        Some(s) => state = s,
                        None => {
                            // Name continues in the next frame.
                            self.scan = Scan::Name { name };
                            return;
                        }
                    }
                }
                Scan::Args {
                    name,
                    mut buf,
                    mut depth,
                } => {
                    let mut completed = false;
                    let mut consumed = data.len();
                    for (i, c) in data.char_indices() {
                        match c {
                            '[' | '{' | '(' => {
                                buf.push(c);
                                depth += 1;
                            }
                            ']' | '}' | ')' => {
                                depth -= 1;
                                if depth >= 2 {
                                    buf.push(c);
                                } else if depth == 0 {
                                    completed = true;
                                    consumed = i + 1;
                                    break;
                                }
                                // depth == 1: the args-closing `)`, dropped
                            }
                            _ => buf.push(c),
                        }
                    }
                    if completed {
                        self.emit_bracket_call(&name, buf);
                        data = data[consumed..].to_string();
                        state = Scan::Idle {
                            carry: String::new(),
                        };
                    } else {
                        self.scan = Scan::Args { name, buf, depth };
                        return;
                    }
                }
            }
        }
    }

    fn emit_bracket_call(&mut self, name: &str, args: String) {
        let id = format!("tooluse_synth_{}", self.synth_seq);
        self.synth_seq += 1;
        self.saw_tool = true;
        self.tool_states.insert(id.clone(), ToolState::Stopped);
        self.pending.push_back(StreamEvent::ToolCallStart {
            tool_use_id: id.clone(),
            name: name.to_string(),
        });
        self.pending.push_back(StreamEvent::ToolCallInputDelta {
            tool_use_id: id.clone(),
            fragment: args,
        });
        self.pending
            .push_back(StreamEvent::ToolCallStop { tool_use_id: id });
    }

    /// Emit a text delta unless an identical fragment was emitted recently.
    fn emit_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let digest = Sha256::digest(text.as_bytes());
        let mut fp = [0u8; 8];
        fp.copy_from_slice(&digest[..8]);

        if self.recent.contains(&fp) {
            debug!(len = text.len(), "suppressing redelivered text fragment");
            return;
        }
        self.recent.push_back(fp);
        if self.recent.len() > DEDUP_WINDOW {
            self.recent.pop_front();
        }
        self.pending.push_back(StreamEvent::TextDelta {
            text: text.to_string(),
        });
    }
}

/// Longest trailing substring of `s` that is a proper prefix of the trigger.
fn trailing_trigger_prefix(s: &str) -> usize {
    let max = (BRACKET_TRIGGER.len() - 1).min(s.len());
    for k in (1..=max).rev() {
        if s.ends_with(&BRACKET_TRIGGER[..k]) {
            return k;
        }
    }
    0
}

/// Decode literal escape sequences the upstream leaves in text payloads.
fn decode_escapes(s: &str) -> String {
    if !s.contains('\\') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Drive the parser over a streaming response body, forwarding events into
/// `tx`. Returns when the body ends or the receiver is dropped; a dropped
/// receiver is the cancellation signal, and dropping `resp` with it closes
/// the upstream connection.
pub async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut parser = EventStreamParser::new();
    let mut body = resp.bytes_stream();

    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                parser.feed(&bytes);
                while let Some(event) = parser.next_event() {
                    if tx.send(event).await.is_err() {
                        return; // client went away
                    }
                }
                if parser.failed() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "upstream body read failed mid-stream");
                parser.mark_error(e.to_string());
                break;
            }
        }
    }

    parser.close();
    while let Some(event) = parser.next_event() {
        if tx.send(event).await.is_err() {
            return;
        }
    }
}
