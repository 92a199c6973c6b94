use serde_json::Value;
use tracing::debug;

/// Counters from one pass over an agent event stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventStreamStats {
    pub assistant_blocks: usize,
    pub tool_calls: usize,
    pub malformed_lines: usize,
}

/// The agent's textual output assembled from a line-oriented JSON event
/// stream, plus stream statistics.
#[derive(Debug, Clone, Default)]
pub struct AssembledText {
    pub text: String,
    pub stats: EventStreamStats,
}

/// Assembles assistant text from a stream-JSON transcript.
///
/// Each line is parsed as a JSON event. Text blocks from `assistant`-role
/// events are concatenated with newline separators so markers at block starts
/// stay on their own line. Tool-call events are logged for observability.
/// Malformed lines are dropped; a partial trailing line (no final newline)
/// is still attempted.
pub fn assemble_agent_text(raw: &str) -> AssembledText {
    let mut blocks: Vec<String> = Vec::new();
    let mut stats = EventStreamStats::default();

    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(_) => {
                stats.malformed_lines += 1;
                continue;
            }
        };
        ingest_event(&value, &mut blocks, &mut stats);
    }

    AssembledText {
        text: blocks.join("\n"),
        stats,
    }
}

fn ingest_event(value: &Value, blocks: &mut Vec<String>, stats: &mut EventStreamStats) {
    match value.get("type").and_then(Value::as_str) {
        Some("assistant") => {
            let content = value
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(Value::as_array);
            let Some(items) = content else {
                return;
            };
            for item in items {
                match item.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = item.get("text").and_then(Value::as_str) {
                            if !text.is_empty() {
                                blocks.push(text.to_string());
                                stats.assistant_blocks += 1;
                            }
                        }
                    }
                    Some("tool_use") => {
                        stats.tool_calls += 1;
                        debug!(
                            tool = item.get("name").and_then(serde_json::Value::as_str).unwrap_or("?"),
                            "agent tool call"
                        );
                    }
                    _ => {}
                }
            }
        }
        Some("result") => {
            // Terminal result events repeat the final message; the assistant
            // blocks already carry it, so only log.
            debug!(
                is_error = value.get("is_error").and_then(serde_json::Value::as_bool),
                "agent result event"
            );
        }
        _ => {}
    }
}
