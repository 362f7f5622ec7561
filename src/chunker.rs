use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

/// A single append-only transcript record, one per newline-delimited line.
/// The exact upstream schema is not specified beyond "record type, message
/// role, timestamp, and either a text body or structured content parts"
/// (spec §4.5); this is a reasonably permissive superset that degrades
/// gracefully (the parser is total: a record it can't make sense of is
/// skipped, never a crash, per spec's design note "Keep the parser total").
#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage {
    pub role: String,
    pub timestamp_ms: i64,
    pub text: String,
}

const TOOL_ARG_TRUNCATE_CHARS: usize = 200;

/// Parse and normalize one line of a transcript file. Returns `None` for a
/// blank line, a malformed record, or a record with no extractable text —
/// these are skipped, not fatal (spec §4.5 "Parse errors on a single record
/// skip that record only").
pub fn normalize_line(line: &str) -> Option<NormalizedMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let record: RawRecord = serde_json::from_str(line).ok()?;
    let role = record.role.unwrap_or_else(|| "unknown".to_string());
    let timestamp_ms = parse_timestamp(record.timestamp.as_ref())?;

    let text = if let Some(content) = record.content {
        normalize_content(&content)
    } else {
        record.text.unwrap_or_default()
    };

    let text = text.trim().to_string();
    if text.is_empty() {
        return None;
    }

    Some(NormalizedMessage {
        role,
        timestamp_ms,
        text,
    })
}

fn parse_timestamp(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .ok()
            .or_else(|| s.parse::<i64>().ok()),
        _ => None,
    }
}

/// Flatten structured content parts into a single text body. Tool calls
/// become `[tool:<name>] <arguments>` (truncated); tool results are
/// included but marked; images become a placeholder; plain strings pass
/// through unchanged.
fn normalize_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(normalize_content_part)
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

fn normalize_content_part(part: &Value) -> String {
    let kind = part.get("type").and_then(Value::as_str).unwrap_or("text");
    match kind {
        "tool_call" | "tool_use" => {
            let name = part.get("name").and_then(Value::as_str).unwrap_or("unknown");
            let args = part
                .get("arguments")
                .or_else(|| part.get("input"))
                .map(|v| v.to_string())
                .unwrap_or_default();
            let args = truncate_chars(&args, TOOL_ARG_TRUNCATE_CHARS);
            format!("[tool:{name}] {args}")
        }
        "tool_result" => {
            let output = part
                .get("output")
                .or_else(|| part.get("content"))
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default();
            format!("[tool-result] {output}")
        }
        "image" | "image_url" => "[image]".to_string(),
        _ => part
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}…", &text[..byte_idx]),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct ChunkDraft {
    pub text: String,
    pub start_ts_ms: i64,
    pub end_ts_ms: i64,
}

const SOFT_BOUNDARY_GAP_MS: i64 = 30_000;

/// Group normalized messages into chunks by two policies together (spec
/// §4.5): a soft boundary on a ≥30s time gap between consecutive messages,
/// and a hard boundary once cumulative text exceeds `chunk_size` chars.
/// Either condition flushes the current chunk. Adjacent chunks within the
/// same file overlap by the trailing `chunk_overlap` characters of the
/// flushed chunk (spec §3 "Chunks within a file overlap by 300 characters
/// (configurable)"): that tail is carried over as the seed of the next
/// chunk's text, anchored at the flushed chunk's own end timestamp since the
/// overlapping span itself has no new message boundary of its own.
pub fn group_into_chunks(
    messages: &[NormalizedMessage],
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<ChunkDraft> {
    let mut chunks = Vec::new();
    let mut current_text = String::new();
    let mut current_start: Option<i64> = None;
    let mut current_end: Option<i64> = None;
    let mut previous_ts: Option<i64> = None;

    for message in messages {
        let gapped = previous_ts.is_some_and(|prev| message.timestamp_ms - prev >= SOFT_BOUNDARY_GAP_MS);
        let formatted = format!("[{}]: {}", message.role, message.text);
        let would_overflow = !current_text.is_empty()
            && current_text.len() + 1 + formatted.len() > chunk_size;

        if (gapped || would_overflow) && !current_text.is_empty() {
            let end_ts = current_end.take().unwrap();
            chunks.push(ChunkDraft {
                text: current_text.clone(),
                start_ts_ms: current_start.take().unwrap(),
                end_ts_ms: end_ts,
            });

            current_text = overlap_tail(&current_text, chunk_overlap);
            current_start = if current_text.is_empty() { None } else { Some(end_ts) };
            current_end = if current_text.is_empty() { None } else { Some(end_ts) };
        }

        if current_text.is_empty() {
            current_start = Some(message.timestamp_ms);
        } else {
            current_text.push('\n');
        }
        current_text.push_str(&formatted);
        current_end = Some(message.timestamp_ms);
        previous_ts = Some(message.timestamp_ms);
    }

    if !current_text.is_empty() {
        chunks.push(ChunkDraft {
            text: current_text,
            start_ts_ms: current_start.unwrap(),
            end_ts_ms: current_end.unwrap(),
        });
    }

    chunks
}

/// Trailing `overlap` characters of `text`, split on a char boundary. Empty
/// when `overlap` is 0 or `text` is shorter than the overlap window.
fn overlap_tail(text: &str, overlap: usize) -> String {
    if overlap == 0 {
        return String::new();
    }
    let char_count = text.chars().count();
    if char_count <= overlap {
        return text.to_string();
    }
    let skip = char_count - overlap;
    text.chars().skip(skip).collect()
}
