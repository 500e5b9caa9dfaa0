//! Parsing rules for LLM text.
//!
//! JSON is extracted with a balanced-brace scan first, then decoded
//! strictly. Markdown sections are located by heading, never by regex.

use serde::Deserialize;
use std::collections::BTreeMap;

/// One unit of discovered work, as reported by the manager.
#[derive(Clone, Debug, Deserialize)]
pub struct DiscoveredEvent {
    #[serde(default)]
    pub event_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_priority() -> i64 {
    5
}

fn default_category() -> String {
    "general".to_string()
}

impl DiscoveredEvent {
    /// Flatten the metadata object into string pairs; non-strings are
    /// rendered as JSON.
    pub fn metadata_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        if let Some(object) = self.metadata.as_object() {
            for (key, value) in object {
                let rendered = value
                    .as_str()
                    .map(String::from)
                    .unwrap_or_else(|| value.to_string());
                map.insert(key.clone(), rendered);
            }
        }
        map
    }
}

/// The JSON shape the manager returns from CHECK FOR EVENTS.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FetchReply {
    #[serde(default)]
    pub events_found: bool,
    #[serde(default)]
    pub events: Vec<DiscoveredEvent>,
    #[serde(default)]
    pub commentary: Option<String>,
}

/// Extract the first balanced `{...}` block, respecting strings and escapes.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Decode a CHECK FOR EVENTS reply; None when no parseable object exists.
pub fn parse_fetch_reply(text: &str) -> Option<FetchReply> {
    let json = extract_json_object(text)?;
    serde_json::from_str(json).ok()
}

/// First `\n\n`-delimited paragraph of a response.
pub fn first_paragraph(text: &str) -> String {
    text.trim()
        .split("\n\n")
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Body of a `## {heading}` section: lines until the next heading.
pub fn extract_section(text: &str, heading: &str) -> Option<String> {
    let needle = heading.to_ascii_lowercase();
    let mut body = String::new();
    let mut in_section = false;
    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(title) = trimmed.strip_prefix('#') {
            let title = title.trim_start_matches('#').trim().to_ascii_lowercase();
            if in_section {
                break;
            }
            in_section = title == needle;
            continue;
        }
        if in_section {
            body.push_str(line);
            body.push('\n');
        }
    }
    let body = body.trim().to_string();
    if body.is_empty() {
        None
    } else {
        Some(body)
    }
}

/// Summary of a response: the `## Summary` section if present, else the
/// first paragraph.
pub fn extract_summary(text: &str) -> String {
    extract_section(text, "summary").unwrap_or_else(|| first_paragraph(text))
}

/// Bulleted lines (`- ` or `* `), trimmed.
pub fn bullet_lines(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let trimmed = line.trim_start();
            trimmed
                .strip_prefix("- ")
                .or_else(|| trimmed.strip_prefix("* "))
                .map(|rest| rest.trim().to_string())
        })
        .filter(|line| !line.is_empty())
        .collect()
}

/// Bulleted lines under an Actions heading, if the agent structured one.
pub fn extract_actions(text: &str) -> Vec<String> {
    extract_section(text, "actions")
        .or_else(|| extract_section(text, "actions taken"))
        .map(|section| bullet_lines(&section))
        .unwrap_or_default()
}

/// Split an aggregation response into (narrative, LEARNING lines).
/// LEARNING lines are removed from the narrative and deduped in order.
pub fn split_learnings(text: &str) -> (String, Vec<String>) {
    let mut narrative = String::new();
    let mut learnings: Vec<String> = Vec::new();
    for line in text.lines() {
        if let Some(rest) = line.trim_start().strip_prefix("LEARNING:") {
            let learning = rest.trim().to_string();
            if !learning.is_empty() && !learnings.contains(&learning) {
                learnings.push(learning);
            }
        } else {
            narrative.push_str(line);
            narrative.push('\n');
        }
    }
    (narrative.trim().to_string(), learnings)
}

/// Fatal-error indicator: the first non-blank line announces an
/// unrecoverable failure.
pub fn looks_fatal(text: &str) -> bool {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .is_some_and(|line| {
            line.starts_with("FATAL") || line.starts_with("UNRECOVERABLE") || line.starts_with("ERROR:")
        })
}

/// Whether a clarification reply signals readiness to plan.
pub fn contains_ready_signal(text: &str) -> bool {
    text.contains("READY_TO_PLAN")
}

/// Clarity-evaluation verdict for a mid-run instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClarityVerdict {
    Clear,
    Clarify(String),
}

/// CLEAR means actionable as-is; CLARIFY carries a question back. Anything
/// that does not announce CLARIFY is treated as clear.
pub fn parse_clarity(text: &str) -> ClarityVerdict {
    if let Some(pos) = text.find("CLARIFY") {
        let rest = text[pos + "CLARIFY".len()..]
            .trim_start_matches(':')
            .trim();
        let question = if rest.is_empty() {
            text.trim().to_string()
        } else {
            rest.to_string()
        };
        return ClarityVerdict::Clarify(question);
    }
    ClarityVerdict::Clear
}

/// Truncate at a char boundary, appending a marker when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}…[truncated]", cut)
}
