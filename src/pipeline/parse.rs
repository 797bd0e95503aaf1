//! Turning raw model text into structured data.
//!
//! Model output is untrusted free text. Both parsers degrade per item:
//! a malformed line costs one slot, never the whole batch.
//!
//! * [`parse_json_array`] — extraction responses (a JSON array of records),
//!   tolerant of a surrounding markdown code fence.
//! * [`parse_tag_lines`] — tagging responses (`[n] #tag #tag` lines), one
//!   slot per row of the batch.

use crate::error::ParseError;
use crate::pipeline::taxonomy::Taxonomy;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

/// Slot never filled by any response line.
pub const PARSING_MISMATCH: &str = "ERROR: Parsing Mismatch";
/// The model answered for the row, but none of its tags is in the taxonomy.
pub const NO_VALID_TAGS: &str = "INFO: No Valid Tags Found";

static LEADING_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^```(?:json)?\s*").expect("valid regex"));
static TRAILING_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*```$").expect("valid regex"));
static TAG_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\[\s*(\d+)\s*\]\s*(.*)$").expect("valid regex"));

/// Remove one leading ```` ```json ```` (or bare ```` ``` ````) fence and one
/// trailing fence.
pub fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    let without_lead = LEADING_FENCE.replace(trimmed, "");
    TRAILING_FENCE.replace(&without_lead, "").into_owned()
}

/// Parse `text` as a JSON array.
///
/// A syntax error triggers exactly one retry on the fence-stripped text.
/// A value that parses but is not an array is rejected without retry.
pub fn parse_json_array(text: &str) -> Result<Vec<Value>, ParseError> {
    let value = match serde_json::from_str::<Value>(text) {
        Ok(v) => v,
        Err(first) => {
            debug!("direct JSON parse failed ({first}), retrying without code fence");
            let stripped = strip_code_fence(text);
            serde_json::from_str::<Value>(&stripped)
                .map_err(|e| ParseError::InvalidJson(e.to_string()))?
        }
    };

    match value {
        Value::Array(items) => Ok(items),
        other => Err(ParseError::NotAnArray(json_kind(&other))),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parse a numbered tag list into exactly `batch_size` slots.
///
/// Each line `[n] tags...` fills slot `n - 1`. Non-matching lines and
/// out-of-range indices are logged and skipped. Unfilled slots hold
/// [`PARSING_MISMATCH`]. Tags are whitespace-collapsed; with a non-empty
/// taxonomy, unknown tags are dropped and a line left with none becomes
/// [`NO_VALID_TAGS`].
pub fn parse_tag_lines(text: &str, batch_size: usize, taxonomy: &Taxonomy) -> Vec<String> {
    let mut slots: Vec<Option<String>> = vec![None; batch_size];

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Some(caps) = TAG_LINE.captures(line) else {
            warn!("ignoring unmatched tag line: {:?}", line);
            continue;
        };
        let index = caps[1].parse::<usize>().ok();
        let slot = match index {
            Some(n) if (1..=batch_size).contains(&n) => n - 1,
            _ => {
                warn!(
                    "ignoring tag line with index {} outside 1..={}",
                    &caps[1], batch_size
                );
                continue;
            }
        };

        let raw: Vec<&str> = caps[2].split_whitespace().collect();
        let kept: Vec<&str> = raw.iter().copied().filter(|t| taxonomy.allows(t)).collect();
        if kept.len() < raw.len() {
            debug!(
                "slot {}: dropped {} tag(s) outside the taxonomy",
                slot + 1,
                raw.len() - kept.len()
            );
        }

        slots[slot] = Some(if !raw.is_empty() && kept.is_empty() {
            NO_VALID_TAGS.to_string()
        } else {
            kept.join(" ")
        });
    }

    slots
        .into_iter()
        .map(|s| s.unwrap_or_else(|| PARSING_MISMATCH.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fenced_json_parses_like_plain_json() {
        let plain = r#"[{"question_text": "Q", "answer_page": 2}]"#;
        let fenced = format!("```json\n{plain}\n```");
        assert_eq!(
            parse_json_array(&fenced).unwrap(),
            parse_json_array(plain).unwrap()
        );

        let bare_fence = format!("```\n{plain}\n```  ");
        assert_eq!(
            parse_json_array(&bare_fence).unwrap(),
            parse_json_array(plain).unwrap()
        );
    }

    #[test]
    fn uppercase_fence_is_stripped() {
        assert_eq!(
            parse_json_array("```JSON\n[1, 2]\n```").unwrap(),
            vec![json!(1), json!(2)]
        );
    }

    #[test]
    fn non_array_is_rejected() {
        assert_eq!(
            parse_json_array(r#"{"a": 1}"#),
            Err(ParseError::NotAnArray("object"))
        );
    }

    #[test]
    fn garbage_is_invalid_json() {
        assert!(matches!(
            parse_json_array("Sure! Here are your cards:"),
            Err(ParseError::InvalidJson(_))
        ));
    }

    #[test]
    fn empty_array_is_ok() {
        assert!(parse_json_array("[]").unwrap().is_empty());
    }

    #[test]
    fn sparse_tag_lines_fill_mismatch_slots() {
        let out = parse_tag_lines("[1] a b\n[3] c", 5, &Taxonomy::empty());
        assert_eq!(
            out,
            vec![
                "a b".to_string(),
                PARSING_MISMATCH.to_string(),
                "c".to_string(),
                PARSING_MISMATCH.to_string(),
                PARSING_MISMATCH.to_string(),
            ]
        );
    }

    #[test]
    fn whitespace_is_collapsed_and_junk_ignored() {
        let text = "Here you go:\n [ 2 ]   #x\t\t#y  \n[0] nope\n[9] too far\n";
        let out = parse_tag_lines(text, 2, &Taxonomy::empty());
        assert_eq!(out, vec![PARSING_MISMATCH.to_string(), "#x #y".to_string()]);
    }

    #[test]
    fn taxonomy_filters_tags() {
        let tax = Taxonomy::from_tags(["#A", "#B"]);
        let out = parse_tag_lines("[1] #A #Z\n[2] #Q\n[3]", 3, &tax);
        assert_eq!(
            out,
            vec!["#A".to_string(), NO_VALID_TAGS.to_string(), String::new()]
        );
    }

    #[test]
    fn later_line_for_same_slot_wins() {
        let out = parse_tag_lines("[1] a\n[1] b", 1, &Taxonomy::empty());
        assert_eq!(out, vec!["b".to_string()]);
    }
}
