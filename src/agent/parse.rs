//! JSON extraction from generator text
//!
//! Text generators rarely answer with bare JSON: replies come wrapped in
//! code fences, prefixed with chatter, or followed by an explanation.
//! These helpers pull out the first balanced object and hand it to serde.

use serde_json::{Map, Value};

/// Extract the first balanced JSON object from text.
///
/// Braces inside string literals do not count towards nesting, so
/// `ok {"reason": "a } here"}` yields the whole object.
pub fn extract_json(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Parse the first JSON object found in `text`.
///
/// The error is a short human-readable description, suitable for a log
/// line or a degraded-analysis record.
pub fn parse_object(text: &str) -> Result<Map<String, Value>, String> {
    let candidate = extract_json(text).ok_or_else(|| "no JSON object in response".to_string())?;

    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("response is not a JSON object".to_string()),
        Err(e) => Err(format!("invalid JSON: {}", e)),
    }
}
