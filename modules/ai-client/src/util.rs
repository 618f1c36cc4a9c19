/// Truncate a string to at most `max_bytes` bytes at a character boundary.
pub fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    &s[..end]
}

/// Strip markdown code blocks from a response.
pub fn strip_code_blocks(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Slice out the outermost `{ ... }` object from a model response that may
/// carry prose before or after the JSON payload.
pub fn extract_json_object(response: &str) -> Option<&str> {
    let stripped = strip_code_blocks(response);
    let start = stripped.find('{')?;
    let end = stripped.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&stripped[start..=end])
}

/// Parse a model response as JSON, tolerating code fences, surrounding prose,
/// trailing commas and full-width punctuation around the structure.
pub fn parse_lenient_json(response: &str) -> Result<serde_json::Value, serde_json::Error> {
    let stripped = strip_code_blocks(response);
    if let Ok(value) = serde_json::from_str(stripped) {
        return Ok(value);
    }

    let candidate = extract_json_object(stripped).unwrap_or(stripped);
    match serde_json::from_str(candidate) {
        Ok(value) => Ok(value),
        Err(first_err) => {
            let repaired = remove_trailing_commas(&normalize_fullwidth(candidate));
            serde_json::from_str(&repaired).map_err(|_| first_err)
        }
    }
}

/// Replace full-width structural punctuation outside of string literals.
fn normalize_fullwidth(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in s.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '，' => out.push(','),
            '：' => out.push(':'),
            _ => out.push(c),
        }
    }
    out
}

/// Drop commas that directly precede a closing `]` or `}` (ignoring whitespace),
/// outside of string literals.
fn remove_trailing_commas(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
            out.push(c);
            continue;
        }
        if c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if matches!(next, Some(']') | Some('}')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_to_char_boundary() {
        let text = "Hello 世界";
        let truncated = truncate_to_char_boundary(text, 8);
        assert!(truncated.len() <= 8);
        assert!(text.starts_with(truncated));
    }

    #[test]
    fn test_truncate_within_bounds() {
        let text = "Hello";
        assert_eq!(truncate_to_char_boundary(text, 100), "Hello");
    }

    #[test]
    fn test_strip_code_blocks() {
        assert_eq!(strip_code_blocks("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("```\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("{}"), "{}");
    }

    #[test]
    fn extracts_object_from_prose() {
        let response = "Here are the groups:\n{\"groups\": []}\nHope this helps.";
        assert_eq!(extract_json_object(response), Some("{\"groups\": []}"));
        assert_eq!(extract_json_object("no json here"), None);
    }

    #[test]
    fn lenient_parse_handles_trailing_commas() {
        let value = parse_lenient_json("```json\n{\"groups\": [{\"members\": [1, 2,],},]}\n```")
            .unwrap();
        assert_eq!(value["groups"][0]["members"][1], 2);
    }

    #[test]
    fn lenient_parse_keeps_commas_inside_strings() {
        let value = parse_lenient_json("{\"rationale\": \"a, b,]\",}").unwrap();
        assert_eq!(value["rationale"], "a, b,]");
    }

    #[test]
    fn lenient_parse_normalizes_fullwidth_punctuation() {
        let value = parse_lenient_json("{\"members\"：[1，2]}").unwrap();
        assert_eq!(value["members"][1], 2);
    }

    #[test]
    fn lenient_parse_rejects_garbage() {
        assert!(parse_lenient_json("I cannot answer that").is_err());
    }
}
