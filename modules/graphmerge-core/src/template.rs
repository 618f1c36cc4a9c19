use std::collections::HashMap;

use crate::error::TemplateError;

/// One lexical piece of a prompt template.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Brace(char),
    Placeholder(&'a str),
}

/// Split a template into literals and `{name}` placeholders. `{{` and `}}`
/// are literal braces; a lone `}` or an unclosed `{` is rejected.
fn segments(template: &str) -> Result<Vec<Segment<'_>>, TemplateError> {
    let bytes = template.as_bytes();
    let mut out = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'{' => {
                if i > literal_start {
                    out.push(Segment::Literal(&template[literal_start..i]));
                }
                if bytes.get(i + 1) == Some(&b'{') {
                    out.push(Segment::Brace('{'));
                    i += 2;
                } else {
                    let close = template[i + 1..]
                        .find('}')
                        .ok_or(TemplateError::Unclosed(i))?;
                    let name = template[i + 1..i + 1 + close].trim();
                    if name.is_empty() || name.contains('{') {
                        return Err(TemplateError::Unclosed(i));
                    }
                    out.push(Segment::Placeholder(name));
                    i += close + 2;
                }
                literal_start = i;
            }
            b'}' => {
                if i > literal_start {
                    out.push(Segment::Literal(&template[literal_start..i]));
                }
                if bytes.get(i + 1) == Some(&b'}') {
                    out.push(Segment::Brace('}'));
                    i += 2;
                } else {
                    return Err(TemplateError::UnmatchedClose(i));
                }
                literal_start = i;
            }
            _ => i += 1,
        }
    }
    if literal_start < bytes.len() {
        out.push(Segment::Literal(&template[literal_start..]));
    }
    Ok(out)
}

/// All placeholder names referenced by a template, in order of first use.
pub fn placeholders(template: &str) -> Result<Vec<String>, TemplateError> {
    let mut names: Vec<String> = Vec::new();
    for segment in segments(template)? {
        if let Segment::Placeholder(name) = segment {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

/// Validate that every placeholder in a template is in the allowed set.
pub fn validate_template(template: &str, allowed: &[&str]) -> Result<(), TemplateError> {
    for name in placeholders(template)? {
        if !allowed.contains(&name.as_str()) {
            return Err(TemplateError::UnknownPlaceholder(name));
        }
    }
    Ok(())
}

/// Interpolate `{name}` placeholders. Every placeholder must be both allowed
/// and supplied; extra values in `vars` are ignored.
pub fn render(
    template: &str,
    allowed: &[&str],
    vars: &HashMap<&str, &str>,
) -> Result<String, TemplateError> {
    let mut result = String::with_capacity(template.len() + 256);
    for segment in segments(template)? {
        match segment {
            Segment::Literal(text) => result.push_str(text),
            Segment::Brace(c) => result.push(c),
            Segment::Placeholder(name) => {
                if !allowed.contains(&name) {
                    return Err(TemplateError::UnknownPlaceholder(name.to_string()));
                }
                let value = vars
                    .get(name)
                    .ok_or_else(|| TemplateError::MissingValue(name.to_string()))?;
                result.push_str(value);
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALLOWED: &[&str] = &["head", "relation", "candidates", "head_context"];

    #[test]
    fn renders_placeholders() {
        let result = render(
            "Head: {head} / {relation}",
            ALLOWED,
            &HashMap::from([("head", "Star Wars"), ("relation", "director")]),
        )
        .unwrap();
        assert_eq!(result, "Head: Star Wars / director");
    }

    #[test]
    fn doubled_braces_are_literal() {
        let result = render(
            r#"Return {{"groups": []}} for {head}"#,
            ALLOWED,
            &HashMap::from([("head", "x")]),
        )
        .unwrap();
        assert_eq!(result, r#"Return {"groups": []} for x"#);
    }

    #[test]
    fn refuses_unknown_placeholder() {
        let err = render("{taxonomy}", ALLOWED, &HashMap::new()).unwrap_err();
        assert_eq!(err, TemplateError::UnknownPlaceholder("taxonomy".into()));
    }

    #[test]
    fn refuses_missing_value() {
        let err = render("{head}", ALLOWED, &HashMap::new()).unwrap_err();
        assert_eq!(err, TemplateError::MissingValue("head".into()));
    }

    #[test]
    fn rejects_lone_closing_brace() {
        assert!(matches!(
            validate_template("oops }", ALLOWED),
            Err(TemplateError::UnmatchedClose(5))
        ));
    }

    #[test]
    fn rejects_unclosed_placeholder() {
        assert!(matches!(
            validate_template("{head", ALLOWED),
            Err(TemplateError::Unclosed(0))
        ));
    }

    #[test]
    fn lists_placeholders_once_in_order() {
        let names = placeholders("{candidates} {head} {candidates}").unwrap();
        assert_eq!(names, vec!["candidates".to_string(), "head".to_string()]);
    }

    #[test]
    fn handles_multibyte_text() {
        let result = render(
            "请判断 {head} 的候选项：{candidates}",
            ALLOWED,
            &HashMap::from([("head", "缺氧"), ("candidates", "[1] 提高FiO2")]),
        )
        .unwrap();
        assert_eq!(result, "请判断 缺氧 的候选项：[1] 提高FiO2");
    }
}
