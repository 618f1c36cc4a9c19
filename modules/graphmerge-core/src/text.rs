/// Normalise a node name for matching: lowercase, collapse whitespace, trim
/// surrounding quotes and punctuation (ASCII and CJK).
pub fn normalize_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_matches(|c: char| {
            c.is_ascii_punctuation()
                || matches!(c, '“' | '”' | '‘' | '’' | '「' | '」' | '《' | '》' | '。' | '，' | '、' | '：' | '；')
        })
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_case_and_whitespace() {
        assert_eq!(normalize_name("  George   LUCAS "), "george lucas");
    }

    #[test]
    fn strips_surrounding_punctuation() {
        assert_eq!(normalize_name("\"FiO2.\""), "fio2");
        assert_eq!(normalize_name("《星球大战》"), "星球大战");
    }

    #[test]
    fn keeps_inner_punctuation() {
        assert_eq!(normalize_name("G. Lucas"), "g. lucas");
    }
}
