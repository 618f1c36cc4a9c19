//! Alias relation vocabulary with orientation.
//!
//! Forward relations (`A alias_of B`) make the source the alias of the target.
//! Reverse relations (`A 别名包括 B`, "A's aliases include B") make the target
//! the alias of the source.

use serde::{Deserialize, Serialize};

pub const ALIAS_OF: &str = "alias_of";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AliasRelations {
    pub forward: Vec<String>,
    pub reverse: Vec<String>,
}

impl Default for AliasRelations {
    fn default() -> Self {
        Self {
            forward: ["alias_of", "alias", "same_as", "is_alias_of", "别名"]
                .into_iter()
                .map(String::from)
                .collect(),
            reverse: ["also_known_as", "别名包括", "aliases", "has_alias", "又称"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl AliasRelations {
    pub fn is_alias(&self, relation: &str) -> bool {
        self.forward.iter().any(|r| r == relation) || self.reverse.iter().any(|r| r == relation)
    }

    /// Orient an alias edge as `(alias, canonical)`; `None` for non-alias relations.
    pub fn alias_pair<'a>(&self, source: &'a str, relation: &str, target: &'a str) -> Option<(&'a str, &'a str)> {
        if self.forward.iter().any(|r| r == relation) {
            Some((source, target))
        } else if self.reverse.iter().any(|r| r == relation) {
            Some((target, source))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_relation_makes_source_the_alias() {
        let aliases = AliasRelations::default();
        assert_eq!(aliases.alias_pair("B", "alias_of", "A"), Some(("B", "A")));
    }

    #[test]
    fn reverse_relation_makes_target_the_alias() {
        let aliases = AliasRelations::default();
        assert_eq!(aliases.alias_pair("阿司匹林", "别名包括", "乙酰水杨酸"), Some(("乙酰水杨酸", "阿司匹林")));
    }

    #[test]
    fn non_alias_relation_is_ignored() {
        let aliases = AliasRelations::default();
        assert!(!aliases.is_alias("director"));
        assert_eq!(aliases.alias_pair("Star Wars", "director", "George Lucas"), None);
    }
}
