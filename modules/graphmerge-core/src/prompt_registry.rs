use std::collections::{BTreeMap, HashMap};

use crate::error::{DedupError, DedupResult};
use crate::prompts;
use crate::template::{render, validate_template};

/// Every prompt the pipeline issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PromptKind {
    System,
    StrictSystem,
    TailGeneral,
    TailAttribute,
    Keyword,
    Head,
    Clustering,
    Validation,
}

impl PromptKind {
    pub const ALL: [PromptKind; 8] = [
        PromptKind::System,
        PromptKind::StrictSystem,
        PromptKind::TailGeneral,
        PromptKind::TailAttribute,
        PromptKind::Keyword,
        PromptKind::Head,
        PromptKind::Clustering,
        PromptKind::Validation,
    ];

    /// `(family, name)` under `[prompts.<family>]` in the config file.
    pub fn config_key(self) -> (&'static str, &'static str) {
        match self {
            PromptKind::System => ("system", "default"),
            PromptKind::StrictSystem => ("system", "strict"),
            PromptKind::TailGeneral => ("semantic_dedup", "general"),
            PromptKind::TailAttribute => ("semantic_dedup", "attribute"),
            PromptKind::Keyword => ("keyword_dedup", "general"),
            PromptKind::Head => ("head_dedup", "general"),
            PromptKind::Clustering => ("clustering", "general"),
            PromptKind::Validation => ("validation", "general"),
        }
    }

    /// Placeholders a template of this kind may reference.
    pub fn allowed_vars(self) -> &'static [&'static str] {
        match self {
            PromptKind::System | PromptKind::StrictSystem => &[],
            PromptKind::TailGeneral
            | PromptKind::TailAttribute
            | PromptKind::Keyword
            | PromptKind::Head => &["head", "relation", "candidates", "head_context"],
            PromptKind::Clustering => &["head", "relation", "candidates"],
            PromptKind::Validation => &["groups", "candidates"],
        }
    }

    fn builtin(self) -> &'static str {
        match self {
            PromptKind::System => prompts::SYSTEM_PREAMBLE,
            PromptKind::StrictSystem => prompts::STRICT_SYSTEM_PREAMBLE,
            PromptKind::TailGeneral => prompts::TAIL_GENERAL,
            PromptKind::TailAttribute => prompts::TAIL_ATTRIBUTE,
            PromptKind::Keyword => prompts::KEYWORD_GENERAL,
            PromptKind::Head => prompts::HEAD_GENERAL,
            PromptKind::Clustering => prompts::CLUSTERING_GENERAL,
            PromptKind::Validation => prompts::VALIDATION_GENERAL,
        }
    }
}

/// Holds validated prompt templates (built-ins overlaid with config overrides).
#[derive(Debug, Clone)]
pub struct PromptRegistry {
    templates: HashMap<PromptKind, String>,
}

impl PromptRegistry {
    /// Built-in templates only.
    pub fn builtin() -> Self {
        let templates = PromptKind::ALL
            .iter()
            .map(|&kind| (kind, prompts::with_identity_rules(kind.builtin())))
            .collect();
        Self { templates }
    }

    /// Overlay `[prompts.<family>.<name>]` overrides and validate every
    /// template against its allowed placeholders.
    pub fn load(overrides: &BTreeMap<String, BTreeMap<String, String>>) -> DedupResult<Self> {
        let mut registry = Self::builtin();

        for (family, entries) in overrides {
            for (name, template) in entries {
                let kind = PromptKind::ALL
                    .iter()
                    .copied()
                    .find(|k| k.config_key() == (family.as_str(), name.as_str()))
                    .ok_or_else(|| {
                        DedupError::Config(format!("unknown prompt override: prompts.{family}.{name}"))
                    })?;

                if template.trim().is_empty() {
                    return Err(DedupError::Config(format!(
                        "prompt override is empty: prompts.{family}.{name}"
                    )));
                }
                registry
                    .templates
                    .insert(kind, prompts::with_identity_rules(template));
            }
        }

        for (kind, template) in &registry.templates {
            validate_template(template, kind.allowed_vars()).map_err(|e| {
                let (family, name) = kind.config_key();
                DedupError::Config(format!("prompts.{family}.{name}: {e}"))
            })?;
        }

        Ok(registry)
    }

    pub fn template(&self, kind: PromptKind) -> &str {
        self.templates
            .get(&kind)
            .map(String::as_str)
            .unwrap_or_else(|| kind.builtin())
    }

    /// Render a prompt with runtime values.
    pub fn render(&self, kind: PromptKind, vars: &HashMap<&str, &str>) -> DedupResult<String> {
        Ok(render(self.template(kind), kind.allowed_vars(), vars)?)
    }
}

impl Default for PromptRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(family: &str, name: &str, body: &str) -> BTreeMap<String, BTreeMap<String, String>> {
        BTreeMap::from([(
            family.to_string(),
            BTreeMap::from([(name.to_string(), body.to_string())]),
        )])
    }

    #[test]
    fn builtin_registry_renders_tail_prompt() {
        let registry = PromptRegistry::builtin();
        let prompt = registry
            .render(
                PromptKind::TailGeneral,
                &HashMap::from([
                    ("head", "Star Wars"),
                    ("relation", "director"),
                    ("candidates", "[1] George Lucas\n[2] G. Lucas"),
                    ("head_context", "- Star Wars: 1977 film"),
                ]),
            )
            .unwrap();
        assert!(prompt.contains("Head entity: Star Wars"));
        assert!(prompt.contains("[2] G. Lucas"));
        assert!(prompt.contains(r#"{"groups": [{"members""#));
    }

    #[test]
    fn override_replaces_builtin() {
        let registry = PromptRegistry::load(&overrides(
            "semantic_dedup",
            "attribute",
            "Values of {relation} for {head}: {candidates} ({head_context})",
        ))
        .unwrap();
        assert_eq!(
            registry.template(PromptKind::TailAttribute),
            "Values of {relation} for {head}: {candidates} ({head_context})"
        );
    }

    #[test]
    fn override_with_unknown_placeholder_is_a_config_error() {
        let err = PromptRegistry::load(&overrides("semantic_dedup", "general", "{head} {taxonomy}"))
            .unwrap_err();
        assert!(matches!(err, DedupError::Config(msg) if msg.contains("taxonomy")));
    }

    #[test]
    fn unknown_prompt_family_is_rejected() {
        let err = PromptRegistry::load(&overrides("extraction", "general", "x")).unwrap_err();
        assert!(matches!(err, DedupError::Config(_)));
    }
}
