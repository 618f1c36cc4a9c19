//! Built-in prompt templates. Every template can be replaced from the
//! `[prompts.<family>]` tables of the config file.
//!
//! Placeholders are `{name}`; literal braces in JSON examples are doubled.

pub const SYSTEM_PREAMBLE: &str = "You are a meticulous knowledge-graph curator. \
You decide whether different expressions refer to the same real-world referent. \
Answer with a single JSON object and nothing else.";

pub const STRICT_SYSTEM_PREAMBLE: &str = "You are a meticulous knowledge-graph curator. \
Your previous answer could not be used. Respond with ONLY one valid JSON object that \
matches the requested schema exactly: no markdown fences, no comments, no prose, \
no trailing commas. Every candidate index must appear in exactly one group and each \
representative must be one of its group's members.";

const IDENTITY_RULES: &str = "REFERENTIAL-IDENTITY PRINCIPLE\n\
Two candidates belong to the same group ONLY if they denote the exact same real-world entity, \
value or concept. Apply the substitution test: replacing one with the other must preserve the \
meaning of EVERY statement in which either appears.\n\
\n\
It is FORBIDDEN to merge candidates because they:\n\
- share the same relation to the head;\n\
- are semantically similar or related;\n\
- belong to the same category or type;\n\
- co-occur in the same text;\n\
- have a functional relationship (cause/effect, tool/purpose, part/whole);\n\
- share properties or attributes;\n\
- are members of the same set or list.\n\
Many relations are multi-valued: several distinct tails are expected and must stay separate.\n\
When in doubt, keep candidates in separate groups.";

pub const TAIL_GENERAL: &str = "Head entity: {head}\n\
Relation: {relation}\n\
\n\
Head context:\n\
{head_context}\n\
\n\
Candidate tails:\n\
{candidates}\n\
\n\
Decide which candidate tails refer to the same entity.\n\
\n\
{IDENTITY_RULES}\n\
\n\
Return JSON with this exact schema:\n\
{{\"groups\": [{{\"members\": [1, 2], \"representative\": 1, \"rationale\": \"why these are the same referent\"}}]}}\n\
- members and representative use the 1-based candidate indices shown above;\n\
- every candidate index must appear in exactly one group (use singleton groups);\n\
- the representative must be one of the group's members and should be the most complete, canonical name.";

pub const TAIL_ATTRIBUTE: &str = "Head entity: {head}\n\
Attribute relation: {relation}\n\
\n\
Head context:\n\
{head_context}\n\
\n\
Candidate attribute values:\n\
{candidates}\n\
\n\
Decide which attribute values express exactly the same value (same quantity, unit and \
qualifier, possibly written differently). Values that differ in magnitude, unit, range, \
condition or scope are different values.\n\
\n\
{IDENTITY_RULES}\n\
\n\
Return JSON with this exact schema:\n\
{{\"groups\": [{{\"members\": [1, 2], \"representative\": 1, \"rationale\": \"why these are the same value\"}}]}}\n\
- members and representative use the 1-based candidate indices shown above;\n\
- every candidate index must appear in exactly one group (use singleton groups);\n\
- the representative must be one of the group's members.";

pub const KEYWORD_GENERAL: &str = "Community: {head}\n\
\n\
Community context:\n\
{head_context}\n\
\n\
Candidate keywords / entities from this community:\n\
{candidates}\n\
\n\
Decide which candidates are different names for the same entity (synonyms, abbreviations, \
spelling or translation variants).\n\
\n\
{IDENTITY_RULES}\n\
\n\
Return JSON with this exact schema:\n\
{{\"groups\": [{{\"members\": [1, 2], \"representative\": 1, \"rationale\": \"why these are the same referent\"}}]}}\n\
- every candidate index must appear in exactly one group (use singleton groups);\n\
- the representative must be one of the group's members.";

pub const HEAD_GENERAL: &str = "Scope: {head}\n\
\n\
Context:\n\
{head_context}\n\
\n\
Candidate entities (with descriptions and graph neighbourhood):\n\
{candidates}\n\
\n\
These entities were flagged as possible duplicates by name similarity, graph structure, \
explicit alias relations or shared attributes. Decide which ones are the same real-world entity.\n\
\n\
{IDENTITY_RULES}\n\
\n\
Return JSON with this exact schema:\n\
{{\"groups\": [{{\"members\": [1, 2], \"representative\": 1, \"rationale\": \"why these are the same referent\"}}]}}\n\
- every candidate index must appear in exactly one group (use singleton groups);\n\
- the representative must be one of the group's members.";

pub const CLUSTERING_GENERAL: &str = "Head entity: {head}\n\
Relation: {relation}\n\
\n\
Candidates:\n\
{candidates}\n\
\n\
Partition the candidates into tentative clusters of expressions that MIGHT refer to the same \
entity. A later, stricter step will refine each cluster, so over-cluster rather than \
under-cluster: put candidates together whenever they could plausibly be coreferent.\n\
\n\
Return JSON with this exact schema:\n\
{{\"clusters\": [{{\"members\": [1, 3], \"description\": \"one sentence describing the shared identity hypothesis\"}}]}}\n\
- members use the 1-based candidate indices shown above;\n\
- every candidate index must appear in exactly one cluster.";

pub const VALIDATION_GENERAL: &str = "Candidates:\n\
{candidates}\n\
\n\
Proposed groups:\n\
{groups}\n\
\n\
Check every group for inconsistencies between its rationale and its members. Typical \
problems: a rationale says a candidate should be merged with another candidate that is NOT \
in the group; a rationale says members are different but they were grouped together.\n\
Do not rewrite the groups. Only report problems.\n\
\n\
Return JSON with this exact schema:\n\
{{\"has_inconsistencies\": true, \"inconsistencies\": [{{\"group_id\": 2, \"issue\": \"rationale says merge with [1]\", \"action\": \"merge\", \"target_groups\": [1]}}]}}\n\
- group ids are the 1-based group numbers shown above;\n\
- action is \"merge\" (combine group_id with target_groups) or \"split\";\n\
- return {{\"has_inconsistencies\": false, \"inconsistencies\": []}} when everything is consistent.";

/// Expand the shared identity rules into a template body. The rules are
/// spliced in before placeholder validation so overrides can reuse them.
pub fn with_identity_rules(template: &str) -> String {
    template.replace("{IDENTITY_RULES}", IDENTITY_RULES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::validate_template;

    const TAIL_VARS: &[&str] = &["head", "relation", "candidates", "head_context"];

    #[test]
    fn builtin_templates_only_use_known_placeholders() {
        for template in [TAIL_GENERAL, TAIL_ATTRIBUTE, KEYWORD_GENERAL, HEAD_GENERAL] {
            validate_template(&with_identity_rules(template), TAIL_VARS).unwrap();
        }
        validate_template(CLUSTERING_GENERAL, &["head", "relation", "candidates"]).unwrap();
        validate_template(VALIDATION_GENERAL, &["groups", "candidates"]).unwrap();
        validate_template(SYSTEM_PREAMBLE, &[]).unwrap();
        validate_template(STRICT_SYSTEM_PREAMBLE, &[]).unwrap();
    }

    #[test]
    fn identity_rules_list_prohibited_merge_reasons() {
        let body = with_identity_rules(TAIL_GENERAL);
        assert!(body.contains("substitution test"));
        assert!(body.contains("co-occur"));
        assert!(!body.contains("{IDENTITY_RULES}"));
    }
}
