//! Tagging engine: ordered keyword/regex rules that classify clients.
//!
//! Rules run in list order against the inbound message text. Each matching
//! rule contributes its tag; the result is always the union of the client's
//! existing tags and the triggered ones, so tags only ever accumulate:
//! - keyword rules match a case-insensitive substring
//! - pattern rules match a case-insensitive regex

use std::collections::BTreeSet;

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use tracing::debug;

use crate::error::ConfigError;
use crate::store::normalize_tag;

/// Serialized form of one rule, as read from configuration.
///
/// Exactly one of `keywords` or `pattern` must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct TagRuleSpec {
    pub tag: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub pattern: Option<String>,
}

/// What a rule matches on.
#[derive(Debug, Clone)]
pub enum TagMatcher {
    /// Lowercased keywords; any one appearing as a substring triggers the rule.
    Keywords(Vec<String>),
    /// Compiled, case-insensitive regex.
    Pattern(Regex),
}

/// A single predicate-to-tag rule.
#[derive(Debug, Clone)]
pub struct TagRule {
    /// Normalized tag applied when the rule matches.
    pub tag: String,
    pub matcher: TagMatcher,
}

impl TagRule {
    pub fn keywords(tag: &str, keywords: &[&str]) -> Result<Self, ConfigError> {
        let tag = rule_tag(tag)?;
        let keywords: Vec<String> = keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        if keywords.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: format!("tag rule '{tag}'"),
                message: "keyword rule needs at least one keyword".into(),
            });
        }
        Ok(Self {
            tag,
            matcher: TagMatcher::Keywords(keywords),
        })
    }

    pub fn pattern(tag: &str, pattern: &str) -> Result<Self, ConfigError> {
        let tag = rule_tag(tag)?;
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: format!("tag rule '{tag}'"),
                message: format!("invalid pattern: {e}"),
            })?;
        Ok(Self {
            tag,
            matcher: TagMatcher::Pattern(regex),
        })
    }

    /// Whether the rule fires for this message text.
    pub fn matches(&self, text: &str) -> bool {
        match &self.matcher {
            TagMatcher::Keywords(keywords) => {
                let lowered = text.to_lowercase();
                keywords.iter().any(|k| lowered.contains(k.as_str()))
            }
            TagMatcher::Pattern(regex) => regex.is_match(text),
        }
    }
}

fn rule_tag(tag: &str) -> Result<String, ConfigError> {
    normalize_tag(tag).ok_or_else(|| ConfigError::InvalidValue {
        key: "tag rule".into(),
        message: "tag must not be blank".into(),
    })
}

/// Ordered rule list.
#[derive(Debug, Clone, Default)]
pub struct TagRules {
    rules: Vec<TagRule>,
}

impl TagRules {
    /// Built-in rules used when no rule set is configured.
    pub fn default_rules() -> Self {
        let rules = vec![
            TagRule {
                tag: "pricing-interest".into(),
                matcher: TagMatcher::Keywords(
                    ["price", "pricing", "quote", "cost", "precio", "cotización"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                ),
            },
            TagRule {
                tag: "urgent".into(),
                matcher: TagMatcher::Pattern(
                    Regex::new(r"(?i)\b(urgent|asap|emergency|urgente)\b")
                        .expect("built-in pattern is valid"),
                ),
            },
            TagRule {
                tag: "support".into(),
                matcher: TagMatcher::Pattern(
                    Regex::new(r"(?i)\b(not working|broken|problem|issue|help|ayuda)\b")
                        .expect("built-in pattern is valid"),
                ),
            },
        ];
        Self { rules }
    }

    /// No rules at all (for testing).
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn new(rules: Vec<TagRule>) -> Self {
        Self { rules }
    }

    /// Compile rules from their serialized form, preserving order.
    pub fn from_specs(specs: Vec<TagRuleSpec>) -> Result<Self, ConfigError> {
        let mut rules = Vec::with_capacity(specs.len());
        for spec in specs {
            let rule = match (&spec.pattern, spec.keywords.is_empty()) {
                (Some(_), false) => {
                    return Err(ConfigError::InvalidValue {
                        key: format!("tag rule '{}'", spec.tag),
                        message: "set either keywords or pattern, not both".into(),
                    });
                }
                (Some(pattern), true) => TagRule::pattern(&spec.tag, pattern)?,
                (None, _) => {
                    let keywords: Vec<&str> = spec.keywords.iter().map(String::as_str).collect();
                    TagRule::keywords(&spec.tag, &keywords)?
                }
            };
            rules.push(rule);
        }
        Ok(Self { rules })
    }

    /// Parse a JSON array of rule specs.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let specs: Vec<TagRuleSpec> = serde_json::from_str(json)
            .map_err(|e| ConfigError::ParseError(format!("tag rules: {e}")))?;
        Self::from_specs(specs)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Tags of every rule that fires, in rule order, without repeats.
    pub fn matching_tags(&self, text: &str) -> Vec<String> {
        let mut tags: Vec<String> = Vec::new();
        for rule in &self.rules {
            if rule.matches(text) && !tags.contains(&rule.tag) {
                debug!(tag = %rule.tag, "Message matched tag rule");
                tags.push(rule.tag.clone());
            }
        }
        tags
    }
}

/// Union of `existing` and every tag triggered by `text`.
///
/// Pure: identical arguments always give identical results, and no tag in
/// `existing` is ever dropped.
pub fn evaluate(existing: &BTreeSet<String>, text: &str, rules: &TagRules) -> BTreeSet<String> {
    let mut tags: BTreeSet<String> = existing.iter().filter_map(|t| normalize_tag(t)).collect();
    tags.extend(rules.matching_tags(text));
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    fn price_rules() -> TagRules {
        TagRules::new(vec![TagRule::keywords("pricing-interest", &["price"]).unwrap()])
    }

    #[test]
    fn keyword_rule_tags_message() {
        let tags = evaluate(&BTreeSet::new(), "hi, price list?", &price_rules());
        assert_eq!(tags, set(&["pricing-interest"]));
    }

    #[test]
    fn keyword_match_is_case_insensitive() {
        let tags = evaluate(&BTreeSet::new(), "What's the PRICE?", &price_rules());
        assert!(tags.contains("pricing-interest"));
    }

    #[test]
    fn existing_tags_are_never_removed() {
        let existing = set(&["vip"]);
        let tags = evaluate(&existing, "nothing relevant here", &price_rules());
        assert_eq!(tags, existing);
    }

    #[test]
    fn existing_tag_is_not_duplicated() {
        let existing = set(&["pricing-interest"]);
        let tags = evaluate(&existing, "price again", &price_rules());
        assert_eq!(tags, existing);
    }

    #[test]
    fn existing_tags_are_normalized() {
        let tags = evaluate(&set(&[" VIP "]), "", &TagRules::empty());
        assert_eq!(tags, set(&["vip"]));
    }

    #[test]
    fn evaluation_is_deterministic() {
        let rules = TagRules::default_rules();
        let existing = set(&["vip"]);
        let text = "urgent: what's the price? it's not working";
        assert_eq!(
            evaluate(&existing, text, &rules),
            evaluate(&existing, text, &rules)
        );
    }

    #[test]
    fn multiple_rules_fire_in_order() {
        let rules = TagRules::default_rules();
        let matched = rules.matching_tags("URGENT: need a quote asap");
        assert_eq!(matched, vec!["pricing-interest", "urgent"]);
    }

    #[test]
    fn pattern_rule_respects_word_boundaries() {
        let rules = TagRules::new(vec![TagRule::pattern("urgent", r"\basap\b").unwrap()]);
        assert_eq!(rules.matching_tags("please ASAP"), vec!["urgent"]);
        assert!(rules.matching_tags("wasapp").is_empty());
    }

    #[test]
    fn empty_rules_pass_everything_through() {
        let rules = TagRules::empty();
        assert!(rules.is_empty());
        assert!(rules.matching_tags("price urgent").is_empty());
    }

    #[test]
    fn rules_from_json() {
        let rules = TagRules::from_json(
            r#"[
                {"tag": "Pricing-Interest", "keywords": ["price", "quote"]},
                {"tag": "urgent", "pattern": "\\basap\\b"}
            ]"#,
        )
        .unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(
            rules.matching_tags("quote asap please"),
            vec!["pricing-interest", "urgent"]
        );
    }

    #[test]
    fn invalid_pattern_is_config_error() {
        let err = TagRules::from_json(r#"[{"tag": "x", "pattern": "(unclosed"}]"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn rule_needs_keywords_or_pattern() {
        assert!(TagRules::from_json(r#"[{"tag": "x"}]"#).is_err());
        assert!(
            TagRules::from_json(r#"[{"tag": "x", "keywords": ["a"], "pattern": "b"}]"#).is_err()
        );
        assert!(TagRules::from_json(r#"[{"tag": " ", "keywords": ["a"]}]"#).is_err());
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let err = TagRules::from_json("not json").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }
}
