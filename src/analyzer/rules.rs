use crate::config::types::{Location, Result, RiskCategory, RiskFinding, ScriptboxError, Severity};
use regex::Regex;

/// Static rule definition: id, category, severity, pattern, description.
///
/// Patterns run over masked source. A named group `at` moves the reported
/// position from the match start to that group.
pub(crate) type RuleSpec = (&'static str, RiskCategory, Severity, &'static str, &'static str);

pub(crate) struct Rule {
    pub id: &'static str,
    pub category: RiskCategory,
    pub severity: Severity,
    pub description: &'static str,
    pub regex: Regex,
}

pub(crate) fn pattern(source: &str) -> Result<Regex> {
    Regex::new(source)
        .map_err(|e| ScriptboxError::Config(format!("invalid analyzer pattern {source:?}: {e}")))
}

pub(crate) fn compile(specs: &[RuleSpec]) -> Result<Vec<Rule>> {
    specs
        .iter()
        .map(|(id, category, severity, pattern, description)| {
            let regex = Regex::new(pattern).map_err(|e| {
                ScriptboxError::Config(format!("rule {id} has an invalid pattern: {e}"))
            })?;
            Ok(Rule {
                id,
                category: *category,
                severity: *severity,
                description,
                regex,
            })
        })
        .collect()
}

/// A finding before it is positioned. `order` breaks ties at the same offset.
#[derive(Debug, Clone)]
pub(crate) struct Hit {
    pub offset: usize,
    pub order: usize,
    pub rule_id: &'static str,
    pub category: RiskCategory,
    pub severity: Severity,
    pub description: String,
}

impl Hit {
    pub fn from_rule(rule: &Rule, order: usize, offset: usize) -> Self {
        Self {
            offset,
            order,
            rule_id: rule.id,
            category: rule.category,
            severity: rule.severity,
            description: rule.description.to_string(),
        }
    }

    pub fn parse_failure(offset: usize, description: impl Into<String>) -> Self {
        Self {
            offset,
            order: 0,
            rule_id: "parse-failure",
            category: RiskCategory::ParseFailure,
            severity: Severity::Medium,
            description: description.into(),
        }
    }

    pub fn into_finding(self, locate: impl Fn(usize) -> Location) -> RiskFinding {
        RiskFinding {
            rule_id: self.rule_id.to_string(),
            category: self.category,
            severity: self.severity,
            location: locate(self.offset),
            description: self.description,
        }
    }
}

/// Run every rule over `text`, offsetting positions by `base`.
/// Rule ordinals start at `first_order`.
pub(crate) fn scan(rules: &[Rule], text: &str, base: usize, first_order: usize, hits: &mut Vec<Hit>) {
    for (index, rule) in rules.iter().enumerate() {
        for caps in rule.regex.captures_iter(text) {
            let start = caps
                .name("at")
                .or_else(|| caps.get(0))
                .map(|m| m.start())
                .unwrap_or(0);
            hits.push(Hit::from_rule(rule, first_order + index, base + start));
        }
    }
}

/// Source order, then rule order; drop exact duplicates of (offset, rule)
pub(crate) fn order_hits(hits: &mut Vec<Hit>) {
    hits.sort_by(|a, b| (a.offset, a.order).cmp(&(b.offset, b.order)));
    hits.dedup_by(|a, b| a.offset == b.offset && a.rule_id == b.rule_id);
}
