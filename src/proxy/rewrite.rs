/// Statement rewriting and read/write classification
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Substring replacement applied to statement text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteRule {
    pub pattern: String,
    pub replacement: String,
    pub enabled: bool,
}

impl RewriteRule {
    pub fn new(pattern: &str, replacement: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
            enabled: true,
        }
    }
}

/// Apply enabled rules in order. Disabled rules are skipped.
pub fn apply_rules<'a>(sql: &'a str, rules: &[RewriteRule]) -> Cow<'a, str> {
    let mut current = Cow::Borrowed(sql);
    for rule in rules.iter().filter(|r| r.enabled && !r.pattern.is_empty()) {
        if current.contains(rule.pattern.as_str()) {
            current = Cow::Owned(current.replace(rule.pattern.as_str(), &rule.replacement));
        }
    }
    current
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Read,
    Write,
}

const READ_PREFIXES: [&str; 3] = ["SELECT", "SHOW", "DESCRIBE"];

/// Statements starting with SELECT, SHOW or DESCRIBE are reads
pub fn classify(sql: &str) -> QueryKind {
    let trimmed = sql.trim();
    let is_read = READ_PREFIXES.iter().any(|prefix| {
        trimmed
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    });

    if is_read {
        QueryKind::Read
    } else {
        QueryKind::Write
    }
}
