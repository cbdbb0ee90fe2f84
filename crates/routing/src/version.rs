//! Capability version constraints.
//!
//! Supported forms: `*` (anything), `=1.2` / `==1.2`, `>=`, `>`, `<=`, `<`,
//! `^1.2` (same major, or same minor below 1.0), `~1.2` (same minor), a bare
//! version meaning exact match, and comma-separated conjunctions such as
//! `>=3.10, <4`. Versions compare as dotted numbers with missing components
//! treated as zero, so `3.10 == 3.10.0`. Non-numeric values can only be
//! matched exactly.

use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use std::sync::LazyLock;

static SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(>=|<=|==|=|>|<|\^|~)?\s*v?([0-9A-Za-z][0-9A-Za-z.+_-]*)$")
        .expect("constraint segment pattern is valid")
});

/// A constraint that failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    /// Empty segment, e.g. a trailing comma
    #[error("empty constraint segment in {0:?}")]
    Empty(String),

    /// Unrecognised syntax
    #[error("malformed constraint {constraint:?}: {reason}")]
    Malformed {
        /// Offending constraint
        constraint: String,
        /// What is wrong with it
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
    Caret,
    Tilde,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Predicate {
    op: Op,
    raw: String,
    parts: Option<Vec<u64>>,
}

impl Predicate {
    fn matches(&self, available: &str) -> bool {
        let available = available.trim().trim_start_matches('v');
        let Some(want) = &self.parts else {
            // Only exact matching makes sense for non-numeric values.
            return self.op == Op::Eq && available.eq_ignore_ascii_case(&self.raw);
        };
        let Some(have) = parse_numeric(available) else {
            return false;
        };

        let ord = compare(&have, want);
        match self.op {
            Op::Eq => ord == Ordering::Equal,
            Op::Gt => ord == Ordering::Greater,
            Op::Ge => ord != Ordering::Less,
            Op::Lt => ord == Ordering::Less,
            Op::Le => ord != Ordering::Greater,
            Op::Caret => ord != Ordering::Less && compare(&have, &caret_ceiling(want)) == Ordering::Less,
            Op::Tilde => ord != Ordering::Less && compare(&have, &tilde_ceiling(want)) == Ordering::Less,
        }
    }
}

/// A parsed version constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    raw: String,
    predicates: Vec<Predicate>,
}

impl VersionConstraint {
    /// The constraint that matches every version.
    pub fn any() -> Self {
        Self {
            raw: "*".to_string(),
            predicates: Vec::new(),
        }
    }

    /// Parse a constraint string.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed == "*" {
            return Ok(Self::any());
        }

        let mut predicates = Vec::new();
        for segment in trimmed.split(',').map(str::trim) {
            if segment.is_empty() {
                return Err(VersionError::Empty(input.to_string()));
            }
            if segment == "*" {
                continue;
            }
            let caps = SEGMENT.captures(segment).ok_or_else(|| VersionError::Malformed {
                constraint: input.to_string(),
                reason: format!("cannot parse {:?}", segment),
            })?;

            let op = match caps.get(1).map(|m| m.as_str()) {
                None | Some("=") | Some("==") => Op::Eq,
                Some(">") => Op::Gt,
                Some(">=") => Op::Ge,
                Some("<") => Op::Lt,
                Some("<=") => Op::Le,
                Some("^") => Op::Caret,
                Some("~") => Op::Tilde,
                Some(other) => {
                    return Err(VersionError::Malformed {
                        constraint: input.to_string(),
                        reason: format!("unknown operator {:?}", other),
                    })
                }
            };
            let raw = caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default();
            let parts = parse_numeric(&raw);
            if parts.is_none() && op != Op::Eq {
                return Err(VersionError::Malformed {
                    constraint: input.to_string(),
                    reason: format!("{:?} is not a numeric version", raw),
                });
            }
            predicates.push(Predicate { op, raw, parts });
        }

        Ok(Self {
            raw: trimmed.to_string(),
            predicates,
        })
    }

    /// Whether `available` satisfies every part of the constraint.
    pub fn matches(&self, available: &str) -> bool {
        self.predicates.iter().all(|p| p.matches(available))
    }

    /// True for `*`.
    pub fn is_any(&self) -> bool {
        self.predicates.is_empty()
    }

    /// The constraint as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for VersionConstraint {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_numeric(s: &str) -> Option<Vec<u64>> {
    if s.is_empty() {
        return None;
    }
    s.split('.').map(|p| p.parse::<u64>().ok()).collect()
}

/// Dotted comparison, padding the shorter side with zeros.
fn compare(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

fn caret_ceiling(v: &[u64]) -> Vec<u64> {
    let major = v.first().copied().unwrap_or(0);
    if major > 0 || v.len() < 2 {
        vec![major + 1]
    } else {
        vec![0, v[1] + 1]
    }
}

fn tilde_ceiling(v: &[u64]) -> Vec<u64> {
    match v {
        [major] => vec![major + 1],
        [major, minor, ..] => vec![*major, minor + 1],
        [] => vec![1],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(s: &str) -> VersionConstraint {
        VersionConstraint::parse(s).unwrap()
    }

    #[test]
    fn test_comparison_operators() {
        assert!(c(">=3.10").matches("3.11"));
        assert!(c(">=3.10").matches("3.10.0"));
        assert!(!c(">=3.10").matches("3.9"));
        assert!(c(">3.10").matches("3.10.1"));
        assert!(!c(">3.10").matches("3.10"));
        assert!(c("<4").matches("3.99"));
        assert!(c("<=2.0").matches("2"));
    }

    #[test]
    fn test_numeric_not_lexicographic() {
        // "3.9" sorts after "3.10" as a string
        assert!(!c(">=3.10").matches("3.9"));
        assert!(c("<3.10").matches("3.9"));
    }

    #[test]
    fn test_exact_and_any() {
        assert!(c("3.10").matches("3.10.0"));
        assert!(c("==1.2.3").matches("v1.2.3"));
        assert!(!c("=1.2.3").matches("1.2.4"));
        assert!(c("*").matches("anything"));
        assert!(c("").is_any());
        assert!(c("stable").matches("STABLE"));
        assert!(!c("stable").matches("nightly"));
    }

    #[test]
    fn test_caret_and_tilde() {
        assert!(c("^1.2").matches("1.9"));
        assert!(!c("^1.2").matches("2.0"));
        assert!(!c("^1.2").matches("1.1"));
        assert!(c("^0.3").matches("0.3.7"));
        assert!(!c("^0.3").matches("0.4"));
        assert!(c("~1.2").matches("1.2.9"));
        assert!(!c("~1.2").matches("1.3"));
        assert!(c("~1").matches("1.7"));
    }

    #[test]
    fn test_conjunction() {
        let range = c(">=3.10, <4");
        assert!(range.matches("3.12"));
        assert!(!range.matches("4.0"));
        assert!(!range.matches("3.9"));
        assert_eq!(range.to_string(), ">=3.10, <4");
    }

    #[test]
    fn test_non_numeric_available_fails_ordering() {
        assert!(!c(">=1").matches("latest"));
    }

    #[test]
    fn test_malformed_constraints() {
        assert!(matches!(VersionConstraint::parse(">=3.10,"), Err(VersionError::Empty(_))));
        assert!(matches!(VersionConstraint::parse(">=abc"), Err(VersionError::Malformed { .. })));
        assert!(matches!(VersionConstraint::parse("!=1"), Err(VersionError::Malformed { .. })));
    }
}
