//! Risk classification and execution modes.
//!
//! Risk is plain data attached to work; whether a given risk may be retried
//! automatically is decided by whoever holds an [`ExecutionMode`], never by
//! the work item itself.

use serde::{Deserialize, Serialize};

/// How risky it is to run a unit of work without a human in the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Read-only or easily repeatable
    Low,
    /// Produces artifacts but does not touch shared state
    Medium,
    /// Mutates shared state
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

/// Degree of autonomy granted to automatic recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Only low-risk work is retried without review
    #[default]
    FullAuto,
    /// Low and medium risk work is retried without review
    SemiAuto,
    /// Nothing is retried automatically
    Manual,
}

impl ExecutionMode {
    /// Whether work of `risk` may be retried without a human.
    pub fn permits(self, risk: RiskLevel) -> bool {
        match self {
            ExecutionMode::FullAuto => risk == RiskLevel::Low,
            ExecutionMode::SemiAuto => risk <= RiskLevel::Medium,
            ExecutionMode::Manual => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_auto_only_permits_low_risk() {
        assert!(ExecutionMode::FullAuto.permits(RiskLevel::Low));
        assert!(!ExecutionMode::FullAuto.permits(RiskLevel::Medium));
        assert!(!ExecutionMode::FullAuto.permits(RiskLevel::High));
    }

    #[test]
    fn test_semi_auto_and_manual() {
        assert!(ExecutionMode::SemiAuto.permits(RiskLevel::Medium));
        assert!(!ExecutionMode::SemiAuto.permits(RiskLevel::High));
        assert!(!ExecutionMode::Manual.permits(RiskLevel::Low));
    }
}
