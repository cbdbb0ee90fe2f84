//! Candidate scoring.
//!
//! Every mandatory requirement is a hard filter. An instance that passes all
//! of them gets a weighted sum over five dimensions, each normalized to
//! `[0, 1]` before weighting:
//!
//! | dimension | value |
//! |---|---|
//! | required capability | 1 per satisfied requirement |
//! | preferred capability | 1 per satisfied preference |
//! | cost | `1 / (1 + estimated cost)` |
//! | latency | `1000 / (1000 + latency_ms)` |
//! | load | free slots / capacity |

use crate::profile::InstanceProfile;
use crate::requirements::TaskRequirements;
use orca_core::config::ScoringWeights;
use orca_core::{ScoreBreakdown, ScoreContribution, ScoreDimension};

/// Result of scoring one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum ScoreOutcome {
    /// All mandatory requirements met
    Eligible(ScoreBreakdown),
    /// At least one mandatory requirement unmet; every reason is listed
    Ineligible(Vec<String>),
}

/// Weighted multi-dimension scorer.
#[derive(Debug, Clone, Default)]
pub struct RouteScorer {
    weights: ScoringWeights,
}

impl RouteScorer {
    /// Create a scorer with the given weights.
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    /// The weights in use.
    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Score `profile` against `reqs`.
    pub fn score(&self, reqs: &TaskRequirements, profile: &InstanceProfile) -> ScoreOutcome {
        let rejections = self.rejections(reqs, profile);
        if !rejections.is_empty() {
            return ScoreOutcome::Ineligible(rejections);
        }

        let w = &self.weights;
        let mut breakdown = ScoreBreakdown::default();

        for req in &reqs.required {
            let have = profile.capability(&req.name).unwrap_or_default();
            breakdown.push(term(
                ScoreDimension::RequiredCapability,
                &req.name,
                w.required,
                1.0,
                format!("{} satisfies {}", have, req.constraint),
            ));
        }

        for pref in &reqs.preferred {
            let Some(have) = profile.capability(&pref.name) else {
                continue;
            };
            if pref.constraint.matches(have) {
                breakdown.push(term(
                    ScoreDimension::PreferredCapability,
                    &pref.name,
                    w.preferred,
                    1.0,
                    format!("{} satisfies {}", have, pref.constraint),
                ));
            }
        }

        let cost = profile.estimated_cost(reqs.estimated_tokens);
        breakdown.push(term(
            ScoreDimension::Cost,
            "cost",
            w.cost,
            1.0 / (1.0 + cost),
            format!("estimated {:.4} for {} tokens", cost, reqs.estimated_tokens),
        ));

        breakdown.push(term(
            ScoreDimension::Latency,
            "latency",
            w.latency,
            1000.0 / (1000.0 + profile.avg_latency_ms as f64),
            format!("{}ms average", profile.avg_latency_ms),
        ));

        breakdown.push(term(
            ScoreDimension::Load,
            "load",
            w.load,
            1.0 - profile.load_ratio(),
            format!("{}/{} slots free", profile.free_slots, profile.capacity),
        ));

        ScoreOutcome::Eligible(breakdown)
    }

    fn rejections(&self, reqs: &TaskRequirements, profile: &InstanceProfile) -> Vec<String> {
        let mut reasons = Vec::new();

        if !profile.healthy {
            reasons.push("instance is unhealthy".to_string());
        }

        for req in &reqs.required {
            match profile.capability(&req.name) {
                None => reasons.push(format!("missing required capability {}", req.name)),
                Some(have) if !req.constraint.matches(have) => reasons.push(format!(
                    "{} {} does not satisfy {}",
                    req.name, have, req.constraint
                )),
                Some(_) => {}
            }
        }

        if let Some(limit) = profile.max_context_tokens {
            if reqs.estimated_tokens > limit {
                reasons.push(format!(
                    "task needs {} tokens, context window is {}",
                    reqs.estimated_tokens, limit
                ));
            }
        }

        if let Some(max_cost) = reqs.max_cost {
            let cost = profile.estimated_cost(reqs.estimated_tokens);
            if cost > max_cost {
                reasons.push(format!("estimated cost {:.4} exceeds ceiling {:.4}", cost, max_cost));
            }
        }

        if let Some(max_latency) = reqs.max_latency_ms {
            if profile.avg_latency_ms > max_latency {
                reasons.push(format!(
                    "latency {}ms exceeds ceiling {}ms",
                    profile.avg_latency_ms, max_latency
                ));
            }
        }

        if profile.free_slots == 0 {
            reasons.push(format!("no free capacity ({} slots in use)", profile.capacity));
        }

        reasons
    }
}

fn term(dimension: ScoreDimension, key: &str, weight: f64, value: f64, detail: String) -> ScoreContribution {
    ScoreContribution {
        dimension,
        key: key.to_string(),
        weight,
        value,
        contribution: weight * value,
        detail,
    }
}
