//! Hosting plans and their quota limits.

use serde::{Deserialize, Serialize};

/// Subscription plan of an owner.
///
/// The plan fixes the resource envelope for every bot the owner hosts:
/// how many bots may exist, how much total hosting time a single bot's
/// ledger can hold, and the power ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Pro,
    Ultra,
}

/// Quota limits fixed by a plan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanLimits {
    /// Maximum number of bots the owner may create.
    pub max_bots: u32,
    /// Cap on a bot's `total_seconds` ledger.
    pub max_total_seconds: i64,
    /// Power ceiling, percent.
    pub max_power: f64,
}

impl Plan {
    /// Quota limits for this plan.
    pub fn limits(&self) -> PlanLimits {
        match self {
            Plan::Free => PlanLimits {
                max_bots: 3,
                max_total_seconds: 86_400, // 1 day
                max_power: 30.0,
            },
            Plan::Pro => PlanLimits {
                max_bots: 10,
                max_total_seconds: 604_800, // 7 days
                max_power: 60.0,
            },
            Plan::Ultra => PlanLimits {
                max_bots: 100,
                max_total_seconds: 1_000_000_000_000, // effectively unlimited
                max_power: 100.0,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
            Plan::Ultra => "ultra",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "free" => Some(Plan::Free),
            "pro" => Some(Plan::Pro),
            "ultra" => Some(Plan::Ultra),
            _ => None,
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
