//! Frequency classes and their staleness budgets

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Natural publication cadence of a dataset.
///
/// Variants are ordered from the fastest cadence to the slowest, and that
/// ordering is relied upon by [`SlaTable`] validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrequencyClass {
    Realtime,
    Intraday,
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Annual,
}

impl FrequencyClass {
    pub const ALL: [FrequencyClass; 7] = [
        FrequencyClass::Realtime,
        FrequencyClass::Intraday,
        FrequencyClass::Daily,
        FrequencyClass::Weekly,
        FrequencyClass::Monthly,
        FrequencyClass::Quarterly,
        FrequencyClass::Annual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Realtime => "realtime",
            Self::Intraday => "intraday",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Annual => "annual",
        }
    }

    /// Built-in staleness budget for this class
    pub fn default_sla(&self) -> Duration {
        const MINUTE: u64 = 60;
        const HOUR: u64 = 60 * MINUTE;
        let secs = match self {
            Self::Realtime => MINUTE,
            Self::Intraday => 15 * MINUTE,
            Self::Daily => 6 * HOUR,
            Self::Weekly => 24 * HOUR,
            Self::Monthly => 24 * HOUR,
            Self::Quarterly => 24 * HOUR,
            Self::Annual => 7 * 24 * HOUR,
        };
        Duration::from_secs(secs)
    }
}

impl fmt::Display for FrequencyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FrequencyClass {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        FrequencyClass::ALL
            .iter()
            .copied()
            .find(|class| class.as_str() == lower)
            .ok_or_else(|| SyncError::Config(format!("unknown frequency class '{}'", s)))
    }
}

/// Staleness budget per frequency class.
///
/// Construction guarantees that budgets never decrease from realtime to annual.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaTable {
    budgets: BTreeMap<FrequencyClass, Duration>,
}

impl SlaTable {
    /// Build a table from the defaults with the given overrides applied
    pub fn with_overrides(overrides: &BTreeMap<FrequencyClass, Duration>) -> Result<Self> {
        let mut budgets: BTreeMap<FrequencyClass, Duration> = FrequencyClass::ALL
            .iter()
            .map(|class| (*class, class.default_sla()))
            .collect();
        budgets.extend(overrides.iter().map(|(k, v)| (*k, *v)));

        let mut previous: Option<(FrequencyClass, Duration)> = None;
        for (class, budget) in &budgets {
            if let Some((prev_class, prev_budget)) = previous {
                if *budget < prev_budget {
                    return Err(SyncError::Config(format!(
                        "SLA for {} ({}s) is shorter than SLA for {} ({}s)",
                        class,
                        budget.as_secs(),
                        prev_class,
                        prev_budget.as_secs()
                    )));
                }
            }
            previous = Some((*class, *budget));
        }

        Ok(Self { budgets })
    }

    pub fn sla(&self, class: FrequencyClass) -> Duration {
        self.budgets
            .get(&class)
            .copied()
            .unwrap_or_else(|| class.default_sla())
    }
}

impl Default for SlaTable {
    fn default() -> Self {
        Self {
            budgets: FrequencyClass::ALL
                .iter()
                .map(|class| (*class, class.default_sla()))
                .collect(),
        }
    }
}
