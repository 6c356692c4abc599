//! Statistics reporter (C8, §4.6). Aggregates job counts by state for
//! operators and the leaderboard view (§6 egress to observers). Counting
//! tolerates missing enum values — e.g. mid-migration, or simply a state
//! with zero jobs in it — by rolling the count back to 0 rather than
//! propagating an error, per the spec's stated tolerance.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use meridian_protocol::job::JobState;

use crate::error::Result;
use crate::roster::Roster;
use crate::store::JobStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub by_state: BTreeMap<&'static str, i64>,
    pub total: i64,
}

pub struct StatsReporter {
    store: Arc<dyn JobStore>,
    roster: Roster,
}

impl StatsReporter {
    pub fn new(store: Arc<dyn JobStore>, roster: Roster) -> Self {
        Self { store, roster }
    }

    /// `GetStatistics` (§6 egress to observers): counts-by-state plus
    /// totals, with every known state present even if zero.
    pub async fn job_counts(&self) -> Result<JobCounts> {
        let rows = self.store.count_by_state().await?;

        let mut by_state: BTreeMap<&'static str, i64> =
            JobState::ALL.iter().map(|s| (s.as_str(), 0)).collect();
        for (state, count) in rows {
            by_state.insert(state.as_str(), count);
        }

        let total = by_state.values().sum();
        Ok(JobCounts { by_state, total })
    }

    /// `GetLeaderboard` (§6 egress to observers), per-worker aggregate
    /// scores sorted by `performance_score` descending then `stake`
    /// descending (decided in SPEC_FULL §4.6, the one detail the
    /// distillation left unstated).
    pub async fn leaderboard(&self, limit: u32) -> Result<Vec<meridian_protocol::Worker>> {
        self.roster.leaderboard(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_counts_include_every_known_state_even_at_zero() {
        let counts: BTreeMap<&'static str, i64> =
            JobState::ALL.iter().map(|s| (s.as_str(), 0)).collect();
        assert_eq!(counts.len(), JobState::ALL.len());
        assert_eq!(counts.get("cancelled"), Some(&0));
    }
}
