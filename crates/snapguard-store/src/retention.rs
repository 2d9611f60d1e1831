//! Retention: decide which snapshots survive a prune cycle.
//!
//! Class membership is derived from creation time (UTC calendar) and the
//! configured counts at prune time; nothing about it is stored.

use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Datelike, IsoWeek, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

const MAX_COUNT: u32 = 3660;

/// How many representatives of each class to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Most recent distinct days to keep one snapshot for.
    pub daily: u32,
    /// Most recent distinct ISO weeks to keep one snapshot for.
    pub weekly: u32,
    /// Most recent distinct calendar months to keep one snapshot for.
    pub monthly: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily: 7,
            weekly: 4,
            monthly: 6,
        }
    }
}

impl RetentionPolicy {
    /// Reject a policy that would keep nothing or is absurdly large.
    pub fn validate(&self) -> StoreResult<()> {
        if self.daily == 0 && self.weekly == 0 && self.monthly == 0 {
            return Err(StoreError::RetentionPolicy(
                "daily, weekly and monthly are all zero; every snapshot would be deleted".to_string(),
            ));
        }
        for (name, count) in [("daily", self.daily), ("weekly", self.weekly), ("monthly", self.monthly)] {
            if count > MAX_COUNT {
                return Err(StoreError::RetentionPolicy(format!(
                    "{name} = {count} exceeds the maximum of {MAX_COUNT}"
                )));
            }
        }
        Ok(())
    }
}

/// Why a snapshot was kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionClass {
    /// Representative of a recent day.
    Daily,
    /// Representative of a recent ISO week.
    Weekly,
    /// Representative of a recent month.
    Monthly,
    /// Explicitly pinned.
    Pinned,
}

/// A snapshot as seen by the retention pass.
#[derive(Debug, Clone)]
pub struct RetentionCandidate {
    /// Snapshot id
    pub id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Pinned snapshots always survive
    pub pinned: bool,
}

/// Outcome of a retention pass.
#[derive(Debug, Clone, Default)]
pub struct RetentionDecision {
    /// Survivors and the classes that selected them.
    pub keep: BTreeMap<String, Vec<RetentionClass>>,
    /// Everything else, newest first.
    pub delete: Vec<String>,
}

impl RetentionDecision {
    /// Ids kept because of `class`.
    pub fn kept_by(&self, class: RetentionClass) -> Vec<&str> {
        self.keep
            .iter()
            .filter(|(_, classes)| classes.contains(&class))
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

/// Classify `candidates` under `policy`.
///
/// Daily picks the latest snapshot of each of the `daily` most recent days
/// that have one. Weekly does the same over ISO weeks, ignoring days already
/// covered by daily. Monthly ignores those days and every week chosen by
/// weekly. A snapshot selected by several criteria is kept once.
pub fn select(policy: &RetentionPolicy, candidates: &[RetentionCandidate]) -> StoreResult<RetentionDecision> {
    policy.validate()?;

    let mut sorted: Vec<&RetentionCandidate> = candidates.iter().collect();
    sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

    let mut decision = RetentionDecision::default();
    let mut keep = |id: &str, class: RetentionClass| {
        decision.keep.entry(id.to_string()).or_default().push(class);
    };

    let daily = pick(&sorted, policy.daily, |c| Some(day(c)));
    let daily_days: HashSet<NaiveDate> = daily.iter().map(|c| day(c)).collect();
    for c in &daily {
        keep(&c.id, RetentionClass::Daily);
    }

    let weekly = pick(&sorted, policy.weekly, |c| {
        (!daily_days.contains(&day(c))).then(|| week(c))
    });
    let weekly_weeks: HashSet<IsoWeek> = weekly.iter().map(|c| week(c)).collect();
    for c in &weekly {
        keep(&c.id, RetentionClass::Weekly);
    }

    let monthly = pick(&sorted, policy.monthly, |c| {
        (!daily_days.contains(&day(c)) && !weekly_weeks.contains(&week(c)))
            .then(|| (c.created_at.year(), c.created_at.month()))
    });
    for c in &monthly {
        keep(&c.id, RetentionClass::Monthly);
    }

    for c in sorted.iter().filter(|c| c.pinned) {
        keep(&c.id, RetentionClass::Pinned);
    }

    decision.delete = sorted
        .iter()
        .filter(|c| !decision.keep.contains_key(&c.id))
        .map(|c| c.id.clone())
        .collect();

    debug!(
        candidates = candidates.len(),
        kept = decision.keep.len(),
        deleted = decision.delete.len(),
        "retention pass"
    );
    Ok(decision)
}

/// Walk newest-first and take the first snapshot of each new period, up to
/// `count` periods. `period` returns `None` for snapshots to skip.
fn pick<'a, K, F>(sorted: &[&'a RetentionCandidate], count: u32, period: F) -> Vec<&'a RetentionCandidate>
where
    K: Eq + std::hash::Hash,
    F: Fn(&RetentionCandidate) -> Option<K>,
{
    let mut seen = HashSet::new();
    let mut picked = Vec::new();
    for c in sorted {
        if seen.len() >= count as usize {
            break;
        }
        if let Some(key) = period(c) {
            if seen.insert(key) {
                picked.push(*c);
            }
        }
    }
    picked
}

fn day(c: &RetentionCandidate) -> NaiveDate {
    c.created_at.date_naive()
}

fn week(c: &RetentionCandidate) -> IsoWeek {
    c.created_at.iso_week()
}
