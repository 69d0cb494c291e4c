//! Conflict detection and resolution policies
//!
//! Two change streams conflict on a record when both touched it since the
//! last watermark. A [`ConflictPolicy`] picks a side, or declines and leaves
//! the conflict for manual review.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::changelog::ChangeLogEntry;

/// Changes to one record made independently on both stores
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conflict {
    pub table: String,
    pub record_id: String,
    /// Local changes, oldest first
    pub local: Vec<ChangeLogEntry>,
    /// Cloud changes, oldest first
    pub remote: Vec<ChangeLogEntry>,
}

impl Conflict {
    pub fn latest_local(&self) -> Option<&ChangeLogEntry> {
        self.local.last()
    }

    pub fn latest_remote(&self) -> Option<&ChangeLogEntry> {
        self.remote.last()
    }
}

/// Outcome of applying a policy to one conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    KeepLocal,
    KeepRemote,
    Unresolved { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConflict {
    pub conflict: Conflict,
    pub resolution: Resolution,
}

impl ResolvedConflict {
    /// The single change that defines the record's reconciled state
    pub fn winner(&self) -> Option<&ChangeLogEntry> {
        match self.resolution {
            Resolution::KeepLocal => self.conflict.latest_local(),
            Resolution::KeepRemote => self.conflict.latest_remote(),
            Resolution::Unresolved { .. } => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self.resolution, Resolution::Unresolved { .. })
    }
}

/// Decides which of two concurrent changes wins
pub trait ConflictPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Compare the newest change from each side
    fn resolve(&self, local: &ChangeLogEntry, remote: &ChangeLogEntry) -> Resolution;
}

/// Later `changed_at` wins; changes closer than `clock_skew_tolerance` are
/// ordered by operation severity (DELETE > UPDATE > INSERT), and a tie on
/// that too is left unresolved.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins {
    pub clock_skew_tolerance: Duration,
}

impl ConflictPolicy for LastWriteWins {
    fn name(&self) -> &'static str {
        "last_write_wins"
    }

    fn resolve(&self, local: &ChangeLogEntry, remote: &ChangeLogEntry) -> Resolution {
        let tolerance_us = self.clock_skew_tolerance.as_micros();
        let gap_us = (remote.changed_at - local.changed_at).num_microseconds();

        let concurrent = match gap_us {
            Some(gap) => u128::from(gap.unsigned_abs()) <= tolerance_us,
            None => false,
        };
        if !concurrent {
            return if remote.changed_at > local.changed_at {
                Resolution::KeepRemote
            } else {
                Resolution::KeepLocal
            };
        }

        match local.operation.severity().cmp(&remote.operation.severity()) {
            std::cmp::Ordering::Greater => Resolution::KeepLocal,
            std::cmp::Ordering::Less => Resolution::KeepRemote,
            std::cmp::Ordering::Equal => Resolution::Unresolved {
                reason: format!(
                    "concurrent {} on both stores within {}ms",
                    local.operation,
                    self.clock_skew_tolerance.as_millis()
                ),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PreferLocal;

impl ConflictPolicy for PreferLocal {
    fn name(&self) -> &'static str {
        "prefer_local"
    }

    fn resolve(&self, _local: &ChangeLogEntry, _remote: &ChangeLogEntry) -> Resolution {
        Resolution::KeepLocal
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PreferRemote;

impl ConflictPolicy for PreferRemote {
    fn name(&self) -> &'static str {
        "prefer_remote"
    }

    fn resolve(&self, _local: &ChangeLogEntry, _remote: &ChangeLogEntry) -> Resolution {
        Resolution::KeepRemote
    }
}

/// Never picks a side
#[derive(Debug, Clone, Copy, Default)]
pub struct Manual;

impl ConflictPolicy for Manual {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn resolve(&self, _local: &ChangeLogEntry, _remote: &ChangeLogEntry) -> Resolution {
        Resolution::Unresolved {
            reason: "manual resolution required".to_string(),
        }
    }
}

/// Policy selector used in configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicyKind {
    #[default]
    LastWriteWins,
    PreferLocal,
    PreferRemote,
    Manual,
}

impl ConflictPolicyKind {
    pub fn build(self, clock_skew_tolerance: Duration) -> Arc<dyn ConflictPolicy> {
        match self {
            ConflictPolicyKind::LastWriteWins => Arc::new(LastWriteWins {
                clock_skew_tolerance,
            }),
            ConflictPolicyKind::PreferLocal => Arc::new(PreferLocal),
            ConflictPolicyKind::PreferRemote => Arc::new(PreferRemote),
            ConflictPolicyKind::Manual => Arc::new(Manual),
        }
    }
}

impl fmt::Display for ConflictPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictPolicyKind::LastWriteWins => "last_write_wins",
            ConflictPolicyKind::PreferLocal => "prefer_local",
            ConflictPolicyKind::PreferRemote => "prefer_remote",
            ConflictPolicyKind::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// Group not-yet-replicated changes by record and report every record
/// touched on both sides. Result is ordered by `record_id`.
pub fn detect_conflicts(
    table: &str,
    local: &[ChangeLogEntry],
    remote: &[ChangeLogEntry],
) -> Vec<Conflict> {
    let mut by_record: BTreeMap<&str, (Vec<ChangeLogEntry>, Vec<ChangeLogEntry>)> = BTreeMap::new();

    for entry in local.iter().filter(|e| e.table_name == table) {
        by_record.entry(&entry.record_id).or_default().0.push(entry.clone());
    }
    for entry in remote.iter().filter(|e| e.table_name == table) {
        by_record.entry(&entry.record_id).or_default().1.push(entry.clone());
    }

    by_record
        .into_iter()
        .filter(|(_, (l, r))| !l.is_empty() && !r.is_empty())
        .map(|(record_id, (mut local, mut remote))| {
            local.sort_by_key(|e| e.changed_at);
            remote.sort_by_key(|e| e.changed_at);
            Conflict {
                table: table.to_string(),
                record_id: record_id.to_string(),
                local,
                remote,
            }
        })
        .collect()
}

pub fn resolve_conflicts(policy: &dyn ConflictPolicy, conflicts: Vec<Conflict>) -> Vec<ResolvedConflict> {
    conflicts
        .into_iter()
        .map(|conflict| {
            let resolution = match (conflict.latest_local(), conflict.latest_remote()) {
                (Some(local), Some(remote)) => policy.resolve(local, remote),
                (Some(_), None) => Resolution::KeepLocal,
                (None, Some(_)) => Resolution::KeepRemote,
                (None, None) => Resolution::Unresolved {
                    reason: "no changes on either side".to_string(),
                },
            };
            ResolvedConflict {
                conflict,
                resolution,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::{ChangeDetails, Operation};
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;

    fn at(secs: i64, micros: u32) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, micros * 1000).unwrap()
    }

    fn change(record_id: &str, operation: Operation, changed_at: DateTime<Utc>) -> ChangeLogEntry {
        let details = match operation {
            Operation::Insert => ChangeDetails::Insert { new: Default::default() },
            Operation::Update => ChangeDetails::Update {
                old: Default::default(),
                new: Default::default(),
            },
            Operation::Delete => ChangeDetails::Delete { old: Default::default() },
        };
        let mut entry = ChangeLogEntry::new("test_table", record_id, details, None);
        entry.changed_at = changed_at;
        entry
    }

    #[test]
    fn test_same_record_on_both_sides_is_one_conflict() {
        let local = vec![change("1", Operation::Update, at(10, 0))];
        let remote = vec![change("1", Operation::Update, at(20, 0))];

        let conflicts = detect_conflicts("test_table", &local, &remote);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].record_id, "1");
    }

    #[test]
    fn test_disjoint_records_do_not_conflict() {
        let local = vec![change("1", Operation::Update, at(10, 0))];
        let remote = vec![change("2", Operation::Update, at(10, 0))];
        assert!(detect_conflicts("test_table", &local, &remote).is_empty());
    }

    #[test]
    fn test_last_write_wins_by_timestamp() {
        let policy = LastWriteWins::default();
        let older = change("1", Operation::Delete, at(10, 0));
        let newer = change("1", Operation::Insert, at(10, 1));

        assert_eq!(policy.resolve(&older, &newer), Resolution::KeepRemote);
        assert_eq!(policy.resolve(&newer, &older), Resolution::KeepLocal);
    }

    #[test]
    fn test_clock_skew_window_falls_back_to_severity() {
        let policy = LastWriteWins {
            clock_skew_tolerance: Duration::from_secs(2),
        };
        let delete = change("1", Operation::Delete, at(10, 0));
        let update = change("1", Operation::Update, at(11, 0));

        assert_eq!(policy.resolve(&delete, &update), Resolution::KeepLocal);
        assert_eq!(policy.resolve(&update, &delete), Resolution::KeepRemote);
    }

    #[test]
    fn test_exact_tie_is_unresolved() {
        let policy = LastWriteWins::default();
        let a = change("1", Operation::Update, at(10, 0));
        let b = change("1", Operation::Update, at(10, 0));

        assert!(matches!(policy.resolve(&a, &b), Resolution::Unresolved { .. }));
    }

    #[test]
    fn test_winner_is_latest_of_chosen_side() {
        let conflict = detect_conflicts(
            "test_table",
            &[
                change("1", Operation::Update, at(30, 0)),
                change("1", Operation::Insert, at(5, 0)),
            ],
            &[change("1", Operation::Update, at(20, 0))],
        )
        .remove(0);

        let resolved = resolve_conflicts(&LastWriteWins::default(), vec![conflict]);
        let winner = resolved[0].winner().unwrap();
        assert_eq!(winner.operation, Operation::Update);
        assert_eq!(winner.changed_at, at(30, 0));
        assert!(resolve_conflicts(&Manual, vec![resolved[0].conflict.clone()])[0].winner().is_none());
    }

    proptest! {
        /// Property: a record conflicts exactly when it appears on both sides.
        #[test]
        fn prop_conflicts_are_the_record_intersection(
            local_ids in prop::collection::vec(0u8..12, 0..20),
            remote_ids in prop::collection::vec(0u8..12, 0..20),
        ) {
            let local: Vec<_> = local_ids
                .iter()
                .map(|id| change(&id.to_string(), Operation::Update, at(1, 0)))
                .collect();
            let remote: Vec<_> = remote_ids
                .iter()
                .map(|id| change(&id.to_string(), Operation::Update, at(2, 0)))
                .collect();

            let conflicts = detect_conflicts("test_table", &local, &remote);

            let mut expected: Vec<String> = local_ids
                .iter()
                .filter(|id| remote_ids.contains(id))
                .map(|id| id.to_string())
                .collect();
            expected.sort();
            expected.dedup();

            let found: Vec<String> = conflicts.iter().map(|c| c.record_id.clone()).collect();
            prop_assert_eq!(found, expected);
        }
    }
}
