use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::checkpoint::{Ownership, OwnershipClaim};

/// How a partition not currently held by us is being acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// No record, or released by its previous owner.
    Unowned,
    /// The previous owner stopped renewing its lease.
    Expired,
    /// Taken from an active owner holding more than its share.
    Stolen,
}

impl Acquisition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Acquisition::Unowned => "unowned",
            Acquisition::Expired => "expired",
            Acquisition::Stolen => "stolen",
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ClaimPlan {
    /// Leases we hold and keep.
    pub renewals: Vec<OwnershipClaim>,
    pub acquisitions: Vec<(OwnershipClaim, Acquisition)>,
}

impl ClaimPlan {
    pub fn into_claims(self) -> Vec<OwnershipClaim> {
        self.renewals
            .into_iter()
            .chain(self.acquisitions.into_iter().map(|(claim, _)| claim))
            .collect()
    }
}

/// Decide which ownership records `owner_id` should write this cycle.
///
/// Every instance runs this independently against the same records. Existing
/// leases are kept. An instance below its fair share (`n / owners`, with the
/// remainder going to instances already above the minimum) first takes unowned
/// or expired partitions, lowest id first, and only when none are left steals
/// a single partition from the most loaded owner. Convergence is gradual: one
/// steal per instance per cycle.
pub fn plan(
    owner_id: &str,
    partitions: &[i32],
    records: &[Ownership],
    now: DateTime<Utc>,
    lease: Duration,
) -> ClaimPlan {
    let by_partition: HashMap<i32, &Ownership> = records
        .iter()
        .filter(|o| partitions.contains(&o.partition))
        .map(|o| (o.partition, o))
        .collect();

    // Active owners and what they hold, always including ourselves.
    let mut held: BTreeMap<&str, Vec<i32>> = BTreeMap::new();
    held.insert(owner_id, Vec::new());
    for ownership in by_partition.values() {
        if ownership.is_active(now, lease) {
            held.entry(ownership.owner_id.as_str())
                .or_default()
                .push(ownership.partition);
        }
    }
    for owned in held.values_mut() {
        owned.sort_unstable();
    }

    let mut plan = ClaimPlan::default();
    let mine = held.get(owner_id).cloned().unwrap_or_default();
    for partition in &mine {
        plan.renewals.push(OwnershipClaim {
            partition: *partition,
            owner_id: owner_id.to_owned(),
            expected_version: by_partition.get(partition).map(|o| o.version),
        });
    }

    if partitions.is_empty() {
        return plan;
    }

    let owners = held.len();
    let min_share = partitions.len() / owners;
    let extra = partitions.len() % owners;
    let others_above_min = held
        .iter()
        .filter(|(owner, owned)| **owner != owner_id && owned.len() > min_share)
        .count();
    let target = if others_above_min < extra {
        min_share + 1
    } else {
        min_share
    };

    let mut deficit = target.saturating_sub(mine.len());
    if deficit == 0 {
        return plan;
    }

    let mut claimable: Vec<i32> = partitions
        .iter()
        .copied()
        .filter(|p| !by_partition.get(p).is_some_and(|o| o.is_active(now, lease)))
        .collect();
    claimable.sort_unstable();

    for partition in claimable {
        if deficit == 0 {
            break;
        }
        let (expected_version, how) = match by_partition.get(&partition) {
            None => (None, Acquisition::Unowned),
            Some(o) if o.is_released() => (Some(o.version), Acquisition::Unowned),
            Some(o) => (Some(o.version), Acquisition::Expired),
        };
        plan.acquisitions.push((
            OwnershipClaim {
                partition,
                owner_id: owner_id.to_owned(),
                expected_version,
            },
            how,
        ));
        deficit -= 1;
    }

    if deficit > 0 && plan.acquisitions.is_empty() {
        let victim = held
            .iter()
            .filter(|(owner, _)| **owner != owner_id)
            .max_by(|(a_owner, a), (b_owner, b)| {
                // most loaded first, lowest owner id on ties
                a.len().cmp(&b.len()).then_with(|| b_owner.cmp(a_owner))
            });

        if let Some((_, owned)) = victim {
            let overloaded = owned.len() > min_share + 1
                || (owned.len() == min_share + 1 && mine.len() < min_share);
            if overloaded {
                if let Some(partition) = owned.first() {
                    plan.acquisitions.push((
                        OwnershipClaim {
                            partition: *partition,
                            owner_id: owner_id.to_owned(),
                            expected_version: by_partition.get(partition).map(|o| o.version),
                        },
                        Acquisition::Stolen,
                    ));
                }
            }
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(60);

    fn record(partition: i32, owner: &str, version: i64, age_secs: i64) -> Ownership {
        Ownership {
            partition,
            owner_id: owner.to_string(),
            version,
            last_modified: Utc::now() - chrono::Duration::seconds(age_secs),
        }
    }

    fn acquired(plan: &ClaimPlan) -> Vec<(i32, Acquisition)> {
        plan.acquisitions
            .iter()
            .map(|(claim, how)| (claim.partition, *how))
            .collect()
    }

    /// Apply claims the way a store would: compare-and-swap on version.
    fn apply(records: &mut Vec<Ownership>, claims: Vec<OwnershipClaim>) {
        for claim in claims {
            let current = records.iter().position(|o| o.partition == claim.partition);
            let current_version = current.map(|i| records[i].version);
            if current_version != claim.expected_version {
                continue;
            }
            let updated = Ownership {
                partition: claim.partition,
                owner_id: claim.owner_id,
                version: current_version.unwrap_or(0) + 1,
                last_modified: Utc::now(),
            };
            match current {
                Some(i) => records[i] = updated,
                None => records.push(updated),
            }
        }
    }

    fn counts(records: &[Ownership]) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for o in records {
            *counts.entry(o.owner_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn lone_instance_claims_everything() {
        let plan = plan("a", &[0, 1, 2, 3], &[], Utc::now(), LEASE);
        assert!(plan.renewals.is_empty());
        assert_eq!(
            acquired(&plan),
            vec![
                (0, Acquisition::Unowned),
                (1, Acquisition::Unowned),
                (2, Acquisition::Unowned),
                (3, Acquisition::Unowned)
            ]
        );
    }

    #[test]
    fn renews_own_leases() {
        let records = vec![record(0, "a", 3, 5), record(1, "a", 7, 5)];
        let plan = plan("a", &[0, 1], &records, Utc::now(), LEASE);
        assert_eq!(plan.renewals.len(), 2);
        assert_eq!(plan.renewals[0].expected_version, Some(3));
        assert_eq!(plan.renewals[1].expected_version, Some(7));
        assert!(plan.acquisitions.is_empty());
    }

    #[test]
    fn takes_over_expired_and_released_partitions() {
        let records = vec![
            record(0, "b", 1, 5),
            record(1, "b", 2, 600),
            record(2, "", 4, 5),
            record(3, "b", 1, 5),
        ];
        let plan = plan("a", &[0, 1, 2, 3], &records, Utc::now(), LEASE);
        assert_eq!(
            acquired(&plan),
            vec![(1, Acquisition::Expired), (2, Acquisition::Unowned)]
        );
        assert_eq!(plan.acquisitions[0].0.expected_version, Some(2));
    }

    #[test]
    fn steals_one_partition_from_overloaded_owner() {
        let records: Vec<_> = (0..4).map(|p| record(p, "b", 1, 5)).collect();
        let plan = plan("a", &[0, 1, 2, 3], &records, Utc::now(), LEASE);
        assert_eq!(acquired(&plan), vec![(0, Acquisition::Stolen)]);
    }

    #[test]
    fn balanced_instances_leave_each_other_alone() {
        let records = vec![
            record(0, "a", 1, 5),
            record(1, "a", 1, 5),
            record(2, "b", 1, 5),
            record(3, "b", 1, 5),
            record(4, "b", 1, 5),
        ];
        for owner in ["a", "b"] {
            let plan = plan(owner, &[0, 1, 2, 3, 4], &records, Utc::now(), LEASE);
            assert!(plan.acquisitions.is_empty(), "{owner} should not acquire");
        }
    }

    #[test]
    fn instances_converge_to_fair_split() {
        let partitions: Vec<i32> = (0..8).collect();
        let mut records = Vec::new();

        // a starts alone, then b and c join
        let claims = plan("a", &partitions, &records, Utc::now(), LEASE).into_claims();
        apply(&mut records, claims);
        assert_eq!(counts(&records).get("a"), Some(&8));

        for _ in 0..10 {
            for owner in ["a", "b", "c"] {
                let claims = plan(owner, &partitions, &records, Utc::now(), LEASE).into_claims();
                apply(&mut records, claims);
            }
        }

        let counts = counts(&records);
        let mut shares: Vec<usize> = counts.values().copied().collect();
        shares.sort_unstable();
        assert_eq!(shares, vec![2, 3, 3]);
        assert_eq!(records.len(), 8, "every partition has exactly one record");
    }
}
