//! Deterministic hash-based bucketing.
//!
//! Assignments must be stable across SDK implementations in different
//! languages, so the hash is the canonical MurmurHash3_x86_32 with seed 1
//! and the allocation scan follows the ascending `end_of_range` order
//! exactly.
use std::io::Cursor;
use std::sync::Arc;

use crate::datafile::{Experiment, GroupPolicy, ProjectConfig, TrafficAllocation, Variation};
use crate::decision::DecisionReasons;

/// Buckets are slots in the half-open interval `[0, 10000)`.
pub const MAX_TRAFFIC_VALUE: u32 = 10_000;

const HASH_SEED: u32 = 1;

/// 32-bit hasher used to map bucketing keys onto the traffic range.
pub trait BucketingHasher {
    fn hash_32(&self, input: impl AsRef<[u8]>, seed: u32) -> u32;
}

/// The default (and only) hasher: canonical MurmurHash3_x86_32.
#[derive(Default)]
pub struct Murmur3Hasher;

impl BucketingHasher for Murmur3Hasher {
    fn hash_32(&self, input: impl AsRef<[u8]>, seed: u32) -> u32 {
        murmur3::murmur3_32(&mut Cursor::new(input.as_ref()), seed)
            .expect("hashing an in-memory buffer cannot fail")
    }
}

/// Bucketing algorithm that evenly distributes users across the traffic
/// range.
#[derive(Default)]
pub struct Bucketer {
    hasher: Murmur3Hasher,
}

impl Bucketer {
    pub fn new() -> Bucketer {
        Bucketer::default()
    }

    /// Map a bucketing id onto `[0, MAX_TRAFFIC_VALUE)`.
    ///
    /// Computed as `floor(hash / 2^32 * 10000)` in integer math, so the
    /// result is bit-for-bit identical to other SDK implementations.
    pub fn generate_bucket_value(&self, bucketing_key: &str) -> u32 {
        let hash = self.hasher.hash_32(bucketing_key.as_bytes(), HASH_SEED);
        ((u64::from(hash) * u64::from(MAX_TRAFFIC_VALUE)) >> 32) as u32
    }

    /// Resolve a bucketing id against a traffic allocation table.
    ///
    /// The hash key is the bucketing id composed with the parent id (group,
    /// experiment, or rule). Returns the entity id of the first entry whose
    /// `end_of_range` strictly exceeds the bucket value; `None` for a miss
    /// or an empty slot.
    pub fn find_bucket<'a>(
        &self,
        bucketing_id: &str,
        parent_id: &str,
        traffic_allocations: &'a [TrafficAllocation],
    ) -> Option<&'a str> {
        let bucketing_key = format!("{bucketing_id}{parent_id}");
        let bucket_value = self.generate_bucket_value(&bucketing_key);
        log::debug!(target: "splitstream",
            "assigned bucket {bucket_value} to user with bucketing id \"{bucketing_id}\"");

        for allocation in traffic_allocations {
            if bucket_value < allocation.end_of_range {
                return allocation
                    .entity_id
                    .as_deref()
                    .filter(|entity_id| !entity_id.is_empty());
            }
        }
        None
    }

    /// Bucket a user into a variation of the given experiment (or rollout
    /// rule), honoring random-group mutual exclusion.
    pub fn bucket(
        &self,
        config: &ProjectConfig,
        experiment: &Experiment,
        user_id: &str,
        bucketing_id: &str,
        reasons: &mut DecisionReasons,
    ) -> Option<Arc<Variation>> {
        // Mutually exclusive groups bucket the user to at most one member
        // experiment first. Rollout rules never carry a group policy.
        if experiment.group_policy == Some(GroupPolicy::Random) {
            let group_id = experiment.group_id.as_deref()?;
            let group = config.group(group_id)?;

            match self.find_bucket(bucketing_id, &group.id, &group.traffic_allocation) {
                None => {
                    let message = format!("User \"{user_id}\" is in no experiment.");
                    log::info!(target: "splitstream", "{message}");
                    reasons.info(message);
                    return None;
                }
                Some(bucketed_experiment_id) if bucketed_experiment_id != experiment.id => {
                    let message = format!(
                        "User \"{user_id}\" is not in experiment \"{}\" of group \"{group_id}\".",
                        experiment.key
                    );
                    log::info!(target: "splitstream", "{message}");
                    reasons.info(message);
                    return None;
                }
                Some(_) => {
                    let message = format!(
                        "User \"{user_id}\" is in experiment \"{}\" of group \"{group_id}\".",
                        experiment.key
                    );
                    log::info!(target: "splitstream", "{message}");
                    reasons.info(message);
                }
            }
        }

        let variation_id =
            self.find_bucket(bucketing_id, &experiment.id, &experiment.traffic_allocation);
        let Some(variation_id) = variation_id else {
            let message = "Bucketed into an empty traffic range. Returning nil.".to_owned();
            log::info!(target: "splitstream", "{message}");
            reasons.info(message);
            return None;
        };

        config.variation_by_id(&experiment.id, variation_id).cloned()
    }

    /// Resolve a bucketing id against an arbitrary allocation and return the
    /// selected entity id. Used for CMAB traffic exposure, where the entity
    /// is a marker rather than a variation.
    pub(crate) fn bucket_to_entity_id(
        &self,
        bucketing_id: &str,
        parent_id: &str,
        traffic_allocations: &[TrafficAllocation],
    ) -> Option<String> {
        self.find_bucket(bucketing_id, parent_id, traffic_allocations)
            .map(str::to_owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocation(entries: &[(&str, u32)]) -> Vec<TrafficAllocation> {
        entries
            .iter()
            .map(|(entity_id, end_of_range)| TrafficAllocation {
                entity_id: (!entity_id.is_empty()).then(|| (*entity_id).to_owned()),
                end_of_range: *end_of_range,
            })
            .collect()
    }

    #[test]
    fn murmur3_reference_vectors() {
        let hasher = Murmur3Hasher;
        // Published MurmurHash3_x86_32 test vectors.
        assert_eq!(hasher.hash_32(b"", 0), 0);
        assert_eq!(hasher.hash_32(b"", 1), 0x514E28B7);
        assert_eq!(hasher.hash_32(b"Hello, world!", 0x9747b28c), 0x24884CBA);
        assert_eq!(hasher.hash_32(b"aaaa", 0x9747b28c), 0x5A97808A);
    }

    #[test]
    fn bucket_value_is_stable_and_in_range() {
        let bucketer = Bucketer::new();
        // floor(0x514E28B7 / 2^32 * 10000)
        assert_eq!(bucketer.generate_bucket_value(""), 3175);

        for key in ["ppid1", "ppid2", "ppid3", "a very very long ppid"] {
            let value = bucketer.generate_bucket_value(key);
            assert!(value < MAX_TRAFFIC_VALUE);
            assert_eq!(value, bucketer.generate_bucket_value(key));
        }
    }

    #[test]
    fn find_bucket_scans_ranges_in_order() {
        let bucketer = Bucketer::new();
        let allocations = allocation(&[("control", 3333), ("treatment", 6666), ("extra", 10000)]);

        // A full-coverage allocation always yields an entity.
        for user in 0..50 {
            let entity = bucketer.find_bucket(&format!("user-{user}"), "1886780721", &allocations);
            assert!(entity.is_some());
        }
    }

    #[test]
    fn find_bucket_respects_empty_slots_and_partial_coverage() {
        let bucketer = Bucketer::new();
        // an allocation that covers only the first third of the range,
        // followed by an explicit empty slot
        let allocations = allocation(&[("control", 3333), ("", 10000)]);

        let mut hits = 0;
        let mut misses = 0;
        for user in 0..200 {
            match bucketer.find_bucket(&format!("user-{user}"), "exp", &allocations) {
                Some("control") => hits += 1,
                Some(other) => panic!("unexpected entity {other}"),
                None => misses += 1,
            }
        }
        assert!(hits > 0, "some users should land in the covered range");
        assert!(misses > 0, "some users should land in the empty slot");
    }

    #[test]
    fn random_group_is_mutually_exclusive() {
        let config = crate::datafile::ProjectConfig::parse(
            r#"{
                "version": "4",
                "accountId": "1",
                "projectId": "2",
                "revision": "1",
                "groups": [
                    {"id": "g1", "policy": "random",
                     "trafficAllocation": [{"entityId": "e-group", "endOfRange": 5000}],
                     "experiments": [
                        {"id": "e-group", "key": "group_exp", "status": "Running", "layerId": "l",
                         "audienceIds": [],
                         "variations": [{"id": "v1", "key": "on", "featureEnabled": true}],
                         "trafficAllocation": [{"entityId": "v1", "endOfRange": 10000}]}
                     ]}
                ]
            }"#,
        )
        .unwrap();
        let bucketer = Bucketer::new();
        let experiment = config.experiment_by_key("group_exp").unwrap().clone();
        let group_allocation = allocation(&[("e-group", 5000)]);

        // The experiment's own allocation is full coverage, so a user gets
        // a variation exactly when the group-level hash selects this
        // experiment.
        let mut selected = 0;
        for user in 0..64 {
            let user_id = format!("user-{user}");
            let in_group =
                bucketer.find_bucket(&user_id, "g1", &group_allocation) == Some("e-group");
            let mut reasons = DecisionReasons::off();
            let variation = bucketer.bucket(&config, &experiment, &user_id, &user_id, &mut reasons);
            assert_eq!(variation.is_some(), in_group);
            if in_group {
                selected += 1;
            }
        }
        assert!(selected > 0 && selected < 64, "split should not be degenerate");
    }

    #[test]
    fn same_bucketing_id_different_parents_can_differ() {
        let bucketer = Bucketer::new();
        let full = allocation(&[("a", 5000), ("b", 10000)]);

        // With 64 users and two independent parent salts, at least one user
        // must land in different entities, otherwise the parent id is being
        // ignored.
        let differs = (0..64).any(|user| {
            let id = format!("user-{user}");
            bucketer.find_bucket(&id, "parent-1", &full)
                != bucketer.find_bucket(&id, "parent-2", &full)
        });
        assert!(differs);
    }
}
