use std::collections::{BTreeSet, HashSet};

use db::dtos::ExecutionUnit;
use uuid::Uuid;
use worker::SnapshotEntry;

/// Classification of local records against one runtime snapshot, by external id.
///
/// Every class is disjoint from the others. `matched_present`,
/// `matched_absent`, `settling`, `orphans` and `awaiting_creation` together
/// cover exactly the union of local and runtime ids; `unassigned` holds the
/// local units that have no id yet and stay out of the matching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchingMatrix {
    /// Known locally and reported by the runtime.
    pub matched_present: BTreeSet<String>,
    /// Known locally, no longer reported.
    pub matched_absent: BTreeSet<String>,
    /// Assigned during this cycle, after the snapshot was taken.
    pub settling: BTreeSet<String>,
    /// Reported by the runtime with no local record.
    pub orphans: BTreeSet<String>,
    /// Reported by the runtime and labelled for a local unit whose create is
    /// still in flight.
    pub awaiting_creation: BTreeSet<String>,
    pub unassigned: BTreeSet<Uuid>,
}

impl MatchingMatrix {
    /// `fresh` lists units whose external id was assigned after the snapshot.
    /// `reserved` are ids held by records that could not be decoded.
    pub fn compute(
        units: &[&ExecutionUnit],
        entries: &[SnapshotEntry],
        fresh: &HashSet<Uuid>,
        reserved: &HashSet<String>,
    ) -> Self {
        let local: BTreeSet<String> = units
            .iter()
            .filter(|unit| unit.has_external_id())
            .map(|unit| unit.external_id.clone())
            .chain(reserved.iter().cloned())
            .collect();
        let runtime: BTreeSet<String> = entries
            .iter()
            .map(|entry| entry.external_id.clone())
            .collect();

        let fresh_ids: BTreeSet<String> = units
            .iter()
            .filter(|unit| unit.has_external_id() && fresh.contains(&unit.id))
            .map(|unit| unit.external_id.clone())
            .collect();
        let creating: HashSet<Uuid> = units
            .iter()
            .filter(|unit| !unit.has_external_id() && unit.task_in_flight())
            .map(|unit| unit.id)
            .collect();

        let matched_present: BTreeSet<String> = local.intersection(&runtime).cloned().collect();
        let missing: BTreeSet<String> = local.difference(&runtime).cloned().collect();
        let settling: BTreeSet<String> = missing.intersection(&fresh_ids).cloned().collect();
        let matched_absent: BTreeSet<String> = missing.difference(&settling).cloned().collect();

        let mut awaiting_creation = BTreeSet::new();
        let mut orphans = BTreeSet::new();
        for entry in entries.iter().filter(|entry| !local.contains(&entry.external_id)) {
            let claimed = entry
                .claimed_unit()
                .is_some_and(|unit_id| creating.contains(&unit_id));
            if claimed {
                awaiting_creation.insert(entry.external_id.clone());
            } else {
                orphans.insert(entry.external_id.clone());
            }
        }

        let unassigned = units
            .iter()
            .filter(|unit| !unit.has_external_id())
            .map(|unit| unit.id)
            .collect();

        Self {
            matched_present,
            matched_absent,
            settling,
            orphans,
            awaiting_creation,
            unassigned,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use db::dtos::{Stage, TaskRef, UnitBackend, UnitState};
    use worker::runtime::LABEL_UNIT;

    use super::*;

    fn unit(external_id: &str) -> ExecutionUnit {
        let mut unit = ExecutionUnit::new(Uuid::new_v4(), Stage::Simulate, UnitBackend::Container, Utc::now());
        unit.external_id = external_id.to_string();
        unit
    }

    fn entry(external_id: &str) -> SnapshotEntry {
        SnapshotEntry::new(external_id, UnitState::Running)
    }

    fn ids(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn classifies_by_set_algebra() {
        let units = [unit("a"), unit("b"), unit("")];
        let refs: Vec<&ExecutionUnit> = units.iter().collect();
        let entries = [entry("b"), entry("c")];

        let matrix = MatchingMatrix::compute(&refs, &entries, &HashSet::new(), &HashSet::new());

        assert_eq!(matrix.matched_present, ids(&["b"]));
        assert_eq!(matrix.matched_absent, ids(&["a"]));
        assert_eq!(matrix.orphans, ids(&["c"]));
        assert!(matrix.awaiting_creation.is_empty());
        assert_eq!(matrix.unassigned, BTreeSet::from([units[2].id]));
    }

    #[test]
    fn classes_partition_the_union() {
        let universe = ["a", "b", "c", "d", "e"];
        // Every split of the universe into local-only, runtime-only and both.
        for mask in 0..3u32.pow(universe.len() as u32) {
            let mut local = Vec::new();
            let mut runtime = Vec::new();
            let mut rest = mask;
            for id in universe {
                match rest % 3 {
                    0 => local.push(id),
                    1 => runtime.push(id),
                    _ => {
                        local.push(id);
                        runtime.push(id);
                    }
                }
                rest /= 3;
            }

            let units: Vec<ExecutionUnit> = local.iter().map(|id| unit(id)).collect();
            let refs: Vec<&ExecutionUnit> = units.iter().collect();
            let entries: Vec<SnapshotEntry> = runtime.iter().map(|id| entry(id)).collect();
            let fresh: HashSet<Uuid> = units.iter().step_by(2).map(|unit| unit.id).collect();

            let matrix = MatchingMatrix::compute(&refs, &entries, &fresh, &HashSet::new());

            let classes = [
                &matrix.matched_present,
                &matrix.matched_absent,
                &matrix.settling,
                &matrix.orphans,
                &matrix.awaiting_creation,
            ];
            let total: usize = classes.iter().map(|class| class.len()).sum();
            let union: BTreeSet<String> = classes.iter().flat_map(|class| class.iter().cloned()).collect();
            let expected: BTreeSet<String> = local.iter().chain(&runtime).map(|id| id.to_string()).collect();

            assert_eq!(total, union.len(), "classes overlap for mask {mask}");
            assert_eq!(union, expected, "classes miss ids for mask {mask}");
        }
    }

    #[test]
    fn labelled_entry_of_an_in_flight_create_is_not_an_orphan() {
        let mut creating = unit("");
        creating.task_handle = Some(TaskRef::Dispatched(Uuid::new_v4()));
        let refs = [&creating];
        let entries = [
            entry("ctr-1").with_label(LABEL_UNIT, creating.id.to_string()),
            entry("ctr-2").with_label(LABEL_UNIT, Uuid::new_v4().to_string()),
        ];

        let matrix = MatchingMatrix::compute(&refs, &entries, &HashSet::new(), &HashSet::new());

        assert_eq!(matrix.awaiting_creation, ids(&["ctr-1"]));
        assert_eq!(matrix.orphans, ids(&["ctr-2"]));
    }

    #[test]
    fn fresh_ids_missing_from_the_snapshot_are_settling() {
        let fresh_unit = unit("ctr-7");
        let refs = [&fresh_unit];
        let fresh = HashSet::from([fresh_unit.id]);

        let matrix = MatchingMatrix::compute(&refs, &[], &fresh, &HashSet::new());

        assert_eq!(matrix.settling, ids(&["ctr-7"]));
        assert!(matrix.matched_absent.is_empty());
    }

    #[test]
    fn reserved_ids_are_never_orphans() {
        let reserved = HashSet::from(["ctr-3".to_string()]);

        let matrix = MatchingMatrix::compute(&[], &[entry("ctr-3")], &HashSet::new(), &reserved);

        assert!(matrix.orphans.is_empty());
        assert_eq!(matrix.matched_present, ids(&["ctr-3"]));
    }
}
