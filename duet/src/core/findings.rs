//! Finding history bookkeeping across review cycles.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::contract::NewFinding;
use crate::core::types::{FindingId, FindingStatus};

/// Overlay one reviewer answer onto the prior history.
///
/// Status lines are applied first, then new findings (recorded OPEN), then the
/// current open list, so an id reported open in this cycle is never left
/// CLOSED. Ids that are not well formed are dropped.
pub fn merge_history(
    history: &mut BTreeMap<FindingId, FindingStatus>,
    statuses: &BTreeMap<String, FindingStatus>,
    new_findings: &BTreeMap<String, NewFinding>,
    open: &[FindingId],
) {
    for (raw, status) in statuses {
        if let Some(id) = FindingId::parse(raw) {
            history.insert(id, *status);
        }
    }
    for raw in new_findings.keys() {
        if let Some(id) = FindingId::parse(raw) {
            history.insert(id, FindingStatus::Open);
        }
    }
    for id in open {
        history.insert(id.clone(), FindingStatus::Open);
    }
}

/// Render an open-findings list the way agents are asked to write it.
pub fn format_open_findings(open: &[FindingId]) -> String {
    if open.is_empty() {
        return "NONE".to_string();
    }
    open.iter()
        .map(FindingId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Closed/open counts for the run summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindingTally {
    pub closed: usize,
    pub open: usize,
}

/// Count findings across histories; a currently open id always counts as open.
pub fn tally<'a, I>(phases: I) -> FindingTally
where
    I: IntoIterator<Item = (&'a BTreeMap<FindingId, FindingStatus>, &'a [FindingId])>,
{
    let mut merged: BTreeMap<&FindingId, FindingStatus> = BTreeMap::new();
    let mut currently_open: BTreeSet<&FindingId> = BTreeSet::new();
    for (history, open) in phases {
        for (id, status) in history {
            merged.insert(id, *status);
        }
        currently_open.extend(open.iter());
    }
    for id in &currently_open {
        merged.insert(id, FindingStatus::Open);
    }
    merged
        .values()
        .fold(FindingTally::default(), |mut acc, status| {
            match status {
                FindingStatus::Open => acc.open += 1,
                FindingStatus::Closed => acc.closed += 1,
            }
            acc
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> FindingId {
        FindingId::parse(raw).expect("valid id")
    }

    #[test]
    fn merge_applies_statuses_then_new_findings() {
        let mut history = BTreeMap::from([(id("F-001"), FindingStatus::Open)]);
        let statuses = BTreeMap::from([
            ("F-001".to_string(), FindingStatus::Closed),
            ("BAD".to_string(), FindingStatus::Open),
        ]);
        let new_findings = BTreeMap::from([(
            "F-002".to_string(),
            NewFinding {
                summary: "s".to_string(),
                acceptance: "a".to_string(),
            },
        )]);

        merge_history(&mut history, &statuses, &new_findings, &[id("F-002")]);

        assert_eq!(
            history,
            BTreeMap::from([
                (id("F-001"), FindingStatus::Closed),
                (id("F-002"), FindingStatus::Open),
            ])
        );
    }

    /// A finding reopened through the open list wins over a stale CLOSED entry.
    #[test]
    fn merge_keeps_currently_open_ids_open() {
        let mut history = BTreeMap::from([(id("F-003"), FindingStatus::Closed)]);
        merge_history(
            &mut history,
            &BTreeMap::new(),
            &BTreeMap::new(),
            &[id("F-003")],
        );
        assert_eq!(history.get(&id("F-003")), Some(&FindingStatus::Open));
    }

    #[test]
    fn format_open_findings_uses_none_for_empty() {
        assert_eq!(format_open_findings(&[]), "NONE");
        assert_eq!(
            format_open_findings(&[id("F-001"), id("F-002")]),
            "F-001, F-002"
        );
    }

    #[test]
    fn tally_counts_current_open_over_history() {
        let phase1 = BTreeMap::from([
            (id("F-001"), FindingStatus::Closed),
            (id("F-002"), FindingStatus::Closed),
        ]);
        let phase2 = BTreeMap::from([(id("F-010"), FindingStatus::Open)]);
        let open2 = vec![id("F-002")];

        let counts = tally([(&phase1, &[][..]), (&phase2, open2.as_slice())]);

        assert_eq!(counts, FindingTally { closed: 1, open: 2 });
    }
}
