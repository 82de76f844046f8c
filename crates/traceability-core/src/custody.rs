use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::error::TraceError;
use crate::lot::LotId;
use crate::process::ProcessId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CustodyEntryId(pub Ulid);

impl CustodyEntryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CustodyEntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for CustodyEntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CustodyAction {
    Intake,
    Subdivided,
    Used,
    Processed,
    Shipped,
    Tested,
}

impl CustodyAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Subdivided => "subdivided",
            Self::Used => "used",
            Self::Processed => "processed",
            Self::Shipped => "shipped",
            Self::Tested => "tested",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "intake" => Some(Self::Intake),
            "subdivided" => Some(Self::Subdivided),
            "used" => Some(Self::Used),
            "processed" => Some(Self::Processed),
            "shipped" => Some(Self::Shipped),
            "tested" => Some(Self::Tested),
            _ => None,
        }
    }
}

/// One immutable audit record of an event affecting a lot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustodyEntry {
    pub entry_id: CustodyEntryId,
    /// Global 1-based position in the log.
    pub sequence: u64,
    pub lot_id: LotId,
    pub action: CustodyAction,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub process_id: Option<ProcessId>,
}

/// Identity of a ledger state: its newest custody entry.
///
/// Every committed transaction appends at least one custody entry, so two ledgers with the
/// same mark hold the same history.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerMark {
    pub high_water: u64,
    pub last_entry: Option<CustodyEntryId>,
}

/// Append-only custody trail indexed by lot.
#[derive(Debug, Clone, Default)]
pub struct CustodyLog {
    entries: Vec<CustodyEntry>,
    by_lot: BTreeMap<LotId, Vec<usize>>,
}

impl CustodyLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sequence of the newest entry, `0` for an empty log.
    #[must_use]
    pub fn high_water(&self) -> u64 {
        self.entries.last().map_or(0, |entry| entry.sequence)
    }

    #[must_use]
    pub fn mark(&self) -> LedgerMark {
        LedgerMark {
            high_water: self.high_water(),
            last_entry: self.entries.last().map(|entry| entry.entry_id),
        }
    }

    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.high_water() + 1
    }

    /// Append one entry.
    ///
    /// # Errors
    /// Returns [`TraceError::Storage`] when `entry.sequence` does not advance the log.
    pub fn append(&mut self, entry: CustodyEntry) -> Result<(), TraceError> {
        if entry.sequence <= self.high_water() {
            return Err(TraceError::Storage(format!(
                "custody sequence {} does not follow {}",
                entry.sequence,
                self.high_water()
            )));
        }
        self.by_lot.entry(entry.lot_id.clone()).or_default().push(self.entries.len());
        self.entries.push(entry);
        Ok(())
    }

    /// Entries for `lot_id` in chronological order; empty when the lot has none.
    pub fn history_of<'a>(&'a self, lot_id: &LotId) -> impl Iterator<Item = &'a CustodyEntry> + 'a {
        self.by_lot
            .get(lot_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .filter_map(|position| self.entries.get(*position))
    }

    /// Merged history of several lots, ordered by sequence.
    #[must_use]
    pub fn history_of_all(&self, lot_ids: &BTreeSet<LotId>) -> Vec<&CustodyEntry> {
        let mut positions = lot_ids
            .iter()
            .filter_map(|lot_id| self.by_lot.get(lot_id))
            .flatten()
            .copied()
            .collect::<Vec<_>>();
        positions.sort_unstable();
        positions.into_iter().filter_map(|position| self.entries.get(position)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CustodyEntry> + '_ {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::fixture_time;

    fn entry(sequence: u64, lot_id: &str, action: CustodyAction) -> CustodyEntry {
        CustodyEntry {
            entry_id: CustodyEntryId::new(),
            sequence,
            lot_id: LotId::from(lot_id),
            action,
            description: format!("{} {lot_id}", action.as_str()),
            timestamp: fixture_time(),
            process_id: None,
        }
    }

    #[test]
    fn history_is_chronological_and_empty_for_unknown_lots() -> Result<(), TraceError> {
        let mut log = CustodyLog::new();
        log.append(entry(1, "A", CustodyAction::Intake))?;
        log.append(entry(2, "B", CustodyAction::Intake))?;
        log.append(entry(3, "A", CustodyAction::Shipped))?;

        let actions = log.history_of(&LotId::from("A")).map(|e| e.action).collect::<Vec<_>>();
        assert_eq!(actions, vec![CustodyAction::Intake, CustodyAction::Shipped]);
        assert_eq!(log.history_of(&LotId::from("missing")).count(), 0);
        assert_eq!(log.high_water(), 3);
        Ok(())
    }

    #[test]
    fn sequence_must_advance() -> Result<(), TraceError> {
        let mut log = CustodyLog::new();
        log.append(entry(1, "A", CustodyAction::Intake))?;
        assert!(matches!(
            log.append(entry(1, "A", CustodyAction::Used)),
            Err(TraceError::Storage(_))
        ));
        assert_eq!(log.len(), 1);
        Ok(())
    }

    #[test]
    fn mark_tracks_newest_entry() -> Result<(), TraceError> {
        let mut log = CustodyLog::new();
        assert_eq!(log.mark(), LedgerMark::default());

        let first = entry(1, "A", CustodyAction::Intake);
        let first_id = first.entry_id;
        log.append(first)?;
        assert_eq!(log.mark(), LedgerMark { high_water: 1, last_entry: Some(first_id) });

        let mut other = CustodyLog::new();
        other.append(entry(1, "A", CustodyAction::Intake))?;
        assert_eq!(other.mark().high_water, log.mark().high_water);
        assert_ne!(other.mark(), log.mark());
        Ok(())
    }

    #[test]
    fn merged_history_orders_by_sequence() -> Result<(), TraceError> {
        let mut log = CustodyLog::new();
        log.append(entry(1, "A", CustodyAction::Intake))?;
        log.append(entry(2, "A1", CustodyAction::Subdivided))?;
        log.append(entry(3, "A", CustodyAction::Subdivided))?;
        log.append(entry(5, "A1", CustodyAction::Shipped))?;

        let lots = BTreeSet::from([LotId::from("A1"), LotId::from("A")]);
        let sequences = log.history_of_all(&lots).iter().map(|e| e.sequence).collect::<Vec<_>>();
        assert_eq!(sequences, vec![1, 2, 3, 5]);
        Ok(())
    }

    #[test]
    fn action_names_round_trip() {
        for action in [
            CustodyAction::Intake,
            CustodyAction::Subdivided,
            CustodyAction::Used,
            CustodyAction::Processed,
            CustodyAction::Shipped,
            CustodyAction::Tested,
        ] {
            assert_eq!(CustodyAction::parse(action.as_str()), Some(action));
        }
    }
}
