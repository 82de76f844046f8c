use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::TraceError;
use crate::ledger::LotLedger;
use crate::lot::LotId;

/// Upper bound on traversal depth; data is a DAG by construction, corrupted input is not.
pub const MAX_LINEAGE_DEPTH: usize = 4_096;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Subdivision,
    Process,
}

/// One derivation edge, `from` the source lot `to` the derived lot.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
pub struct LineageEdge {
    pub from: LotId,
    pub to: LotId,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Direction {
    Up,
    Down,
}

/// Derivation edges between lots. Holds no quantities.
#[derive(Debug, Clone, Default)]
pub struct LineageGraph {
    parents: BTreeMap<LotId, Vec<(LotId, EdgeKind)>>,
    children: BTreeMap<LotId, Vec<(LotId, EdgeKind)>>,
}

impl LineageGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the graph from the `parent_lot_id`/`inputs` of every lot in `ledger`.
    #[must_use]
    pub fn rebuild(ledger: &LotLedger) -> Self {
        let mut graph = Self::new();
        for lot in ledger.iter() {
            if let Some(parent) = &lot.parent_lot_id {
                graph.link(parent, &lot.id, EdgeKind::Subdivision);
            }
            for input in &lot.inputs {
                graph.link(&input.lot_id, &lot.id, EdgeKind::Process);
            }
        }
        graph
    }

    /// # Errors
    /// Returns [`TraceError::UnknownParent`] when `parent` is not in `ledger`.
    pub fn record_subdivision(
        &mut self,
        ledger: &LotLedger,
        parent: &LotId,
        children: &[LotId],
    ) -> Result<(), TraceError> {
        if !ledger.contains(parent) {
            return Err(TraceError::UnknownParent { lot_id: parent.clone() });
        }
        for child in children {
            self.link(parent, child, EdgeKind::Subdivision);
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`TraceError::UnknownInput`] for the first input missing from `ledger`;
    /// no edge is recorded in that case.
    pub fn record_process(
        &mut self,
        ledger: &LotLedger,
        inputs: &[LotId],
        output: &LotId,
    ) -> Result<(), TraceError> {
        if let Some(missing) = inputs.iter().find(|input| !ledger.contains(input)) {
            return Err(TraceError::UnknownInput { lot_id: missing.clone() });
        }
        for input in inputs {
            self.link(input, output, EdgeKind::Process);
        }
        Ok(())
    }

    /// Every edge, grouped by source lot.
    pub fn edges(&self) -> impl Iterator<Item = LineageEdge> + '_ {
        self.children.iter().flat_map(|(from, targets)| {
            targets.iter().map(move |(to, kind)| LineageEdge {
                from: from.clone(),
                to: to.clone(),
                kind: *kind,
            })
        })
    }

    #[must_use]
    pub fn parents_of(&self, lot_id: &LotId) -> &[(LotId, EdgeKind)] {
        self.parents.get(lot_id).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn children_of(&self, lot_id: &LotId) -> &[(LotId, EdgeKind)] {
        self.children.get(lot_id).map_or(&[], Vec::as_slice)
    }

    /// Lots `lot_id` was derived from, nearest first, excluding `lot_id` itself.
    ///
    /// # Errors
    /// Returns [`TraceError::LotNotFound`] when `lot_id` is not in `ledger`.
    pub fn ancestors_of(&self, ledger: &LotLedger, lot_id: &LotId) -> Result<Vec<LotId>, TraceError> {
        ledger.require(lot_id)?;
        Ok(self.walk(lot_id, Direction::Up, |_| true))
    }

    /// Lots derived from `lot_id`, nearest first, excluding `lot_id` itself.
    ///
    /// # Errors
    /// Returns [`TraceError::LotNotFound`] when `lot_id` is not in `ledger`.
    pub fn descendants_of(
        &self,
        ledger: &LotLedger,
        lot_id: &LotId,
    ) -> Result<Vec<LotId>, TraceError> {
        ledger.require(lot_id)?;
        Ok(self.walk(lot_id, Direction::Down, |_| true))
    }

    /// Descendants reached through subdivision edges only.
    #[must_use]
    pub fn subdivision_subtree(&self, lot_id: &LotId) -> Vec<LotId> {
        self.walk(lot_id, Direction::Down, |kind| kind == EdgeKind::Subdivision)
    }

    fn walk(
        &self,
        start: &LotId,
        direction: Direction,
        follow: impl Fn(EdgeKind) -> bool,
    ) -> Vec<LotId> {
        let mut visited = BTreeSet::from([start.clone()]);
        let mut queue = VecDeque::from([(start.clone(), 0_usize)]);
        let mut found = Vec::new();

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= MAX_LINEAGE_DEPTH {
                tracing::warn!(lot_id = %start, "lineage traversal hit depth bound");
                continue;
            }
            let neighbours = match direction {
                Direction::Up => self.parents_of(&current),
                Direction::Down => self.children_of(&current),
            };
            for (next, kind) in neighbours {
                if follow(*kind) && visited.insert(next.clone()) {
                    found.push(next.clone());
                    queue.push_back((next.clone(), depth + 1));
                }
            }
        }
        found
    }

    fn link(&mut self, from: &LotId, to: &LotId, kind: EdgeKind) {
        let targets = self.children.entry(from.clone()).or_default();
        if targets.iter().any(|(existing, existing_kind)| existing == to && *existing_kind == kind) {
            return;
        }
        targets.push((to.clone(), kind));
        self.parents.entry(to.clone()).or_default().push((from.clone(), kind));
    }
}
