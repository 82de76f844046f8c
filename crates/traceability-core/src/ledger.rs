use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::TraceError;
use crate::lot::{
    fits, require_positive, settle, Category, Lot, LotId, LotInput, LotOrigin, LotStatus, NewLot,
};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LotOrder {
    #[default]
    Insertion,
    Id,
    CreatedAt,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LotFilter {
    pub category: Option<Category>,
    pub status: Option<LotStatus>,
    pub origin: Option<LotOrigin>,
    pub order: LotOrder,
}

impl LotFilter {
    #[must_use]
    pub fn active() -> Self {
        Self { status: Some(LotStatus::Active), ..Self::default() }
    }

    #[must_use]
    pub fn matches(&self, lot: &Lot) -> bool {
        self.category.as_ref().map_or(true, |category| &lot.category == category)
            && self.status.map_or(true, |status| lot.status == status)
            && self.origin.map_or(true, |origin| lot.origin == origin)
    }
}

/// Owner of lot existence and quantity state.
///
/// `consume`/`consume_many` are the only code paths that lower a lot's quantity.
#[derive(Debug, Clone, Default)]
pub struct LotLedger {
    lots: Vec<Lot>,
    index: BTreeMap<LotId, usize>,
}

impl LotLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lots.is_empty()
    }

    #[must_use]
    pub fn get(&self, lot_id: &LotId) -> Option<&Lot> {
        self.index.get(lot_id).and_then(|position| self.lots.get(*position))
    }

    #[must_use]
    pub fn contains(&self, lot_id: &LotId) -> bool {
        self.index.contains_key(lot_id)
    }

    /// Look up a lot, reporting absence as [`TraceError::LotNotFound`].
    ///
    /// # Errors
    /// Returns [`TraceError::LotNotFound`] when no lot has `lot_id`.
    pub fn require(&self, lot_id: &LotId) -> Result<&Lot, TraceError> {
        self.get(lot_id).ok_or_else(|| TraceError::LotNotFound { lot_id: lot_id.clone() })
    }

    /// All lots in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Lot> + '_ {
        self.lots.iter()
    }

    /// Lots matching `filter`; lazy for insertion order, materialized for sorted orders.
    pub fn list<'a>(&'a self, filter: &'a LotFilter) -> Box<dyn Iterator<Item = &'a Lot> + 'a> {
        let matching = self.lots.iter().filter(move |lot| filter.matches(lot));
        match filter.order {
            LotOrder::Insertion => Box::new(matching),
            LotOrder::Id => {
                let mut sorted = matching.collect::<Vec<_>>();
                sorted.sort_by(|lhs, rhs| lhs.id.cmp(&rhs.id));
                Box::new(sorted.into_iter())
            }
            LotOrder::CreatedAt => {
                let mut sorted = matching.collect::<Vec<_>>();
                sorted.sort_by(|lhs, rhs| {
                    lhs.created_at.cmp(&rhs.created_at).then_with(|| lhs.id.cmp(&rhs.id))
                });
                Box::new(sorted.into_iter())
            }
        }
    }

    pub fn list_active(&self) -> impl Iterator<Item = &Lot> + '_ {
        self.lots.iter().filter(|lot| lot.is_active())
    }

    /// Validate a prospective lot without inserting it.
    ///
    /// # Errors
    /// See [`LotLedger::create_lot`].
    pub fn check_new(&self, new: &NewLot) -> Result<(), TraceError> {
        if self.contains(&new.id) {
            return Err(TraceError::DuplicateId { lot_id: new.id.clone() });
        }
        if !new.quantity.is_finite() || new.quantity < 0.0 {
            return Err(TraceError::invalid_quantity(format!(
                "lot quantity MUST be a finite number >= 0, got {}",
                new.quantity
            )));
        }
        if new.unit.as_str().trim().is_empty() {
            return Err(TraceError::InvalidUnit { unit: new.unit.to_string() });
        }
        if let Some(parent) = &new.parent_lot_id {
            if !self.contains(parent) {
                return Err(TraceError::UnknownParent { lot_id: parent.clone() });
            }
        }
        for input in &new.inputs {
            if !self.contains(&input.lot_id) {
                return Err(TraceError::UnknownInput { lot_id: input.lot_id.clone() });
            }
        }
        Ok(())
    }

    /// Create a lot. Colliding ids are rejected, never overwritten.
    ///
    /// # Errors
    /// Returns [`TraceError::DuplicateId`], [`TraceError::InvalidQuantity`],
    /// [`TraceError::InvalidUnit`], [`TraceError::UnknownParent`] or
    /// [`TraceError::UnknownInput`].
    pub fn create_lot(&mut self, new: NewLot) -> Result<&Lot, TraceError> {
        self.check_new(&new)?;
        Ok(self.push(new.into_lot()))
    }

    /// Re-insert a previously persisted lot as-is (snapshot load).
    ///
    /// # Errors
    /// Returns [`TraceError::DuplicateId`] when the id is already present.
    pub fn restore(&mut self, lot: Lot) -> Result<(), TraceError> {
        if self.contains(&lot.id) {
            return Err(TraceError::DuplicateId { lot_id: lot.id });
        }
        self.push(lot);
        Ok(())
    }

    /// Decrement one lot and recompute its status.
    ///
    /// # Errors
    /// Returns [`TraceError::LotNotFound`], [`TraceError::InvalidQuantity`] for a
    /// non-positive amount, or [`TraceError::InsufficientQuantity`].
    pub fn consume(&mut self, lot_id: &LotId, amount: f64) -> Result<f64, TraceError> {
        self.check_consumptions(&[LotInput { lot_id: lot_id.clone(), quantity: amount }])?;
        Ok(self.apply_consumption(lot_id, amount))
    }

    /// Check a batch of consumptions, summing repeated lots, without applying any.
    ///
    /// # Errors
    /// Same as [`LotLedger::consume`], for the first offending lot.
    pub fn check_consumptions(&self, consumptions: &[LotInput]) -> Result<(), TraceError> {
        let mut totals: Vec<(&LotId, f64)> = Vec::new();
        for consumption in consumptions {
            require_positive("consumed quantity", consumption.quantity)?;
            match totals.iter_mut().find(|(lot_id, _)| *lot_id == &consumption.lot_id) {
                Some((_, total)) => *total += consumption.quantity,
                None => totals.push((&consumption.lot_id, consumption.quantity)),
            }
        }

        for (lot_id, requested) in totals {
            let lot = self.require(lot_id)?;
            if !fits(requested, lot.quantity) {
                return Err(TraceError::InsufficientQuantity {
                    lot_id: lot_id.clone(),
                    requested,
                    available: lot.quantity,
                });
            }
        }
        Ok(())
    }

    /// Apply a batch of consumptions all-or-nothing.
    ///
    /// # Errors
    /// Same as [`LotLedger::check_consumptions`]; nothing is applied on error.
    pub fn consume_many(&mut self, consumptions: &[LotInput]) -> Result<(), TraceError> {
        self.check_consumptions(consumptions)?;
        for consumption in consumptions {
            self.apply_consumption(&consumption.lot_id, consumption.quantity);
        }
        Ok(())
    }

    fn apply_consumption(&mut self, lot_id: &LotId, amount: f64) -> f64 {
        let Some(lot) = self.index.get(lot_id).and_then(|position| self.lots.get_mut(*position))
        else {
            return 0.0;
        };
        lot.quantity = settle(lot.quantity - amount);
        lot.status = LotStatus::for_quantity(lot.quantity);
        lot.quantity
    }

    fn push(&mut self, lot: Lot) -> &Lot {
        let position = self.lots.len();
        self.index.insert(lot.id.clone(), position);
        self.lots.push(lot);
        &self.lots[position]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{category, fixture_time, unit};

    fn new_lot(id: &str, quantity: f64) -> NewLot {
        NewLot {
            id: LotId::from(id),
            quantity,
            unit: unit("lbs"),
            category: category("Plant Material"),
            product_type: None,
            origin: LotOrigin::Intake,
            parent_lot_id: None,
            inputs: Vec::new(),
            created_at: fixture_time(),
            attributes: crate::lot::Attributes::new(),
        }
    }

    fn seeded() -> LotLedger {
        let mut ledger = LotLedger::new();
        for (id, quantity) in [("A", 100.0), ("B", 10.0), ("C", 0.0)] {
            if let Err(err) = ledger.create_lot(new_lot(id, quantity)) {
                panic!("fixture lot {id} should be created: {err}");
            }
        }
        ledger
    }

    #[test]
    fn duplicate_ids_are_rejected_without_overwrite() {
        let mut ledger = seeded();
        let result = ledger.create_lot(new_lot("A", 5.0));
        assert_eq!(result.err(), Some(TraceError::DuplicateId { lot_id: LotId::from("A") }));
        assert_eq!(ledger.get(&LotId::from("A")).map(|lot| lot.quantity), Some(100.0));
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn negative_and_nan_quantities_are_rejected() {
        let mut ledger = LotLedger::new();
        assert!(matches!(
            ledger.create_lot(new_lot("X", -1.0)),
            Err(TraceError::InvalidQuantity { .. })
        ));
        assert!(matches!(
            ledger.create_lot(new_lot("Y", f64::NAN)),
            Err(TraceError::InvalidQuantity { .. })
        ));
        assert!(ledger.is_empty());
    }

    #[test]
    fn zero_quantity_lot_starts_depleted() {
        let ledger = seeded();
        assert_eq!(ledger.get(&LotId::from("C")).map(|lot| lot.status), Some(LotStatus::Depleted));
    }

    #[test]
    fn unknown_parent_and_input_references_are_rejected() {
        let mut ledger = seeded();
        let mut orphan = new_lot("A1", 1.0);
        orphan.origin = LotOrigin::Subdivided;
        orphan.parent_lot_id = Some(LotId::from("nope"));
        assert_eq!(
            ledger.create_lot(orphan).err(),
            Some(TraceError::UnknownParent { lot_id: LotId::from("nope") })
        );

        let mut processed = new_lot("P1", 1.0);
        processed.origin = LotOrigin::Processed;
        processed.inputs = vec![LotInput { lot_id: LotId::from("ghost"), quantity: 1.0 }];
        assert_eq!(
            ledger.create_lot(processed).err(),
            Some(TraceError::UnknownInput { lot_id: LotId::from("ghost") })
        );
    }

    #[test]
    fn consume_decrements_and_recomputes_status() -> Result<(), TraceError> {
        let mut ledger = seeded();
        let a = LotId::from("A");
        assert!((ledger.consume(&a, 40.0)? - 60.0).abs() < f64::EPSILON);
        assert!(ledger.get(&a).is_some_and(Lot::is_active));
        assert!(ledger.consume(&a, 60.0)?.abs() < f64::EPSILON);
        assert_eq!(ledger.get(&a).map(|lot| lot.status), Some(LotStatus::Depleted));
        Ok(())
    }

    #[test]
    fn consume_rejects_overdraw_without_side_effect() {
        let mut ledger = seeded();
        let b = LotId::from("B");
        let err = ledger.consume(&b, 10.5).err();
        assert_eq!(
            err,
            Some(TraceError::InsufficientQuantity {
                lot_id: b.clone(),
                requested: 10.5,
                available: 10.0
            })
        );
        assert_eq!(ledger.get(&b).map(|lot| lot.quantity), Some(10.0));
    }

    #[test]
    fn consume_many_aggregates_repeated_lots_and_is_all_or_nothing() {
        let mut ledger = seeded();
        let batch = vec![
            LotInput { lot_id: LotId::from("A"), quantity: 10.0 },
            LotInput { lot_id: LotId::from("B"), quantity: 6.0 },
            LotInput { lot_id: LotId::from("B"), quantity: 6.0 },
        ];
        assert!(matches!(
            ledger.consume_many(&batch),
            Err(TraceError::InsufficientQuantity { requested, .. }) if (requested - 12.0).abs() < 1e-12
        ));
        assert_eq!(ledger.get(&LotId::from("A")).map(|lot| lot.quantity), Some(100.0));
        assert_eq!(ledger.get(&LotId::from("B")).map(|lot| lot.quantity), Some(10.0));
    }

    #[test]
    fn list_filters_and_orders() {
        let ledger = seeded();
        let active = ledger.list_active().map(|lot| lot.id.to_string()).collect::<Vec<_>>();
        assert_eq!(active, vec!["A", "B"]);

        let filter = LotFilter { status: Some(LotStatus::Depleted), ..LotFilter::default() };
        let depleted = ledger.list(&filter).map(|lot| lot.id.to_string()).collect::<Vec<_>>();
        assert_eq!(depleted, vec!["C"]);

        let by_id = LotFilter { order: LotOrder::Id, ..LotFilter::default() };
        let ids = ledger.list(&by_id).map(|lot| lot.id.to_string()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["A", "B", "C"]);
    }
}
