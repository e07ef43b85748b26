use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;
use ulid::Ulid;

use crate::model::*;
use crate::observability::LEDGER_CLAMPED_TOTAL;

use super::availability::SlotSource;
use super::txn::Txn;
use super::{EngineError, Store};

/// On-hand count of a bulk model at one location. `available <= total` always.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockEntry {
    total: u32,
    available: u32,
}

impl StockEntry {
    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn available(&self) -> u32 {
        self.available
    }

    /// Units currently out with borrowers.
    pub fn lent(&self) -> u32 {
        self.total.saturating_sub(self.available)
    }
}

pub(super) fn apply_total(slot: &mut InventorySlot, total: u32) {
    let entry = slot.stock.get_or_insert(StockEntry { total: 0, available: 0 });
    let lent = entry.lent();
    entry.total = total;
    entry.available = total.saturating_sub(lent);
}

pub(super) fn apply_take(slot: &mut InventorySlot, quantity: u32) {
    if let Some(entry) = slot.stock.as_mut() {
        entry.available = entry.available.saturating_sub(quantity);
    }
}

pub(super) fn apply_release(slot: &mut InventorySlot, quantity: u32) {
    if let Some(entry) = slot.stock.as_mut() {
        entry.available = entry.available.saturating_add(quantity).min(entry.total);
    }
}

pub(super) fn apply_write_off(slot: &mut InventorySlot, quantity: u32) {
    if let Some(entry) = slot.stock.as_mut() {
        entry.total = entry.total.saturating_sub(quantity);
        entry.available = entry.available.min(entry.total);
    }
}

/// Bulk stock bookkeeping. Changes are staged on a transaction holding the slot lock.
pub struct InventoryLedger {
    store: Arc<Store>,
}

impl InventoryLedger {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    fn entry(txn: &Txn, key: &SlotKey) -> Option<StockEntry> {
        txn.slot(key).and_then(|s| s.stock)
    }

    /// Take `quantity` units off the shelf, failing if fewer are on hand.
    pub(crate) fn decrease_available(
        &self,
        txn: &mut Txn,
        model_id: Ulid,
        location_id: Ulid,
        quantity: u32,
    ) -> Result<(), EngineError> {
        let key = SlotKey::new(model_id, location_id);
        let available = Self::entry(txn, &key).map_or(0, |e| e.available);
        if quantity > available {
            return Err(EngineError::InsufficientStock {
                model_id,
                requested: quantity,
                available,
            });
        }
        txn.stage(Event::StockTaken { key, quantity });
        Ok(())
    }

    /// Put units back on the shelf. Never fails: anything beyond the total is dropped.
    pub(crate) fn increase_available(&self, txn: &mut Txn, model_id: Ulid, location_id: Ulid, quantity: u32) {
        let key = SlotKey::new(model_id, location_id);
        let Some(entry) = Self::entry(txn, &key) else {
            warn!(%model_id, %location_id, quantity, "release for model without stock entry ignored");
            metrics::counter!(LEDGER_CLAMPED_TOTAL).increment(1);
            return;
        };
        let accepted = quantity.min(entry.lent());
        if accepted < quantity {
            warn!(
                %model_id,
                %location_id,
                quantity,
                accepted,
                "stock release clamped at total"
            );
            metrics::counter!(LEDGER_CLAMPED_TOTAL).increment(1);
        }
        if accepted > 0 {
            txn.stage(Event::StockReleased { key, quantity: accepted });
        }
    }

    /// Lent units that will not come back: they leave the total.
    pub(crate) fn write_off(&self, txn: &mut Txn, model_id: Ulid, location_id: Ulid, quantity: u32) {
        let key = SlotKey::new(model_id, location_id);
        let lent = Self::entry(txn, &key).map_or(0, |e| e.lent());
        let accepted = quantity.min(lent);
        if accepted < quantity {
            warn!(%model_id, %location_id, quantity, lent, "write-off clamped to lent units");
            metrics::counter!(LEDGER_CLAMPED_TOTAL).increment(1);
        }
        if accepted > 0 {
            txn.stage(Event::StockWrittenOff { key, quantity: accepted });
        }
    }

    /// Set the number of units owned; units on loan stay on loan.
    pub(crate) fn set_total(&self, txn: &mut Txn, model_id: Ulid, location_id: Ulid, total: u32) {
        txn.stage(Event::StockTotalSet {
            key: SlotKey::new(model_id, location_id),
            total,
        });
    }

    pub async fn stock_level(&self, model_id: Ulid, location_id: Ulid) -> Option<StockLevel> {
        let slot = self.store.slot(&SlotKey::new(model_id, location_id))?;
        let guard = slot.read().await;
        let entry = guard.stock?;
        Some(StockLevel {
            model_id,
            location_id,
            total: entry.total,
            available: entry.available,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bulk_slot(total: u32) -> InventorySlot {
        let mut slot = InventorySlot::new(SlotKey::new(Ulid::new(), Ulid::new()), TrackingKind::Bulk);
        apply_total(&mut slot, total);
        slot
    }

    #[test]
    fn take_and_release_stay_within_bounds() {
        let mut slot = bulk_slot(10);
        apply_take(&mut slot, 4);
        assert_eq!(slot.stock.map(|e| e.available()), Some(6));
        apply_release(&mut slot, 9);
        assert_eq!(slot.stock.map(|e| e.available()), Some(10));
        apply_take(&mut slot, 30);
        assert_eq!(slot.stock.map(|e| e.available()), Some(0));
    }

    #[test]
    fn set_total_keeps_lent_units_lent() {
        let mut slot = bulk_slot(10);
        apply_take(&mut slot, 4);
        apply_total(&mut slot, 12);
        let entry = slot.stock.unwrap();
        assert_eq!((entry.total(), entry.available()), (12, 8));

        apply_total(&mut slot, 3);
        let entry = slot.stock.unwrap();
        assert_eq!((entry.total(), entry.available()), (3, 0));
    }

    #[test]
    fn write_off_shrinks_total() {
        let mut slot = bulk_slot(10);
        apply_take(&mut slot, 5);
        apply_write_off(&mut slot, 2);
        let entry = slot.stock.unwrap();
        assert_eq!((entry.total(), entry.available()), (8, 5));
        assert_eq!(entry.lent(), 3);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Take(u32),
        Release(u32),
        Total(u32),
        WriteOff(u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u32..40).prop_map(Op::Take),
            (0u32..40).prop_map(Op::Release),
            (0u32..40).prop_map(Op::Total),
            (0u32..40).prop_map(Op::WriteOff),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig { max_global_rejects: 8192, ..ProptestConfig::default() })]

        #[test]
        fn available_stays_within_total(total in 0u32..40, ops in prop::collection::vec(op(), 0..30)) {
            let mut slot = bulk_slot(total);
            for op in ops {
                match op {
                    Op::Take(q) => apply_take(&mut slot, q),
                    Op::Release(q) => apply_release(&mut slot, q),
                    Op::Total(t) => apply_total(&mut slot, t),
                    Op::WriteOff(q) => apply_write_off(&mut slot, q),
                }
                let entry = slot.stock.unwrap();
                prop_assert!(entry.available() <= entry.total());
            }
        }

        #[test]
        fn take_then_release_is_a_no_op(total in 0u32..40, lent in 0u32..40, quantity in 0u32..40) {
            let mut slot = bulk_slot(total);
            apply_take(&mut slot, lent);
            let before = slot.stock;
            prop_assume!(quantity <= before.unwrap().available());
            apply_take(&mut slot, quantity);
            apply_release(&mut slot, quantity);
            prop_assert_eq!(slot.stock, before);
        }
    }

    #[test]
    fn release_without_entry_is_ignored() {
        let mut slot = InventorySlot::new(SlotKey::new(Ulid::new(), Ulid::new()), TrackingKind::Bulk);
        apply_release(&mut slot, 3);
        assert!(slot.stock.is_none());
    }
}
