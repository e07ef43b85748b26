use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::{Record, Wal};

use super::ledger;
use super::txn::Txn;
use super::{wal_writer_loop, EngineError, SharedLoan, SharedSlot, WalCommand};

/// Mutable view of inventory and loan rows, shared by replay and live transactions.
pub(super) trait StateMut {
    /// Slot for `key`. Replay creates missing slots with `kind`; a transaction
    /// only sees the slots it locked.
    fn slot_mut(&mut self, key: &SlotKey, kind: TrackingKind) -> Option<&mut InventorySlot>;
    fn loan_mut(&mut self, id: &Ulid) -> Option<&mut Loan>;
    fn insert_loan(&mut self, loan: Loan);
}

/// In-memory state of the lending desk, rebuilt from the WAL at startup.
pub struct Store {
    pub(super) locations: DashMap<Ulid, Location>,
    pub(super) borrowers: DashMap<Ulid, Borrower>,
    pub(super) models: DashMap<Ulid, AssetModel>,
    pub(super) bundles: DashMap<Ulid, BundleDefinition>,
    /// Bundle model at a location → its definition id.
    pub(super) bundle_index: DashMap<SlotKey, Ulid>,
    pub(super) slots: DashMap<SlotKey, SharedSlot>,
    pub(super) loans: DashMap<Ulid, SharedLoan>,
    /// Asset id → the slot holding it.
    pub(super) asset_index: DashMap<Ulid, SlotKey>,
    /// Transactions hold it shared for their whole life; compaction takes it exclusively.
    pub(super) gate: Arc<RwLock<()>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

#[derive(Default)]
struct ReplayState {
    slots: HashMap<SlotKey, InventorySlot>,
    loans: HashMap<Ulid, Loan>,
}

impl StateMut for ReplayState {
    fn slot_mut(&mut self, key: &SlotKey, kind: TrackingKind) -> Option<&mut InventorySlot> {
        Some(
            self.slots
                .entry(*key)
                .or_insert_with(|| InventorySlot::new(*key, kind)),
        )
    }

    fn loan_mut(&mut self, id: &Ulid) -> Option<&mut Loan> {
        self.loans.get_mut(id)
    }

    fn insert_loan(&mut self, loan: Loan) {
        self.loans.insert(loan.id, loan);
    }
}

impl Store {
    pub fn open(wal_path: &Path, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        let records = Wal::replay(wal_path)?;
        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            locations: DashMap::new(),
            borrowers: DashMap::new(),
            models: DashMap::new(),
            bundles: DashMap::new(),
            bundle_index: DashMap::new(),
            slots: DashMap::new(),
            loans: DashMap::new(),
            asset_index: DashMap::new(),
            gate: Arc::new(RwLock::new(())),
            wal_tx,
            notify,
        };

        // Replay into plain maps first; rows only get their locks once fully rebuilt.
        let mut state = ReplayState::default();
        let mut events = 0usize;
        for record in &records {
            for event in record {
                apply_event(&mut state, event);
                store.apply_catalog(event);
                events += 1;
            }
        }
        for (key, slot) in state.slots {
            store.slots.insert(key, Arc::new(RwLock::new(slot)));
        }
        for (id, loan) in state.loans {
            store.loans.insert(id, Arc::new(RwLock::new(loan)));
        }

        tracing::info!(
            records = records.len(),
            events,
            loans = store.loans.len(),
            slots = store.slots.len(),
            "store replayed from WAL"
        );
        Ok(store)
    }

    /// Start a transaction. Waits while a compaction snapshot is being taken.
    pub(super) async fn begin(&self) -> Txn {
        Txn::new(self.gate.clone().read_owned().await)
    }

    /// Write a committed transaction to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, record: Record) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                record,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Catalog rows live outside the slot and loan locks; apply them directly.
    pub(super) fn apply_catalog(&self, event: &Event) {
        match event {
            Event::LocationRegistered { location } => {
                self.locations.insert(location.id, location.clone());
            }
            Event::BorrowerRegistered { borrower } => {
                self.borrowers.insert(borrower.id, borrower.clone());
            }
            Event::ModelRegistered { model } => {
                self.models.insert(model.id, model.clone());
            }
            Event::BundleDefined { definition } => {
                self.bundle_index.insert(
                    SlotKey::new(definition.model_id, definition.location_id),
                    definition.id,
                );
                self.bundles.insert(definition.id, definition.clone());
            }
            Event::AssetRegistered { asset } => {
                self.asset_index
                    .insert(asset.id, SlotKey::new(asset.model_id, asset.location_id));
            }
            Event::SlotRestored { slot } => {
                for id in slot.assets.keys() {
                    self.asset_index.insert(*id, slot.key);
                }
            }
            _ => {}
        }
    }

    // ── Lookups ──────────────────────────────────────────────

    pub fn location(&self, id: Ulid) -> Result<Location, EngineError> {
        self.locations
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound("location", id))
    }

    pub fn borrower(&self, id: Ulid) -> Result<Borrower, EngineError> {
        self.borrowers
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound("borrower", id))
    }

    pub fn model(&self, id: Ulid) -> Result<AssetModel, EngineError> {
        self.models
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound("model", id))
    }

    /// Bundle definition of `model_id` at `location_id`.
    pub fn bundle_for(&self, model_id: Ulid, location_id: Ulid) -> Result<BundleDefinition, EngineError> {
        self.bundle_index
            .get(&SlotKey::new(model_id, location_id))
            .and_then(|id| self.bundles.get(id.value()).map(|d| d.value().clone()))
            .ok_or(EngineError::NotFound("bundle definition", model_id))
    }

    pub fn asset_slot(&self, asset_id: Ulid) -> Option<SlotKey> {
        self.asset_index.get(&asset_id).map(|e| *e.value())
    }

    pub(super) fn slot(&self, key: &SlotKey) -> Option<SharedSlot> {
        self.slots.get(key).map(|e| e.value().clone())
    }

    pub(super) fn slot_or_create(&self, key: SlotKey, kind: TrackingKind) -> SharedSlot {
        self.slots
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(InventorySlot::new(key, kind))))
            .value()
            .clone()
    }

    pub(super) fn loan_row(&self, id: Ulid) -> Result<SharedLoan, EngineError> {
        self.loans
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound("loan", id))
    }

    pub(super) fn loan_rows(&self) -> Vec<SharedLoan> {
        self.loans.iter().map(|e| e.value().clone()).collect()
    }

    /// Slots a request for `quantity` of `model` draws from: the model's own
    /// slot, or every bundle component (required plus the chosen optional ones).
    pub(super) fn request_keys(
        &self,
        model: &AssetModel,
        location_id: Ulid,
        optional: &[Ulid],
    ) -> Result<Vec<SlotKey>, EngineError> {
        match model.kind {
            TrackingKind::Serialized | TrackingKind::Bulk => Ok(vec![SlotKey::new(model.id, location_id)]),
            TrackingKind::Bundle => {
                let definition = self.bundle_for(model.id, location_id)?;
                Ok(definition
                    .items
                    .iter()
                    .filter(|c| !c.optional || optional.contains(&c.model_id))
                    .map(|c| SlotKey::new(c.model_id, location_id))
                    .collect())
            }
        }
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the WAL with only the records needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // No transaction can be between its first lock and its commit while we hold this.
        let _exclusive = self.gate.write().await;

        let mut records: Vec<Record> = Vec::new();
        records.extend(
            self.locations
                .iter()
                .map(|e| vec![Event::LocationRegistered { location: e.value().clone() }]),
        );
        records.extend(
            self.borrowers
                .iter()
                .map(|e| vec![Event::BorrowerRegistered { borrower: e.value().clone() }]),
        );
        records.extend(
            self.models
                .iter()
                .map(|e| vec![Event::ModelRegistered { model: e.value().clone() }]),
        );
        records.extend(
            self.bundles
                .iter()
                .map(|e| vec![Event::BundleDefined { definition: e.value().clone() }]),
        );

        let slots: Vec<SharedSlot> = self.slots.iter().map(|e| e.value().clone()).collect();
        for slot in slots {
            let guard = slot.read().await;
            records.push(vec![Event::SlotRestored { slot: guard.clone() }]);
        }
        for loan in self.loan_rows() {
            let guard = loan.read().await;
            records.push(vec![Event::LoanRestored { loan: guard.clone() }]);
        }

        let count = records.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!(records = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Location an event belongs to, for notification fan-out.
pub(super) fn event_location(event: &Event) -> Option<Ulid> {
    match event {
        Event::LocationRegistered { location } => Some(location.id),
        Event::BundleDefined { definition } => Some(definition.location_id),
        Event::AssetRegistered { asset } => Some(asset.location_id),
        Event::AssetActivationChanged { key, .. }
        | Event::StockTotalSet { key, .. }
        | Event::StockTaken { key, .. }
        | Event::StockReleased { key, .. }
        | Event::StockWrittenOff { key, .. } => Some(key.location_id),
        Event::LoanReserved { location_id, .. } => Some(*location_id),
        Event::SlotRestored { slot } => Some(slot.key.location_id),
        Event::LoanRestored { loan } => Some(loan.location_id),
        _ => None,
    }
}

/// Apply one event to slot and loan rows. The same function drives WAL replay
/// and staged transactions, so both always agree on the resulting state.
pub(super) fn apply_event(state: &mut impl StateMut, event: &Event) {
    match event {
        Event::AssetRegistered { asset } => {
            let key = SlotKey::new(asset.model_id, asset.location_id);
            if let Some(slot) = state.slot_mut(&key, TrackingKind::Serialized) {
                slot.assets.insert(asset.id, asset.clone());
            }
        }
        Event::AssetActivationChanged { key, asset_id, active } => {
            if let Some(asset) = state
                .slot_mut(key, TrackingKind::Serialized)
                .and_then(|s| s.assets.get_mut(asset_id))
            {
                asset.active = *active;
            }
        }
        Event::StockTotalSet { key, total } => {
            if let Some(slot) = state.slot_mut(key, TrackingKind::Bulk) {
                ledger::apply_total(slot, *total);
            }
        }
        Event::StockTaken { key, quantity } => {
            if let Some(slot) = state.slot_mut(key, TrackingKind::Bulk) {
                ledger::apply_take(slot, *quantity);
            }
        }
        Event::StockReleased { key, quantity } => {
            if let Some(slot) = state.slot_mut(key, TrackingKind::Bulk) {
                ledger::apply_release(slot, *quantity);
            }
        }
        Event::StockWrittenOff { key, quantity } => {
            if let Some(slot) = state.slot_mut(key, TrackingKind::Bulk) {
                ledger::apply_write_off(slot, *quantity);
            }
        }
        Event::LoanReserved {
            id,
            borrower_id,
            location_id,
            period,
            notes,
        } => {
            state.insert_loan(Loan {
                id: *id,
                borrower_id: *borrower_id,
                location_id: *location_id,
                period: *period,
                status: LoanStatus::Reserved,
                notes: notes.clone(),
                items: Vec::new(),
                history: Vec::new(),
            });
        }
        Event::LoanItemAllocated { loan_id, item } => {
            let Some(loan) = state.loan_mut(loan_id) else { return };
            loan.items.push(item.clone());
            let (location_id, period, active) = (loan.location_id, loan.period, loan.status.is_active());
            if item.needs_asset() && active {
                let key = SlotKey::new(item.model_id, location_id);
                if let Some(slot) = state.slot_mut(&key, TrackingKind::Serialized) {
                    slot.insert_allocation(Allocation {
                        item_id: item.id,
                        loan_id: *loan_id,
                        period,
                    });
                }
            }
        }
        Event::LoanItemRemoved { loan_id, item_id } => {
            let Some(loan) = state.loan_mut(loan_id) else { return };
            let Some(pos) = loan.items.iter().position(|i| i.id == *item_id) else { return };
            let item = loan.items.remove(pos);
            let key = SlotKey::new(item.model_id, loan.location_id);
            if item.needs_asset()
                && let Some(slot) = state.slot_mut(&key, TrackingKind::Serialized)
            {
                slot.remove_allocation(item.id);
            }
        }
        Event::LoanItemModelChanged { loan_id, item_id, model_id } => {
            let Some(loan) = state.loan_mut(loan_id) else { return };
            let (location_id, period, active) = (loan.location_id, loan.period, loan.status.is_active());
            let Some(item) = loan.item_mut(*item_id) else { return };
            let old_model = item.model_id;
            item.model_id = *model_id;
            item.status = ItemStatus::Reserved;
            item.asset_id = None;
            item.condition_on_handover = None;
            if item.needs_asset() {
                if let Some(slot) = state.slot_mut(&SlotKey::new(old_model, location_id), TrackingKind::Serialized) {
                    slot.remove_allocation(*item_id);
                }
                if active
                    && let Some(slot) = state.slot_mut(&SlotKey::new(*model_id, location_id), TrackingKind::Serialized)
                {
                    slot.insert_allocation(Allocation {
                        item_id: *item_id,
                        loan_id: *loan_id,
                        period,
                    });
                }
            }
        }
        Event::ItemBound {
            loan_id,
            item_id,
            asset_id,
            condition,
        } => {
            let Some(loan) = state.loan_mut(loan_id) else { return };
            let location_id = loan.location_id;
            let Some(item) = loan.item_mut(*item_id) else { return };
            item.asset_id = *asset_id;
            item.condition_on_handover = *condition;
            let key = SlotKey::new(item.model_id, location_id);
            if let Some(asset_id) = asset_id
                && let Some(asset) = state
                    .slot_mut(&key, TrackingKind::Serialized)
                    .and_then(|s| s.assets.get_mut(asset_id))
            {
                asset.on_loan = Some(*item_id);
            }
        }
        Event::LoanHandedOver { loan_id } => {
            let Some(loan) = state.loan_mut(loan_id) else { return };
            loan.status = LoanStatus::HandedOver;
            for item in loan.items.iter_mut().filter(|i| i.status == ItemStatus::Reserved) {
                item.status = ItemStatus::HandedOver;
            }
        }
        Event::LoanItemSettled {
            loan_id,
            item_id,
            status,
            condition,
        } => {
            let Some(loan) = state.loan_mut(loan_id) else { return };
            let location_id = loan.location_id;
            let Some(item) = loan.item_mut(*item_id) else { return };
            item.status = *status;
            item.condition_on_return = *condition;
            let key = SlotKey::new(item.model_id, location_id);
            let bound = item.asset_id;
            if let Some(asset_id) = bound {
                release_asset(state, &key, asset_id, *item_id);
            }
        }
        Event::LoanReturned { loan_id } => {
            close_loan(state, loan_id, LoanStatus::Returned);
        }
        Event::LoanCancelled { loan_id } => {
            close_loan(state, loan_id, LoanStatus::Cancelled);
        }
        Event::LoanMarkedOverdue { loan_id } => {
            if let Some(loan) = state.loan_mut(loan_id) {
                loan.status = LoanStatus::Overdue;
            }
        }
        Event::LoanPeriodChanged { loan_id, period } => {
            if let Some(loan) = state.loan_mut(loan_id) {
                loan.period = *period;
            }
            rebuild_allocations(state, loan_id);
        }
        Event::AuditAppended { loan_id, entry } => {
            if let Some(loan) = state.loan_mut(loan_id) {
                loan.history.push(entry.clone());
            }
        }
        Event::SlotRestored { slot } => {
            if let Some(existing) = state.slot_mut(&slot.key, slot.kind) {
                let allocations = std::mem::take(&mut existing.allocations);
                *existing = slot.clone();
                existing.allocations = allocations;
            }
        }
        Event::LoanRestored { loan } => {
            let loan_id = loan.id;
            state.insert_loan(loan.clone());
            rebuild_allocations(state, &loan_id);
        }
        Event::LocationRegistered { .. }
        | Event::BorrowerRegistered { .. }
        | Event::ModelRegistered { .. }
        | Event::BundleDefined { .. } => {}
    }
}

fn release_asset(state: &mut impl StateMut, key: &SlotKey, asset_id: Ulid, item_id: Ulid) {
    if let Some(asset) = state
        .slot_mut(key, TrackingKind::Serialized)
        .and_then(|s| s.assets.get_mut(&asset_id))
        && asset.on_loan == Some(item_id)
    {
        asset.on_loan = None;
    }
}

/// Terminal transition: the loan gives back its units and any asset still bound.
fn close_loan(state: &mut impl StateMut, loan_id: &Ulid, status: LoanStatus) {
    let Some(loan) = state.loan_mut(loan_id) else { return };
    loan.status = status;
    let location_id = loan.location_id;
    let bound: Vec<(SlotKey, Ulid, Ulid)> = loan
        .items
        .iter()
        .filter_map(|i| i.asset_id.map(|a| (SlotKey::new(i.model_id, location_id), a, i.id)))
        .collect();
    for (key, asset_id, item_id) in bound {
        release_asset(state, &key, asset_id, item_id);
    }
    rebuild_allocations(state, loan_id);
}

/// Drop the loan's allocations and, while it is active, re-insert one per
/// serialized item at the loan's current period.
fn rebuild_allocations(state: &mut impl StateMut, loan_id: &Ulid) {
    let Some(loan) = state.loan_mut(loan_id) else { return };
    let period = loan.period;
    let active = loan.status.is_active();
    let keys = loan.allocation_keys();
    let units: Vec<(SlotKey, Ulid)> = loan
        .items
        .iter()
        .filter(|i| i.needs_asset())
        .map(|i| (SlotKey::new(i.model_id, loan.location_id), i.id))
        .collect();
    for key in &keys {
        if let Some(slot) = state.slot_mut(key, TrackingKind::Serialized) {
            slot.remove_loan_allocations(*loan_id);
        }
    }
    if !active {
        return;
    }
    for (key, item_id) in units {
        if let Some(slot) = state.slot_mut(&key, TrackingKind::Serialized) {
            slot.insert_allocation(Allocation {
                item_id,
                loan_id: *loan_id,
                period,
            });
        }
    }
}
