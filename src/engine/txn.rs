use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

use super::availability::SlotSource;
use super::store::{apply_event, event_location, StateMut, Store};
use super::EngineError;

struct LockedSlot {
    guard: OwnedRwLockWriteGuard<InventorySlot>,
    scratch: InventorySlot,
}

enum StagedLoan {
    Existing {
        guard: OwnedRwLockWriteGuard<Loan>,
        scratch: Loan,
    },
    New(Loan),
}

impl StagedLoan {
    fn loan(&self) -> &Loan {
        match self {
            StagedLoan::Existing { scratch, .. } => scratch,
            StagedLoan::New(loan) => loan,
        }
    }

    fn loan_mut(&mut self) -> &mut Loan {
        match self {
            StagedLoan::Existing { scratch, .. } => scratch,
            StagedLoan::New(loan) => loan,
        }
    }
}

/// A unit of work over one loan and the inventory slots it touches.
///
/// Locks are taken loan first, then slots in key order, and held until the
/// transaction is committed or dropped. Every staged event is applied at once
/// to private copies of the locked rows, so later checks in the same
/// transaction see earlier effects. `commit` appends all events as a single
/// WAL record and only then publishes the copies; dropping the transaction
/// discards everything.
pub(crate) struct Txn {
    _gate: OwnedRwLockReadGuard<()>,
    loan: Option<StagedLoan>,
    slots: BTreeMap<SlotKey, LockedSlot>,
    events: Vec<Event>,
}

impl Txn {
    pub(super) fn new(gate: OwnedRwLockReadGuard<()>) -> Self {
        Self {
            _gate: gate,
            loan: None,
            slots: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    /// Lock an existing loan row for update. Must precede `lock_slots`.
    pub(super) async fn lock_loan(&mut self, store: &Store, loan_id: Ulid) -> Result<Loan, EngineError> {
        debug_assert!(self.loan.is_none() && self.slots.is_empty(), "loan locked after slots");
        let row = store.loan_row(loan_id)?;
        let guard = row.write_owned().await;
        let scratch = guard.clone();
        self.loan = Some(StagedLoan::Existing {
            guard,
            scratch: scratch.clone(),
        });
        Ok(scratch)
    }

    /// Lock the inventory slots in key order, creating empty ones on first use.
    /// Call once per transaction with every slot it may touch.
    pub(super) async fn lock_slots(
        &mut self,
        store: &Store,
        keys: impl IntoIterator<Item = SlotKey>,
    ) -> Result<(), EngineError> {
        debug_assert!(self.slots.is_empty(), "slots locked twice");
        let keys: BTreeSet<SlotKey> = keys.into_iter().collect();
        for key in keys {
            let model = store.model(key.model_id)?;
            if model.kind == TrackingKind::Bundle {
                continue;
            }
            let row: Arc<RwLock<InventorySlot>> = store.slot_or_create(key, model.kind);
            let guard = row.write_owned().await;
            let scratch = guard.clone();
            self.slots.insert(key, LockedSlot { guard, scratch });
        }
        Ok(())
    }

    /// The loan as staged so far.
    pub(super) fn loan(&self) -> Option<&Loan> {
        self.loan.as_ref().map(StagedLoan::loan)
    }

    pub(super) fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub(super) fn stage(&mut self, event: Event) {
        apply_event(self, &event);
        self.events.push(event);
    }

    pub(super) async fn commit(self, store: &Store) -> Result<(), EngineError> {
        let Txn {
            _gate,
            loan,
            slots,
            events,
        } = self;
        if events.is_empty() {
            return Ok(());
        }
        store.wal_append(events.clone()).await?;

        for (_, mut locked) in slots {
            *locked.guard = locked.scratch;
        }
        let loan_location = match loan {
            Some(StagedLoan::Existing { mut guard, scratch }) => {
                let location_id = scratch.location_id;
                *guard = scratch;
                Some(location_id)
            }
            Some(StagedLoan::New(loan)) => {
                let location_id = loan.location_id;
                store.loans.insert(loan.id, Arc::new(RwLock::new(loan)));
                Some(location_id)
            }
            None => None,
        };

        for event in &events {
            store.apply_catalog(event);
            if let Some(location_id) = event_location(event).or(loan_location) {
                store.notify.send(location_id, event);
            }
        }
        Ok(())
    }
}

impl StateMut for Txn {
    fn slot_mut(&mut self, key: &SlotKey, _kind: TrackingKind) -> Option<&mut InventorySlot> {
        self.slots.get_mut(key).map(|l| &mut l.scratch)
    }

    fn loan_mut(&mut self, id: &Ulid) -> Option<&mut Loan> {
        self.loan
            .as_mut()
            .map(StagedLoan::loan_mut)
            .filter(|loan| loan.id == *id)
    }

    fn insert_loan(&mut self, loan: Loan) {
        self.loan = Some(StagedLoan::New(loan));
    }
}

impl SlotSource for Txn {
    fn slot(&self, key: &SlotKey) -> Option<&InventorySlot> {
        self.slots.get(key).map(|l| &l.scratch)
    }
}
