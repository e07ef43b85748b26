use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::info;
use ulid::Ulid;

use crate::clock::Clock;
use crate::fields::CustomFieldChecker;
use crate::hours::{OpeningWindowOracle, WindowKind};
use crate::limits::*;
use crate::model::*;
use crate::observability::{self, LOAN_TRANSITIONS_TOTAL};

use super::conflict::{require_open, require_open_for, validate_period};
use super::txn::Txn;
use super::{AvailabilityEngine, BundleExpander, EngineError, InventoryLedger, Store};

/// Loan lifecycle: reserve, hand over, return, cancel, amend.
pub struct ReservationEngine {
    pub(super) store: Arc<Store>,
    pub(super) availability: Arc<AvailabilityEngine>,
    pub(super) ledger: Arc<InventoryLedger>,
    pub(super) bundles: Arc<BundleExpander>,
    pub(super) hours: Arc<dyn OpeningWindowOracle>,
    pub(super) fields: Arc<dyn CustomFieldChecker>,
    pub(super) clock: Arc<dyn Clock>,
}

pub(super) fn require_status(loan: &Loan, allowed: &[LoanStatus], operation: &'static str) -> Result<(), EngineError> {
    if allowed.contains(&loan.status) {
        Ok(())
    } else {
        Err(EngineError::InvalidLoanState {
            loan_id: loan.id,
            status: loan.status,
            operation,
        })
    }
}

pub(super) fn validate_request(model: &AssetModel, request: &ItemRequest) -> Result<(), EngineError> {
    if request.quantity == 0 {
        return Err(EngineError::Validation(format!(
            "quantity for model {} must be at least 1",
            request.model_id
        )));
    }
    if request.quantity > MAX_UNITS_PER_LINE {
        return Err(EngineError::LimitExceeded("too many units in one line"));
    }
    if model.kind == TrackingKind::Serialized && request.quantity > MAX_SERIALIZED_UNITS_PER_LINE {
        return Err(EngineError::LimitExceeded("too many serialized units in one line"));
    }
    Ok(())
}

pub(super) fn transition(name: &'static str) {
    metrics::counter!(LOAN_TRANSITIONS_TOTAL, "transition" => name).increment(1);
}

impl ReservationEngine {
    pub fn new(
        store: Arc<Store>,
        availability: Arc<AvailabilityEngine>,
        ledger: Arc<InventoryLedger>,
        bundles: Arc<BundleExpander>,
        hours: Arc<dyn OpeningWindowOracle>,
        fields: Arc<dyn CustomFieldChecker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            availability,
            ledger,
            bundles,
            hours,
            fields,
            clock,
        }
    }

    /// Stage an audit entry on the loan.
    pub(super) fn audit(
        &self,
        txn: &mut Txn,
        loan_id: Ulid,
        kind: LoanEventKind,
        actor: Ulid,
        note: Option<String>,
        details: serde_json::Value,
    ) {
        let entry = LoanEvent {
            id: Ulid::new(),
            kind,
            actor,
            at: self.clock.now(),
            note,
            details: details.to_string(),
        };
        txn.stage(Event::AuditAppended { loan_id, entry });
    }

    /// Slots touched by a set of requests at one location.
    pub(super) fn request_keys(&self, location_id: Ulid, requests: &[ItemRequest]) -> Result<BTreeSet<SlotKey>, EngineError> {
        let mut keys = BTreeSet::new();
        for request in requests {
            let model = self.store.model(request.model_id)?;
            validate_request(&model, request)?;
            keys.extend(self.store.request_keys(&model, location_id, &request.optional)?);
        }
        Ok(keys)
    }

    /// Stage the items for one request line. Returns the new top-level item ids.
    pub(super) fn allocate(
        &self,
        txn: &mut Txn,
        loan_id: Ulid,
        location_id: Ulid,
        period: &Period,
        request: &ItemRequest,
    ) -> Result<Vec<Ulid>, EngineError> {
        let model = self.store.model(request.model_id)?;
        let mut created = Vec::new();
        match model.kind {
            TrackingKind::Serialized => {
                self.availability
                    .assert_available_in(&*txn, &model, location_id, period, request.quantity)?;
                for _ in 0..request.quantity {
                    let item = LoanItem::new(ItemType::Serialized, TrackingKind::Serialized, model.id, 1, None);
                    created.push(item.id);
                    txn.stage(Event::LoanItemAllocated { loan_id, item });
                }
            }
            TrackingKind::Bulk => {
                self.availability
                    .assert_available_in(&*txn, &model, location_id, period, request.quantity)?;
                self.ledger
                    .decrease_available(txn, model.id, location_id, request.quantity)?;
                let item = LoanItem::new(ItemType::Bulk, TrackingKind::Bulk, model.id, request.quantity, None);
                created.push(item.id);
                txn.stage(Event::LoanItemAllocated { loan_id, item });
            }
            TrackingKind::Bundle => {
                let definition = self.store.bundle_for(model.id, location_id)?;
                for _ in 0..request.quantity {
                    created.push(
                        self.bundles
                            .reserve_bundle(txn, loan_id, &definition, period, &request.optional)?,
                    );
                }
            }
        }
        if txn.loan().is_some_and(|l| l.items.len() > MAX_ITEMS_PER_LOAN) {
            return Err(EngineError::LimitExceeded("too many items on loan"));
        }
        Ok(created)
    }

    // ── Lifecycle ────────────────────────────────────────────

    /// Reserve equipment for a borrower. All lines succeed together or nothing is stored.
    pub async fn create_reservation(
        &self,
        borrower_id: Ulid,
        location_id: Ulid,
        period: Period,
        items: &[ItemRequest],
        notes: Option<String>,
        actor: Ulid,
    ) -> Result<Ulid, EngineError> {
        let started = Instant::now();
        let result = self
            .try_create_reservation(borrower_id, location_id, period, items, notes, actor)
            .await;
        observability::record("create_reservation", started, &result);
        result
    }

    async fn try_create_reservation(
        &self,
        borrower_id: Ulid,
        location_id: Ulid,
        period: Period,
        items: &[ItemRequest],
        notes: Option<String>,
        actor: Ulid,
    ) -> Result<Ulid, EngineError> {
        if items.is_empty() {
            return Err(EngineError::Validation("a reservation needs at least one item".into()));
        }
        if notes.as_ref().is_some_and(|n| n.len() > MAX_NOTE_LEN) {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        validate_period(&period)?;
        self.store.borrower(borrower_id)?;
        self.store.location(location_id)?;
        require_open_for(&*self.hours, location_id, &period).await?;
        let keys = self.request_keys(location_id, items)?;

        let mut txn = self.store.begin().await;
        txn.lock_slots(&self.store, keys).await?;

        let loan_id = Ulid::new();
        txn.stage(Event::LoanReserved {
            id: loan_id,
            borrower_id,
            location_id,
            period,
            notes: notes.clone(),
        });
        let mut lines = Vec::with_capacity(items.len());
        for request in items {
            let ids = self.allocate(&mut txn, loan_id, location_id, &period, request)?;
            lines.push(json!({ "model_id": request.model_id, "quantity": request.quantity, "items": ids }));
        }
        self.audit(
            &mut txn,
            loan_id,
            LoanEventKind::Reserved,
            actor,
            notes,
            json!({ "lines": lines }),
        );
        txn.commit(&self.store).await?;

        transition("reserved");
        info!(%loan_id, %borrower_id, %location_id, start = %period.start, end = %period.end, "loan reserved");
        Ok(loan_id)
    }

    /// Cancel a reservation that was never handed over; bulk units go back on the shelf.
    pub async fn cancel_loan(&self, loan_id: Ulid, actor: Ulid) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = self.try_cancel_loan(loan_id, actor).await;
        observability::record("cancel_loan", started, &result);
        result
    }

    async fn try_cancel_loan(&self, loan_id: Ulid, actor: Ulid) -> Result<(), EngineError> {
        let mut txn = self.store.begin().await;
        let loan = txn.lock_loan(&self.store, loan_id).await?;
        require_status(&loan, &[LoanStatus::Reserved], "cancel")?;
        txn.lock_slots(&self.store, loan.slot_keys()).await?;

        let mut released = 0u32;
        for item in loan.items.iter().filter(|i| i.is_bulk() && i.status.is_open()) {
            self.ledger
                .increase_available(&mut txn, item.model_id, loan.location_id, item.quantity);
            released += item.quantity;
        }
        txn.stage(Event::LoanCancelled { loan_id });
        self.audit(
            &mut txn,
            loan_id,
            LoanEventKind::Cancelled,
            actor,
            None,
            json!({ "bulk_units_released": released }),
        );
        txn.commit(&self.store).await?;

        transition("cancelled");
        info!(%loan_id, "loan cancelled");
        Ok(())
    }

    /// Flag a loan as overdue. Allowed while reserved or handed over.
    pub async fn mark_overdue(&self, loan_id: Ulid, actor: Ulid) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = self.try_mark_overdue(loan_id, actor).await;
        observability::record("mark_overdue", started, &result);
        result
    }

    async fn try_mark_overdue(&self, loan_id: Ulid, actor: Ulid) -> Result<(), EngineError> {
        let mut txn = self.store.begin().await;
        let loan = txn.lock_loan(&self.store, loan_id).await?;
        require_status(&loan, &[LoanStatus::Reserved, LoanStatus::HandedOver], "mark overdue")?;
        txn.stage(Event::LoanMarkedOverdue { loan_id });
        self.audit(
            &mut txn,
            loan_id,
            LoanEventKind::Overdue,
            actor,
            None,
            json!({ "due": loan.period.end, "from": loan.status.as_str() }),
        );
        txn.commit(&self.store).await?;

        transition("overdue");
        info!(%loan_id, "loan marked overdue");
        Ok(())
    }

    /// Move a loan to a new period. Availability against other loans is not
    /// re-checked; opening hours are, unless `override_hours` is set.
    pub async fn update_loan_period(
        &self,
        loan_id: Ulid,
        period: Period,
        override_hours: bool,
        actor: Ulid,
    ) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = self
            .try_update_loan_period(loan_id, period, override_hours, actor)
            .await;
        observability::record("update_loan_period", started, &result);
        result
    }

    async fn try_update_loan_period(
        &self,
        loan_id: Ulid,
        period: Period,
        override_hours: bool,
        actor: Ulid,
    ) -> Result<(), EngineError> {
        validate_period(&period)?;
        let mut txn = self.store.begin().await;
        let loan = txn.lock_loan(&self.store, loan_id).await?;
        require_status(
            &loan,
            &[LoanStatus::Reserved, LoanStatus::HandedOver, LoanStatus::Overdue],
            "change the period of",
        )?;
        if !override_hours {
            // Pickup already happened once the loan left the desk.
            if loan.status == LoanStatus::Reserved {
                require_open(&*self.hours, loan.location_id, period.start, WindowKind::Pickup).await?;
            }
            require_open(&*self.hours, loan.location_id, period.end, WindowKind::Return).await?;
        }
        if period == loan.period {
            return Ok(());
        }
        txn.lock_slots(&self.store, loan.allocation_keys()).await?;
        txn.stage(Event::LoanPeriodChanged { loan_id, period });
        self.audit(
            &mut txn,
            loan_id,
            LoanEventKind::Amended,
            actor,
            None,
            json!({
                "period": { "from": [loan.period.start, loan.period.end], "to": [period.start, period.end] },
                "override_hours": override_hours,
            }),
        );
        txn.commit(&self.store).await?;
        info!(%loan_id, start = %period.start, end = %period.end, "loan period changed");
        Ok(())
    }
}
