use std::time::Instant;

use serde_json::json;
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::reservation::require_status;
use super::{EngineError, ReservationEngine};

impl ReservationEngine {
    /// Add a line to a reserved loan, with the same checks as creating it.
    pub async fn add_loan_item(&self, loan_id: Ulid, request: ItemRequest, actor: Ulid) -> Result<Vec<Ulid>, EngineError> {
        let started = Instant::now();
        let result = self.try_add_loan_item(loan_id, request, actor).await;
        observability::record("add_loan_item", started, &result);
        result
    }

    async fn try_add_loan_item(&self, loan_id: Ulid, request: ItemRequest, actor: Ulid) -> Result<Vec<Ulid>, EngineError> {
        let mut txn = self.store.begin().await;
        let loan = txn.lock_loan(&self.store, loan_id).await?;
        require_status(&loan, &[LoanStatus::Reserved], "add items to")?;
        let keys = self.request_keys(loan.location_id, std::slice::from_ref(&request))?;
        txn.lock_slots(&self.store, keys).await?;

        let created = self.allocate(&mut txn, loan_id, loan.location_id, &loan.period, &request)?;
        self.audit(
            &mut txn,
            loan_id,
            LoanEventKind::Amended,
            actor,
            None,
            json!({ "added": { "model_id": request.model_id, "quantity": request.quantity, "items": created } }),
        );
        txn.commit(&self.store).await?;
        info!(%loan_id, model_id = %request.model_id, quantity = request.quantity, "loan item added");
        Ok(created)
    }

    /// Remove an item from a reserved loan. Removing a bundle root removes its
    /// components; a loan always keeps at least one item.
    pub async fn remove_loan_item(&self, loan_id: Ulid, item_id: Ulid, actor: Ulid) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = self.try_remove_loan_item(loan_id, item_id, actor).await;
        observability::record("remove_loan_item", started, &result);
        result
    }

    async fn try_remove_loan_item(&self, loan_id: Ulid, item_id: Ulid, actor: Ulid) -> Result<(), EngineError> {
        let mut txn = self.store.begin().await;
        let loan = txn.lock_loan(&self.store, loan_id).await?;
        require_status(&loan, &[LoanStatus::Reserved], "remove items from")?;
        let item = loan
            .item(item_id)
            .cloned()
            .ok_or(EngineError::NotFound("loan item", item_id))?;
        if item.item_type == ItemType::BundleComponent {
            return Err(EngineError::Validation(
                "bundle components are removed together with their bundle".into(),
            ));
        }
        let removing = 1 + loan.components_of(item.id).count();
        if removing >= loan.items.len() {
            return Err(EngineError::Validation("a loan must keep at least one item".into()));
        }
        txn.lock_slots(&self.store, loan.slot_keys()).await?;

        let removed = match item.item_type {
            ItemType::BundleRoot => self.bundles.release_bundle(&mut txn, loan_id, item.id)?,
            _ => {
                if item.is_bulk() {
                    self.ledger
                        .increase_available(&mut txn, item.model_id, loan.location_id, item.quantity);
                }
                txn.stage(Event::LoanItemRemoved { loan_id, item_id });
                vec![item_id]
            }
        };
        self.audit(
            &mut txn,
            loan_id,
            LoanEventKind::Amended,
            actor,
            None,
            json!({ "removed": removed }),
        );
        txn.commit(&self.store).await?;
        info!(%loan_id, %item_id, "loan item removed");
        Ok(())
    }

    /// Swap the model of a plain serialized or bulk item for another model of
    /// the same kind. Availability of the new model is checked; the item goes
    /// back to reserved with no asset.
    pub async fn update_loan_item_model(
        &self,
        loan_id: Ulid,
        item_id: Ulid,
        model_id: Ulid,
        actor: Ulid,
    ) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = self.try_update_item_model(loan_id, item_id, model_id, actor).await;
        observability::record("update_loan_item_model", started, &result);
        result
    }

    async fn try_update_item_model(&self, loan_id: Ulid, item_id: Ulid, model_id: Ulid, actor: Ulid) -> Result<(), EngineError> {
        let mut txn = self.store.begin().await;
        let loan = txn.lock_loan(&self.store, loan_id).await?;
        require_status(&loan, &[LoanStatus::Reserved], "change items of")?;
        let item = loan
            .item(item_id)
            .cloned()
            .ok_or(EngineError::NotFound("loan item", item_id))?;
        if !matches!(item.item_type, ItemType::Serialized | ItemType::Bulk) {
            return Err(EngineError::Validation(
                "only plain serialized or bulk items can change model".into(),
            ));
        }
        let model = self.store.model(model_id)?;
        if model.kind != item.tracking {
            return Err(EngineError::Validation(format!(
                "replacement model must be {}, {} is {}",
                item.tracking.as_str(),
                model.id,
                model.kind.as_str()
            )));
        }
        if model.id == item.model_id {
            return Ok(());
        }

        let location_id = loan.location_id;
        txn.lock_slots(
            &self.store,
            [SlotKey::new(item.model_id, location_id), SlotKey::new(model.id, location_id)],
        )
        .await?;

        match model.kind {
            TrackingKind::Serialized => {
                self.availability
                    .assert_available_in(&txn, &model, location_id, &loan.period, 1)?;
            }
            _ => {
                self.ledger
                    .increase_available(&mut txn, item.model_id, location_id, item.quantity);
                self.availability
                    .assert_available_in(&txn, &model, location_id, &loan.period, item.quantity)?;
                self.ledger
                    .decrease_available(&mut txn, model.id, location_id, item.quantity)?;
            }
        }
        txn.stage(Event::LoanItemModelChanged {
            loan_id,
            item_id,
            model_id: model.id,
        });
        self.audit(
            &mut txn,
            loan_id,
            LoanEventKind::Amended,
            actor,
            None,
            json!({ "item_id": item_id, "model": { "from": item.model_id, "to": model.id } }),
        );
        txn.commit(&self.store).await?;
        info!(%loan_id, %item_id, from = %item.model_id, to = %model.id, "loan item model changed");
        Ok(())
    }
}
