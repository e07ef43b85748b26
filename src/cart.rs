use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDateTime;
use dashmap::DashMap;
use tracing::info;
use ulid::Ulid;

use crate::engine::{AvailabilityEngine, EngineError, ReservationEngine, require_open_for, validate_period};
use crate::hours::OpeningWindowOracle;
use crate::limits::MAX_CART_LINES;
use crate::model::{ItemRequest, Period};
use crate::observability::{CHECKOUTS_TOTAL, OPERATION_DURATION_SECONDS};

/// One line of a working set: a model wanted at a location for a period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartLine {
    pub id: Ulid,
    pub model_id: Ulid,
    pub location_id: Ulid,
    pub period: Period,
    pub quantity: u32,
    pub optional: Vec<Ulid>,
}

impl CartLine {
    fn request(&self) -> ItemRequest {
        ItemRequest {
            model_id: self.model_id,
            quantity: self.quantity,
            optional: self.optional.clone(),
        }
    }
}

/// A checkout that stopped part-way. Loans in `created` stay reserved.
#[derive(Debug)]
pub struct CheckoutError {
    pub created: Vec<Ulid>,
    pub source: EngineError,
}

impl std::fmt::Display for CheckoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.created.is_empty() {
            write!(f, "checkout failed: {}", self.source)
        } else {
            write!(
                f,
                "checkout failed after creating {} loan(s): {}",
                self.created.len(),
                self.source
            )
        }
    }
}

impl std::error::Error for CheckoutError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Per-session working sets turned into reservations at checkout.
pub struct CartAggregator {
    sessions: DashMap<Ulid, Vec<CartLine>>,
    reservations: Arc<ReservationEngine>,
    availability: Arc<AvailabilityEngine>,
    hours: Arc<dyn OpeningWindowOracle>,
}

impl CartAggregator {
    pub fn new(
        reservations: Arc<ReservationEngine>,
        availability: Arc<AvailabilityEngine>,
        hours: Arc<dyn OpeningWindowOracle>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            reservations,
            availability,
            hours,
        }
    }

    /// Period, hours and current availability. Nothing is held: checkout checks again.
    async fn check_line(&self, line: &CartLine) -> Result<(), EngineError> {
        if line.quantity == 0 {
            return Err(EngineError::Validation("quantity must be at least 1".into()));
        }
        validate_period(&line.period)?;
        require_open_for(&*self.hours, line.location_id, &line.period).await?;
        self.availability
            .assert_available(line.model_id, line.location_id, line.period, line.quantity)
            .await
    }

    pub async fn add_item(
        &self,
        session: Ulid,
        model_id: Ulid,
        location_id: Ulid,
        period: Period,
        quantity: u32,
        optional: Vec<Ulid>,
    ) -> Result<Ulid, EngineError> {
        let line = CartLine {
            id: Ulid::new(),
            model_id,
            location_id,
            period,
            quantity,
            optional,
        };
        self.check_line(&line).await?;

        let mut lines = self.sessions.entry(session).or_default();
        if lines.len() >= MAX_CART_LINES {
            return Err(EngineError::LimitExceeded("too many cart lines"));
        }
        let id = line.id;
        lines.push(line);
        Ok(id)
    }

    /// Change the period and quantity of a line.
    pub async fn update_item(&self, session: Ulid, line_id: Ulid, period: Period, quantity: u32) -> Result<(), EngineError> {
        let mut line = self.line(session, line_id)?;
        line.period = period;
        line.quantity = quantity;
        self.check_line(&line).await?;

        let mut lines = self
            .sessions
            .get_mut(&session)
            .ok_or(EngineError::NotFound("cart line", line_id))?;
        let slot = lines
            .iter_mut()
            .find(|l| l.id == line_id)
            .ok_or(EngineError::NotFound("cart line", line_id))?;
        *slot = line;
        Ok(())
    }

    pub fn remove_item(&self, session: Ulid, line_id: Ulid) -> Result<(), EngineError> {
        let mut lines = self
            .sessions
            .get_mut(&session)
            .ok_or(EngineError::NotFound("cart line", line_id))?;
        let before = lines.len();
        lines.retain(|l| l.id != line_id);
        if lines.len() == before {
            return Err(EngineError::NotFound("cart line", line_id));
        }
        Ok(())
    }

    pub fn lines(&self, session: Ulid) -> Vec<CartLine> {
        self.sessions.get(&session).map(|l| l.clone()).unwrap_or_default()
    }

    pub fn clear(&self, session: Ulid) {
        self.sessions.remove(&session);
    }

    fn line(&self, session: Ulid, line_id: Ulid) -> Result<CartLine, EngineError> {
        self.sessions
            .get(&session)
            .and_then(|lines| lines.iter().find(|l| l.id == line_id).cloned())
            .ok_or(EngineError::NotFound("cart line", line_id))
    }

    /// One reservation per `(location, start, end)` group, earliest first.
    /// Groups that went through stay booked when a later one fails; their
    /// lines leave the working set, the rest stay for another attempt.
    pub async fn checkout(&self, session: Ulid, borrower_id: Ulid, actor: Ulid) -> Result<Vec<Ulid>, CheckoutError> {
        let started = Instant::now();
        let result = self.try_checkout(session, borrower_id, actor).await;
        let status = match &result {
            Ok(_) => "ok",
            Err(e) if e.created.is_empty() => e.source.code(),
            Err(_) => "partial",
        };
        metrics::counter!(CHECKOUTS_TOTAL, "status" => status).increment(1);
        metrics::histogram!(OPERATION_DURATION_SECONDS, "operation" => "checkout")
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::debug!(%session, created = e.created.len(), "checkout failed: {}", e.source);
        }
        result
    }

    async fn try_checkout(&self, session: Ulid, borrower_id: Ulid, actor: Ulid) -> Result<Vec<Ulid>, CheckoutError> {
        let lines = self.lines(session);
        if lines.is_empty() {
            return Err(CheckoutError {
                created: Vec::new(),
                source: EngineError::Validation("cart is empty".into()),
            });
        }

        let mut groups: BTreeMap<(NaiveDateTime, NaiveDateTime, Ulid), Vec<CartLine>> = BTreeMap::new();
        for line in lines {
            groups
                .entry((line.period.start, line.period.end, line.location_id))
                .or_default()
                .push(line);
        }

        let mut created = Vec::with_capacity(groups.len());
        for ((start, end, location_id), group) in groups {
            let period = Period::new(start, end);
            let requests: Vec<ItemRequest> = group.iter().map(CartLine::request).collect();
            match self
                .reservations
                .create_reservation(borrower_id, location_id, period, &requests, None, actor)
                .await
            {
                Ok(loan_id) => {
                    created.push(loan_id);
                    if let Some(mut remaining) = self.sessions.get_mut(&session) {
                        remaining.retain(|l| !group.iter().any(|g| g.id == l.id));
                    }
                }
                Err(source) => return Err(CheckoutError { created, source }),
            }
        }

        // Lines added while the checkout ran stay in the working set.
        self.sessions.remove_if(&session, |_, lines| lines.is_empty());
        info!(%session, %borrower_id, loans = created.len(), "cart checked out");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{at, Desk};
    use crate::model::LoanStatus;

    #[tokio::test]
    async fn checkout_groups_lines_by_location_and_period() {
        let desk = Desk::new("cart_groups.wal").await;
        let camera = desk.serialized_model("Camera A", 3).await;
        let cable = desk.bulk_model("XLR cable", 10).await;
        let cart = &desk.services.cart;
        let session = Ulid::new();
        let shoot = Period::new(at(10, 9), at(12, 17));
        let later = Period::new(at(15, 9), at(16, 17));

        cart.add_item(session, camera, desk.location, shoot, 2, vec![]).await.unwrap();
        cart.add_item(session, cable, desk.location, shoot, 4, vec![]).await.unwrap();
        cart.add_item(session, camera, desk.location, later, 1, vec![]).await.unwrap();
        assert_eq!(cart.lines(session).len(), 3);

        let loans = cart.checkout(session, desk.borrower, desk.actor).await.unwrap();
        assert_eq!(loans.len(), 2);
        assert!(cart.lines(session).is_empty());

        let first = desk.services.reservations.loan(loans[0]).await.unwrap();
        assert_eq!(first.period, shoot);
        assert_eq!(first.items.len(), 3);
        assert_eq!(first.status, LoanStatus::Reserved);
        let second = desk.services.reservations.loan(loans[1]).await.unwrap();
        assert_eq!(second.period, later);
        assert_eq!(second.items.len(), 1);
    }

    #[tokio::test]
    async fn failed_group_keeps_its_lines_and_reports_created_loans() {
        let desk = Desk::new("cart_partial.wal").await;
        let camera = desk.serialized_model("Camera A", 1).await;
        let cart = &desk.services.cart;
        let session = Ulid::new();
        let first = Period::new(at(10, 9), at(11, 17));
        let second = Period::new(at(15, 9), at(16, 17));

        cart.add_item(session, camera, desk.location, first, 1, vec![]).await.unwrap();
        let kept = cart.add_item(session, camera, desk.location, second, 1, vec![]).await.unwrap();

        // Someone else takes the unit for the second period before checkout.
        desk.reserve(&[ItemRequest::new(camera, 1)], at(15, 10), at(15, 12)).await;

        let err = cart.checkout(session, desk.borrower, desk.actor).await.unwrap_err();
        assert_eq!(err.created.len(), 1);
        assert!(matches!(err.source, EngineError::InsufficientAvailability { .. }));
        let left = cart.lines(session);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, kept);

        let booked = desk.services.reservations.loan(err.created[0]).await.unwrap();
        assert_eq!(booked.period, first);
    }

    #[tokio::test]
    async fn add_item_checks_hours_and_availability() {
        let desk = Desk::new("cart_add_checks.wal").await;
        let camera = desk.serialized_model("Camera A", 1).await;
        let cart = &desk.services.cart;
        let session = Ulid::new();

        let reversed = Period::new(at(11, 12), at(10, 9));
        assert!(matches!(
            cart.add_item(session, camera, desk.location, reversed, 1, vec![]).await,
            Err(EngineError::Validation(_))
        ));
        let night = Period::new(at(10, 22), at(11, 12));
        assert!(matches!(
            cart.add_item(session, camera, desk.location, night, 1, vec![]).await,
            Err(EngineError::ClosedForRange { .. })
        ));
        let day = Period::new(at(10, 9), at(11, 12));
        assert!(matches!(
            cart.add_item(session, camera, desk.location, day, 2, vec![]).await,
            Err(EngineError::InsufficientAvailability { requested: 2, available: 1, .. })
        ));
        assert!(cart.lines(session).is_empty());
    }

    #[tokio::test]
    async fn update_and_remove_lines() {
        let desk = Desk::new("cart_update_remove.wal").await;
        let cable = desk.bulk_model("XLR cable", 5).await;
        let cart = &desk.services.cart;
        let session = Ulid::new();
        let period = Period::new(at(10, 9), at(11, 12));

        let line = cart.add_item(session, cable, desk.location, period, 2, vec![]).await.unwrap();
        let moved = Period::new(at(12, 9), at(13, 12));
        cart.update_item(session, line, moved, 5).await.unwrap();
        assert_eq!(cart.lines(session)[0].period, moved);
        assert_eq!(cart.lines(session)[0].quantity, 5);

        // Rejected updates leave the line as it was.
        assert!(cart.update_item(session, line, moved, 6).await.is_err());
        assert_eq!(cart.lines(session)[0].quantity, 5);

        cart.remove_item(session, line).unwrap();
        assert!(cart.lines(session).is_empty());
        assert!(matches!(cart.remove_item(session, line), Err(EngineError::NotFound(..))));
    }

    #[tokio::test]
    async fn empty_cart_checkout_fails() {
        let desk = Desk::new("cart_empty.wal").await;
        let err = desk
            .services
            .cart
            .checkout(Ulid::new(), desk.borrower, desk.actor)
            .await
            .unwrap_err();
        assert!(err.created.is_empty());
        assert!(matches!(err.source, EngineError::Validation(_)));
    }
}
