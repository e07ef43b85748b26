use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::clock::Clock;
use crate::engine::{ReservationEngine, Store};
use crate::model::SYSTEM_ACTOR;

/// One pass of the overdue sweep: flag handed-over loans past their end.
/// Returns how many loans were marked.
pub async fn sweep_overdue(reservations: &ReservationEngine, clock: &dyn Clock) -> usize {
    let due = reservations.due_for_overdue(clock.now());
    let mut marked = 0;
    for loan_id in due {
        match reservations.mark_overdue(loan_id, SYSTEM_ACTOR).await {
            Ok(()) => {
                info!("marked loan {loan_id} overdue");
                marked += 1;
            }
            Err(e) => {
                // Returned or already flagged since the scan; that's fine
                tracing::debug!("overdue sweep skip {loan_id}: {e}");
            }
        }
    }
    marked
}

/// Background task that periodically flags overdue loans.
pub async fn run_overdue_sweeper(reservations: Arc<ReservationEngine>, clock: Arc<dyn Clock>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep_overdue(&reservations, &*clock).await;
    }
}

/// Background task that compacts the WAL once enough transactions have piled up.
pub async fn run_compactor(store: Arc<Store>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        store.notify.prune();
        let appends = store.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::tests::{at, Desk};
    use crate::model::*;
    use chrono::TimeDelta;

    #[tokio::test]
    async fn sweeper_marks_only_loans_past_due() {
        let desk = Desk::new("sweeper_marks_only_loans_past_due.wal").await;
        let camera = desk.serialized_model("Camera A", 3).await;

        let due = desk.reserve(&[ItemRequest::new(camera, 1)], at(10, 9), at(12, 17)).await;
        desk.hand_over_all(due).await;
        let later = desk.reserve(&[ItemRequest::new(camera, 1)], at(10, 9), at(20, 17)).await;
        desk.hand_over_all(later).await;
        let never_picked_up = desk.reserve(&[ItemRequest::new(camera, 1)], at(13, 9), at(14, 17)).await;

        let clock = ManualClock::new(at(13, 12));
        assert_eq!(sweep_overdue(&desk.services.reservations, &clock).await, 1);

        let loan = desk.services.reservations.loan(due).await.unwrap();
        assert_eq!(loan.status, LoanStatus::Overdue);
        assert_eq!(loan.history.last().map(|e| e.actor), Some(SYSTEM_ACTOR));
        assert_eq!(
            desk.services.reservations.loan(later).await.unwrap().status,
            LoanStatus::HandedOver
        );
        assert_eq!(
            desk.services.reservations.loan(never_picked_up).await.unwrap().status,
            LoanStatus::Reserved
        );

        // Already overdue: the next sweep has nothing to do.
        clock.advance(TimeDelta::hours(1));
        assert_eq!(sweep_overdue(&desk.services.reservations, &clock).await, 0);
    }
}
