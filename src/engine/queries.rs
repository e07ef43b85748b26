use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::model::*;

use super::{EngineError, ReservationEngine};

impl ReservationEngine {
    pub async fn loan(&self, loan_id: Ulid) -> Result<Loan, EngineError> {
        let row = self.store.loan_row(loan_id)?;
        let guard = row.read().await;
        Ok(guard.clone())
    }

    /// Audit trail of a loan, oldest first.
    pub async fn history(&self, loan_id: Ulid) -> Result<Vec<LoanEvent>, EngineError> {
        let row = self.store.loan_row(loan_id)?;
        let guard = row.read().await;
        Ok(guard.history.clone())
    }

    /// Every loan of a borrower, ordered by start.
    pub async fn loans_for_borrower(&self, borrower_id: Ulid) -> Vec<Loan> {
        let mut loans = Vec::new();
        for row in self.store.loan_rows() {
            let guard = row.read().await;
            if guard.borrower_id == borrower_id {
                loans.push(guard.clone());
            }
        }
        loans.sort_by_key(|l| (l.period.start, l.id));
        loans
    }

    /// Active loans at a location whose period conflicts with `period`.
    pub async fn loans_overlapping(&self, location_id: Ulid, period: Period) -> Vec<Loan> {
        let granularity = self.availability.granularity();
        let mut loans = Vec::new();
        for row in self.store.loan_rows() {
            let guard = row.read().await;
            if guard.location_id == location_id
                && guard.status.is_active()
                && guard.period.conflicts(&period, granularity)
            {
                loans.push(guard.clone());
            }
        }
        loans.sort_by_key(|l| (l.period.start, l.id));
        loans
    }

    /// Handed-over loans whose period ended before `now`.
    pub fn due_for_overdue(&self, now: NaiveDateTime) -> Vec<Ulid> {
        let mut due = Vec::new();
        for row in self.store.loan_rows() {
            // Rows locked by a running transaction are picked up on the next sweep.
            let Ok(guard) = row.try_read() else {
                tracing::debug!("overdue sweep skipped a busy loan");
                continue;
            };
            if guard.status == LoanStatus::HandedOver && guard.period.end < now {
                due.push(guard.id);
            }
        }
        due.sort();
        due
    }
}
