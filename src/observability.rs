use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::BuildError;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: engine operations executed. Labels: operation, status.
pub const OPERATIONS_TOTAL: &str = "kitroom_operations_total";

/// Histogram: operation latency in seconds. Labels: operation.
pub const OPERATION_DURATION_SECONDS: &str = "kitroom_operation_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: loan state transitions. Labels: transition.
pub const LOAN_TRANSITIONS_TOTAL: &str = "kitroom_loan_transitions_total";

/// Counter: bulk stock releases or write-offs clamped by the ledger.
pub const LEDGER_CLAMPED_TOTAL: &str = "kitroom_ledger_clamped_total";

/// Counter: cart checkouts. Labels: status.
pub const CHECKOUTS_TOTAL: &str = "kitroom_checkouts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "kitroom_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (transactions per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "kitroom_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Status label for an operation outcome: `ok` or the error's code.
pub fn status_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    }
}

/// Count and time one engine operation.
pub fn record<T>(operation: &'static str, started: Instant, result: &Result<T, EngineError>) {
    metrics::counter!(OPERATIONS_TOTAL, "operation" => operation, "status" => status_label(result)).increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "operation" => operation)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = result {
        tracing::debug!(operation, code = e.code(), "operation failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn status_label_uses_error_code() {
        let ok: Result<(), EngineError> = Ok(());
        assert_eq!(status_label(&ok), "ok");
        let err: Result<(), EngineError> = Err(EngineError::NotFound("loan", Ulid::new()));
        assert_eq!(status_label(&err), "not_found");
    }
}
