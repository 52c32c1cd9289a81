//! Structured observability hooks for the soak run lifecycle.
//!
//! This module provides:
//! - A run-scoped tracing span for instrumenting the run future
//! - Emission functions for lifecycle events: run start/finish, phase
//!   transitions, iteration start, CR submit/finish, extraction outcome
//!
//! Events are emitted at `info!` level (`warn!` for reconciliation
//! mismatches and timeouts) and filtered through `RUST_LOG`.

use tracing::{info, warn};

use crate::model::{CrPhase, Reconciliation};

/// Span covering one run. Attach with `tracing::Instrument::instrument`
/// so it stays correct across awaits.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("tempest_soak.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, namespace: &str, duration_secs: u64) {
    info!(
        event = "run.started",
        run_id = %run_id,
        namespace = %namespace,
        duration_secs = duration_secs,
    );
}

/// Emit event: orchestrator moved to a new phase.
pub fn emit_run_phase(run_id: &str, phase: &str) {
    info!(event = "run.phase", run_id = %run_id, phase = %phase);
}

pub fn emit_iteration_started(run_id: &str, iteration: u32, crs: u32) {
    info!(
        event = "iteration.started",
        run_id = %run_id,
        iteration = iteration,
        crs = crs,
    );
}

pub fn emit_cr_submitted(cr_name: &str, iteration: u32) {
    info!(event = "cr.submitted", cr = %cr_name, iteration = iteration);
}

/// Emit event: CR reached a terminal phase (warn level for timeouts).
pub fn emit_cr_finished(cr_name: &str, phase: CrPhase, elapsed_secs: u64) {
    if phase == CrPhase::TimedOut {
        warn!(event = "cr.finished", cr = %cr_name, phase = %phase, elapsed_secs = elapsed_secs);
    } else {
        info!(event = "cr.finished", cr = %cr_name, phase = %phase, elapsed_secs = elapsed_secs);
    }
}

pub fn emit_extraction_reconciled(
    cr_name: &str,
    pod_name: &str,
    events: u32,
    reconciliation: &Reconciliation,
) {
    let state = match reconciliation {
        Reconciliation::NotPresent => "not_present",
        Reconciliation::Consistent => "consistent",
        Reconciliation::Mismatch { .. } => "mismatch",
    };
    info!(
        event = "extraction.reconciled",
        cr = %cr_name,
        pod = %pod_name,
        events = events,
        totals = state,
    );
}

/// Emit event: run finished with its totals.
pub fn emit_run_finished(
    run_id: &str,
    iterations: u32,
    crs: usize,
    test_events: usize,
    reason: &str,
) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        iterations = iterations,
        crs = crs,
        test_events = test_events,
        reason = %reason,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let _guard = run_span("test-run-id").entered();
        emit_run_phase("test-run-id", "Running");
        emit_cr_finished("cr", CrPhase::TimedOut, 10);
    }
}
