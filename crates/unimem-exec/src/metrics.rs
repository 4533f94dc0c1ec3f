//! Metrics/tracing hooks.
//!
//! Events are plain `tracing` records; wire them to a collector in the
//! binary layer.

use crate::registry::AccountantKind;

pub fn emit_span(event: &str, key_values: &[(&str, String)]) {
    let span = tracing::span!(tracing::Level::TRACE, "unimem", event);
    let _entered = span.enter();
    for (k, v) in key_values {
        tracing::trace!(%event, %k, %v, "metric");
    }
}

pub(crate) fn record_resolution(kind: AccountantKind, accountant: &str) {
    emit_span(
        "accountant_resolved",
        &[
            ("kind", kind.to_string()),
            ("accountant", accountant.to_string()),
        ],
    );
}

pub(crate) fn record_allocation(owner: &str, size: usize, accounted: u64) {
    emit_span(
        "execution_allocation",
        &[
            ("owner", owner.to_string()),
            ("size", size.to_string()),
            ("accounted", accounted.to_string()),
        ],
    );
}
