//! Metrics and tracing facade for cdxstore.
//!
//! The helpers here emit both metrics (via the `metrics` crate) and
//! lightweight tracing events; without an installed recorder they are
//! near-free, so callers never need to guard them.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use tracing::trace;

/// Record latency for one ingestion request in milliseconds.
pub fn record_ingest_latency(latency: Duration) {
    let ms = latency.as_secs_f64() * 1_000.0;
    histogram!("cdxstore.ingest.latency_ms").record(ms);
    trace!(latency_ms = ms, "ingest latency observed");
}

/// Count records committed by ingestion batches.
pub fn record_records_added(added: u64) {
    if added == 0 {
        return;
    }
    counter!("cdxstore.ingest.records_total").increment(added);
    trace!(added, "records committed");
}

/// Count ingestion batches aborted by a malformed line.
pub fn record_batch_abort() {
    counter!("cdxstore.ingest.aborts_total").increment(1);
    trace!("ingest batch aborted");
}

/// Record latency to first byte for one query in milliseconds.
pub fn record_query_latency(latency: Duration) {
    let ms = latency.as_secs_f64() * 1_000.0;
    histogram!("cdxstore.query.latency_ms").record(ms);
    trace!(latency_ms = ms, "query latency observed");
}

/// Count capture lines written to query responses.
pub fn record_captures_returned(returned: u64) {
    if returned == 0 {
        return;
    }
    counter!("cdxstore.query.captures_total").increment(returned);
    trace!(returned, "captures returned");
}

/// Count captures suppressed by the filter chain.
pub fn record_captures_suppressed(suppressed: u64) {
    if suppressed == 0 {
        return;
    }
    counter!("cdxstore.query.suppressed_total").increment(suppressed);
    trace!(suppressed, "captures suppressed");
}

/// Track the number of open collections.
pub fn record_collection_count(count: u64) {
    gauge!("cdxstore.collections").set(count as f64);
    trace!(count, "collection count recorded");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_without_recorder() {
        record_ingest_latency(Duration::from_millis(5));
        record_records_added(0);
        record_records_added(3);
        record_batch_abort();
        record_query_latency(Duration::from_millis(7));
        record_captures_returned(2);
        record_captures_suppressed(1);
        record_collection_count(4);
    }
}
