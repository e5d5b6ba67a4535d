//! Lightweight Prometheus exporter for core runtime metrics.
//!
//! Tracks a small set of process-level counters and gauges over atomics and
//! renders them in Prometheus text exposition format. No exporter crate;
//! the binary serves this from its HTTP listener.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

static SESSIONS_CURRENT: AtomicI64 = AtomicI64::new(0);
static SESSIONS_TOTAL: AtomicU64 = AtomicU64::new(0);
static STANZAS_ROUTED_TOTAL: AtomicU64 = AtomicU64::new(0);
static STANZAS_DELIVERED_TOTAL: AtomicU64 = AtomicU64::new(0);
static OFFLINE_STORED_TOTAL: AtomicU64 = AtomicU64::new(0);
static S2S_FORWARDED_TOTAL: AtomicU64 = AtomicU64::new(0);
static S2S_LINKS_CURRENT: AtomicI64 = AtomicI64::new(0);
static BOSH_SESSIONS_CURRENT: AtomicI64 = AtomicI64::new(0);
static SASL_FAILURES_TOTAL: AtomicU64 = AtomicU64::new(0);

/// A session completed negotiation.
pub fn record_session_opened() {
    SESSIONS_CURRENT.fetch_add(1, Ordering::AcqRel);
    SESSIONS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

/// A session ended.
pub fn record_session_closed() {
    let _ = SESSIONS_CURRENT.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        Some(current.saturating_sub(1))
    });
}

/// The router accepted a stanza.
pub fn record_stanza_routed() {
    STANZAS_ROUTED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

/// A stanza entered a session's outbound lane.
pub fn record_stanza_delivered() {
    STANZAS_DELIVERED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

/// A stanza was handed to the offline store.
pub fn record_offline_stored() {
    OFFLINE_STORED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

/// A stanza was queued for a remote domain.
pub fn record_s2s_forwarded() {
    S2S_FORWARDED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

/// An outbound S2S link reached the authenticated state.
pub fn record_s2s_link_opened() {
    S2S_LINKS_CURRENT.fetch_add(1, Ordering::AcqRel);
}

/// An S2S link went away.
pub fn record_s2s_link_closed() {
    let _ = S2S_LINKS_CURRENT.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        Some(current.saturating_sub(1))
    });
}

/// A BOSH session was created.
pub fn record_bosh_session_opened() {
    BOSH_SESSIONS_CURRENT.fetch_add(1, Ordering::AcqRel);
}

/// A BOSH session was terminated.
pub fn record_bosh_session_closed() {
    let _ = BOSH_SESSIONS_CURRENT.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        Some(current.saturating_sub(1))
    });
}

/// A SASL exchange failed.
pub fn record_sasl_failure() {
    SASL_FAILURES_TOTAL.fetch_add(1, Ordering::Relaxed);
}

fn write_series(out: &mut String, name: &str, kind: &str, help: &str, value: i64) {
    out.push_str(&format!(
        "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n"
    ));
}

/// Render all metrics in Prometheus text exposition format.
pub fn render() -> String {
    let mut out = String::with_capacity(1024);

    let gauge = |out: &mut String, name: &str, help: &str, value: i64| {
        write_series(out, name, "gauge", help, value);
    };
    gauge(
        &mut out,
        "gannet_sessions_current",
        "Sessions currently negotiated",
        SESSIONS_CURRENT.load(Ordering::Acquire),
    );
    gauge(
        &mut out,
        "gannet_s2s_links_current",
        "Authenticated S2S links",
        S2S_LINKS_CURRENT.load(Ordering::Acquire),
    );
    gauge(
        &mut out,
        "gannet_bosh_sessions_current",
        "Live BOSH sessions",
        BOSH_SESSIONS_CURRENT.load(Ordering::Acquire),
    );

    let counter = |out: &mut String, name: &str, help: &str, value: u64| {
        write_series(out, name, "counter", help, value as i64);
    };
    counter(
        &mut out,
        "gannet_sessions_total",
        "Sessions negotiated since start",
        SESSIONS_TOTAL.load(Ordering::Relaxed),
    );
    counter(
        &mut out,
        "gannet_stanzas_routed_total",
        "Stanzas accepted by the router",
        STANZAS_ROUTED_TOTAL.load(Ordering::Relaxed),
    );
    counter(
        &mut out,
        "gannet_stanzas_delivered_total",
        "Stanzas delivered to local sessions",
        STANZAS_DELIVERED_TOTAL.load(Ordering::Relaxed),
    );
    counter(
        &mut out,
        "gannet_offline_stored_total",
        "Stanzas handed to the offline store",
        OFFLINE_STORED_TOTAL.load(Ordering::Relaxed),
    );
    counter(
        &mut out,
        "gannet_s2s_forwarded_total",
        "Stanzas queued for remote domains",
        S2S_FORWARDED_TOTAL.load(Ordering::Relaxed),
    );
    counter(
        &mut out,
        "gannet_sasl_failures_total",
        "Failed SASL exchanges",
        SASL_FAILURES_TOTAL.load(Ordering::Relaxed),
    );

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_contains_all_series() {
        record_session_opened();
        record_stanza_routed();
        let text = render();
        assert!(text.contains("gannet_sessions_current"));
        assert!(text.contains("gannet_stanzas_routed_total"));
        assert!(text.contains("# TYPE gannet_sessions_total counter"));
        record_session_closed();
    }

    #[test]
    fn gauges_never_go_negative() {
        for _ in 0..3 {
            record_s2s_link_closed();
        }
        assert!(S2S_LINKS_CURRENT.load(Ordering::Acquire) >= 0);
    }
}
