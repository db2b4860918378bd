//! Metric names recorded through the `metrics` facade. Hosts that want
//! an exporter install their own recorder before starting the server.

/// Population gauges.
pub mod gauges {
    /// Increment the connected-clients gauge.
    pub fn inc_clients_active() {
        metrics::gauge!("conflux_clients_active").increment(1.0);
    }

    /// Decrement the connected-clients gauge.
    pub fn dec_clients_active() {
        metrics::gauge!("conflux_clients_active").decrement(1.0);
    }

    /// Increment the live-channels gauge.
    pub fn inc_channels_active() {
        metrics::gauge!("conflux_channels_active").increment(1.0);
    }

    /// Decrement the live-channels gauge.
    pub fn dec_channels_active() {
        metrics::gauge!("conflux_channels_active").decrement(1.0);
    }
}

/// Event counters.
pub mod counters {
    /// Record a handshake outcome with the given status label.
    pub fn connects_total(status: &'static str) {
        metrics::counter!("conflux_connects_total", "status" => status).increment(1);
    }

    /// Increment the forwarded-messages counter.
    pub fn messages_relayed_total() {
        metrics::counter!("conflux_messages_relayed_total").increment(1);
    }

    /// Increment the dropped-messages counter with the given reason label.
    pub fn messages_dropped_total(reason: &'static str) {
        metrics::counter!("conflux_messages_dropped_total", "reason" => reason).increment(1);
    }

    /// Record payload bytes moving through the relay.
    pub fn payload_bytes_total(direction: &'static str, bytes: u64) {
        metrics::counter!("conflux_payload_bytes_total", "direction" => direction).increment(bytes);
    }
}
