//! Per-client upload accounting.
//!
//! Totals are monotonic over the client's lifetime. The windowed
//! counters cover the current one-second window and are reset by the
//! maintenance tick; once the window exceeds the configured cap the
//! `exceeded` latch stays set until the tick disconnects the client.

/// Upload accounting record attached to every client.
#[derive(Debug, Default)]
pub struct UploadMeter {
    total_bytes_in: u64,
    total_messages_in: u64,
    wasted_server_messages: u32,
    window_bytes: u64,
    window_messages: u64,
    exceeded: bool,
}

impl UploadMeter {
    /// Creates an empty meter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one inbound message. Blasted traffic counts toward the
    /// totals but not toward the capped window. Returns `false` once
    /// the client has exceeded the cap.
    pub fn record(&mut self, bytes: usize, blasted: bool, cap: Option<u64>) -> bool {
        self.total_bytes_in = self.total_bytes_in.saturating_add(bytes as u64);
        self.total_messages_in += 1;

        if !blasted {
            self.window_bytes = self.window_bytes.saturating_add(bytes as u64);
            self.window_messages += 1;
            if let Some(cap) = cap {
                if self.window_bytes > cap {
                    self.exceeded = true;
                }
            }
        }
        !self.exceeded
    }

    /// Records one wasted server message and returns the new count.
    pub fn record_wasted(&mut self) -> u32 {
        self.wasted_server_messages += 1;
        self.wasted_server_messages
    }

    /// Resets the one-second window. Exceeded meters keep their window
    /// so the disconnect log can report what was measured.
    pub fn roll_window(&mut self) {
        if !self.exceeded {
            self.window_bytes = 0;
            self.window_messages = 0;
        }
    }

    /// Whether the cap was exceeded in the current window.
    #[must_use]
    pub fn exceeded(&self) -> bool {
        self.exceeded
    }

    /// Bytes received over the client's lifetime.
    #[must_use]
    pub fn total_bytes_in(&self) -> u64 {
        self.total_bytes_in
    }

    /// Messages received over the client's lifetime.
    #[must_use]
    pub fn total_messages_in(&self) -> u64 {
        self.total_messages_in
    }

    /// Wasted server messages so far.
    #[must_use]
    pub fn wasted_server_messages(&self) -> u32 {
        self.wasted_server_messages
    }

    /// Bytes received in the current window.
    #[must_use]
    pub fn window_bytes(&self) -> u64 {
        self.window_bytes
    }

    /// Messages received in the current window.
    #[must_use]
    pub fn window_messages(&self) -> u64 {
        self.window_messages
    }
}
