//! Connect-time admission policy: the escalating per-IP ban list.
//!
//! Entries are swept lazily on connect and on the maintenance tick.
//! Repeat offenders are held longer: a refused connect extends the
//! entry by `disconnect_count << 2` hours.

use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Cooldown for a ban created by a protocol violation.
pub const PROTOCOL_BAN: Duration = Duration::from_secs(30 * 60);
/// Cooldown for a ban created by an upload-cap breach.
pub const UPLOAD_BAN: Duration = Duration::from_secs(60);
/// Cooldown for a ban created by wasted server messages.
pub const WASTED_BAN: Duration = Duration::from_secs(60 * 60);

/// Refused connects beyond this disconnect count are denied outright.
const DENY_THRESHOLD: u32 = 3;

/// One banned (or watched) address.
#[derive(Debug, Clone)]
pub struct BanEntry {
    /// The offending address.
    pub ip: IpAddr,
    /// How many times this address has been disconnected for cause.
    pub disconnect_count: u32,
    /// Human-readable reason, echoed in connect denials.
    pub reason: String,
    /// When the entry expires.
    pub reset_at: Instant,
}

/// The per-IP ban list.
#[derive(Debug, Default)]
pub struct BanList {
    entries: Vec<BanEntry>,
}

impl BanList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admission check for a connecting address. Expired entries are
    /// evicted; an address over the threshold is refused with the
    /// recorded reason and its cooldown is extended.
    pub fn check_connect(&mut self, ip: IpAddr, now: Instant) -> Option<String> {
        let idx = self.entries.iter().position(|e| e.ip == ip)?;
        if self.entries[idx].reset_at <= now {
            self.entries.swap_remove(idx);
            return None;
        }
        let entry = &mut self.entries[idx];
        if entry.disconnect_count > DENY_THRESHOLD {
            let hours = u64::from(entry.disconnect_count) << 2;
            entry.reset_at = now + Duration::from_secs(hours * 60 * 60);
            entry.disconnect_count += 1;
            return Some(entry.reason.clone());
        }
        None
    }

    /// Records one disconnect-for-cause: creates an entry with the
    /// given cooldown, or bumps the count of an existing one.
    pub fn record(&mut self, ip: IpAddr, reason: &str, cooldown: Duration, now: Instant) {
        match self.entries.iter_mut().find(|e| e.ip == ip) {
            Some(entry) => entry.disconnect_count += 1,
            None => self.entries.push(BanEntry {
                ip,
                disconnect_count: 1,
                reason: reason.to_owned(),
                reset_at: now + cooldown,
            }),
        }
    }

    /// Evicts every expired entry.
    pub fn sweep(&mut self, now: Instant) {
        self.entries.retain(|e| e.reset_at > now);
    }

    /// Looks up the entry for an address.
    #[must_use]
    pub fn get(&self, ip: IpAddr) -> Option<&BanEntry> {
        self.entries.iter().find(|e| e.ip == ip)
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
