//! Channel state: named rendezvous with an ordered membership.

use std::time::Instant;

use conflux_wire::types::{channel_flags, peer_flags};
use conflux_wire::ClientId;

/// A named channel. The registry key is the lowercased name; `name`
/// keeps the casing of the creating join.
#[derive(Debug)]
pub struct Channel {
    /// Channel name in its original casing.
    pub name: String,
    /// Members in join order; the master (if any) is at the head.
    pub members: Vec<ClientId>,
    /// The creating client, while it remains a member. Never
    /// reassigned: a channel whose master left stays masterless.
    pub master: Option<ClientId>,
    /// Hidden from the channel list.
    pub hidden: bool,
    /// Closes when the master leaves.
    pub autoclose: bool,
    /// When the channel was created.
    pub created_at: Instant,
}

impl Channel {
    /// Creates a channel with `master` as its first member.
    #[must_use]
    pub fn new(name: String, master: ClientId, flags: u8, now: Instant) -> Self {
        Self {
            name,
            members: vec![master],
            master: Some(master),
            hidden: flags & channel_flags::HIDDEN != 0,
            autoclose: flags & channel_flags::AUTOCLOSE != 0,
            created_at: now,
        }
    }

    /// Registry key for a channel name.
    #[must_use]
    pub fn key(name: &str) -> String {
        name.to_lowercase()
    }

    /// Whether `id` is a member.
    #[must_use]
    pub fn is_member(&self, id: ClientId) -> bool {
        self.members.contains(&id)
    }

    /// Appends a non-master member.
    pub fn add_member(&mut self, id: ClientId) {
        self.members.push(id);
    }

    /// Removes a member. Returns `true` if it was present; clears the
    /// master slot when the master leaves.
    pub fn remove_member(&mut self, id: ClientId) -> bool {
        let Some(pos) = self.members.iter().position(|&m| m == id) else {
            return false;
        };
        self.members.remove(pos);
        if self.master == Some(id) {
            self.master = None;
        }
        true
    }

    /// The effective channel flags as carried on the wire.
    #[must_use]
    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.hidden {
            flags |= channel_flags::HIDDEN;
        }
        if self.autoclose {
            flags |= channel_flags::AUTOCLOSE;
        }
        flags
    }

    /// Wire flags for one member.
    #[must_use]
    pub fn member_flags(&self, id: ClientId) -> u8 {
        if self.master == Some(id) {
            peer_flags::MASTER
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_case_insensitive() {
        assert_eq!(Channel::key("Lobby"), Channel::key("LOBBY"));
    }

    #[test]
    fn creator_is_master_and_first_member() {
        let ch = Channel::new("Lobby".into(), 3, 0, Instant::now());
        assert_eq!(ch.master, Some(3));
        assert_eq!(ch.members, vec![3]);
        assert_eq!(ch.member_flags(3), peer_flags::MASTER);
    }

    #[test]
    fn flags_round_trip_through_wire_bits() {
        let ch = Channel::new(
            "x".into(),
            1,
            channel_flags::HIDDEN | channel_flags::AUTOCLOSE,
            Instant::now(),
        );
        assert!(ch.hidden);
        assert!(ch.autoclose);
        assert_eq!(
            ch.flags(),
            channel_flags::HIDDEN | channel_flags::AUTOCLOSE
        );
    }

    #[test]
    fn master_leaving_clears_master_without_promotion() {
        let mut ch = Channel::new("x".into(), 1, 0, Instant::now());
        ch.add_member(2);
        ch.add_member(3);
        assert!(ch.remove_member(1));
        assert_eq!(ch.master, None);
        assert_eq!(ch.members, vec![2, 3]);
        assert_eq!(ch.member_flags(2), 0);
    }

    #[test]
    fn remove_absent_member_is_noop() {
        let mut ch = Channel::new("x".into(), 1, 0, Instant::now());
        assert!(!ch.remove_member(9));
        assert_eq!(ch.members, vec![1]);
    }
}
