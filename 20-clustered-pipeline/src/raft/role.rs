//! Node role encoding.
//!
//! The low four bits hold exactly one core role; the high bits are flags for
//! topology changes (`JOINT`) and gateway peers (`GATE`, `OUTSIDE`). Only the
//! combinations in [`RaftState::decode`]'s table are accepted.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RoleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CoreRole {
    /// Non-voting client of the cluster.
    Client = 0,
    Follower = 1,
    /// Campaigning for leadership in the current term.
    Elector = 2,
    /// Advertised as eligible for election but not yet voting.
    Candidate = 4,
    Leader = 8,
}

impl CoreRole {
    fn name(self) -> &'static str {
        match self {
            CoreRole::Client => "CLIENT",
            CoreRole::Follower => "FOLLOWER",
            CoreRole::Elector => "ELECTOR",
            CoreRole::Candidate => "CANDIDATE",
            CoreRole::Leader => "LEADER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct RaftState {
    bits: u8,
}

impl RaftState {
    pub const ROLE_MASK: u8 = 15;
    pub const JOINT: u8 = 16;
    pub const GATE: u8 = 32;
    pub const OUTSIDE: u8 = 128;
    const FLAG_MASK: u8 = Self::JOINT | Self::GATE | Self::OUTSIDE;

    pub const CLIENT: Self = Self::of(CoreRole::Client);
    pub const FOLLOWER: Self = Self::of(CoreRole::Follower);
    pub const ELECTOR: Self = Self::of(CoreRole::Elector);
    pub const CANDIDATE: Self = Self::of(CoreRole::Candidate);
    pub const LEADER: Self = Self::of(CoreRole::Leader);

    pub const fn of(core: CoreRole) -> Self {
        Self { bits: core as u8 }
    }

    /// Validates a raw bit pattern.
    ///
    /// | flag    | allowed core roles                   |
    /// |---------|--------------------------------------|
    /// | JOINT   | FOLLOWER, ELECTOR, LEADER            |
    /// | GATE    | CLIENT, FOLLOWER, ELECTOR, LEADER    |
    /// | OUTSIDE | CLIENT                               |
    pub fn decode(bits: u8) -> Result<Self, RoleError> {
        if bits & !(Self::ROLE_MASK | Self::FLAG_MASK) != 0 {
            return Err(RoleError::UnknownBits(bits));
        }
        let core = match bits & Self::ROLE_MASK {
            0 => CoreRole::Client,
            1 => CoreRole::Follower,
            2 => CoreRole::Elector,
            4 => CoreRole::Candidate,
            8 => CoreRole::Leader,
            _ => return Err(RoleError::UnknownBits(bits)),
        };
        let flags = bits & Self::FLAG_MASK;
        for (flag, name, allowed) in [
            (
                Self::JOINT,
                "JOINT",
                &[CoreRole::Follower, CoreRole::Elector, CoreRole::Leader][..],
            ),
            (
                Self::GATE,
                "GATE",
                &[
                    CoreRole::Client,
                    CoreRole::Follower,
                    CoreRole::Elector,
                    CoreRole::Leader,
                ][..],
            ),
            (Self::OUTSIDE, "OUTSIDE", &[CoreRole::Client][..]),
        ] {
            if flags & flag != 0 && !allowed.contains(&core) {
                return Err(RoleError::InvalidCombination {
                    core: core.name(),
                    flag: name,
                });
            }
        }
        Ok(Self { bits })
    }

    pub fn bits(self) -> u8 {
        self.bits
    }

    pub fn core(self) -> CoreRole {
        match self.bits & Self::ROLE_MASK {
            1 => CoreRole::Follower,
            2 => CoreRole::Elector,
            4 => CoreRole::Candidate,
            8 => CoreRole::Leader,
            _ => CoreRole::Client,
        }
    }

    /// Same flags, different core role.
    pub fn with_core(self, core: CoreRole) -> Result<Self, RoleError> {
        Self::decode((self.bits & Self::FLAG_MASK) | core as u8)
    }

    pub fn with_flag(self, flag: u8) -> Result<Self, RoleError> {
        Self::decode(self.bits | flag)
    }

    pub fn has_flag(self, flag: u8) -> bool {
        self.bits & flag != 0
    }

    pub fn is_leader(self) -> bool {
        self.core() == CoreRole::Leader
    }

    pub fn is_joint(self) -> bool {
        self.has_flag(Self::JOINT)
    }

    pub fn is_gate(self) -> bool {
        self.has_flag(Self::GATE)
    }

    /// Voting member of the cluster.
    pub fn is_in_congress(self) -> bool {
        !self.has_flag(Self::OUTSIDE)
            && matches!(
                self.core(),
                CoreRole::Follower | CoreRole::Elector | CoreRole::Leader
            )
    }
}

impl TryFrom<u8> for RaftState {
    type Error = RoleError;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        Self::decode(bits)
    }
}

impl From<RaftState> for u8 {
    fn from(state: RaftState) -> Self {
        state.bits
    }
}

impl fmt::Display for RaftState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.core().name())?;
        for (flag, name) in [
            (Self::JOINT, "JOINT"),
            (Self::GATE, "GATE"),
            (Self::OUTSIDE, "OUTSIDE"),
        ] {
            if self.has_flag(flag) {
                write!(f, "|{name}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_roles_decode() {
        for (bits, core) in [
            (0, CoreRole::Client),
            (1, CoreRole::Follower),
            (2, CoreRole::Elector),
            (4, CoreRole::Candidate),
            (8, CoreRole::Leader),
        ] {
            assert_eq!(RaftState::decode(bits).unwrap().core(), core);
        }
    }

    #[test]
    fn mixed_core_bits_are_rejected() {
        assert_eq!(RaftState::decode(3), Err(RoleError::UnknownBits(3)));
        assert_eq!(RaftState::decode(64 | 1), Err(RoleError::UnknownBits(65)));
    }

    #[test]
    fn flag_table_is_enforced() {
        assert!(RaftState::decode(8 | RaftState::GATE).is_ok());
        assert!(RaftState::decode(1 | RaftState::JOINT | RaftState::GATE).is_ok());
        assert!(RaftState::decode(RaftState::OUTSIDE).is_ok());
        assert_eq!(
            RaftState::decode(1 | RaftState::OUTSIDE),
            Err(RoleError::InvalidCombination {
                core: "FOLLOWER",
                flag: "OUTSIDE"
            })
        );
        assert!(RaftState::decode(RaftState::JOINT).is_err());
        assert!(RaftState::decode(4 | RaftState::GATE).is_err());
    }

    #[test]
    fn congress_membership() {
        assert!(RaftState::FOLLOWER.is_in_congress());
        assert!(RaftState::LEADER.is_in_congress());
        assert!(!RaftState::CLIENT.is_in_congress());
        assert!(!RaftState::CANDIDATE.is_in_congress());
        let gate_client = RaftState::decode(RaftState::GATE).unwrap();
        assert!(!gate_client.is_in_congress());
    }

    #[test]
    fn with_core_keeps_flags() {
        let state = RaftState::FOLLOWER.with_flag(RaftState::JOINT).unwrap();
        let leader = state.with_core(CoreRole::Leader).unwrap();
        assert!(leader.is_leader() && leader.is_joint());
        assert_eq!(leader.to_string(), "LEADER|JOINT");
        assert!(state.with_core(CoreRole::Client).is_err());
    }
}
