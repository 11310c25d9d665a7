//! ORB implementation versions and the legacy-peer predicate

use crate::giop_version::GiopVersion;
use std::fmt;

/// Version tag identifying which ORB implementation produced a reference
/// or a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrbVersion(u8);

impl OrbVersion {
    /// Any ORB from another vendor
    pub const FOREIGN: Self = Self(0);
    pub const OLD: Self = Self(1);
    pub const NEW: Self = Self(2);
    pub const JDK1_3_1_01: Self = Self(3);
    pub const NEWER: Self = Self(10);
    pub const PEORB: Self = Self(20);

    pub const fn new(orb_type: u8) -> Self {
        Self(orb_type)
    }

    pub fn orb_type(&self) -> u8 {
        self.0
    }

    pub fn is_foreign(&self) -> bool {
        *self == Self::FOREIGN
    }

    pub fn less_than(&self, other: &Self) -> bool {
        self < other
    }
}

impl Default for OrbVersion {
    fn default() -> Self {
        Self::PEORB
    }
}

impl fmt::Display for OrbVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::FOREIGN => f.write_str("FOREIGN"),
            Self::OLD => f.write_str("OLD"),
            Self::NEW => f.write_str("NEW"),
            Self::JDK1_3_1_01 => f.write_str("JDK1_3_1_01"),
            Self::NEWER => f.write_str("NEWER"),
            Self::PEORB => f.write_str("PEORB"),
            Self(other) => write!(f, "ORB({})", other),
        }
    }
}

/// Decides whether a peer must be treated as legacy during version
/// negotiation.
///
/// A peer is legacy when it is one of our own ORB family (not
/// [`OrbVersion::FOREIGN`]) and older than `newer_than`. The threshold is
/// product-specific, hence configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyPeerPolicy {
    pub newer_than: OrbVersion,
}

impl Default for LegacyPeerPolicy {
    fn default() -> Self {
        Self {
            newer_than: OrbVersion::NEWER,
        }
    }
}

impl LegacyPeerPolicy {
    pub fn new(newer_than: OrbVersion) -> Self {
        Self { newer_than }
    }

    pub fn is_legacy(&self, peer: OrbVersion) -> bool {
        !peer.is_foreign() && peer.less_than(&self.newer_than)
    }

    /// Negotiate a request version. An unknown peer ORB is treated as
    /// foreign.
    pub fn choose_request_version(
        &self,
        local: GiopVersion,
        peer: GiopVersion,
        peer_orb: Option<OrbVersion>,
    ) -> GiopVersion {
        let legacy = peer_orb.is_some_and(|orb| self.is_legacy(orb));
        GiopVersion::choose_request_version(local, peer, legacy)
    }
}
