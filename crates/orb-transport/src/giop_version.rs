//! GIOP protocol versions and request-version negotiation

use crate::error::{OrbError, Result};
use bytes::{Buf, BufMut};
use std::fmt;
use std::str::FromStr;

/// An immutable GIOP (major, minor) version. Ordering is lexicographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GiopVersion {
    major: u8,
    minor: u8,
}

impl GiopVersion {
    /// Wire size of a version (two octets)
    pub const SIZE: usize = 2;

    pub const V1_0: Self = Self::new(1, 0);
    pub const V1_1: Self = Self::new(1, 1);
    pub const V1_2: Self = Self::new(1, 2);
    pub const V1_3: Self = Self::new(1, 3);

    /// Major version reserved for language-native (non-CDR) serialization
    pub const JAVA_SERIALIZATION_MAJOR: u8 = 13;
    /// Marker version announcing the language-native serialization mode
    pub const V13_XX: Self = Self::new(Self::JAVA_SERIALIZATION_MAJOR, 1);

    pub const DEFAULT: Self = Self::V1_2;

    const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// The canonical constant for well-known pairs, a fresh value otherwise.
    pub fn of(major: u8, minor: u8) -> Self {
        match (major, minor) {
            (1, 0) => Self::V1_0,
            (1, 1) => Self::V1_1,
            (1, 2) => Self::V1_2,
            (1, 3) => Self::V1_3,
            (Self::JAVA_SERIALIZATION_MAJOR, 1) => Self::V13_XX,
            _ => Self::new(major, minor),
        }
    }

    pub fn major(&self) -> u8 {
        self.major
    }

    pub fn minor(&self) -> u8 {
        self.minor
    }

    pub fn less_than(&self, other: &Self) -> bool {
        self < other
    }

    /// `major << 8 | minor`
    pub fn as_u16(&self) -> u16 {
        u16::from(self.major) << 8 | u16::from(self.minor)
    }

    /// IIOP profiles carry tagged components from 1.1 on.
    pub fn supports_profile_components(&self) -> bool {
        *self >= Self::V1_1
    }

    pub fn is_java_serialization(&self) -> bool {
        self.major == Self::JAVA_SERIALIZATION_MAJOR
    }

    /// Parse the `major.minor` text form.
    pub fn parse(text: &str) -> Result<Self> {
        let mut parts = text.split('.');
        let (Some(major), Some(minor), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(OrbError::format(format!(
                "GIOP version {:?} must have the form major.minor",
                text
            )));
        };
        let major = major.trim().parse::<u8>().map_err(|_| {
            OrbError::format(format!("GIOP version {:?} has a non-numeric major part", text))
        })?;
        let minor = minor.trim().parse::<u8>().map_err(|_| {
            OrbError::format(format!("GIOP version {:?} has a non-numeric minor part", text))
        })?;
        Ok(Self::of(major, minor))
    }

    /// Pick the version for a request to a peer.
    ///
    /// Legacy peers advertise a newer version in their references than they
    /// can actually speak, so they always get 1.0. Otherwise the lower of the
    /// two versions wins.
    pub fn choose_request_version(local: Self, peer: Self, peer_is_legacy: bool) -> Self {
        if peer_is_legacy {
            return Self::V1_0;
        }
        local.min(peer)
    }

    pub fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.major);
        buf.put_u8(self.minor);
    }

    pub fn read<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(OrbError::format(format!(
                "GIOP version needs {} bytes, have {}",
                Self::SIZE,
                buf.remaining()
            )));
        }
        let major = buf.get_u8();
        let minor = buf.get_u8();
        Ok(Self::of(major, minor))
    }
}

impl Default for GiopVersion {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for GiopVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for GiopVersion {
    type Err = OrbError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
