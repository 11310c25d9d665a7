//! Built-in service contexts

use super::ServiceContext;
use crate::encapsulation::{EncapsInput, EncapsOutput};
use crate::error::Result;
use crate::orb_version::OrbVersion;
use std::any::Any;
use std::sync::Arc;

/// OSF code set registry values
pub mod code_set {
    pub const ISO_8859_1: u32 = 0x0001_0001;
    pub const UTF_16: u32 = 0x0001_0109;
    pub const UCS_2: u32 = 0x0001_0100;
    pub const UTF_8: u32 = 0x0501_0001;

    pub fn name(code_set: u32) -> &'static str {
        match code_set {
            ISO_8859_1 => "ISO-8859-1",
            UTF_16 => "UTF-16",
            UCS_2 => "UCS-2",
            UTF_8 => "UTF-8",
            _ => "unknown",
        }
    }
}

/// Transmission code sets chosen by the client, sent on the first request
/// of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeSetServiceContext {
    char_data: u32,
    wchar_data: u32,
}

impl CodeSetServiceContext {
    pub const ID: u32 = 1;

    pub fn new(char_data: u32, wchar_data: u32) -> Self {
        Self {
            char_data,
            wchar_data,
        }
    }

    pub fn char_data(&self) -> u32 {
        self.char_data
    }

    pub fn wchar_data(&self) -> u32 {
        self.wchar_data
    }

    pub fn decode(input: &mut EncapsInput) -> Result<Arc<dyn ServiceContext>> {
        let char_data = input.read_u32()?;
        let wchar_data = input.read_u32()?;
        Ok(Arc::new(Self::new(char_data, wchar_data)))
    }
}

impl Default for CodeSetServiceContext {
    fn default() -> Self {
        Self::new(code_set::ISO_8859_1, code_set::UTF_16)
    }
}

impl ServiceContext for CodeSetServiceContext {
    fn id(&self) -> u32 {
        Self::ID
    }

    fn write_data(&self, out: &mut EncapsOutput) {
        out.write_u32(self.char_data);
        out.write_u32(self.wchar_data);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Reference to the sender's code base, as a stringified IOR
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendingContextRunTime {
    codebase_ior: String,
}

impl SendingContextRunTime {
    pub const ID: u32 = 6;

    pub fn new(codebase_ior: impl Into<String>) -> Self {
        Self {
            codebase_ior: codebase_ior.into(),
        }
    }

    pub fn codebase_ior(&self) -> &str {
        &self.codebase_ior
    }

    pub fn decode(input: &mut EncapsInput) -> Result<Arc<dyn ServiceContext>> {
        Ok(Arc::new(Self::new(input.read_string()?)))
    }
}

impl ServiceContext for SendingContextRunTime {
    fn id(&self) -> u32 {
        Self::ID
    }

    fn write_data(&self, out: &mut EncapsOutput) {
        out.write_string(&self.codebase_ior);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Highest value-type stream format the sender understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStreamFormatVersionServiceContext {
    version: u8,
}

impl MaxStreamFormatVersionServiceContext {
    pub const ID: u32 = 17;

    pub fn new(version: u8) -> Self {
        Self { version }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn decode(input: &mut EncapsInput) -> Result<Arc<dyn ServiceContext>> {
        Ok(Arc::new(Self::new(input.read_u8()?)))
    }
}

impl ServiceContext for MaxStreamFormatVersionServiceContext {
    fn id(&self) -> u32 {
        Self::ID
    }

    fn write_data(&self, out: &mut EncapsOutput) {
        out.write_u8(self.version);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The sender's ORB version. Lets the receiver detect legacy peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrbVersionServiceContext {
    version: OrbVersion,
}

impl OrbVersionServiceContext {
    /// Vendor service context id ("JAV" + 0)
    pub const ID: u32 = 0x4A41_5600;

    pub fn new(version: OrbVersion) -> Self {
        Self { version }
    }

    pub fn version(&self) -> OrbVersion {
        self.version
    }

    pub fn decode(input: &mut EncapsInput) -> Result<Arc<dyn ServiceContext>> {
        Ok(Arc::new(Self::new(OrbVersion::new(input.read_u8()?))))
    }
}

impl ServiceContext for OrbVersionServiceContext {
    fn id(&self) -> u32 {
        Self::ID
    }

    fn write_data(&self, out: &mut EncapsOutput) {
        out.write_u8(self.version.orb_type());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
