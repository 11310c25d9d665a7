//! Object reference templates
//!
//! Acceptors contribute their endpoints to an [`IorTemplate`]; object
//! references minted from the template then carry every address a client
//! can reach the server on.

use crate::encapsulation::{EncapsInput, EncapsOutput};
use crate::error::{OrbError, Result};
use crate::giop_version::GiopVersion;
use bytes::Bytes;
use std::fmt;

/// Tagged component ids
pub mod component_tag {
    pub const ORB_TYPE: u32 = 0;
    pub const CODE_SETS: u32 = 1;
    pub const ALTERNATE_IIOP_ADDRESS: u32 = 3;
    pub const JAVA_CODEBASE: u32 = 25;
}

/// A host and port a server listens on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IiopAddress {
    pub host: String,
    pub port: u16,
}

impl IiopAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    fn write(&self, out: &mut EncapsOutput) {
        out.write_string(&self.host);
        out.write_u16(self.port);
    }

    fn read(input: &mut EncapsInput) -> Result<Self> {
        let host = input.read_string()?;
        let port = input.read_u16()?;
        Ok(Self { host, port })
    }
}

impl fmt::Display for IiopAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A profile component: a tag and its encapsulated data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedComponent {
    pub tag: u32,
    pub data: Bytes,
}

impl TaggedComponent {
    pub fn new(tag: u32, data: Bytes) -> Self {
        Self { tag, data }
    }

    pub fn orb_type(orb_type: u32) -> Self {
        let mut out = EncapsOutput::new(GiopVersion::V1_2);
        out.write_u32(orb_type);
        Self::new(component_tag::ORB_TYPE, out.into_bytes())
    }

    pub fn code_sets(native_char: u32, native_wchar: u32) -> Self {
        let mut out = EncapsOutput::new(GiopVersion::V1_2);
        // native code set, then an empty conversion list, per kind
        out.write_u32(native_char);
        out.write_u32(0);
        out.write_u32(native_wchar);
        out.write_u32(0);
        Self::new(component_tag::CODE_SETS, out.into_bytes())
    }

    pub fn alternate_iiop_address(address: &IiopAddress) -> Self {
        let mut out = EncapsOutput::new(GiopVersion::V1_2);
        address.write(&mut out);
        Self::new(component_tag::ALTERNATE_IIOP_ADDRESS, out.into_bytes())
    }

    pub fn java_codebase(codebase: &str) -> Self {
        let mut out = EncapsOutput::new(GiopVersion::V1_2);
        out.write_string(codebase);
        Self::new(component_tag::JAVA_CODEBASE, out.into_bytes())
    }

    fn input(&self) -> Result<EncapsInput> {
        EncapsInput::new(self.data.clone(), GiopVersion::V1_2)
    }

    /// The address of an ALTERNATE_IIOP_ADDRESS component.
    pub fn as_iiop_address(&self) -> Result<IiopAddress> {
        if self.tag != component_tag::ALTERNATE_IIOP_ADDRESS {
            return Err(OrbError::format(format!(
                "component tag {} is not an address",
                self.tag
            )));
        }
        IiopAddress::read(&mut self.input()?)
    }

    /// The URL list of a JAVA_CODEBASE component.
    pub fn as_codebase(&self) -> Result<String> {
        if self.tag != component_tag::JAVA_CODEBASE {
            return Err(OrbError::format(format!(
                "component tag {} is not a codebase",
                self.tag
            )));
        }
        self.input()?.read_string()
    }
}

/// Template policies consulted by acceptors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplatePolicies {
    /// Advertise endpoints beyond the first as alternate addresses.
    /// Pre-1.1 profiles cannot carry components, so this is ignored there.
    pub alternate_addresses: bool,
}

impl Default for TemplatePolicies {
    fn default() -> Self {
        Self {
            alternate_addresses: true,
        }
    }
}

/// The endpoint part of an IIOP profile under construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IorTemplate {
    version: GiopVersion,
    object_adapter_id: Option<String>,
    primary: Option<IiopAddress>,
    components: Vec<TaggedComponent>,
}

impl IorTemplate {
    pub fn new(version: GiopVersion) -> Self {
        Self {
            version,
            object_adapter_id: None,
            primary: None,
            components: Vec::new(),
        }
    }

    pub fn with_object_adapter_id(mut self, id: impl Into<String>) -> Self {
        self.object_adapter_id = Some(id.into());
        self
    }

    pub fn version(&self) -> GiopVersion {
        self.version
    }

    pub fn object_adapter_id(&self) -> Option<&str> {
        self.object_adapter_id.as_deref()
    }

    pub fn primary_address(&self) -> Option<&IiopAddress> {
        self.primary.as_ref()
    }

    pub fn set_primary_address(&mut self, address: IiopAddress) {
        self.primary = Some(address);
    }

    pub fn supports_components(&self) -> bool {
        self.version.supports_profile_components()
    }

    /// Components are dropped for versions that cannot carry them.
    pub fn add_component(&mut self, component: TaggedComponent) -> bool {
        if !self.supports_components() {
            return false;
        }
        self.components.push(component);
        true
    }

    pub fn has_component(&self, tag: u32) -> bool {
        self.components.iter().any(|c| c.tag == tag)
    }

    pub fn components(&self) -> &[TaggedComponent] {
        &self.components
    }

    pub fn components_with_tag(&self, tag: u32) -> impl Iterator<Item = &TaggedComponent> {
        self.components.iter().filter(move |c| c.tag == tag)
    }

    /// Every reachable address, primary first.
    pub fn addresses(&self) -> Result<Vec<IiopAddress>> {
        let mut addresses: Vec<IiopAddress> = self.primary.iter().cloned().collect();
        for component in self.components_with_tag(component_tag::ALTERNATE_IIOP_ADDRESS) {
            addresses.push(component.as_iiop_address()?);
        }
        Ok(addresses)
    }

    /// Add an endpoint: the first becomes the primary address, later ones
    /// alternates if the policies allow.
    pub fn add_address(&mut self, address: IiopAddress, policies: &TemplatePolicies) {
        if self.primary.is_none() {
            self.primary = Some(address);
        } else if policies.alternate_addresses && self.primary.as_ref() != Some(&address) {
            self.add_component(TaggedComponent::alternate_iiop_address(&address));
        }
    }
}
