//! Service contexts
//!
//! Typed, id-tagged metadata carried alongside requests and replies. Each
//! context travels as its id followed by a length-prefixed encapsulation.
//! A [`ServiceContextRegistry`] maps ids to decoders; contexts with no
//! registered decoder are kept as raw bytes so they can be forwarded
//! untouched.

mod standard;

pub use standard::{
    code_set, CodeSetServiceContext, MaxStreamFormatVersionServiceContext,
    OrbVersionServiceContext, SendingContextRunTime,
};

use crate::encapsulation::{EncapsInput, EncapsOutput};
use crate::error::{ErrorKind, OrbError, Result};
use crate::giop_version::GiopVersion;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A typed service context
pub trait ServiceContext: fmt::Debug + Send + Sync + 'static {
    fn id(&self) -> u32;

    /// Write the payload into an encapsulation.
    fn write_data(&self, out: &mut EncapsOutput);

    /// The complete encapsulated payload.
    fn encode(&self, version: GiopVersion) -> Bytes {
        let mut out = EncapsOutput::new(version);
        self.write_data(&mut out);
        out.into_bytes()
    }

    fn as_any(&self) -> &dyn Any;
}

/// Decodes a context payload. The byte order octet has already been
/// consumed from the input.
pub type ServiceContextDecoder = fn(&mut EncapsInput) -> Result<Arc<dyn ServiceContext>>;

/// Maps service context ids to decoders
#[derive(Clone, Default)]
pub struct ServiceContextRegistry {
    decoders: HashMap<u32, ServiceContextDecoder>,
}

impl ServiceContextRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that knows the built-in contexts.
    pub fn with_standard_contexts() -> Self {
        let mut registry = Self::new();
        registry.register(CodeSetServiceContext::ID, CodeSetServiceContext::decode);
        registry.register(SendingContextRunTime::ID, SendingContextRunTime::decode);
        registry.register(
            MaxStreamFormatVersionServiceContext::ID,
            MaxStreamFormatVersionServiceContext::decode,
        );
        registry.register(OrbVersionServiceContext::ID, OrbVersionServiceContext::decode);
        registry
    }

    /// Register a decoder, replacing any previous one for `id`.
    pub fn register(&mut self, id: u32, decoder: ServiceContextDecoder) {
        if self.decoders.insert(id, decoder).is_some() {
            debug!(id, "Replaced service context decoder");
        }
    }

    pub fn is_registered(&self, id: u32) -> bool {
        self.decoders.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decode an encapsulated payload for `id`.
    ///
    /// Returns [`ErrorKind::UnknownServiceContext`] when no decoder is
    /// registered and a format error when the payload is malformed.
    pub fn decode(
        &self,
        id: u32,
        data: Bytes,
        version: GiopVersion,
    ) -> Result<Arc<dyn ServiceContext>> {
        let decoder = self
            .decoders
            .get(&id)
            .ok_or_else(|| OrbError::from(ErrorKind::UnknownServiceContext(id)))?;
        let mut input = EncapsInput::new(data, version)?;
        decoder(&mut input)
    }
}

impl fmt::Debug for ServiceContextRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.decoders.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("ServiceContextRegistry")
            .field("ids", &ids)
            .finish()
    }
}

/// Write one context: id, then the length-prefixed encapsulation.
pub fn write_service_context(ctx: &dyn ServiceContext, buf: &mut BytesMut, version: GiopVersion) {
    let data = ctx.encode(version);
    buf.put_u32(ctx.id());
    buf.put_u32(data.len() as u32);
    buf.put_slice(&data);
}

/// A context with no registered decoder, kept verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownServiceContext {
    id: u32,
    data: Bytes,
}

impl UnknownServiceContext {
    pub fn new(id: u32, data: Bytes) -> Self {
        Self { id, data }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

impl ServiceContext for UnknownServiceContext {
    fn id(&self) -> u32 {
        self.id
    }

    fn write_data(&self, _out: &mut EncapsOutput) {}

    fn encode(&self, _version: GiopVersion) -> Bytes {
        self.data.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The service context list of one message, at most one context per id
#[derive(Debug, Clone, Default)]
pub struct ServiceContexts {
    entries: BTreeMap<u32, Arc<dyn ServiceContext>>,
}

impl ServiceContexts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a context, returning the one it replaced.
    pub fn put(&mut self, ctx: Arc<dyn ServiceContext>) -> Option<Arc<dyn ServiceContext>> {
        self.entries.insert(ctx.id(), ctx)
    }

    pub fn get(&self, id: u32) -> Option<&Arc<dyn ServiceContext>> {
        self.entries.get(&id)
    }

    /// Typed lookup
    pub fn get_as<T: ServiceContext>(&self, id: u32) -> Option<&T> {
        self.entries.get(&id)?.as_any().downcast_ref::<T>()
    }

    pub fn remove(&mut self, id: u32) -> Option<Arc<dyn ServiceContext>> {
        self.entries.remove(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ServiceContext>> {
        self.entries.values()
    }

    /// Count, then each context.
    pub fn write(&self, buf: &mut BytesMut, version: GiopVersion) {
        buf.put_u32(self.entries.len() as u32);
        for ctx in self.entries.values() {
            write_service_context(ctx.as_ref(), buf, version);
        }
    }

    /// Read a context list. Unknown ids are kept raw; malformed payloads
    /// of known ids fail the whole list.
    pub fn read(
        buf: &mut Bytes,
        version: GiopVersion,
        registry: &ServiceContextRegistry,
    ) -> Result<Self> {
        let count = read_u32(buf, "service context count")?;
        let mut contexts = Self::new();
        for _ in 0..count {
            let id = read_u32(buf, "service context id")?;
            let len = read_u32(buf, "service context length")? as usize;
            if buf.remaining() < len {
                return Err(OrbError::format(format!(
                    "service context 0x{:08x} declares {} bytes, have {}",
                    id,
                    len,
                    buf.remaining()
                )));
            }
            let data = buf.split_to(len);
            let ctx = match registry.decode(id, data.clone(), version) {
                Ok(ctx) => ctx,
                Err(e) if matches!(e.kind(), ErrorKind::UnknownServiceContext(_)) => {
                    debug!(id, len, "Keeping unknown service context");
                    Arc::new(UnknownServiceContext::new(id, data))
                }
                Err(e) => return Err(e),
            };
            contexts.put(ctx);
        }
        Ok(contexts)
    }
}

fn read_u32(buf: &mut Bytes, what: &str) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(OrbError::format(format!("truncated {}", what)));
    }
    Ok(buf.get_u32())
}
