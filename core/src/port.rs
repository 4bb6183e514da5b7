//! Opaque data-plane port references.
//!
//! A port is something that can receive and produce bytes. The stack core
//! never touches raw pointers; a port is an opaque index into the driver's
//! port table, so "already released" is a checked lookup rather than
//! undefined behavior.

use std::fmt;
use std::sync::Arc;

/// Opaque reference to a driver-owned data sink (bytes go in).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkRef(pub(crate) u64);

impl SinkRef {
    /// Wrap a driver-issued table index.
    pub fn new(raw: u64) -> Self {
        SinkRef(raw)
    }

    /// Raw table index, for logging only.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SinkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink#{}", self.0)
    }
}

/// Opaque reference to a driver-owned data source (bytes come out).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceRef(pub(crate) u64);

impl SourceRef {
    /// Wrap a driver-issued table index.
    pub fn new(raw: u64) -> Self {
        SourceRef(raw)
    }

    /// Raw table index, for logging only.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

/// The minimal capability pair passed between layers: an opaque sink plus
/// an opaque source. Sole contract between a stack and whatever provides
/// its bottom transport, and between a stack's top port and a service.
pub trait DataSinkDataSource: Send + Sync {
    fn sink_ref(&self) -> SinkRef;
    fn source_ref(&self) -> SourceRef;
}

/// Plain sink + source pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub sink: SinkRef,
    pub source: SourceRef,
}

impl PortPair {
    pub fn new(sink: SinkRef, source: SourceRef) -> Self {
        Self { sink, source }
    }
}

impl DataSinkDataSource for PortPair {
    fn sink_ref(&self) -> SinkRef {
        self.sink
    }

    fn source_ref(&self) -> SourceRef {
        self.source
    }
}

/// Receives bytes produced by a source. Invoked on the driver's
/// processing-loop thread.
pub trait PortDataListener: Send + Sync {
    fn on_data(&self, data: &[u8]);
}

impl<F: Fn(&[u8]) + Send + Sync> PortDataListener for F {
    fn on_data(&self, data: &[u8]) {
        self(data)
    }
}

/// Convenience alias for shared listeners.
pub type SharedPortDataListener = Arc<dyn PortDataListener>;
