//! Test-traffic service.
//!
//! Blasts counter-stamped packets into the attached sink and counts
//! packets surfacing on the attached source. Used to exercise a freshly
//! built stack end to end.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::StackError;
use crate::port::{DataSinkDataSource, PortPair, SharedPortDataListener};
use crate::runtime::StackDriver;
use crate::service::StackService;

/// Bytes of the little-endian packet counter prefix.
pub const BLASTER_COUNTER_SIZE: usize = 4;

/// Default blast packet size in bytes, counter included.
pub const DEFAULT_BLAST_PACKET_SIZE: usize = 30;

/// Fill byte after the counter prefix.
const FILL_BYTE: u8 = 0xBB;

/// Counter-stamped test-traffic generator and sink.
pub struct Blaster {
    driver: Arc<dyn StackDriver>,
    packet_size: usize,
    attachment: Mutex<Option<PortPair>>,
    sent: AtomicU32,
    received: Arc<AtomicUsize>,
}

impl Blaster {
    pub fn new(driver: Arc<dyn StackDriver>) -> Self {
        Self::with_packet_size(driver, DEFAULT_BLAST_PACKET_SIZE)
    }

    /// Blaster emitting packets of `packet_size` bytes (at least the
    /// counter prefix).
    pub fn with_packet_size(driver: Arc<dyn StackDriver>, packet_size: usize) -> Self {
        Self {
            driver,
            packet_size: packet_size.max(BLASTER_COUNTER_SIZE),
            attachment: Mutex::new(None),
            sent: AtomicU32::new(0),
            received: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Write `count` packets into the attached sink. The counter keeps
    /// incrementing across calls.
    pub fn blast(&self, count: u32) -> Result<(), StackError> {
        let port = (*self.attachment.lock()).ok_or(StackError::NotAttached)?;
        for _ in 0..count {
            let counter = self.sent.fetch_add(1, Ordering::SeqCst);
            let packet = self.make_packet(counter);
            let code = self.driver.write(port.sink, &packet);
            if code < 0 {
                warn!(counter, code, "blast packet rejected by sink");
                return Err(StackError::PortUnavailable { code });
            }
        }
        Ok(())
    }

    /// Packets written so far.
    pub fn sent_count(&self) -> u32 {
        self.sent.load(Ordering::SeqCst)
    }

    /// Packets surfaced on the attached source so far.
    pub fn received_count(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    fn make_packet(&self, counter: u32) -> Vec<u8> {
        let mut packet = vec![FILL_BYTE; self.packet_size];
        packet[..BLASTER_COUNTER_SIZE].copy_from_slice(&counter.to_le_bytes());
        packet
    }
}

impl StackService for Blaster {
    fn name(&self) -> &str {
        "blaster"
    }

    fn attach(&self, port: &dyn DataSinkDataSource) -> Result<(), StackError> {
        let mut attachment = self.attachment.lock();
        if attachment.is_some() {
            return Err(StackError::AlreadyAttached);
        }

        let received = Arc::clone(&self.received);
        let listener: SharedPortDataListener = Arc::new(move |data: &[u8]| {
            received.fetch_add(1, Ordering::SeqCst);
            debug!(len = data.len(), "blaster packet received");
        });
        let code = self.driver.set_listener(port.source_ref(), Some(listener));
        if code < 0 {
            return Err(StackError::PortUnavailable { code });
        }

        *attachment = Some(PortPair::new(port.sink_ref(), port.source_ref()));
        debug!(sink = %port.sink_ref(), source = %port.source_ref(), "blaster attached");
        Ok(())
    }

    fn detach(&self) {
        let mut attachment = self.attachment.lock();
        if let Some(port) = attachment.take() {
            let code = self.driver.set_listener(port.source, None);
            if code < 0 {
                debug!(code, "source listener already gone on detach");
            }
            debug!("blaster detached");
        }
    }

    fn is_attached(&self) -> bool {
        self.attachment.lock().is_some()
    }
}

impl Drop for Blaster {
    fn drop(&mut self) {
        self.detach();
    }
}
