//! One-shot message service.
//!
//! Carries a single fixed payload and writes it into the attached sink on
//! demand. The smallest useful service; mostly a fixture for exercising
//! the attach/detach contract.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::StackError;
use crate::port::{DataSinkDataSource, PortPair, SharedPortDataListener};
use crate::runtime::StackDriver;
use crate::service::StackService;

/// Service that sends one fixed payload per [`send`](Self::send) call.
pub struct SingleMessageSender {
    driver: Arc<dyn StackDriver>,
    payload: Vec<u8>,
    attachment: Mutex<Option<PortPair>>,
    received: Arc<AtomicUsize>,
}

impl SingleMessageSender {
    pub fn new(driver: Arc<dyn StackDriver>, payload: Vec<u8>) -> Self {
        Self {
            driver,
            payload,
            attachment: Mutex::new(None),
            received: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Write the payload into the attached sink.
    pub fn send(&self) -> Result<(), StackError> {
        let port = (*self.attachment.lock()).ok_or(StackError::NotAttached)?;
        let code = self.driver.write(port.sink, &self.payload);
        if code < 0 {
            return Err(StackError::PortUnavailable { code });
        }
        debug!(len = self.payload.len(), "message sent");
        Ok(())
    }

    /// Packets surfaced on the attached source so far.
    pub fn received_count(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

impl StackService for SingleMessageSender {
    fn name(&self) -> &str {
        "single-message"
    }

    fn attach(&self, port: &dyn DataSinkDataSource) -> Result<(), StackError> {
        let mut attachment = self.attachment.lock();
        if attachment.is_some() {
            return Err(StackError::AlreadyAttached);
        }

        let received = Arc::clone(&self.received);
        let listener: SharedPortDataListener = Arc::new(move |_data: &[u8]| {
            received.fetch_add(1, Ordering::SeqCst);
        });
        let code = self.driver.set_listener(port.source_ref(), Some(listener));
        if code < 0 {
            return Err(StackError::PortUnavailable { code });
        }

        *attachment = Some(PortPair::new(port.sink_ref(), port.source_ref()));
        Ok(())
    }

    fn detach(&self) {
        if let Some(port) = self.attachment.lock().take() {
            let _ = self.driver.set_listener(port.source, None);
        }
    }

    fn is_attached(&self) -> bool {
        self.attachment.lock().is_some()
    }
}

impl Drop for SingleMessageSender {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::LoopbackDriver;

    #[test]
    fn test_send_requires_attachment() {
        let driver = Arc::new(LoopbackDriver::new());
        let sender = SingleMessageSender::new(driver as Arc<dyn StackDriver>, b"hi".to_vec());
        assert_eq!(sender.send(), Err(StackError::NotAttached));
    }

    #[test]
    fn test_send_delivers_payload() {
        let driver = Arc::new(LoopbackDriver::new());
        let (near, far) = driver.create_port_pair();

        let received = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&received);
        driver.set_listener(
            far.source,
            Some(Arc::new(move |data: &[u8]| captured.lock().push(data.to_vec()))),
        );

        let sender = SingleMessageSender::new(
            Arc::clone(&driver) as Arc<dyn StackDriver>,
            b"hello stack".to_vec(),
        );
        sender.attach(&near).expect("attach");
        sender.send().expect("send");
        sender.send().expect("send again");

        assert_eq!(
            received.lock().as_slice(),
            &[b"hello stack".to_vec(), b"hello stack".to_vec()]
        );
    }

    #[test]
    fn test_attach_contract() {
        let driver = Arc::new(LoopbackDriver::new());
        let (near, _far) = driver.create_port_pair();
        let sender =
            SingleMessageSender::new(Arc::clone(&driver) as Arc<dyn StackDriver>, vec![1]);

        assert!(!sender.is_attached());
        sender.attach(&near).expect("attach");
        assert!(sender.is_attached());
        assert_eq!(sender.attach(&near), Err(StackError::AlreadyAttached));
        sender.detach();
        sender.detach();
        assert!(!sender.is_attached());
    }

    #[test]
    fn test_counts_inbound() {
        let driver = Arc::new(LoopbackDriver::new());
        let (near, far) = driver.create_port_pair();
        let sender =
            SingleMessageSender::new(Arc::clone(&driver) as Arc<dyn StackDriver>, vec![1]);
        sender.attach(&near).expect("attach");

        driver.write(far.sink, b"a");
        driver.write(far.sink, b"b");
        assert_eq!(sender.received_count(), 2);
    }
}
