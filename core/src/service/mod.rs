//! Application services attachable to a stack's top port.
//!
//! A service binds to the top port exactly once, exchanges application
//! data through it, and detaches (or is dropped) when the stack goes
//! away. Attach is at-most-once; detach is idempotent.

mod blaster;
mod single_message;

pub use blaster::{Blaster, BLASTER_COUNTER_SIZE, DEFAULT_BLAST_PACKET_SIZE};
pub use single_message::SingleMessageSender;

use crate::error::StackError;
use crate::port::DataSinkDataSource;

/// A protocol/service that exchanges application data over a stack's
/// top port.
pub trait StackService: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &str;

    /// Bind the service to a port. Fails with
    /// [`StackError::AlreadyAttached`] if already bound; detach first to
    /// move a service between stacks.
    fn attach(&self, port: &dyn DataSinkDataSource) -> Result<(), StackError>;

    /// Release the port binding. Safe to call when not attached.
    fn detach(&self);

    /// Whether the service is currently bound to a port.
    fn is_attached(&self) -> bool;
}
