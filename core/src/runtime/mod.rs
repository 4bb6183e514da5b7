//! Engine runtime: the driver seam, the processing loop and the
//! in-process loopback engine.

pub mod driver;
mod loopback;
mod run_loop;

pub use driver::{CreateStackRequest, RawStackHandle, StackDriver, StackEventListener};
pub use loopback::LoopbackDriver;
pub use run_loop::RunLoop;

#[cfg(test)]
pub use driver::MockStackDriver;
