//! Native result codes and typed errors.
//!
//! The layer-graph engine reports outcomes as signed 32-bit result codes:
//! non-negative values are success, negative values are failures grouped
//! into fixed sub-ranges per subsystem. Every offset is derived from
//! [`codes::ERROR_BASE`] so the table has a single source of truth.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known result codes shared with the layer-graph engine.
pub mod codes {
    /// Generic success.
    pub const SUCCESS: i32 = 0;
    /// Generic failure.
    pub const FAILURE: i32 = -1;

    /// Base offset for all named error codes.
    pub const ERROR_BASE: i32 = -10_000;

    // Named codes in the generic range (ERROR_BASE..ERROR_BASE-99).
    pub const ERROR_OUT_OF_MEMORY: i32 = ERROR_BASE - 0;
    pub const ERROR_OUT_OF_RESOURCES: i32 = ERROR_BASE - 1;
    pub const ERROR_INTERNAL: i32 = ERROR_BASE - 2;
    pub const ERROR_INVALID_PARAMETERS: i32 = ERROR_BASE - 3;
    pub const ERROR_INVALID_STATE: i32 = ERROR_BASE - 4;
    pub const ERROR_NOT_SUPPORTED: i32 = ERROR_BASE - 5;
    pub const ERROR_TIMEOUT: i32 = ERROR_BASE - 7;
    pub const ERROR_WOULD_BLOCK: i32 = ERROR_BASE - 9;

    /// Sub-range width for each subsystem below.
    pub const ERROR_RANGE_WIDTH: i32 = 100;

    /// I/O subsystem errors: `ERROR_BASE_IO - 99 ..= ERROR_BASE_IO`.
    pub const ERROR_BASE_IO: i32 = ERROR_BASE - 100;
    /// Socket subsystem errors.
    pub const ERROR_BASE_SOCKET: i32 = ERROR_BASE - 200;
    /// CoAP subsystem errors.
    pub const ERROR_BASE_COAP: i32 = ERROR_BASE - 300;
    /// Remote-API subsystem errors.
    pub const ERROR_BASE_REMOTE: i32 = ERROR_BASE - 400;
    /// Gattlink subsystem errors.
    pub const ERROR_BASE_GATTLINK: i32 = ERROR_BASE - 500;
    /// TLS subsystem errors.
    pub const ERROR_BASE_TLS: i32 = ERROR_BASE - 600;

    /// The TLS peer offered a PSK identity no resolver recognizes.
    pub const ERROR_TLS_UNKNOWN_IDENTITY: i32 = ERROR_BASE_TLS - 1;
}

/// Category a result code resolves to.
///
/// The mapping is total: unknown negative codes resolve to [`Failure`],
/// non-negative codes always mean [`Success`].
///
/// [`Failure`]: ErrorCategory::Failure
/// [`Success`]: ErrorCategory::Success
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Non-negative result code.
    Success,
    /// Negative code outside every known sub-range.
    Failure,
    /// I/O related error.
    Io,
    /// Socket related error.
    Socket,
    /// CoAP related error.
    Coap,
    /// Remote API related error.
    Remote,
    /// Gattlink related error.
    Gattlink,
    /// TLS related error.
    Tls,
}

impl ErrorCategory {
    /// Resolve a raw result code to its category.
    pub fn from_code(code: i32) -> Self {
        use codes::*;

        if code >= 0 {
            return ErrorCategory::Success;
        }

        let in_range = |base: i32| code <= base && code > base - ERROR_RANGE_WIDTH;

        if in_range(ERROR_BASE_IO) {
            ErrorCategory::Io
        } else if in_range(ERROR_BASE_SOCKET) {
            ErrorCategory::Socket
        } else if in_range(ERROR_BASE_COAP) {
            ErrorCategory::Coap
        } else if in_range(ERROR_BASE_REMOTE) {
            ErrorCategory::Remote
        } else if in_range(ERROR_BASE_GATTLINK) {
            ErrorCategory::Gattlink
        } else if in_range(ERROR_BASE_TLS) {
            ErrorCategory::Tls
        } else {
            ErrorCategory::Failure
        }
    }

    /// Stable human-readable title, used in telemetry and error messages.
    pub fn title(&self) -> &'static str {
        match self {
            ErrorCategory::Success => "Success",
            ErrorCategory::Failure => "Failed with error code",
            ErrorCategory::Io => "IO related error",
            ErrorCategory::Socket => "Socket related error",
            ErrorCategory::Coap => "CoAP related error",
            ErrorCategory::Remote => "Remote API related error",
            ErrorCategory::Gattlink => "Gattlink related error",
            ErrorCategory::Tls => "TLS related error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.title())
    }
}

/// Errors surfaced by stack lifecycle and service operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StackError {
    /// The engine refused to build the layer graph. Fatal to the attempt;
    /// the caller must not retain a stack instance.
    #[error("stack creation failed: {} (code {code})", category.title())]
    CreationFailed {
        code: i32,
        category: ErrorCategory,
    },

    /// Operation attempted on a stack whose native instance has been
    /// released. Fail-fast guard against use-after-free.
    #[error("stack already closed")]
    AlreadyClosed,

    /// The engine rejected the event listener registration.
    #[error("event listener rejected (code {code})")]
    ListenerRejected { code: i32 },

    /// A service was attached to a second port without detaching first.
    #[error("service already attached")]
    AlreadyAttached,

    /// A service operation requires an attached port.
    #[error("service not attached")]
    NotAttached,

    /// The requested top port is not exposed by this stack variant.
    #[error("port unavailable (code {code})")]
    PortUnavailable { code: i32 },
}

impl StackError {
    /// Build a [`StackError::CreationFailed`] from a raw result code.
    pub fn creation_failed(code: i32) -> Self {
        StackError::CreationFailed {
            code,
            category: ErrorCategory::from_code(code),
        }
    }
}
