//! Dataplane error catalog.
//!
//! Pipeline-internal failures (parse errors, ring-full, cache misses) are
//! counted and turned into drops; they never surface here. Everything that
//! crosses an API boundary (table mutation, lifecycle transitions, argument
//! validation) comes back as a [`DpError`].

use thiserror::Error;

/// Result alias used across the dataplane.
pub type DpResult<T> = Result<T, DpError>;

/// Errors produced by the dataplane core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DpError {
    #[error("invalid argument: {0}")]
    InvalidArgs(String),

    #[error("out of memory")]
    NoMemory,

    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("not operational")]
    NotOperational,

    #[error("timed out")]
    TimedOut,

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("stop requested")]
    StopRequested,

    /// The instruction pipeline terminated explicitly (e.g. clear-actions
    /// with no output). Not a failure; the packet is dropped.
    #[error("no more action")]
    NoMoreAction,

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("value too long: {0}")]
    TooLong(String),

    #[error("value too short: {0}")]
    TooShort(String),

    /// OpenFlow-shaped failure returned to the protocol agent on a
    /// flow-table mutation.
    #[error("flow-mod failed: {0}")]
    OfpError(#[from] FlowModError),
}

/// Flow-mod error variants, matching the OpenFlow 1.3 error classes the
/// protocol agent translates onto the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FlowModError {
    #[error("table full")]
    TableFull,
    #[error("bad match")]
    BadMatch,
    #[error("bad instruction")]
    BadInstruction,
    #[error("bad action")]
    BadAction,
}

impl DpError {
    /// True for the variants a lifecycle loop treats as "wind down now".
    pub fn is_stop(&self) -> bool {
        matches!(self, DpError::StopRequested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_mod_error_converts() {
        let e: DpError = FlowModError::TableFull.into();
        assert_eq!(e, DpError::OfpError(FlowModError::TableFull));
    }

    #[test]
    fn display_is_one_line() {
        let e = DpError::InvalidStateTransition {
            from: "started".into(),
            to: "initialized".into(),
        };
        assert!(!e.to_string().contains('\n'));
    }
}
