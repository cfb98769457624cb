//! Error taxonomy for state manipulation.

use thiserror::Error;
use vtgrid_params::ParamsError;

use crate::driver::DriverError;

/// Errors surfaced while showing, retrieving, storing, or removing states.
#[derive(Debug, Error)]
pub enum StateError {
    /// A mode ladder reached an `abort` choice. This is a cooperative
    /// stop signal rather than a breakage: the caller decided ahead of
    /// time that the encountered situation must end the current run.
    #[error("aborted by state policy: {0}")]
    Abort(String),

    /// A mode string could not be parsed at all.
    #[error("unparsable state mode {mode:?}: {reason}")]
    UnparsableMode { mode: String, reason: &'static str },

    /// The mode character consulted by a ladder branch is not legal there.
    #[error("invalid policy {mode:?}: the action on {branch} can be one of {allowed}")]
    InvalidPolicy {
        mode: String,
        branch: &'static str,
        allowed: &'static str,
    },

    /// No object chain was configured for a state operation.
    #[error("empty states chain for {0}")]
    MissingChain(String),

    /// A chain token does not name a known object family.
    #[error("unknown object family {0}")]
    UnknownFamily(String),

    /// No backend is registered under the requested name.
    #[error("no {family} state backend named {name}")]
    UnknownBackend { family: &'static str, name: String },

    /// An image format outside the supported set was configured.
    #[error("unsupported format {format} for image {image}")]
    UnsupportedFormat { image: String, format: String },

    /// A switch flag outside soft, hard, and none was configured.
    #[error("invalid switch flag {0}, must be soft, hard, or none")]
    InvalidSwitch(String),

    /// The vm is running while the operation needs it powered off.
    #[error("vm {0} is running and the switch policy forbids stopping it")]
    LiveVm(String),

    /// The vm is powered off while the operation needs it running.
    #[error("vm {0} is not running and has no run state to save")]
    DeadVm(String),

    /// An overlay state was to be stored without a head pointer image.
    #[error("missing head pointer image to store as {state} for {image}")]
    MissingPointer { image: String, state: String },

    /// Overwriting a state would rewrite a backing file it does not own.
    #[error("cannot overwrite state {state} of {image} outside its own backing chain")]
    UnsafeOverwrite { image: String, state: String },

    /// A required parameter is missing or malformed.
    #[error(transparent)]
    Params(#[from] ParamsError),

    /// An imperative driver call failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Filesystem manipulation around a state directory failed.
    #[error("state directory manipulation failed: {0}")]
    Io(#[from] std::io::Error),
}

impl StateError {
    /// Whether this error is the cooperative abort signal rather than a
    /// genuine failure.
    pub fn is_abort(&self) -> bool {
        matches!(self, StateError::Abort(_))
    }
}
