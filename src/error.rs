//! Error types for acquisition, configuration and vendor SDK calls.

use std::time::Duration;

/// Failure reported by a vendor SDK call.
///
/// `code` is the non-zero status returned by the call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{call} failed with status {code}")]
pub struct SdkError {
    /// Name of the vendor entry point that failed.
    pub call: &'static str,
    /// Raw status code.
    pub code: i32,
}

impl SdkError {
    /// Create an error for `call` with the given status code.
    #[must_use]
    pub const fn new(call: &'static str, code: i32) -> Self {
        Self { call, code }
    }
}

/// Phase of a stop-apply-restart reconfiguration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigurePhase {
    /// Stopping the hardware stream.
    Stop,
    /// Validating and writing the new setting.
    Apply,
    /// Resizing the frame buffer.
    Reallocate,
    /// Restarting the hardware stream.
    Restart,
}

impl std::fmt::Display for ReconfigurePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stop => "stop",
            Self::Apply => "apply",
            Self::Reallocate => "reallocate",
            Self::Restart => "restart",
        };
        f.write_str(name)
    }
}

/// Error type for camera operations.
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    /// Device index is not below the detected device count or slot count.
    #[error("invalid device index {index} ({available} available)")]
    InvalidIndex {
        /// Requested index.
        index: u32,
        /// Number of usable indices.
        available: u32,
    },

    /// The SDK could not open the device.
    #[error("device {index} unavailable")]
    DeviceUnavailable {
        /// Device index.
        index: u32,
        /// Underlying SDK failure.
        #[source]
        source: SdkError,
    },

    /// The slot for this device is already open.
    #[error("device {0} is already open")]
    DeviceBusy(u32),

    /// Stopping the hardware stream failed.
    #[error("stopping the stream failed")]
    StopFailed(#[source] SdkError),

    /// Closing the device failed.
    #[error("closing the device failed")]
    CloseFailed(#[source] SdkError),

    /// No supported mode matches the requested resolution.
    #[error("unsupported resolution {width}x{height}")]
    UnsupportedResolution {
        /// Requested width (0 when only the height was constrained).
        width: u32,
        /// Requested height (0 when only the width was constrained).
        height: u32,
    },

    /// Value lies outside the range reported by the camera.
    #[error("{param} = {value} outside [{min}, {max}]")]
    OutOfRange {
        /// Parameter name.
        param: &'static str,
        /// Rejected value.
        value: i64,
        /// Lower bound.
        min: i64,
        /// Upper bound.
        max: i64,
    },

    /// Value has the wrong type or is not one of the accepted values.
    #[error("invalid value for {param}: {reason}")]
    InvalidValue {
        /// Parameter name.
        param: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// Manual write attempted while the camera controls the parameter.
    #[error("{0} is under automatic control")]
    AutoModeActive(&'static str),

    /// The camera rejected a parameter write.
    #[error("applying {param} failed")]
    ApplyFailed {
        /// Parameter name.
        param: &'static str,
        /// Underlying SDK failure.
        #[source]
        source: SdkError,
    },

    /// A read-only query failed.
    #[error("querying {what} failed")]
    QueryFailed {
        /// What was being queried.
        what: &'static str,
        /// Underlying SDK failure.
        #[source]
        source: SdkError,
    },

    /// The frame buffer could not be allocated.
    #[error("allocating a {bytes} byte frame buffer failed")]
    AllocationFailed {
        /// Requested size.
        bytes: usize,
    },

    /// No frame arrived before the deadline. The stream stays live.
    #[error("no frame within {0:?}")]
    GrabTimeout(Duration),

    /// Issuing the capture trigger failed.
    #[error("issuing the capture trigger failed")]
    TriggerFailed(#[source] SdkError),

    /// The SDK rejected a geometry or stream change.
    #[error("reconfiguration failed")]
    ReconfigureFailed(#[source] SdkError),

    /// The change failed and the stream could not be restarted afterwards.
    #[error("reconfiguration left the stream stopped (failed during {phase})")]
    ReconfigureIncomplete {
        /// Phase whose failure stranded the stream.
        phase: ReconfigurePhase,
        /// The restart failure.
        #[source]
        source: SdkError,
    },

    /// Operation is not offered by this interface.
    #[error("{0} is not supported")]
    NotSupported(&'static str),

    /// No session is open in this slot.
    #[error("device {0} is not open")]
    NotOpen(u32),

    /// Grab requested while the session is not streaming.
    #[error("device is not streaming")]
    NotStreaming,

    /// Parameter name is not part of the namespace.
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    /// Parameter cannot be written.
    #[error("{0} is read-only")]
    ReadOnly(&'static str),

    /// A captured frame does not look as expected.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Destination length differs from the frame buffer length.
    #[error("destination holds {actual} bytes, frame has {expected}")]
    BufferMismatch {
        /// Frame buffer length.
        expected: usize,
        /// Destination length.
        actual: usize,
    },
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;
