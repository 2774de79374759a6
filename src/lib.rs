//! iCube-Capture: synchronous frame acquisition for NET iCube USB cameras
//!
//! This library drives the vendor SDK through the [`CameraSdk`] trait,
//! enabling both production use with real hardware (`netusbcam` feature) and
//! testing with a simulated SDK (`mock` feature).
//!
//! A [`SessionTable`] owns one slot per device. Opening a slot negotiates the
//! sensor mode and region of interest, arms software triggering and starts
//! the stream. Each [`SessionTable::grab`] fires one trigger and waits for the
//! matching frame.

pub mod bridge;
pub mod config;
pub mod error;
pub mod modes;
pub mod namespace;
pub mod params;
pub mod session;
pub mod traits;
pub mod validation;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

#[cfg(feature = "netusbcam")]
pub mod netusbcam;

pub use config::AdapterConfig;
pub use error::{CameraError, Result, SdkError};
pub use modes::{ModeTable, ICUBE_MODES};
pub use namespace::{InfoQuery, InfoReply, ParamValue};
pub use session::{OpenRequest, SessionId, SessionState, SessionTable};
pub use traits::{CameraSdk, Frame, FrameMetadata, Resolution, Roi, TriggerMode};
