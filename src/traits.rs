//! Core traits and types for the iCube camera abstraction.

use std::sync::Arc;

use crate::error::SdkError;

/// Result type for raw vendor SDK calls.
pub type SdkResult<T> = std::result::Result<T, SdkError>;

/// Sensor resolution preset (a Mode Table entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Resolution {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Resolution {
    /// Create a new resolution.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Region of interest within the current mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Roi {
    /// Window width in pixels.
    pub width: u32,
    /// Window height in pixels.
    pub height: u32,
    /// First column.
    pub start_col: u32,
    /// First row.
    pub start_row: u32,
}

impl Roi {
    /// Create a new region of interest.
    #[must_use]
    pub const fn new(width: u32, height: u32, start_col: u32, start_row: u32) -> Self {
        Self {
            width,
            height,
            start_col,
            start_row,
        }
    }

    /// Full-frame window for a resolution.
    #[must_use]
    pub const fn full(resolution: Resolution) -> Self {
        Self::new(resolution.width, resolution.height, 0, 0)
    }

    /// Bytes in one 8-bit raw frame of this window.
    #[must_use]
    pub const fn byte_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// ROI size bounds reported by the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoiRange {
    /// Smallest width.
    pub x_min: u32,
    /// Largest width.
    pub x_max: u32,
    /// Smallest height.
    pub y_min: u32,
    /// Largest height.
    pub y_max: u32,
}

/// Descriptor of an integer camera register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamProperty {
    /// Register is implemented by this camera.
    pub enabled: bool,
    /// Register supports automatic control.
    pub auto_capable: bool,
    /// Register supports one-push automatic adjustment.
    pub one_push_capable: bool,
    /// Factory default.
    pub default: u64,
    /// Lower bound.
    pub min: u64,
    /// Upper bound.
    pub max: u64,
}

/// Exposure time bounds in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureRange {
    /// Automatic exposure is available.
    pub auto_capable: bool,
    /// Factory default.
    pub default: f32,
    /// Lower bound.
    pub min: f32,
    /// Upper bound.
    pub max: f32,
}

/// Trigger modes understood by the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TriggerMode {
    /// Software triggering armed, waiting for a fire command.
    SoftwareArmed = 0,
    /// Capture exactly one frame now.
    SoftwareFire = 1,
    /// Capture on each external trigger pulse.
    External = 2,
    /// Free-running acquisition.
    FreeRun = 3,
}

impl TriggerMode {
    /// Convert a vendor mode code.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::SoftwareArmed),
            1 => Some(Self::SoftwareFire),
            2 => Some(Self::External),
            3 => Some(Self::FreeRun),
            _ => None,
        }
    }

    /// Vendor mode code.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }
}

/// Camera registers reachable through the generic parameter path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Register {
    /// Brightness.
    Brightness = 1,
    /// Contrast.
    Contrast = 2,
    /// Gamma.
    Gamma = 3,
    /// Vertical flip.
    FlippedV = 4,
    /// Horizontal flip.
    FlippedH = 5,
    /// Exposure time in sensor units.
    ExposureTime = 7,
    /// Target brightness for automatic exposure.
    ExposureTarget = 8,
    /// Black level.
    BlackLevel = 12,
    /// Analog gain.
    Gain = 13,
    /// Pixel clock.
    Pll = 15,
}

impl Register {
    /// Vendor register number.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Whether writes must happen with the stream stopped.
    #[must_use]
    pub const fn requires_stop(self) -> bool {
        matches!(self, Self::Pll)
    }
}

/// Identification strings of an opened camera.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Model name.
    pub name: String,
    /// Serial number.
    pub serial: String,
    /// Firmware version.
    pub firmware: String,
}

/// Transfer statistics kept by the SDK.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounters {
    /// Frames received intact.
    pub good: u32,
    /// Frames dropped or corrupted in transfer.
    pub broken: u32,
}

/// Receiver of completed frames.
///
/// Called by the SDK on a thread it owns. Implementations must not block on
/// application logic and must not allocate.
pub trait FrameSink: Send + Sync {
    /// A frame of `data.len()` bytes has completed.
    fn frame_complete(&self, data: &[u8]);
}

/// Abstraction over the vendor camera SDK.
///
/// Every call addresses a device by its enumeration index.
pub trait CameraSdk: Send + Sync {
    /// Number of cameras detected at initialisation.
    fn device_count(&self) -> u32;

    /// Open a device.
    fn open(&self, index: u32) -> SdkResult<()>;

    /// Close a device.
    fn close(&self, index: u32) -> SdkResult<()>;

    /// Start the image stream.
    fn start(&self, index: u32) -> SdkResult<()>;

    /// Stop the image stream.
    fn stop(&self, index: u32) -> SdkResult<()>;

    /// Indices into the Mode Table that this camera supports.
    fn mode_list(&self, index: u32) -> SdkResult<Vec<u32>>;

    /// Current mode index.
    fn mode(&self, index: u32) -> SdkResult<u32>;

    /// Select a mode. Resets the ROI to the full mode window.
    fn set_mode(&self, index: u32, mode: u32) -> SdkResult<()>;

    /// Current region of interest.
    fn roi(&self, index: u32) -> SdkResult<Roi>;

    /// Set the region of interest.
    fn set_roi(&self, index: u32, roi: Roi) -> SdkResult<()>;

    /// ROI size bounds for the current mode.
    fn roi_range(&self, index: u32) -> SdkResult<RoiRange>;

    /// Current trigger mode.
    fn trigger(&self, index: u32) -> SdkResult<TriggerMode>;

    /// Set the trigger mode. `SoftwareFire` requests one frame.
    fn set_trigger(&self, index: u32, mode: TriggerMode) -> SdkResult<()>;

    /// Read a register.
    fn param(&self, index: u32, register: Register) -> SdkResult<u64>;

    /// Write a register.
    fn set_param(&self, index: u32, register: Register, value: u64) -> SdkResult<()>;

    /// Descriptor of a register.
    fn param_range(&self, index: u32, register: Register) -> SdkResult<ParamProperty>;

    /// Whether a register is under automatic control.
    fn param_auto(&self, index: u32, register: Register) -> SdkResult<bool>;

    /// Enable or disable automatic control of a register.
    fn set_param_auto(&self, index: u32, register: Register, enabled: bool) -> SdkResult<()>;

    /// Exposure time in milliseconds.
    fn exposure_ms(&self, index: u32) -> SdkResult<f32>;

    /// Exposure time bounds in milliseconds.
    fn exposure_range(&self, index: u32) -> SdkResult<ExposureRange>;

    /// Install the frame completion callback, replacing any previous one.
    fn set_callback(&self, index: u32, sink: Arc<dyn FrameSink>) -> SdkResult<()>;

    /// Identification strings.
    fn device_info(&self, index: u32) -> SdkResult<DeviceInfo>;

    /// Transfer statistics.
    fn frame_counters(&self, index: u32) -> SdkResult<FrameCounters>;
}

/// Metadata for a grabbed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Trigger generation the frame answers.
    pub generation: u64,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
}

/// A grabbed 8-bit raw frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw pixel data, one byte per pixel, row-major.
    pub data: Vec<u8>,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

impl Frame {
    /// Intensity of the pixel at `(x, y)`, or `None` outside the frame.
    #[must_use]
    pub fn pixel_at(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.metadata.width || y >= self.metadata.height {
            return None;
        }
        let offset = y as usize * self.metadata.width as usize + x as usize;
        self.data.get(offset).copied()
    }

    /// Mean intensity over the whole frame.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.data.iter().map(|&px| u64::from(px)).sum();
        sum as f64 / self.data.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_codes_round_trip() {
        for mode in [
            TriggerMode::SoftwareArmed,
            TriggerMode::SoftwareFire,
            TriggerMode::External,
            TriggerMode::FreeRun,
        ] {
            assert_eq!(TriggerMode::from_code(mode.code()), Some(mode));
        }
        assert_eq!(TriggerMode::from_code(7), None);
    }

    #[test]
    fn test_pixel_at_bounds() {
        let frame = Frame {
            data: (0..12).collect(),
            metadata: FrameMetadata {
                generation: 1,
                width: 4,
                height: 3,
            },
        };
        assert_eq!(frame.pixel_at(0, 0), Some(0));
        assert_eq!(frame.pixel_at(3, 2), Some(11));
        assert_eq!(frame.pixel_at(4, 0), None);
        assert_eq!(frame.pixel_at(0, 3), None);
    }

    #[test]
    fn test_roi_byte_count() {
        let roi = Roi::full(Resolution::new(640, 480));
        assert_eq!(roi.byte_count(), 307_200);
    }
}
