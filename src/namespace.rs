//! Host-facing parameter namespace and capability queries.

use std::fmt;
use std::str::FromStr;

use crate::error::CameraError;
use crate::traits::Register;

/// Typed parameter value exchanged with the host framework.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// String value.
    Str(String),
    /// Tuple of values (ranges, value lists).
    List(Vec<ParamValue>),
}

impl ParamValue {
    /// Integer payload, if this is an integer.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "'{s}'"),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

macro_rules! param_names {
    ($($variant:ident => $name:literal, $ro:literal, $descr:literal;)+) => {
        /// Parameters of a device session.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ParamName {
            $(
                #[doc = $descr]
                $variant,
            )+
        }

        impl ParamName {
            /// Every parameter in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// Host-facing name.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }

            /// Whether the parameter rejects writes.
            #[must_use]
            pub const fn is_read_only(self) -> bool {
                match self {
                    $(Self::$variant => $ro,)+
                }
            }

            /// Human-readable description.
            #[must_use]
            pub const fn description(self) -> &'static str {
                match self {
                    $(Self::$variant => $descr,)+
                }
            }

            fn lookup(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

param_names! {
    HorizontalResolution => "horizontal_resolution", false, "Width of the sensor mode.";
    VerticalResolution => "vertical_resolution", false, "Height of the sensor mode.";
    ImageWidth => "image_width", false, "Width of the region of interest.";
    ImageHeight => "image_height", false, "Height of the region of interest.";
    StartCol => "start_col", false, "First column of the region of interest.";
    StartRow => "start_row", false, "First row of the region of interest.";
    Index => "index", true, "Camera device index.";
    GrabTimeout => "grab_timeout", false, "Grab timeout in milliseconds.";
    ExposureTime => "exposure_time", false, "Exposure time register value.";
    ExposureAuto => "exposure_auto", false, "Automatic exposure control.";
    ExposureTarget => "exposure_target", false, "Target brightness for automatic exposure.";
    ExposureMsec => "exposure_msec", true, "Exposure time in milliseconds.";
    Gain => "gain", false, "Analog gain.";
    Brightness => "brightness", false, "Brightness.";
    Contrast => "contrast", false, "Contrast.";
    Gamma => "gamma", false, "Gamma correction.";
    BlackLevel => "black_level", false, "Black level offset.";
    FlipHorizontal => "flip_horizontal", false, "Mirror the image horizontally.";
    FlipVertical => "flip_vertical", false, "Mirror the image vertically.";
    PixelClock => "pixel_clock", false, "Sensor pixel clock setting.";
    ExternalTrigger => "external_trigger", false, "Capture on external trigger pulses.";
    DeviceName => "device_name", true, "Camera model name.";
    SerialNumber => "serial_number", true, "Camera serial number.";
    FirmwareVersion => "firmware_version", true, "Camera firmware version.";
    GoodFrames => "good_frames", true, "Frames received intact.";
    BrokenFrames => "broken_frames", true, "Frames lost or corrupted in transfer.";
}

impl ParamName {
    /// Register backing this parameter, if it is a plain register.
    #[must_use]
    pub const fn register(self) -> Option<Register> {
        match self {
            Self::ExposureTime => Some(Register::ExposureTime),
            Self::ExposureTarget => Some(Register::ExposureTarget),
            Self::Gain => Some(Register::Gain),
            Self::Brightness => Some(Register::Brightness),
            Self::Contrast => Some(Register::Contrast),
            Self::Gamma => Some(Register::Gamma),
            Self::BlackLevel => Some(Register::BlackLevel),
            Self::FlipHorizontal => Some(Register::FlippedH),
            Self::FlipVertical => Some(Register::FlippedV),
            Self::PixelClock => Some(Register::Pll),
            _ => None,
        }
    }

    /// Whether a `_range` query exists for this parameter.
    #[must_use]
    pub const fn has_range(self) -> bool {
        !matches!(
            self,
            Self::Index
                | Self::DeviceName
                | Self::SerialNumber
                | Self::FirmwareVersion
                | Self::GoodFrames
                | Self::BrokenFrames
        )
    }
}

/// Which facet of a parameter a query addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aspect {
    /// The value itself.
    Value,
    /// `<name>_range`: bounds or accepted values.
    Range,
    /// `<name>_description`: help text.
    Description,
}

/// Parsed parameter name with its aspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamQuery {
    /// Parameter.
    pub name: ParamName,
    /// Facet.
    pub aspect: Aspect,
}

impl ParamQuery {
    /// Query for the value of `name`.
    #[must_use]
    pub const fn value(name: ParamName) -> Self {
        Self {
            name,
            aspect: Aspect::Value,
        }
    }
}

impl FromStr for ParamQuery {
    type Err = CameraError;

    /// Names are matched case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        if let Some(name) = ParamName::lookup(&lower) {
            return Ok(Self::value(name));
        }
        let split = lower
            .strip_suffix("_range")
            .map(|base| (base, Aspect::Range))
            .or_else(|| {
                lower
                    .strip_suffix("_description")
                    .map(|base| (base, Aspect::Description))
            });
        match split.and_then(|(base, aspect)| ParamName::lookup(base).map(|name| (name, aspect))) {
            Some((name, Aspect::Range)) if !name.has_range() => {
                Err(CameraError::UnknownParameter(s.to_owned()))
            }
            Some((name, aspect)) => Ok(Self { name, aspect }),
            None => Err(CameraError::UnknownParameter(s.to_owned())),
        }
    }
}

/// Read-only capability queries answered without an open device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoQuery {
    /// Interface summary.
    General,
    /// Interface revision.
    Revision,
    /// Available device indices.
    Port,
    /// Accepted values of the external trigger switch.
    ExternalTrigger,
    /// Trigger modes the adapter can arm.
    TriggerModes,
    /// Mode Table widths.
    HorizontalResolution,
    /// Mode Table heights.
    VerticalResolution,
    /// Every parameter name.
    Parameters,
    /// Read-only parameter names.
    ParametersReadOnly,
    /// Write-only parameter names.
    ParametersWriteOnly,
}

/// Answer to an [`InfoQuery`].
#[derive(Debug, Clone, PartialEq)]
pub struct InfoReply {
    /// What the values mean.
    pub info: &'static str,
    /// The values.
    pub values: Vec<ParamValue>,
}
