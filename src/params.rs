//! Parameter Controller: range-checked register access.

use crate::error::{CameraError, Result};
use crate::namespace::ParamValue;
use crate::traits::{CameraSdk, ExposureRange, ParamProperty, Register};

/// Host-facing name of a register, used in error reports.
#[must_use]
pub const fn register_name(register: Register) -> &'static str {
    match register {
        Register::Brightness => "brightness",
        Register::Contrast => "contrast",
        Register::Gamma => "gamma",
        Register::FlippedV => "flip_vertical",
        Register::FlippedH => "flip_horizontal",
        Register::ExposureTime => "exposure_time",
        Register::ExposureTarget => "exposure_target",
        Register::BlackLevel => "black_level",
        Register::Gain => "gain",
        Register::Pll => "pixel_clock",
    }
}

/// Interpret a host value as a boolean switch.
///
/// Accepts `0`/`1` and the strings `true`/`false`/`on`/`off`.
pub fn parse_switch(param: &'static str, value: &ParamValue) -> Result<bool> {
    match value {
        ParamValue::Int(0) => Ok(false),
        ParamValue::Int(1) => Ok(true),
        ParamValue::Str(s) if s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("on") => {
            Ok(true)
        }
        ParamValue::Str(s) if s.eq_ignore_ascii_case("false") || s.eq_ignore_ascii_case("off") => {
            Ok(false)
        }
        other => Err(CameraError::InvalidValue {
            param,
            reason: format!("expected true or false, got {other}"),
        }),
    }
}

/// Validates and applies register writes for one device.
pub struct ParameterController<'a, S: ?Sized> {
    sdk: &'a S,
    index: u32,
}

impl<'a, S: CameraSdk + ?Sized> ParameterController<'a, S> {
    /// Create a controller for the device at `index`.
    pub const fn new(sdk: &'a S, index: u32) -> Self {
        Self { sdk, index }
    }

    /// Live descriptor of a register.
    pub fn range(&self, register: Register) -> Result<ParamProperty> {
        self.sdk
            .param_range(self.index, register)
            .map_err(|source| CameraError::QueryFailed {
                what: register_name(register),
                source,
            })
    }

    /// Current register value.
    pub fn get(&self, register: Register) -> Result<u64> {
        self.sdk
            .param(self.index, register)
            .map_err(|source| CameraError::QueryFailed {
                what: register_name(register),
                source,
            })
    }

    /// Whether the register is under automatic control.
    pub fn auto(&self, register: Register) -> Result<bool> {
        self.sdk
            .param_auto(self.index, register)
            .map_err(|source| CameraError::QueryFailed {
                what: register_name(register),
                source,
            })
    }

    /// Check a manual write without applying it.
    pub fn validate(&self, register: Register, value: i64) -> Result<u64> {
        let param = register_name(register);
        let property = self.range(register)?;
        if !property.enabled {
            return Err(CameraError::NotSupported(param));
        }
        if property.auto_capable && self.auto(register)? {
            return Err(CameraError::AutoModeActive(param));
        }
        let min = i64::try_from(property.min).unwrap_or(i64::MAX);
        let max = i64::try_from(property.max).unwrap_or(i64::MAX);
        if value < min || value > max {
            return Err(CameraError::OutOfRange {
                param,
                value,
                min,
                max,
            });
        }
        u64::try_from(value).map_err(|_| CameraError::OutOfRange {
            param,
            value,
            min,
            max,
        })
    }

    /// Write a register after checking auto mode and the live range.
    pub fn set(&self, register: Register, value: i64) -> Result<()> {
        let value = self.validate(register, value)?;
        tracing::debug!(index = self.index, ?register, value, "Writing register");
        self.sdk
            .set_param(self.index, register, value)
            .map_err(|source| CameraError::ApplyFailed {
                param: register_name(register),
                source,
            })
    }

    /// Switch automatic control of a register.
    pub fn set_auto(&self, register: Register, value: &ParamValue) -> Result<()> {
        let param = register_name(register);
        let enabled = parse_switch(param, value)?;
        if !self.range(register)?.auto_capable {
            return Err(CameraError::NotSupported(param));
        }
        tracing::debug!(index = self.index, ?register, enabled, "Switching auto mode");
        self.sdk
            .set_param_auto(self.index, register, enabled)
            .map_err(|source| CameraError::ApplyFailed { param, source })
    }

    /// Exposure time in milliseconds.
    pub fn exposure_ms(&self) -> Result<f32> {
        self.sdk
            .exposure_ms(self.index)
            .map_err(|source| CameraError::QueryFailed {
                what: "exposure_msec",
                source,
            })
    }

    /// Exposure time bounds in milliseconds.
    pub fn exposure_range(&self) -> Result<ExposureRange> {
        self.sdk
            .exposure_range(self.index)
            .map_err(|source| CameraError::QueryFailed {
                what: "exposure_msec",
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSdk;

    fn open_mock() -> MockSdk {
        let sdk = MockSdk::new(1);
        sdk.open(0).expect("open should succeed");
        sdk
    }

    #[test]
    fn test_exposure_within_range_is_applied() {
        let sdk = open_mock();
        let params = ParameterController::new(&sdk, 0);
        let range = params.range(Register::ExposureTime).expect("range");

        for value in [range.min, (range.min + range.max) / 2, range.max] {
            let value = i64::try_from(value).expect("fits");
            params
                .set(Register::ExposureTime, value)
                .expect("in-range value accepted");
            assert_eq!(
                params.get(Register::ExposureTime).expect("read back"),
                u64::try_from(value).expect("positive")
            );
        }
    }

    #[test]
    fn test_exposure_out_of_range() {
        let sdk = open_mock();
        let params = ParameterController::new(&sdk, 0);
        let before = params.get(Register::ExposureTime).expect("read");

        for value in [0, -5, 2001, i64::MAX] {
            let err = params
                .set(Register::ExposureTime, value)
                .expect_err("out-of-range value rejected");
            assert!(matches!(
                err,
                CameraError::OutOfRange {
                    param: "exposure_time",
                    min: 1,
                    max: 2000,
                    ..
                }
            ));
        }
        assert_eq!(params.get(Register::ExposureTime).expect("read"), before);
    }

    #[test]
    fn test_auto_mode_blocks_manual_writes() {
        let sdk = open_mock();
        let params = ParameterController::new(&sdk, 0);
        params
            .set_auto(Register::ExposureTime, &ParamValue::Str("true".to_owned()))
            .expect("auto on");

        for value in [50, 0, 99_999] {
            let err = params
                .set(Register::ExposureTime, value)
                .expect_err("manual write while auto");
            assert!(matches!(err, CameraError::AutoModeActive("exposure_time")));
        }

        params
            .set_auto(Register::ExposureTime, &ParamValue::Int(0))
            .expect("auto off");
        params
            .set(Register::ExposureTime, 50)
            .expect("manual write after auto off");
    }

    #[test]
    fn test_set_auto_rejects_non_boolean() {
        let sdk = open_mock();
        let params = ParameterController::new(&sdk, 0);
        for value in [
            ParamValue::Int(2),
            ParamValue::Float(1.0),
            ParamValue::Str("maybe".to_owned()),
        ] {
            let err = params
                .set_auto(Register::ExposureTime, &value)
                .expect_err("not a switch");
            assert!(matches!(err, CameraError::InvalidValue { .. }));
        }
    }

    #[test]
    fn test_set_auto_on_register_without_auto() {
        let sdk = open_mock();
        let params = ParameterController::new(&sdk, 0);
        let err = params
            .set_auto(Register::ExposureTarget, &ParamValue::Int(1))
            .expect_err("target has no auto mode");
        assert!(matches!(err, CameraError::NotSupported("exposure_target")));
    }

    #[test]
    fn test_sdk_rejection_is_apply_failed() {
        let sdk = open_mock();
        sdk.fail_on("set_param");
        let params = ParameterController::new(&sdk, 0);
        let err = params
            .set(Register::Gain, 10)
            .expect_err("sdk rejects write");
        assert!(matches!(err, CameraError::ApplyFailed { param: "gain", .. }));
    }

    #[test]
    fn test_query_failure() {
        let sdk = open_mock();
        sdk.fail_on("param");
        let params = ParameterController::new(&sdk, 0);
        let err = params.get(Register::Gain).expect_err("query fails");
        assert!(matches!(err, CameraError::QueryFailed { what: "gain", .. }));
    }

    #[test]
    fn test_exposure_ms_tracks_register() {
        let sdk = open_mock();
        let params = ParameterController::new(&sdk, 0);
        params.set(Register::ExposureTime, 250).expect("write");
        let ms = params.exposure_ms().expect("read");
        assert!((ms - 25.0).abs() < f32::EPSILON);
    }
}
