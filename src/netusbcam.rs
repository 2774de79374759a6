//! `libNETUSBCAM` backend.
//!
//! Thin FFI layer over the vendor SDK. Every call checks the returned status
//! and maps non-zero codes to [`SdkError`] carrying the entry point name.
#![allow(unsafe_code)]

use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_uint, c_ulong, c_void, CStr};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::SdkError;
use crate::traits::{
    CameraSdk, DeviceInfo, ExposureRange, FrameCounters, FrameSink, ParamProperty, Register, Roi,
    RoiRange, SdkResult, TriggerMode,
};

/// Raw sensor data, one byte per pixel.
const CALLBACK_RAW: c_int = 0;

/// Upper bound on the number of modes a camera reports.
const MAX_MODES: c_uint = 32;

/// Size of the identification string buffers.
const ID_LEN: usize = 64;

#[repr(C)]
#[derive(Default)]
struct ParamPropertyRaw {
    enabled: c_char,
    auto: c_char,
    one_push: c_char,
    def: c_uint,
    min: c_uint,
    max: c_ulong,
}

#[repr(C)]
#[derive(Default)]
struct ParamPropertyF {
    enabled: c_char,
    auto: c_char,
    one_push: c_char,
    def: f32,
    min: f32,
    max: f32,
}

#[repr(C)]
#[derive(Default)]
struct RoiRangeRaw {
    x_min: c_int,
    x_max: c_int,
    y_min: c_int,
    y_max: c_int,
}

type FrameCallback = extern "C" fn(*mut c_void, c_uint, *mut c_void) -> c_int;

#[link(name = "NETUSBCAM")]
extern "C" {
    fn NETUSBCAM_Init() -> c_int;
    fn NETUSBCAM_Open(index: c_uint) -> c_int;
    fn NETUSBCAM_Close(index: c_uint) -> c_int;
    fn NETUSBCAM_Start(index: c_uint) -> c_int;
    fn NETUSBCAM_Stop(index: c_uint) -> c_int;
    fn NETUSBCAM_GetSerialNum(index: c_uint, serial: *mut c_char, length: c_uint) -> c_int;
    fn NETUSBCAM_GetName(index: c_uint, name: *mut c_char, length: c_uint) -> c_int;
    fn NETUSBCAM_GetFWVersion(index: c_uint, version: *mut c_char, length: c_uint) -> c_int;
    fn NETUSBCAM_SetResolution(
        index: c_uint,
        x_res: c_int,
        y_res: c_int,
        x_pos: c_int,
        y_pos: c_int,
    ) -> c_int;
    fn NETUSBCAM_GetResolution(
        index: c_uint,
        x_res: *mut c_int,
        y_res: *mut c_int,
        x_pos: *mut c_int,
        y_pos: *mut c_int,
    ) -> c_int;
    fn NETUSBCAM_GetModeList(index: c_uint, length: *mut c_uint, modes: *mut c_uint) -> c_int;
    fn NETUSBCAM_GetMode(index: c_uint, mode: *mut c_uint) -> c_int;
    fn NETUSBCAM_SetMode(index: c_uint, mode: c_uint) -> c_int;
    fn NETUSBCAM_GetResolutionRange(index: c_uint, property: *mut RoiRangeRaw) -> c_int;
    fn NETUSBCAM_SetCamParameter(index: c_uint, kind: c_int, value: c_ulong) -> c_int;
    fn NETUSBCAM_GetCamParameter(index: c_uint, kind: c_int, value: *mut c_ulong) -> c_int;
    fn NETUSBCAM_GetCamParameterRange(
        index: c_uint,
        kind: c_int,
        property: *mut ParamPropertyRaw,
    ) -> c_int;
    fn NETUSBCAM_GetParamAuto(index: c_uint, kind: c_int, auto: *mut c_int) -> c_int;
    fn NETUSBCAM_SetParamAuto(index: c_uint, kind: c_int, auto: c_char) -> c_int;
    fn NETUSBCAM_GetTrigger(index: c_uint, mode: *mut c_int) -> c_int;
    fn NETUSBCAM_SetTrigger(index: c_uint, mode: c_int) -> c_int;
    fn NETUSBCAM_GetBrokenFrames(index: c_uint, frames: *mut c_uint) -> c_int;
    fn NETUSBCAM_GetGoodFrames(index: c_uint, frames: *mut c_uint) -> c_int;
    fn NETUSBCAM_GetExposure(index: c_uint, value: *mut f32) -> c_int;
    fn NETUSBCAM_GetExposureRange(index: c_uint, property: *mut ParamPropertyF) -> c_int;
    fn NETUSBCAM_SetCallback(
        index: c_uint,
        mode: c_int,
        callback: Option<FrameCallback>,
        context: *mut c_void,
    ) -> c_int;
}

fn check(call: &'static str, status: c_int) -> SdkResult<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(SdkError::new(call, status))
    }
}

fn to_int(call: &'static str, value: u32) -> SdkResult<c_int> {
    c_int::try_from(value).map_err(|_| SdkError::new(call, -1))
}

fn to_uint(call: &'static str, value: c_int) -> SdkResult<u32> {
    u32::try_from(value).map_err(|_| SdkError::new(call, value))
}

/// Called by the SDK on its transfer thread for each completed frame.
///
/// # Safety contract
///
/// `context` is the address of an `Arc<dyn FrameSink>` boxed in the
/// [`NetUsbCam`] sink map, which outlives the registration. `buffer` points to
/// `size` readable bytes for the duration of the call.
extern "C" fn frame_complete(buffer: *mut c_void, size: c_uint, context: *mut c_void) -> c_int {
    if buffer.is_null() || context.is_null() {
        return 0;
    }
    // SAFETY: see the contract above; the SDK guarantees the buffer extent.
    let (sink, data) = unsafe {
        (
            &*(context as *const Arc<dyn FrameSink>),
            std::slice::from_raw_parts(buffer as *const u8, size as usize),
        )
    };
    sink.frame_complete(data);
    0
}

/// Handle to the initialised vendor library.
pub struct NetUsbCam {
    count: u32,
    // Boxed so the callback context address stays fixed.
    #[allow(clippy::redundant_allocation)]
    sinks: Mutex<HashMap<u32, Box<Arc<dyn FrameSink>>>>,
}

impl NetUsbCam {
    /// Initialise the library and enumerate cameras.
    ///
    /// # Errors
    ///
    /// Fails when no camera is connected.
    pub fn init() -> SdkResult<Self> {
        // SAFETY: no preconditions.
        let found = unsafe { NETUSBCAM_Init() };
        if found <= 0 {
            return Err(SdkError::new("NETUSBCAM_Init", found));
        }
        let count = to_uint("NETUSBCAM_Init", found)?;
        tracing::info!(count, "NETUSBCAM initialised");
        Ok(Self {
            count,
            sinks: Mutex::new(HashMap::new()),
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read_string(
        call: &'static str,
        index: u32,
        f: unsafe extern "C" fn(c_uint, *mut c_char, c_uint) -> c_int,
    ) -> SdkResult<String> {
        let mut buf: [c_char; ID_LEN] = [0; ID_LEN];
        // SAFETY: the buffer holds ID_LEN bytes and the length is passed along.
        check(call, unsafe { f(index, buf.as_mut_ptr(), ID_LEN as c_uint) })?;
        if let Some(last) = buf.last_mut() {
            *last = 0;
        }
        // SAFETY: NUL-terminated above.
        let text = unsafe { CStr::from_ptr(buf.as_ptr()) };
        Ok(text.to_string_lossy().into_owned())
    }
}

impl Drop for NetUsbCam {
    fn drop(&mut self) {
        let indices: Vec<u32> = self.sinks.get_mut().keys().copied().collect();
        for index in indices {
            // SAFETY: clearing a callback has no preconditions.
            let status =
                unsafe { NETUSBCAM_SetCallback(index, CALLBACK_RAW, None, std::ptr::null_mut()) };
            if status != 0 {
                tracing::warn!(index, status, "Clearing frame callback failed");
            }
        }
    }
}

impl CameraSdk for NetUsbCam {
    fn device_count(&self) -> u32 {
        self.count
    }

    fn open(&self, index: u32) -> SdkResult<()> {
        // SAFETY: index is a plain value; the SDK validates it.
        check("NETUSBCAM_Open", unsafe { NETUSBCAM_Open(index) })
    }

    fn close(&self, index: u32) -> SdkResult<()> {
        // SAFETY: as above.
        let status = unsafe { NETUSBCAM_Close(index) };
        self.sinks.lock().remove(&index);
        check("NETUSBCAM_Close", status)
    }

    fn start(&self, index: u32) -> SdkResult<()> {
        // SAFETY: as above.
        check("NETUSBCAM_Start", unsafe { NETUSBCAM_Start(index) })
    }

    fn stop(&self, index: u32) -> SdkResult<()> {
        // SAFETY: as above.
        check("NETUSBCAM_Stop", unsafe { NETUSBCAM_Stop(index) })
    }

    fn mode_list(&self, index: u32) -> SdkResult<Vec<u32>> {
        let mut modes = [0; MAX_MODES as usize];
        // In: capacity of `modes`. Out: number of entries written.
        let mut length = MAX_MODES;
        // SAFETY: the list holds MAX_MODES entries and that capacity is passed in.
        check("NETUSBCAM_GetModeList", unsafe {
            NETUSBCAM_GetModeList(index, &mut length, modes.as_mut_ptr())
        })?;
        Ok(modes.iter().take(length.min(MAX_MODES) as usize).copied().collect())
    }

    fn mode(&self, index: u32) -> SdkResult<u32> {
        let mut mode: c_uint = 0;
        // SAFETY: out-pointer to a local.
        check("NETUSBCAM_GetMode", unsafe { NETUSBCAM_GetMode(index, &mut mode) })?;
        Ok(mode)
    }

    fn set_mode(&self, index: u32, mode: u32) -> SdkResult<()> {
        // SAFETY: plain values.
        check("NETUSBCAM_SetMode", unsafe { NETUSBCAM_SetMode(index, mode) })
    }

    fn roi(&self, index: u32) -> SdkResult<Roi> {
        let call = "NETUSBCAM_GetResolution";
        let (mut w, mut h, mut x, mut y): (c_int, c_int, c_int, c_int) = (0, 0, 0, 0);
        // SAFETY: out-pointers to locals.
        check(call, unsafe {
            NETUSBCAM_GetResolution(index, &mut w, &mut h, &mut x, &mut y)
        })?;
        Ok(Roi::new(
            to_uint(call, w)?,
            to_uint(call, h)?,
            to_uint(call, x)?,
            to_uint(call, y)?,
        ))
    }

    fn set_roi(&self, index: u32, roi: Roi) -> SdkResult<()> {
        let call = "NETUSBCAM_SetResolution";
        let (w, h) = (to_int(call, roi.width)?, to_int(call, roi.height)?);
        let (x, y) = (to_int(call, roi.start_col)?, to_int(call, roi.start_row)?);
        // SAFETY: plain values.
        check(call, unsafe { NETUSBCAM_SetResolution(index, w, h, x, y) })
    }

    fn roi_range(&self, index: u32) -> SdkResult<RoiRange> {
        let call = "NETUSBCAM_GetResolutionRange";
        let mut raw = RoiRangeRaw::default();
        // SAFETY: out-pointer to a repr(C) local.
        check(call, unsafe { NETUSBCAM_GetResolutionRange(index, &mut raw) })?;
        Ok(RoiRange {
            x_min: to_uint(call, raw.x_min)?,
            x_max: to_uint(call, raw.x_max)?,
            y_min: to_uint(call, raw.y_min)?,
            y_max: to_uint(call, raw.y_max)?,
        })
    }

    fn trigger(&self, index: u32) -> SdkResult<TriggerMode> {
        let mut code: c_int = 0;
        // SAFETY: out-pointer to a local.
        check("NETUSBCAM_GetTrigger", unsafe {
            NETUSBCAM_GetTrigger(index, &mut code)
        })?;
        TriggerMode::from_code(code).ok_or(SdkError::new("NETUSBCAM_GetTrigger", code))
    }

    fn set_trigger(&self, index: u32, mode: TriggerMode) -> SdkResult<()> {
        // SAFETY: plain values. A fire may invoke the callback before returning.
        check("NETUSBCAM_SetTrigger", unsafe {
            NETUSBCAM_SetTrigger(index, mode.code())
        })
    }

    fn param(&self, index: u32, register: Register) -> SdkResult<u64> {
        let mut value: c_ulong = 0;
        // SAFETY: out-pointer to a local.
        check("NETUSBCAM_GetCamParameter", unsafe {
            NETUSBCAM_GetCamParameter(index, register.code(), &mut value)
        })?;
        Ok(u64::from(value))
    }

    fn set_param(&self, index: u32, register: Register, value: u64) -> SdkResult<()> {
        let call = "NETUSBCAM_SetCamParameter";
        let value = c_ulong::try_from(value).map_err(|_| SdkError::new(call, -1))?;
        // SAFETY: plain values.
        check(call, unsafe {
            NETUSBCAM_SetCamParameter(index, register.code(), value)
        })
    }

    fn param_range(&self, index: u32, register: Register) -> SdkResult<ParamProperty> {
        let mut raw = ParamPropertyRaw::default();
        // SAFETY: out-pointer to a repr(C) local.
        check("NETUSBCAM_GetCamParameterRange", unsafe {
            NETUSBCAM_GetCamParameterRange(index, register.code(), &mut raw)
        })?;
        Ok(ParamProperty {
            enabled: raw.enabled != 0,
            auto_capable: raw.auto != 0,
            one_push_capable: raw.one_push != 0,
            default: u64::from(raw.def),
            min: u64::from(raw.min),
            max: u64::from(raw.max),
        })
    }

    fn param_auto(&self, index: u32, register: Register) -> SdkResult<bool> {
        let mut auto: c_int = 0;
        // SAFETY: out-pointer to a local.
        check("NETUSBCAM_GetParamAuto", unsafe {
            NETUSBCAM_GetParamAuto(index, register.code(), &mut auto)
        })?;
        Ok(auto != 0)
    }

    fn set_param_auto(&self, index: u32, register: Register, enabled: bool) -> SdkResult<()> {
        // SAFETY: plain values.
        check("NETUSBCAM_SetParamAuto", unsafe {
            NETUSBCAM_SetParamAuto(index, register.code(), c_char::from(enabled))
        })
    }

    fn exposure_ms(&self, index: u32) -> SdkResult<f32> {
        let mut value: f32 = 0.0;
        // SAFETY: out-pointer to a local.
        check("NETUSBCAM_GetExposure", unsafe {
            NETUSBCAM_GetExposure(index, &mut value)
        })?;
        Ok(value)
    }

    fn exposure_range(&self, index: u32) -> SdkResult<ExposureRange> {
        let mut raw = ParamPropertyF::default();
        // SAFETY: out-pointer to a repr(C) local.
        check("NETUSBCAM_GetExposureRange", unsafe {
            NETUSBCAM_GetExposureRange(index, &mut raw)
        })?;
        Ok(ExposureRange {
            auto_capable: raw.auto != 0,
            default: raw.def,
            min: raw.min,
            max: raw.max,
        })
    }

    fn set_callback(&self, index: u32, sink: Arc<dyn FrameSink>) -> SdkResult<()> {
        let mut sinks = self.sinks.lock();
        let boxed = Box::new(sink);
        let context = std::ptr::addr_of!(*boxed) as *mut c_void;
        // SAFETY: the boxed sink is stored below and only dropped after the
        // callback is replaced or the device closed.
        check("NETUSBCAM_SetCallback", unsafe {
            NETUSBCAM_SetCallback(index, CALLBACK_RAW, Some(frame_complete), context)
        })?;
        sinks.insert(index, boxed);
        Ok(())
    }

    fn device_info(&self, index: u32) -> SdkResult<DeviceInfo> {
        Ok(DeviceInfo {
            name: Self::read_string("NETUSBCAM_GetName", index, NETUSBCAM_GetName)?,
            serial: Self::read_string("NETUSBCAM_GetSerialNum", index, NETUSBCAM_GetSerialNum)?,
            firmware: Self::read_string("NETUSBCAM_GetFWVersion", index, NETUSBCAM_GetFWVersion)?,
        })
    }

    fn frame_counters(&self, index: u32) -> SdkResult<FrameCounters> {
        let (mut good, mut broken): (c_uint, c_uint) = (0, 0);
        // SAFETY: out-pointers to locals.
        check("NETUSBCAM_GetGoodFrames", unsafe {
            NETUSBCAM_GetGoodFrames(index, &mut good)
        })?;
        // SAFETY: as above.
        check("NETUSBCAM_GetBrokenFrames", unsafe {
            NETUSBCAM_GetBrokenFrames(index, &mut broken)
        })?;
        Ok(FrameCounters { good, broken })
    }
}
