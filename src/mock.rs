//! Simulated iCube SDK for testing without hardware.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::SdkError;
use crate::modes::ICUBE_MODES;
use crate::traits::{
    CameraSdk, DeviceInfo, ExposureRange, FrameCounters, FrameSink, ParamProperty, Register,
    Resolution, Roi, RoiRange, SdkResult, TriggerMode,
};

/// Smallest ROI edge the simulated sensor accepts.
pub const MIN_ROI_EDGE: u32 = 8;

/// Status returned by failing mock calls.
pub const MOCK_FAILURE: i32 = -1;

/// When a triggered frame reaches the installed callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Inside the trigger call, on the caller's thread.
    Immediate,
    /// On a separate thread after the given delay.
    Delayed(Duration),
    /// Never; the capture is lost.
    Never,
}

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPattern {
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Every pixel at the same intensity.
    Solid(u8),
}

#[derive(Debug, Clone, Copy)]
struct MockRegister {
    value: u64,
    property: ParamProperty,
    auto: bool,
}

struct MockCamera {
    open: bool,
    streaming: bool,
    supported: Vec<u32>,
    mode: u32,
    roi: Roi,
    trigger: TriggerMode,
    registers: HashMap<Register, MockRegister>,
    sink: Option<Arc<dyn FrameSink>>,
    delivery: Delivery,
    pattern: TestPattern,
    delivered: u32,
    fires: u32,
}

/// Mock SDK exposing any number of simulated cameras.
pub struct MockSdk {
    table: Vec<Resolution>,
    cameras: Mutex<Vec<MockCamera>>,
    failures: Mutex<HashSet<&'static str>>,
    open_delay: Duration,
}

fn register(value: u64, min: u64, max: u64, auto_capable: bool) -> MockRegister {
    MockRegister {
        value,
        property: ParamProperty {
            enabled: true,
            auto_capable,
            one_push_capable: false,
            default: value,
            min,
            max,
        },
        auto: false,
    }
}

fn default_registers() -> HashMap<Register, MockRegister> {
    HashMap::from([
        (Register::ExposureTime, register(100, 1, 2000, true)),
        (Register::ExposureTarget, register(128, 0, 255, false)),
        (Register::Gain, register(16, 0, 63, true)),
        (Register::Brightness, register(128, 0, 255, false)),
        (Register::Contrast, register(128, 0, 255, false)),
        (Register::Gamma, register(64, 0, 255, false)),
        (Register::BlackLevel, register(0, 0, 255, false)),
        (Register::FlippedH, register(0, 0, 1, false)),
        (Register::FlippedV, register(0, 0, 1, false)),
        (Register::Pll, register(1, 0, 3, false)),
    ])
}

impl MockSdk {
    /// Create `count` cameras supporting every iCube preset.
    #[must_use]
    pub fn new(count: u32) -> Self {
        let table = ICUBE_MODES.to_vec();
        let supported: Vec<u32> = (0..table.len()).filter_map(|i| u32::try_from(i).ok()).collect();
        let cameras = (0..count)
            .map(|_| Self::camera(&table, supported.clone()))
            .collect();
        Self {
            table,
            cameras: Mutex::new(cameras),
            failures: Mutex::new(HashSet::new()),
            open_delay: Duration::ZERO,
        }
    }

    fn camera(table: &[Resolution], supported: Vec<u32>) -> MockCamera {
        let mode = supported.first().copied().unwrap_or(0);
        let res = table
            .get(mode as usize)
            .copied()
            .unwrap_or(Resolution::new(MIN_ROI_EDGE, MIN_ROI_EDGE));
        MockCamera {
            open: false,
            streaming: false,
            supported,
            mode,
            roi: Roi::full(res),
            trigger: TriggerMode::FreeRun,
            registers: default_registers(),
            sink: None,
            delivery: Delivery::Immediate,
            pattern: TestPattern::Gradient,
            delivered: 0,
            fires: 0,
        }
    }

    /// Replace the sensor's preset list (mode index order).
    #[must_use]
    pub fn with_mode_table(mut self, table: Vec<Resolution>) -> Self {
        let supported: Vec<u32> = (0..table.len()).filter_map(|i| u32::try_from(i).ok()).collect();
        self.table = table;
        self.with_modes(supported)
    }

    /// Restrict the mode indices every camera reports as supported.
    #[must_use]
    pub fn with_modes(mut self, supported: Vec<u32>) -> Self {
        let table = self.table.clone();
        for cam in self.cameras.get_mut().iter_mut() {
            let (delivery, pattern) = (cam.delivery, cam.pattern);
            *cam = Self::camera(&table, supported.clone());
            cam.delivery = delivery;
            cam.pattern = pattern;
        }
        self
    }

    /// Set how triggered frames are delivered on every camera.
    #[must_use]
    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        for cam in self.cameras.get_mut().iter_mut() {
            cam.delivery = delivery;
        }
        self
    }

    /// Set the frame pattern on every camera.
    #[must_use]
    pub fn with_pattern(mut self, pattern: TestPattern) -> Self {
        for cam in self.cameras.get_mut().iter_mut() {
            cam.pattern = pattern;
        }
        self
    }

    /// Make `open` block for `delay` before touching the camera.
    #[must_use]
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Change the delivery policy of one camera at runtime.
    pub fn set_delivery(&self, index: u32, delivery: Delivery) {
        if let Some(cam) = self.cameras.lock().get_mut(index as usize) {
            cam.delivery = delivery;
        }
    }

    /// Make every subsequent `call` fail until cleared.
    pub fn fail_on(&self, call: &'static str) {
        self.failures.lock().insert(call);
    }

    /// Stop failing `call`.
    pub fn clear_failure(&self, call: &'static str) {
        self.failures.lock().remove(call);
    }

    /// Whether the camera's stream is running.
    pub fn is_streaming(&self, index: u32) -> bool {
        self.cameras
            .lock()
            .get(index as usize)
            .is_some_and(|cam| cam.streaming)
    }

    /// Whether the camera is open.
    pub fn is_open(&self, index: u32) -> bool {
        self.cameras
            .lock()
            .get(index as usize)
            .is_some_and(|cam| cam.open)
    }

    /// Number of software fire commands received.
    pub fn fires(&self, index: u32) -> u32 {
        self.cameras
            .lock()
            .get(index as usize)
            .map_or(0, |cam| cam.fires)
    }

    /// Simulate an external trigger pulse. Returns whether a capture started.
    pub fn fire_external(&self, index: u32) -> bool {
        let job = {
            let mut cameras = self.cameras.lock();
            match cameras.get_mut(index as usize) {
                Some(cam) if cam.streaming && cam.trigger == TriggerMode::External => {
                    Self::capture(cam)
                }
                _ => None,
            }
        };
        job.map(|(sink, data, delivery)| Self::deliver(sink, data, delivery))
            .is_some()
    }

    /// Deliver a frame nobody asked for, on the calling thread.
    pub fn inject_completion(&self, index: u32) {
        let job = {
            let mut cameras = self.cameras.lock();
            cameras.get_mut(index as usize).and_then(Self::capture)
        };
        if let Some((sink, data, _)) = job {
            Self::deliver(sink, data, Delivery::Immediate);
        }
    }

    fn capture(cam: &mut MockCamera) -> Option<(Arc<dyn FrameSink>, Vec<u8>, Delivery)> {
        let sink = Arc::clone(cam.sink.as_ref()?);
        cam.delivered += 1;
        let mut data = generate_test_frame(cam.roi, cam.pattern);
        stamp_sequence(&mut data, cam.delivered);
        Some((sink, data, cam.delivery))
    }

    fn deliver(sink: Arc<dyn FrameSink>, data: Vec<u8>, delivery: Delivery) {
        match delivery {
            Delivery::Immediate => sink.frame_complete(&data),
            Delivery::Delayed(delay) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    sink.frame_complete(&data);
                });
            }
            Delivery::Never => {}
        }
    }

    fn check(&self, call: &'static str) -> SdkResult<()> {
        if self.failures.lock().contains(call) {
            Err(SdkError::new(call, MOCK_FAILURE))
        } else {
            Ok(())
        }
    }

    fn with_camera<T, F>(&self, index: u32, call: &'static str, f: F) -> SdkResult<T>
    where
        F: FnOnce(&mut MockCamera, &[Resolution]) -> SdkResult<T>,
    {
        self.check(call)?;
        let mut cameras = self.cameras.lock();
        let cam = cameras
            .get_mut(index as usize)
            .ok_or(SdkError::new(call, MOCK_FAILURE))?;
        if !cam.open && call != "open" {
            return Err(SdkError::new(call, MOCK_FAILURE));
        }
        f(cam, &self.table)
    }

    fn with_register<T, F>(
        &self,
        index: u32,
        register: Register,
        call: &'static str,
        f: F,
    ) -> SdkResult<T>
    where
        F: FnOnce(&mut MockRegister) -> SdkResult<T>,
    {
        self.with_camera(index, call, |cam, _| {
            let reg = cam
                .registers
                .get_mut(&register)
                .ok_or(SdkError::new(call, MOCK_FAILURE))?;
            f(reg)
        })
    }
}

impl CameraSdk for MockSdk {
    fn device_count(&self) -> u32 {
        u32::try_from(self.cameras.lock().len()).unwrap_or(u32::MAX)
    }

    fn open(&self, index: u32) -> SdkResult<()> {
        if !self.open_delay.is_zero() {
            thread::sleep(self.open_delay);
        }
        self.with_camera(index, "open", |cam, _| {
            if cam.open {
                return Err(SdkError::new("open", MOCK_FAILURE));
            }
            cam.open = true;
            Ok(())
        })
    }

    fn close(&self, index: u32) -> SdkResult<()> {
        let result = self.with_camera(index, "close", |cam, _| {
            cam.open = false;
            cam.streaming = false;
            Ok(())
        });
        if result.is_err() {
            // A failed close still releases the handle, as the vendor SDK does
            if let Some(cam) = self.cameras.lock().get_mut(index as usize) {
                cam.open = false;
                cam.streaming = false;
            }
        }
        result
    }

    fn start(&self, index: u32) -> SdkResult<()> {
        self.with_camera(index, "start", |cam, _| {
            cam.streaming = true;
            Ok(())
        })
    }

    fn stop(&self, index: u32) -> SdkResult<()> {
        self.with_camera(index, "stop", |cam, _| {
            cam.streaming = false;
            Ok(())
        })
    }

    fn mode_list(&self, index: u32) -> SdkResult<Vec<u32>> {
        self.with_camera(index, "mode_list", |cam, _| Ok(cam.supported.clone()))
    }

    fn mode(&self, index: u32) -> SdkResult<u32> {
        self.with_camera(index, "mode", |cam, _| Ok(cam.mode))
    }

    fn set_mode(&self, index: u32, mode: u32) -> SdkResult<()> {
        self.with_camera(index, "set_mode", |cam, table| {
            let res = table
                .get(mode as usize)
                .filter(|_| cam.supported.contains(&mode))
                .ok_or(SdkError::new("set_mode", MOCK_FAILURE))?;
            cam.mode = mode;
            cam.roi = Roi::full(*res);
            Ok(())
        })
    }

    fn roi(&self, index: u32) -> SdkResult<Roi> {
        self.with_camera(index, "roi", |cam, _| Ok(cam.roi))
    }

    fn set_roi(&self, index: u32, roi: Roi) -> SdkResult<()> {
        self.with_camera(index, "set_roi", |cam, table| {
            let res = table
                .get(cam.mode as usize)
                .ok_or(SdkError::new("set_roi", MOCK_FAILURE))?;
            let fits_x = roi.start_col.saturating_add(roi.width) <= res.width;
            let fits_y = roi.start_row.saturating_add(roi.height) <= res.height;
            if !fits_x || !fits_y || roi.width < MIN_ROI_EDGE || roi.height < MIN_ROI_EDGE {
                return Err(SdkError::new("set_roi", MOCK_FAILURE));
            }
            cam.roi = roi;
            Ok(())
        })
    }

    fn roi_range(&self, index: u32) -> SdkResult<RoiRange> {
        self.with_camera(index, "roi_range", |cam, table| {
            let res = table
                .get(cam.mode as usize)
                .ok_or(SdkError::new("roi_range", MOCK_FAILURE))?;
            Ok(RoiRange {
                x_min: MIN_ROI_EDGE,
                x_max: res.width,
                y_min: MIN_ROI_EDGE,
                y_max: res.height,
            })
        })
    }

    fn trigger(&self, index: u32) -> SdkResult<TriggerMode> {
        self.with_camera(index, "trigger", |cam, _| Ok(cam.trigger))
    }

    fn set_trigger(&self, index: u32, mode: TriggerMode) -> SdkResult<()> {
        let job = self.with_camera(index, "set_trigger", |cam, _| {
            if mode != TriggerMode::SoftwareFire {
                cam.trigger = mode;
                return Ok(None);
            }
            cam.fires += 1;
            Ok(if cam.streaming {
                Self::capture(cam)
            } else {
                None
            })
        })?;
        if let Some((sink, data, delivery)) = job {
            Self::deliver(sink, data, delivery);
        }
        Ok(())
    }

    fn param(&self, index: u32, register: Register) -> SdkResult<u64> {
        self.with_register(index, register, "param", |reg| Ok(reg.value))
    }

    fn set_param(&self, index: u32, register: Register, value: u64) -> SdkResult<()> {
        self.with_register(index, register, "set_param", |reg| {
            if value < reg.property.min || value > reg.property.max {
                return Err(SdkError::new("set_param", MOCK_FAILURE));
            }
            reg.value = value;
            Ok(())
        })
    }

    fn param_range(&self, index: u32, register: Register) -> SdkResult<ParamProperty> {
        self.with_register(index, register, "param_range", |reg| Ok(reg.property))
    }

    fn param_auto(&self, index: u32, register: Register) -> SdkResult<bool> {
        self.with_register(index, register, "param_auto", |reg| Ok(reg.auto))
    }

    fn set_param_auto(&self, index: u32, register: Register, enabled: bool) -> SdkResult<()> {
        self.with_register(index, register, "set_param_auto", |reg| {
            if !reg.property.auto_capable {
                return Err(SdkError::new("set_param_auto", MOCK_FAILURE));
            }
            reg.auto = enabled;
            Ok(())
        })
    }

    #[allow(clippy::cast_precision_loss)]
    fn exposure_ms(&self, index: u32) -> SdkResult<f32> {
        self.with_register(index, Register::ExposureTime, "exposure_ms", |reg| {
            Ok(reg.value as f32 / 10.0)
        })
    }

    #[allow(clippy::cast_precision_loss)]
    fn exposure_range(&self, index: u32) -> SdkResult<ExposureRange> {
        self.with_register(index, Register::ExposureTime, "exposure_range", |reg| {
            Ok(ExposureRange {
                auto_capable: reg.property.auto_capable,
                default: reg.property.default as f32 / 10.0,
                min: reg.property.min as f32 / 10.0,
                max: reg.property.max as f32 / 10.0,
            })
        })
    }

    fn set_callback(&self, index: u32, sink: Arc<dyn FrameSink>) -> SdkResult<()> {
        self.with_camera(index, "set_callback", |cam, _| {
            cam.sink = Some(sink);
            Ok(())
        })
    }

    fn device_info(&self, index: u32) -> SdkResult<DeviceInfo> {
        self.with_camera(index, "device_info", |_, _| {
            Ok(DeviceInfo {
                name: "Mock iCube".to_owned(),
                serial: format!("MOCK{index:04}"),
                firmware: "1.0.0".to_owned(),
            })
        })
    }

    fn frame_counters(&self, index: u32) -> SdkResult<FrameCounters> {
        self.with_camera(index, "frame_counters", |cam, _| {
            Ok(FrameCounters {
                good: cam.delivered,
                broken: 0,
            })
        })
    }
}

/// Generate test frame data based on pattern.
fn generate_test_frame(roi: Roi, pattern: TestPattern) -> Vec<u8> {
    let mut data = vec![0u8; roi.byte_count()];
    match pattern {
        TestPattern::Gradient => generate_gradient(&mut data, roi.width),
        TestPattern::Solid(value) => data.fill(value),
    }
    data
}

/// Generate an 8-bit horizontal gradient.
fn generate_gradient(data: &mut [u8], width: u32) {
    if width == 0 {
        return;
    }
    for row in data.chunks_mut(width as usize) {
        for (x, px) in (0u32..).zip(row.iter_mut()) {
            #[allow(clippy::cast_possible_truncation)]
            {
                *px = ((x * 255) / width) as u8;
            }
        }
    }
}

fn stamp_sequence(data: &mut [u8], sequence: u32) {
    if let Some(head) = data.get_mut(..4) {
        head.copy_from_slice(&sequence.to_le_bytes());
    }
}

/// Delivery sequence number stamped into a mock frame.
#[must_use]
pub fn stamped_sequence(data: &[u8]) -> Option<u32> {
    let head: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(head))
}
