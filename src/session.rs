//! Device sessions and the slot table that owns them.
//!
//! A session opens straight into `Streaming` and keeps the hardware stream
//! running; frames are pulled one at a time by software trigger. Geometry
//! changes and stop-only register writes pass through [`DeviceSession`]'s
//! reconfiguration sequence: stop, apply, reallocate, restart.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::bridge::FrameBridge;
use crate::config::{AdapterConfig, MAX_GRAB_TIMEOUT_MS};
use crate::error::{CameraError, ReconfigurePhase, Result};
use crate::modes::{needs_realloc, Axis, ModeTable, Negotiator};
use crate::namespace::{Aspect, InfoQuery, InfoReply, ParamName, ParamQuery, ParamValue};
use crate::params::{parse_switch, ParameterController};
use crate::traits::{
    CameraSdk, Frame, FrameMetadata, FrameSink, Register, Resolution, Roi, TriggerMode,
};

/// Lifecycle state of a device slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session.
    Closed,
    /// Open in progress: negotiating geometry and arming the trigger.
    Opening,
    /// Configured, stream stopped.
    Ready,
    /// Stream running; grabs allowed.
    Streaming,
    /// Stream stopped for a parameter change.
    Reconfiguring,
}

/// Negotiated frame geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Sensor mode.
    pub resolution: Resolution,
    /// Region of interest within the mode.
    pub roi: Roi,
}

/// Parameters of an open request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenRequest {
    /// Device index.
    pub index: u32,
    /// Sensor mode; the camera's current mode when `None`.
    pub resolution: Option<Resolution>,
    /// Region of interest; the full mode when `None`.
    pub roi: Option<Roi>,
    /// Trigger source; the configured default when `None`.
    pub external_trigger: Option<bool>,
}

impl OpenRequest {
    /// Request for the device at `index` with default geometry.
    #[must_use]
    pub fn new(index: u32) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }

    /// Request an exact sensor mode.
    #[must_use]
    pub const fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some(Resolution::new(width, height));
        self
    }

    /// Request a region of interest.
    #[must_use]
    pub const fn with_roi(mut self, roi: Roi) -> Self {
        self.roi = Some(roi);
        self
    }

    /// Choose the trigger source.
    #[must_use]
    pub const fn with_external_trigger(mut self, external: bool) -> Self {
        self.external_trigger = Some(external);
        self
    }
}

/// Change applied with the stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Mode { value: u32, axis: Axis },
    Roi(Roi),
    Register { register: Register, value: i64 },
}

/// One open camera.
pub struct DeviceSession<S: CameraSdk> {
    sdk: Arc<S>,
    modes: Arc<ModeTable>,
    index: u32,
    state: SessionState,
    geometry: Geometry,
    grab_timeout: Duration,
    external_trigger: bool,
    bridge: Arc<FrameBridge>,
}

impl<S: CameraSdk> DeviceSession<S> {
    /// Open the device, negotiate geometry, arm the trigger and start streaming.
    ///
    /// Any failure after the device was opened closes it again.
    pub fn open(
        sdk: Arc<S>,
        modes: Arc<ModeTable>,
        request: &OpenRequest,
        config: &AdapterConfig,
    ) -> Result<Self> {
        let index = request.index;
        let count = sdk.device_count();
        if index >= count {
            return Err(CameraError::InvalidIndex {
                index,
                available: count,
            });
        }
        sdk.open(index)
            .map_err(|source| CameraError::DeviceUnavailable { index, source })?;

        match Self::setup(&sdk, &modes, request, config) {
            Ok((geometry, external_trigger, bridge)) => {
                tracing::info!(
                    index,
                    width = geometry.roi.width,
                    height = geometry.roi.height,
                    external_trigger,
                    "Camera streaming"
                );
                Ok(Self {
                    sdk,
                    modes,
                    index,
                    state: SessionState::Streaming,
                    geometry,
                    grab_timeout: config.grab_timeout(),
                    external_trigger,
                    bridge,
                })
            }
            Err(err) => {
                tracing::warn!(index, error = %err, "Open failed, closing device");
                if let Err(close_err) = sdk.close(index) {
                    tracing::warn!(index, error = %close_err, "Close after failed open failed");
                }
                Err(err)
            }
        }
    }

    fn setup(
        sdk: &Arc<S>,
        modes: &ModeTable,
        request: &OpenRequest,
        config: &AdapterConfig,
    ) -> Result<(Geometry, bool, Arc<FrameBridge>)> {
        let index = request.index;
        let negotiator = Negotiator::new(sdk.as_ref(), index, modes);

        let resolution = match request.resolution {
            Some(res) if res.width > 0 && res.height > 0 => {
                negotiator.resolve_mode(res.width, res.height)?
            }
            _ => negotiator.current_mode()?,
        };
        if let Some(roi) = request.roi.filter(|roi| roi.width > 0 && roi.height > 0) {
            negotiator.apply_roi(roi)?;
        }
        let roi = negotiator.current_roi()?;
        let bridge = Arc::new(FrameBridge::new(roi.byte_count(), config.late_frame_window())?);

        sdk.set_callback(index, Arc::clone(&bridge) as Arc<dyn FrameSink>)
            .map_err(|source| CameraError::ApplyFailed {
                param: "frame_callback",
                source,
            })?;

        let external = request.external_trigger.unwrap_or(config.external_trigger);
        arm_trigger(sdk.as_ref(), index, external)?;
        sdk.start(index)
            .map_err(|source| CameraError::DeviceUnavailable { index, source })?;

        Ok((Geometry { resolution, roi }, external, bridge))
    }

    /// Stop the stream and close the device.
    ///
    /// The stop is skipped when the stream is not running. Both steps are
    /// attempted even if the first fails; the first failure is reported.
    pub fn close(mut self) -> Result<()> {
        let index = self.index;
        let stopped = if self.state == SessionState::Streaming {
            self.sdk.stop(index)
        } else {
            Ok(())
        };
        if let Err(err) = &stopped {
            tracing::warn!(index, error = %err, "Stopping stream failed, closing anyway");
        }
        let closed = self.sdk.close(index);
        if let Err(err) = &closed {
            tracing::warn!(index, error = %err, "Closing device failed");
        }
        self.state = SessionState::Closed;
        tracing::info!(index, "Camera closed");

        stopped.map_err(CameraError::StopFailed)?;
        closed.map_err(CameraError::CloseFailed)
    }

    /// Device index.
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Current geometry.
    pub const fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Current frame buffer length in bytes.
    pub fn buffer_len(&self) -> usize {
        self.bridge.len()
    }

    /// Default timeout used by [`grab`](Self::grab).
    pub const fn grab_timeout(&self) -> Duration {
        self.grab_timeout
    }

    /// Capture exactly one frame.
    ///
    /// On timeout the stream keeps running and a later grab may succeed.
    pub fn grab(&self, timeout_override: Option<Duration>) -> Result<Frame> {
        if self.state != SessionState::Streaming {
            return Err(CameraError::NotStreaming);
        }
        let timeout = timeout_override.unwrap_or(self.grab_timeout);
        let roi = self.geometry.roi;
        let mut data = vec![0u8; roi.byte_count()];

        let sdk = self.sdk.as_ref();
        let index = self.index;
        let external = self.external_trigger;
        let result = self.bridge.wait_for_frame(&mut data, timeout, || {
            if external {
                return Ok(());
            }
            sdk.set_trigger(index, TriggerMode::SoftwareFire)
                .map_err(CameraError::TriggerFailed)
        });

        match result {
            Ok(generation) => {
                tracing::debug!(index, generation, "Frame grabbed");
                Ok(Frame {
                    data,
                    metadata: FrameMetadata {
                        generation,
                        width: roi.width,
                        height: roi.height,
                    },
                })
            }
            Err(err) => {
                if matches!(err, CameraError::GrabTimeout(_)) {
                    tracing::warn!(index, ?timeout, "Grab timed out");
                }
                Err(err)
            }
        }
    }

    /// Read a parameter, its range, or its description.
    pub fn get_param(&self, query: ParamQuery) -> Result<ParamValue> {
        match query.aspect {
            Aspect::Value => self.value_of(query.name),
            Aspect::Range => self.range_of(query.name),
            Aspect::Description => Ok(query.name.description().into()),
        }
    }

    fn value_of(&self, name: ParamName) -> Result<ParamValue> {
        let params = ParameterController::new(self.sdk.as_ref(), self.index);
        let Geometry { resolution, roi } = self.geometry;
        let value: ParamValue = match name {
            ParamName::HorizontalResolution => resolution.width.into(),
            ParamName::VerticalResolution => resolution.height.into(),
            ParamName::ImageWidth => roi.width.into(),
            ParamName::ImageHeight => roi.height.into(),
            ParamName::StartCol => roi.start_col.into(),
            ParamName::StartRow => roi.start_row.into(),
            ParamName::Index => self.index.into(),
            ParamName::GrabTimeout => duration_ms(self.grab_timeout).into(),
            ParamName::ExposureAuto => switch(params.auto(Register::ExposureTime)?),
            ParamName::ExposureMsec => f64::from(params.exposure_ms()?).into(),
            ParamName::ExternalTrigger => switch(self.external_trigger),
            ParamName::DeviceName => self.device_info()?.name.into(),
            ParamName::SerialNumber => self.device_info()?.serial.into(),
            ParamName::FirmwareVersion => self.device_info()?.firmware.into(),
            ParamName::GoodFrames => self.frame_counters()?.good.into(),
            ParamName::BrokenFrames => self.frame_counters()?.broken.into(),
            ParamName::ExposureTime
            | ParamName::ExposureTarget
            | ParamName::Gain
            | ParamName::Brightness
            | ParamName::Contrast
            | ParamName::Gamma
            | ParamName::BlackLevel
            | ParamName::FlipHorizontal
            | ParamName::FlipVertical
            | ParamName::PixelClock => {
                let register = register_of(name)?;
                saturating_i64(params.get(register)?).into()
            }
        };
        Ok(value)
    }

    fn range_of(&self, name: ParamName) -> Result<ParamValue> {
        let sdk = self.sdk.as_ref();
        let Geometry { resolution, roi } = self.geometry;
        let list: Vec<ParamValue> = match name {
            ParamName::HorizontalResolution => self.supported_modes(|res| res.width)?,
            ParamName::VerticalResolution => self.supported_modes(|res| res.height)?,
            ParamName::ImageWidth | ParamName::ImageHeight => {
                let range = sdk
                    .roi_range(self.index)
                    .map_err(|source| CameraError::QueryFailed {
                        what: "resolution range",
                        source,
                    })?;
                if name == ParamName::ImageWidth {
                    ints(&[range.x_min, range.x_max, resolution.width])
                } else {
                    ints(&[range.y_min, range.y_max, resolution.height])
                }
            }
            ParamName::StartCol => ints(&[0, resolution.width.saturating_sub(roi.width), 0]),
            ParamName::StartRow => ints(&[0, resolution.height.saturating_sub(roi.height), 0]),
            ParamName::GrabTimeout => ints(&[0, MAX_GRAB_TIMEOUT_MS, 1000]),
            ParamName::ExposureAuto => {
                let params = ParameterController::new(sdk, self.index);
                if params.range(Register::ExposureTime)?.auto_capable {
                    vec![switch(false), switch(true)]
                } else {
                    vec![switch(false)]
                }
            }
            ParamName::ExternalTrigger => vec![switch(false), switch(true)],
            ParamName::ExposureMsec => {
                let range = ParameterController::new(sdk, self.index).exposure_range()?;
                vec![
                    f64::from(range.min).into(),
                    f64::from(range.max).into(),
                    f64::from(range.default).into(),
                ]
            }
            ParamName::Index
            | ParamName::DeviceName
            | ParamName::SerialNumber
            | ParamName::FirmwareVersion
            | ParamName::GoodFrames
            | ParamName::BrokenFrames => {
                return Err(CameraError::UnknownParameter(format!("{}_range", name.as_str())))
            }
            ParamName::ExposureTime
            | ParamName::ExposureTarget
            | ParamName::Gain
            | ParamName::Brightness
            | ParamName::Contrast
            | ParamName::Gamma
            | ParamName::BlackLevel
            | ParamName::FlipHorizontal
            | ParamName::FlipVertical
            | ParamName::PixelClock => {
                let property =
                    ParameterController::new(sdk, self.index).range(register_of(name)?)?;
                vec![
                    saturating_i64(property.min).into(),
                    saturating_i64(property.max).into(),
                    saturating_i64(property.default).into(),
                ]
            }
        };
        Ok(ParamValue::List(list))
    }

    fn supported_modes<F>(&self, axis: F) -> Result<Vec<ParamValue>>
    where
        F: Fn(Resolution) -> u32,
    {
        let supported =
            self.sdk
                .mode_list(self.index)
                .map_err(|source| CameraError::QueryFailed {
                    what: "mode list",
                    source,
                })?;
        let mut values: Vec<u32> = Vec::new();
        for res in supported.iter().filter_map(|&mode| self.modes.get(mode)) {
            let value = axis(res);
            if !values.contains(&value) {
                values.push(value);
            }
        }
        Ok(values.into_iter().map(ParamValue::from).collect())
    }

    fn device_info(&self) -> Result<crate::traits::DeviceInfo> {
        self.sdk
            .device_info(self.index)
            .map_err(|source| CameraError::QueryFailed {
                what: "device info",
                source,
            })
    }

    fn frame_counters(&self) -> Result<crate::traits::FrameCounters> {
        self.sdk
            .frame_counters(self.index)
            .map_err(|source| CameraError::QueryFailed {
                what: "frame counters",
                source,
            })
    }

    /// Write a parameter.
    ///
    /// Geometry changes restart the stream unless the value is unchanged.
    pub fn set_param(&mut self, name: ParamName, value: &ParamValue) -> Result<()> {
        let param = name.as_str();
        if name.is_read_only() {
            return Err(CameraError::ReadOnly(param));
        }
        let Geometry { resolution, roi } = self.geometry;
        match name {
            ParamName::HorizontalResolution | ParamName::VerticalResolution => {
                let value = dimension(param, value)?;
                let (current, axis) = if name == ParamName::HorizontalResolution {
                    (resolution.width, Axis::Horizontal)
                } else {
                    (resolution.height, Axis::Vertical)
                };
                if value == current {
                    return Ok(());
                }
                self.reconfigure(Change::Mode { value, axis })
            }
            ParamName::ImageWidth
            | ParamName::ImageHeight
            | ParamName::StartCol
            | ParamName::StartRow => {
                let value = dimension(param, value)?;
                let mut next = roi;
                match name {
                    ParamName::ImageWidth => next.width = value,
                    ParamName::ImageHeight => next.height = value,
                    ParamName::StartCol => next.start_col = value,
                    _ => next.start_row = value,
                }
                if next == roi {
                    return Ok(());
                }
                self.reconfigure(Change::Roi(next))
            }
            ParamName::GrabTimeout => {
                let ms = integer(param, value)?;
                if !(0..=i64::from(MAX_GRAB_TIMEOUT_MS)).contains(&ms) {
                    return Err(CameraError::OutOfRange {
                        param,
                        value: ms,
                        min: 0,
                        max: i64::from(MAX_GRAB_TIMEOUT_MS),
                    });
                }
                self.grab_timeout = Duration::from_millis(ms.unsigned_abs());
                Ok(())
            }
            ParamName::ExposureAuto => ParameterController::new(self.sdk.as_ref(), self.index)
                .set_auto(Register::ExposureTime, value),
            ParamName::ExternalTrigger => {
                let external = parse_switch(param, value)?;
                if external == self.external_trigger {
                    return Ok(());
                }
                arm_trigger(self.sdk.as_ref(), self.index, external)?;
                self.external_trigger = external;
                Ok(())
            }
            _ => {
                let register = register_of(name)?;
                let value = integer(param, value)?;
                let params = ParameterController::new(self.sdk.as_ref(), self.index);
                if !register.requires_stop() {
                    return params.set(register, value);
                }
                if i64::try_from(params.get(register)?).is_ok_and(|current| current == value) {
                    return Ok(());
                }
                self.reconfigure(Change::Register { register, value })
            }
        }
    }

    /// Stop the stream, apply `change`, resize the buffer if needed, restart.
    ///
    /// Every exit path attempts the restart once the stream was stopped. If
    /// that restart fails the session drops to `Ready` and the error is
    /// [`CameraError::ReconfigureIncomplete`].
    fn reconfigure(&mut self, change: Change) -> Result<()> {
        let index = self.index;
        if self.state == SessionState::Streaming {
            tracing::debug!(index, phase = %ReconfigurePhase::Stop, ?change, "Reconfiguring");
            self.sdk
                .stop(index)
                .map_err(CameraError::ReconfigureFailed)?;
        }
        self.state = SessionState::Reconfiguring;
        self.bridge.reset();

        let previous = self.geometry;
        let outcome = self.apply(change).and_then(|geometry| {
            tracing::debug!(index, phase = %ReconfigurePhase::Reallocate, "Reconfiguring");
            self.reallocate(previous, geometry)
                .map_err(|err| (ReconfigurePhase::Reallocate, err))
        });

        tracing::debug!(index, phase = %ReconfigurePhase::Restart, "Reconfiguring");
        if let Err(source) = self.sdk.start(index) {
            self.state = SessionState::Ready;
            let phase = outcome.err().map_or(ReconfigurePhase::Restart, |(phase, err)| {
                tracing::warn!(index, error = %err, "Reconfiguration failed");
                phase
            });
            tracing::warn!(index, error = %source, "Stream restart failed");
            return Err(CameraError::ReconfigureIncomplete { phase, source });
        }
        self.state = SessionState::Streaming;
        outcome.map_err(|(_, err)| err)
    }

    fn apply(
        &self,
        change: Change,
    ) -> std::result::Result<Geometry, (ReconfigurePhase, CameraError)> {
        let negotiator = Negotiator::new(self.sdk.as_ref(), self.index, &self.modes);
        let tagged = |err| (ReconfigurePhase::Apply, err);
        let resolution = match change {
            Change::Mode { value, axis } => {
                negotiator.resolve_mode_by_axis(value, axis).map_err(tagged)?
            }
            Change::Roi(roi) => {
                negotiator.apply_roi(roi).map_err(tagged)?;
                self.geometry.resolution
            }
            Change::Register { register, value } => {
                ParameterController::new(self.sdk.as_ref(), self.index)
                    .set(register, value)
                    .map_err(tagged)?;
                self.geometry.resolution
            }
        };
        let roi = negotiator.current_roi().map_err(tagged)?;
        Ok(Geometry { resolution, roi })
    }

    fn reallocate(&mut self, previous: Geometry, next: Geometry) -> Result<()> {
        if needs_realloc(&previous.roi, &next.roi) {
            if let Err(err) = self.bridge.resize(next.roi.byte_count()) {
                self.restore(previous);
                return Err(err);
            }
        }
        self.geometry = next;
        Ok(())
    }

    /// Best-effort return to `previous` after the buffer could not follow.
    fn restore(&self, previous: Geometry) {
        let negotiator = Negotiator::new(self.sdk.as_ref(), self.index, &self.modes);
        let restored = negotiator
            .resolve_mode(previous.resolution.width, previous.resolution.height)
            .and_then(|_| negotiator.apply_roi(previous.roi));
        if let Err(err) = restored {
            tracing::warn!(index = self.index, error = %err, "Restoring previous geometry failed");
        }
    }
}

fn arm_trigger<S: CameraSdk + ?Sized>(sdk: &S, index: u32, external: bool) -> Result<()> {
    let apply = |mode| {
        sdk.set_trigger(index, mode)
            .map_err(|source| CameraError::ApplyFailed {
                param: "external_trigger",
                source,
            })
    };
    if external {
        apply(TriggerMode::External)
    } else {
        apply(TriggerMode::FreeRun)?;
        apply(TriggerMode::SoftwareArmed)
    }
}

fn register_of(name: ParamName) -> Result<Register> {
    name.register()
        .ok_or_else(|| CameraError::UnknownParameter(name.as_str().to_owned()))
}

fn integer(param: &'static str, value: &ParamValue) -> Result<i64> {
    value.as_int().ok_or_else(|| CameraError::InvalidValue {
        param,
        reason: format!("expected an integer, got {value}"),
    })
}

fn dimension(param: &'static str, value: &ParamValue) -> Result<u32> {
    let v = integer(param, value)?;
    u32::try_from(v).map_err(|_| CameraError::OutOfRange {
        param,
        value: v,
        min: 0,
        max: i64::from(u32::MAX),
    })
}

fn switch(on: bool) -> ParamValue {
    ParamValue::from(if on { "true" } else { "false" })
}

fn ints(values: &[u32]) -> Vec<ParamValue> {
    values.iter().copied().map(ParamValue::from).collect()
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Handle to an open slot, equal to the device index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u32);

/// Fixed arena of device slots indexed by device index.
///
/// Each slot is locked independently, so different cameras can be driven
/// from different threads.
pub struct SessionTable<S: CameraSdk> {
    sdk: Arc<S>,
    config: AdapterConfig,
    modes: Arc<ModeTable>,
    slots: Vec<Mutex<Option<DeviceSession<S>>>>,
    opening: Vec<AtomicBool>,
    active: AtomicUsize,
}

impl<S: CameraSdk> SessionTable<S> {
    /// Create `config.max_instances` empty slots.
    pub fn new(sdk: Arc<S>, config: AdapterConfig) -> Self {
        let modes = Arc::new(config.mode_table());
        let slots = (0..config.max_instances).map(|_| Mutex::new(None)).collect();
        let opening = (0..config.max_instances)
            .map(|_| AtomicBool::new(false))
            .collect();
        Self {
            sdk,
            config,
            modes,
            slots,
            opening,
            active: AtomicUsize::new(0),
        }
    }

    /// The SDK backing this table.
    pub const fn sdk(&self) -> &Arc<S> {
        &self.sdk
    }

    /// Adapter configuration.
    pub const fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Cameras detected by the SDK.
    pub fn device_count(&self) -> u32 {
        self.sdk.device_count()
    }

    /// Number of open sessions.
    pub fn active_instances(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn slot(&self, index: u32) -> Result<&Mutex<Option<DeviceSession<S>>>> {
        let available = self
            .device_count()
            .min(u32::try_from(self.slots.len()).unwrap_or(u32::MAX));
        if index >= available {
            return Err(CameraError::InvalidIndex { index, available });
        }
        self.slots
            .get(index as usize)
            .ok_or(CameraError::InvalidIndex { index, available })
    }

    /// Open a session for `request.index`.
    ///
    /// The slot reports [`SessionState::Opening`] until the call returns.
    pub fn open(&self, request: &OpenRequest) -> Result<SessionId> {
        let mut slot = self.slot(request.index)?.lock();
        if slot.is_some() {
            return Err(CameraError::DeviceBusy(request.index));
        }
        self.set_opening(request.index, true);
        let result = DeviceSession::open(
            Arc::clone(&self.sdk),
            Arc::clone(&self.modes),
            request,
            &self.config,
        )
        .map(|session| {
            *slot = Some(session);
            self.active.fetch_add(1, Ordering::SeqCst);
            SessionId(request.index)
        });
        self.set_opening(request.index, false);
        result
    }

    fn is_opening(&self, index: u32) -> bool {
        self.opening
            .get(index as usize)
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn set_opening(&self, index: u32, opening: bool) {
        if let Some(flag) = self.opening.get(index as usize) {
            flag.store(opening, Ordering::SeqCst);
        }
    }

    /// Close a session. The slot is released even if the SDK reports errors.
    pub fn close(&self, id: SessionId) -> Result<()> {
        let session = self
            .slot(id.0)?
            .lock()
            .take()
            .ok_or(CameraError::NotOpen(id.0))?;
        self.active.fetch_sub(1, Ordering::SeqCst);
        session.close()
    }

    /// Run `f` against an open session, holding its slot.
    pub fn with_session<R, F>(&self, id: SessionId, f: F) -> Result<R>
    where
        F: FnOnce(&mut DeviceSession<S>) -> Result<R>,
    {
        let mut slot = self.slot(id.0)?.lock();
        let session = slot.as_mut().ok_or(CameraError::NotOpen(id.0))?;
        f(session)
    }

    /// Lifecycle state of a slot.
    pub fn state(&self, id: SessionId) -> SessionState {
        let Ok(slot) = self.slot(id.0) else {
            return SessionState::Closed;
        };
        if self.is_opening(id.0) {
            return SessionState::Opening;
        }
        slot.lock()
            .as_ref()
            .map_or(SessionState::Closed, DeviceSession::state)
    }

    /// Capture one frame.
    pub fn grab(&self, id: SessionId, timeout_override: Option<Duration>) -> Result<Frame> {
        if let Some(timeout) = timeout_override {
            let ms = duration_ms(timeout);
            if ms > i64::from(MAX_GRAB_TIMEOUT_MS) {
                return Err(CameraError::OutOfRange {
                    param: "grab_timeout",
                    value: ms,
                    min: 0,
                    max: i64::from(MAX_GRAB_TIMEOUT_MS),
                });
            }
        }
        self.with_session(id, |session| session.grab(timeout_override))
    }

    /// Asynchronous grabs are not offered by this interface.
    pub fn grab_start_async(&self, _id: SessionId, _max_delay: Duration) -> Result<()> {
        Err(CameraError::NotSupported("asynchronous grab"))
    }

    /// Asynchronous grabs are not offered by this interface.
    pub fn grab_async(&self, _id: SessionId, _max_delay: Duration) -> Result<Frame> {
        Err(CameraError::NotSupported("asynchronous grab"))
    }

    /// Write a parameter by host name.
    pub fn set_param(&self, id: SessionId, name: &str, value: &ParamValue) -> Result<()> {
        let query: ParamQuery = name.parse()?;
        if query.aspect != Aspect::Value {
            return Err(CameraError::ReadOnly(query.name.as_str()));
        }
        self.with_session(id, |session| session.set_param(query.name, value))
    }

    /// Read a parameter, `<name>_range` or `<name>_description` by host name.
    pub fn get_param(&self, id: SessionId, name: &str) -> Result<ParamValue> {
        let query: ParamQuery = name.parse()?;
        self.with_session(id, |session| session.get_param(query))
    }

    /// Answer a capability query. Never touches a device.
    pub fn info(&self, query: InfoQuery) -> InfoReply {
        let names = |filter: fn(&ParamName) -> bool| -> Vec<ParamValue> {
            ParamName::ALL
                .iter()
                .filter(|name| filter(name))
                .map(|name| ParamValue::from(name.as_str()))
                .collect()
        };
        let (info, values): (&'static str, Vec<ParamValue>) = match query {
            InfoQuery::General => (
                "Synchronous acquisition interface for NET iCube USB cameras.",
                Vec::new(),
            ),
            InfoQuery::Revision => (
                "Current interface revision.",
                vec![env!("CARGO_PKG_VERSION").into()],
            ),
            InfoQuery::Port => (
                "List of available camera device indices.",
                (0..self.device_count()).map(ParamValue::from).collect(),
            ),
            InfoQuery::ExternalTrigger => (
                "Value list for the external_trigger parameter.",
                vec![switch(false), switch(true)],
            ),
            InfoQuery::TriggerModes => (
                "Trigger sources the interface can arm.",
                vec!["software".into(), "external".into()],
            ),
            InfoQuery::HorizontalResolution => (
                "Supported horizontal_resolution values.",
                self.modes.entries().iter().map(|res| res.width.into()).collect(),
            ),
            InfoQuery::VerticalResolution => (
                "Supported vertical_resolution values.",
                self.modes.entries().iter().map(|res| res.height.into()).collect(),
            ),
            InfoQuery::Parameters => ("Parameters of this interface.", names(|_| true)),
            InfoQuery::ParametersReadOnly => (
                "Read-only parameters of this interface.",
                names(|name| name.is_read_only()),
            ),
            InfoQuery::ParametersWriteOnly => (
                "Write-only parameters of this interface.",
                Vec::new(),
            ),
        };
        InfoReply { info, values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Delivery, MockSdk};
    use std::thread;

    fn table(sdk: MockSdk) -> SessionTable<MockSdk> {
        SessionTable::new(Arc::new(sdk), AdapterConfig::default())
    }

    #[test]
    fn test_open_with_current_mode() {
        let table = table(MockSdk::new(1));
        let id = table.open(&OpenRequest::new(0)).expect("open should succeed");
        let geometry = table
            .with_session(id, |s| Ok(s.geometry()))
            .expect("session exists");
        assert_eq!(geometry.resolution, Resolution::new(320, 240));
        assert_eq!(geometry.roi, Roi::new(320, 240, 0, 0));
        assert_eq!(table.state(id), SessionState::Streaming);
        assert!(table.sdk().is_streaming(0));
        assert_eq!(table.sdk().trigger(0).expect("trigger"), TriggerMode::SoftwareArmed);
    }

    #[test]
    fn test_open_invalid_index() {
        let table = table(MockSdk::new(1));
        let err = table
            .open(&OpenRequest::new(1))
            .expect_err("only one device");
        assert!(matches!(
            err,
            CameraError::InvalidIndex {
                index: 1,
                available: 1
            }
        ));
    }

    #[test]
    fn test_open_twice_is_busy() {
        let table = table(MockSdk::new(1));
        table.open(&OpenRequest::new(0)).expect("first open");
        let err = table.open(&OpenRequest::new(0)).expect_err("slot taken");
        assert!(matches!(err, CameraError::DeviceBusy(0)));
        assert_eq!(table.active_instances(), 1);
    }

    #[test]
    fn test_open_failure_reports_unavailable() {
        let sdk = MockSdk::new(1);
        sdk.fail_on("open");
        let table = table(sdk);
        let err = table.open(&OpenRequest::new(0)).expect_err("sdk refuses");
        assert!(matches!(err, CameraError::DeviceUnavailable { index: 0, .. }));
        assert_eq!(table.active_instances(), 0);
    }

    #[test]
    fn test_failed_start_leaves_device_closed() {
        let sdk = MockSdk::new(1);
        sdk.fail_on("start");
        let table = table(sdk);
        table.open(&OpenRequest::new(0)).expect_err("start fails");
        assert!(!table.sdk().is_open(0));
        assert_eq!(table.state(SessionId(0)), SessionState::Closed);

        table.sdk().clear_failure("start");
        table.open(&OpenRequest::new(0)).expect("retry succeeds");
    }

    #[test]
    fn test_open_with_unsupported_resolution() {
        let table = table(MockSdk::new(1));
        let err = table
            .open(&OpenRequest::new(0).with_resolution(123, 45))
            .expect_err("no such mode");
        assert!(matches!(err, CameraError::UnsupportedResolution { .. }));
        assert!(!table.sdk().is_open(0));
    }

    #[test]
    fn test_open_with_roi() {
        let table = table(MockSdk::new(1));
        let id = table
            .open(
                &OpenRequest::new(0)
                    .with_resolution(640, 480)
                    .with_roi(Roi::new(200, 100, 16, 32)),
            )
            .expect("open should succeed");
        let len = table
            .with_session(id, |s| Ok(s.buffer_len()))
            .expect("session exists");
        assert_eq!(len, 20_000);
        assert_eq!(
            table.get_param(id, "start_row").expect("read"),
            ParamValue::Int(32)
        );
    }

    #[test]
    fn test_external_trigger_open() {
        let table = table(MockSdk::new(1).with_delivery(Delivery::Never));
        let id = table
            .open(&OpenRequest::new(0).with_external_trigger(true))
            .expect("open should succeed");
        assert_eq!(table.sdk().trigger(0).expect("trigger"), TriggerMode::External);
        let err = table
            .grab(id, Some(Duration::from_millis(5)))
            .expect_err("no pulse");
        assert!(matches!(err, CameraError::GrabTimeout(_)));
        assert_eq!(table.sdk().fires(0), 0, "no software trigger in external mode");
    }

    #[test]
    fn test_close_releases_slot_despite_errors() {
        let table = table(MockSdk::new(1));
        let id = table.open(&OpenRequest::new(0)).expect("open");
        table.sdk().fail_on("stop");
        table.sdk().fail_on("close");

        let err = table.close(id).expect_err("stop fails");
        assert!(matches!(err, CameraError::StopFailed(_)));
        assert_eq!(table.active_instances(), 0);
        assert_eq!(table.state(id), SessionState::Closed);

        let err = table.close(id).expect_err("already closed");
        assert!(matches!(err, CameraError::NotOpen(0)));
    }

    #[test]
    fn test_close_failure_reported() {
        let table = table(MockSdk::new(1));
        let id = table.open(&OpenRequest::new(0)).expect("open");
        table.sdk().fail_on("close");
        let err = table.close(id).expect_err("close fails");
        assert!(matches!(err, CameraError::CloseFailed(_)));
        assert_eq!(table.active_instances(), 0);
    }

    #[test]
    fn test_same_value_is_noop() {
        let table = table(MockSdk::new(1));
        let id = table.open(&OpenRequest::new(0)).expect("open");
        table.sdk().fail_on("stop");
        table
            .set_param(id, "horizontal_resolution", &ParamValue::Int(320))
            .expect("unchanged value skips the restart");
        table
            .set_param(id, "image_height", &ParamValue::Int(240))
            .expect("unchanged value skips the restart");
    }

    #[test]
    fn test_failed_validation_restores_stream() {
        let table = table(MockSdk::new(1));
        let id = table.open(&OpenRequest::new(0)).expect("open");
        let err = table
            .set_param(id, "image_width", &ParamValue::Int(4000))
            .expect_err("too wide");
        assert!(matches!(err, CameraError::OutOfRange { .. }));
        assert_eq!(table.state(id), SessionState::Streaming);
        assert!(table.sdk().is_streaming(0));
    }

    #[test]
    fn test_restart_failure_is_incomplete() {
        let table = table(MockSdk::new(1));
        let id = table.open(&OpenRequest::new(0)).expect("open");
        table.sdk().fail_on("start");

        let err = table
            .set_param(id, "horizontal_resolution", &ParamValue::Int(9999))
            .expect_err("unsupported and restart fails");
        assert!(matches!(
            err,
            CameraError::ReconfigureIncomplete {
                phase: ReconfigurePhase::Apply,
                ..
            }
        ));
        assert_eq!(table.state(id), SessionState::Ready);
        let err = table.grab(id, None).expect_err("not streaming");
        assert!(matches!(err, CameraError::NotStreaming));

        table.sdk().clear_failure("start");
        table
            .set_param(id, "horizontal_resolution", &ParamValue::Int(640))
            .expect("next change restarts the stream");
        assert_eq!(table.state(id), SessionState::Streaming);
    }

    #[test]
    fn test_close_after_incomplete_reconfigure_skips_stop() {
        let table = table(MockSdk::new(1));
        let id = table.open(&OpenRequest::new(0)).expect("open");
        table.sdk().fail_on("start");
        table
            .set_param(id, "horizontal_resolution", &ParamValue::Int(640))
            .expect_err("restart fails");
        assert_eq!(table.state(id), SessionState::Ready);

        table.sdk().fail_on("stop");
        table.close(id).expect("stream already stopped");
        assert!(!table.sdk().is_open(0));
    }

    #[test]
    fn test_state_is_opening_during_open() {
        let table = table(MockSdk::new(1).with_open_delay(Duration::from_millis(200)));
        let id = SessionId(0);
        thread::scope(|scope| {
            let opener = scope.spawn(|| table.open(&OpenRequest::new(0)));
            thread::sleep(Duration::from_millis(50));
            assert_eq!(table.state(id), SessionState::Opening);
            let opened = opener.join().expect("open thread").expect("open");
            assert_eq!(opened, id);
        });
        assert_eq!(table.state(id), SessionState::Streaming);
    }

    #[test]
    fn test_stop_failure_keeps_streaming() {
        let table = table(MockSdk::new(1));
        let id = table.open(&OpenRequest::new(0)).expect("open");
        table.sdk().fail_on("stop");
        let err = table
            .set_param(id, "horizontal_resolution", &ParamValue::Int(640))
            .expect_err("stop fails");
        assert!(matches!(err, CameraError::ReconfigureFailed(_)));
        assert_eq!(table.state(id), SessionState::Streaming);
    }

    #[test]
    fn test_pixel_clock_restarts_stream() {
        let table = table(MockSdk::new(1));
        let id = table.open(&OpenRequest::new(0)).expect("open");
        table
            .set_param(id, "pixel_clock", &ParamValue::Int(3))
            .expect("write");
        assert_eq!(
            table.get_param(id, "pixel_clock").expect("read"),
            ParamValue::Int(3)
        );
        assert_eq!(table.state(id), SessionState::Streaming);

        table.sdk().fail_on("stop");
        table
            .set_param(id, "pixel_clock", &ParamValue::Int(3))
            .expect("unchanged pixel clock is a no-op");
    }

    #[test]
    fn test_read_only_parameters() {
        let table = table(MockSdk::new(1));
        let id = table.open(&OpenRequest::new(0)).expect("open");
        for name in ["index", "exposure_msec", "serial_number", "gain_range"] {
            let err = table
                .set_param(id, name, &ParamValue::Int(1))
                .expect_err("read-only");
            assert!(matches!(err, CameraError::ReadOnly(_)));
        }
    }

    #[test]
    fn test_type_mismatch_is_invalid_value() {
        let table = table(MockSdk::new(1));
        let id = table.open(&OpenRequest::new(0)).expect("open");
        let err = table
            .set_param(id, "horizontal_resolution", &ParamValue::Str("640".to_owned()))
            .expect_err("string for an integer parameter");
        assert!(matches!(err, CameraError::InvalidValue { .. }));
    }

    #[test]
    fn test_grab_timeout_parameter_bounds() {
        let table = table(MockSdk::new(1));
        let id = table.open(&OpenRequest::new(0)).expect("open");
        table
            .set_param(id, "grab_timeout", &ParamValue::Int(0))
            .expect("zero allowed");
        table
            .set_param(id, "grab_timeout", &ParamValue::Int(10_000))
            .expect("upper bound allowed");
        let err = table
            .set_param(id, "grab_timeout", &ParamValue::Int(10_001))
            .expect_err("beyond bound");
        assert!(matches!(err, CameraError::OutOfRange { .. }));
        assert_eq!(
            table.get_param(id, "grab_timeout").expect("read"),
            ParamValue::Int(10_000)
        );
    }

    #[test]
    fn test_ranges_and_descriptions() {
        let table = table(MockSdk::new(1).with_modes(vec![0, 1, 2]));
        let id = table.open(&OpenRequest::new(0)).expect("open");
        assert_eq!(
            table.get_param(id, "vertical_resolution_range").expect("range"),
            ParamValue::List(vec![240u32.into(), 480u32.into()])
        );
        assert_eq!(
            table.get_param(id, "exposure_time_range").expect("range"),
            ParamValue::List(vec![1i64.into(), 2000i64.into(), 100i64.into()])
        );
        assert_eq!(
            table.get_param(id, "index_description").expect("description"),
            ParamValue::from("Camera device index.")
        );
    }

    #[test]
    fn test_device_identification() {
        let table = table(MockSdk::new(2));
        let id = table.open(&OpenRequest::new(1)).expect("open");
        assert_eq!(
            table.get_param(id, "serial_number").expect("read"),
            ParamValue::from("MOCK0001")
        );
        table.grab(id, None).expect("grab");
        assert_eq!(
            table.get_param(id, "good_frames").expect("read"),
            ParamValue::Int(1)
        );
    }

    #[test]
    fn test_external_trigger_switch() {
        let table = table(MockSdk::new(1));
        let id = table.open(&OpenRequest::new(0)).expect("open");
        table
            .set_param(id, "external_trigger", &ParamValue::from("true"))
            .expect("switch on");
        assert_eq!(table.sdk().trigger(0).expect("trigger"), TriggerMode::External);
        assert!(table.sdk().fire_external(0));
        table
            .set_param(id, "external_trigger", &ParamValue::Int(0))
            .expect("switch off");
        assert_eq!(
            table.sdk().trigger(0).expect("trigger"),
            TriggerMode::SoftwareArmed
        );
    }

    #[test]
    fn test_async_grab_not_supported() {
        let table = table(MockSdk::new(1));
        let id = table.open(&OpenRequest::new(0)).expect("open");
        assert!(matches!(
            table.grab_async(id, Duration::from_secs(1)),
            Err(CameraError::NotSupported(_))
        ));
        assert!(matches!(
            table.grab_start_async(id, Duration::from_secs(1)),
            Err(CameraError::NotSupported(_))
        ));
    }

    #[test]
    fn test_info_queries_need_no_device() {
        let table = table(MockSdk::new(3));
        let reply = table.info(InfoQuery::Port);
        assert_eq!(reply.values.len(), 3);
        let reply = table.info(InfoQuery::HorizontalResolution);
        assert_eq!(reply.values.first(), Some(&ParamValue::Int(320)));
        let reply = table.info(InfoQuery::ParametersReadOnly);
        assert!(reply.values.contains(&ParamValue::from("index")));
        assert!(!reply.values.contains(&ParamValue::from("gain")));
        assert_eq!(table.active_instances(), 0);
        assert!(!table.sdk().is_open(0));
    }

    #[test]
    fn test_grab_override_beyond_bound() {
        let table = table(MockSdk::new(1));
        let id = table.open(&OpenRequest::new(0)).expect("open");
        let err = table
            .grab(id, Some(Duration::from_secs(11)))
            .expect_err("override too long");
        assert!(matches!(err, CameraError::OutOfRange { .. }));
    }
}
