//! Mode Table and resolution/ROI negotiation.
//!
//! The camera reports which presets it supports as indices into the Mode
//! Table. A requested resolution is matched exactly against those entries in
//! table order; free-form windows are checked against the live ROI bounds.

use crate::error::{CameraError, Result};
use crate::traits::{CameraSdk, Resolution, Roi};

/// Presets of the NET iCube sensor family, in vendor mode-index order.
pub const ICUBE_MODES: [Resolution; 9] = [
    Resolution::new(320, 240),
    Resolution::new(640, 480),
    Resolution::new(752, 480),
    Resolution::new(800, 600),
    Resolution::new(1024, 768),
    Resolution::new(1280, 1024),
    Resolution::new(1600, 1200),
    Resolution::new(2048, 1536),
    Resolution::new(2592, 1944),
];

/// Axis constrained by a single-dimension resolution request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// Match on width.
    Horizontal,
    /// Match on height.
    Vertical,
}

/// Ordered, immutable list of resolution presets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeTable {
    entries: Vec<Resolution>,
}

impl Default for ModeTable {
    fn default() -> Self {
        Self::new(ICUBE_MODES.to_vec())
    }
}

impl ModeTable {
    /// Create a table from presets in mode-index order.
    #[must_use]
    pub const fn new(entries: Vec<Resolution>) -> Self {
        Self { entries }
    }

    /// Preset at a mode index.
    #[must_use]
    pub fn get(&self, mode: u32) -> Option<Resolution> {
        self.entries.get(mode as usize).copied()
    }

    /// All presets in table order.
    #[must_use]
    pub fn entries(&self) -> &[Resolution] {
        &self.entries
    }

    /// Number of presets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no presets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First supported mode whose preset satisfies `matches`.
    ///
    /// Supported indices are visited in the order the camera reports them;
    /// indices beyond the table are skipped.
    pub fn find<F>(&self, supported: &[u32], matches: F) -> Option<(u32, Resolution)>
    where
        F: Fn(Resolution) -> bool,
    {
        supported
            .iter()
            .filter_map(|&mode| self.get(mode).map(|res| (mode, res)))
            .find(|&(_, res)| matches(res))
    }
}

/// Resolves resolution and ROI requests for one device.
pub struct Negotiator<'a, S: ?Sized> {
    sdk: &'a S,
    index: u32,
    table: &'a ModeTable,
}

impl<'a, S: CameraSdk + ?Sized> Negotiator<'a, S> {
    /// Create a negotiator for the device at `index`.
    pub const fn new(sdk: &'a S, index: u32, table: &'a ModeTable) -> Self {
        Self { sdk, index, table }
    }

    fn supported_modes(&self) -> Result<Vec<u32>> {
        self.sdk
            .mode_list(self.index)
            .map_err(|source| CameraError::QueryFailed {
                what: "mode list",
                source,
            })
    }

    /// Find the mode matching `width` x `height` exactly, without applying it.
    pub fn find_mode(&self, width: u32, height: u32) -> Result<(u32, Resolution)> {
        let supported = self.supported_modes()?;
        self.table
            .find(&supported, |res| res.width == width && res.height == height)
            .ok_or(CameraError::UnsupportedResolution { width, height })
    }

    /// Find the first mode whose `axis` dimension equals `value`.
    pub fn find_mode_by_axis(&self, value: u32, axis: Axis) -> Result<(u32, Resolution)> {
        let supported = self.supported_modes()?;
        let found = match axis {
            Axis::Horizontal => self.table.find(&supported, |res| res.width == value),
            Axis::Vertical => self.table.find(&supported, |res| res.height == value),
        };
        found.ok_or(match axis {
            Axis::Horizontal => CameraError::UnsupportedResolution {
                width: value,
                height: 0,
            },
            Axis::Vertical => CameraError::UnsupportedResolution {
                width: 0,
                height: value,
            },
        })
    }

    /// Select the exact `width` x `height` preset on the camera.
    ///
    /// On failure the current mode is left unchanged.
    pub fn resolve_mode(&self, width: u32, height: u32) -> Result<Resolution> {
        let (mode, res) = self.find_mode(width, height)?;
        self.apply_mode(mode)?;
        Ok(res)
    }

    /// Select the first preset matching one axis, applying its full pair.
    pub fn resolve_mode_by_axis(&self, value: u32, axis: Axis) -> Result<Resolution> {
        let (mode, res) = self.find_mode_by_axis(value, axis)?;
        self.apply_mode(mode)?;
        Ok(res)
    }

    fn apply_mode(&self, mode: u32) -> Result<()> {
        tracing::debug!(index = self.index, mode, "Selecting sensor mode");
        self.sdk
            .set_mode(self.index, mode)
            .map_err(CameraError::ReconfigureFailed)
    }

    /// Resolution of the camera's current mode.
    ///
    /// A mode outside the table falls back to the current ROI size.
    pub fn current_mode(&self) -> Result<Resolution> {
        let mode = self
            .sdk
            .mode(self.index)
            .map_err(|source| CameraError::QueryFailed {
                what: "mode",
                source,
            })?;
        if let Some(res) = self.table.get(mode) {
            return Ok(res);
        }
        let roi = self.current_roi()?;
        Ok(Resolution::new(roi.width, roi.height))
    }

    /// Current ROI as reported by the camera.
    pub fn current_roi(&self) -> Result<Roi> {
        self.sdk
            .roi(self.index)
            .map_err(|source| CameraError::QueryFailed {
                what: "resolution",
                source,
            })
    }

    /// Check the window size against the camera's current bounds.
    ///
    /// The offset is not checked here; the SDK judges the combined geometry.
    pub fn validate_roi(&self, roi: Roi) -> Result<()> {
        let range = self
            .sdk
            .roi_range(self.index)
            .map_err(|source| CameraError::QueryFailed {
                what: "resolution range",
                source,
            })?;
        check_bounds("image_width", roi.width, range.x_min, range.x_max)?;
        check_bounds("image_height", roi.height, range.y_min, range.y_max)
    }

    /// Validate and write a region of interest.
    pub fn apply_roi(&self, roi: Roi) -> Result<()> {
        self.validate_roi(roi)?;
        tracing::debug!(index = self.index, ?roi, "Setting region of interest");
        self.sdk
            .set_roi(self.index, roi)
            .map_err(CameraError::ReconfigureFailed)
    }
}

fn check_bounds(param: &'static str, value: u32, min: u32, max: u32) -> Result<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(CameraError::OutOfRange {
            param,
            value: i64::from(value),
            min: i64::from(min),
            max: i64::from(max),
        })
    }
}

/// Whether moving between two windows requires a new frame buffer.
#[must_use]
pub const fn needs_realloc(current: &Roi, next: &Roi) -> bool {
    current.byte_count() != next.byte_count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSdk;

    fn two_mode_table() -> ModeTable {
        ModeTable::new(vec![Resolution::new(320, 240), Resolution::new(640, 480)])
    }

    #[test]
    fn test_resolve_every_supported_mode() {
        let sdk = MockSdk::new(1);
        let table = ModeTable::default();
        let negotiator = Negotiator::new(&sdk, 0, &table);

        for (mode, res) in ICUBE_MODES.iter().enumerate() {
            let resolved = negotiator
                .resolve_mode(res.width, res.height)
                .expect("supported mode should resolve");
            assert_eq!(resolved, *res);
            assert_eq!(sdk.mode(0).expect("mode query"), mode as u32);
        }
    }

    #[test]
    fn test_unsupported_resolution_leaves_mode() {
        let sdk = MockSdk::new(1).with_modes(vec![0, 1]);
        let table = two_mode_table();
        let negotiator = Negotiator::new(&sdk, 0, &table);
        negotiator.resolve_mode(640, 480).expect("640x480 should resolve");

        let err = negotiator.resolve_mode(800, 600).expect_err("800x600 is not in the table");
        assert!(matches!(
            err,
            CameraError::UnsupportedResolution {
                width: 800,
                height: 600
            }
        ));
        assert_eq!(sdk.mode(0).expect("mode query"), 1);
    }

    #[test]
    fn test_table_entry_not_reported_by_camera() {
        let sdk = MockSdk::new(1).with_modes(vec![0]);
        let table = two_mode_table();
        let negotiator = Negotiator::new(&sdk, 0, &table);

        let err = negotiator.resolve_mode(640, 480).expect_err("mode 1 unsupported");
        assert!(matches!(err, CameraError::UnsupportedResolution { .. }));
    }

    #[test]
    fn test_axis_match_applies_full_pair() {
        let sdk = MockSdk::new(1);
        let table = ModeTable::default();
        let negotiator = Negotiator::new(&sdk, 0, &table);

        // 480 rows: 640x480 comes before 752x480 in table order
        let res = negotiator
            .resolve_mode_by_axis(480, Axis::Vertical)
            .expect("height 480 exists");
        assert_eq!(res, Resolution::new(640, 480));

        let res = negotiator
            .resolve_mode_by_axis(752, Axis::Horizontal)
            .expect("width 752 exists");
        assert_eq!(res, Resolution::new(752, 480));
        assert_eq!(sdk.roi(0).expect("roi query"), Roi::new(752, 480, 0, 0));
    }

    #[test]
    fn test_find_skips_indices_beyond_table() {
        let table = two_mode_table();
        let found = table.find(&[7, 1], |res| res.width == 640);
        assert_eq!(found, Some((1, Resolution::new(640, 480))));
    }

    #[test]
    fn test_validate_roi_bounds() {
        let sdk = MockSdk::new(1);
        let table = ModeTable::default();
        let negotiator = Negotiator::new(&sdk, 0, &table);
        negotiator.resolve_mode(640, 480).expect("640x480 should resolve");

        negotiator
            .validate_roi(Roi::new(320, 240, 10, 10))
            .expect("window within bounds");

        let err = negotiator
            .validate_roi(Roi::new(641, 240, 0, 0))
            .expect_err("width beyond sensor mode");
        assert!(matches!(
            err,
            CameraError::OutOfRange {
                param: "image_width",
                ..
            }
        ));

        let err = negotiator
            .validate_roi(Roi::new(320, 0, 0, 0))
            .expect_err("zero height");
        assert!(matches!(
            err,
            CameraError::OutOfRange {
                param: "image_height",
                ..
            }
        ));
    }

    #[test]
    fn test_sdk_rejects_offset() {
        let sdk = MockSdk::new(1);
        let table = ModeTable::default();
        let negotiator = Negotiator::new(&sdk, 0, &table);
        negotiator.resolve_mode(640, 480).expect("640x480 should resolve");

        let err = negotiator
            .apply_roi(Roi::new(320, 240, 400, 0))
            .expect_err("window runs past the sensor edge");
        assert!(matches!(err, CameraError::ReconfigureFailed(_)));
    }

    #[test]
    fn test_needs_realloc() {
        let a = Roi::new(640, 480, 0, 0);
        assert!(!needs_realloc(&a, &Roi::new(640, 480, 8, 8)));
        assert!(!needs_realloc(&a, &Roi::new(480, 640, 0, 0)));
        assert!(needs_realloc(&a, &Roi::new(320, 240, 0, 0)));
    }
}
