//! Frame validation utilities for test pattern verification.
//!
//! These helpers check that captured 8-bit monochrome frames have the
//! expected geometry and content. Useful for integration testing against the
//! simulated SDK or a camera pointed at a known target.

use crate::error::{CameraError, Result};
use crate::traits::{Frame, Roi};

/// Minimum left-to-right intensity rise for a frame to count as a gradient.
const MIN_GRADIENT_RISE: i32 = 50;

/// Validates that a frame matches the negotiated region of interest.
///
/// # Arguments
///
/// * `frame` - The frame to validate
/// * `roi` - The region of interest the frame was captured with
///
/// # Errors
///
/// Returns `InvalidFrame` if:
/// - The frame dimensions differ from the ROI
/// - The payload length is not `width * height` bytes
pub fn validate_frame_size(frame: &Frame, roi: &Roi) -> Result<()> {
    let meta = frame.metadata;
    if meta.width != roi.width || meta.height != roi.height {
        return Err(CameraError::InvalidFrame(format!(
            "frame is {}x{}, expected {}x{}",
            meta.width, meta.height, roi.width, roi.height
        )));
    }
    if frame.data.len() != roi.byte_count() {
        return Err(CameraError::InvalidFrame(format!(
            "payload holds {} bytes, expected {}",
            frame.data.len(),
            roi.byte_count()
        )));
    }
    Ok(())
}

/// Validates that a frame contains a horizontal gradient pattern.
///
/// Samples the center row and verifies that intensity does not fall from
/// left to right and that the overall rise is significant (not a solid
/// frame).
///
/// # Arguments
///
/// * `frame` - The frame to validate
///
/// # Errors
///
/// Returns `InvalidFrame` if:
/// - The center row cannot be read
/// - The intensity decreases along the row
/// - The total intensity change is too small
pub fn validate_gradient(frame: &Frame) -> Result<()> {
    let width = frame.metadata.width;
    let center_y = frame.metadata.height / 2;

    // Sample every 10 pixels
    let mut first: Option<u8> = None;
    let mut prev: Option<u8> = None;
    for x in (0..width).step_by(10) {
        let value = frame.pixel_at(x, center_y).ok_or_else(|| {
            CameraError::InvalidFrame(format!("no pixel at ({x}, {center_y})"))
        })?;
        if let Some(p) = prev {
            if value < p {
                return Err(CameraError::InvalidFrame(format!(
                    "gradient falls at x={x}: {value} < {p}"
                )));
            }
        }
        first.get_or_insert(value);
        prev = Some(value);
    }

    let rise = match (first, prev) {
        (Some(first), Some(last)) => i32::from(last) - i32::from(first),
        _ => 0,
    };
    if rise < MIN_GRADIENT_RISE {
        return Err(CameraError::InvalidFrame(format!(
            "insufficient intensity change for gradient: {rise} \
             (expected at least {MIN_GRADIENT_RISE})"
        )));
    }
    Ok(())
}

/// Validates that every pixel of a frame is within `tolerance` of `expected`.
///
/// `skip` leading bytes are ignored (e.g. an embedded sequence stamp).
///
/// # Errors
///
/// Returns `InvalidFrame` at the first pixel outside the tolerance.
pub fn validate_solid(frame: &Frame, expected: u8, tolerance: u8, skip: usize) -> Result<()> {
    let mismatch = frame
        .data
        .iter()
        .enumerate()
        .skip(skip)
        .find(|&(_, &px)| !intensity_matches(px, expected, tolerance));
    match mismatch {
        Some((offset, px)) => Err(CameraError::InvalidFrame(format!(
            "pixel at offset {offset} is {px}, expected {expected} +/- {tolerance}"
        ))),
        None => Ok(()),
    }
}

/// Validates that frames were captured in order.
///
/// Generations must strictly increase. Gaps are allowed, since a timed-out
/// grab consumes a generation without producing a frame.
///
/// # Errors
///
/// Returns `InvalidFrame` if:
/// - The frames slice is empty
/// - Any generation is not greater than the previous one
pub fn validate_frame_sequence(frames: &[Frame]) -> Result<()> {
    if frames.is_empty() {
        return Err(CameraError::InvalidFrame(
            "cannot validate empty frame sequence".to_owned(),
        ));
    }
    for (i, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            let (prev, curr) = (prev.metadata.generation, curr.metadata.generation);
            if curr <= prev {
                return Err(CameraError::InvalidFrame(format!(
                    "generation does not advance at index {}: {prev} then {curr}",
                    i + 1
                )));
            }
        }
    }
    Ok(())
}

/// Whether two intensities differ by at most `tolerance`.
fn intensity_matches(actual: u8, expected: u8, tolerance: u8) -> bool {
    actual.abs_diff(expected) <= tolerance
}
