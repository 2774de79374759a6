//! Frame delivery bridge between the SDK callback and synchronous grabs.
//!
//! One mutex guards the frame buffer together with the trigger bookkeeping;
//! one condition variable wakes the grabbing thread. Each grab opens a new
//! generation before it issues the trigger, and only a completion arriving
//! while that generation is pending can satisfy it. Completions with no
//! pending wait are dropped.
//!
//! A grab that times out leaves its capture in flight. Each such orphan
//! swallows the next completion, and no new trigger is issued while one is
//! outstanding, so a late frame is never mistaken for the answer to a newer
//! trigger. Orphans are forgotten when the stream is reset or once the
//! late-frame window has passed without their completion.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{CameraError, Result};
use crate::traits::FrameSink;

struct FrameSlot {
    buffer: Vec<u8>,
    generation: u64,
    pending: Option<u64>,
    completed: Option<u64>,
    orphans: u32,
    orphans_expire: Option<Instant>,
    discarded: u64,
}

impl FrameSlot {
    const fn idle(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            generation: 0,
            pending: None,
            completed: None,
            orphans: 0,
            orphans_expire: None,
            discarded: 0,
        }
    }

    fn forget_orphans(&mut self) {
        self.orphans = 0;
        self.orphans_expire = None;
    }
}

/// Per-device frame buffer shared with the SDK completion callback.
pub struct FrameBridge {
    slot: Mutex<FrameSlot>,
    ready: Condvar,
    grab: Mutex<()>,
    late_window: Duration,
}

impl FrameBridge {
    /// Allocate a zeroed buffer of `len` bytes.
    ///
    /// `late_window` is how long after a timeout the abandoned capture may
    /// still complete.
    pub fn new(len: usize, late_window: Duration) -> Result<Self> {
        Ok(Self {
            slot: Mutex::new(FrameSlot::idle(allocate(len)?)),
            ready: Condvar::new(),
            grab: Mutex::new(()),
            late_window,
        })
    }

    /// Current buffer length in bytes.
    pub fn len(&self) -> usize {
        self.slot.lock().buffer.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Generation of the most recent trigger.
    pub fn generation(&self) -> u64 {
        self.slot.lock().generation
    }

    /// Completions dropped because no grab was waiting for them.
    pub fn discarded(&self) -> u64 {
        self.slot.lock().discarded
    }

    /// Timed-out captures whose completion has not arrived yet.
    pub fn orphans(&self) -> u32 {
        self.slot.lock().orphans
    }

    /// Forget in-flight captures. Call after the stream was stopped.
    pub fn reset(&self) {
        let _serial = self.grab.lock();
        let mut slot = self.slot.lock();
        slot.pending = None;
        slot.completed = None;
        slot.forget_orphans();
    }

    /// Replace the buffer with a zeroed one of `len` bytes.
    ///
    /// Only call with the stream stopped. The old buffer stays in place if the
    /// allocation fails.
    pub fn resize(&self, len: usize) -> Result<()> {
        let _serial = self.grab.lock();
        let fresh = allocate(len)?;
        let mut slot = self.slot.lock();
        slot.buffer = fresh;
        slot.pending = None;
        slot.completed = None;
        slot.forget_orphans();
        Ok(())
    }

    /// Issue a capture with `trigger` and copy the resulting frame into `dest`.
    ///
    /// Grabs on one bridge are serialised. Outstanding orphans are drained
    /// within the same `timeout` before the trigger is issued. Returns the
    /// generation the frame answers, or [`CameraError::GrabTimeout`] with
    /// `dest` untouched.
    pub fn wait_for_frame<F>(&self, dest: &mut [u8], timeout: Duration, trigger: F) -> Result<u64>
    where
        F: FnOnce() -> Result<()>,
    {
        let _serial = self.grab.lock();
        let mut slot = self.slot.lock();
        if dest.len() != slot.buffer.len() {
            return Err(CameraError::BufferMismatch {
                expected: slot.buffer.len(),
                actual: dest.len(),
            });
        }

        let deadline = Instant::now() + timeout;
        if !self.drain_orphans(&mut slot, deadline) {
            return Err(CameraError::GrabTimeout(timeout));
        }

        slot.generation += 1;
        let generation = slot.generation;
        slot.pending = Some(generation);
        slot.completed = None;

        // The SDK may complete the capture inside the trigger call, so the
        // slot is unlocked while triggering. The pending generation is already
        // registered, so that completion is recorded rather than lost.
        if let Err(err) = MutexGuard::unlocked(&mut slot, trigger) {
            if slot.pending == Some(generation) {
                slot.pending = None;
            }
            return Err(err);
        }

        while slot.completed != Some(generation) {
            if self.ready.wait_until(&mut slot, deadline).timed_out()
                && slot.completed != Some(generation)
            {
                slot.pending = None;
                slot.orphans += 1;
                slot.orphans_expire = Some(Instant::now() + self.late_window);
                return Err(CameraError::GrabTimeout(timeout));
            }
        }

        dest.copy_from_slice(&slot.buffer);
        Ok(generation)
    }

    /// Wait until every orphan has completed or expired.
    ///
    /// Returns `false` if `deadline` passes first.
    fn drain_orphans(&self, slot: &mut MutexGuard<'_, FrameSlot>, deadline: Instant) -> bool {
        while slot.orphans > 0 {
            let now = Instant::now();
            let expires = slot.orphans_expire.unwrap_or(now);
            if now >= expires {
                tracing::debug!(lost = slot.orphans, "Timed-out captures never completed");
                slot.forget_orphans();
                break;
            }
            if now >= deadline {
                return false;
            }
            self.ready.wait_until(slot, deadline.min(expires));
        }
        true
    }
}

impl FrameSink for FrameBridge {
    fn frame_complete(&self, data: &[u8]) {
        let mut slot = self.slot.lock();
        if slot.orphans > 0 {
            slot.discarded += 1;
            slot.orphans -= 1;
            if slot.orphans == 0 {
                slot.orphans_expire = None;
            }
            self.ready.notify_one();
            return;
        }
        match slot.pending {
            Some(generation) if data.len() == slot.buffer.len() => {
                slot.buffer.copy_from_slice(data);
                slot.pending = None;
                slot.completed = Some(generation);
                self.ready.notify_one();
            }
            _ => slot.discarded += 1,
        }
    }
}

fn allocate(len: usize) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| CameraError::AllocationFailed { bytes: len })?;
    buffer.resize(len, 0);
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const LATE_WINDOW: Duration = Duration::from_millis(200);

    fn bridge(len: usize) -> Arc<FrameBridge> {
        Arc::new(FrameBridge::new(len, LATE_WINDOW).expect("allocation should succeed"))
    }

    #[test]
    fn test_synchronous_completion_with_zero_timeout() {
        let bridge = bridge(4);
        let sink = Arc::clone(&bridge);
        let mut dest = [0u8; 4];

        let generation = bridge
            .wait_for_frame(&mut dest, Duration::ZERO, || {
                sink.frame_complete(&[1, 2, 3, 4]);
                Ok(())
            })
            .expect("frame delivered inside the trigger");
        assert_eq!(generation, 1);
        assert_eq!(dest, [1, 2, 3, 4]);
    }

    #[test]
    fn test_zero_timeout_without_frame() {
        let bridge = bridge(4);
        let mut dest = [9u8; 4];
        let err = bridge
            .wait_for_frame(&mut dest, Duration::ZERO, || Ok(()))
            .expect_err("nothing delivered");
        assert!(matches!(err, CameraError::GrabTimeout(_)));
        assert_eq!(dest, [9u8; 4], "destination untouched on timeout");
    }

    #[test]
    fn test_completion_from_other_thread() {
        let bridge = bridge(3);
        let sink = Arc::clone(&bridge);
        let mut dest = [0u8; 3];

        let generation = bridge
            .wait_for_frame(&mut dest, Duration::from_secs(2), move || {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(20));
                    sink.frame_complete(&[5, 6, 7]);
                });
                Ok(())
            })
            .expect("frame should arrive");
        assert_eq!(generation, 1);
        assert_eq!(dest, [5, 6, 7]);
    }

    #[test]
    fn test_unrequested_completion_is_discarded() {
        let bridge = bridge(2);
        bridge.frame_complete(&[1, 1]);
        assert_eq!(bridge.discarded(), 1);

        let mut dest = [0u8; 2];
        let err = bridge
            .wait_for_frame(&mut dest, Duration::from_millis(10), || Ok(()))
            .expect_err("stale frame must not satisfy a new grab");
        assert!(matches!(err, CameraError::GrabTimeout(_)));
    }

    #[test]
    fn test_wrong_size_completion_is_discarded() {
        let bridge = bridge(4);
        let sink = Arc::clone(&bridge);
        let mut dest = [0u8; 4];
        let err = bridge
            .wait_for_frame(&mut dest, Duration::from_millis(10), || {
                sink.frame_complete(&[1, 2]);
                Ok(())
            })
            .expect_err("short frame must be dropped");
        assert!(matches!(err, CameraError::GrabTimeout(_)));
        assert_eq!(bridge.discarded(), 1);
    }

    #[test]
    fn test_late_completion_is_drained() {
        let bridge = bridge(1);
        let late = Arc::clone(&bridge);
        let mut dest = [0u8; 1];

        let err = bridge
            .wait_for_frame(&mut dest, Duration::from_millis(10), move || {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(60));
                    late.frame_complete(&[1]);
                });
                Ok(())
            })
            .expect_err("first grab times out");
        assert!(matches!(err, CameraError::GrabTimeout(_)));

        let sink = Arc::clone(&bridge);
        let generation = bridge
            .wait_for_frame(&mut dest, Duration::from_secs(1), || {
                sink.frame_complete(&[2]);
                Ok(())
            })
            .expect("second grab gets its own frame");
        assert_eq!(generation, 2);
        assert_eq!(dest, [2]);
        assert_eq!(bridge.discarded(), 1);
    }

    #[test]
    fn test_lost_capture_does_not_poison_next_grab() {
        let bridge = bridge(1);
        let mut dest = [0u8; 1];
        bridge
            .wait_for_frame(&mut dest, Duration::from_millis(5), || Ok(()))
            .expect_err("first grab times out");

        let sink = Arc::clone(&bridge);
        let started = Instant::now();
        let generation = bridge
            .wait_for_frame(&mut dest, Duration::from_secs(1), || {
                sink.frame_complete(&[3]);
                Ok(())
            })
            .expect("orphan expires, new frame accepted");
        assert_eq!(generation, 2);
        assert_eq!(dest, [3]);
        assert!(started.elapsed() >= LATE_WINDOW.saturating_sub(Duration::from_millis(10)));
        assert_eq!(bridge.orphans(), 0);
    }

    #[test]
    fn test_completion_after_short_wait_is_still_discarded() {
        let bridge = bridge(1);
        let late = Arc::clone(&bridge);
        let mut dest = [0u8; 1];
        bridge
            .wait_for_frame(&mut dest, Duration::from_millis(5), move || {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(150));
                    late.frame_complete(&[1]);
                });
                Ok(())
            })
            .expect_err("first grab times out");

        let err = bridge
            .wait_for_frame(&mut dest, Duration::from_millis(20), || Ok(()))
            .expect_err("orphan still outstanding");
        assert!(matches!(err, CameraError::GrabTimeout(_)));
        assert_eq!(bridge.generation(), 1, "no trigger while an orphan is in flight");
        assert_eq!(bridge.orphans(), 1);

        let sink = Arc::clone(&bridge);
        let generation = bridge
            .wait_for_frame(&mut dest, Duration::from_secs(1), || {
                sink.frame_complete(&[2]);
                Ok(())
            })
            .expect("late frame swallowed, own frame returned");
        assert_eq!(generation, 2);
        assert_eq!(dest, [2]);
        assert_eq!(bridge.discarded(), 1);
    }

    #[test]
    fn test_reset_forgets_orphans() {
        let bridge = bridge(1);
        let mut dest = [0u8; 1];
        for _ in 0..2 {
            bridge
                .wait_for_frame(&mut dest, Duration::ZERO, || Ok(()))
                .expect_err("nothing delivered");
        }
        assert_eq!(bridge.orphans(), 1, "second grab never triggered");

        bridge.reset();
        assert_eq!(bridge.orphans(), 0);
        let sink = Arc::clone(&bridge);
        bridge
            .wait_for_frame(&mut dest, Duration::ZERO, || {
                sink.frame_complete(&[4]);
                Ok(())
            })
            .expect("fresh frame accepted right after reset");
        assert_eq!(dest, [4]);
    }

    #[test]
    fn test_trigger_failure_clears_pending() {
        let bridge = bridge(1);
        let mut dest = [0u8; 1];
        let err = bridge
            .wait_for_frame(&mut dest, Duration::from_secs(1), || {
                Err(CameraError::NotSupported("trigger"))
            })
            .expect_err("trigger error propagates");
        assert!(matches!(err, CameraError::NotSupported(_)));

        bridge.frame_complete(&[1]);
        assert_eq!(bridge.discarded(), 1);
    }

    #[test]
    fn test_resize_and_mismatched_destination() {
        let bridge = bridge(4);
        bridge.resize(8).expect("resize should succeed");
        assert_eq!(bridge.len(), 8);

        let mut dest = [0u8; 4];
        let err = bridge
            .wait_for_frame(&mut dest, Duration::ZERO, || Ok(()))
            .expect_err("destination too small");
        assert!(matches!(
            err,
            CameraError::BufferMismatch {
                expected: 8,
                actual: 4
            }
        ));
        assert_eq!(bridge.generation(), 0, "no trigger issued");
    }

    #[test]
    fn test_impossible_allocation_keeps_old_buffer() {
        let bridge = bridge(4);
        let err = bridge.resize(usize::MAX).expect_err("cannot allocate");
        assert!(matches!(err, CameraError::AllocationFailed { .. }));
        assert_eq!(bridge.len(), 4);
    }

    #[test]
    fn test_concurrent_grabs_are_serialised() {
        let bridge = bridge(1);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let bridge = Arc::clone(&bridge);
                thread::spawn(move || {
                    let sink = Arc::clone(&bridge);
                    let mut dest = [0u8; 1];
                    bridge
                        .wait_for_frame(&mut dest, Duration::from_secs(2), move || {
                            thread::spawn(move || sink.frame_complete(&[1]));
                            Ok(())
                        })
                        .expect("each grab gets a frame")
                })
            })
            .collect();

        let mut generations: Vec<u64> = handles
            .into_iter()
            .map(|h| h.join().expect("grab thread"))
            .collect();
        generations.sort_unstable();
        assert_eq!(generations, vec![1, 2, 3, 4]);
    }
}
