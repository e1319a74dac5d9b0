// Frame slots and the ring that rotates them
//
// Each slot owns a recorder and a FenceGate. A slot is handed out for
// recording only after the device has retired the last frame recorded
// into it, which caps the number of frames in flight at the ring size.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::backend::{Backend, RecorderKind};
use crate::fence::FenceGate;
use crate::pipeline::PipelineState;

pub struct FrameSlot<B: Backend> {
    index: usize,
    recorder: B::Recorder,
    gate: FenceGate<B>,
    pending_completion: u64,
    /// Pipeline generation the in-flight frame was recorded against
    pinned: Option<Arc<PipelineState<B>>>,
}

impl<B: Backend> FrameSlot<B> {
    fn new(backend: &Arc<B>, index: usize, fence_timeout: Option<Duration>) -> Result<Self> {
        let recorder = backend
            .create_recorder(RecorderKind::Frame(index))
            .with_context(|| format!("Failed to create recorder for frame slot {}", index))?;
        let gate = FenceGate::new(backend.clone(), fence_timeout)?;

        Ok(Self {
            index,
            recorder,
            gate,
            pending_completion: 0,
            pinned: None,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    #[cfg(test)]
    pub fn pending_completion(&self) -> u64 {
        self.pending_completion
    }

    pub fn recorder_mut(&mut self) -> &mut B::Recorder {
        &mut self.recorder
    }

    /// Block until the slot's last frame has retired, then drop its pin
    pub fn wait_reusable(&mut self) -> Result<()> {
        self.gate
            .wait(self.pending_completion)
            .with_context(|| format!("Frame slot {} never retired", self.index))?;
        self.pinned = None;
        Ok(())
    }

    pub fn pin(&mut self, state: Arc<PipelineState<B>>) {
        self.pinned = Some(state);
    }

    #[cfg(test)]
    pub fn pinned_generation(&self) -> Option<u64> {
        self.pinned.as_ref().map(|state| state.generation())
    }

    /// Signal the slot's next completion value after its submission
    pub fn mark_submitted(&mut self) -> Result<u64> {
        self.pending_completion = self.gate.signal_next()?;
        Ok(self.pending_completion)
    }

    #[cfg(test)]
    pub fn is_retired(&self) -> Result<bool> {
        self.gate.is_reached(self.pending_completion)
    }
}

/// N frame slots with a cyclic cursor
pub struct FrameRing<B: Backend> {
    slots: Vec<FrameSlot<B>>,
    cursor: usize,
}

impl<B: Backend> FrameRing<B> {
    pub fn new(backend: &Arc<B>, count: usize, fence_timeout: Option<Duration>) -> Result<Self> {
        anyhow::ensure!(count > 0, "frame ring needs at least one slot");
        // Slot i renders into backbuffer i, so slots cannot outnumber images
        anyhow::ensure!(
            count <= backend.backbuffer_count(),
            "{} frames in flight but the swapchain only has {} images",
            count,
            backend.backbuffer_count()
        );

        let slots = (0..count)
            .map(|index| FrameSlot::new(backend, index, fence_timeout))
            .collect::<Result<Vec<_>>>()?;

        log::info!("Created frame ring with {} slots", count);
        Ok(Self { slots, cursor: 0 })
    }

    /// Wait until the slot under the cursor can be recorded into
    pub fn begin(&mut self) -> Result<&mut FrameSlot<B>> {
        let slot = &mut self.slots[self.cursor];
        slot.wait_reusable()?;
        Ok(slot)
    }

    pub fn current_mut(&mut self) -> &mut FrameSlot<B> {
        &mut self.slots[self.cursor]
    }

    pub fn advance(&mut self) {
        self.cursor = (self.cursor + 1) % self.slots.len();
    }

    #[cfg(test)]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[cfg(test)]
    pub fn slots(&self) -> &[FrameSlot<B>] {
        &self.slots
    }

    /// Number of slots whose last frame has not retired yet
    #[cfg(test)]
    pub fn in_flight(&self) -> Result<usize> {
        let mut count = 0;
        for slot in &self.slots {
            if !slot.is_retired()? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Wait on every slot; afterwards nothing recorded through the ring is
    /// still on the device and all pipeline pins are released
    pub fn drain(&mut self) -> Result<()> {
        for slot in &mut self.slots {
            slot.wait_reusable()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Recorder;
    use crate::testing;

    fn submit_empty(device: &testing::Device, slot: &mut FrameSlot<testing::Device>) -> u64 {
        slot.recorder_mut().reset().unwrap();
        slot.recorder_mut().close().unwrap();
        device.submit(slot.recorder_mut()).unwrap();
        slot.mark_submitted().unwrap()
    }

    #[test]
    fn ring_larger_than_swapchain_is_rejected() {
        let device = testing::device(2);
        assert!(FrameRing::new(&device, 3, None).is_err());
        assert!(FrameRing::new(&device, 0, None).is_err());
    }

    #[test]
    fn cursor_wraps_around() {
        let device = testing::device(3);
        let mut ring = FrameRing::new(&device, 3, None).unwrap();

        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(ring.cursor());
            ring.advance();
        }
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn begin_blocks_until_previous_use_retires() {
        let device = testing::device(2);
        let mut ring = FrameRing::new(&device, 2, None).unwrap();

        device.hold_queue();
        for _ in 0..2 {
            let slot = ring.begin().unwrap();
            submit_empty(&device, slot);
            ring.advance();
        }
        assert_eq!(ring.in_flight().unwrap(), 2);

        let releaser = {
            let device = device.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                device.release_queue();
            })
        };

        // Slot 0 comes around again: reusing it must wait for the device
        let slot = ring.begin().unwrap();
        assert_eq!(slot.index(), 0);
        assert!(slot.is_retired().unwrap());
        assert!(device.stats().blocking_waits >= 1);
        // Safe to reset now
        submit_empty(&device, slot);
        releaser.join().unwrap();

        ring.drain().unwrap();
        assert_eq!(ring.in_flight().unwrap(), 0);
        assert!(device.fault().is_none());
    }
}
