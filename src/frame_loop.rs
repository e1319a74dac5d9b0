// FrameLoop - the render loop
//
// FRAME FLOW (one iteration, single thread):
// 1. Wait for the slot under the cursor to retire
// 2. Pump window events into the EngineContext
// 3. Adopt a newly published pipeline generation, if any
// 4. Acquire a backbuffer and record: render target, clear, draw the quad,
//    back to present
// 5. Submit
// 6. Present
// 7. Signal the slot's next fence value, pin the pipeline, advance the ring
//
// While the window is minimized, or when the swapchain reports it is out of
// date, the iteration stops before recording: nothing is submitted or
// signaled and the cursor stays put.
//
// A close request stops the loop at the top of the next iteration; the
// ring is drained before the loop returns.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::backend::{Backbuffer, Backend, ImageState, Recorder};
use crate::context::EngineContext;
use crate::frame::FrameRing;
use crate::pipeline::{PipelineCell, PipelineState};
use crate::upload::GeometryBuffers;
use crate::window::EventSource;

/// Pause between skipped iterations
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// What one rendered iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub slot: usize,
    pub backbuffer: Backbuffer,
    /// Fence value signaled for the slot
    pub completion: u64,
    /// Pipeline generation the frame was recorded against
    pub generation: u64,
}

pub struct FrameLoop<B: Backend> {
    backend: Arc<B>,
    ring: FrameRing<B>,
    geometry: GeometryBuffers<B>,
    pipelines: Arc<PipelineCell<B>>,
    current: Arc<PipelineState<B>>,
    clear_color: [f32; 4],
}

impl<B: Backend> FrameLoop<B> {
    pub fn new(
        backend: Arc<B>,
        ring: FrameRing<B>,
        geometry: GeometryBuffers<B>,
        pipelines: Arc<PipelineCell<B>>,
        clear_color: [f32; 4],
    ) -> Self {
        let current = pipelines.current();
        Self {
            backend,
            ring,
            geometry,
            pipelines,
            current,
            clear_color,
        }
    }

    /// Run until a close is requested, then drain in-flight frames.
    ///
    /// Returns the number of frames rendered.
    pub fn run<E: EventSource>(&mut self, ctx: &mut EngineContext, events: &mut E) -> Result<u64> {
        while !ctx.should_close() {
            match self.run_frame(ctx, events)? {
                Some(report) => {
                    log::trace!(
                        "Slot {} rendered into backbuffer {} (fence {}, generation {})",
                        report.slot,
                        report.backbuffer.0,
                        report.completion,
                        report.generation
                    );
                    if let Some(title) = ctx.end_frame(Instant::now()) {
                        events.set_title(&title);
                    }
                }
                None => std::thread::sleep(IDLE_WAIT),
            }
        }

        log::info!("Rendered {} frames, waiting for the device", ctx.frames());
        self.ring.drain().context("Failed to drain frames in flight")?;
        Ok(ctx.frames())
    }

    /// One iteration; `None` if nothing could be rendered this time
    pub fn run_frame<E: EventSource>(
        &mut self,
        ctx: &mut EngineContext,
        events: &mut E,
    ) -> Result<Option<FrameReport>> {
        // 1. Wait
        self.ring.begin()?;

        // 2. Poll events
        for event in events.poll_events() {
            ctx.handle_event(&event);
        }

        // 3. Pipeline refresh
        self.refresh_pipeline()?;

        if ctx.is_minimized() {
            return Ok(None);
        }

        // 4. Acquire & record
        let extent = self.backend.extent();
        let geometry = &self.geometry;
        let current = &self.current;
        let slot = self.ring.current_mut();
        let slot_index = slot.index();
        let recorder = slot.recorder_mut();

        let Some(target) = self
            .backend
            .acquire_backbuffer(recorder)
            .context("Failed to acquire backbuffer")?
        else {
            return Ok(None);
        };

        recorder.reset()?;
        recorder.transition_backbuffer(target, ImageState::Present, ImageState::RenderTarget);
        recorder.set_render_target(target);
        recorder.set_viewport(extent);
        recorder.clear(target, self.clear_color);
        recorder.bind_pipeline(current.native());
        recorder.bind_geometry(&geometry.vertices, &geometry.indices);
        recorder.draw_indexed(geometry.index_count);
        recorder.transition_backbuffer(target, ImageState::RenderTarget, ImageState::Present);
        recorder.close()?;

        // 5. Submit
        self.backend
            .submit(recorder)
            .with_context(|| format!("Failed to submit frame slot {}", slot_index))?;

        // 6. Present
        self.backend.present(recorder).context("Failed to present")?;

        // 7. Signal & advance
        let completion = slot.mark_submitted()?;
        slot.pin(current.clone());
        self.ring.advance();

        Ok(Some(FrameReport {
            slot: slot_index,
            backbuffer: target,
            completion,
            generation: self.current.generation(),
        }))
    }

    fn refresh_pipeline(&mut self) -> Result<()> {
        if let Some(fault) = self.pipelines.take_fault() {
            return Err(fault.context("Pipeline reload failed"));
        }

        if let Some(next) = self.pipelines.newer_than(self.current.generation()) {
            log::info!(
                "Switching from pipeline generation {} to {}",
                self.current.generation(),
                next.generation()
            );
            log::debug!(
                "Generation {}: stages {:?}, {:?} topology",
                next.generation(),
                next.programs().keys().collect::<Vec<_>>(),
                next.fixed_function().topology
            );
            self.current = next;
        }
        Ok(())
    }

    pub fn generation(&self) -> u64 {
        self.current.generation()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::compiler::StageKind;
    use crate::pipeline::{FixedFunction, PipelineBuilder, PipelineReloader, ReloadOutcome, RetryPolicy};
    use crate::backend::Extent;
    use crate::testing::{self, Device, SourceCompiler, GOOD_SHADER};
    use crate::upload::Vertex;
    use crate::window::{ScriptedEvents, WindowEvent};

    const CLEAR: [f32; 4] = [0.042, 0.042, 0.042, 1.0];

    fn builder(device: &Arc<Device>, source: &Path) -> PipelineBuilder<Device, SourceCompiler> {
        PipelineBuilder::new(
            device.clone(),
            SourceCompiler::default(),
            source,
            FixedFunction::fullscreen(Vertex::layout()),
        )
        .stage(StageKind::Vertex, "VS_main")
        .stage(StageKind::Fragment, "PS_main")
    }

    fn frame_loop(device: &Arc<Device>, pipelines: Arc<PipelineCell<Device>>, slots: usize) -> FrameLoop<Device> {
        let ring = FrameRing::new(device, slots, None).unwrap();
        let geometry = GeometryBuffers::upload_quad(device, None).unwrap();
        FrameLoop::new(device.clone(), ring, geometry, pipelines, CLEAR)
    }

    fn single_pipeline(device: &Arc<Device>, dir: &Path) -> Arc<PipelineCell<Device>> {
        let source = testing::write_shader(dir, GOOD_SHADER);
        Arc::new(PipelineCell::new(builder(device, &source).build().unwrap()))
    }

    #[test]
    fn slots_rotate_and_each_fence_counts_up_by_one() {
        let dir = tempfile::tempdir().unwrap();
        let device = testing::device(3);
        let mut frames = frame_loop(&device, single_pipeline(&device, dir.path()), 3);
        let mut ctx = EngineContext::new("test", false);
        let mut events = ScriptedEvents::endless();

        let reports: Vec<FrameReport> = (0..12)
            .map(|_| frames.run_frame(&mut ctx, &mut events).unwrap().unwrap())
            .collect();

        let cursors: Vec<usize> = reports.iter().map(|r| r.slot).collect();
        assert_eq!(cursors, vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0, 1, 2]);
        for slot in 0..3 {
            let completions: Vec<u64> = reports
                .iter()
                .filter(|r| r.slot == slot)
                .map(|r| r.completion)
                .collect();
            assert_eq!(completions, vec![1, 2, 3, 4]);
        }
        for report in &reports {
            assert_eq!(report.backbuffer, Backbuffer(report.slot));
        }

        device.wait_idle().unwrap();
        assert!(device.fault().is_none());
        assert_eq!(device.presents().len(), 12);
        let draws = device.draws();
        assert_eq!(draws.len(), 12);
        assert!(draws.iter().all(|d| d.index_count == 6));
        assert!(draws.windows(2).all(|pair| pair[0].submission < pair[1].submission));
        assert_eq!(draws[4].target, Backbuffer(1));
        assert_eq!(device.backbuffer_clear(Backbuffer(2)), Some(CLEAR));
        assert_eq!(device.backbuffer_state(Backbuffer(0)), Some(ImageState::Present));
    }

    #[test]
    fn never_more_frames_in_flight_than_slots() {
        let dir = tempfile::tempdir().unwrap();
        let device = testing::slow_device(3, Duration::from_millis(3));
        let mut frames = frame_loop(&device, single_pipeline(&device, dir.path()), 3);
        let mut ctx = EngineContext::new("test", false);
        let mut events = ScriptedEvents::close_on(20);

        frames.run(&mut ctx, &mut events).unwrap();

        let stats = device.stats();
        assert!(stats.max_in_flight <= 3, "max in flight: {}", stats.max_in_flight);
        assert!(stats.blocking_waits > 0);
        assert!(device.fault().is_none());
    }

    #[test]
    fn two_slots_never_reuse_a_busy_recorder() {
        let dir = tempfile::tempdir().unwrap();
        let device = testing::slow_device(2, Duration::from_millis(2));
        let mut frames = frame_loop(&device, single_pipeline(&device, dir.path()), 2);
        let mut ctx = EngineContext::new("test", false);
        let mut events = ScriptedEvents::close_on(10);

        frames.run(&mut ctx, &mut events).unwrap();

        assert!(device.stats().max_in_flight <= 2);
        assert!(device.fault().is_none());
    }

    #[test]
    fn close_on_frame_k_renders_exactly_k_frames() {
        let dir = tempfile::tempdir().unwrap();
        let device = testing::device(3);
        let mut frames = frame_loop(&device, single_pipeline(&device, dir.path()), 3);
        let mut ctx = EngineContext::new("test", false);
        let mut events = ScriptedEvents::close_on(5);

        let rendered = frames.run(&mut ctx, &mut events).unwrap();

        assert_eq!(rendered, 5);
        assert_eq!(events.polls(), 5);
        // Drained: every frame has executed and been presented
        assert_eq!(device.presents().len(), 5);
        assert_eq!(device.stats().executed, device.stats().submissions);
    }

    #[test]
    fn frames_after_reload_use_new_generation() {
        let dir = tempfile::tempdir().unwrap();
        let device = testing::device(3);
        let source = testing::write_shader(dir.path(), GOOD_SHADER);
        let retry = RetryPolicy {
            attempts: 1,
            backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        };
        let mut reloader =
            PipelineReloader::start(builder(&device, &source), Duration::from_secs(1), &retry).unwrap();
        let cell = reloader.cell();
        let first = Arc::downgrade(&cell.current());

        let mut frames = frame_loop(&device, cell.clone(), 3);
        let mut ctx = EngineContext::new("test", false);
        let mut events = ScriptedEvents::endless();

        let mut reports = Vec::new();
        for _ in 0..4 {
            reports.push(frames.run_frame(&mut ctx, &mut events).unwrap().unwrap());
        }

        testing::edit_shader(&source, "float4 VS_main() { 3 } float4 PS_main() {}", 5);
        assert_eq!(reloader.poll(Instant::now()).unwrap(), ReloadOutcome::Published(2));

        for _ in 0..4 {
            reports.push(frames.run_frame(&mut ctx, &mut events).unwrap().unwrap());
        }
        frames.ring.drain().unwrap();

        let generations: Vec<u64> = reports.iter().map(|r| r.generation).collect();
        assert_eq!(generations, vec![1, 1, 1, 1, 2, 2, 2, 2]);

        let pipelines: Vec<u64> = device.draws().iter().map(|d| d.pipeline).collect();
        assert_ne!(pipelines[3], pipelines[4]);
        assert!(pipelines[..4].iter().all(|&id| id == pipelines[0]));
        assert!(pipelines[4..].iter().all(|&id| id == pipelines[4]));

        // Nothing in flight references the first generation any more
        assert!(first.upgrade().is_none());
    }

    #[test]
    fn superseded_generation_stays_pinned_while_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let device = testing::device(3);
        let source = testing::write_shader(dir.path(), GOOD_SHADER);
        let builder = builder(&device, &source);
        let cell = Arc::new(PipelineCell::new(builder.build().unwrap()));
        let first = Arc::downgrade(&cell.current());

        let mut frames = frame_loop(&device, cell.clone(), 3);
        let mut ctx = EngineContext::new("test", false);
        let mut events = ScriptedEvents::endless();

        device.hold_queue();
        frames.run_frame(&mut ctx, &mut events).unwrap();
        cell.publish(builder.build().unwrap());
        frames.run_frame(&mut ctx, &mut events).unwrap();

        // Slot 0 still pins generation 1 until its fence is waited on
        assert_eq!(frames.ring.slots()[0].pinned_generation(), Some(1));
        assert!(first.upgrade().is_some());

        device.release_queue();
        frames.ring.drain().unwrap();
        assert!(first.upgrade().is_none());
    }

    #[test]
    fn minimized_window_skips_frames_without_touching_the_ring() {
        let dir = tempfile::tempdir().unwrap();
        let device = testing::device(3);
        let mut frames = frame_loop(&device, single_pipeline(&device, dir.path()), 3);
        let mut ctx = EngineContext::new("test", false);
        let mut events = ScriptedEvents::endless()
            .with_event(2, WindowEvent::Resized(Extent { width: 0, height: 0 }))
            .with_event(4, WindowEvent::Resized(testing::EXTENT));

        let first = frames.run_frame(&mut ctx, &mut events).unwrap().unwrap();
        assert_eq!(first.slot, 0);

        assert_eq!(frames.run_frame(&mut ctx, &mut events).unwrap(), None);
        assert_eq!(frames.run_frame(&mut ctx, &mut events).unwrap(), None);
        assert_eq!(frames.ring.cursor(), 1);
        assert_eq!(frames.ring.slots()[1].pending_completion(), 0);

        let restored = frames.run_frame(&mut ctx, &mut events).unwrap().unwrap();
        assert_eq!((restored.slot, restored.completion), (1, 1));

        device.wait_idle().unwrap();
        assert_eq!(device.presents(), vec![Backbuffer(0), Backbuffer(1)]);
        assert_eq!(device.draws().len(), 2);
        assert!(device.fault().is_none());
    }

    #[test]
    fn out_of_date_acquire_skips_the_frame() {
        let dir = tempfile::tempdir().unwrap();
        let device = testing::device(3);
        let mut frames = frame_loop(&device, single_pipeline(&device, dir.path()), 3);
        let mut ctx = EngineContext::new("test", false);
        let mut events = ScriptedEvents::endless();

        frames.run_frame(&mut ctx, &mut events).unwrap().unwrap();
        device.wait_idle().unwrap();
        let submissions = device.stats().submissions;

        device.set_out_of_date(true);
        assert_eq!(frames.run_frame(&mut ctx, &mut events).unwrap(), None);

        // No submit, no signal, same slot next time
        assert_eq!(device.stats().submissions, submissions);
        assert_eq!(device.stats().skipped_acquires, 1);
        assert_eq!(frames.ring.cursor(), 1);
        assert_eq!(frames.ring.slots()[1].pending_completion(), 0);

        device.set_out_of_date(false);
        let report = frames.run_frame(&mut ctx, &mut events).unwrap().unwrap();
        assert_eq!((report.slot, report.completion), (1, 1));

        device.wait_idle().unwrap();
        assert_eq!(device.presents().len(), 2);
        assert!(device.fault().is_none());
    }

    #[test]
    fn run_keeps_polling_while_minimized() {
        let dir = tempfile::tempdir().unwrap();
        let device = testing::device(3);
        let mut frames = frame_loop(&device, single_pipeline(&device, dir.path()), 3);
        let mut ctx = EngineContext::new("test", false);
        let mut events = ScriptedEvents::close_on(5)
            .with_event(2, WindowEvent::Resized(Extent { width: 0, height: 0 }));

        let rendered = frames.run(&mut ctx, &mut events).unwrap();

        // Frame 1 rendered, then minimized until the close arrives
        assert_eq!(rendered, 1);
        assert_eq!(events.polls(), 5);
        assert_eq!(device.presents().len(), 1);
    }

    #[test]
    fn reload_fault_stops_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let device = testing::device(3);
        let cell = single_pipeline(&device, dir.path());
        let mut frames = frame_loop(&device, cell.clone(), 3);
        let mut ctx = EngineContext::new("test", false);
        let mut events = ScriptedEvents::endless();

        frames.run_frame(&mut ctx, &mut events).unwrap();
        cell.report_fault(anyhow::anyhow!("device removed"));

        assert!(frames.run_frame(&mut ctx, &mut events).is_err());
    }
}
