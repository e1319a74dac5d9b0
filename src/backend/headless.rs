// Headless device - software GPU timeline
//
// Submissions are executed in order on a dedicated "queue" thread, so the
// CPU side really does run ahead of the device the way it does with Vulkan.
// Execution validates what a driver's validation layer would catch for this
// renderer: resource states, recorder reuse while in flight, viewports that
// do not match the swapchain, and draws with missing bindings. The first violation puts the device into a faulted
// state and every later device call fails with it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use super::{
    Backbuffer, Backend, BufferDesc, BufferState, Extent, GpuBuffer, ImageState, Recorder,
    RecorderKind, WaitOutcome,
};
use crate::compiler::StagePrograms;
use crate::pipeline::FixedFunction;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum HeadlessFault {
    #[error("{kind:?} recorder reset while submission {submission} is still in flight (executed: {executed})")]
    RecorderInFlight {
        kind: RecorderKind,
        submission: u64,
        executed: u64,
    },

    #[error("{resource} is in state {actual} but the command expects {expected}")]
    StateMismatch {
        resource: String,
        expected: String,
        actual: String,
    },

    #[error("copy of {size} bytes at offset {offset} overruns {resource} ({capacity} bytes)")]
    OutOfBounds {
        resource: String,
        offset: u64,
        size: u64,
        capacity: u64,
    },

    #[error("{0:?} recorder used while not recording")]
    NotRecording(RecorderKind),

    #[error("{0:?} recorder has no backbuffer bound")]
    NoBackbuffer(RecorderKind),

    #[error("draw issued without a bound {0}")]
    MissingBinding(&'static str),

    #[error("viewport {actual:?} does not cover the {expected:?} backbuffers")]
    ViewportMismatch { expected: Extent, actual: Extent },
}

/// One executed indexed draw
#[derive(Debug, Clone, PartialEq)]
pub struct DrawRecord {
    pub submission: u64,
    pub target: Backbuffer,
    pub pipeline: u64,
    pub index_count: u32,
}

/// Counters describing how the device was driven
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeadlessStats {
    pub submissions: u64,
    pub executed: u64,
    /// Highest number of submitted-but-unexecuted command lists observed
    pub max_in_flight: u64,
    /// Calls to `wait` that found the timeline short of its target
    pub blocking_waits: u64,
    pub presents: u64,
    pub pipelines_created: u64,
    /// Acquires refused because the surface was out of date
    pub skipped_acquires: u64,
}

pub struct HeadlessDevice {
    extent: Extent,
    backbuffer_count: usize,
    queue: Sender<Job>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_submission: AtomicU64,
    next_pipeline: AtomicU64,
    out_of_date: AtomicBool,
}

struct Shared {
    extent: Extent,
    latency: Duration,
    held: Mutex<bool>,
    resume: Condvar,
    executed: AtomicU64,
    fault: Mutex<Option<HeadlessFault>>,
    state: Mutex<DeviceState>,
}

struct DeviceState {
    backbuffers: Vec<BackbufferImage>,
    draws: Vec<DrawRecord>,
    presents: Vec<Backbuffer>,
    stats: HeadlessStats,
}

#[derive(Clone, Copy)]
struct BackbufferImage {
    state: ImageState,
    clear: Option<[f32; 4]>,
}

enum Job {
    Execute {
        submission: u64,
        commands: Vec<Command>,
    },
    Signal {
        timeline: Arc<TimelineInner>,
        value: u64,
    },
    Present(Backbuffer),
    Stop,
}

#[derive(Clone)]
enum Command {
    Copy {
        dst: HeadlessBuffer,
        dst_offset: u64,
        src: HeadlessBuffer,
        src_offset: u64,
        size: u64,
    },
    BufferBarrier {
        buffer: HeadlessBuffer,
        from: BufferState,
        to: BufferState,
    },
    ImageBarrier {
        target: Backbuffer,
        from: ImageState,
        to: ImageState,
    },
    SetRenderTarget(Backbuffer),
    Viewport(Extent),
    Clear {
        target: Backbuffer,
        color: [f32; 4],
    },
    BindPipeline(u64),
    BindGeometry {
        vertices: HeadlessBuffer,
        indices: HeadlessBuffer,
    },
    DrawIndexed(u32),
}

// =============================================================================
// RESOURCES
// =============================================================================

pub struct HeadlessTimeline(Arc<TimelineInner>);

struct TimelineInner {
    value: Mutex<u64>,
    reached: Condvar,
}

impl TimelineInner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(0),
            reached: Condvar::new(),
        })
    }

    fn set(&self, value: u64) {
        let mut current = self.value.lock();
        *current = (*current).max(value);
        self.reached.notify_all();
    }

    fn wait(&self, value: u64, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut current = self.value.lock();
        while *current < value {
            match deadline {
                Some(deadline) => {
                    if self.reached.wait_until(&mut current, deadline).timed_out() {
                        return if *current >= value {
                            WaitOutcome::Reached
                        } else {
                            WaitOutcome::TimedOut
                        };
                    }
                }
                None => self.reached.wait(&mut current),
            }
        }
        WaitOutcome::Reached
    }
}

/// Buffer living in host memory. Cloning shares the same storage.
#[derive(Clone)]
pub struct HeadlessBuffer {
    label: &'static str,
    size: u64,
    inner: Arc<BufferInner>,
}

struct BufferInner {
    bytes: Mutex<Vec<u8>>,
    // Staging buffers are not tracked
    state: Mutex<Option<BufferState>>,
}

impl HeadlessBuffer {
    fn new(label: &'static str, bytes: Vec<u8>, state: Option<BufferState>) -> Self {
        Self {
            label,
            size: bytes.len() as u64,
            inner: Arc::new(BufferInner {
                bytes: Mutex::new(bytes),
                state: Mutex::new(state),
            }),
        }
    }

    /// Debug copy-back of the buffer contents as the device sees them
    #[cfg(test)]
    pub fn read_back(&self) -> Vec<u8> {
        self.inner.bytes.lock().clone()
    }

    #[cfg(test)]
    pub fn state(&self) -> Option<BufferState> {
        *self.inner.state.lock()
    }
}

impl GpuBuffer for HeadlessBuffer {
    fn size(&self) -> u64 {
        self.size
    }
}

pub struct HeadlessPipeline {
    id: u64,
}

pub struct HeadlessRecorder {
    kind: RecorderKind,
    shared: Arc<Shared>,
    commands: Vec<Command>,
    recording: bool,
    misused: bool,
    backbuffer: Option<Backbuffer>,
    last_submission: Option<u64>,
}

impl HeadlessRecorder {
    fn push(&mut self, command: Command) {
        if !self.recording {
            self.misused = true;
        }
        self.commands.push(command);
    }
}

// =============================================================================
// DEVICE
// =============================================================================

impl HeadlessDevice {
    #[cfg(test)]
    pub fn new(extent: Extent, backbuffer_count: usize) -> Result<Self> {
        Self::with_latency(extent, backbuffer_count, Duration::ZERO)
    }

    /// Device whose every command-list execution takes `latency`
    pub fn with_latency(extent: Extent, backbuffer_count: usize, latency: Duration) -> Result<Self> {
        anyhow::ensure!(backbuffer_count > 0, "swapchain needs at least one backbuffer");

        let shared = Arc::new(Shared {
            extent,
            latency,
            held: Mutex::new(false),
            resume: Condvar::new(),
            executed: AtomicU64::new(0),
            fault: Mutex::new(None),
            state: Mutex::new(DeviceState {
                backbuffers: vec![
                    BackbufferImage {
                        state: ImageState::Present,
                        clear: None,
                    };
                    backbuffer_count
                ],
                draws: Vec::new(),
                presents: Vec::new(),
                stats: HeadlessStats::default(),
            }),
        });

        let (queue, jobs) = crossbeam_channel::unbounded();
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("headless-queue".to_string())
            .spawn(move || run_queue(worker_shared, jobs))
            .context("Failed to spawn headless queue thread")?;

        log::info!(
            "Created headless device: {}x{}, {} backbuffers",
            extent.width,
            extent.height,
            backbuffer_count
        );

        Ok(Self {
            extent,
            backbuffer_count,
            queue,
            shared,
            worker: Mutex::new(Some(worker)),
            next_submission: AtomicU64::new(1),
            next_pipeline: AtomicU64::new(1),
            out_of_date: AtomicBool::new(false),
        })
    }

    /// Make acquires fail the way a swapchain does after its surface changed
    #[cfg(test)]
    pub fn set_out_of_date(&self, out_of_date: bool) {
        self.out_of_date.store(out_of_date, Ordering::Release);
    }

    /// Stop executing queued work until `release_queue`, simulating a busy GPU
    #[cfg(test)]
    pub fn hold_queue(&self) {
        *self.shared.held.lock() = true;
    }

    pub fn release_queue(&self) {
        *self.shared.held.lock() = false;
        self.shared.resume.notify_all();
    }

    pub fn stats(&self) -> HeadlessStats {
        let mut stats = self.shared.state.lock().stats.clone();
        stats.executed = self.shared.executed.load(Ordering::Acquire);
        stats
    }

    #[cfg(test)]
    pub fn draws(&self) -> Vec<DrawRecord> {
        self.shared.state.lock().draws.clone()
    }

    pub fn last_draw(&self) -> Option<DrawRecord> {
        self.shared.state.lock().draws.last().cloned()
    }

    #[cfg(test)]
    pub fn presents(&self) -> Vec<Backbuffer> {
        self.shared.state.lock().presents.clone()
    }

    #[cfg(test)]
    pub fn backbuffer_state(&self, target: Backbuffer) -> Option<ImageState> {
        self.shared
            .state
            .lock()
            .backbuffers
            .get(target.0)
            .map(|image| image.state)
    }

    /// Colour the backbuffer was last cleared to
    pub fn backbuffer_clear(&self, target: Backbuffer) -> Option<[f32; 4]> {
        self.shared
            .state
            .lock()
            .backbuffers
            .get(target.0)
            .and_then(|image| image.clear)
    }

    pub fn fault(&self) -> Option<HeadlessFault> {
        self.shared.fault.lock().clone()
    }

    fn check(&self) -> Result<()> {
        match self.fault() {
            Some(fault) => Err(anyhow::Error::new(fault).context("Headless device lost")),
            None => Ok(()),
        }
    }

    fn enqueue(&self, job: Job) -> Result<()> {
        self.queue
            .send(job)
            .map_err(|_| anyhow::anyhow!("Headless queue thread has stopped"))
    }
}

impl Backend for HeadlessDevice {
    type Recorder = HeadlessRecorder;
    type Timeline = HeadlessTimeline;
    type Buffer = HeadlessBuffer;
    type Pipeline = HeadlessPipeline;

    fn extent(&self) -> Extent {
        self.extent
    }

    fn backbuffer_count(&self) -> usize {
        self.backbuffer_count
    }

    fn create_recorder(&self, kind: RecorderKind) -> Result<Self::Recorder> {
        self.check()?;
        Ok(HeadlessRecorder {
            kind,
            shared: self.shared.clone(),
            commands: Vec::new(),
            recording: false,
            misused: false,
            backbuffer: None,
            last_submission: None,
        })
    }

    fn create_timeline(&self) -> Result<Self::Timeline> {
        self.check()?;
        Ok(HeadlessTimeline(TimelineInner::new()))
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Self::Buffer> {
        self.check()?;
        Ok(HeadlessBuffer::new(
            desc.label,
            vec![0; desc.size as usize],
            Some(BufferState::CopyDst),
        ))
    }

    fn create_staging_buffer(&self, bytes: &[u8]) -> Result<Self::Buffer> {
        self.check()?;
        Ok(HeadlessBuffer::new("staging", bytes.to_vec(), None))
    }

    fn create_pipeline(
        &self,
        programs: &StagePrograms,
        _fixed_function: &FixedFunction,
    ) -> Result<Self::Pipeline> {
        self.check()?;
        anyhow::ensure!(!programs.is_empty(), "pipeline needs at least one stage");

        let id = self.next_pipeline.fetch_add(1, Ordering::Relaxed);
        self.shared.state.lock().stats.pipelines_created += 1;
        log::debug!("Created headless pipeline {} ({} stages)", id, programs.len());
        Ok(HeadlessPipeline { id })
    }

    fn acquire_backbuffer(&self, recorder: &mut Self::Recorder) -> Result<Option<Backbuffer>> {
        self.check()?;
        let RecorderKind::Frame(slot) = recorder.kind else {
            return Err(HeadlessFault::NoBackbuffer(recorder.kind).into());
        };

        if self.out_of_date.load(Ordering::Acquire) {
            self.shared.state.lock().stats.skipped_acquires += 1;
            return Ok(None);
        }

        // Flip-model binding: slot n always renders into image n
        let target = Backbuffer(slot % self.backbuffer_count);
        recorder.backbuffer = Some(target);
        Ok(Some(target))
    }

    fn submit(&self, recorder: &mut Self::Recorder) -> Result<()> {
        self.check()?;
        if recorder.recording || recorder.misused {
            return Err(HeadlessFault::NotRecording(recorder.kind).into());
        }

        let submission = self.next_submission.fetch_add(1, Ordering::AcqRel);
        recorder.last_submission = Some(submission);

        {
            let mut state = self.shared.state.lock();
            let executed = self.shared.executed.load(Ordering::Acquire);
            state.stats.submissions += 1;
            state.stats.max_in_flight = state.stats.max_in_flight.max(submission - executed);
        }

        self.enqueue(Job::Execute {
            submission,
            commands: recorder.commands.clone(),
        })
    }

    fn signal(&self, timeline: &Self::Timeline, value: u64) -> Result<()> {
        self.check()?;
        self.enqueue(Job::Signal {
            timeline: timeline.0.clone(),
            value,
        })
    }

    fn completed_value(&self, timeline: &Self::Timeline) -> Result<u64> {
        self.check()?;
        Ok(*timeline.0.value.lock())
    }

    fn wait(
        &self,
        timeline: &Self::Timeline,
        value: u64,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome> {
        self.check()?;
        self.shared.state.lock().stats.blocking_waits += 1;
        let outcome = timeline.0.wait(value, timeout);
        self.check()?;
        Ok(outcome)
    }

    fn present(&self, recorder: &Self::Recorder) -> Result<()> {
        self.check()?;
        let target = recorder
            .backbuffer
            .ok_or(HeadlessFault::NoBackbuffer(recorder.kind))?;
        self.enqueue(Job::Present(target))
    }

    fn wait_idle(&self) -> Result<()> {
        let idle = TimelineInner::new();
        self.enqueue(Job::Signal {
            timeline: idle.clone(),
            value: 1,
        })?;
        idle.wait(1, None);
        self.check()
    }
}

impl Drop for HeadlessDevice {
    fn drop(&mut self) {
        self.release_queue();
        let _ = self.queue.send(Job::Stop);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

// =============================================================================
// RECORDING
// =============================================================================

impl Recorder<HeadlessDevice> for HeadlessRecorder {
    fn reset(&mut self) -> Result<()> {
        if let Some(submission) = self.last_submission {
            let executed = self.shared.executed.load(Ordering::Acquire);
            if executed < submission {
                let fault = HeadlessFault::RecorderInFlight {
                    kind: self.kind,
                    submission,
                    executed,
                };
                raise(&self.shared, fault.clone());
                return Err(fault.into());
            }
        }

        self.commands.clear();
        self.recording = true;
        self.misused = false;
        Ok(())
    }

    fn copy_buffer_region(
        &mut self,
        dst: &HeadlessBuffer,
        dst_offset: u64,
        src: &HeadlessBuffer,
        src_offset: u64,
        size: u64,
    ) {
        self.push(Command::Copy {
            dst: dst.clone(),
            dst_offset,
            src: src.clone(),
            src_offset,
            size,
        });
    }

    fn transition_buffer(&mut self, buffer: &HeadlessBuffer, from: BufferState, to: BufferState) {
        self.push(Command::BufferBarrier {
            buffer: buffer.clone(),
            from,
            to,
        });
    }

    fn transition_backbuffer(&mut self, target: Backbuffer, from: ImageState, to: ImageState) {
        self.push(Command::ImageBarrier { target, from, to });
    }

    fn set_render_target(&mut self, target: Backbuffer) {
        self.push(Command::SetRenderTarget(target));
    }

    fn set_viewport(&mut self, extent: Extent) {
        self.push(Command::Viewport(extent));
    }

    fn clear(&mut self, target: Backbuffer, color: [f32; 4]) {
        self.push(Command::Clear { target, color });
    }

    fn bind_pipeline(&mut self, pipeline: &HeadlessPipeline) {
        self.push(Command::BindPipeline(pipeline.id));
    }

    fn bind_geometry(&mut self, vertices: &HeadlessBuffer, indices: &HeadlessBuffer) {
        self.push(Command::BindGeometry {
            vertices: vertices.clone(),
            indices: indices.clone(),
        });
    }

    fn draw_indexed(&mut self, index_count: u32) {
        self.push(Command::DrawIndexed(index_count));
    }

    fn close(&mut self) -> Result<()> {
        if !self.recording || self.misused {
            return Err(HeadlessFault::NotRecording(self.kind).into());
        }
        self.recording = false;
        Ok(())
    }
}

// =============================================================================
// QUEUE THREAD
// =============================================================================

fn raise(shared: &Shared, fault: HeadlessFault) {
    let mut slot = shared.fault.lock();
    if slot.is_none() {
        log::error!("Headless device fault: {}", fault);
        *slot = Some(fault);
    }
}

fn run_queue(shared: Arc<Shared>, jobs: Receiver<Job>) {
    for job in jobs.iter() {
        {
            let mut held = shared.held.lock();
            while *held {
                shared.resume.wait(&mut held);
            }
        }

        match job {
            Job::Execute {
                submission,
                commands,
            } => {
                if !shared.latency.is_zero() {
                    std::thread::sleep(shared.latency);
                }
                if let Err(fault) = execute(&shared, submission, &commands) {
                    raise(&shared, fault);
                }
                shared.executed.store(submission, Ordering::Release);
            }
            Job::Signal { timeline, value } => timeline.set(value),
            Job::Present(target) => {
                let mut state = shared.state.lock();
                let actual = state.backbuffers[target.0].state;
                if actual != ImageState::Present {
                    drop(state);
                    raise(
                        &shared,
                        mismatch(format!("backbuffer {}", target.0), ImageState::Present, actual),
                    );
                    continue;
                }
                state.presents.push(target);
                state.stats.presents += 1;
            }
            Job::Stop => break,
        }
    }
}

fn mismatch(resource: String, expected: impl std::fmt::Debug, actual: impl std::fmt::Debug) -> HeadlessFault {
    HeadlessFault::StateMismatch {
        resource,
        expected: format!("{:?}", expected),
        actual: format!("{:?}", actual),
    }
}

fn buffer_state(buffer: &HeadlessBuffer) -> Option<BufferState> {
    *buffer.inner.state.lock()
}

fn execute(shared: &Shared, submission: u64, commands: &[Command]) -> Result<(), HeadlessFault> {
    let mut state = shared.state.lock();
    let mut target = None;
    let mut pipeline = None;
    let mut geometry_bound = false;

    for command in commands {
        match command {
            Command::Copy {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => {
                let dst_state = buffer_state(dst);
                if dst_state != Some(BufferState::CopyDst) {
                    return Err(mismatch(dst.label.to_string(), BufferState::CopyDst, dst_state));
                }
                for (buffer, offset) in [(dst, dst_offset), (src, src_offset)] {
                    if offset + size > buffer.size {
                        return Err(HeadlessFault::OutOfBounds {
                            resource: buffer.label.to_string(),
                            offset: *offset,
                            size: *size,
                            capacity: buffer.size,
                        });
                    }
                }
                let source = src.inner.bytes.lock()[*src_offset as usize..(*src_offset + *size) as usize].to_vec();
                dst.inner.bytes.lock()[*dst_offset as usize..(*dst_offset + *size) as usize]
                    .copy_from_slice(&source);
            }
            Command::BufferBarrier { buffer, from, to } => {
                let mut current = buffer.inner.state.lock();
                if *current != Some(*from) {
                    return Err(mismatch(buffer.label.to_string(), from, *current));
                }
                *current = Some(*to);
            }
            Command::ImageBarrier { target: image, from, to } => {
                let backbuffer = &mut state.backbuffers[image.0];
                if backbuffer.state != *from {
                    return Err(mismatch(format!("backbuffer {}", image.0), from, backbuffer.state));
                }
                backbuffer.state = *to;
            }
            Command::SetRenderTarget(image) => target = Some(*image),
            Command::Viewport(extent) => {
                if *extent != shared.extent {
                    return Err(HeadlessFault::ViewportMismatch {
                        expected: shared.extent,
                        actual: *extent,
                    });
                }
            }
            Command::Clear { target: image, color } => {
                let backbuffer = &mut state.backbuffers[image.0];
                if backbuffer.state != ImageState::RenderTarget {
                    return Err(mismatch(
                        format!("backbuffer {}", image.0),
                        ImageState::RenderTarget,
                        backbuffer.state,
                    ));
                }
                backbuffer.clear = Some(*color);
            }
            Command::BindPipeline(id) => pipeline = Some(*id),
            Command::BindGeometry { vertices, indices } => {
                for (buffer, expected) in [
                    (vertices, BufferState::VertexBuffer),
                    (indices, BufferState::IndexBuffer),
                ] {
                    let actual = buffer_state(buffer);
                    if actual != Some(expected) {
                        return Err(mismatch(buffer.label.to_string(), expected, actual));
                    }
                }
                geometry_bound = true;
            }
            Command::DrawIndexed(index_count) => {
                let image = target.ok_or(HeadlessFault::MissingBinding("render target"))?;
                let pipeline = pipeline.ok_or(HeadlessFault::MissingBinding("pipeline"))?;
                if !geometry_bound {
                    return Err(HeadlessFault::MissingBinding("geometry"));
                }
                let actual = state.backbuffers[image.0].state;
                if actual != ImageState::RenderTarget {
                    return Err(mismatch(
                        format!("backbuffer {}", image.0),
                        ImageState::RenderTarget,
                        actual,
                    ));
                }
                state.draws.push(DrawRecord {
                    submission,
                    target: image,
                    pipeline,
                    index_count: *index_count,
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BufferUsage;
    use crate::testing;

    fn quad_buffers(device: &HeadlessDevice) -> (HeadlessBuffer, HeadlessBuffer) {
        let vertices = device
            .create_buffer(&BufferDesc {
                label: "vertices",
                size: 8,
                usage: BufferUsage::Vertex,
            })
            .unwrap();
        let indices = device
            .create_buffer(&BufferDesc {
                label: "indices",
                size: 4,
                usage: BufferUsage::Index,
            })
            .unwrap();
        (vertices, indices)
    }

    #[test]
    fn copies_execute_in_submission_order() {
        let device = testing::device(2);
        let (vertices, _) = quad_buffers(&device);
        let staging = device.create_staging_buffer(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let mut recorder = device.create_recorder(RecorderKind::Upload).unwrap();
        recorder.reset().unwrap();
        recorder.copy_buffer_region(&vertices, 0, &staging, 4, 4);
        recorder.copy_buffer_region(&vertices, 4, &staging, 0, 4);
        recorder.close().unwrap();
        device.submit(&mut recorder).unwrap();
        device.wait_idle().unwrap();

        assert_eq!(vertices.read_back(), vec![5, 6, 7, 8, 1, 2, 3, 4]);
    }

    #[test]
    fn copy_into_buffer_outside_copy_state_faults() {
        let device = testing::device(2);
        let (vertices, _) = quad_buffers(&device);
        let staging = device.create_staging_buffer(&[0; 8]).unwrap();

        let mut recorder = device.create_recorder(RecorderKind::Upload).unwrap();
        recorder.reset().unwrap();
        recorder.transition_buffer(&vertices, BufferState::CopyDst, BufferState::VertexBuffer);
        recorder.copy_buffer_region(&vertices, 0, &staging, 0, 8);
        recorder.close().unwrap();
        device.submit(&mut recorder).unwrap();

        assert!(device.wait_idle().is_err());
        assert!(matches!(device.fault(), Some(HeadlessFault::StateMismatch { .. })));
    }

    #[test]
    fn resetting_an_in_flight_recorder_faults() {
        let device = testing::device(2);
        let mut recorder = device.create_recorder(RecorderKind::Frame(0)).unwrap();

        device.hold_queue();
        recorder.reset().unwrap();
        recorder.close().unwrap();
        device.submit(&mut recorder).unwrap();

        let err = recorder.reset().unwrap_err();
        assert!(err.downcast_ref::<HeadlessFault>().is_some());
        device.release_queue();
        assert!(matches!(device.fault(), Some(HeadlessFault::RecorderInFlight { .. })));
    }

    #[test]
    fn submit_requires_closed_recorder() {
        let device = testing::device(2);
        let mut recorder = device.create_recorder(RecorderKind::Frame(0)).unwrap();
        recorder.reset().unwrap();
        assert!(device.submit(&mut recorder).is_err());
    }

    #[test]
    fn draw_without_pipeline_faults() {
        let device = testing::device(2);
        let mut recorder = device.create_recorder(RecorderKind::Frame(1)).unwrap();
        let target = device.acquire_backbuffer(&mut recorder).unwrap().unwrap();
        assert_eq!(target, Backbuffer(1));

        recorder.reset().unwrap();
        recorder.transition_backbuffer(target, ImageState::Present, ImageState::RenderTarget);
        recorder.set_render_target(target);
        recorder.draw_indexed(6);
        recorder.close().unwrap();
        device.submit(&mut recorder).unwrap();

        assert!(device.wait_idle().is_err());
        assert_eq!(device.fault(), Some(HeadlessFault::MissingBinding("pipeline")));
    }

    #[test]
    fn viewport_must_cover_the_backbuffers() {
        let device = testing::device(2);
        let mut recorder = device.create_recorder(RecorderKind::Frame(0)).unwrap();

        recorder.reset().unwrap();
        recorder.set_viewport(Extent {
            width: testing::EXTENT.width / 2,
            height: testing::EXTENT.height,
        });
        recorder.close().unwrap();
        device.submit(&mut recorder).unwrap();

        assert!(device.wait_idle().is_err());
        assert!(matches!(
            device.fault(),
            Some(HeadlessFault::ViewportMismatch { expected, .. }) if expected == testing::EXTENT
        ));
    }

    #[test]
    fn out_of_date_surface_refuses_acquire_without_faulting() {
        let device = testing::device(2);
        let mut recorder = device.create_recorder(RecorderKind::Frame(0)).unwrap();

        device.set_out_of_date(true);
        assert_eq!(device.acquire_backbuffer(&mut recorder).unwrap(), None);
        assert_eq!(device.stats().skipped_acquires, 1);

        device.set_out_of_date(false);
        assert_eq!(device.acquire_backbuffer(&mut recorder).unwrap(), Some(Backbuffer(0)));
        assert!(device.fault().is_none());
    }

    #[test]
    fn timeline_wait_times_out() {
        let timeline = TimelineInner::new();
        assert_eq!(
            timeline.wait(1, Some(Duration::from_millis(10))),
            WaitOutcome::TimedOut
        );
        timeline.set(1);
        assert_eq!(timeline.wait(1, Some(Duration::from_millis(10))), WaitOutcome::Reached);
    }
}
