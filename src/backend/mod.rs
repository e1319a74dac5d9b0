// Backend module - device abstraction layer
//
// The frame pipeline only talks to the GPU through the `Backend` and
// `Recorder` traits below. Two implementations exist:
// - Vulkan (ash): the real device, swapchain and timeline semaphores
// - Headless: a software device with its own execution thread, used for
//   windowless runs and for exercising the synchronization engine in tests

pub mod buffer;
pub mod device;
pub mod headless;
pub mod pipeline;
pub mod recorder;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod vulkan;

use std::time::Duration;

use anyhow::Result;

use crate::compiler::StagePrograms;
use crate::pipeline::FixedFunction;

pub use device::VulkanDevice;
pub use headless::HeadlessDevice;
pub use swapchain::Swapchain;
pub use vulkan::{VulkanBackend, VulkanSettings};

/// Surface dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

/// Index of a swapchain-owned presentable image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Backbuffer(pub usize);

/// How a buffer is about to be used by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    CopyDst,
    VertexBuffer,
    IndexBuffer,
}

/// How a backbuffer is about to be used by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Present,
    RenderTarget,
}

/// Intended usage of a device-local buffer once its upload has finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    Vertex,
    Index,
}

impl BufferUsage {
    /// State the buffer must be left in after its one-time upload
    pub fn resting_state(self) -> BufferState {
        match self {
            BufferUsage::Vertex => BufferState::VertexBuffer,
            BufferUsage::Index => BufferState::IndexBuffer,
        }
    }
}

/// Description of a device-local buffer. Buffers are created in
/// `BufferState::CopyDst` so they can be filled straight away.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    pub label: &'static str,
    pub size: u64,
    pub usage: BufferUsage,
}

/// What a recording context is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderKind {
    /// Owned by frame slot `n` for the lifetime of the ring
    Frame(usize),
    /// Transient one-shot upload context
    Upload,
}

/// Result of a bounded wait on a timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Reached,
    TimedOut,
}

/// A buffer whose size was fixed at creation
pub trait GpuBuffer {
    fn size(&self) -> u64;
}

/// The device, its queue and its swapchain.
///
/// Steady-state rendering uses only recorder creation, `submit`, `signal`,
/// `completed_value`/`wait` and `present`; everything else is one-time setup.
pub trait Backend: Send + Sync + 'static {
    type Recorder: Recorder<Self> + Send;
    type Timeline: Send + Sync;
    type Buffer: GpuBuffer + Send + Sync;
    type Pipeline: Send + Sync;

    /// Fixed dimensions of the presentation surface
    fn extent(&self) -> Extent;

    /// Number of presentable images owned by the swapchain
    fn backbuffer_count(&self) -> usize;

    fn create_recorder(&self, kind: RecorderKind) -> Result<Self::Recorder>;

    /// Create a monotonic completion counter starting at zero
    fn create_timeline(&self) -> Result<Self::Timeline>;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Self::Buffer>;

    /// Create a CPU-visible buffer holding `bytes`
    fn create_staging_buffer(&self, bytes: &[u8]) -> Result<Self::Buffer>;

    fn create_pipeline(
        &self,
        programs: &StagePrograms,
        fixed_function: &FixedFunction,
    ) -> Result<Self::Pipeline>;

    /// Bind the next presentable image to the recorder's frame.
    ///
    /// `None` when the surface is out of date; nothing was signaled and the
    /// frame should be skipped.
    fn acquire_backbuffer(&self, recorder: &mut Self::Recorder) -> Result<Option<Backbuffer>>;

    /// Hand a closed recorder to the queue
    fn submit(&self, recorder: &mut Self::Recorder) -> Result<()>;

    /// Ask the queue to report `value` once all prior submissions retire
    fn signal(&self, timeline: &Self::Timeline, value: u64) -> Result<()>;

    /// Last value the device reported for `timeline`
    fn completed_value(&self, timeline: &Self::Timeline) -> Result<u64>;

    /// Block until `timeline` reaches `value`. `None` waits forever.
    fn wait(
        &self,
        timeline: &Self::Timeline,
        value: u64,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome>;

    /// Request display of the backbuffer the recorder rendered into
    fn present(&self, recorder: &Self::Recorder) -> Result<()>;

    fn wait_idle(&self) -> Result<()>;
}

/// A command-recording context
pub trait Recorder<B: Backend + ?Sized> {
    /// Discard previous contents and start recording again
    fn reset(&mut self) -> Result<()>;

    fn copy_buffer_region(
        &mut self,
        dst: &B::Buffer,
        dst_offset: u64,
        src: &B::Buffer,
        src_offset: u64,
        size: u64,
    );

    fn transition_buffer(&mut self, buffer: &B::Buffer, from: BufferState, to: BufferState);

    fn transition_backbuffer(&mut self, target: Backbuffer, from: ImageState, to: ImageState);

    fn set_render_target(&mut self, target: Backbuffer);

    /// Viewport and scissor covering `extent`
    fn set_viewport(&mut self, extent: Extent);

    fn clear(&mut self, target: Backbuffer, color: [f32; 4]);

    fn bind_pipeline(&mut self, pipeline: &B::Pipeline);

    /// Vertex layout comes from the bound pipeline
    fn bind_geometry(&mut self, vertices: &B::Buffer, indices: &B::Buffer);

    fn draw_indexed(&mut self, index_count: u32);

    /// Finish recording; the recorder can then be submitted
    fn close(&mut self) -> Result<()>;
}
