// VulkanBackend - the Backend trait on top of ash
//
// QUEUE TIMELINE (one frame):
// acquire(slot's image_available) -> submit(wait image_available, signal
//   render_finished[image]) -> present(wait render_finished[image])
//   -> empty submit signaling the slot's timeline
//
// Every queue operation happens under the device's queue lock.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;
use std::time::Duration;
use winit::window::Window;

use super::buffer::{self, VulkanBuffer};
use super::pipeline::{create_graphics_pipeline, VulkanPipeline};
use super::recorder::{RenderTarget, VulkanRecorder};
use super::sync::{FrameSync, PresentSemaphores, TimelineSemaphore};
use super::{
    Backbuffer, Backend, BufferDesc, BufferUsage, Extent, RecorderKind, Swapchain, VulkanDevice,
    WaitOutcome,
};
use crate::compiler::StagePrograms;
use crate::pipeline::FixedFunction;

/// Settings for bringing up the Vulkan backend
pub struct VulkanSettings<'a> {
    pub app_name: &'a str,
    pub validation: bool,
    pub extent: Extent,
    pub present_mode: vk::PresentModeKHR,
    pub min_images: u32,
    /// Longest wait for a swapchain image; `None` waits forever
    pub acquire_timeout: Option<Duration>,
}

pub struct VulkanBackend {
    // Dropped before the device's last reference goes away
    swapchain: Swapchain,
    present_semaphores: PresentSemaphores,
    targets: Arc<[RenderTarget]>,
    acquire_timeout: Option<Duration>,
    device: Arc<VulkanDevice>,
}

impl VulkanBackend {
    pub fn new(window: &Window, settings: &VulkanSettings<'_>) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let device = VulkanDevice::new(settings.app_name, settings.validation, window)?;
        let swapchain = Swapchain::new(
            device.clone(),
            settings.extent.width,
            settings.extent.height,
            settings.present_mode,
            settings.min_images,
        )?;

        let targets: Arc<[RenderTarget]> = swapchain
            .images
            .iter()
            .zip(&swapchain.image_views)
            .map(|(&image, &view)| RenderTarget { image, view })
            .collect();
        let present_semaphores = PresentSemaphores::new(&device, targets.len())?;

        log::info!("Vulkan initialized successfully!");
        Ok(Self {
            swapchain,
            present_semaphores,
            targets,
            acquire_timeout: settings.acquire_timeout,
            device,
        })
    }

    fn frame_sync(recorder: &VulkanRecorder) -> Result<&FrameSync> {
        recorder
            .sync
            .as_ref()
            .with_context(|| format!("{:?} recorder has no acquire semaphore", recorder.kind))
    }
}

impl Backend for VulkanBackend {
    type Recorder = VulkanRecorder;
    type Timeline = TimelineSemaphore;
    type Buffer = VulkanBuffer;
    type Pipeline = VulkanPipeline;

    fn extent(&self) -> Extent {
        Extent {
            width: self.swapchain.extent.width,
            height: self.swapchain.extent.height,
        }
    }

    fn backbuffer_count(&self) -> usize {
        self.targets.len()
    }

    fn create_recorder(&self, kind: RecorderKind) -> Result<Self::Recorder> {
        VulkanRecorder::new(&self.device, kind, self.targets.clone(), self.swapchain.extent)
    }

    fn create_timeline(&self) -> Result<Self::Timeline> {
        TimelineSemaphore::new(&self.device)
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Self::Buffer> {
        let usage = match desc.usage {
            BufferUsage::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            BufferUsage::Index => vk::BufferUsageFlags::INDEX_BUFFER,
        };
        buffer::create_buffer(
            &self.device,
            desc.label,
            desc.size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )
    }

    fn create_staging_buffer(&self, bytes: &[u8]) -> Result<Self::Buffer> {
        buffer::create_staging_buffer(&self.device, bytes)
    }

    fn create_pipeline(
        &self,
        programs: &StagePrograms,
        fixed_function: &FixedFunction,
    ) -> Result<Self::Pipeline> {
        create_graphics_pipeline(&self.device, self.swapchain.format, programs, fixed_function)
    }

    fn acquire_backbuffer(&self, recorder: &mut Self::Recorder) -> Result<Option<Backbuffer>> {
        let image_available = Self::frame_sync(recorder)?.image_available;
        let index = self
            .swapchain
            .acquire_next_image(self.acquire_timeout, image_available)?;
        recorder.image_index = index;
        Ok(index.map(|index| Backbuffer(index as usize)))
    }

    fn submit(&self, recorder: &mut Self::Recorder) -> Result<()> {
        let command_buffers = [recorder.command_buffer];

        // Frames wait for their image and hand it to presentation
        let (wait, signal) = match (&recorder.sync, recorder.image_index) {
            (Some(sync), Some(index)) => (
                vec![sync.image_available],
                vec![self.present_semaphores.for_image(index)?],
            ),
            _ => (Vec::new(), Vec::new()),
        };
        let wait_stages = vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT; wait.len()];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal)
            .build();

        let _queue = self.device.queue();
        unsafe {
            self.device
                .device
                .queue_submit(self.device.graphics_queue, &[submit_info], vk::Fence::null())
        }
        .context("vkQueueSubmit failed")?;
        Ok(())
    }

    fn signal(&self, timeline: &Self::Timeline, value: u64) -> Result<()> {
        let semaphores = [timeline.semaphore];
        let values = [value];
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&values);
        let submit_info = vk::SubmitInfo::builder()
            .signal_semaphores(&semaphores)
            .push_next(&mut timeline_info)
            .build();

        let _queue = self.device.queue();
        unsafe {
            self.device
                .device
                .queue_submit(self.device.graphics_queue, &[submit_info], vk::Fence::null())
        }
        .context("Failed to queue timeline signal")?;
        Ok(())
    }

    fn completed_value(&self, timeline: &Self::Timeline) -> Result<u64> {
        timeline.value()
    }

    fn wait(
        &self,
        timeline: &Self::Timeline,
        value: u64,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome> {
        timeline.wait(value, timeout)
    }

    fn present(&self, recorder: &Self::Recorder) -> Result<()> {
        let index = recorder
            .image_index
            .context("Present without an acquired swapchain image")?;
        let render_finished = self.present_semaphores.for_image(index)?;

        let _queue = self.device.queue();
        self.swapchain
            .present(self.device.graphics_queue, index, &[render_finished])
    }

    fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");
        let _ = self.device.wait_idle();
    }
}
