// Command recording
//
// A VulkanRecorder owns one command pool with a single primary command
// buffer. Frame recorders also own the semaphore their slot's acquire
// signals.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use super::buffer::VulkanBuffer;
use super::pipeline::VulkanPipeline;
use super::swapchain::COLOR_RANGE;
use super::sync::FrameSync;
use super::vulkan::VulkanBackend;
use super::{Backbuffer, BufferState, Extent, ImageState, Recorder, RecorderKind, VulkanDevice};

/// Swapchain image and the view rendered through
#[derive(Debug, Clone, Copy)]
pub struct RenderTarget {
    pub image: vk::Image,
    pub view: vk::ImageView,
}

pub struct VulkanRecorder {
    pub(super) kind: RecorderKind,
    device: Arc<VulkanDevice>,
    targets: Arc<[RenderTarget]>,
    extent: vk::Extent2D,
    pool: vk::CommandPool,
    pub(super) command_buffer: vk::CommandBuffer,
    pub(super) sync: Option<FrameSync>,
    /// Image acquired for the frame being recorded
    pub(super) image_index: Option<u32>,
    render_target: Option<Backbuffer>,
    rendering: bool,
}

impl VulkanRecorder {
    pub fn new(
        device: &Arc<VulkanDevice>,
        kind: RecorderKind,
        targets: Arc<[RenderTarget]>,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            // RESET: the buffer is re-recorded every time the slot comes around
            .flags(vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = match unsafe { device.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { device.device.destroy_command_pool(pool, None) };
                return Err(e).context("Failed to allocate command buffer");
            }
        };

        let sync = match kind {
            RecorderKind::Frame(_) => match FrameSync::new(device) {
                Ok(sync) => Some(sync),
                Err(e) => {
                    unsafe { device.device.destroy_command_pool(pool, None) };
                    return Err(e);
                }
            },
            RecorderKind::Upload => None,
        };

        Ok(Self {
            kind,
            device: device.clone(),
            targets,
            extent,
            pool,
            command_buffer,
            sync,
            image_index: None,
            render_target: None,
            rendering: false,
        })
    }

    fn target(&self, backbuffer: Backbuffer) -> Option<RenderTarget> {
        self.targets.get(backbuffer.0).copied()
    }

    fn begin_rendering(&mut self, load_op: vk::AttachmentLoadOp, clear: [f32; 4]) {
        if self.rendering {
            return;
        }
        let Some(target) = self.render_target.and_then(|t| self.target(t)) else {
            log::error!("{:?} recorder: draw without a render target", self.kind);
            return;
        };

        let color_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(target.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(load_op)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue { float32: clear },
            })
            .build();
        let color_attachments = [color_attachment];

        let rendering_info = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.extent,
            })
            .layer_count(1)
            .color_attachments(&color_attachments);

        unsafe {
            self.device
                .device
                .cmd_begin_rendering(self.command_buffer, &rendering_info)
        };
        self.rendering = true;
    }

    fn end_rendering(&mut self) {
        if self.rendering {
            unsafe { self.device.device.cmd_end_rendering(self.command_buffer) };
            self.rendering = false;
        }
    }
}

fn image_layout(state: ImageState) -> vk::ImageLayout {
    match state {
        ImageState::Present => vk::ImageLayout::PRESENT_SRC_KHR,
        ImageState::RenderTarget => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }
}

fn image_access(state: ImageState) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match state {
        ImageState::Present => (vk::AccessFlags::empty(), vk::PipelineStageFlags::BOTTOM_OF_PIPE),
        ImageState::RenderTarget => (
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
    }
}

fn buffer_access(state: BufferState) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match state {
        BufferState::CopyDst => (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER),
        BufferState::VertexBuffer => (
            vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
            vk::PipelineStageFlags::VERTEX_INPUT,
        ),
        BufferState::IndexBuffer => (vk::AccessFlags::INDEX_READ, vk::PipelineStageFlags::VERTEX_INPUT),
    }
}

impl Recorder<VulkanBackend> for VulkanRecorder {
    fn reset(&mut self) -> Result<()> {
        self.rendering = false;
        self.render_target = None;

        unsafe {
            self.device
                .device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset command buffer")?;

            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .device
                .begin_command_buffer(self.command_buffer, &begin_info)
                .context("Failed to begin command buffer")?;
        }
        Ok(())
    }

    fn copy_buffer_region(
        &mut self,
        dst: &VulkanBuffer,
        dst_offset: u64,
        src: &VulkanBuffer,
        src_offset: u64,
        size: u64,
    ) {
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        unsafe {
            self.device
                .device
                .cmd_copy_buffer(self.command_buffer, src.buffer, dst.buffer, &[region])
        };
    }

    fn transition_buffer(&mut self, buffer: &VulkanBuffer, from: BufferState, to: BufferState) {
        let (src_access, src_stage) = buffer_access(from);
        let (dst_access, dst_stage) = buffer_access(to);

        let barrier = vk::BufferMemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer.buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();

        unsafe {
            self.device.device.cmd_pipeline_barrier(
                self.command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            )
        };
    }

    fn transition_backbuffer(&mut self, target: Backbuffer, from: ImageState, to: ImageState) {
        // Barriers are not allowed inside a dynamic rendering instance
        self.end_rendering();

        let Some(render_target) = self.target(target) else {
            log::error!("No swapchain image {}", target.0);
            return;
        };

        let (src_access, src_stage) = image_access(from);
        let (dst_access, dst_stage) = image_access(to);
        // Last frame's contents are cleared anyway
        let old_layout = match from {
            ImageState::Present => vk::ImageLayout::UNDEFINED,
            ImageState::RenderTarget => image_layout(from),
        };
        let src_stage = match from {
            ImageState::Present => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            ImageState::RenderTarget => src_stage,
        };

        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(old_layout)
            .new_layout(image_layout(to))
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(render_target.image)
            .subresource_range(COLOR_RANGE)
            .build();

        unsafe {
            self.device.device.cmd_pipeline_barrier(
                self.command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            )
        };
    }

    fn set_render_target(&mut self, target: Backbuffer) {
        self.end_rendering();
        self.render_target = Some(target);
    }

    fn set_viewport(&mut self, extent: Extent) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: extent.width,
                height: extent.height,
            },
        };

        unsafe {
            self.device
                .device
                .cmd_set_viewport(self.command_buffer, 0, &[viewport]);
            self.device
                .device
                .cmd_set_scissor(self.command_buffer, 0, &[scissor]);
        }
    }

    fn clear(&mut self, target: Backbuffer, color: [f32; 4]) {
        if self.render_target != Some(target) {
            self.set_render_target(target);
        }
        // The clear happens as the attachment's load op
        self.end_rendering();
        self.begin_rendering(vk::AttachmentLoadOp::CLEAR, color);
    }

    fn bind_pipeline(&mut self, pipeline: &VulkanPipeline) {
        unsafe {
            self.device.device.cmd_bind_pipeline(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.pipeline,
            )
        };
    }

    fn bind_geometry(&mut self, vertices: &VulkanBuffer, indices: &VulkanBuffer) {
        unsafe {
            self.device
                .device
                .cmd_bind_vertex_buffers(self.command_buffer, 0, &[vertices.buffer], &[0]);
            self.device.device.cmd_bind_index_buffer(
                self.command_buffer,
                indices.buffer,
                0,
                vk::IndexType::UINT32,
            );
        }
    }

    fn draw_indexed(&mut self, index_count: u32) {
        self.begin_rendering(vk::AttachmentLoadOp::LOAD, [0.0; 4]);
        unsafe {
            self.device
                .device
                .cmd_draw_indexed(self.command_buffer, index_count, 1, 0, 0, 0)
        };
    }

    fn close(&mut self) -> Result<()> {
        self.end_rendering();
        unsafe { self.device.device.end_command_buffer(self.command_buffer) }
            .context("Failed to end command buffer")?;
        Ok(())
    }
}

impl Drop for VulkanRecorder {
    fn drop(&mut self) {
        // The pool cannot be destroyed while its buffer may still execute
        let _ = self.device.wait_idle();
        unsafe {
            if let Some(sync) = self.sync.take() {
                sync.destroy(&self.device.device);
            }
            self.device.device.destroy_command_pool(self.pool, None);
        }
    }
}
