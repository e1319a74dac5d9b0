// Graphics pipeline creation
//
// Pipelines render with dynamic rendering (no render pass objects) into the
// swapchain format. Viewport and scissor are dynamic so a pipeline does not
// depend on the surface size.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CString;
use std::sync::Arc;
use super::shader::create_shader_module;
use super::VulkanDevice;
use crate::compiler::{StageKind, StagePrograms};
use crate::pipeline::{AttributeFormat, CullMode, FixedFunction, Topology};

pub struct VulkanPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    device: Arc<VulkanDevice>,
}

impl Drop for VulkanPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_pipeline(self.pipeline, None);
            self.device.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

fn stage_flags(stage: StageKind) -> vk::ShaderStageFlags {
    match stage {
        StageKind::Vertex => vk::ShaderStageFlags::VERTEX,
        StageKind::Fragment => vk::ShaderStageFlags::FRAGMENT,
    }
}

/// Vertex input description from the fixed-function layout
fn vertex_input_info(
    fixed_function: &FixedFunction,
) -> (
    Vec<vk::VertexInputBindingDescription>,
    Vec<vk::VertexInputAttributeDescription>,
) {
    let layout = &fixed_function.vertex_layout;

    // One binding for interleaved data
    let binding = vk::VertexInputBindingDescription::builder()
        .binding(0)
        .stride(layout.stride)
        .input_rate(vk::VertexInputRate::VERTEX)
        .build();

    let attributes = layout
        .attributes
        .iter()
        .map(|attribute| {
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(attribute.location)
                .format(match attribute.format {
                    AttributeFormat::Float2 => vk::Format::R32G32_SFLOAT,
                    AttributeFormat::Float3 => vk::Format::R32G32B32_SFLOAT,
                })
                .offset(attribute.offset)
                .build()
        })
        .collect();

    (vec![binding], attributes)
}

pub fn create_graphics_pipeline(
    device: &Arc<VulkanDevice>,
    color_format: vk::Format,
    programs: &StagePrograms,
    fixed_function: &FixedFunction,
) -> Result<VulkanPipeline> {
    // Shader stages
    let entry_points = programs
        .values()
        .map(|program| CString::new(program.entry_point.as_str()))
        .collect::<Result<Vec<_>, _>>()
        .context("Entry point name contains a NUL byte")?;

    let mut modules = Vec::with_capacity(programs.len());
    for program in programs.values() {
        match create_shader_module(device, &program.words) {
            Ok(module) => modules.push(module),
            Err(e) => {
                destroy_modules(device, &modules);
                return Err(e);
            }
        }
    }

    let shader_stages: Vec<_> = programs
        .values()
        .zip(&modules)
        .zip(&entry_points)
        .map(|((program, &module), entry_point)| {
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(stage_flags(program.stage))
                .module(module)
                .name(entry_point)
                .build()
        })
        .collect();

    // Vertex input
    let (bindings, attributes) = vertex_input_info(fixed_function);
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    // Input assembly
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(match fixed_function.topology {
            Topology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        })
        .primitive_restart_enable(false);

    // Viewport and scissor are set per frame
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    // Rasterization
    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(match fixed_function.cull_mode {
            CullMode::None => vk::CullModeFlags::NONE,
        })
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    // Multisampling (disabled)
    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    // No depth attachment; the test state only matters when one is bound
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(fixed_function.depth_test)
        .depth_write_enable(fixed_function.depth_test)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachment = if fixed_function.blend {
        vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD)
            .build()
    } else {
        vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build()
    };

    let color_blend_attachments = [color_blend_attachment];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    // Empty layout: the fractal shader takes no resources
    let layout_info = vk::PipelineLayoutCreateInfo::builder();
    let pipeline_layout = match unsafe { device.device.create_pipeline_layout(&layout_info, None) } {
        Ok(layout) => layout,
        Err(e) => {
            destroy_modules(device, &modules);
            return Err(e).context("Failed to create pipeline layout");
        }
    };

    let color_formats = [color_format];
    let mut rendering_info =
        vk::PipelineRenderingCreateInfo::builder().color_attachment_formats(&color_formats);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(pipeline_layout)
        .push_next(&mut rendering_info)
        .build();

    let pipelines = unsafe {
        device
            .device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    };

    // Modules are baked into the pipeline
    destroy_modules(device, &modules);

    let pipeline = match pipelines {
        Ok(pipelines) => pipelines[0],
        Err((_, e)) => {
            unsafe { device.device.destroy_pipeline_layout(pipeline_layout, None) };
            return Err(e).context("Failed to create graphics pipeline");
        }
    };

    Ok(VulkanPipeline {
        pipeline,
        layout: pipeline_layout,
        device: device.clone(),
    })
}

fn destroy_modules(device: &VulkanDevice, modules: &[vk::ShaderModule]) {
    for &module in modules {
        unsafe { device.device.destroy_shader_module(module, None) };
    }
}
