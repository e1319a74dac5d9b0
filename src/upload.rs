// UploadChannel - one-shot staging upload
//
// Copies CPU-authored bytes into device-local buffers with a transient
// recorder and its own FenceGate, then blocks until the device is done.
// It runs once before the frame loop starts, so it is fully synchronous.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use thiserror::Error;

use crate::backend::{Backend, BufferDesc, BufferState, BufferUsage, GpuBuffer, Recorder, RecorderKind};
use crate::fence::FenceGate;
use crate::pipeline::{AttributeFormat, VertexAttribute, VertexLayout};

// =============================================================================
// GEOMETRY
// =============================================================================

/// Vertex format for the fullscreen quad
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub uv: Vec2,
}

impl Vertex {
    pub const fn new(position: [f32; 3], uv: [f32; 2]) -> Self {
        Self {
            position: Vec3::from_array(position),
            uv: Vec2::from_array(uv),
        }
    }

    pub fn layout() -> VertexLayout {
        VertexLayout {
            stride: std::mem::size_of::<Vertex>() as u32,
            attributes: vec![
                VertexAttribute {
                    location: 0,
                    format: AttributeFormat::Float3,
                    offset: 0,
                },
                VertexAttribute {
                    location: 1,
                    format: AttributeFormat::Float2,
                    offset: std::mem::size_of::<Vec3>() as u32,
                },
            ],
        }
    }
}

/// Quad covering the whole viewport in clip space
pub const QUAD_VERTICES: [Vertex; 4] = [
    Vertex::new([-1.0, -1.0, 0.0], [0.0, 0.0]),
    Vertex::new([1.0, -1.0, 0.0], [1.0, 0.0]),
    Vertex::new([1.0, 1.0, 0.0], [1.0, 1.0]),
    Vertex::new([-1.0, 1.0, 0.0], [0.0, 1.0]),
];

pub const QUAD_INDICES: [u32; 6] = [0, 1, 2, 2, 3, 0];

// =============================================================================
// UPLOAD
// =============================================================================

/// One destination buffer and the bytes that fill it completely
pub struct UploadRegion<'a, B: Backend> {
    pub destination: &'a B::Buffer,
    pub bytes: &'a [u8],
    pub usage: BufferUsage,
}

#[derive(Debug, Error, PartialEq)]
pub enum UploadError {
    #[error("region {index}: {actual} bytes do not match the buffer's declared size of {declared}")]
    SizeMismatch {
        index: usize,
        declared: u64,
        actual: u64,
    },

    #[error("nothing to upload")]
    Empty,
}

pub struct UploadChannel<B: Backend> {
    backend: Arc<B>,
    recorder: B::Recorder,
    gate: FenceGate<B>,
}

impl<B: Backend> UploadChannel<B> {
    pub fn new(backend: Arc<B>, fence_timeout: Option<Duration>) -> Result<Self> {
        let recorder = backend
            .create_recorder(RecorderKind::Upload)
            .context("Failed to create upload recorder")?;
        let gate = FenceGate::new(backend.clone(), fence_timeout)?;

        Ok(Self {
            backend,
            recorder,
            gate,
        })
    }

    /// Fill every destination and leave it in its usage state.
    ///
    /// Consumes the channel: on return nothing is outstanding on the device
    /// and the transient recorder is released.
    pub fn upload(mut self, regions: &[UploadRegion<'_, B>]) -> Result<()> {
        if regions.is_empty() {
            return Err(UploadError::Empty.into());
        }
        for (index, region) in regions.iter().enumerate() {
            let declared = region.destination.size();
            let actual = region.bytes.len() as u64;
            if declared != actual {
                return Err(UploadError::SizeMismatch {
                    index,
                    declared,
                    actual,
                }
                .into());
            }
        }

        // Pack everything into one staging buffer
        let staging_bytes: Vec<u8> = regions.iter().flat_map(|r| r.bytes.iter().copied()).collect();
        let staging = self
            .backend
            .create_staging_buffer(&staging_bytes)
            .context("Failed to create staging buffer")?;

        self.recorder.reset()?;
        let mut offset = 0;
        for region in regions {
            let size = region.bytes.len() as u64;
            self.recorder
                .copy_buffer_region(region.destination, 0, &staging, offset, size);
            offset += size;
        }
        for region in regions {
            self.recorder.transition_buffer(
                region.destination,
                BufferState::CopyDst,
                region.usage.resting_state(),
            );
        }
        self.recorder.close()?;

        self.backend
            .submit(&mut self.recorder)
            .context("Failed to submit upload")?;
        self.gate.signal(1)?;
        self.gate.wait(1).context("Upload did not complete")?;

        log::info!(
            "Uploaded {} bytes into {} buffers",
            staging_bytes.len(),
            regions.len()
        );
        Ok(())
    }
}

/// Vertex and index buffers for the quad, immutable once uploaded
pub struct GeometryBuffers<B: Backend> {
    pub vertices: B::Buffer,
    pub indices: B::Buffer,
    pub index_count: u32,
}

impl<B: Backend> GeometryBuffers<B> {
    pub fn upload_quad(backend: &Arc<B>, fence_timeout: Option<Duration>) -> Result<Self> {
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&QUAD_VERTICES);
        let index_bytes: &[u8] = bytemuck::cast_slice(&QUAD_INDICES);

        let vertices = backend.create_buffer(&BufferDesc {
            label: "quad vertices",
            size: vertex_bytes.len() as u64,
            usage: BufferUsage::Vertex,
        })?;
        let indices = backend.create_buffer(&BufferDesc {
            label: "quad indices",
            size: index_bytes.len() as u64,
            usage: BufferUsage::Index,
        })?;

        UploadChannel::new(backend.clone(), fence_timeout)?.upload(&[
            UploadRegion {
                destination: &vertices,
                bytes: vertex_bytes,
                usage: BufferUsage::Vertex,
            },
            UploadRegion {
                destination: &indices,
                bytes: index_bytes,
                usage: BufferUsage::Index,
            },
        ])?;

        Ok(Self {
            vertices,
            indices,
            index_count: QUAD_INDICES.len() as u32,
        })
    }
}
