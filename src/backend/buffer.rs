// Buffers for vertex and index data
//
// Memory comes from gpu-allocator: device-local for geometry, host-visible
// for the staging copy source.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;
use super::{GpuBuffer, VulkanDevice};

pub struct VulkanBuffer {
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
    device: Arc<VulkanDevice>,
}

impl GpuBuffer for VulkanBuffer {
    fn size(&self) -> u64 {
        self.size
    }
}

/// Create a buffer with its own allocation in `location`
pub fn create_buffer(
    device: &Arc<VulkanDevice>,
    label: &str,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
) -> Result<VulkanBuffer> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe {
        device
            .device
            .create_buffer(&buffer_info, None)
            .context("Failed to create buffer")?
    };

    let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

    let allocation = device.with_allocator(|allocator| {
        allocator
            .allocate(&AllocationCreateDesc {
                name: label,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .with_context(|| format!("Failed to allocate memory for {}", label))
    });
    let allocation = match allocation {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(e);
        }
    };

    let buffer = VulkanBuffer {
        buffer,
        allocation: Some(allocation),
        size,
        device: device.clone(),
    };

    if let Some(allocation) = &buffer.allocation {
        unsafe {
            device
                .device
                .bind_buffer_memory(buffer.buffer, allocation.memory(), allocation.offset())
                .context("Failed to bind buffer memory")?;
        }
    }

    Ok(buffer)
}

/// Create a host-visible copy source filled with `bytes`
pub fn create_staging_buffer(device: &Arc<VulkanDevice>, bytes: &[u8]) -> Result<VulkanBuffer> {
    let mut buffer = create_buffer(
        device,
        "staging",
        bytes.len() as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryLocation::CpuToGpu,
    )?;

    let mapped = buffer
        .allocation
        .as_mut()
        .and_then(|allocation| allocation.mapped_slice_mut())
        .context("Staging memory is not host visible")?;
    mapped[..bytes.len()].copy_from_slice(bytes);

    Ok(buffer)
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            let freed = self.device.with_allocator(|allocator| {
                allocator.free(allocation).context("Failed to free buffer memory")
            });
            if let Err(e) = freed {
                log::warn!("{:#}", e);
            }
        }
        unsafe { self.device.device.destroy_buffer(self.buffer, None) };
    }
}
