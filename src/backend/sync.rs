// Synchronization primitives
//
// Timeline semaphores carry the CPU-visible completion counters.
// Binary semaphores order acquire -> render -> present on the GPU: the
// acquire semaphore belongs to the frame slot, the render-finished one to
// the swapchain image. A render-finished semaphore is signaled again only
// after its image is re-acquired, i.e. after the present waiting on it.

use ash::vk;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use super::{VulkanDevice, WaitOutcome};

/// Vulkan 1.2 timeline semaphore; starts at 0
pub struct TimelineSemaphore {
    pub semaphore: vk::Semaphore,
    device: Arc<VulkanDevice>,
}

impl TimelineSemaphore {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);

        let semaphore = unsafe { device.device.create_semaphore(&create_info, None) }
            .context("Failed to create timeline semaphore")?;

        Ok(Self {
            semaphore,
            device: device.clone(),
        })
    }

    pub fn value(&self) -> Result<u64> {
        unsafe { self.device.device.get_semaphore_counter_value(self.semaphore) }
            .context("Failed to query timeline semaphore")
    }

    pub fn wait(&self, value: u64, timeout: Option<Duration>) -> Result<WaitOutcome> {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);

        match unsafe { self.device.device.wait_semaphores(&wait_info, timeout_ns(timeout)) } {
            Ok(()) => Ok(WaitOutcome::Reached),
            Err(vk::Result::TIMEOUT) => Ok(WaitOutcome::TimedOut),
            Err(e) => Err(e).context("vkWaitSemaphores failed"),
        }
    }
}

impl Drop for TimelineSemaphore {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_semaphore(self.semaphore, None) };
    }
}

/// Vulkan timeout for a wait; `None` waits forever
pub fn timeout_ns(timeout: Option<Duration>) -> u64 {
    timeout.map_or(u64::MAX, |t| t.as_nanos().min(u64::MAX as u128) as u64)
}

fn create_binary_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let semaphore_info = vk::SemaphoreCreateInfo::builder();
    unsafe { device.create_semaphore(&semaphore_info, None) }.context("Failed to create semaphore")
}

/// Create `count` objects, destroying the ones already made if any fails
fn create_all<T>(
    count: usize,
    mut create: impl FnMut() -> Result<T>,
    mut destroy: impl FnMut(T),
) -> Result<Vec<T>> {
    let mut created = Vec::with_capacity(count);
    for _ in 0..count {
        match create() {
            Ok(object) => created.push(object),
            Err(e) => {
                for object in created.into_iter().rev() {
                    destroy(object);
                }
                return Err(e);
            }
        }
    }
    Ok(created)
}

/// Per-slot acquire semaphore
pub struct FrameSync {
    pub image_available: vk::Semaphore,
}

impl FrameSync {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        Ok(Self {
            image_available: create_binary_semaphore(&device.device)?,
        })
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_semaphore(self.image_available, None) };
    }
}

/// One render-finished semaphore per swapchain image
pub struct PresentSemaphores {
    render_finished: Vec<vk::Semaphore>,
    device: Arc<VulkanDevice>,
}

impl PresentSemaphores {
    pub fn new(device: &Arc<VulkanDevice>, images: usize) -> Result<Self> {
        let render_finished = create_all(
            images,
            || create_binary_semaphore(&device.device),
            |semaphore| unsafe { device.device.destroy_semaphore(semaphore, None) },
        )?;

        Ok(Self {
            render_finished,
            device: device.clone(),
        })
    }

    /// Semaphore signaled by rendering into `image_index` and waited on by its present
    pub fn for_image(&self, image_index: u32) -> Result<vk::Semaphore> {
        render_finished_for(&self.render_finished, image_index)
    }
}

fn render_finished_for(semaphores: &[vk::Semaphore], image_index: u32) -> Result<vk::Semaphore> {
    semaphores.get(image_index as usize).copied().with_context(|| {
        format!(
            "Swapchain image {} has no render-finished semaphore ({} images)",
            image_index,
            semaphores.len()
        )
    })
}

impl Drop for PresentSemaphores {
    fn drop(&mut self) {
        for &semaphore in &self.render_finished {
            unsafe { self.device.device.destroy_semaphore(semaphore, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::cell::RefCell;

    #[test]
    fn timeout_none_waits_forever() {
        assert_eq!(timeout_ns(None), u64::MAX);
        assert_eq!(timeout_ns(Some(Duration::from_millis(3))), 3_000_000);
        assert_eq!(timeout_ns(Some(Duration::MAX)), u64::MAX);
    }

    #[test]
    fn failed_creation_destroys_what_was_made() {
        let made = RefCell::new(0);
        let destroyed = RefCell::new(Vec::new());

        let result = create_all(
            3,
            || {
                let mut made = made.borrow_mut();
                *made += 1;
                if *made == 3 {
                    anyhow::bail!("out of device memory");
                }
                Ok(*made)
            },
            |object| destroyed.borrow_mut().push(object),
        );

        assert!(result.is_err());
        assert_eq!(destroyed.into_inner(), vec![2, 1]);
    }

    #[test]
    fn render_finished_follows_the_image() {
        let semaphores: Vec<vk::Semaphore> = (1..=3).map(vk::Semaphore::from_raw).collect();

        assert_eq!(render_finished_for(&semaphores, 0).unwrap(), semaphores[0]);
        assert_eq!(render_finished_for(&semaphores, 2).unwrap(), semaphores[2]);
        assert!(render_finished_for(&semaphores, 3).is_err());
    }
}
