// Synchronization primitives
//
// Fences and semaphores for each frame in flight, plus the table that maps
// swap images to the frame slot whose fence currently owns them.

use ash::vk;
use std::sync::Arc;

use super::gpu::GpuDevice;
use crate::error::{Error, Result};

/// A fence that remembers whether it was last seen signaled.
pub struct Fence<D: GpuDevice> {
    device: Arc<D>,
    handle: vk::Fence,
    signaled: bool,
}

impl<D: GpuDevice> Fence<D> {
    pub fn new(device: Arc<D>, signaled: bool) -> Result<Self> {
        let handle = device.create_fence(signaled)?;
        Ok(Self {
            device,
            handle,
            signaled,
        })
    }

    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled
    }

    /// Blocks until signaled or `timeout_ns` passes. `Ok(false)` on timeout.
    pub fn wait(&mut self, timeout_ns: u64) -> Result<bool> {
        if self.signaled {
            return Ok(true);
        }
        let done = self.device.wait_for_fence(self.handle, timeout_ns)?;
        if done {
            self.signaled = true;
        } else {
            log::warn!("Fence {:?} wait timed out after {} ns", self.handle, timeout_ns);
        }
        Ok(done)
    }

    pub fn reset(&mut self) -> Result<()> {
        self.device.reset_fence(self.handle)?;
        self.signaled = false;
        Ok(())
    }
}

impl<D: GpuDevice> Drop for Fence<D> {
    fn drop(&mut self) {
        self.device.destroy_fence(self.handle);
    }
}

/// Frame synchronization - one fence and two semaphores per frame in flight
pub struct FrameSync<D: GpuDevice> {
    image_available: Vec<vk::Semaphore>,
    queue_complete: Vec<vk::Semaphore>,
    in_flight: Vec<Fence<D>>,
    /// Indexed by swap image; holds the frame slot whose fence owns the image.
    images_in_flight: Vec<Option<usize>>,
    device: Arc<D>,
}

impl<D: GpuDevice> FrameSync<D> {
    pub fn new(device: Arc<D>, frames_in_flight: usize, image_count: usize) -> Result<Self> {
        let mut sync = Self {
            image_available: Vec::with_capacity(frames_in_flight),
            queue_complete: Vec::with_capacity(frames_in_flight),
            in_flight: Vec::with_capacity(frames_in_flight),
            images_in_flight: vec![None; image_count],
            device,
        };

        for _ in 0..frames_in_flight {
            sync.image_available.push(sync.device.create_semaphore()?);
            sync.queue_complete.push(sync.device.create_semaphore()?);
            // Start signaled so the first wait on each slot returns immediately
            sync.in_flight.push(Fence::new(sync.device.clone(), true)?);
        }

        log::debug!(
            "Created frame sync: {} frames in flight, {} swap images",
            frames_in_flight,
            image_count
        );
        Ok(sync)
    }

    pub fn frames_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn image_available(&self, slot: usize) -> vk::Semaphore {
        self.image_available[slot]
    }

    pub fn queue_complete(&self, slot: usize) -> vk::Semaphore {
        self.queue_complete[slot]
    }

    pub fn fence(&self, slot: usize) -> &Fence<D> {
        &self.in_flight[slot]
    }

    /// Waits for the work last submitted from `slot`.
    pub fn wait_frame(&mut self, slot: usize, timeout_ns: u64) -> Result<()> {
        if self.in_flight[slot].wait(timeout_ns)? {
            Ok(())
        } else {
            Err(Error::FenceTimeout(timeout_ns))
        }
    }

    /// Swaps in a fresh image-available semaphore for `slot`, for when an
    /// acquire signaled the old one but the frame was abandoned.
    pub fn replace_image_available(&mut self, slot: usize) -> Result<()> {
        let fresh = self.device.create_semaphore()?;
        let stale = std::mem::replace(&mut self.image_available[slot], fresh);
        self.device.destroy_semaphore(stale);
        log::debug!("Replaced image-available semaphore of frame slot {}", slot);
        Ok(())
    }

    pub fn reset_frame(&mut self, slot: usize) -> Result<()> {
        self.in_flight[slot].reset()
    }

    /// Frame slot whose fence currently owns `image`, if any.
    pub fn image_owner(&self, image: usize) -> Option<usize> {
        self.images_in_flight.get(image).copied().flatten()
    }

    /// Waits on whatever fence still owns `image`. No-op for a free image.
    pub fn wait_image(&mut self, image: usize, timeout_ns: u64) -> Result<()> {
        match self.image_owner(image) {
            Some(slot) => self.wait_frame(slot, timeout_ns),
            None => Ok(()),
        }
    }

    /// Records `slot` as the owner of `image`, replacing any previous owner.
    pub fn claim_image(&mut self, image: usize, slot: usize) {
        if let Some(entry) = self.images_in_flight.get_mut(image) {
            *entry = Some(slot);
        }
    }

    /// Forgets image ownership, e.g. after the swap chain was rebuilt.
    pub fn reset_images(&mut self, image_count: usize) {
        self.images_in_flight.clear();
        self.images_in_flight.resize(image_count, None);
    }
}

impl<D: GpuDevice> Drop for FrameSync<D> {
    fn drop(&mut self) {
        for &semaphore in self.image_available.iter().chain(&self.queue_complete) {
            self.device.destroy_semaphore(semaphore);
        }
        // Fences destroy themselves
    }
}
