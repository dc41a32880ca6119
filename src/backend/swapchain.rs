// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// The chain is never patched in place: a rebuild destroys every image view,
// the depth attachment and the swapchain itself, then negotiates again.

use ash::vk;
use std::sync::Arc;

use super::gpu::{AcquireOutcome, GpuDevice, ImageDesc, PresentOutcome, SurfaceSupport, SwapchainDesc};
use crate::error::{Error, Result};

/// Prefer (BGRA8 UNORM, sRGB nonlinear); otherwise the first reported format.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_UNORM
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// The preferred mode when supported, FIFO otherwise (always available).
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if modes.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Uses the surface's current extent unless it reports "any", in which case
/// the requested size is clamped into the surface limits.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped by the maximum when the surface has one.
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut image_count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && image_count > caps.max_image_count {
        image_count = caps.max_image_count;
    }
    image_count
}

pub fn negotiate(
    support: &SurfaceSupport,
    preferred_mode: vk::PresentModeKHR,
    width: u32,
    height: u32,
) -> Result<SwapchainDesc> {
    let format = choose_surface_format(&support.formats)
        .ok_or_else(|| Error::Surface("surface reports no formats".to_string()))?;
    if support.present_modes.is_empty() {
        return Err(Error::Surface("surface reports no present modes".to_string()));
    }
    Ok(SwapchainDesc {
        image_count: choose_image_count(&support.capabilities),
        format,
        present_mode: choose_present_mode(&support.present_modes, preferred_mode),
        extent: choose_extent(&support.capabilities, width, height),
        transform: support.capabilities.current_transform,
    })
}

pub struct Swapchain<D: GpuDevice> {
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    depth: Option<D::Image>,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    preferred_mode: vk::PresentModeKHR,
    device: Arc<D>,
}

impl<D: GpuDevice> Swapchain<D> {
    pub fn new(
        device: Arc<D>,
        width: u32,
        height: u32,
        preferred_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        let mut swapchain = Self {
            handle: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            depth: None,
            format: vk::SurfaceFormatKHR::default(),
            present_mode: preferred_mode,
            extent: vk::Extent2D { width, height },
            preferred_mode,
            device,
        };
        swapchain.build(width, height)?;
        Ok(swapchain)
    }

    /// Destroys the current chain, then creates a new one for the given size.
    pub fn recreate(&mut self, width: u32, height: u32) -> Result<()> {
        log::info!("Recreating swapchain: {}x{}", width, height);
        self.destroy_chain();
        self.build(width, height)
    }

    fn build(&mut self, width: u32, height: u32) -> Result<()> {
        let support = self.device.surface_support()?;
        let desc = negotiate(&support, self.preferred_mode, width, height)?;
        log::info!(
            "Creating swapchain: {}x{}, {:?}, {} images requested",
            desc.extent.width,
            desc.extent.height,
            desc.present_mode,
            desc.image_count
        );

        let (handle, images) = self.device.create_swapchain(&desc)?;
        self.handle = handle;
        self.images = images;
        self.format = desc.format;
        self.present_mode = desc.present_mode;
        self.extent = desc.extent;

        for &image in &self.images {
            let view = self
                .device
                .create_image_view(image, desc.format.format, vk::ImageAspectFlags::COLOR)?;
            self.image_views.push(view);
        }

        let info = self.device.info();
        self.depth = Some(self.device.create_image(&ImageDesc {
            width: desc.extent.width,
            height: desc.extent.height,
            format: info.depth_format,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            aspect: vk::ImageAspectFlags::DEPTH,
        })?);

        log::info!("Created swapchain with {} images", self.images.len());
        Ok(())
    }

    fn destroy_chain(&mut self) {
        if let Some(mut depth) = self.depth.take() {
            self.device.destroy_image(&mut depth);
        }
        for view in self.image_views.drain(..) {
            self.device.destroy_image_view(view);
        }
        self.images.clear();
        if self.handle != vk::SwapchainKHR::null() {
            self.device.destroy_swapchain(self.handle);
            self.handle = vk::SwapchainKHR::null();
        }
    }

    pub fn acquire_next_image(
        &self,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<AcquireOutcome> {
        self.device
            .acquire_next_image(self.handle, timeout_ns, semaphore, fence)
    }

    pub fn present(&self, image_index: u32, wait: vk::Semaphore) -> Result<PresentOutcome> {
        self.device.queue_present(self.handle, image_index, wait)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    pub fn depth_view(&self) -> Option<vk::ImageView> {
        self.depth.as_ref().map(|depth| self.device.image_view(depth))
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl<D: GpuDevice> Drop for Swapchain<D> {
    fn drop(&mut self) {
        self.destroy_chain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 16, height: 16 },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        }
    }

    #[test]
    fn prefers_bgra_unorm_srgb() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(choose_surface_format(&formats), Some(formats[1]));
        assert_eq!(choose_surface_format(&formats[..1]), Some(formats[0]));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::IMMEDIATE
        );
    }

    #[test]
    fn extent_is_clamped_only_for_any_sentinel() {
        let any = caps(2, 3);
        let clamped = choose_extent(&any, 4000, 8);
        assert_eq!((clamped.width, clamped.height), (1920, 16));

        let mut fixed = caps(2, 3);
        fixed.current_extent = vk::Extent2D {
            width: 640,
            height: 480,
        };
        let extent = choose_extent(&fixed, 800, 600);
        assert_eq!((extent.width, extent.height), (640, 480));
    }

    #[test]
    fn image_count_respects_caps() {
        assert_eq!(choose_image_count(&caps(2, 3)), 3);
        assert_eq!(choose_image_count(&caps(3, 3)), 3);
        assert_eq!(choose_image_count(&caps(2, 0)), 3);
    }

    #[test]
    fn negotiation_rejects_empty_support() {
        let support = SurfaceSupport {
            capabilities: caps(2, 3),
            formats: Vec::new(),
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        assert!(matches!(
            negotiate(&support, vk::PresentModeKHR::MAILBOX, 800, 600),
            Err(Error::Surface(_))
        ));
    }
}
