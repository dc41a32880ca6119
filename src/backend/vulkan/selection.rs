// Physical device selection
//
// Requirements are declarative. Every physical device is checked in order
// and the first one that satisfies all of them wins.

use ash::extensions::khr;
use ash::{vk, Instance};
use std::ffi::CStr;

use crate::backend::gpu::QueueFamilies;
use crate::config::DeviceConfig;
use crate::error::{vk_err, Error, Result};

/// Depth formats in order of preference, with their channel counts.
pub const DEPTH_CANDIDATES: [(vk::Format, u8); 3] = [
    (vk::Format::D32_SFLOAT, 4),
    (vk::Format::D32_SFLOAT_S8_UINT, 4),
    (vk::Format::D24_UNORM_S8_UINT, 3),
];

#[derive(Debug, Clone)]
pub struct DeviceRequirements {
    pub graphics: bool,
    pub present: bool,
    pub transfer: bool,
    pub compute: bool,
    pub sampler_anisotropy: bool,
    pub discrete_gpu_only: bool,
    /// Device extensions besides the swapchain extension, which is always required.
    pub extensions: Vec<String>,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            graphics: true,
            present: true,
            transfer: true,
            compute: false,
            sampler_anisotropy: true,
            discrete_gpu_only: false,
            extensions: Vec::new(),
        }
    }
}

impl DeviceRequirements {
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            transfer: config.require_transfer_queue,
            sampler_anisotropy: config.sampler_anisotropy,
            discrete_gpu_only: config.discrete_gpu_only,
            extensions: config.extensions.clone(),
            ..Default::default()
        }
    }

    /// Every required device extension name, swapchain first.
    pub fn extension_names(&self) -> Vec<String> {
        let mut names = vec![khr::Swapchain::name().to_string_lossy().into_owned()];
        for name in &self.extensions {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }
}

/// What one queue family can do.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueFamilyCaps {
    pub graphics: bool,
    pub compute: bool,
    pub transfer: bool,
    pub present: bool,
}

impl QueueFamilyCaps {
    /// Lower is more specialised.
    fn score(&self) -> u8 {
        u8::from(self.graphics) + u8::from(self.compute) + u8::from(self.transfer)
    }
}

/// Picks queue families. Graphics, present and compute take the first family
/// that qualifies; transfer takes the lowest-scoring transfer-capable family,
/// which favours a dedicated transfer queue.
pub fn choose_queue_families(families: &[QueueFamilyCaps], req: &DeviceRequirements) -> Option<QueueFamilies> {
    let graphics = families.iter().position(|f| f.graphics).map(|i| i as u32);
    let present = families.iter().position(|f| f.present).map(|i| i as u32);
    let compute = families.iter().position(|f| f.compute).map(|i| i as u32);

    let mut transfer = None;
    let mut best_score = u8::MAX;
    for (index, family) in families.iter().enumerate() {
        if family.transfer && family.score() < best_score {
            best_score = family.score();
            transfer = Some(index as u32);
        }
    }

    let graphics = graphics?;
    if req.present && present.is_none() {
        return None;
    }
    if req.transfer && transfer.is_none() {
        return None;
    }
    if req.compute && compute.is_none() {
        return None;
    }

    Some(QueueFamilies {
        graphics,
        present: present.unwrap_or(graphics),
        transfer: transfer.unwrap_or(graphics),
        compute,
    })
}

pub(super) struct SelectedDevice {
    pub physical_device: vk::PhysicalDevice,
    pub name: String,
    pub queue_families: QueueFamilies,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub depth_format: vk::Format,
    pub depth_channel_count: u8,
    pub device_local_host_visible: bool,
}

pub(super) fn select_physical_device(
    instance: &Instance,
    surface_loader: &khr::Surface,
    surface: vk::SurfaceKHR,
    req: &DeviceRequirements,
) -> Result<SelectedDevice> {
    let devices = unsafe { instance.enumerate_physical_devices() }
        .map_err(vk_err("vkEnumeratePhysicalDevices"))?;
    if devices.is_empty() {
        log::error!("No Vulkan-capable GPU found");
        return Err(Error::NoSuitableDevice);
    }

    for physical_device in devices {
        match evaluate_device(instance, surface_loader, surface, physical_device, req)? {
            Some(selected) => {
                log::info!(
                    "Selected GPU: {} (graphics {}, present {}, transfer {})",
                    selected.name,
                    selected.queue_families.graphics,
                    selected.queue_families.present,
                    selected.queue_families.transfer
                );
                return Ok(selected);
            }
            None => continue,
        }
    }

    Err(Error::NoSuitableDevice)
}

fn evaluate_device(
    instance: &Instance,
    surface_loader: &khr::Surface,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    req: &DeviceRequirements,
) -> Result<Option<SelectedDevice>> {
    let properties = unsafe { instance.get_physical_device_properties(physical_device) };
    let features = unsafe { instance.get_physical_device_features(physical_device) };
    let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned();

    if req.discrete_gpu_only && properties.device_type != vk::PhysicalDeviceType::DISCRETE_GPU {
        log::info!("Skipping {}: not a discrete GPU", name);
        return Ok(None);
    }
    if req.sampler_anisotropy && features.sampler_anisotropy != vk::TRUE {
        log::info!("Skipping {}: no sampler anisotropy", name);
        return Ok(None);
    }

    // Step 1: Queue families
    let family_props = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    let mut caps = Vec::with_capacity(family_props.len());
    for (index, props) in family_props.iter().enumerate() {
        let present = unsafe {
            surface_loader.get_physical_device_surface_support(physical_device, index as u32, surface)
        }
        .map_err(vk_err("vkGetPhysicalDeviceSurfaceSupportKHR"))?;
        caps.push(QueueFamilyCaps {
            graphics: props.queue_flags.contains(vk::QueueFlags::GRAPHICS),
            compute: props.queue_flags.contains(vk::QueueFlags::COMPUTE),
            transfer: props.queue_flags.contains(vk::QueueFlags::TRANSFER),
            present,
        });
    }
    let Some(queue_families) = choose_queue_families(&caps, req) else {
        log::info!("Skipping {}: required queue families missing", name);
        return Ok(None);
    };

    // Step 2: Device extensions
    let available = unsafe { instance.enumerate_device_extension_properties(physical_device) }
        .map_err(vk_err("vkEnumerateDeviceExtensionProperties"))?;
    let available: Vec<String> = available
        .iter()
        .map(|ext| {
            unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    if let Some(missing) = req
        .extension_names()
        .into_iter()
        .find(|name| !available.contains(name))
    {
        log::info!("Skipping {}: extension {} not available", name, missing);
        return Ok(None);
    }

    // Step 3: Swapchain support
    let formats = unsafe { surface_loader.get_physical_device_surface_formats(physical_device, surface) }
        .map_err(vk_err("vkGetPhysicalDeviceSurfaceFormatsKHR"))?;
    let modes = unsafe { surface_loader.get_physical_device_surface_present_modes(physical_device, surface) }
        .map_err(vk_err("vkGetPhysicalDeviceSurfacePresentModesKHR"))?;
    if formats.is_empty() || modes.is_empty() {
        log::info!("Skipping {}: inadequate swapchain support", name);
        return Ok(None);
    }

    // Step 4: Depth format
    let Some((depth_format, depth_channel_count)) = DEPTH_CANDIDATES.into_iter().find(|(format, _)| {
        let props = unsafe { instance.get_physical_device_format_properties(physical_device, *format) };
        props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    }) else {
        log::info!("Skipping {}: no usable depth format", name);
        return Ok(None);
    };

    let memory = unsafe { instance.get_physical_device_memory_properties(physical_device) };
    let device_local_host_visible = memory.memory_types[..memory.memory_type_count as usize]
        .iter()
        .any(|ty| {
            ty.property_flags
                .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE)
        });

    Ok(Some(SelectedDevice {
        physical_device,
        name,
        queue_families,
        properties,
        features,
        depth_format,
        depth_channel_count,
        device_local_host_visible,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(graphics: bool, compute: bool, transfer: bool, present: bool) -> QueueFamilyCaps {
        QueueFamilyCaps {
            graphics,
            compute,
            transfer,
            present,
        }
    }

    #[test]
    fn prefers_dedicated_transfer_family() {
        let families = [
            family(true, true, true, true),
            family(false, true, true, false),
            family(false, false, true, false),
        ];
        let chosen = choose_queue_families(&families, &DeviceRequirements::default()).unwrap();
        assert_eq!(chosen.graphics, 0);
        assert_eq!(chosen.present, 0);
        assert_eq!(chosen.transfer, 2);
        assert_eq!(chosen.compute, Some(0));
    }

    #[test]
    fn single_family_serves_every_role() {
        let families = [family(true, true, true, true)];
        let chosen = choose_queue_families(&families, &DeviceRequirements::default()).unwrap();
        assert_eq!(chosen.unique(), vec![0]);
    }

    #[test]
    fn missing_present_rejects_device() {
        let families = [family(true, true, true, false)];
        assert!(choose_queue_families(&families, &DeviceRequirements::default()).is_none());

        let relaxed = DeviceRequirements {
            present: false,
            ..Default::default()
        };
        assert_eq!(choose_queue_families(&families, &relaxed).unwrap().present, 0);
    }

    #[test]
    fn swapchain_extension_always_required() {
        let req = DeviceRequirements {
            extensions: vec!["VK_KHR_swapchain".to_string(), "VK_EXT_foo".to_string()],
            ..Default::default()
        };
        assert_eq!(req.extension_names(), vec!["VK_KHR_swapchain", "VK_EXT_foo"]);
    }
}
