// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Surface creation through a `SurfaceProvider`
// - Physical device selection against declarative requirements
// - Logical device, queues and the graphics command pool
// - Memory allocator setup
//
// Every native call made through `GpuDevice` is serialized by the shared
// `LockPool` (see ops.rs).

mod ops;
mod pipeline;
mod resources;
mod selection;
mod surface;

pub use resources::{VulkanBuffer, VulkanImage};
pub use selection::{choose_queue_families, DeviceRequirements, QueueFamilyCaps, DEPTH_CANDIDATES};
pub use surface::{RawWindowSurface, SurfaceProvider};

use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use super::gpu::{DeviceInfo, QueueFamilies, QueueRole};
use crate::config::Config;
use crate::error::{vk_err, Error, Result};
use crate::lock_pool::{LockGroup, LockPool};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    info: DeviceInfo,
    locks: Arc<LockPool>,

    // Vulkan handles (destroyed explicitly in Drop, in reverse creation order)
    allocator: ManuallyDrop<Mutex<Allocator>>,
    command_pool: vk::CommandPool,
    swapchain_loader: khr::Swapchain,
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    surface_loader: khr::Surface,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    instance: ash::Instance,
    _entry: Entry,

    // Queue handles
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    transfer_queue: vk::Queue,

    properties: vk::PhysicalDeviceProperties,
}

impl VulkanDevice {
    /// Create Vulkan device
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `config` - Validation, device requirements and feature toggles
    /// * `surface` - Platform surface source
    /// * `locks` - Lock pool shared with anything else touching the device
    pub fn new(
        app_name: &str,
        config: &Config,
        surface: &dyn SurfaceProvider,
        locks: Arc<LockPool>,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);
        let enable_validation = config.debug.validation_layers;

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }?;

        // Step 2: Create instance
        let instance = Self::create_instance(&entry, app_name, enable_validation, surface)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Create the surface
        let surface_loader = khr::Surface::new(&entry, &instance);
        let surface = surface.create_surface(&entry, &instance)?;

        // Step 5: Pick physical device (GPU)
        let requirements = DeviceRequirements::from_config(&config.device);
        let selected = selection::select_physical_device(&instance, &surface_loader, surface, &requirements)?;
        let families = selected.queue_families;
        for family in families.unique() {
            locks.register_queue_family(family);
        }

        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(selected.properties.api_version),
            vk::api_version_minor(selected.properties.api_version),
            vk::api_version_patch(selected.properties.api_version)
        );

        // Step 6: Create logical device
        let device = Self::create_logical_device(
            &instance,
            selected.physical_device,
            &families,
            &requirements,
            &selected.features,
        )?;
        let (graphics_queue, present_queue, transfer_queue) = unsafe {
            (
                device.get_device_queue(families.graphics, 0),
                device.get_device_queue(families.present, 0),
                device.get_device_queue(families.transfer, 0),
            )
        };

        // Step 7: Graphics command pool, buffers individually resettable
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(families.graphics)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(vk_err("vkCreateCommandPool"))?;

        // Step 8: Create memory allocator
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device: selected.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        let swapchain_loader = khr::Swapchain::new(&instance, &device);

        let limits = &selected.properties.limits;
        let info = DeviceInfo {
            name: selected.name,
            queue_families: families,
            depth_format: selected.depth_format,
            depth_channel_count: selected.depth_channel_count,
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            max_push_constants_size: limits.max_push_constants_size,
            max_sampler_anisotropy: limits.max_sampler_anisotropy,
            supports_device_local_host_visible: selected.device_local_host_visible,
        };
        log::info!(
            "Device ready: depth {:?}, UBO alignment {}, device-local host-visible memory: {}",
            info.depth_format,
            info.min_uniform_buffer_offset_alignment,
            info.supports_device_local_host_visible
        );

        Ok(Arc::new(Self {
            info,
            locks,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            command_pool,
            swapchain_loader,
            device,
            physical_device: selected.physical_device,
            surface,
            surface_loader,
            debug_utils,
            instance,
            _entry: entry,
            graphics_queue,
            present_queue,
            transfer_queue,
            properties: selected.properties,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        surface: &dyn SurfaceProvider,
    ) -> Result<ash::Instance> {
        let app_name_cstr =
            CString::new(app_name).map_err(|_| Error::InvalidState("application name contains NUL".to_string()))?;
        let engine_name = c"ferrous-frame";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        // Required extensions: surface ones, plus debug utils when validating
        let mut required: Vec<&CStr> = surface.required_extensions()?;
        if enable_validation {
            required.push(DebugUtils::name());
        }
        let available = entry
            .enumerate_instance_extension_properties(None)
            .map_err(vk_err("vkEnumerateInstanceExtensionProperties"))?;
        for name in &required {
            let found = available
                .iter()
                .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == *name);
            if !found {
                return Err(Error::MissingExtension(name.to_string_lossy().into_owned()));
            }
        }
        let extensions: Vec<*const std::ffi::c_char> = required.iter().map(|name| name.as_ptr()).collect();

        // Validation layers
        let layer_names = if enable_validation {
            let layers = entry
                .enumerate_instance_layer_properties()
                .map_err(vk_err("vkEnumerateInstanceLayerProperties"))?;
            let found = layers
                .iter()
                .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);
            if !found {
                return Err(Error::MissingLayer(VALIDATION_LAYER.to_string_lossy().into_owned()));
            }
            log::info!("Validation layers enabled");
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        unsafe { entry.create_instance(&create_info, None) }.map_err(vk_err("vkCreateInstance"))
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .map_err(vk_err("vkCreateDebugUtilsMessengerEXT"))?;

        Ok((debug_utils, messenger))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: &QueueFamilies,
        requirements: &DeviceRequirements,
        supported: &vk::PhysicalDeviceFeatures,
    ) -> Result<ash::Device> {
        // One queue from each distinct family
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extension_names: Vec<CString> = requirements
            .extension_names()
            .into_iter()
            .map(|name| CString::new(name).map_err(|_| Error::MissingExtension("name contains NUL".to_string())))
            .collect::<Result<_>>()?;
        let extensions: Vec<*const std::ffi::c_char> = extension_names.iter().map(|name| name.as_ptr()).collect();

        let features = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: if requirements.sampler_anisotropy { vk::TRUE } else { vk::FALSE },
            // Wireframe pipelines, when the GPU can do them
            fill_mode_non_solid: supported.fill_mode_non_solid,
            ..Default::default()
        };

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        unsafe { instance.create_device(physical_device, &create_info, None) }.map_err(vk_err("vkCreateDevice"))
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn lock_pool(&self) -> &Arc<LockPool> {
        &self.locks
    }

    fn queue(&self, role: QueueRole) -> vk::Queue {
        match role {
            QueueRole::Graphics => self.graphics_queue,
            QueueRole::Present => self.present_queue,
            QueueRole::Transfer => self.transfer_queue,
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        let idle = self.locks.with(LockGroup::Device, || {
            self.locks
                .with_all_queues(|| unsafe { self.device.device_wait_idle() })
        });
        if let Err(e) = idle {
            log::warn!("vkDeviceWaitIdle failed during teardown: {:?}", e);
        }

        // Cleanup in reverse order
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            // The allocator frees its memory blocks through the device
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::info!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
