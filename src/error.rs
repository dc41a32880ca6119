//! Library error type.
//!
//! Native failures never leave the crate as raw `vk::Result` values: they are
//! rendered into their textual result code first, so callers can log or
//! display them without knowing the native API.

use ash::vk;
use thiserror::Error;

/// Errors produced by the backend.
#[derive(Error, Debug)]
pub enum Error {
    /// A native call returned a failure code.
    #[error("{call} failed: {}", describe(.code))]
    Vulkan { call: &'static str, code: vk::Result },

    /// The logical device was lost. Always fatal to the frame loop.
    #[error("device lost during {call}")]
    DeviceLost { call: &'static str },

    /// Failed to load the Vulkan library
    #[error("failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("allocator error: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    #[error("required extension not available: {0}")]
    MissingExtension(String),

    #[error("required layer not available: {0}")]
    MissingLayer(String),

    /// No physical device satisfies the requirements
    #[error("no physical device meets the renderer requirements")]
    NoSuitableDevice,

    #[error("surface error: {0}")]
    Surface(String),

    /// A bounded fence wait expired.
    #[error("fence wait timed out after {0} ns")]
    FenceTimeout(u64),

    /// A fixed-capacity table or buffer is full.
    #[error("{0} exhausted")]
    Exhausted(&'static str),

    #[error("buffer error: {0}")]
    Buffer(String),

    #[error("shader error: {0}")]
    Shader(String),

    #[error("uniform error: {0}")]
    Uniform(String),

    #[error("render pass configuration error: {0}")]
    RenderPassConfig(String),

    #[error("asset error: {0}")]
    Asset(String),

    /// A handle does not refer to a live object (stale generation or unknown slot).
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    /// An operation was called in a state that does not permit it.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Result alias for backend operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wraps a native result code, promoting device loss to its own variant.
    pub fn vulkan(call: &'static str, code: vk::Result) -> Self {
        if code == vk::Result::ERROR_DEVICE_LOST {
            Error::DeviceLost { call }
        } else {
            Error::Vulkan { call, code }
        }
    }

    pub fn is_device_lost(&self) -> bool {
        matches!(self, Error::DeviceLost { .. })
    }
}

/// Adapter for `map_err` on raw ash results.
pub(crate) fn vk_err(call: &'static str) -> impl Fn(vk::Result) -> Error {
    move |code| Error::vulkan(call, code)
}

fn describe(code: &vk::Result) -> &'static str {
    result_string(*code, true)
}

/// Textual form of a native result code.
///
/// The short form is the enumerant name; the extended form appends the
/// registry description.
pub fn result_string(code: vk::Result, extended: bool) -> &'static str {
    let (short, long) = match code {
        vk::Result::SUCCESS => ("VK_SUCCESS", "VK_SUCCESS Command successfully completed"),
        vk::Result::NOT_READY => ("VK_NOT_READY", "VK_NOT_READY A fence or query has not yet completed"),
        vk::Result::TIMEOUT => (
            "VK_TIMEOUT",
            "VK_TIMEOUT A wait operation has not completed in the specified time",
        ),
        vk::Result::EVENT_SET => ("VK_EVENT_SET", "VK_EVENT_SET An event is signaled"),
        vk::Result::EVENT_RESET => ("VK_EVENT_RESET", "VK_EVENT_RESET An event is unsignaled"),
        vk::Result::INCOMPLETE => (
            "VK_INCOMPLETE",
            "VK_INCOMPLETE A return array was too small for the result",
        ),
        vk::Result::SUBOPTIMAL_KHR => (
            "VK_SUBOPTIMAL_KHR",
            "VK_SUBOPTIMAL_KHR A swapchain no longer matches the surface properties exactly, \
             but can still be used to present to the surface successfully.",
        ),
        vk::Result::THREAD_IDLE_KHR => (
            "VK_THREAD_IDLE_KHR",
            "VK_THREAD_IDLE_KHR A deferred operation is not complete but there is currently \
             no work for this thread to do at the time of this call.",
        ),
        vk::Result::THREAD_DONE_KHR => (
            "VK_THREAD_DONE_KHR",
            "VK_THREAD_DONE_KHR A deferred operation is not complete but there is no work \
             remaining to assign to additional threads.",
        ),
        vk::Result::OPERATION_DEFERRED_KHR => (
            "VK_OPERATION_DEFERRED_KHR",
            "VK_OPERATION_DEFERRED_KHR A deferred operation was requested and at least some \
             of the work was deferred.",
        ),
        vk::Result::OPERATION_NOT_DEFERRED_KHR => (
            "VK_OPERATION_NOT_DEFERRED_KHR",
            "VK_OPERATION_NOT_DEFERRED_KHR A deferred operation was requested and no \
             operations were deferred.",
        ),
        vk::Result::PIPELINE_COMPILE_REQUIRED => (
            "VK_PIPELINE_COMPILE_REQUIRED",
            "VK_PIPELINE_COMPILE_REQUIRED A requested pipeline creation would have required \
             compilation, but the application requested compilation to not be performed.",
        ),
        vk::Result::ERROR_OUT_OF_HOST_MEMORY => (
            "VK_ERROR_OUT_OF_HOST_MEMORY",
            "VK_ERROR_OUT_OF_HOST_MEMORY A host memory allocation has failed.",
        ),
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => (
            "VK_ERROR_OUT_OF_DEVICE_MEMORY",
            "VK_ERROR_OUT_OF_DEVICE_MEMORY A device memory allocation has failed.",
        ),
        vk::Result::ERROR_INITIALIZATION_FAILED => (
            "VK_ERROR_INITIALIZATION_FAILED",
            "VK_ERROR_INITIALIZATION_FAILED Initialization of an object could not be completed \
             for implementation-specific reasons.",
        ),
        vk::Result::ERROR_DEVICE_LOST => (
            "VK_ERROR_DEVICE_LOST",
            "VK_ERROR_DEVICE_LOST The logical or physical device has been lost.",
        ),
        vk::Result::ERROR_MEMORY_MAP_FAILED => (
            "VK_ERROR_MEMORY_MAP_FAILED",
            "VK_ERROR_MEMORY_MAP_FAILED Mapping of a memory object has failed.",
        ),
        vk::Result::ERROR_LAYER_NOT_PRESENT => (
            "VK_ERROR_LAYER_NOT_PRESENT",
            "VK_ERROR_LAYER_NOT_PRESENT A requested layer is not present or could not be loaded.",
        ),
        vk::Result::ERROR_EXTENSION_NOT_PRESENT => (
            "VK_ERROR_EXTENSION_NOT_PRESENT",
            "VK_ERROR_EXTENSION_NOT_PRESENT A requested extension is not supported.",
        ),
        vk::Result::ERROR_FEATURE_NOT_PRESENT => (
            "VK_ERROR_FEATURE_NOT_PRESENT",
            "VK_ERROR_FEATURE_NOT_PRESENT A requested feature is not supported.",
        ),
        vk::Result::ERROR_INCOMPATIBLE_DRIVER => (
            "VK_ERROR_INCOMPATIBLE_DRIVER",
            "VK_ERROR_INCOMPATIBLE_DRIVER The requested version of Vulkan is not supported by \
             the driver or is otherwise incompatible for implementation-specific reasons.",
        ),
        vk::Result::ERROR_TOO_MANY_OBJECTS => (
            "VK_ERROR_TOO_MANY_OBJECTS",
            "VK_ERROR_TOO_MANY_OBJECTS Too many objects of the type have already been created.",
        ),
        vk::Result::ERROR_FORMAT_NOT_SUPPORTED => (
            "VK_ERROR_FORMAT_NOT_SUPPORTED",
            "VK_ERROR_FORMAT_NOT_SUPPORTED A requested format is not supported on this device.",
        ),
        vk::Result::ERROR_FRAGMENTED_POOL => (
            "VK_ERROR_FRAGMENTED_POOL",
            "VK_ERROR_FRAGMENTED_POOL A pool allocation has failed due to fragmentation of the \
             pool's memory.",
        ),
        vk::Result::ERROR_SURFACE_LOST_KHR => (
            "VK_ERROR_SURFACE_LOST_KHR",
            "VK_ERROR_SURFACE_LOST_KHR A surface is no longer available.",
        ),
        vk::Result::ERROR_NATIVE_WINDOW_IN_USE_KHR => (
            "VK_ERROR_NATIVE_WINDOW_IN_USE_KHR",
            "VK_ERROR_NATIVE_WINDOW_IN_USE_KHR The requested window is already in use by Vulkan \
             or another API in a manner which prevents it from being used again.",
        ),
        vk::Result::ERROR_OUT_OF_DATE_KHR => (
            "VK_ERROR_OUT_OF_DATE_KHR",
            "VK_ERROR_OUT_OF_DATE_KHR A surface has changed in such a way that it is no longer \
             compatible with the swapchain, and further presentation requests using the \
             swapchain will fail.",
        ),
        vk::Result::ERROR_INCOMPATIBLE_DISPLAY_KHR => (
            "VK_ERROR_INCOMPATIBLE_DISPLAY_KHR",
            "VK_ERROR_INCOMPATIBLE_DISPLAY_KHR The display used by a swapchain does not use the \
             same presentable image layout, or is incompatible in a way that prevents sharing \
             an image.",
        ),
        vk::Result::ERROR_INVALID_SHADER_NV => (
            "VK_ERROR_INVALID_SHADER_NV",
            "VK_ERROR_INVALID_SHADER_NV One or more shaders failed to compile or link.",
        ),
        vk::Result::ERROR_OUT_OF_POOL_MEMORY => (
            "VK_ERROR_OUT_OF_POOL_MEMORY",
            "VK_ERROR_OUT_OF_POOL_MEMORY A pool memory allocation has failed.",
        ),
        vk::Result::ERROR_INVALID_EXTERNAL_HANDLE => (
            "VK_ERROR_INVALID_EXTERNAL_HANDLE",
            "VK_ERROR_INVALID_EXTERNAL_HANDLE An external handle is not a valid handle of the \
             specified type.",
        ),
        vk::Result::ERROR_FRAGMENTATION => (
            "VK_ERROR_FRAGMENTATION",
            "VK_ERROR_FRAGMENTATION A descriptor pool creation has failed due to fragmentation.",
        ),
        vk::Result::ERROR_INVALID_OPAQUE_CAPTURE_ADDRESS => (
            "VK_ERROR_INVALID_OPAQUE_CAPTURE_ADDRESS",
            "VK_ERROR_INVALID_OPAQUE_CAPTURE_ADDRESS A buffer creation or memory allocation \
             failed because the requested address is not available.",
        ),
        vk::Result::ERROR_FULL_SCREEN_EXCLUSIVE_MODE_LOST_EXT => (
            "VK_ERROR_FULL_SCREEN_EXCLUSIVE_MODE_LOST_EXT",
            "VK_ERROR_FULL_SCREEN_EXCLUSIVE_MODE_LOST_EXT An operation on a swapchain created \
             with application controlled full-screen access lost exclusive full-screen access.",
        ),
        vk::Result::ERROR_UNKNOWN => (
            "VK_ERROR_UNKNOWN",
            "VK_ERROR_UNKNOWN An unknown error has occurred; either the application has provided \
             invalid input, or an implementation failure has occurred.",
        ),
        _ => (
            "VK_RESULT_UNRECOGNIZED",
            "VK_RESULT_UNRECOGNIZED The driver returned a result code this build does not know",
        ),
    };
    if extended {
        long
    } else {
        short
    }
}

/// Whether a native result code denotes success (including partial success).
pub fn result_is_success(code: vk::Result) -> bool {
    code.as_raw() >= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_extended_strings() {
        assert_eq!(
            result_string(vk::Result::ERROR_OUT_OF_DATE_KHR, false),
            "VK_ERROR_OUT_OF_DATE_KHR"
        );
        assert!(result_string(vk::Result::ERROR_OUT_OF_DATE_KHR, true)
            .starts_with("VK_ERROR_OUT_OF_DATE_KHR A surface has changed"));
        assert_eq!(result_string(vk::Result::from_raw(-999_999), false), "VK_RESULT_UNRECOGNIZED");
    }

    #[test]
    fn device_lost_is_promoted() {
        let err = Error::vulkan("vkQueueSubmit", vk::Result::ERROR_DEVICE_LOST);
        assert!(err.is_device_lost());

        let err = Error::vulkan("vkCreateBuffer", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert!(!err.is_device_lost());
        assert!(err.to_string().contains("VK_ERROR_OUT_OF_DEVICE_MEMORY"));
    }

    #[test]
    fn success_classification() {
        assert!(result_is_success(vk::Result::SUBOPTIMAL_KHR));
        assert!(result_is_success(vk::Result::TIMEOUT));
        assert!(!result_is_success(vk::Result::ERROR_SURFACE_LOST_KHR));
    }
}
