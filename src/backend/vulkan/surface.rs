// Surface providers
//
// The backend never opens windows. The platform layer hands over something
// that names the instance extensions it needs and can create a surface.

use ash::{vk, Entry, Instance};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;

use crate::error::{result_string, Error, Result};

/// Source of the drawable surface.
pub trait SurfaceProvider {
    /// Instance extensions the surface needs, e.g. `VK_KHR_surface` plus the platform one.
    fn required_extensions(&self) -> Result<Vec<&'static CStr>>;

    fn create_surface(&self, entry: &Entry, instance: &Instance) -> Result<vk::SurfaceKHR>;
}

/// Raw window and display handles, resolved through ash-window.
pub struct RawWindowSurface {
    display: RawDisplayHandle,
    window: RawWindowHandle,
}

impl RawWindowSurface {
    pub fn new(display: RawDisplayHandle, window: RawWindowHandle) -> Self {
        Self { display, window }
    }

    pub fn from_window<W: HasRawDisplayHandle + HasRawWindowHandle>(window: &W) -> Self {
        Self::new(window.raw_display_handle(), window.raw_window_handle())
    }
}

impl SurfaceProvider for RawWindowSurface {
    fn required_extensions(&self) -> Result<Vec<&'static CStr>> {
        let names = ash_window::enumerate_required_extensions(self.display)
            .map_err(|code| Error::Surface(format!("unsupported platform: {}", result_string(code, false))))?;
        // SAFETY: ash-window hands out pointers to static, nul-terminated names
        Ok(names.iter().map(|&name| unsafe { CStr::from_ptr(name) }).collect())
    }

    fn create_surface(&self, entry: &Entry, instance: &Instance) -> Result<vk::SurfaceKHR> {
        // SAFETY: the handles come from a live window that outlives the device
        unsafe { ash_window::create_surface(entry, instance, self.display, self.window, None) }
            .map_err(|code| Error::Surface(result_string(code, true).to_string()))
    }
}
