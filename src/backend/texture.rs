// Textures and texture maps
//
// Sampled RGBA8 images uploaded through a staging buffer, a generational
// registry for them, and the sampler state a texture map carries.

use ash::vk;
use std::sync::Arc;

use super::buffer::{BufferKind, RenderBuffer};
use super::command::CommandBuffer;
use super::gpu::{GpuDevice, ImageDesc, QueueRole, SamplerDesc};
use crate::error::{Error, Result};
use crate::slot::{Handle, SlotTable};

const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
const CHANNEL_COUNT: u8 = 4;
const MAX_TEXTURES: usize = 1024;
const DEFAULT_TEXTURE_DIM: u32 = 256;
const DEFAULT_TILE: u32 = 16;

/// Tag type for texture handles.
pub enum TextureSlot {}

pub type TextureHandle = Handle<TextureSlot>;

pub struct Texture<D: GpuDevice> {
    image: D::Image,
    width: u32,
    height: u32,
    has_transparency: bool,
    writeable: bool,
    /// Bumped whenever the image contents or the image itself change.
    generation: u32,
    device: Arc<D>,
}

impl<D: GpuDevice> Texture<D> {
    fn allocate_image(device: &D, width: u32, height: u32) -> Result<D::Image> {
        device.create_image(&ImageDesc {
            width,
            height,
            format: TEXTURE_FORMAT,
            usage: vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::COLOR_ATTACHMENT,
            aspect: vk::ImageAspectFlags::COLOR,
        })
    }

    /// Creates a texture and uploads `pixels` (tightly packed RGBA8).
    pub fn new(
        device: Arc<D>,
        width: u32,
        height: u32,
        channels: u8,
        pixels: &[u8],
        has_transparency: bool,
    ) -> Result<Self> {
        if channels != CHANNEL_COUNT {
            return Err(Error::InvalidState(format!(
                "textures must have {} channels, got {}",
                CHANNEL_COUNT, channels
            )));
        }
        let image = Self::allocate_image(&device, width, height)?;
        let texture = Self {
            image,
            width,
            height,
            has_transparency,
            writeable: false,
            generation: 0,
            device,
        };
        texture.upload(pixels, vk::ImageLayout::UNDEFINED)?;
        Ok(texture)
    }

    /// Creates a texture with undefined contents that may be written later.
    pub fn new_writeable(device: Arc<D>, width: u32, height: u32, channels: u8, has_transparency: bool) -> Result<Self> {
        if channels != CHANNEL_COUNT {
            return Err(Error::InvalidState(format!(
                "textures must have {} channels, got {}",
                CHANNEL_COUNT, channels
            )));
        }
        let image = Self::allocate_image(&device, width, height)?;
        let texture = Self {
            image,
            width,
            height,
            has_transparency,
            writeable: true,
            generation: 0,
            device,
        };
        texture.transition_to_sampled(vk::ImageLayout::UNDEFINED)?;
        Ok(texture)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn has_transparency(&self) -> bool {
        self.has_transparency
    }

    pub fn is_writeable(&self) -> bool {
        self.writeable
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn byte_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * CHANNEL_COUNT as u64
    }

    pub fn view(&self) -> vk::ImageView {
        self.device.image_view(&self.image)
    }

    /// Replaces the whole image contents. Handles stay valid; descriptors
    /// notice the change through [`Texture::generation`].
    pub fn write(&mut self, pixels: &[u8]) -> Result<()> {
        self.upload(pixels, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)?;
        self.generation = self.generation.wrapping_add(1);
        Ok(())
    }

    /// Recreates the image at a new size. Contents are discarded.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        let fresh = Self::allocate_image(&self.device, width, height)?;
        let mut old = std::mem::replace(&mut self.image, fresh);
        self.device.destroy_image(&mut old);
        self.width = width;
        self.height = height;
        self.generation = self.generation.wrapping_add(1);
        self.transition_to_sampled(vk::ImageLayout::UNDEFINED)
    }

    fn upload(&self, pixels: &[u8], current: vk::ImageLayout) -> Result<()> {
        if pixels.len() as u64 != self.byte_size() {
            return Err(Error::Buffer(format!(
                "texture of {}x{} needs {} bytes, got {}",
                self.width,
                self.height,
                self.byte_size(),
                pixels.len()
            )));
        }

        let staging = RenderBuffer::new(self.device.clone(), BufferKind::Staging, self.byte_size(), false)?;
        staging.load_range(0, pixels)?;

        let cmd = CommandBuffer::allocate_and_begin_single_use(self.device.clone())?;
        self.device
            .cmd_transition_image(cmd.handle(), &self.image, current, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
        self.device
            .cmd_copy_buffer_to_image(cmd.handle(), staging.raw(), &self.image, self.width, self.height);
        self.device.cmd_transition_image(
            cmd.handle(),
            &self.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;
        cmd.end_single_use(QueueRole::Graphics)
    }

    fn transition_to_sampled(&self, current: vk::ImageLayout) -> Result<()> {
        let cmd = CommandBuffer::allocate_and_begin_single_use(self.device.clone())?;
        self.device.cmd_transition_image(
            cmd.handle(),
            &self.image,
            current,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;
        cmd.end_single_use(QueueRole::Graphics)
    }
}

impl<D: GpuDevice> Drop for Texture<D> {
    fn drop(&mut self) {
        self.device.destroy_image(&mut self.image);
    }
}

/// A texture reference plus the sampler state used to read it.
#[derive(Debug, Clone)]
pub struct TextureMap {
    pub texture: Option<TextureHandle>,
    pub minify: vk::Filter,
    pub magnify: vk::Filter,
    pub repeat_u: vk::SamplerAddressMode,
    pub repeat_v: vk::SamplerAddressMode,
    pub repeat_w: vk::SamplerAddressMode,
    sampler: vk::Sampler,
}

impl TextureMap {
    pub fn new(texture: Option<TextureHandle>) -> Self {
        Self {
            texture,
            minify: vk::Filter::LINEAR,
            magnify: vk::Filter::LINEAR,
            repeat_u: vk::SamplerAddressMode::REPEAT,
            repeat_v: vk::SamplerAddressMode::REPEAT,
            repeat_w: vk::SamplerAddressMode::REPEAT,
            sampler: vk::Sampler::null(),
        }
    }

    /// Null until the map's resources are acquired.
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    fn sampler_desc(&self, max_anisotropy: Option<f32>) -> SamplerDesc {
        SamplerDesc {
            min_filter: self.minify,
            mag_filter: self.magnify,
            address_u: self.repeat_u,
            address_v: self.repeat_v,
            address_w: self.repeat_w,
            max_anisotropy,
        }
    }
}

/// RGBA8 checkerboard of white and blue tiles.
pub fn checkerboard_pixels(dim: u32, tile: u32) -> Vec<u8> {
    let mut pixels = Vec::with_capacity((dim * dim * CHANNEL_COUNT as u32) as usize);
    for row in 0..dim {
        for col in 0..dim {
            let white = ((row / tile) + (col / tile)) % 2 == 0;
            if white {
                pixels.extend_from_slice(&[255, 255, 255, 255]);
            } else {
                pixels.extend_from_slice(&[0, 0, 255, 255]);
            }
        }
    }
    pixels
}

/// Every live texture, a default texture for missing references and a default sampler.
pub struct TextureRegistry<D: GpuDevice> {
    table: SlotTable<Texture<D>>,
    default_texture: TextureHandle,
    default_sampler: vk::Sampler,
    max_anisotropy: Option<f32>,
    device: Arc<D>,
}

impl<D: GpuDevice> TextureRegistry<D> {
    pub fn new(device: Arc<D>, max_anisotropy: Option<f32>) -> Result<Self> {
        let mut table = SlotTable::with_capacity(MAX_TEXTURES);
        let pixels = checkerboard_pixels(DEFAULT_TEXTURE_DIM, DEFAULT_TILE);
        let texture = Texture::new(
            device.clone(),
            DEFAULT_TEXTURE_DIM,
            DEFAULT_TEXTURE_DIM,
            CHANNEL_COUNT,
            &pixels,
            false,
        )?;
        let default_texture = table
            .insert(texture)
            .map_err(|_| Error::Exhausted("texture table"))?
            .cast();

        let default_sampler = device.create_sampler(&TextureMap::new(None).sampler_desc(max_anisotropy))?;
        log::debug!("Created default texture and sampler");

        Ok(Self {
            table,
            default_texture,
            default_sampler,
            max_anisotropy,
            device,
        })
    }

    pub fn default_texture(&self) -> TextureHandle {
        self.default_texture
    }

    pub fn default_sampler(&self) -> vk::Sampler {
        self.default_sampler
    }

    pub fn get(&self, handle: TextureHandle) -> Option<&Texture<D>> {
        self.table.get(handle.cast())
    }

    pub fn insert(&mut self, texture: Texture<D>) -> Result<TextureHandle> {
        let handle = self
            .table
            .insert(texture)
            .map_err(|_| Error::Exhausted("texture table"))?;
        Ok(handle.cast())
    }

    pub fn get_mut(&mut self, handle: TextureHandle) -> Result<&mut Texture<D>> {
        self.table
            .get_mut(handle.cast())
            .ok_or_else(|| Error::InvalidHandle(format!("texture {:?}", handle)))
    }

    pub fn remove(&mut self, handle: TextureHandle) -> Result<()> {
        if handle == self.default_texture {
            return Err(Error::InvalidState("the default texture cannot be destroyed".to_string()));
        }
        self.table
            .remove(handle.cast())
            .map(drop)
            .ok_or_else(|| Error::InvalidHandle(format!("texture {:?}", handle)))
    }

    /// The live texture `handle` names, or the default texture.
    pub fn resolve(&self, handle: Option<TextureHandle>) -> Result<(TextureHandle, &Texture<D>)> {
        if let Some(handle) = handle {
            if let Some(texture) = self.table.get(handle.cast()) {
                return Ok((handle, texture));
            }
            log::warn!("Texture {:?} is stale, using the default texture", handle);
        }
        let default = self.default_texture;
        self.table
            .get(default.cast())
            .map(|texture| (default, texture))
            .ok_or_else(|| Error::InvalidState("default texture missing".to_string()))
    }

    pub fn acquire_map_resources(&self, map: &mut TextureMap) -> Result<()> {
        if map.sampler != vk::Sampler::null() {
            self.device.destroy_sampler(map.sampler);
        }
        map.sampler = self.device.create_sampler(&map.sampler_desc(self.max_anisotropy))?;
        Ok(())
    }

    pub fn release_map_resources(&self, map: &mut TextureMap) {
        if map.sampler != vk::Sampler::null() {
            self.device.destroy_sampler(map.sampler);
            map.sampler = vk::Sampler::null();
        }
    }
}

impl<D: GpuDevice> Drop for TextureRegistry<D> {
    fn drop(&mut self) {
        self.device.destroy_sampler(self.default_sampler);
        // Textures destroy their images when the table drops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessDevice;

    #[test]
    fn checkerboard_alternates_tiles() {
        let pixels = checkerboard_pixels(4, 2);
        assert_eq!(pixels.len(), 4 * 4 * 4);
        // (0,0) white, (0,2) blue, (2,2) white
        assert_eq!(&pixels[0..4], &[255, 255, 255, 255]);
        assert_eq!(&pixels[8..12], &[0, 0, 255, 255]);
        let at = |row: usize, col: usize| &pixels[(row * 4 + col) * 4..(row * 4 + col) * 4 + 4];
        assert_eq!(at(2, 2), &[255, 255, 255, 255]);
        assert_eq!(at(2, 0), &[0, 0, 255, 255]);
    }

    #[test]
    fn maps_resolve_to_written_textures() {
        let device = Arc::new(HeadlessDevice::new());
        let mut registry = TextureRegistry::new(device.clone(), None).unwrap();
        let texture = Texture::new_writeable(device.clone(), 4, 4, CHANNEL_COUNT, false).unwrap();
        let handle = registry.insert(texture).unwrap();
        let map = TextureMap::new(Some(handle));

        registry.get_mut(handle).unwrap().write(&[0x40; 64]).unwrap();
        let (resolved, texture) = registry.resolve(map.texture).unwrap();
        assert_eq!(resolved, handle);
        assert_ne!(resolved, registry.default_texture());
        assert_eq!(texture.generation(), 1);

        registry.remove(handle).unwrap();
        let (resolved, _) = registry.resolve(map.texture).unwrap();
        assert_eq!(resolved, registry.default_texture());
    }

    #[test]
    fn texture_map_defaults() {
        let map = TextureMap::new(None);
        assert_eq!(map.sampler(), vk::Sampler::null());
        let desc = map.sampler_desc(Some(16.0));
        assert_eq!(desc.min_filter, vk::Filter::LINEAR);
        assert_eq!(desc.address_u, vk::SamplerAddressMode::REPEAT);
        assert_eq!(desc.max_anisotropy, Some(16.0));
    }
}
