// Command buffers
//
// One primary command buffer per swap image, plus short-lived single-use
// buffers for transfers. State is tracked on the CPU side so illegal
// transitions are caught before they reach the driver.

use ash::vk;
use std::sync::Arc;

use super::gpu::{GpuDevice, QueueRole, Submission};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Ready,
    Recording,
    InRenderPass,
    RecordingEnded,
    Submitted,
    NotAllocated,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BeginFlags {
    pub single_use: bool,
    pub renderpass_continue: bool,
    pub simultaneous_use: bool,
}

impl BeginFlags {
    fn usage(self) -> vk::CommandBufferUsageFlags {
        let mut flags = vk::CommandBufferUsageFlags::empty();
        if self.single_use {
            flags |= vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT;
        }
        if self.renderpass_continue {
            flags |= vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE;
        }
        if self.simultaneous_use {
            flags |= vk::CommandBufferUsageFlags::SIMULTANEOUS_USE;
        }
        flags
    }
}

pub struct CommandBuffer<D: GpuDevice> {
    device: Arc<D>,
    handle: vk::CommandBuffer,
    state: CommandBufferState,
}

impl<D: GpuDevice> CommandBuffer<D> {
    pub fn allocate(device: Arc<D>, primary: bool) -> Result<Self> {
        let handle = device.allocate_command_buffer(primary)?;
        Ok(Self {
            device,
            handle,
            state: CommandBufferState::Ready,
        })
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        matches!(
            self.state,
            CommandBufferState::Recording | CommandBufferState::InRenderPass
        )
    }

    fn require(&self, allowed: &[CommandBufferState], op: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "command buffer cannot {} while {:?}",
                op, self.state
            )))
        }
    }

    pub fn begin(&mut self, flags: BeginFlags) -> Result<()> {
        self.require(&[CommandBufferState::Ready], "begin")?;
        self.device.begin_command_buffer(self.handle, flags.usage())?;
        self.state = CommandBufferState::Recording;
        Ok(())
    }

    pub fn end(&mut self) -> Result<()> {
        self.require(&[CommandBufferState::Recording], "end")?;
        self.device.end_command_buffer(self.handle)?;
        self.state = CommandBufferState::RecordingEnded;
        Ok(())
    }

    pub fn mark_submitted(&mut self) -> Result<()> {
        self.require(&[CommandBufferState::RecordingEnded], "be submitted")?;
        self.state = CommandBufferState::Submitted;
        Ok(())
    }

    /// Returns the buffer to `Ready`. The caller guarantees the GPU is done with it.
    pub fn reset(&mut self) -> Result<()> {
        self.require(
            &[
                CommandBufferState::Ready,
                CommandBufferState::Recording,
                CommandBufferState::RecordingEnded,
                CommandBufferState::Submitted,
            ],
            "reset",
        )?;
        self.device.reset_command_buffer(self.handle)?;
        self.state = CommandBufferState::Ready;
        Ok(())
    }

    pub fn begin_render_pass(
        &mut self,
        pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    ) -> Result<()> {
        self.require(&[CommandBufferState::Recording], "begin a render pass")?;
        self.device
            .cmd_begin_render_pass(self.handle, pass, framebuffer, area, clear_values);
        self.state = CommandBufferState::InRenderPass;
        Ok(())
    }

    pub fn end_render_pass(&mut self) -> Result<()> {
        self.require(&[CommandBufferState::InRenderPass], "end a render pass")?;
        self.device.cmd_end_render_pass(self.handle);
        self.state = CommandBufferState::Recording;
        Ok(())
    }

    /// Allocates a primary buffer and begins it for one submission.
    pub fn allocate_and_begin_single_use(device: Arc<D>) -> Result<Self> {
        let mut cmd = Self::allocate(device, true)?;
        cmd.begin(BeginFlags {
            single_use: true,
            ..Default::default()
        })?;
        Ok(cmd)
    }

    /// Ends, submits and waits for the queue to go idle, then frees the buffer.
    pub fn end_single_use(mut self, queue: QueueRole) -> Result<()> {
        self.end()?;
        self.device.queue_submit(
            queue,
            &Submission {
                command_buffer: self.handle,
                wait: None,
                signal: None,
                fence: None,
            },
        )?;
        self.mark_submitted()?;
        self.device.queue_wait_idle(queue)?;
        self.state = CommandBufferState::Ready;
        Ok(())
    }
}

impl<D: GpuDevice> Drop for CommandBuffer<D> {
    fn drop(&mut self) {
        if self.state != CommandBufferState::NotAllocated {
            self.device.free_command_buffer(self.handle);
            self.state = CommandBufferState::NotAllocated;
        }
    }
}
