// Headless device
//
// A CPU-only implementation of the device seam. GPU work "finishes" lazily:
// a submission stays pending until someone waits on its fence or idles the
// queue. The device records every submission and recorded command, counts
// live objects per kind, and notes synchronization mistakes as violations
// instead of failing, so tests can assert on them afterwards.

use ash::vk::{self, Handle as _};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use super::buffer::BufferKind;
use super::gpu::{
    AcquireOutcome, DescriptorWrite, DeviceInfo, GpuDevice, ImageDesc, LayoutBinding, PipelineDesc,
    PresentOutcome, QueueFamilies, QueueRole, RenderPassDesc, SamplerDesc, Submission, SurfaceSupport,
    SwapchainDesc,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    Signaled,
    Unsignaled,
    /// Submitted and not yet observed complete.
    Pending,
}

/// Native object categories counted by the headless device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Swapchain,
    ImageView,
    Image,
    Buffer,
    Fence,
    Semaphore,
    CommandBuffer,
    Sampler,
    RenderPass,
    Framebuffer,
    ShaderModule,
    DescriptorSetLayout,
    DescriptorPool,
    DescriptorSet,
    PipelineLayout,
    Pipeline,
}

/// A misuse of the synchronization protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    FenceResetWhilePending(vk::Fence),
    FenceSubmittedWhileBusy(vk::Fence),
    CommandBufferResetWhilePending(vk::CommandBuffer),
    CommandBufferBegunWhilePending(vk::CommandBuffer),
    /// Acquire asked to signal a semaphore that is already signaled.
    SemaphoreAlreadySignaled(vk::Semaphore),
    /// Submit or present waited on a semaphore nothing signaled.
    SemaphoreNotSignaled(vk::Semaphore),
    ImageLayoutMismatch {
        expected: vk::ImageLayout,
        actual: vk::ImageLayout,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub queue: QueueRole,
    pub command_buffer: vk::CommandBuffer,
    pub fence: Option<vk::Fence>,
    pub wait: Option<vk::Semaphore>,
    pub signal: Option<vk::Semaphore>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    SetViewport { width: f32, height: f32 },
    SetScissor { width: u32, height: u32 },
    BeginRenderPass { pass: vk::RenderPass, framebuffer: vk::Framebuffer },
    EndRenderPass,
    BindPipeline(vk::Pipeline),
    BindDescriptorSet { set_index: u32, set: vk::DescriptorSet },
    PushConstants { offset: u32, size: usize },
    BindVertexBuffer { offset: u64 },
    BindIndexBuffer { offset: u64 },
    Draw { vertex_count: u32 },
    DrawIndexed { index_count: u32 },
    CopyBuffer { size: u64 },
    TransitionImage { old: vk::ImageLayout, new: vk::ImageLayout },
    CopyBufferToImage { width: u32, height: u32 },
}

/// A descriptor update, with the buffer reduced to its offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteRecord {
    UniformBuffer {
        set: vk::DescriptorSet,
        binding: u32,
        offset: u64,
    },
    ImageSamplers {
        set: vk::DescriptorSet,
        binding: u32,
        views: Vec<vk::ImageView>,
    },
}

impl WriteRecord {
    pub fn set(&self) -> vk::DescriptorSet {
        match self {
            WriteRecord::UniformBuffer { set, .. } | WriteRecord::ImageSamplers { set, .. } => *set,
        }
    }
}

pub struct HeadlessBuffer {
    id: u64,
    kind: BufferKind,
    data: Mutex<Vec<u8>>,
}

impl HeadlessBuffer {
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

pub struct HeadlessImage {
    id: u64,
    view: vk::ImageView,
    desc: ImageDesc,
    layout: Mutex<vk::ImageLayout>,
}

impl HeadlessImage {
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn layout(&self) -> vk::ImageLayout {
        *self.layout.lock()
    }
}

struct PendingWork {
    fence: Option<u64>,
    command_buffer: u64,
}

struct SwapchainState {
    image_count: u32,
    next_image: u32,
}

struct State {
    surface: SurfaceSupport,
    fences: HashMap<u64, FenceState>,
    semaphores: HashMap<u64, bool>,
    pending_command_buffers: HashMap<u64, bool>,
    pending: Vec<PendingWork>,
    swapchains: HashMap<u64, SwapchainState>,
    pool_sets: HashMap<u64, i64>,
    live: HashMap<ObjectKind, i64>,
    submissions: Vec<SubmissionRecord>,
    commands: Vec<(vk::CommandBuffer, RecordedCommand)>,
    descriptor_writes: Vec<WriteRecord>,
    violations: Vec<Violation>,
    acquire_out_of_date: u32,
    present_outcomes: VecDeque<PresentOutcome>,
    failing_buffer_creations: u32,
    stalled_fences: Vec<u64>,
    max_outstanding_per_fence: usize,
    wait_idle_count: usize,
    present_count: usize,
}

impl State {
    fn add_live(&mut self, kind: ObjectKind, delta: i64) {
        *self.live.entry(kind).or_insert(0) += delta;
    }

    fn violation(&mut self, violation: Violation) {
        log::warn!("Headless device violation: {:?}", violation);
        self.violations.push(violation);
    }

    /// Completes queued work up to and including the last submission on `fence`.
    fn complete_through(&mut self, fence: u64) {
        let Some(last) = self.pending.iter().rposition(|w| w.fence == Some(fence)) else {
            return;
        };
        let done: Vec<_> = self.pending.drain(..=last).collect();
        for work in done {
            self.finish(work);
        }
    }

    fn complete_all(&mut self) {
        let done: Vec<_> = self.pending.drain(..).collect();
        for work in done {
            self.finish(work);
        }
    }

    fn finish(&mut self, work: PendingWork) {
        self.pending_command_buffers.insert(work.command_buffer, false);
        if let Some(fence) = work.fence {
            self.fences.insert(fence, FenceState::Signaled);
        }
    }

    fn command_buffer_pending(&self, cmd: u64) -> bool {
        self.pending_command_buffers.get(&cmd).copied().unwrap_or(false)
    }

    fn record(&mut self, cmd: vk::CommandBuffer, command: RecordedCommand) {
        self.commands.push((cmd, command));
    }
}

/// Simulated GPU for tests and tooling.
pub struct HeadlessDevice {
    info: DeviceInfo,
    next_handle: AtomicU64,
    state: Mutex<State>,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        let info = DeviceInfo {
            name: "Headless".to_string(),
            queue_families: QueueFamilies {
                graphics: 0,
                present: 0,
                transfer: 1,
                compute: Some(0),
            },
            depth_format: vk::Format::D32_SFLOAT,
            depth_channel_count: 4,
            min_uniform_buffer_offset_alignment: 256,
            max_push_constants_size: 128,
            max_sampler_anisotropy: 16.0,
            supports_device_local_host_visible: false,
        };
        let surface = SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 3,
                current_extent: vk::Extent2D {
                    width: u32::MAX,
                    height: u32::MAX,
                },
                min_image_extent: vk::Extent2D { width: 1, height: 1 },
                max_image_extent: vk::Extent2D {
                    width: 4096,
                    height: 4096,
                },
                max_image_array_layers: 1,
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                ..Default::default()
            },
            formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        };

        Self {
            info,
            next_handle: AtomicU64::new(1),
            state: Mutex::new(State {
                surface,
                fences: HashMap::new(),
                semaphores: HashMap::new(),
                pending_command_buffers: HashMap::new(),
                pending: Vec::new(),
                swapchains: HashMap::new(),
                pool_sets: HashMap::new(),
                live: HashMap::new(),
                submissions: Vec::new(),
                commands: Vec::new(),
                descriptor_writes: Vec::new(),
                violations: Vec::new(),
                acquire_out_of_date: 0,
                present_outcomes: VecDeque::new(),
                failing_buffer_creations: 0,
                stalled_fences: Vec::new(),
                max_outstanding_per_fence: 0,
                wait_idle_count: 0,
                present_count: 0,
            }),
        }
    }

    pub fn with_min_uniform_alignment(mut self, alignment: u64) -> Self {
        self.info.min_uniform_buffer_offset_alignment = alignment;
        self
    }

    fn next_raw(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn new_handle<H: vk::Handle>(&self, kind: ObjectKind) -> H {
        self.state.lock().add_live(kind, 1);
        H::from_raw(self.next_raw())
    }

    fn release(&self, kind: ObjectKind) {
        self.state.lock().add_live(kind, -1);
    }

    // --- Test controls -------------------------------------------------------

    pub fn set_surface_support(&self, support: SurfaceSupport) {
        self.state.lock().surface = support;
    }

    /// Makes the surface report a fixed current extent.
    pub fn set_surface_extent(&self, width: u32, height: u32) {
        self.state.lock().surface.capabilities.current_extent = vk::Extent2D { width, height };
    }

    /// The next `count` acquires report the swapchain out of date.
    pub fn fail_next_acquires(&self, count: u32) {
        self.state.lock().acquire_out_of_date += count;
    }

    /// Queues the result of a future present.
    pub fn push_present_outcome(&self, outcome: PresentOutcome) {
        self.state.lock().present_outcomes.push_back(outcome);
    }

    pub fn fail_next_buffer_creations(&self, count: u32) {
        self.state.lock().failing_buffer_creations += count;
    }

    /// Waits on `fence` time out while it is pending, as if the GPU hung.
    pub fn stall_fence(&self, fence: vk::Fence) {
        self.state.lock().stalled_fences.push(fence.as_raw());
    }

    pub fn release_stalled_fences(&self) {
        self.state.lock().stalled_fences.clear();
    }

    // --- Inspection ----------------------------------------------------------

    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.state.lock().submissions.clone()
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.state.lock().commands.iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    pub fn descriptor_writes(&self) -> Vec<WriteRecord> {
        self.state.lock().descriptor_writes.clone()
    }

    pub fn clear_descriptor_writes(&self) {
        self.state.lock().descriptor_writes.clear();
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.state.lock().violations.clone()
    }

    pub fn live(&self, kind: ObjectKind) -> i64 {
        self.state.lock().live.get(&kind).copied().unwrap_or(0)
    }

    pub fn fence_state(&self, fence: vk::Fence) -> Option<FenceState> {
        self.state.lock().fences.get(&fence.as_raw()).copied()
    }

    /// Largest number of submissions ever pending on a single fence.
    pub fn max_outstanding_per_fence(&self) -> usize {
        self.state.lock().max_outstanding_per_fence
    }

    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn wait_idle_count(&self) -> usize {
        self.state.lock().wait_idle_count
    }

    pub fn present_count(&self) -> usize {
        self.state.lock().present_count
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn out_of_range(offset: u64, len: usize, size: usize) -> Error {
    Error::Buffer(format!("range {}+{} outside of {} bytes", offset, len, size))
}

impl GpuDevice for HeadlessDevice {
    type Buffer = HeadlessBuffer;
    type Image = HeadlessImage;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn wait_idle(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.complete_all();
        state.wait_idle_count += 1;
        Ok(())
    }

    fn surface_support(&self) -> Result<SurfaceSupport> {
        Ok(self.state.lock().surface.clone())
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<(vk::SwapchainKHR, Vec<vk::Image>)> {
        let swapchain: vk::SwapchainKHR = self.new_handle(ObjectKind::Swapchain);
        let images = (0..desc.image_count)
            .map(|_| vk::Image::from_raw(self.next_raw()))
            .collect();
        self.state.lock().swapchains.insert(
            swapchain.as_raw(),
            SwapchainState {
                image_count: desc.image_count,
                next_image: 0,
            },
        );
        Ok((swapchain, images))
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        if state.swapchains.remove(&swapchain.as_raw()).is_some() {
            state.add_live(ObjectKind::Swapchain, -1);
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<AcquireOutcome> {
        let mut state = self.state.lock();
        if state.acquire_out_of_date > 0 {
            state.acquire_out_of_date -= 1;
            return Ok(AcquireOutcome::OutOfDate);
        }

        let index = {
            let chain = state
                .swapchains
                .get_mut(&swapchain.as_raw())
                .ok_or_else(|| Error::InvalidHandle(format!("swapchain {:?}", swapchain)))?;
            let index = chain.next_image;
            chain.next_image = (chain.next_image + 1) % chain.image_count.max(1);
            index
        };

        if semaphore != vk::Semaphore::null() {
            if state.semaphores.get(&semaphore.as_raw()).copied().unwrap_or(false) {
                state.violation(Violation::SemaphoreAlreadySignaled(semaphore));
            }
            state.semaphores.insert(semaphore.as_raw(), true);
        }
        if fence != vk::Fence::null() {
            state.fences.insert(fence.as_raw(), FenceState::Signaled);
        }
        Ok(AcquireOutcome::Acquired {
            index,
            suboptimal: false,
        })
    }

    fn queue_present(
        &self,
        _swapchain: vk::SwapchainKHR,
        _image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        let mut state = self.state.lock();
        if !state.semaphores.get(&wait.as_raw()).copied().unwrap_or(false) {
            state.violation(Violation::SemaphoreNotSignaled(wait));
        }
        state.semaphores.insert(wait.as_raw(), false);
        state.present_count += 1;
        Ok(state.present_outcomes.pop_front().unwrap_or(PresentOutcome::Presented))
    }

    fn create_image_view(
        &self,
        _image: vk::Image,
        _format: vk::Format,
        _aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView> {
        Ok(self.new_handle(ObjectKind::ImageView))
    }

    fn destroy_image_view(&self, _view: vk::ImageView) {
        self.release(ObjectKind::ImageView);
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let fence: vk::Fence = self.new_handle(ObjectKind::Fence);
        let initial = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        self.state.lock().fences.insert(fence.as_raw(), initial);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.fences.remove(&fence.as_raw());
        state.add_live(ObjectKind::Fence, -1);
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> Result<bool> {
        let mut state = self.state.lock();
        match state.fences.get(&fence.as_raw()).copied() {
            Some(FenceState::Signaled) => Ok(true),
            Some(FenceState::Pending) if state.stalled_fences.contains(&fence.as_raw()) => Ok(false),
            Some(FenceState::Pending) => {
                state.complete_through(fence.as_raw());
                Ok(true)
            }
            // Nothing will ever signal it: report a timeout
            Some(FenceState::Unsignaled) => Ok(false),
            None => Err(Error::InvalidHandle(format!("fence {:?}", fence))),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.lock();
        if state.fences.get(&fence.as_raw()) == Some(&FenceState::Pending) {
            state.violation(Violation::FenceResetWhilePending(fence));
            return Ok(());
        }
        state.fences.insert(fence.as_raw(), FenceState::Unsignaled);
        Ok(())
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let semaphore: vk::Semaphore = self.new_handle(ObjectKind::Semaphore);
        self.state.lock().semaphores.insert(semaphore.as_raw(), false);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.semaphores.remove(&semaphore.as_raw());
        state.add_live(ObjectKind::Semaphore, -1);
    }

    fn allocate_command_buffer(&self, _primary: bool) -> Result<vk::CommandBuffer> {
        let cmd: vk::CommandBuffer = self.new_handle(ObjectKind::CommandBuffer);
        self.state.lock().pending_command_buffers.insert(cmd.as_raw(), false);
        Ok(cmd)
    }

    fn free_command_buffer(&self, cmd: vk::CommandBuffer) {
        let mut state = self.state.lock();
        if state.command_buffer_pending(cmd.as_raw()) {
            state.violation(Violation::CommandBufferResetWhilePending(cmd));
        }
        state.pending_command_buffers.remove(&cmd.as_raw());
        state.add_live(ObjectKind::CommandBuffer, -1);
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, _flags: vk::CommandBufferUsageFlags) -> Result<()> {
        let mut state = self.state.lock();
        if state.command_buffer_pending(cmd.as_raw()) {
            state.violation(Violation::CommandBufferBegunWhilePending(cmd));
        }
        Ok(())
    }

    fn end_command_buffer(&self, _cmd: vk::CommandBuffer) -> Result<()> {
        Ok(())
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        if state.command_buffer_pending(cmd.as_raw()) {
            state.violation(Violation::CommandBufferResetWhilePending(cmd));
        }
        Ok(())
    }

    fn queue_submit(&self, queue: QueueRole, submission: &Submission) -> Result<()> {
        let mut state = self.state.lock();

        if let Some((semaphore, _)) = submission.wait {
            if !state.semaphores.get(&semaphore.as_raw()).copied().unwrap_or(false) {
                state.violation(Violation::SemaphoreNotSignaled(semaphore));
            }
            state.semaphores.insert(semaphore.as_raw(), false);
        }

        let fence = submission.fence.filter(|f| *f != vk::Fence::null());
        if let Some(fence) = fence {
            if state.fences.get(&fence.as_raw()) != Some(&FenceState::Unsignaled) {
                state.violation(Violation::FenceSubmittedWhileBusy(fence));
            }
            state.fences.insert(fence.as_raw(), FenceState::Pending);
        }

        let cmd = submission.command_buffer.as_raw();
        state.pending_command_buffers.insert(cmd, true);
        state.pending.push(PendingWork {
            fence: fence.map(|f| f.as_raw()),
            command_buffer: cmd,
        });
        if let Some(fence) = fence {
            let outstanding = state
                .pending
                .iter()
                .filter(|w| w.fence == Some(fence.as_raw()))
                .count();
            state.max_outstanding_per_fence = state.max_outstanding_per_fence.max(outstanding);
        }

        // Signaled in submission order; later waits observe it
        if let Some(semaphore) = submission.signal {
            state.semaphores.insert(semaphore.as_raw(), true);
        }

        state.submissions.push(SubmissionRecord {
            queue,
            command_buffer: submission.command_buffer,
            fence,
            wait: submission.wait.map(|(s, _)| s),
            signal: submission.signal,
        });
        Ok(())
    }

    fn queue_wait_idle(&self, _queue: QueueRole) -> Result<()> {
        self.state.lock().complete_all();
        Ok(())
    }

    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewport: vk::Viewport) {
        self.state.lock().record(
            cmd,
            RecordedCommand::SetViewport {
                width: viewport.width,
                height: viewport.height,
            },
        );
    }

    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissor: vk::Rect2D) {
        self.state.lock().record(
            cmd,
            RecordedCommand::SetScissor {
                width: scissor.extent.width,
                height: scissor.extent.height,
            },
        );
    }

    fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        _area: vk::Rect2D,
        _clear_values: &[vk::ClearValue],
    ) {
        self.state
            .lock()
            .record(cmd, RecordedCommand::BeginRenderPass { pass, framebuffer });
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        self.state.lock().record(cmd, RecordedCommand::EndRenderPass);
    }

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.state.lock().record(cmd, RecordedCommand::BindPipeline(pipeline));
    }

    fn cmd_bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        set_index: u32,
        set: vk::DescriptorSet,
    ) {
        self.state
            .lock()
            .record(cmd, RecordedCommand::BindDescriptorSet { set_index, set });
    }

    fn cmd_push_constants(&self, cmd: vk::CommandBuffer, _layout: vk::PipelineLayout, offset: u32, data: &[u8]) {
        self.state.lock().record(
            cmd,
            RecordedCommand::PushConstants {
                offset,
                size: data.len(),
            },
        );
    }

    fn cmd_bind_vertex_buffer(&self, cmd: vk::CommandBuffer, _buffer: &HeadlessBuffer, offset: u64) {
        self.state
            .lock()
            .record(cmd, RecordedCommand::BindVertexBuffer { offset });
    }

    fn cmd_bind_index_buffer(&self, cmd: vk::CommandBuffer, _buffer: &HeadlessBuffer, offset: u64) {
        self.state
            .lock()
            .record(cmd, RecordedCommand::BindIndexBuffer { offset });
    }

    fn cmd_draw(&self, cmd: vk::CommandBuffer, vertex_count: u32) {
        self.state
            .lock()
            .record(cmd, RecordedCommand::Draw { vertex_count });
    }

    fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, index_count: u32) {
        self.state
            .lock()
            .record(cmd, RecordedCommand::DrawIndexed { index_count });
    }

    fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: &HeadlessBuffer, dst: &HeadlessBuffer, region: vk::BufferCopy) {
        let (src_at, dst_at, size) = (
            region.src_offset as usize,
            region.dst_offset as usize,
            region.size as usize,
        );
        // Copies land immediately; the fence protocol is simulated separately
        if src.id == dst.id {
            let mut data = src.data.lock();
            if src_at + size <= data.len() && dst_at + size <= data.len() {
                data.copy_within(src_at..src_at + size, dst_at);
            }
        } else {
            let from = src.data.lock();
            let mut to = dst.data.lock();
            if src_at + size <= from.len() && dst_at + size <= to.len() {
                to[dst_at..dst_at + size].copy_from_slice(&from[src_at..src_at + size]);
            }
        }
        self.state
            .lock()
            .record(cmd, RecordedCommand::CopyBuffer { size: region.size });
    }

    fn cmd_transition_image(
        &self,
        cmd: vk::CommandBuffer,
        image: &HeadlessImage,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) -> Result<()> {
        let mut layout = image.layout.lock();
        let mut state = self.state.lock();
        if old != vk::ImageLayout::UNDEFINED && old != *layout {
            state.violation(Violation::ImageLayoutMismatch {
                expected: old,
                actual: *layout,
            });
        }
        *layout = new;
        state.record(cmd, RecordedCommand::TransitionImage { old, new });
        Ok(())
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        _src: &HeadlessBuffer,
        _dst: &HeadlessImage,
        width: u32,
        height: u32,
    ) {
        self.state
            .lock()
            .record(cmd, RecordedCommand::CopyBufferToImage { width, height });
    }

    fn create_buffer(&self, kind: BufferKind, size: u64) -> Result<HeadlessBuffer> {
        {
            let mut state = self.state.lock();
            if state.failing_buffer_creations > 0 {
                state.failing_buffer_creations -= 1;
                return Err(Error::vulkan("vkCreateBuffer", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
            }
            state.add_live(ObjectKind::Buffer, 1);
        }
        Ok(HeadlessBuffer {
            id: self.next_raw(),
            kind,
            data: Mutex::new(vec![0; size as usize]),
        })
    }

    fn destroy_buffer(&self, _buffer: &mut HeadlessBuffer) {
        self.release(ObjectKind::Buffer);
    }

    fn is_host_visible(&self, buffer: &HeadlessBuffer) -> bool {
        buffer.kind.host_visible()
    }

    fn write_buffer(&self, buffer: &HeadlessBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let mut memory = buffer.data.lock();
        let start = offset as usize;
        let end = start + data.len();
        if end > memory.len() {
            return Err(out_of_range(offset, data.len(), memory.len()));
        }
        memory[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: &HeadlessBuffer, offset: u64, out: &mut [u8]) -> Result<()> {
        let memory = buffer.data.lock();
        let start = offset as usize;
        let end = start + out.len();
        if end > memory.len() {
            return Err(out_of_range(offset, out.len(), memory.len()));
        }
        out.copy_from_slice(&memory[start..end]);
        Ok(())
    }

    fn flush_buffer(&self, _buffer: &HeadlessBuffer, _offset: u64, _size: u64) -> Result<()> {
        Ok(())
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<HeadlessImage> {
        let view: vk::ImageView = self.new_handle(ObjectKind::ImageView);
        self.state.lock().add_live(ObjectKind::Image, 1);
        Ok(HeadlessImage {
            id: self.next_raw(),
            view,
            desc: *desc,
            layout: Mutex::new(vk::ImageLayout::UNDEFINED),
        })
    }

    fn destroy_image(&self, image: &mut HeadlessImage) {
        let mut state = self.state.lock();
        state.add_live(ObjectKind::ImageView, -1);
        state.add_live(ObjectKind::Image, -1);
        log::trace!("Destroyed headless image {}", image.id);
    }

    fn image_view(&self, image: &HeadlessImage) -> vk::ImageView {
        image.view
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> Result<vk::Sampler> {
        Ok(self.new_handle(ObjectKind::Sampler))
    }

    fn destroy_sampler(&self, _sampler: vk::Sampler) {
        self.release(ObjectKind::Sampler);
    }

    fn create_render_pass(&self, _desc: &RenderPassDesc) -> Result<vk::RenderPass> {
        Ok(self.new_handle(ObjectKind::RenderPass))
    }

    fn destroy_render_pass(&self, _pass: vk::RenderPass) {
        self.release(ObjectKind::RenderPass);
    }

    fn create_framebuffer(
        &self,
        _pass: vk::RenderPass,
        _attachments: &[vk::ImageView],
        _extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        Ok(self.new_handle(ObjectKind::Framebuffer))
    }

    fn destroy_framebuffer(&self, _framebuffer: vk::Framebuffer) {
        self.release(ObjectKind::Framebuffer);
    }

    fn create_shader_module(&self, code: &[u8]) -> Result<vk::ShaderModule> {
        if code.is_empty() || code.len() % 4 != 0 {
            return Err(Error::Shader(format!(
                "SPIR-V must be a non-empty multiple of 4 bytes, got {}",
                code.len()
            )));
        }
        Ok(self.new_handle(ObjectKind::ShaderModule))
    }

    fn destroy_shader_module(&self, _module: vk::ShaderModule) {
        self.release(ObjectKind::ShaderModule);
    }

    fn create_descriptor_set_layout(&self, _bindings: &[LayoutBinding]) -> Result<vk::DescriptorSetLayout> {
        Ok(self.new_handle(ObjectKind::DescriptorSetLayout))
    }

    fn destroy_descriptor_set_layout(&self, _layout: vk::DescriptorSetLayout) {
        self.release(ObjectKind::DescriptorSetLayout);
    }

    fn create_descriptor_pool(&self, _sizes: &[vk::DescriptorPoolSize], _max_sets: u32) -> Result<vk::DescriptorPool> {
        Ok(self.new_handle(ObjectKind::DescriptorPool))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.lock();
        let sets = state.pool_sets.remove(&pool.as_raw()).unwrap_or(0);
        state.add_live(ObjectKind::DescriptorSet, -sets);
        state.add_live(ObjectKind::DescriptorPool, -1);
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let sets: Vec<vk::DescriptorSet> = layouts
            .iter()
            .map(|_| self.new_handle(ObjectKind::DescriptorSet))
            .collect();
        *self.state.lock().pool_sets.entry(pool.as_raw()).or_insert(0) += sets.len() as i64;
        Ok(sets)
    }

    fn free_descriptor_sets(&self, pool: vk::DescriptorPool, sets: &[vk::DescriptorSet]) -> Result<()> {
        let mut state = self.state.lock();
        *state.pool_sets.entry(pool.as_raw()).or_insert(0) -= sets.len() as i64;
        state.add_live(ObjectKind::DescriptorSet, -(sets.len() as i64));
        Ok(())
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite<'_, HeadlessBuffer>]) {
        log::trace!("Headless descriptor update: {} writes", writes.len());
        let mut state = self.state.lock();
        for write in writes {
            let record = match write {
                DescriptorWrite::UniformBuffer {
                    set, binding, offset, ..
                } => WriteRecord::UniformBuffer {
                    set: *set,
                    binding: *binding,
                    offset: *offset,
                },
                DescriptorWrite::ImageSamplers { set, binding, images } => WriteRecord::ImageSamplers {
                    set: *set,
                    binding: *binding,
                    views: images.iter().map(|&(view, _)| view).collect(),
                },
            };
            state.descriptor_writes.push(record);
        }
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constants: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        Ok(self.new_handle(ObjectKind::PipelineLayout))
    }

    fn destroy_pipeline_layout(&self, _layout: vk::PipelineLayout) {
        self.release(ObjectKind::PipelineLayout);
    }

    fn create_graphics_pipeline(&self, _desc: &PipelineDesc) -> Result<vk::Pipeline> {
        Ok(self.new_handle(ObjectKind::Pipeline))
    }

    fn destroy_pipeline(&self, _pipeline: vk::Pipeline) {
        self.release(ObjectKind::Pipeline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit(device: &HeadlessDevice, cmd: vk::CommandBuffer, fence: vk::Fence) {
        device
            .queue_submit(
                QueueRole::Graphics,
                &Submission {
                    command_buffer: cmd,
                    wait: None,
                    signal: None,
                    fence: Some(fence),
                },
            )
            .unwrap();
    }

    #[test]
    fn fence_completes_on_wait() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence(false).unwrap();
        let cmd = device.allocate_command_buffer(true).unwrap();

        submit(&device, cmd, fence);
        assert_eq!(device.fence_state(fence), Some(FenceState::Pending));
        assert!(device.wait_for_fence(fence, u64::MAX).unwrap());
        assert_eq!(device.fence_state(fence), Some(FenceState::Signaled));
        assert!(device.violations().is_empty());
    }

    #[test]
    fn unsignaled_fence_times_out() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence(false).unwrap();
        assert!(!device.wait_for_fence(fence, 1_000).unwrap());
    }

    #[test]
    fn stalled_fence_times_out_until_released() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence(false).unwrap();
        let cmd = device.allocate_command_buffer(true).unwrap();
        submit(&device, cmd, fence);

        device.stall_fence(fence);
        assert!(!device.wait_for_fence(fence, 1_000).unwrap());
        assert_eq!(device.fence_state(fence), Some(FenceState::Pending));

        device.release_stalled_fences();
        assert!(device.wait_for_fence(fence, 1_000).unwrap());
    }

    #[test]
    fn protocol_mistakes_are_recorded() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence(false).unwrap();
        let cmd = device.allocate_command_buffer(true).unwrap();
        submit(&device, cmd, fence);

        device.reset_fence(fence).unwrap();
        device.reset_command_buffer(cmd).unwrap();
        submit(&device, cmd, fence);

        let violations = device.violations();
        assert!(violations.contains(&Violation::FenceResetWhilePending(fence)));
        assert!(violations.contains(&Violation::CommandBufferResetWhilePending(cmd)));
        assert!(violations.contains(&Violation::FenceSubmittedWhileBusy(fence)));
        assert_eq!(device.max_outstanding_per_fence(), 2);
    }

    #[test]
    fn semaphores_must_be_signaled_before_waits() {
        let device = HeadlessDevice::new();
        let semaphore = device.create_semaphore().unwrap();
        device
            .queue_present(vk::SwapchainKHR::null(), 0, semaphore)
            .unwrap();
        assert_eq!(device.violations(), vec![Violation::SemaphoreNotSignaled(semaphore)]);
    }

    #[test]
    fn copies_move_bytes() {
        let device = HeadlessDevice::new();
        let src = device.create_buffer(BufferKind::Staging, 8).unwrap();
        let dst = device.create_buffer(BufferKind::Vertex, 8).unwrap();
        device.write_buffer(&src, 0, &[1, 2, 3, 4]).unwrap();
        device.cmd_copy_buffer(
            vk::CommandBuffer::null(),
            &src,
            &dst,
            vk::BufferCopy {
                src_offset: 0,
                dst_offset: 4,
                size: 4,
            },
        );
        assert_eq!(dst.contents(), vec![0, 0, 0, 0, 1, 2, 3, 4]);
        assert_eq!(device.live(ObjectKind::Buffer), 2);
    }
}
