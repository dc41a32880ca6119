// Frame loop behaviour against the headless device

mod common;

use common::{harness, harness_with, run_frame, test_config, world_pass, DT, HEIGHT, WIDTH};
use ferrous_frame::backend::gpu::PresentOutcome;
use ferrous_frame::backend::headless::{ObjectKind, RecordedCommand};
use ferrous_frame::{Error, FrameStatus, HeadlessDevice, RendererEvent};

/// Submissions made by `end_frame`; setup uploads carry no fence.
fn frame_submissions(h: &common::Harness) -> Vec<ferrous_frame::backend::headless::SubmissionRecord> {
    h.device
        .submissions()
        .into_iter()
        .filter(|s| s.fence.is_some())
        .collect()
}

#[test]
fn frames_rotate_through_slot_fences() {
    let mut h = harness();
    assert_eq!(h.backend.frames_in_flight(), 2);
    let fence0 = h.backend.frame_sync().fence(0).handle();
    let fence1 = h.backend.frame_sync().fence(1).handle();

    for _ in 0..4 {
        assert_eq!(run_frame(&mut h.backend), FrameStatus::Ready);
    }

    let fences: Vec<_> = frame_submissions(&h).iter().map(|s| s.fence).collect();
    assert_eq!(fences, vec![Some(fence0), Some(fence1), Some(fence0), Some(fence1)]);
    assert!(h.device.max_outstanding_per_fence() <= 1);
    assert_eq!(h.backend.frame_number(), 4);
    assert_eq!(h.backend.current_frame(), 0);
    assert_eq!(h.device.present_count(), 4);
    assert!(h.device.violations().is_empty(), "{:?}", h.device.violations());
}

#[test]
fn triangle_renders_for_three_frames() {
    let mut config = test_config();
    config.graphics.fence_timeout_ms = Some(100);
    let mut h = harness_with(HeadlessDevice::new(), config);
    let pass = h.backend.create_render_pass(world_pass()).unwrap();
    let triangle = h
        .backend
        .create_geometry(&[[0.0f32, 0.5, 0.0], [-0.5, -0.5, 0.0], [0.5, -0.5, 0.0]], &[0, 1, 2])
        .unwrap();

    for _ in 0..3 {
        assert_eq!(h.backend.begin_frame(DT).unwrap(), FrameStatus::Ready);
        let image = h.backend.window_image_index() as usize;
        h.backend.begin_render_pass(pass, image).unwrap();
        h.backend.draw_geometry(triangle).unwrap();
        h.backend.end_render_pass().unwrap();
        h.backend.end_frame(DT).unwrap();
    }

    let slots: Vec<_> = frame_submissions(&h)
        .iter()
        .map(|s| {
            (0..2)
                .find(|&slot| Some(h.backend.frame_sync().fence(slot).handle()) == s.fence)
                .unwrap()
        })
        .collect();
    assert_eq!(slots, vec![0, 1, 0]);
    let draws = h
        .device
        .commands()
        .into_iter()
        .filter(|c| *c == RecordedCommand::DrawIndexed { index_count: 3 })
        .count();
    assert_eq!(draws, 3);
    assert_eq!(h.device.present_count(), 3);
    assert!(h.device.violations().is_empty(), "{:?}", h.device.violations());
}

#[test]
fn swap_images_are_never_reused_while_in_flight() {
    let mut h = harness();
    let images = h.backend.window_attachment_count();
    assert_eq!(images, 3);

    // More frames than images and slots so ownership changes hands
    for frame in 0..9 {
        assert_eq!(run_frame(&mut h.backend), FrameStatus::Ready);
        let image = h.backend.window_image_index() as usize;
        let slot = frame % 2;
        assert_eq!(h.backend.frame_sync().image_owner(image), Some(slot));
    }

    // Each swap image has its own command buffer
    let buffers: Vec<_> = frame_submissions(&h).iter().map(|s| s.command_buffer).collect();
    assert_eq!(buffers[0], buffers[3]);
    assert_ne!(buffers[0], buffers[1]);
    assert!(h.device.violations().is_empty(), "{:?}", h.device.violations());
}

#[test]
fn begin_and_end_must_pair() {
    let mut h = harness();
    assert!(matches!(h.backend.end_frame(DT), Err(Error::InvalidState(_))));

    assert_eq!(h.backend.begin_frame(DT).unwrap(), FrameStatus::Ready);
    assert!(h.backend.frame_in_progress());
    assert!(matches!(h.backend.begin_frame(DT), Err(Error::InvalidState(_))));
    h.backend.end_frame(DT).unwrap();
    assert!(!h.backend.frame_in_progress());
    assert!(h.backend.current_command_buffer().is_none());
}

#[test]
fn viewport_follows_framebuffer() {
    let mut h = harness();
    h.backend.begin_frame(DT).unwrap();
    h.backend.end_frame(DT).unwrap();

    let commands = h.device.commands();
    assert!(commands.contains(&RecordedCommand::SetViewport {
        width: WIDTH as f32,
        height: HEIGHT as f32,
    }));
    assert!(commands.contains(&RecordedCommand::SetScissor {
        width: WIDTH,
        height: HEIGHT,
    }));
}

#[test]
fn minimized_window_skips_frames_without_recreating() {
    let mut h = harness();
    run_frame(&mut h.backend);
    let submitted = h.device.submissions().len();
    let idles = h.device.wait_idle_count();

    h.backend.resized(0, 0);
    for _ in 0..3 {
        assert_eq!(h.backend.begin_frame(DT).unwrap(), FrameStatus::Minimized);
    }
    assert_eq!(h.device.submissions().len(), submitted);
    assert_eq!(h.device.wait_idle_count(), idles);
    assert!(h.events.drain().is_empty());

    // Restoring the window rebuilds once at the new size
    h.backend.resized(1024, 768);
    assert_eq!(h.backend.begin_frame(DT).unwrap(), FrameStatus::Resized);
    let extent = h.backend.swapchain().extent();
    assert_eq!((extent.width, extent.height), (1024, 768));
    assert_eq!(
        h.events.drain(),
        vec![RendererEvent::DefaultRenderTargetsRefreshRequired {
            width: 1024,
            height: 768
        }]
    );

    assert_eq!(run_frame(&mut h.backend), FrameStatus::Ready);
    assert!(h.device.violations().is_empty(), "{:?}", h.device.violations());
}

#[test]
fn recreation_keeps_object_counts_stable() {
    let mut h = harness();
    h.backend.create_render_pass(world_pass()).unwrap();
    run_frame(&mut h.backend);

    let kinds = [
        ObjectKind::Swapchain,
        ObjectKind::ImageView,
        ObjectKind::Image,
        ObjectKind::Framebuffer,
        ObjectKind::CommandBuffer,
        ObjectKind::Fence,
        ObjectKind::Semaphore,
    ];
    let before: Vec<i64> = kinds.iter().map(|&k| h.device.live(k)).collect();

    for _ in 0..2 {
        h.backend.resized(WIDTH, HEIGHT);
        assert_eq!(h.backend.begin_frame(DT).unwrap(), FrameStatus::Resized);
        assert_eq!(run_frame(&mut h.backend), FrameStatus::Ready);
    }

    let after: Vec<i64> = kinds.iter().map(|&k| h.device.live(k)).collect();
    assert_eq!(before, after);
    assert_eq!(h.device.live(ObjectKind::Swapchain), 1);
    assert_eq!(h.device.live(ObjectKind::Framebuffer), 3);
}

#[test]
fn stale_swapchain_at_acquire_is_rebuilt_without_submitting() {
    let mut h = harness();
    run_frame(&mut h.backend);
    let submitted = h.device.submissions().len();

    h.device.fail_next_acquires(1);
    assert_eq!(h.backend.begin_frame(DT).unwrap(), FrameStatus::SwapchainStale);
    assert!(!h.backend.frame_in_progress());
    assert_eq!(h.device.submissions().len(), submitted);
    assert_eq!(h.events.drain().len(), 1);

    assert_eq!(run_frame(&mut h.backend), FrameStatus::Ready);
    assert!(h.device.violations().is_empty(), "{:?}", h.device.violations());
}

#[test]
fn stale_present_triggers_recreation() {
    let mut h = harness();
    h.device.push_present_outcome(PresentOutcome::OutOfDate);

    assert_eq!(h.backend.begin_frame(DT).unwrap(), FrameStatus::Ready);
    h.backend.end_frame(DT).unwrap();
    assert_eq!(h.events.drain().len(), 1);
    assert_eq!(h.backend.frame_number(), 1);

    h.device.push_present_outcome(PresentOutcome::Suboptimal);
    assert_eq!(run_frame(&mut h.backend), FrameStatus::Ready);
    assert_eq!(h.events.drain().len(), 1);

    assert_eq!(run_frame(&mut h.backend), FrameStatus::Ready);
    assert!(h.events.drain().is_empty());
    assert_eq!(h.device.live(ObjectKind::Swapchain), 1);
    assert!(h.device.violations().is_empty(), "{:?}", h.device.violations());
}

#[test]
fn resize_handle_works_across_threads() {
    let mut h = harness();
    let handle = h.backend.resize_handle();
    std::thread::spawn(move || handle.resized(640, 480))
        .join()
        .unwrap();

    assert_eq!(h.backend.framebuffer_size(), (640, 480));
    assert_eq!(h.backend.begin_frame(DT).unwrap(), FrameStatus::Resized);
    assert_eq!(h.backend.swapchain().extent().width, 640);
}

#[test]
fn open_render_pass_is_closed_at_end_frame() {
    let mut h = harness();
    let pass = h.backend.create_render_pass(world_pass()).unwrap();

    assert_eq!(h.backend.begin_frame(DT).unwrap(), FrameStatus::Ready);
    let image = h.backend.window_image_index() as usize;
    h.backend.begin_render_pass(pass, image).unwrap();
    h.backend.end_frame(DT).unwrap();

    let commands = h.device.commands();
    let begins = commands
        .iter()
        .filter(|c| matches!(c, RecordedCommand::BeginRenderPass { .. }))
        .count();
    let ends = commands
        .iter()
        .filter(|c| matches!(c, RecordedCommand::EndRenderPass))
        .count();
    assert_eq!((begins, ends), (1, 1));
}

#[test]
fn render_pass_needs_a_frame() {
    let mut h = harness();
    let pass = h.backend.create_render_pass(world_pass()).unwrap();
    assert!(matches!(
        h.backend.begin_render_pass(pass, 0),
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(
        h.backend.create_render_pass(world_pass()),
        Err(Error::RenderPassConfig(_))
    ));
}

#[test]
fn timed_out_image_wait_does_not_leave_the_acquire_semaphore_signaled() {
    let mut config = test_config();
    config.graphics.fence_timeout_ms = Some(10);
    let mut h = harness_with(HeadlessDevice::new(), config);
    for _ in 0..3 {
        assert_eq!(run_frame(&mut h.backend), FrameStatus::Ready);
    }
    let semaphores = h.device.live(ObjectKind::Semaphore);
    let acquire_semaphore = h.backend.frame_sync().image_available(1);

    // Slot 1 acquires image 0 next, still owned by slot 0's pending frame
    assert_eq!(h.backend.frame_sync().image_owner(0), Some(0));
    h.device.stall_fence(h.backend.frame_sync().fence(0).handle());
    assert!(matches!(h.backend.begin_frame(DT), Err(Error::FenceTimeout(_))));
    assert!(!h.backend.frame_in_progress());
    assert_ne!(h.backend.frame_sync().image_available(1), acquire_semaphore);
    assert_eq!(h.device.live(ObjectKind::Semaphore), semaphores);

    h.device.release_stalled_fences();
    for _ in 0..4 {
        assert_eq!(run_frame(&mut h.backend), FrameStatus::Ready);
    }
    assert!(h.device.violations().is_empty(), "{:?}", h.device.violations());
}
