// Resource registries against the headless device

mod common;

use common::{harness, world_pass, world_shader, Harness, DT, WORLD_SHADER};
use ferrous_frame::backend::buffer::{BufferKind, RenderBuffer};
use ferrous_frame::backend::headless::{ObjectKind, RecordedCommand, WriteRecord};
use ferrous_frame::backend::{InstanceId, ShaderConfig, TextureMap, UniformValue};
use ferrous_frame::{Error, FrameStatus, ShaderId};

const TRIANGLE: [[f32; 3]; 3] = [[0.0, 0.5, 0.0], [-0.5, -0.5, 0.0], [0.5, -0.5, 0.0]];
const QUAD: [[f32; 3]; 4] = [[-0.5, 0.5, 0.0], [-0.5, -0.5, 0.0], [0.5, -0.5, 0.0], [0.5, 0.5, 0.0]];

#[test]
fn geometry_slots_are_reused_with_a_new_generation() {
    let mut h = harness();
    let first = h.backend.create_geometry(&TRIANGLE, &[0, 1, 2]).unwrap();
    let keep = h.backend.create_geometry(&QUAD, &[0, 1, 2, 2, 3, 0]).unwrap();

    assert!(h.backend.destroy_geometry(first).unwrap());
    assert!(h.backend.geometry(first).is_none());
    // A second destroy through the stale handle is ignored
    assert!(!h.backend.destroy_geometry(first).unwrap());

    let reused = h.backend.create_geometry(&TRIANGLE, &[]).unwrap();
    assert_eq!(reused.index(), first.index());
    assert_eq!(reused.generation(), first.generation() + 1);
    assert!(h.backend.geometry(first).is_none());

    let a = *h.backend.geometry(reused).unwrap();
    let b = *h.backend.geometry(keep).unwrap();
    assert!(a.indices.is_none());
    assert!(a.vertices.end() <= b.vertices.offset || b.vertices.end() <= a.vertices.offset);
    assert_eq!(b.vertices.element_count, 4);
    assert_eq!(b.vertices.element_size, 12);
    assert_eq!(b.indices.map(|r| r.element_count), Some(6));
}

#[test]
fn geometry_update_invalidates_the_old_handle() {
    let mut h = harness();
    let original = h.backend.create_geometry(&TRIANGLE, &[0, 1, 2]).unwrap();

    let updated = h.backend.update_geometry(original, &QUAD, &[0, 1, 2, 2, 3, 0]).unwrap();
    assert_eq!(updated.index(), original.index());
    assert_ne!(updated, original);
    assert!(h.backend.geometry(original).is_none());
    assert_eq!(h.backend.geometry(updated).unwrap().vertices.element_count, 4);

    assert!(matches!(
        h.backend.update_geometry(original, &TRIANGLE, &[]),
        Err(Error::InvalidHandle(_))
    ));
}

#[test]
fn geometry_draws_use_their_ranges() {
    let mut h = harness();
    let indexed = h.backend.create_geometry(&QUAD, &[0, 1, 2, 2, 3, 0]).unwrap();
    let plain = h.backend.create_geometry(&TRIANGLE, &[]).unwrap();
    let stale = h.backend.create_geometry(&TRIANGLE, &[]).unwrap();
    h.backend.destroy_geometry(stale).unwrap();

    assert!(matches!(h.backend.draw_geometry(plain), Err(Error::InvalidState(_))));

    assert_eq!(h.backend.begin_frame(DT).unwrap(), FrameStatus::Ready);
    h.device.clear_commands();
    h.backend.draw_geometry(indexed).unwrap();
    h.backend.draw_geometry(plain).unwrap();
    h.backend.draw_geometry(stale).unwrap();
    h.backend.end_frame(DT).unwrap();

    let commands = h.device.commands();
    assert!(commands.contains(&RecordedCommand::DrawIndexed { index_count: 6 }));
    assert!(commands.contains(&RecordedCommand::Draw { vertex_count: 3 }));
    let draws = commands
        .iter()
        .filter(|c| matches!(c, RecordedCommand::Draw { .. } | RecordedCommand::DrawIndexed { .. }))
        .count();
    assert_eq!(draws, 2);
}

#[test]
fn vertex_data_must_fit_the_shared_buffer() {
    let mut h = harness();
    let huge = vec![[0.0f32; 3]; 64 * 1024 / 12 + 1];
    assert!(h.backend.create_geometry(&huge, &[]).is_err());

    // The failed upload left nothing behind
    let ok = h.backend.create_geometry(&TRIANGLE, &[]).unwrap();
    assert_eq!(h.backend.geometry(ok).unwrap().vertices.offset, 0);
}

#[test]
fn shader_uniform_regions() {
    let mut h = harness();
    h.backend.create_render_pass(world_pass()).unwrap();
    let shader = h.backend.create_shader(world_shader()).unwrap();
    h.backend.initialize_shader(shader).unwrap();
    assert_eq!(h.assets.outstanding(), 0);

    let a = h.backend.acquire_instance_resources(shader, &[]).unwrap();
    let b = h.backend.acquire_instance_resources(shader, &[]).unwrap();

    let s = h.backend.shader(shader).unwrap();
    let globals: Vec<u64> = (0..3).map(|frame| s.global_offset(frame)).collect();
    assert_eq!(globals, vec![0, 256, 512]);
    let offset_a = s.instance_offset(a).unwrap();
    let offset_b = s.instance_offset(b).unwrap();
    assert_eq!(offset_a % 256, 0);
    assert_eq!(offset_b, offset_a + 256);
    assert!(offset_a > *globals.iter().max().unwrap());

    // Instance data lands in the instance's own region
    let colour: [f32; 4] = [1.0, 0.5, 0.25, 1.0];
    let index = h.backend.uniform_index(shader, "diffuse_colour").unwrap();
    h.backend.bind_instance(shader, b).unwrap();
    h.backend
        .set_uniform(shader, index, UniformValue::Data(bytemuck::bytes_of(&colour)))
        .unwrap();

    let s = h.backend.shader(shader).unwrap();
    let mut out = [0u8; 16];
    s.read_uniform_buffer(offset_b, &mut out).unwrap();
    assert_eq!(out, bytemuck::bytes_of(&colour));
    s.read_uniform_buffer(offset_a, &mut out).unwrap();
    assert_eq!(out, [0u8; 16]);
}

#[test]
fn uniform_writes_are_checked() {
    let mut h = harness();
    h.backend.create_render_pass(world_pass()).unwrap();
    let shader = h.backend.create_shader(world_shader()).unwrap();

    // Nothing can be acquired before initialization
    assert!(matches!(
        h.backend.acquire_instance_resources(shader, &[]),
        Err(Error::InvalidState(_))
    ));
    h.backend.initialize_shader(shader).unwrap();

    let colour = h.backend.uniform_index(shader, "diffuse_colour").unwrap();
    assert!(matches!(
        h.backend.set_uniform(shader, colour, UniformValue::Data(&[0u8; 16])),
        Err(Error::InvalidState(_))
    ));

    let instance = h.backend.acquire_instance_resources(shader, &[]).unwrap();
    h.backend.bind_instance(shader, instance).unwrap();
    assert!(matches!(
        h.backend.set_uniform(shader, colour, UniformValue::Data(&[0u8; 12])),
        Err(Error::Uniform(_))
    ));

    // Local uniforms go out as push constants and need a frame
    let model = h.backend.uniform_index(shader, "model").unwrap();
    let identity = [0u8; 64];
    assert!(matches!(
        h.backend.set_uniform(shader, model, UniformValue::Data(&identity)),
        Err(Error::InvalidState(_))
    ));
    assert_eq!(h.backend.begin_frame(DT).unwrap(), FrameStatus::Ready);
    h.backend
        .set_uniform(shader, model, UniformValue::Data(&identity))
        .unwrap();
    h.backend.end_frame(DT).unwrap();
    assert!(h
        .device
        .commands()
        .contains(&RecordedCommand::PushConstants { offset: 0, size: 64 }));
}

#[test]
fn released_instances_free_their_region() {
    let mut h = harness();
    h.backend.create_render_pass(world_pass()).unwrap();
    let shader = h.backend.create_shader(world_shader()).unwrap();
    h.backend.initialize_shader(shader).unwrap();

    let first = h.backend.acquire_instance_resources(shader, &[]).unwrap();
    let offset = h.backend.shader(shader).unwrap().instance_offset(first);
    h.backend.release_instance_resources(shader, first).unwrap();
    assert!(matches!(
        h.backend.release_instance_resources(shader, first),
        Err(Error::InvalidHandle(_))
    ));

    let second = h.backend.acquire_instance_resources(shader, &[]).unwrap();
    assert_ne!(second, first);
    assert_eq!(h.backend.shader(shader).unwrap().instance_offset(second), offset);
}

#[test]
fn instance_table_is_bounded() {
    let mut h = harness();
    h.backend.create_render_pass(world_pass()).unwrap();
    let shader = h.backend.create_shader(world_shader()).unwrap();
    h.backend.initialize_shader(shader).unwrap();

    for _ in 0..16 {
        h.backend.acquire_instance_resources(shader, &[]).unwrap();
    }
    assert!(matches!(
        h.backend.acquire_instance_resources(shader, &[]),
        Err(Error::Exhausted(_))
    ));
}

#[test]
fn missing_bytecode_fails_initialization() {
    let mut h = harness();
    h.backend.create_render_pass(world_pass()).unwrap();
    let config = ShaderConfig::from_toml_str(
        &WORLD_SHADER
            .replace("builtin.world\"", "builtin.broken\"")
            .replace("builtin.world.frag.spv", "missing.frag.spv"),
    )
    .unwrap();
    let shader = h.backend.create_shader(config).unwrap();

    assert!(matches!(h.backend.initialize_shader(shader), Err(Error::Asset(_))));
    assert!(!h.backend.shader(shader).unwrap().is_initialized());
    assert_eq!(h.assets.outstanding(), 0);
    // The vertex module made before the failure is already gone
    assert_eq!(h.device.live(ObjectKind::ShaderModule), 0);

    h.backend.destroy_shader(shader).unwrap();
    assert_eq!(h.device.live(ObjectKind::ShaderModule), 0);
    assert!(h.backend.shader_id("builtin.broken").is_none());
}

#[test]
fn failed_initialization_can_be_retried() {
    let mut h = harness();
    h.backend.create_render_pass(world_pass()).unwrap();
    let shader = h.backend.create_shader(world_shader()).unwrap();

    let kinds = [
        ObjectKind::ShaderModule,
        ObjectKind::DescriptorPool,
        ObjectKind::DescriptorSetLayout,
        ObjectKind::PipelineLayout,
        ObjectKind::Pipeline,
        ObjectKind::Buffer,
    ];
    let before: Vec<i64> = kinds.iter().map(|&k| h.device.live(k)).collect();

    // The uniform buffer is the last object made, after pool, layouts and pipeline
    h.device.fail_next_buffer_creations(1);
    assert!(h.backend.initialize_shader(shader).is_err());
    let after: Vec<i64> = kinds.iter().map(|&k| h.device.live(k)).collect();
    assert_eq!(before, after);

    h.backend.initialize_shader(shader).unwrap();
    assert!(h.backend.shader(shader).unwrap().is_initialized());
    assert_eq!(h.device.live(ObjectKind::ShaderModule), 2);
    assert_eq!(h.device.live(ObjectKind::DescriptorPool), 1);
    assert_eq!(h.backend.shader(shader).unwrap().global_offset(1), 256);
}

fn textured_shader(h: &mut Harness) -> ShaderId {
    let toml = WORLD_SHADER.replace("builtin.world\"", "builtin.textured\"")
        + r#"
    [[uniforms]]
    name = "diffuse_texture"
    scope = "instance"
    type = "sampler"
"#;
    h.backend.create_render_pass(world_pass()).unwrap();
    let shader = h
        .backend
        .create_shader(ShaderConfig::from_toml_str(&toml).unwrap())
        .unwrap();
    h.backend.initialize_shader(shader).unwrap();
    shader
}

/// Runs one frame that binds and updates `instance`.
fn apply_in_frame(h: &mut Harness, shader: ShaderId, instance: InstanceId) {
    assert_eq!(h.backend.begin_frame(DT).unwrap(), FrameStatus::Ready);
    h.backend.bind_instance(shader, instance).unwrap();
    h.backend.apply_instance(shader, true).unwrap();
    h.backend.end_frame(DT).unwrap();
}

fn sampler_writes(h: &Harness) -> Vec<Vec<ash::vk::ImageView>> {
    h.device
        .descriptor_writes()
        .into_iter()
        .filter_map(|write| match write {
            WriteRecord::ImageSamplers { views, .. } => Some(views),
            WriteRecord::UniformBuffer { .. } => None,
        })
        .collect()
}

#[test]
fn descriptor_sets_are_written_only_when_bindings_change() {
    let mut h = harness();
    let shader = textured_shader(&mut h);
    let texture = h.backend.create_writeable_texture(4, 4, 4, false).unwrap();
    let mut map = TextureMap::new(Some(texture));
    h.backend.acquire_texture_map_resources(&mut map).unwrap();
    let instance = h.backend.acquire_instance_resources(shader, &[&map]).unwrap();
    let view = h.backend.texture(texture).unwrap().view();
    let offset = h.backend.shader(shader).unwrap().instance_offset(instance).unwrap();

    // One set per frame slot, each written once
    apply_in_frame(&mut h, shader, instance);
    apply_in_frame(&mut h, shader, instance);
    let writes = h.device.descriptor_writes();
    assert_eq!(writes.len(), 4);
    assert_ne!(writes[0].set(), writes[2].set());
    assert!(writes.contains(&WriteRecord::UniformBuffer {
        set: writes[0].set(),
        binding: 0,
        offset,
    }));
    assert_eq!(sampler_writes(&h), vec![vec![view], vec![view]]);

    h.device.clear_descriptor_writes();
    apply_in_frame(&mut h, shader, instance);
    apply_in_frame(&mut h, shader, instance);
    assert!(h.device.descriptor_writes().is_empty());
}

#[test]
fn written_textures_stay_bound() {
    let mut h = harness();
    let shader = textured_shader(&mut h);
    let texture = h.backend.create_writeable_texture(4, 4, 4, false).unwrap();
    let mut map = TextureMap::new(Some(texture));
    h.backend.acquire_texture_map_resources(&mut map).unwrap();
    let instance = h.backend.acquire_instance_resources(shader, &[&map]).unwrap();
    apply_in_frame(&mut h, shader, instance);
    h.device.clear_descriptor_writes();

    // Slot 1 is first written after the texture changed, slot 0 is rewritten
    h.backend.write_texture(texture, &[0x80u8; 4 * 4 * 4]).unwrap();
    apply_in_frame(&mut h, shader, instance);
    h.device.clear_descriptor_writes();
    h.backend.resize_texture(texture, 8, 8).unwrap();
    let resized_view = h.backend.texture(texture).unwrap().view();
    apply_in_frame(&mut h, shader, instance);

    // Only the sampler binding is rewritten, with the resized image
    let writes = h.device.descriptor_writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(sampler_writes(&h), vec![vec![resized_view]]);
    let default_view = h.backend.texture(h.backend.default_texture()).unwrap().view();
    assert_ne!(resized_view, default_view);
}

#[test]
fn texture_uniforms_rewrite_the_sampler_once() {
    let mut h = harness();
    let shader = textured_shader(&mut h);
    let first = h.backend.create_writeable_texture(4, 4, 4, false).unwrap();
    let second = h.backend.create_writeable_texture(2, 2, 4, false).unwrap();
    let mut map = TextureMap::new(Some(first));
    h.backend.acquire_texture_map_resources(&mut map).unwrap();
    let instance = h.backend.acquire_instance_resources(shader, &[&map]).unwrap();
    apply_in_frame(&mut h, shader, instance);
    apply_in_frame(&mut h, shader, instance);
    h.device.clear_descriptor_writes();

    let mut replacement = TextureMap::new(Some(second));
    h.backend.acquire_texture_map_resources(&mut replacement).unwrap();
    let sampler = h.backend.uniform_index(shader, "diffuse_texture").unwrap();
    assert_eq!(h.backend.begin_frame(DT).unwrap(), FrameStatus::Ready);
    h.backend.bind_instance(shader, instance).unwrap();
    h.backend
        .set_uniform(shader, sampler, UniformValue::Texture(&replacement))
        .unwrap();
    h.backend.apply_instance(shader, true).unwrap();
    h.backend.apply_instance(shader, true).unwrap();
    h.backend.end_frame(DT).unwrap();

    let view = h.backend.texture(second).unwrap().view();
    assert_eq!(h.device.descriptor_writes().len(), 1);
    assert_eq!(sampler_writes(&h), vec![vec![view]]);
}

#[test]
fn shaders_need_a_known_render_pass() {
    let mut h = harness();
    assert!(matches!(h.backend.create_shader(world_shader()), Err(Error::Shader(_))));

    h.backend.create_render_pass(world_pass()).unwrap();
    let id = h.backend.create_shader(world_shader()).unwrap();
    assert_eq!(h.backend.shader_id("builtin.world"), Some(id));
    assert!(matches!(h.backend.create_shader(world_shader()), Err(Error::Shader(_))));
}

#[test]
fn texture_writes_keep_the_handle() {
    let mut h = harness();
    let texture = h.backend.create_writeable_texture(4, 4, 4, false).unwrap();
    let map = TextureMap::new(Some(texture));
    let pixels = vec![0xffu8; 4 * 4 * 4];

    h.backend.write_texture(texture, &pixels).unwrap();
    let written = h.backend.texture(texture).unwrap();
    assert!(written.is_writeable());
    assert_eq!(written.generation(), 1);
    assert_eq!(map.texture, Some(texture));

    h.backend.resize_texture(texture, 8, 2).unwrap();
    let t = h.backend.texture(texture).unwrap();
    assert_eq!((t.width(), t.height()), (8, 2));
    assert_eq!(t.byte_size(), 64);
    assert_eq!(t.generation(), 2);

    let copies = h
        .device
        .commands()
        .iter()
        .filter(|c| matches!(c, RecordedCommand::CopyBufferToImage { width: 4, height: 4 }))
        .count();
    assert_eq!(copies, 1);
}

#[test]
fn textures_are_rgba_only() {
    let mut h = harness();
    assert!(h.backend.create_writeable_texture(4, 4, 3, false).is_err());
    assert!(h.backend.texture(h.backend.default_texture()).is_some());
}

#[test]
fn failed_buffer_creation_is_reported() {
    let h = harness();
    let buffers = h.device.live(ObjectKind::Buffer);

    h.device.fail_next_buffer_creations(1);
    assert!(RenderBuffer::new(h.device.clone(), BufferKind::Uniform, 1024, true).is_err());
    assert_eq!(h.device.live(ObjectKind::Buffer), buffers);

    let buffer = RenderBuffer::new(h.device.clone(), BufferKind::Uniform, 1024, true).unwrap();
    assert_eq!(buffer.size(), 1024);
    assert_eq!(h.device.live(ObjectKind::Buffer), buffers + 1);
}
