mod common;

use common::*;
use pretty_assertions::assert_eq;
use xenos_gpu::backend::{DescriptorRangeKind, FenceMode, ResourceState, ShaderVisibility};
use xenos_gpu::cmd::{HostCmd, IndexFormat, Viewport};
use xenos_gpu::registers::*;
use xenos_gpu::shader::TranslatedShader;
use xenos_gpu::texture_cache::SHADER_RESOURCE_STATE;
use xenos_gpu::xenos::Endian;
use xenos_gpu::{CommandProcessor, IndexBufferInfo, NullBackend, PrimitiveType, ShaderType};

const MIB: u64 = 1 << 20;

fn textured_translator() -> ScriptedTranslator {
    ScriptedTranslator::new()
        .with(
            0x10,
            TranslatedShader {
                texture_bindings: textures(&[0, 1]),
                color_targets_written: 1,
                ..TranslatedShader::default()
            },
        )
        .with(
            0x11,
            TranslatedShader {
                texture_bindings: textures(&[2, 3]),
                color_targets_written: 1,
                ..TranslatedShader::default()
            },
        )
        .with(
            0x12,
            TranslatedShader {
                texture_bindings: textures(&[0]),
                sampler_bindings: samplers(&[0]),
                color_targets_written: 1,
                ..TranslatedShader::default()
            },
        )
}

#[test]
fn pixel_textures_without_samplers_get_their_own_root_signature() {
    let mut cp = processor_with(FenceMode::Immediate, test_config(), textured_translator());
    setup_color_target(&mut cp);
    let (vs, ps) = bind_shaders(&mut cp, 0x01, 0x10);

    assert!(cp.issue_draw(PrimitiveType::TriangleList, 3, None).unwrap());
    let root = cp.get_root_signature(vs, Some(ps)).unwrap();
    let desc = cp.backend().root_signature_desc(root).unwrap();
    assert_eq!(desc.parameters.len(), 6);
    assert_eq!(desc.parameters[5].range, DescriptorRangeKind::ShaderResource);
    assert_eq!(desc.parameters[5].visibility, ShaderVisibility::Pixel);

    assert!(cp.issue_draw(PrimitiveType::TriangleList, 3, None).unwrap());
    assert_eq!(cp.root_signature_count(), 1);
    assert_eq!(cp.stats().snapshot().root_signatures_created, 1);

    let roots_bound = cp
        .get_current_command_list()
        .unwrap()
        .cmds()
        .iter()
        .filter(|cmd| matches!(cmd, HostCmd::SetGraphicsRootSignature(_)))
        .count();
    assert_eq!(roots_bound, 1);
}

#[test]
fn shader_pairs_with_the_same_slots_share_a_root_signature() {
    let mut cp = processor_with(FenceMode::Immediate, test_config(), textured_translator());
    let (vs, ps_a) = bind_shaders(&mut cp, 0x01, 0x10);
    let (_, ps_b) = bind_shaders(&mut cp, 0x01, 0x11);
    let (_, ps_c) = bind_shaders(&mut cp, 0x01, 0x12);

    let a = cp.get_root_signature(vs, Some(ps_a)).unwrap();
    let b = cp.get_root_signature(vs, Some(ps_b)).unwrap();
    let c = cp.get_root_signature(vs, Some(ps_c)).unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(cp.get_root_signature(vs, Some(ps_c)).unwrap(), c);
    assert_eq!(cp.root_signature_count(), 2);
}

#[test]
fn empty_draw_without_pixel_shader_records_nothing() {
    let mut cp = processor(FenceMode::Immediate);
    setup_color_target(&mut cp);
    let vs = cp.load_shader(ShaderType::Vertex, 0x1000, &[1]);
    cp.set_active_shaders(Some(vs), None);

    assert!(!cp.issue_draw(PrimitiveType::TriangleList, 0, None).unwrap());
    assert!(!cp.is_frame_open());
    assert!(cp.get_current_command_list().is_none());
    assert!(cp.backend().submissions().is_empty());
    assert_eq!(cp.stats().snapshot().draws_skipped, 1);
}

#[test]
fn scratch_buffer_grows_by_increment_and_defers_the_old_one() {
    let config = xenos_gpu::CommandProcessorConfig {
        scratch_increment: 16 * MIB,
        ..test_config()
    };
    let mut cp = processor_with(FenceMode::Manual, config, ScriptedTranslator::new());
    cp.begin_frame().unwrap();

    let first = cp
        .request_scratch_gpu_buffer(10 * MIB, ResourceState::COPY_DEST)
        .unwrap();
    assert_eq!(cp.scratch_buffer_size(), 16 * MIB);
    cp.release_scratch_gpu_buffer(first, ResourceState::COPY_DEST);

    let second = cp
        .request_scratch_gpu_buffer(20 * MIB, ResourceState::COPY_DEST)
        .unwrap();
    assert_ne!(first, second);
    assert_eq!(cp.scratch_buffer_size(), 32 * MIB);
    assert_eq!(cp.backend().buffer_desc(second).unwrap().size, 32 * MIB);
    assert_eq!(cp.pending_deletions(), 1);
    assert!(cp.backend().is_live(first));
    cp.release_scratch_gpu_buffer(second, ResourceState::COPY_DEST);

    let again = cp
        .request_scratch_gpu_buffer(8 * MIB, ResourceState::COPY_DEST)
        .unwrap();
    assert_eq!(again, second);
    assert_eq!(cp.scratch_buffer_size(), 32 * MIB);
    cp.release_scratch_gpu_buffer(again, ResourceState::COPY_DEST);
}

#[test]
#[should_panic(expected = "already in use")]
fn scratch_buffer_cannot_be_held_twice() {
    let mut cp = processor(FenceMode::Immediate);
    cp.begin_frame().unwrap();
    let _held = cp
        .request_scratch_gpu_buffer(MIB, ResourceState::COPY_DEST)
        .unwrap();
    let _ = cp.request_scratch_gpu_buffer(MIB, ResourceState::COPY_DEST);
}

#[test]
fn stale_generation_falls_back_to_a_full_update() {
    let mut cp = processor(FenceMode::Immediate);
    cp.begin_frame().unwrap();

    let full = cp.request_view_descriptors(0, 1, 8);
    assert!(full.is_full);
    let partial = cp.request_view_descriptors(full.full_update, 1, 8);
    assert!(!partial.is_full);
    assert_eq!(partial.full_update, full.full_update);
    assert_eq!(partial.cpu.index, full.cpu.index + 8);

    let other = cp.request_view_descriptors(0, 1, 4);
    assert!(other.is_full);
    let stale = cp.request_view_descriptors(full.full_update, 1, 8);
    assert!(stale.is_full);
    assert!(stale.full_update > other.full_update);
}

#[test]
fn redundant_register_writes_are_coalesced() {
    let mut cp = processor(FenceMode::Immediate);
    setup_color_target(&mut cp);
    bind_shaders(&mut cp, 0x01, 0x02);
    assert!(cp.issue_draw(PrimitiveType::TriangleList, 3, None).unwrap());

    for value in [0x10, 0x20, 0x00] {
        cp.write_register(RB_STENCILREFMASK, value);
    }
    let before = cp.get_current_command_list().unwrap().len();
    assert!(cp.issue_draw(PrimitiveType::TriangleList, 3, None).unwrap());
    let cmds = cp.get_current_command_list().unwrap().cmds();
    assert!(!cmds[before..]
        .iter()
        .any(|cmd| matches!(cmd, HostCmd::SetStencilRef(_))));
    assert_eq!(
        cmds.last(),
        Some(&HostCmd::Draw {
            vertex_count: 3,
            instance_count: 1,
        })
    );
}

#[test]
fn fetch_constant_write_rebinds_textures_at_next_draw() {
    let mut cp = processor_with(FenceMode::Immediate, test_config(), textured_translator());
    setup_color_target(&mut cp);
    bind_shaders(&mut cp, 0x01, 0x12);
    assert!(cp.issue_draw(PrimitiveType::TriangleList, 3, None).unwrap());
    let tables_before = cp.stats().snapshot().sampler_full_updates
        + cp.stats().snapshot().sampler_partial_updates;

    cp.write_register(SHADER_CONSTANT_FETCH_00_0 + 2, 0x1234);
    assert!(cp.issue_draw(PrimitiveType::TriangleList, 3, None).unwrap());
    let tables_after = cp.stats().snapshot().sampler_full_updates
        + cp.stats().snapshot().sampler_partial_updates;
    assert!(tables_after > tables_before);
}

#[test]
fn swap_presents_and_submits() {
    let mut cp = processor(FenceMode::Immediate);
    setup_color_target(&mut cp);
    bind_shaders(&mut cp, 0x01, 0x02);
    assert!(cp.issue_draw(PrimitiveType::TriangleList, 3, None).unwrap());
    cp.perform_swap(0x1000_0000, 1280, 720).unwrap();

    assert!(!cp.is_frame_open());
    let presents = cp.backend().presents();
    assert_eq!(presents.len(), 1);
    assert_eq!(presents[0].source, None);
    let submission = cp.backend().last_submission().unwrap();
    assert!(submission.cmds.iter().any(|cmd| matches!(cmd, HostCmd::Draw { .. })));
    assert_eq!(cp.stats().snapshot().swaps, 1);
}

#[test]
fn cache_clear_happens_at_swap() {
    let mut cp = processor(FenceMode::Manual);
    setup_color_target(&mut cp);
    bind_shaders(&mut cp, 0x01, 0x02);
    assert!(cp.issue_draw(PrimitiveType::TriangleList, 3, None).unwrap());
    assert_eq!(cp.pipeline_cache().pipeline_count(), 1);

    let handle = cp.cache_clear_handle();
    std::thread::spawn(move || handle.request()).join().unwrap();
    assert_eq!(cp.pipeline_cache().pipeline_count(), 1);

    cp.perform_swap(0, 1280, 720).unwrap();
    assert_eq!(cp.pipeline_cache().pipeline_count(), 0);
    assert_eq!(cp.root_signature_count(), 0);
    assert_eq!(cp.render_target_count(), 0);
    assert_eq!(cp.pending_deletions(), 0);
    assert!(!cp.cache_clear_handle().is_pending());

    assert!(cp.issue_draw(PrimitiveType::TriangleList, 3, None).unwrap());
    assert_eq!(cp.pipeline_cache().pipeline_count(), 1);
}

fn recorded(cp: &mut CommandProcessor<NullBackend>) -> Vec<HostCmd> {
    cp.get_current_command_list().unwrap().cmds().to_vec()
}

fn root_tables(cmds: &[HostCmd]) -> Vec<u32> {
    let mut parameters: Vec<u32> = cmds
        .iter()
        .filter_map(|cmd| match cmd {
            HostCmd::SetGraphicsRootDescriptorTable { parameter, .. } => Some(*parameter),
            _ => None,
        })
        .collect();
    parameters.sort_unstable();
    parameters
}

/// Linear 64x64 k_8_8_8_8 texture fetch constant at `base`.
fn write_rgba8_fetch(cp: &mut CommandProcessor<NullBackend>, index: u32, base: u32) {
    let dwords = [
        2 | (2 << 22),
        base | 6,
        63 | (63 << 13),
        (1 << 19) | (1 << 21),
        0,
        1 << 9,
    ];
    for (i, dword) in dwords.into_iter().enumerate() {
        cp.write_register(SHADER_CONSTANT_FETCH_00_0 + index * 6 + i as u32, dword);
    }
}

#[test]
fn render_targets_stay_bound_after_a_dropped_draw() {
    let mut cp = processor(FenceMode::Immediate);
    setup_color_target(&mut cp);
    bind_shaders(&mut cp, 0x01, 0x02);

    let outside = IndexBufferInfo {
        guest_base: 0xFFFF_0000,
        endian: Endian::None,
        format: IndexFormat::Uint16,
        count: 3,
        length: 6,
    };
    assert!(!cp
        .issue_draw(PrimitiveType::TriangleList, 3, Some(&outside))
        .unwrap());
    assert!(cp.issue_draw(PrimitiveType::TriangleList, 3, None).unwrap());

    let cmds = recorded(&mut cp);
    let bind = cmds
        .iter()
        .position(|cmd| matches!(cmd, HostCmd::SetRenderTargets { .. }))
        .expect("render targets bound");
    let draw = cmds
        .iter()
        .position(|cmd| matches!(cmd, HostCmd::Draw { .. }))
        .unwrap();
    assert!(bind < draw);
    assert!(!cmds.iter().any(|cmd| matches!(cmd, HostCmd::DrawIndexed { .. })));
}

#[test]
fn resizing_the_surface_rerecords_the_viewport() {
    let mut cp = processor(FenceMode::Immediate);
    setup_color_target(&mut cp);
    bind_shaders(&mut cp, 0x01, 0x02);
    assert!(cp.issue_draw(PrimitiveType::TriangleList, 3, None).unwrap());

    cp.write_register(RB_SURFACE_INFO, 640);
    cp.write_register(PA_SC_WINDOW_SCISSOR_BR, (480 << 16) | 640);
    assert!(cp.issue_draw(PrimitiveType::TriangleList, 3, None).unwrap());

    let viewports: Vec<(f32, f32)> = recorded(&mut cp)
        .iter()
        .filter_map(|cmd| match cmd {
            HostCmd::SetViewport(Viewport { width, height, .. }) => Some((*width, *height)),
            _ => None,
        })
        .collect();
    assert_eq!(viewports, vec![(1280.0, 720.0), (640.0, 480.0)]);
}

#[test]
fn texture_outside_memory_is_still_made_shader_readable() {
    let mut cp = processor_with(FenceMode::Immediate, test_config(), textured_translator());
    setup_color_target(&mut cp);
    bind_shaders(&mut cp, 0x01, 0x12);
    write_rgba8_fetch(&mut cp, 0, 0x0100_0000);

    assert!(cp.issue_draw(PrimitiveType::TriangleList, 3, None).unwrap());
    assert!(cp.issue_draw(PrimitiveType::TriangleList, 3, None).unwrap());

    let cmds = recorded(&mut cp);
    let to_srv: Vec<&HostCmd> = cmds
        .iter()
        .filter(|cmd| {
            matches!(
                cmd,
                HostCmd::ResourceBarrier { after, .. } if *after == SHADER_RESOURCE_STATE
            )
        })
        .collect();
    assert_eq!(to_srv.len(), 1);
    assert!(matches!(
        to_srv[0],
        HostCmd::ResourceBarrier { before, .. } if *before == ResourceState::COPY_DEST
    ));
    assert!(!cmds
        .iter()
        .any(|cmd| matches!(cmd, HostCmd::CopyBufferToTexture { .. })));
}

#[test]
fn root_signature_switch_rebinds_every_table() {
    let mut cp = processor_with(FenceMode::Immediate, test_config(), textured_translator());
    setup_color_target(&mut cp);

    bind_shaders(&mut cp, 0x01, 0x10);
    assert!(cp.issue_draw(PrimitiveType::TriangleList, 3, None).unwrap());
    let first = recorded(&mut cp);
    assert_eq!(root_tables(&first), vec![0, 1, 2, 3, 4, 5]);

    bind_shaders(&mut cp, 0x01, 0x02);
    assert!(cp.issue_draw(PrimitiveType::TriangleList, 3, None).unwrap());
    let second = recorded(&mut cp)[first.len()..].to_vec();
    assert!(second
        .iter()
        .any(|cmd| matches!(cmd, HostCmd::SetGraphicsRootSignature(_))));
    assert_eq!(root_tables(&second), vec![0, 1, 2, 3, 4]);

    bind_shaders(&mut cp, 0x01, 0x10);
    assert!(cp.issue_draw(PrimitiveType::TriangleList, 3, None).unwrap());
    let third = recorded(&mut cp)[first.len() + second.len()..].to_vec();
    assert!(third
        .iter()
        .any(|cmd| matches!(cmd, HostCmd::SetGraphicsRootSignature(_))));
    assert_eq!(root_tables(&third), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(cp.root_signature_count(), 2);
}

#[test]
fn single_fetch_constant_change_takes_the_partial_path() {
    let mut cp = processor_with(FenceMode::Immediate, test_config(), textured_translator());
    setup_color_target(&mut cp);
    bind_shaders(&mut cp, 0x01, 0x10);
    assert!(cp.issue_draw(PrimitiveType::TriangleList, 3, None).unwrap());
    let before = cp.stats().snapshot();

    cp.write_register(SHADER_CONSTANT_FETCH_00_0 + 6 + 2, 0x1234);
    assert!(cp.issue_draw(PrimitiveType::TriangleList, 3, None).unwrap());
    let after = cp.stats().snapshot();
    assert_eq!(after.view_partial_updates, before.view_partial_updates + 1);
    assert_eq!(after.view_full_updates, before.view_full_updates);

    let cmds = recorded(&mut cp);
    let last_draw = cmds
        .iter()
        .rposition(|cmd| matches!(cmd, HostCmd::Draw { .. }))
        .unwrap();
    let previous_draw = cmds[..last_draw]
        .iter()
        .rposition(|cmd| matches!(cmd, HostCmd::Draw { .. }))
        .unwrap();
    assert_eq!(root_tables(&cmds[previous_draw..last_draw]), vec![0]);
}
