use std::sync::Arc;

use glam::Vec4;
use naga::valid::{Capabilities, ValidationFlags, Validator};
use strata_shared::Raster;

use super::*;
use crate::layer::ImagePreparation;
use crate::process::{ColorMapProcess, IdentityProcess, LayerProcess};

fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Arc<Raster> {
    let bytes = rgba.repeat((width * height) as usize);
    Arc::new(Raster::from_rgba8(width, height, bytes).unwrap())
}

fn registry_with(images: &[Arc<Raster>]) -> (LayerRegistry, Vec<LayerId>) {
    let mut registry = LayerRegistry::new();
    let ids = images
        .iter()
        .map(|image| {
            let id = registry.add();
            registry
                .get_mut(id)
                .unwrap()
                .set_image(
                    Some(image.clone()),
                    false,
                    ImagePreparation {
                        pad_to_power_of_2: false,
                        max_copy_size: 0,
                    },
                )
                .unwrap();
            id
        })
        .collect();
    (registry, ids)
}

/// Bottom process first
fn stack(processes: Vec<Arc<dyn LayerProcess>>) -> ProcessStack {
    let mut stack = ProcessStack::default();
    for process in processes {
        stack.push(process);
    }
    stack
}

fn units_of(registry: &LayerRegistry, info: &ProcessInfo) -> Vec<u32> {
    info.used_layers()
        .iter()
        .filter_map(|id| registry.get(*id).and_then(|layer| layer.texture_unit()))
        .collect()
}

fn fragment_code(registry: &LayerRegistry, processes: &ProcessStack, info: &ProcessInfo) -> String {
    let units = units_of(registry, info);
    FragmentShader {
        layers: registry,
        processes,
        is_on: true,
        units: &units,
        color_sequence: info.needs_color_sequence(),
        nr_proc: info.nr_proc,
        stack_is_opaque: info.stack_is_opaque,
    }
    .code()
}

fn validate(code: &str) {
    let module = naga::front::wgsl::parse_str(code)
        .unwrap_or_else(|err| panic!("{}\n{code}", err.emit_to_string(code)));
    Validator::new(ValidationFlags::all(), Capabilities::all())
        .validate(&module)
        .unwrap_or_else(|err| panic!("{err:?}\n{code}"));
}

#[test]
fn test_opaque_top_process_ends_stack() {
    let (mut registry, ids) = registry_with(&[solid(4, 4, [255, 0, 0, 255]), solid(4, 4, [0, 255, 0, 255])]);
    let processes = stack(vec![
        Arc::new(IdentityProcess::new(ids[0])),
        Arc::new(IdentityProcess::new(ids[1])),
    ]);

    let info = process_info(&registry, &processes, true, 8, false);
    assert!(info.use_shaders);
    assert!(info.stack_is_opaque);
    assert_eq!(info.nr_proc, 1);
    assert_eq!(info.used_layers(), &[ids[1]]);
    assert_eq!(info.layer_ids.as_slice(), &[ids[1], ids[0]]);

    assign_texture_units(&mut registry, &info, 8, ids[0]);
    assert_eq!(registry.get(ids[1]).unwrap().texture_unit(), Some(1));
    assert_eq!(registry.get(ids[0]).unwrap().texture_unit(), None);
}

#[test]
fn test_translucent_processes_are_all_folded() {
    let (mut registry, ids) = registry_with(&[solid(4, 4, [255, 0, 0, 255]), solid(4, 4, [0, 255, 0, 255])]);
    let processes = stack(vec![
        Arc::new(IdentityProcess::new(ids[0]).with_opacity(0.5)),
        Arc::new(IdentityProcess::new(ids[1]).with_opacity(0.5)),
    ]);

    let info = process_info(&registry, &processes, true, 8, false);
    assert!(info.use_shaders);
    assert!(!info.stack_is_opaque);
    assert_eq!(info.nr_proc, 2);
    assert_eq!(info.used_layers(), &[ids[1], ids[0]]);

    assign_texture_units(&mut registry, &info, 8, ids[0]);
    assert_eq!(units_of(&registry, &info), vec![1, 2]);
}

#[test]
fn test_unit_budget_exhaustion() {
    let (registry, ids) = registry_with(&[solid(4, 4, [255, 0, 0, 255]), solid(4, 4, [0, 255, 0, 255])]);
    let processes = stack(vec![
        Arc::new(IdentityProcess::new(ids[0]).with_opacity(0.5)),
        Arc::new(IdentityProcess::new(ids[1]).with_opacity(0.5)),
    ]);

    let strict = process_info(&registry, &processes, true, 2, false);
    assert!(!strict.use_shaders);
    assert_eq!(strict.used_layers(), &[ids[1]]);

    let lenient = process_info(&registry, &processes, true, 2, true);
    assert!(lenient.use_shaders);
    assert_eq!(lenient.nr_proc, 1);
    assert_eq!(lenient.used_layers(), &[ids[1]]);
    assert_eq!(lenient.layer_ids.as_slice(), &[ids[1], ids[0]]);
}

#[test]
fn test_color_map_reserves_color_sequence() {
    let (mut registry, ids) = registry_with(&[solid(4, 4, [10, 20, 30, 255])]);
    let processes = stack(vec![Arc::new(ColorMapProcess::new(ids[0], 0))]);

    let info = process_info(&registry, &processes, true, 8, false);
    assert!(info.needs_color_sequence());
    assert_eq!(info.used_layers(), &[LayerId::COLOR_SEQUENCE, ids[0]]);

    assign_texture_units(&mut registry, &info, 8, ids[0]);
    assert_eq!(registry.get(ids[0]).unwrap().texture_unit(), Some(1));
}

#[test]
fn test_fully_transparent_process_is_skipped() {
    let (registry, ids) = registry_with(&[solid(4, 4, [255, 0, 0, 255])]);
    let processes = stack(vec![Arc::new(IdentityProcess::new(ids[0]).with_opacity(0.0))]);

    let info = process_info(&registry, &processes, true, 8, false);
    assert!(info.used_layers().is_empty());
    assert_eq!(info.layer_ids.as_slice(), &[ids[0]]);
    assert!(!info.stack_is_opaque);
}

#[test]
fn test_switched_off_stack_folds_nothing() {
    let (registry, ids) = registry_with(&[solid(4, 4, [255, 0, 0, 255])]);
    let processes = stack(vec![Arc::new(IdentityProcess::new(ids[0]))]);

    let info = process_info(&registry, &processes, false, 8, false);
    assert_eq!(info.nr_proc, 0);
    assert!(info.layer_ids.is_empty());
}

#[test]
fn test_undef_masks_follow_their_layer() {
    let (mut registry, ids) = registry_with(&[
        solid(4, 4, [255, 0, 0, 255]),
        solid(4, 4, [0, 0, 0, 0]),
        solid(4, 4, [255, 255, 255, 255]),
    ]);
    registry.set_undef_layer(ids[0], Some(ids[1])).unwrap();
    registry.set_stack_undef_layer(Some(ids[2]));
    let processes = stack(vec![Arc::new(IdentityProcess::new(ids[0]))]);

    let info = process_info(&registry, &processes, true, 8, false);
    assert_eq!(info.used_layers(), &[ids[2], ids[0], ids[1]]);

    assign_texture_units(&mut registry, &info, 8, ids[0]);
    assert_eq!(units_of(&registry, &info), vec![1, 2, 3]);
}

#[test]
fn test_units_without_shaders_go_to_composite() {
    let (mut registry, ids) = registry_with(&[solid(4, 4, [255, 0, 0, 255]), solid(4, 4, [0, 255, 0, 255])]);
    let info = ProcessInfo {
        use_shaders: false,
        ..Default::default()
    };

    assign_texture_units(&mut registry, &info, 8, ids[0]);
    assert_eq!(registry.get(ids[0]).unwrap().texture_unit(), Some(0));
    assert_eq!(registry.get(ids[1]).unwrap().texture_unit(), None);
}

#[test]
fn test_color_sequence_rows() {
    let processes = stack(vec![
        Arc::new(ColorMapProcess::new(LayerId(1), 0).with_colors(&[[1, 2, 3, 255]])),
        Arc::new(IdentityProcess::new(LayerId(2))),
    ]);

    let raster = color_sequence_raster(&processes);
    assert_eq!((raster.width(), raster.height()), (256, 2));
    let row_size = raster.row_size();
    assert_eq!(&raster.data()[..4], &[1, 2, 3, 255]);
    assert!(raster.data()[row_size..].iter().all(|b| *b == 0));

    assert_eq!(color_sequence_coord(0, 2), 0.25);
    assert_eq!(color_sequence_coord(1, 3), 0.375);
}

#[test]
fn test_vertex_shader_validates() {
    validate(&vertex_shader_code(&[]));
    validate(&vertex_shader_code(&[1, 2]));
}

#[test]
fn test_empty_stack_fragment_validates() {
    let registry = LayerRegistry::new();
    let processes = ProcessStack::default();
    let info = process_info(&registry, &processes, true, 8, false);

    let code = fragment_code(&registry, &processes, &info);
    assert!(code.contains("frag = vec4<f32>(1.0, 1.0, 1.0, 1.000000)"));
    validate(&code);
}

#[test]
fn test_translucent_fragment_validates() {
    let (mut registry, ids) = registry_with(&[solid(4, 4, [255, 0, 0, 255]), solid(4, 4, [0, 255, 0, 255])]);
    let processes = stack(vec![
        Arc::new(IdentityProcess::new(ids[0]).with_opacity(0.5)),
        Arc::new(IdentityProcess::new(ids[1]).with_opacity(0.25)),
    ]);
    let info = process_info(&registry, &processes, true, 8, false);
    assign_texture_units(&mut registry, &info, 8, ids[0]);

    let code = fragment_code(&registry, &processes, &info);
    assert!(code.contains("if frag.a < 1.0"));
    assert!(code.contains("1.0, 1.0, 1.0, 0.250000"));
    validate(&code);
}

#[test]
fn test_color_map_with_mask_fragment_validates() {
    let (mut registry, ids) = registry_with(&[
        solid(4, 4, [128, 0, 0, 255]),
        solid(4, 4, [0, 0, 0, 0]),
        solid(4, 4, [0, 0, 255, 255]),
    ]);
    registry.set_undef_layer(ids[0], Some(ids[1])).unwrap();
    registry.get_mut(ids[0]).unwrap().set_undef_color_source(Vec4::new(0.0, 0.0, 0.0, 1.0));
    let processes = stack(vec![
        Arc::new(ColorMapProcess::new(ids[0], 0).with_range(0.0, 2.0)),
        Arc::new(IdentityProcess::new(ids[2]).with_opacity(0.5)),
    ]);
    let info = process_info(&registry, &processes, true, 8, false);
    assert!(info.needs_color_sequence());
    assign_texture_units(&mut registry, &info, 8, ids[0]);

    let code = fragment_code(&registry, &processes, &info);
    assert!(code.contains("var texture0: texture_2d<f32>"));
    assert!(code.contains("apply_undef(col,"));
    validate(&code);
}

#[test]
fn test_stack_undef_fragment_validates() {
    for color in [Vec4::new(1.0, 0.0, 0.0, 1.0), Vec4::new(0.0, 0.0, 1.0, 0.5), Vec4::ZERO] {
        let (mut registry, ids) =
            registry_with(&[solid(4, 4, [255, 0, 0, 255]), solid(4, 4, [255, 255, 255, 255])]);
        registry.set_stack_undef_layer(Some(ids[1]));
        registry.stack_undef_color = color;
        let processes = stack(vec![Arc::new(IdentityProcess::new(ids[0]))]);
        let info = process_info(&registry, &processes, true, 8, false);
        assign_texture_units(&mut registry, &info, 8, ids[0]);

        let code = fragment_code(&registry, &processes, &info);
        assert!(code.contains("let udf = texel1.r;"));
        if color.w >= 1.0 {
            assert!(code.contains("mix(frag, udfcol"));
        }
        validate(&code);
    }
}

#[test]
fn test_single_opaque_layer_fragment_is_one_sample() {
    let (mut registry, ids) = registry_with(&[solid(4, 4, [12, 34, 56, 255])]);
    let processes = stack(vec![Arc::new(IdentityProcess::new(ids[0]))]);
    let info = process_info(&registry, &processes, true, 8, false);
    assert!(info.stack_is_opaque);
    assign_texture_units(&mut registry, &info, 8, ids[0]);
    assert_eq!(units_of(&registry, &info), vec![1]);

    let code = fragment_code(&registry, &processes, &info);
    assert_eq!(code.matches("textureSample(").count(), 1);
    assert!(code.contains("let texel1 = textureSample(texture1, sampler1, in.tex_coord1);"));
    assert!(code.contains("var col = texel1;"));
    assert!(code.contains("col.a *= 1.000000;"));
    assert!(!code.contains("apply_undef(col,"));
    assert!(!code.contains("if frag.a < 1.0"));
    assert!(!code.contains("udf"));
    validate(&code);
}

#[test]
fn test_unit_zero_stays_reserved() {
    let (mut registry, ids) = registry_with(&[solid(4, 4, [255, 0, 0, 255]), solid(4, 4, [0, 255, 0, 255])]);
    let processes = stack(vec![
        Arc::new(IdentityProcess::new(ids[0]).with_opacity(0.5)),
        Arc::new(IdentityProcess::new(ids[1]).with_opacity(0.5)),
    ]);

    let info = process_info(&registry, &processes, true, 2, true);
    assert_eq!(info.used_layers(), &[ids[1]]);
    assign_texture_units(&mut registry, &info, 2, ids[0]);
    assert_eq!(units_of(&registry, &info), vec![1]);

    let info = process_info(&registry, &processes, true, 3, false);
    assert_eq!(info.nr_proc, 2);
    assign_texture_units(&mut registry, &info, 3, ids[0]);
    assert_eq!(units_of(&registry, &info), vec![1, 2]);
}
