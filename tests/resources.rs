mod support;

use deferred_renderer::renderer::commands::{AttachmentOp, Command, Framebuffer};
use deferred_renderer::renderer::device::{AccelId, BindlessId, BufferId};
use deferred_renderer::renderer::world::RayTracingScene;
use deferred_renderer::renderer::{
    Binding, CommandStream, DeviceFeatures, HeadlessDevice, Overlays, RenderError, SceneInput, ShaderKind,
};
use deferred_renderer::{GpuDevice, RenderSettings};
use support::{setup, setup_on, swapchain_image, MockCamera, EXTENT};

#[test]
fn resize_round_trip_renders_the_same_frame() {
    let (mut orchestrator, mut world, target) = setup(RenderSettings::default());
    let camera = MockCamera::default();

    orchestrator
        .draw(target, 4, Some(SceneInput::new(&mut world, &camera)), &mut Overlays::none())
        .unwrap();
    let before = orchestrator.device_mut().read_pixels(target).unwrap();
    let live = orchestrator.device().live_images();

    orchestrator.resize(800, 600).unwrap();
    assert_eq!(orchestrator.extent().width, 800);
    orchestrator.resize(EXTENT.width, EXTENT.height).unwrap();
    assert_eq!(orchestrator.extent(), EXTENT);
    assert_eq!(orchestrator.device().live_images(), live);

    for set in orchestrator.bound_sets().iter() {
        for image in set.images() {
            assert!(orchestrator.device().image_desc(image).is_some(), "{:?} is stale", image);
        }
    }

    orchestrator
        .draw(target, 4, Some(SceneInput::new(&mut world, &camera)), &mut Overlays::none())
        .unwrap();
    let after = orchestrator.device_mut().read_pixels(target).unwrap();
    assert_eq!(before.checksum(), after.checksum());
}

#[test]
fn zero_and_unchanged_sizes_are_ignored() {
    let (mut orchestrator, _world, _target) = setup(RenderSettings::default());
    let generation = orchestrator.attachments().generation();
    let waits = orchestrator.device().idle_waits();

    orchestrator.resize(0, 600).unwrap();
    orchestrator.resize(EXTENT.width, EXTENT.height).unwrap();

    assert_eq!(orchestrator.attachments().generation(), generation);
    assert_eq!(orchestrator.device().idle_waits(), waits);
}

#[test]
fn applying_the_same_settings_twice_rebuilds_nothing() {
    let (mut orchestrator, _world, _target) = setup(RenderSettings::default());
    let settings = RenderSettings {
        env_mapping: true,
        ..RenderSettings::default()
    };

    let first = orchestrator.apply_settings(settings.clone()).unwrap();
    assert!(!first.changed.is_empty());
    let rebuilds = orchestrator.rebuild_count();
    let generation = orchestrator.attachments().generation();

    let second = orchestrator.apply_settings(settings).unwrap();
    assert!(second.changed.is_empty());
    assert!(!second.reallocated && !second.rebuilt);
    assert_eq!(orchestrator.rebuild_count(), rebuilds);
    assert_eq!(orchestrator.attachments().generation(), generation);
}

#[test]
fn shadow_resolution_change_reallocates_and_rebinds() {
    let (mut orchestrator, mut world, target) = setup(RenderSettings::default());
    let camera = MockCamera::default();
    orchestrator
        .draw(target, 0, Some(SceneInput::new(&mut world, &camera)), &mut Overlays::none())
        .unwrap();
    let generation = orchestrator.attachments().generation();

    let outcome = orchestrator
        .apply_settings(RenderSettings {
            shadow_resolution: 1024,
            ..RenderSettings::default()
        })
        .unwrap();
    assert!(outcome.reallocated && outcome.rebuilt);

    assert_eq!(orchestrator.attachments().generation(), generation + 1);
    let targets = orchestrator.attachments().targets();
    assert!(targets.shadow_maps.iter().all(|map| map.extent.width == 1024));

    // disabling shadows drops the maps and the shadow-map resolve layout
    orchestrator
        .apply_settings(RenderSettings {
            shadow_resolution: 0,
            ..RenderSettings::default()
        })
        .unwrap();
    orchestrator
        .draw(target, 1, Some(SceneInput::new(&mut world, &camera)), &mut Overlays::none())
        .unwrap();
    assert!(orchestrator.attachments().targets().shadow_maps.is_empty());
    let resolve = orchestrator.bound_sets().shadow_resolve.as_ref().unwrap();
    assert_eq!(resolve.layout(), ShaderKind::ShadowResolve);
}

#[test]
fn sets_from_before_a_resize_are_rejected_by_the_device() {
    let (mut orchestrator, mut world, target) = setup(RenderSettings::default());
    let camera = MockCamera::default();
    orchestrator
        .draw(target, 0, Some(SceneInput::new(&mut world, &camera)), &mut Overlays::none())
        .unwrap();
    let stale = orchestrator.bound_sets().tonemapping.clone().unwrap();
    let shaders = deferred_renderer::renderer::Shaders::enumerated();

    orchestrator.resize(640, 360).unwrap();
    let extent = orchestrator.extent();
    let fresh_target = swapchain_image(orchestrator.device_mut(), extent);

    let mut cmd = CommandStream::new(1);
    cmd.set_framebuffer(Framebuffer::color(fresh_target, AttachmentOp::Discard));
    cmd.set_uniforms(shaders.get(ShaderKind::Tonemapping), &stale);
    cmd.draw_fullscreen();
    assert!(matches!(
        orchestrator.device_mut().submit(cmd, None),
        Err(RenderError::StaleBinding(_))
    ));
}

#[test]
fn capture_does_not_disturb_the_live_frame_loop() {
    let camera = MockCamera::default();
    let (mut plain, mut plain_world, plain_target) = setup(RenderSettings::default());
    let (mut captured, mut captured_world, captured_target) = setup(RenderSettings::default());

    for frame in 0..6u8 {
        plain
            .draw(plain_target, frame, Some(SceneInput::new(&mut plain_world, &camera)), &mut Overlays::none())
            .unwrap();

        if frame == 3 {
            let pixels = captured
                .screenshot(frame, Some(SceneInput::new(&mut captured_world, &camera)), &mut Overlays::none())
                .unwrap();
            assert_eq!((pixels.width, pixels.height), (EXTENT.width, EXTENT.height));
            assert_eq!(captured.device().in_flight(), 0);
        }
        captured
            .draw(
                captured_target,
                frame,
                Some(SceneInput::new(&mut captured_world, &camera)),
                &mut Overlays::none(),
            )
            .unwrap();
    }

    let a = plain.device_mut().read_pixels(plain_target).unwrap();
    let b = captured.device_mut().read_pixels(captured_target).unwrap();
    assert_eq!(a.checksum(), b.checksum());
}

#[test]
fn capture_matches_a_live_frame_of_the_same_id() {
    let camera = MockCamera::default();
    let (mut orchestrator, mut world, target) = setup(RenderSettings::default());

    orchestrator
        .draw(target, 2, Some(SceneInput::new(&mut world, &camera)), &mut Overlays::none())
        .unwrap();
    let live = orchestrator.device_mut().read_pixels(target).unwrap();

    let capture_target = swapchain_image(orchestrator.device_mut(), EXTENT);
    let captured = orchestrator
        .capture_into(capture_target, 2, Some(SceneInput::new(&mut world, &camera)), &mut Overlays::none())
        .unwrap();
    assert_eq!(live.checksum(), captured.checksum());
}

#[test]
fn failed_resize_keeps_rendering_at_the_old_size() {
    let (mut orchestrator, mut world, target) = setup(RenderSettings::default());
    let camera = MockCamera::default();
    orchestrator
        .draw(target, 0, Some(SceneInput::new(&mut world, &camera)), &mut Overlays::none())
        .unwrap();
    let before = orchestrator.device_mut().read_pixels(target).unwrap();
    let live = orchestrator.device().live_images();
    let generation = orchestrator.attachments().generation();

    orchestrator.device_mut().set_image_limit(Some(live + 2));
    assert!(matches!(
        orchestrator.resize(800, 600),
        Err(RenderError::Allocation { .. })
    ));
    assert_eq!(orchestrator.extent(), EXTENT);
    assert_eq!(orchestrator.attachments().generation(), generation);
    assert_eq!(orchestrator.device().live_images(), live);

    orchestrator.device_mut().set_image_limit(None);
    orchestrator
        .draw(target, 0, Some(SceneInput::new(&mut world, &camera)), &mut Overlays::none())
        .unwrap();
    let after = orchestrator.device_mut().read_pixels(target).unwrap();
    assert_eq!(before.checksum(), after.checksum());
}

#[test]
fn world_changes_rebind_and_hand_out_targets_again() {
    let (mut orchestrator, mut world, target) = setup(RenderSettings::default());
    let camera = MockCamera::default();
    orchestrator
        .draw(target, 0, Some(SceneInput::new(&mut world, &camera)), &mut Overlays::none())
        .unwrap();
    let rebuilds = orchestrator.rebuild_count();
    assert_eq!(world.resources.len(), 1);

    orchestrator
        .on_world_changed(Some(&mut world as &mut dyn deferred_renderer::WorldView))
        .unwrap();
    assert_eq!(orchestrator.rebuild_count(), rebuilds + 1);
    assert_eq!(world.resources.len(), 2);

    // unloading the world drops every set
    orchestrator.on_world_changed(None).unwrap();
    assert_eq!(orchestrator.rebuild_count(), rebuilds + 2);
    assert!(orchestrator.bound_sets().is_empty());

    orchestrator
        .draw(target, 1, Some(SceneInput::new(&mut world, &camera)), &mut Overlays::none())
        .unwrap();
    assert!(!orchestrator.bound_sets().is_empty());
    assert_eq!(world.resources.len(), 3);
}

#[test]
fn ray_query_shadows_follow_the_world_acceleration_structure() {
    let device = HeadlessDevice::with_features(DeviceFeatures::RAY_QUERY | DeviceFeatures::BINDLESS_NON_UNIFORM);
    let (mut orchestrator, mut world, target) = setup_on(device, RenderSettings::default());
    let camera = MockCamera::default();
    world.bindings.ray_tracing = Some(RayTracingScene {
        tlas: AccelId(1),
        textures: BindlessId(2),
        vertices: BindlessId(3),
        indices: BindlessId(4),
        index_offsets: BufferId(5),
    });

    orchestrator
        .draw(target, 0, Some(SceneInput::new(&mut world, &camera)), &mut Overlays::none())
        .unwrap();
    let resolve = orchestrator.bound_sets().shadow_resolve.clone().unwrap();
    assert_eq!(resolve.layout(), ShaderKind::ShadowResolveRayQuery);
    assert!(resolve
        .bindings()
        .any(|binding| *binding == Binding::AccelerationStructure(AccelId(1))));

    let record = orchestrator.device().last_submission().unwrap();
    let resolved_with_rays = record.stream.commands().iter().any(|command| {
        matches!(
            command,
            Command::SetUniforms { descriptors: Some(set), .. }
                if set.layout() == ShaderKind::ShadowResolveRayQuery
        )
    });
    assert!(resolved_with_rays);

    // the world tears its ray-tracing scene down
    world.bindings.ray_tracing = None;
    let rebuilds = orchestrator.rebuild_count();
    orchestrator.on_acceleration_structure_changed(&mut world).unwrap();
    assert_eq!(orchestrator.rebuild_count(), rebuilds + 1);
    let resolve = orchestrator.bound_sets().shadow_resolve.clone().unwrap();
    assert_eq!(resolve.layout(), ShaderKind::ShadowResolveShadowMap);

    orchestrator
        .draw(target, 1, Some(SceneInput::new(&mut world, &camera)), &mut Overlays::none())
        .unwrap();
}
