use std::rc::Rc;

use area_present::backend::Modifier;
use area_present::backend::headless::{HeadlessConfig, HeadlessHandle, HeadlessOutput, MemoryAllocator};
use area_present::backend::Fourcc;
use area_present::render::{RasterRenderer, RenderPath, Scene, SceneRenderer, Viewport};
use area_present::shared::{Point, Rect, Region, Size};
use area_present::{FrameScheduler, OutputEvent, OutputHelper, OutputId, OutputOptions};

const BACKGROUND: u32 = 0xff20_2020;
const RED: u32 = 0xffff_0000;

fn scheduler_with(
    config: HeadlessConfig,
    path: RenderPath,
) -> (FrameScheduler<RasterRenderer>, OutputId, HeadlessHandle) {
    scheduler_with_options(config, path, OutputOptions::default())
}

fn scheduler_with_options(
    config: HeadlessConfig,
    path: RenderPath,
    options: OutputOptions,
) -> (FrameScheduler<RasterRenderer>, OutputId, HeadlessHandle) {
    let mut scheduler = FrameScheduler::new(
        RasterRenderer::new(Scene::new(BACKGROUND), path),
        Fourcc::Xrgb8888,
    );
    let (id, handle) = attach_headless(&mut scheduler, config, options);
    scheduler.initialize().unwrap();
    (scheduler, id, handle)
}

fn attach_headless(
    scheduler: &mut FrameScheduler<RasterRenderer>,
    config: HeadlessConfig,
    options: OutputOptions,
) -> (OutputId, HeadlessHandle) {
    let (output, handle) = HeadlessOutput::new(config);
    let helper = OutputHelper::new(Box::new(output), Rc::new(MemoryAllocator::new()), options);
    (scheduler.attach(helper), handle)
}

fn single_output() -> (FrameScheduler<RasterRenderer>, OutputId, HeadlessHandle) {
    scheduler_with(HeadlessConfig::new("HEADLESS-1", Size::new(800, 600)), RenderPath::Software)
}

fn next_frame(scheduler: &mut FrameScheduler<RasterRenderer>, id: OutputId, handle: &HeadlessHandle) {
    assert!(handle.take_page_flip());
    scheduler.handle_output_event(id, OutputEvent::Frame);
}

#[test]
fn first_render_then_damage_commits_rectangle() {
    let (mut scheduler, id, handle) = single_output();
    let mut frames = scheduler.subscribe();
    assert!(scheduler.render_pending());

    assert_eq!(scheduler.render(), 1);
    assert_eq!(handle.commit_count(), 1);
    let done = frames.try_recv().unwrap();
    assert_eq!(done.output, id);
    assert_eq!(done.sequence, 1);
    assert!(frames.try_recv().is_err());

    next_frame(&mut scheduler, id, &handle);
    let rect = Rect::new(100, 100, 50, 50);
    scheduler.handle_output_event(id, OutputEvent::Damage(Some(Region::from_rect(rect))));
    assert_eq!(scheduler.render(), 1);

    assert_eq!(handle.commit_count(), 2);
    let commit = handle.last_commit().unwrap();
    assert_eq!(commit.damage, Some(Region::from_rect(rect)));
    let done = frames.try_recv().unwrap();
    assert_eq!(done.damage, Region::from_rect(rect));
    assert_eq!(done.sequence, 2);
}

#[test]
fn second_render_without_events_is_a_noop() {
    let (mut scheduler, id, handle) = single_output();
    assert_eq!(scheduler.render(), 1);
    assert_eq!(scheduler.render(), 0);
    assert_eq!(handle.commit_count(), 1);

    let helper = scheduler.output(id).unwrap();
    assert!(!helper.is_dirty());
    assert!(!helper.needs_frame());
    assert!(!helper.is_renderable());
}

#[test]
fn update_waits_for_frame_event() {
    let (mut scheduler, id, handle) = single_output();
    scheduler.render();

    scheduler.update();
    assert!(scheduler.render_pending());
    assert_eq!(scheduler.render(), 0);
    assert!(scheduler.output(id).unwrap().is_dirty());

    next_frame(&mut scheduler, id, &handle);
    assert_eq!(scheduler.render(), 1);
    assert_eq!(handle.commit_count(), 2);
}

#[test]
fn needs_frame_without_damage_commits_empty_state() {
    let (mut scheduler, id, handle) = single_output();
    let mut frames = scheduler.subscribe();
    scheduler.render();
    assert_eq!(frames.try_recv().unwrap().sequence, 1);

    next_frame(&mut scheduler, id, &handle);
    scheduler.handle_output_event(id, OutputEvent::NeedsFrame);
    assert_eq!(scheduler.render(), 0);

    assert_eq!(handle.commit_count(), 2);
    assert!(handle.last_commit().unwrap().buffer.is_none());
    let helper = scheduler.output(id).unwrap();
    assert!(!helper.needs_frame());
    assert!(helper.is_renderable());
    assert_eq!(helper.stats().empty_commits, 1);

    let done = frames.try_recv().unwrap();
    assert_eq!(done.output, id);
    assert_eq!(done.sequence, 2);
    assert!(done.damage.is_empty());
}

#[test]
fn rejected_modifiers_fall_back_to_implicit() {
    let mut config = HeadlessConfig::new("HEADLESS-1", Size::new(320, 240));
    config.reject_modifiers = true;
    let (mut scheduler, _, handle) = scheduler_with(config, RenderPath::Software);

    assert_eq!(scheduler.render(), 1);
    let format = handle.last_commit().unwrap().format.unwrap();
    assert_eq!(format.modifier, Modifier::INVALID);
}

#[test]
fn failed_commit_keeps_output_dirty_and_retries() {
    let (mut scheduler, id, handle) = single_output();
    handle.fail_next_commits(1);

    assert_eq!(scheduler.render(), 0);
    let helper = scheduler.output(id).unwrap();
    assert!(helper.is_dirty());
    assert!(helper.is_renderable());
    assert!(helper.pending().buffer.is_some());
    assert_eq!(helper.stats().commit_failures, 1);

    assert_eq!(scheduler.render(), 1);
    assert_eq!(handle.commit_count(), 1);
    assert!(scheduler.output(id).unwrap().pending().is_empty());
}

#[test]
fn software_frames_match_a_full_redraw() {
    let (mut scheduler, id, handle) = single_output();
    let item = scheduler
        .renderer_mut()
        .scene_mut()
        .add_item(Rect::new(10, 10, 100, 60), RED, 0);

    let mut position = Point::new(10, 10);
    for step in 0..6 {
        if step > 0 {
            next_frame(&mut scheduler, id, &handle);
        }
        position = Point::new(position.x + 37, position.y + 23);
        scheduler.renderer_mut().scene_mut().move_item(item, position);
        scheduler.update();
        assert_eq!(scheduler.render(), 1);
    }

    let mut reference_scene = Scene::new(BACKGROUND);
    reference_scene.add_item(Rect::new(position.x, position.y, 100, 60), RED, 0);
    let mut reference = RasterRenderer::new(reference_scene, RenderPath::Accelerated);
    let helper = scheduler.output(id).unwrap();
    let front = helper.front_buffer().unwrap();
    let mut expected = area_present::backend::Buffer::new(
        area_present::backend::BufferId(u64::MAX),
        Size::new(800, 600),
        front.format(),
    );
    reference
        .render_into(&mut expected, helper.viewport(), &Region::new())
        .unwrap();
    assert!(front.buffer().pixels() == expected.pixels());

    // Partial repaints only
    let last = handle.last_commit().unwrap();
    assert!(last.damage.unwrap().area() < 800 * 600);
}

#[test]
fn two_slot_output_recovers_from_failed_commit() {
    let options = OutputOptions {
        swapchain_slots: 2,
        ..Default::default()
    };
    let (mut scheduler, id, handle) = scheduler_with_options(
        HeadlessConfig::new("HEADLESS-1", Size::new(800, 600)),
        RenderPath::Software,
        options,
    );
    assert_eq!(scheduler.render(), 1);

    next_frame(&mut scheduler, id, &handle);
    let rect = Rect::new(40, 40, 20, 20);
    scheduler.handle_output_event(id, OutputEvent::Damage(Some(Region::from_rect(rect))));
    handle.fail_next_commits(1);
    assert_eq!(scheduler.render(), 0);

    // front and the failed frame hold both slots until the next acquire
    assert_eq!(scheduler.render(), 1);
    assert_eq!(handle.commit_count(), 2);
    assert_eq!(handle.last_commit().unwrap().damage, Some(Region::from_rect(rect)));
    let stats = scheduler.output(id).unwrap().stats();
    assert_eq!(stats.commit_failures, 1);
    assert_eq!(stats.skipped, 1);
}

#[test]
fn output_attached_after_initialize_gets_first_frame() {
    let (mut scheduler, _, _) = single_output();
    scheduler.render();
    assert!(!scheduler.render_pending());
    let mut frames = scheduler.subscribe();

    let (late, handle) = attach_headless(
        &mut scheduler,
        HeadlessConfig::new("HEADLESS-2", Size::new(320, 240)),
        OutputOptions::default(),
    );
    assert!(scheduler.render_pending());
    assert_eq!(scheduler.render(), 1);
    assert_eq!(handle.commit_count(), 1);
    assert_eq!(frames.try_recv().unwrap().output, late);
}

#[test]
fn detached_output_is_left_out_of_next_render() {
    let (mut scheduler, first, first_handle) = single_output();
    let (second, second_handle) = attach_headless(
        &mut scheduler,
        HeadlessConfig::new("HEADLESS-2", Size::new(320, 240)),
        OutputOptions::default(),
    );
    assert_eq!(scheduler.render(), 2);

    next_frame(&mut scheduler, first, &first_handle);
    next_frame(&mut scheduler, second, &second_handle);
    scheduler.update();
    let mut frames = scheduler.subscribe();
    assert!(scheduler.detach(second).is_some());

    assert_eq!(scheduler.render(), 1);
    assert_eq!(first_handle.commit_count(), 2);
    assert_eq!(second_handle.commit_count(), 1);
    assert_eq!(frames.try_recv().unwrap().output, first);
    assert!(frames.try_recv().is_err());
}

#[test]
fn accelerated_path_reports_frame_damage() {
    let (mut scheduler, id, handle) =
        scheduler_with(HeadlessConfig::new("HEADLESS-1", Size::new(200, 100)), RenderPath::Accelerated);
    scheduler.render();

    next_frame(&mut scheduler, id, &handle);
    let rect = Rect::new(0, 0, 10, 10);
    scheduler.handle_output_event(id, OutputEvent::Damage(Some(Region::from_rect(rect))));
    scheduler.render();
    assert_eq!(handle.last_commit().unwrap().damage, Some(Region::from_rect(rect)));
}

#[test]
fn scaled_output_maps_scene_damage() {
    let mut config = HeadlessConfig::new("HEADLESS-1", Size::new(400, 300));
    config.scale = 2.0;
    let (mut scheduler, id, handle) = scheduler_with(config, RenderPath::Software);
    scheduler.render();

    scheduler.renderer_mut().scene_mut().damage_rect(Rect::new(10, 10, 5, 5));
    scheduler.update();
    next_frame(&mut scheduler, id, &handle);
    scheduler.render();

    let viewport: Viewport = *scheduler.output(id).unwrap().viewport();
    assert_eq!(viewport.logical_size(), Size::new(200, 150));
    assert_eq!(
        handle.last_commit().unwrap().damage,
        Some(Region::from_rect(Rect::new(20, 20, 10, 10)))
    );
}

#[test]
fn mode_change_renegotiates_buffers() {
    let (mut scheduler, id, handle) = single_output();
    scheduler.render();

    let mode = area_present::backend::Mode::new(Size::new(1024, 768), 60_000);
    handle.set_mode(mode);
    scheduler.handle_output_event(
        id,
        OutputEvent::ModeChanged {
            mode,
            scale: 1.0,
            transform: Default::default(),
        },
    );
    next_frame(&mut scheduler, id, &handle);
    assert_eq!(scheduler.render(), 1);

    let commit = handle.last_commit().unwrap();
    assert_eq!(commit.damage, Some(Region::from_rect(Rect::new(0, 0, 1024, 768))));
    assert_eq!(
        scheduler.output(id).unwrap().front_buffer().unwrap().size(),
        Size::new(1024, 768)
    );
}

#[test]
fn disabled_output_is_skipped() {
    let (mut scheduler, id, handle) = single_output();
    handle.set_enabled(false);
    scheduler.handle_output_event(id, OutputEvent::Enabled(false));
    assert_eq!(scheduler.render(), 0);
    assert_eq!(handle.commit_count(), 0);

    handle.set_enabled(true);
    scheduler.handle_output_event(id, OutputEvent::Enabled(true));
    assert_eq!(scheduler.render(), 1);
}
