use std::time::Duration;

use image::{Rgba, RgbaImage};
use rasterstack::ops::adjustments::{apply_adjustments, contrast_factor};
use rasterstack::{Adjustments, Engine, EngineEvent, Point, Project};

const WAIT: Duration = Duration::from_secs(20);

fn engine_with_layer(w: u32, h: u32, color: [u8; 4]) -> (Engine, rasterstack::LayerId) {
    let mut engine = Engine::new(Project::new(w, h));
    let id = engine.add_raster_layer("Layer 1");
    engine.attach_pixels(id, RgbaImage::from_pixel(w, h, Rgba(color))).unwrap();
    (engine, id)
}

fn gradient(w: u32, h: u32) -> RgbaImage {
    RgbaImage::from_fn(w, h, |x, y| Rgba([(x * 13) as u8, (y * 7) as u8, ((x + y) * 5) as u8, 200]))
}

#[test]
fn default_adjustments_render_the_surface_unchanged() {
    let mut engine = Engine::new(Project::new(24, 16));
    let id = engine.add_raster_layer("Photo");
    let pixels = gradient(24, 16);
    engine.attach_pixels(id, pixels.clone()).unwrap();

    let rendered = engine.render_layer(id).unwrap();
    assert_eq!(*rendered, pixels);
    assert_eq!(engine.pipeline_runs(), 0);
}

#[test]
fn invert_twice_is_identity_for_masks_and_adjustments() {
    let (mut engine, id) = engine_with_layer(32, 32, [40, 80, 120, 255]);
    engine.mask_fill(id, false).unwrap();
    engine.mask_stroke_soft(id, 16.0, 16.0, 20.0, true).unwrap();
    let before = engine.mask(id).unwrap().clone();
    engine.mask_invert(id).unwrap();
    assert_ne!(engine.mask(id).unwrap(), &before);
    engine.mask_invert(id).unwrap();
    assert_eq!(engine.mask(id).unwrap(), &before);

    let src = gradient(16, 16);
    let invert = Adjustments { invert: true, ..Adjustments::default() };
    let twice = apply_adjustments(&apply_adjustments(&src, &invert), &invert);
    assert_eq!(twice, src);
}

#[test]
fn flood_fill_saturates_a_uniform_layer() {
    let n = 40;
    let (mut engine, id) = engine_with_layer(n, n, [12, 34, 56, 255]);
    let changed = engine.flood_fill(id, 17, 3, Rgba([200, 0, 0, 255]), Some(0)).unwrap();
    assert_eq!(changed, (n * n) as usize);
    assert!(engine.surface(id).unwrap().pixels().all(|p| *p == Rgba([200, 0, 0, 255])));
}

#[test]
fn flood_fill_with_the_seed_colour_changes_nothing() {
    let (mut engine, id) = engine_with_layer(10, 10, [7, 7, 7, 255]);
    let before = engine.surface(id).unwrap().clone();
    assert_eq!(engine.flood_fill(id, 5, 5, Rgba([7, 7, 7, 255]), None).unwrap(), 0);
    assert_eq!(engine.flood_fill(id, -1, 5, Rgba([1, 1, 1, 255]), None).unwrap(), 0);
    assert_eq!(engine.surface(id).unwrap(), &before);
}

#[test]
fn refined_rectangle_without_feather_has_a_hard_edge() {
    let mut engine = Engine::new(Project::new(40, 30));
    let rect = vec![vec![
        Point::new(5.0, 4.0),
        Point::new(25.0, 4.0),
        Point::new(25.0, 20.0),
        Point::new(5.0, 20.0),
    ]];
    let request = engine.request_selection_refine(rect, 0.0, 0.0);

    let Some(EngineEvent::SelectionReady { request: got, mask }) = engine.wait_worker(WAIT) else {
        panic!("no selection reply");
    };
    assert_eq!(got, request);
    assert_eq!(mask.dimensions(), (40, 30));
    for (x, y, p) in mask.enumerate_pixels() {
        let inside = (5..25).contains(&x) && (4..20).contains(&y);
        let on_edge = x == 4 || x == 5 || x == 24 || x == 25 || y == 3 || y == 4 || y == 19 || y == 20;
        if on_edge {
            continue;
        }
        assert_eq!(p[0], if inside { 255 } else { 0 }, "pixel ({}, {})", x, y);
    }
}

#[test]
fn superseded_refine_requests_are_never_delivered() {
    let mut engine = Engine::new(Project::new(64, 64));
    let poly = vec![vec![Point::new(8.0, 8.0), Point::new(50.0, 8.0), Point::new(30.0, 50.0)]];
    let mut latest = 0;
    for i in 0..4 {
        latest = engine.request_selection_refine(poly.clone(), i as f32 * 2.0, 1.0);
    }
    let mut delivered = Vec::new();
    while let Some(event) = engine.wait_worker(WAIT) {
        match event {
            EngineEvent::SelectionReady { request, .. } => delivered.push(request),
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(delivered, vec![latest]);
    assert_eq!(engine.jobs_in_flight(), 0);
}

#[test]
fn invalid_heal_comes_back_as_an_explicit_failure() {
    let (mut engine, id) = engine_with_layer(8, 8, [0, 0, 0, 255]);
    let request = engine.request_spot_heal(id, 4.0, 4.0, 0.5).unwrap();
    match engine.wait_worker(WAIT) {
        Some(EngineEvent::Failed { request: got, reason }) => {
            assert_eq!(got, request);
            assert!(!reason.is_empty());
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[test]
fn heal_reply_lands_on_the_surface() {
    let (mut engine, id) = engine_with_layer(30, 30, [60, 60, 60, 255]);
    engine.surface_mut(id).unwrap().put_pixel(15, 15, Rgba([255, 255, 255, 255]));
    engine.request_spot_heal(id, 15.5, 15.5, 6.0).unwrap();
    match engine.wait_worker(WAIT) {
        Some(EngineEvent::HealApplied { layer_id, .. }) => assert_eq!(layer_id, id),
        other => panic!("expected heal, got {:?}", other),
    }
    assert!(engine.surface(id).unwrap().get_pixel(15, 15)[0] < 200);
}

#[test]
fn checkpoint_restores_the_project_as_it_was() {
    let (mut engine, id) = engine_with_layer(12, 12, [90, 10, 10, 255]);
    engine.set_mask_enabled(id, true).unwrap();
    engine.mask_fill(id, false).unwrap();
    engine.mask_stroke_soft(id, 6.0, 6.0, 8.0, true).unwrap();
    let at_checkpoint = engine.project().clone();
    let cp = engine.add_checkpoint("A").unwrap();
    assert_eq!(engine.project(), &at_checkpoint);

    engine.flood_fill(id, 0, 0, Rgba([0, 0, 255, 255]), Some(0)).unwrap();
    engine
        .set_adjustments(id, Adjustments { brightness: 0.5, ..Adjustments::default() })
        .unwrap();
    engine.mask_fill(id, true).unwrap();
    engine.add_raster_layer("Extra");
    assert_ne!(engine.project(), &at_checkpoint);

    assert!(engine.restore_checkpoint(cp));
    assert_eq!(engine.project(), &at_checkpoint);

    // surface pixels come back from the checkpoint
    engine.render_layer(id).unwrap();
    engine.wait_for_decodes(WAIT);
    assert_eq!(*engine.surface(id).unwrap().get_pixel(0, 0), Rgba([90, 10, 10, 255]));
    assert_eq!(engine.mask(id).unwrap().get_pixel(0, 0)[0], 0);
    assert!(engine.mask(id).unwrap().get_pixel(6, 6)[0] > 0);
}

#[test]
fn checkpoint_bookkeeping() {
    let (mut engine, _) = engine_with_layer(4, 4, [1, 1, 1, 255]);
    let a = engine.add_checkpoint("A").unwrap();
    let b = engine.add_checkpoint("B").unwrap();
    assert_eq!(engine.checkpoints()[0].id, b);
    assert!(engine.rename_checkpoint(a, "Renamed"));
    assert_eq!(engine.checkpoints()[1].label, "Renamed");
    assert!(engine.delete_checkpoint(b));
    assert!(!engine.restore_checkpoint(b));
    assert_eq!(engine.checkpoints().len(), 1);
}

#[test]
fn repeated_render_hits_the_cache() {
    let (mut engine, id) = engine_with_layer(20, 20, [100, 150, 200, 255]);
    engine
        .set_adjustments(id, Adjustments { saturation: -1.0, hue: 30.0, ..Adjustments::default() })
        .unwrap();
    let first = engine.render_layer(id).unwrap();
    let second = engine.render_layer(id).unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(engine.pipeline_runs(), 1);

    engine.flood_fill(id, 0, 0, Rgba([0, 0, 0, 255]), Some(0)).unwrap();
    engine.render_layer(id).unwrap();
    assert_eq!(engine.pipeline_runs(), 2);
}

#[test]
fn full_contrast_pushes_grays_to_the_extremes() {
    assert!(contrast_factor(1.0) > 1.0);

    let mut engine = Engine::new(Project::new(100, 100));
    let id = engine.add_raster_layer("Gray");
    let pixels = RgbaImage::from_fn(100, 100, |x, _| {
        if x < 50 { Rgba([120, 120, 120, 255]) } else { Rgba([136, 136, 136, 255]) }
    });
    engine.attach_pixels(id, pixels).unwrap();
    engine
        .set_adjustments(id, Adjustments { contrast: 1.0, ..Adjustments::default() })
        .unwrap();

    let out = engine.render_layer(id).unwrap();
    assert_eq!(engine.pipeline_runs(), 1);
    assert!(out.get_pixel(10, 50)[0] < 20);
    assert!(out.get_pixel(90, 50)[0] > 235);
}

#[test]
fn soft_stroke_is_brighter_at_the_centre_than_the_corner() {
    let (mut engine, id) = engine_with_layer(64, 64, [255, 255, 255, 255]);
    engine.mask_fill(id, false).unwrap();
    engine.mask_stroke_soft(id, 32.0, 32.0, 92.0, true).unwrap();
    let mask = engine.mask(id).unwrap();
    let centre = mask.get_pixel(32, 32)[0];
    let corner = mask.get_pixel(0, 0)[0];
    assert!(centre > corner, "centre {} corner {}", centre, corner);
    assert!(corner > 0);
}

#[test]
fn masked_layer_flattens_through_its_mask() {
    let mut project = Project::new(10, 10);
    project.background = [0, 0, 0, 255];
    let mut engine = Engine::new(project);
    let id = engine.add_raster_layer("Top");
    engine.attach_pixels(id, RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255]))).unwrap();
    engine.set_mask_enabled(id, true).unwrap();
    engine.mask_fill(id, false).unwrap();
    let square = vec![vec![Point::new(0.0, 0.0), Point::new(5.0, 0.0), Point::new(5.0, 5.0), Point::new(0.0, 5.0)]];
    engine.mask_from_polygons(id, &square, true).unwrap();

    let flat = engine.flatten(1.0).unwrap();
    assert_eq!(*flat.get_pixel(2, 2), Rgba([255, 0, 0, 255]));
    assert_eq!(*flat.get_pixel(8, 8), Rgba([0, 0, 0, 255]));
    assert_eq!(engine.sample_color_at(2.0, 2.0), Some(Rgba([255, 0, 0, 255])));
}

#[test]
fn thumbnail_respects_the_configured_width() {
    let settings = rasterstack::EngineSettings { thumbnail_max_width: 50, ..Default::default() };
    let mut engine = Engine::with_settings(Project::new(200, 80), settings);
    engine.add_raster_layer("Blank");
    assert_eq!(engine.thumbnail().unwrap().dimensions(), (50, 20));
}
