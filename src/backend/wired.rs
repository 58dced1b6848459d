// SPDX-License-Identifier: GPL-3.0-only

//! Projection of a mirrored screen onto a physical panel.

use crate::{
    backend::{
        render::{
            rotation::{origin_rotation_transform, ScreenRotation},
            slr::{SlrKey, SlrScaleFunction},
            Canvas,
        },
        virtual_screen::{
            dirty::{VirtualDirty, VirtualDirtyInputs, VirtualDirtyState},
            frame::FrameError,
            FrameOutcome,
        },
        RenderServices,
    },
    state::{MirrorLinkage, RenderNodeArena, RenderThreadParams, ScreenRenderParams},
    utils::{
        geometry::{rect_from_xywh, DamageRects, RectI, RectIExt},
        NodeId,
    },
};
use tiny_skia::{Color, Pixmap, Rect, Transform};
use tracing::{debug, info, trace, warn};

/// Result of [`scale_and_rotate_mirror_for_wired_screen`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WiredProjection {
    pub rotation: ScreenRotation,
    pub main_width: f32,
    pub main_height: f32,
    /// Panel size after the quarter turn swap.
    pub mirror_width: f32,
    pub mirror_height: f32,
    pub slr_copy: bool,
}

/// Rotates and scales `canvas` so the source content fits the panel of the
/// destination, centred and letterboxed.
pub fn scale_and_rotate_mirror_for_wired_screen(
    canvas: &mut Canvas,
    screen: &ScreenRenderParams,
    linkage: &MirrorLinkage<'_>,
    thread: &RenderThreadParams,
    slr: &mut Option<SlrScaleFunction>,
) -> WiredProjection {
    let source_display = linkage.source_display;
    let source = linkage.source_screen;

    let (mut main_width, mut main_height) = match source.property.visible_rect {
        Some(rect) => (rect.size.w as f32, rect.size.h as f32),
        None => (
            source_display.fixed_width as f32,
            source_display.fixed_height as f32,
        ),
    };
    if !source_display.content_rect.is_empty_rect() {
        main_width = source_display.content_rect.size.w as f32;
        main_height = source_display.content_rect.size.h as f32;
    }

    let phy_width = screen.property.phy_width as f32;
    let phy_height = screen.property.phy_height as f32;
    let (mut mirror_width, mut mirror_height) = (phy_width, phy_height);

    let mut rotation = if linkage.display.mirror_source_rotation.is_valid() {
        linkage.display.mirror_source_rotation
    } else {
        source_display.screen_rotation
    };
    let correction = source.property.correction;
    if correction.is_valid() && correction != ScreenRotation::Rotation0 {
        rotation = ScreenRotation::from_index((rotation.index() + 4 - correction.index()) % 4);
    }

    canvas.concat(&origin_rotation_transform(rotation, phy_width, phy_height));
    if rotation.swaps_axes() {
        std::mem::swap(&mut mirror_width, &mut mirror_height);
    }
    canvas.clear(Color::BLACK);

    let slr_copy_mode = source.cache_image.is_some()
        && source.property.visible_rect.is_none()
        && thread.slr_scale_enabled;
    let mut slr_copy = false;
    if slr_copy_mode {
        let key = SlrKey {
            dst_width: mirror_width,
            dst_height: mirror_height,
            src_width: main_width,
            src_height: main_height,
            color_gamut: source.property.color_gamut,
        };
        match slr.as_mut() {
            Some(slr) => {
                slr.check_or_refresh(key);
            }
            None => *slr = Some(SlrScaleFunction::new(key)),
        }
        slr_copy = slr.as_ref().is_some_and(SlrScaleFunction::is_slr_copy);
    }

    if main_width > 0.0 && main_height > 0.0 {
        match slr.as_ref().filter(|_| slr_copy) {
            Some(slr) => slr.canvas_scale(canvas),
            None => {
                let scale = (mirror_width / main_width).min(mirror_height / main_height);
                canvas.translate(
                    (mirror_width - scale * main_width) / 2.0,
                    (mirror_height - scale * main_height) / 2.0,
                );
                canvas.scale(scale, scale);
                canvas.clip_rect(0.0, 0.0, main_width, main_height);
            }
        }
    }

    WiredProjection {
        rotation,
        main_width,
        main_height,
        mirror_width,
        mirror_height,
        slr_copy,
    }
}

/// Mirrors another screen onto a wired destination. The finished frame is
/// kept for the display controller to scan out.
#[derive(Debug)]
pub struct WiredProcessor {
    id: NodeId,
    services: RenderServices,
    slr: Option<SlrScaleFunction>,
    dirty: VirtualDirtyState,
    frame: Option<Pixmap>,
    damage: DamageRects,
    projection: Option<WiredProjection>,
}

impl WiredProcessor {
    pub fn new(id: NodeId, services: RenderServices) -> WiredProcessor {
        WiredProcessor {
            id,
            services,
            slr: None,
            dirty: VirtualDirtyState::default(),
            frame: None,
            damage: DamageRects::new(),
            projection: None,
        }
    }

    pub fn last_frame(&self) -> Option<&Pixmap> {
        self.frame.as_ref()
    }

    pub fn damage(&self) -> &[RectI] {
        &self.damage
    }

    pub fn projection(&self) -> Option<&WiredProjection> {
        self.projection.as_ref()
    }

    pub fn render(
        &mut self,
        screen: &ScreenRenderParams,
        nodes: &RenderNodeArena,
        thread: &RenderThreadParams,
    ) -> Result<FrameOutcome, FrameError> {
        profiling::scope!("wired_mirror_render");
        let result = self.render_frame(screen, nodes, thread);
        if result.is_err() {
            self.dirty.request_refresh();
        }
        result
    }

    fn render_frame(
        &mut self,
        screen: &ScreenRenderParams,
        nodes: &RenderNodeArena,
        thread: &RenderThreadParams,
    ) -> Result<FrameOutcome, FrameError> {
        let Some(linkage) = nodes.resolve_mirror_linkage(screen)? else {
            return Ok(FrameOutcome::Skipped);
        };
        let (width, height) = (screen.property.phy_width, screen.property.phy_height);
        let pixmap = match self.frame.take() {
            Some(pixmap) if (pixmap.width(), pixmap.height()) == (width, height) => pixmap,
            _ => {
                info!(screen = self.id, width, height, "Allocating wired mirror buffer");
                self.dirty.request_refresh();
                Pixmap::new(width, height).ok_or(FrameError::AllocationFailed { width, height })?
            }
        };
        self.dirty.set_surface_size(width as i32, height as i32);

        let mut canvas = Canvas::from_pixmap(pixmap);
        canvas.save();
        let projection =
            scale_and_rotate_mirror_for_wired_screen(&mut canvas, screen, &linkage, thread, &mut self.slr);
        debug!(screen = self.id, ?projection, "Wired mirror projection");

        let source = linkage.source_screen;
        let source_display = linkage.source_display;
        let slr = self.slr.as_ref().filter(|_| projection.slr_copy);
        let matrix = slr
            .map(SlrScaleFunction::scale_matrix)
            .unwrap_or_else(|| canvas.total_matrix())
            .pre_translate(-source_display.offset_x as f32, -source_display.offset_y as f32);

        if thread.virtual_dirty_enabled {
            let inputs = VirtualDirtyInputs {
                canvas_matrix: matrix,
                source_matrix: source.matrix,
                source_dirty: &source.dirty,
                source_hwc_dirty: source.hwc_dirty,
                source_rect: source.bounds(),
                sampling: None,
                buffer_age: 1,
                visible_rect: source.property.visible_rect,
                force_refresh: thread.force_mirror_screen_dirty
                    || screen.mirror_source_changed
                    || !screen.equal_vsync_period,
            };
            match self.dirty.calculate(inputs) {
                VirtualDirty::Skip => {
                    trace!(screen = self.id, "Wired mirror skipped");
                    canvas.restore_to_count(0);
                    self.frame = Some(canvas.into_pixmap());
                    return Ok(FrameOutcome::Skipped);
                }
                VirtualDirty::Damage(damage) => self.damage = damage,
            }
        } else {
            self.damage = std::iter::once(rect_from_xywh(0, 0, width as i32, height as i32)).collect();
        }

        let image = match source.cache_image.as_ref() {
            Some(image) if thread.draw_mirror_cache_image => Some(image),
            _ => source.buffer.as_ref(),
        };
        match (image, slr) {
            (Some(image), Some(slr)) => slr.process_cache_image(&mut canvas, Pixmap::as_ref(image)),
            (Some(image), None) => {
                let src = source.property.visible_rect.unwrap_or_else(|| {
                    rect_from_xywh(
                        source_display.offset_x,
                        source_display.offset_y,
                        projection.main_width as i32,
                        projection.main_height as i32,
                    )
                });
                if let Some(dst) = Rect::from_xywh(0.0, 0.0, projection.main_width, projection.main_height) {
                    canvas.draw_image_rect(Pixmap::as_ref(image), src, dst);
                }
            }
            (None, _) => warn!(screen = self.id, source = source.id, "Mirrored screen has no buffer"),
        }
        canvas.restore_to_count(0);

        self.frame = Some(canvas.into_pixmap());
        self.dirty.frame_queued();
        self.projection = Some(projection);
        self.services.completion.notify(self.id);
        Ok(FrameOutcome::Flushed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        backend::virtual_screen::{
            engine::test::CountingEngine,
            test::{services, split_buffer},
        },
        state::{LogicalDisplayRenderParams, RenderSnapshot, ScreenKind, ScreenProperty},
    };
    use std::sync::Arc;

    fn wired_scene(phy: (u32, u32), rotation: ScreenRotation) -> RenderSnapshot {
        let mut snapshot = RenderSnapshot::default();
        snapshot.nodes.insert(ScreenRenderParams {
            id: 1,
            displays: vec![10],
            property: ScreenProperty {
                width: 100,
                height: 50,
                ..ScreenProperty::default()
            },
            buffer: Some(split_buffer()),
            ..ScreenRenderParams::default()
        });
        snapshot.nodes.insert(LogicalDisplayRenderParams {
            id: 10,
            ancestor_screen: 1,
            fixed_width: 100,
            fixed_height: 50,
            screen_rotation: rotation,
            ..LogicalDisplayRenderParams::default()
        });
        snapshot.nodes.insert(ScreenRenderParams {
            id: 5,
            kind: ScreenKind::Wired,
            mirror_source: Some(1),
            displays: vec![50],
            property: ScreenProperty {
                phy_width: phy.0,
                phy_height: phy.1,
                ..ScreenProperty::default()
            },
            ..ScreenRenderParams::default()
        });
        snapshot.nodes.insert(LogicalDisplayRenderParams {
            id: 50,
            ancestor_screen: 5,
            mirror_source: Some(10),
            ..LogicalDisplayRenderParams::default()
        });
        snapshot
    }

    fn rgb(pixmap: &Pixmap, x: u32, y: u32) -> (u8, u8, u8) {
        let color = pixmap.pixel(x, y).unwrap();
        (color.red(), color.green(), color.blue())
    }

    #[test]
    fn projection_rotation_and_swap() {
        for (rotation, correction, expected, swapped) in [
            (ScreenRotation::Rotation0, ScreenRotation::Rotation0, ScreenRotation::Rotation0, false),
            (ScreenRotation::Rotation90, ScreenRotation::Rotation0, ScreenRotation::Rotation90, true),
            (ScreenRotation::Rotation90, ScreenRotation::Rotation90, ScreenRotation::Rotation0, false),
            (ScreenRotation::Rotation0, ScreenRotation::Rotation90, ScreenRotation::Rotation270, true),
            (ScreenRotation::Rotation180, ScreenRotation::Invalid, ScreenRotation::Rotation180, false),
        ] {
            let mut snapshot = wired_scene((200, 100), rotation);
            snapshot.nodes.screen_mut(1).unwrap().property.correction = correction;
            let screen = snapshot.nodes.screen(5).unwrap();
            let linkage = snapshot.nodes.resolve_mirror_linkage(screen).unwrap().unwrap();
            let mut canvas = Canvas::new(200, 100).unwrap();
            let projection = scale_and_rotate_mirror_for_wired_screen(
                &mut canvas,
                screen,
                &linkage,
                &snapshot.thread,
                &mut None,
            );
            assert_eq!(projection.rotation, expected, "{rotation:?} {correction:?}");
            let dims = if swapped { (100.0, 200.0) } else { (200.0, 100.0) };
            assert_eq!(
                (projection.mirror_width, projection.mirror_height),
                dims,
                "{rotation:?} {correction:?}"
            );
            assert!(!projection.slr_copy);
        }
    }

    #[test]
    fn mirror_override_wins() {
        let mut snapshot = wired_scene((200, 100), ScreenRotation::Rotation90);
        snapshot.nodes.display_mut(50).unwrap().mirror_source_rotation = ScreenRotation::Rotation180;
        let screen = snapshot.nodes.screen(5).unwrap();
        let linkage = snapshot.nodes.resolve_mirror_linkage(screen).unwrap().unwrap();
        let mut canvas = Canvas::new(200, 100).unwrap();
        let projection =
            scale_and_rotate_mirror_for_wired_screen(&mut canvas, screen, &linkage, &snapshot.thread, &mut None);
        assert_eq!(projection.rotation, ScreenRotation::Rotation180);
    }

    #[test]
    fn wired_mirror_is_letterboxed() {
        let snapshot = wired_scene((200, 200), ScreenRotation::Rotation0);
        let mut processor = WiredProcessor::new(5, services(Arc::new(CountingEngine::default())));
        let screen = snapshot.nodes.screen(5).unwrap();

        let outcome = processor.render(screen, &snapshot.nodes, &snapshot.thread).unwrap();
        assert_eq!(outcome, FrameOutcome::Flushed);
        let frame = processor.last_frame().unwrap();
        // 100x50 scaled by two, centred vertically
        assert_eq!(rgb(frame, 50, 100), (255, 0, 0));
        assert_eq!(rgb(frame, 150, 100), (0, 0, 255));
        assert_eq!(rgb(frame, 100, 20), (0, 0, 0));
        assert_eq!(frame.pixel(100, 20).unwrap().alpha(), 255);
        assert_eq!(processor.damage(), &[rect_from_xywh(0, 0, 200, 200)]);

        let outcome = processor.render(screen, &snapshot.nodes, &snapshot.thread).unwrap();
        assert_eq!(outcome, FrameOutcome::Skipped);
    }

    #[test]
    fn wired_redraws_after_irregular_or_failed_frames() {
        let mut snapshot = wired_scene((100, 50), ScreenRotation::Rotation0);
        let mut processor = WiredProcessor::new(5, services(Arc::new(CountingEngine::default())));
        let full = rect_from_xywh(0, 0, 100, 50);
        let render = |processor: &mut WiredProcessor, snapshot: &RenderSnapshot| {
            let screen = snapshot.nodes.screen(5).unwrap();
            processor.render(screen, &snapshot.nodes, &snapshot.thread)
        };

        assert_eq!(render(&mut processor, &snapshot).unwrap(), FrameOutcome::Flushed);
        assert_eq!(render(&mut processor, &snapshot).unwrap(), FrameOutcome::Skipped);

        snapshot.nodes.screen_mut(5).unwrap().equal_vsync_period = false;
        assert_eq!(render(&mut processor, &snapshot).unwrap(), FrameOutcome::Flushed);
        assert_eq!(processor.damage(), &[full]);
        snapshot.nodes.screen_mut(5).unwrap().equal_vsync_period = true;
        assert_eq!(render(&mut processor, &snapshot).unwrap(), FrameOutcome::Skipped);

        snapshot.nodes.display_mut(50).unwrap().mirror_source = Some(99);
        assert!(render(&mut processor, &snapshot).is_err());
        snapshot.nodes.display_mut(50).unwrap().mirror_source = Some(10);
        assert_eq!(render(&mut processor, &snapshot).unwrap(), FrameOutcome::Flushed);
        assert_eq!(processor.damage(), &[full]);
    }
}
