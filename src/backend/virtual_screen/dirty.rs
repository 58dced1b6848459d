// SPDX-License-Identifier: GPL-3.0-only

//! Partial redraw of mirror destinations.
//!
//! The source screen publishes the dirty rectangles of its last frames. A
//! destination maps as much of that history as its buffer age requires
//! through the mirror transform and adds its own accumulated dirty region.

use crate::utils::geometry::{
    empty_rect, map_rect, rect_from_xywh, region_or_rect, DamageRects, RectI, RectIExt,
};
use std::collections::VecDeque;
use tiny_skia::Transform;
use tracing::trace;

pub const DIRTY_HISTORY_MAX_LEN: usize = 5;

/// Per-frame dirty rectangles of a screen, newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirtyHistory {
    frames: VecDeque<DamageRects>,
}

impl DirtyHistory {
    pub fn new() -> DirtyHistory {
        DirtyHistory::default()
    }

    pub fn push_frame(&mut self, rects: impl IntoIterator<Item = RectI>) {
        let frame = rects.into_iter().filter(|r| !r.is_empty_rect()).collect();
        self.frames.push_front(frame);
        self.frames.truncate(DIRTY_HISTORY_MAX_LEN);
    }

    /// Adds `rects` to the frame currently being drawn.
    pub fn add_to_current(&mut self, rects: impl IntoIterator<Item = RectI>) {
        if self.frames.is_empty() {
            self.frames.push_front(DamageRects::new());
        }
        if let Some(frame) = self.frames.front_mut() {
            frame.extend(rects.into_iter().filter(|r| !r.is_empty_rect()));
        }
    }

    pub fn current_frame(&self) -> &[RectI] {
        self.frames.front().map(|frame| frame.as_slice()).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Everything that changed in the last `buffer_age` frames, clipped to `screen`.
///
/// An age of 0 means the buffer content is unknown, and an age beyond the
/// recorded history cannot be reconstructed, so both yield the full screen.
pub fn merge_dirty_history(history: &DirtyHistory, buffer_age: u32, screen: RectI) -> DamageRects {
    let mut merged = DamageRects::new();
    let age = buffer_age as usize;
    if age == 0 || age > history.len() {
        region_or_rect(&mut merged, screen);
        return merged;
    }
    for frame in history.frames.iter().take(age) {
        for rect in frame {
            region_or_rect(&mut merged, rect.intersect_rect(&screen));
        }
    }
    merged
}

/// Dirty region a destination accumulates on its own, on top of what it mirrors.
#[derive(Debug, Clone)]
pub struct DirtyRegionManager {
    surface: RectI,
    current: RectI,
    history: VecDeque<RectI>,
    merged: RectI,
}

impl Default for DirtyRegionManager {
    fn default() -> DirtyRegionManager {
        DirtyRegionManager {
            surface: empty_rect(),
            current: empty_rect(),
            history: VecDeque::new(),
            merged: empty_rect(),
        }
    }
}

impl DirtyRegionManager {
    pub fn set_surface_size(&mut self, width: i32, height: i32) {
        let surface = rect_from_xywh(0, 0, width, height);
        if surface != self.surface {
            self.surface = surface;
            self.history.clear();
        }
    }

    pub fn surface_rect(&self) -> RectI {
        self.surface
    }

    pub fn reset_dirty_as_surface_size(&mut self) {
        self.current = self.surface;
    }

    pub fn merge_dirty_rect(&mut self, rect: RectI) {
        self.current = self.current.join_rect(&rect.intersect_rect(&self.surface));
    }

    pub fn current_frame_dirty(&self) -> RectI {
        self.current
    }

    /// Closes the current frame and merges what a buffer of `buffer_age` misses.
    pub fn update_dirty(&mut self, buffer_age: u32) {
        self.history.push_front(self.current);
        self.history.truncate(DIRTY_HISTORY_MAX_LEN);
        self.current = empty_rect();

        let age = buffer_age as usize;
        self.merged = if age == 0 || age > self.history.len() {
            self.surface
        } else {
            self.history
                .iter()
                .take(age)
                .fold(empty_rect(), |merged, rect| merged.join_rect(rect))
        };
    }

    pub fn dirty_region(&self) -> RectI {
        self.merged
    }
}

/// Sampling applied by the source screen before its content is mirrored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingInfo {
    pub scale: f32,
    pub translate_x: f32,
    pub translate_y: f32,
    /// Extra margin the sampling filter reads around each pixel.
    pub distance: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct VirtualDirtyInputs<'a> {
    /// Source to destination mapping used this frame.
    pub canvas_matrix: Transform,
    pub source_matrix: Transform,
    pub source_dirty: &'a DirtyHistory,
    pub source_hwc_dirty: RectI,
    pub source_rect: RectI,
    pub sampling: Option<SamplingInfo>,
    pub buffer_age: u32,
    pub visible_rect: Option<RectI>,
    /// Any refresh request from outside, like a forced mirror dirty or a changed source.
    pub force_refresh: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VirtualDirty {
    /// Nothing changed, the previous buffer is still valid.
    Skip,
    Damage(DamageRects),
}

/// Cross-frame dirty tracking of one destination.
#[derive(Debug, Clone)]
pub struct VirtualDirtyState {
    last_canvas_matrix: Option<Transform>,
    last_source_matrix: Option<Transform>,
    last_visible_rect: Option<RectI>,
    need_refresh: bool,
    /// Source frames covered by each queued frame, newest first. `None` for
    /// a frame queued after source frames went by unseen.
    spans: VecDeque<Option<u32>>,
    /// Calculations skipped since the last queued frame.
    skipped: u32,
    gap: bool,
    manager: DirtyRegionManager,
}

impl Default for VirtualDirtyState {
    fn default() -> VirtualDirtyState {
        VirtualDirtyState {
            last_canvas_matrix: None,
            last_source_matrix: None,
            last_visible_rect: None,
            need_refresh: true,
            spans: VecDeque::new(),
            skipped: 0,
            gap: true,
            manager: DirtyRegionManager::default(),
        }
    }
}

impl VirtualDirtyState {
    pub fn set_surface_size(&mut self, width: i32, height: i32) {
        self.manager.set_surface_size(width, height);
    }

    pub fn manager(&self) -> &DirtyRegionManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut DirtyRegionManager {
        &mut self.manager
    }

    /// The next calculation redraws the whole destination, and older buffers
    /// can no longer be patched from the source history.
    pub fn request_refresh(&mut self) {
        self.need_refresh = true;
        self.gap = true;
    }

    /// The frame of the last calculation reached the consumer.
    pub fn frame_queued(&mut self) {
        let span = (!self.gap).then_some(self.skipped + 1);
        self.spans.push_front(span);
        self.spans.truncate(DIRTY_HISTORY_MAX_LEN);
        self.skipped = 0;
        self.gap = false;
    }

    /// Source frames a buffer of `buffer_age` is behind, 0 if unknown.
    fn source_age(&self, buffer_age: u32) -> u32 {
        let Some(older) = buffer_age.checked_sub(1) else {
            return 0;
        };
        let older = older as usize;
        if self.spans.len() < older {
            return 0;
        }
        self.spans
            .iter()
            .take(older)
            .try_fold(self.skipped + 1, |age, span| {
                span.and_then(|span| age.checked_add(span))
            })
            .unwrap_or(0)
    }

    pub fn calculate(&mut self, inputs: VirtualDirtyInputs<'_>) -> VirtualDirty {
        profiling::scope!("calculate_virtual_dirty");
        let visible_rect_changed = inputs.visible_rect != self.last_visible_rect;
        let need_refresh = self.need_refresh
            || inputs.force_refresh
            || self.last_canvas_matrix != Some(inputs.canvas_matrix)
            || self.last_source_matrix != Some(inputs.source_matrix)
            || visible_rect_changed
            || !self.manager.current_frame_dirty().is_empty_rect();
        self.last_visible_rect = inputs.visible_rect;
        if need_refresh {
            self.manager.reset_dirty_as_surface_size();
            self.need_refresh = false;
            self.last_canvas_matrix = Some(inputs.canvas_matrix);
            self.last_source_matrix = Some(inputs.source_matrix);
        }

        if inputs.source_dirty.current_frame().is_empty()
            && inputs.source_hwc_dirty.is_empty_rect()
            && !need_refresh
        {
            trace!("Mirror source has no dirty, skipping frame");
            self.skipped = self.skipped.saturating_add(1);
            return VirtualDirty::Skip;
        }

        let mut damage = DamageRects::new();
        let source_age = self.source_age(inputs.buffer_age);
        for rect in merge_dirty_history(inputs.source_dirty, source_age, inputs.source_rect) {
            region_or_rect(&mut damage, map_rect(&inputs.canvas_matrix, &rect));
        }

        let mut hwc = inputs.source_hwc_dirty;
        if !hwc.is_empty_rect() {
            if let Some(sampling) = inputs.sampling.filter(|s| s.scale > 0.0) {
                let matrix = Transform::from_row(
                    sampling.scale,
                    0.0,
                    0.0,
                    sampling.scale,
                    sampling.translate_x,
                    sampling.translate_y,
                );
                hwc = map_rect(&matrix, &hwc).outset(sampling.distance);
            }
            self.manager
                .merge_dirty_rect(map_rect(&inputs.canvas_matrix, &hwc));
        }

        self.manager.update_dirty(inputs.buffer_age);
        region_or_rect(&mut damage, self.manager.dirty_region());

        let bounds = self.manager.surface_rect();
        let clipped = damage
            .iter()
            .map(|rect| rect.intersect_rect(&bounds))
            .filter(|rect| !rect.is_empty_rect())
            .fold(DamageRects::new(), |mut region, rect| {
                region_or_rect(&mut region, rect);
                region
            });
        VirtualDirty::Damage(clipped)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utils::geometry::rect_from_ltrb;

    fn history(frames: &[&[RectI]]) -> DirtyHistory {
        let mut history = DirtyHistory::new();
        for frame in frames.iter().rev() {
            history.push_frame(frame.iter().copied());
        }
        history
    }

    #[test]
    fn history_merge_follows_buffer_age() {
        let screen = rect_from_xywh(0, 0, 100, 100);
        let a = rect_from_ltrb(0, 0, 10, 10);
        let b = rect_from_ltrb(50, 50, 60, 60);
        let c = rect_from_ltrb(90, 90, 120, 120);
        let history = history(&[&[a], &[b], &[c]]);
        assert_eq!(history.current_frame(), &[a]);

        for (age, expected) in [
            (0, vec![screen]),
            (1, vec![a]),
            (2, vec![a, b]),
            (3, vec![a, b, rect_from_ltrb(90, 90, 100, 100)]),
            (4, vec![screen]),
        ] {
            assert_eq!(
                merge_dirty_history(&history, age, screen).as_slice(),
                expected.as_slice(),
                "age {age}"
            );
        }
    }

    #[test]
    fn history_is_bounded() {
        let mut history = DirtyHistory::new();
        for i in 0..(DIRTY_HISTORY_MAX_LEN as i32 + 3) {
            history.push_frame([rect_from_xywh(i, i, 1, 1), empty_rect()]);
        }
        assert_eq!(history.len(), DIRTY_HISTORY_MAX_LEN);
        assert_eq!(history.current_frame().len(), 1);
    }

    #[test]
    fn manager_merges_own_history() {
        let mut manager = DirtyRegionManager::default();
        manager.set_surface_size(100, 50);
        manager.merge_dirty_rect(rect_from_ltrb(10, 10, 20, 20));
        manager.update_dirty(0);
        assert_eq!(manager.dirty_region(), rect_from_xywh(0, 0, 100, 50));
        assert!(manager.current_frame_dirty().is_empty_rect());

        manager.merge_dirty_rect(rect_from_ltrb(30, 30, 40, 80));
        manager.update_dirty(2);
        assert_eq!(manager.dirty_region(), rect_from_ltrb(10, 10, 40, 50));
        manager.update_dirty(1);
        assert!(manager.dirty_region().is_empty_rect());
    }

    #[test]
    fn refresh_then_skip() {
        let mut state = VirtualDirtyState::default();
        state.set_surface_size(50, 50);
        let source = rect_from_xywh(0, 0, 100, 100);
        let scale = Transform::from_scale(0.5, 0.5);
        let empty = history(&[&[]]);
        let inputs = VirtualDirtyInputs {
            canvas_matrix: scale,
            source_matrix: Transform::identity(),
            source_dirty: &empty,
            source_hwc_dirty: empty_rect(),
            source_rect: source,
            sampling: None,
            buffer_age: 1,
            visible_rect: None,
            force_refresh: false,
        };

        // the first frame always redraws everything
        match state.calculate(inputs) {
            VirtualDirty::Damage(damage) => {
                assert_eq!(damage.as_slice(), &[rect_from_xywh(0, 0, 50, 50)])
            }
            VirtualDirty::Skip => panic!("first frame skipped"),
        }
        state.frame_queued();
        assert_eq!(state.calculate(inputs), VirtualDirty::Skip);

        // the skipped vsync left an empty frame in the history
        let dirty = history(&[&[rect_from_ltrb(10, 10, 20, 21)], &[]]);
        assert_eq!(
            state.calculate(VirtualDirtyInputs {
                source_dirty: &dirty,
                ..inputs
            }),
            VirtualDirty::Damage([rect_from_ltrb(5, 5, 10, 11)].into_iter().collect())
        );
        state.frame_queued();

        // a moved source forces a full redraw again
        let moved = VirtualDirtyInputs {
            source_matrix: Transform::from_translate(1.0, 0.0),
            ..inputs
        };
        assert!(matches!(state.calculate(moved), VirtualDirty::Damage(d) if d[0] == rect_from_xywh(0, 0, 50, 50)));
        assert_eq!(state.calculate(moved), VirtualDirty::Skip);

        state.request_refresh();
        assert_ne!(state.calculate(moved), VirtualDirty::Skip);
        assert_ne!(
            state.calculate(VirtualDirtyInputs {
                force_refresh: true,
                ..moved
            }),
            VirtualDirty::Skip
        );
    }

    #[test]
    fn skipped_and_missed_frames_widen_damage() {
        let mut state = VirtualDirtyState::default();
        state.set_surface_size(100, 100);
        let source = rect_from_xywh(0, 0, 100, 100);
        let a = rect_from_xywh(0, 0, 10, 10);
        let b = rect_from_xywh(60, 0, 10, 10);
        let c = rect_from_xywh(0, 60, 10, 10);
        let mut dirty = DirtyHistory::new();
        let mut vsync = |state: &mut VirtualDirtyState, rects: &[RectI], buffer_age: u32| {
            dirty.push_frame(rects.iter().copied());
            state.calculate(VirtualDirtyInputs {
                canvas_matrix: Transform::identity(),
                source_matrix: Transform::identity(),
                source_dirty: &dirty,
                source_hwc_dirty: empty_rect(),
                source_rect: source,
                sampling: None,
                buffer_age,
                visible_rect: None,
                force_refresh: false,
            })
        };
        let full = || VirtualDirty::Damage([source].into_iter().collect());

        // fill the three buffers of the ring
        for rects in [&[a][..], &[a], &[c]] {
            assert_eq!(vsync(&mut state, rects, 0), full());
            state.frame_queued();
        }
        assert_eq!(vsync(&mut state, &[], 3), VirtualDirty::Skip);

        // the oldest buffer misses three drawn frames and the skipped vsync
        assert_eq!(
            vsync(&mut state, &[b], 3),
            VirtualDirty::Damage([b, c, a].into_iter().collect())
        );
        state.frame_queued();

        // a paused vsync, then the redraw after it
        state.request_refresh();
        assert_eq!(vsync(&mut state, &[c], 3), full());
        state.frame_queued();

        // buffers older than the redraw cannot be patched
        assert_eq!(vsync(&mut state, &[b], 3), full());
    }

    #[test]
    fn sampled_hwc_rect_is_outset() {
        let mut state = VirtualDirtyState::default();
        state.set_surface_size(100, 100);
        let empty = history(&[&[]]);
        let inputs = VirtualDirtyInputs {
            canvas_matrix: Transform::identity(),
            source_matrix: Transform::identity(),
            source_dirty: &empty,
            source_hwc_dirty: empty_rect(),
            source_rect: rect_from_xywh(0, 0, 100, 100),
            sampling: None,
            buffer_age: 1,
            visible_rect: None,
            force_refresh: false,
        };
        state.calculate(inputs);

        let damage = state.calculate(VirtualDirtyInputs {
            source_hwc_dirty: rect_from_ltrb(20, 20, 40, 40),
            sampling: Some(SamplingInfo {
                scale: 0.5,
                translate_x: 10.0,
                translate_y: 0.0,
                distance: 2,
            }),
            ..inputs
        });
        assert_eq!(
            damage,
            VirtualDirty::Damage([rect_from_ltrb(18, 8, 32, 22)].into_iter().collect())
        );
    }
}
