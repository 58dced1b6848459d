// SPDX-License-Identifier: GPL-3.0-only

use smithay::utils::{Physical, Rectangle};
use smallvec::SmallVec;
use tiny_skia::{Point as SkPoint, Transform};

/// Integer rectangle in buffer pixels.
pub type RectI = Rectangle<i32, Physical>;

/// Damage rectangles of a single frame.
pub type DamageRects = SmallVec<[RectI; 8]>;

pub fn rect_from_xywh(x: i32, y: i32, w: i32, h: i32) -> RectI {
    Rectangle::new((x, y).into(), (w.max(0), h.max(0)).into())
}

pub fn rect_from_ltrb(left: i32, top: i32, right: i32, bottom: i32) -> RectI {
    rect_from_xywh(left, top, right - left, bottom - top)
}

pub fn empty_rect() -> RectI {
    rect_from_xywh(0, 0, 0, 0)
}

pub trait RectIExt {
    fn left(&self) -> i32;
    fn top(&self) -> i32;
    fn right(&self) -> i32;
    fn bottom(&self) -> i32;
    fn is_empty_rect(&self) -> bool;
    /// Overlapping part of both rectangles, empty if they are disjoint.
    fn intersect_rect(&self, other: &RectI) -> RectI;
    /// Bounding box of both rectangles. Empty rectangles do not contribute.
    fn join_rect(&self, other: &RectI) -> RectI;
    fn covers_rect(&self, other: &RectI) -> bool;
    fn outset(&self, distance: i32) -> RectI;
}

impl RectIExt for RectI {
    fn left(&self) -> i32 {
        self.loc.x
    }

    fn top(&self) -> i32 {
        self.loc.y
    }

    fn right(&self) -> i32 {
        self.loc.x + self.size.w
    }

    fn bottom(&self) -> i32 {
        self.loc.y + self.size.h
    }

    fn is_empty_rect(&self) -> bool {
        self.size.w <= 0 || self.size.h <= 0
    }

    fn intersect_rect(&self, other: &RectI) -> RectI {
        let left = self.left().max(other.left());
        let top = self.top().max(other.top());
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if left >= right || top >= bottom {
            return empty_rect();
        }
        rect_from_ltrb(left, top, right, bottom)
    }

    fn join_rect(&self, other: &RectI) -> RectI {
        if other.is_empty_rect() {
            return *self;
        }
        if self.is_empty_rect() {
            return *other;
        }
        rect_from_ltrb(
            self.left().min(other.left()),
            self.top().min(other.top()),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    fn covers_rect(&self, other: &RectI) -> bool {
        !other.is_empty_rect()
            && self.left() <= other.left()
            && self.top() <= other.top()
            && self.right() >= other.right()
            && self.bottom() >= other.bottom()
    }

    fn outset(&self, distance: i32) -> RectI {
        if self.is_empty_rect() {
            return *self;
        }
        rect_from_ltrb(
            self.left() - distance,
            self.top() - distance,
            self.right() + distance,
            self.bottom() + distance,
        )
    }
}

/// Maps the four corners of `(left, top, right, bottom)` and returns their bounds.
pub fn map_bounds(matrix: &Transform, left: f32, top: f32, right: f32, bottom: f32) -> [f32; 4] {
    let mut corners = [
        SkPoint::from_xy(left, top),
        SkPoint::from_xy(right, top),
        SkPoint::from_xy(right, bottom),
        SkPoint::from_xy(left, bottom),
    ];
    matrix.map_points(&mut corners);
    corners.iter().skip(1).fold(
        [corners[0].x, corners[0].y, corners[0].x, corners[0].y],
        |[l, t, r, b], point| [l.min(point.x), t.min(point.y), r.max(point.x), b.max(point.y)],
    )
}

/// Maps the float rectangle through `matrix` and rounds its bounds outwards.
pub fn map_bounds_to_rect(matrix: &Transform, left: f32, top: f32, right: f32, bottom: f32) -> RectI {
    let [l, t, r, b] = map_bounds(matrix, left, top, right, bottom);
    // absorb float noise from quarter turns before rounding outwards
    let snap = |v: f32| {
        let rounded = v.round();
        if (v - rounded).abs() < 1e-3 {
            rounded
        } else {
            v
        }
    };
    rect_from_ltrb(
        snap(l).floor() as i32,
        snap(t).floor() as i32,
        snap(r).ceil() as i32,
        snap(b).ceil() as i32,
    )
}

/// Maps an integer rectangle through `matrix`, rounding outwards.
pub fn map_rect(matrix: &Transform, rect: &RectI) -> RectI {
    if rect.is_empty_rect() {
        return empty_rect();
    }
    map_bounds_to_rect(
        matrix,
        rect.left() as f32,
        rect.top() as f32,
        rect.right() as f32,
        rect.bottom() as f32,
    )
}

/// Adds `rect` to `region`, skipping rectangles already covered and
/// dropping existing ones that `rect` covers.
pub fn region_or_rect(region: &mut DamageRects, rect: RectI) {
    if rect.is_empty_rect() || region.iter().any(|r| r.covers_rect(&rect)) {
        return;
    }
    region.retain(|r| !rect.covers_rect(r));
    region.push(rect);
}
