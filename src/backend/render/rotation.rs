// SPDX-License-Identifier: GPL-3.0-only

//! Composition of the rotation sources that apply to a mirrored screen.
//!
//! Rotations are quarter turns in a modulo-4 ring. [`ScreenRotation::Invalid`]
//! marks an unset value and is read as [`ScreenRotation::Rotation0`] whenever
//! it would enter the arithmetic.

use mirror_comp_config::RotationDef;
use smithay::utils::Transform as OutputTransform;
use tiny_skia::Transform;
use tracing::trace;

pub const SCREEN_ROTATION_NUM: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScreenRotation {
    #[default]
    Rotation0,
    Rotation90,
    Rotation180,
    Rotation270,
    Invalid,
}

impl ScreenRotation {
    pub fn from_index(index: u32) -> ScreenRotation {
        match index % SCREEN_ROTATION_NUM {
            0 => ScreenRotation::Rotation0,
            1 => ScreenRotation::Rotation90,
            2 => ScreenRotation::Rotation180,
            _ => ScreenRotation::Rotation270,
        }
    }

    /// Quarter turns, with `Invalid` read as no rotation.
    pub fn index(self) -> u32 {
        match self {
            ScreenRotation::Rotation0 => 0,
            ScreenRotation::Rotation90 => 1,
            ScreenRotation::Rotation180 => 2,
            ScreenRotation::Rotation270 => 3,
            ScreenRotation::Invalid => {
                trace!("Invalid rotation used in rotation arithmetic, treating as 0");
                0
            }
        }
    }

    /// Angle in degrees taken modulo 360. Angles off the quarter-turn grid are `Invalid`.
    pub fn from_degrees(degrees: i32) -> ScreenRotation {
        let degrees = degrees.rem_euclid(360);
        if degrees % 90 != 0 {
            return ScreenRotation::Invalid;
        }
        ScreenRotation::from_index((degrees / 90) as u32)
    }

    pub fn degrees(self) -> Option<f32> {
        self.is_valid().then(|| self.index() as f32 * 90.0)
    }

    pub fn is_valid(self) -> bool {
        self != ScreenRotation::Invalid
    }

    /// Quarter and three-quarter turns exchange width and height.
    pub fn swaps_axes(self) -> bool {
        matches!(self, ScreenRotation::Rotation90 | ScreenRotation::Rotation270)
    }
}

impl From<ScreenRotation> for OutputTransform {
    fn from(rotation: ScreenRotation) -> OutputTransform {
        match rotation {
            ScreenRotation::Rotation0 | ScreenRotation::Invalid => OutputTransform::Normal,
            ScreenRotation::Rotation90 => OutputTransform::_90,
            ScreenRotation::Rotation180 => OutputTransform::_180,
            ScreenRotation::Rotation270 => OutputTransform::_270,
        }
    }
}

impl From<OutputTransform> for ScreenRotation {
    fn from(transform: OutputTransform) -> ScreenRotation {
        match transform {
            OutputTransform::Normal => ScreenRotation::Rotation0,
            OutputTransform::_90 => ScreenRotation::Rotation90,
            OutputTransform::_180 => ScreenRotation::Rotation180,
            OutputTransform::_270 => ScreenRotation::Rotation270,
            _ => ScreenRotation::Invalid,
        }
    }
}

impl From<RotationDef> for ScreenRotation {
    fn from(def: RotationDef) -> ScreenRotation {
        match def {
            RotationDef::Rotation0 => ScreenRotation::Rotation0,
            RotationDef::Rotation90 => ScreenRotation::Rotation90,
            RotationDef::Rotation180 => ScreenRotation::Rotation180,
            RotationDef::Rotation270 => ScreenRotation::Rotation270,
        }
    }
}

/// Rotation to bake into the destination canvas before correction.
///
/// `previous` is `None` until the destination resolved its first frame. A
/// valid mirror source rotation always wins. Otherwise the current source
/// rotation is taken on the first frame or when either rotation flag asks
/// for it, and the previously resolved rotation is kept in every other case.
pub fn resolve_origin_rotation(
    previous: Option<ScreenRotation>,
    mirror_source_rotation: ScreenRotation,
    canvas_rotation: bool,
    auto_buffer_rotation: bool,
    current_source_screen_rotation: ScreenRotation,
) -> ScreenRotation {
    if mirror_source_rotation.is_valid() {
        return mirror_source_rotation;
    }
    match previous {
        Some(previous) if !canvas_rotation && !auto_buffer_rotation => previous,
        _ => current_source_screen_rotation,
    }
}

/// Subtracts the panel correction from the logical rotation.
pub fn compose_rotation_angle(origin: ScreenRotation, correction: ScreenRotation) -> ScreenRotation {
    ScreenRotation::from_index(origin.index() + SCREEN_ROTATION_NUM - correction.index())
}

/// Width and height swap when the two rotations differ by an odd number of quarter turns.
pub fn check_if_buffer_size_need_change(first: ScreenRotation, current: ScreenRotation) -> bool {
    (first.index() + SCREEN_ROTATION_NUM - current.index()) % SCREEN_ROTATION_NUM % 2 == 1
}

/// Pre-transform rotating content about the centre of a `width` x `height` buffer.
pub fn origin_rotation_transform(rotation: ScreenRotation, width: f32, height: f32) -> Transform {
    match rotation {
        ScreenRotation::Rotation0 | ScreenRotation::Invalid => Transform::identity(),
        ScreenRotation::Rotation180 => Transform::from_rotate_at(180.0, width / 2.0, height / 2.0),
        ScreenRotation::Rotation90 | ScreenRotation::Rotation270 => {
            let degrees = rotation.index() as f32 * 90.0;
            Transform::from_translate(width / 2.0, height / 2.0)
                .pre_concat(Transform::from_rotate(degrees))
                .pre_translate(-height / 2.0, -width / 2.0)
        }
    }
}
