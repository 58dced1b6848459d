// SPDX-License-Identifier: GPL-3.0-only

use super::{
    rotation::ScreenRotation,
    slr::{SlrKey, SlrScaleFunction, SLR_SCALE_THR_HIGH},
    ColorGamut,
};
use crate::utils::{
    geometry::{map_bounds_to_rect, RectI, RectIExt},
    EPSILON,
};
use mirror_comp_config::ScaleModeDef;
use tiny_skia::Transform;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScaleMode {
    /// Stretch both axes independently.
    Fill,
    /// Keep the aspect ratio and centre on the axis that has room left.
    #[default]
    Uniform,
}

impl From<ScaleModeDef> for ScaleMode {
    fn from(def: ScaleModeDef) -> ScaleMode {
        match def {
            ScaleModeDef::Fill => ScaleMode::Fill,
            ScaleModeDef::Uniform => ScaleMode::Uniform,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MirrorScale {
    pub scale_x: f32,
    pub scale_y: f32,
    /// Offset in source units, applied after the scale.
    pub start_x: f32,
    pub start_y: f32,
}

impl MirrorScale {
    pub fn matrix(&self) -> Transform {
        Transform::from_scale(self.scale_x, self.scale_y).pre_translate(self.start_x, self.start_y)
    }

    pub fn min_scale(&self) -> f32 {
        self.scale_x.min(self.scale_y)
    }
}

pub fn fill(main_width: f32, main_height: f32, mirror_width: f32, mirror_height: f32) -> Option<MirrorScale> {
    if main_width <= 0.0 || main_height <= 0.0 {
        return None;
    }
    Some(MirrorScale {
        scale_x: mirror_width / main_width,
        scale_y: mirror_height / main_height,
        start_x: 0.0,
        start_y: 0.0,
    })
}

pub fn uniform(
    main_width: f32,
    main_height: f32,
    mirror_width: f32,
    mirror_height: f32,
) -> Option<MirrorScale> {
    if [main_width, main_height, mirror_width, mirror_height]
        .iter()
        .any(|v| *v <= 0.0)
    {
        return None;
    }
    let scale_x = mirror_width / main_width;
    let scale_y = mirror_height / main_height;
    Some(if scale_y < scale_x {
        MirrorScale {
            scale_x: scale_y,
            scale_y,
            start_x: (mirror_width / scale_y - main_width) / 2.0,
            start_y: 0.0,
        }
    } else {
        MirrorScale {
            scale_x,
            scale_y: scale_x,
            start_x: 0.0,
            start_y: (mirror_height / scale_x - main_height) / 2.0,
        }
    })
}

/// Inputs of [`compute_mirror_transform`] for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MirrorScaleInputs {
    pub scale_mode: ScaleMode,
    pub screen_correction: ScreenRotation,
    /// Origin rotation of the destination display.
    pub rotation: ScreenRotation,
    pub virtual_width: f32,
    pub virtual_height: f32,
    pub mirrored_width: f32,
    pub mirrored_height: f32,
    pub mirrored_translate_x: f32,
    pub mirrored_translate_y: f32,
    pub visible_rect: Option<RectI>,
    pub draw_mirror_copy: bool,
    pub slr_enabled: bool,
    pub color_gamut: ColorGamut,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MirrorTransform {
    /// To be concatenated onto the canvas after the rotation pre-transform.
    pub matrix: Transform,
    pub scale: Option<MirrorScale>,
    /// The scale lives in the SLR function instead of `matrix`.
    pub slr_active: bool,
    pub virtual_width: f32,
    pub virtual_height: f32,
}

/// Whether SLR should replace the plain uniform scale.
pub fn enable_slr_scale(scale: &MirrorScale, inputs: &MirrorScaleInputs) -> bool {
    scale.min_scale() < SLR_SCALE_THR_HIGH
        && inputs.slr_enabled
        && inputs.visible_rect.is_none()
        && inputs.draw_mirror_copy
        && !inputs.rotation.swaps_axes()
}

/// Scale and translate mapping the mirrored source into the destination.
///
/// Returns `None` if the visible rect is degenerate.
pub fn compute_mirror_transform(
    inputs: &MirrorScaleInputs,
    slr: &mut Option<SlrScaleFunction>,
) -> Option<MirrorTransform> {
    let (mut virtual_width, mut virtual_height) = (inputs.virtual_width, inputs.virtual_height);
    if inputs.screen_correction.swaps_axes() {
        std::mem::swap(&mut virtual_width, &mut virtual_height);
    }
    if inputs.rotation.swaps_axes() {
        std::mem::swap(&mut virtual_width, &mut virtual_height);
    }

    let (main_width, main_height) = match inputs.visible_rect {
        Some(rect) => {
            let (w, h) = (rect.size.w as f32, rect.size.h as f32);
            if w < EPSILON || h < EPSILON {
                error!(?rect, "Mirror visible rect is empty");
                return None;
            }
            (w, h)
        }
        None => (inputs.mirrored_width, inputs.mirrored_height),
    };

    let mut matrix = Transform::identity();
    let mut scale = None;
    let mut slr_active = false;
    let need_scale = (main_width - virtual_width).abs() > EPSILON
        || (main_height - virtual_height).abs() > EPSILON;
    if need_scale {
        match inputs.scale_mode {
            ScaleMode::Fill => {
                if let Some(fill) = fill(main_width, main_height, virtual_width, virtual_height) {
                    matrix = matrix.pre_scale(fill.scale_x, fill.scale_y);
                    scale = Some(fill);
                }
            }
            ScaleMode::Uniform => {
                if let Some(uni) = uniform(main_width, main_height, virtual_width, virtual_height) {
                    if enable_slr_scale(&uni, inputs) {
                        let key = SlrKey {
                            dst_width: virtual_width,
                            dst_height: virtual_height,
                            src_width: inputs.mirrored_width,
                            src_height: inputs.mirrored_height,
                            color_gamut: inputs.color_gamut,
                        };
                        match slr {
                            Some(slr) => {
                                slr.check_or_refresh(key);
                            }
                            None => *slr = Some(SlrScaleFunction::new(key)),
                        }
                        slr_active = true;
                        debug!(gamut = ?inputs.color_gamut, "Scale with SLR");
                    } else {
                        matrix = matrix.pre_concat(uni.matrix());
                    }
                    scale = Some(uni);
                }
            }
        }
    }

    match inputs.visible_rect {
        Some(rect) if !inputs.draw_mirror_copy => {
            matrix = matrix.pre_translate(-rect.left() as f32, -rect.top() as f32);
        }
        Some(_) => {}
        None => {
            matrix = matrix.pre_translate(-inputs.mirrored_translate_x, -inputs.mirrored_translate_y);
        }
    }

    Some(MirrorTransform {
        matrix,
        scale,
        slr_active,
        virtual_width,
        virtual_height,
    })
}

/// Inputs of [`compute_uniscale_clip_region`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniscaleClipInputs {
    pub translate_x: f32,
    pub translate_y: f32,
    pub width: f32,
    pub height: f32,
    /// Total canvas matrix after the mirror transform.
    pub total_matrix: Transform,
    /// Set while the SLR function carries the scale.
    pub slr_matrix: Option<Transform>,
    /// Canvas matrix captured before the source sampling scale was applied.
    pub visible_rect_matrix: Transform,
    pub visible_rect: Option<RectI>,
    pub draw_mirror_copy: bool,
    pub is_sampling_on: bool,
    pub slr_globally_enabled: bool,
}

/// Device clip for uniform mode, covering only the scaled source content.
pub fn compute_uniscale_clip_region(inputs: &UniscaleClipInputs) -> RectI {
    let mut rect = [
        inputs.translate_x,
        inputs.translate_y,
        inputs.translate_x + inputs.width,
        inputs.translate_y + inputs.height,
    ];
    let mut matrix = inputs.slr_matrix.unwrap_or(inputs.total_matrix);
    if let Some(visible) = inputs.visible_rect {
        if inputs.draw_mirror_copy {
            rect = [0.0, 0.0, visible.size.w as f32, visible.size.h as f32];
        } else {
            rect = [
                visible.left() as f32,
                visible.top() as f32,
                visible.right() as f32,
                visible.bottom() as f32,
            ];
            if inputs.is_sampling_on && !inputs.slr_globally_enabled {
                matrix = inputs.visible_rect_matrix;
            }
        }
    }
    map_bounds_to_rect(&matrix, rect[0], rect[1], rect[2], rect[3])
}
