// SPDX-License-Identifier: GPL-3.0-only

//! Scaled logical resolution: a cached uniform downscale for mirror copies.

use super::{canvas::Canvas, ColorGamut};
use tiny_skia::{FilterQuality, PixmapRef, Transform};
use tracing::debug;

/// Below this uniform scale the SLR path is preferred over plain scaling.
pub const SLR_SCALE_THR_HIGH: f32 = 0.79;
pub const SLR_MAX_KERNEL_SIZE: u32 = 8;

/// Everything the cached scale matrix depends on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlrKey {
    pub dst_width: f32,
    pub dst_height: f32,
    pub src_width: f32,
    pub src_height: f32,
    pub color_gamut: ColorGamut,
}

#[derive(Debug, Clone)]
pub struct SlrScaleFunction {
    key: SlrKey,
    scale_num: f32,
    kernel_size: u32,
    matrix: Transform,
    is_slr_copy: bool,
    generation: u64,
}

impl SlrScaleFunction {
    pub fn new(key: SlrKey) -> SlrScaleFunction {
        let mut slr = SlrScaleFunction {
            key,
            scale_num: 1.0,
            kernel_size: 1,
            matrix: Transform::identity(),
            is_slr_copy: false,
            generation: 0,
        };
        slr.refresh();
        slr
    }

    /// Recomputes the matrix if `key` differs from the cached one. Returns whether it did.
    pub fn check_or_refresh(&mut self, key: SlrKey) -> bool {
        if self.key == key {
            return false;
        }
        self.key = key;
        self.refresh();
        true
    }

    fn refresh(&mut self) {
        let SlrKey {
            dst_width,
            dst_height,
            src_width,
            src_height,
            ..
        } = self.key;
        self.generation += 1;
        if src_width <= 0.0 || src_height <= 0.0 || dst_width <= 0.0 || dst_height <= 0.0 {
            self.scale_num = 1.0;
            self.kernel_size = 1;
            self.matrix = Transform::identity();
            self.is_slr_copy = false;
            return;
        }

        let scale = (dst_width / src_width).min(dst_height / src_height);
        self.scale_num = scale;
        self.kernel_size = ((1.0 / scale).ceil() as u32).clamp(1, SLR_MAX_KERNEL_SIZE);
        self.matrix = Transform::from_translate(
            (dst_width - scale * src_width) / 2.0,
            (dst_height - scale * src_height) / 2.0,
        )
        .pre_scale(scale, scale);
        self.is_slr_copy = scale < SLR_SCALE_THR_HIGH;
        debug!(
            scale,
            kernel = self.kernel_size,
            gamut = ?self.key.color_gamut,
            "Refreshed SLR scale matrix"
        );
    }

    pub fn key(&self) -> &SlrKey {
        &self.key
    }

    pub fn scale_matrix(&self) -> Transform {
        self.matrix
    }

    pub fn scale_num(&self) -> f32 {
        self.scale_num
    }

    pub fn kernel_size(&self) -> u32 {
        self.kernel_size
    }

    pub fn is_slr_copy(&self) -> bool {
        self.is_slr_copy
    }

    /// Bumped every time the matrix is recomputed.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Prepares the canvas for SLR sampling. The scale itself stays in
    /// [`Self::scale_matrix`] and is applied when the image is drawn.
    pub fn canvas_scale(&self, canvas: &mut Canvas) {
        canvas.set_filter_quality(FilterQuality::Bicubic);
    }

    pub fn process_cache_image(&self, canvas: &mut Canvas, image: PixmapRef<'_>) {
        profiling::scope!("slr_process_cache_image");
        canvas.save();
        canvas.set_filter_quality(FilterQuality::Bicubic);
        canvas.concat(&self.matrix);
        canvas.draw_image(image);
        canvas.restore();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn key(dst: (f32, f32), src: (f32, f32)) -> SlrKey {
        SlrKey {
            dst_width: dst.0,
            dst_height: dst.1,
            src_width: src.0,
            src_height: src.1,
            color_gamut: ColorGamut::Srgb,
        }
    }

    #[test]
    fn refreshes_only_on_key_change() {
        let mut slr = SlrScaleFunction::new(key((960.0, 540.0), (1920.0, 1080.0)));
        assert_eq!(slr.generation(), 1);
        assert_eq!(slr.scale_num(), 0.5);
        assert_eq!(slr.kernel_size(), 2);
        assert!(slr.is_slr_copy());

        assert!(!slr.check_or_refresh(key((960.0, 540.0), (1920.0, 1080.0))));
        assert_eq!(slr.generation(), 1);

        let mut wide = key((960.0, 540.0), (1920.0, 1080.0));
        wide.color_gamut = ColorGamut::DisplayP3;
        assert!(slr.check_or_refresh(wide));
        assert_eq!(slr.generation(), 2);

        assert!(slr.check_or_refresh(key((1920.0, 1080.0), (1920.0, 1080.0))));
        assert_eq!(slr.scale_num(), 1.0);
        assert!(!slr.is_slr_copy());
    }

    #[test]
    fn matrix_centres_content() {
        let slr = SlrScaleFunction::new(key((1000.0, 1000.0), (2000.0, 1000.0)));
        assert_eq!(slr.scale_num(), 0.5);
        assert_eq!(
            slr.scale_matrix(),
            Transform::from_row(0.5, 0.0, 0.0, 0.5, 0.0, 250.0)
        );
    }

    #[test]
    fn kernel_size_is_clamped() {
        let slr = SlrScaleFunction::new(key((10.0, 10.0), (1000.0, 1000.0)));
        assert_eq!(slr.kernel_size(), SLR_MAX_KERNEL_SIZE);
        let slr = SlrScaleFunction::new(key((0.0, 10.0), (1000.0, 1000.0)));
        assert_eq!(slr.kernel_size(), 1);
        assert_eq!(slr.scale_matrix(), Transform::identity());
    }
}
