// SPDX-License-Identifier: GPL-3.0-only

use crate::utils::geometry::{map_bounds_to_rect, rect_from_xywh, RectI, RectIExt};
use tiny_skia::{
    Color, FillRule, FilterQuality, IntRect, Mask, Paint, PathBuilder, Pixmap, PixmapPaint,
    PixmapRef, Rect, Transform,
};

#[derive(Debug, Clone, Copy, PartialEq)]
struct CanvasState {
    matrix: Transform,
    clip: Option<RectI>,
    quality: FilterQuality,
}

/// Software canvas the virtual frames are drawn into.
///
/// Keeps a matrix stack and an axis aligned device clip on top of a tiny-skia
/// pixmap. Rotated or skewed local clips are clipped to their device bounds.
#[derive(Debug)]
pub struct Canvas {
    pixmap: Pixmap,
    state: CanvasState,
    stack: Vec<CanvasState>,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Option<Canvas> {
        Pixmap::new(width, height).map(Canvas::from_pixmap)
    }

    pub fn from_pixmap(pixmap: Pixmap) -> Canvas {
        Canvas {
            pixmap,
            state: CanvasState {
                matrix: Transform::identity(),
                clip: None,
                quality: FilterQuality::Bilinear,
            },
            stack: Vec::new(),
        }
    }

    pub fn width(&self) -> u32 {
        self.pixmap.width()
    }

    pub fn height(&self) -> u32 {
        self.pixmap.height()
    }

    pub fn bounds(&self) -> RectI {
        rect_from_xywh(0, 0, self.width() as i32, self.height() as i32)
    }

    /// Pushes the current state and returns the save count before the push.
    pub fn save(&mut self) -> usize {
        self.stack.push(self.state);
        self.stack.len() - 1
    }

    pub fn restore(&mut self) {
        if let Some(state) = self.stack.pop() {
            self.state = state;
        }
    }

    pub fn restore_to_count(&mut self, count: usize) {
        while self.stack.len() > count {
            self.restore();
        }
    }

    pub fn save_count(&self) -> usize {
        self.stack.len()
    }

    pub fn total_matrix(&self) -> Transform {
        self.state.matrix
    }

    pub fn translate(&mut self, dx: f32, dy: f32) {
        self.state.matrix = self.state.matrix.pre_translate(dx, dy);
    }

    pub fn scale(&mut self, sx: f32, sy: f32) {
        self.state.matrix = self.state.matrix.pre_scale(sx, sy);
    }

    pub fn concat(&mut self, matrix: &Transform) {
        self.state.matrix = self.state.matrix.pre_concat(*matrix);
    }

    pub fn filter_quality(&self) -> FilterQuality {
        self.state.quality
    }

    pub fn set_filter_quality(&mut self, quality: FilterQuality) {
        self.state.quality = quality;
    }

    /// Intersects the clip with a rectangle given in device pixels.
    pub fn clip_device_rect(&mut self, rect: RectI) {
        let rect = rect.intersect_rect(&self.bounds());
        self.state.clip = Some(match self.state.clip {
            Some(clip) => clip.intersect_rect(&rect),
            None => rect,
        });
    }

    /// Intersects the clip with a rectangle in local coordinates.
    pub fn clip_rect(&mut self, left: f32, top: f32, right: f32, bottom: f32) {
        let rect = map_bounds_to_rect(&self.state.matrix, left, top, right, bottom);
        self.clip_device_rect(rect);
    }

    pub fn clip_bounds(&self) -> RectI {
        self.state.clip.unwrap_or_else(|| self.bounds())
    }

    fn clip_mask(&self) -> Option<Mask> {
        let clip = self.state.clip?;
        let mut mask = Mask::new(self.width(), self.height())?;
        if let Some(rect) = Rect::from_ltrb(
            clip.left() as f32,
            clip.top() as f32,
            clip.right() as f32,
            clip.bottom() as f32,
        ) {
            let path = PathBuilder::from_rect(rect);
            mask.fill_path(&path, FillRule::Winding, false, Transform::identity());
        }
        Some(mask)
    }

    /// Replaces every pixel inside the clip with `color`.
    pub fn clear(&mut self, color: Color) {
        match self.state.clip {
            None => self.pixmap.fill(color),
            Some(clip) if clip.is_empty_rect() => {}
            Some(clip) => {
                if let Some(rect) = Rect::from_ltrb(
                    clip.left() as f32,
                    clip.top() as f32,
                    clip.right() as f32,
                    clip.bottom() as f32,
                ) {
                    let mut paint = Paint::default();
                    paint.set_color(color);
                    paint.blend_mode = tiny_skia::BlendMode::Source;
                    paint.anti_alias = false;
                    self.pixmap
                        .fill_rect(rect, &paint, Transform::identity(), None);
                }
            }
        }
    }

    pub fn fill_rect(&mut self, left: f32, top: f32, right: f32, bottom: f32, color: Color) {
        let Some(rect) = Rect::from_ltrb(left, top, right, bottom) else {
            return;
        };
        let mut paint = Paint::default();
        paint.set_color(color);
        paint.anti_alias = false;
        let mask = self.clip_mask();
        let matrix = self.state.matrix;
        self.pixmap.fill_rect(rect, &paint, matrix, mask.as_ref());
    }

    /// Draws `image` with its top left corner at the local origin.
    pub fn draw_image(&mut self, image: PixmapRef<'_>) {
        let paint = PixmapPaint {
            quality: self.state.quality,
            ..PixmapPaint::default()
        };
        let mask = self.clip_mask();
        let matrix = self.state.matrix;
        self.pixmap
            .draw_pixmap(0, 0, image, &paint, matrix, mask.as_ref());
    }

    /// Draws the `src` part of `image` stretched onto the local `dst` rectangle.
    pub fn draw_image_rect(&mut self, image: PixmapRef<'_>, src: RectI, dst: Rect) {
        let src = src.intersect_rect(&rect_from_xywh(
            0,
            0,
            image.width() as i32,
            image.height() as i32,
        ));
        let Some(cropped) = IntRect::from_xywh(
            src.loc.x,
            src.loc.y,
            src.size.w as u32,
            src.size.h as u32,
        )
        .and_then(|rect| image.to_owned().clone_rect(rect)) else {
            return;
        };
        self.save();
        self.translate(dst.left(), dst.top());
        self.scale(
            dst.width() / src.size.w as f32,
            dst.height() / src.size.h as f32,
        );
        self.draw_image(cropped.as_ref());
        self.restore();
    }

    pub fn pixmap(&self) -> &Pixmap {
        &self.pixmap
    }

    pub fn into_pixmap(self) -> Pixmap {
        self.pixmap
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utils::geometry::rect_from_ltrb;

    fn rgb(canvas: &Canvas, x: u32, y: u32) -> (u8, u8, u8) {
        let pixel = canvas.pixmap().pixel(x, y).unwrap();
        (pixel.red(), pixel.green(), pixel.blue())
    }

    #[test]
    fn save_restore_matrix_and_clip() {
        let mut canvas = Canvas::new(16, 16).unwrap();
        let base = canvas.save();
        canvas.translate(4.0, 2.0);
        canvas.clip_device_rect(rect_from_ltrb(0, 0, 8, 8));
        canvas.save();
        canvas.scale(2.0, 2.0);
        assert_eq!(canvas.total_matrix(), Transform::from_row(2.0, 0.0, 0.0, 2.0, 4.0, 2.0));
        canvas.restore();
        assert_eq!(canvas.total_matrix(), Transform::from_translate(4.0, 2.0));
        assert_eq!(canvas.clip_bounds(), rect_from_ltrb(0, 0, 8, 8));
        canvas.restore_to_count(base);
        assert_eq!(canvas.total_matrix(), Transform::identity());
        assert_eq!(canvas.clip_bounds(), canvas.bounds());
        // extra restores are ignored
        canvas.restore();
        assert_eq!(canvas.save_count(), 0);
    }

    #[test]
    fn clear_respects_clip() {
        let mut canvas = Canvas::new(8, 8).unwrap();
        canvas.clear(Color::WHITE);
        canvas.clip_device_rect(rect_from_ltrb(0, 0, 4, 8));
        canvas.clear(Color::BLACK);
        assert_eq!(rgb(&canvas, 1, 1), (0, 0, 0));
        assert_eq!(rgb(&canvas, 6, 1), (255, 255, 255));
    }

    #[test]
    fn draw_image_through_matrix() {
        let mut image = Pixmap::new(2, 2).unwrap();
        image.fill(Color::from_rgba8(255, 0, 0, 255));

        let mut canvas = Canvas::new(8, 8).unwrap();
        canvas.clear(Color::BLACK);
        canvas.set_filter_quality(FilterQuality::Nearest);
        canvas.translate(4.0, 4.0);
        canvas.scale(2.0, 2.0);
        canvas.draw_image(image.as_ref());

        assert_eq!(rgb(&canvas, 5, 5), (255, 0, 0));
        assert_eq!(rgb(&canvas, 7, 7), (255, 0, 0));
        assert_eq!(rgb(&canvas, 2, 2), (0, 0, 0));
    }

    #[test]
    fn draw_image_rect_crops_source() {
        let mut image = Pixmap::new(4, 4).unwrap();
        image.fill(Color::from_rgba8(0, 0, 255, 255));
        let mut paint = Paint::default();
        paint.set_color_rgba8(0, 255, 0, 255);
        image.fill_rect(
            Rect::from_xywh(2.0, 2.0, 2.0, 2.0).unwrap(),
            &paint,
            Transform::identity(),
            None,
        );

        let mut canvas = Canvas::new(8, 8).unwrap();
        canvas.set_filter_quality(FilterQuality::Nearest);
        canvas.draw_image_rect(
            image.as_ref(),
            rect_from_ltrb(2, 2, 4, 4),
            Rect::from_xywh(0.0, 0.0, 8.0, 8.0).unwrap(),
        );
        assert_eq!(rgb(&canvas, 0, 0), (0, 255, 0));
        assert_eq!(rgb(&canvas, 7, 7), (0, 255, 0));
    }
}
