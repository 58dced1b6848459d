// SPDX-License-Identifier: GPL-3.0-only

use super::{
    frame::{FrameContextConfig, RenderFrame, RenderFrameConfig},
    surface::{ProducerSurface, SharedSurface, VirtualSurface},
};
use crate::{
    backend::render::{Canvas, ColorGamut, PixelFormat},
    state::ScreenRenderParams,
    utils::geometry::RectI,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tiny_skia::{PixmapRef, Rect};
use tracing::warn;

/// How a source screen buffer is placed onto the canvas.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BufferDrawParam {
    pub src_rect: Option<RectI>,
    pub dst_rect: Option<Rect>,
    pub is_mirror: bool,
}

/// Allocates frames for virtual screens and draws buffers into them.
pub trait RenderEngine: Send + Sync {
    /// Direct path, rendering straight into the producer's buffers.
    fn request_frame(
        &self,
        _producer: &Arc<dyn ProducerSurface>,
        _config: &RenderFrameConfig,
        _force_cpu: bool,
        _context: &FrameContextConfig,
    ) -> Option<RenderFrame> {
        None
    }

    fn make_surface(&self, producer: &Arc<dyn ProducerSurface>, force_cpu: bool) -> SharedSurface;

    fn request_frame_from_surface(
        &self,
        surface: &SharedSurface,
        config: &RenderFrameConfig,
        force_cpu: bool,
        context: &FrameContextConfig,
    ) -> Option<RenderFrame>;

    fn draw_screen_buffer(&self, canvas: &mut Canvas, buffer: PixmapRef<'_>, params: &BufferDrawParam) {
        match (params.src_rect, params.dst_rect) {
            (Some(src), Some(dst)) => canvas.draw_image_rect(buffer, src, dst),
            _ => canvas.draw_image(buffer),
        }
    }
}

/// tiny-skia backed engine. It has no direct path, every frame goes
/// through a [`VirtualSurface`].
#[derive(Debug, Default)]
pub struct SoftwareEngine;

impl RenderEngine for SoftwareEngine {
    fn make_surface(&self, producer: &Arc<dyn ProducerSurface>, force_cpu: bool) -> SharedSurface {
        Arc::new(Mutex::new(VirtualSurface::new(producer.clone(), force_cpu)))
    }

    fn request_frame_from_surface(
        &self,
        surface: &SharedSurface,
        config: &RenderFrameConfig,
        _force_cpu: bool,
        context: &FrameContextConfig,
    ) -> Option<RenderFrame> {
        profiling::scope!("request_frame_from_surface");
        let dequeued = {
            let mut surface = surface.lock();
            surface.set_color_space(config.color_gamut);
            surface.dequeue(config.width, config.height)
        };
        match dequeued {
            Ok(buffer) => Some(RenderFrame::new(surface.clone(), buffer, config.format, context)),
            Err(err) => {
                warn!(?err, width = config.width, height = config.height, "Failed to dequeue buffer");
                None
            }
        }
    }
}

/// Decides whether a virtual screen carries HDR content.
pub trait HdrCast: Send + Sync {
    fn is_hdr_cast(&self, screen: &ScreenRenderParams, config: &mut RenderFrameConfig) -> bool;
}

/// A screen with a fixed 10-bit buffer gets a 10-bit frame, and HLG if HDR content is present.
#[derive(Debug, Default)]
pub struct HdrCastPolicy;

impl HdrCast for HdrCastPolicy {
    fn is_hdr_cast(&self, screen: &ScreenRenderParams, config: &mut RenderFrameConfig) -> bool {
        if !screen.property.fixed_10bit_buffer {
            return false;
        }
        config.format = PixelFormat::Rgba1010102;
        if !screen.hdr_present {
            return false;
        }
        config.color_gamut = ColorGamut::Bt2100Hlg;
        true
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Software engine counting surface creations, optionally failing every request.
    #[derive(Debug, Default)]
    pub struct CountingEngine {
        pub made: AtomicUsize,
        pub requests: AtomicUsize,
        pub fail: bool,
    }

    impl CountingEngine {
        pub fn made(&self) -> usize {
            self.made.load(Ordering::SeqCst)
        }
    }

    impl RenderEngine for CountingEngine {
        fn make_surface(&self, producer: &Arc<dyn ProducerSurface>, force_cpu: bool) -> SharedSurface {
            self.made.fetch_add(1, Ordering::SeqCst);
            SoftwareEngine.make_surface(producer, force_cpu)
        }

        fn request_frame_from_surface(
            &self,
            surface: &SharedSurface,
            config: &RenderFrameConfig,
            force_cpu: bool,
            context: &FrameContextConfig,
        ) -> Option<RenderFrame> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return None;
            }
            SoftwareEngine.request_frame_from_surface(surface, config, force_cpu, context)
        }
    }

    #[test]
    fn hdr_cast_policy() {
        let mut screen = ScreenRenderParams::default();
        let mut config = RenderFrameConfig::default();
        assert!(!HdrCastPolicy.is_hdr_cast(&screen, &mut config));
        assert_eq!(config.format, PixelFormat::Rgba8888);

        screen.property.fixed_10bit_buffer = true;
        assert!(!HdrCastPolicy.is_hdr_cast(&screen, &mut config));
        assert_eq!(config.format, PixelFormat::Rgba1010102);
        assert_eq!(config.color_gamut, ColorGamut::Srgb);

        screen.hdr_present = true;
        assert!(HdrCastPolicy.is_hdr_cast(&screen, &mut config));
        assert_eq!(config.color_gamut, ColorGamut::Bt2100Hlg);
    }
}
