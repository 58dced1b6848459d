// SPDX-License-Identifier: GPL-3.0-only

//! Request, draw and flush cycle of a single virtual screen frame.

use super::{
    engine::RenderEngine,
    fence::SyncFence,
    metadata::{
        color_space_type, convert_color_space_type_to_info, convert_metadata_to_vec,
        MetadataError, MetadataKey, RoiRegions,
    },
    surface::{BufferMetadata, DequeuedBuffer, ProducerSurface, SharedSurface},
};
use crate::{
    backend::render::{Canvas, ColorGamut, PixelFormat},
    state::LinkageError,
    utils::{
        geometry::{empty_rect, rect_from_xywh, DamageRects, RectI},
        NodeId,
    },
};
use bitflags::bitflags;
use std::sync::Arc;
use tracing::{debug, trace, warn};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u64 {
        const CPU_READ = 1 << 0;
        const CPU_WRITE = 1 << 1;
        const MEM_DMA = 1 << 3;
        const HW_RENDER = 1 << 8;
        const HW_TEXTURE = 1 << 9;
        const PROTECTED = 1 << 14;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderFrameConfig {
    pub width: u32,
    pub height: u32,
    pub color_gamut: ColorGamut,
    pub usage: BufferUsage,
    pub format: PixelFormat,
}

impl Default for RenderFrameConfig {
    fn default() -> RenderFrameConfig {
        RenderFrameConfig {
            width: 0,
            height: 0,
            color_gamut: ColorGamut::Srgb,
            usage: BufferUsage::CPU_READ | BufferUsage::MEM_DMA,
            format: PixelFormat::Rgba8888,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameContextConfig {
    pub is_protected: bool,
    pub is_virtual: bool,
    pub timeout_ms: u32,
}

impl FrameContextConfig {
    pub fn virtual_screen() -> FrameContextConfig {
        FrameContextConfig {
            is_protected: false,
            is_virtual: true,
            timeout_ms: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("virtual screen {0} is paused")]
    Paused(NodeId),
    #[error("screen {0} has no producer surface")]
    NoProducerSurface(NodeId),
    #[error("direct and surface frame requests both failed")]
    RequestFailed,
    #[error("failed to allocate a {width}x{height} buffer")]
    AllocationFailed { width: u32, height: u32 },
    #[error("no live frame")]
    NoFrame,
    #[error("mirror source could not be resolved")]
    Linkage(#[from] LinkageError),
}

/// A dequeued buffer being drawn into.
#[derive(Debug)]
pub struct RenderFrame {
    surface: SharedSurface,
    slot: usize,
    seq: u64,
    buffer_age: u32,
    format: PixelFormat,
    is_protected: bool,
    canvas: Canvas,
    metadata: BufferMetadata,
    damage: DamageRects,
    acquire_fence: SyncFence,
}

impl RenderFrame {
    pub fn new(
        surface: SharedSurface,
        buffer: DequeuedBuffer,
        format: PixelFormat,
        context: &FrameContextConfig,
    ) -> RenderFrame {
        RenderFrame {
            surface,
            slot: buffer.slot,
            seq: buffer.seq,
            buffer_age: buffer.age,
            format,
            is_protected: context.is_protected,
            canvas: Canvas::from_pixmap(buffer.pixmap),
            metadata: BufferMetadata::new(),
            damage: DamageRects::new(),
            acquire_fence: SyncFence::new(),
        }
    }

    pub fn canvas(&self) -> &Canvas {
        &self.canvas
    }

    pub fn canvas_mut(&mut self) -> &mut Canvas {
        &mut self.canvas
    }

    pub fn surface(&self) -> &SharedSurface {
        &self.surface
    }

    pub fn buffer_age(&self) -> u32 {
        self.buffer_age
    }

    pub fn is_protected(&self) -> bool {
        self.is_protected
    }

    pub fn set_damage_region(&mut self, rects: &[RectI]) {
        self.damage = rects.iter().copied().collect();
    }

    pub fn damage(&self) -> &[RectI] {
        &self.damage
    }

    pub fn set_metadata(&mut self, key: MetadataKey, value: Vec<u8>) {
        self.metadata.insert(key, value);
    }

    pub fn erase_metadata(&mut self, key: MetadataKey) {
        self.metadata.remove(&key);
    }

    pub fn metadata(&self, key: MetadataKey) -> Option<&[u8]> {
        self.metadata.get(&key).map(Vec::as_slice)
    }

    pub fn acquire_fence(&self) -> &SyncFence {
        &self.acquire_fence
    }

    /// Queues the buffer to the consumer. Rendering is synchronous, so the
    /// acquire fence is signaled right after.
    pub fn flush(self) -> SyncFence {
        let fence = self.acquire_fence.clone();
        self.surface.lock().queue(
            self.slot,
            self.seq,
            self.canvas.into_pixmap(),
            self.format,
            self.damage,
            self.metadata,
            fence.clone(),
        );
        fence.signal();
        fence
    }

    pub fn cancel(self) {
        self.surface
            .lock()
            .release(self.slot, self.canvas.into_pixmap());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameState {
    #[default]
    Idle,
    Requested,
    Flushed,
    Cancelled,
}

/// Abstraction surface created for a producer, reused while the producer stays the same.
#[derive(Debug, Clone)]
pub struct CachedSurface {
    pub unique_id: u64,
    pub surface: SharedSurface,
}

pub struct FrameRequest<'a> {
    pub engine: &'a dyn RenderEngine,
    pub producer: &'a Arc<dyn ProducerSurface>,
    pub config: &'a RenderFrameConfig,
    pub force_cpu: bool,
    pub context: &'a FrameContextConfig,
    /// Forces a new abstraction surface even if the producer is unchanged.
    pub surface_changed: bool,
}

/// At most one live [`RenderFrame`] per destination, moving
/// `Idle -> Requested -> Flushed | Cancelled`. A new request starts from `Idle` again.
#[derive(Debug, Default)]
pub struct FrameLifecycle {
    state: FrameState,
    frame: Option<RenderFrame>,
    screen_rect: Option<RectI>,
}

impl FrameLifecycle {
    pub fn new() -> FrameLifecycle {
        FrameLifecycle::default()
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.frame.is_some()
    }

    /// Bounds the ROI metadata is clipped to.
    pub fn set_screen_size(&mut self, width: i32, height: i32) {
        self.screen_rect = Some(rect_from_xywh(0, 0, width, height));
    }

    pub fn request_frame(
        &mut self,
        request: FrameRequest<'_>,
        cached: &mut Option<CachedSurface>,
    ) -> Result<(), FrameError> {
        if self.frame.is_some() {
            warn!("Requesting a frame while the previous one is still live, cancelling it");
            self.cancel_current_frame();
        }
        self.state = FrameState::Idle;

        let FrameRequest {
            engine,
            producer,
            config,
            force_cpu,
            context,
            surface_changed,
        } = request;

        let frame = engine
            .request_frame(producer, config, force_cpu, context)
            .or_else(|| {
                let unique_id = producer.unique_id();
                let surface = match cached.as_ref() {
                    Some(cached) if cached.unique_id == unique_id && !surface_changed => {
                        cached.surface.clone()
                    }
                    _ => {
                        debug!(unique_id, "Make surface from producer");
                        let surface = engine.make_surface(producer, force_cpu);
                        *cached = Some(CachedSurface {
                            unique_id,
                            surface: surface.clone(),
                        });
                        surface
                    }
                };
                engine.request_frame_from_surface(&surface, config, force_cpu, context)
            })
            .ok_or(FrameError::RequestFailed)?;

        trace!(
            width = config.width,
            height = config.height,
            gamut = ?config.color_gamut,
            "Frame requested"
        );
        self.frame = Some(frame);
        self.state = FrameState::Requested;
        Ok(())
    }

    pub fn frame(&self) -> Option<&RenderFrame> {
        self.frame.as_ref()
    }

    pub fn frame_mut(&mut self) -> Option<&mut RenderFrame> {
        self.frame.as_mut()
    }

    pub fn canvas(&mut self) -> Option<&mut Canvas> {
        self.frame.as_mut().map(RenderFrame::canvas_mut)
    }

    pub fn buffer_age(&self) -> u32 {
        match self.frame.as_ref() {
            Some(frame) => frame.buffer_age(),
            None => {
                debug!("No live frame, buffer age is 0");
                0
            }
        }
    }

    pub fn acquire_fence(&self) -> Option<SyncFence> {
        self.frame
            .as_ref()
            .map(|frame| frame.acquire_fence().clone())
    }

    pub fn flush(&mut self) -> Result<SyncFence, FrameError> {
        let frame = self.frame.take().ok_or(FrameError::NoFrame)?;
        self.state = FrameState::Flushed;
        Ok(frame.flush())
    }

    /// Drops the live frame without queueing it.
    pub fn cancel_current_frame(&mut self) {
        if let Some(frame) = self.frame.take() {
            frame.cancel();
            self.state = FrameState::Cancelled;
        }
    }

    fn live_frame(&mut self) -> Result<&mut RenderFrame, MetadataError> {
        match self.state {
            FrameState::Idle if self.frame.is_none() => return Err(MetadataError::NotInit),
            FrameState::Flushed | FrameState::Cancelled => return Err(MetadataError::NoBuffer),
            _ => {}
        }
        self.frame.as_mut().ok_or(MetadataError::InvalidArguments)
    }

    /// Forwards the damage to the frame and tags the buffer with the matching ROI.
    pub fn set_damage_region(&mut self, rects: &[RectI]) {
        let Some(frame) = self.frame.as_mut() else {
            warn!("Setting damage without a live frame");
            return;
        };
        frame.set_damage_region(rects);
        if let Err(err) = self.set_roi_region_to_codec(rects) {
            debug!(?err, "Failed to set ROI metadata");
        }
    }

    pub fn set_roi_region_to_codec(&mut self, rects: &[RectI]) -> Result<(), MetadataError> {
        let screen = self.screen_rect.unwrap_or_else(empty_rect);
        let frame = self.live_frame()?;
        let roi = RoiRegions::from_damage(rects, screen);
        frame.set_metadata(MetadataKey::RoiInfo, convert_metadata_to_vec(&roi)?);
        Ok(())
    }

    pub fn set_color_space_for_metadata(&mut self, gamut: ColorGamut) -> Result<(), MetadataError> {
        let frame = self.live_frame()?;
        let ty = color_space_type(gamut).ok_or(MetadataError::InvalidArguments)?;
        let info = convert_color_space_type_to_info(ty);
        frame.set_metadata(MetadataKey::ColorSpaceInfo, convert_metadata_to_vec(&info)?);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::virtual_screen::{
        engine::test::CountingEngine,
        metadata::{ColorSpaceInfo, ROI_REGIONS_MAX_CNT},
        surface::test::RecordingProducer,
    };
    use crate::utils::geometry::rect_from_ltrb;

    fn config(width: u32, height: u32) -> RenderFrameConfig {
        RenderFrameConfig {
            width,
            height,
            ..RenderFrameConfig::default()
        }
    }

    fn request(
        lifecycle: &mut FrameLifecycle,
        engine: &CountingEngine,
        producer: &Arc<dyn ProducerSurface>,
        cached: &mut Option<CachedSurface>,
        surface_changed: bool,
    ) -> Result<(), FrameError> {
        lifecycle.request_frame(
            FrameRequest {
                engine,
                producer,
                config: &config(32, 16),
                force_cpu: false,
                context: &FrameContextConfig::virtual_screen(),
                surface_changed,
            },
            cached,
        )
    }

    #[test]
    fn cached_surface_is_reused() {
        let engine = CountingEngine::default();
        let recorder = RecordingProducer::new(3);
        let producer: Arc<dyn ProducerSurface> = recorder.clone();
        let mut cached = None;
        let mut lifecycle = FrameLifecycle::new();

        request(&mut lifecycle, &engine, &producer, &mut cached, false).unwrap();
        assert_eq!(lifecycle.state(), FrameState::Requested);
        lifecycle.flush().unwrap();
        request(&mut lifecycle, &engine, &producer, &mut cached, false).unwrap();
        lifecycle.flush().unwrap();
        assert_eq!(engine.made(), 1);
        assert_eq!(recorder.count(), 2);

        request(&mut lifecycle, &engine, &producer, &mut cached, true).unwrap();
        assert_eq!(engine.made(), 2);

        let other: Arc<dyn ProducerSurface> = RecordingProducer::new(4);
        request(&mut lifecycle, &engine, &other, &mut cached, false).unwrap();
        assert_eq!(engine.made(), 3);
        assert_eq!(cached.as_ref().map(|c| c.unique_id), Some(4));
    }

    #[test]
    fn failed_request_stays_idle() {
        let engine = CountingEngine {
            fail: true,
            ..CountingEngine::default()
        };
        let producer: Arc<dyn ProducerSurface> = RecordingProducer::new(1);
        let mut cached = None;
        let mut lifecycle = FrameLifecycle::new();
        assert!(matches!(
            request(&mut lifecycle, &engine, &producer, &mut cached, false),
            Err(FrameError::RequestFailed)
        ));
        assert_eq!(lifecycle.state(), FrameState::Idle);
        assert!(!lifecycle.is_live());
        assert_eq!(lifecycle.buffer_age(), 0);
        assert!(matches!(lifecycle.flush(), Err(FrameError::NoFrame)));
        assert_eq!(
            lifecycle.set_color_space_for_metadata(ColorGamut::Srgb),
            Err(MetadataError::NotInit)
        );
    }

    #[test]
    fn cancel_does_not_queue() {
        let engine = CountingEngine::default();
        let recorder = RecordingProducer::new(9);
        let producer: Arc<dyn ProducerSurface> = recorder.clone();
        let mut cached = None;
        let mut lifecycle = FrameLifecycle::new();

        request(&mut lifecycle, &engine, &producer, &mut cached, false).unwrap();
        let fence = lifecycle.acquire_fence().unwrap();
        lifecycle.cancel_current_frame();
        assert_eq!(lifecycle.state(), FrameState::Cancelled);
        assert_eq!(recorder.count(), 0);
        assert!(!fence.is_signaled());
        assert_eq!(lifecycle.buffer_age(), 0);
        assert_eq!(
            lifecycle.set_roi_region_to_codec(&[]),
            Err(MetadataError::NoBuffer)
        );

        // a second request while live cancels the stale frame first
        request(&mut lifecycle, &engine, &producer, &mut cached, false).unwrap();
        request(&mut lifecycle, &engine, &producer, &mut cached, false).unwrap();
        assert_eq!(lifecycle.flush().map(|f| f.is_signaled()).ok(), Some(true));
        assert_eq!(recorder.count(), 1);
    }

    #[test]
    fn damage_and_metadata_reach_the_consumer() {
        let engine = CountingEngine::default();
        let recorder = RecordingProducer::new(2);
        let producer: Arc<dyn ProducerSurface> = recorder.clone();
        let mut cached = None;
        let mut lifecycle = FrameLifecycle::new();
        lifecycle.set_screen_size(32, 16);

        request(&mut lifecycle, &engine, &producer, &mut cached, false).unwrap();
        let damage: Vec<_> = (0..ROI_REGIONS_MAX_CNT as i32 + 2)
            .map(|i| rect_from_ltrb(i, 0, i + 1, 40))
            .collect();
        lifecycle.set_damage_region(&damage);
        lifecycle
            .set_color_space_for_metadata(ColorGamut::DisplayP3)
            .unwrap();
        assert_eq!(
            lifecycle.set_color_space_for_metadata(ColorGamut::Native),
            Err(MetadataError::InvalidArguments)
        );
        lifecycle.flush().unwrap();

        let buffer = recorder.last().unwrap();
        assert_eq!(buffer.damage.len(), damage.len());
        let roi: RoiRegions =
            bytemuck::pod_read_unaligned(buffer.metadata(MetadataKey::RoiInfo).unwrap());
        assert_eq!(roi.regions().len(), 1);
        assert_eq!(roi.regions()[0].width, ROI_REGIONS_MAX_CNT as i32 + 2);
        assert_eq!(roi.regions()[0].height, 16);
        let info: ColorSpaceInfo =
            bytemuck::pod_read_unaligned(buffer.metadata(MetadataKey::ColorSpaceInfo).unwrap());
        assert_eq!(
            info,
            convert_color_space_type_to_info(crate::backend::virtual_screen::metadata::ColorSpaceType::P3Full)
        );
    }
}
