// SPDX-License-Identifier: GPL-3.0-only

//! Composition of mirrored and extended virtual screens.
//!
//! Every virtual destination owns a [`VirtualProcessor`] which keeps the
//! state that has to survive between frames. A frame goes through
//! `init_for_render_thread`, `update_mirror_info`, `canvas_init`, the scale
//! transform, dirty calculation, drawing and finally `post_process`.

use self::{
    dirty::{SamplingInfo, VirtualDirty, VirtualDirtyInputs, VirtualDirtyState},
    engine::BufferDrawParam,
    fence::{HardwareLayer, SyncFence},
    frame::{
        BufferUsage, CachedSurface, FrameContextConfig, FrameError, FrameLifecycle, FrameRequest,
        FrameState, RenderFrameConfig,
    },
    metadata::{
        convert_color_space_type_to_info, convert_metadata_to_vec, ColorSpaceType, MetadataKey,
    },
};
use crate::{
    backend::{
        render::{
            rotation::{
                check_if_buffer_size_need_change, compose_rotation_angle, origin_rotation_transform,
                resolve_origin_rotation, ScreenRotation,
            },
            scale::{
                compute_mirror_transform, compute_uniscale_clip_region, MirrorScaleInputs,
                MirrorTransform, ScaleMode, UniscaleClipInputs,
            },
            slr::SlrScaleFunction,
            virtual_frame_gamut, Canvas,
        },
        wired::WiredProcessor,
        RenderServices,
    },
    state::{
        MirrorLinkage, RenderNodeArena, RenderSnapshot, RenderThreadParams, ScreenKind,
        ScreenRenderParams,
    },
    utils::{
        geometry::{rect_from_xywh, RectI, RectIExt},
        NodeId,
    },
};
use std::collections::HashMap;
use tiny_skia::{Color, Pixmap, Rect, Transform};
use tracing::{debug, error, info, trace, warn};

pub mod dirty;
pub mod engine;
pub mod fence;
pub mod frame;
pub mod metadata;
pub mod surface;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Flushed,
    /// Nothing changed, the frame was cancelled.
    Skipped,
}

/// Values derived for the current frame only.
#[derive(Debug, Clone, Copy)]
struct FrameScope {
    config: RenderFrameConfig,
    mirrored_screen_id: Option<NodeId>,
    scale_mode: ScaleMode,
    canvas_rotation: bool,
    auto_buffer_rotation: bool,
    visible_rect: Option<RectI>,
    screen_rotation: ScreenRotation,
    screen_correction: ScreenRotation,
    mirror_source_rotation: ScreenRotation,
    virtual_width: f32,
    virtual_height: f32,
    /// Destination size after the buffer swap, before any per-frame rotation swap.
    original_width: i32,
    original_height: i32,
    mirrored_width: f32,
    mirrored_height: f32,
    mirrored_translate_x: f32,
    mirrored_translate_y: f32,
    draw_mirror_copy: bool,
    hdr_cast: bool,
    canvas_matrix: Transform,
    transform: Option<MirrorTransform>,
}

impl Default for FrameScope {
    fn default() -> FrameScope {
        FrameScope {
            config: RenderFrameConfig::default(),
            mirrored_screen_id: None,
            scale_mode: ScaleMode::Uniform,
            canvas_rotation: false,
            auto_buffer_rotation: false,
            visible_rect: None,
            screen_rotation: ScreenRotation::Rotation0,
            screen_correction: ScreenRotation::Rotation0,
            mirror_source_rotation: ScreenRotation::Invalid,
            virtual_width: 0.0,
            virtual_height: 0.0,
            original_width: 0,
            original_height: 0,
            mirrored_width: 0.0,
            mirrored_height: 0.0,
            mirrored_translate_x: 0.0,
            mirrored_translate_y: 0.0,
            draw_mirror_copy: false,
            hdr_cast: false,
            canvas_matrix: Transform::identity(),
            transform: None,
        }
    }
}

/// Renders one virtual screen, either as a mirror of another screen or as an extension.
#[derive(Debug)]
pub struct VirtualProcessor {
    id: NodeId,
    services: RenderServices,
    first_buffer_rotation: Option<ScreenRotation>,
    origin_screen_rotation: Option<ScreenRotation>,
    slr: Option<SlrScaleFunction>,
    cached_surface: Option<CachedSurface>,
    dirty: VirtualDirtyState,
    lifecycle: FrameLifecycle,
    scope: FrameScope,
}

impl VirtualProcessor {
    pub fn new(id: NodeId, services: RenderServices) -> VirtualProcessor {
        VirtualProcessor {
            id,
            services,
            first_buffer_rotation: None,
            origin_screen_rotation: None,
            slr: None,
            cached_surface: None,
            dirty: VirtualDirtyState::default(),
            lifecycle: FrameLifecycle::new(),
            scope: FrameScope::default(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn first_buffer_rotation(&self) -> Option<ScreenRotation> {
        self.first_buffer_rotation
    }

    pub fn origin_screen_rotation(&self) -> Option<ScreenRotation> {
        self.origin_screen_rotation
    }

    pub fn slr(&self) -> Option<&SlrScaleFunction> {
        self.slr.as_ref()
    }

    pub fn frame_state(&self) -> FrameState {
        self.lifecycle.state()
    }

    pub fn frame_config(&self) -> &RenderFrameConfig {
        &self.scope.config
    }

    pub fn canvas_matrix(&self) -> Transform {
        self.scope.canvas_matrix
    }

    pub fn buffer_age(&self) -> u32 {
        self.lifecycle.buffer_age()
    }

    /// Mark the whole destination dirty for the next frame.
    pub fn request_dirty_refresh(&mut self) {
        self.dirty.request_refresh();
    }

    fn canvas(&mut self) -> Result<&mut Canvas, FrameError> {
        self.lifecycle.canvas().ok_or(FrameError::NoFrame)
    }

    fn origin_rotation(&self) -> ScreenRotation {
        self.origin_screen_rotation.unwrap_or_default()
    }

    fn slr_active(&self) -> bool {
        self.slr.is_some() && self.scope.transform.is_some_and(|t| t.slr_active)
    }

    /// Derives the frame config of `screen` and requests a frame for it.
    pub fn init_for_render_thread(
        &mut self,
        screen: &ScreenRenderParams,
        linkage: Option<&MirrorLinkage<'_>>,
        thread: &RenderThreadParams,
    ) -> Result<(), FrameError> {
        let property = &screen.property;
        if property.paused {
            debug!(screen = self.id, "Virtual screen is paused");
            return Err(FrameError::Paused(self.id));
        }

        let mut scope = FrameScope {
            scale_mode: property.scale_mode,
            canvas_rotation: property.canvas_rotation,
            visible_rect: property.visible_rect,
            ..FrameScope::default()
        };
        if property.visible_rect.is_some() {
            scope.canvas_rotation = property.visible_rect_supports_rotation;
        }

        let source_gamut = linkage.map(|linkage| {
            scope.mirrored_screen_id = Some(linkage.source_screen.id);
            scope.screen_rotation = linkage.source_display.screen_rotation;
            scope.screen_correction = linkage.source_screen.property.correction;
            linkage.source_screen.property.color_gamut
        });
        scope.config.color_gamut = virtual_frame_gamut(property.color_gamut, source_gamut);
        scope.hdr_cast = self.services.hdr.is_hdr_cast(screen, &mut scope.config);
        debug!(
            screen = self.id,
            mirror = linkage.is_some(),
            hdr_cast = scope.hdr_cast,
            gamut = ?scope.config.color_gamut,
            "Virtual frame colour setup"
        );
        self.scope = scope;

        self.set_virtual_screen_size(screen);
        self.scope.config.usage = BufferUsage::CPU_READ | BufferUsage::MEM_DMA;

        let Some(producer) = property.producer.as_ref() else {
            error!(screen = self.id, "Producer surface is missing");
            return Err(FrameError::NoProducerSurface(self.id));
        };
        let context = FrameContextConfig::virtual_screen();
        self.lifecycle
            .set_screen_size(self.scope.original_width, self.scope.original_height);
        if let Err(err) = self.lifecycle.request_frame(
            FrameRequest {
                engine: self.services.engine.as_ref(),
                producer,
                config: &self.scope.config,
                force_cpu: thread.force_cpu,
                context: &context,
                surface_changed: screen.virtual_surface_changed,
            },
            &mut self.cached_surface,
        ) {
            error!(screen = self.id, ?err, "Render frame is null");
            return Err(err);
        }
        trace!(screen = self.id, gamut = ?self.scope.config.color_gamut, "Request frame succeeded");

        let unique_id = producer.unique_id();
        if let Some(cached) = self
            .cached_surface
            .as_ref()
            .filter(|cached| cached.unique_id == unique_id)
        {
            let color_space = cached.surface.lock().color_space();
            if let Err(err) = self.lifecycle.set_color_space_for_metadata(color_space) {
                debug!(?err, "Setting colour space metadata failed");
            }
        }

        if let Some(frame) = self.lifecycle.frame_mut() {
            frame.erase_metadata(MetadataKey::HdrColorSpace);
            if self.scope.hdr_cast {
                let info = convert_color_space_type_to_info(ColorSpaceType::Bt2100HlgFull);
                match convert_metadata_to_vec(&info) {
                    Ok(bytes) => frame.set_metadata(MetadataKey::HdrColorSpace, bytes),
                    Err(err) => debug!(?err, "Setting HDR metadata failed"),
                }
            }
        }

        self.dirty.set_surface_size(
            self.scope.config.width as i32,
            self.scope.config.height as i32,
        );
        Ok(())
    }

    /// Destination size, swapped while the buffer rotation differs by a
    /// quarter turn from the one the destination started with.
    fn set_virtual_screen_size(&mut self, screen: &ScreenRenderParams) {
        let property = &screen.property;
        let scope = &mut self.scope;
        scope.auto_buffer_rotation = property.auto_buffer_rotation;
        scope.config.width = property.width;
        scope.config.height = property.height;
        scope.virtual_width = property.width as f32;
        scope.virtual_height = property.height as f32;

        if scope.auto_buffer_rotation {
            let current = compose_rotation_angle(scope.screen_rotation, scope.screen_correction);
            match self.first_buffer_rotation {
                None => {
                    self.first_buffer_rotation = Some(current);
                    info!(
                        screen = self.id,
                        rotation = ?current,
                        width = scope.config.width,
                        height = scope.config.height,
                        "Set first buffer rotation"
                    );
                }
                Some(first) if check_if_buffer_size_need_change(first, current) => {
                    std::mem::swap(&mut scope.config.width, &mut scope.config.height);
                    std::mem::swap(&mut scope.virtual_width, &mut scope.virtual_height);
                    debug!(
                        screen = self.id,
                        width = scope.config.width,
                        height = scope.config.height,
                        "Swapped buffer width and height"
                    );
                }
                Some(_) => {}
            }
        }

        scope.original_width = scope.virtual_width as i32;
        scope.original_height = scope.virtual_height as i32;
    }

    /// Size and offset of the mirrored content.
    pub fn update_mirror_info(&mut self, linkage: &MirrorLinkage<'_>) {
        let display = linkage.source_display;
        let scope = &mut self.scope;
        scope.mirror_source_rotation = linkage.display.mirror_source_rotation;

        scope.mirrored_width = display.fixed_width as f32;
        scope.mirrored_height = display.fixed_height as f32;
        if !display.content_rect.is_empty_rect() {
            scope.mirrored_width = display.content_rect.size.w as f32;
            scope.mirrored_height = display.content_rect.size.h as f32;
        }
        let property = &linkage.ancestor_screen.property;
        if property.is_sampling_on {
            scope.mirrored_width *= property.sampling_scale;
            scope.mirrored_height *= property.sampling_scale;
        }
        scope.mirrored_translate_x = display.offset_x as f32;
        scope.mirrored_translate_y = display.offset_y as f32;
    }

    /// Resolves the display rotation and bakes it into the canvas.
    pub fn canvas_init(&mut self) -> Result<ScreenRotation, FrameError> {
        let scope = &self.scope;
        let canvas = self.lifecycle.canvas().ok_or(FrameError::NoFrame)?;
        canvas.save();
        if self.origin_screen_rotation.is_none() {
            info!(
                screen = self.id,
                width = scope.virtual_width,
                height = scope.virtual_height,
                mirrored_width = scope.mirrored_width,
                mirrored_height = scope.mirrored_height,
                rotation = ?scope.screen_rotation,
                correction = ?scope.screen_correction,
                canvas_rotation = scope.canvas_rotation,
                scale_mode = ?scope.scale_mode,
                auto_buffer_rotation = scope.auto_buffer_rotation,
                mirror_source_rotation = ?scope.mirror_source_rotation,
                "First frame of virtual screen"
            );
        }

        let origin = resolve_origin_rotation(
            self.origin_screen_rotation,
            scope.mirror_source_rotation,
            scope.canvas_rotation,
            scope.auto_buffer_rotation,
            scope.screen_rotation,
        );
        self.origin_screen_rotation = Some(origin);
        let angle = compose_rotation_angle(origin, scope.screen_correction);
        canvas.concat(&origin_rotation_transform(
            angle,
            scope.config.width as f32,
            scope.config.height as f32,
        ));
        debug!(screen = self.id, ?origin, ?angle, "Canvas rotation");
        Ok(origin)
    }

    /// Applies the mirror scale on a fresh save level and records the result.
    pub fn calculate_transform(&mut self, thread: &RenderThreadParams) -> Result<(), FrameError> {
        self.canvas()?.save();
        self.scale_mirror_if_need(thread)?;
        self.scope.canvas_matrix = self.canvas()?.total_matrix();
        Ok(())
    }

    pub fn scale_mirror_if_need(&mut self, thread: &RenderThreadParams) -> Result<(), FrameError> {
        let scope = self.scope;
        let inputs = MirrorScaleInputs {
            scale_mode: scope.scale_mode,
            screen_correction: scope.screen_correction,
            rotation: self.origin_rotation(),
            virtual_width: scope.virtual_width,
            virtual_height: scope.virtual_height,
            mirrored_width: scope.mirrored_width,
            mirrored_height: scope.mirrored_height,
            mirrored_translate_x: scope.mirrored_translate_x,
            mirrored_translate_y: scope.mirrored_translate_y,
            visible_rect: scope.visible_rect,
            draw_mirror_copy: scope.draw_mirror_copy,
            slr_enabled: thread.slr_scale_enabled,
            color_gamut: scope.config.color_gamut,
        };
        let canvas = self.lifecycle.canvas().ok_or(FrameError::NoFrame)?;
        let Some(transform) = compute_mirror_transform(&inputs, &mut self.slr) else {
            self.scope.transform = None;
            return Ok(());
        };
        canvas.concat(&transform.matrix);
        if transform.slr_active {
            if let Some(slr) = self.slr.as_ref() {
                slr.canvas_scale(canvas);
            }
        }
        self.scope.virtual_width = transform.virtual_width;
        self.scope.virtual_height = transform.virtual_height;
        self.scope.transform = Some(transform);
        Ok(())
    }

    /// Clips uniform mode output to the area covered by mirrored content.
    pub fn canvas_clip_region_for_uniscale_mode(
        &mut self,
        visible_rect_matrix: Transform,
        is_sampling_on: bool,
        slr_globally_enabled: bool,
    ) -> Result<(), FrameError> {
        let scope = self.scope;
        if scope.scale_mode != ScaleMode::Uniform {
            return Ok(());
        }
        let slr_matrix = if self.slr_active() {
            self.slr.as_ref().map(SlrScaleFunction::scale_matrix)
        } else {
            None
        };
        let canvas = self.canvas()?;
        let clip = compute_uniscale_clip_region(&UniscaleClipInputs {
            translate_x: scope.mirrored_translate_x,
            translate_y: scope.mirrored_translate_y,
            width: scope.mirrored_width,
            height: scope.mirrored_height,
            total_matrix: canvas.total_matrix(),
            slr_matrix,
            visible_rect_matrix,
            visible_rect: scope.visible_rect,
            draw_mirror_copy: scope.draw_mirror_copy,
            is_sampling_on,
            slr_globally_enabled,
        });
        canvas.clip_device_rect(clip);
        debug!(?clip, "Uniform mode clip");
        Ok(())
    }

    /// Draws the composited buffer of the mirrored screen.
    pub fn process_screen_surface(&mut self, source: &ScreenRenderParams) -> Result<(), FrameError> {
        if self.scope.mirrored_screen_id.is_none() {
            return Ok(());
        }
        let Some(buffer) = source.buffer.as_ref() else {
            error!(screen = self.id, source = source.id, "Mirrored screen has no buffer");
            return Ok(());
        };
        let visible = self.scope.visible_rect;
        let params = BufferDrawParam {
            src_rect: visible,
            dst_rect: visible
                .and_then(|rect| Rect::from_xywh(0.0, 0.0, rect.size.w as f32, rect.size.h as f32)),
            is_mirror: true,
        };
        let canvas = self.lifecycle.canvas().ok_or(FrameError::NoFrame)?;
        self.services
            .engine
            .draw_screen_buffer(canvas, Pixmap::as_ref(buffer), &params);
        canvas.restore();
        Ok(())
    }

    pub fn process_cache_image(&mut self, image: &Pixmap) -> Result<(), FrameError> {
        let slr_active = self.slr_active();
        let canvas = self.lifecycle.canvas().ok_or(FrameError::NoFrame)?;
        match self.slr.as_ref().filter(|_| slr_active) {
            Some(slr) => {
                slr.process_cache_image(canvas, image.as_ref());
                debug!(screen = self.id, "Draw cache image with SLR");
            }
            None => canvas.draw_image(image.as_ref()),
        }
        Ok(())
    }

    /// Flushes the frame and hands its fence to whoever still reads the mirrored buffers.
    pub fn post_process(&mut self, thread: &RenderThreadParams) -> Result<SyncFence, FrameError> {
        let fence = self.lifecycle.flush()?;
        self.dirty.frame_queued();
        if let Some(mirrored) = self.scope.mirrored_screen_id {
            merge_mirror_fence_to_hardware_layers(&fence, mirrored, &thread.hardware_layers);
        }
        if fence.is_valid() {
            self.services.fences.set_acquire_fence(&fence);
            debug!(screen = self.id, "Fence set to render thread");
        } else {
            error!(screen = self.id, "Acquire fence is not valid");
        }
        self.services.completion.notify(self.id);
        debug!(screen = self.id, "Flushed virtual frame");
        Ok(fence)
    }

    /// Drops the live frame without any fence side effects.
    pub fn cancel_current_frame(&mut self) {
        self.lifecycle.cancel_current_frame();
    }

    fn clear_roi(&mut self) {
        if let Err(err) = self.lifecycle.set_roi_region_to_codec(&[]) {
            debug!(?err, "Clearing ROI metadata failed");
        }
    }

    fn calculate_virtual_dirty(
        &mut self,
        screen: &ScreenRenderParams,
        linkage: &MirrorLinkage<'_>,
        thread: &RenderThreadParams,
        matrix: Transform,
    ) -> VirtualDirty {
        let source = linkage.source_screen;
        let sampling_property = &linkage.ancestor_screen.property;
        let distance = match self.slr.as_ref() {
            Some(slr) if self.scope.transform.is_some_and(|t| t.slr_active) => slr.kernel_size() as i32,
            _ => sampling_property.sampling_distance,
        };
        let sampling = sampling_property.is_sampling_on.then_some(SamplingInfo {
            scale: sampling_property.sampling_scale,
            translate_x: sampling_property.sampling_translate_x,
            translate_y: sampling_property.sampling_translate_y,
            distance,
        });
        if !screen.equal_vsync_period {
            debug!(screen = self.id, "Frame rate differs from the mirrored screen");
        }
        let force_refresh = thread.force_mirror_screen_dirty
            || thread.virtual_dirty_refresh
            || screen.mirror_source_changed
            || !screen.equal_vsync_period
            || linkage.source_display.special_layer_changed;
        let buffer_age = self.lifecycle.buffer_age();
        self.dirty.calculate(VirtualDirtyInputs {
            canvas_matrix: matrix,
            source_matrix: source.matrix,
            source_dirty: &source.dirty,
            source_hwc_dirty: source.hwc_dirty,
            source_rect: source.bounds(),
            sampling,
            buffer_age,
            visible_rect: self.scope.visible_rect,
            force_refresh,
        })
    }

    /// Runs the dirty calculation and forwards the result. Returns false if the frame can be skipped.
    fn apply_virtual_dirty(
        &mut self,
        screen: &ScreenRenderParams,
        linkage: &MirrorLinkage<'_>,
        thread: &RenderThreadParams,
        matrix: Transform,
    ) -> bool {
        match self.calculate_virtual_dirty(screen, linkage, thread, matrix) {
            VirtualDirty::Skip => false,
            VirtualDirty::Damage(damage) => {
                trace!(screen = self.id, rects = damage.len(), "Virtual damage");
                self.lifecycle.set_damage_region(&damage);
                true
            }
        }
    }

    fn draw_mirror_copy(
        &mut self,
        screen: &ScreenRenderParams,
        linkage: &MirrorLinkage<'_>,
        thread: &RenderThreadParams,
    ) -> Result<bool, FrameError> {
        profiling::scope!("draw_mirror_copy");
        self.calculate_transform(thread)?;

        // an offset region mirror cannot map source damage reliably
        let offset_region = self
            .scope
            .visible_rect
            .is_some_and(|rect| rect.top() > 0 || rect.left() > 0);
        if !thread.virtual_dirty_enabled || offset_region {
            self.clear_roi();
        } else {
            let matrix = match self.slr.as_ref() {
                Some(slr) if self.slr_active() => slr.scale_matrix(),
                _ => self.scope.canvas_matrix,
            };
            if !self.apply_virtual_dirty(screen, linkage, thread, matrix) {
                trace!(screen = self.id, "Display skipped in mirror copy");
                self.canvas()?.restore_to_count(0);
                return Ok(false);
            }
        }

        self.canvas()?.clear(Color::TRANSPARENT);
        self.canvas_clip_region_for_uniscale_mode(Transform::identity(), false, thread.slr_scale_enabled)?;

        let source = linkage.source_screen;
        match source.cache_image.as_ref() {
            Some(image) if thread.draw_mirror_cache_image => match self.scope.visible_rect {
                None => self.process_cache_image(image)?,
                Some(visible) => {
                    let dst = Rect::from_xywh(0.0, 0.0, visible.size.w as f32, visible.size.h as f32);
                    if let Some(dst) = dst {
                        self.canvas()?.draw_image_rect(Pixmap::as_ref(image), visible, dst);
                    }
                }
            },
            _ => self.process_screen_surface(source)?,
        }
        self.canvas()?.restore_to_count(0);
        Ok(true)
    }

    fn draw_mirror(
        &mut self,
        screen: &ScreenRenderParams,
        linkage: &MirrorLinkage<'_>,
        thread: &RenderThreadParams,
    ) -> Result<bool, FrameError> {
        profiling::scope!("draw_mirror");
        let source = linkage.source_screen;
        let sampling = &linkage.ancestor_screen.property;

        if screen.property.mute {
            self.clear_roi();
            self.draw_security_mask(screen.property.security_mask.as_deref())?;
            self.dirty.request_refresh();
            self.canvas()?.restore_to_count(0);
            return Ok(true);
        }

        self.canvas()?.save();
        self.scale_mirror_if_need(thread)?;
        let canvas = self.canvas()?;
        let visible_rect_matrix = canvas.total_matrix();
        if sampling.is_sampling_on {
            canvas.translate(sampling.sampling_translate_x, sampling.sampling_translate_y);
            canvas.scale(sampling.sampling_scale, sampling.sampling_scale);
        }
        let matrix = canvas.total_matrix();

        if thread.virtual_dirty_enabled && self.scope.visible_rect.is_none() {
            if !self.apply_virtual_dirty(screen, linkage, thread, matrix) {
                trace!(screen = self.id, "Display skipped in mirror");
                self.canvas()?.restore_to_count(0);
                return Ok(false);
            }
        } else {
            self.clear_roi();
        }

        self.canvas()?.clear(Color::TRANSPARENT);
        self.canvas_clip_region_for_uniscale_mode(
            visible_rect_matrix,
            sampling.is_sampling_on,
            thread.slr_scale_enabled,
        )?;

        let canvas = self.lifecycle.canvas().ok_or(FrameError::NoFrame)?;
        canvas.concat(&source.matrix);
        match source.buffer.as_ref() {
            Some(buffer) => self.services.engine.draw_screen_buffer(
                canvas,
                Pixmap::as_ref(buffer),
                &BufferDrawParam {
                    is_mirror: true,
                    ..BufferDrawParam::default()
                },
            ),
            None => warn!(screen = self.id, source = source.id, "Mirrored screen has no buffer"),
        }
        canvas.restore_to_count(0);
        Ok(true)
    }

    fn draw_mirror_screen(
        &mut self,
        screen: &ScreenRenderParams,
        linkage: &MirrorLinkage<'_>,
        thread: &RenderThreadParams,
    ) -> Result<bool, FrameError> {
        self.update_mirror_info(linkage);
        let redraw = mirror_needs_redraw(screen, linkage, thread);
        debug!(screen = self.id, redraw, "Mirror path");
        self.scope.draw_mirror_copy = !redraw;
        self.canvas_init()?;
        if self.scope.draw_mirror_copy {
            self.draw_mirror_copy(screen, linkage, thread)
        } else {
            self.draw_mirror(screen, linkage, thread)
        }
    }

    /// Covers the destination with `mask` fitted to its size, or with black without one.
    fn draw_security_mask(&mut self, mask: Option<&Pixmap>) -> Result<(), FrameError> {
        let id = self.id;
        let (width, height) = (self.scope.config.width as f32, self.scope.config.height as f32);
        let canvas = self.canvas()?;
        canvas.restore_to_count(0);
        let Some(mask) = mask else {
            canvas.clear(Color::BLACK);
            info!(screen = id, "No security mask, drawing black");
            return Ok(());
        };
        canvas.clear(Color::TRANSPARENT);
        let (mask_width, mask_height) = (mask.width() as f32, mask.height() as f32);
        let scale = (width / mask_width).min(height / mask_height);
        let dst = Rect::from_xywh(
            (width - mask_width * scale) / 2.0,
            (height - mask_height * scale) / 2.0,
            mask_width * scale,
            mask_height * scale,
        );
        if let Some(dst) = dst {
            let src = rect_from_xywh(0, 0, mask.width() as i32, mask.height() as i32);
            canvas.draw_image_rect(Pixmap::as_ref(mask), src, dst);
        }
        debug!(screen = id, "Drew security mask");
        Ok(())
    }

    /// An extended screen shows its own composition.
    fn draw_expand_screen(&mut self, screen: &ScreenRenderParams) -> Result<bool, FrameError> {
        self.canvas_init()?;
        let canvas = self.lifecycle.canvas().ok_or(FrameError::NoFrame)?;
        canvas.clear(Color::TRANSPARENT);
        if let Some(buffer) = screen.buffer.as_ref() {
            self.services
                .engine
                .draw_screen_buffer(canvas, Pixmap::as_ref(buffer), &BufferDrawParam::default());
        }
        canvas.restore_to_count(0);
        let full = [rect_from_xywh(
            0,
            0,
            self.scope.config.width as i32,
            self.scope.config.height as i32,
        )];
        self.lifecycle.set_damage_region(&full);
        Ok(true)
    }

    /// Renders one frame of this destination.
    pub fn render(
        &mut self,
        screen: &ScreenRenderParams,
        nodes: &RenderNodeArena,
        thread: &RenderThreadParams,
    ) -> Result<FrameOutcome, FrameError> {
        profiling::scope!("virtual_screen_render");
        let result = self.render_frame(screen, nodes, thread);
        if result.is_err() {
            // the source keeps changing while nothing is queued
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
        let linkage = nodes.resolve_mirror_linkage(screen)?;
        self.init_for_render_thread(screen, linkage.as_ref(), thread)?;

        let drawn = match linkage.as_ref() {
            Some(linkage) => self.draw_mirror_screen(screen, linkage, thread),
            None => self.draw_expand_screen(screen),
        };
        match drawn {
            Ok(true) => {
                self.post_process(thread)?;
                Ok(FrameOutcome::Flushed)
            }
            Ok(false) => {
                self.cancel_current_frame();
                Ok(FrameOutcome::Skipped)
            }
            Err(err) => {
                self.cancel_current_frame();
                Err(err)
            }
        }
    }
}

/// Whether the mirror has to be drawn from the source buffer instead of
/// copying the cache image of the source.
fn mirror_needs_redraw(
    screen: &ScreenRenderParams,
    linkage: &MirrorLinkage<'_>,
    thread: &RenderThreadParams,
) -> bool {
    let source = linkage.source_screen;
    let security_redraw = linkage.source_display.security_display != linkage.display.security_display
        && linkage.source_display.has_special_layer;
    thread.color_filter_mode
        || source.cache_image.is_none()
        || source.hdr_present
        || source.render_skip_if_screen_off
        || screen.hdr_present
        || screen.property.mute
        || security_redraw
}

/// Makes the hardware layers of the mirrored screen wait for the mirror
/// frame before their buffers are reused. Protected layers are never mirrored.
pub fn merge_mirror_fence_to_hardware_layers(
    fence: &SyncFence,
    mirrored_screen: NodeId,
    layers: &[HardwareLayer],
) -> usize {
    if !fence.is_valid() {
        error!("Acquire fence is not valid");
        return 0;
    }
    let mut merged = 0;
    for layer in layers {
        if layer.screen_id != mirrored_screen {
            trace!(layer = layer.id, "Layer is not on the mirrored screen");
            continue;
        }
        let Some(buffer) = layer.buffer.as_ref() else {
            debug!(layer = layer.id, "Layer has no buffer");
            continue;
        };
        if layer.protected {
            continue;
        }
        debug!(layer = layer.id, name = %layer.name, "Fence merged");
        buffer.set_and_merge_sync_fence(fence);
        merged += 1;
    }
    merged
}

#[derive(Debug, Default)]
pub struct CompositionReport {
    pub flushed: Vec<NodeId>,
    pub skipped: Vec<NodeId>,
    pub failed: Vec<(NodeId, FrameError)>,
}

/// Owns the processors of every mirror destination.
#[derive(Debug)]
pub struct MirrorCompositor {
    services: RenderServices,
    virtual_processors: HashMap<NodeId, VirtualProcessor>,
    wired_processors: HashMap<NodeId, WiredProcessor>,
}

impl MirrorCompositor {
    pub fn new(services: RenderServices) -> MirrorCompositor {
        MirrorCompositor {
            services,
            virtual_processors: HashMap::new(),
            wired_processors: HashMap::new(),
        }
    }

    pub fn services(&self) -> &RenderServices {
        &self.services
    }

    pub fn virtual_processor(&self, id: NodeId) -> Option<&VirtualProcessor> {
        self.virtual_processors.get(&id)
    }

    pub fn wired_processor(&self, id: NodeId) -> Option<&WiredProcessor> {
        self.wired_processors.get(&id)
    }

    /// Renders every destination in `snapshot`. A failing destination is
    /// reported and does not stop the others.
    pub fn render(&mut self, snapshot: &RenderSnapshot) -> CompositionReport {
        profiling::scope!("mirror_compositor_render");
        let nodes = &snapshot.nodes;
        let thread = &snapshot.thread;

        self.virtual_processors.retain(|id, _| {
            let keep = nodes
                .screen(*id)
                .is_ok_and(|screen| screen.kind == ScreenKind::Virtual);
            if !keep {
                info!(screen = id, "Virtual screen removed, dropping processor");
            }
            keep
        });
        self.wired_processors.retain(|id, _| {
            nodes.screen(*id).is_ok_and(|screen| {
                screen.kind == ScreenKind::Wired && screen.mirror_source.is_some()
            })
        });

        let mut screens: Vec<&ScreenRenderParams> = nodes.screens().collect();
        screens.sort_by_key(|screen| screen.id);

        let mut report = CompositionReport::default();
        for screen in screens {
            let services = &self.services;
            let result = match screen.kind {
                ScreenKind::Virtual => self
                    .virtual_processors
                    .entry(screen.id)
                    .or_insert_with(|| {
                        info!(screen = screen.id, "New virtual screen processor");
                        VirtualProcessor::new(screen.id, services.clone())
                    })
                    .render(screen, nodes, thread),
                ScreenKind::Wired if screen.mirror_source.is_some() => self
                    .wired_processors
                    .entry(screen.id)
                    .or_insert_with(|| {
                        info!(screen = screen.id, "New wired mirror processor");
                        WiredProcessor::new(screen.id, services.clone())
                    })
                    .render(screen, nodes, thread),
                ScreenKind::Wired => continue,
            };
            match result {
                Ok(FrameOutcome::Flushed) => report.flushed.push(screen.id),
                Ok(FrameOutcome::Skipped) => report.skipped.push(screen.id),
                Err(err) => {
                    match err {
                        FrameError::Paused(_) => debug!(screen = screen.id, "Skipping paused screen"),
                        _ => warn!(screen = screen.id, ?err, "Skipping frame"),
                    }
                    report.failed.push((screen.id, err));
                }
            }
        }
        report
    }
}
