// SPDX-License-Identifier: GPL-3.0-only

use crate::{
    backend::{
        render::{rotation::ScreenRotation, ColorGamut},
        virtual_screen::{dirty::DirtyHistory, surface::ProducerSurface},
    },
    state::{
        LogicalDisplayRenderParams, RenderSnapshot, RenderThreadParams, ScreenKind,
        ScreenProperty, ScreenRenderParams,
    },
    utils::{
        env::{bool_var, parse_var},
        geometry::{rect_from_xywh, RectI},
        NodeId,
    },
};
use mirror_comp_config::{
    load_config, MirrorCompConfig, MirrorState, ScreenConfig, ScreenKindDef, VisibleRectDef,
};
use std::{path::PathBuf, sync::Arc};
use tiny_skia::{Color, Paint, Pixmap, Rect, Transform};
use tracing::{debug, info, warn};

/// Display nodes live above this offset, screens below.
const DISPLAY_NODE_OFFSET: NodeId = 1 << 32;

pub fn screen_node(id: u64) -> NodeId {
    id + 1
}

pub fn display_node(id: u64) -> NodeId {
    DISPLAY_NODE_OFFSET + id + 1
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mirror: MirrorCompConfig,
    /// File the configuration was read from, `None` if defaults are used.
    pub path: Option<PathBuf>,
}

impl Config {
    /// Reads the configuration from `path`, or from the first existing default location.
    pub fn load(path: Option<PathBuf>) -> Config {
        let path = path.or_else(|| {
            let xdg = xdg::BaseDirectories::with_prefix("mirror-comp").ok();
            let mut locations = xdg
                .map(|base| vec![base.get_config_file("config.ron")])
                .unwrap_or_default();
            if cfg!(debug_assertions) {
                if let Ok(mut cwd) = std::env::current_dir() {
                    cwd.push("config.ron");
                    locations.push(cwd);
                }
            }
            locations.push(PathBuf::from("/etc/mirror-comp/config.ron"));
            locations.into_iter().find(|path| {
                debug!("Trying config location: {}", path.display());
                path.exists()
            })
        });

        match path.as_ref() {
            Some(path) => info!("Using config at {}", path.display()),
            None => warn!("No configuration found, using defaults"),
        }
        let mut mirror = load_config(path.as_ref());
        apply_env_overrides(&mut mirror);
        Config { mirror, path }
    }

    pub fn thread_params(&self) -> RenderThreadParams {
        let features = &self.mirror.features;
        RenderThreadParams {
            slr_scale_enabled: features.slr_scale,
            virtual_dirty_enabled: features.virtual_dirty,
            draw_mirror_cache_image: features.draw_mirror_cache_image,
            force_cpu: features.force_cpu,
            ..RenderThreadParams::default()
        }
    }

    /// Initial snapshot of the configured screens. Every enabled wired screen
    /// and every extended virtual screen shows a test pattern. Virtual
    /// screens without a producer from `producer_for` are left out.
    pub fn build_scene(
        &self,
        mut producer_for: impl FnMut(&ScreenConfig) -> Option<Arc<dyn ProducerSurface>>,
    ) -> RenderSnapshot {
        let mut snapshot = RenderSnapshot {
            thread: self.thread_params(),
            ..RenderSnapshot::default()
        };

        for conf in &self.mirror.screens {
            if conf.enabled == MirrorState::Disabled {
                debug!(screen = conf.id, "Screen disabled");
                continue;
            }
            let producer = match conf.kind {
                ScreenKindDef::Virtual => match producer_for(conf) {
                    Some(producer) => Some(producer),
                    None => {
                        warn!(screen = conf.id, "No producer for virtual screen, skipping");
                        continue;
                    }
                },
                ScreenKindDef::Wired => None,
            };
            let source = conf.mirror_source();

            let buffer = match source {
                Some(_) => None,
                None => test_pattern(conf.size.0, conf.size.1).map(Arc::new),
            };
            if source.is_none() && buffer.is_none() {
                warn!(screen = conf.id, size = ?conf.size, "Invalid screen size");
            }
            let mut dirty = DirtyHistory::new();
            if buffer.is_some() {
                dirty.push_frame([rect_from_xywh(0, 0, conf.size.0 as i32, conf.size.1 as i32)]);
            }

            snapshot.nodes.insert(ScreenRenderParams {
                id: screen_node(conf.id),
                kind: match conf.kind {
                    ScreenKindDef::Wired => ScreenKind::Wired,
                    ScreenKindDef::Virtual => ScreenKind::Virtual,
                },
                property: screen_property(conf, producer),
                mirror_source: source.map(screen_node),
                displays: vec![display_node(conf.id)],
                mirror_source_changed: source.is_some(),
                cache_image: buffer.clone().filter(|_| conf.mirror_copy),
                buffer,
                dirty,
                ..ScreenRenderParams::default()
            });
            snapshot.nodes.insert(LogicalDisplayRenderParams {
                id: display_node(conf.id),
                ancestor_screen: screen_node(conf.id),
                mirror_source: source.map(display_node),
                mirror_source_rotation: conf
                    .mirror_source_rotation
                    .map(Into::into)
                    .unwrap_or(ScreenRotation::Invalid),
                screen_rotation: conf.rotation.into(),
                fixed_width: conf.size.0 as i32,
                fixed_height: conf.size.1 as i32,
                ..LogicalDisplayRenderParams::default()
            });
        }
        snapshot
    }
}

fn screen_property(conf: &ScreenConfig, producer: Option<Arc<dyn ProducerSurface>>) -> ScreenProperty {
    let (width, height) = conf.size;
    ScreenProperty {
        name: conf.name.clone(),
        width,
        height,
        phy_width: width,
        phy_height: height,
        correction: conf.correction.into(),
        auto_buffer_rotation: conf.auto_buffer_rotation,
        canvas_rotation: conf.canvas_rotation,
        scale_mode: conf.scale_mode.into(),
        visible_rect: conf.visible_rect.map(visible_rect),
        visible_rect_supports_rotation: conf
            .visible_rect
            .is_some_and(|rect| rect.supports_rotation),
        is_sampling_on: conf.sampling_scale.is_some(),
        sampling_scale: conf.sampling_scale.unwrap_or(1.0),
        color_gamut: ColorGamut::from(conf.color_gamut),
        mute: conf.mute,
        producer,
        ..ScreenProperty::default()
    }
}

fn visible_rect(def: VisibleRectDef) -> RectI {
    rect_from_xywh(def.x, def.y, def.w, def.h)
}

fn apply_env_overrides(config: &mut MirrorCompConfig) {
    let features = &mut config.features;
    if bool_var("MIRROR_COMP_DISABLE_SLR").unwrap_or(false) {
        info!("SLR scaling disabled by environment");
        features.slr_scale = false;
    }
    if bool_var("MIRROR_COMP_DISABLE_VIRTUAL_DIRTY").unwrap_or(false) {
        info!("Virtual dirty tracking disabled by environment");
        features.virtual_dirty = false;
    }
    if let Some(force_cpu) = bool_var("MIRROR_COMP_FORCE_CPU") {
        features.force_cpu = force_cpu;
    }
    if let Some(refresh_rate) = parse_var::<u32>("MIRROR_COMP_REFRESH_RATE").filter(|rate| *rate > 0) {
        config.refresh_rate = refresh_rate;
    }
}

/// Four coloured quadrants, so rotations and flips are visible in dumps.
pub fn test_pattern(width: u32, height: u32) -> Option<Pixmap> {
    let mut pixmap = Pixmap::new(width, height)?;
    let (w, h) = (width as f32 / 2.0, height as f32 / 2.0);
    for (x, y, color) in [
        (0.0, 0.0, Color::from_rgba8(220, 50, 47, 255)),
        (w, 0.0, Color::from_rgba8(38, 139, 210, 255)),
        (0.0, h, Color::from_rgba8(133, 153, 0, 255)),
        (w, h, Color::from_rgba8(238, 232, 213, 255)),
    ] {
        let mut paint = Paint::default();
        paint.set_color(color);
        if let Some(rect) = Rect::from_xywh(x, y, w, h) {
            pixmap.fill_rect(rect, &paint, Transform::identity(), None);
        }
    }
    Some(pixmap)
}
