// SPDX-License-Identifier: GPL-3.0-only

//! Render parameter snapshot handed to the render thread every frame.
//!
//! Nodes reference each other by [`NodeId`] through a [`RenderNodeArena`],
//! so resolving a mirror chain is a series of lookups that each fail with a
//! [`LinkageError`] instead of dangling.

use crate::{
    backend::{
        render::{rotation::ScreenRotation, scale::ScaleMode, ColorGamut},
        virtual_screen::{dirty::DirtyHistory, fence::HardwareLayer, surface::ProducerSurface},
    },
    utils::{
        geometry::{empty_rect, rect_from_xywh, RectI},
        NodeId,
    },
};
use std::{collections::HashMap, sync::Arc};
use tiny_skia::{Pixmap, Transform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Screen,
    LogicalDisplay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScreenKind {
    #[default]
    Wired,
    Virtual,
}

#[derive(Debug, Clone, Default)]
pub struct ScreenProperty {
    pub name: String,
    /// Buffer size before any buffer rotation.
    pub width: u32,
    pub height: u32,
    pub phy_width: u32,
    pub phy_height: u32,
    pub correction: ScreenRotation,
    pub auto_buffer_rotation: bool,
    pub canvas_rotation: bool,
    pub scale_mode: ScaleMode,
    pub visible_rect: Option<RectI>,
    pub visible_rect_supports_rotation: bool,
    pub is_sampling_on: bool,
    pub sampling_scale: f32,
    pub sampling_translate_x: f32,
    pub sampling_translate_y: f32,
    pub sampling_distance: i32,
    pub color_gamut: ColorGamut,
    pub paused: bool,
    /// A muted screen shows its security mask, or black, instead of the mirror.
    pub mute: bool,
    pub security_mask: Option<Arc<Pixmap>>,
    pub fixed_10bit_buffer: bool,
    pub producer: Option<Arc<dyn ProducerSurface>>,
}

#[derive(Debug, Clone)]
pub struct ScreenRenderParams {
    pub id: NodeId,
    pub kind: ScreenKind,
    pub property: ScreenProperty,
    /// Screen this one mirrors.
    pub mirror_source: Option<NodeId>,
    /// Logical displays shown on this screen, the first one drives mirroring.
    pub displays: Vec<NodeId>,
    pub mirror_source_changed: bool,
    pub virtual_surface_changed: bool,
    pub hdr_present: bool,
    /// The screen stops rendering while it is off, so its cache image goes stale.
    pub render_skip_if_screen_off: bool,
    /// Vsync period matches the one of the mirrored screen.
    pub equal_vsync_period: bool,
    /// Last composited frame of the screen.
    pub buffer: Option<Arc<Pixmap>>,
    /// Copy of the composition kept for capture and mirror copies.
    pub cache_image: Option<Arc<Pixmap>>,
    pub dirty: DirtyHistory,
    pub hwc_dirty: RectI,
    pub matrix: Transform,
}

impl Default for ScreenRenderParams {
    fn default() -> ScreenRenderParams {
        ScreenRenderParams {
            id: 0,
            kind: ScreenKind::Wired,
            property: ScreenProperty::default(),
            mirror_source: None,
            displays: Vec::new(),
            mirror_source_changed: false,
            virtual_surface_changed: false,
            hdr_present: false,
            render_skip_if_screen_off: false,
            equal_vsync_period: true,
            buffer: None,
            cache_image: None,
            dirty: DirtyHistory::new(),
            hwc_dirty: empty_rect(),
            matrix: Transform::identity(),
        }
    }
}

impl ScreenRenderParams {
    pub fn bounds(&self) -> RectI {
        rect_from_xywh(
            0,
            0,
            self.property.width as i32,
            self.property.height as i32,
        )
    }
}

#[derive(Debug, Clone)]
pub struct LogicalDisplayRenderParams {
    pub id: NodeId,
    pub ancestor_screen: NodeId,
    /// Display this one mirrors.
    pub mirror_source: Option<NodeId>,
    /// Rotation the mirrored content was captured with, `Invalid` if unknown.
    pub mirror_source_rotation: ScreenRotation,
    pub screen_rotation: ScreenRotation,
    pub fixed_width: i32,
    pub fixed_height: i32,
    pub content_rect: RectI,
    pub offset_x: i32,
    pub offset_y: i32,
    pub special_layer_changed: bool,
    pub security_display: bool,
    /// Security or skip layers are visible on the display.
    pub has_special_layer: bool,
}

impl Default for LogicalDisplayRenderParams {
    fn default() -> LogicalDisplayRenderParams {
        LogicalDisplayRenderParams {
            id: 0,
            ancestor_screen: 0,
            mirror_source: None,
            mirror_source_rotation: ScreenRotation::Invalid,
            screen_rotation: ScreenRotation::Rotation0,
            fixed_width: 0,
            fixed_height: 0,
            content_rect: empty_rect(),
            offset_x: 0,
            offset_y: 0,
            special_layer_changed: false,
            security_display: false,
            has_special_layer: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RenderParams {
    Screen(ScreenRenderParams),
    LogicalDisplay(LogicalDisplayRenderParams),
}

impl RenderParams {
    pub fn id(&self) -> NodeId {
        match self {
            RenderParams::Screen(screen) => screen.id,
            RenderParams::LogicalDisplay(display) => display.id,
        }
    }

    pub fn kind(&self) -> ParamKind {
        match self {
            RenderParams::Screen(_) => ParamKind::Screen,
            RenderParams::LogicalDisplay(_) => ParamKind::LogicalDisplay,
        }
    }

    pub fn as_screen(&self) -> Option<&ScreenRenderParams> {
        match self {
            RenderParams::Screen(screen) => Some(screen),
            _ => None,
        }
    }

    pub fn as_display(&self) -> Option<&LogicalDisplayRenderParams> {
        match self {
            RenderParams::LogicalDisplay(display) => Some(display),
            _ => None,
        }
    }
}

impl From<ScreenRenderParams> for RenderParams {
    fn from(screen: ScreenRenderParams) -> RenderParams {
        RenderParams::Screen(screen)
    }
}

impl From<LogicalDisplayRenderParams> for RenderParams {
    fn from(display: LogicalDisplayRenderParams) -> RenderParams {
        RenderParams::LogicalDisplay(display)
    }
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum LinkageError {
    #[error("render node {0} does not exist")]
    MissingNode(NodeId),
    #[error("render node {id} is not a {expected:?}")]
    WrongKind { id: NodeId, expected: ParamKind },
    #[error("mirror screen {0} has no child display")]
    NoChildDisplay(NodeId),
    #[error("display {0} has no mirror source")]
    NoMirrorSource(NodeId),
}

/// Mirror chain of a destination screen, resolved for one frame.
#[derive(Debug, Clone, Copy)]
pub struct MirrorLinkage<'a> {
    /// First display of the destination screen.
    pub display: &'a LogicalDisplayRenderParams,
    pub source_display: &'a LogicalDisplayRenderParams,
    /// Screen named by the destination as its mirror source.
    pub source_screen: &'a ScreenRenderParams,
    /// Screen the mirrored display is shown on.
    pub ancestor_screen: &'a ScreenRenderParams,
}

#[derive(Debug, Clone, Default)]
pub struct RenderNodeArena {
    nodes: HashMap<NodeId, RenderParams>,
}

impl RenderNodeArena {
    pub fn new() -> RenderNodeArena {
        RenderNodeArena::default()
    }

    pub fn insert(&mut self, params: impl Into<RenderParams>) -> Option<RenderParams> {
        let params = params.into();
        self.nodes.insert(params.id(), params)
    }

    pub fn remove(&mut self, id: NodeId) -> Option<RenderParams> {
        self.nodes.remove(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<&RenderParams> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut RenderParams> {
        self.nodes.get_mut(&id)
    }

    pub fn screen(&self, id: NodeId) -> Result<&ScreenRenderParams, LinkageError> {
        self.get(id)
            .ok_or(LinkageError::MissingNode(id))?
            .as_screen()
            .ok_or(LinkageError::WrongKind {
                id,
                expected: ParamKind::Screen,
            })
    }

    pub fn screen_mut(&mut self, id: NodeId) -> Option<&mut ScreenRenderParams> {
        match self.nodes.get_mut(&id) {
            Some(RenderParams::Screen(screen)) => Some(screen),
            _ => None,
        }
    }

    pub fn display(&self, id: NodeId) -> Result<&LogicalDisplayRenderParams, LinkageError> {
        self.get(id)
            .ok_or(LinkageError::MissingNode(id))?
            .as_display()
            .ok_or(LinkageError::WrongKind {
                id,
                expected: ParamKind::LogicalDisplay,
            })
    }

    pub fn display_mut(&mut self, id: NodeId) -> Option<&mut LogicalDisplayRenderParams> {
        match self.nodes.get_mut(&id) {
            Some(RenderParams::LogicalDisplay(display)) => Some(display),
            _ => None,
        }
    }

    pub fn screens(&self) -> impl Iterator<Item = &ScreenRenderParams> {
        self.nodes.values().filter_map(RenderParams::as_screen)
    }

    /// Mirror chain of `screen`, `None` if it does not mirror anything.
    pub fn resolve_mirror_linkage(
        &self,
        screen: &ScreenRenderParams,
    ) -> Result<Option<MirrorLinkage<'_>>, LinkageError> {
        let Some(source_id) = screen.mirror_source else {
            return Ok(None);
        };
        let source_screen = self.screen(source_id)?;
        let display_id = *screen
            .displays
            .first()
            .ok_or(LinkageError::NoChildDisplay(screen.id))?;
        let display = self.display(display_id)?;
        let source_display_id = display
            .mirror_source
            .ok_or(LinkageError::NoMirrorSource(display_id))?;
        let source_display = self.display(source_display_id)?;
        let ancestor_screen = self.screen(source_display.ancestor_screen)?;
        Ok(Some(MirrorLinkage {
            display,
            source_display,
            source_screen,
            ancestor_screen,
        }))
    }
}

/// Per-frame switches and shared state of the render thread.
#[derive(Debug, Clone)]
pub struct RenderThreadParams {
    pub slr_scale_enabled: bool,
    pub virtual_dirty_enabled: bool,
    pub draw_mirror_cache_image: bool,
    pub force_mirror_screen_dirty: bool,
    pub virtual_dirty_refresh: bool,
    pub force_cpu: bool,
    pub color_filter_mode: bool,
    pub hardware_layers: Vec<HardwareLayer>,
}

impl Default for RenderThreadParams {
    fn default() -> RenderThreadParams {
        RenderThreadParams {
            slr_scale_enabled: true,
            virtual_dirty_enabled: true,
            draw_mirror_cache_image: false,
            force_mirror_screen_dirty: false,
            virtual_dirty_refresh: false,
            force_cpu: false,
            color_filter_mode: false,
            hardware_layers: Vec::new(),
        }
    }
}

/// Everything the render thread needs for one vsync.
#[derive(Debug, Clone, Default)]
pub struct RenderSnapshot {
    pub nodes: RenderNodeArena,
    pub thread: RenderThreadParams,
}

impl RenderSnapshot {
    /// Clears everything that only applies to the frame just rendered, so
    /// the snapshot can be drawn again on the next vsync without new params.
    /// Every screen opens an empty dirty frame for the next vsync.
    pub fn consume_frame_flags(&mut self) {
        self.thread.force_mirror_screen_dirty = false;
        self.thread.virtual_dirty_refresh = false;
        for node in self.nodes.nodes.values_mut() {
            match node {
                RenderParams::Screen(screen) => {
                    screen.mirror_source_changed = false;
                    screen.virtual_surface_changed = false;
                    screen.hwc_dirty = empty_rect();
                    screen.dirty.push_frame(std::iter::empty());
                }
                RenderParams::LogicalDisplay(display) => display.special_layer_changed = false,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn arena() -> RenderNodeArena {
        let mut arena = RenderNodeArena::new();
        arena.insert(ScreenRenderParams {
            id: 1,
            displays: vec![10],
            ..ScreenRenderParams::default()
        });
        arena.insert(LogicalDisplayRenderParams {
            id: 10,
            ancestor_screen: 1,
            ..LogicalDisplayRenderParams::default()
        });
        arena.insert(ScreenRenderParams {
            id: 2,
            kind: ScreenKind::Virtual,
            mirror_source: Some(1),
            displays: vec![20],
            ..ScreenRenderParams::default()
        });
        arena.insert(LogicalDisplayRenderParams {
            id: 20,
            ancestor_screen: 2,
            mirror_source: Some(10),
            mirror_source_rotation: ScreenRotation::Rotation90,
            ..LogicalDisplayRenderParams::default()
        });
        arena
    }

    #[test]
    fn resolves_mirror_chain() {
        let arena = arena();
        let dest = arena.screen(2).unwrap();
        let linkage = arena.resolve_mirror_linkage(dest).unwrap().unwrap();
        assert_eq!(linkage.source_screen.id, 1);
        assert_eq!(linkage.ancestor_screen.id, 1);
        assert_eq!(linkage.source_display.id, 10);
        assert_eq!(linkage.display.mirror_source_rotation, ScreenRotation::Rotation90);

        let source = arena.screen(1).unwrap();
        assert!(arena.resolve_mirror_linkage(source).unwrap().is_none());
        assert_eq!(arena.get(10).map(RenderParams::kind), Some(ParamKind::LogicalDisplay));
    }

    #[test]
    fn broken_chain_is_an_error() {
        let cases: [(fn(&mut RenderNodeArena), LinkageError); 4] = [
            (
                |arena| {
                    arena.remove(1);
                },
                LinkageError::MissingNode(1),
            ),
            (
                |arena| {
                    arena.screen_mut(2).unwrap().displays.clear();
                },
                LinkageError::NoChildDisplay(2),
            ),
            (
                |arena| {
                    arena.display_mut(20).unwrap().mirror_source = None;
                },
                LinkageError::NoMirrorSource(20),
            ),
            (
                |arena| {
                    arena.display_mut(20).unwrap().mirror_source = Some(2);
                },
                LinkageError::WrongKind {
                    id: 2,
                    expected: ParamKind::LogicalDisplay,
                },
            ),
        ];
        for (break_chain, expected) in cases {
            let mut arena = arena();
            break_chain(&mut arena);
            let dest = arena.screen(2).unwrap();
            assert_eq!(arena.resolve_mirror_linkage(dest).unwrap_err(), expected);
        }
    }

    #[test]
    fn consumed_flags_do_not_repeat() {
        let mut snapshot = RenderSnapshot {
            nodes: arena(),
            thread: RenderThreadParams {
                virtual_dirty_refresh: true,
                ..RenderThreadParams::default()
            },
        };
        {
            let source = snapshot.nodes.screen_mut(1).unwrap();
            source.dirty.add_to_current([rect_from_xywh(0, 0, 10, 10)]);
            source.hwc_dirty = rect_from_xywh(5, 5, 5, 5);
        }
        snapshot.nodes.screen_mut(2).unwrap().mirror_source_changed = true;

        snapshot.consume_frame_flags();
        let source = snapshot.nodes.screen(1).unwrap();
        assert!(source.dirty.current_frame().is_empty());
        assert_eq!(source.dirty.len(), 2);
        assert_eq!(source.hwc_dirty, empty_rect());
        assert!(!snapshot.nodes.screen(2).unwrap().mirror_source_changed);
        assert!(!snapshot.thread.virtual_dirty_refresh);

        // a vsync without changes still advances the history
        snapshot.consume_frame_flags();
        assert_eq!(snapshot.nodes.screen(1).unwrap().dirty.len(), 3);
    }
}
