// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub enum MirrorState {
    Enabled,
    Disabled,
    /// Mirror the screen with the given id.
    Mirroring(u64),
}

fn default_state() -> MirrorState {
    MirrorState::Enabled
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RotationDef {
    #[default]
    Rotation0,
    Rotation90,
    Rotation180,
    Rotation270,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScaleModeDef {
    Fill,
    #[default]
    Uniform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColorGamutDef {
    Native,
    #[default]
    Srgb,
    DisplayP3,
    Bt2020,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScreenKindDef {
    /// A physical panel driven by the display controller.
    #[default]
    Wired,
    /// An off-screen output consumed by a codec or a capture client.
    Virtual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibleRectDef {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    #[serde(default)]
    pub supports_rotation: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ScreenConfig {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: ScreenKindDef,
    /// Buffer size in pixels, before any rotation.
    pub size: (u32, u32),
    /// Rotation of the logical display shown on this screen.
    #[serde(default)]
    pub rotation: RotationDef,
    /// Mounting offset of the panel.
    #[serde(default)]
    pub correction: RotationDef,
    #[serde(default)]
    pub auto_buffer_rotation: bool,
    #[serde(default)]
    pub canvas_rotation: bool,
    #[serde(default)]
    pub scale_mode: ScaleModeDef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible_rect: Option<VisibleRectDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_scale: Option<f32>,
    #[serde(default)]
    pub color_gamut: ColorGamutDef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_source_rotation: Option<RotationDef>,
    #[serde(default)]
    pub mirror_copy: bool,
    /// Show black instead of the mirrored content.
    #[serde(default)]
    pub mute: bool,
    #[serde(default = "default_state")]
    pub enabled: MirrorState,
}

impl Default for ScreenConfig {
    fn default() -> ScreenConfig {
        ScreenConfig {
            id: 0,
            name: String::new(),
            kind: ScreenKindDef::Wired,
            size: (0, 0),
            rotation: RotationDef::Rotation0,
            correction: RotationDef::Rotation0,
            auto_buffer_rotation: false,
            canvas_rotation: false,
            scale_mode: ScaleModeDef::Uniform,
            visible_rect: None,
            sampling_scale: None,
            color_gamut: ColorGamutDef::Srgb,
            mirror_source_rotation: None,
            mirror_copy: false,
            mute: false,
            enabled: MirrorState::Enabled,
        }
    }
}

impl ScreenConfig {
    pub fn mirror_source(&self) -> Option<u64> {
        match self.enabled {
            MirrorState::Mirroring(id) => Some(id),
            _ => None,
        }
    }
}
