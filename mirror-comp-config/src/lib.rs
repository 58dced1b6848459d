// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};
use std::{fs::OpenOptions, path::Path};
use tracing::{error, warn};

pub mod screen;
pub use self::screen::*;

fn default_refresh_rate() -> u32 {
    60
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MirrorCompConfig {
    #[serde(default = "default_refresh_rate")]
    pub refresh_rate: u32,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub screens: Vec<ScreenConfig>,
}

impl Default for MirrorCompConfig {
    fn default() -> MirrorCompConfig {
        MirrorCompConfig {
            refresh_rate: default_refresh_rate(),
            features: FeatureConfig::default(),
            screens: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Switches for optional parts of the mirroring pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct FeatureConfig {
    #[serde(default = "default_true")]
    pub slr_scale: bool,
    #[serde(default = "default_true")]
    pub virtual_dirty: bool,
    #[serde(default)]
    pub draw_mirror_cache_image: bool,
    #[serde(default)]
    pub force_cpu: bool,
}

impl Default for FeatureConfig {
    fn default() -> FeatureConfig {
        FeatureConfig {
            slr_scale: true,
            virtual_dirty: true,
            draw_mirror_cache_image: false,
            force_cpu: false,
        }
    }
}

impl MirrorCompConfig {
    pub fn screen(&self, id: u64) -> Option<&ScreenConfig> {
        self.screens.iter().find(|screen| screen.id == id)
    }

    /// Resets mirroring tags that point at unknown or non-enabled screens.
    pub fn validate_mirroring(&mut self) {
        let snapshot = self.screens.clone();
        for conf in self.screens.iter_mut() {
            if let MirrorState::Mirroring(source) = &conf.enabled {
                let valid = snapshot
                    .iter()
                    .find(|other| other.id == *source && other.id != conf.id)
                    .is_some_and(|other| other.enabled == MirrorState::Enabled);
                if !valid {
                    warn!(
                        screen = conf.id,
                        source, "Invalid Mirroring tag, overriding with `Enabled` instead"
                    );
                    conf.enabled = MirrorState::Enabled;
                }
            }
        }
    }
}

pub fn load_config(path: Option<impl AsRef<Path>>) -> MirrorCompConfig {
    if let Some(path) = path.as_ref() {
        let path: &Path = path.as_ref();
        if path.exists() {
            let file = match OpenOptions::new().read(true).open(path) {
                Ok(file) => file,
                Err(err) => {
                    error!(?err, ?path, "Failed to open config file.");
                    return MirrorCompConfig::default();
                }
            };
            match ron::de::from_reader::<_, MirrorCompConfig>(file) {
                Ok(mut config) => {
                    config.validate_mirroring();
                    return config;
                }
                Err(err) => {
                    warn!(?err, ?path, "Failed to read config, using defaults..");
                }
            }
        }
    }

    MirrorCompConfig::default()
}
