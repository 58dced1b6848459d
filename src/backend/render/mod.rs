// SPDX-License-Identifier: GPL-3.0-only

use mirror_comp_config::ColorGamutDef;

pub mod canvas;
pub mod rotation;
pub mod scale;
pub mod slr;

pub use self::canvas::Canvas;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ColorGamut {
    /// Panel native gamut, treated as a fixed Display-P3 request on virtual screens.
    Native,
    #[default]
    Srgb,
    DisplayP3,
    Bt2020,
    Bt2100Hlg,
}

impl ColorGamut {
    pub fn is_srgb(self) -> bool {
        self == ColorGamut::Srgb
    }
}

impl From<ColorGamutDef> for ColorGamut {
    fn from(def: ColorGamutDef) -> ColorGamut {
        match def {
            ColorGamutDef::Native => ColorGamut::Native,
            ColorGamutDef::Srgb => ColorGamut::Srgb,
            ColorGamutDef::DisplayP3 => ColorGamut::DisplayP3,
            ColorGamutDef::Bt2020 => ColorGamut::Bt2020,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelFormat {
    #[default]
    Rgba8888,
    Rgba1010102,
}

/// Picks the gamut of a virtual frame.
///
/// Without a mirror source the destination's own request decides. When
/// mirroring, a native request always upgrades and any other wide request only
/// upgrades if the source screen is wide as well.
pub fn virtual_frame_gamut(virtual_gamut: ColorGamut, source_gamut: Option<ColorGamut>) -> ColorGamut {
    let wide = match source_gamut {
        Some(source) => {
            virtual_gamut == ColorGamut::Native || (!virtual_gamut.is_srgb() && !source.is_srgb())
        }
        None => !virtual_gamut.is_srgb(),
    };
    if wide {
        ColorGamut::DisplayP3
    } else {
        ColorGamut::Srgb
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_gamut_upgrade() {
        use ColorGamut::*;
        for (virtual_gamut, source, expected) in [
            (Srgb, None, Srgb),
            (DisplayP3, None, DisplayP3),
            (Native, None, DisplayP3),
            (Native, Some(Srgb), DisplayP3),
            (DisplayP3, Some(Srgb), Srgb),
            (DisplayP3, Some(Bt2020), DisplayP3),
            (Srgb, Some(DisplayP3), Srgb),
        ] {
            assert_eq!(
                virtual_frame_gamut(virtual_gamut, source),
                expected,
                "{virtual_gamut:?} mirroring {source:?}"
            );
        }
    }
}
