// settings.rs — renderer knobs snapshotted from the cvar table once per frame

use q1bsp_common::cvar::CvarContext;
use q1bsp_common::model::SurfFlags;

/// Physical texel layout of the lightmap atlas. Every format is 4 bytes per
/// texel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightmapFormat {
    Rgba8,
    Bgra8,
    /// Shared-exponent HDR, needs a GL3-class backend.
    E5bgr9,
}

impl LightmapFormat {
    pub const fn bytes_per_texel(self) -> usize {
        4
    }

    /// Resolves `gl_lightmap_format`. Empty or unknown picks the best format
    /// the backend can sample.
    pub fn resolve(name: &str, hdr_capable: bool) -> LightmapFormat {
        match name.trim().to_ascii_lowercase().as_str() {
            "rgba" | "rgba8" => LightmapFormat::Rgba8,
            "bgra" | "bgra8" => LightmapFormat::Bgra8,
            "e5bgr9" | "rgb9e5" if hdr_capable => LightmapFormat::E5bgr9,
            _ if hdr_capable => LightmapFormat::E5bgr9,
            _ => LightmapFormat::Rgba8,
        }
    }
}

/// How animated light styles are displayed (`r_flatlightstyles`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StyleMode {
    /// Step through the style string at 10Hz.
    #[default]
    Animated,
    /// Hold the time-averaged brightness.
    Average,
    /// Hold the brightest character.
    Peak,
}

impl StyleMode {
    pub fn from_value(v: f32) -> StyleMode {
        if v == 2.0 {
            StyleMode::Peak
        } else if v == 1.0 {
            StyleMode::Average
        } else {
            StyleMode::Animated
        }
    }
}

/// `r_scenecache`: 0 off, 1 on, 2 on without baking brush entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneCacheMode {
    Off,
    On,
    NoSubmodels,
}

/// Opacity of liquid surfaces. Lava, slime and teleporters fall back to the
/// water value when their own is zero or less.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiquidAlpha {
    pub water: f32,
    pub lava: f32,
    pub slime: f32,
    pub tele: f32,
}

impl Default for LiquidAlpha {
    fn default() -> Self {
        Self {
            water: 1.0,
            lava: 0.0,
            slime: 0.0,
            tele: 0.0,
        }
    }
}

impl LiquidAlpha {
    fn pick(&self, specific: f32) -> f32 {
        let a = if specific > 0.0 { specific } else { self.water };
        a.clamp(0.0, 1.0)
    }

    pub fn for_flags(&self, flags: SurfFlags) -> f32 {
        if flags.contains(SurfFlags::DRAWLAVA) {
            self.pick(self.lava)
        } else if flags.contains(SurfFlags::DRAWSLIME) {
            self.pick(self.slime)
        } else if flags.contains(SurfFlags::DRAWTELE) {
            self.pick(self.tele)
        } else {
            self.water.clamp(0.0, 1.0)
        }
    }

    /// Same choice made from a `*name` texture name, for batches that carry
    /// no surface flags.
    pub fn for_texture_name(&self, name: &str) -> f32 {
        let liquid = name.strip_prefix('*').unwrap_or(name);
        if liquid.starts_with("lava") {
            self.pick(self.lava)
        } else if liquid.starts_with("slime") {
            self.pick(self.slime)
        } else if liquid.starts_with("tele") {
            self.pick(self.tele)
        } else {
            self.water.clamp(0.0, 1.0)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderSettings {
    pub novis: bool,
    pub style_mode: StyleMode,
    pub dynamic: bool,
    pub overbright: bool,
    pub scenecache: SceneCacheMode,
    pub oldskyleaf: bool,
    pub brokenturbbias: bool,
    pub lightgrid: bool,
    pub load24bit: bool,
    pub fullbrights: bool,
    pub drawflat: bool,
    pub lightmap: bool,
    pub fullbright: bool,
    pub showtris: bool,
    pub liquid_alpha: LiquidAlpha,
    pub lightmap_format: String,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            novis: false,
            style_mode: StyleMode::Animated,
            dynamic: true,
            overbright: true,
            scenecache: SceneCacheMode::On,
            oldskyleaf: false,
            brokenturbbias: true,
            lightgrid: true,
            load24bit: true,
            fullbrights: true,
            drawflat: false,
            lightmap: false,
            fullbright: false,
            showtris: false,
            liquid_alpha: LiquidAlpha::default(),
            lightmap_format: String::new(),
        }
    }
}

impl RenderSettings {
    pub fn from_cvars(cvars: &CvarContext) -> Self {
        let on = |name: &str| cvars.variable_value(name) != 0.0;

        // an empty r_scenecache means "auto", which is on
        let scenecache = if cvars.variable_string("r_scenecache").trim().is_empty() {
            SceneCacheMode::On
        } else {
            match cvars.variable_value("r_scenecache") {
                v if v == 0.0 => SceneCacheMode::Off,
                v if v == 2.0 => SceneCacheMode::NoSubmodels,
                _ => SceneCacheMode::On,
            }
        };

        Self {
            novis: on("r_novis"),
            style_mode: StyleMode::from_value(cvars.variable_value("r_flatlightstyles")),
            dynamic: on("r_dynamic"),
            overbright: on("gl_overbright"),
            scenecache,
            oldskyleaf: on("r_oldskyleaf"),
            brokenturbbias: on("r_brokenturbbias"),
            lightgrid: on("mod_lightgrid"),
            load24bit: on("gl_load24bit"),
            fullbrights: on("gl_fullbrights"),
            drawflat: on("r_drawflat"),
            lightmap: on("r_lightmap"),
            fullbright: on("r_fullbright"),
            showtris: on("r_showtris"),
            liquid_alpha: LiquidAlpha {
                water: cvars.variable_value("r_wateralpha"),
                lava: cvars.variable_value("r_lavaalpha"),
                slime: cvars.variable_value("r_slimealpha"),
                tele: cvars.variable_value("r_telealpha"),
            },
            lightmap_format: cvars.variable_string("gl_lightmap_format").to_string(),
        }
    }

    /// Diagnostic views that replace the normal shaded pass.
    pub fn debug_view(&self) -> bool {
        self.drawflat || self.lightmap || self.fullbright
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_registered_cvars() {
        let ctx = CvarContext::with_world_defaults();
        assert_eq!(RenderSettings::from_cvars(&ctx), RenderSettings::default());
    }

    #[test]
    fn test_scenecache_modes() {
        let mut ctx = CvarContext::with_world_defaults();
        ctx.set("r_scenecache", "0");
        assert_eq!(RenderSettings::from_cvars(&ctx).scenecache, SceneCacheMode::Off);
        ctx.set("r_scenecache", "2");
        assert_eq!(RenderSettings::from_cvars(&ctx).scenecache, SceneCacheMode::NoSubmodels);
        ctx.set("r_scenecache", "1");
        assert_eq!(RenderSettings::from_cvars(&ctx).scenecache, SceneCacheMode::On);
    }

    #[test]
    fn test_style_mode_and_debug_view() {
        let mut ctx = CvarContext::with_world_defaults();
        ctx.set("r_flatlightstyles", "2");
        ctx.set("r_lightmap", "1");
        let s = RenderSettings::from_cvars(&ctx);
        assert_eq!(s.style_mode, StyleMode::Peak);
        assert!(s.debug_view());
        assert!(!s.showtris);
    }

    #[test]
    fn test_liquid_alpha_fallback() {
        let mut ctx = CvarContext::with_world_defaults();
        ctx.set("r_wateralpha", "0.5");
        ctx.set("r_lavaalpha", "0.8");
        let a = RenderSettings::from_cvars(&ctx).liquid_alpha;
        assert_eq!(a.for_flags(SurfFlags::DRAWTURB | SurfFlags::DRAWLAVA), 0.8);
        assert_eq!(a.for_flags(SurfFlags::DRAWTURB | SurfFlags::DRAWSLIME), 0.5);
        assert_eq!(a.for_texture_name("*lava1"), 0.8);
        assert_eq!(a.for_texture_name("*teleport"), 0.5);
        assert_eq!(a.for_texture_name("*water0"), 0.5);
    }

    #[test]
    fn test_lightmap_format_resolution() {
        assert_eq!(LightmapFormat::resolve("", true), LightmapFormat::E5bgr9);
        assert_eq!(LightmapFormat::resolve("", false), LightmapFormat::Rgba8);
        assert_eq!(LightmapFormat::resolve("BGRA", true), LightmapFormat::Bgra8);
        assert_eq!(LightmapFormat::resolve("e5bgr9", false), LightmapFormat::Rgba8);
    }
}
