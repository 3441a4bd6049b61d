// cvar.rs — console variables and the typed settings snapshots read by the loader

use crate::common::com_printf;

use bitflags::bitflags;
use std::collections::HashMap;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CvarFlags: u32 {
        /// Saved to config.
        const ARCHIVE = 0x0001;
        /// Cannot be changed from the console.
        const NOSET   = 0x0002;
        /// Value is only read when a map is loaded.
        const LATCH   = 0x0004;
    }
}

/// A console variable.
#[derive(Clone, Debug)]
pub struct Cvar {
    pub name: String,
    pub string: String,
    pub default: String,
    pub flags: CvarFlags,
    pub modified: bool,
    pub value: f32,
}

fn parse_value(s: &str) -> f32 {
    s.trim().parse::<f32>().unwrap_or(0.0)
}

/// The cvar table.
#[derive(Default)]
pub struct CvarContext {
    pub cvar_vars: Vec<Cvar>,
    cvar_index: HashMap<String, usize>,
}

impl CvarContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context with every variable this subsystem reads registered at its
    /// default value.
    pub fn with_world_defaults() -> Self {
        let mut ctx = Self::new();
        register_world_cvars(&mut ctx);
        ctx
    }

    pub fn find_var(&self, name: &str) -> Option<&Cvar> {
        self.cvar_index.get(name).map(|&idx| &self.cvar_vars[idx])
    }

    pub fn find_var_mut(&mut self, name: &str) -> Option<&mut Cvar> {
        match self.cvar_index.get(name) {
            Some(&idx) => Some(&mut self.cvar_vars[idx]),
            None => None,
        }
    }

    /// Get the floating-point value of a cvar. Returns 0 if not found.
    pub fn variable_value(&self, name: &str) -> f32 {
        self.find_var(name).map(|v| v.value).unwrap_or(0.0)
    }

    /// Get the string value of a cvar. Returns "" if not found.
    pub fn variable_string(&self, name: &str) -> &str {
        match self.find_var(name) {
            Some(var) => &var.string,
            None => "",
        }
    }

    /// Get or create a cvar. An existing variable keeps its value but gains
    /// the extra flags.
    pub fn get(&mut self, name: &str, value: &str, flags: CvarFlags) -> usize {
        if let Some(&idx) = self.cvar_index.get(name) {
            self.cvar_vars[idx].flags |= flags;
            return idx;
        }

        let idx = self.cvar_vars.len();
        self.cvar_vars.push(Cvar {
            name: name.to_string(),
            string: value.to_string(),
            default: value.to_string(),
            flags,
            modified: true,
            value: parse_value(value),
        });
        self.cvar_index.insert(name.to_string(), idx);
        idx
    }

    fn set2(&mut self, name: &str, value: &str, force: bool) -> usize {
        let idx = match self.cvar_index.get(name) {
            Some(&idx) => idx,
            None => return self.get(name, value, CvarFlags::empty()),
        };

        let var = &mut self.cvar_vars[idx];
        if !force && var.flags.contains(CvarFlags::NOSET) {
            com_printf(&format!("{} is write protected.\n", name));
            return idx;
        }

        if value == var.string {
            return idx; // not changed
        }

        var.modified = true;
        var.string = value.to_string();
        var.value = parse_value(value);
        idx
    }

    /// Set a cvar value (respects NOSET).
    pub fn set(&mut self, name: &str, value: &str) -> usize {
        self.set2(name, value, false)
    }

    /// Force-set a cvar value (ignores NOSET).
    pub fn force_set(&mut self, name: &str, value: &str) -> usize {
        self.set2(name, value, true)
    }

    /// Set a cvar from a float value.
    pub fn set_value(&mut self, name: &str, value: f32) {
        let val_str = if value == (value as i32) as f32 {
            format!("{}", value as i32)
        } else {
            format!("{}", value)
        };
        self.set(name, &val_str);
    }

    /// Returns whether the variable changed since the last call and clears
    /// the flag.
    pub fn take_modified(&mut self, name: &str) -> bool {
        match self.find_var_mut(name) {
            Some(var) => std::mem::replace(&mut var.modified, false),
            None => false,
        }
    }

    pub fn reset_to_default(&mut self, name: &str) {
        if let Some(default) = self.find_var(name).map(|v| v.default.clone()) {
            self.force_set(name, &default);
        }
    }
}

// ============================================================
// Registered variables
// ============================================================

/// Every knob the world subsystem reads, with its default.
pub const WORLD_CVARS: &[(&str, &str, CvarFlags)] = &[
    ("developer", "0", CvarFlags::empty()),
    ("r_novis", "0", CvarFlags::ARCHIVE),
    ("r_flatlightstyles", "0", CvarFlags::ARCHIVE),
    ("r_dynamic", "1", CvarFlags::ARCHIVE),
    ("gl_overbright", "1", CvarFlags::ARCHIVE),
    ("r_scenecache", "", CvarFlags::empty()),
    ("r_oldskyleaf", "0", CvarFlags::empty()),
    ("r_brokenturbbias", "1", CvarFlags::ARCHIVE),
    ("mod_lightscale_broken", "1", CvarFlags::empty()),
    ("mod_ignorelmscale", "0", CvarFlags::empty()),
    ("mod_lightgrid", "1", CvarFlags::empty()),
    ("external_ents", "1", CvarFlags::ARCHIVE),
    ("external_vis", "1", CvarFlags::ARCHIVE),
    ("gl_load24bit", "1", CvarFlags::ARCHIVE),
    ("gl_fullbrights", "1", CvarFlags::ARCHIVE),
    ("r_drawflat", "0", CvarFlags::empty()),
    ("r_lightmap", "0", CvarFlags::empty()),
    ("r_fullbright", "0", CvarFlags::empty()),
    ("r_showtris", "0", CvarFlags::empty()),
    ("r_wateralpha", "1", CvarFlags::ARCHIVE),
    ("r_lavaalpha", "0", CvarFlags::ARCHIVE),
    ("r_slimealpha", "0", CvarFlags::ARCHIVE),
    ("r_telealpha", "0", CvarFlags::ARCHIVE),
    ("gl_lightmap_format", "", CvarFlags::ARCHIVE),
];

pub fn register_world_cvars(ctx: &mut CvarContext) {
    for (name, value, flags) in WORLD_CVARS {
        ctx.get(name, value, *flags);
    }
}

/// Loader knobs, read once per map load.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoaderSettings {
    pub novis: bool,
    pub lightscale_broken: bool,
    pub ignore_lmscale: bool,
    pub external_ents: bool,
    pub external_vis: bool,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            novis: false,
            lightscale_broken: true,
            ignore_lmscale: false,
            external_ents: true,
            external_vis: true,
        }
    }
}

impl LoaderSettings {
    pub fn from_cvars(cvars: &CvarContext) -> Self {
        Self {
            novis: cvars.variable_value("r_novis") != 0.0,
            lightscale_broken: cvars.variable_value("mod_lightscale_broken") != 0.0,
            ignore_lmscale: cvars.variable_value("mod_ignorelmscale") != 0.0,
            external_ents: cvars.variable_value("external_ents") != 0.0,
            external_vis: cvars.variable_value("external_vis") != 0.0,
        }
    }
}
