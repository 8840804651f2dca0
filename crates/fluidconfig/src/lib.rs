use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to parse configuration patch: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to serialise configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// RGB color with channels on the 0–255 scale used by exported configs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Color {
    pub const BLACK: Color = Color::new(0.0, 0.0, 0.0);

    pub const fn new(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }

    /// Channels mapped onto 0.0–1.0.
    pub fn normalized(&self) -> [f32; 3] {
        [self.r / 255.0, self.g / 255.0, self.b / 255.0]
    }

    fn is_valid(&self) -> bool {
        [self.r, self.g, self.b]
            .iter()
            .all(|c| c.is_finite() && (0.0..=255.0).contains(c))
    }
}

impl<'de> Deserialize<'de> for Color {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Helper {
            Hex(String),
            Table { r: f32, g: f32, b: f32 },
            Array([f32; 3]),
        }

        match Helper::deserialize(deserializer)? {
            Helper::Hex(raw) => parse_hex_color(&raw).map_err(de::Error::custom),
            Helper::Table { r, g, b } => Ok(Color::new(r, g, b)),
            Helper::Array([r, g, b]) => Ok(Color::new(r, g, b)),
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rgb({}, {}, {})", self.r, self.g, self.b)
    }
}

fn parse_hex_color(raw: &str) -> Result<Color, String> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix('#').unwrap_or(trimmed);
    if digits.len() != 6 || !digits.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return Err(format!("invalid color '{raw}'; expected #rrggbb"));
    }
    let channel = |range: std::ops::Range<usize>| {
        u8::from_str_radix(&digits[range], 16)
            .map(f32::from)
            .map_err(|err| format!("invalid color '{raw}': {err}"))
    };
    Ok(Color::new(channel(0..2)?, channel(2..4)?, channel(4..6)?))
}

/// Fully populated simulation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct Config {
    pub sim_resolution: u32,
    pub dye_resolution: u32,
    pub capture_resolution: u32,
    pub density_dissipation: f32,
    pub velocity_dissipation: f32,
    pub pressure: f32,
    pub pressure_iterations: u32,
    pub curl: f32,
    pub splat_radius: f32,
    pub splat_force: f32,
    pub splat_count: u32,
    pub splat_speed: f32,
    pub shading: bool,
    pub colorful: bool,
    pub color_update_speed: f32,
    pub rainbow_mode: bool,
    pub splat_color: Color,
    pub paused: bool,
    pub back_color: Color,
    pub transparent: bool,
    pub bloom: bool,
    pub bloom_iterations: u32,
    pub bloom_resolution: u32,
    pub bloom_intensity: f32,
    pub bloom_threshold: f32,
    pub bloom_soft_knee: f32,
    pub sunrays: bool,
    pub sunrays_resolution: u32,
    pub sunrays_weight: f32,
    pub mirror_mode: bool,
    pub mirror_segments: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sim_resolution: 128,
            dye_resolution: 1024,
            capture_resolution: 512,
            density_dissipation: 1.0,
            velocity_dissipation: 0.2,
            pressure: 0.8,
            pressure_iterations: 20,
            curl: 30.0,
            splat_radius: 0.25,
            splat_force: 6000.0,
            splat_count: 5,
            splat_speed: 1000.0,
            shading: true,
            colorful: true,
            color_update_speed: 10.0,
            rainbow_mode: true,
            splat_color: Color::new(255.0, 0.0, 128.0),
            paused: false,
            back_color: Color::BLACK,
            transparent: false,
            bloom: true,
            bloom_iterations: 8,
            bloom_resolution: 256,
            bloom_intensity: 0.8,
            bloom_threshold: 0.6,
            bloom_soft_knee: 0.7,
            sunrays: true,
            sunrays_resolution: 196,
            sunrays_weight: 1.0,
            mirror_mode: false,
            mirror_segments: 2,
        }
    }
}

/// Partial override; absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct ConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sim_resolution: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dye_resolution: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_resolution: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub density_dissipation: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity_dissipation: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curl: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub splat_radius: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub splat_force: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub splat_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub splat_speed: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shading: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colorful: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_update_speed: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rainbow_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub splat_color: Option<Color>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub back_color: Option<Color>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transparent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bloom: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bloom_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bloom_resolution: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bloom_intensity: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bloom_threshold: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bloom_soft_knee: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sunrays: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sunrays_resolution: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sunrays_weight: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_segments: Option<u32>,
}

macro_rules! for_each_field {
    ($mac:ident!($($args:tt)*)) => {
        $mac!(
            $($args)*;
            sim_resolution,
            dye_resolution,
            capture_resolution,
            density_dissipation,
            velocity_dissipation,
            pressure,
            pressure_iterations,
            curl,
            splat_radius,
            splat_force,
            splat_count,
            splat_speed,
            shading,
            colorful,
            color_update_speed,
            rainbow_mode,
            splat_color,
            paused,
            back_color,
            transparent,
            bloom,
            bloom_iterations,
            bloom_resolution,
            bloom_intensity,
            bloom_threshold,
            bloom_soft_knee,
            sunrays,
            sunrays_resolution,
            sunrays_weight,
            mirror_mode,
            mirror_segments
        )
    };
}

macro_rules! overwrite_from_patch {
    ($target:expr, $patch:expr; $($field:ident),*) => {
        $(
            if let Some(value) = $patch.$field {
                $target.$field = value;
            }
        )*
    };
}

macro_rules! layer_patch {
    ($target:expr, $patch:expr; $($field:ident),*) => {
        $(
            if $patch.$field.is_some() {
                $target.$field = $patch.$field;
            }
        )*
    };
}

/// Side-effect categories touched by a config update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigChanges {
    pub sim_resolution: bool,
    pub dye_resolution: bool,
    pub bloom_targets: bool,
    pub sunrays_resolution: bool,
    pub keywords: bool,
}

impl ConfigChanges {
    pub fn needs_realloc(&self) -> bool {
        self.sim_resolution || self.dye_resolution || self.bloom_targets || self.sunrays_resolution
    }

    pub fn needs_recompile(&self) -> bool {
        self.keywords
    }

    pub fn is_empty(&self) -> bool {
        !self.needs_realloc() && !self.needs_recompile()
    }

    fn between(before: &Config, after: &Config) -> Self {
        Self {
            sim_resolution: before.sim_resolution != after.sim_resolution,
            dye_resolution: before.dye_resolution != after.dye_resolution,
            bloom_targets: before.bloom_resolution != after.bloom_resolution
                || before.bloom_iterations != after.bloom_iterations,
            sunrays_resolution: before.sunrays_resolution != after.sunrays_resolution,
            keywords: before.shading != after.shading
                || before.bloom != after.bloom
                || before.sunrays != after.sunrays,
        }
    }
}

impl Config {
    /// Parses a possibly partial TOML document and merges it over the defaults.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let patch = ConfigPatch::from_toml_str(input)?;
        let mut config = Config::default();
        config.apply(&patch)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    /// Merges `patch` into this config. Leaves `self` untouched when the
    /// merged result fails validation.
    pub fn apply(&mut self, patch: &ConfigPatch) -> Result<ConfigChanges, ConfigError> {
        let mut next = self.clone();
        for_each_field!(overwrite_from_patch!(next, patch));
        next.validate()?;
        let changes = ConfigChanges::between(self, &next);
        *self = next;
        Ok(changes)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let resolutions = [
            ("SIM_RESOLUTION", self.sim_resolution),
            ("DYE_RESOLUTION", self.dye_resolution),
            ("CAPTURE_RESOLUTION", self.capture_resolution),
            ("BLOOM_RESOLUTION", self.bloom_resolution),
            ("SUNRAYS_RESOLUTION", self.sunrays_resolution),
        ];
        for (name, value) in resolutions {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if self.pressure_iterations == 0 {
            return Err(ConfigError::Invalid(
                "PRESSURE_ITERATIONS must be greater than zero".into(),
            ));
        }

        if self.mirror_segments == 0 {
            return Err(ConfigError::Invalid(
                "MIRROR_SEGMENTS must be greater than zero".into(),
            ));
        }

        let scalars = [
            ("DENSITY_DISSIPATION", self.density_dissipation),
            ("VELOCITY_DISSIPATION", self.velocity_dissipation),
            ("PRESSURE", self.pressure),
            ("CURL", self.curl),
            ("SPLAT_RADIUS", self.splat_radius),
            ("SPLAT_FORCE", self.splat_force),
            ("SPLAT_SPEED", self.splat_speed),
            ("COLOR_UPDATE_SPEED", self.color_update_speed),
            ("BLOOM_INTENSITY", self.bloom_intensity),
            ("BLOOM_THRESHOLD", self.bloom_threshold),
            ("BLOOM_SOFT_KNEE", self.bloom_soft_knee),
            ("SUNRAYS_WEIGHT", self.sunrays_weight),
        ];
        for (name, value) in scalars {
            if !value.is_finite() {
                return Err(ConfigError::Invalid(format!("{name} must be finite")));
            }
        }

        if self.density_dissipation < 0.0 || self.velocity_dissipation < 0.0 {
            return Err(ConfigError::Invalid(
                "dissipation values must be non-negative".into(),
            ));
        }

        if self.splat_radius <= 0.0 {
            return Err(ConfigError::Invalid(
                "SPLAT_RADIUS must be greater than zero".into(),
            ));
        }

        for (name, color) in [
            ("SPLAT_COLOR", &self.splat_color),
            ("BACK_COLOR", &self.back_color),
        ] {
            if !color.is_valid() {
                return Err(ConfigError::Invalid(format!(
                    "{name} channels must lie within 0..=255"
                )));
            }
        }

        Ok(())
    }
}

impl ConfigPatch {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(input)?)
    }

    /// Parses a single `KEY=VALUE` override. Values that are not valid TOML
    /// are treated as bare strings (so `SPLAT_COLOR=#ff0080` works).
    pub fn from_assignment(raw: &str) -> Result<Self, ConfigError> {
        let (key, value) = raw.split_once('=').ok_or_else(|| {
            ConfigError::Invalid(format!("override '{raw}' must have the form KEY=VALUE"))
        })?;
        let key = key.trim().to_ascii_uppercase();
        let value = value.trim();
        let document = format!("{key} = {value}");
        match toml::from_str::<ConfigPatch>(&document) {
            Ok(patch) => Ok(patch),
            Err(err) if toml::from_str::<toml::Table>(&document).is_err() => {
                let quoted = format!("{key} = {}", toml::Value::String(value.to_string()));
                toml::from_str(&quoted).map_err(|_| ConfigError::Parse(err))
            }
            Err(err) => Err(ConfigError::Parse(err)),
        }
    }

    /// Layers `other` on top of `self`; fields set in `other` win.
    pub fn merge(&mut self, other: &ConfigPatch) {
        for_each_field!(layer_patch!(self, other));
    }

    pub fn is_empty(&self) -> bool {
        *self == ConfigPatch::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.sim_resolution, 128);
        assert_eq!(config.dye_resolution, 1024);
        assert_eq!(config.pressure_iterations, 20);
        assert!(config.bloom && config.sunrays && config.shading);
    }

    #[test]
    fn partial_document_merges_over_defaults() {
        let config = Config::from_toml_str(
            r##"
SIM_RESOLUTION = 64
SPLAT_COLOR = "#ff8000"
BACK_COLOR = { r = 10, g = 20, b = 30 }
"##,
        )
        .unwrap();
        assert_eq!(config.sim_resolution, 64);
        assert_eq!(config.dye_resolution, 1024);
        assert_eq!(config.splat_color, Color::new(255.0, 128.0, 0.0));
        assert_eq!(config.back_color, Color::new(10.0, 20.0, 30.0));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::from_toml_str("SIM_RESOLUTON = 64").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn sim_resolution_change_only_flags_sim_targets() {
        let mut config = Config::default();
        let patch = ConfigPatch {
            sim_resolution: Some(256),
            ..ConfigPatch::default()
        };
        let changes = config.apply(&patch).unwrap();
        assert!(changes.sim_resolution);
        assert!(!changes.dye_resolution);
        assert!(!changes.bloom_targets);
        assert!(!changes.sunrays_resolution);
        assert!(!changes.keywords);
    }

    #[test]
    fn keyword_toggle_requests_recompile() {
        let mut config = Config::default();
        let patch = ConfigPatch::from_json_str(r#"{"BLOOM": false}"#).unwrap();
        let changes = config.apply(&patch).unwrap();
        assert!(changes.needs_recompile());
        assert!(!changes.needs_realloc());
        assert!(!config.bloom);
    }

    #[test]
    fn same_values_produce_no_changes() {
        let mut config = Config::default();
        let patch = ConfigPatch {
            sim_resolution: Some(128),
            shading: Some(true),
            curl: Some(12.0),
            ..ConfigPatch::default()
        };
        let changes = config.apply(&patch).unwrap();
        assert!(changes.is_empty());
        assert_eq!(config.curl, 12.0);
    }

    #[test]
    fn invalid_patch_leaves_config_untouched() {
        let mut config = Config::default();
        let patch = ConfigPatch {
            curl: Some(5.0),
            pressure_iterations: Some(0),
            ..ConfigPatch::default()
        };
        let err = config.apply(&patch).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn assignment_parses_numbers_and_colors() {
        let patch = ConfigPatch::from_assignment("splat_radius=0.4").unwrap();
        assert_eq!(patch.splat_radius, Some(0.4));
        let patch = ConfigPatch::from_assignment("SPLAT_COLOR=#00ff00").unwrap();
        assert_eq!(patch.splat_color, Some(Color::new(0.0, 255.0, 0.0)));
        let patch = ConfigPatch::from_assignment("PAUSED=true").unwrap();
        assert_eq!(patch.paused, Some(true));
        assert!(ConfigPatch::from_assignment("PAUSED").is_err());
        assert!(ConfigPatch::from_assignment("NOPE=1").is_err());
    }

    #[test]
    fn merge_prefers_later_patch() {
        let mut base = ConfigPatch {
            curl: Some(1.0),
            bloom: Some(false),
            ..ConfigPatch::default()
        };
        base.merge(&ConfigPatch {
            curl: Some(2.0),
            ..ConfigPatch::default()
        });
        assert_eq!(base.curl, Some(2.0));
        assert_eq!(base.bloom, Some(false));
        assert!(!base.is_empty());
    }

    #[test]
    fn hex_colors_require_six_digits() {
        assert!(parse_hex_color("#fff").is_err());
        assert!(parse_hex_color("zzzzzz").is_err());
        assert_eq!(
            parse_hex_color("102030").unwrap(),
            Color::new(16.0, 32.0, 48.0)
        );
    }
}
