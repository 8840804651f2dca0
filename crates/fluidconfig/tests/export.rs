use std::fs;

use fluidconfig::{Color, Config, ConfigPatch};
use tempfile::TempDir;

#[test]
fn exported_config_reloads_identically() {
    let mut config = Config::default();
    config
        .apply(&ConfigPatch {
            sim_resolution: Some(96),
            velocity_dissipation: Some(0.35),
            back_color: Some(Color::new(12.0, 34.0, 56.0)),
            mirror_mode: Some(true),
            mirror_segments: Some(8),
            sunrays: Some(false),
            ..ConfigPatch::default()
        })
        .unwrap();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dyeflow.toml");
    fs::write(&path, config.to_toml_string().unwrap()).unwrap();

    let reloaded = Config::from_toml_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(reloaded, config);
}

#[test]
fn exported_keys_are_screaming_snake_case() {
    let text = Config::default().to_toml_string().unwrap();
    for key in [
        "SIM_RESOLUTION",
        "DYE_RESOLUTION",
        "PRESSURE_ITERATIONS",
        "SPLAT_RADIUS",
        "BLOOM_SOFT_KNEE",
        "SUNRAYS_WEIGHT",
        "MIRROR_SEGMENTS",
        "BACK_COLOR",
    ] {
        assert!(text.contains(key), "missing {key} in export:\n{text}");
    }
}

#[test]
fn exported_document_applies_as_patch() {
    let text = Config::default().to_toml_string().unwrap();
    let patch = ConfigPatch::from_toml_str(&text).unwrap();
    let mut config = Config::default();
    let changes = config.apply(&patch).unwrap();
    assert!(changes.is_empty());
}
