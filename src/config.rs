//! Configuration for the control-plane binary.
//!
//! The core itself requires only a listen address and a base data directory
//! (design §6, "CLI / environment"); everything else here — the device
//! roster and the channel-preset catalog — is ambient configuration the
//! binary needs to build a `DeviceHub` and a `ChannelControl` before it can
//! do anything useful.
//!
//! Loading follows the same layered-`figment` pattern the original settings
//! module used: library defaults, then a TOML file, then environment
//! variables prefixed `RUSTDAQ_`, each overriding the last.
//! Validation happens once, eagerly, before any device I/O is attempted —
//! a malformed config fails `check-config` and `run` identically.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelPreset;
use crate::path::PropertyPath;
use crate::validation::{is_in_range, is_not_empty, is_valid_ip, is_valid_path, is_valid_port};

/// One entry in the channel-preset catalog (design §3, `ChannelPreset`).
/// Deserialized straight off the `[channels.<name>]` TOML tables; converted
/// to `crate::channel::ChannelPreset` by `to_preset`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelPresetSettings {
    /// `"/device/property" -> value` entries applied verbatim by the switch.
    pub properties: HashMap<String, String>,
    pub shutter_property: Option<String>,
    pub illumination_property: Option<String>,
    pub default_exposure_ms: f64,
    pub default_illumination_intensity: f64,
}

impl Default for ChannelPresetSettings {
    fn default() -> Self {
        ChannelPresetSettings {
            properties: HashMap::new(),
            shutter_property: None,
            illumination_property: None,
            default_exposure_ms: 10.0,
            default_illumination_intensity: 0.0,
        }
    }
}

impl ChannelPresetSettings {
    fn to_preset(&self, name: &str) -> Result<ChannelPreset> {
        let mut preset = ChannelPreset::new(name)
            .with_default_exposure_ms(self.default_exposure_ms)
            .with_default_illumination_intensity(self.default_illumination_intensity);

        for (path, value) in &self.properties {
            let path: PropertyPath = path
                .parse()
                .with_context(|| format!("channel '{name}': invalid property path '{path}'"))?;
            preset = preset.with_property(path, value.clone());
        }
        if let Some(shutter) = &self.shutter_property {
            let path: PropertyPath = shutter
                .parse()
                .with_context(|| format!("channel '{name}': invalid shutter_property '{shutter}'"))?;
            preset = preset.with_shutter_property(path);
        }
        if let Some(illumination) = &self.illumination_property {
            let path: PropertyPath = illumination.parse().with_context(|| {
                format!("channel '{name}': invalid illumination_property '{illumination}'")
            })?;
            preset = preset.with_illumination_property(path);
        }
        Ok(preset)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    /// Address the control plane listens on for whatever external protocol
    /// a deployment wires in (out of scope for the core itself, design §6).
    pub listen_address: String,
    /// Base directory persisted `NDImage` captures are written under.
    pub data_dir: String,
    /// Device name -> driver kind + driver-specific TOML table, e.g.
    /// `[devices.Camera]\ndriver = "mock_camera"`.
    pub devices: HashMap<String, toml::Value>,
    /// Preset name -> recipe.
    pub channels: HashMap<String, ChannelPresetSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            log_level: "info".to_string(),
            listen_address: "127.0.0.1:7777".to_string(),
            data_dir: "./data".to_string(),
            devices: HashMap::new(),
            channels: HashMap::new(),
        }
    }
}

impl Settings {
    /// Loads defaults, then `path` if given (a missing default path is not
    /// an error; an explicitly-named missing path is), then
    /// `RUSTDAQ_`-prefixed environment overrides, and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        match path {
            Some(path) => {
                figment = figment.merge(Toml::file(path));
            }
            None => {
                figment = figment.merge(Toml::file("config.toml"));
            }
        }
        figment = figment.merge(Env::prefixed("RUSTDAQ_").split("__"));

        let settings: Settings = figment
            .extract()
            .context("failed to load control-plane configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        is_not_empty(&self.log_level)
            .map_err(anyhow::Error::msg)
            .context("log_level cannot be empty")?;
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.log_level.to_lowercase().as_str()) {
            anyhow::bail!("invalid log level: {}", self.log_level);
        }

        let (host, port) = self
            .listen_address
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("listen_address must be 'host:port': {}", self.listen_address))?;
        is_not_empty(host).map_err(anyhow::Error::msg).context("listen_address host cannot be empty")?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("listen_address port is not a number: {port}"))?;
        is_valid_port(port).map_err(anyhow::Error::msg).context("invalid listen_address port")?;

        is_valid_path(&self.data_dir).map_err(anyhow::Error::msg).context("invalid data_dir")?;

        for (name, device) in &self.devices {
            self.validate_device(name, device)?;
        }
        for (name, preset) in &self.channels {
            preset
                .to_preset(name)
                .with_context(|| format!("invalid channel preset '{name}'"))?;
        }

        Ok(())
    }

    fn validate_device(&self, name: &str, device: &toml::Value) -> Result<()> {
        is_not_empty(
            device
                .get("driver")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("device '{name}' is missing a 'driver' field"))?,
        )
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("device '{name}' has an empty 'driver' field"))?;

        if let Some(address) = device.get("address").and_then(|v| v.as_str()) {
            is_valid_ip(address)
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("invalid address for device '{name}'"))?;
        }
        if let Some(port) = device.get("port").and_then(|v| v.as_integer()) {
            is_in_range(port, 1..=65535)
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("invalid port for device '{name}'"))?;
        }

        Ok(())
    }

    /// Builds the channel-preset catalog `crate::channel::ChannelControl`
    /// expects, in a deterministic (name-sorted) order.
    pub fn channel_presets(&self) -> Result<Vec<ChannelPreset>> {
        let mut names: Vec<&String> = self.channels.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| self.channels[name].to_preset(name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_settings() -> Settings {
        Settings::default()
    }

    #[test]
    fn defaults_are_valid() {
        assert!(minimal_settings().validate().is_ok());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut settings = minimal_settings();
        settings.log_level = "verbose".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_listen_address_without_port() {
        let mut settings = minimal_settings();
        settings.listen_address = "localhost".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_device_without_driver_field() {
        let mut settings = minimal_settings();
        settings.devices.insert(
            "Camera".to_string(),
            toml::Value::Table(toml::map::Map::new()),
        );
        assert!(settings.validate().is_err());
    }

    #[test]
    fn parses_a_channel_preset_from_toml() {
        let toml_content = r#"
            [channels.BF]
            default_exposure_ms = 25.0
            shutter_property = "/Optics/DiaShutter"
            [channels.BF.properties]
            "/Optics/Block" = "2"
        "#;
        let settings: Settings = toml::from_str(toml_content).unwrap();
        let presets = settings.channel_presets().unwrap();
        assert_eq!(presets.len(), 1);
        assert_eq!(presets[0].name, "BF");
        assert_eq!(presets[0].default_exposure_ms, 25.0);
    }

    #[test]
    fn rejects_a_channel_preset_with_an_invalid_property_path() {
        let mut settings = minimal_settings();
        let mut preset = ChannelPresetSettings::default();
        preset.properties.insert("not-a-path".to_string(), "1".to_string());
        settings.channels.insert("Bad".to_string(), preset);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn loads_settings_from_a_toml_file_on_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        writeln!(file, "listen_address = \"0.0.0.0:9001\"\ndata_dir = \"/tmp/scope-data\"").unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.listen_address, "0.0.0.0:9001");
        assert_eq!(settings.data_dir, "/tmp/scope-data");
    }

    // Mutates process-wide environment variables; must not run concurrently
    // with another test doing the same.
    #[test]
    #[serial_test::serial]
    fn environment_variables_override_the_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        writeln!(file, "log_level = \"info\"").unwrap();
        std::env::set_var("RUSTDAQ_LOG_LEVEL", "debug");

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.log_level, "debug");

        std::env::remove_var("RUSTDAQ_LOG_LEVEL");
    }
}
