use anyhow::Context;
use ksane::SessionConfig;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::Path,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default = "Default::default")]
    pub devices: Devices,

    #[serde(default = "Default::default")]
    pub session: SessionConfig,

    #[serde(default = "Default::default")]
    pub output: Output,

    /// Option values per device name, applied after opening it.
    #[serde(default = "Default::default")]
    pub scanner: HashMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Devices {
    pub scanner: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Output {
    /// File name prefix of written images.
    pub prefix: String,
}

impl Default for Output {
    fn default() -> Self {
        Self {
            prefix: "scan".to_owned(),
        }
    }
}

impl Config {
    pub fn read_from<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let dpath = path.display();

        let raw = fs::read_to_string(path).with_context(|| format!("reading file '{dpath}'"))?;
        let config = toml::from_str(&raw).with_context(|| format!("parsing file '{dpath}'"))?;

        Ok(config)
    }

    /// Session settings for `device`, with its configured option values.
    pub fn session_for(&self, device: &str) -> SessionConfig {
        let mut session = self.session.clone();
        if let Some(values) = self.scanner.get(device) {
            session
                .defaults
                .extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_values_extend_session_defaults() {
        let config: Config = toml::from_str(
            r#"
            [devices]
            scanner = "test"

            [session]
            preview_dpi = 50.0

            [session.defaults]
            mode = "Gray"

            [scanner."test"]
            resolution = "150"
            mode = "Color"
            "#,
        )
        .unwrap();

        assert_eq!(config.devices.scanner.as_deref(), Some("test"));
        assert_eq!(config.output.prefix, "scan");

        let session = config.session_for("test");
        assert_eq!(session.preview_dpi, 50.0);
        assert_eq!(session.defaults["mode"], "Color");
        assert_eq!(session.defaults["resolution"], "150");

        assert_eq!(config.session_for("other").defaults["mode"], "Gray");
    }
}
