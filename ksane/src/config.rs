use serde::Deserialize;
use std::{collections::BTreeMap, time::Duration};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Preview resolution; values below 25 dpi mean "search for one".
    pub preview_dpi: f64,

    /// Detect regions in a fresh preview and use them as selections.
    pub auto_select: bool,

    /// Delay before values are re-read after a write asked for it.
    pub reload_debounce_ms: u64,

    /// How often options reflecting hardware state are re-read while idle.
    pub poll_interval_ms: u64,

    /// Upper bound of a single read from the device.
    pub read_chunk_size: usize,

    /// Option values applied after opening a device, on top of the built-in
    /// defaults.
    pub defaults: BTreeMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            preview_dpi: 0.0,
            auto_select: false,
            reload_debounce_ms: 5,
            poll_interval_ms: 100,
            read_chunk_size: 128 * 1024,
            defaults: BTreeMap::new(),
        }
    }
}

impl SessionConfig {
    pub fn reload_debounce(&self) -> Duration {
        Duration::from_millis(self.reload_debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: SessionConfig = toml::from_str(
            r#"
            preview_dpi = 75.0

            [defaults]
            mode = "Gray"
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.preview_dpi, 75.0);
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.reload_debounce(), Duration::from_millis(5));
        assert_eq!(config.read_chunk_size, 128 * 1024);
        assert_eq!(config.defaults.get("mode").map(String::as_str), Some("Gray"));
    }
}
