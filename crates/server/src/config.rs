use std::{collections::HashMap, fs};

#[derive(Debug)]
pub struct Settings {
    pub server_bind: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
        }
    }
}

/// Defaults, overridden by `relay.toml`, overridden by environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("relay.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("bind_addr") {
                settings.server_bind = v.clone();
            }
        }
    }

    if let Ok(v) = std::env::var("RELAY_BIND") {
        settings.server_bind = v;
    }
    if let Ok(v) = std::env::var("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_loopback_bind() {
        assert_eq!(Settings::default().server_bind, "127.0.0.1:8443");
    }

    #[test]
    fn environment_overrides_the_bind_address() {
        std::env::set_var("APP__BIND_ADDR", "0.0.0.0:9100");
        let settings = load_settings();
        std::env::remove_var("APP__BIND_ADDR");
        assert_eq!(settings.server_bind, "0.0.0.0:9100");
    }
}
