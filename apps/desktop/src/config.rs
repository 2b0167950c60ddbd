use std::fs;

use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_url: String,
    pub user_id: i64,
    pub display_name: String,
    pub ice_servers: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            user_id: 0,
            display_name: "anonymous".into(),
            ice_servers: vec!["stun:stun.l.google.com:19302".into()],
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    user_id: Option<i64>,
    display_name: Option<String>,
    ice_servers: Option<Vec<String>>,
}

/// Defaults, overridden by `chat.toml`, overridden by environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("chat.toml") {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file_settings(&mut settings, file_cfg),
            Err(err) => tracing::warn!("ignoring malformed chat.toml: {err}"),
        }
    }

    if let Ok(v) = std::env::var("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_USER_ID") {
        if let Ok(parsed) = v.parse::<i64>() {
            settings.user_id = parsed;
        }
    }
    if let Ok(v) = std::env::var("CHAT_DISPLAY_NAME") {
        settings.display_name = v;
    }

    settings
}

fn apply_file_settings(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file_cfg.user_id {
        settings.user_id = v;
    }
    if let Some(v) = file_cfg.display_name {
        settings.display_name = v;
    }
    if let Some(v) = file_cfg.ice_servers {
        settings.ice_servers = v;
    }
}
