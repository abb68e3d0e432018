use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_SETTINGS_FILE: &str = "sync.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub server_url: String,
    /// Defaults to `server_url` with a `ws`/`wss` scheme and the
    /// `/api/v4/websocket` path.
    pub websocket_url: Option<String>,
    pub auth_token: Option<String>,
    pub page_size: u32,
    pub typing_window_ms: u64,
    pub typing_sweep_interval_ms: u64,
    pub replay_window: usize,
    pub event_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8065".into(),
            websocket_url: None,
            auth_token: None,
            page_size: 60,
            typing_window_ms: 5_000,
            typing_sweep_interval_ms: 1_000,
            replay_window: 1_000,
            event_buffer: 1_024,
        }
    }
}

impl EngineSettings {
    pub fn typing_window(&self) -> Duration {
        Duration::from_millis(self.typing_window_ms)
    }

    pub fn typing_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.typing_sweep_interval_ms.max(1))
    }

    pub fn resolved_websocket_url(&self) -> anyhow::Result<String> {
        if let Some(url) = &self.websocket_url {
            return Ok(url.clone());
        }
        let base = self.server_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            anyhow::bail!("server_url must start with http:// or https://: {base}");
        };
        Ok(format!("{ws_base}/api/v4/websocket"))
    }
}

/// Reads `sync.toml` from the working directory when present, then applies
/// `SYNC__*` environment overrides.
pub fn load_settings() -> anyhow::Result<EngineSettings> {
    let mut settings = load_settings_file(Path::new(DEFAULT_SETTINGS_FILE))?;
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok())?;
    Ok(settings)
}

pub fn load_settings_file(path: &Path) -> anyhow::Result<EngineSettings> {
    if !path.exists() {
        return Ok(EngineSettings::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("invalid settings file '{}'", path.display()))
}

pub fn apply_env_overrides(
    settings: &mut EngineSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    if let Some(v) = lookup("SYNC__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("SYNC__WEBSOCKET_URL") {
        settings.websocket_url = Some(v);
    }
    if let Some(v) = lookup("SYNC__AUTH_TOKEN") {
        settings.auth_token = Some(v);
    }
    if let Some(v) = lookup("SYNC__PAGE_SIZE") {
        settings.page_size = v.parse().context("SYNC__PAGE_SIZE must be an integer")?;
    }
    if let Some(v) = lookup("SYNC__TYPING_WINDOW_MS") {
        settings.typing_window_ms = v.parse().context("SYNC__TYPING_WINDOW_MS must be an integer")?;
    }
    if let Some(v) = lookup("SYNC__TYPING_SWEEP_INTERVAL_MS") {
        settings.typing_sweep_interval_ms = v
            .parse()
            .context("SYNC__TYPING_SWEEP_INTERVAL_MS must be an integer")?;
    }
    if let Some(v) = lookup("SYNC__REPLAY_WINDOW") {
        settings.replay_window = v.parse().context("SYNC__REPLAY_WINDOW must be an integer")?;
    }
    if let Some(v) = lookup("SYNC__EVENT_BUFFER") {
        settings.event_buffer = v.parse().context("SYNC__EVENT_BUFFER must be an integer")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        env,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut settings: EngineSettings =
            toml::from_str("server_url = \"https://chat.example.com\"\npage_size = 30\n").expect("toml");
        let vars = HashMap::from([
            ("SYNC__PAGE_SIZE", "100"),
            ("SYNC__AUTH_TOKEN", "token-1"),
        ]);
        apply_env_overrides(&mut settings, |key| vars.get(key).map(|v| v.to_string())).expect("overrides");

        assert_eq!(settings.server_url, "https://chat.example.com");
        assert_eq!(settings.page_size, 100);
        assert_eq!(settings.auth_token.as_deref(), Some("token-1"));
        assert_eq!(settings.typing_window_ms, 5_000);
    }

    #[test]
    fn rejects_non_numeric_override() {
        let mut settings = EngineSettings::default();
        let err = apply_env_overrides(&mut settings, |key| {
            (key == "SYNC__REPLAY_WINDOW").then(|| "lots".to_string())
        })
        .expect_err("invalid number");
        assert!(err.to_string().contains("SYNC__REPLAY_WINDOW"));
    }

    #[test]
    fn derives_websocket_url_from_server_url() {
        let settings = EngineSettings {
            server_url: "https://chat.example.com/".into(),
            ..EngineSettings::default()
        };
        assert_eq!(
            settings.resolved_websocket_url().expect("ws url"),
            "wss://chat.example.com/api/v4/websocket"
        );
    }

    #[test]
    fn missing_file_yields_defaults() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = env::temp_dir().join(format!("sync_engine_missing_{suffix}.toml"));
        assert_eq!(load_settings_file(&path).expect("defaults"), EngineSettings::default());
    }
}
