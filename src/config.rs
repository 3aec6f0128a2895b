// Environment-driven configuration for the daemon.
//
// Resolution order per variable: environment variable, then the documented
// default below.

use std::path::PathBuf;

fn env_u16(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Required for AI summaries; daemon refuses to start if unset.
    pub anthropic_api_key: String,
    /// Stream server port (MIMESIS_PORT, falling back to PORT).
    pub stream_port: u16,
    /// HTTP API port.
    pub api_port: u16,
    /// PTY WebSocket port.
    pub pty_ws_port: u16,
    /// Bind address shared by all three listeners.
    pub stream_host: String,
    /// SQLite database path.
    pub db_path: PathBuf,
    /// Sessions older than this are filtered out at startup.
    pub max_age_hours: u64,
    pub kitty_socket: Option<String>,
    pub kitty_rc_password: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("ANTHROPIC_API_KEY is required")]
    MissingApiKey,
}

impl Config {
    pub fn base_dir() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".mimesis"))
            .unwrap_or_else(|| PathBuf::from("/tmp/mimesis"))
    }

    pub fn default_db_path() -> PathBuf {
        Self::base_dir().join("data.db")
    }

    pub fn streams_dir(&self) -> PathBuf {
        Self::base_dir().join("streams")
    }

    pub fn pid_file(&self) -> PathBuf {
        Self::base_dir().join("daemon.pid")
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let anthropic_api_key =
            std::env::var("ANTHROPIC_API_KEY").map_err(|_| ConfigError::MissingApiKey)?;

        let stream_port = std::env::var("MIMESIS_PORT")
            .or_else(|_| std::env::var("PORT"))
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4450);

        Ok(Self {
            anthropic_api_key,
            stream_port,
            api_port: env_u16("API_PORT", 4451),
            pty_ws_port: env_u16("PTY_WS_PORT", 4452),
            stream_host: std::env::var("STREAM_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            db_path: std::env::var("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| Self::default_db_path()),
            max_age_hours: env_u64("MAX_AGE_HOURS", 24),
            kitty_socket: std::env::var("KITTY_SOCKET").ok(),
            kitty_rc_password: std::env::var("KITTY_RC_PASSWORD").ok(),
        })
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir_all(self.streams_dir())
    }

    /// Check if a process with the PID recorded in the pid file is still alive.
    #[cfg(unix)]
    pub fn is_daemon_running(&self) -> bool {
        match std::fs::read_to_string(self.pid_file()) {
            Ok(s) => match s.trim().parse::<i32>() {
                Ok(pid) => unsafe { libc::kill(pid, 0) == 0 },
                Err(_) => false,
            },
            Err(_) => false,
        }
    }

    pub fn write_pid(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(Self::base_dir())?;
        crate::util::atomic_write(&self.pid_file(), &std::process::id().to_string())
    }

    pub fn remove_pid(&self) -> std::io::Result<()> {
        let path = self.pid_file();
        if path.exists() {
            std::fs::remove_file(path)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_api_key_is_a_config_error() {
        std::env::remove_var("ANTHROPIC_API_KEY");
        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::MissingApiKey)));
    }

    #[test]
    fn port_defaults_match_the_external_interface_table() {
        std::env::set_var("ANTHROPIC_API_KEY", "sk-test");
        std::env::remove_var("MIMESIS_PORT");
        std::env::remove_var("PORT");
        std::env::remove_var("API_PORT");
        std::env::remove_var("PTY_WS_PORT");

        let config = Config::from_env().unwrap();
        assert_eq!(config.stream_port, 4450);
        assert_eq!(config.api_port, 4451);
        assert_eq!(config.pty_ws_port, 4452);
        assert_eq!(config.stream_host, "127.0.0.1");
        assert_eq!(config.max_age_hours, 24);

        std::env::remove_var("ANTHROPIC_API_KEY");
    }

    #[test]
    fn mimesis_port_overrides_port() {
        std::env::set_var("ANTHROPIC_API_KEY", "sk-test");
        std::env::set_var("PORT", "9999");
        std::env::set_var("MIMESIS_PORT", "5001");

        let config = Config::from_env().unwrap();
        assert_eq!(config.stream_port, 5001);

        std::env::remove_var("ANTHROPIC_API_KEY");
        std::env::remove_var("PORT");
        std::env::remove_var("MIMESIS_PORT");
    }
}
