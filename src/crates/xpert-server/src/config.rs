//! Server configuration from environment variables

use std::env;

/// Configuration loaded at startup
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen port (`PORT`, default 7865)
    pub port: u16,

    /// Log filter (`LOG_LEVEL` ∈ error|warn|log|debug|verbose)
    pub log_level: String,

    /// Allowed CORS origins (`CORS_ALLOW_ORIGINS`, comma separated; empty
    /// allows any origin)
    pub cors_allow_origins: Vec<String>,

    /// Plugin identifiers to load (`PLUGINS`, comma or semicolon separated)
    pub plugins: Vec<String>,

    /// Secret used to sign issued client secrets (`EXPRESS_SESSION_SECRET`)
    pub session_secret: Option<String>,

    /// Accepted API keys (`API_KEYS`, comma separated; empty disables auth)
    pub api_keys: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 7865,
            log_level: "log".to_string(),
            cors_allow_origins: Vec::new(),
            plugins: vec!["mock".to_string()],
            session_secret: None,
            api_keys: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Build from the process environment
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            cors_allow_origins: split_list(env::var("CORS_ALLOW_ORIGINS").ok()),
            plugins: {
                let plugins = split_list(env::var("PLUGINS").ok());
                if plugins.is_empty() {
                    defaults.plugins
                } else {
                    plugins
                }
            },
            session_secret: env::var("EXPRESS_SESSION_SECRET").ok(),
            api_keys: split_list(env::var("API_KEYS").ok()),
        }
    }

    /// Map `LOG_LEVEL` onto a tracing filter directive
    pub fn tracing_filter(&self) -> &'static str {
        match self.log_level.as_str() {
            "error" => "error",
            "warn" => "warn",
            "debug" => "debug",
            "verbose" => "trace",
            _ => "info",
        }
    }
}

fn split_list(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split([',', ';'])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}
