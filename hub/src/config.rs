//! Process configuration: CLI flags layered over environment variables,
//! following the same `clap::Parser` + `env` attribute style as the
//! upstream streaming server this hub replaces.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug, Clone, Deserialize)]
#[command(name = "editmash-hub", about = "EditMash realtime collaboration hub")]
pub struct Config {
    /// Port the WebSocket/HTTP listener binds to on `0.0.0.0`, spec §6.
    #[arg(long, env = "WS_PORT", default_value_t = 3001)]
    pub ws_port: u16,

    /// Base URL of the external application (lobby list, match config, persistence), spec §6.
    #[arg(long, env = "NEXT_PUBLIC_API_URL")]
    pub api_base_url: String,

    /// Shared bearer token authenticated endpoints must present, spec §6.
    #[arg(long, env = "WS_API_KEY")]
    pub ws_api_key: String,

    /// Shared bearer token the hub presents to the external app.
    #[arg(long, env = "HUB_EXTERNAL_APP_TOKEN")]
    pub external_app_token: Option<String>,

    /// Directory for daily-rolling JSON log files, in addition to stdout.
    #[arg(long, env = "HUB_LOG_DIR", default_value = "logs")]
    pub log_dir: String,

    /// `tracing_subscriber::EnvFilter` directive string.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,

    /// Delta batch window, component G.
    #[arg(long, env = "HUB_BATCH_WINDOW_MS", default_value_t = 50)]
    pub batch_window_ms: u64,

    /// Persistence debounce interval, component I.
    #[arg(long, env = "HUB_PERSIST_DEBOUNCE_MS", default_value_t = 3000)]
    pub persist_debounce_ms: u64,

    /// Vote-kick expiry, component J.
    #[arg(long, env = "HUB_VOTE_KICK_EXPIRY_SECS", default_value_t = 30)]
    pub vote_kick_expiry_secs: u64,

    /// Chat send rate-limit window, component J.
    #[arg(long, env = "HUB_CHAT_RATE_WINDOW_SECS", default_value_t = 10)]
    pub chat_rate_window_secs: u64,

    /// Max chat messages per rate-limit window.
    #[arg(long, env = "HUB_CHAT_RATE_MAX", default_value_t = 5)]
    pub chat_rate_max: u32,

    /// Connection idle timeout, component K.
    #[arg(long, env = "HUB_IDLE_TIMEOUT_SECS", default_value_t = 120)]
    pub idle_timeout_secs: u64,

    /// Zone subscription half-window buffer, component H.
    #[arg(long, env = "HUB_ZONE_BUFFER_SECS", default_value_t = 2.0)]
    pub zone_buffer_secs: f64,

    /// Ring buffer capacity for recent chat history, component J.
    #[arg(long, env = "HUB_CHAT_HISTORY_CAP", default_value_t = 100)]
    pub chat_history_cap: usize,

    /// Graceful shutdown grace period before forcibly dropping connections.
    #[arg(long, env = "HUB_SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    pub shutdown_grace_secs: u64,
}

impl Config {
    /// `0.0.0.0:{ws_port}`, the address the listener binds to.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.ws_port))
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    pub fn vote_kick_expiry(&self) -> Duration {
        Duration::from_secs(self.vote_kick_expiry_secs)
    }

    pub fn chat_rate_window(&self) -> Duration {
        Duration::from_secs(self.chat_rate_window_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Parses CLI args/env, loading a `.env` file first if present, matching
    /// the dotenv-then-parse bootstrap order used by the rest of the corpus.
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();
        Config::parse()
    }
}
