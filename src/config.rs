//! CLI argument parsing for the server's tunable handshake/chunking defaults
//! and logging level.

use clap::Parser;

/// A relay server's tunable handshake/chunking defaults and logging level.
#[derive(Parser, Debug, Clone)]
#[command(name = "rtmprelay", about = "RTMP v3 relay server core")]
pub struct Config {
    /// Network interface to bind to (e.g. "0.0.0.0" or "127.0.0.1").
    #[arg(long, default_value = "0.0.0.0")]
    pub interface: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 1935)]
    pub port: u16,

    /// Window Acknowledgement Size advertised in the post-handshake control
    /// burst.
    #[arg(long, default_value_t = 2_500_000)]
    pub window_ack_size: u32,

    /// Chunk size the server requests of the peer via Set Chunk Size in the
    /// control burst, and uses for its own outbound chunking.
    #[arg(long, default_value_t = 4096)]
    pub write_chunk_size: u32,

    /// When set, every published stream is handed a recorder that persists
    /// its messages instead of the default no-op recorder.
    #[arg(long)]
    pub record_all: bool,

    /// `tracing-subscriber` `EnvFilter` directive, e.g. "info" or
    /// "rtmprelay=debug,tokio=warn".
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.interface, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_combines_interface_and_port() {
        let config = Config { interface: "127.0.0.1".into(), port: 1935, window_ack_size: 0, write_chunk_size: 128, record_all: false, log_level: "info".into() };
        assert_eq!(config.listen_addr(), "127.0.0.1:1935");
    }
}
