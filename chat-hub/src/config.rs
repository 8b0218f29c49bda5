use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::{connection::ConnectionSettings, protocol::DEFAULT_MAX_FRAME_LEN};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Everything a [`Server`](crate::server::Server) needs to start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub data_dir: PathBuf,
    /// Persistence workers.
    pub workers: usize,
    /// Messages that may wait for a persistence worker before new ones are dropped.
    pub job_queue_capacity: usize,
    /// Frames that may wait for a slow client before it is evicted.
    pub outbound_capacity: usize,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    /// `history` limit used when the request has none, or a non-positive one.
    pub history_default: usize,
    pub max_frame_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            workers: 4,
            job_queue_capacity: 1024,
            outbound_capacity: 256,
            write_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            history_default: 20,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ServerConfig {
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            outbound_capacity: self.outbound_capacity,
            write_timeout: self.write_timeout,
            idle_timeout: self.idle_timeout,
            max_frame_len: self.max_frame_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_listen_matches_the_advertised_address() {
        let config = ServerConfig::default();
        assert_eq!(config.listen.to_string(), DEFAULT_LISTEN);
        assert_eq!(config.connection_settings().max_frame_len, 64 * 1024);
    }
}
