//! Host server configuration.

use std::net::SocketAddr;

use crate::error::ServeError;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_STREAM_BUFFER: usize = 32;
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Exposes error details and backtraces, and warns about orphaned outlets.
    pub dev_mode: bool,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Capacity of each server-push source channel.
    pub stream_buffer: usize,
    /// Idle render contexts kept by the template engine.
    pub render_pool_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            dev_mode: false,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            stream_buffer: DEFAULT_STREAM_BUFFER,
            render_pool_capacity: crate::template::DEFAULT_POOL_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Read `HOST`, `PORT`, `APP_ENV` and `ARBOR_LOG`, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(host) = lookup("HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("PORT").and_then(|p| p.parse().ok()) {
            config.port = port;
        }
        if let Some(env) = lookup("APP_ENV") {
            config.dev_mode = env == "development";
        }
        if let Some(filter) = lookup("ARBOR_LOG") {
            config.log_filter = filter;
        }
        config
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_dev_mode(mut self, dev_mode: bool) -> Self {
        self.dev_mode = dev_mode;
        self
    }

    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    pub fn with_stream_buffer(mut self, buffer: usize) -> Self {
        self.stream_buffer = buffer.max(1);
        self
    }

    pub fn with_render_pool_capacity(mut self, capacity: usize) -> Self {
        self.render_pool_capacity = capacity;
        self
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ServeError> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|_| ServeError::Address(addr))
    }
}
