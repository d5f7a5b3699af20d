//! Server and client settings.
//!
//! Both structs deserialize from TOML with every field optional; missing
//! fields take the defaults below. Command-line flags in the binaries are
//! applied on top of whatever the file provides.

use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::{ChannelOptions, DEFAULT_CHUNK_SIZE};
use crate::errors::{RegError, Result};
use crate::storage::DOCS_DIR;

pub const DEFAULT_PORT: u16 = 55000;
pub const DEFAULT_IO_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_BUNDLE_SIZE: u64 = 64 * 1024 * 1024;
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 64 * 1024;

/// How the accept loop paces itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptPolicy {
    /// Accept the next connection only once the previous one has been
    /// registered.
    #[default]
    AwaitRegistration,
    /// Accept again right after spawning the session task.
    Immediate,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub docs_dir: PathBuf,
    pub chunk_size: usize,
    /// `None` disables the payload timeout.
    pub io_timeout_secs: Option<u64>,
    pub max_bundle_size: u64,
    pub accept_policy: AcceptPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::UNSPECIFIED,
                DEFAULT_PORT,
            )),
            docs_dir: PathBuf::from(DOCS_DIR),
            chunk_size: DEFAULT_CHUNK_SIZE,
            io_timeout_secs: Some(DEFAULT_IO_TIMEOUT_SECS),
            max_bundle_size: DEFAULT_MAX_BUNDLE_SIZE,
            accept_policy: AcceptPolicy::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.bind_addr.set_port(port);
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_chunk_size(self.chunk_size)?;
        if self.max_bundle_size == 0 {
            return Err(RegError::Config(
                "max_bundle_size must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            chunk_size: self.chunk_size,
            io_timeout: self.io_timeout_secs.map(Duration::from_secs),
            max_bundle_size: self.max_bundle_size,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `host:port` of the operator.
    pub server_addr: String,
    pub chunk_size: usize,
    pub connect_timeout_secs: Option<u64>,
    pub io_timeout_secs: Option<u64>,
    pub max_response_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: format!("127.0.0.1:{DEFAULT_PORT}"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout_secs: Some(10),
            io_timeout_secs: Some(DEFAULT_IO_TIMEOUT_SECS),
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_chunk_size(self.chunk_size)?;
        if self.server_addr.trim().is_empty() {
            return Err(RegError::Config("server_addr is empty".to_owned()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }

    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            chunk_size: self.chunk_size,
            io_timeout: self.io_timeout_secs.map(Duration::from_secs),
            max_bundle_size: DEFAULT_MAX_BUNDLE_SIZE,
        }
    }
}

fn validate_chunk_size(chunk_size: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(RegError::Config("chunk_size must be positive".to_owned()));
    }
    Ok(())
}
