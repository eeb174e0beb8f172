// FastCGI backend settings

use std::fmt;
use std::str::FromStr;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:9000";
pub const DEFAULT_SCRIPT_FILENAME: &str = "index.php";

/// Transport used to reach the responder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    #[default]
    Tcp,
    Unix,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Unix => "unix",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "tcp4" | "tcp6" => Ok(Network::Tcp),
            "unix" => Ok(Network::Unix),
            other => Err(format!("unsupported network '{}' (expected tcp or unix)", other)),
        }
    }
}

/// Where and what to call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastCgiConfig {
    pub network: Network,
    /// host:port for tcp, socket path for unix
    pub address: String,
    /// Sent as SCRIPT_FILENAME
    pub script_filename: String,
}

impl Default for FastCgiConfig {
    fn default() -> Self {
        Self {
            network: Network::Tcp,
            address: DEFAULT_ADDRESS.to_string(),
            script_filename: DEFAULT_SCRIPT_FILENAME.to_string(),
        }
    }
}

impl FastCgiConfig {
    pub fn tcp(address: impl Into<String>, script_filename: impl Into<String>) -> Self {
        Self {
            network: Network::Tcp,
            address: address.into(),
            script_filename: script_filename.into(),
        }
    }

    pub fn unix(path: impl Into<String>, script_filename: impl Into<String>) -> Self {
        Self {
            network: Network::Unix,
            address: path.into(),
            script_filename: script_filename.into(),
        }
    }
}
