use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub network: NetworkConfig,
    pub forwarder: ForwarderConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Datagram port; also selects the listener socket name.
    /// `CCN_LOCAL_PORT` overrides it.
    pub port: String,
    /// Explicit listener socket path, overriding the derived one.
    pub socket_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    /// Suppress re-sending content a face has already been sent, even
    /// when the interest carries no response filter.
    pub short_term_blocking: bool,
    /// Soft cap on live faces; clamped to the table's hard cap.
    pub max_faces: usize,
    /// Quiet reaper sweeps before an inactive datagram face is
    /// dropped.
    pub datagram_idle_sweeps: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig {
                port: ccn_transport::unix::DEFAULT_PORT.to_string(),
                socket_path: None,
            },
            forwarder: ForwarderConfig {
                short_term_blocking: false,
                max_faces: crate::face::MAX_FACES,
                datagram_idle_sweeps: crate::limits::REAP_SWEEPS,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if !path.as_ref().exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load("/nonexistent/ccnd.conf").unwrap();
        assert_eq!(config.network.port, "4485");
        assert!(!config.forwarder.short_term_blocking);
        assert_eq!(config.forwarder.max_faces, crate::face::MAX_FACES);
        assert_eq!(config.forwarder.datagram_idle_sweeps, 2);
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ccnd.conf");
        let mut config = Config::default();
        config.network.port = "7777".to_string();
        config.forwarder.short_term_blocking = true;
        config.forwarder.max_faces = 128;
        config.forwarder.datagram_idle_sweeps = 4;
        config.save(&path).unwrap();
        let back = Config::load(&path).unwrap();
        assert_eq!(back.network.port, "7777");
        assert!(back.forwarder.short_term_blocking);
        assert_eq!(back.forwarder.max_faces, 128);
        assert_eq!(back.forwarder.datagram_idle_sweeps, 4);
    }
}
