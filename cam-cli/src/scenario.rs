//! Scenario files

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cam_mux::{DescramblerConfig, ElementaryStream};
use cam_protocol::ciplus::NONCE_LEN;
use cam_protocol::Caid;
use serde::{Deserialize, Serialize};

/// A CAM to insert
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CamEntry {
    /// Adapter the CA device belongs to
    pub adapter: u32,
    /// Slot on the CA device
    pub slot: u8,
    /// CAIDs the CAM reports
    pub caids: Vec<Caid>,
    /// Program capacity (scenario default if omitted)
    #[serde(default)]
    pub max_programs: Option<usize>,
    /// Run the CI+ CC handshake after insertion
    #[serde(default)]
    pub handshake: bool,
    /// Nonce the CAM sends during the handshake
    #[serde(default)]
    pub nonce: [u8; NONCE_LEN],
}

/// One lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Insert a CAM
    Insert(CamEntry),
    /// Remove a CAM
    Remove { adapter: u32, slot: u8 },
    /// Start watching a service
    Start { service: u32 },
    /// Stop watching a service
    Stop { service: u32 },
    /// Deliver a PMT for a service
    Pmt {
        service: u32,
        /// Adapter of the tuner; `null` means the service has no active input
        adapter: Option<u32>,
        program: u16,
        streams: Vec<ElementaryStream>,
    },
}

/// A complete scenario
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scenario {
    /// Capacity for CAMs that do not give one
    #[serde(default = "default_max_programs")]
    pub default_max_programs: usize,
    /// Descrambler configuration
    #[serde(default)]
    pub descrambler: DescramblerConfig,
    /// Events in order
    pub steps: Vec<Step>,
}

fn default_max_programs() -> usize {
    1
}

fn stream(pid: u16, caid: Caid) -> ElementaryStream {
    ElementaryStream {
        pid,
        stream_type: 0x02,
        caids: vec![caid],
    }
}

impl Default for Scenario {
    /// One two-program CAM, three services competing for it
    fn default() -> Self {
        let pmt = |service: u32| Step::Pmt {
            service,
            adapter: Some(0),
            program: service as u16,
            streams: vec![stream(0x0100 + service as u16, 0x0100)],
        };
        Self {
            default_max_programs: default_max_programs(),
            descrambler: DescramblerConfig::default(),
            steps: vec![
                Step::Insert(CamEntry {
                    adapter: 0,
                    slot: 0,
                    caids: vec![0x0100],
                    max_programs: Some(2),
                    handshake: true,
                    nonce: [0x5A; NONCE_LEN],
                }),
                Step::Start { service: 1 },
                pmt(1),
                Step::Start { service: 2 },
                pmt(2),
                Step::Start { service: 3 },
                pmt(3),
                Step::Stop { service: 1 },
                pmt(2),
            ],
        }
    }
}

impl Scenario {
    /// Get the XDG config directory for camgate
    /// Uses $XDG_CONFIG_HOME/camgate, falls back to ~/.config/camgate
    fn config_dir() -> Option<PathBuf> {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            let path = PathBuf::from(xdg_config);
            if path.is_absolute() {
                return Some(path.join("camgate"));
            }
        }

        dirs::home_dir().map(|h| h.join(".config").join("camgate"))
    }

    /// Default scenario file path
    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("scenario.json"))
    }

    /// Load a scenario from `path`
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("invalid scenario {}", path.display()))
    }

    /// Load from an explicit path, else the config directory, else the built-in default
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Parse scenario JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Save to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}
