use anyhow::{Context, Result, anyhow};
use clap::ValueEnum;
use qdlflash_lib::VerifyMode;
use qdlflash_lib::utils::Utils;
use serde::{Deserialize, Serialize};

/// Default values shared by the config file and the command line.
pub struct Defaults;

impl Defaults {
    pub const VID: u16 = qdlflash_lib::transport::usb::EDL_VID;
    pub const PID: u16 = qdlflash_lib::transport::usb::EDL_PID;
    pub const VERIFY: &'static str = "hash";
}

/// Hex string such as "0x05c6".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HexString(pub String);

impl HexString {
    pub fn to_u16(&self) -> Result<u16, String> {
        if !self.0.starts_with("0x") {
            return Err(format!("Invalid hex string format: {}", self.0));
        }
        let value = Utils::str_to_u64(&self.0)
            .map_err(|e| format!("Failed to parse hex string '{}': {}", self.0, e))?;
        u16::try_from(value).map_err(|_| format!("'{}' does not fit in 16 bits", self.0))
    }
}

/// Root of the JSON configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QdlConfig {
    /// Version list, as a path or URL.
    pub versions: Option<String>,
    pub version_id: Option<String>,
    pub programmer: Option<String>,
    pub cache_dir: Option<String>,
    /// Cache size limit in bytes.
    pub cache_quota: Option<u64>,
    pub vid: Option<HexString>,
    pub pid: Option<HexString>,
    /// Only flash the device with this USB serial number.
    pub serial: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    #[serde(default = "default_verify")]
    pub verify: String,
    #[serde(default)]
    pub quiet: bool,
}

fn default_verify() -> String {
    Defaults::VERIFY.to_string()
}

impl QdlConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path))?;
        let config: QdlConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_defaults() -> Self {
        Self {
            versions: None,
            version_id: None,
            programmer: None,
            cache_dir: None,
            cache_quota: None,
            vid: None,
            pid: None,
            serial: None,
            connect_timeout_secs: None,
            verify: Defaults::VERIFY.to_string(),
            quiet: false,
        }
    }

    pub fn parse_verify(&self) -> Result<VerifyMode> {
        VerifyMode::from_str(&self.verify, true)
            .map_err(|_| anyhow!("Invalid verify mode '{}'. Must be none or hash", self.verify))
    }

    pub fn parse_vid(&self) -> Result<u16> {
        match &self.vid {
            Some(vid) => vid.to_u16().map_err(|e| anyhow!("Invalid vid: {}", e)),
            None => Ok(Defaults::VID),
        }
    }

    pub fn parse_pid(&self) -> Result<u16> {
        match &self.pid {
            Some(pid) => pid.to_u16().map_err(|e| anyhow!("Invalid pid: {}", e)),
            None => Ok(Defaults::PID),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.parse_verify()?;
        self.parse_vid()?;
        self.parse_pid()?;
        if self.connect_timeout_secs == Some(0) {
            return Err(anyhow!("connect_timeout_secs must be positive"));
        }
        Ok(())
    }
}
