use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use qdlflash_lib::utils::Utils;
use qdlflash_lib::{ImageConfig, UsbConfig, VerifyMode};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::QdlConfig;

fn parse_usb_id(s: &str) -> Result<u16, String> {
    let value = Utils::str_to_u64(s).map_err(|e| format!("invalid USB id '{}': {}", s, e))?;
    u16::try_from(value).map_err(|_| format!("USB id '{}' does not fit in 16 bits", s))
}

fn parse_size(s: &str) -> Result<u64, String> {
    Utils::str_to_u64(s).map_err(|e| format!("invalid size '{}': {}", s, e))
}

#[derive(Parser, Debug)]
#[command(author, version, about = "qdlflash CLI", long_about = None)]
pub struct Cli {
    /// JSON configuration file path
    #[arg(long = "config", short = 'f')]
    pub config: Option<String>,

    /// Version list, as a JSON file path or an http(s):// URL
    #[arg(long = "versions")]
    pub versions: Option<String>,

    /// Version to flash (default: the one marked latest)
    #[arg(long = "version-id")]
    pub version_id: Option<String>,

    /// Programmer binary uploaded to the device before flashing
    #[arg(long = "programmer")]
    pub programmer: Option<String>,

    /// Image cache directory
    #[arg(long = "cache-dir")]
    pub cache_dir: Option<String>,

    /// Cache size limit, e.g. 16G
    #[arg(long = "cache-quota", value_parser = parse_size)]
    pub cache_quota: Option<u64>,

    /// USB vendor id (default: 0x05c6)
    #[arg(long = "vid", value_parser = parse_usb_id)]
    pub vid: Option<u16>,

    /// USB product id (default: 0x9008)
    #[arg(long = "pid", value_parser = parse_usb_id)]
    pub pid: Option<u16>,

    /// Only flash the device with this USB serial number
    #[arg(long = "serial")]
    pub serial: Option<String>,

    /// Seconds to wait for the device (default: wait until interrupted)
    #[arg(long = "connect-timeout")]
    pub connect_timeout: Option<u64>,

    /// Flash an in-memory simulated device instead of real hardware
    #[arg(long = "simulate")]
    pub simulate: bool,

    /// Device-side verification after writing (default: hash)
    #[arg(long = "verify", value_enum)]
    pub verify: Option<VerifyMode>,

    /// Suppress progress output
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// Log library activity to stderr (overridden by RUST_LOG)
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Print the versions available for flashing
    #[command(name = "list-versions")]
    ListVersions,

    /// Delete every cached image
    #[command(name = "cache-clear")]
    CacheClear,
}

/// Settings after merging the config file with the command line.
#[derive(Debug, Clone)]
pub struct MergedConfig {
    pub versions: Option<String>,
    pub version_id: Option<String>,
    pub programmer: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub cache_quota: Option<u64>,
    pub usb: UsbConfig,
    pub connect_timeout: Option<Duration>,
    pub simulate: bool,
    pub verify: VerifyMode,
    pub quiet: bool,
}

impl MergedConfig {
    pub fn image_config(&self) -> ImageConfig {
        ImageConfig {
            cache_dir: self
                .cache_dir
                .clone()
                .unwrap_or_else(ImageConfig::default_cache_dir),
            quota: self.cache_quota,
            ..ImageConfig::default()
        }
    }

    pub fn require_versions(&self) -> Result<&str> {
        match self.versions.as_deref() {
            Some(versions) => Ok(versions),
            None => bail!("Version list must be specified either via --versions or in config file"),
        }
    }
}

/// Merge CLI arguments with configuration file, CLI args take precedence
pub fn merge_config(args: &Cli, config: Option<QdlConfig>) -> Result<MergedConfig> {
    let base_config = config.unwrap_or_else(QdlConfig::with_defaults);

    let verify = match args.verify {
        Some(verify) => verify,
        None => base_config.parse_verify()?,
    };
    let vid = match args.vid {
        Some(vid) => vid,
        None => base_config.parse_vid()?,
    };
    let pid = match args.pid {
        Some(pid) => pid,
        None => base_config.parse_pid()?,
    };
    let connect_timeout = args
        .connect_timeout
        .or(base_config.connect_timeout_secs)
        .map(Duration::from_secs);
    if connect_timeout == Some(Duration::ZERO) {
        bail!("Connect timeout must be positive");
    }

    Ok(MergedConfig {
        versions: args.versions.clone().or(base_config.versions),
        version_id: args.version_id.clone().or(base_config.version_id),
        programmer: args
            .programmer
            .clone()
            .or(base_config.programmer)
            .map(PathBuf::from),
        cache_dir: args
            .cache_dir
            .clone()
            .or(base_config.cache_dir)
            .map(PathBuf::from),
        cache_quota: args.cache_quota.or(base_config.cache_quota),
        usb: UsbConfig {
            vid,
            pid,
            serial: args.serial.clone().or(base_config.serial),
            ..UsbConfig::default()
        },
        connect_timeout,
        simulate: args.simulate,
        verify,
        quiet: args.quiet || base_config.quiet,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HexString;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("qdlflash").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn command_line_wins_over_config() {
        let mut config = QdlConfig::with_defaults();
        config.versions = Some("file.json".into());
        config.verify = "none".into();
        config.pid = Some(HexString("0x1234".into()));
        config.quiet = true;

        let args = parse(&["--versions", "https://example.com/v.json", "--pid", "0x9009"]);
        let merged = merge_config(&args, Some(config)).unwrap();
        assert_eq!(merged.versions.as_deref(), Some("https://example.com/v.json"));
        assert_eq!(merged.usb.pid, 0x9009);
        assert_eq!(merged.usb.vid, 0x05C6);
        assert_eq!(merged.verify, VerifyMode::None);
        assert!(merged.quiet);
    }

    #[test]
    fn defaults_without_config() {
        let args = parse(&["--verify", "none", "--cache-quota", "16G", "list-versions"]);
        let merged = merge_config(&args, None).unwrap();
        assert_eq!(merged.verify, VerifyMode::None);
        assert_eq!(merged.cache_quota, Some(16 << 30));
        assert_eq!(merged.connect_timeout, None);
        assert!(merged.require_versions().is_err());
        assert!(matches!(args.command, Some(Commands::ListVersions)));
    }

    #[test]
    fn rejects_zero_timeout_and_wide_ids() {
        assert!(Cli::try_parse_from(["qdlflash", "--vid", "0x10000"]).is_err());
        let args = parse(&["--connect-timeout", "0"]);
        assert!(merge_config(&args, None).is_err());
    }
}
