mod cli;
mod config;
mod progress;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use cli::{Cli, Commands, MergedConfig, merge_config};
use config::QdlConfig;
use qdlflash_lib::image::{DefaultSource, ImageSource};
use qdlflash_lib::sim::{SimConfig, SimDevice};
use qdlflash_lib::utils::Utils;
use qdlflash_lib::{
    Connector, FlashConfig, FlashManager, ImageManager, UsbConnector, VersionEntry, VersionList,
};
use std::io::Read;
use std::path::Path;
use std::process;
use std::sync::Arc;

fn is_url(source: &str) -> bool {
    ["http://", "https://", "file://"]
        .iter()
        .any(|scheme| source.starts_with(scheme))
}

fn load_versions(source: &str) -> Result<VersionList> {
    if !is_url(source) {
        return VersionList::from_file(Path::new(source))
            .with_context(|| format!("Failed to load version list {}", source));
    }
    let mut json = String::new();
    DefaultSource::new()?
        .fetch(source)?
        .read_to_string(&mut json)
        .with_context(|| format!("Failed to download version list {}", source))?;
    VersionList::from_json(&json).with_context(|| format!("Invalid version list {}", source))
}

fn select_version<'a>(versions: &'a VersionList, id: Option<&str>) -> Result<&'a VersionEntry> {
    match id {
        Some(id) => versions.find(id).ok_or_else(|| {
            let known: Vec<&str> = versions.iter().map(|v| v.id.as_str()).collect();
            anyhow!("Unknown version '{}'. Available: {}", id, known.join(", "))
        }),
        None => versions.latest().context("Version list is empty"),
    }
}

fn list_versions(merged: &MergedConfig) -> Result<()> {
    let versions = load_versions(merged.require_versions()?)?;
    for version in versions.iter() {
        println!(
            "{:<12} {:<32} {:>10}{}",
            version.id,
            version.name,
            Utils::format_bytes(version.manifest.total_size()),
            if version.is_latest { "  (latest)" } else { "" }
        );
    }
    Ok(())
}

fn cache_clear(merged: &MergedConfig) -> Result<()> {
    let images = ImageManager::new(merged.image_config())?;
    let freed = images.clear_cache()?;
    println!(
        "Freed {} in {}",
        Utils::format_bytes(freed),
        images.cache().dir().display()
    );
    Ok(())
}

/// Initializes the manager against `host`, then runs one session on `connector`.
fn run_session<C>(
    manager: &mut FlashManager,
    images: Arc<ImageManager>,
    host: &C,
    connector: C,
) -> Result<()>
where
    C: Connector + 'static,
{
    let outcome = manager
        .initialize(images, host)
        .and_then(|()| manager.start(connector))
        .and_then(|handle| handle.wait());

    let snapshot = manager.snapshot();
    match (outcome, snapshot.error) {
        (Ok(()), None) => {
            if let Some(serial) = snapshot.serial {
                println!("Device {} flashed successfully", serial);
            }
            Ok(())
        }
        (result, Some(condition)) => {
            if let Err(e) = result {
                tracing::debug!("session error: {}", e);
            }
            bail!("{}: {}", condition.status(), condition.description())
        }
        (Err(e), None) => Err(e.into()),
    }
}

fn flash(merged: &MergedConfig) -> Result<()> {
    let versions = load_versions(merged.require_versions()?)?;
    let version = select_version(&versions, merged.version_id.as_deref())?;
    let programmer_path = merged
        .programmer
        .as_ref()
        .context("Programmer must be specified either via --programmer or in config file")?;
    let programmer = std::fs::read(programmer_path)
        .with_context(|| format!("Failed to read programmer {}", programmer_path.display()))?;

    let images = Arc::new(ImageManager::new(merged.image_config())?);
    let config = FlashConfig {
        connect_timeout: merged.connect_timeout,
        verify: merged.verify,
        ..FlashConfig::default()
    };
    let mut manager = FlashManager::new(
        version.manifest.clone(),
        programmer,
        progress::create_observer(merged.quiet),
    )
    .with_config(config);

    tracing::info!("flashing version {} ({})", version.id, version.name);
    if merged.simulate {
        let device = SimDevice::new(SimConfig::default());
        run_session(&mut manager, images, &device.connector(), device.connector())
    } else {
        let usb = UsbConnector::new(merged.usb.clone());
        run_session(&mut manager, images, &usb, usb.clone())
    }
}

fn run(args: Cli) -> Result<()> {
    let config = args
        .config
        .as_deref()
        .map(QdlConfig::from_file)
        .transpose()?;
    let merged = merge_config(&args, config)?;

    match args.command {
        Some(Commands::ListVersions) => list_versions(&merged),
        Some(Commands::CacheClear) => cache_clear(&merged),
        None => flash(&merged),
    }
}

fn main() {
    let args = Cli::parse();

    // RUST_LOG takes precedence, e.g. RUST_LOG=qdlflash_lib=trace
    let default_filter = if args.verbose {
        "qdlflash=debug,qdlflash_lib=debug"
    } else {
        "off"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(args) {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
