//! card-scanner - identify trading cards from a stream of frames
//!
//! Replays a directory of still images through the scan pipeline and prints
//! every lock, identification and miss.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use card_scanner::capture::DirectorySource;
use card_scanner::catalog::{Catalog, SpeciesList};
use card_scanner::config::{self, ScannerConfig};
use card_scanner::identify::{CloudIdentifier, HttpCloudIdentifier};
use card_scanner::pipeline::ScanPipeline;
use card_scanner::shared::ScanEvent;
use card_scanner::storage;
use card_scanner::vision::TesseractCli;

/// card-scanner - trading card detection and identification
#[derive(Parser, Debug)]
#[command(name = "card-scanner")]
#[command(about = "Detects, rectifies and identifies trading cards in a frame stream")]
struct Args {
    /// Config file (defaults to config.toml in the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Catalog JSON file (defaults to the bundled sample catalog)
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Directory of still images to scan
    #[arg(short, long)]
    frames: Option<PathBuf>,

    /// Ticks each still image is held for
    #[arg(long, default_value = "8")]
    repeat: usize,

    /// Cloud identification endpoint (overrides the config file)
    #[arg(long)]
    endpoint: Option<String>,

    /// Path to the tesseract binary
    #[arg(long, default_value = "tesseract")]
    tesseract: PathBuf,

    /// Tesseract language pack
    #[arg(long, default_value = "eng")]
    language: String,

    /// Write every canonical card image into this directory
    #[arg(long)]
    save_canonical: Option<PathBuf>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    let mut config = load_or_default_config(args.config.as_deref())?;
    if let Some(endpoint) = &args.endpoint {
        config.cloud.endpoint = Some(endpoint.clone());
    }

    if args.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let Some(frames_dir) = args.frames.as_deref() else {
        anyhow::bail!("--frames <DIR> is required unless --print-config is given");
    };

    let catalog = match &args.catalog {
        Some(path) => Catalog::load(path)?,
        None => Catalog::sample()?,
    };
    let mut species = SpeciesList::builtin();
    species.extend(&SpeciesList::from_catalog(&catalog));
    info!("Loaded {} catalog entries, {} species names", catalog.len(), species.len());

    let recognizer = TesseractCli::new(&args.tesseract).with_language(args.language.as_str());
    if let Err(e) = recognizer.probe().await {
        warn!("Text recognizer {:?} is not usable: {}", args.tesseract, e);
    }

    let cloud: Option<Arc<dyn CloudIdentifier>> = match HttpCloudIdentifier::from_config(&config.cloud)? {
        Some(identifier) => Some(Arc::new(identifier)),
        None => {
            info!("No cloud endpoint configured, running local-only");
            None
        }
    };

    let mut pipeline = ScanPipeline::new(config, catalog, species, Arc::new(recognizer), cloud)?;
    if let Some(dir) = &args.save_canonical {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        pipeline = pipeline.with_canonical_dir(dir);
    }

    let source = DirectorySource::open(frames_dir, args.repeat)?;
    if source.is_empty() {
        warn!("No images found in {:?}", frames_dir);
    }
    info!("Scanning {} image(s) from {:?}", source.len(), frames_dir);

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping...");
            ctrl_c_cancel.cancel();
        }
    });

    let (event_tx, event_rx) = crossbeam_channel::unbounded::<ScanEvent>();
    let printer = std::thread::spawn(move || {
        for event in event_rx {
            print_event(&event);
        }
    });

    pipeline.run(source, event_tx, cancel).await;

    // run() consumed the sender, so the printer ends once the queue is empty
    if printer.join().is_err() {
        warn!("Event printer thread panicked");
    }

    info!("card-scanner finished");
    Ok(())
}

/// Load configuration from the given file, the default location, or defaults
fn load_or_default_config(path: Option<&Path>) -> Result<ScannerConfig> {
    if let Some(path) = path {
        let config = config::load_config(path)?;
        info!("Loaded configuration from {:?}", path);
        return Ok(config);
    }

    if let Ok(config_path) = storage::default_config_path() {
        if config_path.exists() {
            let config = config::load_config(&config_path)?;
            info!("Loaded configuration from {:?}", config_path);
            return Ok(config);
        }
    }

    info!("Using default configuration");
    Ok(ScannerConfig::default())
}

fn print_event(event: &ScanEvent) {
    match event {
        ScanEvent::Locked { lock_id, .. } => println!("[{}] locked", lock_id),
        ScanEvent::Identified { lock_id, result } => {
            let hp = result.hp.map(|hp| format!(" {} HP", hp)).unwrap_or_default();
            let value = result
                .market_value
                .map(|v| format!(" ~${:.2}", v))
                .unwrap_or_default();
            println!(
                "[{}] {:?}: {} {} ({}) {} {}{}{}",
                lock_id,
                result.source,
                result.name,
                result.number,
                result.set,
                result.rarity,
                result.card_type,
                hp,
                value
            );
        }
        ScanEvent::Missed { lock_id } => println!("[{}] no identification", lock_id),
        ScanEvent::CloudDegraded { reason, retryable } => {
            println!("cloud degraded ({}): {}", if *retryable { "retrying" } else { "giving up on this card" }, reason)
        }
    }
}
