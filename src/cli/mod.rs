use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    artwork::{
        store::ArtworkStore,
        transcode::Transcoder,
    },
    config::{Config, SourceConfig},
    domain::event::EventKind,
    http::server::HttpServer,
    notify::{self, NotifierHandle},
    pipeline::Pipeline,
    source,
};

#[derive(Parser)]
#[command(name = "coverbridge")]
#[command(version)]
#[command(about = "Serves now-playing cover art to a display and tells it when to refresh")]
pub struct Cli {
    /// Path to the config TOML file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline and the HTTP server
    Serve,
    /// Validate the config and the default images
    Check,
    /// Transcode one image with the configured settings
    Transcode {
        /// Image to convert
        input: PathBuf,
        /// Directory receiving cover.jpg and cover.png
        out_dir: PathBuf,
    },
}

/// Entrypoint for CLI
pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = Config::load(&cli.config)
        .with_context(|| format!("could not load {}", cli.config.display()))?;
    init_logging(&cfg.log_level);

    let transcoder = Transcoder::new(cfg.image.transcode_settings());

    match cli.command {
        Commands::Serve => serve(cfg, transcoder),
        Commands::Check => check(&cfg, &transcoder),
        Commands::Transcode { input, out_dir } => transcode(&transcoder, &input, &out_dir),
    }
}

fn init_logging(default_level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

fn serve(cfg: Config, transcoder: Transcoder) -> anyhow::Result<()> {
    let store = Arc::new(ArtworkStore::new(cfg.load_defaults(&transcoder)?));

    let notifier = match &cfg.esphome {
        Some(esphome) => {
            info!("notifying ESPHome device at {}:{}", esphome.host, esphome.port);
            // The worker thread lives as long as the notifier handle.
            notify::spawn(esphome).0
        }
        None => {
            info!("no [esphome] section, notifications disabled");
            NotifierHandle::disabled()
        }
    };

    let source = source::build(cfg.source()?);
    let _pipeline = Pipeline::start(
        source,
        transcoder,
        store.clone(),
        notifier,
        cfg.pipeline.event_queue_depth,
    );

    HttpServer::new(store, cfg.http).run();
    Ok(())
}

fn check(cfg: &Config, transcoder: &Transcoder) -> anyhow::Result<()> {
    let defaults = cfg.load_defaults(transcoder)?;
    let settings = transcoder.settings();

    println!("Config is valid");
    match cfg.source()? {
        SourceConfig::Mqtt(mqtt) => println!(
            "Source: MQTT broker {}:{}, topics under {}/",
            mqtt.host, mqtt.port, mqtt.topic_prefix
        ),
        SourceConfig::Device(device) => println!(
            "Source: device '{}' via {}, polled every {} ms",
            device.name, device.service_type, device.poll_interval_ms
        ),
    }
    println!(
        "Artwork: {}x{} ({:?}), JPEG quality {}",
        settings.width, settings.height, settings.resize, settings.jpeg_quality
    );
    println!(
        "Defaults: {} bytes JPEG, {} bytes PNG",
        defaults.jpeg.len(),
        defaults.png.len()
    );

    match &cfg.esphome {
        Some(esphome) => {
            println!("Notifier: ESPHome at {}:{}", esphome.host, esphome.port);
            for kind in [
                EventKind::ArtworkChanged,
                EventKind::TitleChanged,
                EventKind::ArtistChanged,
                EventKind::AlbumChanged,
            ] {
                let action = esphome.actions.action_for(kind).unwrap_or("(disabled)");
                println!("    - {kind:?} -> {action}");
            }
        }
        None => println!("Notifier: disabled"),
    }
    Ok(())
}

fn transcode(
    transcoder: &Transcoder,
    input: &Path,
    out_dir: &Path,
) -> anyhow::Result<()> {
    let snapshot = transcoder
        .transcode_path(input)
        .with_context(|| format!("could not transcode {}", input.display()))?;

    fs::create_dir_all(out_dir)
        .with_context(|| format!("could not create {}", out_dir.display()))?;
    for (name, bytes) in [("cover.jpg", &snapshot.jpeg), ("cover.png", &snapshot.png)] {
        let path = out_dir.join(name);
        fs::write(&path, &bytes[..])
            .with_context(|| format!("could not write {}", path.display()))?;
        println!("    - {} ({} bytes)", path.display(), bytes.len());
    }
    println!("Artwork {} transcoded", snapshot.source_hash.short());
    Ok(())
}
