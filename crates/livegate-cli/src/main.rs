//! `livegate`: offline tools around the liveness engine.
//!
//! Usage:
//!   livegate score face.png                       # score the whole image
//!   livegate score frame.png --box 120,380,320,260 # crop a face first
//!   livegate config --config livegate.toml        # print effective config

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use livegate_core::spoof::{spoof_breakdown, StrictSpoofScorer};
use livegate_core::{screen_artifact_score, FaceBox, LivenessConfig, SpoofScorer};

#[derive(Parser, Debug)]
#[command(name = "livegate")]
#[command(version, about = "Liveness engine diagnostics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Score an image for photo/screen spoof artifacts
    Score {
        /// Input image file
        image: PathBuf,

        /// Face box to crop first, as top,right,bottom,left
        #[arg(long = "box", value_parser = parse_box)]
        face_box: Option<FaceBox>,

        /// Pixels of context kept around the face box
        #[arg(long)]
        margin: Option<i32>,

        /// Engine config file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the effective engine configuration as TOML
    Config {
        /// Engine config file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Commands::Score {
            image,
            face_box,
            margin,
            config,
        } => score(&image, face_box, margin, config.as_deref()),
        Commands::Config { config } => {
            let config = load_config(config.as_deref())?;
            print!(
                "{}",
                toml::to_string_pretty(&config).context("failed to render config")?
            );
            Ok(())
        }
    }
}

fn score(
    path: &Path,
    face_box: Option<FaceBox>,
    margin: Option<i32>,
    config: Option<&Path>,
) -> Result<()> {
    let config = load_config(config)?;
    let frame = image::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .to_rgb8();
    let region = match face_box {
        Some(b) => b.crop_from(&frame, margin.unwrap_or(config.sampling.face_margin)),
        None => frame,
    };
    tracing::debug!(width = region.width(), height = region.height(), "scoring region");

    let breakdown = spoof_breakdown(&region, &config.spoof);
    let strict = StrictSpoofScorer::new(config.spoof.clone()).score(&region);
    let output = serde_json::json!({
        "image": path.display().to_string(),
        "region": { "width": region.width(), "height": region.height() },
        "spoof": breakdown,
        "screen_artifact": screen_artifact_score(&region),
        "strict": strict,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<LivenessConfig> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))?
        }
        None => LivenessConfig::default(),
    };
    Ok(config.validated())
}

fn parse_box(s: &str) -> Result<FaceBox, String> {
    let parts: Vec<i32> = s
        .split(',')
        .map(|p| p.trim().parse::<i32>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("invalid box {s:?}: {e}"))?;
    match parts[..] {
        [top, right, bottom, left] if bottom > top && right > left => {
            Ok(FaceBox::new(top, right, bottom, left))
        }
        [_, _, _, _] => Err(format!("box {s:?} has no area")),
        _ => Err(format!("box {s:?} needs four values: top,right,bottom,left")),
    }
}
