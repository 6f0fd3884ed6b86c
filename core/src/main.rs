//! CLI entry point for timesformer-rs.

use anyhow::{bail, Context, Result};
use std::path::Path;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use timesformer_rs::cli::{Cli, Commands};
use timesformer_rs::clip::{load_clip_json, synthetic_clip, ClipShape};
use timesformer_rs::config::Config;
use timesformer_rs::inference::{init_random_weights, test_device, Device, TimesformerModel};
use timesformer_rs::reshape::check_flatten;

/// Get the enabled features.
fn enabled_features() -> &'static str {
    if cfg!(feature = "cuda") {
        "cuda"
    } else {
        "cpu"
    }
}

/// Load the optional config file, falling back to defaults.
fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_yaml_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let cli = Cli::parse_args();

    match cli.command {
        Commands::Infer {
            weights,
            config,
            device,
            input,
            batch_size,
            seed,
            top_k,
            allow_resize,
            format,
        } => {
            let mut config = load_config(config.as_deref())?;
            if weights.is_some() {
                config.model.weights_path = weights;
            }
            if let Some(device) = device {
                config.inference.device = device;
            }
            if let Some(batch_size) = batch_size {
                config.inference.batch_size = batch_size;
            }
            if seed.is_some() {
                config.inference.seed = seed;
            }
            if let Some(top_k) = top_k {
                config.inference.top_k = top_k;
            }
            config.inference.allow_resize |= allow_resize;

            let device: Device = config.inference.device.parse()?;
            info!("Using device: {}", device);

            let model = TimesformerModel::load(&config.model, device)
                .context("Failed to load model")?
                .with_resize(config.inference.allow_resize);
            info!("Model loaded successfully");

            let result = match input {
                Some(input) => {
                    info!("Loading input: {}", input.display());
                    let clips = load_clip_json(&input)
                        .with_context(|| format!("Failed to read input: {}", input.display()))?;
                    model.infer(&clips)?
                }
                None => {
                    let shape = ClipShape::for_config(config.inference.batch_size, &config.model);
                    info!("Generating synthetic clips: {:?}", shape.dims());
                    model.infer(&synthetic_clip(shape, config.inference.seed))?
                }
            };

            info!(
                "Inference complete: output {:?} in {:.2}ms",
                result.shape(),
                result.latency_ms
            );

            let output = serde_json::json!({
                "attention_type": config.model.attention_type,
                "shape": result.shape(),
                "latency_ms": result.latency_ms,
                "predictions": result.top_k(config.inference.top_k).iter().enumerate().map(|(i, top)| {
                    serde_json::json!({
                        "clip": i,
                        "top_k": top.iter().map(|(class, score)| {
                            serde_json::json!({ "class": class, "score": score })
                        }).collect::<Vec<_>>(),
                    })
                }).collect::<Vec<_>>()
            });

            if format == "pretty" {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("{}", serde_json::to_string(&output)?);
            }
        }

        Commands::Info {
            weights,
            config,
            device,
        } => {
            let mut config = load_config(config.as_deref())?;
            if weights.is_some() {
                config.model.weights_path = weights;
            }
            let device: Device = device
                .as_deref()
                .unwrap_or(&config.inference.device)
                .parse()?;

            println!("timesformer-rs v{}", env!("CARGO_PKG_VERSION"));
            println!("features: {}", enabled_features());
            println!();
            println!("Device: {}", device);
            print!("{}", serde_yaml::to_string(&config.model)?);

            // Try to load the model to verify it works
            info!("Loading model...");
            let _model = TimesformerModel::load(&config.model, device)?;
            println!("Status: OK (model loaded successfully)");
        }

        Commands::TestDevice { device } => {
            let device = device.parse()?;
            println!("Testing device: {}", device);
            println!();

            match test_device(&device) {
                Ok(results) => {
                    println!("{}", results);
                }
                Err(e) => {
                    eprintln!("Device test failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::InitWeights { output, config } => {
            let config = load_config(config.as_deref())?;
            init_random_weights(&config.model, &output)
                .with_context(|| format!("Failed to write weights: {}", output.display()))?;
            println!("Wrote {}", output.display());
        }

        Commands::CheckFlatten { shape, seed } => {
            let Ok(shape) = <[usize; 5]>::try_from(shape.as_slice()) else {
                bail!("--shape needs exactly 5 values (T,B,C,H,W), got {:?}", shape);
            };
            let report = check_flatten(shape, seed)?;
            println!("{}", serde_json::to_string(&report)?);
            if !report.agrees() {
                bail!(
                    "flattening routes disagree on {} of {} elements",
                    report.elements - report.equal,
                    report.elements
                );
            }
        }
    }

    Ok(())
}
