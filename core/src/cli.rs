//! Command-line interface for timesformer-rs.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Run pretrained TimeSformer video classifiers from Rust.
#[derive(Parser, Debug)]
#[command(name = "timesformer-rs")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load weights and classify a clip batch.
    ///
    /// Without --input, a batch of standard-normal clips shaped for the
    /// model is generated.
    Infer {
        /// Path to the pretrained weights (.safetensors, .pth, .pyth).
        #[arg(short, long)]
        weights: Option<PathBuf>,

        /// Path to a YAML config file.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Device to run on (cpu, cuda, cuda:1, etc). Overrides the config.
        #[arg(short, long)]
        device: Option<String>,

        /// Path to input data file (JSON with "data" and "shape").
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Number of synthetic clips. Overrides the config.
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Seed for synthetic clips. Overrides the config.
        #[arg(long)]
        seed: Option<u64>,

        /// Classes to report per clip. Overrides the config.
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Accept clips whose frame count or size differ from the model.
        #[arg(long)]
        allow_resize: bool,

        /// Output format (json, pretty).
        #[arg(short, long, default_value = "json")]
        format: String,
    },

    /// Show build information and the resolved model configuration, then
    /// verify that the weights load.
    Info {
        /// Path to the pretrained weights.
        #[arg(short, long)]
        weights: Option<PathBuf>,

        /// Path to a YAML config file.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Device to load on.
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Run basic tensor operations on a device.
    TestDevice {
        /// Device to test (cpu, cuda, cuda:1, etc).
        #[arg(short, long, default_value = "cpu")]
        device: String,
    },

    /// Write a randomly initialised weights file for a configuration.
    InitWeights {
        /// Destination .safetensors path.
        #[arg(short, long)]
        output: PathBuf,

        /// Path to a YAML config file describing the architecture.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Check that two ways of flattening a (T, B, C, H, W) tensor agree.
    CheckFlatten {
        /// Tensor shape as T,B,C,H,W.
        #[arg(short, long, value_delimiter = ',', default_value = "8,2,3,224,224")]
        shape: Vec<usize>,

        /// Seed for the random tensor.
        #[arg(long)]
        seed: Option<u64>,
    },
}

impl Cli {
    /// Parse command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_infer() {
        let cli = Cli::try_parse_from([
            "timesformer-rs",
            "infer",
            "--weights",
            "k600.safetensors",
            "--batch-size",
            "2",
            "-k",
            "3",
            "--allow-resize",
        ])
        .unwrap();
        match cli.command {
            Commands::Infer {
                weights,
                batch_size,
                top_k,
                allow_resize,
                format,
                ..
            } => {
                assert_eq!(weights, Some(PathBuf::from("k600.safetensors")));
                assert_eq!(batch_size, Some(2));
                assert_eq!(top_k, Some(3));
                assert!(allow_resize);
                assert_eq!(format, "json");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_check_flatten_shape() {
        let cli = Cli::try_parse_from(["timesformer-rs", "check-flatten", "--shape", "4,2,3,8,8"])
            .unwrap();
        match cli.command {
            Commands::CheckFlatten { shape, seed } => {
                assert_eq!(shape, vec![4, 2, 3, 8, 8]);
                assert_eq!(seed, None);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
