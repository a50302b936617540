//! GPTQ CLI - Quantize stacked SafeTensors models and inspect the result.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod common;
mod config;
mod inspect;
mod quantize;

#[derive(Parser)]
#[command(name = "gptq")]
#[command(about = "CLI tool for GPTQ post-training quantization of SafeTensors models")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Quantize a SafeTensors model with calibration data
    Quantize {
        /// Path to the model .safetensors file
        #[arg(short, long)]
        model: String,

        /// Path to the calibration .safetensors file
        #[arg(long)]
        calibration: Option<String>,

        /// Path to quantize config JSON
        #[arg(short, long)]
        config: Option<String>,

        /// Output directory
        #[arg(short, long)]
        output: Option<String>,

        /// Stream block weights from disk and write one file per packed layer
        #[arg(long)]
        layer_wise: bool,

        /// Generate a template config instead of quantizing
        #[arg(long)]
        generate_config: bool,
    },

    /// List the packed layers of a quantized model
    Inspect {
        /// Path to a quantized .safetensors file or a layers directory
        #[arg(short, long)]
        model: String,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Quantize {
            model,
            calibration,
            config,
            output,
            layer_wise,
            generate_config,
        } => {
            if generate_config {
                quantize::generate_config_template(&model)?;
            } else {
                quantize::run(
                    &model,
                    calibration.as_deref(),
                    config.as_deref(),
                    output.as_deref(),
                    layer_wise,
                )?;
            }
        }
        Commands::Inspect { model } => {
            inspect::run(&model)?;
        }
    }

    Ok(())
}
