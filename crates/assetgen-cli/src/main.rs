//! assetgen CLI - local SDXL asset generation
//!
//! Generates single images from local SDXL weights with optional LoRA
//! adapters, and expands short ideas into prompt pairs with a local LLM.

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

mod commands;

use commands::enhance::EnhanceArgs;
use commands::generate::GenerateArgs;

/// assetgen - text-to-image asset generation on local models
#[derive(Parser)]
#[command(name = "assetgen")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate one image
    Generate(GenerateArgs),

    /// Turn ideas into SDXL prompt pairs with a local language model
    Enhance(EnhanceArgs),

    /// List local LoRA adapters and checkpoints
    Loras,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_ansi(!cli.no_color)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Generate(args) => commands::generate::run(args)?,
        Commands::Enhance(args) => commands::enhance::run(args)?,
        Commands::Loras => commands::loras::run()?,
    }

    Ok(())
}
