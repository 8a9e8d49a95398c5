//! Command-line front end
//!
//! `stackvdb export <config.toml>` exports the raw stack named in the
//! configuration. `stackvdb inspect <file.vdb>` prints a JSON summary of a
//! grid file.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stackvdb::{ExportConfig, ExportJob, GridSerializer, VolumeSeries};

/// Convert confocal Z-stacks into sparse voxel grid files.
#[derive(Parser, Debug)]
#[command(name = "stackvdb", version)]
#[command(about = "Converts dense Z-stacks into sparse hierarchical voxel grids")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Export every selected frame and channel of the configured raw stack
    Export {
        /// Path to the export configuration TOML file
        config: PathBuf,
    },
    /// Print a JSON summary of a grid file
    Inspect {
        /// Grid file to decode
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let result = match cli.command {
        Command::Export { config } => export(config),
        Command::Inspect { file } => inspect(file),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn export(config_path: PathBuf) -> Result<()> {
    let config = ExportConfig::load(&config_path)?;
    let raw = config
        .data
        .raw
        .clone()
        .with_context(|| format!("{} has no [data.raw] input", config_path.display()))?;

    let series = VolumeSeries::from_raw(&raw)?;
    log::info!(
        "Loaded {} frame(s) x {} channel(s) from {}",
        series.frames(),
        series.channels(),
        raw.path.display()
    );

    let report = ExportJob::new(config)?.run(&series)?;
    for file in &report.files {
        println!("{}", file.display());
    }
    log::info!(
        "{} file(s) written, {} active voxels in total",
        report.files.len(),
        report.active_voxels
    );
    Ok(())
}

fn inspect(path: PathBuf) -> Result<()> {
    let file = GridSerializer::read_file(&path)?;
    let summary = serde_json::to_string_pretty(&file.summary())
        .context("Failed to format grid summary")?;
    println!("{}", summary);
    Ok(())
}
