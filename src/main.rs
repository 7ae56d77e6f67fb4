//! Cytostream CLI
//!
//! Detects events in imaging flow cytometry datasets.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cytostream::{build_runtime, config, init_rayon, ppid, run_job, JobConfig, JobRunner};

#[derive(Parser)]
#[command(name = "cytostream")]
#[command(about = "Detect and measure events in imaging flow cytometry data", long_about = None)]
struct Cli {
    /// Path to job configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override the number of segmentation workers
    #[arg(long, global = true)]
    seg_workers: Option<usize>,

    /// Override the number of extraction workers
    #[arg(long, global = true)]
    ext_workers: Option<usize>,

    /// Override the number of frames per chunk
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the job (default if no command specified)
    Run,

    /// Validate the job against its input without processing
    Validate,

    /// Print the pipeline identifier of the job
    Ppid {
        /// Decode this PPID instead of computing one
        #[arg(long)]
        decode: Option<String>,
    },

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },

    /// Serve a worker over stdin/stdout
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        id: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Worker stdout carries frames, so workers log to stderr
    let worker = matches!(cli.command, Some(Commands::Worker { .. }));
    let writer = if worker {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        BoxMakeWriter::new(std::io::stdout)
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    match &cli.command {
        None | Some(Commands::Run) => {
            let config = load_config(&cli)?;
            run_command(config)?;
        }

        Some(Commands::Validate) => {
            let config = load_config(&cli)?;
            validate_command(config)?;
        }

        Some(Commands::Ppid { decode: Some(id) }) => {
            decode_ppid_command(id)?;
        }

        Some(Commands::Ppid { decode: None }) => {
            let config = load_config(&cli)?;
            ppid_command(config)?;
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output.clone())?;
        }

        Some(Commands::Worker { id }) => {
            let _span = tracing::info_span!("worker", id = *id).entered();
            init_rayon(Some(1))?;
            cytostream::pipeline::worker::serve_stdio()?;
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<JobConfig> {
    let mut config = JobConfig::from_file(&cli.config)?;

    // Apply overrides
    if let Some(n) = cli.seg_workers {
        config.processing.segmentation_workers = Some(n);
    }
    if let Some(n) = cli.ext_workers {
        config.processing.extraction_workers = Some(n);
    }
    if let Some(n) = cli.chunk_size {
        config.processing.chunk_size = n;
    }

    config.validate()?;
    Ok(config)
}

fn run_command(config: JobConfig) -> Result<()> {
    // Initialize Rayon
    init_rayon(config.processing.rayon_threads)?;

    // Build and run Tokio runtime
    let runtime = build_runtime(config.processing.worker_threads)?;
    let summary = runtime.block_on(async { run_job(config).await })?;
    println!("{summary}");

    Ok(())
}

fn validate_command(config: JobConfig) -> Result<()> {
    let mut runner = JobRunner::new(config);
    runner.validate()?;
    println!("Job is valid");
    if let Some(id) = runner.ppid() {
        println!("PPID: {id}");
    }
    Ok(())
}

fn ppid_command(config: JobConfig) -> Result<()> {
    let mut runner = JobRunner::new(config);
    runner.validate()?;
    if let Some(id) = runner.ppid() {
        println!("{id}");
    }
    Ok(())
}

fn decode_ppid_command(id: &str) -> Result<()> {
    let (generation, stages) = ppid::parse(id)?;
    println!("generation: {generation}");
    for spec in stages.iter() {
        println!("{}: {}", spec.kind, spec.fragment());
    }
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    std::fs::write(&output, config::TEMPLATE)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_default() {
        // No subcommand - should default to Run
        let cli = Cli::try_parse_from(["cytostream"]);
        assert!(cli.is_ok());
        assert!(cli.unwrap().command.is_none());
    }

    #[test]
    fn test_cli_parse_with_config() {
        let cli = Cli::try_parse_from(["cytostream", "-c", "other.yaml"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_parse_validate() {
        let cli = Cli::try_parse_from(["cytostream", "validate", "-c", "test.json"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_parse_overrides() {
        let cli = Cli::try_parse_from(["cytostream", "run", "--seg-workers", "2", "--chunk-size", "500"]).unwrap();
        assert_eq!(cli.seg_workers, Some(2));
        assert_eq!(cli.chunk_size, Some(500));
        assert!(cli.ext_workers.is_none());
    }

    #[test]
    fn test_cli_parse_worker() {
        let cli = Cli::try_parse_from(["cytostream", "worker", "--id", "3"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Worker { id: 3 })));
    }

    #[test]
    fn test_generated_config_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.yaml");
        generate_config_command(path.clone()).unwrap();
        let config = JobConfig::from_file(&path).unwrap();
        assert!(config.validate().is_ok());
    }
}
