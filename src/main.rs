//! imports-ef: import-weighted emission factors for U.S. imports.
//!
//! Usage:
//!   imports-ef fetch --config config.yml
//!   imports-ef run --config config.yml [--year 2020]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imports_ef::{HttpFetcher, ImportFactorPipeline, PipelineConfig};

#[derive(Parser, Debug)]
#[command(name = "imports-ef")]
#[command(about = "Import-weighted emission factors from MRIO multipliers and trade statistics")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Request BEA and Census imports and replace the response cache
    Fetch {
        #[arg(long, value_name = "FILE")]
        config: PathBuf,

        /// Substituted for `__key__` in request parameters
        #[arg(long, env = "IMPORTS_EF_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
    },
    /// Compute and write the factor tables from cached or static inputs
    Run {
        #[arg(long, value_name = "FILE")]
        config: PathBuf,

        /// Override the data vintage in the config
        #[arg(long)]
        year: Option<i32>,
    },
}

fn load_config(path: &Path, year: Option<i32>) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::from_yaml_file(path)
        .with_context(|| format!("loading config {}", path.display()))?;
    if let Some(year) = year {
        config.year = year;
    }
    Ok(config)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Fetch { config, api_key } => {
            let pipeline = ImportFactorPipeline::new(load_config(&config, None)?);
            let fetcher = HttpFetcher::new()?;
            let written = pipeline
                .fetch(&fetcher, api_key.as_deref())
                .context("fetch phase failed; previous cache left untouched")?;
            for path in written {
                println!("{}", path.display());
            }
        }
        Command::Run { config, year } => {
            let pipeline = ImportFactorPipeline::new(load_config(&config, year)?);
            let (output, written) = pipeline.run_and_write().context("pipeline run failed")?;
            for path in &written {
                println!("{}", path.display());
            }
            if !output.report.is_clean() {
                log::warn!(
                    "Run finished with findings: {} share checks flagged, {} country-sectors without multipliers, {} sectors without coverage",
                    output.report.share_findings.iter().filter(|f| !f.is_clean()).count(),
                    output.report.missing_multipliers.len(),
                    output.report.coverage.missing.len()
                );
            }
        }
    }
    Ok(())
}
