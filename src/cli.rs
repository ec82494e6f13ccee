//
// cli.rs
// Pacs-Bridge-rs
//
// Defines the CLI surface with Clap and dispatches user-selected commands to the PACS router.
//
// Thales Matheus Mendonça Santos - November 2025

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::dicomweb::RenderedMediaType;
use crate::query::{MoveScope, QueryFilters};
use crate::router::Bridge;
use crate::web;

/// Command-line interface glue code: defines the available verbs and dispatches to the router.
#[derive(Parser)]
#[command(name = "pacs-bridge")]
#[command(about = "Query and retrieve studies from legacy DICOM and DICOMweb PACS", long_about = None)]
pub struct Cli {
    /// Configuration file describing the local AE and the PACS registry
    #[arg(short, long, global = true, default_value = "pacs.toml")]
    pub config: PathBuf,
    /// Raise the default log level to debug
    #[arg(short, long, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the active PACS
    List,
    /// Test connectivity (C-ECHO, or a QIDO-RS probe for DICOMweb)
    Echo { pacs: String },
    /// C-ECHO every active legacy PACS in parallel
    EchoAll,
    /// Query studies
    FindStudies {
        pacs: String,
        #[arg(long)]
        patient_id: Option<String>,
        #[arg(long)]
        patient_name: Option<String>,
        /// DICOM date or range, e.g. 20240101-20240131
        #[arg(long)]
        study_date: Option<String>,
        #[arg(long)]
        modality: Option<String>,
        #[arg(long)]
        accession: Option<String>,
        /// Passed to QIDO-RS as `limit`; ignored by C-FIND
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Query the series of a study
    FindSeries { pacs: String, study: String },
    /// Query the instances of a series
    FindInstances {
        pacs: String,
        study: String,
        series: String,
    },
    /// C-MOVE a study, series or instance to a destination AE
    Retrieve {
        pacs: String,
        study: String,
        #[arg(long)]
        series: Option<String>,
        #[arg(long, requires = "series")]
        instance: Option<String>,
        /// Destination AE title (defaults to the local AE title)
        #[arg(long)]
        dest: Option<String>,
    },
    /// Fetch one instance over WADO-RS
    Wado {
        pacs: String,
        study: String,
        series: String,
        instance: String,
        #[arg(long, value_enum)]
        rendered: Option<RenderedFormat>,
        /// Defaults to `<instance>.dcm`, or `<instance>.jpg|png` when rendered
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// C-STORE a local DICOM file
    Push { pacs: String, file: PathBuf },
    /// Start the web server
    Serve {
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        #[arg(short, long, default_value_t = 3000)]
        port: u16,
    },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum RenderedFormat {
    Jpeg,
    Png,
}

impl From<RenderedFormat> for RenderedMediaType {
    fn from(value: RenderedFormat) -> Self {
        match value {
            RenderedFormat::Jpeg => RenderedMediaType::Jpeg,
            RenderedFormat::Png => RenderedMediaType::Png,
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // A second initialisation (tests, embedding) is harmless.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub async fn run() -> anyhow::Result<()> {
    // Parse the raw CLI arguments once and dispatch to a subcommand handler.
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    match cli.command {
        Commands::Serve { host, port } => {
            // The router owns a blocking HTTP client; build it off the async workers.
            let router = tokio::task::spawn_blocking(move || Bridge::from_config(&config)).await??;
            web::start_server(Arc::new(router), &host, port).await
        }
        command => tokio::task::spawn_blocking(move || execute(command, &config)).await?,
    }
}

fn execute(command: Commands, config: &AppConfig) -> anyhow::Result<()> {
    let router = Bridge::from_config(config)?;
    debug!("Router ready with {} active PACS", router.list_pacs().len());

    match command {
        Commands::List => print_json(&router.list_pacs())?,
        Commands::Echo { pacs } => {
            let result = router.test_connection(&pacs)?;
            print_json(&result)?;
            if !result.success {
                bail!("Connection test for {} failed: {}", pacs, result.message);
            }
        }
        Commands::EchoAll => print_json(&router.echo_all())?,
        Commands::FindStudies {
            pacs,
            patient_id,
            patient_name,
            study_date,
            modality,
            accession,
            limit,
        } => {
            let filters: QueryFilters = [
                ("PatientID", patient_id),
                ("PatientName", patient_name),
                ("StudyDate", study_date),
                ("ModalitiesInStudy", modality),
                ("AccessionNumber", accession),
                ("limit", limit.map(|l| l.to_string())),
            ]
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect();
            print_json(&router.query_studies(&pacs, &filters)?)?
        }
        Commands::FindSeries { pacs, study } => print_json(&router.query_series(&pacs, &study)?)?,
        Commands::FindInstances { pacs, study, series } => {
            print_json(&router.query_instances(&pacs, &study, &series)?)?
        }
        Commands::Retrieve {
            pacs,
            study,
            series,
            instance,
            dest,
        } => {
            let scope = match (series, instance) {
                (Some(series), Some(instance)) => MoveScope::image(study, series, instance),
                (Some(series), None) => MoveScope::series(study, series),
                _ => MoveScope::study(study),
            };
            let result = router.retrieve(&pacs, scope, dest.as_deref())?;
            print_json(&result)?;
            if !result.success {
                bail!(
                    "Retrieval {} ended as {:?}",
                    result.retrieval_id,
                    result.status
                );
            }
        }
        Commands::Wado {
            pacs,
            study,
            series,
            instance,
            rendered,
            output,
        } => {
            let output = output.unwrap_or_else(|| {
                let extension = rendered.map_or("dcm", |f| RenderedMediaType::from(f).extension());
                PathBuf::from(format!("{}.{}", instance, extension))
            });
            let bytes = match rendered {
                Some(format) => router.fetch_rendered(&pacs, &study, &series, &instance, format.into())?,
                None => router.fetch_instance(&pacs, &study, &series, &instance)?,
            };
            std::fs::write(&output, &bytes)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Saved {} bytes to {}", bytes.len(), output.display());
        }
        Commands::Push { pacs, file } => {
            let outcome = router.store(&pacs, &file)?;
            print_json(&outcome)?;
            if !outcome.success {
                bail!("C-STORE of {} was refused: {}", file.display(), outcome.message);
            }
        }
        Commands::Serve { .. } => bail!("serve is handled by the async entry point"),
    }

    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn retrieve_parses_scope_flags() {
        let cli = Cli::try_parse_from([
            "pacs-bridge",
            "--config",
            "custom.toml",
            "retrieve",
            "orthanc",
            "1.2.3",
            "--series",
            "1.2.3.4",
            "--dest",
            "VIEWER",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("custom.toml"));
        match cli.command {
            Commands::Retrieve {
                pacs, series, dest, ..
            } => {
                assert_eq!(pacs, "orthanc");
                assert_eq!(series.as_deref(), Some("1.2.3.4"));
                assert_eq!(dest.as_deref(), Some("VIEWER"));
            }
            _ => panic!("expected retrieve"),
        }
    }

    #[test]
    fn instance_requires_series() {
        assert!(Cli::try_parse_from(["pacs-bridge", "retrieve", "orthanc", "1.2.3", "--instance", "9"]).is_err());
    }
}
