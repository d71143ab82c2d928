pub mod types;
pub mod config;
pub mod data;
pub mod geocode;
pub mod filter;
pub mod boundary;
pub mod compose;
pub mod pipeline;
pub mod render;
pub mod server;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use config::AppConfig;
use geocode::HttpGeocoder;
use pipeline::PipelineReport;
use render::PngOptions;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the map outputs from the configured records
    Generate {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Serve the rendered outputs plus the record query API
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Generate { config } => {
            println!("Generating map with config: {:?}", config);
            let app_config = AppConfig::load_from_file(config)?;
            if app_config.output.png.is_none() && app_config.output.html.is_none() {
                return Err(anyhow!(
                    "No outputs configured: set output.png, output.html, or both"
                ));
            }

            let geocoder = HttpGeocoder::new(&app_config.geocoder)?;
            let (spec, report) = pipeline::build_map(&app_config, &geocoder).await?;
            print_report(&report);

            if let Some(name) = &app_config.output.png {
                let path = app_config.output.dir.join(name);
                let options = PngOptions {
                    width: app_config.output.width,
                    height: app_config.output.height,
                    background: app_config.output.background.clone(),
                };
                render::render_png(&spec, &options, &path)?;
                println!("Wrote static map to {:?}", path);
            }
            if let Some(name) = &app_config.output.html {
                let path = app_config.output.dir.join(name);
                render::render_html(&spec, &path)?;
                println!("Wrote interactive map to {:?}", path);
            }

            println!("Generation complete!");
        }
        Commands::Serve { config } => {
            println!("Serving map with config: {:?}", config);
            let app_config = AppConfig::load_from_file(config)?;

            let geocoder = HttpGeocoder::new(&app_config.geocoder)?;
            let (records, warnings) = pipeline::resolve_records(&app_config, &geocoder).await?;
            if !warnings.is_empty() {
                println!("{} record(s) failed to resolve:", warnings.len());
                for warning in &warnings {
                    println!("  - {warning}");
                }
            }

            server::start_server(app_config, records).await?;
        }
    }

    Ok(())
}

fn print_report(report: &PipelineReport) {
    if report.is_clean() {
        return;
    }
    if !report.resolution.is_empty() {
        println!("{} record(s) failed to resolve:", report.resolution.len());
        for warning in &report.resolution {
            println!("  - {warning}");
        }
    }
    if !report.composition.is_empty() {
        println!("{} layer warning(s):", report.composition.len());
        for warning in &report.composition {
            println!("  - {warning}");
        }
    }
}
