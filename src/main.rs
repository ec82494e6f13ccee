//
// main.rs
// Pacs-Bridge-rs
//
// Tokio entry point that hands off execution to the CLI layer so commands are resolved asynchronously.
//
// Thales Matheus Mendonça Santos - November 2025

use pacs_bridge::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::run().await
}
