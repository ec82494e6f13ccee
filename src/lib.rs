//
// lib.rs
// Pacs-Bridge-rs
//
// Exposes the crate's modules and re-exports the router, backends and CLI entry point.
//
// Thales Matheus Mendonça Santos - November 2025

// Leaf-first: attribute model and DIMSE vocabulary, then the association client,
// the operations built on it, and finally the router and its front ends.
pub mod association;
pub mod attributes;
pub mod cli;
pub mod config;
pub mod dicomweb;
pub mod dimse;
pub mod error;
pub mod models;
pub mod progress;
pub mod query;
pub mod router;
pub mod scu;
pub mod sweep;
pub mod web;

pub use cli::{run as run_cli, Cli, Commands};
pub use error::{PacsError, Result};
pub use router::{Bridge, DicomWebBackend, LegacyBackend, PacsRouter};
