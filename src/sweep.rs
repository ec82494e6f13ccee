//
// sweep.rs
// Pacs-Bridge-rs
//
// Parallel C-ECHO sweep over every configured legacy PACS.
//
// Thales Matheus Mendonça Santos - November 2025

use rayon::prelude::*;
use tracing::info;

use crate::models::RemoteNode;
use crate::router::{LegacyBackend, PacsEcho};

/// Echoes every target on the rayon pool; results keep the input order.
pub fn echo_all<L: LegacyBackend>(backend: &L, targets: Vec<(String, RemoteNode)>) -> Vec<PacsEcho> {
    info!("Verifying {} legacy PACS", targets.len());

    let results: Vec<PacsEcho> = targets
        .into_par_iter()
        .map(|(pacs_id, node)| PacsEcho {
            result: backend.echo(&node),
            pacs_id,
        })
        .collect();

    let reachable = results.iter().filter(|r| r.result.success).count();
    info!("{}/{} PACS answered C-ECHO", reachable, results.len());
    results
}
