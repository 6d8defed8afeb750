//! CLI `project` command: one-shot projection printed as JSON.

use std::collections::HashSet;

use anyhow::{Context, Result};
use latentdict::config::AppConfig;
use latentdict::projection::{Projection, ProjectionRequest};
use latentdict::server::build_service;

pub struct ProjectArgs {
    pub words: Vec<String>,
    pub fit: Vec<String>,
    pub basis: Option<String>,
    pub reset: bool,
}

/// Project `args.words` and print `{"vectors": ..., "pca_id": ...}` to stdout.
pub fn project(config: &AppConfig, args: ProjectArgs) -> Result<()> {
    let service = build_service(config)?;

    let request = ProjectionRequest {
        target_words: args.words,
        fit_words: (!args.fit.is_empty()).then_some(args.fit),
        basis_id: args.basis,
        reset: args.reset,
    };

    let projection = service.project(&request)?;
    let json = serde_json::to_string_pretty(&projection).context("failed to serialize projection")?;
    println!("{json}");

    let missing = omitted(&request.target_words, &projection);
    if missing > 0 {
        eprintln!("{missing} word(s) had no embedding and were omitted.");
    }
    Ok(())
}

/// Distinct requested words (case-insensitive) missing from the projection.
fn omitted(words: &[String], projection: &Projection) -> usize {
    let requested: HashSet<String> = words.iter().map(|w| w.to_lowercase()).collect();
    requested
        .iter()
        .filter(|w| projection.get(w).is_none())
        .count()
}
