//! CLI `warm` command: embed the default corpus and fit the default basis so
//! the first request does not pay for it.

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};

use latentdict::config::AppConfig;
use latentdict::server::build_service;

pub fn warm(config: &AppConfig, refit: bool) -> Result<()> {
    let service = build_service(config)?;
    if refit {
        service.reset_default()?;
        println!("Stored default basis discarded.");
    }
    let words = service.corpus().words();
    let total = words.len();

    println!(
        "Embedding {total} corpus words with model '{}'...",
        service.store().model_id()
    );

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {bar:40.cyan/blue} {pos}/{len} ({eta})")?
            .progress_chars("##-"),
    );

    let batch = config.embedding.batch_size.max(1);
    let mut missing = 0usize;
    for chunk in words.chunks(batch) {
        let embeddings = service.store().get_embeddings(chunk)?;
        missing += embeddings.iter().filter(|e| e.is_none()).count();
        pb.inc(chunk.len() as u64);
    }
    pb.finish_and_clear();

    let projection = service.default_projection()?;

    let stats = service.store().stats();
    tracing::info!(
        hits = stats.hits,
        misses = stats.misses,
        upstream_calls = stats.upstream_calls,
        "corpus warmed"
    );

    println!(
        "Cached {} embeddings ({} already cached, {} without an embedding).",
        total - missing,
        stats.hits,
        missing
    );
    println!("Default basis ready ({} words projected).", projection.len());
    Ok(())
}
