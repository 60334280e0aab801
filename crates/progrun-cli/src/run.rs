//! Run command implementation for progrun CLI.
//!
//! Loads each block file, runs the blocks in one session and prints the
//! results as a JSON array.

use std::path::{Path, PathBuf};

use anyhow::Context;
use progrun_core::{LanguageRunners, PreloadOptions, RunResult};

/// Run the code in `block_files` on `backend`.
pub async fn execute(
    runners: &LanguageRunners,
    backend: &str,
    context: Option<String>,
    files: Vec<String>,
    packages: Vec<String>,
    block_files: &[PathBuf],
) -> anyhow::Result<()> {
    let codes = read_blocks(block_files)?;

    if !files.is_empty() || !packages.is_empty() {
        runners
            .preload(
                backend,
                PreloadOptions {
                    packages,
                    files,
                    context_id: context.clone(),
                },
            )
            .await?;
    }

    let results = runners.run_code(backend, &codes, context.as_deref()).await;
    println!("{}", render(&results)?);

    let failed = results.iter().filter(|r| !r.success).count();
    if failed > 0 {
        tracing::warn!("{failed} of {} blocks failed", results.len());
    }
    Ok(())
}

fn read_blocks(paths: &[PathBuf]) -> anyhow::Result<Vec<String>> {
    paths.iter().map(|path| read_block(path)).collect()
}

fn read_block(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("failed to read code block {}", path.display()))
}

fn render(results: &[RunResult]) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(results)?)
}
