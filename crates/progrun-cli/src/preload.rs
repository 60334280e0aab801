//! Preload command implementation for progrun CLI.

use progrun_core::{LanguageRunners, PreloadOptions};

/// Start `backend` and load the requested packages and files.
pub async fn execute(
    runners: &LanguageRunners,
    backend: &str,
    packages: Vec<String>,
    files: Vec<String>,
    context: Option<String>,
) -> anyhow::Result<()> {
    let (package_count, file_count) = (packages.len(), files.len());
    runners
        .preload(
            backend,
            PreloadOptions {
                packages,
                files,
                context_id: context,
            },
        )
        .await?;

    println!("{backend}: loaded {package_count} packages and {file_count} files");
    Ok(())
}
