use std::sync::Arc;
use clap::Parser;
use anyhow::{Context, Result};

use commitwatch::{
    cli::Cli,
    CommitSink, DryRunSink, GitSink, Supervisor,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.setup_logging();

    // Configuration problems are fatal before any directory is watched
    let config = cli.load_config()?;

    let sink: Arc<dyn CommitSink> = if cli.dry_run {
        tracing::info!("Dry run: commits will be logged, not recorded");
        Arc::new(DryRunSink)
    } else {
        Arc::new(GitSink::with_program(&cli.git))
    };

    tracing::info!(
        "Starting commitwatch with {} director(ies), committing after {:?} of quiet",
        config.watch_dirs.len(),
        config.settings.debounce_duration()
    );

    let mut supervisor = Supervisor::start(&config, sink).await?;

    let shutdown = supervisor.shutdown_handle();
    ctrlc::set_handler(move || {
        tracing::info!("Interrupt received, finishing in-flight commits");
        shutdown.trigger();
    })
    .context("Failed to install Ctrl-C handler")?;

    if let Some(mut failures) = supervisor.take_failures() {
        tokio::spawn(async move {
            while let Some(failure) = failures.recv().await {
                tracing::error!(
                    "Could not commit {} file(s) in {} after {} attempt(s): {}; they will be retried with the next change set",
                    failure.paths.len(),
                    failure.base.display(),
                    failure.attempts,
                    failure.error
                );
            }
        });
    }

    supervisor.run().await;
    Ok(())
}
