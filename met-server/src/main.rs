//! `met-server`: forks the declared child controllers, runs the initial
//! readiness barrier, then hands off to the signal router until an
//! accepted `mquit` or an unrecoverable error (spec §4, §6).

mod clock;
mod config;
mod lifecycle;
mod router;
mod trial_index;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use config::{Cli, LaunchConfig};
use lifecycle::Resources;
use met_proto::ErrorAccumulator;
use router::Router;
use trial_index::TrialIndexFile;

/// Path to the externally maintained trial-index file (spec §6). Not a
/// CLI argument: the embedding session-management tooling owns it and
/// is expected to place it at a well-known location relative to the
/// working directory the server is launched from.
const TRIAL_INDEX_PATH: &str = "trial_index";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let exit_kind = match run() {
        Ok(kind) => kind,
        Err(e) => {
            tracing::error!(error = ?e, "met-server failed before launch completed");
            met_proto::MetError::Syser
        }
    };
    std::process::exit(exit_kind.kind() as i32);
}

fn run() -> Result<met_proto::MetError> {
    let cli = Cli::parse();
    let config = LaunchConfig::from_cli(&cli).context("invalid launch configuration")?;

    let mut errors = ErrorAccumulator::new();

    let resources = Resources::create(&config).context("failed to create IPC resources")?;
    let children = lifecycle::spawn_children(&config, &resources).context("failed to fork/exec children")?;

    if let Err(e) = lifecycle::initial_ready_barrier(&resources, &children) {
        errors.record(e);
        lifecycle::unlink_shm(&resources);
        lifecycle::shutdown(&resources, &children, errors.get());
        return Ok(errors.get());
    }

    lifecycle::unlink_shm(&resources);

    if let Err(e) = lifecycle::broadcast_init(&resources) {
        errors.record(e);
        lifecycle::shutdown(&resources, &children, errors.get());
        return Ok(errors.get());
    }

    let trial_index = TrialIndexFile::new(PathBuf::from(TRIAL_INDEX_PATH));
    let mut router = Router::new(resources.request_server_fds(), resources.broadcast_server_fds(), trial_index)
        .context("failed to start router")?;
    let final_kind = router.run();
    errors.record(final_kind);

    lifecycle::shutdown(&resources, &children, errors.get());
    Ok(errors.get())
}
