#![warn(clippy::pedantic)]
#![allow(clippy::collapsible_if)]

use std::{env::args, path::PathBuf};

use anyhow::{Context, anyhow, bail};
use lumen::{
    ProjectConfig, ScriptCache,
    script::check_tree,
    supervisor::{self, is_worker},
};
use nix::sys::signal::Signal;
use utils::trace::init_tracing;

mod routes;
mod server;
mod utils;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> anyhow::Result<()> {
    init_tracing()?;
    if let Err(e) = rlimit::increase_nofile_limit(u64::MAX) {
        tracing::warn!("Failed to raise ulimit: {e}");
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let task = args().nth(1);
    let dir = args().nth(2).map_or_else(|| PathBuf::from("."), PathBuf::from);
    let config = ProjectConfig::load(&dir)
        .with_context(|| format!("load project in {}", dir.display()))?;

    match task.as_deref() {
        None | Some("serve") => {
            if is_worker() {
                server::worker(&config).await
            } else {
                server::supervise(&config).await
            }
        }
        Some("reload") => {
            let pid = supervisor::signal_pid(&config.pid, Signal::SIGHUP)?;
            tracing::info!(pid, "Reload requested");
            Ok(())
        }
        Some("stop") => {
            let pid = supervisor::signal_pid(&config.pid, Signal::SIGTERM)?;
            tracing::info!(pid, "Stop requested");
            Ok(())
        }
        Some("check") => check(&config),
        Some(other) => Err(anyhow!("unknown task {other:?}")),
    }
}

fn check(config: &ProjectConfig) -> anyhow::Result<()> {
    let cache = ScriptCache::new()?;
    let failures = check_tree(&cache, &config.root)?;
    for err in &failures {
        tracing::error!("{err}");
    }
    if !failures.is_empty() {
        bail!("{} script(s) failed to compile", failures.len());
    }
    Ok(())
}
