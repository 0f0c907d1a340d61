//! plughost CLI - console host for a hot-swappable plugin

mod cli;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use cli::Cli;
use colored::Colorize;
use plughost_runtime::{FileSettings, HostContext, HostLayout, HostSettings, PluginSettings};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; the console owns stdout
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(run(cli));
    // stdin is read on a blocking thread that never returns on its own
    rt.shutdown_timeout(Duration::from_millis(200));

    if let Err(e) = &result {
        eprintln!("{} {:#}", "✗".red(), e);
    }
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let explicit = cli.config.clone().map(FileSettings::at);
    let preloaded: Option<HostSettings> = explicit
        .as_ref()
        .map(FileSettings::load)
        .transpose()
        .context("failed to load settings")?;

    let dir_name = cli
        .plugins_dir
        .clone()
        .or_else(|| preloaded.as_ref().map(|s| s.plugin.directory.clone()))
        .unwrap_or_else(|| PluginSettings::default().directory);

    let root: PathBuf = match &cli.root {
        Some(root) => root.clone(),
        None => HostLayout::find_root_from_env(&dir_name)?,
    };

    let source = explicit.unwrap_or_else(|| FileSettings::discover(&root));
    let mut settings = match preloaded {
        Some(settings) => settings,
        None => source.load().context("failed to load settings")?,
    };
    settings.plugin.directory = dir_name;
    if let Some(module) = cli.module {
        settings.plugin.module = module;
    }

    let layout = HostLayout::new(
        &root,
        &settings.plugin.directory,
        &settings.plugin.canonical_file_name(),
    )?;

    println!(
        "{} plughost v{} - project root {}",
        "→".green(),
        env!("CARGO_PKG_VERSION"),
        layout.root().display().to_string().cyan()
    );
    match source.path() {
        Some(path) => info!("Settings: {:?}", path),
        None => warn!("No settings file found in {:?}; using defaults", root),
    }

    let host = HostContext::builder(layout)
        .with_plugin_settings(&settings.plugin)
        .with_settings(Arc::new(source))
        .build();

    host.start().await?;

    tokio::select! {
        _ = host.wait_for_exit() => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    host.shutdown().await;
    Ok(())
}
