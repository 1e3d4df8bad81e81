//! artcache operator CLI
//!
//! Boots the cache core against a cache root and drives it through the same
//! public API an RPC transport would: adding images by URI or payload,
//! looking entries up, deleting keys, and running maintenance.

mod cli;
mod commands;

use crate::cli::{Cli, Commands};
use crate::commands::App;
use artcache_core::config::{self, CacheLimits};
use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    init_tracing(&cli.level);

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:?}");
            std::process::exit(commands::EXIT_FAILURE);
        }
    }
}

fn run(cli: Cli) -> miette::Result<i32> {
    let root = match cli.root {
        Some(root) => root,
        None => config::default_cache_root().into_diagnostic()?,
    };

    let limits = CacheLimits {
        keys: cli.max_keys,
        sources: cli.max_sources,
        objects: cli.max_objects,
    };

    let app = App::boot(root, limits)?;

    let code = match cli.command {
        Commands::Stats => app.stats(cli.json),
        Commands::Gc => app.gc(cli.json),
        Commands::AddUri { key, priority, uri } => app.add_uri(&key, priority, &uri)?,
        Commands::AddData {
            key,
            priority,
            file,
        } => app.add_data(&key, priority, &file)?,
        Commands::Get {
            key,
            format,
            priority,
            known_hash,
            output,
        } => app.get(&key, &format, priority, &known_hash, output.as_ref(), cli.json)?,
        Commands::Delete { key, priority } => app.delete(&key, priority)?,
    };

    app.shutdown();

    Ok(code)
}

/// Initialize tracing with `RUST_LOG` taking precedence over `--level`
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_owned()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
