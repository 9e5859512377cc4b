//! # Gallery Sync CLI (`gsync`)
//!
//! Normalizes local photo folders, uploads them to the hosted image CDN,
//! reconciles the remote folders, and rewrites the gallery manifests.
//!
//! ## Usage
//!
//! ```bash
//! gsync --config ./config/gsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `gsync sync` | Full pipeline for all (or selected) galleries |
//! | `gsync retry <slug>...` | Upload only what the remote listing lacks, throttled |
//! | `gsync normalize` | Scan and normalize only; no network, no credentials |
//! | `gsync purge <slug>` | Delete a gallery's remote folder (or only stale assets) |
//! | `gsync galleries` | List configured galleries and their source status |
//! | `gsync completions <shell>` | Print shell completions |
//!
//! ## Exit codes
//!
//! `0` when the run completed, even if individual files failed (they are
//! listed in the summary). `1` on configuration errors: unreadable config,
//! missing credentials, or a missing source folder of a `required` gallery.

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gallery_sync::config::{self, Credentials};
use gallery_sync::galleries;
use gallery_sync::pipeline::{self, Pipeline, RunOptions};
use gallery_sync::progress::ProgressMode;
use gallery_sync::report;
use gallery_sync::store::cloudinary::CloudinaryStore;

/// Gallery Sync: keep CDN-hosted photo galleries in step with local folders.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/gsync.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "gsync",
    about = "Normalize, upload, and reconcile photo galleries against a hosted image CDN",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/gsync.toml")]
    config: PathBuf,

    /// Progress output on stderr. `auto` shows human progress on a TTY.
    #[arg(long, global = true, value_enum, default_value_t = ProgressArg::Auto)]
    progress: ProgressArg,

    /// Enable debug logging (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProgressArg {
    Auto,
    Human,
    Json,
    Off,
}

impl ProgressArg {
    fn mode(self) -> ProgressMode {
        match self {
            ProgressArg::Auto => ProgressMode::default_for_tty(),
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
            ProgressArg::Off => ProgressMode::Off,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline: scan, normalize, upload, reconcile, write manifests.
    Sync {
        /// Only these galleries (repeatable). Defaults to all.
        #[arg(long = "gallery", value_name = "SLUG")]
        galleries: Vec<String>,

        /// Plan only: no local writes and no mutating remote calls.
        #[arg(long)]
        dry_run: bool,

        /// Skip scan/normalize/upload; re-list remote folders and rewrite manifests.
        #[arg(long)]
        sync_only: bool,

        /// Re-normalize even when an up-to-date scratch file exists.
        #[arg(long)]
        force: bool,

        /// Upload one file at a time with `upload.throttle_delay_ms` between calls.
        #[arg(long)]
        throttle: bool,

        /// Also write the run summary as JSON to this path.
        #[arg(long, value_name = "PATH")]
        report: Option<PathBuf>,
    },

    /// Upload only the files missing remotely, one at a time, then rewrite manifests.
    Retry {
        /// Galleries to retry.
        #[arg(required = true, value_name = "SLUG")]
        galleries: Vec<String>,

        /// Show what would be uploaded without uploading.
        #[arg(long)]
        dry_run: bool,

        /// Also write the run summary as JSON to this path.
        #[arg(long, value_name = "PATH")]
        report: Option<PathBuf>,
    },

    /// Scan and normalize into the scratch directory. Needs no credentials.
    Normalize {
        #[arg(long = "gallery", value_name = "SLUG")]
        galleries: Vec<String>,

        #[arg(long)]
        force: bool,
    },

    /// Delete a gallery's remote folder, or only assets with no local file.
    Purge {
        gallery: String,

        /// Delete only remote assets that no longer exist locally.
        #[arg(long)]
        stale_only: bool,

        #[arg(long)]
        dry_run: bool,
    },

    /// List configured galleries and whether their source folders exist.
    Galleries,

    /// Print shell completions to stdout.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "gsync", &mut std::io::stdout());
        return Ok(());
    }

    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;
    let progress = cli.progress.mode().reporter();

    match cli.command {
        Commands::Galleries => {
            galleries::list_galleries(&cfg)?;
        }
        Commands::Normalize { galleries, force } => {
            let selected = cfg.select_galleries(&galleries)?;
            let summary =
                pipeline::run_normalize_only(&cfg, &selected, force, progress.as_ref()).await?;
            print!("{}", report::render_run(&summary));
        }
        Commands::Sync {
            galleries,
            dry_run,
            sync_only,
            force,
            throttle,
            report: report_path,
        } => {
            let selected = cfg.select_galleries(&galleries)?;
            let creds = Credentials::from_env(&cfg.remote)?;
            let store = CloudinaryStore::new(&creds, &cfg.remote)?;
            let options = RunOptions {
                dry_run,
                sync_only,
                force,
                throttle,
            };

            let summary = Pipeline::new(&cfg, &store, progress.as_ref(), options)
                .run(&selected)
                .await?;
            print!("{}", report::render_run(&summary));
            if let Some(path) = report_path {
                report::write_report(&path, &summary)?;
            }
        }
        Commands::Retry {
            galleries,
            dry_run,
            report: report_path,
        } => {
            let selected = cfg.select_galleries(&galleries)?;
            let creds = Credentials::from_env(&cfg.remote)?;
            let store = CloudinaryStore::new(&creds, &cfg.remote)?;
            let options = RunOptions {
                dry_run,
                throttle: true,
                ..RunOptions::default()
            };

            let summary = Pipeline::new(&cfg, &store, progress.as_ref(), options)
                .retry(&selected)
                .await?;
            print!("{}", report::render_run(&summary));
            if let Some(path) = report_path {
                report::write_report(&path, &summary)?;
            }
        }
        Commands::Purge {
            gallery,
            stale_only,
            dry_run,
        } => {
            let selected = cfg.select_galleries(std::slice::from_ref(&gallery))?;
            let creds = Credentials::from_env(&cfg.remote)?;
            let store = CloudinaryStore::new(&creds, &cfg.remote)?;
            let options = RunOptions {
                dry_run,
                ..RunOptions::default()
            };

            let pipeline = Pipeline::new(&cfg, &store, progress.as_ref(), options);
            for g in &selected {
                let summary = pipeline.purge(g, stale_only).await?;
                print!("{}", report::render_purge(&summary));
            }
        }
        Commands::Completions { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
