use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use modlang_core::job::BatchCoordinator;
use modlang_core::jobs::{self, Services};
use modlang_core::{StdoutProgress, TranslatorConfig};

#[derive(Parser)]
#[command(name = "modlang")]
#[command(about = "Retrieval-augmented translation of Minecraft mod language files")]
#[command(version)]
struct Cli {
    /// Configuration file (YAML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract language files from the mod archives
    Extract {
        /// Also read `.lang` files (pre-1.13 layout)
        #[arg(long)]
        legacy_lang: bool,
    },
    /// Merge extracted language files per language
    Merge,
    /// Index the curated map into the term store
    Index {
        /// Discard the existing store first
        #[arg(long)]
        fresh: bool,
        /// Curated map to index instead of the generated one
        #[arg(long)]
        map: Option<PathBuf>,
    },
    /// Extract, merge, derive the curated map and index it
    Prepare {
        #[arg(long)]
        legacy_lang: bool,
    },
    /// Translate a JSON object of untranslated strings
    Translate {
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Translate guide documents
    Guide {
        /// Use the documents already present in the work directory
        #[arg(long)]
        skip_extract: bool,
    },
    /// Translate quest language files (.snbt)
    Quests {
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show the curated entries closest to a query
    Search {
        query: String,
        #[arg(short, default_value_t = 5)]
        k: usize,
    },
    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .or_else(TranslatorConfig::default_path)
        .unwrap_or_else(|| PathBuf::from("config.yaml"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let path = config_path(&cli);
    if let Command::InitConfig { force } = cli.command {
        if path.exists() && !force {
            anyhow::bail!("{} already exists; pass --force to overwrite", path.display());
        }
        let backup = TranslatorConfig::default()
            .to_yaml_file(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        if let Some(backup) = backup {
            info!("previous configuration kept as {}", backup.display());
        }
        println!("wrote {}", path.display());
        return Ok(());
    }

    let config = TranslatorConfig::load_or_default(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    let mut progress = StdoutProgress;

    match cli.command {
        Command::Extract { legacy_lang } => {
            let summary = jobs::extract(&config, legacy_lang)?;
            info!(
                "{} archives: {} source files, {} target files",
                summary.archives, summary.source_files, summary.target_files
            );
        }
        Command::Merge => {
            let (source, target) = jobs::merge(&config)?;
            info!("merged {} source keys and {} target keys", source.keys, target.keys);
        }
        Command::Index { fresh, map } => {
            config.require_provider(false)?;
            let services = Services::from_config(&config)?;
            let map = map.unwrap_or_else(|| config.paths.map_file());
            let summary = jobs::build_index(&config, services.embedder.as_ref(), &map, fresh).await?;
            info!("indexed {} new and {} updated terms", summary.inserted, summary.replaced);
        }
        Command::Prepare { legacy_lang } => {
            config.require_provider(false)?;
            let services = Services::from_config(&config)?;
            let report = jobs::prepare(&config, services.embedder.as_ref(), legacy_lang).await?;
            info!(
                "prepared {} curated terms, {} keys left to translate",
                report.map.curated, report.map.untranslated
            );
        }
        Command::Translate {
            input,
            output,
            chunk_size,
            workers,
        } => {
            config.require_provider(true)?;
            let services = Services::from_config(&config)?;
            let pipeline = jobs::open_pipeline(&config, &services)?;
            let coordinator = BatchCoordinator::new(
                chunk_size.unwrap_or(config.batch.chunk_size),
                workers.unwrap_or(config.batch.workers),
            );
            let input = input.unwrap_or_else(|| config.paths.untranslated_file());
            let output = output.unwrap_or_else(|| config.paths.translated_file());
            jobs::translate_json(pipeline, coordinator, &input, &output, &mut progress).await?;
        }
        Command::Guide { skip_extract } => {
            config.require_provider(true)?;
            let services = Services::from_config(&config)?;
            let pipeline = jobs::open_pipeline(&config, &services)?;
            let report = jobs::translate_guides(&config, pipeline, skip_extract, &mut progress).await?;
            info!(
                "{} guide documents translated, {} already present",
                report.translated, report.skipped_existing
            );
        }
        Command::Quests { input, output } => {
            config.require_provider(true)?;
            let services = Services::from_config(&config)?;
            let pipeline = jobs::open_pipeline(&config, &services)?;
            let input = input.unwrap_or_else(|| config.paths.quest_source_dir(&config.languages.source));
            let output = output.unwrap_or_else(|| config.paths.quest_target_dir(&config.languages.target));
            let written = jobs::translate_quests(&config, pipeline, &input, &output, &mut progress).await?;
            info!("{written} quest files translated");
        }
        Command::Search { query, k } => {
            config.require_provider(false)?;
            let services = Services::from_config(&config)?;
            for entry in jobs::search(&config, services.embedder, &query, k).await? {
                println!("{entry}");
            }
        }
        Command::InitConfig { .. } => {}
    }
    Ok(())
}
