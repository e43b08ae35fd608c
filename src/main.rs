//! nunja CLI - inspect a directory of molds

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;

use nunja::error::{FixSuggestion, NunjaError};
use nunja::{BehaviorRegistry, Engine, EngineConfig, FsFetcher, Loader, Registry};

#[derive(Parser)]
#[command(name = "nunja")]
#[command(about = "nunja - progressive-enhancement mold binding engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile every mold found in a directory
    Check {
        /// Directory holding one mold per subdirectory
        dir: PathBuf,

        /// Prefix for the registered mold ids
        #[arg(short, long, default_value = "_")]
        prefix: String,

        /// Engine configuration (YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the registry as JSON
    Export {
        /// Directory holding one mold per subdirectory
        dir: PathBuf,

        /// Prefix for the registered mold ids
        #[arg(short, long, default_value = "_")]
        prefix: String,

        /// Export template file lists instead of mold locations
        #[arg(long)]
        templates: bool,
    },
}

#[tokio::main]
async fn main() {
    // Load .env file (ignore if not present)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Check {
            dir,
            prefix,
            config,
        } => check_molds(&dir, &prefix, config.as_deref()).await,
        Commands::Export {
            dir,
            prefix,
            templates,
        } => export_registry(&dir, &prefix, templates),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        if let Some(suggestion) = e.fix_suggestion() {
            eprintln!("  {} {}", "Fix:".yellow(), suggestion);
        }
        std::process::exit(1);
    }
}

fn build_registry(dir: &Path, prefix: &str, config: &EngineConfig) -> Result<Registry, NunjaError> {
    let mut registry = Registry::new(dir.display().to_string());
    registry.register_directory(dir, prefix, &config.required_template_name)?;
    Ok(registry)
}

async fn check_molds(dir: &Path, prefix: &str, config: Option<&Path>) -> Result<(), NunjaError> {
    let config = match config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    let registry = Arc::new(build_registry(dir, prefix, &config)?);
    let mold_ids: Vec<String> = registry
        .molds()
        .map(|(id, _)| id.to_string())
        .filter(|id| *id != config.wrapper_mold_id)
        .collect();

    let loader = Loader::new(registry, Arc::new(FsFetcher::new()));
    let engine = Engine::new(config, loader, BehaviorRegistry::new())?;
    engine.ready().await?;

    let mut first_error = None;
    for mold_id in &mold_ids {
        match engine.load_template(mold_id).await {
            Ok(_) => println!("{} {}", "✓".green(), mold_id),
            Err(e) => {
                println!("{} {}: {}", "✗".red(), mold_id, e);
                first_error.get_or_insert(e);
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }

    println!(
        "{} {} mold(s) compiled from '{}'",
        "→".cyan(),
        mold_ids.len(),
        dir.display()
    );
    Ok(())
}

fn export_registry(dir: &Path, prefix: &str, templates: bool) -> Result<(), NunjaError> {
    let registry = build_registry(dir, prefix, &EngineConfig::default())?;
    let exported = if templates {
        registry.export_template_paths()
    } else {
        registry.export_paths()
    };
    let text = serde_json::to_string_pretty(&exported)
        .map_err(|e| NunjaError::Config(e.to_string()))?;
    println!("{text}");
    Ok(())
}
