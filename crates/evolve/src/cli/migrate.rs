use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use evolve_core::config::{BackendKind, EvolveConfig, LoggingConfig};
use evolve_core::migration::MigrationStep;
use evolve_runtime::migrations::{
    load_steps_from_dir, MemoryBackend, MigrationApplier, PgBackend, SchemaBackend,
};

/// Manage database migrations.
#[derive(Parser)]
pub struct MigrateCommand {
    #[command(subcommand)]
    pub action: MigrateAction,

    /// Configuration file path.
    #[arg(short, long, default_value = "evolve.toml", global = true)]
    pub config: String,

    /// Migrations directory path (overrides `[migrations] dir`).
    #[arg(short, long, global = true)]
    pub migrations_dir: Option<String>,
}

#[derive(Subcommand)]
pub enum MigrateAction {
    /// Apply all pending migrations.
    Up,

    /// Show applied, pending and failed migrations.
    Status,

    /// Print the order pending migrations would be applied in.
    Plan,
}

impl MigrateCommand {
    pub async fn execute(self) -> Result<()> {
        // Load .env if present
        dotenvy::dotenv().ok();

        let config = load_config(Path::new(&self.config))?;
        init_tracing(&config.logging);

        let migrations_dir = self.steps_dir(&config);
        let steps = load_steps_from_dir(&migrations_dir)?;
        tracing::debug!(
            "Loaded {} migration steps from {}",
            steps.len(),
            migrations_dir.display()
        );

        let backend = connect(&config).await?;
        let applier = MigrationApplier::from_config(backend, &config);

        print_header(match self.action {
            MigrateAction::Up => "Migrations",
            MigrateAction::Status => "Migration Status",
            MigrateAction::Plan => "Migration Plan",
        });

        if steps.is_empty() {
            println!(
                "  {} No migrations found in {}",
                style("ℹ").blue(),
                migrations_dir.display()
            );
            println!();
            return Ok(());
        }

        match self.action {
            MigrateAction::Up => up(&applier, &steps).await,
            MigrateAction::Status => status(&applier, &steps).await,
            MigrateAction::Plan => plan(&applier, &steps).await,
        }
    }

    fn steps_dir(&self, config: &EvolveConfig) -> PathBuf {
        PathBuf::from(
            self.migrations_dir
                .as_deref()
                .unwrap_or(config.migrations.dir.as_str()),
        )
    }
}

/// Read the config file, falling back to `DATABASE_URL` when there is none.
fn load_config(path: &Path) -> Result<EvolveConfig> {
    if path.exists() {
        return Ok(EvolveConfig::from_file(path)?);
    }
    match std::env::var("DATABASE_URL") {
        Ok(url) if !url.is_empty() => Ok(EvolveConfig::default_with_database_url(&url)),
        _ => anyhow::bail!(
            "Configuration file not found: {}\nCreate one or set DATABASE_URL.",
            path.display()
        ),
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| logging.level.clone());
    if logging.json_format {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn connect(config: &EvolveConfig) -> Result<Arc<dyn SchemaBackend>> {
    let backend: Arc<dyn SchemaBackend> = match config.migrations.backend {
        BackendKind::Postgres => {
            let backend = PgBackend::connect(&config.database).await?;
            tracing::info!("Connected to database");
            Arc::new(backend)
        }
        BackendKind::Memory => {
            tracing::warn!("Using the in-memory backend; changes are not persisted");
            Arc::new(MemoryBackend::new())
        }
    };
    Ok(backend)
}

fn print_header(title: &str) {
    println!();
    println!("  {} {}", style("EVOLVE").bold().cyan(), title);
    println!();
}

async fn up(applier: &MigrationApplier, steps: &[MigrationStep]) -> Result<()> {
    println!("  {} Running pending migrations...", style("→").dim());
    let outcome = applier.execute(steps).await;

    for key in &outcome.report.applied {
        println!("  {} Applied: {}", style("✓").green(), style(key).cyan());
    }

    if let Err(e) = outcome.result {
        if let Some(key) = outcome.report.failed() {
            println!("  {} Failed: {}", style("✗").red(), style(key).red());
        }
        let pending = outcome.report.pending();
        if !pending.is_empty() {
            println!(
                "  {} {} migration(s) not attempted",
                style("ℹ").blue(),
                pending.len()
            );
        }
        println!();
        return Err(e.into());
    }

    if outcome.report.applied.is_empty() {
        println!("  {} Already up to date", style("✓").green());
    } else {
        println!(
            "  {} {} applied, {} already applied",
            style("✓").green(),
            outcome.report.applied.len(),
            outcome.report.skipped.len()
        );
    }
    println!();
    Ok(())
}

async fn status(applier: &MigrationApplier, steps: &[MigrationStep]) -> Result<()> {
    let status = applier.status(steps).await?;

    if !status.applied.is_empty() {
        println!("  {} Applied:", style("✓").green());
        for m in &status.applied {
            let marker = if status.drifted.contains(&m.key) {
                style("!").red().to_string()
            } else if status.unknown.contains(&m.key) {
                style("?").yellow().to_string()
            } else {
                style("-").dim().to_string()
            };
            println!(
                "    {} {} {} ({})",
                marker,
                style(&m.key).cyan(),
                style("at").dim(),
                m.applied_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    if !status.pending.is_empty() {
        if !status.applied.is_empty() {
            println!();
        }
        println!("  {} Pending:", style("○").yellow());
        for key in &status.pending {
            let failure = status.failed.iter().find(|f| &f.key == key);
            match failure {
                Some(f) => println!(
                    "    {} {} {}",
                    style("✗").red(),
                    style(key).red(),
                    style(&f.error).dim()
                ),
                None => println!("    {} {}", style("→").dim(), style(key).yellow()),
            }
        }
    }

    println!();
    println!(
        "  {} {} applied, {} pending, {} failed",
        style("ℹ").blue(),
        status.applied.len(),
        status.pending.len(),
        status.failed.len()
    );
    println!();

    if !status.drifted.is_empty() || !status.unknown.is_empty() {
        println!(
            "  {} = changed since applied, {} = no longer defined",
            style("!").red(),
            style("?").yellow()
        );
        println!();
    }
    Ok(())
}

async fn plan(applier: &MigrationApplier, steps: &[MigrationStep]) -> Result<()> {
    let pending = applier.plan(steps).await?;
    if pending.is_empty() {
        println!("  {} Nothing to apply", style("✓").green());
        println!();
        return Ok(());
    }

    for (i, key) in pending.iter().enumerate() {
        println!("  {:>3}. {}", i + 1, style(key).cyan());
        if let Some(step) = steps.iter().find(|s| &s.key == key) {
            for op in &step.operations {
                println!("       {} {}", style("·").dim(), op.describe());
            }
        }
    }
    println!();
    Ok(())
}
