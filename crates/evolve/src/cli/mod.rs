mod migrate;

pub use migrate::MigrateCommand;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// EVOLVE - dependency-ordered schema migrations
#[derive(Parser)]
#[command(name = "evolve")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Manage database migrations.
    Migrate(MigrateCommand),
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Migrate(cmd) => cmd.execute().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migrate::MigrateAction;

    #[test]
    fn test_cli_parse_defaults() {
        let cli = Cli::try_parse_from(["evolve", "migrate", "up"]).unwrap();
        let Commands::Migrate(cmd) = cli.command;
        assert!(matches!(cmd.action, MigrateAction::Up));
        assert_eq!(cmd.config, "evolve.toml");
        assert_eq!(cmd.migrations_dir, None);
    }

    #[test]
    fn test_cli_parse_global_flags_after_action() {
        let cli = Cli::try_parse_from([
            "evolve",
            "migrate",
            "status",
            "--config",
            "deploy/evolve.toml",
            "--migrations-dir",
            "db/steps",
        ])
        .unwrap();
        let Commands::Migrate(cmd) = cli.command;
        assert!(matches!(cmd.action, MigrateAction::Status));
        assert_eq!(cmd.config, "deploy/evolve.toml");
        assert_eq!(cmd.migrations_dir.as_deref(), Some("db/steps"));
    }

    #[test]
    fn test_cli_parse_plan() {
        let cli = Cli::try_parse_from(["evolve", "migrate", "plan"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_rejects_unknown_action() {
        assert!(Cli::try_parse_from(["evolve", "migrate", "down"]).is_err());
    }
}
