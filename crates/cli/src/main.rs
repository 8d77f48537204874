mod commands;
mod logging;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::generate::GenerateArgs;
use commands::migrate::MigrateArgs;
use commands::status::StatusArgs;
use logging::{LogFormat, LoggingConfig};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Parser)]
#[command(name = "tidemark")]
#[command(about = "Ordered, at-most-once schema migrations and data seeds")]
#[command(version)]
struct Cli {
    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending migrations, then pending seeds
    Migrate(MigrateArgs),

    /// Show which migrations and seeds are applied
    Status(StatusArgs),

    /// Scaffold a new migration or seed file
    Generate(GenerateArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init_logging(&LoggingConfig::new(cli.log_level.clone(), cli.log_format))
        .map_err(|e| anyhow::anyhow!("initializing logging: {}", e))?;

    let ctx = CancellationToken::new();
    spawn_interrupt_handler(ctx.clone());

    match cli.command {
        Commands::Migrate(args) => commands::migrate::run(args, &ctx).await?,
        Commands::Status(args) => commands::status::run(args, &ctx).await?,
        Commands::Generate(args) => {
            commands::generate::run(args)?;
        }
    }

    Ok(())
}

/// Cancel in-flight store calls on Ctrl-C
fn spawn_interrupt_handler(ctx: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            ctx.cancel();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tidemark_engine::Environment;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_migrate_defaults() {
        let cli = Cli::try_parse_from(["tidemark", "migrate", "--service", "billing"]).unwrap();

        match cli.command {
            Commands::Migrate(args) => {
                assert_eq!(args.database.service, "billing");
                assert_eq!(args.database.env, Environment::Local);
                assert_eq!(args.database.migrations.to_str(), Some("config/db/migrations"));
                assert_eq!(args.database.seeds.to_str(), Some("config/db/seeds"));
                assert!(!args.skip_seeds);
                assert!(!args.require_down);
            }
            _ => panic!("Expected migrate command"),
        }
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn test_global_flags_and_environment_alias() {
        let cli = Cli::try_parse_from([
            "tidemark",
            "status",
            "--service",
            "billing",
            "--env",
            "prod",
            "--log-format",
            "json",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert_eq!(cli.log_level, "debug");
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Commands::Status(args) => assert_eq!(args.database.env, Environment::Production),
            _ => panic!("Expected status command"),
        }
    }

    #[test]
    fn test_rejects_unknown_environment_and_missing_service() {
        assert!(Cli::try_parse_from(["tidemark", "migrate", "--service", "a", "--env", "staging"]).is_err());
        assert!(Cli::try_parse_from(["tidemark", "migrate"]).is_err());
        assert!(Cli::try_parse_from(["tidemark", "generate", "--type", "index", "--name", "x"]).is_err());
    }
}
