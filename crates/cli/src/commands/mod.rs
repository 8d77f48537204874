//! Subcommand implementations

pub mod generate;
pub mod migrate;
pub mod status;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tidemark_engine::{
    DatabaseConfig, DownPolicy, Environment, FileLoader, LoaderConfig, Manager, PostgresPool,
};

/// Connection and file-location options shared by `migrate` and `status`
#[derive(Debug, Clone, Args)]
pub struct DatabaseArgs {
    /// Service whose database is targeted
    #[arg(long)]
    pub service: String,

    /// Environment: local, development or production
    #[arg(long, default_value = "local")]
    pub env: Environment,

    /// Directory holding `<version>_<description>_<up|down>.sql` files
    #[arg(long, default_value = "config/db/migrations")]
    pub migrations: PathBuf,

    /// Directory holding `<priority>_<name>.sql` files
    #[arg(long, default_value = "config/db/seeds")]
    pub seeds: PathBuf,
}

impl DatabaseArgs {
    pub fn loader_config(&self, down_policy: DownPolicy) -> LoaderConfig {
        LoaderConfig {
            migrations_dir: self.migrations.clone(),
            seeds_dir: self.seeds.clone(),
            down_policy,
        }
    }
}

/// Load files, connect, and register everything on a manager
///
/// Files are loaded before connecting so a malformed file fails the command
/// without touching the database.
pub async fn prepare(
    args: &DatabaseArgs,
    loader_config: &LoaderConfig,
    include_seeds: bool,
) -> Result<(Manager, PostgresPool)> {
    let loader = FileLoader::new(loader_config.down_policy);
    let migrations = loader
        .load_migrations(&loader_config.migrations_dir)
        .context("loading migrations")?;
    let seeds = if include_seeds {
        loader
            .load_seeds(&loader_config.seeds_dir)
            .context("loading seeds")?
    } else {
        Vec::new()
    };

    let config = DatabaseConfig::from_env(args.env, &args.service)
        .context("building database configuration")?;
    tracing::debug!("Database configuration: {:?}", config);

    let pool = PostgresPool::connect(&config)
        .await
        .with_context(|| format!("connecting to {}:{}/{}", config.host, config.port, config.database))?;

    let mut manager = Manager::with_pool(pool.clone());
    manager.add_migrations(migrations)?;
    manager.add_seeds(seeds)?;

    Ok((manager, pool))
}
