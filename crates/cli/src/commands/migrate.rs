use anyhow::{Context, Result};
use clap::Args;
use tidemark_engine::{DownPolicy, RunSummary};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{prepare, DatabaseArgs};

#[derive(Debug, Clone, Args)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub database: DatabaseArgs,

    /// Run migrations only
    #[arg(long)]
    pub skip_seeds: bool,

    /// Reject migrations that have no down file
    #[arg(long)]
    pub require_down: bool,
}

impl MigrateArgs {
    fn down_policy(&self) -> DownPolicy {
        if self.require_down {
            DownPolicy::Required
        } else {
            DownPolicy::Optional
        }
    }
}

/// Apply pending migrations, then pending seeds
pub async fn run(args: MigrateArgs, ctx: &CancellationToken) -> Result<()> {
    let loader_config = args.database.loader_config(args.down_policy());
    let (manager, pool) = prepare(&args.database, &loader_config, !args.skip_seeds).await?;

    let result = async {
        let migrations = manager
            .run_migrations(ctx)
            .await
            .context("running migrations")?;
        report("migrations", &migrations);

        if !args.skip_seeds {
            let seeds = manager.run_seeds(ctx).await.context("running seeds")?;
            report("seeds", &seeds);
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    pool.close().await;
    result
}

fn report(kind: &str, summary: &RunSummary) {
    info!(
        "Applied {} {} ({} already applied) in {}ms",
        summary.applied_count(),
        kind,
        summary.skipped,
        summary.execution_time_ms
    );

    if summary.applied.is_empty() {
        println!("No pending {}", kind);
    } else {
        for unit in &summary.applied {
            println!("Applied {}", unit);
        }
    }
}
