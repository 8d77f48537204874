use anyhow::{Context, Result};
use clap::Args;
use tidemark_engine::{DownPolicy, UnitStatus};
use tokio_util::sync::CancellationToken;

use super::{prepare, DatabaseArgs};

#[derive(Debug, Clone, Args)]
pub struct StatusArgs {
    #[command(flatten)]
    pub database: DatabaseArgs,
}

/// Print applied and pending units
pub async fn run(args: StatusArgs, ctx: &CancellationToken) -> Result<()> {
    let loader_config = args.database.loader_config(DownPolicy::Optional);
    let (manager, pool) = prepare(&args.database, &loader_config, true).await?;

    let result = async {
        let migrations = manager
            .migration_status(ctx)
            .await
            .context("reading migration status")?;
        let seeds = manager
            .seed_status(ctx)
            .await
            .context("reading seed status")?;

        println!("Migrations:");
        print_status(&migrations);
        println!("Seeds:");
        print_status(&seeds);
        Ok::<_, anyhow::Error>(())
    }
    .await;

    pool.close().await;
    result
}

fn print_status(units: &[UnitStatus]) {
    if units.is_empty() {
        println!("  (none)");
        return;
    }

    for status in units {
        println!("  {}", format_status(status));
    }
}

fn format_status(status: &UnitStatus) -> String {
    match (status.applied, status.applied_at) {
        (true, Some(at)) => format!("[applied {}] {}", at.format("%Y-%m-%d %H:%M:%S UTC"), status.unit),
        (true, None) => format!("[applied] {}", status.unit),
        (false, _) => format!("[pending] {}", status.unit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tidemark_engine::UnitId;

    #[test]
    fn test_format_status() {
        let unit = UnitId::Migration {
            version: 1,
            description: "init".to_string(),
        };

        let applied = UnitStatus {
            unit: unit.clone(),
            applied: true,
            applied_at: Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()),
        };
        assert_eq!(
            format_status(&applied),
            "[applied 2024-03-01 12:00:00 UTC] migration 1 (init)"
        );

        let pending = UnitStatus {
            unit,
            applied: false,
            applied_at: None,
        };
        assert_eq!(format_status(&pending), "[pending] migration 1 (init)");
    }
}
