use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use tidemark_engine::migrations::scaffold;
use tidemark_engine::LoaderConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GenerateKind {
    Migration,
    Seed,
}

#[derive(Debug, Clone, Args)]
pub struct GenerateArgs {
    /// What to scaffold
    #[arg(long = "type", value_enum)]
    pub kind: GenerateKind,

    /// Name of the migration or seed; spaces become underscores
    #[arg(long)]
    pub name: String,

    /// Target directory; defaults to config/db/migrations or config/db/seeds
    #[arg(long)]
    pub dir: Option<PathBuf>,
}

/// Scaffold empty files prefixed with the current Unix timestamp
pub fn run(args: GenerateArgs) -> Result<Vec<PathBuf>> {
    let defaults = LoaderConfig::default();
    let timestamp = scaffold::timestamp_prefix();

    let created = match args.kind {
        GenerateKind::Migration => {
            let dir = args.dir.unwrap_or(defaults.migrations_dir);
            let (up, down) = scaffold::create_migration_files(&dir, &args.name, timestamp)
                .with_context(|| format!("creating migration files in {}", dir.display()))?;
            vec![up, down]
        }
        GenerateKind::Seed => {
            let dir = args.dir.unwrap_or(defaults.seeds_dir);
            let path = scaffold::create_seed_file(&dir, &args.name, timestamp)
                .with_context(|| format!("creating seed file in {}", dir.display()))?;
            vec![path]
        }
    };

    for path in &created {
        println!("Created {}", path.display());
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_migration_pair() {
        let dir = TempDir::new().unwrap();
        let created = run(GenerateArgs {
            kind: GenerateKind::Migration,
            name: "Add Orders".to_string(),
            dir: Some(dir.path().to_path_buf()),
        })
        .unwrap();

        assert_eq!(created.len(), 2);
        let up = created[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(up.ends_with("_add_orders_up.sql"));
        assert!(created.iter().all(|p| p.exists()));
    }
}
