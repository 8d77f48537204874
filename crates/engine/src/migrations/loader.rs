//! File Loader - Builds migrations and seeds from SQL files
//!
//! Migration files are named `<version>_<description>_<up|down>.sql`; the up
//! and down files of one version merge into a single [`Migration`]. Seed files
//! are named `<priority>_<name>.sql` and run their content as one script.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::definitions::{Migration, Seed};
use crate::config::DownPolicy;
use crate::error::{MigrationError, MigrationResult};

#[derive(Debug, Default)]
struct PendingMigration {
    description: String,
    up: Option<String>,
    down: Option<String>,
    first_path: PathBuf,
}

/// Loads migrations and seeds from directories of `.sql` files
#[derive(Debug, Clone, Default)]
pub struct FileLoader {
    down_policy: DownPolicy,
}

impl FileLoader {
    pub fn new(down_policy: DownPolicy) -> Self {
        Self { down_policy }
    }

    pub fn down_policy(&self) -> DownPolicy {
        self.down_policy
    }

    /// Load every migration in `dir`, sorted by version
    pub fn load_migrations(&self, dir: impl AsRef<Path>) -> MigrationResult<Vec<Migration>> {
        let mut pending: BTreeMap<u32, PendingMigration> = BTreeMap::new();

        for (path, stem) in sql_files(dir.as_ref())? {
            let parts: Vec<&str> = stem.split('_').collect();
            if parts.len() < 3 {
                return Err(MigrationError::load(
                    &path,
                    "migration filename must follow <version>_<description>_<up|down>.sql",
                ));
            }

            let version = parse_version(&path, parts[0])?;
            let description = parts[1..parts.len() - 1].join("_");
            let is_up = match parts[parts.len() - 1] {
                "up" => true,
                "down" => false,
                other => {
                    return Err(MigrationError::load(
                        &path,
                        format!("expected direction 'up' or 'down', found '{}'", other),
                    ))
                }
            };

            let content = read_file(&path)?;
            let entry = pending.entry(version).or_insert_with(|| PendingMigration {
                description: description.clone(),
                first_path: path.clone(),
                ..Default::default()
            });

            if entry.description != description {
                return Err(MigrationError::load(
                    &path,
                    format!(
                        "version {} is described as '{}' in {}",
                        version,
                        entry.description,
                        entry.first_path.display()
                    ),
                ));
            }

            let slot = if is_up { &mut entry.up } else { &mut entry.down };
            if slot.is_some() {
                return Err(MigrationError::load(
                    &path,
                    format!("duplicate {} file for version {}", if is_up { "up" } else { "down" }, version),
                ));
            }
            *slot = Some(content);
        }

        let mut migrations = Vec::with_capacity(pending.len());
        for (version, entry) in pending {
            let up = entry.up.ok_or_else(|| {
                MigrationError::load(
                    &entry.first_path,
                    format!("version {} has a down file but no up file", version),
                )
            })?;

            if entry.down.is_none() && self.down_policy == DownPolicy::Required {
                return Err(MigrationError::load(
                    &entry.first_path,
                    format!("version {} has no down file", version),
                ));
            }

            migrations.push(Migration {
                version,
                description: entry.description,
                up,
                down: entry.down,
            });
        }

        debug!("Loaded {} migrations from {}", migrations.len(), dir.as_ref().display());
        Ok(migrations)
    }

    /// Load every seed in `dir`, in filename order
    pub fn load_seeds(&self, dir: impl AsRef<Path>) -> MigrationResult<Vec<Seed>> {
        let mut seeds: Vec<Seed> = Vec::new();

        for (path, stem) in sql_files(dir.as_ref())? {
            let Some((priority, name)) = stem.split_once('_') else {
                return Err(MigrationError::load(
                    &path,
                    "seed filename must follow <priority>_<name>.sql",
                ));
            };

            let priority: i64 = priority.parse().map_err(|_| {
                MigrationError::load(&path, format!("invalid seed priority '{}'", priority))
            })?;

            if name.is_empty() {
                return Err(MigrationError::load(&path, "seed name is empty"));
            }
            if seeds.iter().any(|s| s.name == name) {
                return Err(MigrationError::load(&path, format!("duplicate seed name '{}'", name)));
            }

            let content = read_file(&path)?;
            seeds.push(Seed::sql(name, priority, content));
        }

        debug!("Loaded {} seeds from {}", seeds.len(), dir.as_ref().display());
        Ok(seeds)
    }
}

/// `.sql` files in `dir` with their stems, sorted by filename
fn sql_files(dir: &Path) -> MigrationResult<Vec<(PathBuf, String)>> {
    let entries = fs::read_dir(dir)
        .map_err(|e| MigrationError::load(dir, format!("failed to read directory: {}", e)))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry
            .map_err(|e| MigrationError::load(dir, format!("failed to read directory entry: {}", e)))?;
        let path = entry.path();

        if !path.is_file() || path.extension().map_or(true, |ext| ext != "sql") {
            continue;
        }

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| MigrationError::load(&path, "filename is not valid UTF-8"))?
            .to_string();
        files.push((path, stem));
    }

    files.sort_by(|a, b| a.0.file_name().cmp(&b.0.file_name()));
    Ok(files)
}

fn parse_version(path: &Path, raw: &str) -> MigrationResult<u32> {
    let version: u32 = raw
        .parse()
        .map_err(|_| MigrationError::load(path, format!("invalid migration version '{}'", raw)))?;

    if version > i32::MAX as u32 {
        return Err(MigrationError::load(
            path,
            format!("migration version {} exceeds the maximum of {}", version, i32::MAX),
        ));
    }
    Ok(version)
}

fn read_file(path: &Path) -> MigrationResult<String> {
    fs::read_to_string(path).map_err(|e| MigrationError::load(path, format!("failed to read file: {}", e)))
}
