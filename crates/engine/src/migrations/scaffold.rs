//! Scaffolding for new migration and seed files

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;

const UP_TEMPLATE: &str = "-- Write your up migration here\n";
const DOWN_TEMPLATE: &str = "-- Write your down migration here\n";
const SEED_TEMPLATE: &str = "-- Write your seed data here\n";

/// Lower-case a unit name and replace spaces with underscores
pub fn normalize_name(name: &str) -> String {
    name.trim().replace(' ', "_").to_lowercase()
}

/// Current Unix time in seconds, the prefix used for generated files
pub fn timestamp_prefix() -> i64 {
    Utc::now().timestamp()
}

/// Create `<timestamp>_<name>_up.sql` and `<timestamp>_<name>_down.sql` in `dir`
pub fn create_migration_files(
    dir: impl AsRef<Path>,
    name: &str,
    timestamp: i64,
) -> io::Result<(PathBuf, PathBuf)> {
    let dir = dir.as_ref();
    let name = validated_name(name)?;
    fs::create_dir_all(dir)?;

    let up_path = dir.join(format!("{}_{}_up.sql", timestamp, name));
    let down_path = dir.join(format!("{}_{}_down.sql", timestamp, name));
    write_new(&up_path, UP_TEMPLATE)?;
    write_new(&down_path, DOWN_TEMPLATE)?;

    Ok((up_path, down_path))
}

/// Create `<timestamp>_<name>.sql` in `dir`
pub fn create_seed_file(dir: impl AsRef<Path>, name: &str, timestamp: i64) -> io::Result<PathBuf> {
    let dir = dir.as_ref();
    let name = validated_name(name)?;
    fs::create_dir_all(dir)?;

    let path = dir.join(format!("{}_{}.sql", timestamp, name));
    write_new(&path, SEED_TEMPLATE)?;
    Ok(path)
}

fn validated_name(name: &str) -> io::Result<String> {
    let name = normalize_name(name);
    if name.is_empty() || name.contains(|c: char| matches!(c, '/' | '\\' | '.')) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid name '{}'", name),
        ));
    }
    Ok(name)
}

/// Write a file, refusing to overwrite an existing one
fn write_new(path: &Path, content: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(content.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::FileLoader;
    use tempfile::TempDir;

    #[test]
    fn test_generated_migration_loads() {
        let dir = TempDir::new().unwrap();
        let (up, down) = create_migration_files(dir.path(), "Add Users", 1_700_000_000).unwrap();

        assert!(up.ends_with("1700000000_add_users_up.sql"));
        assert!(down.ends_with("1700000000_add_users_down.sql"));

        let migrations = FileLoader::default().load_migrations(dir.path()).unwrap();
        assert_eq!(migrations.len(), 1);
        assert_eq!(migrations[0].version, 1_700_000_000);
        assert_eq!(migrations[0].description, "add_users");
        assert_eq!(migrations[0].down.as_deref(), Some(DOWN_TEMPLATE));
    }

    #[test]
    fn test_generated_seed_loads() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("config/db/seeds");
        let path = create_seed_file(&nested, "admin user", 1_700_000_000).unwrap();
        assert!(path.ends_with("1700000000_admin_user.sql"));

        let seeds = FileLoader::default().load_seeds(&nested).unwrap();
        assert_eq!(seeds[0].name, "admin_user");
        assert_eq!(seeds[0].priority, 1_700_000_000);
    }

    #[test]
    fn test_existing_file_not_overwritten() {
        let dir = TempDir::new().unwrap();
        create_seed_file(dir.path(), "roles", 1).unwrap();

        let err = create_seed_file(dir.path(), "roles", 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_invalid_names_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(create_seed_file(dir.path(), "   ", 1).is_err());
        assert!(create_migration_files(dir.path(), "../escape", 1).is_err());
    }
}
