use anyhow::Result;
use log::info;
use sqlx::{Executor, PgPool};
use std::path::Path;
use std::{env, fs};

/// Apply all migration files in numeric order. The directory defaults to the
/// in-tree `sql/` folder and can be overridden with CAREWATCH_MIGRATIONS_DIR.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let migrations_dir = env::var("CAREWATCH_MIGRATIONS_DIR")
        .unwrap_or_else(|_| concat!(env!("CARGO_MANIFEST_DIR"), "/src/db/migrations/sql").to_string());

    let mut entries = fs::read_dir(&migrations_dir)?
        .filter_map(Result::ok)
        .filter(|entry| {
            let path = entry.path();
            path.extension().map(|ext| ext == "sql").unwrap_or(false)
        })
        .map(|entry| entry.path())
        .collect::<Vec<_>>();

    entries.sort_by_key(|path| {
        path.file_name()
            .and_then(|n| n.to_str())
            .and_then(|name| name.split('_').next())
            .and_then(|prefix| prefix.parse::<usize>().ok())
            .unwrap_or(usize::MAX)
    });

    for path in entries {
        execute_migration_file(pool, &path).await?;
        info!("Applied migration: {}", path.display());
    }

    Ok(())
}

async fn execute_migration_file(pool: &PgPool, path: &Path) -> Result<()> {
    let sql = fs::read_to_string(path)?;
    pool.execute(sql.as_str()).await?;
    Ok(())
}
