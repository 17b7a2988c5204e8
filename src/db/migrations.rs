use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::db::schema;

const VERSION_KEY: &str = "schema_version";

struct Migration {
    version: u32,
    name: &'static str,
    apply: fn(&Connection) -> Result<()>,
}

/// Ordered by version; each step runs once, inside its own transaction.
const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "ingestion tables",
    apply: schema::create_schema,
}];

fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |migration| migration.version)
}

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_meta (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );
        "#,
    )
    .context("create schema_meta")?;

    let stored = stored_version(conn)?;
    let supported = latest_version();
    if stored > supported {
        bail!("database schema version {stored} is newer than supported version {supported}");
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > stored) {
        let tx = conn
            .unchecked_transaction()
            .context("begin migration transaction")?;
        (migration.apply)(&tx)
            .with_context(|| format!("apply migration v{} ({})", migration.version, migration.name))?;
        record_version(&tx, migration.version)?;
        tx.commit()
            .with_context(|| format!("commit migration v{}", migration.version))?;
        info!(version = migration.version, name = migration.name, "schema migrated");
    }

    Ok(())
}

fn stored_version(conn: &Connection) -> Result<u32> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = ?1",
            params![VERSION_KEY],
            |row| row.get(0),
        )
        .optional()
        .context("read schema version")?;

    raw.map_or(Ok(0), |value| {
        value
            .parse::<u32>()
            .with_context(|| format!("schema_meta holds a non-numeric version: {value}"))
    })
}

fn record_version(conn: &Connection, version: u32) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO schema_meta (key, value) VALUES (?1, ?2)
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
        "#,
        params![VERSION_KEY, version.to_string()],
    )
    .with_context(|| format!("record schema version {version}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use rusqlite::{params, Connection};
    use uuid::Uuid;

    use super::{latest_version, migrate, record_version, stored_version};

    #[test]
    fn fresh_database_gets_every_table() -> Result<()> {
        let path = std::env::temp_dir().join(format!("labsync-migrations-{}.db", Uuid::new_v4()));
        let conn = Connection::open(&path)?;

        migrate(&conn)?;
        assert_eq!(stored_version(&conn)?, latest_version());

        let tables: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN (?1, ?2, ?3, ?4)",
            params!["medical_records", "user_records", "process_status", "mailbox_tokens"],
            |row| row.get(0),
        )?;
        assert_eq!(tables, 4);

        drop(conn);
        let _ = std::fs::remove_file(path);
        Ok(())
    }

    #[test]
    fn running_twice_is_harmless() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        conn.execute(
            "INSERT INTO user_labs (user_id, lab_name) VALUES ('42', 'Acme Labs')",
            [],
        )?;

        migrate(&conn)?;
        let labs: i64 = conn.query_row("SELECT COUNT(*) FROM user_labs", [], |row| row.get(0))?;
        assert_eq!(labs, 1);
        assert_eq!(stored_version(&conn)?, 1);
        Ok(())
    }

    #[test]
    fn newer_database_is_refused() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        record_version(&conn, latest_version() + 6)?;

        let err = migrate(&conn).expect_err("newer schema must be rejected");
        assert!(err.to_string().contains("newer than supported"));
        Ok(())
    }
}
