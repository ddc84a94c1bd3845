//! Schema creation and in-place migration.
//!
//! The `meta` table records `version` and `last_compatible_version`. A
//! database without `meta` but with an items table is the legacy version 1
//! layout. Migrations rebuild the items table through a shadow copy inside
//! a single transaction, so an interrupted upgrade leaves the previous
//! layout untouched.

use sqlx::{Connection, Row, SqliteConnection};
use tracing::{debug, info, instrument, warn};

use super::StoreError;

/// Layout written by this build.
pub const CURRENT_VERSION: i64 = 3;

/// Oldest reader able to open a database written by this build.
pub const COMPATIBLE_VERSION: i64 = 1;

/// Items table name.
pub const ITEMS_TABLE: &str = "prefetch_items";

/// Quota table name.
pub const QUOTA_TABLE: &str = "prefetch_downloader_quota";

const SHADOW_TABLE: &str = "prefetch_items_new";

/// What [`create_or_upgrade_if_needed`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaOutcome {
    /// Fresh database; tables created at the current version.
    Created,
    /// Already current; missing auxiliary tables (if any) created.
    UpToDate,
    /// Rebuilt from an older layout.
    Migrated {
        /// Version found on disk.
        from: i64,
    },
}

/// Column list of the current items layout.
#[must_use]
pub fn items_table_sql(name: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {name} (
            offline_id INTEGER PRIMARY KEY NOT NULL,
            state INTEGER NOT NULL DEFAULT 0,
            generate_bundle_attempts INTEGER NOT NULL DEFAULT 0,
            get_operation_attempts INTEGER NOT NULL DEFAULT 0,
            download_initiation_attempts INTEGER NOT NULL DEFAULT 0,
            archive_body_length INTEGER NOT NULL DEFAULT -1,
            creation_time INTEGER NOT NULL,
            freshness_time INTEGER NOT NULL,
            error_code INTEGER NOT NULL DEFAULT 0,
            file_size INTEGER NOT NULL DEFAULT -1,
            guid VARCHAR NOT NULL DEFAULT '',
            client_namespace VARCHAR NOT NULL DEFAULT '',
            client_id VARCHAR NOT NULL DEFAULT '',
            requested_url VARCHAR NOT NULL DEFAULT '',
            final_archived_url VARCHAR NOT NULL DEFAULT '',
            operation_name VARCHAR NOT NULL DEFAULT '',
            archive_body_name VARCHAR NOT NULL DEFAULT '',
            title VARCHAR NOT NULL DEFAULT '',
            file_path VARCHAR NOT NULL DEFAULT '',
            request_origin VARCHAR NOT NULL DEFAULT '',
            system_download_id INTEGER,
            file_missing_time INTEGER,
            digest VARCHAR NOT NULL DEFAULT '',
            upgrade_attempt INTEGER NOT NULL DEFAULT 0
        )"
    )
}

fn quota_table_sql() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {QUOTA_TABLE} (
            quota_id INTEGER PRIMARY KEY NOT NULL DEFAULT 1,
            update_time INTEGER NOT NULL,
            available_quota INTEGER NOT NULL DEFAULT 0
        )"
    )
}

const META_TABLE_SQL: &str =
    "CREATE TABLE IF NOT EXISTS meta (key VARCHAR PRIMARY KEY NOT NULL, value INTEGER NOT NULL)";

/// Creates or upgrades the schema.
///
/// Succeeds exactly when the database is usable at [`CURRENT_VERSION`]
/// afterwards; any failure rolls the whole step back.
///
/// # Errors
///
/// Returns [`StoreError::IncompatibleSchema`] when the file was written by a
/// newer build that this one cannot read, and [`StoreError::Database`] when
/// any statement fails.
#[instrument(skip(conn))]
pub async fn create_or_upgrade_if_needed(
    conn: &mut SqliteConnection,
) -> Result<SchemaOutcome, StoreError> {
    let mut tx = conn.begin().await?;

    let has_items = table_exists(&mut tx, ITEMS_TABLE).await?;
    let version = if table_exists(&mut tx, "meta").await? {
        let compatible = read_meta(&mut tx, "last_compatible_version")
            .await?
            .unwrap_or(COMPATIBLE_VERSION);
        if compatible > CURRENT_VERSION {
            warn!(compatible, current = CURRENT_VERSION, "refusing to open newer database");
            return Err(StoreError::IncompatibleSchema {
                found: compatible,
                supported: CURRENT_VERSION,
            });
        }
        read_meta(&mut tx, "version").await?
    } else {
        None
    };

    let outcome = match (has_items, version) {
        (false, _) => {
            sqlx::query(&items_table_sql(ITEMS_TABLE))
                .execute(&mut *tx)
                .await?;
            SchemaOutcome::Created
        }
        (true, Some(v)) if v >= CURRENT_VERSION => SchemaOutcome::UpToDate,
        (true, found) => {
            let from = found.unwrap_or(1);
            migrate_items_table(&mut tx).await?;
            SchemaOutcome::Migrated { from }
        }
    };

    sqlx::query(&quota_table_sql()).execute(&mut *tx).await?;
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS prefetch_items_namespace_url \
         ON {ITEMS_TABLE} (client_namespace, requested_url)"
    ))
    .execute(&mut *tx)
    .await?;
    sqlx::query(META_TABLE_SQL).execute(&mut *tx).await?;
    if outcome != SchemaOutcome::UpToDate {
        write_meta(&mut tx, "version", CURRENT_VERSION).await?;
        write_meta(&mut tx, "last_compatible_version", COMPATIBLE_VERSION).await?;
    }

    tx.commit().await?;

    match outcome {
        SchemaOutcome::Migrated { from } => {
            info!(from, to = CURRENT_VERSION, "migrated prefetch schema");
        }
        other => debug!(?other, "prefetch schema ready"),
    }
    Ok(outcome)
}

/// Rebuilds the items table at the current layout, keeping every column the
/// old layout shares with the new one.
async fn migrate_items_table(conn: &mut SqliteConnection) -> Result<(), StoreError> {
    let old_columns = table_columns(conn, ITEMS_TABLE).await?;

    sqlx::query(&format!("DROP TABLE IF EXISTS {SHADOW_TABLE}"))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&items_table_sql(SHADOW_TABLE))
        .execute(&mut *conn)
        .await?;
    let new_columns = table_columns(conn, SHADOW_TABLE).await?;

    let shared: Vec<&str> = new_columns
        .iter()
        .filter(|column| old_columns.contains(column))
        .map(String::as_str)
        .collect();
    let column_list = shared.join(", ");
    debug!(columns = %column_list, "copying items into shadow table");

    sqlx::query(&format!(
        "INSERT INTO {SHADOW_TABLE} ({column_list}) SELECT {column_list} FROM {ITEMS_TABLE}"
    ))
    .execute(&mut *conn)
    .await?;
    sqlx::query(&format!("DROP TABLE {ITEMS_TABLE}"))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&format!("ALTER TABLE {SHADOW_TABLE} RENAME TO {ITEMS_TABLE}"))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn table_exists(conn: &mut SqliteConnection, name: &str) -> Result<bool, StoreError> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name)
            .fetch_one(&mut *conn)
            .await?;
    Ok(count > 0)
}

async fn table_columns(conn: &mut SqliteConnection, table: &str) -> Result<Vec<String>, StoreError> {
    let rows = sqlx::query(&format!("SELECT name FROM pragma_table_info('{table}')"))
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| row.try_get::<String, _>("name").map_err(StoreError::from))
        .collect()
}

async fn read_meta(conn: &mut SqliteConnection, key: &str) -> Result<Option<i64>, StoreError> {
    let value = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(value)
}

async fn write_meta(conn: &mut SqliteConnection, key: &str, value: i64) -> Result<(), StoreError> {
    sqlx::query("INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)")
        .bind(key)
        .bind(value)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Reads `(version, last_compatible_version)`, if recorded.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if the query fails.
pub async fn read_versions(
    conn: &mut SqliteConnection,
) -> Result<Option<(i64, i64)>, StoreError> {
    if !table_exists(conn, "meta").await? {
        return Ok(None);
    }
    let version = read_meta(conn, "version").await?;
    let compatible = read_meta(conn, "last_compatible_version").await?;
    Ok(version.zip(compatible))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::str::FromStr;

    use sqlx::ConnectOptions;
    use sqlx::sqlite::SqliteConnectOptions;

    use super::*;

    async fn memory_conn() -> SqliteConnection {
        SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .connect()
            .await
            .unwrap()
    }

    const LEGACY_V1_SQL: &str = "CREATE TABLE prefetch_items (
        offline_id INTEGER PRIMARY KEY NOT NULL,
        state INTEGER NOT NULL DEFAULT 0,
        generate_bundle_attempts INTEGER NOT NULL DEFAULT 0,
        get_operation_attempts INTEGER NOT NULL DEFAULT 0,
        download_initiation_attempts INTEGER NOT NULL DEFAULT 0,
        archive_body_length INTEGER NOT NULL DEFAULT -1,
        creation_time INTEGER NOT NULL,
        freshness_time INTEGER NOT NULL,
        error_code INTEGER NOT NULL DEFAULT 0,
        guid VARCHAR NOT NULL DEFAULT '',
        client_namespace VARCHAR NOT NULL DEFAULT '',
        client_id VARCHAR NOT NULL DEFAULT '',
        requested_url VARCHAR NOT NULL DEFAULT '',
        final_archived_url VARCHAR NOT NULL DEFAULT '',
        operation_name VARCHAR NOT NULL DEFAULT '',
        archive_body_name VARCHAR NOT NULL DEFAULT ''
    )";

    // ==================== Creation Tests ====================

    #[tokio::test]
    async fn test_fresh_database_is_created_at_current_version() {
        let mut conn = memory_conn().await;
        let outcome = create_or_upgrade_if_needed(&mut conn).await.unwrap();
        assert_eq!(outcome, SchemaOutcome::Created);
        assert_eq!(
            read_versions(&mut conn).await.unwrap(),
            Some((CURRENT_VERSION, COMPATIBLE_VERSION))
        );
        assert!(table_exists(&mut conn, QUOTA_TABLE).await.unwrap());
    }

    #[tokio::test]
    async fn test_second_run_is_up_to_date() {
        let mut conn = memory_conn().await;
        create_or_upgrade_if_needed(&mut conn).await.unwrap();
        let outcome = create_or_upgrade_if_needed(&mut conn).await.unwrap();
        assert_eq!(outcome, SchemaOutcome::UpToDate);
    }

    // ==================== Migration Tests ====================

    #[tokio::test]
    async fn test_legacy_v1_is_migrated_without_data_loss() {
        let mut conn = memory_conn().await;
        sqlx::query(LEGACY_V1_SQL).execute(&mut conn).await.unwrap();
        sqlx::query(
            "INSERT INTO prefetch_items (offline_id, state, creation_time, freshness_time, \
             client_namespace, client_id, requested_url, archive_body_name) \
             VALUES (11, 50, 100, 200, 'ns', 'c1', 'https://a.test/', 'body-1')",
        )
        .execute(&mut conn)
        .await
        .unwrap();

        let outcome = create_or_upgrade_if_needed(&mut conn).await.unwrap();
        assert_eq!(outcome, SchemaOutcome::Migrated { from: 1 });

        let row = sqlx::query(
            "SELECT state, requested_url, archive_body_name, title, file_size, digest \
             FROM prefetch_items WHERE offline_id = 11",
        )
        .fetch_one(&mut conn)
        .await
        .unwrap();
        assert_eq!(row.get::<i64, _>("state"), 50);
        assert_eq!(row.get::<String, _>("requested_url"), "https://a.test/");
        assert_eq!(row.get::<String, _>("archive_body_name"), "body-1");
        assert_eq!(row.get::<String, _>("title"), "");
        assert_eq!(row.get::<i64, _>("file_size"), -1);
        assert_eq!(row.get::<String, _>("digest"), "");
        assert!(!table_exists(&mut conn, SHADOW_TABLE).await.unwrap());
        assert_eq!(
            read_versions(&mut conn).await.unwrap(),
            Some((CURRENT_VERSION, COMPATIBLE_VERSION))
        );
    }

    #[tokio::test]
    async fn test_newer_incompatible_database_fails_closed() {
        let mut conn = memory_conn().await;
        create_or_upgrade_if_needed(&mut conn).await.unwrap();
        sqlx::query("UPDATE meta SET value = 9 WHERE key = 'last_compatible_version'")
            .execute(&mut conn)
            .await
            .unwrap();

        let err = create_or_upgrade_if_needed(&mut conn).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::IncompatibleSchema {
                found: 9,
                supported: CURRENT_VERSION
            }
        ));
    }

    #[tokio::test]
    async fn test_newer_but_compatible_database_opens() {
        let mut conn = memory_conn().await;
        create_or_upgrade_if_needed(&mut conn).await.unwrap();
        sqlx::query("UPDATE meta SET value = 4 WHERE key = 'version'")
            .execute(&mut conn)
            .await
            .unwrap();

        let outcome = create_or_upgrade_if_needed(&mut conn).await.unwrap();
        assert_eq!(outcome, SchemaOutcome::UpToDate);
        assert_eq!(read_versions(&mut conn).await.unwrap(), Some((4, COMPATIBLE_VERSION)));
    }
}
