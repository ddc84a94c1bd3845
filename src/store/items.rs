//! Row helpers shared by tasks, the CLI and tests.
//!
//! Every helper takes the raw connection handed to an
//! [`execute`](super::PrefetchStore::execute) closure, so callers decide the
//! transaction boundaries.

use sqlx::{Row, SqliteConnection};
use time::OffsetDateTime;

use super::StoreError;
use super::schema::ITEMS_TABLE;
use crate::item::{ClientId, PrefetchItem, PrefetchItemErrorCode, PrefetchItemState, to_micros};

/// Inserts a complete item row.
///
/// # Errors
///
/// Returns [`StoreError::Database`] with a constraint-violation kind when the
/// offline id already exists.
pub async fn insert_item(conn: &mut SqliteConnection, item: &PrefetchItem) -> Result<(), StoreError> {
    sqlx::query(&format!(
        "INSERT INTO {ITEMS_TABLE} (
            offline_id, state, generate_bundle_attempts, get_operation_attempts,
            download_initiation_attempts, archive_body_length, creation_time,
            freshness_time, error_code, file_size, guid, client_namespace, client_id,
            requested_url, final_archived_url, operation_name, archive_body_name,
            title, file_path, request_origin, system_download_id, file_missing_time,
            digest, upgrade_attempt
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(item.offline_id)
    .bind(item.state.to_db())
    .bind(item.generate_bundle_attempts)
    .bind(item.get_operation_attempts)
    .bind(item.download_initiation_attempts)
    .bind(item.archive_body_length)
    .bind(to_micros(item.creation_time))
    .bind(to_micros(item.freshness_time))
    .bind(item.error_code.to_db())
    .bind(item.file_size)
    .bind(&item.guid)
    .bind(&item.client_id.name_space)
    .bind(&item.client_id.id)
    .bind(&item.requested_url)
    .bind(&item.final_archived_url)
    .bind(&item.operation_name)
    .bind(&item.archive_body_name)
    .bind(&item.title)
    .bind(&item.file_path)
    .bind(&item.request_origin)
    .bind(item.system_download_id)
    .bind(item.file_missing_time.map(to_micros))
    .bind(&item.digest)
    .bind(item.upgrade_attempt)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Reads one item by offline id.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if the query or row decoding fails.
pub async fn get_item(
    conn: &mut SqliteConnection,
    offline_id: i64,
) -> Result<Option<PrefetchItem>, StoreError> {
    let item = sqlx::query_as::<_, PrefetchItem>(&format!(
        "SELECT * FROM {ITEMS_TABLE} WHERE offline_id = ?"
    ))
    .bind(offline_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(item)
}

/// Whether a row already uses `offline_id`.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if the query fails.
pub async fn offline_id_exists(conn: &mut SqliteConnection, offline_id: i64) -> Result<bool, StoreError> {
    let found: Option<i64> = sqlx::query_scalar(&format!(
        "SELECT offline_id FROM {ITEMS_TABLE} WHERE offline_id = ?"
    ))
    .bind(offline_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(found.is_some())
}

/// Reads every item, oldest first.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if the query or row decoding fails.
pub async fn list_items(conn: &mut SqliteConnection) -> Result<Vec<PrefetchItem>, StoreError> {
    let items = sqlx::query_as::<_, PrefetchItem>(&format!(
        "SELECT * FROM {ITEMS_TABLE} ORDER BY creation_time ASC, offline_id ASC"
    ))
    .fetch_all(&mut *conn)
    .await?;
    Ok(items)
}

/// Reads every item in `state`, oldest first.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if the query or row decoding fails.
pub async fn items_in_state(
    conn: &mut SqliteConnection,
    state: PrefetchItemState,
) -> Result<Vec<PrefetchItem>, StoreError> {
    let items = sqlx::query_as::<_, PrefetchItem>(&format!(
        "SELECT * FROM {ITEMS_TABLE} WHERE state = ? ORDER BY creation_time ASC, offline_id ASC"
    ))
    .bind(state.to_db())
    .fetch_all(&mut *conn)
    .await?;
    Ok(items)
}

/// Reads the items suggested by one client.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if the query or row decoding fails.
pub async fn items_for_client(
    conn: &mut SqliteConnection,
    client_id: &ClientId,
) -> Result<Vec<PrefetchItem>, StoreError> {
    let items = sqlx::query_as::<_, PrefetchItem>(&format!(
        "SELECT * FROM {ITEMS_TABLE} WHERE client_namespace = ? AND client_id = ?"
    ))
    .bind(&client_id.name_space)
    .bind(&client_id.id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(items)
}

/// Counts items per state; states with no items are omitted.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if the query fails, or
/// [`StoreError::InvalidData`] for an unknown stored state.
pub async fn count_by_state(
    conn: &mut SqliteConnection,
) -> Result<Vec<(PrefetchItemState, i64)>, StoreError> {
    let rows = sqlx::query(&format!(
        "SELECT state, COUNT(*) AS count FROM {ITEMS_TABLE} GROUP BY state ORDER BY state"
    ))
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| {
            let value: i64 = row.try_get("state")?;
            let count: i64 = row.try_get("count")?;
            let state = PrefetchItemState::from_db(value).ok_or_else(|| StoreError::InvalidData {
                column: "state".to_string(),
                value: value.to_string(),
            })?;
            Ok((state, count))
        })
        .collect()
}

/// Moves one item to FINISHED with `error_code`, if it is still in `from`.
///
/// Returns whether a row changed.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if the update fails.
pub async fn finalize_item(
    conn: &mut SqliteConnection,
    offline_id: i64,
    from: PrefetchItemState,
    error_code: PrefetchItemErrorCode,
) -> Result<bool, StoreError> {
    let result = sqlx::query(&format!(
        "UPDATE {ITEMS_TABLE} SET state = ?, error_code = ? WHERE offline_id = ? AND state = ?"
    ))
    .bind(PrefetchItemState::Finished.to_db())
    .bind(error_code.to_db())
    .bind(offline_id)
    .bind(from.to_db())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Moves one item between non-terminal states and resets its freshness.
///
/// Returns whether a row changed.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if the update fails.
pub async fn move_item(
    conn: &mut SqliteConnection,
    offline_id: i64,
    from: PrefetchItemState,
    to: PrefetchItemState,
    now: OffsetDateTime,
) -> Result<bool, StoreError> {
    let result = sqlx::query(&format!(
        "UPDATE {ITEMS_TABLE} SET state = ?, freshness_time = ? WHERE offline_id = ? AND state = ?"
    ))
    .bind(to.to_db())
    .bind(to_micros(now))
    .bind(offline_id)
    .bind(from.to_db())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}
