use super::model::UndeliveredUpload;
use crate::model::{NewUpload, UploadedFile};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;

const FILE_COLUMNS: &str = "id, name, size, content, owner_id, created_at, email_recipient, \
                            email_sent, email_sent_at, error_message";

/// Open a SQLite pool. File databases get WAL and `synchronous=FULL` on every
/// connection. An in-memory database only lives as long as its connection, so
/// it is pinned to a single connection that never expires.
pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let mut options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {normalized}"))?
        .create_if_missing(true)
        .foreign_keys(true);

    let mut pool_options = SqlitePoolOptions::new();
    if is_in_memory(&normalized) {
        pool_options = pool_options
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    } else {
        options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
    }

    let pool = pool_options.connect_with(options).await?;
    Ok(pool)
}

fn is_in_memory(url: &str) -> bool {
    url.starts_with("sqlite::memory") || url.contains("mode=memory")
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations/store").run(pool).await?;
    Ok(())
}

/// Timestamps are stored as fixed-width UTC text so they compare lexically.
pub(crate) fn sql_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn map_uploaded_file(row: &SqliteRow) -> Result<UploadedFile> {
    Ok(UploadedFile {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        size: row.try_get("size")?,
        content: row.try_get("content")?,
        owner_id: row.try_get("owner_id")?,
        created_at: row.try_get("created_at")?,
        email_recipient: row.try_get("email_recipient")?,
        email_sent: row.try_get("email_sent")?,
        email_sent_at: row.try_get::<Option<DateTime<Utc>>, _>("email_sent_at")?,
        error_message: row.try_get::<Option<String>, _>("error_message")?,
    })
}

/// Insert a new upload with `email_sent = 0`. Once this returns the upload is
/// recorded, whatever happens to its event afterwards.
#[instrument(skip_all, fields(owner_id = upload.owner_id))]
pub async fn insert_uploaded_file(pool: &Pool, upload: NewUpload) -> Result<UploadedFile> {
    let row = sqlx::query(
        "INSERT INTO uploaded_files (name, size, content, owner_id, email_recipient, email_sent) \
         VALUES (?, ?, ?, ?, ?, 0) RETURNING id, created_at",
    )
    .bind(&upload.name)
    .bind(upload.size)
    .bind(&upload.content)
    .bind(upload.owner_id)
    .bind(&upload.email_recipient)
    .fetch_one(pool)
    .await
    .context("failed to insert uploaded file")?;

    Ok(UploadedFile {
        id: row.try_get("id")?,
        name: upload.name,
        size: upload.size,
        content: upload.content,
        owner_id: upload.owner_id,
        created_at: row.try_get("created_at")?,
        email_recipient: upload.email_recipient,
        email_sent: false,
        email_sent_at: None,
        error_message: None,
    })
}

#[instrument(skip_all)]
pub async fn find_uploaded_file(pool: &Pool, id: i64) -> Result<Option<UploadedFile>> {
    let sql = format!("SELECT {FILE_COLUMNS} FROM uploaded_files WHERE id = ?");
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(map_uploaded_file).transpose()
}

/// Mark a row delivered. Only the `email_sent = 0 -> 1` transition is written,
/// so a repeated call is a no-op and `email_sent_at` keeps its first value.
/// Returns whether a row changed.
#[instrument(skip_all)]
pub async fn mark_email_sent(
    pool: &Pool,
    id: i64,
    owner_id: i64,
    sent_at: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE uploaded_files SET email_sent = 1, email_sent_at = ?, error_message = NULL \
         WHERE id = ? AND owner_id = ? AND email_sent = 0",
    )
    .bind(sql_timestamp(sent_at))
    .bind(id)
    .bind(owner_id)
    .execute(pool)
    .await
    .context("failed to mark uploaded file as sent")?;
    Ok(res.rows_affected() == 1)
}

/// Record the last delivery failure. Advisory only; never touches `email_sent`.
#[instrument(skip_all)]
pub async fn record_delivery_error(
    pool: &Pool,
    id: i64,
    owner_id: i64,
    message: &str,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE uploaded_files SET error_message = ? \
         WHERE id = ? AND owner_id = ? AND email_sent = 0",
    )
    .bind(message)
    .bind(id)
    .bind(owner_id)
    .execute(pool)
    .await
    .context("failed to record delivery error")?;
    Ok(res.rows_affected() == 1)
}

/// Keyset page: up to `limit` rows of `owner_id` with `id > last_id`, ascending.
#[instrument(skip(pool))]
pub async fn select_page(
    pool: &Pool,
    owner_id: i64,
    last_id: i64,
    limit: i64,
) -> Result<Vec<UploadedFile>> {
    let sql = format!(
        "SELECT {FILE_COLUMNS} FROM uploaded_files \
         WHERE owner_id = ? AND id > ? ORDER BY id ASC LIMIT ?"
    );
    let rows = sqlx::query(&sql)
        .bind(owner_id)
        .bind(last_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(map_uploaded_file).collect()
}

#[instrument(skip_all)]
pub async fn count_by_owner(pool: &Pool, owner_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(id) FROM uploaded_files WHERE owner_id = ?")
        .bind(owner_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Rows still undelivered that were created before `before`, oldest first.
#[instrument(skip_all)]
pub async fn list_stale_undelivered(
    pool: &Pool,
    before: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<UndeliveredUpload>> {
    let rows = sqlx::query(
        "SELECT id, owner_id, name, email_recipient, created_at, error_message \
         FROM uploaded_files WHERE email_sent = 0 AND created_at < ? ORDER BY id ASC LIMIT ?",
    )
    .bind(sql_timestamp(before))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(UndeliveredUpload {
                id: row.try_get("id")?,
                owner_id: row.try_get("owner_id")?,
                name: row.try_get("name")?,
                email_recipient: row.try_get("email_recipient")?,
                created_at: row.try_get("created_at")?,
                error_message: row.try_get::<Option<String>, _>("error_message")?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn setup_pool() -> Pool {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn upload(owner_id: i64, name: &str) -> NewUpload {
        NewUpload {
            owner_id,
            email_recipient: "a@b.com".into(),
            name: name.into(),
            size: 4,
            content: b"test".to_vec(),
        }
    }

    #[test]
    fn prepare_url_leaves_memory_alone() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://localhost/db"),
            "postgres://localhost/db"
        );
    }

    #[test]
    fn prepare_url_creates_parent_dir() {
        let td = tempfile::tempdir().unwrap();
        let db_path = td.path().join("nested").join("uploads.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let prepared = prepare_sqlite_url(&url);
        assert_eq!(prepared, url);
        assert!(td.path().join("nested").exists());
    }

    #[tokio::test]
    async fn insert_assigns_ids_and_round_trips() {
        let pool = setup_pool().await;
        let first = insert_uploaded_file(&pool, upload(7, "x.txt")).await.unwrap();
        let second = insert_uploaded_file(&pool, upload(7, "y.txt")).await.unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert!(second.created_at >= first.created_at);

        let stored = find_uploaded_file(&pool, first.id).await.unwrap().unwrap();
        assert_eq!(stored, first);
        assert!(find_uploaded_file(&pool, 99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_email_sent_only_once() {
        let pool = setup_pool().await;
        let file = insert_uploaded_file(&pool, upload(7, "x.txt")).await.unwrap();

        let first_at = Utc::now();
        assert!(mark_email_sent(&pool, file.id, 7, first_at).await.unwrap());
        let later = first_at + Duration::seconds(30);
        assert!(!mark_email_sent(&pool, file.id, 7, later).await.unwrap());

        let stored = find_uploaded_file(&pool, file.id).await.unwrap().unwrap();
        assert!(stored.email_sent);
        assert_eq!(
            stored.email_sent_at.map(sql_timestamp),
            Some(sql_timestamp(first_at))
        );
    }

    #[tokio::test]
    async fn mark_email_sent_is_owner_scoped() {
        let pool = setup_pool().await;
        let file = insert_uploaded_file(&pool, upload(7, "x.txt")).await.unwrap();
        assert!(!mark_email_sent(&pool, file.id, 8, Utc::now()).await.unwrap());
        let stored = find_uploaded_file(&pool, file.id).await.unwrap().unwrap();
        assert!(!stored.email_sent);
    }

    #[tokio::test]
    async fn delivery_error_is_cleared_on_send() {
        let pool = setup_pool().await;
        let file = insert_uploaded_file(&pool, upload(7, "x.txt")).await.unwrap();
        assert!(record_delivery_error(&pool, file.id, 7, "smtp down").await.unwrap());
        let stored = find_uploaded_file(&pool, file.id).await.unwrap().unwrap();
        assert_eq!(stored.error_message.as_deref(), Some("smtp down"));
        assert!(!stored.email_sent);

        mark_email_sent(&pool, file.id, 7, Utc::now()).await.unwrap();
        let stored = find_uploaded_file(&pool, file.id).await.unwrap().unwrap();
        assert!(stored.error_message.is_none());
        assert!(!record_delivery_error(&pool, file.id, 7, "late").await.unwrap());
    }

    #[tokio::test]
    async fn select_page_is_keyset_and_owner_scoped() {
        let pool = setup_pool().await;
        for (owner, name) in [(7, "a"), (8, "b"), (7, "c"), (8, "d"), (7, "e")] {
            insert_uploaded_file(&pool, upload(owner, name)).await.unwrap();
        }

        let page = select_page(&pool, 7, 0, 2).await.unwrap();
        assert_eq!(page.iter().map(|f| f.id).collect::<Vec<_>>(), vec![1, 3]);
        let page = select_page(&pool, 7, 3, 2).await.unwrap();
        assert_eq!(page.iter().map(|f| f.id).collect::<Vec<_>>(), vec![5]);
        let page = select_page(&pool, 7, 5, 2).await.unwrap();
        assert!(page.is_empty());

        assert_eq!(count_by_owner(&pool, 7).await.unwrap(), 3);
        assert_eq!(count_by_owner(&pool, 8).await.unwrap(), 2);
        assert_eq!(count_by_owner(&pool, 9).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_listing_skips_delivered_and_recent() {
        let pool = setup_pool().await;
        let pending = insert_uploaded_file(&pool, upload(7, "a")).await.unwrap();
        let sent = insert_uploaded_file(&pool, upload(7, "b")).await.unwrap();
        mark_email_sent(&pool, sent.id, 7, Utc::now()).await.unwrap();

        let future = Utc::now() + Duration::seconds(5);
        let stale = list_stale_undelivered(&pool, future, 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, pending.id);
        assert_eq!(stale[0].owner_id, 7);

        let past = pending.created_at - Duration::seconds(5);
        assert!(list_stale_undelivered(&pool, past, 10).await.unwrap().is_empty());
    }
}
