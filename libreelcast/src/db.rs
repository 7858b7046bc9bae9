//! SQLite implementation of [`PublishStore`]

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;

use crate::error::{DbError, Result, SchedulerError};
use crate::store::PublishStore;
use crate::types::{
    ContentRef, PlatformId, PublishRecord, PublishTask, StatsQuery, StoredCredential, TaskStatus,
};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // Forward slashes keep the URL valid on Windows; mode=rwc creates the file
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn corrupt(table: &'static str, reason: impl ToString) -> DbError {
    DbError::CorruptRow {
        table,
        reason: reason.to_string(),
    }
}

fn row_to_credential(row: &SqliteRow) -> Result<StoredCredential> {
    let platform: String = row.get("platform");
    let scopes: String = row.get("scopes");

    Ok(StoredCredential {
        account_id: row.get("account_id"),
        platform: platform
            .parse()
            .map_err(|e| corrupt("credentials", e))?,
        access_token_ciphertext: row.get("access_token_ciphertext"),
        refresh_token_ciphertext: row.get("refresh_token_ciphertext"),
        expires_at: row.get("expires_at"),
        scopes: serde_json::from_str(&scopes).map_err(|e| corrupt("credentials", e))?,
        updated_at: row.get("updated_at"),
    })
}

fn row_to_task(row: &SqliteRow) -> Result<PublishTask> {
    let content: String = row.get("content");
    let targets: String = row.get("targets");
    let status: String = row.get("status");

    let content: ContentRef =
        serde_json::from_str(&content).map_err(|e| corrupt("publish_tasks", e))?;
    let targets: Vec<PlatformId> =
        serde_json::from_str(&targets).map_err(|e| corrupt("publish_tasks", e))?;
    let status: TaskStatus = status.parse().map_err(|e| corrupt("publish_tasks", e))?;

    Ok(PublishTask::from_parts(
        row.get("id"),
        row.get("owner_account_id"),
        content,
        targets,
        row.get("created_at"),
        status,
    ))
}

fn row_to_record(row: &SqliteRow) -> Result<PublishRecord> {
    let platform: String = row.get("platform");
    let status: String = row.get("status");
    let attempt_count: i64 = row.get("attempt_count");

    Ok(PublishRecord {
        task_id: row.get("task_id"),
        platform: platform
            .parse()
            .map_err(|e| corrupt("publish_records", e))?,
        attempt_count: attempt_count as u32,
        last_attempt_at: row.get("last_attempt_at"),
        last_error: row.get("last_error"),
        external_id: row.get("external_id"),
        status: status.parse().map_err(|e| corrupt("publish_records", e))?,
    })
}

/// WHERE clause fragments for a [`StatsQuery`] over `publish_tasks` aliased as `t`
fn task_filter(query: &StatsQuery) -> String {
    let mut clauses = vec!["1=1"];
    if query.account_id.is_some() {
        clauses.push("t.owner_account_id = ?");
    }
    if query.since.is_some() {
        clauses.push("t.created_at >= ?");
    }
    if query.until.is_some() {
        clauses.push("t.created_at < ?");
    }
    clauses.join(" AND ")
}

/// Bind values in the same order [`task_filter`] emitted placeholders
fn bind_filter<'q>(
    mut q: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    query: &'q StatsQuery,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    if let Some(account) = &query.account_id {
        q = q.bind(account);
    }
    if let Some(since) = query.since {
        q = q.bind(since);
    }
    if let Some(until) = query.until {
        q = q.bind(until);
    }
    q
}

#[async_trait]
impl PublishStore for Database {
    async fn get_credential(
        &self,
        account_id: &str,
        platform: PlatformId,
    ) -> Result<Option<StoredCredential>> {
        let row = sqlx::query(
            r#"
            SELECT account_id, platform, access_token_ciphertext, refresh_token_ciphertext,
                   expires_at, scopes, updated_at
            FROM credentials WHERE account_id = ? AND platform = ?
            "#,
        )
        .bind(account_id)
        .bind(platform.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_credential).transpose()
    }

    async fn put_credential(&self, credential: &StoredCredential) -> Result<()> {
        let scopes = serde_json::to_string(&credential.scopes)
            .map_err(|e| corrupt("credentials", e))?;

        sqlx::query(
            r#"
            INSERT INTO credentials (account_id, platform, access_token_ciphertext,
                                     refresh_token_ciphertext, expires_at, scopes, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(account_id, platform) DO UPDATE SET
                access_token_ciphertext = excluded.access_token_ciphertext,
                refresh_token_ciphertext = excluded.refresh_token_ciphertext,
                expires_at = excluded.expires_at,
                scopes = excluded.scopes,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&credential.account_id)
        .bind(credential.platform.as_str())
        .bind(&credential.access_token_ciphertext)
        .bind(&credential.refresh_token_ciphertext)
        .bind(credential.expires_at)
        .bind(scopes)
        .bind(credential.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn delete_credential(&self, account_id: &str, platform: PlatformId) -> Result<()> {
        sqlx::query("DELETE FROM credentials WHERE account_id = ? AND platform = ?")
            .bind(account_id)
            .bind(platform.as_str())
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn insert_task(&self, task: &PublishTask, records: &[PublishRecord]) -> Result<()> {
        let content =
            serde_json::to_string(&task.content).map_err(|e| corrupt("publish_tasks", e))?;
        let targets =
            serde_json::to_string(task.targets()).map_err(|e| corrupt("publish_tasks", e))?;

        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        sqlx::query(
            r#"
            INSERT INTO publish_tasks (id, owner_account_id, content, targets, created_at, status)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.owner_account_id)
        .bind(content)
        .bind(targets)
        .bind(task.created_at)
        .bind(task.status.as_str())
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        for (position, record) in records.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO publish_records (task_id, platform, position, attempt_count,
                                             last_attempt_at, last_error, external_id, status)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.task_id)
            .bind(record.platform.as_str())
            .bind(position as i64)
            .bind(record.attempt_count as i64)
            .bind(record.last_attempt_at)
            .bind(&record.last_error)
            .bind(&record.external_id)
            .bind(record.status.as_str())
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;
        }

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<PublishTask>> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_account_id, content, targets, created_at, status
            FROM publish_tasks WHERE id = ?
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_task).transpose()
    }

    async fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        let result = sqlx::query("UPDATE publish_tasks SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::TaskNotFound(task_id.to_string()).into());
        }
        Ok(())
    }

    async fn list_tasks(&self, query: &StatsQuery) -> Result<Vec<PublishTask>> {
        let sql = format!(
            r#"
            SELECT t.id, t.owner_account_id, t.content, t.targets, t.created_at, t.status
            FROM publish_tasks t
            WHERE {}
            ORDER BY t.created_at DESC, t.id ASC
            "#,
            task_filter(query)
        );

        let rows = bind_filter(sqlx::query(&sql), query)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_task).collect()
    }

    async fn put_record(&self, record: &PublishRecord) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE publish_records
            SET attempt_count = ?, last_attempt_at = ?, last_error = ?, external_id = ?, status = ?
            WHERE task_id = ? AND platform = ?
            "#,
        )
        .bind(record.attempt_count as i64)
        .bind(record.last_attempt_at)
        .bind(&record.last_error)
        .bind(&record.external_id)
        .bind(record.status.as_str())
        .bind(&record.task_id)
        .bind(record.platform.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if updated.rows_affected() > 0 {
            return Ok(());
        }

        if self.get_task(&record.task_id).await?.is_none() {
            return Err(SchedulerError::TaskNotFound(record.task_id.clone()).into());
        }

        sqlx::query(
            r#"
            INSERT INTO publish_records (task_id, platform, position, attempt_count,
                                         last_attempt_at, last_error, external_id, status)
            VALUES (?, ?, (SELECT COUNT(*) FROM publish_records WHERE task_id = ?), ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.task_id)
        .bind(record.platform.as_str())
        .bind(&record.task_id)
        .bind(record.attempt_count as i64)
        .bind(record.last_attempt_at)
        .bind(&record.last_error)
        .bind(&record.external_id)
        .bind(record.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn get_records(&self, task_id: &str) -> Result<Vec<PublishRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT task_id, platform, attempt_count, last_attempt_at, last_error, external_id, status
            FROM publish_records WHERE task_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_record).collect()
    }

    async fn list_records(&self, query: &StatsQuery) -> Result<Vec<PublishRecord>> {
        let sql = format!(
            r#"
            SELECT r.task_id, r.platform, r.attempt_count, r.last_attempt_at, r.last_error,
                   r.external_id, r.status
            FROM publish_records r
            JOIN publish_tasks t ON t.id = r.task_id
            WHERE {}
            ORDER BY t.created_at DESC, r.task_id ASC, r.position ASC
            "#,
            task_filter(query)
        );

        let rows = bind_filter(sqlx::query(&sql), query)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_record).collect()
    }
}
