//! Session store - persistent cache of nodes under introspection
//!
//! Three tables back the store (see `db.rs`):
//! - `sessions`: one row per node, kept after finishing for status queries
//! - `attributes`: lookup values (MACs, BMC address), `(name, value)` unique across all sessions
//! - `options`: per-session JSON values, `(id, name)` unique
//!
//! Every mutating operation runs in a single transaction. Attributes and options only
//! exist while a session is active; finishing a session frees its attribute values.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use std::collections::BTreeSet;

use crate::config::IntrospectionConfig;
use crate::error::InspectorError;
use crate::handle::SessionHandle;
use crate::models::session::from_millis;
use crate::models::{Attributes, Options, Session, SessionRow, MACS_ATTRIBUTE, TIMEOUT_ERROR};

#[derive(Debug, Clone)]
pub struct SessionStore {
    pool: SqlitePool,
    config: IntrospectionConfig,
}

impl SessionStore {
    pub fn new(pool: SqlitePool, config: IntrospectionConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &IntrospectionConfig {
        &self.config
    }

    /// Start a new session for `id`, dropping everything known about a previous one.
    ///
    /// Empty attribute values are skipped.
    pub async fn create(
        &self,
        id: &str,
        attributes: &Attributes,
    ) -> Result<SessionHandle, InspectorError> {
        let started_at = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM attributes WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM options WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let generation: i64 = sqlx::query_scalar(
            "INSERT INTO sessions (id, started_at) VALUES (?, ?) RETURNING generation",
        )
        .bind(id)
        .bind(started_at)
        .fetch_one(&mut *tx)
        .await?;

        for (name, values) in attributes {
            let values = non_empty(values);
            if values.is_empty() {
                continue;
            }
            claim_attribute(&mut tx, id, Some(generation), name, &values).await?;
        }

        tx.commit().await?;

        tracing::debug!(node = %id, generation, "Session created");

        let session = Session {
            id: id.to_string(),
            generation,
            started_at: from_millis(started_at).unwrap_or_default(),
            finished_at: None,
            error: None,
        };
        Ok(SessionHandle::new(self.clone(), session))
    }

    /// Claim `values` of attribute `name` for an active session.
    ///
    /// Rejected as a whole with `DuplicateAttribute` if any value is already claimed.
    pub async fn attach_attribute(
        &self,
        id: &str,
        name: &str,
        values: &[String],
    ) -> Result<(), InspectorError> {
        self.attach_inner(id, None, name, values).await
    }

    /// Like `attach_attribute`, but only for the session lifetime `generation`.
    ///
    /// Fails with `Superseded` once `id` was re-created.
    pub async fn attach_lifetime_attribute(
        &self,
        id: &str,
        generation: i64,
        name: &str,
        values: &[String],
    ) -> Result<(), InspectorError> {
        self.attach_inner(id, Some(generation), name, values).await
    }

    async fn attach_inner(
        &self,
        id: &str,
        generation: Option<i64>,
        name: &str,
        values: &[String],
    ) -> Result<(), InspectorError> {
        let values = non_empty(values);
        if values.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        claim_attribute(&mut tx, id, generation, name, &values).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Insert or replace an option of an active session.
    pub async fn set_option(
        &self,
        id: &str,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<(), InspectorError> {
        self.set_option_inner(id, None, name, value).await
    }

    /// Like `set_option`, but only for the session lifetime `generation`.
    pub async fn set_lifetime_option(
        &self,
        id: &str,
        generation: i64,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<(), InspectorError> {
        self.set_option_inner(id, Some(generation), name, value)
            .await
    }

    async fn set_option_inner(
        &self,
        id: &str,
        generation: Option<i64>,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<(), InspectorError> {
        let encoded = serde_json::to_string(value)?;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO options (id, name, value)
            SELECT id, ?, ? FROM sessions
            WHERE id = ? AND finished_at IS NULL AND (? IS NULL OR generation = ?)
            ON CONFLICT (id, name) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(name)
        .bind(&encoded)
        .bind(id)
        .bind(generation)
        .bind(generation)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(inactive_error(&mut tx, id, generation).await);
        }

        tx.commit().await?;
        Ok(())
    }

    /// All options of a session. Finished sessions have none.
    pub async fn load_options(&self, id: &str) -> Result<Options, InspectorError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT name, value FROM options WHERE id = ?")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;

        let mut options = Options::with_capacity(rows.len());
        for (name, value) in rows {
            options.insert(name, serde_json::from_str(&value)?);
        }
        Ok(options)
    }

    /// Attributes currently claimed by a session.
    pub async fn attributes(&self, id: &str) -> Result<Attributes, InspectorError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT name, value FROM attributes WHERE id = ? ORDER BY name, value")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;

        let mut attributes = Attributes::new();
        for (name, value) in rows {
            attributes.entry(name).or_default().push(value);
        }
        Ok(attributes)
    }

    /// Record the end of the active session for `id`, purging its attributes and options.
    ///
    /// Returns `false` without touching anything if there is no active session.
    pub async fn finish(&self, id: &str, error: Option<&str>) -> Result<bool, InspectorError> {
        Ok(self.finish_inner(id, None, error).await?.is_some())
    }

    /// Like `finish`, but only for the session lifetime `generation`.
    ///
    /// Returns the recorded finish time, or `None` if that lifetime is already
    /// finished, was replaced, or was purged.
    pub async fn finish_lifetime(
        &self,
        id: &str,
        generation: i64,
        error: Option<&str>,
    ) -> Result<Option<DateTime<Utc>>, InspectorError> {
        self.finish_inner(id, Some(generation), error).await
    }

    async fn finish_inner(
        &self,
        id: &str,
        generation: Option<i64>,
        error: Option<&str>,
    ) -> Result<Option<DateTime<Utc>>, InspectorError> {
        let finished_at = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE sessions SET finished_at = ?, error = ?
            WHERE id = ? AND finished_at IS NULL AND (? IS NULL OR generation = ?)
            "#,
        )
        .bind(finished_at)
        .bind(error)
        .bind(id)
        .bind(generation)
        .bind(generation)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tracing::warn!(
                node = %id,
                generation = ?generation,
                error = ?error,
                "Ignoring finish for a session that is no longer active"
            );
            return Ok(None);
        }

        sqlx::query("DELETE FROM attributes WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM options WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(from_millis(finished_at))
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Session, InspectorError> {
        fetch_session(&self.pool, id)
            .await?
            .ok_or_else(|| InspectorError::NotFound(format!("Could not find node {} in cache", id)))
    }

    /// Find the active session matching any of the given attributes.
    ///
    /// Candidates are the union of matches across all attribute names.
    pub async fn find_by_attributes(
        &self,
        criteria: &Attributes,
    ) -> Result<SessionHandle, InspectorError> {
        let mut found = BTreeSet::new();

        for (name, values) in criteria {
            let values = non_empty(values);
            if values.is_empty() {
                tracing::debug!(attribute = %name, "Empty value for attribute, skipping");
                continue;
            }

            tracing::debug!(attribute = %name, values = ?values, "Trying attribute for node look up");

            let mut query: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT DISTINCT id FROM attributes WHERE name = ");
            query.push_bind(name.clone());
            query.push(" AND value IN (");
            let mut separated = query.separated(", ");
            for value in &values {
                separated.push_bind(value.clone());
            }
            separated.push_unseparated(")");

            let rows: Vec<(String,)> = query.build_query_as().fetch_all(&self.pool).await?;
            found.extend(rows.into_iter().map(|r| r.0));
        }

        let mut candidates = found.into_iter();
        let id = match (candidates.next(), candidates.next()) {
            (None, _) => {
                return Err(InspectorError::NotFound(format!(
                    "Could not find a node for attributes {:?}",
                    criteria
                )));
            }
            (Some(first), Some(second)) => {
                let mut all = vec![first, second];
                all.extend(candidates);
                return Err(InspectorError::AmbiguousMatch {
                    criteria: format!("{:?}", criteria),
                    candidates: all,
                });
            }
            (Some(id), None) => id,
        };

        let session = fetch_session(&self.pool, &id).await?.ok_or_else(|| {
            InspectorError::NotFound(format!(
                "Could not find node {} in introspection cache, probably it's not on introspection now",
                id
            ))
        })?;

        if let Some(finished_at) = session.finished_at {
            return Err(InspectorError::AlreadyFinished { id, finished_at });
        }

        Ok(SessionHandle::new(self.clone(), session))
    }

    /// Every value of attribute `name` claimed by an active session.
    pub async fn active_attribute_values(
        &self,
        name: &str,
    ) -> Result<BTreeSet<String>, InspectorError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT value FROM attributes WHERE name = ?")
            .bind(name)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// MAC addresses of all nodes currently on introspection.
    pub async fn active_macs(&self) -> Result<BTreeSet<String>, InspectorError> {
        self.active_attribute_values(MACS_ATTRIBUTE).await
    }

    /// Purge old finished sessions and time out stale active ones.
    ///
    /// Returns the ids of sessions timed out by this pass.
    pub async fn sweep(&self) -> Result<Vec<String>, InspectorError> {
        let now = Utc::now().timestamp_millis();
        let keep_threshold = now - self.config.node_status_keep_time_secs.saturating_mul(1000);

        let mut tx = self.pool.begin().await?;

        // finished sessions own no attributes or options; drop strays with their row anyway
        sqlx::query(
            "DELETE FROM attributes WHERE id IN (SELECT id FROM sessions WHERE finished_at < ?)",
        )
        .bind(keep_threshold)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM options WHERE id IN (SELECT id FROM sessions WHERE finished_at < ?)")
            .bind(keep_threshold)
            .execute(&mut *tx)
            .await?;
        let purged = sqlx::query("DELETE FROM sessions WHERE finished_at < ?")
            .bind(keep_threshold)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if purged > 0 {
            tracing::debug!(purged, "Purged outdated session status");
        }

        if self.config.timeout_secs <= 0 {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let threshold = now - self.config.timeout_secs.saturating_mul(1000);
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            UPDATE sessions SET finished_at = ?, error = ?
            WHERE started_at < ? AND finished_at IS NULL
            RETURNING id
            "#,
        )
        .bind(now)
        .bind(TIMEOUT_ERROR)
        .bind(threshold)
        .fetch_all(&mut *tx)
        .await?;

        let mut timed_out: Vec<String> = rows.into_iter().map(|r| r.0).collect();
        timed_out.sort();

        for id in &timed_out {
            sqlx::query("DELETE FROM attributes WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM options WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        if !timed_out.is_empty() {
            tracing::error!(nodes = ?timed_out, "Introspection for nodes has timed out");
        }

        Ok(timed_out)
    }
}

fn non_empty(values: &[String]) -> Vec<String> {
    values.iter().filter(|v| !v.is_empty()).cloned().collect()
}

async fn fetch_session<'e, E>(executor: E, id: &str) -> Result<Option<Session>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row: Option<SessionRow> =
        sqlx::query_as("SELECT id, generation, started_at, finished_at, error FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(executor)
            .await?;
    Ok(row.map(Session::from))
}

/// Insert one attribute row per value, only while the session (lifetime) is active.
async fn claim_attribute(
    conn: &mut SqliteConnection,
    id: &str,
    generation: Option<i64>,
    name: &str,
    values: &[String],
) -> Result<(), InspectorError> {
    for value in values {
        let result = sqlx::query(
            r#"
            INSERT INTO attributes (name, value, id)
            SELECT ?, ?, id FROM sessions
            WHERE id = ? AND finished_at IS NULL AND (? IS NULL OR generation = ?)
            "#,
        )
        .bind(name)
        .bind(value)
        .bind(id)
        .bind(generation)
        .bind(generation)
        .execute(&mut *conn)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => {
                return Err(inactive_error(conn, id, generation).await);
            }
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                tracing::error!(
                    node = %id,
                    attribute = %name,
                    error = %db,
                    "Database integrity error during adding attributes"
                );
                return Err(InspectorError::DuplicateAttribute {
                    name: name.to_string(),
                    values: values.to_vec(),
                });
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Explain why a write for `id` matched no active session.
async fn inactive_error(
    conn: &mut SqliteConnection,
    id: &str,
    generation: Option<i64>,
) -> InspectorError {
    match fetch_session(&mut *conn, id).await {
        Ok(Some(session)) if generation.is_some_and(|g| g != session.generation) => {
            InspectorError::Superseded { id: id.to_string() }
        }
        Ok(Some(Session {
            finished_at: Some(finished_at),
            ..
        })) => InspectorError::AlreadyFinished {
            id: id.to_string(),
            finished_at,
        },
        Ok(_) => InspectorError::NotFound(format!("Could not find node {} in cache", id)),
        Err(e) => e.into(),
    }
}

// ============================================================================
// TESTS
// ============================================================================
