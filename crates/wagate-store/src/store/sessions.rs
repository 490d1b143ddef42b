//! Session records.

use super::{parse_opt_ts, parse_ts, ts, Store};
use chrono::Utc;
use tracing::debug;
use wagate_core::error::GatewayError;
use wagate_core::session::{ProxyConfig, SessionFilter, SessionId, SessionRecord};

type SessionRow = (
    String,
    String,
    Option<String>,
    bool,
    Option<String>,
    Option<String>,
    String,
    String,
    Option<String>,
    Option<String>,
);

const SESSION_COLUMNS: &str = "id, name, device_jid, connected, last_error, proxy, \
     created_at, updated_at, connected_at, last_seen";

fn record_from_row(row: SessionRow) -> Result<SessionRecord, GatewayError> {
    let (
        id,
        name,
        device_jid,
        connected,
        last_error,
        proxy,
        created_at,
        updated_at,
        connected_at,
        last_seen,
    ) = row;
    let id = id
        .parse::<SessionId>()
        .map_err(|e| GatewayError::Store(format!("bad session id '{id}': {e}")))?;
    let proxy = proxy
        .as_deref()
        .map(serde_json::from_str::<ProxyConfig>)
        .transpose()?;
    Ok(SessionRecord {
        id,
        name,
        device_jid,
        connected,
        last_error,
        proxy,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        connected_at: parse_opt_ts(connected_at)?,
        last_seen: parse_opt_ts(last_seen)?,
    })
}

impl Store {
    /// Insert a new session. Fails with `SessionAlreadyExists` on a name clash.
    pub async fn create_session(&self, record: &SessionRecord) -> Result<(), GatewayError> {
        let proxy = record
            .proxy
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result = sqlx::query(
            "INSERT INTO sessions (id, name, device_jid, connected, last_error, proxy, \
             created_at, updated_at, connected_at, last_seen) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(&record.name)
        .bind(&record.device_jid)
        .bind(record.connected)
        .bind(&record.last_error)
        .bind(proxy)
        .bind(ts(&record.created_at))
        .bind(ts(&record.updated_at))
        .bind(record.connected_at.as_ref().map(ts))
        .bind(record.last_seen.as_ref().map(ts))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(session_id = %record.id, name = %record.name, "session created");
                Ok(())
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(GatewayError::SessionAlreadyExists(record.name.clone()))
            }
            Err(e) => Err(GatewayError::Store(format!("create session failed: {e}"))),
        }
    }

    pub async fn get_session(&self, id: SessionId) -> Result<Option<SessionRecord>, GatewayError> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("get session failed: {e}")))?;

        row.map(record_from_row).transpose()
    }

    pub async fn get_session_by_name(
        &self,
        name: &str,
    ) -> Result<Option<SessionRecord>, GatewayError> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("get session by name failed: {e}")))?;

        row.map(record_from_row).transpose()
    }

    /// Page through sessions ordered by creation time.
    pub async fn list_sessions(
        &self,
        filter: &SessionFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SessionRecord>, GatewayError> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE (?1 IS NULL OR connected = ?1) \
             AND (?2 IS NULL OR substr(name, 1, length(?2)) = ?2) \
             ORDER BY created_at ASC, name ASC LIMIT ?3 OFFSET ?4"
        ))
        .bind(filter.connected)
        .bind(filter.name_prefix.as_deref())
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("list sessions failed: {e}")))?;

        rows.into_iter().map(record_from_row).collect()
    }

    pub async fn count_sessions(&self, filter: &SessionFilter) -> Result<u64, GatewayError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sessions \
             WHERE (?1 IS NULL OR connected = ?1) \
             AND (?2 IS NULL OR substr(name, 1, length(?2)) = ?2)",
        )
        .bind(filter.connected)
        .bind(filter.name_prefix.as_deref())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("count sessions failed: {e}")))?;

        Ok(count.max(0) as u64)
    }

    /// Overwrite every mutable column. The name is immutable and is not written.
    pub async fn update_session(&self, record: &SessionRecord) -> Result<(), GatewayError> {
        let proxy = record
            .proxy
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result = sqlx::query(
            "UPDATE sessions SET device_jid = ?, connected = ?, last_error = ?, proxy = ?, \
             updated_at = ?, connected_at = ?, last_seen = ? WHERE id = ?",
        )
        .bind(&record.device_jid)
        .bind(record.connected)
        .bind(&record.last_error)
        .bind(proxy)
        .bind(ts(&Utc::now()))
        .bind(record.connected_at.as_ref().map(ts))
        .bind(record.last_seen.as_ref().map(ts))
        .bind(record.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("update session failed: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(GatewayError::SessionNotFound(record.id.to_string()));
        }
        Ok(())
    }

    /// Persist the durable connection intent. Setting it stamps `connected_at`.
    pub async fn set_connection(
        &self,
        id: SessionId,
        connected: bool,
        last_error: Option<&str>,
    ) -> Result<(), GatewayError> {
        let now = ts(&Utc::now());
        sqlx::query(
            "UPDATE sessions SET connected = ?, last_error = ?, updated_at = ?, \
             connected_at = CASE WHEN ? THEN ? ELSE connected_at END WHERE id = ?",
        )
        .bind(connected)
        .bind(last_error)
        .bind(&now)
        .bind(connected)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("set connection failed: {e}")))?;
        Ok(())
    }

    /// Record or clear the paired device address.
    pub async fn set_device_jid(
        &self,
        id: SessionId,
        device_jid: Option<&str>,
    ) -> Result<(), GatewayError> {
        sqlx::query("UPDATE sessions SET device_jid = ?, updated_at = ? WHERE id = ?")
            .bind(device_jid)
            .bind(ts(&Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| GatewayError::Store(format!("set device jid failed: {e}")))?;
        Ok(())
    }

    pub async fn touch_last_seen(&self, id: SessionId) -> Result<(), GatewayError> {
        sqlx::query("UPDATE sessions SET last_seen = ? WHERE id = ?")
            .bind(ts(&Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| GatewayError::Store(format!("touch last_seen failed: {e}")))?;
        Ok(())
    }

    /// Delete a session record. Returns whether a row was removed.
    pub async fn delete_session(&self, id: SessionId) -> Result<bool, GatewayError> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| GatewayError::Store(format!("delete session failed: {e}")))?;
        Ok(result.rows_affected() > 0)
    }
}
