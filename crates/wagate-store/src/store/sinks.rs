//! Event sink subscriptions.

use super::{parse_ts, ts, Store};
use uuid::Uuid;
use wagate_core::error::GatewayError;
use wagate_core::event::EventType;
use wagate_core::session::SessionId;
use wagate_core::sink::{RetryPolicy, Sink, SinkTransport};

type SinkRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    bool,
    String,
);

const SINK_COLUMNS: &str =
    "id, session_id, transport, target, filter_types, secret, retry_policy, disabled, created_at";

fn sink_from_row(row: SinkRow) -> Result<Sink, GatewayError> {
    let (id, session_id, transport, target, filter_types, secret, retry_policy, disabled, created_at) =
        row;
    let id = Uuid::parse_str(&id)
        .map_err(|e| GatewayError::Store(format!("bad sink id '{id}': {e}")))?;
    let session_id = session_id
        .parse::<SessionId>()
        .map_err(|e| GatewayError::Store(format!("bad sink session id '{session_id}': {e}")))?;
    let transport = match transport.as_str() {
        "http_post" => SinkTransport::HttpPost,
        other => {
            return Err(GatewayError::Store(format!(
                "unknown sink transport '{other}'"
            )))
        }
    };
    let filter_types: Vec<EventType> = serde_json::from_str(&filter_types)?;
    let retry_policy: RetryPolicy = serde_json::from_str(&retry_policy)?;
    Ok(Sink {
        id,
        session_id,
        transport,
        target,
        filter_types,
        secret,
        retry_policy,
        disabled,
        created_at: parse_ts(&created_at)?,
    })
}

impl Store {
    pub async fn create_sink(&self, sink: &Sink) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO sinks (id, session_id, transport, target, filter_types, secret, \
             retry_policy, disabled, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(sink.id.to_string())
        .bind(sink.session_id.to_string())
        .bind(sink.transport.as_str())
        .bind(&sink.target)
        .bind(serde_json::to_string(&sink.filter_types)?)
        .bind(&sink.secret)
        .bind(serde_json::to_string(&sink.retry_policy)?)
        .bind(sink.disabled)
        .bind(ts(&sink.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("create sink failed: {e}")))?;
        Ok(())
    }

    pub async fn get_sink(&self, id: Uuid) -> Result<Option<Sink>, GatewayError> {
        let row: Option<SinkRow> =
            sqlx::query_as(&format!("SELECT {SINK_COLUMNS} FROM sinks WHERE id = ?"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| GatewayError::Store(format!("get sink failed: {e}")))?;
        row.map(sink_from_row).transpose()
    }

    pub async fn list_sinks(&self, session_id: SessionId) -> Result<Vec<Sink>, GatewayError> {
        let rows: Vec<SinkRow> = sqlx::query_as(&format!(
            "SELECT {SINK_COLUMNS} FROM sinks WHERE session_id = ? ORDER BY created_at ASC"
        ))
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("list sinks failed: {e}")))?;
        rows.into_iter().map(sink_from_row).collect()
    }

    pub async fn list_all_sinks(&self) -> Result<Vec<Sink>, GatewayError> {
        let rows: Vec<SinkRow> = sqlx::query_as(&format!(
            "SELECT {SINK_COLUMNS} FROM sinks ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("list all sinks failed: {e}")))?;
        rows.into_iter().map(sink_from_row).collect()
    }

    /// Overwrite a sink's mutable fields.
    pub async fn update_sink(&self, sink: &Sink) -> Result<(), GatewayError> {
        let result = sqlx::query(
            "UPDATE sinks SET target = ?, filter_types = ?, secret = ?, retry_policy = ?, \
             disabled = ? WHERE id = ?",
        )
        .bind(&sink.target)
        .bind(serde_json::to_string(&sink.filter_types)?)
        .bind(&sink.secret)
        .bind(serde_json::to_string(&sink.retry_policy)?)
        .bind(sink.disabled)
        .bind(sink.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("update sink failed: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(GatewayError::SinkNotFound(sink.id.to_string()));
        }
        Ok(())
    }

    pub async fn set_sink_disabled(&self, id: Uuid, disabled: bool) -> Result<(), GatewayError> {
        sqlx::query("UPDATE sinks SET disabled = ? WHERE id = ?")
            .bind(disabled)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| GatewayError::Store(format!("set sink disabled failed: {e}")))?;
        Ok(())
    }

    pub async fn delete_sink(&self, id: Uuid) -> Result<bool, GatewayError> {
        let result = sqlx::query("DELETE FROM sinks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| GatewayError::Store(format!("delete sink failed: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove every sink of a session. Returns how many were removed.
    pub async fn delete_sinks_for_session(
        &self,
        session_id: SessionId,
    ) -> Result<u64, GatewayError> {
        let result = sqlx::query("DELETE FROM sinks WHERE session_id = ?")
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| GatewayError::Store(format!("delete sinks failed: {e}")))?;
        Ok(result.rows_affected())
    }
}
