//! Device identity blobs.

use super::{ts, Store};
use chrono::Utc;
use tracing::debug;
use wagate_core::error::GatewayError;
use wagate_core::jid::Jid;
use wagate_core::session::SessionId;
use wagate_core::wa::DeviceIdentity;

impl Store {
    /// Write (or replace) the identity of a session's device.
    pub async fn save_device(
        &self,
        session_id: SessionId,
        device: &DeviceIdentity,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT OR REPLACE INTO devices (session_id, jid, identity, updated_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(session_id.to_string())
        .bind(device.jid.to_string())
        .bind(&device.blob)
        .bind(ts(&Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Store(format!("save device failed: {e}")))?;

        debug!(session_id = %session_id, jid = %device.jid, "device identity saved");
        Ok(())
    }

    pub async fn load_device(
        &self,
        session_id: SessionId,
    ) -> Result<Option<DeviceIdentity>, GatewayError> {
        let row: Option<(String, Vec<u8>)> =
            sqlx::query_as("SELECT jid, identity FROM devices WHERE session_id = ?")
                .bind(session_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| GatewayError::Store(format!("load device failed: {e}")))?;

        match row {
            Some((jid, blob)) => {
                let jid: Jid = jid
                    .parse()
                    .map_err(|_| GatewayError::Store(format!("corrupt device jid '{jid}'")))?;
                Ok(Some(DeviceIdentity { jid, blob }))
            }
            None => Ok(None),
        }
    }

    /// Delete a session's device identity. Returns whether one existed.
    pub async fn delete_device(&self, session_id: SessionId) -> Result<bool, GatewayError> {
        let result = sqlx::query("DELETE FROM devices WHERE session_id = ?")
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| GatewayError::Store(format!("delete device failed: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    /// Sessions that have a stored device identity.
    pub async fn list_device_session_ids(&self) -> Result<Vec<SessionId>, GatewayError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT session_id FROM devices")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| GatewayError::Store(format!("list devices failed: {e}")))?;

        rows.into_iter()
            .map(|(id,)| {
                id.parse::<SessionId>()
                    .map_err(|e| GatewayError::Store(format!("bad device session id '{id}': {e}")))
            })
            .collect()
    }
}
