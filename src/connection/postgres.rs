//! Connection trait implementations for `tokio-postgres`.
//!
//! Requires the `tokio-postgres` feature to be enabled.
//!
//! [`connect`] opens a session, spawns the task that drives the connection
//! and returns the two halves the engine needs: a [`PgWatchClient`] for
//! statements and a [`PgNotifications`] stream for `NOTIFY` traffic.

use crate::connection::{SqlClientAsync, SqlNotification, SqlNotificationsAsync};
use crate::diff::{ChangeOp, ChangeRow};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::{AsyncMessage, Notification, Socket, Statement};
use tracing::error;

/// Errors surfaced by the `tokio-postgres` integration.
#[derive(Debug, thiserror::Error)]
pub enum PgError {
    #[error(transparent)]
    Db(#[from] tokio_postgres::Error),
    /// The diff statement returned an op code outside 1..=3.
    #[error("diff returned unknown op code {0}")]
    UnknownOp(i32),
    /// The connection task ended; no further notifications will arrive.
    #[error("notification stream closed")]
    Closed,
}

/// Statement half of a watched session.
///
/// Wraps a `tokio_postgres::Client` and caches the prepared diff statement
/// of each watcher under its statement name, so re-evaluations reuse the
/// server-side plan.
pub struct PgWatchClient {
    client: Arc<tokio_postgres::Client>,
    statements: Mutex<HashMap<String, Statement>>,
}

impl PgWatchClient {
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client: Arc::new(client),
            statements: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying client.
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }

    async fn prepared(&self, statement: &str, sql: &str) -> Result<Statement, PgError> {
        if let Some(prepared) = self.statements.lock().get(statement).cloned() {
            return Ok(prepared);
        }
        let prepared = self.client.prepare(sql).await?;
        self.statements
            .lock()
            .insert(statement.to_string(), prepared.clone());
        Ok(prepared)
    }
}

impl SqlClientAsync for PgWatchClient {
    type Error = PgError;

    async fn sql_execute(&self, sql: &str) -> Result<(), PgError> {
        self.client.batch_execute(sql).await.map_err(PgError::from)
    }

    async fn sql_query_text(&self, sql: &str) -> Result<Vec<Vec<Option<String>>>, PgError> {
        let rows = self.client.query(sql, &[]).await?;
        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = Vec::with_capacity(row.len());
            for i in 0..row.len() {
                values.push(row.try_get::<_, Option<String>>(i)?);
            }
            result.push(values);
        }
        Ok(result)
    }

    async fn sql_query_columns(&self, sql: &str) -> Result<Vec<String>, PgError> {
        let statement = self.client.prepare(sql).await?;
        Ok(statement
            .columns()
            .iter()
            .map(|column| column.name().to_string())
            .collect())
    }

    async fn sql_query_changes(
        &self,
        statement: &str,
        sql: &str,
        last_rev: i64,
    ) -> Result<Vec<ChangeRow>, PgError> {
        let prepared = self.prepared(statement, sql).await?;
        let rows = self.client.query(&prepared, &[&last_rev]).await?;
        let mut changes = Vec::with_capacity(rows.len());
        for row in rows {
            let op_code: i32 = row.try_get(1)?;
            let op = ChangeOp::from_code(op_code as i16).ok_or(PgError::UnknownOp(op_code))?;
            changes.push(ChangeRow {
                id: row.try_get(0)?,
                op,
                rn: row.try_get(2)?,
                data: row.try_get(3)?,
                rev: row.try_get(4)?,
            });
        }
        Ok(changes)
    }
}

/// Notification half of a watched session.
pub struct PgNotifications {
    receiver: UnboundedReceiver<Notification>,
}

impl SqlNotificationsAsync for PgNotifications {
    type Error = PgError;

    async fn sql_recv_notification(&mut self) -> Result<SqlNotification, PgError> {
        let notification = self.receiver.recv().await.ok_or(PgError::Closed)?;
        Ok(SqlNotification {
            channel: notification.channel().to_string(),
            payload: notification.payload().to_string(),
        })
    }
}

/// Connect to the database and split the session into its statement and
/// notification halves. The task driving the connection is spawned onto
/// the current runtime; when it ends, the notification stream reports
/// [`PgError::Closed`] and the engine shuts down.
pub async fn connect<T>(
    config: &str,
    tls: T,
) -> Result<(PgWatchClient, PgNotifications), PgError>
where
    T: MakeTlsConnect<Socket>,
    T::Stream: Send + 'static,
{
    let (client, mut connection) = tokio_postgres::connect(config, tls).await?;
    let (sender, receiver) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
        while let Some(message) = messages.next().await {
            match message {
                Ok(AsyncMessage::Notification(notification)) => {
                    if sender.send(notification).is_err() {
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "database connection failed");
                    return;
                }
            }
        }
    });
    Ok((PgWatchClient::new(client), PgNotifications { receiver }))
}
