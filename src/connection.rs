//! Database connection abstraction.
//!
//! The engine owns exactly one long-lived connection and issues a small,
//! fixed set of statement shapes through it: DDL for shadow tables and
//! triggers, catalog lookups, a prepare-only column probe and the prepared
//! diff statement. These traits describe exactly that surface so the engine
//! stays agnostic over the driver; an example implementation for
//! `tokio-postgres` is provided behind the `tokio-postgres` feature.

use crate::diff::ChangeRow;
use std::error::Error;
use std::future::Future;

#[cfg(feature = "tokio-postgres")]
pub mod postgres;

/// An asynchronous notification delivered by the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlNotification {
    /// Channel the notification was sent on.
    pub channel: String,
    /// Payload string; for this crate, a watched table's key.
    pub payload: String,
}

/// Defines an implementation capable of executing the SQL statements the
/// engine issues on a single database session.
///
/// Methods take `&self`: setup statements for different watchers may be in
/// flight at the same time and implementations are expected to pipeline or
/// serialize them internally. The engine itself never runs more than one
/// diff statement at a time.
pub trait SqlClientAsync: Send + Sync + 'static {
    type Error: Error + Send + Sync + 'static;

    /// Execute a statement whose result rows, if any, are irrelevant
    /// (DDL, `LISTEN`, trigger installation).
    ///
    /// # Errors
    ///
    /// Should return error if the statement failed.
    fn sql_execute(&self, sql: &str) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Run a query whose columns are all cast to text by the caller and
    /// return the rows. Used for catalog lookups.
    ///
    /// # Errors
    ///
    /// Should return error if the query failed.
    fn sql_query_text(
        &self,
        sql: &str,
    ) -> impl Future<Output = Result<Vec<Vec<Option<String>>>, Self::Error>> + Send;

    /// Prepare `sql` and report the names of its result columns in declared
    /// order. No rows are fetched.
    ///
    /// # Errors
    ///
    /// Should return error if preparation failed.
    fn sql_query_columns(
        &self,
        sql: &str,
    ) -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send;

    /// Run the diff statement `sql`, prepared under `statement` so the
    /// server caches its plan, binding `$1 = last_rev`, and decode the
    /// change set.
    ///
    /// # Errors
    ///
    /// Should return error if preparation, execution or decoding failed.
    fn sql_query_changes(
        &self,
        statement: &str,
        sql: &str,
        last_rev: i64,
    ) -> impl Future<Output = Result<Vec<ChangeRow>, Self::Error>> + Send;
}

/// Defines the notification half of a database session.
///
/// The engine registers exactly one listener per session and consumes this
/// stream from a dedicated router task.
pub trait SqlNotificationsAsync: Send + 'static {
    type Error: Error + Send + Sync + 'static;

    /// Await the next asynchronous notification.
    ///
    /// # Errors
    ///
    /// Should return error when the connection is gone; the engine treats
    /// that as fatal and shuts down.
    fn sql_recv_notification(
        &mut self,
    ) -> impl Future<Output = Result<SqlNotification, Self::Error>> + Send;
}
