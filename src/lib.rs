//! This crate turns a PostgreSQL SELECT into a live result set: subscribe
//! with a query and receive the initial snapshot followed by an ongoing
//! stream of insert, update and delete events as the underlying tables
//! change.
//!
//! The crate is agnostic over the implementation of the database session.
//! An example implementation is provided for `tokio-postgres` which is
//! enabled by default.
//!
//! # Basic example
//!
//! ```no_run
//! use pg_query_watch::connection::postgres::connect;
//! use pg_query_watch::watcher::{QueryEvent, Watcher};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (client, notifications) =
//!         connect("host=localhost user=postgres", tokio_postgres::NoTls)
//!             .await
//!             .unwrap();
//!     let watcher = Watcher::new(client, notifications).await.unwrap();
//!
//!     let mut subscription = watcher.watch("SELECT name, score FROM players");
//!     while let Some(event) = subscription.recv().await {
//!         match event {
//!             QueryEvent::Ready => println!("watching"),
//!             QueryEvent::Insert { id, data } => println!("+ {id}: {data}"),
//!             QueryEvent::Update { id, data } => println!("~ {id}: {data}"),
//!             QueryEvent::Delete { id } => println!("- {id}"),
//!             QueryEvent::Changes { rows, .. } => println!("batch of {}", rows.len()),
//!             QueryEvent::Error(e) => eprintln!("error: {e}"),
//!         }
//!     }
//! }
//! ```
//!
//! # How it works
//!
//! Every base table a watched query reads gets two persistent meta columns:
//! a row identity assigned once by a `BEFORE INSERT` trigger and a row
//! revision reassigned from a shared sequence by a `BEFORE INSERT OR
//! UPDATE` trigger. The user query is rewritten (see [`rewrite`]) so each
//! result row carries an identity composed from its source rows and the
//! greatest of their revisions.
//!
//! Each subscription owns a session-local shadow table mirroring the
//! `(identity, revision)` pairs of its last evaluated result. A single
//! composite statement (see [`diff`]) compares the current result against
//! the shadow, updates the shadow in place and returns the change set.
//!
//! Change detection is driven by `LISTEN`/`NOTIFY`: every watched table
//! gets one statement-level trigger (see [`trigger`]) that reports writes
//! on a shared channel. A scheduler (see [`watcher`]) marks the affected
//! subscriptions stale and re-evaluates them one at a time, stalest first,
//! so bursts of writes coalesce into a single evaluation per subscription.
//!
//! # Change granularity
//!
//! A notification only says that a table was written, not which rows were
//! affected; every notification re-evaluates the whole query and the
//! change set is derived by diffing against the shadow. This trades
//! re-execution cost for exact per-row events without replicating the
//! database's query engine.
//!
//! # Single session
//!
//! One [`watcher::Watcher`] owns one database session. Shadow tables and
//! the notification wiring are session-local; when the session ends they
//! disappear with it and the engine reports `ConnectionLost` to every
//! subscription.
//!
//! # Custom integrations
//!
//! [`connection::SqlClientAsync`] and [`connection::SqlNotificationsAsync`]
//! describe the small statement surface the engine needs; implement them to
//! run the engine over a pooled session, a proxy or a test double.

pub mod connection;
pub mod diff;
pub mod ident;
pub mod rewrite;
pub mod trigger;
pub mod watcher;
