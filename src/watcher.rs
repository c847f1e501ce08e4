//! The watcher hub: watch sessions, the notify router and the scheduler.
//!
//! The [`Watcher`] owns one database session. Calling [`Watcher::watch`]
//! returns a [`Subscription`] immediately; setup (shadow table, query
//! rewriting, trigger installation) runs in the background and the
//! subscription reports `Ready` once the first evaluation is scheduled.
//!
//! A router task consumes the session's notification stream and marks every
//! dependent watcher stale; a scheduler task repeatedly picks the stalest
//! watcher, clears its counter and runs its diff. At most one diff is in
//! flight at any time, which both preserves statement ordering on the shared
//! session and lets notification bursts coalesce into a single evaluation.

use crate::connection::{SqlClientAsync, SqlNotificationsAsync};
use crate::diff::{
    build_diff_sql, create_shadow_sql, diff_statement_name, fold_last_rev, shadow_table_name,
    ChangeOp, ChangeRow,
};
use crate::rewrite::{
    discover_tables, ensure_meta_infrastructure, introspect_columns, parse_table_key,
    rewrite_select, MetaColumns, SourceTable, TableRegistry,
};
use crate::trigger::{install_notify_triggers, listen_sql, InstallCache, NOTIFY_CHANNEL};
use fixedbitset::FixedBitSet;
use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error};

new_key_type! {
    /// Handle for a watched query inside the scheduler.
    struct WatchKey;
}

/// Boxed driver error carried inside [`WatchError`].
pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// Failure of a subscription or of the engine, by phase.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The query reads a relation that cannot carry the identity and
    /// revision columns. Fatal to the watcher.
    #[error("unsupported source relation {relation}: {reason}")]
    UnsupportedSource { relation: String, reason: String },

    /// Query preparation or column introspection failed. Fatal to the
    /// watcher.
    #[error("query introspection failed: {source}")]
    Introspection {
        #[source]
        source: BoxedError,
    },

    /// The notification trigger could not be installed on a base table.
    /// Fatal to every watcher awaiting that installation.
    #[error("trigger installation failed on {table}: {source}")]
    TriggerInstall {
        table: String,
        #[source]
        source: BoxedError,
    },

    /// A diff evaluation failed. The watcher stays subscribed and the next
    /// notification retries.
    #[error("diff evaluation failed: {source}")]
    Diff {
        #[source]
        source: BoxedError,
    },

    /// The database session is gone. Fatal to the engine; all shadow
    /// tables and session-local triggers died with the session.
    #[error("database connection lost")]
    ConnectionLost,
}

impl WatchError {
    pub(crate) fn introspection(source: impl Into<BoxedError>) -> Self {
        WatchError::Introspection {
            source: source.into(),
        }
    }

    pub(crate) fn introspection_msg(message: &str) -> Self {
        WatchError::Introspection {
            source: message.to_string().into(),
        }
    }
}

/// Event emitted on a [`Subscription`].
#[derive(Debug)]
pub enum QueryEvent {
    /// Initial setup completed; at least one evaluation is scheduled.
    Ready,
    /// Row newly present in the result. `data` holds the user-visible
    /// column values in column order.
    Insert { id: String, data: serde_json::Value },
    /// Row whose revision advanced.
    Update { id: String, data: serde_json::Value },
    /// Row no longer in the result.
    Delete { id: String },
    /// The full change set of one evaluation, in the order the diff
    /// statement returned it, after the per-row events of the batch.
    Changes {
        rows: Vec<ChangeRow>,
        cols: Arc<[String]>,
    },
    /// A failure in any phase of this subscription.
    Error(WatchError),
}

/// Handle to one watched query. Dropping (or [`Subscription::close`])
/// unsubscribes: the scheduler removes the watcher at its next step and
/// events of a diff already in flight are discarded.
pub struct Subscription {
    events: UnboundedReceiver<QueryEvent>,
}

impl Subscription {
    /// Await the next event. `None` once the engine shut down and all
    /// pending events were consumed.
    pub async fn recv(&mut self) -> Option<QueryEvent> {
        self.events.recv().await
    }

    /// Non-blocking variant of [`Self::recv`].
    pub fn try_recv(&mut self) -> Option<QueryEvent> {
        self.events.try_recv().ok()
    }

    /// Unsubscribe. Equivalent to dropping the handle.
    pub fn close(self) {}
}

/// Per-watcher state owned by the scheduler task.
struct WatchedQuery {
    shadow: String,
    statement: String,
    diff_sql: String,
    cols: Arc<[String]>,
    deps: FixedBitSet,
    last_rev: i64,
    stale: u64,
    enqueued_at: u64,
    events: UnboundedSender<QueryEvent>,
}

enum Command {
    Register(Box<WatchedQuery>),
    Notify(usize),
    ConnectionLost,
}

/// The engine hub. One instance per database session; create it with
/// [`Watcher::new`] and subscribe queries with [`Watcher::watch`].
pub struct Watcher<C: SqlClientAsync> {
    client: Arc<C>,
    meta: MetaColumns,
    registry: Mutex<TableRegistry>,
    meta_installs: InstallCache,
    notify_installs: InstallCache,
    counter: AtomicU64,
    commands: UnboundedSender<Command>,
}

impl<C: SqlClientAsync> Watcher<C> {
    /// Create a hub over `client`, register the session's listener and
    /// spawn the router and scheduler tasks.
    ///
    /// # Errors
    ///
    /// Returns error if the listener or the shared revision sequence could
    /// not be set up.
    pub async fn new<N>(client: C, notifications: N) -> Result<Arc<Self>, WatchError>
    where
        N: SqlNotificationsAsync,
    {
        Self::with_meta_columns(client, notifications, MetaColumns::default()).await
    }

    /// Same as [`Watcher::new`] with custom meta column names.
    pub async fn with_meta_columns<N>(
        client: C,
        notifications: N,
        meta: MetaColumns,
    ) -> Result<Arc<Self>, WatchError>
    where
        N: SqlNotificationsAsync,
    {
        let client = Arc::new(client);
        client.sql_execute(&listen_sql()).await.map_err(|e| {
            error!(error = %e, "failed to LISTEN on the notification channel");
            WatchError::ConnectionLost
        })?;
        client
            .sql_execute(&meta.create_sequence_sql())
            .await
            .map_err(WatchError::introspection)?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(route_notifications(notifications, commands.clone()));
        tokio::spawn(scheduler_loop(Arc::clone(&client), command_rx));

        Ok(Arc::new(Self {
            client,
            meta,
            registry: Mutex::new(TableRegistry::new()),
            meta_installs: InstallCache::new(),
            notify_installs: InstallCache::new(),
            counter: AtomicU64::new(0),
            commands,
        }))
    }

    /// Subscribe to the live result of `sql`.
    ///
    /// Returns immediately. In the background a shadow table is allocated,
    /// the query is rewritten and introspected, the notification triggers
    /// are installed and the watcher is scheduled for its initial
    /// evaluation; the subscription then emits `Ready`, followed by one
    /// `Changes` batch (and its per-row events) per evaluation. Any setup
    /// failure arrives as a single `Error` event.
    pub fn watch(self: &Arc<Self>, sql: &str) -> Subscription {
        let (events, receiver) = mpsc::unbounded_channel();
        let hub = Arc::clone(self);
        let sql = sql.to_string();
        tokio::spawn(async move {
            match hub.prepare_watch(&sql, events.clone()).await {
                Ok(watched) => {
                    // The scheduler emits Ready on registration.
                    let _ = hub.commands.send(Command::Register(watched));
                }
                Err(e) => {
                    debug!(query = %sql, error = %e, "watch setup failed");
                    let _ = events.send(QueryEvent::Error(e));
                }
            }
        });
        Subscription { events: receiver }
    }

    /// Base tables watched by any subscription so far, in registry order.
    pub fn observed_tables(&self) -> Vec<String> {
        self.registry
            .lock()
            .iter()
            .map(|(_, table)| table.qualified())
            .collect()
    }

    async fn prepare_watch(
        &self,
        sql: &str,
        events: UnboundedSender<QueryEvent>,
    ) -> Result<Box<WatchedQuery>, WatchError> {
        let index = self.counter.fetch_add(1, Ordering::Relaxed);
        let shadow = shadow_table_name(index);

        // Shadow allocation touches no object the rewrite depends on, so
        // the two setup halves run concurrently on the pipelined session.
        let allocate_shadow = async {
            self.client
                .sql_execute(&create_shadow_sql(&shadow))
                .await
                .map_err(WatchError::introspection)
        };
        let rewrite = async {
            let tables = discover_tables(self.client.as_ref(), sql, index).await?;
            let entries: Vec<(usize, SourceTable)> = {
                let mut registry = self.registry.lock();
                tables
                    .iter()
                    .map(|table| (registry.intern(table), table.clone()))
                    .collect()
            };
            for (id, table) in &entries {
                self.meta_installs
                    .run_once(*id, || {
                        ensure_meta_infrastructure(self.client.as_ref(), &self.meta, table)
                    })
                    .await?;
            }
            let rewritten = rewrite_select(sql, &self.meta, &tables)?;
            let cols = introspect_columns(self.client.as_ref(), &self.meta, &rewritten).await?;
            Ok::<_, WatchError>((entries, rewritten, cols))
        };
        let (allocated, rewritten) = tokio::join!(allocate_shadow, rewrite);
        allocated?;
        let (entries, sql_rewritten, cols) = rewritten?;

        install_notify_triggers(self.client.as_ref(), &self.notify_installs, &entries).await?;

        let capacity = entries.iter().map(|(id, _)| id + 1).max().unwrap_or(0);
        let mut deps = FixedBitSet::with_capacity(capacity);
        for (id, _) in &entries {
            deps.insert(*id);
        }

        let diff_sql = build_diff_sql(&shadow, &cols, &sql_rewritten, &self.meta);
        debug!(shadow = %shadow, cols = ?cols, tables = entries.len(), "watch prepared");
        Ok(Box::new(WatchedQuery {
            statement: diff_statement_name(&shadow),
            shadow,
            diff_sql,
            cols: cols.into(),
            deps,
            last_rev: 0,
            stale: 0,
            enqueued_at: 0,
            events,
        }))
    }
}

/// Forward notifications from the session to the scheduler. Exactly one
/// router consumes the stream; payloads that do not decode as table keys
/// are ignored.
async fn route_notifications<N: SqlNotificationsAsync>(
    mut notifications: N,
    commands: UnboundedSender<Command>,
) {
    loop {
        match notifications.sql_recv_notification().await {
            Ok(notification) => {
                if notification.channel != NOTIFY_CHANNEL {
                    continue;
                }
                match parse_table_key(&notification.payload) {
                    Some(id) => {
                        if commands.send(Command::Notify(id)).is_err() {
                            return;
                        }
                    }
                    None => {
                        debug!(payload = %notification.payload, "ignoring malformed payload");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "notification stream closed");
                let _ = commands.send(Command::ConnectionLost);
                return;
            }
        }
    }
}

/// The scheduler: drain commands, drop closed watchers, pick the stalest
/// watcher and run its diff. One iteration evaluates at most one watcher,
/// so diffs never overlap.
#[tracing::instrument(level = tracing::Level::TRACE, skip(client, commands))]
async fn scheduler_loop<C: SqlClientAsync>(
    client: Arc<C>,
    mut commands: UnboundedReceiver<Command>,
) {
    let mut watchers: SlotMap<WatchKey, WatchedQuery> = SlotMap::with_key();
    let mut enqueue_counter: u64 = 0;
    loop {
        // Drain everything already queued so a burst of notifications
        // coalesces into a single pick.
        loop {
            match commands.try_recv() {
                Ok(command) => {
                    if !handle_command(&mut watchers, &mut enqueue_counter, command) {
                        return;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        watchers.retain(|_, watcher| !watcher.events.is_closed());

        let Some(key) = pick_stalest(&watchers) else {
            match commands.recv().await {
                Some(command) => {
                    if !handle_command(&mut watchers, &mut enqueue_counter, command) {
                        return;
                    }
                    continue;
                }
                None => return,
            }
        };

        let watcher = &mut watchers[key];
        // Clear before the diff: notifications arriving while it runs
        // re-mark the watcher and are picked up next round.
        watcher.stale = 0;
        evaluate(client.as_ref(), watcher).await;
    }
}

fn handle_command(
    watchers: &mut SlotMap<WatchKey, WatchedQuery>,
    enqueue_counter: &mut u64,
    command: Command,
) -> bool {
    match command {
        Command::Register(mut watched) => {
            *enqueue_counter += 1;
            watched.stale = 1;
            watched.enqueued_at = *enqueue_counter;
            let _ = watched.events.send(QueryEvent::Ready);
            watchers.insert(*watched);
        }
        Command::Notify(id) => {
            for (_, watcher) in watchers.iter_mut() {
                if watcher.deps.contains(id) {
                    if watcher.stale == 0 {
                        *enqueue_counter += 1;
                        watcher.enqueued_at = *enqueue_counter;
                    }
                    watcher.stale += 1;
                }
            }
        }
        Command::ConnectionLost => {
            for (_, watcher) in watchers.iter() {
                let _ = watcher.events.send(QueryEvent::Error(WatchError::ConnectionLost));
            }
            return false;
        }
    }
    true
}

/// Greatest staleness wins; ties go to whoever became stale first.
fn pick_stalest(watchers: &SlotMap<WatchKey, WatchedQuery>) -> Option<WatchKey> {
    watchers
        .iter()
        .filter(|(_, watcher)| watcher.stale > 0)
        .max_by(|(_, a), (_, b)| {
            a.stale
                .cmp(&b.stale)
                .then(b.enqueued_at.cmp(&a.enqueued_at))
        })
        .map(|(key, _)| key)
}

async fn evaluate<C: SqlClientAsync>(client: &C, watcher: &mut WatchedQuery) {
    debug!(shadow = %watcher.shadow, last_rev = watcher.last_rev, "running diff");
    let result = client
        .sql_query_changes(&watcher.statement, &watcher.diff_sql, watcher.last_rev)
        .await;
    match result {
        Ok(rows) => {
            watcher.last_rev = fold_last_rev(watcher.last_rev, &rows);
            for row in &rows {
                let event = match row.op {
                    ChangeOp::Insert => QueryEvent::Insert {
                        id: row.id.clone(),
                        data: row.data.clone().unwrap_or(serde_json::Value::Null),
                    },
                    ChangeOp::Update => QueryEvent::Update {
                        id: row.id.clone(),
                        data: row.data.clone().unwrap_or(serde_json::Value::Null),
                    },
                    ChangeOp::Delete => QueryEvent::Delete { id: row.id.clone() },
                };
                if watcher.events.send(event).is_err() {
                    // Subscriber gone mid-batch; the rest is discarded and
                    // the watcher is dropped on the next scheduler step.
                    return;
                }
            }
            let _ = watcher.events.send(QueryEvent::Changes {
                rows,
                cols: Arc::clone(&watcher.cols),
            });
        }
        Err(e) => {
            let _ = watcher.events.send(QueryEvent::Error(WatchError::Diff {
                source: Box::new(e),
            }));
        }
    }
}
