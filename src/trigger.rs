//! Notification trigger installation.
//!
//! Every base table referenced by any watched query gets exactly one
//! statement-level trigger that reports writes on the shared notification
//! channel, with the table's key as payload. The trigger function lives in
//! `pg_temp`, so the wiring disappears with the session; the trigger itself
//! is dropped and re-created on installation, which makes the whole
//! procedure idempotent across engine restarts on a pooled server.

use crate::connection::SqlClientAsync;
use crate::diff::OBJECT_PREFIX;
use crate::ident::{quote_ident, quote_literal};
use crate::rewrite::{table_key, SourceTable};
use crate::watcher::WatchError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

/// Channel all notification triggers report on. One `LISTEN` per session.
pub const NOTIFY_CHANNEL: &str = OBJECT_PREFIX;

/// The `LISTEN` statement for the notification channel.
pub fn listen_sql() -> String {
    format!("LISTEN {}", quote_ident(NOTIFY_CHANNEL))
}

fn trigger_name(key: &str) -> String {
    format!("{OBJECT_PREFIX}{key}")
}

fn drop_trigger_sql(table: &SourceTable, key: &str) -> String {
    format!(
        "DROP TRIGGER IF EXISTS {} ON {}",
        quote_ident(&trigger_name(key)),
        table.qualified(),
    )
}

fn create_function_sql(key: &str) -> String {
    format!(
        "CREATE OR REPLACE FUNCTION pg_temp.{name}() RETURNS trigger LANGUAGE plpgsql AS $qw$\n\
         BEGIN\n\
         \x20   PERFORM pg_notify({channel}, {payload});\n\
         \x20   RETURN NULL;\n\
         END\n\
         $qw$",
        name = quote_ident(&trigger_name(key)),
        channel = quote_literal(NOTIFY_CHANNEL),
        payload = quote_literal(key),
    )
}

fn create_trigger_sql(table: &SourceTable, key: &str) -> String {
    format!(
        "CREATE TRIGGER {name} AFTER INSERT OR UPDATE OR DELETE OR TRUNCATE ON {table} \
         FOR EACH STATEMENT EXECUTE FUNCTION pg_temp.{name}()",
        name = quote_ident(&trigger_name(key)),
        table = table.qualified(),
    )
}

/// Single-flight cache of per-table installations.
///
/// Keyed by table id; the first caller for a key runs the installation and
/// every concurrent caller awaits that same attempt. A completed cell is
/// never re-run, so a trigger is installed at most once per session. A
/// failed attempt leaves the cell empty and the next watcher referencing
/// the table retries.
#[derive(Default)]
pub struct InstallCache {
    cells: Mutex<HashMap<usize, Arc<OnceCell<()>>>>,
}

impl InstallCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, id: usize) -> Arc<OnceCell<()>> {
        Arc::clone(self.cells.lock().entry(id).or_default())
    }

    /// Run `init` for `id` unless a previous run already completed;
    /// concurrent callers for the same id share one attempt.
    pub async fn run_once<F, Fut>(&self, id: usize, init: F) -> Result<(), WatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), WatchError>>,
    {
        let cell = self.cell(id);
        cell.get_or_try_init(init).await.map(|_| ())
    }

    /// Number of completed installations. Test and diagnostics aid.
    pub fn installed(&self) -> usize {
        self.cells
            .lock()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }
}

/// Install the notification trigger for one base table: drop any previous
/// trigger of the same name, create the session-local trigger function,
/// then bind the statement-level trigger. The three steps run in that
/// order; any failure aborts the installation.
async fn install_one<C: SqlClientAsync>(
    client: &C,
    id: usize,
    table: &SourceTable,
) -> Result<(), WatchError> {
    let key = table_key(id);
    let failed = |e: C::Error| WatchError::TriggerInstall {
        table: table.qualified(),
        source: Box::new(e),
    };

    debug!(table = %table.qualified(), key = %key, "installing notify trigger");
    client
        .sql_execute(&drop_trigger_sql(table, &key))
        .await
        .map_err(failed)?;
    client
        .sql_execute(&create_function_sql(&key))
        .await
        .map_err(failed)?;
    client
        .sql_execute(&create_trigger_sql(table, &key))
        .await
        .map_err(failed)?;
    Ok(())
}

/// Ensure every table in `tables` has its notification trigger, sharing
/// in-flight installations with concurrent watchers through `cache`.
pub async fn install_notify_triggers<C: SqlClientAsync>(
    client: &C,
    cache: &InstallCache,
    tables: &[(usize, SourceTable)],
) -> Result<(), WatchError> {
    for (id, table) in tables {
        cache
            .run_once(*id, || install_one(client, *id, table))
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t(name: &str) -> SourceTable {
        SourceTable {
            schema: "public".to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn test_listen_sql() {
        assert_eq!(listen_sql(), "LISTEN \"__qw__\"");
    }

    #[test]
    fn test_drop_trigger_sql() {
        assert_eq!(
            drop_trigger_sql(&t("orders"), "a"),
            "DROP TRIGGER IF EXISTS \"__qw__a\" ON \"public\".\"orders\"",
        );
    }

    #[test]
    fn test_function_sql_notifies_with_key_payload() {
        let sql = create_function_sql("a");
        assert!(sql.starts_with("CREATE OR REPLACE FUNCTION pg_temp.\"__qw__a\"()"));
        assert!(sql.contains("PERFORM pg_notify('__qw__', 'a');"));
        assert!(sql.contains("RETURN NULL;"));
    }

    #[test]
    fn test_trigger_sql_covers_all_statement_kinds() {
        let sql = create_trigger_sql(&t("orders"), "a");
        assert!(sql.contains("AFTER INSERT OR UPDATE OR DELETE OR TRUNCATE"));
        assert!(sql.contains("ON \"public\".\"orders\""));
        assert!(sql.contains("FOR EACH STATEMENT"));
        assert!(sql.contains("EXECUTE FUNCTION pg_temp.\"__qw__a\"()"));
    }

    #[tokio::test]
    async fn test_run_once_runs_initializer_once() {
        let cache = InstallCache::new();
        let runs = AtomicUsize::new(0);
        for _ in 0..3 {
            cache
                .run_once(7, || async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(cache.installed(), 1);
    }

    #[tokio::test]
    async fn test_run_once_concurrent_callers_share_one_attempt() {
        let cache = Arc::new(InstallCache::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                cache
                    .run_once(1, || async move {
                        tokio::task::yield_now().await;
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_once_failed_attempt_is_retried() {
        let cache = InstallCache::new();
        let err = cache
            .run_once(2, || async {
                Err(WatchError::TriggerInstall {
                    table: "\"public\".\"t\"".to_string(),
                    source: "boom".into(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::TriggerInstall { .. }));
        assert_eq!(cache.installed(), 0);

        cache.run_once(2, || async { Ok(()) }).await.unwrap();
        assert_eq!(cache.installed(), 1);
    }

    #[tokio::test]
    async fn test_install_skips_already_installed_tables() {
        #[derive(Default)]
        struct Recorder {
            statements: Mutex<Vec<String>>,
        }
        impl SqlClientAsync for Recorder {
            type Error = Infallible;
            async fn sql_execute(&self, sql: &str) -> Result<(), Infallible> {
                self.statements.lock().push(sql.to_string());
                Ok(())
            }
            async fn sql_query_text(
                &self,
                _sql: &str,
            ) -> Result<Vec<Vec<Option<String>>>, Infallible> {
                Ok(Vec::new())
            }
            async fn sql_query_columns(&self, _sql: &str) -> Result<Vec<String>, Infallible> {
                Ok(Vec::new())
            }
            async fn sql_query_changes(
                &self,
                _statement: &str,
                _sql: &str,
                _last_rev: i64,
            ) -> Result<Vec<crate::diff::ChangeRow>, Infallible> {
                Ok(Vec::new())
            }
        }

        let client = Arc::new(Recorder::default());
        let cache = InstallCache::new();
        let tables = vec![(0, t("t")), (1, t("u"))];
        install_notify_triggers(client.as_ref(), &cache, &tables)
            .await
            .unwrap();
        assert_eq!(client.statements.lock().len(), 6);

        // A second watcher over an overlapping set installs nothing new.
        let overlapping = vec![(1, t("u")), (2, t("w"))];
        install_notify_triggers(client.as_ref(), &cache, &overlapping)
            .await
            .unwrap();
        let statements = client.statements.lock();
        assert_eq!(statements.len(), 9);
        assert!(statements[0].starts_with("DROP TRIGGER IF EXISTS \"__qw__0\""));
        assert!(statements[1].starts_with("CREATE OR REPLACE FUNCTION pg_temp.\"__qw__0\""));
        assert!(statements[2].starts_with("CREATE TRIGGER \"__qw__0\""));
        assert!(statements[6].contains("\"__qw__2\""));
    }
}
