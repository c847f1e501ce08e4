//! Query rewriting: row identity, row revision and base-table discovery.
//!
//! A watched SELECT is rewritten so every result row carries two meta
//! columns: a stable identity and a monotonically increasing revision. Both
//! are derived from columns maintained on the base tables themselves: a
//! persistent identity column assigned once per row by a `BEFORE INSERT`
//! trigger, and a revision column reassigned from a shared sequence by a
//! `BEFORE INSERT OR UPDATE` trigger on every write.
//!
//! The engine does not parse SQL. Base tables are discovered through the
//! database by anchoring the user query as a temporary view and reading its
//! dependencies from `pg_depend`; the meta projection is then injected into
//! the user SELECT's select list by a single lexical scan that only needs to
//! recognize comments, string literals, parenthesis nesting and the leading
//! `WITH`/`DISTINCT` keywords.

use crate::connection::SqlClientAsync;
use crate::diff::OBJECT_PREFIX;
use crate::ident::{quote_ident, quote_literal, quote_qualified};
use crate::watcher::WatchError;
use std::collections::BTreeMap;
use tracing::debug;

/// Shared identity context: the names of the two meta columns and of the
/// revision sequence all watched queries draw from.
///
/// Every row of every rewritten query carries exactly these two meta
/// columns; they never appear in user-visible output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaColumns {
    id: String,
    rev: String,
    sequence: String,
}

impl Default for MetaColumns {
    fn default() -> Self {
        Self::new("__id__", "__rev__")
    }
}

impl MetaColumns {
    /// Use custom meta column names. The revision sequence name is fixed.
    pub fn new(id: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: rev.into(),
            sequence: format!("{OBJECT_PREFIX}rev"),
        }
    }

    /// Name of the row-identity column.
    pub fn id_column(&self) -> &str {
        &self.id
    }

    /// Name of the row-revision column.
    pub fn rev_column(&self) -> &str {
        &self.rev
    }

    /// Name of the shared revision sequence.
    pub fn sequence(&self) -> &str {
        &self.sequence
    }

    /// Statement creating the shared revision sequence.
    pub fn create_sequence_sql(&self) -> String {
        format!("CREATE SEQUENCE IF NOT EXISTS {}", quote_ident(&self.sequence))
    }
}

/// A base table referenced by one or more watched queries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SourceTable {
    pub schema: String,
    pub name: String,
}

impl SourceTable {
    /// Fully-qualified, quoted identifier.
    pub fn qualified(&self) -> String {
        quote_qualified(&self.schema, &self.name)
    }
}

/// Assigns each base table a dense id; the id's base36 rendering is the
/// table key carried in notification payloads and trigger names.
#[derive(Debug, Default)]
pub struct TableRegistry {
    ids: BTreeMap<SourceTable, usize>,
    tables: Vec<SourceTable>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the id for `table`, assigning the next one on first sight.
    pub fn intern(&mut self, table: &SourceTable) -> usize {
        if let Some(id) = self.ids.get(table) {
            return *id;
        }
        let id = self.tables.len();
        self.tables.push(table.clone());
        self.ids.insert(table.clone(), id);
        id
    }

    pub fn get(&self, id: usize) -> Option<&SourceTable> {
        self.tables.get(id)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Iterate all known tables in id order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &SourceTable)> {
        self.tables.iter().enumerate()
    }
}

/// Render a table id as its short key (base36).
pub fn table_key(id: usize) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut n = id;
    let mut buf = Vec::with_capacity(4);
    loop {
        buf.push(DIGITS[n % 36]);
        n /= 36;
        if n == 0 {
            break;
        }
    }
    buf.reverse();
    String::from_utf8(buf).expect("base36 digits are ascii")
}

/// Parse a notification payload back into a table id.
pub fn parse_table_key(key: &str) -> Option<usize> {
    if key.is_empty() || key.chars().any(|c| c.is_ascii_uppercase()) {
        return None;
    }
    usize::from_str_radix(key, 36).ok()
}

/// Name of the throwaway view used to discover a query's base tables.
fn discovery_view_name(index: u64) -> String {
    format!("{OBJECT_PREFIX}v{index}")
}

fn discovery_sql(view: &str) -> String {
    let view_literal = quote_literal(&quote_ident(view));
    format!(
        "SELECT n.nspname::text, c.relname::text, c.relkind::text\n\
         FROM pg_depend d\n\
         JOIN pg_rewrite r ON r.oid = d.objid\n\
         JOIN pg_class c ON c.oid = d.refobjid\n\
         JOIN pg_namespace n ON n.oid = c.relnamespace\n\
         WHERE r.ev_class = {view_literal}::regclass\n\
         \x20 AND d.refobjsubid > 0\n\
         \x20 AND c.oid <> {view_literal}::regclass\n\
         GROUP BY 1, 2, 3\n\
         ORDER BY 1, 2",
    )
}

/// Discover the base relations a SELECT reads, through the database.
///
/// The query is anchored as a temporary view; its dependencies are read
/// from the rewrite system's catalog entries and the view is dropped again.
///
/// # Errors
///
/// A query that fails to plan surfaces as [`WatchError::Introspection`];
/// a referenced relation that is not an ordinary (or partitioned) table
/// surfaces as [`WatchError::UnsupportedSource`].
pub async fn discover_tables<C: SqlClientAsync>(
    client: &C,
    sql: &str,
    view_index: u64,
) -> Result<Vec<SourceTable>, WatchError> {
    let view = discovery_view_name(view_index);
    let create = format!("CREATE TEMP VIEW {} AS {sql}", quote_ident(&view));
    client
        .sql_execute(&create)
        .await
        .map_err(WatchError::introspection)?;

    let rows = client.sql_query_text(&discovery_sql(&view)).await;
    let drop = format!("DROP VIEW IF EXISTS {}", quote_ident(&view));
    // Drop before inspecting the result so the view never outlives discovery.
    let dropped = client.sql_execute(&drop).await;
    let rows = rows.map_err(WatchError::introspection)?;
    dropped.map_err(WatchError::introspection)?;

    let mut tables = Vec::with_capacity(rows.len());
    for row in rows {
        let get = |i: usize| -> Result<String, WatchError> {
            row.get(i)
                .cloned()
                .flatten()
                .ok_or_else(|| WatchError::introspection_msg("catalog row missing a column"))
        };
        let table = SourceTable {
            schema: get(0)?,
            name: get(1)?,
        };
        let relkind = get(2)?;
        if relkind != "r" && relkind != "p" {
            return Err(WatchError::UnsupportedSource {
                relation: table.qualified(),
                reason: format!("relation of kind {relkind:?} cannot carry identity columns"),
            });
        }
        tables.push(table);
    }
    debug!(query = sql, tables = ?tables, "discovered base tables");
    Ok(tables)
}

/// Install the identity and revision infrastructure on one base table:
/// the two meta columns, the `BEFORE` triggers maintaining them and a
/// backfill for pre-existing rows.
///
/// Idempotent; re-running on an already prepared table is harmless.
///
/// # Errors
///
/// Any failure surfaces as [`WatchError::UnsupportedSource`] naming the
/// table: a relation that cannot accept the columns cannot be watched.
pub async fn ensure_meta_infrastructure<C: SqlClientAsync>(
    client: &C,
    meta: &MetaColumns,
    table: &SourceTable,
) -> Result<(), WatchError> {
    let unsupported = |e: C::Error| WatchError::UnsupportedSource {
        relation: table.qualified(),
        reason: e.to_string(),
    };

    let qualified = table.qualified();
    let id_col = quote_ident(meta.id_column());
    let rev_col = quote_ident(meta.rev_column());
    let sequence = quote_literal(&quote_ident(meta.sequence()));

    let statements = [
        format!("ALTER TABLE {qualified} ADD COLUMN IF NOT EXISTS {id_col} text"),
        format!("ALTER TABLE {qualified} ADD COLUMN IF NOT EXISTS {rev_col} bigint"),
        format!(
            "CREATE OR REPLACE FUNCTION {prefix}ident() RETURNS trigger LANGUAGE plpgsql AS $qw$\n\
             BEGIN\n\
             \x20   IF NEW.{id_col} IS NULL THEN\n\
             \x20       NEW.{id_col} := gen_random_uuid()::text;\n\
             \x20   END IF;\n\
             \x20   RETURN NEW;\n\
             END\n\
             $qw$",
            prefix = quote_prefixed("ident"),
        ),
        format!(
            "CREATE OR REPLACE FUNCTION {prefix}touch() RETURNS trigger LANGUAGE plpgsql AS $qw$\n\
             BEGIN\n\
             \x20   NEW.{rev_col} := nextval({sequence});\n\
             \x20   RETURN NEW;\n\
             END\n\
             $qw$",
            prefix = quote_prefixed("touch"),
        ),
        format!("DROP TRIGGER IF EXISTS {trigger} ON {qualified}", trigger = quote_ident(&format!("{OBJECT_PREFIX}id"))),
        format!(
            "CREATE TRIGGER {trigger} BEFORE INSERT ON {qualified} FOR EACH ROW EXECUTE FUNCTION {prefix}ident()",
            trigger = quote_ident(&format!("{OBJECT_PREFIX}id")),
            prefix = quote_prefixed("ident"),
        ),
        format!("DROP TRIGGER IF EXISTS {trigger} ON {qualified}", trigger = quote_ident(&format!("{OBJECT_PREFIX}rev"))),
        format!(
            "CREATE TRIGGER {trigger} BEFORE INSERT OR UPDATE ON {qualified} FOR EACH ROW EXECUTE FUNCTION {prefix}touch()",
            trigger = quote_ident(&format!("{OBJECT_PREFIX}rev")),
            prefix = quote_prefixed("touch"),
        ),
        // The update trigger fills the revision column as a side effect.
        format!("UPDATE {qualified} SET {id_col} = gen_random_uuid()::text WHERE {id_col} IS NULL"),
        format!("UPDATE {qualified} SET {rev_col} = nextval({sequence}) WHERE {rev_col} IS NULL"),
    ];

    debug!(table = %qualified, "installing identity infrastructure");
    for statement in &statements {
        client.sql_execute(statement).await.map_err(unsupported)?;
    }
    Ok(())
}

/// Quoted, prefixed function name (`"__qw__ident"` for `"ident"`).
fn quote_prefixed(suffix: &str) -> String {
    quote_ident(&format!("{OBJECT_PREFIX}{suffix}"))
}

/// Compose the meta projection for a set of base tables and inject it into
/// the user SELECT.
///
/// Per-row identity is the `':'`-joined identity of every source row that
/// produced the result row; per-row revision is the greatest of the source
/// revisions. Each reference is qualified by the bare relation name, which
/// is how an unaliased table is addressed from its own select list; a query
/// that aliases all its sources fails downstream at introspection time.
pub fn rewrite_select(
    sql: &str,
    meta: &MetaColumns,
    tables: &[SourceTable],
) -> Result<String, WatchError> {
    if tables.is_empty() {
        // No sources: a constant result. Fixed identity, revision 1 so the
        // row clears the initial insert gate exactly once.
        let projection = format!(
            "''::text AS {id_col}, 1::bigint AS {rev_col}",
            id_col = quote_ident(meta.id_column()),
            rev_col = quote_ident(meta.rev_column()),
        );
        return inject_projection(sql, &projection);
    }

    let id_refs = tables
        .iter()
        .map(|t| format!("{}.{}", quote_ident(&t.name), quote_ident(meta.id_column())))
        .collect::<Vec<_>>()
        .join(", ");
    let rev_refs = tables
        .iter()
        .map(|t| format!("{}.{}", quote_ident(&t.name), quote_ident(meta.rev_column())))
        .collect::<Vec<_>>()
        .join(", ");

    let projection = format!(
        "concat_ws(':', {id_refs}) AS {id_col}, greatest({rev_refs}) AS {rev_col}",
        id_col = quote_ident(meta.id_column()),
        rev_col = quote_ident(meta.rev_column()),
    );
    inject_projection(sql, &projection)
}

/// Introspect the user-visible output columns of a rewritten SELECT.
///
/// Prepares `SELECT * FROM (<sql>) q WHERE 0 = 1` purely for its column
/// descriptor and strips the two meta columns, preserving declared order.
///
/// # Errors
///
/// Fails with [`WatchError::Introspection`] carrying the database error.
pub async fn introspect_columns<C: SqlClientAsync>(
    client: &C,
    meta: &MetaColumns,
    sql_rewritten: &str,
) -> Result<Vec<String>, WatchError> {
    let probe = format!("SELECT * FROM (\n{sql_rewritten}\n) q WHERE 0 = 1");
    let columns = client
        .sql_query_columns(&probe)
        .await
        .map_err(WatchError::introspection)?;
    Ok(columns
        .into_iter()
        .filter(|c| c != meta.id_column() && c != meta.rev_column())
        .collect())
}

/// Inject `projection` at the head of the select list of the first
/// top-level SELECT in `sql`.
///
/// The scan tracks line and block comments, single-quoted and dollar-quoted
/// literals, quoted identifiers and parenthesis depth, so a leading WITH
/// clause is skipped and SELECTs inside subqueries are never touched. A
/// trailing `DISTINCT [ON (...)]` or `ALL` keyword is stepped over so the
/// projection lands inside the quantified select list.
fn inject_projection(sql: &str, projection: &str) -> Result<String, WatchError> {
    let select_end = find_top_level_select(sql).ok_or_else(|| {
        WatchError::introspection_msg("query has no top-level SELECT to rewrite")
    })?;
    let insert_at = skip_set_quantifier(sql, select_end);
    let mut rewritten = String::with_capacity(sql.len() + projection.len() + 2);
    rewritten.push_str(&sql[..insert_at]);
    rewritten.push(' ');
    rewritten.push_str(projection);
    rewritten.push(',');
    rewritten.push_str(&sql[insert_at..]);
    Ok(rewritten)
}

/// Byte offset just past the first `SELECT` keyword at parenthesis depth 0,
/// outside comments and literals.
fn find_top_level_select(sql: &str) -> Option<usize> {
    let bytes = sql.as_bytes();
    let mut depth = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'(' => {
                depth += 1;
                i += 1;
            }
            b')' => {
                depth = depth.saturating_sub(1);
                i += 1;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = skip_line_comment(bytes, i);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = skip_block_comment(bytes, i);
            }
            b'\'' => {
                i = skip_quoted(bytes, i, b'\'');
            }
            b'"' => {
                i = skip_quoted(bytes, i, b'"');
            }
            b'$' => {
                i = skip_dollar_quoted(bytes, i);
            }
            c if is_word_byte(c) => {
                let start = i;
                while i < bytes.len() && is_word_byte(bytes[i]) {
                    i += 1;
                }
                if depth == 0 && sql[start..i].eq_ignore_ascii_case("select") {
                    return Some(i);
                }
            }
            _ => i += 1,
        }
    }
    None
}

/// Advance past a `DISTINCT [ON (...)]` or `ALL` quantifier following a
/// SELECT keyword that ends at `select_end`. Returns the byte offset the
/// projection is inserted at; trailing whitespace stays in the remainder.
fn skip_set_quantifier(sql: &str, select_end: usize) -> usize {
    let bytes = sql.as_bytes();
    let mut i = skip_space_and_comments(bytes, select_end);
    let start = i;
    while i < bytes.len() && is_word_byte(bytes[i]) {
        i += 1;
    }
    let word = &sql[start..i];
    if word.eq_ignore_ascii_case("all") {
        return i;
    }
    if word.eq_ignore_ascii_case("distinct") {
        let mut j = skip_space_and_comments(bytes, i);
        let on_start = j;
        while j < bytes.len() && is_word_byte(bytes[j]) {
            j += 1;
        }
        if sql[on_start..j].eq_ignore_ascii_case("on") {
            j = skip_space_and_comments(bytes, j);
            if bytes.get(j) == Some(&b'(') {
                let mut depth = 0usize;
                while j < bytes.len() {
                    match bytes[j] {
                        b'(' => depth += 1,
                        b')' => {
                            depth -= 1;
                            if depth == 0 {
                                return j + 1;
                            }
                        }
                        _ => {}
                    }
                    j += 1;
                }
            }
        }
        return i;
    }
    select_end
}

fn skip_space_and_comments(bytes: &[u8], mut i: usize) -> usize {
    loop {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i < bytes.len() && bytes[i] == b'-' && bytes.get(i + 1) == Some(&b'-') {
            i = skip_line_comment(bytes, i);
        } else if i < bytes.len() && bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
            i = skip_block_comment(bytes, i);
        } else {
            return i;
        }
    }
}

fn skip_line_comment(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i] != b'\n' {
        i += 1;
    }
    i
}

fn skip_block_comment(bytes: &[u8], mut i: usize) -> usize {
    // Block comments nest in PostgreSQL.
    let mut depth = 0usize;
    while i < bytes.len() {
        if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
            depth += 1;
            i += 2;
        } else if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
            depth -= 1;
            i += 2;
            if depth == 0 {
                return i;
            }
        } else {
            i += 1;
        }
    }
    i
}

fn skip_quoted(bytes: &[u8], mut i: usize, quote: u8) -> usize {
    i += 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
            } else {
                return i + 1;
            }
        } else {
            i += 1;
        }
    }
    i
}

fn skip_dollar_quoted(bytes: &[u8], start: usize) -> usize {
    // Match $tag$ ... $tag$; a lone '$' (positional parameter) passes through.
    let mut i = start + 1;
    while i < bytes.len() && (is_word_byte(bytes[i]) && !bytes[i].is_ascii_digit()) {
        i += 1;
    }
    if i >= bytes.len() || bytes[i] != b'$' {
        return start + 1;
    }
    let tag = &bytes[start..=i];
    let mut j = i + 1;
    while j + tag.len() <= bytes.len() {
        if &bytes[j..j + tag.len()] == tag {
            return j + tag.len();
        }
        j += 1;
    }
    bytes.len()
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> MetaColumns {
        MetaColumns::default()
    }

    fn t(name: &str) -> SourceTable {
        SourceTable {
            schema: "public".to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn test_table_key_base36() {
        assert_eq!(table_key(0), "0");
        assert_eq!(table_key(9), "9");
        assert_eq!(table_key(10), "a");
        assert_eq!(table_key(35), "z");
        assert_eq!(table_key(36), "10");
        assert_eq!(table_key(36 * 36 + 1), "101");
    }

    #[test]
    fn test_parse_table_key_round_trip() {
        for id in [0usize, 1, 35, 36, 1295, 46656] {
            assert_eq!(parse_table_key(&table_key(id)), Some(id));
        }
        assert_eq!(parse_table_key(""), None);
        assert_eq!(parse_table_key("A"), None);
        assert_eq!(parse_table_key("not a key"), None);
    }

    #[test]
    fn test_registry_assigns_dense_stable_ids() {
        let mut registry = TableRegistry::new();
        let a = registry.intern(&t("a"));
        let b = registry.intern(&t("b"));
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(registry.intern(&t("a")), 0);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(1), Some(&t("b")));
        assert_eq!(registry.get(2), None);
    }

    #[test]
    fn test_registry_distinguishes_schemas() {
        let mut registry = TableRegistry::new();
        let public = registry.intern(&t("a"));
        let other = registry.intern(&SourceTable {
            schema: "other".to_string(),
            name: "a".to_string(),
        });
        assert_ne!(public, other);
    }

    #[test]
    fn test_rewrite_single_table() {
        let sql = rewrite_select("SELECT a FROM t", &meta(), &[t("t")]).unwrap();
        assert_eq!(
            sql,
            "SELECT concat_ws(':', \"t\".\"__id__\") AS \"__id__\", \
             greatest(\"t\".\"__rev__\") AS \"__rev__\", a FROM t",
        );
    }

    #[test]
    fn test_rewrite_join_concatenates_identities() {
        let sql = rewrite_select(
            "SELECT a FROM t JOIN u ON t.x = u.x",
            &meta(),
            &[t("t"), t("u")],
        )
        .unwrap();
        assert!(sql.contains("concat_ws(':', \"t\".\"__id__\", \"u\".\"__id__\")"));
        assert!(sql.contains("greatest(\"t\".\"__rev__\", \"u\".\"__rev__\")"));
    }

    #[test]
    fn test_rewrite_honors_custom_meta_names() {
        let meta = MetaColumns::new("_uid", "_seq");
        let sql = rewrite_select("SELECT a FROM t", &meta, &[t("t")]).unwrap();
        assert!(sql.contains("\"t\".\"_uid\""));
        assert!(sql.contains("AS \"_uid\""));
        assert!(sql.contains("\"t\".\"_seq\""));
    }

    #[test]
    fn test_inject_skips_leading_with_clause() {
        let sql = rewrite_select(
            "WITH recent AS (SELECT * FROM t WHERE ts > now()) SELECT a FROM recent, t",
            &meta(),
            &[t("t")],
        )
        .unwrap();
        let inner = sql.find("(SELECT * FROM t").unwrap();
        let injected = sql.find("concat_ws").unwrap();
        assert!(injected > inner, "projection must land in the outer SELECT");
    }

    #[test]
    fn test_inject_ignores_select_inside_strings_and_comments() {
        let sql = rewrite_select(
            "-- select nothing\nSELECT a, 'select b' AS label FROM t",
            &meta(),
            &[t("t")],
        )
        .unwrap();
        assert!(sql.starts_with("-- select nothing\nSELECT concat_ws"));
        assert!(sql.ends_with("a, 'select b' AS label FROM t"));
    }

    #[test]
    fn test_inject_after_distinct() {
        let sql = rewrite_select("SELECT DISTINCT a FROM t", &meta(), &[t("t")]).unwrap();
        assert!(sql.starts_with("SELECT DISTINCT concat_ws"));
    }

    #[test]
    fn test_inject_after_distinct_on() {
        let sql =
            rewrite_select("SELECT DISTINCT ON (a) a, b FROM t", &meta(), &[t("t")]).unwrap();
        assert!(sql.starts_with("SELECT DISTINCT ON (a) concat_ws"));
        assert!(sql.contains(", a, b FROM t"));
    }

    #[test]
    fn test_inject_is_case_insensitive() {
        let sql = rewrite_select("select a from t", &meta(), &[t("t")]).unwrap();
        assert!(sql.starts_with("select concat_ws"));
    }

    #[test]
    fn test_rewrite_without_sources_uses_constant_meta() {
        let sql = rewrite_select("SELECT 1 AS one", &meta(), &[]).unwrap();
        assert_eq!(
            sql,
            "SELECT ''::text AS \"__id__\", 1::bigint AS \"__rev__\", 1 AS one",
        );
    }

    #[test]
    fn test_inject_rejects_non_select() {
        let err = rewrite_select("TABLE t", &meta(), &[t("t")]).unwrap_err();
        assert!(matches!(err, WatchError::Introspection { .. }));
    }

    #[test]
    fn test_inject_does_not_match_identifier_prefix() {
        // "selection" must not be mistaken for the SELECT keyword.
        let sql = rewrite_select(
            "WITH selection AS (SELECT a FROM t) SELECT a FROM selection, t",
            &meta(),
            &[t("t")],
        )
        .unwrap();
        let injected = sql.find("concat_ws").unwrap();
        assert!(injected > sql.find(") SELECT").unwrap());
    }

    #[test]
    fn test_discovery_sql_filters_self_and_groups() {
        let sql = discovery_sql("__qw__v7");
        assert!(sql.contains("'\"__qw__v7\"'::regclass"));
        assert!(sql.contains("pg_depend"));
        assert!(sql.contains("d.refobjsubid > 0"));
        assert!(sql.contains("GROUP BY 1, 2, 3"));
    }

    #[test]
    fn test_create_sequence_sql() {
        assert_eq!(
            meta().create_sequence_sql(),
            "CREATE SEQUENCE IF NOT EXISTS \"__qw__rev\"",
        );
    }
}
