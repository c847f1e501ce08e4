//! Shadow tables and the three-way diff statement.
//!
//! Each watched query owns one session-local shadow table holding the
//! `(id, rev)` pairs of its last evaluated result. A single composite
//! statement compares the current result against the shadow, reconciles the
//! shadow in place and returns the full insert/update/delete change set.
//! Because the comparison and the reconciliation happen in one statement,
//! no concurrent reader can observe a partially updated shadow.

use crate::ident::{prefixed_col_list, quote_ident, quote_literal};
use crate::rewrite::MetaColumns;

/// Prefix shared by every database object this crate creates.
pub const OBJECT_PREFIX: &str = "__qw__";

/// Kind of change to a single result row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum ChangeOp {
    /// Row newly present in the result.
    Insert = 1,
    /// Row whose revision advanced.
    Update = 2,
    /// Row no longer in the result.
    Delete = 3,
}

impl ChangeOp {
    /// Decode the `op` column of the diff statement.
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(ChangeOp::Insert),
            2 => Some(ChangeOp::Update),
            3 => Some(ChangeOp::Delete),
            _ => None,
        }
    }
}

/// One record of the change set produced by a diff run.
#[derive(Debug, Clone)]
pub struct ChangeRow {
    /// md5 of the row identity; key of the shadow table.
    pub id: String,
    /// What happened to the row.
    pub op: ChangeOp,
    /// Row number within the current result. `None` for deletes.
    pub rn: Option<i64>,
    /// User-visible column values in column order. `None` for deletes.
    pub data: Option<serde_json::Value>,
    /// Revision carried by the row after this diff.
    pub rev: i64,
}

/// Name of the `n`-th shadow table.
pub fn shadow_table_name(n: u64) -> String {
    format!("{OBJECT_PREFIX}{n}")
}

/// Name under which a shadow's diff statement is prepared, so the server
/// caches one plan per watched query.
pub fn diff_statement_name(shadow: &str) -> String {
    format!("{shadow}_diff")
}

/// `CREATE TEMP TABLE` statement for a shadow table. The table is empty on
/// creation and lives until the database session ends.
pub fn create_shadow_sql(shadow: &str) -> String {
    format!(
        "CREATE TEMP TABLE {} (id TEXT PRIMARY KEY, rev BIGINT NOT NULL)",
        quote_ident(shadow),
    )
}

/// Build the composite diff statement for one watcher.
///
/// The statement is a CTE pipeline over the rewritten query and the shadow:
///
/// * `q` — current result with identity hashed, a row number and the
///   user-visible columns packed into a JSON array.
/// * `u` — shadow rows whose revision advanced (the update set).
/// * `d` — shadow rows absent from the result (the delete set); each delete
///   takes a fresh revision from the shared sequence so revisions observed
///   by subscribers never go backwards.
/// * `i` — result rows newer than `$1` that are neither updated nor already
///   shadowed (the insert set). Gating on `$1` rather than the shadow alone
///   keeps identities whose delete is still pending in this same statement
///   from being re-inserted.
///
/// `$1` is the watcher's last observed revision.
pub fn build_diff_sql(
    shadow: &str,
    cols: &[String],
    sql_rewritten: &str,
    meta: &MetaColumns,
) -> String {
    let shadow = quote_ident(shadow);
    let id_col = quote_ident(meta.id_column());
    let rev_col = quote_ident(meta.rev_column());
    let sequence = quote_literal(&quote_ident(meta.sequence()));
    let data = format!("jsonb_build_array({})", prefixed_col_list("s", cols));

    format!(
        "WITH q AS (\n\
         \x20   SELECT md5(s.{id_col}::text) AS id,\n\
         \x20          s.{rev_col}::bigint AS rev,\n\
         \x20          row_number() OVER () AS rn,\n\
         \x20          {data} AS data\n\
         \x20   FROM (\n{sql_rewritten}\n) s\n\
         ),\n\
         u AS (\n\
         \x20   UPDATE {shadow} t SET rev = q.rev FROM q\n\
         \x20   WHERE t.id = q.id AND q.rev > t.rev\n\
         \x20   RETURNING t.id, t.rev\n\
         ),\n\
         d AS (\n\
         \x20   DELETE FROM {shadow} t\n\
         \x20   WHERE NOT EXISTS (SELECT 1 FROM q WHERE q.id = t.id)\n\
         \x20   RETURNING t.id, nextval({sequence}) AS rev\n\
         ),\n\
         i AS (\n\
         \x20   INSERT INTO {shadow} (id, rev)\n\
         \x20   SELECT q.id, q.rev FROM q\n\
         \x20   WHERE q.rev > $1\n\
         \x20     AND NOT EXISTS (SELECT 1 FROM u WHERE u.id = q.id)\n\
         \x20     AND NOT EXISTS (SELECT 1 FROM {shadow} t WHERE t.id = q.id)\n\
         \x20   RETURNING id, rev\n\
         )\n\
         SELECT q.id, 1 AS op, q.rn, q.data, i.rev FROM i JOIN q ON q.id = i.id\n\
         UNION ALL\n\
         SELECT q.id, 2 AS op, q.rn, q.data, u.rev FROM u JOIN q ON q.id = u.id\n\
         UNION ALL\n\
         SELECT d.id, 3 AS op, NULL::bigint AS rn, NULL::jsonb AS data, d.rev FROM d",
    )
}

/// Fold a change set into a watcher's greatest observed revision.
/// The result never decreases.
pub fn fold_last_rev(last_rev: i64, rows: &[ChangeRow]) -> i64 {
    rows.iter().map(|r| r.rev).fold(last_rev, i64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> MetaColumns {
        MetaColumns::default()
    }

    #[test]
    fn test_shadow_table_name() {
        assert_eq!(shadow_table_name(0), "__qw__0");
        assert_eq!(shadow_table_name(17), "__qw__17");
    }

    #[test]
    fn test_diff_statement_name_derived_from_shadow() {
        assert_eq!(diff_statement_name("__qw__3"), "__qw__3_diff");
    }

    #[test]
    fn test_create_shadow_sql() {
        assert_eq!(
            create_shadow_sql("__qw__1"),
            "CREATE TEMP TABLE \"__qw__1\" (id TEXT PRIMARY KEY, rev BIGINT NOT NULL)",
        );
    }

    #[test]
    fn test_change_op_from_code() {
        assert_eq!(ChangeOp::from_code(1), Some(ChangeOp::Insert));
        assert_eq!(ChangeOp::from_code(2), Some(ChangeOp::Update));
        assert_eq!(ChangeOp::from_code(3), Some(ChangeOp::Delete));
        assert_eq!(ChangeOp::from_code(0), None);
        assert_eq!(ChangeOp::from_code(4), None);
    }

    #[test]
    fn test_diff_sql_hashes_identity_and_numbers_rows() {
        let sql = build_diff_sql(
            "__qw__1",
            &["a".to_string()],
            "SELECT \"t\".\"__id__\", \"t\".\"__rev__\", a FROM t",
            &meta(),
        );
        assert!(sql.contains("md5(s.\"__id__\"::text) AS id"));
        assert!(sql.contains("s.\"__rev__\"::bigint AS rev"));
        assert!(sql.contains("row_number() OVER () AS rn"));
        assert!(sql.contains("jsonb_build_array(s.\"a\") AS data"));
    }

    #[test]
    fn test_diff_sql_insert_gate_uses_last_rev_parameter() {
        let sql = build_diff_sql("__qw__2", &["a".to_string()], "SELECT 1", &meta());
        assert!(sql.contains("WHERE q.rev > $1"));
        assert!(sql.contains("NOT EXISTS (SELECT 1 FROM u WHERE u.id = q.id)"));
        assert!(sql.contains("NOT EXISTS (SELECT 1 FROM \"__qw__2\" t WHERE t.id = q.id)"));
    }

    #[test]
    fn test_diff_sql_delete_takes_fresh_revision() {
        let sql = build_diff_sql("__qw__2", &[], "SELECT 1", &meta());
        assert!(sql.contains("RETURNING t.id, nextval('\"__qw__rev\"') AS rev"));
    }

    #[test]
    fn test_diff_sql_projects_three_ops() {
        let sql = build_diff_sql("__qw__2", &["a".to_string()], "SELECT 1", &meta());
        assert!(sql.contains("SELECT q.id, 1 AS op"));
        assert!(sql.contains("SELECT q.id, 2 AS op"));
        assert!(sql.contains("SELECT d.id, 3 AS op, NULL::bigint AS rn, NULL::jsonb AS data"));
        assert_eq!(sql.matches("UNION ALL").count(), 2);
    }

    #[test]
    fn test_diff_sql_quotes_user_columns() {
        let sql = build_diff_sql(
            "__qw__2",
            &["a".to_string(), "weird col".to_string()],
            "SELECT 1",
            &meta(),
        );
        assert!(sql.contains("jsonb_build_array(s.\"a\", s.\"weird col\")"));
    }

    #[test]
    fn test_fold_last_rev_takes_max_and_never_decreases() {
        let rows = vec![
            ChangeRow {
                id: "x".into(),
                op: ChangeOp::Insert,
                rn: Some(1),
                data: Some(serde_json::json!([1])),
                rev: 7,
            },
            ChangeRow {
                id: "y".into(),
                op: ChangeOp::Delete,
                rn: None,
                data: None,
                rev: 12,
            },
        ];
        assert_eq!(fold_last_rev(3, &rows), 12);
        assert_eq!(fold_last_rev(40, &rows), 40);
        assert_eq!(fold_last_rev(5, &[]), 5);
    }
}
