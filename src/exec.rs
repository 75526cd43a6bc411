//! The execution engine: turns a parsed `Command` into effects on a
//! `StorageEngine` and a `QueryResult` the caller can print or inspect.
//!
//! One `Engine` wraps one `StorageEngine`. A `BEGIN`/`COMMIT`/`ROLLBACK`
//! triggered explicitly by the caller spans however many subsequent
//! statements the caller sends before the matching `COMMIT`/`ROLLBACK`; a
//! single write statement sent with no transaction open is wrapped in an
//! implicit one so it is always atomic with respect to a crash mid-write.

use std::collections::HashMap;

use itertools::Itertools;

use crate::command::{
    AggregateArg, AggregateFn, Command, CompareOp, Direction, FromClause, JoinClause, JoinType,
    SelectCommand, SelectItem, WhereClause,
};
use crate::error::{Error, Result};
use crate::storage::{ColumnType, StorageEngine, TableMeta};
use crate::value::{lookup, Record, Value};

/// The result of executing one top-level statement.
#[derive(Debug, Clone)]
pub enum QueryResult {
    /// A SELECT's projected rows, with the column order the SELECT list
    /// asked for (not `Record`'s alphabetical iteration order).
    Rows {
        columns: Vec<String>,
        rows: Vec<Record>,
    },
    /// Rows affected by an INSERT/UPDATE/DELETE.
    Affected(usize),
    /// A DDL or transaction-control statement that produced no rows.
    Ack(String),
}

pub struct Engine {
    storage: StorageEngine,
}

impl Engine {
    pub fn new(storage: StorageEngine) -> Engine {
        Engine { storage }
    }

    pub fn storage(&self) -> &StorageEngine {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut StorageEngine {
        &mut self.storage
    }

    /// Executes one already-parsed statement, wrapping a write statement in
    /// an implicit transaction when the caller has no explicit one open.
    pub fn execute(&mut self, command: Command) -> Result<QueryResult> {
        match &command {
            Command::Begin | Command::Commit | Command::Rollback => {
                self.dispatch(command, &HashMap::new())
            }
            Command::Select(_) | Command::With { .. } => self.dispatch(command, &HashMap::new()),
            _ => {
                let explicit = self.storage.in_transaction();
                if explicit {
                    return self.dispatch(command, &HashMap::new());
                }
                self.storage.begin()?;
                match self.dispatch(command, &HashMap::new()) {
                    Ok(result) => {
                        self.storage.commit()?;
                        Ok(result)
                    }
                    Err(e) => {
                        let _ = self.storage.rollback();
                        Err(e)
                    }
                }
            }
        }
    }

    /// `ctes` carries the materialized results of CTEs already evaluated by
    /// an enclosing `WITH`, keyed by name, so a nested `Select` can resolve
    /// its `FROM` against them before consulting the storage engine.
    fn dispatch(&mut self, command: Command, ctes: &HashMap<String, Vec<Record>>) -> Result<QueryResult> {
        match command {
            Command::CreateTable {
                table_name,
                columns,
                primary_key,
            } => {
                self.storage.create_table(&table_name, columns, primary_key)?;
                Ok(QueryResult::Ack(format!("table {} created", table_name)))
            }
            Command::CreateIndex {
                index_name,
                table_name,
                column_name,
            } => {
                self.storage
                    .create_index(&index_name, &table_name, &column_name)?;
                Ok(QueryResult::Ack(format!("index {} created", index_name)))
            }
            Command::Insert { table_name, values } => {
                let meta = self.storage.get_table_metadata(&table_name)?;
                if values.len() != meta.schema.len() {
                    return Err(Error::constraint(format!(
                        "table {} has {} columns but {} values were given",
                        table_name,
                        meta.schema.len(),
                        values.len()
                    )));
                }
                let mut record = Record::new();
                for ((col, _), val) in meta.schema.iter().zip(values.into_iter()) {
                    record.insert(col.clone(), val);
                }
                self.storage.insert_record(&table_name, record)?;
                Ok(QueryResult::Affected(1))
            }
            Command::Update {
                table_name,
                set,
                where_clause,
            } => self.execute_update(&table_name, set, where_clause),
            Command::Delete {
                table_name,
                where_clause,
            } => self.execute_delete(&table_name, where_clause),
            Command::Select(select) => {
                let (columns, rows) = self.execute_select(&select, ctes)?;
                Ok(QueryResult::Rows { columns, rows })
            }
            Command::With { ctes: defs, main_query } => {
                let mut context = ctes.clone();
                for cte in defs {
                    let rows = match *cte.query {
                        Command::Select(select) => {
                            let (_, rows) = self.execute_select(&select, &context)?;
                            rows
                        }
                        other => {
                            return Err(Error::unsupported(format!(
                                "CTE body must be a SELECT, got {:?}",
                                other
                            )))
                        }
                    };
                    context.insert(cte.name, rows);
                }
                self.dispatch(*main_query, &context)
            }
            Command::Begin => {
                self.storage.begin()?;
                Ok(QueryResult::Ack("transaction started".into()))
            }
            Command::Commit => {
                self.storage.commit()?;
                Ok(QueryResult::Ack("transaction committed".into()))
            }
            Command::Rollback => {
                self.storage.rollback()?;
                Ok(QueryResult::Ack("transaction rolled back".into()))
            }
        }
    }

    fn execute_update(
        &mut self,
        table_name: &str,
        set: Vec<(String, Value)>,
        where_clause: Option<WhereClause>,
    ) -> Result<QueryResult> {
        let meta = self.storage.get_table_metadata(table_name)?;
        for (col, _) in &set {
            if !meta.has_column(col) {
                return Err(Error::schema(format!(
                    "column {} is not part of table {}",
                    col, table_name
                )));
            }
        }
        let candidates = self.candidate_rows(table_name, &meta, where_clause.as_ref())?;
        let mut affected = 0;
        for row in candidates {
            if where_clause.as_ref().map_or(true, |w| eval_where(w, &row)) {
                let pk = lookup(&row, &meta.primary_key)
                    .cloned()
                    .unwrap_or(Value::Null);
                let mut patch = Record::new();
                for (col, val) in &set {
                    patch.insert(col.clone(), val.clone());
                }
                self.storage.update_record(table_name, &pk, patch)?;
                affected += 1;
            }
        }
        Ok(QueryResult::Affected(affected))
    }

    fn execute_delete(&mut self, table_name: &str, where_clause: WhereClause) -> Result<QueryResult> {
        let meta = self.storage.get_table_metadata(table_name)?;
        let candidates = self.candidate_rows(table_name, &meta, Some(&where_clause))?;
        let mut affected = 0;
        for row in candidates {
            if eval_where(&where_clause, &row) {
                let pk = lookup(&row, &meta.primary_key)
                    .cloned()
                    .unwrap_or(Value::Null);
                self.storage.delete_record(table_name, &pk, Some(row))?;
                affected += 1;
            }
        }
        Ok(QueryResult::Affected(affected))
    }

    /// Picks the cheapest available source of candidate rows for a WHERE
    /// clause against a single table: a primary-key or secondary-index
    /// probe when the clause's leading condition is a plain equality on an
    /// indexed column, otherwise a full scan. The full clause is always
    /// re-applied by the caller afterward, so an imprecise candidate set
    /// here only costs performance, never correctness.
    fn candidate_rows(
        &mut self,
        table_name: &str,
        meta: &TableMeta,
        where_clause: Option<&WhereClause>,
    ) -> Result<Vec<Record>> {
        if let Some(where_clause) = where_clause {
            if let Some((column, value)) = leading_equality(where_clause) {
                if column == meta.primary_key {
                    return Ok(self
                        .storage
                        .search_pk(table_name, value)?
                        .into_iter()
                        .collect());
                }
                if let Some((index_name, _)) = meta.indexes.iter().find(|(_, c)| *c == &column) {
                    if let Some(pk) = self.storage.search_index(index_name, value)? {
                        return Ok(self
                            .storage
                            .search_pk(table_name, &pk)?
                            .into_iter()
                            .collect());
                    }
                    return Ok(Vec::new());
                }
            }
        }
        self.storage.get_all_records(table_name)
    }

    fn execute_select(
        &mut self,
        select: &SelectCommand,
        ctes: &HashMap<String, Vec<Record>>,
    ) -> Result<(Vec<String>, Vec<Record>)> {
        let schema_columns = self.from_schema_columns(&select.from, ctes)?;
        let mut rows = self.resolve_from(&select.from, ctes)?;

        if let Some(where_clause) = &select.where_clause {
            rows.retain(|r| eval_where(where_clause, r));
        }

        let rows = if let Some(group_cols) = &select.group_by {
            perform_grouping(rows, group_cols, &select.columns)?
        } else if select.columns.iter().any(|c| matches!(c, SelectItem::Aggregate { .. })) {
            vec![perform_aggregation(&rows, &select.columns)?]
        } else {
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                out.push(project(&row, &select.columns)?);
            }
            out
        };

        let mut rows = rows;
        if let Some(order) = &select.order_by {
            order_records(&mut rows, order)?;
        }

        let columns = resolve_result_columns(&select.columns, schema_columns.as_deref(), rows.first());
        Ok((columns, rows))
    }

    /// Column names a wildcard in `from`'s projection expands to, in
    /// schema-declaration order: a plain table's own schema, or a join's
    /// left-table columns followed by its right-table columns (the same
    /// order `execute_join` qualifies them in). `None` when `from` names a
    /// CTE result, which carries no table schema to consult — callers fall
    /// back to a sample row's keys in that case.
    fn from_schema_columns(
        &mut self,
        from: &FromClause,
        ctes: &HashMap<String, Vec<Record>>,
    ) -> Result<Option<Vec<String>>> {
        match from {
            FromClause::Table(name) => {
                if ctes.contains_key(name) {
                    return Ok(None);
                }
                Ok(self
                    .storage
                    .get_table_metadata(name)
                    .ok()
                    .map(|meta| meta.column_names().iter().map(|c| c.to_string()).collect()))
            }
            FromClause::Join(join) => {
                let left_meta = self.storage.get_table_metadata(&join.left).ok();
                let right_meta = self.storage.get_table_metadata(&join.right).ok();
                match (left_meta, right_meta) {
                    (Some(l), Some(r)) => {
                        let mut cols: Vec<String> = l
                            .column_names()
                            .iter()
                            .map(|c| format!("{}.{}", join.left, c))
                            .collect();
                        cols.extend(r.column_names().iter().map(|c| format!("{}.{}", join.right, c)));
                        Ok(Some(cols))
                    }
                    _ => Ok(None),
                }
            }
        }
    }

    fn resolve_from(
        &mut self,
        from: &FromClause,
        ctes: &HashMap<String, Vec<Record>>,
    ) -> Result<Vec<Record>> {
        match from {
            FromClause::Table(name) => {
                if let Some(rows) = ctes.get(name) {
                    return Ok(rows.clone());
                }
                self.storage.get_all_records(name)
            }
            FromClause::Join(join) => self.execute_join(join, ctes),
        }
    }

    fn execute_join(
        &mut self,
        join: &JoinClause,
        ctes: &HashMap<String, Vec<Record>>,
    ) -> Result<Vec<Record>> {
        let left_rows = self.resolve_from(&FromClause::Table(join.left.clone()), ctes)?;
        let right_rows = self.resolve_from(&FromClause::Table(join.right.clone()), ctes)?;
        let right_meta = self.storage.get_table_metadata(&join.right).ok();
        let right_columns = right_meta.map(|m| m.column_names().iter().map(|s| s.to_string()).collect::<Vec<_>>());

        let mut out = Vec::new();
        for left in &left_rows {
            let left_val = lookup(left, &join.left_column);
            let mut matched = false;
            for right in &right_rows {
                let right_val = lookup(right, &join.right_column);
                let is_match = match (left_val, right_val) {
                    (Some(l), Some(r)) => l.sql_eq(r),
                    _ => false,
                };
                if is_match {
                    matched = true;
                    out.push(merge_qualified(&join.left, left, &join.right, right));
                }
            }
            if !matched && join.join_type == JoinType::Left {
                let mut row = qualify(&join.left, left);
                if let Some(cols) = &right_columns {
                    for col in cols {
                        row.insert(format!("{}.{}", join.right, col), Value::Null);
                    }
                }
                out.push(row);
            }
        }
        Ok(out)
    }
}

fn qualify(table: &str, row: &Record) -> Record {
    row.iter()
        .map(|(k, v)| (format!("{}.{}", table, k), v.clone()))
        .collect()
}

fn merge_qualified(left_name: &str, left: &Record, right_name: &str, right: &Record) -> Record {
    let mut out = qualify(left_name, left);
    out.extend(qualify(right_name, right));
    out
}

/// Extracts `(column, value)` from a WHERE clause's leading condition when
/// it is eligible to drive an index probe: either the clause is a single
/// equality condition, or it is an AND list whose first conjunct is one.
/// An OR at the top level, or a non-equality leading condition, disqualifies
/// the clause and a full scan is used instead.
fn leading_equality(where_clause: &WhereClause) -> Option<(String, &Value)> {
    match where_clause {
        WhereClause::Condition {
            column,
            operator: CompareOp::Eq,
            value,
        } => Some((column.clone(), value)),
        WhereClause::And(conds) => match conds.first() {
            Some(WhereClause::Condition {
                column,
                operator: CompareOp::Eq,
                value,
            }) => Some((column.clone(), value)),
            _ => None,
        },
        _ => None,
    }
}

/// Evaluates a WHERE clause against a row. Per the type-mismatch rule, a
/// comparison between a record value and a literal of an incompatible type
/// is never an error: it simply yields `false`, for every operator
/// including `!=`.
fn eval_where(where_clause: &WhereClause, row: &Record) -> bool {
    match where_clause {
        WhereClause::And(conds) => conds.iter().all(|c| eval_where(c, row)),
        WhereClause::Or(conds) => conds.iter().any(|c| eval_where(c, row)),
        WhereClause::Condition {
            column,
            operator,
            value,
        } => {
            let actual = lookup(row, column).cloned().unwrap_or(Value::Null);
            eval_condition(&actual, *operator, value)
        }
    }
}

/// A condition is false whenever either side is null — §4.6 makes no
/// exception for `<`/`<=`/`>`/`>=`, so an absent-or-null column never
/// satisfies any operator, not just `=`/`!=`. `Value::Null`'s placement in
/// `cmp_total`'s total order exists for the B-Tree and `ORDER BY`, not for
/// WHERE evaluation, so it must never reach `cmp_total` from here.
fn eval_condition(actual: &Value, operator: CompareOp, expected: &Value) -> bool {
    if actual.is_null() || expected.is_null() {
        return false;
    }
    if !comparable(actual, expected) {
        return false;
    }
    match operator {
        CompareOp::Eq => actual.sql_eq(expected),
        CompareOp::Ne => !actual.sql_eq(expected),
        CompareOp::Lt => actual.cmp_total(expected) == std::cmp::Ordering::Less,
        CompareOp::Le => actual.cmp_total(expected) != std::cmp::Ordering::Greater,
        CompareOp::Gt => actual.cmp_total(expected) == std::cmp::Ordering::Greater,
        CompareOp::Ge => actual.cmp_total(expected) != std::cmp::Ordering::Less,
    }
}

/// A value is comparable to a literal when both are the same kind or both
/// numeric. A string compared to a number, or vice versa, is a type
/// mismatch: the comparison yields `false` rather than an error. Callers
/// are expected to have already screened out nulls.
fn comparable(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Str(_), Value::Str(_)) => true,
        (a, b) if a.is_numeric() && b.is_numeric() => true,
        _ => false,
    }
}

fn perform_grouping(rows: Vec<Record>, group_cols: &[String], items: &[SelectItem]) -> Result<Vec<Record>> {
    for item in items {
        if let SelectItem::Column { name, .. } = item {
            if !group_cols.iter().any(|g| g == name) {
                return Err(Error::semantic(format!(
                    "column {} must appear in GROUP BY or be used in an aggregate",
                    name
                )));
            }
        }
        if matches!(item, SelectItem::Wildcard) {
            return Err(Error::semantic("SELECT * cannot be combined with GROUP BY"));
        }
    }

    let mut sorted = rows;
    sorted.sort_by(|a, b| {
        for g in group_cols {
            let av = lookup(a, g).cloned().unwrap_or(Value::Null);
            let bv = lookup(b, g).cloned().unwrap_or(Value::Null);
            let ord = av.cmp_total(&bv);
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });

    let mut out = Vec::new();
    for (_, group) in &sorted
        .into_iter()
        .group_by(|row| group_cols.iter().map(|g| lookup(row, g).cloned().unwrap_or(Value::Null)).collect::<Vec<_>>())
    {
        let group_rows: Vec<Record> = group.collect();
        out.push(perform_aggregation(&group_rows, items)?);
    }
    Ok(out)
}

fn perform_aggregation(rows: &[Record], items: &[SelectItem]) -> Result<Record> {
    let mut out = Record::new();
    for item in items {
        match item {
            SelectItem::Column { name, .. } => {
                let v = rows
                    .first()
                    .and_then(|r| lookup(r, name).cloned())
                    .unwrap_or(Value::Null);
                out.insert(name.clone(), v);
            }
            SelectItem::Aggregate {
                function,
                argument,
                alias,
            } => {
                out.insert(alias.clone(), eval_aggregate(rows, *function, argument));
            }
            SelectItem::Wildcard => {
                return Err(Error::semantic("SELECT * is not valid with aggregation"));
            }
        }
    }
    Ok(out)
}

/// `COUNT` counts non-null records of any type (or all records, for
/// `COUNT(*)`). Every other aggregate restricts to records whose value is
/// both non-null *and* numeric, per the spec's explicit coercion rule, and
/// yields `Null` — never `0` — when no such record exists.
fn eval_aggregate(rows: &[Record], function: AggregateFn, argument: &AggregateArg) -> Value {
    if function == AggregateFn::Count {
        let count = match argument {
            AggregateArg::Star => rows.len(),
            AggregateArg::Column(col) => rows
                .iter()
                .filter(|r| lookup(r, col).map_or(false, |v| !v.is_null()))
                .count(),
        };
        return Value::Int(count as i64);
    }

    let col = match argument {
        AggregateArg::Star => return Value::Null,
        AggregateArg::Column(c) => c,
    };
    let numeric_values: Vec<Value> = rows
        .iter()
        .filter_map(|r| lookup(r, col).cloned())
        .filter(|v| !v.is_null() && v.is_numeric())
        .collect();

    if numeric_values.is_empty() {
        return Value::Null;
    }

    match function {
        AggregateFn::Sum => {
            if numeric_values.iter().all(|v| matches!(v, Value::Int(_))) {
                Value::Int(numeric_values.iter().filter_map(|v| v.as_f64()).sum::<f64>() as i64)
            } else {
                Value::Float(numeric_values.iter().filter_map(|v| v.as_f64()).sum())
            }
        }
        AggregateFn::Avg => {
            let sum: f64 = numeric_values.iter().filter_map(|v| v.as_f64()).sum();
            Value::Float(sum / numeric_values.len() as f64)
        }
        AggregateFn::Min => numeric_values
            .into_iter()
            .min_by(|a, b| a.cmp_total(b))
            .unwrap_or(Value::Null),
        AggregateFn::Max => numeric_values
            .into_iter()
            .max_by(|a, b| a.cmp_total(b))
            .unwrap_or(Value::Null),
        AggregateFn::Count => unreachable!(),
    }
}

fn project(row: &Record, items: &[SelectItem]) -> Result<Record> {
    let mut out = Record::new();
    for item in items {
        match item {
            SelectItem::Wildcard => {
                for (k, v) in row {
                    out.insert(k.clone(), v.clone());
                }
            }
            SelectItem::Column { name, .. } => {
                let v = lookup(row, name).cloned().unwrap_or(Value::Null);
                out.insert(name.clone(), v);
            }
            SelectItem::Aggregate { .. } => {
                return Err(Error::semantic(
                    "aggregate function used outside of an aggregated query",
                ));
            }
        }
    }
    Ok(out)
}

/// Column labels for a projected result set. A `Wildcard` item expands to
/// `schema_columns` when the `FROM` side resolved to a real table/join
/// schema, or else to `sample_row`'s own keys (in `Record`'s `BTreeMap`
/// order) — the CTE-sourced case, which carries no table schema to consult.
/// A wildcard over an empty CTE result with no sample row contributes no
/// columns, the one case this can still return `[]` for.
fn resolve_result_columns(
    items: &[SelectItem],
    schema_columns: Option<&[String]>,
    sample_row: Option<&Record>,
) -> Vec<String> {
    let mut out = Vec::new();
    for item in items {
        match item {
            SelectItem::Wildcard => match schema_columns {
                Some(cols) => out.extend(cols.iter().cloned()),
                None => {
                    if let Some(row) = sample_row {
                        out.extend(row.keys().cloned());
                    }
                }
            },
            SelectItem::Column { name, .. } => out.push(name.clone()),
            SelectItem::Aggregate { alias, .. } => out.push(alias.clone()),
        }
    }
    out
}

/// Sorts `rows` by `order.column`, resolved by exact match or `.<column>`
/// suffix. Fails if the column resolves in none of the rows: an empty
/// result set can't tell us anything either way, so it is never rejected.
fn order_records(rows: &mut [Record], order: &crate::command::OrderBy) -> Result<()> {
    if !rows.is_empty() && !rows.iter().any(|r| lookup(r, &order.column).is_some()) {
        return Err(Error::semantic(format!(
            "cannot order by column {}",
            order.column
        )));
    }
    rows.sort_by(|a, b| {
        let av = lookup(a, &order.column).cloned().unwrap_or(Value::Null);
        let bv = lookup(b, &order.column).cloned().unwrap_or(Value::Null);
        let ord = av.cmp_total(&bv);
        match order.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        }
    });
    Ok(())
}
