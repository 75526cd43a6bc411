//! Translation from SQL text to this crate's own command tree.
//!
//! Tokenizing and grammar is delegated entirely to `sqlparser`'s
//! `GenericDialect`; this module only walks the resulting AST and maps it
//! onto `Command`. `sqlparser` types never leak past this module's public
//! function, `parse`.

use sqlparser::ast::{
    self, BinaryOperator, ColumnOption, DataType, Expr, Function, FunctionArg, FunctionArgExpr,
    Join, JoinConstraint, JoinOperator, Query, Select, SelectItem as SqlSelectItem, SetExpr,
    Statement, TableConstraint, TableFactor, TableWithJoins, Value as SqlValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::command::{
    AggregateArg, AggregateFn, CompareOp, Command, Cte, Direction, FromClause, JoinClause,
    JoinType, OrderBy, SelectCommand, SelectItem, WhereClause,
};
use crate::error::{Error, Result};
use crate::storage::ColumnType;
use crate::value::Value;

/// Parses exactly one SQL statement into a `Command`. Any statement shape
/// beyond those documented in the command tree (more than one JOIN, a
/// subquery in expression position, multiple statements in one string, ...)
/// is a parse error.
pub fn parse(sql: &str) -> Result<Command> {
    let dialect = GenericDialect {};
    let mut statements =
        Parser::parse_sql(&dialect, sql).map_err(|e| Error::parse(e.to_string()))?;
    if statements.is_empty() {
        return Err(Error::parse("empty statement"));
    }
    if statements.len() > 1 {
        return Err(Error::parse("only one statement per line is supported"));
    }
    translate_statement(&statements.remove(0))
}

fn translate_statement(stmt: &Statement) -> Result<Command> {
    match stmt {
        Statement::CreateTable {
            name,
            columns,
            constraints,
            ..
        } => translate_create_table(&name.to_string(), columns, constraints),
        Statement::CreateIndex {
            name,
            table_name,
            columns,
            ..
        } => translate_create_index(name.as_ref(), &table_name.to_string(), columns),
        Statement::Insert {
            table_name,
            columns,
            source,
            ..
        } => translate_insert(&table_name.to_string(), columns, source),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => translate_update(table, assignments, selection.as_ref()),
        Statement::Delete {
            from, selection, ..
        } => translate_delete(from, selection.as_ref()),
        Statement::Query(query) => translate_query(query),
        Statement::StartTransaction { .. } => Ok(Command::Begin),
        Statement::Commit { .. } => Ok(Command::Commit),
        Statement::Rollback { .. } => Ok(Command::Rollback),
        other => Err(Error::parse(format!("unsupported statement: {}", other))),
    }
}

fn translate_create_table(
    table_name: &str,
    columns: &[ast::ColumnDef],
    constraints: &[TableConstraint],
) -> Result<Command> {
    if columns.is_empty() {
        return Err(Error::parse("CREATE TABLE requires at least one column"));
    }
    let mut cols = Vec::with_capacity(columns.len());
    let mut primary_key: Option<String> = None;
    for column in columns {
        let column_type = data_type_to_column_type(&column.data_type).ok_or_else(|| {
            Error::parse(format!(
                "unsupported column type for column {}",
                column.name
            ))
        })?;
        cols.push((column.name.value.clone(), column_type));

        let is_pk = column
            .options
            .iter()
            .any(|o| matches!(o.option, ColumnOption::Unique { is_primary: true }));
        if is_pk {
            if primary_key.is_some() {
                return Err(Error::schema(
                    "multiple PRIMARY KEY definitions are not allowed",
                ));
            }
            primary_key = Some(column.name.value.clone());
        }
    }

    for constraint in constraints {
        if let TableConstraint::Unique {
            columns: pk_cols,
            is_primary: true,
            ..
        } = constraint
        {
            if primary_key.is_some() {
                return Err(Error::schema(
                    "multiple PRIMARY KEY definitions are not allowed",
                ));
            }
            if pk_cols.len() != 1 {
                return Err(Error::parse("composite primary keys are not supported"));
            }
            primary_key = Some(pk_cols[0].value.clone());
        }
    }

    let primary_key = primary_key
        .ok_or_else(|| Error::schema("no PRIMARY KEY defined for the table"))?;
    Ok(Command::CreateTable {
        table_name: table_name.to_string(),
        columns: cols,
        primary_key,
    })
}

/// Maps a `sqlparser` `DataType` onto this crate's `ColumnType` by
/// rendering it back to its leading token (`"INT"`, `"VARCHAR"`, ...) and
/// reusing the same recognizer the rest of the crate uses for declared
/// type tokens.
fn data_type_to_column_type(dt: &DataType) -> Option<ColumnType> {
    let rendered = dt.to_string();
    let head = rendered
        .split(|c: char| c == '(' || c.is_whitespace())
        .next()
        .unwrap_or(&rendered);
    ColumnType::from_token(head)
}

fn translate_create_index(
    name: Option<&ast::ObjectName>,
    table_name: &str,
    columns: &[ast::OrderByExpr],
) -> Result<Command> {
    let index_name = name
        .map(|n| n.to_string())
        .ok_or_else(|| Error::parse("CREATE INDEX requires a name"))?;
    if columns.len() != 1 {
        return Err(Error::parse("CREATE INDEX supports exactly one column"));
    }
    let column_name = expr_to_column(&columns[0].expr)?;
    Ok(Command::CreateIndex {
        index_name,
        table_name: table_name.to_string(),
        column_name,
    })
}

fn translate_insert(
    table_name: &str,
    columns: &[ast::Ident],
    source: &Option<Box<Query>>,
) -> Result<Command> {
    if !columns.is_empty() {
        return Err(Error::parse(
            "INSERT with an explicit column list is not supported; values are positional by table column order",
        ));
    }
    let source = source
        .as_ref()
        .ok_or_else(|| Error::parse("INSERT requires a VALUES clause"))?;
    let values = match source.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.len() != 1 {
                return Err(Error::parse("INSERT supports exactly one row of VALUES"));
            }
            values.rows[0]
                .iter()
                .map(expr_to_value)
                .collect::<Result<Vec<_>>>()?
        }
        _ => return Err(Error::parse("INSERT requires a VALUES clause")),
    };
    Ok(Command::Insert {
        table_name: table_name.to_string(),
        values,
    })
}

fn translate_update(
    table: &TableWithJoins,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command> {
    let table_name = table_with_joins_name(table)?;
    let mut set = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = assignment
            .id
            .last()
            .map(|i| i.value.clone())
            .ok_or_else(|| Error::parse("invalid SET target"))?;
        let value = expr_to_value(&assignment.value)?;
        set.push((column, value));
    }
    let where_clause = selection.map(translate_where).transpose()?;
    Ok(Command::Update {
        table_name,
        set,
        where_clause,
    })
}

fn translate_delete(from: &[TableWithJoins], selection: Option<&Expr>) -> Result<Command> {
    let twj = from
        .first()
        .ok_or_else(|| Error::parse("DELETE requires a FROM table"))?;
    let table_name = table_with_joins_name(twj)?;
    let selection = selection.ok_or_else(|| {
        Error::Safety("DELETE statement must have a WHERE clause (for safety)".into())
    })?;
    let where_clause = translate_where(selection)?;
    Ok(Command::Delete {
        table_name,
        where_clause,
    })
}

fn translate_query(query: &Query) -> Result<Command> {
    match &query.with {
        None => Ok(Command::Select(translate_select_body(query)?)),
        Some(with) => {
            if with.cte_tables.len() != 1 {
                return Err(Error::parse("only a single CTE is supported"));
            }
            let cte = &with.cte_tables[0];
            let name = cte.alias.name.value.clone();
            let cte_command = translate_query(&cte.query)?;

            let mut main = query.clone();
            main.with = None;
            let main_command = Command::Select(translate_select_body(&main)?);

            Ok(Command::With {
                ctes: vec![Cte {
                    name,
                    query: Box::new(cte_command),
                }],
                main_query: Box::new(main_command),
            })
        }
    }
}

fn translate_select_body(query: &Query) -> Result<SelectCommand> {
    let select: &Select = match query.body.as_ref() {
        SetExpr::Select(select) => select.as_ref(),
        _ => return Err(Error::parse("only simple SELECT queries are supported")),
    };

    if select.from.len() != 1 {
        return Err(Error::parse("SELECT supports exactly one FROM source"));
    }
    let from = translate_from(&select.from[0])?;

    let columns = select
        .projection
        .iter()
        .map(translate_select_item)
        .collect::<Result<Vec<_>>>()?;

    let where_clause = select.selection.as_ref().map(translate_where).transpose()?;

    let group_by = translate_group_by(&select.group_by)?;

    let order_by = if query.order_by.is_empty() {
        None
    } else {
        let ob = &query.order_by[0];
        let column = expr_to_column(&ob.expr)?;
        let direction = match ob.asc {
            Some(false) => Direction::Desc,
            _ => Direction::Asc,
        };
        Some(OrderBy { column, direction })
    };

    Ok(SelectCommand {
        columns,
        from,
        where_clause,
        group_by,
        order_by,
    })
}

/// `sqlparser` has changed `Select::group_by`'s type across versions (a
/// plain `Vec<Expr>` in older releases, a `GroupByExpr` enum in newer
/// ones). This crate is pinned to the `Vec<Expr>` shape.
fn translate_group_by(group_by: &[Expr]) -> Result<Option<Vec<String>>> {
    if group_by.is_empty() {
        return Ok(None);
    }
    let cols = group_by
        .iter()
        .map(expr_to_column)
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(cols))
}

fn translate_from(twj: &TableWithJoins) -> Result<FromClause> {
    if twj.joins.is_empty() {
        return Ok(FromClause::Table(table_factor_name(&twj.relation)?));
    }
    if twj.joins.len() != 1 {
        return Err(Error::parse("only a single JOIN is supported"));
    }
    let join: &Join = &twj.joins[0];
    let left_name = table_factor_name(&twj.relation)?;
    let right_name = table_factor_name(&join.relation)?;

    let (join_type, constraint) = match &join.join_operator {
        JoinOperator::Inner(c) => (JoinType::Inner, c),
        JoinOperator::LeftOuter(c) => (JoinType::Left, c),
        _ => return Err(Error::parse("only INNER and LEFT JOIN are supported")),
    };
    let on_expr = match constraint {
        JoinConstraint::On(expr) => expr,
        _ => return Err(Error::parse("JOIN requires an ON condition")),
    };
    let (left_column, right_column) = translate_join_on(on_expr, &left_name, &right_name)?;

    Ok(FromClause::Join(JoinClause {
        join_type,
        left: left_name,
        right: right_name,
        left_column,
        right_column,
    }))
}

fn translate_join_on(expr: &Expr, left_name: &str, right_name: &str) -> Result<(String, String)> {
    let (left_expr, right_expr) = match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => (left.as_ref(), right.as_ref()),
        _ => return Err(Error::parse("JOIN ON condition must be a single equality")),
    };
    let left_qualified = expr_to_column(left_expr)?;
    let right_qualified = expr_to_column(right_expr)?;
    let (lt, lc) = split_qualified(&left_qualified);
    let (rt, rc) = split_qualified(&right_qualified);

    let matches_left = |t: Option<&str>| t.map(|t| t == left_name).unwrap_or(false);
    let matches_right = |t: Option<&str>| t.map(|t| t == right_name).unwrap_or(false);

    if matches_left(lt) || matches_right(rt) {
        Ok((lc, rc))
    } else if matches_right(lt) || matches_left(rt) {
        Ok((rc, lc))
    } else {
        // Neither side is qualified with a recognized table name; assume
        // the condition was written in `left = right` order.
        Ok((lc, rc))
    }
}

fn split_qualified(s: &str) -> (Option<&str>, String) {
    match s.rsplit_once('.') {
        Some((t, c)) => (Some(t), c.to_string()),
        None => (None, s.to_string()),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String> {
    match tf {
        TableFactor::Table { name, .. } => Ok(name.to_string()),
        _ => Err(Error::parse("unsupported table reference in FROM")),
    }
}

fn table_with_joins_name(twj: &TableWithJoins) -> Result<String> {
    if !twj.joins.is_empty() {
        return Err(Error::parse("JOIN is not supported here"));
    }
    table_factor_name(&twj.relation)
}

fn translate_select_item(item: &SqlSelectItem) -> Result<SelectItem> {
    match item {
        SqlSelectItem::Wildcard(_) => Ok(SelectItem::Wildcard),
        SqlSelectItem::QualifiedWildcard(..) => Ok(SelectItem::Wildcard),
        SqlSelectItem::UnnamedExpr(expr) => translate_expr_as_item(expr, None),
        SqlSelectItem::ExprWithAlias { expr, alias } => {
            translate_expr_as_item(expr, Some(alias.value.clone()))
        }
    }
}

fn translate_expr_as_item(expr: &Expr, alias: Option<String>) -> Result<SelectItem> {
    match expr {
        Expr::Identifier(ident) => Ok(SelectItem::Column {
            table: None,
            name: ident.value.clone(),
        }),
        Expr::CompoundIdentifier(parts) => {
            if parts.len() != 2 {
                return Err(Error::parse("unsupported qualified column reference"));
            }
            Ok(SelectItem::Column {
                table: Some(parts[0].value.clone()),
                name: parts[1].value.clone(),
            })
        }
        Expr::Function(func) => translate_aggregate(func, alias),
        _ => Err(Error::parse(format!("unsupported SELECT item: {}", expr))),
    }
}

fn translate_aggregate(func: &Function, alias: Option<String>) -> Result<SelectItem> {
    let name = func.name.to_string().to_ascii_uppercase();
    let function = match name.as_str() {
        "COUNT" => AggregateFn::Count,
        "SUM" => AggregateFn::Sum,
        "AVG" => AggregateFn::Avg,
        "MIN" => AggregateFn::Min,
        "MAX" => AggregateFn::Max,
        other => return Err(Error::unsupported(format!("unknown aggregate function: {}", other))),
    };
    if func.args.len() != 1 {
        return Err(Error::parse(
            "aggregate functions take exactly one argument",
        ));
    }
    let argument = match &func.args[0] {
        FunctionArg::Unnamed(FunctionArgExpr::Wildcard) => AggregateArg::Star,
        FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => {
            AggregateArg::Column(expr_to_column(expr)?)
        }
        _ => return Err(Error::parse("unsupported aggregate argument")),
    };
    let source_text = match &argument {
        AggregateArg::Star => format!("{}(*)", name),
        AggregateArg::Column(c) => format!("{}({})", name, c),
    };
    Ok(SelectItem::Aggregate {
        function,
        argument,
        alias: alias.unwrap_or(source_text),
    })
}

/// Translates a `WHERE`/`ON` predicate into the two-level OR-of-ANDs shape
/// the execution engine's index-eligibility check expects: a flat OR list
/// of either single conditions or flat AND lists of single conditions.
fn translate_where(expr: &Expr) -> Result<WhereClause> {
    let or_parts = split_or(expr);
    if or_parts.len() == 1 {
        translate_and_group(or_parts[0])
    } else {
        let conds = or_parts
            .into_iter()
            .map(translate_and_group)
            .collect::<Result<Vec<_>>>()?;
        Ok(WhereClause::Or(conds))
    }
}

fn translate_and_group(expr: &Expr) -> Result<WhereClause> {
    let and_parts = split_and(expr);
    if and_parts.len() == 1 {
        translate_condition(and_parts[0])
    } else {
        let conds = and_parts
            .into_iter()
            .map(translate_condition)
            .collect::<Result<Vec<_>>>()?;
        Ok(WhereClause::And(conds))
    }
}

fn split_or(expr: &Expr) -> Vec<&Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Or,
            right,
        } => {
            let mut v = split_or(left);
            v.extend(split_or(right));
            v
        }
        Expr::Nested(inner) => split_or(inner),
        _ => vec![expr],
    }
}

fn split_and(expr: &Expr) -> Vec<&Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let mut v = split_and(left);
            v.extend(split_and(right));
            v
        }
        Expr::Nested(inner) => split_and(inner),
        _ => vec![expr],
    }
}

fn translate_condition(expr: &Expr) -> Result<WhereClause> {
    match expr {
        Expr::Nested(inner) => translate_condition(inner),
        Expr::BinaryOp { left, op, right } => {
            let operator = translate_compare_op(op)?;
            let column = expr_to_column(left)?;
            let value = expr_to_value(right)?;
            Ok(WhereClause::Condition {
                column,
                operator,
                value,
            })
        }
        _ => Err(Error::parse(format!(
            "unsupported WHERE condition: {}",
            expr
        ))),
    }
}

fn translate_compare_op(op: &BinaryOperator) -> Result<CompareOp> {
    match op {
        BinaryOperator::Eq => Ok(CompareOp::Eq),
        BinaryOperator::NotEq => Ok(CompareOp::Ne),
        BinaryOperator::Lt => Ok(CompareOp::Lt),
        BinaryOperator::LtEq => Ok(CompareOp::Le),
        BinaryOperator::Gt => Ok(CompareOp::Gt),
        BinaryOperator::GtEq => Ok(CompareOp::Ge),
        other => Err(Error::parse(format!("unsupported operator: {}", other))),
    }
}

fn expr_to_column(expr: &Expr) -> Result<String> {
    match expr {
        Expr::Identifier(ident) => Ok(ident.value.clone()),
        Expr::CompoundIdentifier(parts) => Ok(parts
            .iter()
            .map(|i| i.value.clone())
            .collect::<Vec<_>>()
            .join(".")),
        _ => Err(Error::parse(format!(
            "unsupported column reference: {}",
            expr
        ))),
    }
}

fn expr_to_value(expr: &Expr) -> Result<Value> {
    match expr {
        Expr::Value(v) => sql_value_to_value(v),
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => match expr.as_ref() {
            Expr::Value(SqlValue::Number(n, _)) => parse_number(&format!("-{}", n)),
            _ => Err(Error::parse("unsupported negative literal")),
        },
        _ => Err(Error::parse(format!("unsupported literal: {}", expr))),
    }
}

fn sql_value_to_value(v: &SqlValue) -> Result<Value> {
    match v {
        SqlValue::Number(n, _) => parse_number(n),
        SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) => {
            Ok(Value::Str(s.clone()))
        }
        SqlValue::Null => Ok(Value::Null),
        SqlValue::Boolean(b) => Ok(Value::Int(if *b { 1 } else { 0 })),
        other => Err(Error::parse(format!("unsupported literal: {}", other))),
    }
}

fn parse_number(n: &str) -> Result<Value> {
    if let Ok(i) = n.parse::<i64>() {
        return Ok(Value::Int(i));
    }
    n.parse::<f64>()
        .map(Value::Float)
        .map_err(|_| Error::parse(format!("invalid number literal: {}", n)))
}
