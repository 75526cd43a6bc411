//! The parsed command tree: the only contract between the SQL frontend
//! (`parser`) and the execution engine (`exec`). Represented as a tagged
//! sum with one variant per supported statement shape, not as untyped maps.

use crate::storage::ColumnType;
use crate::value::Value;

#[derive(Debug, Clone)]
pub enum Command {
    CreateTable {
        table_name: String,
        columns: Vec<(String, ColumnType)>,
        primary_key: String,
    },
    CreateIndex {
        index_name: String,
        table_name: String,
        column_name: String,
    },
    Insert {
        table_name: String,
        values: Vec<Value>,
    },
    Update {
        table_name: String,
        set: Vec<(String, Value)>,
        where_clause: Option<WhereClause>,
    },
    Delete {
        table_name: String,
        where_clause: WhereClause,
    },
    Select(SelectCommand),
    With {
        ctes: Vec<Cte>,
        main_query: Box<Command>,
    },
    Begin,
    Commit,
    Rollback,
}

#[derive(Debug, Clone)]
pub struct Cte {
    pub name: String,
    pub query: Box<Command>,
}

#[derive(Debug, Clone)]
pub struct SelectCommand {
    pub columns: Vec<SelectItem>,
    pub from: FromClause,
    pub where_clause: Option<WhereClause>,
    pub group_by: Option<Vec<String>>,
    pub order_by: Option<OrderBy>,
}

#[derive(Debug, Clone)]
pub enum SelectItem {
    Wildcard,
    Column {
        table: Option<String>,
        name: String,
    },
    Aggregate {
        function: AggregateFn,
        argument: AggregateArg,
        alias: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFn {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateArg {
    Star,
    Column(String),
}

#[derive(Debug, Clone)]
pub enum FromClause {
    /// A bare table name. The execution engine checks the CTE data context
    /// for this name before touching the storage engine, so the same
    /// variant serves both a real table and a materialized CTE result.
    Table(String),
    Join(JoinClause),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
}

#[derive(Debug, Clone)]
pub struct JoinClause {
    pub join_type: JoinType,
    pub left: String,
    pub right: String,
    pub left_column: String,
    pub right_column: String,
}

#[derive(Debug, Clone)]
pub enum WhereClause {
    And(Vec<WhereClause>),
    Or(Vec<WhereClause>),
    Condition {
        column: String,
        operator: CompareOp,
        value: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
pub struct OrderBy {
    pub column: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}
