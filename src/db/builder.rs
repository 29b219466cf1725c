//! Fluent query builder.
//!
//! A [`Query`] describes one statement against one table. Chain methods
//! update the description; [`Query::build`] compiles it to SQL with
//! `:paramN` placeholders and a matching parameter object. Compilation
//! starts from an empty parameter map every time, so a query can be
//! mutated and run again without leaking values between runs.
//!
//! ```ignore
//! let players = exports
//!     .table("shops", "players")
//!     .select(["id", "name"])
//!     .and_where("money", ">", 100)
//!     .order_by("name", OrderDirection::Asc)
//!     .all()
//!     .await?;
//! ```

use crate::db::executor::QueryExecutor;
use crate::error::{DbError, DbResult};
use crate::models::QueryKind;
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
struct WhereClause {
    field: String,
    operator: String,
    value: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

impl JoinKind {
    fn as_sql(self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER",
            JoinKind::Left => "LEFT",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct JoinClause {
    kind: JoinKind,
    table: String,
    left: String,
    operator: String,
    right: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderDirection::Asc => write!(f, "ASC"),
            OrderDirection::Desc => write!(f, "DESC"),
        }
    }
}

impl FromStr for OrderDirection {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ASC" => Ok(Self::Asc),
            "DESC" => Ok(Self::Desc),
            other => Err(DbError::invalid_input(format!(
                "Invalid order direction '{other}', expected ASC or DESC"
            ))),
        }
    }
}

/// Which statement the query compiles to.
#[derive(Debug, Clone, PartialEq)]
enum Mode {
    Select,
    Insert(Map<String, JsonValue>),
    Update(Map<String, JsonValue>),
    Delete,
}

/// A compiled statement.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    /// Values keyed `param0`, `param1`, ... in placeholder order.
    pub params: Map<String, JsonValue>,
    pub kind: QueryKind,
    /// `UPDATE` or `DELETE` without any WHERE predicate.
    pub full_table_mutation: bool,
}

/// Quote a field name unless it already contains a call, a quote, or a
/// table qualifier.
pub fn quote_field(field: &str) -> String {
    let field = field.trim();
    if field.contains('(') || field.contains('`') || field.contains('.') {
        field.to_string()
    } else {
        format!("`{field}`")
    }
}

/// Select-list entries: aliases and wildcards pass through verbatim.
fn select_field(field: &str) -> String {
    let trimmed = field.trim();
    if trimmed.to_ascii_lowercase().contains(" as ") || trimmed.contains('*') {
        trimmed.to_string()
    } else {
        quote_field(trimmed)
    }
}

#[derive(Default)]
struct ParamMap {
    values: Map<String, JsonValue>,
}

impl ParamMap {
    fn add(&mut self, value: &JsonValue) -> String {
        let name = format!("param{}", self.values.len());
        self.values.insert(name.clone(), value.clone());
        format!(":{name}")
    }
}

#[derive(Clone)]
pub struct Query {
    table: String,
    fields: Vec<String>,
    wheres: Vec<WhereClause>,
    joins: Vec<JoinClause>,
    groups: Vec<String>,
    orders: Vec<(String, OrderDirection)>,
    limit: Option<u64>,
    mode: Mode,
    executor: Option<(Arc<QueryExecutor>, String)>,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("table", &self.table)
            .field("mode", &self.mode)
            .field("wheres", &self.wheres.len())
            .field("limit", &self.limit)
            .field("bound", &self.executor.is_some())
            .finish_non_exhaustive()
    }
}

impl Query {
    /// Start a SELECT of every column.
    pub fn table(name: impl Into<String>) -> Self {
        Self {
            table: name.into(),
            fields: vec!["*".to_string()],
            wheres: Vec::new(),
            joins: Vec::new(),
            groups: Vec::new(),
            orders: Vec::new(),
            limit: None,
            mode: Mode::Select,
            executor: None,
        }
    }

    /// Attach the executor and calling resource used by the terminal
    /// methods.
    pub fn bind(mut self, executor: Arc<QueryExecutor>, resource: impl Into<String>) -> Self {
        self.executor = Some((executor, resource.into()));
        self
    }

    /// Choose the select list. An empty list keeps the current one.
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let fields: Vec<String> = fields
            .into_iter()
            .map(|f| select_field(f.as_ref()))
            .collect();
        if !fields.is_empty() {
            self.fields = fields;
        }
        self.mode = Mode::Select;
        self
    }

    /// Add a predicate. Predicates are joined with AND.
    pub fn and_where(
        mut self,
        field: impl Into<String>,
        operator: impl Into<String>,
        value: impl Into<JsonValue>,
    ) -> Self {
        self.wheres.push(WhereClause {
            field: field.into(),
            operator: operator.into(),
            value: value.into(),
        });
        self
    }

    pub fn join(self, table: &str, left: &str, operator: &str, right: &str) -> Self {
        self.add_join(JoinKind::Inner, table, left, operator, right)
    }

    pub fn left_join(self, table: &str, left: &str, operator: &str, right: &str) -> Self {
        self.add_join(JoinKind::Left, table, left, operator, right)
    }

    fn add_join(
        mut self,
        kind: JoinKind,
        table: &str,
        left: &str,
        operator: &str,
        right: &str,
    ) -> Self {
        self.joins.push(JoinClause {
            kind,
            table: table.to_string(),
            left: left.to_string(),
            operator: operator.to_string(),
            right: right.to_string(),
        });
        self
    }

    pub fn group_by<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.groups
            .extend(fields.into_iter().map(|f| quote_field(f.as_ref())));
        self
    }

    pub fn order_by(mut self, field: &str, direction: OrderDirection) -> Self {
        self.orders.push((quote_field(field), direction));
        self
    }

    pub fn limit(mut self, count: u64) -> Self {
        self.limit = Some(count);
        self
    }

    pub fn insert(mut self, data: Map<String, JsonValue>) -> Self {
        self.mode = Mode::Insert(data);
        self
    }

    pub fn update(mut self, data: Map<String, JsonValue>) -> Self {
        self.mode = Mode::Update(data);
        self
    }

    pub fn delete(mut self) -> Self {
        self.mode = Mode::Delete;
        self
    }

    pub fn is_select(&self) -> bool {
        self.mode == Mode::Select
    }

    fn build_where(&self, params: &mut ParamMap) -> String {
        if self.wheres.is_empty() {
            return String::new();
        }
        let clauses: Vec<String> = self
            .wheres
            .iter()
            .map(|w| {
                let placeholder = params.add(&w.value);
                format!("{} {} {}", quote_field(&w.field), w.operator, placeholder)
            })
            .collect();
        format!(" WHERE {}", clauses.join(" AND "))
    }

    /// Compile the current description.
    pub fn build(&self) -> DbResult<CompiledQuery> {
        let mut params = ParamMap::default();
        let table = format!("`{}`", self.table);

        let (sql, kind, full_table_mutation) = match &self.mode {
            Mode::Insert(data) => {
                if data.is_empty() {
                    return Err(DbError::invalid_input("INSERT data is missing"));
                }
                let fields: Vec<String> = data.keys().map(|f| format!("`{f}`")).collect();
                let values: Vec<String> = data.values().map(|v| params.add(v)).collect();
                let sql = format!(
                    "INSERT INTO {table} ({}) VALUES ({})",
                    fields.join(", "),
                    values.join(", ")
                );
                (sql, QueryKind::Insert, false)
            }
            Mode::Update(data) => {
                if data.is_empty() {
                    return Err(DbError::invalid_input("UPDATE data is missing"));
                }
                let sets: Vec<String> = data
                    .iter()
                    .map(|(field, value)| format!("`{field}` = {}", params.add(value)))
                    .collect();
                let where_clause = self.build_where(&mut params);
                let sql = format!("UPDATE {table} SET {}{where_clause}", sets.join(", "));
                (sql, QueryKind::Update, where_clause.is_empty())
            }
            Mode::Delete => {
                let where_clause = self.build_where(&mut params);
                let sql = format!("DELETE FROM {table}{where_clause}");
                (sql, QueryKind::Update, where_clause.is_empty())
            }
            Mode::Select => {
                let mut sql = format!("SELECT {} FROM {table}", self.fields.join(", "));
                for join in &self.joins {
                    sql.push_str(&format!(
                        " {} JOIN `{}` ON {} {} {}",
                        join.kind.as_sql(),
                        join.table,
                        quote_field(&join.left),
                        join.operator,
                        quote_field(&join.right)
                    ));
                }
                sql.push_str(&self.build_where(&mut params));
                if !self.groups.is_empty() {
                    sql.push_str(&format!(" GROUP BY {}", self.groups.join(", ")));
                }
                if !self.orders.is_empty() {
                    let orders: Vec<String> = self
                        .orders
                        .iter()
                        .map(|(field, dir)| format!("{field} {dir}"))
                        .collect();
                    sql.push_str(&format!(" ORDER BY {}", orders.join(", ")));
                }
                if let Some(limit) = self.limit.filter(|l| *l > 0) {
                    sql.push_str(&format!(" LIMIT {limit}"));
                }
                (sql, QueryKind::Raw, false)
            }
        };

        Ok(CompiledQuery {
            sql,
            params: params.values,
            kind,
            full_table_mutation,
        })
    }

    fn bound(&self) -> DbResult<(&Arc<QueryExecutor>, &str)> {
        self.executor
            .as_ref()
            .map(|(executor, resource)| (executor, resource.as_str()))
            .ok_or_else(|| DbError::invalid_input("Query is not bound to an executor"))
    }

    /// Every matching row.
    pub async fn all(&self) -> DbResult<JsonValue> {
        if !self.is_select() {
            return Err(DbError::invalid_input(
                "Cannot call .all() on a non-SELECT query",
            ));
        }
        let compiled = self.build()?;
        let (executor, resource) = self.bound()?;
        executor
            .raw_query(
                QueryKind::Raw,
                resource,
                &compiled.sql,
                &JsonValue::Object(compiled.params),
            )
            .await
    }

    /// The first matching row, or null. Sets the limit to 1.
    pub async fn first(&mut self) -> DbResult<JsonValue> {
        self.limit = Some(1);
        if !self.is_select() {
            return Err(DbError::invalid_input(
                "Cannot call .first() on a non-SELECT query",
            ));
        }
        let compiled = self.build()?;
        let (executor, resource) = self.bound()?;
        executor
            .raw_query(
                QueryKind::Single,
                resource,
                &compiled.sql,
                &JsonValue::Object(compiled.params),
            )
            .await
    }

    /// Run an INSERT (returns the insert id) or an UPDATE/DELETE (returns
    /// affected rows).
    pub async fn run(&self) -> DbResult<JsonValue> {
        if self.is_select() {
            return Err(DbError::invalid_input(
                "Cannot call .run() on a SELECT query. Use .all() or .first()",
            ));
        }
        let compiled = self.build()?;
        let (executor, resource) = self.bound()?;

        if compiled.full_table_mutation {
            let verb = if matches!(self.mode, Mode::Delete) {
                ("DELETE", "delete")
            } else {
                ("UPDATE", "update")
            };
            executor.logger().warn(&format!(
                "[kjmysql] {} query on table '{}' has no WHERE clause. This will {} all rows.",
                verb.0, self.table, verb.1
            ));
        }

        executor
            .raw_query(
                compiled.kind,
                resource,
                &compiled.sql,
                &JsonValue::Object(compiled.params),
            )
            .await
    }
}
