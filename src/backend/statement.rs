// ============================================================================
// Closed statement model
// ============================================================================
//
// Statements are assembled from a fixed set of fragments and carry their
// literals as named parameters. Display renders GoogleSQL text for logs;
// backends execute the structured form.
//
// ============================================================================

use crate::core::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Columns of the key-value table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Id,
    Data,
    CreatedAt,
    UpdatedAt,
}

impl Column {
    pub const ALL: [Column; 4] = [
        Column::Id,
        Column::Data,
        Column::CreatedAt,
        Column::UpdatedAt,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Data => "data",
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Asc => write!(f, "ASC"),
            Self::Desc => write!(f, "DESC"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderTerm {
    pub column: Column,
    pub direction: Direction,
}

/// WHERE predicate. The right-hand side is always a parameter name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Equals { column: Column, param: String },
    /// LIKE with `\` as the escape character.
    Like { column: Column, param: String },
}

impl Filter {
    pub fn equals(column: Column, param: impl Into<String>) -> Self {
        Self::Equals {
            column,
            param: param.into(),
        }
    }

    pub fn like(column: Column, param: impl Into<String>) -> Self {
        Self::Like {
            column,
            param: param.into(),
        }
    }

    pub fn param(&self) -> &str {
        match self {
            Self::Equals { param, .. } | Self::Like { param, .. } => param,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    Columns(Vec<Column>),
    CountStar,
    /// `SELECT 1` with no table, used as a liveness round trip.
    One,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    table: Option<String>,
    projection: Projection,
    filter: Option<Filter>,
    order_by: Vec<OrderTerm>,
    limit: Option<String>,
    offset: Option<String>,
    params: BTreeMap<String, Value>,
}

/// Column name of the single value produced by a COUNT(*) statement.
pub const COUNT_COLUMN: &str = "count";

impl Statement {
    pub fn select(table: impl Into<String>, columns: &[Column]) -> Self {
        Self::with_projection(Some(table.into()), Projection::Columns(columns.to_vec()))
    }

    pub fn count(table: impl Into<String>) -> Self {
        Self::with_projection(Some(table.into()), Projection::CountStar)
    }

    pub fn ping() -> Self {
        Self::with_projection(None, Projection::One)
    }

    fn with_projection(table: Option<String>, projection: Projection) -> Self {
        Self {
            table,
            projection,
            filter: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            params: BTreeMap::new(),
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn order_by(mut self, column: Column, direction: Direction) -> Self {
        self.order_by.push(OrderTerm { column, direction });
        self
    }

    pub fn limit(mut self, param: impl Into<String>) -> Self {
        self.limit = Some(param.into());
        self
    }

    pub fn offset(mut self, param: impl Into<String>) -> Self {
        self.offset = Some(param.into());
        self
    }

    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    pub fn filter_clause(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    pub fn order_terms(&self) -> &[OrderTerm] {
        &self.order_by
    }

    pub fn limit_param(&self) -> Option<&str> {
        self.limit.as_deref()
    }

    pub fn offset_param(&self) -> Option<&str> {
        self.offset.as_deref()
    }

    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// Names referenced by the statement that have no bound value.
    pub fn unbound_params(&self) -> Vec<&str> {
        let referenced = self
            .filter
            .iter()
            .map(|f| f.param())
            .chain(self.limit.as_deref())
            .chain(self.offset.as_deref());
        referenced
            .filter(|name| !self.params.contains_key(*name))
            .collect()
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT ")?;
        match &self.projection {
            Projection::Columns(columns) => {
                let names: Vec<&str> = columns.iter().map(Column::name).collect();
                write!(f, "{}", names.join(", "))?;
            }
            Projection::CountStar => write!(f, "COUNT(*) AS {}", COUNT_COLUMN)?,
            Projection::One => write!(f, "1")?,
        }
        if let Some(table) = &self.table {
            write!(f, " FROM {}", table)?;
        }
        match &self.filter {
            Some(Filter::Equals { column, param }) => write!(f, " WHERE {} = @{}", column, param)?,
            Some(Filter::Like { column, param }) => write!(f, " WHERE {} LIKE @{}", column, param)?,
            None => {}
        }
        if !self.order_by.is_empty() {
            let terms: Vec<String> = self
                .order_by
                .iter()
                .map(|term| format!("{} {}", term.column, term.direction))
                .collect();
            write!(f, " ORDER BY {}", terms.join(", "))?;
        }
        if let Some(limit) = &self.limit {
            write!(f, " LIMIT @{}", limit)?;
        }
        if let Some(offset) = &self.offset {
            write!(f, " OFFSET @{}", offset)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renders_select_with_all_fragments() {
        let stmt = Statement::select("kv_store", &Column::ALL)
            .filter(Filter::like(Column::Id, "prefix"))
            .order_by(Column::CreatedAt, Direction::Desc)
            .order_by(Column::Id, Direction::Asc)
            .limit("limit")
            .offset("offset");

        assert_eq!(
            stmt.to_string(),
            "SELECT id, data, created_at, updated_at FROM kv_store WHERE id LIKE @prefix \
             ORDER BY created_at DESC, id ASC LIMIT @limit OFFSET @offset"
        );
    }

    #[test]
    fn test_renders_count_and_ping() {
        assert_eq!(
            Statement::count("kv_store").to_string(),
            "SELECT COUNT(*) AS count FROM kv_store"
        );
        assert_eq!(Statement::ping().to_string(), "SELECT 1");
    }

    #[test]
    fn test_bound_literals_never_reach_the_text() {
        let stmt = Statement::select("kv_store", &[Column::Id])
            .filter(Filter::equals(Column::Id, "key"))
            .bind("key", "x' OR '1'='1");

        assert!(!stmt.to_string().contains("OR"));
        assert_eq!(stmt.param("key"), Some(&Value::from("x' OR '1'='1")));
    }

    #[test]
    fn test_unbound_params_are_reported() {
        let stmt = Statement::select("kv_store", &[Column::Id])
            .filter(Filter::like(Column::Id, "prefix"))
            .limit("limit")
            .bind("limit", 3i64);

        assert_eq!(stmt.unbound_params(), vec!["prefix"]);
    }
}
