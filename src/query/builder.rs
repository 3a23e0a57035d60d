use crate::backend::{Column, Direction, Filter, Statement};

use super::params::{KeyFilter, ListParams};

pub const PREFIX_PARAM: &str = "prefix";
pub const LIMIT_PARAM: &str = "limit";
pub const OFFSET_PARAM: &str = "offset";

/// Turn a literal prefix into a LIKE pattern that matches exactly the
/// strings starting with it.
pub fn escape_like(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Builds the paired data and count statements for a list call.
#[derive(Debug, Clone)]
pub struct ListQueryBuilder<'a> {
    table: &'a str,
}

impl<'a> ListQueryBuilder<'a> {
    pub fn new(table: &'a str) -> Self {
        Self { table }
    }

    fn apply_filter(statement: Statement, filter: &KeyFilter) -> Statement {
        match filter.as_prefix() {
            Some(prefix) => statement
                .filter(Filter::like(Column::Id, PREFIX_PARAM))
                .bind(PREFIX_PARAM, escape_like(prefix)),
            None => statement,
        }
    }

    /// Page of records in the requested order, tie-broken by key.
    pub fn data_statement(&self, params: &ListParams) -> Statement {
        let mut statement = Self::apply_filter(
            Statement::select(self.table, &Column::ALL),
            &params.filter,
        )
        .order_by(params.sort.column(), params.sort.direction());

        if params.sort.column() != Column::Id {
            statement = statement.order_by(Column::Id, Direction::Asc);
        }

        let offset = params.page.offset();
        match params.page.limit {
            Some(limit) => {
                statement = statement
                    .limit(LIMIT_PARAM)
                    .bind(LIMIT_PARAM, i64::from(limit));
            }
            // OFFSET is only valid after LIMIT.
            None if offset > 0 => {
                statement = statement.limit(LIMIT_PARAM).bind(LIMIT_PARAM, i64::MAX);
            }
            None => {}
        }
        if offset > 0 {
            statement = statement
                .offset(OFFSET_PARAM)
                .bind(OFFSET_PARAM, i64::from(offset));
        }

        statement
    }

    /// Size of the filtered population, ignoring pagination.
    pub fn count_statement(&self, filter: &KeyFilter) -> Statement {
        Self::apply_filter(Statement::count(self.table), filter)
    }
}
