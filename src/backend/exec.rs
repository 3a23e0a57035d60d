use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::pattern::eval_like;
use super::statement::{Direction, Filter, Projection, Statement, COUNT_COLUMN};
use super::table::{table_key, Table};
use crate::core::{BackendError, BackendResult, Row, Value};

/// Run a statement against a consistent set of tables.
pub fn execute(tables: &BTreeMap<String, Table>, statement: &Statement) -> BackendResult<Vec<Row>> {
    let unbound = statement.unbound_params();
    if !unbound.is_empty() {
        return Err(BackendError::InvalidArgument(format!(
            "no value bound for parameter(s): {}",
            unbound.join(", ")
        )));
    }

    let Some(table_name) = statement.table() else {
        return match statement.projection() {
            Projection::One => Ok(vec![Row::new(
                Arc::from(vec![String::new()]),
                vec![Value::Int64(1)],
            )]),
            _ => Err(BackendError::InvalidArgument(
                "statement has no FROM clause".into(),
            )),
        };
    };

    let table = tables
        .get(&table_key(table_name))
        .ok_or_else(|| BackendError::NotFound(format!("table '{}'", table_name)))?;

    let matched = filter_rows(table, statement)?;

    match statement.projection() {
        Projection::One => Ok(matched
            .iter()
            .map(|_| Row::new(Arc::from(vec![String::new()]), vec![Value::Int64(1)]))
            .collect()),
        Projection::CountStar => {
            let count = i64::try_from(matched.len())
                .map_err(|_| BackendError::Internal("row count overflow".into()))?;
            Ok(vec![Row::new(
                Arc::from(vec![COUNT_COLUMN.to_string()]),
                vec![Value::Int64(count)],
            )])
        }
        Projection::Columns(columns) => {
            let mut matched = matched;
            sort_rows(table, statement, &mut matched)?;

            let offset = pagination_param(statement, statement.offset_param())?.unwrap_or(0);
            let limit = pagination_param(statement, statement.limit_param())?;

            let positions = columns
                .iter()
                .map(|c| table.schema().require_column(c.name()))
                .collect::<BackendResult<Vec<_>>>()?;
            let names: Arc<[String]> = columns.iter().map(|c| c.name().to_string()).collect();

            Ok(matched
                .into_iter()
                .skip(offset)
                .take(limit.unwrap_or(usize::MAX))
                .map(|values| {
                    Row::new(
                        Arc::clone(&names),
                        positions.iter().map(|p| values[*p].clone()).collect(),
                    )
                })
                .collect())
        }
    }
}

fn filter_rows<'t>(table: &'t Table, statement: &Statement) -> BackendResult<Vec<&'t Vec<Value>>> {
    let Some(filter) = statement.filter_clause() else {
        return Ok(table.scan().map(|(_, values)| values).collect());
    };

    let (column, param) = match filter {
        Filter::Equals { column, param } | Filter::Like { column, param } => (column, param),
    };
    let idx = table.schema().require_column(column.name())?;
    let operand = statement
        .param(param)
        .ok_or_else(|| BackendError::InvalidArgument(format!("parameter '{}' is unbound", param)))?;

    let mut rows = Vec::new();
    for (_, values) in table.scan() {
        let cell = &values[idx];
        let keep = match filter {
            Filter::Equals { .. } => !cell.is_null() && cell == operand,
            Filter::Like { .. } => {
                let pattern = operand.as_str().ok_or_else(|| {
                    BackendError::InvalidArgument(format!(
                        "LIKE pattern must be STRING, got {}",
                        operand.type_name()
                    ))
                })?;
                match cell {
                    Value::String(text) => eval_like(text, pattern)?,
                    Value::Null => false,
                    other => {
                        return Err(BackendError::InvalidArgument(format!(
                            "LIKE requires a STRING column, '{}' is {}",
                            column,
                            other.type_name()
                        )));
                    }
                }
            }
        };
        if keep {
            rows.push(values);
        }
    }
    Ok(rows)
}

/// Stable sort, so rows that tie on every term stay in primary-key order.
fn sort_rows(table: &Table, statement: &Statement, rows: &mut [&Vec<Value>]) -> BackendResult<()> {
    if statement.order_terms().is_empty() {
        return Ok(());
    }

    let terms = statement
        .order_terms()
        .iter()
        .map(|term| {
            table
                .schema()
                .require_column(term.column.name())
                .map(|idx| (idx, term.direction))
        })
        .collect::<BackendResult<Vec<_>>>()?;

    let mut failure = None;
    rows.sort_by(|a, b| {
        for (idx, direction) in &terms {
            let ordering = match a[*idx].compare(&b[*idx]) {
                Ok(ordering) => ordering,
                Err(err) => {
                    failure.get_or_insert(err);
                    return Ordering::Equal;
                }
            };
            let ordering = match direction {
                Direction::Asc => ordering,
                Direction::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn pagination_param(statement: &Statement, name: Option<&str>) -> BackendResult<Option<usize>> {
    let Some(name) = name else {
        return Ok(None);
    };
    let value = statement
        .param(name)
        .ok_or_else(|| BackendError::InvalidArgument(format!("parameter '{}' is unbound", name)))?;
    let raw = value.as_i64().ok_or_else(|| {
        BackendError::InvalidArgument(format!(
            "parameter '{}' must be INT64, got {}",
            name,
            value.type_name()
        ))
    })?;
    usize::try_from(raw).map(Some).map_err(|_| {
        BackendError::InvalidArgument(format!(
            "parameter '{}' must be non-negative, got {}",
            name, raw
        ))
    })
}
