//! Maps `CREATE TABLE` statements onto emulator schemas:
//!
//! ```text
//! CREATE TABLE name (
//!     col TYPE [NOT NULL] [OPTIONS (allow_commit_timestamp = true)],
//!     ...
//! ) PRIMARY KEY (col)
//! ```
//!
//! Parsing is done by `sqlparser` with the generic dialect, which accepts
//! column `OPTIONS` and the trailing `PRIMARY KEY` clause. Types are
//! `STRING(n)`, `STRING`, `JSON`, `TIMESTAMP`, `INT64` and `BOOL`. Anything
//! else is rejected with `InvalidArgument`.

use super::table::{ColumnDef, ColumnType, TableSchema};
use crate::core::{BackendError, BackendResult};
use sqlparser::ast as sql_ast;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

const COMMIT_TIMESTAMP_OPTION: &str = "allow_commit_timestamp";

fn invalid(message: impl Into<String>) -> BackendError {
    BackendError::InvalidArgument(message.into())
}

fn parse_single(ddl: &str) -> BackendResult<sql_ast::Statement> {
    let mut statements = Parser::parse_sql(&GenericDialect {}, ddl)
        .map_err(|e| invalid(format!("invalid DDL: {}", e)))?;
    match statements.len() {
        1 => Ok(statements.remove(0)),
        n => Err(invalid(format!("expected one DDL statement, got {}", n))),
    }
}

fn table_name(name: &sql_ast::ObjectName) -> BackendResult<String> {
    match name.0.as_slice() {
        [part] => part
            .as_ident()
            .map(|ident| ident.value.clone())
            .ok_or_else(|| invalid(format!("invalid table name '{}'", name))),
        _ => Err(invalid(format!("qualified table names are not supported: '{}'", name))),
    }
}

fn convert_create_table(create: sql_ast::CreateTable) -> BackendResult<TableSchema> {
    let name = table_name(&create.name)?;
    if !create.constraints.is_empty() {
        return Err(invalid(format!("table '{}' declares unsupported constraints", name)));
    }
    if create.columns.is_empty() {
        return Err(invalid(format!("table '{}' has no columns", name)));
    }

    let columns = create
        .columns
        .into_iter()
        .map(convert_column_def)
        .collect::<BackendResult<Vec<_>>>()?;

    let primary_key = match create.primary_key.as_deref() {
        Some(expr) => primary_key_column(expr)?,
        None => return Err(invalid(format!("table '{}' has no PRIMARY KEY clause", name))),
    };

    TableSchema::new(name, columns, primary_key)
}

fn primary_key_column(expr: &sql_ast::Expr) -> BackendResult<String> {
    match expr {
        sql_ast::Expr::Nested(inner) => primary_key_column(inner),
        sql_ast::Expr::Identifier(ident) => Ok(ident.value.clone()),
        other => Err(invalid(format!(
            "PRIMARY KEY must name a single column, got '{}'",
            other
        ))),
    }
}

fn convert_column_def(col: sql_ast::ColumnDef) -> BackendResult<ColumnDef> {
    let data_type = convert_data_type(&col.data_type)?;
    let mut column = ColumnDef::new(col.name.value, data_type);

    for def in &col.options {
        match &def.option {
            sql_ast::ColumnOption::NotNull => column = column.not_null(),
            sql_ast::ColumnOption::Null => column.nullable = true,
            sql_ast::ColumnOption::Options(options) => {
                column.allow_commit_timestamp = commit_timestamp_option(options)?;
            }
            other => {
                return Err(invalid(format!(
                    "unsupported option '{}' on column '{}'",
                    other, column.name
                )));
            }
        }
    }

    if column.allow_commit_timestamp && column.data_type != ColumnType::Timestamp {
        return Err(invalid(format!(
            "allow_commit_timestamp is only valid on TIMESTAMP columns, not '{}'",
            column.name
        )));
    }
    Ok(column)
}

fn convert_data_type(dt: &sql_ast::DataType) -> BackendResult<ColumnType> {
    match dt {
        sql_ast::DataType::String(len) => {
            let len = len
                .map(|n| {
                    usize::try_from(n).map_err(|_| invalid(format!("invalid STRING length {}", n)))
                })
                .transpose()?;
            Ok(ColumnType::String(len))
        }
        sql_ast::DataType::JSON => Ok(ColumnType::Json),
        sql_ast::DataType::Timestamp(None, _) => Ok(ColumnType::Timestamp),
        sql_ast::DataType::Int64 => Ok(ColumnType::Int64),
        sql_ast::DataType::Bool | sql_ast::DataType::Boolean => Ok(ColumnType::Bool),
        other => Err(invalid(format!("unsupported column type '{}'", other))),
    }
}

fn commit_timestamp_option(options: &[sql_ast::SqlOption]) -> BackendResult<bool> {
    let mut enabled = false;
    for option in options {
        let sql_ast::SqlOption::KeyValue { key, value } = option else {
            return Err(invalid(format!("unsupported column option '{}'", option)));
        };
        if !key.value.eq_ignore_ascii_case(COMMIT_TIMESTAMP_OPTION) {
            return Err(invalid(format!("unsupported column option '{}'", key.value)));
        }
        enabled = match value {
            sql_ast::Expr::Value(v) => match &v.value {
                sql_ast::Value::Boolean(flag) => *flag,
                sql_ast::Value::Null => false,
                other => {
                    return Err(invalid(format!(
                        "allow_commit_timestamp must be true, false or null, got '{}'",
                        other
                    )));
                }
            },
            other => {
                return Err(invalid(format!(
                    "allow_commit_timestamp must be true, false or null, got '{}'",
                    other
                )));
            }
        };
    }
    Ok(enabled)
}

/// Parse one `CREATE TABLE` statement into a schema.
pub fn parse_create_table(ddl: &str) -> BackendResult<TableSchema> {
    match parse_single(ddl)? {
        sql_ast::Statement::CreateTable(create) => convert_create_table(create),
        other => Err(invalid(format!(
            "only CREATE TABLE is supported, got '{}'",
            other
        ))),
    }
}

/// Name of the table a DDL statement creates, or `None` for anything that
/// is not a `CREATE TABLE`.
pub fn declared_table(ddl: &str) -> Option<String> {
    match parse_single(ddl).ok()? {
        sql_ast::Statement::CreateTable(create) => table_name(&create.name).ok(),
        _ => None,
    }
}
