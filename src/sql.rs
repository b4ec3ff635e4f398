use chrono::{NaiveDate, NaiveDateTime};
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, UnaryOperator, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::MAX_BATCH_SIZE;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertProvider {
        id: Ulid,
        name: Option<String>,
    },
    DeleteProvider {
        id: Ulid,
    },
    SetWorkingPlan {
        provider_id: Ulid,
        plan_json: String,
    },
    UpsertOverrides {
        overrides: Vec<DateSpecificOverride>,
    },
    DeleteOverride {
        provider_id: Ulid,
        date: NaiveDate,
    },
    InsertAppointments {
        appointments: Vec<BookedInterval>,
    },
    DeleteAppointment {
        id: Ulid,
    },
    SelectProviders,
    SelectWorkingPlan {
        provider_id: Ulid,
    },
    SelectOverrides {
        provider_id: Ulid,
    },
    SelectAppointments {
        provider_id: Ulid,
    },
    SelectSlots {
        provider_id: Ulid,
        date: NaiveDate,
        duration: Min,
        granularity: Option<Min>,
        buffer_before: Option<Min>,
        buffer_after: Option<Min>,
    },
    SelectAvailableDates {
        provider_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        duration: Min,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Canonical table name and the column order assumed when an INSERT omits
/// its column list.
fn insert_target(table: &str) -> Option<(&'static str, &'static [&'static str])> {
    let target: (&'static str, &'static [&'static str]) = match table {
        "providers" => ("providers", &["id", "name"]),
        "working_plans" => ("working_plans", &["provider_id", "plan"]),
        "overrides" => ("overrides", &["provider_id", "date", "start", "end"]),
        "appointments" => ("appointments", &["id", "provider_id", "start", "end"]),
        _ => return None,
    };
    Some(target)
}

/// One VALUES row addressed by column name.
struct Row<'a> {
    table: &'static str,
    columns: &'a [String],
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn get(&self, column: &'static str) -> Option<&'a Expr> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values.get(idx)
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let Some((table, defaults)) = insert_target(&table) else {
        return Err(SqlError::UnknownTable(table));
    };
    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };

    let rows = extract_insert_rows(insert)?;
    if rows.len() > MAX_BATCH_SIZE {
        return Err(SqlError::Parse(format!(
            "too many rows: {} (max {MAX_BATCH_SIZE})",
            rows.len()
        )));
    }
    let rows: Vec<Row> = rows
        .iter()
        .map(|values| Row { table, columns: &columns, values })
        .collect();

    match table {
        "providers" => {
            let [row] = rows.as_slice() else {
                return Err(SqlError::Unsupported("one provider per INSERT".into()));
            };
            Ok(Command::InsertProvider {
                id: parse_ulid_expr(row.require("id")?)?,
                name: row.get("name").map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "working_plans" => {
            let [row] = rows.as_slice() else {
                return Err(SqlError::Unsupported("one working plan per INSERT".into()));
            };
            Ok(Command::SetWorkingPlan {
                provider_id: parse_ulid_expr(row.require("provider_id")?)?,
                plan_json: parse_string_expr(row.require("plan")?)?,
            })
        }
        "overrides" => {
            let overrides = rows
                .iter()
                .enumerate()
                .map(|(i, row)| parse_override_row(row).map_err(|e| e.in_row(i)))
                .collect::<Result<_, _>>()?;
            Ok(Command::UpsertOverrides { overrides })
        }
        _ => {
            let appointments = rows
                .iter()
                .enumerate()
                .map(|(i, row)| parse_appointment_row(row).map_err(|e| e.in_row(i)))
                .collect::<Result<_, _>>()?;
            Ok(Command::InsertAppointments { appointments })
        }
    }
}

fn parse_override_row(row: &Row) -> Result<DateSpecificOverride, SqlError> {
    Ok(DateSpecificOverride {
        provider_id: parse_ulid_expr(row.require("provider_id")?)?,
        date: parse_date_expr(row.require("date")?)?,
        start: parse_clock_expr(row.require("start")?)?,
        end: parse_clock_expr(row.require("end")?)?,
    })
}

fn parse_appointment_row(row: &Row) -> Result<BookedInterval, SqlError> {
    Ok(BookedInterval {
        appointment_id: parse_ulid_expr(row.require("id")?)?,
        provider_id: parse_ulid_expr(row.require("provider_id")?)?,
        start: parse_datetime_expr(row.require("start")?)?,
        end: parse_datetime_expr(row.require("end")?)?,
    })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::collect(delete.selection.as_ref())?;

    match table.as_str() {
        "providers" => Ok(Command::DeleteProvider {
            id: parse_ulid_expr(filters.eq("id")?)?,
        }),
        "overrides" => Ok(Command::DeleteOverride {
            provider_id: parse_ulid_expr(filters.eq("provider_id")?)?,
            date: parse_date_expr(filters.eq("date")?)?,
        }),
        "appointments" => Ok(Command::DeleteAppointment {
            id: parse_ulid_expr(filters.eq("id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

/// Target table of a `SELECT ... FROM <table>`.
pub fn select_table(query: &ast::Query) -> Result<String, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    table_factor_name(&from.relation)
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let table = select_table(query)?;
    let selection = match query.body.as_ref() {
        SetExpr::Select(s) => s.selection.as_ref(),
        _ => None,
    };
    let filters = Filters::collect(selection)?;

    match table.as_str() {
        "providers" => Ok(Command::SelectProviders),
        "working_plans" => Ok(Command::SelectWorkingPlan {
            provider_id: parse_ulid_expr(filters.eq("provider_id")?)?,
        }),
        "overrides" => Ok(Command::SelectOverrides {
            provider_id: parse_ulid_expr(filters.eq("provider_id")?)?,
        }),
        "appointments" => Ok(Command::SelectAppointments {
            provider_id: parse_ulid_expr(filters.eq("provider_id")?)?,
        }),
        "slots" => Ok(Command::SelectSlots {
            provider_id: parse_ulid_expr(filters.eq("provider_id")?)?,
            date: parse_date_expr(filters.eq("date")?)?,
            duration: parse_i64_expr(filters.eq("duration")?)?,
            granularity: filters.eq_opt("granularity").map(parse_i64_expr).transpose()?,
            buffer_before: filters.eq_opt("buffer_before").map(parse_i64_expr).transpose()?,
            buffer_after: filters.eq_opt("buffer_after").map(parse_i64_expr).transpose()?,
        }),
        "available_dates" => Ok(Command::SelectAvailableDates {
            provider_id: parse_ulid_expr(filters.eq("provider_id")?)?,
            from: parse_date_expr(filters.gte("start")?)?,
            to: parse_date_expr(filters.lte("end")?)?,
            duration: parse_i64_expr(filters.eq("duration")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `column <op> value` comparisons from an AND chain.
#[derive(Default)]
struct Filters<'a> {
    eq: Vec<(String, &'a Expr)>,
    gte: Vec<(String, &'a Expr)>,
    lte: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn collect(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters::default();
        if let Some(expr) = selection {
            filters.visit(expr)?;
        }
        Ok(filters)
    }

    fn visit(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.visit(inner),
            Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
                self.visit(left)?;
                self.visit(right)
            }
            Expr::BinaryOp { left, op, right } => {
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                let bucket = match op {
                    BinaryOperator::Eq => &mut self.eq,
                    BinaryOperator::GtEq => &mut self.gte,
                    BinaryOperator::LtEq => &mut self.lte,
                    other => return Err(SqlError::Unsupported(format!("operator {other}"))),
                };
                bucket.push((column, right.as_ref()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    fn find(list: &[(String, &'a Expr)], column: &str) -> Option<&'a Expr> {
        list.iter().rev().find(|(c, _)| c == column).map(|(_, e)| *e)
    }

    fn eq_opt(&self, column: &str) -> Option<&'a Expr> {
        Self::find(&self.eq, column)
    }

    fn eq(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.eq_opt(column).ok_or(SqlError::MissingFilter(column))
    }

    fn gte(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        Self::find(&self.gte, column).ok_or(SqlError::MissingFilter(column))
    }

    fn lte(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        Self::find(&self.lte, column).ok_or(SqlError::MissingFilter(column))
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    let first = tables_with_joins
        .first()
        .ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    table_factor_name(&first.relation)
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if values.rows.is_empty() => {
            Err(SqlError::Parse("empty VALUES".into()))
        }
        SetExpr::Values(values) => Ok(&values.rows),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

/// Text of a string literal (or bare number, for substituted parameters).
fn literal_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.as_str()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    literal_text(expr).map(str::to_string)
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(Some),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal_text(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp { op: UnaryOperator::Minus, expr } = expr {
        return Ok(-parse_i64_expr(expr)?);
    }
    let s = literal_text(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = literal_text(expr)?;
    parse_date(s).ok_or_else(|| SqlError::Parse(format!("bad date {s:?}, expected YYYY-MM-DD")))
}

fn parse_clock_expr(expr: &Expr) -> Result<Min, SqlError> {
    let s = literal_text(expr)?;
    parse_clock(s).ok_or_else(|| SqlError::Parse(format!("bad time {s:?}, expected HH:MM")))
}

fn parse_datetime_expr(expr: &Expr) -> Result<NaiveDateTime, SqlError> {
    let s = literal_text(expr)?;
    parse_datetime(s)
        .ok_or_else(|| SqlError::Parse(format!("bad datetime {s:?}, expected YYYY-MM-DD HH:MM")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl SqlError {
    fn in_row(self, row: usize) -> SqlError {
        match self {
            SqlError::Parse(msg) => SqlError::Parse(format!("row {row}: {msg}")),
            other => other,
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const PID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const AID: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn pid() -> Ulid {
        Ulid::from_string(PID).unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    #[test]
    fn insert_provider() {
        let sql = format!("INSERT INTO providers (id, name) VALUES ('{PID}', 'Dr. Ames')");
        let cmd = parse_sql(&sql).unwrap();
        assert_eq!(
            cmd,
            Command::InsertProvider { id: pid(), name: Some("Dr. Ames".into()) }
        );
    }

    #[test]
    fn insert_provider_without_name() {
        let cmd = parse_sql(&format!("INSERT INTO providers (id) VALUES ('{PID}')")).unwrap();
        assert_eq!(cmd, Command::InsertProvider { id: pid(), name: None });

        let cmd = parse_sql(&format!("INSERT INTO providers VALUES ('{PID}', NULL)")).unwrap();
        assert_eq!(cmd, Command::InsertProvider { id: pid(), name: None });
    }

    #[test]
    fn delete_provider() {
        let cmd = parse_sql(&format!("DELETE FROM providers WHERE id = '{PID}'")).unwrap();
        assert_eq!(cmd, Command::DeleteProvider { id: pid() });
    }

    #[test]
    fn insert_working_plan_keeps_json_text() {
        let json = r#"{"monday": {"start": "09:00", "end": "17:00", "breaks": []}}"#;
        let sql = format!("INSERT INTO working_plans (provider_id, plan) VALUES ('{PID}', '{json}')");
        match parse_sql(&sql).unwrap() {
            Command::SetWorkingPlan { provider_id, plan_json } => {
                assert_eq!(provider_id, pid());
                assert_eq!(plan_json, json);
            }
            other => panic!("expected SetWorkingPlan, got {other:?}"),
        }
    }

    #[test]
    fn insert_overrides_multi_row() {
        let sql = format!(
            r#"INSERT INTO overrides (provider_id, "date", start, "end") VALUES
               ('{PID}', '2024-03-04', '10:00', '12:00'),
               ('{PID}', '2024-03-05', '08:30', '24:00')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::UpsertOverrides { overrides } => {
                assert_eq!(overrides.len(), 2);
                assert_eq!(overrides[0].date, date("2024-03-04"));
                assert_eq!((overrides[0].start, overrides[0].end), (600, 720));
                assert_eq!((overrides[1].start, overrides[1].end), (510, 1440));
            }
            other => panic!("expected UpsertOverrides, got {other:?}"),
        }
    }

    #[test]
    fn insert_columns_in_any_order() {
        let sql = format!(
            r#"INSERT INTO overrides ("end", start, "date", provider_id) VALUES ('12:00', '10:00', '2024-03-04', '{PID}')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::UpsertOverrides { overrides } => {
                assert_eq!((overrides[0].start, overrides[0].end), (600, 720));
            }
            other => panic!("expected UpsertOverrides, got {other:?}"),
        }
    }

    #[test]
    fn bad_clock_names_the_row() {
        let sql = format!(
            r#"INSERT INTO overrides (provider_id, "date", start, "end") VALUES
               ('{PID}', '2024-03-04', '10:00', '12:00'),
               ('{PID}', '2024-03-05', '25:00', '26:00')"#
        );
        let err = parse_sql(&sql).unwrap_err().to_string();
        assert!(err.contains("row 1"), "{err}");
        assert!(err.contains("25:00"), "{err}");
    }

    #[test]
    fn missing_column_is_reported() {
        let sql = format!(r#"INSERT INTO overrides (provider_id, start, "end") VALUES ('{PID}', '10:00', '12:00')"#);
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn("overrides", "date"))
        ));
    }

    #[test]
    fn delete_override() {
        let sql = format!(r#"DELETE FROM overrides WHERE provider_id = '{PID}' AND "date" = '2024-03-04'"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::DeleteOverride { provider_id: pid(), date: date("2024-03-04") }
        );
    }

    #[test]
    fn insert_appointment_accepts_iso_separator() {
        let sql = format!(
            r#"INSERT INTO appointments (id, provider_id, start, "end") VALUES ('{AID}', '{PID}', '2024-03-04T12:00:00', '2024-03-04 13:00')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertAppointments { appointments } => {
                assert_eq!(appointments.len(), 1);
                let a = &appointments[0];
                assert_eq!(a.appointment_id.to_string(), AID);
                assert_eq!(a.provider_id, pid());
                assert_eq!(format_datetime(&a.start), "2024-03-04 12:00");
                assert_eq!(format_datetime(&a.end), "2024-03-04 13:00");
            }
            other => panic!("expected InsertAppointments, got {other:?}"),
        }
    }

    #[test]
    fn delete_appointment() {
        let cmd = parse_sql(&format!("DELETE FROM appointments WHERE id = '{AID}'")).unwrap();
        assert!(matches!(cmd, Command::DeleteAppointment { id } if id.to_string() == AID));
    }

    #[test]
    fn select_lists() {
        assert_eq!(parse_sql("SELECT * FROM providers").unwrap(), Command::SelectProviders);
        assert_eq!(
            parse_sql(&format!("SELECT * FROM overrides WHERE provider_id = '{PID}'")).unwrap(),
            Command::SelectOverrides { provider_id: pid() }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM appointments WHERE provider_id = '{PID}'")).unwrap(),
            Command::SelectAppointments { provider_id: pid() }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM working_plans WHERE provider_id = '{PID}'")).unwrap(),
            Command::SelectWorkingPlan { provider_id: pid() }
        );
    }

    #[test]
    fn select_slots_defaults() {
        let sql = format!(r#"SELECT * FROM slots WHERE provider_id = '{PID}' AND "date" = '2024-03-04' AND duration = 60"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectSlots {
                provider_id: pid(),
                date: date("2024-03-04"),
                duration: 60,
                granularity: None,
                buffer_before: None,
                buffer_after: None,
            }
        );
    }

    #[test]
    fn select_slots_with_knobs_and_parentheses() {
        let sql = format!(
            r#"SELECT * FROM slots WHERE (provider_id = '{PID}' AND "date" = '2024-03-04')
               AND duration = '45' AND granularity = 30 AND buffer_before = 5 AND buffer_after = 10"#
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectSlots { duration, granularity, buffer_before, buffer_after, .. } => {
                assert_eq!(duration, 45);
                assert_eq!(granularity, Some(30));
                assert_eq!(buffer_before, Some(5));
                assert_eq!(buffer_after, Some(10));
            }
            other => panic!("expected SelectSlots, got {other:?}"),
        }
    }

    #[test]
    fn negative_duration_parses_for_the_engine_to_reject() {
        let sql = format!(r#"SELECT * FROM slots WHERE provider_id = '{PID}' AND "date" = '2024-03-04' AND duration = -15"#);
        assert!(matches!(parse_sql(&sql).unwrap(), Command::SelectSlots { duration: -15, .. }));
    }

    #[test]
    fn select_slots_requires_date() {
        let sql = format!("SELECT * FROM slots WHERE provider_id = '{PID}' AND duration = 60");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("date"))));
    }

    #[test]
    fn select_available_dates() {
        let sql = format!(
            r#"SELECT * FROM available_dates WHERE provider_id = '{PID}' AND start >= '2024-03-01' AND "end" <= '2024-03-31' AND duration = 30"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailableDates {
                provider_id: pid(),
                from: date("2024-03-01"),
                to: date("2024-03-31"),
                duration: 30,
            }
        );
    }

    #[test]
    fn or_filters_are_rejected() {
        let sql = format!("SELECT * FROM overrides WHERE provider_id = '{PID}' OR provider_id = '{AID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn unknown_table_errors() {
        let sql = format!("INSERT INTO rooms (id) VALUES ('{PID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(t)) if t == "rooms"));
    }

    #[test]
    fn bad_ulid_errors() {
        assert!(matches!(
            parse_sql("DELETE FROM providers WHERE id = 'not-a-ulid'"),
            Err(SqlError::Parse(_))
        ));
    }

    #[test]
    fn empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
