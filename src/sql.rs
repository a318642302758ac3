use std::collections::HashMap;
use std::str::FromStr;

use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::allocator::AllocationPolicy;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertScope {
        id: Ulid,
        kind: ScopeKind,
        capacity: u32,
        starts_at: Ms,
        /// `None` uses the server default.
        slot_minutes: Option<u32>,
        name: Option<String>,
    },
    DeleteScope {
        id: Ulid,
    },
    InsertBreak {
        id: Ulid,
        scope_id: Ulid,
        start: Ms,
        end: Ms,
    },
    DeleteBreak {
        id: Ulid,
    },
    /// The slot is chosen by the allocator, never by the client.
    InsertBooking {
        scope_id: Ulid,
        details: BookingDetails,
        /// `None` uses the default for the scope's kind.
        policy: Option<AllocationPolicy>,
    },
    DeleteBooking {
        id: Ulid,
    },
    UpdatePayment {
        booking_id: Ulid,
        status: PaymentStatus,
    },
    SelectScopes {
        id: Option<Ulid>,
    },
    SelectBookings {
        scope_id: Option<Ulid>,
        device_id: Option<String>,
    },
    /// `WHERE id = ...` on bookings; other filters are ignored.
    SelectBooking {
        id: Ulid,
    },
}

const SCOPE_COLUMNS: &[&str] = &["id", "kind", "capacity", "starts_at", "slot_minutes", "name"];
const BREAK_COLUMNS: &[&str] = &["id", "scope_id", "start", "end"];
const BOOKING_COLUMNS: &[&str] = &[
    "scope_id",
    "performer_name",
    "performance_type",
    "payment_method",
    "device_id",
    "payment_status",
    "song_info",
    "wants_video",
    "policy",
];
const PAYMENT_COLUMNS: &[&str] = &["booking_id", "status"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "scopes" => {
            let row = Row::new("scopes", insert, &values, SCOPE_COLUMNS)?;
            Ok(Command::InsertScope {
                id: parse_ulid_expr(row.required("id")?)?,
                kind: parse_enum(row.required("kind")?)?,
                capacity: parse_u32(row.required("capacity")?)?,
                starts_at: parse_i64_expr(row.required("starts_at")?)?,
                slot_minutes: row.optional("slot_minutes").map(parse_u32_or_null).transpose()?.flatten(),
                name: row.optional("name").map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "breaks" => {
            let row = Row::new("breaks", insert, &values, BREAK_COLUMNS)?;
            Ok(Command::InsertBreak {
                id: parse_ulid_expr(row.required("id")?)?,
                scope_id: parse_ulid_expr(row.required("scope_id")?)?,
                start: parse_i64_expr(row.required("start")?)?,
                end: parse_i64_expr(row.required("end")?)?,
            })
        }
        "bookings" => {
            let row = Row::new("bookings", insert, &values, BOOKING_COLUMNS)?;
            let mut details = BookingDetails::new(
                parse_string(row.required("performer_name")?)?,
                parse_enum(row.required("performance_type")?)?,
                parse_enum(row.required("payment_method")?)?,
                parse_string(row.required("device_id")?)?,
            );
            if let Some(expr) = row.optional("payment_status")
                && let Some(status) = parse_string_or_null(expr)? {
                    details.payment_status = parse_text(&status)?;
                }
            details.song_info = row.optional("song_info").map(parse_string_or_null).transpose()?.flatten();
            details.wants_video = row.optional("wants_video").map(parse_bool).transpose()?.unwrap_or(false);
            let policy = match row.optional("policy").map(parse_string_or_null).transpose()?.flatten() {
                Some(p) => Some(parse_text(&p)?),
                None => None,
            };
            Ok(Command::InsertBooking {
                scope_id: parse_ulid_expr(row.required("scope_id")?)?,
                details,
                policy,
            })
        }
        "payments" => {
            let row = Row::new("payments", insert, &values, PAYMENT_COLUMNS)?;
            Ok(Command::UpdatePayment {
                booking_id: parse_ulid_expr(row.required("booking_id")?)?,
                status: parse_enum(row.required("status")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "scopes" => Ok(Command::DeleteScope { id }),
        "breaks" => Ok(Command::DeleteBreak { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = HashMap::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters);
    }

    match table.as_str() {
        "scopes" => Ok(Command::SelectScopes {
            id: filters.get("id").map(|e| parse_ulid_expr(e)).transpose()?,
        }),
        "bookings" if filters.contains_key("id") => Ok(Command::SelectBooking {
            id: parse_ulid_expr(filters["id"])?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            scope_id: filters.get("scope_id").map(|e| parse_ulid_expr(e)).transpose()?,
            device_id: filters.get("device_id").map(|e| parse_string(e)).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Collect `column = value` terms joined by AND. Other predicates are ignored.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut HashMap<String, &'a Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out);
            collect_eq_filters(right, out);
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if let Some(col) = expr_column_name(left) {
                out.insert(col, right.as_ref());
            }
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        _ => {}
    }
}

// ── Rows ──────────────────────────────────────────────────────

/// One VALUES row keyed by column name. Without an explicit column list the
/// table's canonical column order applies.
struct Row<'a> {
    table: &'static str,
    values: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        insert: &ast::Insert,
        values: &'a [Expr],
        canonical: &[&str],
    ) -> Result<Self, SqlError> {
        let columns: Vec<String> = if insert.columns.is_empty() {
            canonical.iter().take(values.len()).map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if columns.len() != values.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        if let Some(unknown) = columns.iter().find(|c| !canonical.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(table, unknown.clone()));
        }
        Ok(Self {
            table,
            values: columns.into_iter().zip(values.iter()).collect(),
        })
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.values
            .get(column)
            .copied()
            .ok_or(SqlError::MissingColumn(self.table, column))
    }

    fn optional(&self, column: &str) -> Option<&'a Expr> {
        self.values.get(column).copied()
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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// The single VALUES row. Multi-row inserts are rejected: each booking is a
/// separate allocation.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if matches!(extract_value(expr), Some(Value::Null)) {
        return Ok(None);
    }
    parse_u32(expr).map(Some)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if matches!(extract_value(expr), Some(Value::Null)) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_text<T>(s: &str) -> Result<T, SqlError>
where
    T: FromStr<Err = UnknownVariant>,
{
    s.parse().map_err(|e: UnknownVariant| SqlError::Parse(e.to_string()))
}

fn parse_enum<T>(expr: &Expr) -> Result<T, SqlError>
where
    T: FromStr<Err = UnknownVariant>,
{
    parse_text(&parse_string(expr)?)
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            Value::Null => Ok(false),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const OTHER: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    #[test]
    fn parse_insert_scope() {
        let sql = format!(
            "INSERT INTO scopes (id, kind, capacity, starts_at, slot_minutes, name) VALUES ('{ID}', 'block', 12, 1761847200000, 5, '7pm')"
        );
        let cmd = parse_sql(&sql).unwrap();
        assert_eq!(
            cmd,
            Command::InsertScope {
                id: Ulid::from_string(ID).unwrap(),
                kind: ScopeKind::Block,
                capacity: 12,
                starts_at: 1_761_847_200_000,
                slot_minutes: Some(5),
                name: Some("7pm".into()),
            }
        );
    }

    #[test]
    fn parse_insert_scope_positional_defaults() {
        let sql = format!("INSERT INTO scopes VALUES ('{ID}', 'EVENT', 40, 1761847200000)");
        match parse_sql(&sql).unwrap() {
            Command::InsertScope { kind, slot_minutes, name, .. } => {
                assert_eq!(kind, ScopeKind::Event);
                assert_eq!(slot_minutes, None);
                assert_eq!(name, None);
            }
            cmd => panic!("expected InsertScope, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_scope_missing_capacity() {
        let sql = format!("INSERT INTO scopes (id, kind, starts_at) VALUES ('{ID}', 'block', 0)");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn("scopes", "capacity"))
        ));
    }

    #[test]
    fn parse_insert_break() {
        let sql = format!(
            r#"INSERT INTO breaks (id, scope_id, start, "end") VALUES ('{ID}', '{OTHER}', 1000, 2000)"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBreak { scope_id, start, end, .. } => {
                assert_eq!(scope_id.to_string(), OTHER);
                assert_eq!((start, end), (1000, 2000));
            }
            cmd => panic!("expected InsertBreak, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_minimal() {
        let sql = format!(
            "INSERT INTO bookings (scope_id, performer_name, performance_type, payment_method, device_id) \
             VALUES ('{ID}', 'Ada', 'music', 'cash', 'device-0001')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking { scope_id, details, policy } => {
                assert_eq!(scope_id.to_string(), ID);
                assert_eq!(details.performer_name, "Ada");
                assert_eq!(details.performance_type, PerformanceType::Music);
                assert_eq!(details.payment_status, PaymentStatus::CashPending);
                assert_eq!(details.song_info, None);
                assert!(!details.wants_video);
                assert_eq!(policy, None);
            }
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_full() {
        let sql = format!(
            "INSERT INTO bookings (device_id, scope_id, performer_name, performance_type, payment_method, \
             payment_status, song_info, wants_video, policy) \
             VALUES ('device-0001', '{ID}', 'Bo', 'Karaoke', 'venmo', 'paid', 'Song 2', true, 'sequential')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking { details, policy, .. } => {
                assert_eq!(details.payment_status, PaymentStatus::Paid);
                assert_eq!(details.song_info.as_deref(), Some("Song 2"));
                assert!(details.wants_video);
                assert_eq!(policy, Some(AllocationPolicy::Sequential));
            }
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_rejects_unknown_enum_and_slot() {
        let bad_type = format!(
            "INSERT INTO bookings (scope_id, performer_name, performance_type, payment_method, device_id) \
             VALUES ('{ID}', 'Ada', 'mime', 'cash', 'device-0001')"
        );
        assert!(matches!(parse_sql(&bad_type), Err(SqlError::Parse(_))));

        let with_slot = format!(
            "INSERT INTO bookings (scope_id, slot_number) VALUES ('{ID}', 3)"
        );
        assert!(matches!(
            parse_sql(&with_slot),
            Err(SqlError::UnknownColumn("bookings", _))
        ));
    }

    #[test]
    fn parse_multi_row_insert_is_unsupported() {
        let sql = format!("INSERT INTO payments VALUES ('{ID}', 'paid'), ('{OTHER}', 'paid')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_payment_update() {
        let sql = format!("INSERT INTO payments (booking_id, status) VALUES ('{ID}', 'cash-pending')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdatePayment {
                booking_id: Ulid::from_string(ID).unwrap(),
                status: PaymentStatus::CashPending,
            }
        );
    }

    #[test]
    fn parse_deletes() {
        for (table, expect_scope, expect_break) in [("scopes", true, false), ("breaks", false, true), ("bookings", false, false)] {
            let cmd = parse_sql(&format!("DELETE FROM {table} WHERE id = '{ID}'")).unwrap();
            assert_eq!(matches!(cmd, Command::DeleteScope { .. }), expect_scope);
            assert_eq!(matches!(cmd, Command::DeleteBreak { .. }), expect_break);
        }
        assert!(matches!(
            parse_sql("DELETE FROM bookings"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_select_scopes() {
        assert_eq!(parse_sql("SELECT * FROM scopes").unwrap(), Command::SelectScopes { id: None });
        let cmd = parse_sql(&format!("SELECT * FROM scopes WHERE id = '{ID}'")).unwrap();
        assert_eq!(cmd, Command::SelectScopes { id: Some(Ulid::from_string(ID).unwrap()) });
    }

    #[test]
    fn parse_select_bookings_filters() {
        let sql = format!("SELECT * FROM bookings WHERE scope_id = '{ID}' AND device_id = 'device-0001'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectBookings {
                scope_id: Some(Ulid::from_string(ID).unwrap()),
                device_id: Some("device-0001".into()),
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM bookings").unwrap(),
            Command::SelectBookings { scope_id: None, device_id: None }
        );
        let sql = format!("SELECT * FROM bookings WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectBooking { id: Ulid::from_string(ID).unwrap() }
        );
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
        assert!(matches!(parse_sql("SELECT * FROM availability"), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_update_is_unsupported() {
        let sql = format!("UPDATE bookings SET payment_status = 'paid' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
