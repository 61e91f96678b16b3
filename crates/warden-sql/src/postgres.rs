//! PostgreSQL transport backed by `sqlx`.

use std::fmt::Write as _;
use std::str::FromStr;

use futures::TryStreamExt;
use serde_json::Value;
use sqlx::postgres::types::{PgInterval, PgMoney};
use sqlx::postgres::{PgArguments, PgConnection, PgRow, PgTypeInfo};
use sqlx::query::Query;
use chrono::ParseError;
use sqlx::types::chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::types::ipnetwork::IpNetwork;
use sqlx::types::{Decimal, Json, Uuid};
use sqlx::{
    Column, Connection, Either, Executor as _, Postgres, Row as _, Statement as _, TypeInfo,
    ValueRef,
};
use warden_core::BrokerError;

use crate::transport::{FetchedRows, QueryConnection, QueryConnector, QueryTarget, Row};

fn db_err(context: &str) -> impl Fn(sqlx::Error) -> BrokerError + '_ {
    move |e| BrokerError::transport(format!("{context}: {e}"))
}

/// Opens a fresh connection per query.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnector;

impl QueryConnector for PgConnector {
    type Connection = PgSession;

    async fn connect(&self, target: &QueryTarget) -> Result<PgSession, BrokerError> {
        let conn = PgConnection::connect(target.connection_string.expose())
            .await
            .map_err(db_err("database connect"))?;
        tracing::debug!(profile = %target.profile, "database connection opened");
        Ok(PgSession { conn })
    }
}

#[derive(Debug)]
pub struct PgSession {
    conn: PgConnection,
}

impl QueryConnection for PgSession {
    async fn set_statement_timeout(&mut self, timeout_ms: u64) -> Result<(), BrokerError> {
        sqlx::query("SELECT set_config('statement_timeout', $1, false)")
            .bind(timeout_ms.to_string())
            .execute(&mut self.conn)
            .await
            .map_err(db_err("set statement_timeout"))?;
        Ok(())
    }

    /// Prepares first so every JSON parameter is bound as the type the server
    /// inferred for its placeholder.
    async fn fetch(
        &mut self,
        query: &str,
        params: &[Value],
        row_limit: usize,
    ) -> Result<FetchedRows, BrokerError> {
        let statement = self.conn.prepare(query).await.map_err(db_err("query"))?;
        let slots: &[PgTypeInfo] = match statement.parameters() {
            Some(Either::Left(types)) => types,
            _ => &[],
        };

        let mut bound = statement.query();
        for (i, value) in params.iter().enumerate() {
            let param = Param::coerce(value, slots.get(i).map(TypeInfo::name)).map_err(|e| {
                BrokerError::transport(format!("parameter ${}: {e}", i + 1))
            })?;
            bound = param.bind(bound);
        }

        let mut fetched = FetchedRows::default();
        let mut streamed: u64 = 0;
        let mut reported: u64 = 0;
        #[allow(deprecated)]
        let mut stream = bound.fetch_many(&mut self.conn);
        while let Some(item) = stream.try_next().await.map_err(db_err("query"))? {
            match item {
                Either::Left(done) => reported += done.rows_affected(),
                Either::Right(row) => {
                    streamed += 1;
                    if fetched.rows.len() < row_limit {
                        fetched.rows.push(row_to_json(&row));
                    }
                }
            }
        }
        fetched.total = reported.max(streamed);
        Ok(fetched)
    }

    async fn close(self) {
        if let Err(e) = self.conn.close().await {
            tracing::debug!("database close: {e}");
        }
    }

    fn abort(self) {
        // Dropping the connection closes the socket; the server cancels the backend.
        drop(self);
    }
}

/// A JSON parameter converted for one placeholder.
#[derive(Debug, Clone, PartialEq)]
enum Param {
    Bool(Option<bool>),
    Int2(Option<i16>),
    Int4(Option<i32>),
    Int8(Option<i64>),
    Float4(Option<f32>),
    Float8(Option<f64>),
    Numeric(Option<Decimal>),
    Uuid(Option<Uuid>),
    TimestampTz(Option<DateTime<Utc>>),
    Timestamp(Option<NaiveDateTime>),
    Date(Option<NaiveDate>),
    Time(Option<NaiveTime>),
    Json(Option<Value>),
    Text(Option<String>),
}

impl Param {
    /// Convert `value` for a placeholder of type `slot`. Without a known slot
    /// type the JSON type decides.
    fn coerce(value: &Value, slot: Option<&str>) -> Result<Self, String> {
        let param = match slot {
            Some("BOOL") => Self::Bool(scalar(value, Value::as_bool, bool::from_str)?),
            Some("INT2") => Self::Int2(scalar(value, int, i16::from_str)?),
            Some("INT4") => Self::Int4(scalar(value, int, i32::from_str)?),
            Some("INT8") => Self::Int8(scalar(value, Value::as_i64, i64::from_str)?),
            #[allow(clippy::cast_possible_truncation)]
            Some("FLOAT4") => Self::Float4(scalar(
                value,
                |v| v.as_f64().map(|f| f as f32),
                f32::from_str,
            )?),
            Some("FLOAT8") => Self::Float8(scalar(value, Value::as_f64, f64::from_str)?),
            Some("NUMERIC") => Self::Numeric(scalar(
                value,
                |v| v.as_number().and_then(|n| decimal(&n.to_string()).ok()),
                decimal,
            )?),
            Some("UUID") => Self::Uuid(scalar(value, |_| None, Uuid::parse_str)?),
            Some("TIMESTAMPTZ") => Self::TimestampTz(scalar(value, |_| None, timestamptz)?),
            Some("TIMESTAMP") => Self::Timestamp(scalar(value, |_| None, timestamp)?),
            Some("DATE") => Self::Date(scalar(value, |_| None, NaiveDate::from_str)?),
            Some("TIME") => Self::Time(scalar(value, |_| None, NaiveTime::from_str)?),
            Some("JSON" | "JSONB") => Self::Json((!value.is_null()).then(|| value.clone())),
            Some("TEXT" | "VARCHAR" | "CHAR" | "NAME") => Self::Text(match value {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            }),
            _ => Self::untyped(value),
        };
        Ok(param)
    }

    fn untyped(value: &Value) -> Self {
        match value {
            Value::Null => Self::Text(None),
            Value::Bool(b) => Self::Bool(Some(*b)),
            Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => Self::Int8(Some(i)),
                (None, Some(f)) => Self::Float8(Some(f)),
                (None, None) => Self::Text(Some(n.to_string())),
            },
            Value::String(s) => Self::Text(Some(s.clone())),
            Value::Array(_) | Value::Object(_) => Self::Json(Some(value.clone())),
        }
    }

    fn bind(self, query: Query<'_, Postgres, PgArguments>) -> Query<'_, Postgres, PgArguments> {
        match self {
            Self::Bool(v) => query.bind(v),
            Self::Int2(v) => query.bind(v),
            Self::Int4(v) => query.bind(v),
            Self::Int8(v) => query.bind(v),
            Self::Float4(v) => query.bind(v),
            Self::Float8(v) => query.bind(v),
            Self::Numeric(v) => query.bind(v),
            Self::Uuid(v) => query.bind(v),
            Self::TimestampTz(v) => query.bind(v),
            Self::Timestamp(v) => query.bind(v),
            Self::Date(v) => query.bind(v),
            Self::Time(v) => query.bind(v),
            Self::Json(v) => query.bind(v.map(Json)),
            Self::Text(v) => query.bind(v),
        }
    }
}

/// JSON null is SQL NULL, strings are parsed, anything else goes through `from_json`.
fn scalar<T, E: std::fmt::Display>(
    value: &Value,
    from_json: impl Fn(&Value) -> Option<T>,
    from_str: impl Fn(&str) -> Result<T, E>,
) -> Result<Option<T>, String> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => from_str(s)
            .map(Some)
            .map_err(|e| format!("cannot parse {s:?}: {e}")),
        other => from_json(other)
            .map(Some)
            .ok_or_else(|| format!("cannot convert {other}")),
    }
}

fn int<T: TryFrom<i64>>(value: &Value) -> Option<T> {
    value.as_i64().and_then(|i| T::try_from(i).ok())
}

fn decimal(s: &str) -> Result<Decimal, String> {
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .map_err(|e| e.to_string())
}

fn timestamp(s: &str) -> Result<NaiveDateTime, ParseError> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .or_else(|_| NaiveDate::from_str(s).map(|d| d.and_time(NaiveTime::default())))
}

/// RFC 3339, or a zone-less timestamp or date taken as UTC.
fn timestamptz(s: &str) -> Result<DateTime<Utc>, ParseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .or_else(|_| timestamp(s).map(|t| t.and_utc()))
}

fn row_to_json(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .map(|col| {
            let value = column_value(row, col.ordinal(), col.type_info().name());
            (col.name().to_owned(), value)
        })
        .collect()
}

fn decode<'r, T>(row: &'r PgRow, idx: usize) -> Option<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(idx).ok()
}

/// One-dimensional arrays; NULL elements become JSON null.
fn decode_array<'r, T>(row: &'r PgRow, idx: usize, item: fn(T) -> Value) -> Option<Value>
where
    Vec<Option<T>>: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    decode::<Vec<Option<T>>>(row, idx).map(|items| {
        items
            .into_iter()
            .map(|v| v.map_or(Value::Null, item))
            .collect()
    })
}

fn text<T: ToString>(v: T) -> Value {
    Value::String(v.to_string())
}

fn float4(f: f32) -> Value {
    Value::from(f64::from(f))
}

fn rfc3339(t: DateTime<Utc>) -> Value {
    Value::String(t.to_rfc3339())
}

fn column_value(row: &PgRow, idx: usize, type_name: &str) -> Value {
    match row.try_get_raw(idx) {
        Ok(raw) if !raw.is_null() => {}
        _ => return Value::Null,
    }
    let value = match type_name {
        "BOOL" => decode::<bool>(row, idx).map(Value::from),
        "INT2" => decode::<i16>(row, idx).map(Value::from),
        "INT4" => decode::<i32>(row, idx).map(Value::from),
        "INT8" => decode::<i64>(row, idx).map(Value::from),
        "FLOAT4" => decode::<f32>(row, idx).map(float4),
        "FLOAT8" => decode::<f64>(row, idx).map(Value::from),
        // Rendered as a string so no precision is lost.
        "NUMERIC" => decode::<Decimal>(row, idx).map(text),
        "MONEY" => decode::<PgMoney>(row, idx).map(|m| text(Decimal::new(m.0, 2))),
        "JSON" | "JSONB" => decode::<Json<Value>>(row, idx).map(|j| j.0),
        "UUID" => decode::<Uuid>(row, idx).map(text),
        "TIMESTAMPTZ" => decode::<DateTime<Utc>>(row, idx).map(rfc3339),
        "TIMESTAMP" => decode::<NaiveDateTime>(row, idx).map(text),
        "DATE" => decode::<NaiveDate>(row, idx).map(text),
        "TIME" => decode::<NaiveTime>(row, idx).map(text),
        "INTERVAL" => decode::<PgInterval>(row, idx)
            .map(|i| Value::String(iso_interval(i.months, i.days, i.microseconds))),
        "INET" => decode::<IpNetwork>(row, idx).map(|n| Value::String(inet(n))),
        "CIDR" => decode::<IpNetwork>(row, idx).map(text),
        "BYTEA" => decode::<Vec<u8>>(row, idx).map(|b| Value::from(hex(&b))),
        "BOOL[]" => decode_array::<bool>(row, idx, Value::from),
        "INT2[]" => decode_array::<i16>(row, idx, Value::from),
        "INT4[]" => decode_array::<i32>(row, idx, Value::from),
        "INT8[]" => decode_array::<i64>(row, idx, Value::from),
        "FLOAT4[]" => decode_array::<f32>(row, idx, float4),
        "FLOAT8[]" => decode_array::<f64>(row, idx, Value::from),
        "NUMERIC[]" => decode_array::<Decimal>(row, idx, text),
        "UUID[]" => decode_array::<Uuid>(row, idx, text),
        "TIMESTAMPTZ[]" => decode_array::<DateTime<Utc>>(row, idx, rfc3339),
        "TIMESTAMP[]" => decode_array::<NaiveDateTime>(row, idx, text),
        "DATE[]" => decode_array::<NaiveDate>(row, idx, text),
        "TEXT[]" | "VARCHAR[]" | "CHAR[]" | "NAME[]" => {
            decode_array::<String>(row, idx, Value::String)
        }
        _ => decode::<String>(row, idx).map(Value::String),
    };
    value.unwrap_or_else(|| {
        tracing::debug!(column = idx, type_name, "column type not decodable");
        Value::String(format!("<unsupported {type_name}>"))
    })
}

/// ISO 8601 duration, keeping the month, day and time parts separate as
/// PostgreSQL does.
fn iso_interval(months: i32, days: i32, micros: i64) -> String {
    if months == 0 && days == 0 && micros == 0 {
        return "PT0S".to_owned();
    }
    let mut out = String::from("P");
    let (years, months) = (months / 12, months % 12);
    if years != 0 {
        let _ = write!(out, "{years}Y");
    }
    if months != 0 {
        let _ = write!(out, "{months}M");
    }
    if days != 0 {
        let _ = write!(out, "{days}D");
    }
    if micros != 0 {
        out.push('T');
        let hours = micros / 3_600_000_000;
        let minutes = micros % 3_600_000_000 / 60_000_000;
        let rest = micros % 60_000_000;
        if hours != 0 {
            let _ = write!(out, "{hours}H");
        }
        if minutes != 0 {
            let _ = write!(out, "{minutes}M");
        }
        if rest != 0 {
            let sign = if rest < 0 { "-" } else { "" };
            let rest = rest.unsigned_abs();
            let (secs, frac) = (rest / 1_000_000, rest % 1_000_000);
            if frac == 0 {
                let _ = write!(out, "{sign}{secs}S");
            } else {
                let frac = format!("{frac:06}");
                let _ = write!(out, "{sign}{secs}.{}S", frac.trim_end_matches('0'));
            }
        }
    }
    out
}

/// Host addresses print without a prefix, as PostgreSQL prints `inet`.
fn inet(net: IpNetwork) -> String {
    let host_prefix = match net {
        IpNetwork::V4(_) => 32,
        IpNetwork::V6(_) => 128,
    };
    if net.prefix() == host_prefix {
        net.ip().to_string()
    } else {
        net.to_string()
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}
