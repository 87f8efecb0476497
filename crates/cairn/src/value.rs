// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! Typed values and their store string form.
//!
//! The store only holds strings. [`encode`] renders a [`Value`] into that
//! form and [`decode`] recovers it by lexical shape, trying matchers in this
//! fixed order:
//!
//! 1. symbol marker (leading `:`)
//! 2. boolean literal (`true` / `false`)
//! 3. integer literal (lossless `i64`)
//! 4. float literal (decimal or exponent form, `NaN`, `inf`, `-inf`)
//! 5. date (`YYYY-MM-DD`)
//! 6. time (`YYYY-MM-DD HH:MM:SS UTC`)
//! 7. container (JSON object or array)
//! 8. plain string
//!
//! Shapes are ambiguous by nature: a stored string `"10"` reads back as the
//! integer `10`, and a string starting with `:` reads back as a symbol.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as Json;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

#[derive(Debug, Clone)]
pub enum Value {
    String(String),
    Symbol(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Date(NaiveDate),
    /// UTC instant. Only whole seconds are stored and compared; build with
    /// [`Value::time`] to drop the fraction up front.
    Time(DateTime<Utc>),
    Sequence(Vec<Value>),
    /// Insertion-ordered entries.
    Mapping(Vec<(Key, Value)>),
}

/// Mapping key. Symbol keys are written with a leading `:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    String(String),
    Symbol(String),
}

impl Key {
    pub fn symbol(name: impl Into<String>) -> Self {
        Key::Symbol(name.into())
    }

    pub fn encode(&self) -> String {
        match self {
            Key::String(s) => s.clone(),
            Key::Symbol(s) => format!(":{s}"),
        }
    }

    pub fn decode(raw: &str) -> Self {
        match raw.strip_prefix(':') {
            Some(name) => Key::Symbol(name.to_string()),
            None => Key::String(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Key::String(s) | Key::Symbol(s) => s,
        }
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::String(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::String(value)
    }
}

impl Value {
    pub fn symbol(name: impl Into<String>) -> Self {
        Value::Symbol(name.into())
    }

    /// Builds a time value, dropping sub-second precision the wire form cannot carry.
    pub fn time(at: DateTime<Utc>) -> Self {
        Value::Time(at.with_nanosecond(0).unwrap_or(at))
    }

    pub fn mapping<K, V, I>(entries: I) -> Self
    where
        K: Into<Key>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Mapping(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn empty_mapping() -> Self {
        Value::Mapping(Vec::new())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Looks up a string key in a mapping.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.get_key(&Key::String(key.to_string()))
    }

    pub fn get_key(&self, key: &Key) -> Option<&Value> {
        match self {
            Value::Mapping(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn encode(&self) -> String {
        encode(self)
    }
}

// Times compare at second precision, matching what survives the store.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Time(a), Value::Time(b)) => a.timestamp() == b.timestamp(),
            (Value::Sequence(a), Value::Sequence(b)) => a == b,
            (Value::Mapping(a), Value::Mapping(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode(self))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Date(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::time(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::Sequence(value.into_iter().map(Into::into).collect())
    }
}

pub fn encode(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Symbol(s) => format!(":{s}"),
        Value::Integer(n) => n.to_string(),
        Value::Float(n) => format_float(*n),
        Value::Boolean(b) => b.to_string(),
        Value::Date(d) => d.format(DATE_FORMAT).to_string(),
        Value::Time(t) => t.format(TIME_FORMAT).to_string(),
        Value::Sequence(_) | Value::Mapping(_) => to_json(value).to_string(),
    }
}

pub fn decode(raw: &str) -> Value {
    MATCHERS
        .iter()
        .find_map(|(_, matcher)| matcher(raw))
        .unwrap_or_else(|| Value::String(raw.to_string()))
}

// Debug formatting is shortest round-trip and always keeps a `.` or exponent,
// so `1.0` never reads back as an integer.
fn format_float(n: f64) -> String {
    format!("{n:?}")
}

fn to_json(value: &Value) -> Json {
    match value {
        Value::Sequence(items) => Json::Array(items.iter().map(to_json).collect()),
        Value::Mapping(entries) => {
            let mut map = serde_json::Map::with_capacity(entries.len());
            for (key, item) in entries {
                map.insert(key.encode(), to_json(item));
            }
            Json::Object(map)
        }
        scalar => Json::String(encode(scalar)),
    }
}

fn from_json(json: Json) -> Value {
    match json {
        Json::String(s) => decode(&s),
        Json::Number(n) => n
            .as_i64()
            .map(Value::Integer)
            .or_else(|| n.as_f64().map(Value::Float))
            .unwrap_or_else(|| Value::String(n.to_string())),
        Json::Bool(b) => Value::Boolean(b),
        Json::Null => Value::String("null".to_string()),
        Json::Array(items) => Value::Sequence(items.into_iter().map(from_json).collect()),
        Json::Object(map) => Value::Mapping(
            map.into_iter()
                .map(|(k, v)| (Key::decode(&k), from_json(v)))
                .collect(),
        ),
    }
}

type Matcher = fn(&str) -> Option<Value>;

const MATCHERS: &[(&str, Matcher)] = &[
    ("symbol", match_symbol),
    ("boolean", match_boolean),
    ("integer", match_integer),
    ("float", match_float),
    ("date", match_date),
    ("time", match_time),
    ("container", match_container),
];

static FLOAT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[+-]?(\d+\.\d*|\.\d+|\d+)([eE][+-]?\d+)?$").expect("float pattern")
});
static DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("date pattern"));
static TIME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2} UTC$").expect("time pattern")
});

fn match_symbol(raw: &str) -> Option<Value> {
    raw.strip_prefix(':').map(Value::symbol)
}

fn match_boolean(raw: &str) -> Option<Value> {
    match raw {
        "true" => Some(Value::Boolean(true)),
        "false" => Some(Value::Boolean(false)),
        _ => None,
    }
}

fn match_integer(raw: &str) -> Option<Value> {
    let n = raw.parse::<i64>().ok()?;
    (n.to_string() == raw).then_some(Value::Integer(n))
}

fn match_float(raw: &str) -> Option<Value> {
    let special = matches!(raw, "NaN" | "inf" | "-inf");
    if !special && !FLOAT_RE.is_match(raw) {
        return None;
    }
    raw.parse::<f64>().ok().map(Value::Float)
}

fn match_date(raw: &str) -> Option<Value> {
    if !DATE_RE.is_match(raw) {
        return None;
    }
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .ok()
        .map(Value::Date)
}

fn match_time(raw: &str) -> Option<Value> {
    if !TIME_RE.is_match(raw) {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(raw, TIME_FORMAT).ok()?;
    Some(Value::Time(Utc.from_utc_datetime(&naive)))
}

fn match_container(raw: &str) -> Option<Value> {
    if !(raw.starts_with('{') || raw.starts_with('[')) {
        return None;
    }
    match serde_json::from_str::<Json>(raw).ok()? {
        json @ (Json::Object(_) | Json::Array(_)) => Some(from_json(json)),
        _ => None,
    }
}
