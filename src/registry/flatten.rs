use std::borrow::Borrow;
use std::sync::LazyLock;

use rayon::prelude::*;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::db::CompanyRow;

const DATA: &str = "data";
const OKVED_INFO: &str = "СвОКВЭД";
const OKVED_PRIMARY: &str = "СвОКВЭДОсн";
const OKVED_SECONDARY: &str = "СвОКВЭДДоп";
const OKVED_CODE: &str = "КодОКВЭД";

const SEPARATOR: char = '.';

/// Below this a batch is flattened on the calling thread.
const PAR_THRESHOLD: usize = 1024;

static CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{2}(\.\d{1,2}){0,2}$").unwrap());

/// Numeric OKVED code: class, subclass, group, subgroup (`61`, `61.1`, `61.10`, `61.10.1`).
pub fn is_okved_code(code: &str) -> bool {
    CODE_RE.is_match(code)
}

/// Which of a record's codes take part in matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CodeScope {
    /// Main activity only.
    #[default]
    Primary,
    /// Main activity, then each additional activity in order.
    Any,
}

#[derive(Debug, Clone)]
pub struct OkvedFilter {
    prefix: String,
    scope: CodeScope,
}

impl OkvedFilter {
    pub fn new(prefix: impl Into<String>, scope: CodeScope) -> Self {
        Self {
            prefix: prefix.into(),
            scope,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `61` matches `61` and `61.10`, never `610` or `6`.
    pub fn matches(&self, code: &str) -> bool {
        match code.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with(SEPARATOR),
            None => false,
        }
    }

    fn matching_code<'a>(&self, record: &'a Value) -> Option<&'a str> {
        if let Some(code) = primary_code(record).filter(|c| self.matches(c)) {
            return Some(code);
        }
        match self.scope {
            CodeScope::Primary => None,
            CodeScope::Any => secondary_codes(record).into_iter().find(|c| self.matches(c)),
        }
    }
}

fn okved_info(record: &Value) -> Option<&Value> {
    record.get(DATA)?.get(OKVED_INFO)
}

/// `data.СвОКВЭД.СвОКВЭДОсн.КодОКВЭД`, or `None` if any level is missing or not an object.
pub fn primary_code(record: &Value) -> Option<&str> {
    okved_info(record)?
        .get(OKVED_PRIMARY)?
        .get(OKVED_CODE)?
        .as_str()
}

/// Additional activity codes. The registry stores a single entry as a bare object.
pub fn secondary_codes(record: &Value) -> Vec<&str> {
    match okved_info(record).and_then(|info| info.get(OKVED_SECONDARY)) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.get(OKVED_CODE)?.as_str())
            .collect(),
        Some(item @ Value::Object(_)) => item
            .get(OKVED_CODE)
            .and_then(Value::as_str)
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}

fn scalar(record: &Value, key: &str) -> Option<String> {
    match record.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) if n.is_f64() => n.as_f64().map(render_float),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Registry exports sometimes carry identifiers as doubles (`1027700149124.0`).
fn render_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 {
        format!("{:.0}", f)
    } else {
        f.to_string()
    }
}

/// What a single record turns into under a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<'a> {
    Row(CompanyRow),
    /// The record matched on this code but has no usable `ogrn` to key it by.
    MissingOgrn(&'a str),
    NoMatch,
}

pub fn classify<'a>(record: &'a Value, filter: &OkvedFilter) -> Outcome<'a> {
    let Some(okved) = filter.matching_code(record) else {
        return Outcome::NoMatch;
    };
    let Some(ogrn) = scalar(record, "ogrn") else {
        return Outcome::MissingOgrn(okved);
    };
    Outcome::Row(CompanyRow {
        ogrn,
        inn: scalar(record, "inn"),
        kpp: scalar(record, "kpp"),
        name: scalar(record, "name"),
        full_name: scalar(record, "full_name"),
        okved: okved.to_string(),
    })
}

/// Project a matching record into a row. See [`classify`] to tell a dropped match from a miss.
pub fn flatten(record: &Value, filter: &OkvedFilter) -> Option<CompanyRow> {
    match classify(record, filter) {
        Outcome::Row(row) => Some(row),
        Outcome::MissingOgrn(_) | Outcome::NoMatch => None,
    }
}

pub fn flatten_all<'f, I>(records: I, filter: &'f OkvedFilter) -> impl Iterator<Item = CompanyRow> + 'f
where
    I: IntoIterator,
    I::Item: Borrow<Value>,
    I::IntoIter: 'f,
{
    records
        .into_iter()
        .filter_map(move |record| flatten(record.borrow(), filter))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlattenedBatch {
    pub rows: Vec<CompanyRow>,
    /// Matching records dropped for lack of an `ogrn`.
    pub missing_ogrn: usize,
}

impl FlattenedBatch {
    fn push(&mut self, outcome: Outcome<'_>) {
        match outcome {
            Outcome::Row(row) => self.rows.push(row),
            Outcome::MissingOgrn(okved) => {
                debug!(okved, "dropping matching record without ogrn");
                self.missing_ogrn += 1;
            }
            Outcome::NoMatch => {}
        }
    }
}

/// Same rows as [`flatten_all`], in input order, spread over the rayon pool for large batches.
pub fn flatten_batch(records: &[Value], filter: &OkvedFilter) -> FlattenedBatch {
    let mut batch = FlattenedBatch::default();
    if records.len() < PAR_THRESHOLD {
        records
            .iter()
            .for_each(|record| batch.push(classify(record, filter)));
        return batch;
    }
    let outcomes: Vec<Outcome<'_>> = records
        .par_iter()
        .map(|record| classify(record, filter))
        .collect();
    outcomes.into_iter().for_each(|outcome| batch.push(outcome));
    batch
}
