// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns change events into Loki log lines.
//!
//! Mapping never fails: a document that is missing or malformed still produces
//! a line, so it can never hold back position advancement.

use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::source::{ChangeEvent, Record};

/// Value of the `source` and `job` labels on every stream.
pub const JOB_NAME: &str = "unifi-mongodb-watcher";

const TIME_FIELD: &str = "time";
const FLATTEN_SEPARATOR: &str = "_";
const UNKNOWN: &str = "unknown";

/// Epoch values with more integer digits than this are milliseconds.
const SECONDS_MAX_DIGITS: usize = 10;

/// A normalized log line, ready to be pushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Stream labels. Always includes `host` and `collection`.
    pub labels: BTreeMap<String, String>,
    pub timestamp_ns: i64,
    pub line: String,
}

impl LogLine {
    pub fn host(&self) -> &str {
        self.labels.get("host").map(String::as_str).unwrap_or_default()
    }

    pub fn collection(&self) -> &str {
        self.labels
            .get("collection")
            .map(String::as_str)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct RecordMapper {
    host: String,
    flatten: bool,
}

impl RecordMapper {
    pub fn new(host: impl Into<String>, flatten: bool) -> Self {
        Self {
            host: host.into(),
            flatten,
        }
    }

    pub fn map(&self, event: ChangeEvent) -> LogLine {
        self.map_at(event, SystemTime::now())
    }

    /// Maps `event`, using `arrival` when the document carries no usable timestamp.
    pub fn map_at(&self, event: ChangeEvent, arrival: SystemTime) -> LogLine {
        let mut document = event.document.unwrap_or_else(|| {
            debug!(
                "Change for collection {} has no document, forwarding placeholder",
                event.collection
            );
            Record::new()
        });

        let timestamp_ns = document_timestamp_ns(&document).unwrap_or_else(|| {
            debug!("No usable '{TIME_FIELD}' field, using arrival time");
            system_time_ns(arrival)
        });
        let labels = self.labels(&event.collection, &document);

        document.insert(
            "collection".to_string(),
            Value::String(event.collection.clone()),
        );
        if let Some(id) = document.get_mut("_id") {
            if !id.is_string() {
                *id = Value::String(id.to_string());
            }
        }
        let payload = if self.flatten {
            flatten(document)
        } else {
            document
        };

        let line = serde_json::to_string(&payload).unwrap_or_else(|e| {
            warn!(
                "Unable to serialize document from {}: {e}",
                event.collection
            );
            "{}".to_string()
        });

        LogLine {
            labels,
            timestamp_ns,
            line,
        }
    }

    fn labels(&self, collection: &str, document: &Record) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::from([
            ("source".to_string(), JOB_NAME.to_string()),
            ("job".to_string(), JOB_NAME.to_string()),
            ("host".to_string(), self.host.clone()),
            ("collection".to_string(), collection.to_string()),
        ]);
        if let Some(row_key) = row_key(collection, document) {
            labels.insert("row_key".to_string(), row_key);
        }
        labels
    }
}

fn row_key(collection: &str, document: &Record) -> Option<String> {
    let field = |name: &str, default: &str| {
        label_value(document.get(name)).unwrap_or_else(|| default.to_string())
    };
    match collection {
        "admin_activity_log" | "alarm" | "alert" | "event" | "trigger_log" => {
            Some(field("key", UNKNOWN))
        }
        "inspection_log" => Some(format!("{}/{}", field("log_source", ""), field("action", ""))),
        "threat_log_view" => Some(field("signature", UNKNOWN)),
        _ => None,
    }
}

fn label_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn document_timestamp_ns(document: &Record) -> Option<i64> {
    let epoch = match document.get(TIME_FIELD)? {
        Value::Number(n) => match n.as_i64() {
            Some(i) => i as f64,
            None => n.as_f64()?,
        },
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !epoch.is_finite() || epoch < 0.0 {
        return None;
    }

    let integer_digits = (epoch.trunc() as u64).to_string().len();
    let seconds = if integer_digits > SECONDS_MAX_DIGITS {
        epoch / 1000.0
    } else {
        epoch
    };
    (seconds.trunc() as i64).checked_mul(1_000_000_000)
}

fn system_time_ns(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Collapses nested objects into top-level keys joined with `_`.
fn flatten(record: Record) -> Record {
    let mut flat = Record::new();
    flatten_into(&mut flat, String::new(), record);
    flat
}

fn flatten_into(flat: &mut Record, prefix: String, record: Record) {
    for (key, value) in record {
        let key = if prefix.is_empty() {
            key
        } else {
            format!("{prefix}{FLATTEN_SEPARATOR}{key}")
        };
        match value {
            Value::Object(nested) => flatten_into(flat, key, nested),
            other => {
                flat.insert(key, other);
            }
        }
    }
}
