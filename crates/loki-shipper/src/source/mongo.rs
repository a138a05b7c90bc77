// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! MongoDB change stream source.
//!
//! Watches a whole database, filtered server side to inserts into the
//! monitored collections. The change event `_id` (the driver's resume token)
//! becomes the event's [`ResumePosition`], stored as a small BSON document.
//! While the monitored collections are quiet, the stream's post-batch token
//! keeps advancing through [`ChangeSource::current_position`].

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::change_stream::ChangeStream;
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::{ChangeEvent, ChangeSource, OperationKind, Record};
use crate::error::SourceError;
use crate::position::ResumePosition;

/// ChangeStreamHistoryLost, ChangeStreamFatalError and CappedPositionLost.
const RESUME_EXPIRED_CODES: [i32; 3] = [286, 280, 136];

/// On-disk shape of a stored resume token.
#[derive(Serialize, Deserialize)]
struct StoredToken {
    token: ResumeToken,
}

pub struct MongoChangeSource {
    conn_str: String,
    database: String,
    client: Option<Client>,
    stream: Option<ChangeStream<ChangeStreamEvent<Document>>>,
    collections: Vec<String>,
    position: Option<ResumePosition>,
}

impl MongoChangeSource {
    pub fn new(conn_str: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            conn_str: conn_str.into(),
            database: database.into(),
            client: None,
            stream: None,
            collections: Vec::new(),
            position: None,
        }
    }

    async fn client(&mut self) -> Result<Client, SourceError> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        info!("Connecting to MongoDB, watching database {}", self.database);
        let client = Client::with_uri_str(&self.conn_str)
            .await
            .map_err(|e| SourceError::Unavailable(format!("failed to create client: {e}")))?;
        self.client = Some(client.clone());
        Ok(client)
    }
}

#[async_trait]
impl ChangeSource for MongoChangeSource {
    async fn open(
        &mut self,
        resume_from: Option<ResumePosition>,
        collections: &[String],
    ) -> Result<(), SourceError> {
        let resume_token = resume_from.as_ref().map(decode_token).transpose()?;
        let client = self.client().await?;
        let database = client.database(&self.database);

        let mut watch = database.watch().pipeline(insert_pipeline(collections));
        if let Some(token) = resume_token {
            debug!("Resuming change stream from stored token");
            watch = watch.resume_after(token);
        }
        let stream = watch.await.map_err(classify_error)?;

        self.stream = Some(stream);
        self.collections = collections.to_vec();
        self.position = resume_from;
        Ok(())
    }

    async fn next(&mut self) -> Result<ChangeEvent, SourceError> {
        loop {
            let stream = self.stream.as_mut().ok_or(SourceError::Closed)?;
            let event = stream
                .try_next()
                .await
                .map_err(classify_error)?
                .ok_or_else(|| {
                    SourceError::Unavailable("change stream ended unexpectedly".to_string())
                })?;

            let position = encode_token(&event.id)?;
            self.position = Some(position.clone());

            let operation = operation_kind(&event.operation_type);
            let collection = event
                .ns
                .as_ref()
                .and_then(|ns| ns.coll.clone())
                .unwrap_or_default();
            if !operation.is_insert() || !self.collections.contains(&collection) {
                debug!("Ignoring {operation:?} change for collection: {collection}");
                continue;
            }

            return Ok(ChangeEvent {
                collection,
                operation,
                document: event.full_document.map(document_to_record),
                position,
            });
        }
    }

    async fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("Closed MongoDB change stream");
        }
    }

    /// The stream's cached resume token. Between events it follows the
    /// server's post-batch token, so it moves past changes the `$match`
    /// filtered out.
    fn current_position(&self) -> Option<ResumePosition> {
        self.stream
            .as_ref()
            .and_then(ChangeStream::resume_token)
            .and_then(|token| encode_token(&token).ok())
            .or_else(|| self.position.clone())
    }
}

fn insert_pipeline(collections: &[String]) -> Vec<Document> {
    vec![doc! {
        "$match": {
            "operationType": "insert",
            "ns.coll": { "$in": collections.to_vec() },
        }
    }]
}

fn operation_kind(operation: &OperationType) -> OperationKind {
    match operation {
        OperationType::Insert => OperationKind::Insert,
        OperationType::Update => OperationKind::Update,
        OperationType::Replace => OperationKind::Replace,
        OperationType::Delete => OperationKind::Delete,
        other => OperationKind::Other(format!("{other:?}")),
    }
}

fn is_resume_expired_code(code: i32) -> bool {
    RESUME_EXPIRED_CODES.contains(&code)
}

fn classify_error(error: MongoError) -> SourceError {
    match error.kind.as_ref() {
        ErrorKind::Command(command) if is_resume_expired_code(command.code) => {
            SourceError::ResumeExpired(format!("{} ({})", command.message, command.code_name))
        }
        _ => SourceError::Unavailable(error.to_string()),
    }
}

fn encode_token(token: &ResumeToken) -> Result<ResumePosition, SourceError> {
    let stored = StoredToken {
        token: token.clone(),
    };
    bson::to_vec(&stored)
        .map(ResumePosition::new)
        .map_err(|e| SourceError::Unavailable(format!("unable to encode resume token: {e}")))
}

fn decode_token(position: &ResumePosition) -> Result<ResumeToken, SourceError> {
    bson::from_slice::<StoredToken>(position.as_bytes())
        .map(|stored| stored.token)
        .map_err(|e| SourceError::ResumeExpired(format!("unreadable resume token: {e}")))
}

fn document_to_record(document: Document) -> Record {
    document
        .into_iter()
        .map(|(key, value)| (key, bson_to_json(value)))
        .collect()
}

fn bson_to_json(value: Bson) -> Value {
    match value {
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => match dt.try_to_rfc3339_string() {
            Ok(formatted) => Value::String(formatted),
            Err(_) => Value::from(dt.timestamp_millis()),
        },
        Bson::Document(document) => Value::Object(document_to_record(document)),
        Bson::Array(items) => Value::Array(items.into_iter().map(bson_to_json).collect()),
        Bson::Int32(v) => Value::from(v),
        Bson::Int64(v) => Value::from(v),
        Bson::Double(v) => serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Bson::String(s) => Value::String(s),
        Bson::Boolean(b) => Value::Bool(b),
        Bson::Null => Value::Null,
        other => other.into_relaxed_extjson(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::oid::ObjectId;
    use serde_json::json;

    fn stored(data: &str) -> ResumePosition {
        let bytes = bson::to_vec(&doc! { "token": { "_data": data } }).unwrap();
        ResumePosition::new(bytes)
    }

    #[test]
    fn test_token_survives_encoding() {
        let position = stored("8265A1B2C3000000012B022C0100296E5A1004");
        let token = decode_token(&position).unwrap();
        assert_eq!(encode_token(&token).unwrap(), position);
    }

    #[test]
    fn test_garbage_token_is_expired() {
        let result = decode_token(&ResumePosition::new(b"not bson".to_vec()));
        assert!(matches!(result, Err(SourceError::ResumeExpired(_))));

        let bytes = bson::to_vec(&doc! { "other": 1 }).unwrap();
        let result = decode_token(&ResumePosition::new(bytes));
        assert!(matches!(result, Err(SourceError::ResumeExpired(_))));
    }

    #[test]
    fn test_resume_expired_codes() {
        assert!(is_resume_expired_code(286));
        assert!(is_resume_expired_code(280));
        assert!(is_resume_expired_code(136));
        assert!(!is_resume_expired_code(13));
    }

    #[test]
    fn test_insert_pipeline() {
        let pipeline = insert_pipeline(&["alarm".to_string(), "event".to_string()]);
        assert_eq!(
            pipeline,
            vec![doc! {
                "$match": {
                    "operationType": "insert",
                    "ns.coll": { "$in": ["alarm", "event"] },
                }
            }]
        );
    }

    #[test]
    fn test_operation_kind_mapping() {
        assert_eq!(operation_kind(&OperationType::Insert), OperationKind::Insert);
        assert_eq!(operation_kind(&OperationType::Delete), OperationKind::Delete);
        assert!(matches!(
            operation_kind(&OperationType::Invalidate),
            OperationKind::Other(_)
        ));
    }

    #[test]
    fn test_document_to_record() {
        let oid = ObjectId::parse_str("65a1b2c3d4e5f60718293a4b").unwrap();
        let document = doc! {
            "_id": oid,
            "time": 1_705_000_000_123_i64,
            "count": 3_i32,
            "ratio": 0.5,
            "datetime": bson::DateTime::from_millis(0),
            "nested": { "ip": "10.0.0.1", "tags": ["a", "b"] },
            "flag": true,
            "missing": Bson::Null,
        };

        let record = document_to_record(document);
        assert_eq!(
            Value::Object(record),
            json!({
                "_id": "65a1b2c3d4e5f60718293a4b",
                "time": 1_705_000_000_123_i64,
                "count": 3,
                "ratio": 0.5,
                "datetime": "1970-01-01T00:00:00Z",
                "nested": { "ip": "10.0.0.1", "tags": ["a", "b"] },
                "flag": true,
                "missing": null,
            })
        );
    }

    #[tokio::test]
    async fn test_next_before_open_is_closed() {
        let mut source = MongoChangeSource::new("mongodb://localhost:27017", "unifi");
        assert!(matches!(source.next().await, Err(SourceError::Closed)));
        assert_eq!(source.current_position(), None);
    }
}
