use std::{fmt, str::FromStr, time::Duration};

use serde_json::{json, Value};

use crate::{
    Document, ReadPreference, SdamError, ServerDescription, ServerType, TopologyDescription,
};

/// Command names whose execution may be retried once after a retryable error.
pub const RETRYABLE_WRITE_COMMANDS: [&str; 4] = ["insert", "update", "delete", "findAndModify"];

/// `db.collection`, or just `db` for database level commands.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub db: String,
    pub collection: Option<String>,
}

impl Namespace {
    pub fn new(db: &str, collection: &str) -> Self {
        Self {
            db: db.to_string(),
            collection: Some(collection.to_string()),
        }
    }

    pub fn database(db: &str) -> Self {
        Self {
            db: db.to_string(),
            collection: None,
        }
    }

    fn collection_or_err(&self) -> Result<&str, SdamError> {
        self.collection.as_deref().ok_or_else(|| {
            SdamError::InvalidArgument(format!("namespace `{}` names no collection", self))
        })
    }
}

impl FromStr for Namespace {
    type Err = SdamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((db, _)) if db.is_empty() => Err(SdamError::InvalidArgument(format!(
                "namespace `{}` has an empty database name",
                s
            ))),
            Some((db, collection)) if !collection.is_empty() => Ok(Self::new(db, collection)),
            Some((db, _)) => Ok(Self::database(db)),
            None if s.is_empty() => Err(SdamError::InvalidArgument(
                "namespace must not be empty".to_string(),
            )),
            None => Ok(Self::database(s)),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.collection {
            Some(collection) => write!(f, "{}.{}", self.db, collection),
            None => write!(f, "{}", self.db),
        }
    }
}

/// Per operation knobs.
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    /// Overrides the topology wide `retry_writes` setting.
    pub retry_writes: Option<bool>,
    pub collation: Option<Value>,
    /// Where to run a read. Writes always go to a writable server.
    pub read_preference: Option<ReadPreference>,
    pub server_selection_timeout: Option<Duration>,
}

/// The name of a command is its first key.
pub fn command_name(command: &Document) -> Option<&str> {
    command.keys().next().map(String::as_str)
}

pub fn is_retryable_write_command(command: &Document) -> bool {
    command_name(command).map_or(false, |name| RETRYABLE_WRITE_COMMANDS.contains(&name))
}

/// Retryable writes need sessions on the deployment and a server that understands
/// `txnNumber`.
pub(crate) fn supports_retryable_writes(
    server: &ServerDescription,
    topology: &TopologyDescription,
) -> bool {
    server.max_wire_version >= 6
        && topology.logical_session_timeout_minutes.is_some()
        && server.server_type != ServerType::Standalone
}

pub fn insert_command(
    ns: &Namespace,
    documents: Vec<Document>,
    ordered: bool,
) -> Result<Document, SdamError> {
    let mut command = Document::new();
    command.insert("insert".to_string(), json!(ns.collection_or_err()?));
    command.insert(
        "documents".to_string(),
        Value::Array(documents.into_iter().map(Value::Object).collect()),
    );
    command.insert("ordered".to_string(), json!(ordered));
    Ok(command)
}

/// `updates` are full update statements: `{q, u, upsert?, multi?}`.
pub fn update_command(
    ns: &Namespace,
    updates: Vec<Document>,
    collation: Option<&Value>,
) -> Result<Document, SdamError> {
    let mut command = Document::new();
    command.insert("update".to_string(), json!(ns.collection_or_err()?));
    command.insert(
        "updates".to_string(),
        Value::Array(with_collation(updates, collation)),
    );
    command.insert("ordered".to_string(), json!(true));
    Ok(command)
}

/// `deletes` are full delete statements: `{q, limit}`.
pub fn delete_command(
    ns: &Namespace,
    deletes: Vec<Document>,
    collation: Option<&Value>,
) -> Result<Document, SdamError> {
    let mut command = Document::new();
    command.insert("delete".to_string(), json!(ns.collection_or_err()?));
    command.insert(
        "deletes".to_string(),
        Value::Array(with_collation(deletes, collation)),
    );
    command.insert("ordered".to_string(), json!(true));
    Ok(command)
}

pub fn find_command(
    ns: &Namespace,
    filter: Document,
    batch_size: Option<u32>,
    collation: Option<&Value>,
) -> Result<Document, SdamError> {
    let mut command = Document::new();
    command.insert("find".to_string(), json!(ns.collection_or_err()?));
    command.insert("filter".to_string(), Value::Object(filter));
    if let Some(batch_size) = batch_size {
        command.insert("batchSize".to_string(), json!(batch_size));
    }
    if let Some(collation) = collation {
        command.insert("collation".to_string(), collation.clone());
    }
    Ok(command)
}

pub fn get_more_command(
    ns: &Namespace,
    cursor_id: i64,
    batch_size: Option<u32>,
) -> Result<Document, SdamError> {
    let mut command = Document::new();
    command.insert("getMore".to_string(), json!(cursor_id));
    command.insert("collection".to_string(), json!(ns.collection_or_err()?));
    if let Some(batch_size) = batch_size {
        command.insert("batchSize".to_string(), json!(batch_size));
    }
    Ok(command)
}

pub fn kill_cursors_command(ns: &Namespace, cursor_ids: &[i64]) -> Result<Document, SdamError> {
    let mut command = Document::new();
    command.insert("killCursors".to_string(), json!(ns.collection_or_err()?));
    command.insert("cursors".to_string(), json!(cursor_ids));
    Ok(command)
}

fn with_collation(statements: Vec<Document>, collation: Option<&Value>) -> Vec<Value> {
    statements
        .into_iter()
        .map(|mut statement| {
            if let Some(collation) = collation {
                statement
                    .entry("collation")
                    .or_insert_with(|| collation.clone());
            }
            Value::Object(statement)
        })
        .collect()
}
