use std::{collections::VecDeque, sync::Arc};

use serde_json::Value;

use crate::{Document, Namespace, SdamError, Server, ServerAddress};

/// Iterates the results of a `find`. Every `getMore` goes to the server that answered the
/// `find`, since cursors only exist on the node that created them.
#[derive(Debug)]
pub struct Cursor {
    namespace: Namespace,
    server: Arc<Server>,
    cursor_id: i64,
    buffer: VecDeque<Document>,
    batch_size: Option<u32>,
}

impl Cursor {
    pub(crate) fn new(
        namespace: Namespace,
        server: Arc<Server>,
        reply: &Document,
        batch_size: Option<u32>,
    ) -> Result<Self, SdamError> {
        let (cursor_id, buffer) = parse_batch(reply, "firstBatch")?;
        Ok(Self {
            namespace,
            server,
            cursor_id,
            buffer,
            batch_size,
        })
    }

    /// Zero once the server has no more results.
    pub fn id(&self) -> i64 {
        self.cursor_id
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn server_address(&self) -> &ServerAddress {
        self.server.address()
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor_id == 0 && self.buffer.is_empty()
    }

    /// The next document, fetching another batch when the current one is used up.
    pub async fn next(&mut self) -> Result<Option<Document>, SdamError> {
        loop {
            if let Some(document) = self.buffer.pop_front() {
                return Ok(Some(document));
            }
            if self.cursor_id == 0 {
                return Ok(None);
            }

            let reply = self
                .server
                .get_more(&self.namespace, self.cursor_id, self.batch_size)
                .await?;
            let (cursor_id, buffer) = parse_batch(&reply, "nextBatch")?;
            self.cursor_id = cursor_id;
            self.buffer = buffer;
        }
    }

    /// Kills the cursor on the server if it still has results there.
    pub async fn close(&mut self) -> Result<(), SdamError> {
        self.buffer.clear();
        if self.cursor_id == 0 {
            return Ok(());
        }
        let cursor_id = std::mem::replace(&mut self.cursor_id, 0);
        self.server
            .kill_cursors(&self.namespace, &[cursor_id])
            .await
            .map(|_| ())
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.cursor_id == 0 {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let server = self.server.clone();
        let namespace = self.namespace.clone();
        let cursor_id = self.cursor_id;
        runtime.spawn(async move {
            if let Err(e) = server.kill_cursors(&namespace, &[cursor_id]).await {
                tracing::debug!("killCursors for dropped cursor {} failed: {}", cursor_id, e);
            }
        });
    }
}

fn parse_batch(reply: &Document, batch_field: &str) -> Result<(i64, VecDeque<Document>), SdamError> {
    let cursor = reply
        .get("cursor")
        .and_then(Value::as_object)
        .ok_or_else(|| SdamError::InvalidReply("reply has no `cursor` document".to_string()))?;
    let cursor_id = cursor
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| SdamError::InvalidReply("cursor has no numeric `id`".to_string()))?;
    let batch = match cursor.get(batch_field) {
        Some(Value::Array(documents)) => documents
            .iter()
            .map(|document| {
                document.as_object().cloned().ok_or_else(|| {
                    SdamError::InvalidReply(format!("`{}` holds a non-document", batch_field))
                })
            })
            .collect::<Result<VecDeque<_>, _>>()?,
        _ => {
            return Err(SdamError::InvalidReply(format!(
                "cursor has no `{}` array",
                batch_field
            )))
        }
    };
    Ok((cursor_id, batch))
}
