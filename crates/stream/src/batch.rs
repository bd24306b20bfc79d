//! Batch assembly and the newline-delimited wire encoding.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    cursor::{Cursor, Offset},
    types::Record,
};

/// One flush unit: a cursor plus the ordered events of a single shard.
///
/// An empty `events` list is a heartbeat that only carries the cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub cursor: Cursor,
    pub events: Vec<String>,
}

impl Batch {
    pub fn is_heartbeat(&self) -> bool {
        self.events.is_empty()
    }
}

/// Wrap records drawn from one shard, in shard order, into a batch whose
/// cursor points at `offset`.
pub fn assemble(partition: &str, records: Vec<Record>, offset: Offset) -> Batch {
    Batch {
        cursor: Cursor::new(partition, offset),
        events: records
            .into_iter()
            .map(|record| String::from_utf8_lossy(&record.data).into_owned())
            .collect(),
    }
}

/// Encode a batch as one JSON object terminated by a newline.
pub fn encode_line(batch: &Batch) -> Result<Bytes, serde_json::Error> {
    let mut line = serde_json::to_vec(batch)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}
