//! Resumable shard cursors.
//!
//! A cursor names a partition and an offset within it. An offset is either a
//! literal sequence marker issued by the log, or one of two resume modes:
//! `BEGIN` (start from the oldest available record) and `LATEST` (only see
//! records written after connecting). Clients echo the last cursor they saw
//! for each partition to pick up exactly after it.

use std::{collections::HashSet, fmt};

use serde::{Deserialize, Serialize};

/// Resume from the oldest available record.
pub const BEGIN: &str = "BEGIN";
/// Resume from the tail of the shard.
pub const LATEST: &str = "LATEST";

/// Errors produced while reading a client-supplied cursor list.
#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    #[error("Malformed cursor list: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Cursor for partition {0} has an empty offset")]
    EmptyOffset(String),

    #[error("Cursor with an empty partition")]
    EmptyPartition,
}

/// Position within a shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Offset {
    Begin,
    Latest,
    Sequence(String),
}

impl Offset {
    pub fn parse(raw: &str) -> Self {
        match raw {
            BEGIN => Offset::Begin,
            LATEST => Offset::Latest,
            other => Offset::Sequence(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Offset::Begin => BEGIN,
            Offset::Latest => LATEST,
            Offset::Sequence(sequence) => sequence,
        }
    }

    /// The literal sequence marker, if this is not a resume mode.
    pub fn sequence(&self) -> Option<&str> {
        match self {
            Offset::Sequence(sequence) => Some(sequence),
            _ => None,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.sequence().is_none()
    }
}

impl From<String> for Offset {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            BEGIN => Offset::Begin,
            LATEST => Offset::Latest,
            _ => Offset::Sequence(raw),
        }
    }
}

impl From<Offset> for String {
    fn from(offset: Offset) -> Self {
        match offset {
            Offset::Sequence(sequence) => sequence,
            sentinel => sentinel.as_str().to_string(),
        }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A (partition, offset) pair as exchanged with clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub partition: String,
    pub offset: Offset,
}

impl Cursor {
    pub fn new(partition: impl Into<String>, offset: Offset) -> Self {
        Self {
            partition: partition.into(),
            offset,
        }
    }
}

/// Parse the JSON cursor list carried by the cursors request header.
///
/// A blank header yields an empty list. Duplicate partitions are left for the
/// resolver to reject, since only it knows the topology being resumed.
pub fn parse_cursors(raw: &str) -> Result<Vec<Cursor>, CursorError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }

    let cursors: Vec<Cursor> = serde_json::from_str(raw)?;
    for cursor in &cursors {
        if cursor.partition.is_empty() {
            return Err(CursorError::EmptyPartition);
        }
        if cursor.offset.as_str().is_empty() {
            return Err(CursorError::EmptyOffset(cursor.partition.clone()));
        }
    }
    Ok(cursors)
}

/// First partition that appears more than once in `cursors`.
pub fn find_duplicate_partition(cursors: &[Cursor]) -> Option<&str> {
    let mut seen = HashSet::new();
    cursors
        .iter()
        .map(|c| c.partition.as_str())
        .find(|partition| !seen.insert(*partition))
}
