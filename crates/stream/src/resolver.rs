//! Turns a client's resume cursors into one positioned poller per shard.

use std::sync::Arc;

use tracing::debug;

use crate::{
    cursor::{Cursor, Offset, find_duplicate_partition},
    log::{EventLog, IteratorPosition, LogError},
    poller::ShardPoller,
    types::{ShardDescriptor, StreamingOptions},
};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Partition {0} is not part of the stream")]
    UnknownPartition(String),

    #[error("Partition {0} appears more than once in the cursor list")]
    DuplicatePartition(String),

    #[error(transparent)]
    Upstream(#[from] LogError),
}

/// Build the initial pollers for a connection.
///
/// With no cursors every shard starts at the tail, in listing order.
/// Otherwise there is one poller per cursor, in cursor order: `BEGIN` reads
/// from the oldest retained record inclusive, `LATEST` from the tail, and a
/// literal marker from the record right after it. The cursor list is fully
/// validated before any iterator is requested.
pub async fn resolve_pollers<L: EventLog>(
    log: &Arc<L>,
    stream: &str,
    shards: &[ShardDescriptor],
    cursors: &[Cursor],
    options: &StreamingOptions,
) -> Result<Vec<ShardPoller<L>>, ResolveError> {
    if let Some(partition) = find_duplicate_partition(cursors) {
        return Err(ResolveError::DuplicatePartition(partition.to_string()));
    }

    let starts: Vec<(&ShardDescriptor, Offset)> = if cursors.is_empty() {
        shards.iter().map(|shard| (shard, Offset::Latest)).collect()
    } else {
        cursors
            .iter()
            .map(|cursor| {
                shards
                    .iter()
                    .find(|shard| shard.shard_id == cursor.partition)
                    .map(|shard| (shard, cursor.offset.clone()))
                    .ok_or_else(|| ResolveError::UnknownPartition(cursor.partition.clone()))
            })
            .collect::<Result<_, _>>()?
    };

    let mut pollers = Vec::with_capacity(starts.len());
    for (shard, offset) in starts {
        let position = match &offset {
            Offset::Begin => IteratorPosition::AtSequence(shard.oldest_available.clone()),
            Offset::Latest => IteratorPosition::Latest,
            Offset::Sequence(marker) => IteratorPosition::AfterSequence(marker.clone()),
        };
        debug!(stream = %stream, shard = %shard.shard_id, %offset, ?position, "Resolved resume point");

        let iterator = log.get_iterator(stream, &shard.shard_id, position).await?;
        pollers.push(ShardPoller::new(
            log.clone(),
            shard.shard_id.clone(),
            iterator,
            offset,
            options,
        ));
    }
    Ok(pollers)
}
