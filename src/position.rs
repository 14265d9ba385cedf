//! Translates a subscription's start position into a resume token.

use crate::error::{ClientError, Result};
use crate::options::StartPosition;
use crate::transport::ResumeToken;
use crate::types::{PartitionMetadata, PartitionTarget, Timestamp};

/// Resolve `position` for `target`.
///
/// `metadata` is the broker's view of the target partition, `None` if the
/// broker doesn't know it. `now` anchors [`StartPosition::TimeDelta`].
/// Offsets are not range-checked here; the broker rejects an offset outside
/// its retained window when the stream is opened.
pub fn resolve(
    position: StartPosition,
    target: &PartitionTarget,
    metadata: Option<&PartitionMetadata>,
    now: Timestamp,
) -> Result<ResumeToken> {
    if metadata.is_none() {
        return Err(ClientError::NoSuchPartition {
            stream: target.stream.clone(),
            partition: target.partition,
        });
    }

    Ok(match position {
        StartPosition::Earliest => ResumeToken::Earliest,
        StartPosition::Latest => ResumeToken::Latest,
        StartPosition::NewOnly => ResumeToken::NewOnly,
        StartPosition::Offset(offset) => ResumeToken::Offset(offset),
        StartPosition::Timestamp(ts) => ResumeToken::Timestamp(ts),
        StartPosition::TimeDelta(delta) => ResumeToken::Timestamp(now.saturating_sub(delta)),
    })
}

/// Token for re-opening a dropped stream.
///
/// Continues right after the last offset handed to the delivery queue, or
/// from where the original open landed if nothing was read yet. The
/// original start position is never re-evaluated.
pub fn resume_from(last_read: Option<u64>, start_offset: u64) -> ResumeToken {
    match last_read {
        Some(offset) => ResumeToken::Offset(offset + 1),
        None => ResumeToken::Offset(start_offset),
    }
}
