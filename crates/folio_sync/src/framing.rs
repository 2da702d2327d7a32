//! Chunked transport framing
//!
//! Serialized envelopes larger than a transport's frame limit are sent as a
//! run of [`ChunkFrame`]s sharing one uuid. Every fragment except the last
//! carries exactly `limit` bytes (less when a char boundary forces it), so a
//! payload of `L` ASCII bytes yields `ceil(L / limit)` frames.
//!
//! Receivers buffer fragments per uuid in a [`ChunkAssembler`] and release
//! the concatenation once all `total` slots are filled, in whatever order the
//! frames arrived. A frame announcing more than the assembler's `max_chunks`
//! is refused before anything is buffered.

use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Default bound on `total` for a single message
pub const DEFAULT_MAX_CHUNKS: usize = 4096;

/// One fragment of a larger message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFrame {
    pub uuid: String,
    pub chunk: usize,
    pub total: usize,
    pub message: String,
}

/// Split `payload` into frames of at most `limit` bytes of message text.
///
/// An empty payload still produces a single frame.
pub fn split_message(payload: &str, limit: usize) -> Vec<ChunkFrame> {
    split_with_id(payload, limit, &Uuid::new_v4().to_string())
}

pub fn split_with_id(payload: &str, limit: usize, uuid: &str) -> Vec<ChunkFrame> {
    let parts = slices(payload, limit);
    let total = parts.len();
    parts
        .into_iter()
        .enumerate()
        .map(|(chunk, message)| ChunkFrame {
            uuid: uuid.to_string(),
            chunk,
            total,
            message: message.to_string(),
        })
        .collect()
}

fn slices(payload: &str, limit: usize) -> Vec<&str> {
    let limit = limit.max(4);
    if payload.is_empty() {
        return vec![""];
    }

    let mut parts = Vec::with_capacity(payload.len() / limit + 1);
    let mut start = 0;
    while start < payload.len() {
        let mut end = (start + limit).min(payload.len());
        while !payload.is_char_boundary(end) {
            end -= 1;
        }
        parts.push(&payload[start..end]);
        start = end;
    }
    parts
}

struct PartialMessage {
    slots: Vec<Option<String>>,
    filled: usize,
    first_seen: Instant,
}

/// Reassembles chunk frames keyed by message uuid
pub struct ChunkAssembler {
    buffers: HashMap<String, PartialMessage>,
    ttl: Duration,
    max_chunks: usize,
}

impl ChunkAssembler {
    pub fn new(ttl: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            ttl,
            max_chunks: DEFAULT_MAX_CHUNKS,
        }
    }

    pub fn with_max_chunks(mut self, max_chunks: usize) -> Self {
        self.max_chunks = max_chunks;
        self
    }

    /// Accept one frame; returns the full message once every slot is filled
    pub fn receive(&mut self, frame: ChunkFrame) -> Result<Option<String>> {
        self.receive_at(frame, Instant::now())
    }

    pub fn receive_at(&mut self, frame: ChunkFrame, now: Instant) -> Result<Option<String>> {
        self.evict_expired(now);

        if frame.total == 0 || frame.chunk >= frame.total {
            return Err(SyncError::ProtocolError(format!(
                "chunk {} out of range for total {}",
                frame.chunk, frame.total
            )));
        }
        if frame.total > self.max_chunks {
            return Err(SyncError::ProtocolError(format!(
                "message {} announces {} chunks, limit is {}",
                frame.uuid, frame.total, self.max_chunks
            )));
        }

        if frame.total == 1 {
            self.buffers.remove(&frame.uuid);
            return Ok(Some(frame.message));
        }

        let entry = self
            .buffers
            .entry(frame.uuid.clone())
            .or_insert_with(|| PartialMessage {
                slots: vec![None; frame.total],
                filled: 0,
                first_seen: now,
            });

        if entry.slots.len() != frame.total {
            return Err(SyncError::ProtocolError(format!(
                "message {} changed total from {} to {}",
                frame.uuid,
                entry.slots.len(),
                frame.total
            )));
        }

        // duplicates overwrite without counting twice
        let slot = &mut entry.slots[frame.chunk];
        if slot.is_none() {
            entry.filled += 1;
        }
        *slot = Some(frame.message);

        if entry.filled < entry.slots.len() {
            return Ok(None);
        }

        let complete = self
            .buffers
            .remove(&frame.uuid)
            .map(|partial| partial.slots.into_iter().flatten().collect::<String>());
        Ok(complete)
    }

    /// Drop buffers older than the TTL; returns how many were dropped
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let before = self.buffers.len();
        let ttl = self.ttl;
        self.buffers.retain(|uuid, partial| {
            let keep = now.saturating_duration_since(partial.first_seen) < ttl;
            if !keep {
                tracing::warn!(
                    "Dropping incomplete message {} ({}/{} chunks)",
                    uuid,
                    partial.filled,
                    partial.slots.len()
                );
            }
            keep
        });
        before - self.buffers.len()
    }

    /// Number of messages still waiting for chunks
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }
}
