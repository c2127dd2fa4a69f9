use std::time::Duration;
use anyhow::bail;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::debug;
use crate::protocol::frame::Frame;

struct PendingSplit {
    /// the first fragment's header, used for the reassembled frame
    template: Frame,
    parts: Vec<Option<Bytes>>,
    num_received: u32,
    started_at: Instant,
}

/// Reassembles split messages. Fragments are collected by split id until all of them arrived;
///  incomplete splits are discarded after a timeout and are never delivered.
pub struct SplitAssembler {
    pending: FxHashMap<u16, PendingSplit>,
    max_parts: u32,
    max_pending: usize,
    timeout: Duration,
}

impl SplitAssembler {
    pub fn new(max_parts: u32, max_pending: usize, timeout: Duration) -> SplitAssembler {
        SplitAssembler {
            pending: FxHashMap::default(),
            max_parts,
            max_pending,
            timeout,
        }
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// Returns the reassembled message once its last fragment arrives. Frames without split info
    ///  are returned unchanged.
    pub fn add(&mut self, frame: Frame, now: Instant) -> anyhow::Result<Option<Frame>> {
        let split = match frame.split {
            None => return Ok(Some(frame)),
            Some(split) => split,
        };

        if split.count > self.max_parts {
            bail!("split message with {} parts exceeds the maximum of {}", split.count, self.max_parts);
        }

        if !self.pending.contains_key(&split.id) && self.pending.len() >= self.max_pending {
            debug!("too many incomplete split messages - dropping fragment of split {}", split.id);
            return Ok(None);
        }

        let pending = self.pending.entry(split.id)
            .or_insert_with(|| PendingSplit {
                template: Frame {
                    payload: Bytes::new(),
                    split: None,
                    ..frame.clone()
                },
                parts: vec![None; split.count as usize],
                num_received: 0,
                started_at: now,
            });

        if pending.parts.len() != split.count as usize {
            bail!("split {}: inconsistent part count {} (was {})", split.id, split.count, pending.parts.len());
        }

        let slot = &mut pending.parts[split.index as usize];
        if slot.is_none() {
            *slot = Some(frame.payload);
            pending.num_received += 1;
        }

        if pending.num_received < split.count {
            return Ok(None);
        }

        let pending = match self.pending.remove(&split.id) {
            Some(p) => p,
            None => return Ok(None),
        };

        let total_len = pending.parts.iter()
            .map(|p| p.as_ref().map(|b| b.len()).unwrap_or(0))
            .sum();
        let mut payload = BytesMut::with_capacity(total_len);
        for part in pending.parts.into_iter().flatten() {
            payload.extend_from_slice(&part);
        }

        Ok(Some(Frame {
            payload: payload.freeze(),
            ..pending.template
        }))
    }

    /// Discards incomplete split messages that are older than the timeout, returning the number
    ///  of discarded messages
    pub fn expire(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.pending.len();
        self.pending.retain(|id, p| {
            let keep = now.duration_since(p.started_at) <= timeout;
            if !keep {
                debug!("discarding incomplete split message {} ({} of {} parts)", id, p.num_received, p.parts.len());
            }
            keep
        });
        before - self.pending.len()
    }
}
