//! Write stager
//!
//! Holds whole logical pages written by the host until the session flushes
//! them through the codec pipeline. A staged page shadows the disk copy for
//! reads from the same session; repeated writes to one page merge into a
//! single record, so a page that is rewritten many times between syncs is
//! encoded and placed once.

use crate::config::StagerConfig;
use ahash::AHashMap;
use serde::Serialize;
use std::time::Instant;
use tracing::debug;

/// One page waiting to be flushed
#[derive(Debug, Clone)]
pub struct StagedPage {
    pub page: u64,
    pub data: Vec<u8>,
    pub dirty: bool,
    pub staged_at: Instant,
    /// Insertion order; flushes replay pages in this order
    seq: u64,
}

/// Result of offering a page to the stager
#[derive(Debug, PartialEq, Eq)]
pub enum StageOutcome {
    /// New record created
    Staged,
    /// Existing record for the page replaced
    Merged,
    /// Staging is disabled or the page is too large; the caller must write
    /// the returned bytes directly
    Bypassed(Vec<u8>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StagerStats {
    /// Reads served from staged pages
    pub hits: u64,
    /// Non-empty drains
    pub flushes: u64,
    /// Writes folded into an already staged page
    pub merges: u64,
    /// Every accepted write
    pub total_stages: u64,
    pub staged_pages: usize,
    pub staged_bytes: usize,
}

#[derive(Debug)]
pub struct WriteStager {
    config: StagerConfig,
    pages: AHashMap<u64, StagedPage>,
    bytes: usize,
    next_seq: u64,
    stats: StagerStats,
}

impl WriteStager {
    pub fn new(config: StagerConfig) -> Self {
        WriteStager {
            config,
            pages: AHashMap::new(),
            bytes: 0,
            next_seq: 0,
            stats: StagerStats::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Stage a full page, merging with any record already held for it
    pub fn buffer_write(&mut self, page: u64, data: Vec<u8>) -> StageOutcome {
        if !self.config.enabled || data.len() > self.config.max_bytes {
            return StageOutcome::Bypassed(data);
        }

        self.stats.total_stages += 1;

        if let Some(existing) = self.pages.get_mut(&page) {
            self.bytes = self.bytes - existing.data.len() + data.len();
            existing.data = data;
            existing.dirty = true;
            self.stats.merges += 1;
            return StageOutcome::Merged;
        }

        self.bytes += data.len();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pages.insert(
            page,
            StagedPage {
                page,
                data,
                dirty: true,
                staged_at: Instant::now(),
                seq,
            },
        );
        StageOutcome::Staged
    }

    /// Check whether either threshold (scaled by the watermark) is reached
    pub fn should_flush(&self) -> bool {
        !self.pages.is_empty()
            && (self.pages.len() >= self.config.page_threshold()
                || self.bytes >= self.config.byte_threshold())
    }

    /// Copy a staged page into `out`. Returns false when the page is not
    /// staged and must be read from disk.
    pub fn buffer_read(&mut self, page: u64, out: &mut [u8]) -> bool {
        match self.pages.get(&page) {
            Some(staged) => {
                let len = staged.data.len().min(out.len());
                out[..len].copy_from_slice(&staged.data[..len]);
                out[len..].fill(0);
                self.stats.hits += 1;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, page: u64) -> Option<&[u8]> {
        self.pages.get(&page).map(|s| s.data.as_slice())
    }

    pub fn contains(&self, page: u64) -> bool {
        self.pages.contains_key(&page)
    }

    /// Remove a staged page without flushing it
    pub fn remove(&mut self, page: u64) -> Option<StagedPage> {
        let staged = self.pages.remove(&page)?;
        self.bytes -= staged.data.len();
        Some(staged)
    }

    /// Take every staged page in insertion order, leaving the stager empty
    pub fn drain(&mut self) -> Vec<StagedPage> {
        if self.pages.is_empty() {
            return Vec::new();
        }

        let mut pages: Vec<StagedPage> = self.pages.drain().map(|(_, p)| p).collect();
        pages.sort_by_key(|p| p.seq);
        self.bytes = 0;
        self.stats.flushes += 1;
        debug!("Draining {} staged pages", pages.len());
        pages
    }

    /// Put back pages a failed flush did not write. A page staged again in
    /// the meantime keeps its newer bytes.
    pub fn restore(&mut self, pages: Vec<StagedPage>) {
        for staged in pages {
            if self.pages.contains_key(&staged.page) {
                continue;
            }
            self.bytes += staged.data.len();
            self.next_seq = self.next_seq.max(staged.seq + 1);
            self.pages.insert(staged.page, staged);
        }
    }

    /// Drop staged pages at or beyond `page`. Returns how many were dropped.
    pub fn discard_from(&mut self, page: u64) -> usize {
        let before = self.pages.len();
        let mut freed = 0;
        self.pages.retain(|&p, staged| {
            let keep = p < page;
            if !keep {
                freed += staged.data.len();
            }
            keep
        });
        self.bytes -= freed;
        before - self.pages.len()
    }

    /// Highest staged page number
    pub fn highest_page(&self) -> Option<u64> {
        self.pages.keys().copied().max()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn staged_bytes(&self) -> usize {
        self.bytes
    }

    /// Release every buffer without flushing
    pub fn clear(&mut self) {
        self.pages.clear();
        self.pages.shrink_to_fit();
        self.bytes = 0;
    }

    pub fn stats(&self) -> StagerStats {
        StagerStats {
            staged_pages: self.pages.len(),
            staged_bytes: self.bytes,
            ..self.stats
        }
    }
}
