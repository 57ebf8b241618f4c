// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Allocator for per-handle matchtags identifying outstanding requests.

use tracing::{info, warn};

use crate::message::MATCHTAG_NONE;

const INITIAL_SIZE: u32 = 256;
const MAX_SIZE: u32 = 1 << 20;

/// Dense allocator over 32-bit matchtags. Tag 0 is reserved as
/// [`MATCHTAG_NONE`]. The pool starts small and doubles up to a fixed cap;
/// when exhausted, `alloc` returns `MATCHTAG_NONE` and the caller is
/// expected to retry later.
#[derive(Debug)]
pub struct TagPool {
    /// Tags returned by `free`, reissued before fresh ones.
    free: Vec<u32>,
    /// Next never-issued tag.
    next: u32,
    /// Current capacity (exclusive upper bound on issued tags).
    size: u32,
    outstanding: u32,
    high_watermark: u32,
}

impl Default for TagPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TagPool {
    pub fn new() -> Self {
        Self {
            free: Vec::new(),
            next: 1, // skip MATCHTAG_NONE
            size: INITIAL_SIZE,
            outstanding: 0,
            high_watermark: 0,
        }
    }

    /// Allocates a matchtag, growing the pool if needed. Returns
    /// [`MATCHTAG_NONE`] if the pool is temporarily exhausted.
    pub fn alloc(&mut self) -> u32 {
        let tag = match self.free.pop() {
            Some(tag) => tag,
            None => {
                if self.next == self.size {
                    if self.size == MAX_SIZE {
                        warn!("tagpool temporarily out of tags");
                        return MATCHTAG_NONE;
                    }
                    let old = self.size;
                    self.size = (self.size * 2).min(MAX_SIZE);
                    info!(
                        "tagpool expanded from {} to {} entries",
                        old, self.size
                    );
                }
                let tag = self.next;
                self.next += 1;
                tag
            }
        };
        self.outstanding += 1;
        if self.outstanding > self.high_watermark {
            self.high_watermark = self.outstanding;
        }
        tag
    }

    /// Returns a matchtag to the pool. Freeing a tag that was never issued
    /// is logged and otherwise ignored.
    pub fn free(&mut self, tag: u32) {
        if tag == MATCHTAG_NONE || tag >= self.next {
            warn!("tagpool free of invalid tag {}", tag);
            return;
        }
        self.outstanding -= 1;
        self.free.push(tag);
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn avail(&self) -> u32 {
        self.size - 1 - self.outstanding
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    pub fn high_watermark(&self) -> u32 {
        self.high_watermark
    }
}

impl Drop for TagPool {
    fn drop(&mut self) {
        if self.outstanding > 0 {
            warn!(
                "tagpool destroyed with {} leaked matchtags (high watermark {})",
                self.outstanding, self.high_watermark
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::seq::SliceRandom;
    use rand::thread_rng;

    use super::*;

    #[test]
    fn test_alloc_unique_nonzero() {
        let mut pool = TagPool::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let tag = pool.alloc();
            assert_ne!(tag, MATCHTAG_NONE);
            assert!(seen.insert(tag), "tag {tag} issued twice");
        }
        assert_eq!(pool.outstanding(), 1000);
    }

    #[test]
    fn test_allocs_equal_frees_at_steady_state() {
        let mut pool = TagPool::new();
        let mut tags: Vec<u32> = (0..500).map(|_| pool.alloc()).collect();
        tags.shuffle(&mut thread_rng());
        for tag in tags {
            pool.free(tag);
        }
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.avail(), pool.size() - 1);
        assert_eq!(pool.high_watermark(), 500);
    }

    #[test]
    fn test_grows_in_chunks() {
        let mut pool = TagPool::new();
        assert_eq!(pool.size(), INITIAL_SIZE);
        for _ in 0..INITIAL_SIZE {
            assert_ne!(pool.alloc(), MATCHTAG_NONE);
        }
        assert_eq!(pool.size(), INITIAL_SIZE * 2);
    }

    #[test]
    fn test_free_invalid_tag_ignored() {
        let mut pool = TagPool::new();
        let tag = pool.alloc();
        pool.free(MATCHTAG_NONE);
        pool.free(tag + 100);
        assert_eq!(pool.outstanding(), 1);
        pool.free(tag);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_freed_tags_are_reissued() {
        let mut pool = TagPool::new();
        let tag = pool.alloc();
        pool.free(tag);
        assert_eq!(pool.alloc(), tag);
    }
}
