//! Physical frame pool.
//!
//! One bit per frame of physical memory: 0 = free, 1 = used. Allocation is a
//! first-fit scan that skips fully used words.

use alloc::vec;
use alloc::vec::Vec;
use bit_field::BitField;

const BITS_PER_WORD: usize = 64;

pub struct FramePool {
    words: Vec<u64>,
    frames: usize,
    used: usize,
}

impl FramePool {
    /// Creates a pool with every frame free.
    pub fn new(frames: usize) -> Self {
        let word_count = (frames + BITS_PER_WORD - 1) / BITS_PER_WORD;
        FramePool {
            words: vec![0; word_count],
            frames,
            used: 0,
        }
    }

    /// Claims the lowest free frame, or `None` when physical memory is
    /// exhausted. The caller decides whether that is fatal.
    pub fn alloc(&mut self) -> Option<usize> {
        for (word_idx, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let frame = word_idx * BITS_PER_WORD + bit;
            if frame >= self.frames {
                return None;
            }
            word.set_bit(bit, true);
            self.used += 1;
            return Some(frame);
        }
        None
    }

    /// Returns a frame to the pool.
    pub fn free(&mut self, frame: usize) {
        if frame >= self.frames {
            return;
        }
        let word = &mut self.words[frame / BITS_PER_WORD];
        if word.get_bit(frame % BITS_PER_WORD) {
            word.set_bit(frame % BITS_PER_WORD, false);
            self.used -= 1;
        }
    }

    /// Claims a specific frame, used while boot mirrors the identity-mapped
    /// kernel image into the pool.
    pub fn mark_used(&mut self, frame: usize) {
        if frame >= self.frames {
            return;
        }
        let word = &mut self.words[frame / BITS_PER_WORD];
        if !word.get_bit(frame % BITS_PER_WORD) {
            word.set_bit(frame % BITS_PER_WORD, true);
            self.used += 1;
        }
    }

    pub fn is_used(&self, frame: usize) -> bool {
        frame < self.frames && self.words[frame / BITS_PER_WORD].get_bit(frame % BITS_PER_WORD)
    }

    pub fn used_count(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.frames
    }
}
