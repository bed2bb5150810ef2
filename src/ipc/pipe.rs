//! Bounded byte pipe.
//!
//! A fixed ring with one slot reserved so a full pipe is distinguishable
//! from an empty one: content never exceeds `PIPE_BUFFER_LEN - 1` bytes.
//! Reads drain whatever is available; writes that would not fit entirely
//! fail fast instead of blocking.

use crate::error::{KernelError, KernelResult};
use crate::hardware::PIPE_BUFFER_LEN;

pub struct Pipe {
    id: i32,
    buffer: [u8; PIPE_BUFFER_LEN],
    read_idx: usize,
    write_idx: usize,
}

impl Pipe {
    pub fn new(id: i32) -> Self {
        Pipe {
            id,
            buffer: [0; PIPE_BUFFER_LEN],
            read_idx: 0,
            write_idx: 0,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        if self.write_idx < self.read_idx {
            PIPE_BUFFER_LEN - self.read_idx + self.write_idx
        } else {
            self.write_idx - self.read_idx
        }
    }

    pub fn is_empty(&self) -> bool {
        self.read_idx == self.write_idx
    }

    /// Copies out up to `out.len()` bytes, bounded by the current content.
    /// Returns the number copied; never blocks for the remainder.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len());
        for slot in out.iter_mut().take(n) {
            *slot = self.buffer[self.read_idx];
            self.read_idx = (self.read_idx + 1) % PIPE_BUFFER_LEN;
        }
        n
    }

    /// Copies in all of `data`, or fails without writing anything when the
    /// pipe would fill or overflow.
    pub fn write(&mut self, data: &[u8]) -> KernelResult<usize> {
        if self.len() + data.len() >= PIPE_BUFFER_LEN {
            return Err(KernelError::WouldOverflow);
        }
        for &byte in data {
            self.buffer[self.write_idx] = byte;
            self.write_idx = (self.write_idx + 1) % PIPE_BUFFER_LEN;
        }
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_writes_drain_as_one_read() {
        let mut pipe = Pipe::new(-1);
        pipe.write(b"hello").unwrap();
        pipe.write(b"world").unwrap();

        let mut out = [0u8; 10];
        assert_eq!(pipe.read(&mut out), 10);
        assert_eq!(&out, b"helloworld");
        assert!(pipe.is_empty());
    }

    #[test]
    fn short_read_leaves_the_rest() {
        let mut pipe = Pipe::new(-1);
        pipe.write(b"abcdef").unwrap();

        let mut out = [0u8; 4];
        assert_eq!(pipe.read(&mut out), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(pipe.len(), 2);

        let mut rest = [0u8; 8];
        assert_eq!(pipe.read(&mut rest), 2);
        assert_eq!(&rest[..2], b"ef");
    }

    #[test]
    fn read_never_blocks_for_missing_bytes() {
        let mut pipe = Pipe::new(-1);
        pipe.write(b"abc").unwrap();
        let mut out = [0u8; 32];
        assert_eq!(pipe.read(&mut out), 3);
    }

    #[test]
    fn write_fails_fast_when_it_would_fill() {
        let mut pipe = Pipe::new(-1);
        let chunk = [7u8; PIPE_BUFFER_LEN - 1];
        assert_eq!(pipe.write(&chunk).unwrap(), PIPE_BUFFER_LEN - 1);
        // One reserved slot: even a single extra byte is refused outright.
        assert_eq!(pipe.write(b"x"), Err(KernelError::WouldOverflow));
        assert_eq!(pipe.len(), PIPE_BUFFER_LEN - 1);

        let mut out = [0u8; PIPE_BUFFER_LEN];
        assert_eq!(pipe.read(&mut out), PIPE_BUFFER_LEN - 1);
        assert!(pipe.is_empty());
    }

    #[test]
    fn content_tracks_writes_minus_reads_across_wrap() {
        let mut pipe = Pipe::new(-1);
        let mut written = 0usize;
        let mut consumed = 0usize;
        let mut expected = alloc::collections::VecDeque::new();

        for round in 0..40u8 {
            let chunk: alloc::vec::Vec<u8> =
                (0..37).map(|i| round.wrapping_mul(31).wrapping_add(i)).collect();
            if pipe.write(&chunk).is_ok() {
                written += chunk.len();
                expected.extend(chunk.iter().copied());
            }

            let mut out = [0u8; 23];
            let n = pipe.read(&mut out);
            consumed += n;
            for &byte in &out[..n] {
                assert_eq!(byte, expected.pop_front().unwrap());
            }
            assert_eq!(pipe.len(), (written - consumed) % PIPE_BUFFER_LEN);
            assert_eq!(pipe.len(), expected.len());
        }
    }
}
