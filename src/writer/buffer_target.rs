use super::Target;
use crate::error::Result;

/// In-memory growing buffer target. Doubles capacity on overflow; `finalize`
/// truncates to the highest position actually written, per spec.md §4.1.
pub struct BufferTarget {
    buffer: Vec<u8>,
    written_len: usize,
}

impl BufferTarget {
    pub fn new() -> Self {
        BufferTarget {
            buffer: Vec::new(),
            written_len: 0,
        }
    }

    /// The finalized buffer. Only meaningful after `finalize()`.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer[..self.written_len]
    }

    pub fn into_buffer(mut self) -> Vec<u8> {
        self.buffer.truncate(self.written_len);
        self.buffer
    }

    fn ensure_capacity(&mut self, required: usize) {
        if self.buffer.len() < required {
            let mut new_len = self.buffer.len().max(1024);
            while new_len < required {
                new_len *= 2;
            }
            self.buffer.resize(new_len, 0);
        }
    }
}

impl Default for BufferTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl Target for BufferTarget {
    fn write(&mut self, data: &[u8], position: u64) -> Result<()> {
        let start = position as usize;
        let end = start + data.len();
        self.ensure_capacity(end);
        self.buffer[start..end].copy_from_slice(data);
        if end > self.written_len {
            self.written_len = end;
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.buffer.truncate(self.written_len);
        Ok(())
    }

    fn get_slice(&self, start: u64, end: u64) -> Option<Vec<u8>> {
        Some(self.buffer[start as usize..end as usize].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_and_truncates_to_written_length() {
        let mut t = BufferTarget::new();
        t.write(b"abc", 0).unwrap();
        t.write(b"z", 10).unwrap();
        t.finalize().unwrap();
        assert_eq!(t.buffer().len(), 11);
        assert_eq!(&t.buffer()[0..3], b"abc");
        assert_eq!(t.buffer()[10], b'z');
    }
}
