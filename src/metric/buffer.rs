//! Flat value buffer of a location.
//!
//! Strict metrics occupy `[0, N)`; every synchronous metric set appends its
//! slots behind the current end. The buffer only grows, so recorded offsets
//! stay valid until the location is finalized.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueBuffer {
    values: Vec<u64>,
}

impl ValueBuffer {
    /// Buffer with `len` zeroed slots.
    pub fn new(len: usize) -> Self {
        Self {
            values: vec![0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Appends `count` zeroed slots and returns the offset of the first.
    pub fn append(&mut self, count: usize) -> usize {
        let offset = self.values.len();
        self.values.resize(offset + count, 0);
        offset
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.values
    }

    pub fn slice(&self, offset: usize, len: usize) -> &[u64] {
        &self.values[offset..offset + len]
    }

    pub fn slice_mut(&mut self, offset: usize, len: usize) -> &mut [u64] {
        &mut self.values[offset..offset + len]
    }

    /// Drops every slot.
    pub fn clear(&mut self) {
        self.values = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_keeps_previous_offsets() {
        let mut buffer = ValueBuffer::new(2);
        buffer.slice_mut(0, 2).copy_from_slice(&[1, 2]);
        assert_eq!(buffer.append(3), 2);
        assert_eq!(buffer.append(1), 5);
        assert_eq!(buffer.len(), 6);
        assert_eq!(buffer.as_slice(), &[1, 2, 0, 0, 0, 0]);

        buffer.clear();
        assert!(buffer.is_empty());
    }
}
