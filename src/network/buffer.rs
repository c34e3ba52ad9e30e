use super::packet::{self, BodyType, FramingError};

/// Fixed-capacity byte buffer of back-to-back in-process packets. It never
/// grows: writes that do not fit are refused whole.
pub struct PacketBuffer {
    data: Box<[u8]>,
    len: usize,
}
impl PacketBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { data: vec![0; capacity].into_boxed_slice(), len: 0 }
    }
    pub fn capacity(&self) -> usize {
        self.data.len()
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    pub fn remaining(&self) -> usize {
        self.data.len() - self.len
    }
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }
    pub fn clear(&mut self) {
        self.len = 0;
    }
    /// Drops everything written after `mark`.
    pub fn rewind(&mut self, mark: usize) {
        self.len = self.len.min(mark);
    }
    pub fn push(
        &mut self,
        connection: u16,
        body_type: BodyType,
        body: &[u8],
    ) -> Result<(), FramingError> {
        self.len += packet::write_packet(&mut self.data[self.len..], connection, body_type, body)?;
        Ok(())
    }
    /// Lends the unused tail to `fill`, which returns how many bytes it wrote.
    pub fn fill_with(&mut self, fill: impl FnOnce(&mut [u8]) -> usize) -> usize {
        let written = fill(&mut self.data[self.len..]).min(self.remaining());
        self.len += written;
        written
    }
}
impl std::fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}
