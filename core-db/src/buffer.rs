//! Append-only byte buffer with position capture and backpatching.
//!
//! The database format nests chunks whose `total_length` fields cover every
//! descendant, so a one-byte change in any string cascades into length
//! updates all the way up the tree. Instead of building a heap tree and
//! recomputing, the writer emits once into this buffer and patches each
//! container's length field when the container closes.

/// Growable little-endian output buffer.
#[derive(Debug, Default)]
pub struct DbBuffer {
    data: Vec<u8>,
}

impl DbBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn position(&self) -> usize {
        self.data.len()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn write_u16_le(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32_le(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i32_le(&mut self, v: i32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f32_le(&mut self, v: f32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    /// Append `count` zero bytes.
    pub fn pad(&mut self, count: usize) {
        self.data.resize(self.data.len() + count, 0);
    }

    /// Absolute write of a little-endian u32 at a captured position.
    ///
    /// # Panics
    ///
    /// Panics if `pos + 4` exceeds the buffer; patch positions always come
    /// from [`position`](Self::position) captures inside already-emitted
    /// headers.
    pub fn patch_u32_le(&mut self, pos: usize, v: u32) {
        self.data[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn patch_u16_le(&mut self, pos: usize, v: u16) {
        self.data[pos..pos + 2].copy_from_slice(&v.to_le_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

/// Open chunk frame: captures the chunk's start offset when the header is
/// emitted and writes `current_position - start` into the total-length
/// field at `start + 8` when the chunk closes.
///
/// This is the single primitive by which correct lengths are guaranteed for
/// arbitrarily nested chunks. Frames must close innermost-first; the writer
/// never rewrites already-emitted children.
#[must_use = "an unclosed chunk frame leaves a zero total_length"]
#[derive(Debug)]
pub struct ChunkFrame {
    start: usize,
}

impl ChunkFrame {
    /// Capture the start of a chunk whose header is about to be emitted.
    pub fn open(buf: &DbBuffer) -> Self {
        Self {
            start: buf.position(),
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    /// Patch the total-length field (`start + 8`) with the distance from
    /// the chunk tag to the current end of the buffer.
    pub fn close(self, buf: &mut DbBuffer) {
        let total = (buf.position() - self.start) as u32;
        buf.patch_u32_le(self.start + 8, total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_primitives() {
        let mut buf = DbBuffer::new();
        buf.write_u8(0xAB);
        buf.write_u16_le(0x0102);
        buf.write_u32_le(0x03040506);
        buf.write_u64_le(0x0708090A0B0C0D0E);
        assert_eq!(
            buf.as_slice(),
            &[
                0xAB, 0x02, 0x01, 0x06, 0x05, 0x04, 0x03, 0x0E, 0x0D, 0x0C, 0x0B, 0x0A, 0x09,
                0x08, 0x07
            ]
        );
    }

    #[test]
    fn patch_writes_at_captured_position() {
        let mut buf = DbBuffer::new();
        buf.append(b"mhbd");
        let pos = buf.position();
        buf.write_u32_le(0);
        buf.patch_u32_le(pos, 0xDEADBEEF);
        assert_eq!(&buf.as_slice()[4..8], &0xDEADBEEFu32.to_le_bytes());
    }

    #[test]
    fn nested_frames_close_with_child_inclusive_lengths() {
        let mut buf = DbBuffer::new();

        let outer = ChunkFrame::open(&buf);
        buf.append(b"mhsd");
        buf.write_u32_le(16); // header length
        buf.write_u32_le(0); // total length placeholder
        buf.write_u32_le(1); // type

        let inner = ChunkFrame::open(&buf);
        buf.append(b"mhlt");
        buf.write_u32_le(12);
        buf.write_u32_le(0);
        buf.append(b"payload!");
        inner.close(&mut buf);

        outer.close(&mut buf);

        let bytes = buf.as_slice();
        let outer_total = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let inner_total = u32::from_le_bytes(bytes[24..28].try_into().unwrap());
        assert_eq!(inner_total, 12 + 8);
        assert_eq!(outer_total, 16 + inner_total);
        assert_eq!(outer_total as usize, bytes.len());
    }

    #[test]
    fn pad_appends_zeros() {
        let mut buf = DbBuffer::new();
        buf.write_u8(1);
        buf.pad(3);
        assert_eq!(buf.as_slice(), &[1, 0, 0, 0]);
    }
}
