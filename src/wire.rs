//! Little-endian wire codec and the random padding scheme.
//!
//! All multi-byte integers on the wire are little-endian. Fixed-size
//! fields are raw byte arrays; variable-length data is never length
//! prefixed inside an end-to-end payload and simply runs to the end of
//! the buffer.

use rand::rngs::OsRng;
use rand::Rng;

use crate::errors::WireError;

/// Sequential reader over a received buffer.
///
/// Every read checks the remaining length first; a short buffer is a
/// protocol error for the whole frame.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Short {
                needed: n - self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        let bytes = self.take(8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(out))
    }

    /// Read a fixed-size byte array.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let bytes = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Consume everything up to the end of the buffer.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

/// Append random padding to a message body.
///
/// A random length v in [1, 255] is drawn and v copies of the byte v are
/// appended, so the final byte always states how much to strip. A zero
/// length is never produced because it would make stripping ambiguous.
pub fn pad(buf: &mut Vec<u8>) {
    let padding_len: u8 = OsRng.gen_range(1..=255);
    pad_with(buf, padding_len);
}

/// Append exactly `padding_len` copies of the byte `padding_len`.
pub fn pad_with(buf: &mut Vec<u8>, padding_len: u8) {
    debug_assert!(padding_len >= 1, "padding length must be at least 1");
    buf.extend(std::iter::repeat(padding_len).take(padding_len as usize));
}

/// Strip the padding from a decrypted message body.
///
/// The final byte gives the number of bytes to drop. Returns the body
/// without its padding.
pub fn strip_padding(buf: &[u8]) -> Result<&[u8], WireError> {
    let padding_len = *buf.last().ok_or(WireError::Short { needed: 1 })?;
    if padding_len == 0 || padding_len as usize > buf.len() {
        return Err(WireError::Padding(padding_len));
    }
    Ok(&buf[..buf.len() - padding_len as usize])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_reads_little_endian() {
        let buf = [
            0x2A, // u8
            0x34, 0x12, // u16
            0x78, 0x56, 0x34, 0x12, // u32
            0xEF, 0xCD, 0xAB, 0x89, 0x67, 0x45, 0x23, 0x01, // u64
            0xAA, 0xBB, // rest
        ];
        let mut cur = Cursor::new(&buf);

        assert_eq!(cur.read_u8().unwrap(), 0x2A);
        assert_eq!(cur.read_u16().unwrap(), 0x1234);
        assert_eq!(cur.read_u32().unwrap(), 0x12345678);
        assert_eq!(cur.read_u64().unwrap(), 0x0123456789ABCDEF);
        assert_eq!(cur.read_rest(), &[0xAA, 0xBB]);
        assert_eq!(cur.remaining(), 0);
    }

    #[test]
    fn test_cursor_rejects_short_buffer() {
        let buf = [0x01, 0x02];
        let mut cur = Cursor::new(&buf);
        let result = cur.read_u32();
        assert!(matches!(result, Err(WireError::Short { needed: 2 })));
    }

    #[test]
    fn test_cursor_fixed_array() {
        let buf = [1u8, 2, 3, 4, 5];
        let mut cur = Cursor::new(&buf);
        let arr: [u8; 4] = cur.read_array().unwrap();
        assert_eq!(arr, [1, 2, 3, 4]);
        assert_eq!(cur.remaining(), 1);
    }

    #[test]
    fn test_padding_probe() {
        // Forcing the padding length to 5 must append five 0x05 bytes.
        let mut buf = vec![0x01, 0x02, 0x03];
        pad_with(&mut buf, 5);
        assert_eq!(buf, vec![0x01, 0x02, 0x03, 0x05, 0x05, 0x05, 0x05, 0x05]);

        let stripped = strip_padding(&buf).unwrap();
        assert_eq!(stripped, &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_padding_roundtrip_all_lengths() {
        let body = vec![0xC3u8; 40];
        for padding_len in 1..=255u8 {
            let mut buf = body.clone();
            pad_with(&mut buf, padding_len);
            assert_eq!(buf.len(), body.len() + padding_len as usize);
            // Every padding byte equals the padding length.
            assert!(buf[body.len()..].iter().all(|&b| b == padding_len));
            assert_eq!(strip_padding(&buf).unwrap(), &body[..]);
        }
    }

    #[test]
    fn test_random_padding_is_in_range() {
        for _ in 0..64 {
            let mut buf = vec![0u8; 4];
            pad(&mut buf);
            let padding_len = *buf.last().unwrap() as usize;
            assert!((1..=255).contains(&padding_len));
            assert_eq!(buf.len(), 4 + padding_len);
        }
    }

    #[test]
    fn test_strip_rejects_invalid_padding() {
        assert!(strip_padding(&[]).is_err());
        // Padding length larger than the buffer.
        assert!(strip_padding(&[0x01, 0x05]).is_err());
        // Zero padding length can never be produced by the padder.
        assert!(strip_padding(&[0x41, 0x00]).is_err());
    }
}
