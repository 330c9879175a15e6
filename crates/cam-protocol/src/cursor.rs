//! Bounds-checked byte cursor
//!
//! Every read checks the remaining length first, so a truncated message fails
//! with [`ParseError::Incomplete`] instead of reading past the buffer.

use crate::error::ParseError;

/// Read-only cursor over a byte slice
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Create a cursor positioned at the start of `data`
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current offset from the start of the buffer
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// True once every byte has been consumed
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn ensure(&self, n: usize) -> Result<(), ParseError> {
        if self.remaining() < n {
            return Err(ParseError::Incomplete {
                needed: n - self.remaining(),
            });
        }
        Ok(())
    }

    /// Read one byte
    pub fn read_u8(&mut self) -> Result<u8, ParseError> {
        self.ensure(1)?;
        let b = self.data[self.pos];
        self.pos += 1;
        Ok(b)
    }

    /// Read a big-endian u16
    pub fn read_u16(&mut self) -> Result<u16, ParseError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Read a big-endian 24-bit value (used for APDU tags)
    pub fn read_u24(&mut self) -> Result<u32, ParseError> {
        let bytes = self.read_bytes(3)?;
        Ok(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
    }

    /// Borrow the next `n` bytes and advance past them
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        self.ensure(n)?;
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Skip `n` bytes
    pub fn skip(&mut self, n: usize) -> Result<(), ParseError> {
        self.read_bytes(n).map(|_| ())
    }

    /// Split off a sub-cursor over the next `n` bytes
    pub fn sub(&mut self, n: usize) -> Result<Cursor<'a>, ParseError> {
        self.read_bytes(n).map(Cursor::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_advance() {
        let mut c = Cursor::new(&[0x9F, 0x90, 0x03, 0x00, 0x20, 0xAA]);
        assert_eq!(c.read_u24().unwrap(), 0x9F9003);
        assert_eq!(c.read_u16().unwrap(), 0x0020);
        assert_eq!(c.read_u8().unwrap(), 0xAA);
        assert!(c.is_empty());
    }

    #[test]
    fn test_truncation_reports_missing_bytes() {
        let mut c = Cursor::new(&[0x01, 0x02]);
        assert_eq!(c.read_bytes(5), Err(ParseError::Incomplete { needed: 3 }));
        // Failed read does not move the cursor
        assert_eq!(c.position(), 0);
    }

    #[test]
    fn test_sub_cursor_is_bounded() {
        let mut c = Cursor::new(&[0x01, 0x02, 0x03]);
        let mut sub = c.sub(2).unwrap();
        assert_eq!(sub.read_u16().unwrap(), 0x0102);
        assert!(sub.read_u8().is_err());
        assert_eq!(c.read_u8().unwrap(), 0x03);
    }
}
