use crate::KobjError;

/// An owned ELF-style string table: NUL-terminated names, addressed by byte offset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StringTable {
    bytes: Vec<u8>,
}

impl StringTable {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Resolve the name at `offset`, without its terminator.
    pub fn get(&self, offset: usize) -> Result<&[u8], KobjError> {
        let tail = self
            .bytes
            .get(offset..)
            .ok_or(KobjError::BadStringOffset {
                offset,
                len: self.bytes.len(),
            })?;
        let end = tail
            .iter()
            .position(|b| *b == 0)
            .ok_or(KobjError::Unterminated { offset })?;
        Ok(&tail[..end])
    }

    /// Resolve the name at `offset` as a string, lossily.
    pub fn get_str(&self, offset: usize) -> Result<String, KobjError> {
        self.get(offset)
            .map(|name| String::from_utf8_lossy(name).into_owned())
    }
}

/// A bounded write cursor used to build a string table in a single pass.
///
/// The capacity is fixed at construction. Every append is checked against it, so a bad size
/// estimate turns into an error instead of a reallocation or an out-of-bounds write.
pub struct StrtabCursor {
    buf: Vec<u8>,
    cap: usize,
}

impl StrtabCursor {
    /// Reserve a working buffer of exactly `cap` bytes.
    pub fn with_capacity(cap: usize) -> Result<Self, KobjError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(cap)
            .map_err(|_| KobjError::Allocation { size: cap })?;
        Ok(Self { buf, cap })
    }

    /// Current write position, which is also the size of the table written so far.
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Append the concatenation of `parts` plus a terminator, returning the offset of the first
    /// byte written.
    pub fn push(&mut self, parts: &[&[u8]]) -> Result<u32, KobjError> {
        let start = self.buf.len();
        let need = parts.iter().map(|p| p.len()).sum::<usize>() + 1;
        if self.cap - start < need {
            return Err(KobjError::CursorOverflow {
                need: start + need,
                cap: self.cap,
            });
        }
        let offset: u32 = start
            .try_into()
            .map_err(|_| KobjError::TableTooLarge { len: start })?;
        for part in parts {
            self.buf.extend_from_slice(part);
        }
        self.buf.push(0);
        Ok(offset)
    }

    /// Copy the used portion into a table of exactly the written size. The working buffer is
    /// dropped.
    pub fn finish(self) -> Result<StringTable, KobjError> {
        let len = self.buf.len();
        let mut exact = Vec::new();
        exact
            .try_reserve_exact(len)
            .map_err(|_| KobjError::Allocation { size: len })?;
        exact.extend_from_slice(&self.buf);
        Ok(StringTable::new(exact))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup() {
        let table = StringTable::new(b"\0foo\0bar\0".to_vec());
        assert_eq!(table.get(0).unwrap(), b"");
        assert_eq!(table.get(1).unwrap(), b"foo");
        assert_eq!(table.get(3).unwrap(), b"o");
        assert_eq!(table.get(5).unwrap(), b"bar");
        assert!(matches!(
            table.get(9),
            Err(KobjError::Unterminated { offset: 9 })
        ));
        assert!(matches!(
            table.get(10),
            Err(KobjError::BadStringOffset { offset: 10, .. })
        ));
    }

    #[test]
    fn unterminated_tail() {
        let table = StringTable::new(b"\0abc".to_vec());
        assert!(matches!(table.get(1), Err(KobjError::Unterminated { .. })));
    }

    #[test]
    fn cursor_bounds() {
        let mut cursor = StrtabCursor::with_capacity(8).unwrap();
        assert_eq!(cursor.push(&[b"ab", b"cd"]).unwrap(), 0);
        assert_eq!(cursor.position(), 5);
        assert_eq!(cursor.push(&[b"x"]).unwrap(), 5);
        assert!(matches!(
            cursor.push(&[b"yy"]),
            Err(KobjError::CursorOverflow { need: 10, cap: 8 })
        ));
        let table = cursor.finish().unwrap();
        assert_eq!(table.as_bytes(), b"abcd\0x\0");
    }
}
