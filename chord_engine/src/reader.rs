//! Byte-oriented little-endian decoding over a fixed byte slice.

/// A read past the end of the input. The codec maps this to a load failure;
/// any failed read short-circuits deserialization.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct OutOfBounds;

/// Little-endian cursor reader. Every read advances the cursor and fails if
/// the requested range exceeds the slice.
pub struct BinaryReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> BinaryReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_at_end(&self) -> bool {
        self.offset == self.bytes.len()
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], OutOfBounds> {
        let end = self.offset.checked_add(count).ok_or(OutOfBounds)?;
        if end > self.bytes.len() {
            return Err(OutOfBounds);
        }
        let bytes = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], OutOfBounds> {
        let bytes = self.read_bytes(N)?;
        Ok(bytes.try_into().expect("read_bytes returned N bytes"))
    }

    pub fn read_u8(&mut self) -> Result<u8, OutOfBounds> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, OutOfBounds> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, OutOfBounds> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, OutOfBounds> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, OutOfBounds> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_advance_the_cursor() {
        let bytes = [0x01, 0x02, 0x00, 0x00, 0x00, 0xff];
        let mut reader = BinaryReader::new(&bytes);
        assert_eq!(reader.read_u8(), Ok(0x01));
        assert_eq!(reader.read_u32(), Ok(2));
        assert_eq!(reader.offset(), 5);
        assert_eq!(reader.read_u8(), Ok(0xff));
        assert!(reader.is_at_end());
    }

    #[test]
    fn out_of_range_read_fails_without_advancing() {
        let bytes = [1, 2, 3];
        let mut reader = BinaryReader::new(&bytes);
        assert_eq!(reader.read_u32(), Err(OutOfBounds));
        assert_eq!(reader.offset(), 0);
        assert_eq!(reader.read_bytes(3).map(<[u8]>::len), Ok(3));
    }

    #[test]
    fn little_endian_decoding() {
        let bytes = 1.5f64.to_le_bytes();
        let mut reader = BinaryReader::new(&bytes);
        assert_eq!(reader.read_f64(), Ok(1.5));
    }
}
