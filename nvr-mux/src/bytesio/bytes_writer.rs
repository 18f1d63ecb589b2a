use {
    super::bytes_errors::BytesWriteError,
    byteorder::{ByteOrder, WriteBytesExt},
    bytes::BytesMut,
    std::io::Write,
};

/// Growable byte writer; finished output is handed out as `BytesMut`.
#[derive(Debug, Default)]
pub struct BytesWriter {
    bytes: Vec<u8>,
}

impl BytesWriter {
    #[must_use]
    pub const fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn write_u8(&mut self, byte: u8) -> Result<(), BytesWriteError> {
        self.bytes.write_u8(byte)?;
        Ok(())
    }

    pub fn write_u16<T: ByteOrder>(&mut self, bytes: u16) -> Result<(), BytesWriteError> {
        self.bytes.write_u16::<T>(bytes)?;
        Ok(())
    }

    pub fn write_u32<T: ByteOrder>(&mut self, bytes: u32) -> Result<(), BytesWriteError> {
        self.bytes.write_u32::<T>(bytes)?;
        Ok(())
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<(), BytesWriteError> {
        self.bytes.write_all(buf)?;
        Ok(())
    }

    /// Fill `len` bytes with `value`.
    pub fn write_repeat(&mut self, value: u8, len: usize) -> Result<(), BytesWriteError> {
        self.bytes.resize(self.bytes.len() + len, value);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn get_current_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Take everything written so far, leaving the writer empty.
    pub fn extract_current_bytes(&mut self) -> BytesMut {
        BytesMut::from(&std::mem::take(&mut self.bytes)[..])
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}
