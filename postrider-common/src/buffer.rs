//! Message body buffers.
//!
//! A [`Buffer`] hands out independent readers over an immutable body.
//! Lifetimes follow the creator-removes rule: whoever created the
//! buffer calls [`Buffer::remove`]; the pipeline and delivery targets
//! only ever open and read it.

use std::{
    fmt::Debug,
    io::{self, Cursor, Read},
    sync::Arc,
};

/// An immutable, repeatedly-readable message body.
pub trait Buffer: Debug + Send + Sync {
    /// Opens a fresh reader positioned at the start of the body.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the underlying storage is gone.
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;

    /// Body length in bytes.
    fn len(&self) -> usize;

    /// Whether the body is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Releases the underlying storage. Called by the buffer's creator
    /// once no component will open it again.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the storage could not be released.
    fn remove(&self) -> io::Result<()>;
}

/// Reads a buffer fully into memory.
///
/// # Errors
///
/// Propagates any I/O error from the underlying reader.
pub fn read_to_vec(buffer: &dyn Buffer) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(buffer.len());
    buffer.open()?.read_to_end(&mut out)?;
    Ok(out)
}

/// A [`Buffer`] backed by shared memory.
#[derive(Debug, Clone)]
pub struct MemoryBuffer {
    data: Arc<[u8]>,
}

impl MemoryBuffer {
    /// Creates a buffer over the given bytes.
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }

    /// Direct view of the underlying bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for MemoryBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }
}

impl From<&[u8]> for MemoryBuffer {
    fn from(data: &[u8]) -> Self {
        Self { data: data.into() }
    }
}

impl Buffer for MemoryBuffer {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(Arc::clone(&self.data))))
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn remove(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_memory_buffer_reads() {
        let buffer = MemoryBuffer::from(b"hello world".as_slice());
        assert_eq!(buffer.len(), 11);
        assert!(!buffer.is_empty());
        assert_eq!(read_to_vec(&buffer).unwrap(), b"hello world".to_vec());
        // A second open starts from the beginning again.
        assert_eq!(read_to_vec(&buffer).unwrap(), b"hello world".to_vec());
    }

    #[test]
    fn test_empty_buffer() {
        let buffer = MemoryBuffer::from(Vec::new());
        assert!(buffer.is_empty());
        assert_eq!(read_to_vec(&buffer).unwrap(), Vec::<u8>::new());
    }
}
