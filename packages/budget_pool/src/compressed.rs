use std::fmt;
use std::io::{Read, Write};
use std::marker::PhantomData;

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{Backing, Result};

/// A [`Backing`] that keeps discarded contents in memory, encoded with `postcard` and compressed
/// with deflate.
///
/// The compressed copy is given up when the contents are restored, so every discard compresses
/// the current contents anew. Memory held by the compressed copy is not charged against the pool.
pub struct CompressedBacking<T> {
    compressed: Option<Vec<u8>>,
    len: usize,
    level: Compression,

    _elements: PhantomData<fn(T) -> T>,
}

impl<T> CompressedBacking<T> {
    /// Creates an empty backing that compresses with a fast level.
    #[must_use]
    pub fn new() -> Self {
        Self::with_level(Compression::fast())
    }

    /// Creates an empty backing that compresses with the given level.
    #[must_use]
    pub fn with_level(level: Compression) -> Self {
        Self {
            compressed: None,
            len: 0,
            level,
            _elements: PhantomData,
        }
    }

    /// Size in bytes of the compressed copy, if one is held.
    #[must_use]
    pub fn compressed_size(&self) -> Option<usize> {
        self.compressed.as_ref().map(Vec::len)
    }
}

impl<T> Default for CompressedBacking<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CompressedBacking<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressedBacking")
            .field("compressed_size", &self.compressed_size())
            .field("len", &self.len)
            .field("level", &self.level)
            .finish()
    }
}

impl<T> Backing<T> for CompressedBacking<T>
where
    T: Serialize + DeserializeOwned,
{
    fn persist(&mut self, contents: &[T]) -> Result<()> {
        let encoded = postcard::to_allocvec(contents)?;

        let mut encoder = DeflateEncoder::new(Vec::new(), self.level);
        encoder.write_all(&encoded)?;
        let compressed = encoder.finish()?;

        self.len = contents.len();
        self.compressed = Some(compressed);
        Ok(())
    }

    fn restore(&mut self, buffer: &mut Vec<T>, max_count: usize) -> Result<usize> {
        let Some(compressed) = &self.compressed else {
            return Ok(0);
        };

        let mut encoded = Vec::new();
        DeflateDecoder::new(compressed.as_slice()).read_to_end(&mut encoded)?;
        let elements: Vec<T> = postcard::from_bytes(&encoded)?;

        let before = buffer.len();
        buffer.extend(elements.into_iter().take(max_count));

        self.compressed = None;
        self.len = 0;

        Ok(buffer.len().saturating_sub(before))
    }

    fn is_persisted(&self) -> bool {
        self.compressed.is_some()
    }

    fn persisted_len(&self) -> Result<Option<usize>> {
        Ok(self.compressed.as_ref().map(|_| self.len))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::PoolError;

    assert_impl_all!(CompressedBacking<String>: Send, Sync, fmt::Debug, Default);

    #[test]
    fn new_backing_has_nothing_persisted() {
        let backing = CompressedBacking::<u32>::new();

        assert!(!backing.is_persisted());
        assert_eq!(backing.persisted_len().unwrap(), None);
        assert_eq!(backing.compressed_size(), None);
    }

    #[test]
    fn persist_then_restore_gives_back_contents() {
        let mut backing = CompressedBacking::<String>::new();
        let contents: Vec<String> = (0..50).map(|i| format!("value {i}")).collect();

        backing.persist(&contents).unwrap();
        assert_eq!(backing.persisted_len().unwrap(), Some(50));

        let mut restored = Vec::new();
        assert_eq!(backing.restore(&mut restored, 50).unwrap(), 50);
        assert_eq!(restored, contents);
    }

    #[test]
    fn repetitive_contents_compress() {
        let mut backing = CompressedBacking::<u64>::with_level(Compression::best());

        backing.persist(&[0_u64; 4096]).unwrap();

        assert!(backing.compressed_size().unwrap() < 4096);
    }

    #[test]
    fn restore_gives_up_compressed_copy() {
        let mut backing = CompressedBacking::<u8>::new();
        backing.persist(&[1_u8, 2, 3]).unwrap();

        let mut restored = Vec::new();
        backing.restore(&mut restored, 3).unwrap();

        assert_eq!(backing.persisted_len().unwrap(), None);
        assert_eq!(backing.compressed_size(), None);
    }

    #[test]
    fn restore_respects_max_count() {
        let mut backing = CompressedBacking::<u16>::new();
        backing.persist(&[1_u16, 2, 3, 4]).unwrap();

        let mut restored = Vec::new();
        assert_eq!(backing.restore(&mut restored, 2).unwrap(), 2);
        assert_eq!(restored, [1, 2]);
    }

    #[test]
    fn corrupt_copy_fails_and_stays() {
        let mut backing = CompressedBacking::<u32>::new();
        backing.persist(&[1, 2, 3]).unwrap();
        backing.compressed = Some(vec![0xFF; 8]);

        let mut restored = Vec::new();
        let result = backing.restore(&mut restored, 3);

        assert!(matches!(result, Err(PoolError::Io(_) | PoolError::Codec(_))));
        assert!(restored.is_empty());
        assert_eq!(backing.persisted_len().unwrap(), Some(3));
    }
}
