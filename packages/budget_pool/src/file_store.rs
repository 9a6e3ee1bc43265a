use std::fmt;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{BlockId, BlockStore, BlockStoreError};

const BLOCK_EXTENSION: &str = "block";
const STAGING_EXTENSION: &str = "partial";

/// A [`BlockStore`] that keeps every block in its own file inside a directory.
///
/// Elements are encoded with `postcard`. Opening a directory that already contains blocks makes
/// them loadable again; new blocks get identifiers above the highest one found.
///
/// # Examples
///
/// ```
/// use budget_pool::{BlockStore, FileBlockStore};
///
/// let directory = tempfile::tempdir().unwrap();
/// let store = FileBlockStore::<u64>::open(directory.path()).unwrap();
///
/// let id = store.store_block(&[10, 20, 30], None).unwrap();
/// assert_eq!(store.block_data_count(id).unwrap(), 3);
/// ```
pub struct FileBlockStore<T> {
    directory: PathBuf,
    next_id: AtomicU64,

    _elements: PhantomData<fn(T) -> T>,
}

impl<T> FileBlockStore<T> {
    /// Opens a store in `directory`, creating the directory if it does not exist.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created or listed.
    pub fn open(directory: impl AsRef<Path>) -> io::Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;

        let mut highest = 0;
        for entry in fs::read_dir(&directory)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOCK_EXTENSION) {
                continue;
            }

            if let Some(id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok())
            {
                highest = highest.max(id);
            }
        }

        Ok(Self {
            directory,
            next_id: AtomicU64::new(highest.saturating_add(1)),
            _elements: PhantomData,
        })
    }

    /// The directory holding the block files.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_of(&self, id: BlockId) -> PathBuf {
        self.directory
            .join(format!("{}.{BLOCK_EXTENSION}", id.get()))
    }

    fn staging_path_of(&self, id: BlockId) -> PathBuf {
        self.directory
            .join(format!("{}.{BLOCK_EXTENSION}.{STAGING_EXTENSION}", id.get()))
    }

    fn read(&self, id: BlockId) -> Result<Vec<u8>, BlockStoreError> {
        fs::read(self.path_of(id)).map_err(|error| match error.kind() {
            io::ErrorKind::NotFound => BlockStoreError::UnknownBlock(id),
            _ => BlockStoreError::Io(error),
        })
    }
}

impl<T> fmt::Debug for FileBlockStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBlockStore")
            .field("directory", &self.directory)
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl<T> BlockStore<T> for FileBlockStore<T>
where
    T: Serialize + DeserializeOwned,
{
    fn store_block(
        &self,
        data: &[T],
        existing: Option<BlockId>,
    ) -> Result<BlockId, BlockStoreError> {
        let id = match existing {
            Some(id) if !self.path_of(id).is_file() => {
                return Err(BlockStoreError::UnknownBlock(id));
            }
            Some(id) => id,
            None => BlockId::new(self.next_id.fetch_add(1, Ordering::Relaxed)),
        };

        let bytes = postcard::to_allocvec(data)?;

        // The previous copy of the block stays intact until the new one is complete.
        let staging = self.staging_path_of(id);
        fs::write(&staging, bytes)?;
        fs::rename(&staging, self.path_of(id))?;

        Ok(id)
    }

    fn load_block(
        &self,
        buffer: &mut Vec<T>,
        max_count: usize,
        id: BlockId,
    ) -> Result<usize, BlockStoreError> {
        let bytes = self.read(id)?;
        let elements: Vec<T> = postcard::from_bytes(&bytes)?;

        let before = buffer.len();
        buffer.extend(elements.into_iter().take(max_count));
        Ok(buffer.len().saturating_sub(before))
    }

    fn block_data_count(&self, id: BlockId) -> Result<usize, BlockStoreError> {
        let bytes = self.read(id)?;

        // Sequences are prefixed with their length as a varint, which decodes the same as a u64.
        let (count, _) = postcard::take_from_bytes::<u64>(&bytes)?;

        usize::try_from(count).map_err(|error| {
            BlockStoreError::Rejected(format!("block {id} is too large to load: {error}"))
        })
    }

    fn destroy_block(&self, id: BlockId) -> Result<bool, BlockStoreError> {
        match fs::remove_file(self.path_of(id)) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(BlockStoreError::Io(error)),
        }
    }
}
