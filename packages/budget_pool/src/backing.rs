use std::fmt;

use crate::Result;

/// Where a pool item keeps its contents while discarded.
///
/// When the pool evicts an item, the item hands its contents to [`persist()`][Self::persist] and
/// releases its memory. When the item is next touched, it allocates
/// [`persisted_len()`][Self::persisted_len] elements and calls [`restore()`][Self::restore].
///
/// A backing may keep its persisted copy after a restore, in which case an item that was not
/// modified since can be discarded again without persisting. A backing that gives up its copy on
/// restore reports `None` from `persisted_len()` until the next persist.
pub trait Backing<T>: Send + fmt::Debug {
    /// Persists `contents`, replacing anything persisted before.
    ///
    /// # Errors
    ///
    /// Fails if the contents cannot be encoded or written. The previously persisted copy, if
    /// any, remains intact.
    fn persist(&mut self, contents: &[T]) -> Result<()>;

    /// Appends up to `max_count` persisted elements to `buffer`, returning how many were
    /// appended.
    ///
    /// # Errors
    ///
    /// Fails if the persisted copy cannot be read or decoded. The persisted copy remains intact.
    fn restore(&mut self, buffer: &mut Vec<T>, max_count: usize) -> Result<usize>;

    /// Whether a persisted copy is currently held. Must not perform I/O.
    fn is_persisted(&self) -> bool;

    /// The number of persisted elements, or `None` if nothing is currently persisted.
    ///
    /// # Errors
    ///
    /// Fails if the persisted copy exists but cannot be inspected.
    fn persisted_len(&self) -> Result<Option<usize>>;
}
