use crate::Result;

/// The interface the pool uses to talk to the items it tracks.
///
/// The pool keeps only weak references to its members. When it needs room, it asks the least
/// recently used member to [`discard()`][Self::discard] itself; the member is responsible for
/// persisting what it must keep and for telling the pool it is gone by calling
/// [`Pool::free()`][crate::Pool::free] or, if pinned, [`Pool::remove_item()`][crate::Pool::remove_item]
/// on its own slot.
///
/// Members are called while the pool's critical section is held by the current thread. They may
/// call back into the pool freely but must not block on another thread that needs the same pool.
pub trait PoolMember: Send + Sync {
    /// Gives up the member's admitted memory in response to budget pressure.
    ///
    /// On success the member must no longer be admitted. On failure the member must be left
    /// exactly as it was, still admitted and still charged.
    ///
    /// # Errors
    ///
    /// Returns an error if the member could not persist its contents.
    fn discard(&self) -> Result<()>;

    /// The current charge of the member under the pool's meter, recomputing any stale cache.
    ///
    /// Returns zero for members that are not admitted and `None` for members whose state is
    /// in use further up the current thread's stack; the pool then keeps the recorded charge.
    fn footprint(&self) -> Option<usize>;
}
