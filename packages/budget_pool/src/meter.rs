use std::fmt;
use std::mem;

/// Decides how much an item is charged against the pool limit.
///
/// The count-limited pool charges an item its granted capacity in elements ([`ElementCount`]).
/// The indirect pool charges the deep footprint in bytes ([`DeepFootprint`]), which also covers
/// heap memory owned by the elements themselves.
pub trait Meter<T>: Send + Sync + fmt::Debug + 'static {
    /// Whether the charge depends on the contents of the buffer and not only on its capacity.
    ///
    /// When `false`, the pool never needs to re-measure an item after its contents change.
    const TRACKS_CONTENTS: bool;

    /// The charge for a buffer with the given contents and granted capacity.
    fn measure(&self, contents: &[T], capacity: usize) -> usize;
}

/// Charges an item the number of elements it has capacity for.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct ElementCount;

impl<T> Meter<T> for ElementCount {
    const TRACKS_CONTENTS: bool = false;

    fn measure(&self, _contents: &[T], capacity: usize) -> usize {
        capacity
    }
}

/// Charges an item the bytes of its element storage plus the heap bytes its elements own.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct DeepFootprint;

impl<T: DeepSized> Meter<T> for DeepFootprint {
    const TRACKS_CONTENTS: bool = true;

    fn measure(&self, contents: &[T], capacity: usize) -> usize {
        let inline = capacity.saturating_mul(mem::size_of::<T>());

        contents
            .iter()
            .map(DeepSized::heap_size)
            .fold(inline, usize::saturating_add)
    }
}

/// Reports the heap memory owned by a value, beyond its own inline size.
///
/// Implement this for payloads whose memory use is not reflected by their element count, such as
/// graphs that own node and edge tables.
pub trait DeepSized {
    /// Bytes of heap memory owned by this value, transitively.
    fn heap_size(&self) -> usize;

    /// Inline size plus heap size.
    fn deep_size(&self) -> usize
    where
        Self: Sized,
    {
        mem::size_of::<Self>().saturating_add(self.heap_size())
    }
}

macro_rules! impl_inline_only {
    ($($t:ty),* $(,)?) => {
        $(
            impl DeepSized for $t {
                fn heap_size(&self) -> usize {
                    0
                }
            }
        )*
    };
}

impl_inline_only!(
    u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool, char, ()
);

impl DeepSized for String {
    fn heap_size(&self) -> usize {
        self.capacity()
    }
}

impl<U: DeepSized> DeepSized for Vec<U> {
    fn heap_size(&self) -> usize {
        let inline = self.capacity().saturating_mul(mem::size_of::<U>());

        self.iter()
            .map(DeepSized::heap_size)
            .fold(inline, usize::saturating_add)
    }
}

impl<U: DeepSized> DeepSized for Box<U> {
    fn heap_size(&self) -> usize {
        mem::size_of::<U>().saturating_add((**self).heap_size())
    }
}

impl<U: DeepSized> DeepSized for Option<U> {
    fn heap_size(&self) -> usize {
        self.as_ref().map_or(0, DeepSized::heap_size)
    }
}

impl<A: DeepSized, B: DeepSized> DeepSized for (A, B) {
    fn heap_size(&self) -> usize {
        self.0.heap_size().saturating_add(self.1.heap_size())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn element_count_ignores_contents() {
        let contents = [String::from("long enough to allocate")];
        assert_eq!(ElementCount.measure(&contents, 10), 10);
        assert_eq!(Meter::<u8>::measure(&ElementCount, &[], 0), 0);
    }

    #[test]
    fn deep_footprint_of_plain_values_is_inline_storage() {
        let contents = [1_u64, 2, 3];
        assert_eq!(DeepFootprint.measure(&contents, 8), 8 * 8);
    }

    #[test]
    fn deep_footprint_includes_owned_heap() {
        let mut text = String::with_capacity(100);
        text.push('x');
        let heap = text.capacity();

        let contents = [text];
        assert_eq!(
            DeepFootprint.measure(&contents, 2),
            2 * mem::size_of::<String>() + heap
        );
    }

    #[test]
    fn nested_vectors_are_counted_transitively() {
        let mut inner = Vec::with_capacity(4);
        inner.push(1_u32);
        let mut outer: Vec<Vec<u32>> = Vec::with_capacity(2);
        outer.push(inner);

        let expected = outer.capacity() * mem::size_of::<Vec<u32>>()
            + outer.first().unwrap().capacity() * mem::size_of::<u32>();
        assert_eq!(outer.heap_size(), expected);
        assert_eq!(outer.deep_size(), mem::size_of::<Vec<Vec<u32>>>() + expected);
    }

    #[test]
    fn option_and_box_delegate() {
        let none: Option<String> = None;
        assert_eq!(none.heap_size(), 0);

        let boxed = Box::new(7_u32);
        assert_eq!(boxed.heap_size(), mem::size_of::<u32>());
    }
}
