use std::mem;

/// Types a mapping can be viewed as.
///
/// Mapped bytes come straight from a file (or from zeroed anonymous
/// memory), so an element type must be valid for every bit pattern and
/// must not own anything.
///
/// # Safety
///
/// Implementors must be plain old data: `Copy`, no padding-dependent
/// invariants, no pointers, every bit pattern a valid value.
pub unsafe trait Element: Copy + 'static {}

macro_rules! element {
    ($($ty:ty),* $(,)?) => {
        $(unsafe impl Element for $ty {})*
    };
}

element!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);

unsafe impl<T: Element, const N: usize> Element for [T; N] {}

/// Byte size of one `T`. Zero-sized element types are rejected at
/// compile time since an element count would be meaningless.
#[inline]
pub(crate) const fn size_of<T: Element>() -> usize {
    const { assert!(mem::size_of::<T>() != 0, "zero-sized element type") };
    mem::size_of::<T>()
}

/// Bytes needed for `count` elements of `T`.
pub(crate) fn byte_len<T: Element>(count: usize) -> Option<usize> {
    count.checked_mul(size_of::<T>())
}

/// Elements of `T` that fit in `bytes` (rounding down).
pub(crate) fn count<T: Element>(bytes: usize) -> usize {
    bytes / size_of::<T>()
}
