//! Typed handles over mapped memory.
//!
//! [`View`] is a raw `(address, count)` pair handed out by the
//! [`Mapper`](crate::Mapper); it does not own anything and must be released
//! through the mapper that produced it. [`Mapping`] owns its region and
//! releases it when dropped.

use std::{
    fmt,
    marker::PhantomData,
    mem::{self, ManuallyDrop},
    ops::Deref,
    ptr::{self, NonNull},
    slice,
};

use crate::{
    element::{self, Element},
    error::{Error, Result},
    kernel::{Backend, Native, Region},
};

/// Raw view of a live mapping as an array of `T`.
///
/// Copying a view does not copy the memory. Its length is an element count;
/// a `View<u8>` reports bytes.
pub struct View<T> {
    ptr: NonNull<T>,
    len: usize,
}

impl<T> Clone for View<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for View<T> {}

impl<T> fmt::Debug for View<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View").field("addr", &self.ptr).field("len", &self.len).finish()
    }
}

impl<T: Element> View<T> {
    pub(crate) fn new(addr: NonNull<u8>, bytes: usize) -> Self {
        Self { ptr: addr.cast::<T>(), len: element::count::<T>(bytes) }
    }

    /// Address of the first element, the key the mapper registers it under.
    #[inline]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn byte_len(&self) -> usize {
        self.len * element::size_of::<T>()
    }

    /// # Safety
    ///
    /// The mapping must stay registered for `'a` and nobody may write to it
    /// through another view meanwhile.
    pub unsafe fn as_slice<'a>(self) -> &'a [T] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// # Safety
    ///
    /// Same as [`View::as_slice`], the mapping must be writable and this must
    /// be the only live slice over it.
    pub unsafe fn as_mut_slice<'a>(self) -> &'a mut [T] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// A mapping that is released when it goes out of scope.
///
/// File-backed mappings are flushed, unmapped and closed; anonymous ones are
/// unmapped. A release error inside `drop` can only be logged, call
/// [`Mapping::close`] to observe it.
///
/// Slices borrowed from a `Mapping` can't outlive it. [`Mapping::leak`] and
/// [`Mapping::view`] are the ways out for callers that need a raw address,
/// and then the caller is responsible for not using it past the release.
pub struct Mapping<T: Element, B: Backend = Native> {
    region: ManuallyDrop<Region<B::Resource>>,
    backend: ManuallyDrop<B>,
    marker: PhantomData<T>,
}

impl<T: Element, B: Backend> Mapping<T, B> {
    pub(crate) fn new(region: Region<B::Resource>, backend: B) -> Self {
        Self {
            region: ManuallyDrop::new(region),
            backend: ManuallyDrop::new(backend),
            marker: PhantomData,
        }
    }

    /// Splits the handle without running `Drop`.
    pub(crate) fn into_parts(self) -> (Region<B::Resource>, B) {
        let mut this = ManuallyDrop::new(self);

        // SAFETY: `this` is never dropped, so each field is moved out once.
        unsafe {
            (
                ManuallyDrop::take(&mut this.region),
                ManuallyDrop::take(&mut this.backend),
            )
        }
    }

    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        element::count::<T>(self.region.len())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.region.is_writable()
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.region.addr().as_ptr() as usize
    }

    /// Raw view over the same bytes. Using it after this mapping is
    /// released is undefined behaviour.
    pub fn view(&self) -> View<T> {
        View::new(self.region.addr(), self.region.len())
    }

    pub fn as_slice(&self) -> &[T] {
        unsafe { slice::from_raw_parts(self.region.addr().cast::<T>().as_ptr(), self.len()) }
    }

    /// `None` for read-only mappings.
    pub fn as_mut_slice(&mut self) -> Option<&mut [T]> {
        if !self.is_writable() {
            return None;
        }

        let len = self.len();
        Some(unsafe { slice::from_raw_parts_mut(self.region.addr().cast::<T>().as_ptr(), len) })
    }

    /// Writes dirty pages to the backing file without releasing anything.
    pub fn flush(&self) -> Result<()> {
        self.backend.flush(&self.region).map_err(|source| Error::ReleaseFailure {
            addr: self.addr(),
            source,
        })
    }

    /// Releases the mapping now, reporting any error.
    pub fn close(self) -> Result<()> {
        let addr = self.addr();
        let (region, backend) = self.into_parts();

        backend.release(region).map_err(|source| Error::ReleaseFailure { addr, source })
    }

    /// Detaches the mapping: it is never released and stays valid for the
    /// rest of the process. The backing descriptor stays open too.
    pub fn leak(self) -> View<T> {
        let view = self.view();
        let (region, _) = self.into_parts();

        tracing::debug!("leaking mapping at {:#x}", view.addr());
        mem::forget(region);

        view
    }
}

impl<T: Element, B: Backend> Deref for Mapping<T, B> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: Element, B: Backend> fmt::Debug for Mapping<T, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len())
            .field("writable", &self.is_writable())
            .finish()
    }
}

impl<T: Element, B: Backend> Drop for Mapping<T, B> {
    fn drop(&mut self) {
        let addr = self.addr();

        // SAFETY: drop runs once and nothing touches the fields afterwards.
        let (region, backend) = unsafe {
            (ManuallyDrop::take(&mut self.region), ManuallyDrop::take(&mut self.backend))
        };

        if let Err(err) = backend.release(region) {
            tracing::warn!("releasing mapping at {addr:#x} failed: {err}");
        }
    }
}

/// Copies as much of `source` as fits into a freshly mapped region.
pub(crate) fn seed<T: Element, R>(region: &Region<R>, source: Option<&[T]>) {
    let Some(source) = source else { return };

    let count = source.len().min(element::count::<T>(region.len()));
    debug_assert!(region.is_writable());

    // SAFETY: the region was just mapped read-write and holds at least
    // `count` elements; `source` is caller memory so they can't overlap.
    unsafe {
        ptr::copy_nonoverlapping(source.as_ptr(), region.addr().cast::<T>().as_ptr(), count);
    }
}
