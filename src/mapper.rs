//! The explicit-release facade.
//!
//! A [`Mapper`] keeps every mapping it hands out in a [`Registry`] so that
//! a bare [`View`] is enough to release it later, and so that releasing
//! the same address twice is reported instead of unmapping whatever the
//! OS put there in the meantime.

use std::{io, path::Path};

use crate::{
    element::{self, Element},
    error::{Error, Result},
    kernel::{Backend, Mode, Native, Region},
    mapping::{self, Mapping, View},
    registry::{Kind, Registry},
};

/// Anonymous read-write mapping for `count` elements, seeded from `source`.
pub(crate) fn malloc_region<T: Element, B: Backend>(
    backend: &B,
    count: usize,
    source: Option<&[T]>,
) -> Result<Region<B::Resource>> {
    let len = element::byte_len::<T>(count).ok_or_else(|| Error::AllocationFailure {
        len: usize::MAX,
        source: overflow(count),
    })?;

    let region = backend
        .malloc(len)
        .map_err(|source| Error::AllocationFailure { len, source })?;

    mapping::seed(&region, source);

    Ok(region)
}

/// File-backed read-write mapping for `count` elements, seeded from `source`.
pub(crate) fn create_region<T: Element, B: Backend>(
    backend: &B,
    op: &'static str,
    path: &Path,
    count: usize,
    source: Option<&[T]>,
) -> Result<Region<B::Resource>> {
    let region = element::byte_len::<T>(count)
        .ok_or_else(|| overflow(count))
        .and_then(|len| backend.create(path, len))
        .map_err(|source| Error::create(op, path, source))?;

    mapping::seed(&region, source);

    Ok(region)
}

/// Maps an existing file; `count` elements or the rest of the file.
pub(crate) fn open_region<T: Element, B: Backend>(
    backend: &B,
    op: &'static str,
    path: &Path,
    mode: Mode,
    count: Option<usize>,
    offset: u64,
) -> Result<Region<B::Resource>> {
    let open = || -> io::Result<Region<B::Resource>> {
        // Mapping bases are page aligned, so the element alignment only
        // depends on the offset.
        if offset % align_of::<T>() as u64 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("offset {offset} is not aligned to {} bytes", align_of::<T>()),
            ));
        }

        let len = count
            .map(|count| element::byte_len::<T>(count).ok_or_else(|| overflow(count)))
            .transpose()?;

        backend.open(path, mode, len, offset)
    };

    open().map_err(|source| Error::open(op, path, source))
}

fn overflow(count: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{count} elements overflow the address space"),
    )
}

/// Hands out raw [`View`]s and releases them by address.
///
/// Every operation takes `&mut self`, which is how concurrent callers are
/// serialized. Mappings still registered when the mapper is dropped are
/// released then.
///
/// ```no_run
/// use highmap::{Mapper, Mode};
///
/// let mut mapper = Mapper::new();
/// let view = mapper.create::<u32>("table.bin", 1024, None)?;
/// unsafe { view.as_mut_slice()[0] = 42 };
/// mapper.close(view)?;
///
/// let view = mapper.open::<u32>("table.bin", Mode::Read, None, 0)?;
/// assert_eq!(1024, view.len());
/// mapper.close(view)?;
/// # Ok::<(), highmap::Error>(())
/// ```
pub struct Mapper<B: Backend = Native> {
    backend: B,
    registry: Registry<B::Resource>,
}

impl Mapper<Native> {
    pub fn new() -> Self {
        Self::with_backend(Native::default())
    }
}

impl Default for Mapper<Native> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Mapper<B> {
    pub fn with_backend(backend: B) -> Self {
        Self { backend, registry: Registry::new() }
    }

    /// When set, a mapping that can't be placed above the high-address
    /// threshold fails instead of falling back to wherever the OS puts it.
    pub fn set_strict(&mut self, strict: bool) {
        self.backend.strategy_mut().strict = strict;
    }

    pub fn is_strict(&self) -> bool {
        self.backend.strategy().strict
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.len() == 0
    }

    fn register<T: Element>(&mut self, region: Region<B::Resource>) -> View<T> {
        let view = View::new(region.addr(), region.len());
        self.registry.insert(region);
        view
    }

    /// Reserves anonymous memory for `count` elements of `T`, zero filled
    /// except for whatever is copied from `source`.
    pub fn malloc<T: Element>(&mut self, count: usize, source: Option<&[T]>) -> Result<View<T>> {
        let region = malloc_region(&self.backend, count, source)?;
        Ok(self.register(region))
    }

    /// Releases memory returned by [`Mapper::malloc`].
    pub fn free<T: Element>(&mut self, view: View<T>) -> Result<()> {
        let addr = view.addr();
        let region = self.registry.take(addr, Kind::Anonymous)?;

        self.backend
            .free(region)
            .map_err(|source| Error::ReleaseFailure { addr, source })
    }

    /// Creates (or truncates) `path` with room for `count` elements of `T`
    /// and maps it read-write. A zero-length create reopens as one zero byte.
    pub fn create<T: Element>(
        &mut self,
        path: impl AsRef<Path>,
        count: usize,
        source: Option<&[T]>,
    ) -> Result<View<T>> {
        let region = create_region(&self.backend, "create", path.as_ref(), count, source)?;
        Ok(self.register(region))
    }

    /// Maps an existing file. Without `count` the view covers the file from
    /// `offset` to its end, and its length is however many whole `T` fit.
    pub fn open<T: Element>(
        &mut self,
        path: impl AsRef<Path>,
        mode: Mode,
        count: Option<usize>,
        offset: u64,
    ) -> Result<View<T>> {
        let path = path.as_ref();
        let region = open_region::<T, B>(&self.backend, "open", path, mode, count, offset)?;
        Ok(self.register(region))
    }

    /// Flushes, unmaps and closes a view returned by `create` or `open`.
    pub fn close<T: Element>(&mut self, view: View<T>) -> Result<()> {
        let addr = view.addr();
        let region = self.registry.take(addr, Kind::File)?;

        self.backend
            .close(region)
            .map_err(|source| Error::ReleaseFailure { addr, source })
    }

    /// Writes dirty pages of a file view to disk, keeping it mapped.
    pub fn flush<T: Element>(&self, view: View<T>) -> Result<()> {
        let addr = view.addr();
        let region = self.registry.get(addr).ok_or(Error::RegistryMiss(addr))?;

        self.backend
            .flush(region)
            .map_err(|source| Error::ReleaseFailure { addr, source })
    }

    /// Takes over an owned mapping, which from now on is released through
    /// this mapper.
    pub fn adopt<T: Element>(&mut self, mapping: Mapping<T, B>) -> View<T> {
        let (region, _) = mapping.into_parts();
        self.register(region)
    }
}

impl<B: Backend> Drop for Mapper<B> {
    fn drop(&mut self) {
        if self.registry.len() > 0 {
            tracing::warn!(
                "mapper dropped with {} live mapping(s), releasing",
                self.registry.len()
            );
        }

        for region in self.registry.drain() {
            let addr = region.addr();

            if let Err(err) = self.backend.release(region) {
                tracing::warn!("releasing mapping at {addr:p} failed: {err}");
            }
        }
    }
}
