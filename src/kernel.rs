use std::{fmt, io, path::Path, ptr::NonNull, str::FromStr, sync::OnceLock};

use crate::{error::Error, placement::Strategy};

#[cfg(unix)]
pub use self::unix::{Resource, Unix};

#[cfg(windows)]
pub use self::windows::{MappingObject, Resource, Windows};

/// Backend of the platform the crate was built for.
#[cfg(unix)]
pub type Native = Unix;

/// Backend of the platform the crate was built for.
#[cfg(windows)]
pub type Native = Windows;

/// Virtual memory page size of the computer. This is usually 4096.
static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// Alignment of mapping base addresses and file offsets. Equal to the page
/// size everywhere except windows, where it is usually 64 KiB.
static GRANULARITY: OnceLock<usize> = OnceLock::new();

/// Queries the OS can answer about its virtual memory, independent of
/// any particular mapping.
trait PlatformMemory {
    /// Returns the virtual memory page size of the computer in bytes.
    unsafe fn page_size() -> usize;

    /// Returns the granularity mapping addresses and offsets must honor.
    unsafe fn granularity() -> usize;
}

/// Wrapper to calculate the computer's page size once.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| unsafe { <Native as PlatformMemory>::page_size() })
}

/// Wrapper to calculate the mapping granularity once.
#[inline]
pub fn granularity() -> usize {
    *GRANULARITY.get_or_init(|| unsafe { <Native as PlatformMemory>::granularity() })
}

/// Access mode of [`Backend::open`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Mode {
    /// `"r"`
    #[default]
    Read,
    /// `"rw"`
    ReadWrite,
}

impl Mode {
    pub fn is_writable(self) -> bool {
        self == Mode::ReadWrite
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "r" => Ok(Mode::Read),
            "rw" => Ok(Mode::ReadWrite),
            other => Err(Error::InvalidMode(other.to_owned())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Read => "r",
            Mode::ReadWrite => "rw",
        })
    }
}

/// What a backend needs to keep around to release a mapping.
pub trait Backing {
    /// Whether this is anonymous memory (released with `free`) rather than
    /// a file view (released with `close`).
    fn is_anonymous(&self) -> bool;
}

/// One live mapping as the OS handed it out.
///
/// ```text
///  base                 addr = base + skew
///   |                    |
///   v                    v
///   +--------------------+---------------------------------+
///   |  skew (unaligned   |        len visible bytes        |
///   |  part of offset)   |                                 |
///   +--------------------+---------------------------------+
///   <----------------------- map_len ---------------------->
/// ```
///
/// `skew` is only non-zero for files opened at an offset that is not a
/// multiple of [`granularity`].
#[derive(Debug)]
pub struct Region<R> {
    pub(crate) base: NonNull<u8>,
    pub(crate) map_len: usize,
    pub(crate) skew: usize,
    pub(crate) len: usize,
    pub(crate) writable: bool,
    pub(crate) resource: R,
}

impl<R> Region<R> {
    /// Address handed to the caller.
    #[inline]
    pub fn addr(&self) -> NonNull<u8> {
        unsafe { self.base.add(self.skew) }
    }

    /// Bytes visible at [`Region::addr`].
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl<R: Backing> Region<R> {
    #[inline]
    pub fn is_anonymous(&self) -> bool {
        self.resource.is_anonymous()
    }
}

// The region is only an address plus OS resources, nothing in it is tied
// to the thread that created the mapping.
unsafe impl<R: Send> Send for Region<R> {}
unsafe impl<R: Sync> Sync for Region<R> {}

/// This trait provides an abstraction over the native mapping primitives
/// of one OS. Every method either returns a fully set up [`Region`] or an
/// error with nothing left open or mapped.
///
/// Errors are plain [`io::Error`]s carrying the OS text; the facade wraps
/// them into [`Error`] with the operation and file name.
pub trait Backend {
    type Resource: Backing;

    fn strategy(&self) -> &Strategy;

    fn strategy_mut(&mut self) -> &mut Strategy;

    /// Anonymous read-write mapping of `len` bytes, zero filled.
    fn malloc(&self, len: usize) -> io::Result<Region<Self::Resource>>;

    /// Releases a region returned by [`Backend::malloc`].
    fn free(&self, region: Region<Self::Resource>) -> io::Result<()>;

    /// Creates (or truncates) `path`, extends it to `max(len, 1)` bytes and
    /// maps it read-write.
    fn create(&self, path: &Path, len: usize) -> io::Result<Region<Self::Resource>>;

    /// Maps an existing file. `len` defaults to everything from `offset`
    /// to the end of the file.
    fn open(
        &self,
        path: &Path,
        mode: Mode,
        len: Option<usize>,
        offset: u64,
    ) -> io::Result<Region<Self::Resource>>;

    /// Writes dirty pages of a file-backed region to disk.
    fn flush(&self, region: &Region<Self::Resource>) -> io::Result<()>;

    /// Flushes, unmaps and closes a region returned by `create` or `open`.
    fn close(&self, region: Region<Self::Resource>) -> io::Result<()>;

    /// Either [`Backend::free`] or [`Backend::close`] depending on the
    /// region kind.
    fn release(&self, region: Region<Self::Resource>) -> io::Result<()> {
        if region.is_anonymous() {
            self.free(region)
        } else {
            self.close(region)
        }
    }
}

/// Byte length of a file view starting at `offset`.
fn view_len(file_len: u64, len: Option<usize>, offset: u64) -> io::Result<usize> {
    let available = file_len.checked_sub(offset).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("offset {offset} is past the end of the file ({file_len} bytes)"),
        )
    })?;

    let len = match len {
        Some(len) if len as u64 > available => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "{len} bytes at offset {offset} extend past the end of the file \
                     ({file_len} bytes)"
                ),
            ));
        }
        Some(len) => len,
        None => usize::try_from(available).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "file does not fit in the address space")
        })?,
    };

    if len == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot map an empty range"));
    }

    Ok(len)
}

#[cfg(unix)]
mod unix {
    use super::{Backend, Backing, Mode, PlatformMemory, Region};
    use crate::{placement::{self, Probe, Strategy}, utils::align_down};

    use libc::{c_int, c_void, off_t};

    use std::{
        fs::{File, OpenOptions},
        io,
        os::{fd::{AsRawFd, IntoRawFd}, unix::fs::OpenOptionsExt},
        path::Path,
        ptr::{self, NonNull},
    };

    /// `mmap`/`munmap` based backend.
    #[derive(Debug, Default)]
    pub struct Unix {
        strategy: Strategy,
    }

    /// Anonymous memory owns nothing; a file view owns its descriptor.
    #[derive(Debug)]
    pub enum Resource {
        Anonymous,
        File(File),
    }

    impl Backing for Resource {
        fn is_anonymous(&self) -> bool {
            matches!(self, Resource::Anonymous)
        }
    }

    /// One `mmap` call with everything but the address fixed.
    struct MmapProbe {
        len: usize,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: off_t,
    }

    impl Probe for MmapProbe {
        fn map(&mut self, hint: Option<NonNull<u8>>) -> io::Result<Option<NonNull<u8>>> {
            // Without MAP_FIXED the address is only a hint: mmap never fails
            // because it is occupied, it relocates instead.
            let hint = hint.map_or(ptr::null_mut(), |hint| hint.as_ptr().cast::<c_void>());

            unsafe {
                match libc::mmap(hint, self.len, self.prot, self.flags, self.fd, self.offset) {
                    libc::MAP_FAILED => Err(io::Error::last_os_error()),
                    addr => Ok(Some(NonNull::new_unchecked(addr).cast::<u8>())),
                }
            }
        }

        fn unmap(&mut self, addr: NonNull<u8>) {
            unsafe { libc::munmap(addr.as_ptr().cast(), self.len); }
        }
    }

    fn unmap(base: NonNull<u8>, len: usize) -> io::Result<()> {
        tracing::debug!("munmap {len} bytes at {base:p}");

        match unsafe { libc::munmap(base.as_ptr().cast(), len) } {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }

    fn sync(base: NonNull<u8>, len: usize) -> io::Result<()> {
        match unsafe { libc::msync(base.as_ptr().cast(), len, libc::MS_SYNC) } {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }

    impl Unix {
        fn map(
            &self,
            len: usize,
            prot: c_int,
            flags: c_int,
            fd: c_int,
            offset: off_t,
        ) -> io::Result<NonNull<u8>> {
            let mut probe = MmapProbe { len, prot, flags, fd, offset };
            let placement =
                placement::place(&self.strategy, len, super::granularity(), &mut probe)?;

            tracing::debug!(
                "mmap {len} bytes (fd {fd}, offset {offset}) at {:p} after {} probe(s)",
                placement.addr,
                placement.probes
            );

            Ok(placement.addr)
        }
    }

    impl PlatformMemory for Unix {
        unsafe fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }

        unsafe fn granularity() -> usize {
            unsafe { Self::page_size() }
        }
    }

    impl Backend for Unix {
        type Resource = Resource;

        fn strategy(&self) -> &Strategy {
            &self.strategy
        }

        fn strategy_mut(&mut self) -> &mut Strategy {
            &mut self.strategy
        }

        fn malloc(&self, len: usize) -> io::Result<Region<Resource>> {
            // Read-Write private memory, zero filled by the kernel.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            let map_len = len.max(1);
            let base = self.map(map_len, PROT, FLAGS, -1, 0)?;

            Ok(Region {
                base,
                map_len,
                skew: 0,
                len,
                writable: true,
                resource: Resource::Anonymous,
            })
        }

        fn free(&self, region: Region<Resource>) -> io::Result<()> {
            debug_assert!(region.is_anonymous());
            unmap(region.base, region.map_len)
        }

        fn create(&self, path: &Path, len: usize) -> io::Result<Region<Resource>> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o644)
                .open(path)?;

            // A zero length file can't be mapped, so we always keep one byte.
            let map_len = len.max(1);
            file.set_len(map_len as u64)?;

            // If mapping fails `file` is dropped here and the descriptor closed.
            let base = self.map(
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )?;

            Ok(Region {
                base,
                map_len,
                skew: 0,
                len,
                writable: true,
                resource: Resource::File(file),
            })
        }

        fn open(
            &self,
            path: &Path,
            mode: Mode,
            len: Option<usize>,
            offset: u64,
        ) -> io::Result<Region<Resource>> {
            let file = OpenOptions::new().read(true).write(mode.is_writable()).open(path)?;
            let len = super::view_len(file.metadata()?.len(), len, offset)?;

            let aligned = align_down(offset, super::granularity());
            let skew = (offset - aligned) as usize;
            let map_len = len + skew;

            let aligned = off_t::try_from(aligned).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("offset {offset} out of range"))
            })?;

            let prot = match mode {
                Mode::Read => libc::PROT_READ,
                Mode::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            };

            let base = self.map(map_len, prot, libc::MAP_SHARED, file.as_raw_fd(), aligned)?;

            Ok(Region {
                base,
                map_len,
                skew,
                len,
                writable: mode.is_writable(),
                resource: Resource::File(file),
            })
        }

        fn flush(&self, region: &Region<Resource>) -> io::Result<()> {
            match region.resource {
                Resource::File(_) if region.writable => sync(region.base, region.map_len),
                _ => Ok(()),
            }
        }

        fn close(&self, region: Region<Resource>) -> io::Result<()> {
            let Region { base, map_len, writable, resource, .. } = region;

            let Resource::File(file) = resource else {
                debug_assert!(false, "close called on anonymous memory");
                return unmap(base, map_len);
            };

            let fd = file.into_raw_fd();

            // The descriptor may already have been closed behind our back
            // (process teardown). Then there is nothing to flush or close.
            if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
                tracing::debug!("fd {fd} of mapping at {base:p} is gone, skipping flush");
                return unmap(base, map_len);
            }

            let flushed = if writable { sync(base, map_len) } else { Ok(()) };
            let unmapped = unmap(base, map_len);

            unsafe { libc::close(fd); }

            flushed.and(unmapped)
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::{Backend, Backing, Mode, PlatformMemory, Region};
    use crate::{placement::{self, Probe, Strategy}, utils::align_down};

    use std::{
        ffi::c_void,
        fs::{File, OpenOptions},
        io,
        mem::{self, MaybeUninit},
        os::windows::io::{AsRawHandle, IntoRawHandle},
        path::Path,
        ptr::NonNull,
    };

    use windows::{
        core::PCWSTR,
        Win32::{
            Foundation::{self, HANDLE},
            Storage::FileSystem,
            System::{Memory, SystemInformation},
        },
    };

    /// `CreateFileMappingW` + `MapViewOfFileEx` based backend. Anonymous
    /// memory comes from `VirtualAlloc`.
    #[derive(Debug, Default)]
    pub struct Windows {
        strategy: Strategy,
    }

    /// File-mapping object handle, closed on drop.
    #[derive(Debug)]
    pub struct MappingObject(HANDLE);

    impl Drop for MappingObject {
        fn drop(&mut self) {
            unsafe { let _ = Foundation::CloseHandle(self.0); }
        }
    }

    // Kernel object handles are process wide.
    unsafe impl Send for MappingObject {}
    unsafe impl Sync for MappingObject {}

    /// A file view needs two handles: the file and the mapping object
    /// created from it. `mapping` is declared first so it is closed first.
    #[derive(Debug)]
    pub enum Resource {
        Anonymous,
        File { mapping: MappingObject, file: File },
    }

    impl Backing for Resource {
        fn is_anonymous(&self) -> bool {
            matches!(self, Resource::Anonymous)
        }
    }

    /// Failing calls with a base address report `ERROR_INVALID_ADDRESS`
    /// when that range is already in use.
    fn occupied_or_error() -> io::Result<Option<NonNull<u8>>> {
        let err = io::Error::last_os_error();

        if err.raw_os_error() == Some(Foundation::ERROR_INVALID_ADDRESS.0 as i32) {
            Ok(None)
        } else {
            Err(err)
        }
    }

    struct VirtualProbe {
        len: usize,
    }

    impl Probe for VirtualProbe {
        fn map(&mut self, hint: Option<NonNull<u8>>) -> io::Result<Option<NonNull<u8>>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;
            let hint = hint.map(|hint| hint.as_ptr().cast_const().cast::<c_void>());

            let addr = unsafe { Memory::VirtualAlloc(hint, self.len, flags, protection) };

            match NonNull::new(addr.cast::<u8>()) {
                Some(addr) => Ok(Some(addr)),
                None => occupied_or_error(),
            }
        }

        fn unmap(&mut self, addr: NonNull<u8>) {
            unsafe { let _ = Memory::VirtualFree(addr.as_ptr().cast(), 0, Memory::MEM_RELEASE); }
        }
    }

    struct ViewProbe {
        mapping: HANDLE,
        access: Memory::FILE_MAP,
        offset: u64,
        len: usize,
    }

    impl Probe for ViewProbe {
        fn map(&mut self, hint: Option<NonNull<u8>>) -> io::Result<Option<NonNull<u8>>> {
            let hint = hint.map(|hint| hint.as_ptr().cast_const().cast::<c_void>());

            let view = unsafe {
                Memory::MapViewOfFileEx(
                    self.mapping,
                    self.access,
                    (self.offset >> 32) as u32,
                    self.offset as u32,
                    self.len,
                    hint,
                )
            };

            match NonNull::new(view.Value.cast::<u8>()) {
                Some(addr) => Ok(Some(addr)),
                None => occupied_or_error(),
            }
        }

        fn unmap(&mut self, addr: NonNull<u8>) {
            let _ = unmap_view(addr);
        }
    }

    fn unmap_view(addr: NonNull<u8>) -> io::Result<()> {
        tracing::debug!("UnmapViewOfFile at {addr:p}");

        unsafe {
            Memory::UnmapViewOfFile(Memory::MEMORY_MAPPED_VIEW_ADDRESS {
                Value: addr.as_ptr().cast(),
            })
        }
        .map_err(|_| io::Error::last_os_error())
    }

    fn raw(file: &File) -> HANDLE {
        HANDLE(file.as_raw_handle())
    }

    fn mapping_object(file: &File, writable: bool) -> io::Result<MappingObject> {
        let protection = if writable { Memory::PAGE_READWRITE } else { Memory::PAGE_READONLY };

        // Zero maximum size means "the current size of the file".
        unsafe { Memory::CreateFileMappingW(raw(file), None, protection, 0, 0, PCWSTR::null()) }
            .map(MappingObject)
            .map_err(|_| io::Error::last_os_error())
    }

    fn sync(base: NonNull<u8>, file: &File) -> io::Result<()> {
        unsafe {
            Memory::FlushViewOfFile(base.as_ptr().cast_const().cast(), 0)
                .and_then(|()| FileSystem::FlushFileBuffers(raw(file)))
        }
        .map_err(|_| io::Error::last_os_error())
    }

    impl Windows {
        fn map_view(
            &self,
            mapping: &MappingObject,
            writable: bool,
            offset: u64,
            len: usize,
        ) -> io::Result<NonNull<u8>> {
            let access = if writable { Memory::FILE_MAP_WRITE } else { Memory::FILE_MAP_READ };
            let mut probe = ViewProbe { mapping: mapping.0, access, offset, len };
            let placement =
                placement::place(&self.strategy, len, super::granularity(), &mut probe)?;

            tracing::debug!(
                "MapViewOfFileEx {len} bytes (offset {offset}) at {:p} after {} probe(s)",
                placement.addr,
                placement.probes
            );

            Ok(placement.addr)
        }
    }

    impl PlatformMemory for Windows {
        unsafe fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }

        unsafe fn granularity() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwAllocationGranularity as usize
            }
        }
    }

    impl Backend for Windows {
        type Resource = Resource;

        fn strategy(&self) -> &Strategy {
            &self.strategy
        }

        fn strategy_mut(&mut self) -> &mut Strategy {
            &mut self.strategy
        }

        fn malloc(&self, len: usize) -> io::Result<Region<Resource>> {
            let map_len = len.max(1);
            let mut probe = VirtualProbe { len: map_len };
            let placement =
                placement::place(&self.strategy, map_len, super::granularity(), &mut probe)?;

            tracing::debug!("VirtualAlloc {map_len} bytes at {:p}", placement.addr);

            Ok(Region {
                base: placement.addr,
                map_len,
                skew: 0,
                len,
                writable: true,
                resource: Resource::Anonymous,
            })
        }

        fn free(&self, region: Region<Resource>) -> io::Result<()> {
            debug_assert!(region.is_anonymous());
            tracing::debug!("VirtualFree at {:p}", region.base);

            unsafe { Memory::VirtualFree(region.base.as_ptr().cast(), 0, Memory::MEM_RELEASE) }
                .map_err(|_| io::Error::last_os_error())
        }

        fn create(&self, path: &Path, len: usize) -> io::Result<Region<Resource>> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;

            // A zero length file can't be mapped, so we always keep one byte.
            let map_len = len.max(1);
            file.set_len(map_len as u64)?;

            // Handles acquired so far are closed by their destructors if
            // any later step fails.
            let mapping = mapping_object(&file, true)?;
            let base = self.map_view(&mapping, true, 0, map_len)?;

            Ok(Region {
                base,
                map_len,
                skew: 0,
                len,
                writable: true,
                resource: Resource::File { mapping, file },
            })
        }

        fn open(
            &self,
            path: &Path,
            mode: Mode,
            len: Option<usize>,
            offset: u64,
        ) -> io::Result<Region<Resource>> {
            let file = OpenOptions::new().read(true).write(mode.is_writable()).open(path)?;
            let len = super::view_len(file.metadata()?.len(), len, offset)?;

            let aligned = align_down(offset, super::granularity());
            let skew = (offset - aligned) as usize;
            let map_len = len + skew;

            let mapping = mapping_object(&file, mode.is_writable())?;
            let base = self.map_view(&mapping, mode.is_writable(), aligned, map_len)?;

            Ok(Region {
                base,
                map_len,
                skew,
                len,
                writable: mode.is_writable(),
                resource: Resource::File { mapping, file },
            })
        }

        fn flush(&self, region: &Region<Resource>) -> io::Result<()> {
            match &region.resource {
                Resource::File { file, .. } if region.writable => sync(region.base, file),
                _ => Ok(()),
            }
        }

        fn close(&self, region: Region<Resource>) -> io::Result<()> {
            let Region { base, writable, resource, .. } = region;

            let Resource::File { mapping, file } = resource else {
                debug_assert!(false, "close called on anonymous memory");
                return unmap_view(base);
            };

            // Handles may already be invalid during process teardown. Then
            // there is nothing to flush, and closing them again is an error.
            let mut flags = 0u32;
            if unsafe { Foundation::GetHandleInformation(raw(&file), &mut flags) }.is_err() {
                tracing::debug!("file handle of mapping at {base:p} is gone, skipping flush");
                let _ = file.into_raw_handle();
                mem::forget(mapping);
                return unmap_view(base);
            }

            let flushed = if writable { sync(base, &file) } else { Ok(()) };
            let unmapped = unmap_view(base);

            drop(mapping);
            drop(file);

            flushed.and(unmapped)
        }
    }
}
