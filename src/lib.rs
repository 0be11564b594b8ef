//! Memory-mapped files and high-address anonymous memory behind one
//! contract on unix (`mmap`) and windows (`CreateFileMappingW` +
//! `MapViewOfFileEx`).
//!
//! Two ways to hold a mapping:
//!
//! * [`malloc`], [`create`] and [`open`] return an owned [`Mapping`] that is
//!   flushed and released when it goes out of scope.
//! * A [`Mapper`] returns raw [`View`]s that stay alive until they are passed
//!   back to [`Mapper::free`] / [`Mapper::close`]. Releasing the same view
//!   twice is an [`Error::RegistryMiss`].
//!
//! Every mapping is placed at or above [`HIGH_ADDRESS`] when the OS lets us.
//! See [`placement`] for how.
//!
//! ```no_run
//! let mut table = highmap::create::<u32>("table.bin", 1024, None)?;
//! if let Some(words) = table.as_mut_slice() {
//!     words.iter_mut().enumerate().for_each(|(i, w)| *w = i as u32);
//! }
//! drop(table);
//!
//! let table = highmap::open::<u32>("table.bin", highmap::Mode::Read, None, 0)?;
//! assert_eq!(1024, table.len());
//! # Ok::<(), highmap::Error>(())
//! ```

use std::path::Path;

mod element;
mod error;
mod kernel;
mod mapper;
mod mapping;
pub mod placement;
mod registry;
pub mod strtab;
mod utils;

pub use element::Element;
pub use error::{Error, Result};
pub use kernel::{granularity, page_size, Backend, Backing, Mode, Native, Region, Resource};
pub use mapper::Mapper;
pub use mapping::{Mapping, View};
pub use placement::HIGH_ADDRESS;
pub use strtab::{StringTable, StringTableBuilder};

/// Owned anonymous memory for `count` elements of `T`, zero filled except
/// for whatever is copied from `source`. Released on drop.
pub fn malloc<T: Element>(count: usize, source: Option<&[T]>) -> Result<Mapping<T>> {
    let backend = Native::default();
    let region = mapper::malloc_region(&backend, count, source)?;

    Ok(Mapping::new(region, backend))
}

/// Creates (or truncates) `path` with room for `count` elements of `T` and
/// maps it read-write. Flushed and closed on drop.
///
/// The file is never shorter than one byte: a zero-length create reopens as
/// a single zero byte.
pub fn create<T: Element>(
    path: impl AsRef<Path>,
    count: usize,
    source: Option<&[T]>,
) -> Result<Mapping<T>> {
    let backend = Native::default();
    let region = mapper::create_region(&backend, "create", path.as_ref(), count, source)?;

    Ok(Mapping::new(region, backend))
}

/// Maps an existing file. Without `count` the mapping covers the file from
/// `offset` to its end. Flushed (if writable) and closed on drop.
pub fn open<T: Element>(
    path: impl AsRef<Path>,
    mode: Mode,
    count: Option<usize>,
    offset: u64,
) -> Result<Mapping<T>> {
    let backend = Native::default();
    let region = mapper::open_region::<T, _>(&backend, "open", path.as_ref(), mode, count, offset)?;

    Ok(Mapping::new(region, backend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn create_close_reopen_owned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test");

        {
            let mut table = create::<u32>(&path, 1024, None).unwrap();
            assert_eq!(1024, table.len());

            let words = table.as_mut_slice().unwrap();
            for (i, word) in words.iter_mut().enumerate() {
                *word = i as u32 + 3;
            }
        }

        let table = open::<u32>(&path, Mode::Read, None, 0).unwrap();
        assert_eq!(1024, table.len());
        assert!(table.iter().enumerate().all(|(i, &word)| word == i as u32 + 3));
    }

    #[test]
    fn create_in_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no_such_dir").join("test");

        let err = create::<u32>(&path, 1024, None).unwrap_err();
        let message = err.to_string();

        assert!(matches!(err, Error::CreateFailure { op: "create", .. }));
        assert!(message.starts_with("create: Error creating '"));
        assert!(message.contains(&*Path::new("no_such_dir").join("test").to_string_lossy()));

        #[cfg(unix)]
        assert!(message.contains("No such file or directory"), "{message}");
        #[cfg(windows)]
        assert!(message.contains("The system cannot find the path specified"), "{message}");
    }

    #[test]
    fn open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does_not_exist");

        let err = open::<u32>(&path, Mode::Read, None, 0).unwrap_err();
        let message = err.to_string();

        assert!(matches!(err, Error::OpenFailure { op: "open", .. }));
        assert!(message.starts_with("open: Error opening '"));
        assert!(message.contains("does_not_exist"));

        #[cfg(unix)]
        assert!(message.contains("No such file or directory"), "{message}");
        #[cfg(windows)]
        assert!(message.contains("The system cannot find the file specified"), "{message}");
    }

    #[test]
    fn invalid_mode_string() {
        assert!(matches!("a".parse::<Mode>(), Err(Error::InvalidMode(mode)) if mode == "a"));
        assert_eq!(
            "invalid mode 'x': expected \"r\" or \"rw\"",
            "x".parse::<Mode>().unwrap_err().to_string()
        );
    }

    #[test]
    fn open_past_end_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short");
        std::fs::write(&path, [0u8; 8]).unwrap();

        assert!(matches!(open::<u8>(&path, Mode::Read, None, 9), Err(Error::OpenFailure { .. })));
        assert!(matches!(
            open::<u8>(&path, Mode::Read, Some(9), 0),
            Err(Error::OpenFailure { .. })
        ));
    }

    #[test]
    fn zero_sized_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");

        let table = create::<u64>(&path, 0, None).unwrap();
        assert!(table.is_empty());
        drop(table);

        assert_eq!(1, std::fs::metadata(&path).unwrap().len());

        let reopened = open::<u8>(&path, Mode::Read, None, 0).unwrap();
        assert_eq!(&[0], &reopened[..]);
    }

    #[test]
    fn bytes_survive_reopen_across_page_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let page = page_size();

        for len in [1, page - 1, page, page + 1, 2 * page + 1, 3 * page] {
            let path = dir.path().join(format!("bytes_{len}"));
            let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8 + 1).collect();

            drop(create(&path, len, Some(&bytes[..])).unwrap());

            let reopened = open::<u8>(&path, Mode::Read, None, 0).unwrap();
            assert_eq!(len, reopened.len());
            assert!(reopened[..] == bytes[..], "contents differ at length {len}");
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn bytes_survive_reopen(bytes in prop::collection::vec(any::<u8>(), 1..=3 * 4096)) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("prop");

            let mut table = create::<u8>(&path, bytes.len(), None).unwrap();
            table.as_mut_slice().unwrap().copy_from_slice(&bytes);
            table.close().unwrap();

            let reopened = open::<u8>(&path, Mode::Read, None, 0).unwrap();
            prop_assert_eq!(&bytes[..], &reopened[..]);
        }
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn owned_mappings_are_placed_high() {
        let dir = tempfile::tempdir().unwrap();
        let block = malloc::<u8>(1 << 16, None).unwrap();
        let file = create::<u8>(dir.path().join("high"), 1 << 16, None).unwrap();

        assert!(block.addr() as u64 >= HIGH_ADDRESS);
        assert!(file.addr() as u64 >= HIGH_ADDRESS);
    }
}
