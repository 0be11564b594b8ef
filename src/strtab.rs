//! Serialized string table.
//!
//! The on-disk format has no header: the distinct strings, sorted bytewise,
//! each followed by a single NUL.
//!
//! ```text
//!   add("b"), add("a"), write()
//!
//!   offset  0    1    2    3
//!         +----+----+----+----+
//!         | a  | \0 | b  | \0 |
//!         +----+----+----+----+
//! ```
//!
//! A table with no strings is written as a single NUL byte, since a mapped
//! file can't be empty. It reads back as a table holding `""`.

use std::{
    collections::{BTreeSet, HashMap},
    path::Path,
    str,
};

use crate::{error::Result, kernel::Mode, mapping::Mapping};

/// Collects strings and assigns each one a byte offset in the table file.
///
/// Offsets handed out by [`StringTableBuilder::offset`] before
/// [`StringTableBuilder::write`] are provisional (insertion order). Writing
/// sorts the strings and reassigns every offset, so only read offsets after
/// writing.
#[derive(Clone, Debug, Default)]
pub struct StringTableBuilder {
    strings: BTreeSet<String>,
    offsets: HashMap<String, usize>,
    size: usize,
}

impl StringTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `s` unless it is already present. Returns whether it was added.
    ///
    /// Entries are NUL terminated on disk, so a string containing a NUL byte
    /// could never be read back whole. Such strings are rejected and `false`
    /// is returned.
    pub fn add(&mut self, s: &str) -> bool {
        if s.contains('\0') {
            tracing::debug!("rejecting string table entry with an interior NUL: {s:?}");
            return false;
        }

        if self.strings.contains(s) {
            return false;
        }

        self.offsets.insert(s.to_owned(), self.size);
        self.strings.insert(s.to_owned());
        self.size += s.len() + 1;

        true
    }

    /// Last offset assigned to `s`.
    pub fn offset(&self, s: &str) -> Option<usize> {
        self.offsets.get(s).copied()
    }

    /// Number of distinct strings.
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Bytes the table takes on disk.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Creates `path` and lays the sorted strings out in it.
    pub fn write(&mut self, path: impl AsRef<Path>) -> Result<Mapping<u8>> {
        let mut table = crate::create::<u8>(path, self.size, None)?;

        if let Some(bytes) = table.as_mut_slice() {
            let mut offset = 0;

            for s in &self.strings {
                let end = offset + s.len();

                bytes[offset..end].copy_from_slice(s.as_bytes());
                bytes[end] = 0;

                if let Some(slot) = self.offsets.get_mut(s.as_str()) {
                    *slot = offset;
                }

                offset = end + 1;
            }
        }

        tracing::debug!("wrote string table: {} strings, {} bytes", self.len(), self.size);

        Ok(table)
    }
}

/// Read side of a string table file.
#[derive(Debug)]
pub struct StringTable {
    mapping: Mapping<u8>,
}

impl StringTable {
    /// Maps the table at `path` read-only.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        crate::open::<u8>(path, Mode::Read, None, 0).map(Self::new)
    }

    /// Wraps an already mapped table, e.g. the one returned by
    /// [`StringTableBuilder::write`].
    pub fn new(mapping: Mapping<u8>) -> Self {
        Self { mapping }
    }

    /// String starting at byte `offset`, up to its terminator.
    ///
    /// `None` if `offset` is out of range, no terminator follows it or the
    /// bytes aren't UTF-8.
    pub fn get(&self, offset: usize) -> Option<&str> {
        let tail = self.mapping.get(offset..)?;
        let end = tail.iter().position(|&b| b == 0)?;

        str::from_utf8(&tail[..end]).ok()
    }

    /// Every terminated string with its offset, in file order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> + '_ {
        let mut offset = 0;

        self.mapping.split_inclusive(|&b| b == 0).filter_map(move |chunk| {
            let start = offset;
            offset += chunk.len();

            match chunk.split_last() {
                Some((0, s)) => str::from_utf8(s).ok().map(|s| (start, s)),
                _ => None,
            }
        })
    }

    /// Size of the table in bytes.
    pub fn size(&self) -> usize {
        self.mapping.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn offsets_are_reassigned_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strings");

        let mut builder = StringTableBuilder::new();
        assert!(builder.add("b"));
        assert!(builder.add("a"));

        // Provisional, insertion order.
        assert_eq!(Some(0), builder.offset("b"));
        assert_eq!(Some(2), builder.offset("a"));

        builder.write(&path).unwrap();
        assert_eq!(Some(0), builder.offset("a"));
        assert_eq!(Some(2), builder.offset("b"));

        let table = StringTable::read(&path).unwrap();
        assert_eq!(Some("a"), table.get(0));
        assert_eq!(Some("b"), table.get(2));
        assert_eq!(b"a\0b\0", &std::fs::read(&path).unwrap()[..]);
    }

    #[test]
    fn duplicates_are_ignored() {
        let mut builder = StringTableBuilder::new();
        assert!(builder.add("hello"));
        assert!(!builder.add("hello"));
        assert!(builder.add(""));

        assert_eq!(2, builder.len());
        assert_eq!(7, builder.size());
        assert_eq!(None, builder.offset("missing"));
    }

    #[test]
    fn interior_nul_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nul");

        let mut builder = StringTableBuilder::new();
        assert!(!builder.add("a\0b"));
        assert!(builder.add("a"));

        assert_eq!(1, builder.len());
        assert_eq!(2, builder.size());
        assert_eq!(None, builder.offset("a\0b"));

        builder.write(&path).unwrap();
        let table = StringTable::read(&path).unwrap();
        assert_eq!(vec![(0, "a")], table.iter().collect::<Vec<_>>());
    }

    #[test]
    fn get_mid_string_and_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = StringTableBuilder::new();
        builder.add("alpha");
        let table = StringTable::new(builder.write(dir.path().join("t")).unwrap());

        assert_eq!(Some("pha"), table.get(2));
        assert_eq!(Some(""), table.get(5));
        assert_eq!(None, table.get(6));
        assert_eq!(6, table.size());
    }

    #[test]
    fn unterminated_tail_is_not_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw");
        std::fs::write(&path, b"one\0two").unwrap();

        let table = StringTable::read(&path).unwrap();
        assert_eq!(Some("one"), table.get(0));
        assert_eq!(None, table.get(4));
        assert_eq!(vec![(0, "one")], table.iter().collect::<Vec<_>>());
    }

    #[test]
    fn empty_table_is_one_terminator() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");

        StringTableBuilder::new().write(&path).unwrap();

        assert_eq!(b"\0", &std::fs::read(&path).unwrap()[..]);
        let table = StringTable::read(&path).unwrap();
        assert_eq!(vec![(0, "")], table.iter().collect::<Vec<_>>());
    }

    #[test]
    fn missing_table_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = StringTable::read(dir.path().join("nope")).unwrap_err();

        assert!(matches!(err, crate::Error::OpenFailure { .. }));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn written_offsets_decode(strings in prop::collection::vec("[^\\x00]{0,12}", 0..32)) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("prop");

            let mut builder = StringTableBuilder::new();
            for s in &strings {
                builder.add(s);
            }

            let expected: usize = builder.strings.iter().map(|s| s.len() + 1).sum();
            prop_assert_eq!(expected, builder.size());

            drop(builder.write(&path).unwrap());
            let table = StringTable::read(&path).unwrap();

            for s in &strings {
                let offset = builder.offset(s).unwrap();
                prop_assert_eq!(Some(s.as_str()), table.get(offset));
            }

            let listed: Vec<&str> = table.iter().map(|(_, s)| s).collect();
            let mut sorted: Vec<&str> = builder.strings.iter().map(String::as_str).collect();
            if sorted.is_empty() {
                sorted.push("");
            }
            prop_assert_eq!(sorted, listed);
        }
    }
}
