use std::collections::HashMap;

use crate::{
    error::{Error, Result},
    kernel::{Backing, Region},
};

/// Whether a release targets anonymous memory (`free`) or a file (`close`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Kind {
    Anonymous,
    File,
}

/// Table of live regions keyed by the address handed to the caller.
///
/// An address appears at most once: the OS never hands out an address that
/// is still mapped, and every release removes its entry. Releasing an
/// address that is not here (or that is here with the other kind) is a
/// [`Error::RegistryMiss`] and leaves the table untouched.
#[derive(Debug)]
pub(crate) struct Registry<R> {
    entries: HashMap<usize, Region<R>>,
}

impl<R: Backing> Registry<R> {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Registers `region` and returns its address.
    pub fn insert(&mut self, region: Region<R>) -> usize {
        let addr = region.addr().as_ptr() as usize;
        let previous = self.entries.insert(addr, region);

        debug_assert!(previous.is_none(), "address {addr:#x} registered twice");

        addr
    }

    pub fn get(&self, addr: usize) -> Option<&Region<R>> {
        self.entries.get(&addr)
    }

    /// Removes the entry for `addr` if it is of the given kind.
    pub fn take(&mut self, addr: usize, kind: Kind) -> Result<Region<R>> {
        let matches = self.entries.get(&addr).is_some_and(|region| {
            region.is_anonymous() == (kind == Kind::Anonymous)
        });

        if !matches {
            return Err(Error::RegistryMiss(addr));
        }

        self.entries.remove(&addr).ok_or(Error::RegistryMiss(addr))
    }

    /// Removes every entry.
    pub fn drain(&mut self) -> impl Iterator<Item = Region<R>> + '_ {
        self.entries.drain().map(|(_, region)| region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::NonNull;

    #[derive(Debug)]
    struct Fake(bool);

    impl Backing for Fake {
        fn is_anonymous(&self) -> bool {
            self.0
        }
    }

    fn region(addr: usize, anonymous: bool) -> Region<Fake> {
        Region {
            base: NonNull::new(addr as *mut u8).unwrap(),
            map_len: 4096,
            skew: 0,
            len: 4096,
            writable: true,
            resource: Fake(anonymous),
        }
    }

    #[test]
    fn take_removes_exactly_once() {
        let mut registry = Registry::new();
        let addr = registry.insert(region(0x1000, true));

        assert_eq!(1, registry.len());
        assert!(registry.take(addr, Kind::Anonymous).is_ok());
        assert_eq!(0, registry.len());
        assert!(matches!(registry.take(addr, Kind::Anonymous), Err(Error::RegistryMiss(0x1000))));
    }

    #[test]
    fn wrong_kind_is_a_miss_and_keeps_entry() {
        let mut registry = Registry::new();
        let file = registry.insert(region(0x2000, false));
        let anonymous = registry.insert(region(0x3000, true));

        assert!(matches!(registry.take(file, Kind::Anonymous), Err(Error::RegistryMiss(_))));
        assert!(matches!(registry.take(anonymous, Kind::File), Err(Error::RegistryMiss(_))));
        assert_eq!(2, registry.len());

        assert!(registry.take(file, Kind::File).is_ok());
    }

    #[test]
    fn foreign_address_is_a_miss() {
        let mut registry: Registry<Fake> = Registry::new();
        assert!(matches!(
            registry.take(0xdead_0000, Kind::File),
            Err(Error::RegistryMiss(0xdead_0000))
        ));
    }
}
