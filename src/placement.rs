//! High-address placement.
//!
//! Neither `mmap` nor `MapViewOfFileEx`/`VirtualAlloc` can be told "anywhere
//! above 4 GiB". We never use a forced placement (`MAP_FIXED` would happily
//! clobber whatever already lives there), so instead we pass an advisory
//! base address and check where the OS actually put the mapping:
//!
//! ```text
//!   hint = 4 GiB, step = len rounded to granularity
//!
//!   +--> map(hint) --> addr >= 4 GiB ? ---- yes ---> done
//!   |                       |
//!   |                       no: unmap(addr)
//!   |                       |
//!   +---- hint += step, step *= 2 (at most `max_probes` times)
//! ```
//!
//! The OS tends to honor hints that lie in unused address space, so this
//! converges after the first attempt almost every time.

use std::{io, ptr::NonNull};

use crate::utils::align;

/// Lowest address a mapping is expected to start at.
pub const HIGH_ADDRESS: u64 = 1 << 32;

/// Bound on placement attempts before falling back.
#[cfg(not(windows))]
pub const MAX_PROBES: usize = 1024;

/// Windows rejects occupied hints outright instead of relocating the
/// mapping, so every attempt is an independent guess.
#[cfg(windows)]
pub const MAX_PROBES: usize = 64;

/// Tunables of the probing loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Strategy {
    /// Addresses at or above this are accepted.
    pub threshold: u64,
    /// Hinted attempts before giving up.
    pub max_probes: usize,
    /// Fail with [`io::ErrorKind::AddrNotAvailable`] instead of accepting a
    /// hint-less mapping once every probe landed low.
    pub strict: bool,
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            threshold: HIGH_ADDRESS,
            max_probes: MAX_PROBES,
            strict: false,
        }
    }
}

/// Where a mapping ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub addr: NonNull<u8>,
    /// Whether `addr` is at or above the threshold.
    pub high: bool,
    /// Number of calls into the OS it took.
    pub probes: usize,
}

/// One platform mapping primitive, driven by [`place`].
pub trait Probe {
    /// Maps at `hint` (`None` lets the OS choose freely).
    ///
    /// Returns `Ok(None)` when the OS rejected the hint because the range is
    /// occupied, so the next hint should be tried.
    fn map(&mut self, hint: Option<NonNull<u8>>) -> io::Result<Option<NonNull<u8>>>;

    /// Discards a mapping returned by [`Probe::map`] that landed too low.
    fn unmap(&mut self, addr: NonNull<u8>);
}

#[inline]
fn is_high(addr: NonNull<u8>, threshold: u64) -> bool {
    addr.as_ptr() as usize as u64 >= threshold
}

/// Runs the probing loop for a mapping of `len` bytes.
///
/// OS errors other than an occupied hint are returned immediately. When
/// every attempt lands below the threshold a final hint-less mapping is
/// returned with `high == false` (and a warning logged), unless the
/// strategy is strict.
pub fn place<P: Probe>(
    strategy: &Strategy,
    len: usize,
    granularity: usize,
    probe: &mut P,
) -> io::Result<Placement> {
    // 32-bit address spaces can't reach the threshold at all.
    let Ok(mut hint) = usize::try_from(strategy.threshold) else {
        let addr = map_anywhere(probe)?;
        return Ok(Placement { addr, high: false, probes: 1 });
    };

    let mut step = align(len.max(1), granularity);

    for attempt in 1..=strategy.max_probes {
        match probe.map(NonNull::new(hint as *mut u8))? {
            Some(addr) if is_high(addr, strategy.threshold) => {
                return Ok(Placement { addr, high: true, probes: attempt });
            }
            Some(addr) => {
                tracing::trace!("probe {attempt}: hint {hint:#x} placed low at {addr:p}");
                probe.unmap(addr);
            }
            None => tracing::trace!("probe {attempt}: hint {hint:#x} occupied"),
        }

        hint = hint.saturating_add(step);
        step = step.saturating_mul(2);
    }

    if strategy.strict {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!(
                "no placement at or above {:#x} after {} probes",
                strategy.threshold, strategy.max_probes
            ),
        ));
    }

    let addr = map_anywhere(probe)?;
    let high = is_high(addr, strategy.threshold);

    if !high {
        tracing::warn!(
            "placement exhausted {} probes, mapping of {len} bytes falls back to {addr:p}",
            strategy.max_probes
        );
    }

    Ok(Placement { addr, high, probes: strategy.max_probes + 1 })
}

fn map_anywhere<P: Probe>(probe: &mut P) -> io::Result<NonNull<u8>> {
    probe.map(None)?.ok_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no free address range")
    })
}



#[cfg(test)]
mod tests {
    use super::*;

    /// Pretends to be an OS that places mappings wherever a script says.
    struct Scripted {
        /// Addresses handed out for hinted calls, in order. `0` means occupied.
        hinted: Vec<usize>,
        anywhere: usize,
        hints: Vec<usize>,
        unmapped: Vec<usize>,
    }

    impl Scripted {
        fn new(hinted: Vec<usize>, anywhere: usize) -> Self {
            Self { hinted, anywhere, hints: Vec::new(), unmapped: Vec::new() }
        }
    }

    impl Probe for Scripted {
        fn map(&mut self, hint: Option<NonNull<u8>>) -> io::Result<Option<NonNull<u8>>> {
            let Some(hint) = hint else {
                return Ok(NonNull::new(self.anywhere as *mut u8));
            };

            self.hints.push(hint.as_ptr() as usize);
            let next = if self.hinted.is_empty() { 0x1000 } else { self.hinted.remove(0) };

            Ok(NonNull::new(next as *mut u8))
        }

        fn unmap(&mut self, addr: NonNull<u8>) {
            self.unmapped.push(addr.as_ptr() as usize);
        }
    }

    fn strategy(max_probes: usize, strict: bool) -> Strategy {
        Strategy { threshold: 1 << 32, max_probes, strict }
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn first_high_attempt_is_accepted() {
        let mut probe = Scripted::new(vec![0x1_0000_0000], 0);
        let placed = place(&strategy(8, false), 4096, 4096, &mut probe).unwrap();

        assert!(placed.high);
        assert_eq!(1, placed.probes);
        assert_eq!(0x1_0000_0000, placed.addr.as_ptr() as usize);
        assert!(probe.unmapped.is_empty());
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn low_attempts_are_unmapped_and_hint_grows() {
        let mut probe = Scripted::new(vec![0x2000, 0, 0x7f00_0000_0000], 0);
        let placed = place(&strategy(8, false), 100, 4096, &mut probe).unwrap();

        assert!(placed.high);
        assert_eq!(3, placed.probes);
        // Only the low mapping needs discarding, the occupied hint never mapped.
        assert_eq!(vec![0x2000], probe.unmapped);
        // Step starts at one granule and doubles.
        assert_eq!(
            vec![0x1_0000_0000, 0x1_0000_1000, 0x1_0000_3000],
            probe.hints
        );
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn exhaustion_falls_back_below_threshold() {
        let mut probe = Scripted::new(Vec::new(), 0x5000);
        let placed = place(&strategy(16, false), 4096, 4096, &mut probe).unwrap();

        assert!(!placed.high);
        assert_eq!(0x5000, placed.addr.as_ptr() as usize);
        assert_eq!(17, placed.probes);
        assert_eq!(16, probe.unmapped.len());
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn exhaustion_fails_when_strict() {
        let mut probe = Scripted::new(Vec::new(), 0x5000);
        let err = place(&strategy(4, true), 4096, 4096, &mut probe).unwrap_err();

        assert_eq!(io::ErrorKind::AddrNotAvailable, err.kind());
        assert_eq!(4, probe.hints.len());
    }

    #[test]
    fn os_errors_are_not_retried() {
        struct Failing(usize);

        impl Probe for Failing {
            fn map(&mut self, _: Option<NonNull<u8>>) -> io::Result<Option<NonNull<u8>>> {
                self.0 += 1;
                Err(io::Error::from(io::ErrorKind::OutOfMemory))
            }

            fn unmap(&mut self, _: NonNull<u8>) {}
        }

        let mut probe = Failing(0);
        let err = place(&Strategy::default(), 4096, 4096, &mut probe).unwrap_err();

        assert_eq!(io::ErrorKind::OutOfMemory, err.kind());
        assert_eq!(1, probe.0);
    }
}
