//! Interface descriptor resolution
//!
//! The host either hands over a descriptor it already owns
//! ([`FixedResolver`]) or lets the engine scan a descriptor range with a
//! platform probe ([`ScanResolver`]).

use std::ops::RangeInclusive;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use tracing::{debug, info};

use crate::common::Result;
use crate::error::Error;

use super::{FdDevice, TunDevice};

/// Raw OS handle of the virtual interface
pub type Descriptor = RawFd;

/// Default descriptor scan range
pub const DEFAULT_SCAN_RANGE: RangeInclusive<Descriptor> = 0..=1023;

/// Finds the interface descriptor and opens a device on it
pub trait InterfaceResolver: Send + Sync {
    /// Locate the descriptor. Fails with `NetworkUnavailable` when none is
    /// found.
    fn resolve(&self) -> Result<Descriptor>;

    /// Open a device over `descriptor`. Must run inside a tokio runtime.
    fn open(&self, descriptor: Descriptor, packet_info: bool) -> Result<Arc<dyn TunDevice>> {
        Ok(Arc::new(FdDevice::new(descriptor, packet_info)?))
    }
}

/// A descriptor supplied by the host
#[derive(Debug, Clone, Copy)]
pub struct FixedResolver(pub Descriptor);

impl InterfaceResolver for FixedResolver {
    fn resolve(&self) -> Result<Descriptor> {
        if self.0 < 0 {
            return Err(Error::NetworkUnavailable(format!("invalid descriptor {}", self.0)));
        }
        Ok(self.0)
    }
}

/// Decides whether a descriptor is the tunnel interface
pub trait DescriptorProbe: Send + Sync {
    fn probe(&self, descriptor: Descriptor) -> bool;
}

impl<F> DescriptorProbe for F
where
    F: Fn(Descriptor) -> bool + Send + Sync,
{
    fn probe(&self, descriptor: Descriptor) -> bool {
        self(descriptor)
    }
}

/// Scans a bounded descriptor range, first match wins
pub struct ScanResolver<P> {
    probe: P,
    range: RangeInclusive<Descriptor>,
}

impl<P: DescriptorProbe> ScanResolver<P> {
    pub fn new(probe: P) -> Self {
        Self::with_range(probe, DEFAULT_SCAN_RANGE)
    }

    pub fn with_range(probe: P, range: RangeInclusive<Descriptor>) -> Self {
        Self { probe, range }
    }
}

impl<P: DescriptorProbe> InterfaceResolver for ScanResolver<P> {
    fn resolve(&self) -> Result<Descriptor> {
        debug!("Scanning descriptors {:?}", self.range);
        match self.range.clone().find(|fd| self.probe.probe(*fd)) {
            Some(fd) => {
                info!("Found interface descriptor {}", fd);
                Ok(fd)
            }
            None => Err(Error::NetworkUnavailable(format!(
                "no interface descriptor in {:?}",
                self.range
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_scan_finds_first_match() {
        let resolver = ScanResolver::new(|fd: Descriptor| fd == 17 || fd == 40);
        assert_eq!(resolver.resolve().unwrap(), 17);
    }

    #[test]
    fn test_scan_none_is_network_unavailable() {
        let resolver = ScanResolver::new(|_: Descriptor| false);
        let err = resolver.resolve().unwrap_err();
        assert!(matches!(err, Error::NetworkUnavailable(_)));
        assert_eq!(err.exit_code(), -1);
    }

    #[test]
    fn test_scan_is_bounded() {
        let probes = AtomicUsize::new(0);
        let resolver = ScanResolver::with_range(
            |_: Descriptor| {
                probes.fetch_add(1, Ordering::Relaxed);
                false
            },
            3..=9,
        );
        assert!(resolver.resolve().is_err());
        assert_eq!(probes.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn test_fixed_resolver() {
        assert_eq!(FixedResolver(5).resolve().unwrap(), 5);
        assert!(matches!(
            FixedResolver(-1).resolve(),
            Err(Error::NetworkUnavailable(_))
        ));
    }
}
