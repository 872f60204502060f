use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{Autoconf, AutoconfError, Locator, PdevAttach, RegistryError};

/// Default number of provider descriptors a registry holds.
pub const DEFAULT_MAX_PDEVS: usize = 128;

/// Name of the root bus pseudo-devices attach below.
pub const ROOT_BUS: &str = "mainbus";

/// One synthetic attach point. A descriptor without an attach function terminates the table.
#[derive(Clone)]
pub struct PdevDescriptor {
    attach: Option<Arc<dyn PdevAttach>>,
    units: u32,
}

impl core::fmt::Debug for PdevDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PdevDescriptor")
            .field("attach", &self.attach.as_ref().map(|a| a.name().to_string()))
            .field("units", &self.units)
            .finish()
    }
}

impl PdevDescriptor {
    const SENTINEL: Self = Self {
        attach: None,
        units: 0,
    };

    pub fn attach(&self) -> Option<&Arc<dyn PdevAttach>> {
        self.attach.as_ref()
    }

    pub fn units(&self) -> u32 {
        self.units
    }

    pub fn is_sentinel(&self) -> bool {
        self.attach.is_none()
    }
}

/// Collects pseudo-device descriptors during the cold boot phase.
///
/// Once [PdevRegistry::finalize] has run the registry is gone, so registering late or finalizing
/// twice cannot be expressed.
#[derive(Debug)]
pub struct PdevRegistry {
    descs: Vec<PdevDescriptor>,
    capacity: usize,
}

impl Default for PdevRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PDEVS)
    }
}

impl PdevRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            descs: Vec::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Register `units` instances of `attach`.
    pub fn register(
        &mut self,
        attach: Arc<dyn PdevAttach>,
        units: u32,
    ) -> Result<(), RegistryError> {
        if self.descs.len() >= self.capacity {
            return Err(RegistryError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        debug!("registering pseudo-device {} x{}", attach.name(), units);
        self.descs.push(PdevDescriptor {
            attach: Some(attach),
            units,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.descs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Terminate the descriptor list and close the registry.
    pub fn finalize(mut self) -> PdevTable {
        self.descs.push(PdevDescriptor::SENTINEL);
        PdevTable { descs: self.descs }
    }
}

/// A closed, sentinel-terminated descriptor table.
#[derive(Debug)]
pub struct PdevTable {
    descs: Vec<PdevDescriptor>,
}

/// What a root search did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AttachSummary {
    pub attached: usize,
    pub unmatched: usize,
    pub failed: usize,
}

impl PdevTable {
    /// The raw table, sentinel included.
    pub fn descriptors(&self) -> &[PdevDescriptor] {
        &self.descs
    }

    /// Provider descriptors in registration order, stopping at the sentinel.
    pub fn iter(&self) -> impl Iterator<Item = &PdevDescriptor> {
        self.descs.iter().take_while(|d| !d.is_sentinel())
    }

    /// Attach the root bus and search it: every descriptor is offered once per unit, in
    /// registration order.
    ///
    /// A unit that fails to attach is logged and skipped, as a failed match would be. Only a
    /// missing root bus fails the search.
    pub fn attach_root(self, engine: &mut dyn Autoconf) -> Result<AttachSummary, AutoconfError> {
        let root = engine.found_root(ROOT_BUS)?;
        let mut summary = AttachSummary::default();

        for desc in self.iter() {
            let Some(attach) = desc.attach() else {
                break;
            };
            for unit in 0..desc.units {
                match engine.found(root, attach, Locator { unit }) {
                    Ok(Some(_)) => summary.attached += 1,
                    Ok(None) => summary.unmatched += 1,
                    Err(e) => {
                        warn!("{}", e);
                        summary.failed += 1;
                    }
                }
            }
        }

        info!(
            "{}: {} pseudo-devices attached ({} unmatched, {} failed)",
            ROOT_BUS, summary.attached, summary.unmatched, summary.failed
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{attach_fn, DeviceRef, SimpleAutoconf};

    fn recorder(name: &'static str, log: Arc<Mutex<Vec<(String, u32)>>>) -> Arc<dyn PdevAttach> {
        attach_fn(name, move |_, loc| {
            log.lock().unwrap().push((name.to_string(), loc.unit));
            Ok(())
        })
    }

    #[test]
    fn two_providers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = PdevRegistry::default();
        reg.register(recorder("vnd", log.clone()), 3).unwrap();
        reg.register(recorder("cgd", log.clone()), 1).unwrap();
        let table = reg.finalize();

        let mut ac = SimpleAutoconf::new();
        let summary = table.attach_root(&mut ac).unwrap();
        assert_eq!(summary.attached, 4);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                ("vnd".to_string(), 0),
                ("vnd".to_string(), 1),
                ("vnd".to_string(), 2),
                ("cgd".to_string(), 0),
            ]
        );

        let root = DeviceRef(0);
        assert_eq!(ac.device(root).unwrap().name, "mainbus0");
        let names: Vec<_> = ac.children(root).map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["vnd0", "vnd1", "vnd2", "cgd0"]);
    }

    #[test]
    fn ordering_and_sentinel() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = PdevRegistry::new(4);
        for name in ["a", "b", "c"] {
            reg.register(recorder(name, log.clone()), 1).unwrap();
        }
        let table = reg.finalize();
        let order: Vec<_> = table
            .iter()
            .map(|d| d.attach().unwrap().name().to_string())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);

        let descs = table.descriptors();
        assert_eq!(descs.len(), 4);
        assert_eq!(descs.iter().filter(|d| d.is_sentinel()).count(), 1);
        assert!(descs.last().unwrap().is_sentinel());
    }

    #[test]
    fn empty_registry() {
        let table = PdevRegistry::default().finalize();
        assert_eq!(table.descriptors().len(), 1);
        let mut ac = SimpleAutoconf::new();
        let summary = table.attach_root(&mut ac).unwrap();
        assert_eq!(summary, AttachSummary::default());
        assert_eq!(ac.devices().len(), 1);
    }

    #[test]
    fn capacity() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = PdevRegistry::new(1);
        reg.register(recorder("a", log.clone()), 1).unwrap();
        assert_eq!(
            reg.register(recorder("b", log), 1),
            Err(RegistryError::CapacityExceeded { capacity: 1 })
        );
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn failures_do_not_stop_search() {
        let mut reg = PdevRegistry::default();
        reg.register(
            attach_fn("bad", |_, loc| {
                if loc.unit == 1 {
                    Err(AutoconfError::AttachFailed {
                        name: "bad".into(),
                        unit: 1,
                        reason: "no backing".into(),
                    })
                } else {
                    Ok(())
                }
            }),
            3,
        )
        .unwrap();
        let mut ac = SimpleAutoconf::new();
        let summary = reg.finalize().attach_root(&mut ac).unwrap();
        assert_eq!(
            summary,
            AttachSummary {
                attached: 2,
                unmatched: 0,
                failed: 1
            }
        );
    }

    #[test]
    fn independent_instances() {
        let log_a = Arc::new(Mutex::new(Vec::new()));
        let log_b = Arc::new(Mutex::new(Vec::new()));
        let mut a = PdevRegistry::default();
        let mut b = PdevRegistry::default();
        a.register(recorder("x", log_a.clone()), 2).unwrap();
        b.register(recorder("y", log_b.clone()), 1).unwrap();

        let (mut ac_a, mut ac_b) = (SimpleAutoconf::new(), SimpleAutoconf::new());
        a.finalize().attach_root(&mut ac_a).unwrap();
        b.finalize().attach_root(&mut ac_b).unwrap();
        assert_eq!(log_a.lock().unwrap().len(), 2);
        assert_eq!(log_b.lock().unwrap().len(), 1);
        assert_eq!(ac_b.devices().len(), 2);
    }
}
