//! Pseudo-device attachment for kernel instances hosted in a process.
//!
//! There is no hardware to discover, so providers register synthetic attach points during boot
//! with a [PdevRegistry]. Finalizing the registry yields a [PdevTable], which is then searched
//! exactly the way a real bus's device list would be: the root bus is found unconditionally and
//! every descriptor is offered to the autoconfiguration engine once per unit, with the unit index
//! standing in for the locators (address, irq, ...) a real bus would supply.
//!
//! The registry is an ordinary value owned by the boot sequence, so several independent kernel
//! instances can boot side by side in one process.

pub mod autoconf;
pub mod error;
pub mod registry;

pub use autoconf::{attach_fn, Autoconf, DeviceNode, DeviceRef, Locator, PdevAttach, SimpleAutoconf};
pub use error::*;
pub use registry::{AttachSummary, PdevDescriptor, PdevRegistry, PdevTable, DEFAULT_MAX_PDEVS, ROOT_BUS};
