//! Kernel object namespacing.
//!
//! Kernel components that are loaded into a host process must not let their global symbols
//! collide with the host's own. Before a relocatable object is linked, its symbol table is
//! rewritten so that every global name lives under a private prefix (e.g. `malloc` becomes
//! `rumpns_malloc`), while local symbols and configured exemptions keep their names.
//!
//! The core operation is [renamespace], which works over a slice of [SymbolEntry] and an owned
//! [StringTable]. [RelocatableObject] wraps the same operation for ELF images.

pub mod error;
pub mod exempt;
pub mod object;
pub mod rename;
pub mod strtab;
pub mod symbol;

pub use error::*;
pub use exempt::ExemptionSet;
pub use object::RelocatableObject;
pub use rename::renamespace;
pub use strtab::{StringTable, StrtabCursor};
pub use symbol::{Binding, SymbolEntry, SymbolPayload};
