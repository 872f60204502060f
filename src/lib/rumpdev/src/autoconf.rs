//! The seam to the autoconfiguration engine.
//!
//! The engine that matches and attaches drivers is shared with hardware buses and lives outside
//! this crate. It is reached through [Autoconf]. [SimpleAutoconf] is a minimal engine that records
//! the resulting device tree, for hosts that do not bring their own.
use std::sync::Arc;

use tracing::debug;

use crate::AutoconfError;

/// A node in the autoconf device tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceRef(pub u32);

/// Where a pseudo-device sits on its bus. The unit index is the only locator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Locator {
    pub unit: u32,
}

/// A pseudo-device attach point.
pub trait PdevAttach: Send + Sync {
    /// Driver name, used for the instance name (`name` followed by the unit number).
    fn name(&self) -> &str;

    /// Pseudo-devices match unconditionally unless they say otherwise.
    fn matches(&self, _parent: DeviceRef, _loc: &Locator) -> bool {
        true
    }

    fn attach(&self, parent: DeviceRef, loc: &Locator) -> Result<(), AutoconfError>;
}

struct FnAttach<F> {
    name: String,
    f: F,
}

impl<F> PdevAttach for FnAttach<F>
where
    F: Fn(DeviceRef, &Locator) -> Result<(), AutoconfError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&self, parent: DeviceRef, loc: &Locator) -> Result<(), AutoconfError> {
        (self.f)(parent, loc)
    }
}

/// Build an attach point from a closure.
pub fn attach_fn<F>(name: impl ToString, f: F) -> Arc<dyn PdevAttach>
where
    F: Fn(DeviceRef, &Locator) -> Result<(), AutoconfError> + Send + Sync + 'static,
{
    Arc::new(FnAttach {
        name: name.to_string(),
        f,
    })
}

/// The match/attach primitives a bus search is built from.
pub trait Autoconf {
    /// Find and attach the root bus called `name`.
    fn found_root(&mut self, name: &str) -> Result<DeviceRef, AutoconfError>;

    /// Offer `attach` at `loc` below `parent`. Returns the new device if it matched and attached,
    /// or None if it did not match.
    fn found(
        &mut self,
        parent: DeviceRef,
        attach: &Arc<dyn PdevAttach>,
        loc: Locator,
    ) -> Result<Option<DeviceRef>, AutoconfError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceNode {
    pub name: String,
    pub parent: Option<DeviceRef>,
    pub unit: u32,
}

/// An autoconf engine that attaches whatever matches and remembers the tree.
#[derive(Default, Debug)]
pub struct SimpleAutoconf {
    nodes: Vec<DeviceNode>,
}

impl SimpleAutoconf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn devices(&self) -> &[DeviceNode] {
        &self.nodes
    }

    pub fn device(&self, dev: DeviceRef) -> Option<&DeviceNode> {
        self.nodes.get(dev.0 as usize)
    }

    pub fn children(&self, parent: DeviceRef) -> impl Iterator<Item = &DeviceNode> {
        self.nodes
            .iter()
            .filter(move |n| n.parent == Some(parent))
    }

    fn push(&mut self, node: DeviceNode) -> DeviceRef {
        let dev = DeviceRef(self.nodes.len() as u32);
        debug!("attached {} as {:?}", node.name, dev);
        self.nodes.push(node);
        dev
    }
}

impl Autoconf for SimpleAutoconf {
    fn found_root(&mut self, name: &str) -> Result<DeviceRef, AutoconfError> {
        if let Some(idx) = self
            .nodes
            .iter()
            .position(|n| n.parent.is_none() && n.name == format!("{}0", name))
        {
            return Ok(DeviceRef(idx as u32));
        }
        Ok(self.push(DeviceNode {
            name: format!("{}0", name),
            parent: None,
            unit: 0,
        }))
    }

    fn found(
        &mut self,
        parent: DeviceRef,
        attach: &Arc<dyn PdevAttach>,
        loc: Locator,
    ) -> Result<Option<DeviceRef>, AutoconfError> {
        if self.device(parent).is_none() {
            return Err(AutoconfError::AttachFailed {
                name: attach.name().to_string(),
                unit: loc.unit,
                reason: format!("no parent device {:?}", parent),
            });
        }
        if !attach.matches(parent, &loc) {
            return Ok(None);
        }
        attach.attach(parent, &loc)?;
        Ok(Some(self.push(DeviceNode {
            name: format!("{}{}", attach.name(), loc.unit),
            parent: Some(parent),
            unit: loc.unit,
        })))
    }
}
