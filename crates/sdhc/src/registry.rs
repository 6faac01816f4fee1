//! Fixed map from (controller, slot) to host, built once at start-up. The
//! platform's interrupt vector calls [`HostRegistry::irq_handler`].

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::trace;

use crate::error::{Error, Result};
use crate::host::Host;

pub struct HostRegistry {
    hosts: BTreeMap<(usize, usize), Arc<Host>>,
}

#[derive(Default)]
pub struct HostRegistryBuilder {
    hosts: BTreeMap<(usize, usize), Arc<Host>>,
}

impl HostRegistryBuilder {
    /// Adds a slot. A later entry for the same slot replaces the earlier one.
    pub fn host(mut self, controller: usize, slot: usize, host: Arc<Host>) -> Self {
        self.hosts.insert((controller, slot), host);
        self
    }

    pub fn build(self) -> HostRegistry {
        HostRegistry { hosts: self.hosts }
    }
}

impl HostRegistry {
    pub fn builder() -> HostRegistryBuilder {
        HostRegistryBuilder::default()
    }

    /// Interrupt entry for one slot. Unknown slots are ignored; returns
    /// whether a host handled the interrupt.
    pub fn irq_handler(&self, controller: usize, slot: usize) -> bool {
        match self.hosts.get(&(controller, slot)) {
            Some(host) => {
                host.handle_interrupt();
                true
            }
            None => {
                trace!(controller, slot, "interrupt for unregistered slot");
                false
            }
        }
    }

    pub fn host(&self, controller: usize, slot: usize) -> Result<&Arc<Host>> {
        self.hosts
            .get(&(controller, slot))
            .ok_or(Error::NoSuchHost { controller, slot })
    }

    /// Number of distinct controllers
    pub fn controller_count(&self) -> usize {
        let mut last = None;
        let mut count = 0;
        for (controller, _) in self.hosts.keys() {
            if last != Some(*controller) {
                count += 1;
                last = Some(*controller);
            }
        }
        count
    }

    /// Slots registered for `controller`
    pub fn slot_count(&self, controller: usize) -> usize {
        self.hosts.range((controller, 0)..=(controller, usize::MAX)).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, &Arc<Host>)> {
        self.hosts.iter().map(|(&(c, s), h)| (c, s, h))
    }
}
