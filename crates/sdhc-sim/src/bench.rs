//! A complete board: simulated controllers with a driver [`Host`] on every
//! slot, collected in a [`HostRegistry`] whose interrupt entry is wired to
//! each controller's IRQ line.

use std::sync::{Arc, Weak};

use sdhc::{Host, HostConfig, HostRegistry};
use tracing::{debug, info};

use crate::config::{CardKind, SimConfig};
use crate::controller::SimController;
use crate::dma::SimDma;

/// Board layout: one list of slots per controller
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub controllers: Vec<Vec<SimConfig>>,
    /// Driver configuration shared by every slot
    pub host: HostConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self::single(SimConfig::with_card(CardKind::Sdhc))
    }
}

impl BenchConfig {
    /// One controller with one slot
    pub fn single(slot: SimConfig) -> Self {
        Self {
            controllers: vec![vec![slot]],
            host: HostConfig::default(),
        }
    }

    pub fn host_config(mut self, host: HostConfig) -> Self {
        self.host = host;
        self
    }

    /// Adds a controller with the given slots
    pub fn controller(mut self, slots: Vec<SimConfig>) -> Self {
        self.controllers.push(slots);
        self
    }
}

struct Slot {
    sim: Arc<SimController>,
    dma: Arc<SimDma>,
}

pub struct SimBench {
    registry: Arc<HostRegistry>,
    slots: Vec<Vec<Slot>>,
}

impl SimBench {
    pub fn new(config: BenchConfig) -> Result<Self, String> {
        if config.controllers.iter().all(Vec::is_empty) {
            return Err("bench needs at least one slot".to_string());
        }

        let mut builder = HostRegistry::builder();
        let mut slots = Vec::with_capacity(config.controllers.len());
        for (c, controller) in config.controllers.iter().enumerate() {
            let mut row = Vec::with_capacity(controller.len());
            for (s, sim_config) in controller.iter().enumerate() {
                let dma = Arc::new(SimDma::new());
                let sim = SimController::new(sim_config, Arc::clone(&dma))
                    .map(Arc::new)
                    .map_err(|e| format!("Failed to create slot {}/{}: {}", c, s, e))?;
                let host = Host::new(c, s, sim.clone(), dma.clone(), config.host.clone())
                    .map_err(|e| format!("Failed to bring up host {}/{}: {}", c, s, e))?;
                debug!("Slot {}/{}: card {:?}", c, s, sim_config.card.as_ref().map(|card| card.kind));
                builder = builder.host(c, s, Arc::new(host));
                row.push(Slot { sim, dma });
            }
            slots.push(row);
        }

        let registry = Arc::new(builder.build());
        for (c, row) in slots.iter().enumerate() {
            for (s, slot) in row.iter().enumerate() {
                let weak: Weak<HostRegistry> = Arc::downgrade(&registry);
                slot.sim.connect_irq(move || {
                    if let Some(registry) = weak.upgrade() {
                        registry.irq_handler(c, s);
                    }
                });
            }
        }
        info!(
            "Bench ready: {} controller(s), {} slot(s)",
            slots.len(),
            slots.iter().map(Vec::len).sum::<usize>()
        );

        Ok(Self { registry, slots })
    }

    /// One controller, one slot holding a fresh card of `kind`
    pub fn with_card(kind: CardKind) -> Result<Self, String> {
        Self::new(BenchConfig::single(SimConfig::with_card(kind)))
    }

    pub fn registry(&self) -> &Arc<HostRegistry> {
        &self.registry
    }

    pub fn host(&self, controller: usize, slot: usize) -> sdhc::Result<&Arc<Host>> {
        self.registry.host(controller, slot)
    }

    /// The simulated controller behind a slot
    pub fn sim(&self, controller: usize, slot: usize) -> Option<&Arc<SimController>> {
        self.slots.get(controller)?.get(slot).map(|s| &s.sim)
    }

    pub fn dma(&self, controller: usize, slot: usize) -> Option<&Arc<SimDma>> {
        self.slots.get(controller)?.get(slot).map(|s| &s.dma)
    }

    /// Host and controller of slot 0 on controller 0
    pub fn first(&self) -> Result<(&Arc<Host>, &Arc<SimController>), String> {
        let host = self.host(0, 0).map_err(|e| e.to_string())?;
        let sim = self.sim(0, 0).ok_or("bench has no slot 0/0")?;
        Ok((host, sim))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CardConfig;

    #[test]
    fn empty_board_is_rejected() {
        let config = BenchConfig {
            controllers: vec![vec![]],
            host: HostConfig::default(),
        };
        assert!(SimBench::new(config).is_err());
    }

    #[test]
    fn every_slot_gets_a_host() {
        let config = BenchConfig::single(SimConfig::with_card(CardKind::Sdhc))
            .controller(vec![SimConfig::empty_slot(), SimConfig::with_card(CardKind::Emmc)]);
        let bench = SimBench::new(config).unwrap();
        assert_eq!(bench.registry().controller_count(), 2);
        assert_eq!(bench.registry().slot_count(1), 2);
        assert!(bench.host(0, 0).unwrap().card_present());
        assert!(!bench.host(1, 0).unwrap().card_present());
        assert!(bench.sim(1, 1).is_some());
        assert!(bench.sim(2, 0).is_none());
    }

    #[test]
    fn insertion_reaches_the_host_through_the_irq_line() {
        let bench = SimBench::new(BenchConfig::single(SimConfig::empty_slot())).unwrap();
        let (host, sim) = bench.first().unwrap();
        assert!(!host.card_present());
        sim.insert_card(CardConfig::new(CardKind::Sdsc)).unwrap();
        assert!(host.card_present());
        sim.remove_card();
        assert!(!host.card_present());
    }
}
