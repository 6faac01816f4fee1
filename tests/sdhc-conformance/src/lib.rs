//! Shared setup for the driver conformance suites: benches with a card
//! already enumerated, test patterns and log capture.

use std::sync::Arc;
use std::time::Duration;

use sdhc::{Host, HostConfig};
use sdhc_sim::{BenchConfig, CardKind, SimBench, SimConfig, SimController};
use tracing_subscriber::EnvFilter;

pub const BLOCK: usize = 512;

/// Routes driver and simulator logs to the test output. Set RUST_LOG to
/// see them; repeated calls are harmless.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Driver configuration with short timeouts, so fault tests finish quickly
pub fn fast_config() -> HostConfig {
    HostConfig {
        command_timeout: Duration::from_millis(50),
        data_timeout: Duration::from_millis(200),
        ..HostConfig::default()
    }
}

/// One slot holding a card of `kind`, enumerated under `config`
pub fn bench_with(slot: SimConfig, config: HostConfig) -> SimBench {
    init_logging();
    let bench = SimBench::new(BenchConfig::single(slot).host_config(config)).expect("bench");
    let (host, _) = bench.first().expect("slot 0/0");
    host.init_card().expect("card enumerates");
    bench
}

pub fn ready(kind: CardKind) -> SimBench {
    bench_with(SimConfig::with_card(kind), fast_config())
}

pub fn slot(bench: &SimBench) -> (Arc<Host>, Arc<SimController>) {
    let (host, sim) = bench.first().expect("slot 0/0");
    (Arc::clone(host), Arc::clone(sim))
}

/// Bytes that differ per block and per offset, so misplaced blocks show up
pub fn pattern(first_block: u32, blocks: usize) -> Vec<u8> {
    (0..blocks * BLOCK)
        .map(|i| {
            let block = first_block as usize + i / BLOCK;
            (block.wrapping_mul(31) ^ (i % BLOCK)) as u8
        })
        .collect()
}

/// Opcodes the card saw, in order
pub fn opcodes(sim: &SimController) -> Vec<u8> {
    sim.commands().into_iter().map(|(op, _)| op).collect()
}
