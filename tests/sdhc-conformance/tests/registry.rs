use std::thread;
use std::time::Duration;

use conformance_helpers::{fast_config, init_logging, pattern, BLOCK};
use sdhc::{AutoCmd, CardType, Command, Error, HostEvent, ResponseType, TransferMode};
use sdhc_hw::card::{opcode, state};
use sdhc_sim::{BenchConfig, CardKind, SimBench, SimConfig};

/// Controller 0 has one SD slot; controller 1 has an eMMC slot and an
/// empty one
fn board() -> SimBench {
    init_logging();
    let config = BenchConfig::single(SimConfig::with_card(CardKind::Sdhc))
        .controller(vec![SimConfig::with_card(CardKind::Emmc), SimConfig::empty_slot()])
        .host_config(fast_config());
    let bench = SimBench::new(config).unwrap();
    for (c, s, host) in bench.registry().iter() {
        if bench.sim(c, s).unwrap().card_present() {
            host.init_card().unwrap();
        }
    }
    bench
}

#[test]
fn registry_layout() {
    let bench = board();
    let registry = bench.registry();
    assert_eq!(registry.controller_count(), 2);
    assert_eq!(registry.slot_count(0), 1);
    assert_eq!(registry.slot_count(1), 2);
    assert_eq!(registry.iter().count(), 3);

    assert_eq!(registry.card_type(0, 0).unwrap(), CardType::Sdhc);
    assert_eq!(registry.card_type(1, 0).unwrap(), CardType::EmmcHc);
    assert!(!registry.is_card_initialized(1, 1));
    assert!(registry.card_type(1, 1).is_err());
}

#[test]
fn unknown_slots_are_reported() {
    let bench = board();
    let registry = bench.registry();
    assert!(!registry.irq_handler(9, 9));
    assert!(registry.irq_handler(0, 0));
    assert!(matches!(
        registry.host(9, 9),
        Err(Error::NoSuchHost { controller: 9, slot: 9 })
    ));
    let mut buf = [0u8; BLOCK];
    assert!(matches!(
        registry.get_data(0, 7, 0, &mut buf),
        Err(Error::NoSuchHost { controller: 0, slot: 7 })
    ));
}

#[test]
fn facade_moves_data_per_slot() {
    let bench = board();
    let registry = bench.registry();
    let sd = pattern(1, 2);
    let emmc = pattern(2, 2);
    assert_eq!(registry.send_data(0, 0, 100, &sd).unwrap(), sd.len());
    assert_eq!(registry.send_data(1, 0, 100, &emmc).unwrap(), emmc.len());

    let mut back = vec![0u8; sd.len()];
    registry.get_data(0, 0, 100, &mut back).unwrap();
    assert_eq!(back, sd);
    registry.get_data(1, 0, 100, &mut back).unwrap();
    assert_eq!(back, emmc);

    assert_eq!(
        registry.send_data(1, 1, 0, &[0u8; BLOCK]),
        Err(Error::CardNotPresent)
    );
}

#[test]
fn facade_configures_the_bus() {
    let bench = board();
    let registry = bench.registry();
    registry.set_transfer_mode(1, 0, TransferMode::Pio).unwrap();
    registry.set_auto_cmd(1, 0, AutoCmd::Cmd23).unwrap();
    let info = registry.get_bus_info(1, 0).unwrap();
    assert_eq!(info.transfer_mode, TransferMode::Pio);
    assert_eq!(info.auto_cmd, AutoCmd::Cmd23);
    // Other slots keep their own settings
    assert_eq!(registry.get_bus_info(0, 0).unwrap().transfer_mode, TransferMode::Adma2);

    registry.stop_at_block(1, 0, Some(1)).unwrap();
    let mut buf = vec![0u8; 4 * BLOCK];
    assert_eq!(registry.get_data(1, 0, 0, &mut buf).unwrap(), BLOCK);
}

#[test]
fn raw_command_through_the_facade() {
    let bench = board();
    let registry = bench.registry();
    let rca = registry.host(0, 0).unwrap().card_info().unwrap().rca_arg();
    let response = registry
        .send_command(0, 0, &Command::new(opcode::SEND_STATUS, rca, ResponseType::R1))
        .unwrap();
    assert_eq!(response.card_status().current_state(), state::TRANSFER);
}

#[test]
fn one_listener_per_slot() {
    let bench = board();
    let registry = bench.registry();
    let _events = registry.register_listener(0, 0, 16).unwrap();
    assert!(matches!(
        registry.register_listener(0, 0, 16),
        Err(Error::ListenerRegistered)
    ));
    // Another slot takes its own listener
    registry.register_listener(1, 0, 16).unwrap();
}

#[test]
fn insertion_and_removal_events_name_their_slot() {
    let bench = board();
    let registry = bench.registry();
    let events = registry.register_listener(1, 1, 16).unwrap();
    let sim = bench.sim(1, 1).unwrap();

    sim.insert_card(sdhc_sim::CardConfig::new(CardKind::Sdsc)).unwrap();
    let inserted = events.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(matches!(inserted, HostEvent::CardInserted { controller: 1, slot: 1 }));
    assert_eq!(registry.host(1, 1).unwrap().init_card().unwrap(), CardType::Sd);

    sim.remove_card().unwrap();
    let removed = events.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(matches!(removed, HostEvent::CardRemoved { controller: 1, slot: 1 }));
    assert!(!registry.is_card_initialized(1, 1));
}

#[test]
fn slots_work_in_parallel() {
    let bench = board();
    let registry = bench.registry().clone();
    let workers: Vec<_> = [(0usize, 0usize), (1, 0)]
        .into_iter()
        .map(|(c, s)| {
            let registry = registry.clone();
            thread::spawn(move || {
                for round in 0..8u32 {
                    let data = pattern(round, 3);
                    registry.send_data(c, s, round * 8, &data).unwrap();
                    let mut back = vec![0u8; data.len()];
                    registry.get_data(c, s, round * 8, &mut back).unwrap();
                    assert_eq!(back, data);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
}
