use std::thread;
use std::time::{Duration, Instant};

use conformance_helpers::{bench_with, fast_config, init_logging, pattern, ready, slot, BLOCK};
use sdhc::{CardType, Error, HostConfig, HostEvent, SpeedMode};
use sdhc_hw::card::opcode;
use sdhc_sim::{CardKind, Fault, FaultKind, SimBench, SimConfig};

#[test]
fn single_command_crc_error_is_retried() {
    let bench = ready(CardKind::Sdhc);
    let (host, sim) = slot(&bench);
    host.send_data(3, &pattern(3, 1)).unwrap();

    sim.inject_fault(Fault::once(FaultKind::CommandCrc).on(opcode::READ_SINGLE_BLOCK));
    let mut buf = [0u8; BLOCK];
    host.get_data(3, &mut buf).unwrap();
    assert_eq!(&buf[..], &pattern(3, 1)[..]);
    assert_eq!(sim.faults_fired(), 1);
}

#[test]
fn persistent_crc_error_exhausts_the_retries() {
    let bench = ready(CardKind::Sdhc);
    let (host, sim) = slot(&bench);
    let retries = host.config().command_retries;

    sim.inject_fault(Fault::always(FaultKind::CommandCrc).on(opcode::READ_SINGLE_BLOCK));
    let mut buf = [0u8; BLOCK];
    assert_eq!(host.get_data(0, &mut buf), Err(Error::CommandCrc));
    assert_eq!(sim.faults_fired(), retries + 1);

    sim.clear_faults();
    host.get_data(0, &mut buf).unwrap();
}

#[test]
fn data_crc_error_is_retried() {
    let bench = ready(CardKind::Sdhc);
    let (host, sim) = slot(&bench);
    let data = pattern(40, 4);
    host.send_data(40, &data).unwrap();

    sim.inject_fault(Fault::once(FaultKind::DataCrc).on(opcode::READ_MULTIPLE_BLOCK));
    let mut back = vec![0u8; data.len()];
    host.get_data(40, &mut back).unwrap();
    assert_eq!(back, data);
    assert_eq!(sim.faults_fired(), 1);
}

#[test]
fn end_bit_errors_are_not_retried() {
    let bench = ready(CardKind::Sdhc);
    let (host, sim) = slot(&bench);
    sim.inject_fault(Fault::once(FaultKind::DataEndBit).on(opcode::READ_SINGLE_BLOCK));
    let mut buf = [0u8; BLOCK];
    assert_eq!(host.get_data(0, &mut buf), Err(Error::DataEndBit));
    host.get_data(0, &mut buf).unwrap();
}

#[test]
fn stalled_command_times_out_and_recovers() {
    let bench = ready(CardKind::Sdhc);
    let (host, sim) = slot(&bench);
    sim.inject_fault(Fault::once(FaultKind::Stall).on(opcode::READ_SINGLE_BLOCK));
    let mut buf = [0u8; BLOCK];
    host.get_data(0, &mut buf).unwrap();
    assert_eq!(sim.faults_fired(), 1);
}

#[test]
fn missing_completion_times_out_within_the_bound() {
    let bench = ready(CardKind::Sdhc);
    let (host, sim) = slot(&bench);
    let config = host.config().clone();
    sim.inject_fault(Fault::always(FaultKind::Stall).on(opcode::READ_SINGLE_BLOCK));

    let mut buf = [0u8; BLOCK];
    let started = Instant::now();
    assert_eq!(host.get_data(0, &mut buf), Err(Error::CommandTimeout));
    let elapsed = started.elapsed();
    let attempts = config.command_retries + 1;
    assert_eq!(sim.faults_fired(), attempts);
    assert!(elapsed >= config.command_timeout);
    // Each attempt waits one command timeout; recovery adds little on top
    assert!(
        elapsed < config.command_timeout * attempts + Duration::from_secs(1),
        "gave up after {:?}",
        elapsed
    );

    sim.clear_faults();
    host.get_data(0, &mut buf).unwrap();
}

#[test]
fn timeouts_surface_once_retries_run_out() {
    let bench = ready(CardKind::Sdhc);
    let (host, sim) = slot(&bench);
    sim.inject_fault(Fault::always(FaultKind::CommandTimeout).on(opcode::READ_SINGLE_BLOCK));
    let mut buf = [0u8; BLOCK];
    assert_eq!(host.get_data(0, &mut buf), Err(Error::CommandTimeout));

    sim.clear_faults();
    sim.inject_fault(Fault::always(FaultKind::DataTimeout).on(opcode::READ_SINGLE_BLOCK));
    assert_eq!(host.get_data(0, &mut buf), Err(Error::DataTimeout));

    sim.clear_faults();
    host.get_data(0, &mut buf).unwrap();
}

#[test]
fn failed_auto_cmd12_is_reported() {
    let bench = ready(CardKind::Sdhc);
    let (host, sim) = slot(&bench);
    sim.inject_fault(Fault::once(FaultKind::AutoCmd));
    let mut buf = vec![0u8; 4 * BLOCK];
    assert!(matches!(
        host.get_data(0, &mut buf),
        Err(Error::AutoCmd12Failure { .. })
    ));
    host.get_data(0, &mut buf).unwrap();
}

#[test]
fn adma_descriptor_error_is_reported() {
    let bench = ready(CardKind::Sdhc);
    let (host, sim) = slot(&bench);
    sim.inject_fault(Fault::once(FaultKind::Adma).on(opcode::WRITE_MULTIPLE_BLOCK));
    let data = pattern(70, 4);
    assert!(matches!(
        host.send_data(70, &data),
        Err(Error::AdmaDescriptorError { .. })
    ));

    host.send_data(70, &data).unwrap();
    let mut back = vec![0u8; data.len()];
    host.get_data(70, &mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn removal_between_requests() {
    let bench = ready(CardKind::Sdhc);
    let (host, sim) = slot(&bench);
    let events = host.subscribe(64).unwrap();

    let card = sim.remove_card().unwrap();
    assert!(!host.card_present());
    assert!(host.card_info().is_none());
    let mut buf = [0u8; BLOCK];
    assert_eq!(host.get_data(0, &mut buf), Err(Error::CardNotPresent));
    assert!(events.try_iter().any(|e| matches!(e, HostEvent::CardRemoved { controller: 0, slot: 0 })));

    sim.insert(card);
    assert!(host.card_present());
    assert!(events.try_iter().any(|e| matches!(e, HostEvent::CardInserted { .. })));
    // A re-inserted card needs enumerating again
    assert!(host.card_info().is_none());
    assert_eq!(host.init_card().unwrap(), CardType::Sdhc);
    host.get_data(0, &mut buf).unwrap();
}

#[test]
fn removal_during_a_request_invalidates_the_card() {
    let config = HostConfig {
        command_timeout: Duration::from_secs(5),
        ..fast_config()
    };
    let bench = bench_with(SimConfig::with_card(CardKind::Sdhc), config);
    let (host, sim) = slot(&bench);
    sim.inject_fault(Fault::always(FaultKind::Stall).on(opcode::READ_SINGLE_BLOCK));

    let puller = {
        let sim = sim.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            sim.remove_card()
        })
    };
    let mut buf = [0u8; BLOCK];
    assert_eq!(host.get_data(0, &mut buf), Err(Error::CardInvalid));
    assert!(puller.join().unwrap().is_some());
    assert!(host.card_info().is_none());
}

#[test]
fn failed_voltage_switch_powers_the_card_off() {
    init_logging();
    let bench = SimBench::with_card(CardKind::Sdhc).unwrap();
    let (host, sim) = bench.first().unwrap();
    sim.inject_fault(Fault::once(FaultKind::VoltageSwitch));

    assert_eq!(host.init_card(), Err(Error::VoltageSwitch));
    assert!(!sim.bus_powered());
    assert!(host.card_info().is_none());

    assert_eq!(host.init_card().unwrap(), CardType::Sdhc);
    assert_eq!(host.speed_mode(), SpeedMode::Sdr104);
}

#[test]
fn retune_request_runs_tuning_before_the_next_transfer() {
    let bench = ready(CardKind::Sdhc);
    let (host, sim) = slot(&bench);
    assert_eq!(host.tuning_runs(), 1);

    sim.request_retune();
    let mut buf = [0u8; BLOCK];
    host.get_data(0, &mut buf).unwrap();
    assert_eq!(host.tuning_runs(), 2);
    assert_eq!(sim.tuning_runs(), 2);
}

#[test]
fn one_failed_retune_is_retried() {
    let bench = ready(CardKind::Emmc);
    let (host, sim) = slot(&bench);
    sim.inject_fault(Fault::once(FaultKind::Tuning));
    sim.request_retune();

    let mut buf = [0u8; BLOCK];
    host.get_data(0, &mut buf).unwrap();
    assert_eq!(sim.faults_fired(), 1);
    assert_eq!(host.tuning_runs(), 2);
    assert_eq!(host.speed_mode(), SpeedMode::Hs200);
}

#[test]
fn retuning_that_keeps_failing_demotes_the_bus() {
    let bench = ready(CardKind::Sdhc);
    let (host, sim) = slot(&bench);
    sim.inject_fault(Fault::always(FaultKind::Tuning));
    sim.request_retune();

    let data = pattern(9, 2);
    host.send_data(9, &data).unwrap();
    assert_eq!(host.speed_mode(), SpeedMode::Sdr50);
    assert_eq!(sim.faults_fired(), host.config().retune_attempts);

    let mut back = vec![0u8; data.len()];
    host.get_data(9, &mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn sdr104_tuning_failure_at_enumeration_falls_back_to_sdr50() {
    init_logging();
    let bench = SimBench::with_card(CardKind::Sdhc).unwrap();
    let (host, sim) = bench.first().unwrap();
    sim.inject_fault(Fault::always(FaultKind::Tuning));

    assert_eq!(host.init_card().unwrap(), CardType::Sdhc);
    assert_eq!(host.speed_mode(), SpeedMode::Sdr50);
    assert_eq!(host.tuning_runs(), 0);
}
