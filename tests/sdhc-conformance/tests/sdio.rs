use std::time::Duration;

use conformance_helpers::{ready, slot, BLOCK};
use sdhc::{CardType, Error, HostEvent};
use sdhc_hw::card::cccr;
use sdhc_sim::CardKind;

#[test]
fn sdio_card_enumerates_with_one_function() {
    let bench = ready(CardKind::Sdio);
    let (host, _) = slot(&bench);
    let card = host.card_info().unwrap();
    assert_eq!(card.card_type, CardType::Sdio);
    let info = card.sdio.unwrap();
    assert_eq!(info.functions, 1);
    assert!(!info.memory_present);
    assert_eq!(info.manufacturer, 0x0296);
    assert!(!host.cis().unwrap().is_empty());

    assert_eq!(host.read_sdio_register(0, cccr::REVISION).unwrap(), 0x43);
}

#[test]
fn function_registers_read_back() {
    let bench = ready(CardKind::Sdio);
    let (host, _) = slot(&bench);
    assert_eq!(host.write_sdio_register(1, 0x80, 0xA5).unwrap(), 0xA5);
    assert_eq!(host.read_sdio_register(1, 0x80).unwrap(), 0xA5);
    // Function 2 does not exist
    assert!(host.read_sdio_register(2, 0).is_err());
}

#[test]
fn extended_transfers_in_block_and_byte_mode() {
    let bench = ready(CardKind::Sdio);
    let (host, sim) = slot(&bench);
    host.enable_sdio_function(1, true).unwrap();
    host.set_sdio_block_size(1, 64).unwrap();
    assert_eq!(host.card_info().unwrap().sdio.unwrap().block_sizes[1], 64);

    // Fifteen 64-byte blocks plus a 40-byte tail in byte mode
    let data: Vec<u8> = (0..1000u32).map(|i| (i * 7) as u8).collect();
    host.write_sdio(1, 0x400, true, &data).unwrap();
    let stored = sim.with_card(|c| c.sdio_memory().map(|m| m[0x400..0x400 + data.len()].to_vec())).flatten();
    assert_eq!(stored.as_deref(), Some(&data[..]));

    let mut back = vec![0u8; data.len()];
    host.read_sdio(1, 0x400, true, &mut back).unwrap();
    assert_eq!(back, data);

    host.enable_sdio_function(1, false).unwrap();
    assert_eq!(host.read_sdio_register(0, cccr::IO_ENABLE).unwrap() & 0b10, 0);
}

#[test]
fn fixed_address_reads_repeat_one_byte() {
    let bench = ready(CardKind::Sdio);
    let (host, _) = slot(&bench);
    host.write_sdio_register(1, 0x10, 0x3C).unwrap();
    let mut buf = [0u8; 16];
    host.read_sdio(1, 0x10, false, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0x3C));
}

#[test]
fn card_interrupt_reaches_the_listener() {
    let bench = ready(CardKind::Sdio);
    let (host, sim) = slot(&bench);
    let events = host.subscribe(256).unwrap();

    // Nothing is asserted while the interrupt is disabled
    assert!(!sim.raise_function_interrupt(1));
    sim.clear_function_interrupt(1);

    host.enable_sdio_interrupt(1, true).unwrap();
    assert_ne!(host.read_sdio_register(0, cccr::INT_ENABLE).unwrap() & cccr::INT_MASTER, 0);
    assert!(sim.raise_function_interrupt(1));

    let event = events.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(matches!(event, HostEvent::CardInterrupt { controller: 0, slot: 0 }));
    assert_eq!(host.sdio_pending_interrupts().unwrap(), 0b10);

    sim.clear_function_interrupt(1);
    assert_eq!(host.sdio_pending_interrupts().unwrap(), 0);

    host.enable_sdio_interrupt(1, false).unwrap();
    assert_eq!(host.read_sdio_register(0, cccr::INT_ENABLE).unwrap(), 0);
}

#[test]
fn function_selection_is_bounded() {
    let bench = ready(CardKind::Sdio);
    let (host, _) = slot(&bench);
    host.select_sdio_function(1).unwrap();
    assert!(host.select_sdio_function(3).is_err());
    assert!(host.enable_sdio_function(0, true).is_err());
    host.abort_sdio(1).unwrap();
}

#[test]
fn memory_commands_fail_on_io_only_cards() {
    let bench = ready(CardKind::Sdio);
    let (host, _) = slot(&bench);
    let mut buf = [0u8; BLOCK];
    assert!(host.get_data(0, &mut buf).is_err());
    assert!(host.send_data(0, &buf).is_err());
}

#[test]
fn sdio_calls_are_refused_on_memory_cards() {
    let bench = ready(CardKind::Sdhc);
    let (host, _) = slot(&bench);
    assert!(host.read_sdio_register(0, cccr::REVISION).is_err());
    assert!(host.cis().is_err());
}

#[test]
fn extended_transfers_past_the_address_space_are_refused() {
    let bench = ready(CardKind::Sdio);
    let (host, sim) = slot(&bench);
    host.enable_sdio_function(1, true).unwrap();
    sim.clear_command_log();

    assert!(matches!(host.write_sdio(1, 0x2_0010, true, &[0x5A; 4]), Err(Error::InvalidRequest(_))));
    let mut buf = [0u8; 32];
    assert!(matches!(host.read_sdio(1, 0x1_FFF0, true, &mut buf), Err(Error::InvalidRequest(_))));
    assert!(host.read_sdio(1, u32::MAX, true, &mut buf).is_err());
    assert!(sim.commands().is_empty());

    // Nothing wrapped around into low memory
    let low = sim.with_card(|c| c.sdio_memory().map(|m| m[0x10..0x14].to_vec())).flatten();
    assert_eq!(low, Some(vec![0; 4]));
}
