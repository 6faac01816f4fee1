use std::sync::Arc;
use std::thread;

use conformance_helpers::{opcodes, pattern, ready, slot, BLOCK};
use sdhc::{AutoCmd, CardType, Command, DataDescriptor, Error, ResponseType, TransferMode};
use sdhc_hw::card::opcode;
use sdhc_sim::CardKind;

fn round_trip(mode: TransferMode, first: u32, blocks: usize) {
    let bench = ready(CardKind::Sdhc);
    let (host, _) = slot(&bench);
    host.select_transfer_mode(mode).unwrap();

    let data = pattern(first, blocks);
    assert_eq!(host.send_data(first, &data).unwrap(), data.len());
    let mut back = vec![0u8; data.len()];
    assert_eq!(host.get_data(first, &mut back).unwrap(), data.len());
    assert!(back == data, "{:?} round trip of {} blocks differs", mode, blocks);
}

#[test]
fn pio_round_trip() {
    round_trip(TransferMode::Pio, 10, 5);
}

#[test]
fn sdma_round_trip_crosses_buffer_boundaries() {
    // 40 blocks span several 4 KiB SDMA boundaries
    round_trip(TransferMode::Sdma, 300, 40);
}

#[test]
fn adma_round_trip_spans_several_descriptors() {
    round_trip(TransferMode::Adma2, 1000, 300);
}

#[test]
fn single_block_uses_single_block_commands() {
    let bench = ready(CardKind::Sdhc);
    let (host, sim) = slot(&bench);
    sim.clear_command_log();
    host.send_data(7, &pattern(7, 1)).unwrap();
    let mut back = [0u8; BLOCK];
    host.get_data(7, &mut back).unwrap();
    let ops = opcodes(&sim);
    assert!(ops.contains(&opcode::WRITE_BLOCK));
    assert!(ops.contains(&opcode::READ_SINGLE_BLOCK));
    assert!(!ops.contains(&opcode::READ_MULTIPLE_BLOCK));
}

#[test]
fn partial_tail_block_keeps_existing_bytes() {
    let bench = ready(CardKind::Sdhc);
    let (host, _) = slot(&bench);
    host.send_data(50, &[0x11; 2 * BLOCK]).unwrap();
    host.send_data(50, &[0x22; BLOCK + 100]).unwrap();

    let mut back = vec![0u8; 2 * BLOCK];
    host.get_data(50, &mut back).unwrap();
    assert!(back[..BLOCK + 100].iter().all(|&b| b == 0x22));
    assert!(back[BLOCK + 100..].iter().all(|&b| b == 0x11));
}

#[test]
fn byte_addressed_card_gets_byte_arguments() {
    let bench = ready(CardKind::Sdsc);
    let (host, sim) = slot(&bench);
    assert_eq!(host.card_info().unwrap().card_type, CardType::Sd);

    sim.clear_command_log();
    let data = pattern(1000, 1);
    host.send_data(1000, &data).unwrap();
    let write = sim.commands().into_iter().find(|(op, _)| *op == opcode::WRITE_BLOCK).unwrap();
    assert_eq!(write.1, 1000 * BLOCK as u32);

    let mut back = [0u8; BLOCK];
    host.get_data(1000, &mut back).unwrap();
    assert_eq!(&back[..], &data[..]);
}

#[test]
fn auto_cmd12_follows_multi_block_read() {
    let bench = ready(CardKind::Sdhc);
    let (host, sim) = slot(&bench);
    host.set_auto_cmd(AutoCmd::Cmd12);
    sim.clear_command_log();

    let mut buf = vec![0u8; 4 * BLOCK];
    host.get_data(0, &mut buf).unwrap();
    let ops = opcodes(&sim);
    let at = ops.iter().position(|&op| op == opcode::READ_MULTIPLE_BLOCK).unwrap();
    assert_eq!(ops.get(at + 1), Some(&opcode::STOP_TRANSMISSION));
}

#[test]
fn auto_cmd23_announces_the_block_count() {
    let bench = ready(CardKind::Sdhc);
    let (host, sim) = slot(&bench);
    host.set_auto_cmd(AutoCmd::Cmd23);
    sim.clear_command_log();

    host.send_data(64, &pattern(64, 6)).unwrap();
    let log = sim.commands();
    let at = log.iter().position(|(op, _)| *op == opcode::WRITE_MULTIPLE_BLOCK).unwrap();
    assert!(at > 0);
    assert_eq!(log[at - 1].0, opcode::SET_BLOCK_COUNT);
    assert_eq!(log[at - 1].1 & 0xFFFF, 6);
    assert!(!log[at..].iter().any(|(op, _)| *op == opcode::STOP_TRANSMISSION));

    let mut back = vec![0u8; 6 * BLOCK];
    host.get_data(64, &mut back).unwrap();
    assert_eq!(back, pattern(64, 6));
}

#[test]
fn open_ended_read_stops_at_the_requested_block() {
    let bench = ready(CardKind::Sdhc);
    let (host, sim) = slot(&bench);
    host.send_data(20, &pattern(20, 8)).unwrap();

    host.set_stop_at_block(Some(3));
    sim.clear_command_log();
    let mut buf = vec![0u8; 8 * BLOCK];
    assert_eq!(host.get_data(20, &mut buf).unwrap(), 3 * BLOCK);
    assert_eq!(&buf[..3 * BLOCK], &pattern(20, 3)[..]);
    assert!(opcodes(&sim).contains(&opcode::STOP_TRANSMISSION));

    // The stop applies to one transfer only
    assert_eq!(host.get_data(20, &mut buf).unwrap(), 8 * BLOCK);
}

#[test]
fn open_ended_write_leaves_later_blocks_alone() {
    let bench = ready(CardKind::Sdhc);
    let (host, _) = slot(&bench);
    host.send_data(200, &[0x11; 4 * BLOCK]).unwrap();

    host.set_stop_at_block(Some(2));
    assert_eq!(host.send_data(200, &[0x22; 4 * BLOCK]).unwrap(), 2 * BLOCK);

    let mut back = vec![0u8; 4 * BLOCK];
    host.get_data(200, &mut back).unwrap();
    assert!(back[..2 * BLOCK].iter().all(|&b| b == 0x22));
    assert!(back[2 * BLOCK..].iter().all(|&b| b == 0x11));
}

#[test]
fn vectored_transfers_scatter_and_gather() {
    let bench = ready(CardKind::Sdhc);
    let (host, _) = slot(&bench);
    let data = pattern(400, 3);
    let (a, b) = data.split_at(BLOCK);
    assert_eq!(host.send_data_vectored(400, vec![a, b]).unwrap(), 3 * BLOCK);

    let mut first = vec![0u8; 2 * BLOCK];
    let mut second = vec![0u8; BLOCK];
    host.get_data_vectored(400, vec![&mut first[..], &mut second[..]]).unwrap();
    assert_eq!(&first[..], &data[..2 * BLOCK]);
    assert_eq!(&second[..], &data[2 * BLOCK..]);
}

#[test]
fn transfers_past_the_end_are_refused() {
    let bench = ready(CardKind::Sdhc);
    let (host, sim) = slot(&bench);
    let last = (host.card_info().unwrap().capacity_blocks() - 1) as u32;

    sim.clear_command_log();
    let mut buf = vec![0u8; 2 * BLOCK];
    assert!(matches!(host.get_data(last, &mut buf), Err(Error::InvalidRequest(_))));
    assert!(sim.commands().is_empty());
    assert_eq!(host.get_data(last, &mut buf[..BLOCK]).unwrap(), BLOCK);
}

#[test]
fn requests_from_many_threads_are_serialized() {
    let bench = ready(CardKind::Emmc);
    let (host, sim) = slot(&bench);

    let workers: Vec<_> = (0..4u32)
        .map(|t| {
            let host = Arc::clone(&host);
            thread::spawn(move || {
                for round in 0..5u32 {
                    let block = t * 1000 + round * 16;
                    let data = pattern(block, 4);
                    host.send_data(block, &data).unwrap();
                    let mut back = vec![0u8; data.len()];
                    host.get_data(block, &mut back).unwrap();
                    assert_eq!(back, data, "thread {} round {}", t, round);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    // No command register write landed while an earlier request held the lines
    assert_eq!(sim.collisions(), 0);
}

#[test]
fn data_phase_against_the_command_direction_is_refused() {
    let bench = ready(CardKind::Sdhc);
    let (host, sim) = slot(&bench);
    sim.clear_command_log();

    let block = [0xA5u8; BLOCK];
    let read = Command::new(opcode::READ_SINGLE_BLOCK, 0, ResponseType::R1);
    assert!(matches!(
        host.send_command_with_data(&read, &mut DataDescriptor::write(&block, BLOCK)),
        Err(Error::InvalidRequest(_))
    ));

    let mut buf = [0u8; BLOCK];
    let write = Command::new(opcode::WRITE_BLOCK, 0, ResponseType::R1);
    assert!(matches!(
        host.send_command_with_data(&write, &mut DataDescriptor::read(&mut buf, BLOCK)),
        Err(Error::InvalidRequest(_))
    ));
    assert!(sim.commands().is_empty());

    host.send_command_with_data(&read, &mut DataDescriptor::read(&mut buf, BLOCK)).unwrap();
    assert_eq!(opcodes(&sim), vec![opcode::READ_SINGLE_BLOCK]);
}
