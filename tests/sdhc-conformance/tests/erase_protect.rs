use conformance_helpers::{bench_with, fast_config, pattern, ready, slot, BLOCK};
use sdhc::{CardStatus, EraseKind, Error, LockOp, WriteProtectType};
use sdhc_sim::{CardKind, SimConfig};

fn read(host: &sdhc::Host, block: u32, blocks: usize) -> Vec<u8> {
    let mut buf = vec![0u8; blocks * BLOCK];
    host.get_data(block, &mut buf).unwrap();
    buf
}

#[test]
fn sd_erase_covers_exactly_the_range_and_reads_ones() {
    let bench = ready(CardKind::Sdhc);
    let (host, _) = slot(&bench);
    assert_eq!(host.erased_byte().unwrap(), 0xFF);

    host.send_data(10, &pattern(10, 10)).unwrap();
    host.erase(12, 15, EraseKind::Erase).unwrap();

    let back = read(&host, 10, 10);
    let expected = pattern(10, 10);
    assert_eq!(&back[..2 * BLOCK], &expected[..2 * BLOCK]);
    assert!(back[2 * BLOCK..5 * BLOCK].iter().all(|&b| b == 0xFF));
    assert_eq!(&back[5 * BLOCK..], &expected[5 * BLOCK..]);
}

#[test]
fn emmc_erase_widens_to_whole_groups_and_reads_zeros() {
    let bench = ready(CardKind::Emmc);
    let (host, _) = slot(&bench);
    assert_eq!(host.erased_byte().unwrap(), 0x00);
    let group = host.card_info().unwrap().erase_group_blocks();
    assert!(group > 2);

    host.send_data(0, &vec![0x5A; 2 * BLOCK]).unwrap();
    host.send_data(group - 1, &vec![0x5A; 2 * BLOCK]).unwrap();
    host.erase(1, 2, EraseKind::Erase).unwrap();

    assert!(read(&host, 0, 1).iter().all(|&b| b == 0x00));
    assert!(read(&host, group - 1, 1).iter().all(|&b| b == 0x00));
    // The next group is untouched
    assert!(read(&host, group, 1).iter().all(|&b| b == 0x5A));
}

#[test]
fn erased_emmc_region_reads_the_erase_pattern() {
    let bench = ready(CardKind::Emmc);
    let (host, _) = slot(&bench);
    host.send_data(0x200, &pattern(0x200, 4)).unwrap();
    host.erase(0x200, 0x204, EraseKind::Erase).unwrap();
    assert!(read(&host, 0x200, 4).iter().all(|&b| b == 0x00));
}

#[test]
fn emmc_trim_is_exact() {
    let bench = ready(CardKind::Emmc);
    let (host, _) = slot(&bench);
    host.send_data(100, &vec![0x5A; 4 * BLOCK]).unwrap();
    host.erase(101, 103, EraseKind::Trim).unwrap();

    let back = read(&host, 100, 4);
    assert!(back[..BLOCK].iter().all(|&b| b == 0x5A));
    assert!(back[BLOCK..3 * BLOCK].iter().all(|&b| b == 0x00));
    assert!(back[3 * BLOCK..].iter().all(|&b| b == 0x5A));
}

#[test]
fn erase_argument_checks() {
    let bench = ready(CardKind::Sdhc);
    let (host, _) = slot(&bench);
    let blocks = host.card_info().unwrap().capacity_blocks() as u32;
    assert!(matches!(host.erase(5, 5, EraseKind::Erase), Err(Error::InvalidRequest(_))));
    assert!(matches!(host.erase(0, blocks + 1, EraseKind::Erase), Err(Error::InvalidRequest(_))));
    // Trim is an eMMC feature
    assert!(matches!(host.erase(0, 1, EraseKind::Trim), Err(Error::UnsupportedMode(_))));
}

#[test]
fn mechanical_switch_blocks_sd_writes() {
    let slot_config = SimConfig {
        write_protect_switch: true,
        ..SimConfig::with_card(CardKind::Sdhc)
    };
    let bench = bench_with(slot_config, fast_config());
    let (host, sim) = slot(&bench);

    assert_eq!(host.send_data(0, &[0u8; BLOCK]), Err(Error::WriteProtected));
    read(&host, 0, 1);

    sim.set_write_protect_switch(false);
    host.send_data(0, &[0u8; BLOCK]).unwrap();
}

#[test]
fn emmc_group_write_protection() {
    let bench = ready(CardKind::Emmc);
    let (host, _) = slot(&bench);
    let group = host.wp_group_blocks().unwrap();

    host.set_write_protect(0, 1).unwrap();
    assert_eq!(host.write_protect_status(0).unwrap() & 0b11, 0b01);
    let types = host.write_protect_types(0).unwrap();
    assert_eq!(types.len(), 32);
    assert_eq!(types[0], WriteProtectType::Temporary);
    assert_eq!(types[1], WriteProtectType::None);

    assert_eq!(host.send_data(3, &[1u8; BLOCK]), Err(Error::WriteProtected));
    host.send_data(group, &[1u8; BLOCK]).unwrap();

    host.clear_write_protect(0, 1).unwrap();
    assert_eq!(host.write_protect_status(0).unwrap(), 0);
    host.send_data(3, &[1u8; BLOCK]).unwrap();
}

#[test]
fn sdsc_supports_group_protection_but_sdhc_does_not() {
    let bench = ready(CardKind::Sdsc);
    let (host, _) = slot(&bench);
    let group = host.wp_group_blocks().unwrap();
    host.set_write_protect(group, 1).unwrap();
    assert_eq!(host.write_protect_status(0).unwrap(), 0b10);
    assert_eq!(host.send_data(group, &[7u8; BLOCK]), Err(Error::WriteProtected));

    let bench = ready(CardKind::Sdhc);
    let (host, _) = slot(&bench);
    assert!(matches!(host.set_write_protect(0, 1), Err(Error::UnsupportedMode(_))));
}

#[test]
fn password_lock_and_unlock() {
    let bench = ready(CardKind::Sdhc);
    let (host, _) = slot(&bench);
    let data = pattern(8, 1);
    host.send_data(8, &data).unwrap();

    let set = LockOp::SetPassword {
        old: Vec::new(),
        new: b"hunter2".to_vec(),
    };
    assert!(!host.lock_unlock(&set).unwrap());
    assert!(host.lock_unlock(&LockOp::Lock(b"hunter2".to_vec())).unwrap());
    assert!(host.is_locked().unwrap());

    let mut buf = [0u8; BLOCK];
    assert_eq!(
        host.get_data(8, &mut buf),
        Err(Error::CardStatus(CardStatus::CARD_IS_LOCKED))
    );

    let wrong = host.lock_unlock(&LockOp::Unlock(b"wrong".to_vec()));
    assert!(matches!(wrong, Err(Error::CardStatus(s)) if s.contains(CardStatus::LOCK_UNLOCK_FAILED)));
    assert!(host.is_locked().unwrap());

    assert!(!host.lock_unlock(&LockOp::Unlock(b"hunter2".to_vec())).unwrap());
    host.get_data(8, &mut buf).unwrap();
    assert_eq!(&buf[..], &data[..]);

    assert!(!host.lock_unlock(&LockOp::ClearPassword(b"hunter2".to_vec())).unwrap());
}

#[test]
fn forced_erase_clears_password_and_data() {
    let bench = ready(CardKind::Sdhc);
    let (host, _) = slot(&bench);
    host.send_data(8, &pattern(8, 1)).unwrap();
    let set = LockOp::SetPassword {
        old: Vec::new(),
        new: b"pin".to_vec(),
    };
    host.lock_unlock(&set).unwrap();
    assert!(host.lock_unlock(&LockOp::Lock(b"pin".to_vec())).unwrap());

    assert!(!host.lock_unlock(&LockOp::ForceErase).unwrap());
    assert!(read(&host, 8, 1).iter().all(|&b| b == 0xFF));
    // No password left to lock with
    assert!(host.lock_unlock(&LockOp::Lock(b"pin".to_vec())).is_err());
}

#[test]
fn oversized_password_is_rejected_before_the_card_sees_it() {
    let bench = ready(CardKind::Sdhc);
    let (host, sim) = slot(&bench);
    sim.clear_command_log();
    assert!(matches!(
        host.lock_unlock(&LockOp::Lock(vec![b'x'; 17])),
        Err(Error::InvalidRequest(_))
    ));
    assert!(sim.commands().is_empty());
}
