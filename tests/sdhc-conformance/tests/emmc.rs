use conformance_helpers::{pattern, ready, slot, BLOCK};
use sdhc::{Error, Partition, RpmbFrame, RtcTime};
use sdhc_hw::card::{ext_csd, rpmb};
use sdhc_sim::CardKind;

#[test]
fn ext_csd_describes_the_user_area() {
    let bench = ready(CardKind::Emmc);
    let (host, _) = slot(&bench);
    let ext = host.read_ext_csd().unwrap();
    assert_eq!(ext.revision(), 8);
    assert_eq!(ext.sector_count() as u64, host.card_info().unwrap().capacity_blocks());
    assert!(ext.supports_hs200());
}

#[test]
fn ext_csd_writes_reach_the_card() {
    let bench = ready(CardKind::Emmc);
    let (host, sim) = slot(&bench);
    host.modify_ext_csd(ext_csd::USER_WP, 0x01, true).unwrap();
    assert_eq!(sim.with_card(|c| c.ext_csd(ext_csd::USER_WP)).flatten(), Some(0x01));
    host.modify_ext_csd(ext_csd::USER_WP, 0x01, false).unwrap();
    assert_eq!(host.read_ext_csd().unwrap().byte(ext_csd::USER_WP), 0);

    // SEC_COUNT is read-only
    assert!(host.write_ext_csd(ext_csd::SEC_COUNT, 1).is_err());
}

#[test]
fn boot_partition_is_separate_from_the_user_area() {
    let bench = ready(CardKind::Emmc);
    let (host, _) = slot(&bench);
    host.send_data(0, &[0x11; BLOCK]).unwrap();

    host.select_partition(Partition::Boot1).unwrap();
    host.send_data(0, &[0xB1; BLOCK]).unwrap();
    let mut buf = [0u8; BLOCK];
    host.get_data(0, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0xB1));

    host.select_partition(Partition::User).unwrap();
    host.get_data(0, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0x11));

    assert!(matches!(
        host.select_partition(Partition::General(5)),
        Err(Error::InvalidRequest(_))
    ));
}

#[test]
fn packed_write_then_packed_read() {
    let bench = ready(CardKind::Emmc);
    let (host, _) = slot(&bench);
    let a = pattern(10, 2);
    let b = pattern(500, 1);
    let c = pattern(2000, 3);

    let status = host.packed_write(&[(10, &a[..]), (500, &b[..]), (2000, &c[..])], false).unwrap();
    assert!(status.is_ok());

    let mut ra = vec![0u8; a.len()];
    let mut rb = vec![0u8; b.len()];
    let mut rc = vec![0u8; c.len()];
    host.packed_read(&mut [(10, &mut ra[..]), (500, &mut rb[..]), (2000, &mut rc[..])])
        .unwrap();
    assert_eq!(ra, a);
    assert_eq!(rb, b);
    assert_eq!(rc, c);
}

#[test]
fn packed_write_reports_the_failing_entry() {
    let bench = ready(CardKind::Emmc);
    let (host, _) = slot(&bench);
    let group = host.wp_group_blocks().unwrap();
    host.set_write_protect(group, 1).unwrap();

    let first = pattern(0, 1);
    let second = pattern(group, 1);
    let result = host.packed_write(&[(0, &first[..]), (group, &second[..])], false);
    assert!(matches!(result, Err(Error::PackedCommandPartialFailure { index: 2, .. })));

    // Entries ahead of the failure landed
    let mut buf = [0u8; BLOCK];
    host.get_data(0, &mut buf).unwrap();
    assert_eq!(&buf[..], &first[..]);
}

#[test]
fn packed_entries_must_be_whole_blocks() {
    let bench = ready(CardKind::Emmc);
    let (host, _) = slot(&bench);
    let short = [0u8; 100];
    assert!(matches!(
        host.packed_write(&[(0, &short[..])], false),
        Err(Error::InvalidRequest(_))
    ));
}

#[test]
fn rpmb_key_counter_write_and_read() {
    let bench = ready(CardKind::Emmc);
    let (host, sim) = slot(&bench);
    let nonce = [0x42u8; rpmb::NONCE_SIZE];

    assert_eq!(
        host.rpmb_read_counter(nonce),
        Err(Error::Rpmb {
            result: rpmb::RESULT_KEY_NOT_PROGRAMMED
        })
    );

    host.rpmb_program_key(&[0x5Au8; rpmb::MAC_SIZE]).unwrap();
    // A key can be programmed only once
    assert!(host.rpmb_program_key(&[0x5Au8; rpmb::MAC_SIZE]).is_err());

    let counter = host.rpmb_read_counter(nonce).unwrap();
    assert_eq!(counter.write_counter, 0);
    assert_eq!(counter.nonce, nonce);

    let mut frame = RpmbFrame::request(rpmb::REQ_WRITE_DATA);
    frame.address = 3;
    frame.block_count = 1;
    frame.write_counter = counter.write_counter;
    frame.data = [0xC3; rpmb::DATA_SIZE];
    let result = host.rpmb_write(&[frame.clone()]).unwrap();
    assert_eq!(result.write_counter, 1);
    assert_eq!(sim.with_card(|c| c.rpmb_counter()).flatten(), Some(1));

    // Replaying the same counter fails
    assert_eq!(
        host.rpmb_write(&[frame]),
        Err(Error::Rpmb {
            result: rpmb::RESULT_COUNTER_FAILURE
        })
    );

    let read_nonce = [0x17u8; rpmb::NONCE_SIZE];
    let frames = host.rpmb_read(3, 1, read_nonce).unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].data, [0xC3; rpmb::DATA_SIZE]);
    assert_eq!(frames[0].nonce, read_nonce);
    assert_eq!(frames[0].address, 3);
}

#[test]
fn rpmb_write_only_takes_write_frames() {
    let bench = ready(CardKind::Emmc);
    let (host, sim) = slot(&bench);
    sim.clear_command_log();
    assert!(matches!(
        host.rpmb_write(&[RpmbFrame::request(rpmb::REQ_READ_DATA)]),
        Err(Error::InvalidRequest(_))
    ));
    assert!(host.rpmb_write(&[]).is_err());
    assert!(sim.commands().is_empty());
}

#[test]
fn sleep_and_awake() {
    let bench = ready(CardKind::Emmc);
    let (host, _) = slot(&bench);
    let data = pattern(77, 2);
    host.send_data(77, &data).unwrap();

    host.sleep().unwrap();
    assert!(host.card_info().unwrap().sleeping);
    // Sleeping twice is a no-op
    host.sleep().unwrap();

    host.awake().unwrap();
    assert!(!host.card_info().unwrap().sleeping);
    let mut back = vec![0u8; data.len()];
    host.get_data(77, &mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn hpi_needs_enabling_first() {
    let bench = ready(CardKind::Emmc);
    let (host, _) = slot(&bench);
    host.hpi_command().unwrap();
    assert!(matches!(host.send_hpi(), Err(Error::InvalidRequest(_))));

    host.enable_hpi().unwrap();
    host.send_hpi().unwrap();
}

#[test]
fn cache_flush_and_real_time_clock() {
    let bench = ready(CardKind::Emmc);
    let (host, sim) = slot(&bench);
    // Flushing a disabled cache does nothing
    host.flush_cache().unwrap();

    host.set_cache(true).unwrap();
    host.send_data(5, &pattern(5, 1)).unwrap();
    host.flush_cache().unwrap();
    host.set_cache(false).unwrap();

    let time = RtcTime::Absolute { seconds: 63_900_000_000 };
    host.set_time(time).unwrap();
    let stored = sim.with_card(|c| c.last_rtc().map(<[u8]>::to_vec)).flatten().unwrap();
    assert_eq!(stored, time.encode().to_vec());
}

#[test]
fn emmc_features_are_refused_on_sd() {
    let bench = ready(CardKind::Sdhc);
    let (host, _) = slot(&bench);
    assert!(host.read_ext_csd().is_err());
    assert!(host.sleep().is_err());
    assert!(host.select_partition(Partition::Boot1).is_err());
    assert!(host.set_time(RtcTime::ResetRelative).is_err());
}
