use conformance_helpers::{bench_with, fast_config, opcodes, pattern, ready, slot, BLOCK};
use sdhc::{Error, PartitionQuery};
use sdhc_hw::card::{esd, opcode};
use sdhc_hw::specs::clock as hz;
use sdhc_sim::{CardConfig, CardKind, SimConfig};

#[test]
fn refreshed_csd_reports_the_negotiated_speed() {
    let bench = ready(CardKind::Sdhc);
    let (host, sim) = slot(&bench);
    // Read before the access mode switch
    assert_eq!(host.csd().unwrap().max_transfer_hz, hz::SD_DEFAULT_HZ);

    sim.clear_command_log();
    let csd = host.refresh_csd().unwrap();
    assert_eq!(csd.max_transfer_hz, 200_000_000);
    assert_eq!(host.csd().unwrap(), csd);
    assert_eq!(
        opcodes(&sim),
        vec![opcode::SELECT_CARD, opcode::SEND_CSD, opcode::SELECT_CARD]
    );

    // Capacity is unchanged and the card is selected again
    assert_eq!(csd.capacity_blocks, host.card_info().unwrap().capacity_blocks());
    host.send_data(8, &pattern(8, 2)).unwrap();
    let mut back = vec![0u8; 2 * BLOCK];
    host.get_data(8, &mut back).unwrap();
    assert_eq!(back, pattern(8, 2));
}

#[test]
fn emmc_csd_refresh_keeps_the_card_usable() {
    let bench = ready(CardKind::Emmc);
    let (host, _) = slot(&bench);
    let before = host.csd().unwrap();
    assert_eq!(host.refresh_csd().unwrap(), before);
    let mut buf = [0u8; BLOCK];
    host.get_data(0, &mut buf).unwrap();
}

#[test]
fn sdio_cards_have_no_csd_to_refresh() {
    let bench = ready(CardKind::Sdio);
    let (host, sim) = slot(&bench);
    sim.clear_command_log();
    assert!(host.refresh_csd().is_err());
    assert!(sim.commands().is_empty());
}

fn embedded_sd() -> sdhc_sim::SimBench {
    let card = CardConfig::new(CardKind::Sdhc).esd(true);
    bench_with(SimConfig::with_card(CardKind::Sdhc).card(card), fast_config())
}

#[test]
fn embedded_sd_reports_its_partition() {
    let bench = embedded_sd();
    let (host, _) = slot(&bench);

    let device = host.query_partition(PartitionQuery::Device).unwrap();
    assert_eq!(device.len(), esd::RESPONSE_SIZE);
    assert_eq!(device[esd::DEVICE_VERSION], 1);
    assert_eq!(device[esd::DEVICE_PARTITIONS], 1);

    let user = host.query_partition(PartitionQuery::Partition(0)).unwrap();
    assert_eq!(user[esd::PARTITION_TYPE], 1);
    let blocks = u32::from_le_bytes(user[esd::PARTITION_BLOCKS..esd::PARTITION_BLOCKS + 4].try_into().unwrap());
    assert_eq!(blocks as u64, host.card_info().unwrap().capacity_blocks());

    assert!(host.query_partition(PartitionQuery::Partition(3)).is_err());
    // The card still serves data after the refused query
    let mut buf = [0u8; BLOCK];
    host.get_data(0, &mut buf).unwrap();
}

#[test]
fn partition_queries_need_an_embedded_sd() {
    let bench = ready(CardKind::Sdhc);
    let (host, _) = slot(&bench);
    assert!(host.query_partition(PartitionQuery::Device).is_err());

    let bench = ready(CardKind::Emmc);
    let (host, sim) = slot(&bench);
    sim.clear_command_log();
    assert!(matches!(
        host.query_partition(PartitionQuery::Device),
        Err(Error::UnsupportedMode(_))
    ));
    assert!(sim.commands().is_empty());
}
