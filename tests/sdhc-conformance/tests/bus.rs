use conformance_helpers::{bench_with, fast_config, pattern, ready, slot, BLOCK};
use sdhc::{AutoCmd, BusWidth, CardType, HostConfig, SpeedMode, TransferMode};
use sdhc_hw::mmio::sdhc::host_control2;
use sdhc_hw::specs::clock as hz;
use sdhc_sim::{CardConfig, CardKind, ControllerCaps, SimConfig};

#[test]
fn uhs_sd_card_runs_sdr104_on_four_lines() {
    let bench = ready(CardKind::Sdhc);
    let (host, sim) = slot(&bench);
    let card = host.card_info().unwrap();
    assert_eq!(card.card_type, CardType::Sdhc);
    assert!(card.s18a);
    assert_eq!(host.speed_mode(), SpeedMode::Sdr104);
    assert_eq!(host.bus_width(), BusWidth::Four);
    assert_eq!(host.tuning_runs(), 1);
    assert_eq!(sim.tuning_runs(), 1);
    assert_ne!(sim.host_control2() & host_control2::SIGNALING_1V8, 0);

    let bus = host.bus_info();
    assert_eq!(bus.clock_hz, hz::SDR104_HZ);
    assert_eq!(bus.width, BusWidth::Four);
    assert_eq!(bus.transfer_mode, TransferMode::Adma2);
    assert_eq!(bus.auto_cmd, AutoCmd::Cmd12);
    assert!(host.clock_hz() <= hz::SDR104_HZ);
}

#[test]
fn legacy_controller_stays_at_high_speed_3v3() {
    let slot_config = SimConfig::with_card(CardKind::Sdhc).caps(ControllerCaps::legacy());
    let bench = bench_with(slot_config, fast_config());
    let (host, sim) = slot(&bench);
    assert_eq!(host.speed_mode(), SpeedMode::HighSpeed);
    assert_eq!(host.bus_info().clock_hz, hz::SD_HIGH_SPEED_HZ);
    assert_eq!(host.tuning_runs(), 0);
    assert_eq!(sim.host_control2() & host_control2::SIGNALING_1V8, 0);
}

#[test]
fn uhs_disabled_in_config_skips_voltage_switch() {
    let config = HostConfig {
        enable_uhs: false,
        ..fast_config()
    };
    let bench = bench_with(SimConfig::with_card(CardKind::Sdxc), config);
    let (host, sim) = slot(&bench);
    assert_eq!(host.card_info().unwrap().card_type, CardType::Sdxc);
    assert!(!host.speed_mode().is_uhs());
    assert_eq!(sim.host_control2() & host_control2::SIGNALING_1V8, 0);
}

#[test]
fn emmc_runs_hs200_on_eight_lines() {
    let bench = ready(CardKind::Emmc);
    let (host, _) = slot(&bench);
    assert_eq!(host.card_info().unwrap().card_type, CardType::EmmcHc);
    assert_eq!(host.speed_mode(), SpeedMode::Hs200);
    assert_eq!(host.bus_width(), BusWidth::Eight);
    assert_eq!(host.tuning_runs(), 1);
    assert_eq!(host.bus_info().clock_hz, hz::HS200_HZ);
}

#[test]
fn emmc_without_hs200_uses_high_speed() {
    let card = CardConfig::new(CardKind::Emmc).uhs(false);
    let bench = bench_with(SimConfig::with_card(CardKind::Emmc).card(card), fast_config());
    let (host, _) = slot(&bench);
    assert_eq!(host.speed_mode(), SpeedMode::HighSpeed);
    assert_eq!(host.bus_info().clock_hz, hz::MMC_HIGH_SPEED_HZ);
    assert_eq!(host.tuning_runs(), 0);
}

#[test]
fn max_bus_width_limits_the_card() {
    let config = HostConfig {
        max_bus_width: BusWidth::Four,
        ..fast_config()
    };
    let bench = bench_with(SimConfig::with_card(CardKind::Emmc), config);
    let (host, _) = slot(&bench);
    assert_eq!(host.bus_width(), BusWidth::Four);

    let mut info = host.bus_info();
    info.width = BusWidth::Eight;
    assert!(host.set_bus_info(&info).is_err());
}

#[test]
fn unchanged_bus_info_issues_no_commands() {
    let bench = ready(CardKind::Sdhc);
    let (host, sim) = slot(&bench);
    sim.clear_command_log();
    host.set_bus_info(&host.bus_info()).unwrap();
    assert!(sim.commands().is_empty());
}

#[test]
fn bus_info_changes_apply_and_data_still_flows() {
    let bench = ready(CardKind::Sdhc);
    let (host, _) = slot(&bench);

    let mut info = host.bus_info();
    info.width = BusWidth::One;
    info.clock_hz = 25_000_000;
    info.transfer_mode = TransferMode::Sdma;
    info.auto_cmd = AutoCmd::Cmd23;
    host.set_bus_info(&info).unwrap();
    assert_eq!(host.bus_info(), info);

    let data = pattern(5, 3);
    host.send_data(5, &data).unwrap();
    let mut back = vec![0u8; data.len()];
    host.get_data(5, &mut back).unwrap();
    assert_eq!(back, data);

    // Clock requests above what the timing allows are capped
    info.clock_hz = 1_000_000_000;
    host.set_bus_info(&info).unwrap();
    assert_eq!(host.bus_info().clock_hz, hz::SDR104_HZ);

    // SD has no 8-bit bus
    info.width = BusWidth::Eight;
    assert!(host.set_bus_info(&info).is_err());
}

#[test]
fn powering_down_drops_the_card_until_reenumerated() {
    let bench = ready(CardKind::Sdhc);
    let (host, sim) = slot(&bench);
    host.set_voltage(0).unwrap();
    assert!(host.card_info().is_none());
    assert_eq!(host.bus_info().voltage_mv, 0);
    assert!(!sim.bus_powered());

    let mut buf = [0u8; BLOCK];
    assert!(host.get_data(0, &mut buf).is_err());

    assert_eq!(host.init_card().unwrap(), CardType::Sdhc);
    assert!(sim.bus_powered());
    host.get_data(0, &mut buf).unwrap();
}

#[test]
fn reset_card_enumerates_again() {
    let bench = ready(CardKind::Emmc);
    let (host, _) = slot(&bench);
    let data = pattern(33, 2);
    host.send_data(33, &data).unwrap();

    assert_eq!(host.reset_card(true).unwrap(), CardType::EmmcHc);
    let mut back = vec![0u8; data.len()];
    host.get_data(33, &mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn missing_transfer_mode_is_refused() {
    let caps = ControllerCaps {
        adma2: false,
        ..ControllerCaps::default()
    };
    let config = HostConfig {
        transfer_mode: TransferMode::Sdma,
        ..fast_config()
    };
    let bench = bench_with(SimConfig::with_card(CardKind::Sdhc).caps(caps), config);
    let (host, _) = slot(&bench);
    assert!(host.select_transfer_mode(TransferMode::Adma2).is_err());
    assert_eq!(host.transfer_mode(), TransferMode::Sdma);
    host.select_transfer_mode(TransferMode::Pio).unwrap();
}

#[test]
fn raw_register_access_stays_inside_the_window() {
    let bench = ready(CardKind::Sdhc);
    let (host, _) = slot(&bench);
    assert!(host.read_register32(0x24).is_ok());
    assert!(host.read_register16(0xFFFF_FFFE).is_err());
    assert!(host.read_register32(0xFFFF_FFFC).is_err());
    assert!(host.write_register16(0xFFFF_FFFE, 0).is_err());
}
