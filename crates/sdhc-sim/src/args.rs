use crate::bench::BenchConfig;
use crate::config::{CardConfig, CardKind, SimConfig};
use clap::{Parser, Subcommand, ValueEnum};
use sdhc::{AutoCmd, EraseKind, HostConfig, TransferMode};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(about = "Drive a simulated SD/MMC/SDIO card through the SDHC host driver")]
pub struct Args {
    /// Raw card image backing the user area. Without it the card lives in RAM.
    #[arg(long)]
    pub image: Option<PathBuf>,

    /// Kind of card in the slot
    #[arg(long, value_enum, default_value = "sdhc")]
    pub card: CardKind,

    /// Data transfer mode the driver should use
    #[arg(long, value_enum, default_value = "adma2")]
    pub mode: ModeArg,

    /// User area size for a RAM-backed card
    #[arg(long, default_value_t = 64)]
    pub capacity_mib: u64,

    /// Command the controller issues around multi-block transfers
    #[arg(long, value_enum, default_value = "cmd12")]
    pub auto_cmd: AutoCmdArg,

    /// Skip UHS-I / HS200 negotiation
    #[arg(long)]
    pub no_uhs: bool,

    /// Log at debug level when RUST_LOG is not set
    #[arg(long, short = 'v')]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CliCommand {
    /// Enumerate the card and print what was found
    Info,
    /// Read blocks and write them to a file or stdout as hex
    Read {
        #[arg(value_parser = parse_hex_or_dec)]
        block: u64,
        #[arg(default_value_t = 1)]
        count: u32,
        /// Destination file; hex dump to stdout when absent
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
    /// Write a file, or a repeated byte pattern, starting at a block
    Write {
        #[arg(value_parser = parse_hex_or_dec)]
        block: u64,
        /// Source file
        #[arg(long, short = 'i', conflicts_with = "pattern")]
        input: Option<PathBuf>,
        /// Byte to repeat over `count` blocks
        #[arg(long, value_parser = parse_hex_or_dec)]
        pattern: Option<u64>,
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Erase the blocks from `start` to `end` inclusive
    Erase {
        #[arg(value_parser = parse_hex_or_dec)]
        start: u64,
        #[arg(value_parser = parse_hex_or_dec)]
        end: u64,
        #[arg(long, value_enum, default_value = "erase")]
        kind: EraseArg,
    },
    /// Write a pattern, read it back and compare
    Verify {
        #[arg(value_parser = parse_hex_or_dec)]
        block: u64,
        #[arg(default_value_t = 8)]
        count: u32,
        #[arg(long, value_parser = parse_hex_or_dec, default_value = "0xA5")]
        pattern: u64,
    },
    /// Dump the EXT_CSD register (MMC and eMMC only)
    ExtCsd,
    /// List a directory of the FAT volume on the card
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file from the FAT volume on the card
    Cat { path: String },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Pio,
    Sdma,
    Adma2,
}

impl From<ModeArg> for TransferMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Pio => TransferMode::Pio,
            ModeArg::Sdma => TransferMode::Sdma,
            ModeArg::Adma2 => TransferMode::Adma2,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoCmdArg {
    None,
    Cmd12,
    Cmd23,
}

impl From<AutoCmdArg> for AutoCmd {
    fn from(auto: AutoCmdArg) -> Self {
        match auto {
            AutoCmdArg::None => AutoCmd::Disabled,
            AutoCmdArg::Cmd12 => AutoCmd::Cmd12,
            AutoCmdArg::Cmd23 => AutoCmd::Cmd23,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseArg {
    Erase,
    Trim,
    Discard,
    Secure,
}

impl From<EraseArg> for EraseKind {
    fn from(kind: EraseArg) -> Self {
        match kind {
            EraseArg::Erase => EraseKind::Erase,
            EraseArg::Trim => EraseKind::Trim,
            EraseArg::Discard => EraseKind::Discard,
            EraseArg::Secure => EraseKind::SecureErase,
        }
    }
}

impl Args {
    /// Validate that the arguments are consistent
    pub fn validate(&self) -> Result<(), String> {
        if self.image.is_none() && self.capacity_mib == 0 {
            return Err("--capacity-mib must be at least 1".to_string());
        }
        if self.card == CardKind::Sdio && !matches!(self.command, CliCommand::Info) {
            return Err("an SDIO card has no memory; only `info` applies".to_string());
        }
        if let Some(image) = &self.image {
            if !image.is_file() {
                return Err(format!("image {:?} is not a file", image));
            }
        }
        match &self.command {
            CliCommand::Read { count: 0, .. } | CliCommand::Verify { count: 0, .. } => {
                Err("block count must be at least 1".to_string())
            }
            CliCommand::Write { input: None, pattern: None, .. } => {
                Err("write needs --input or --pattern".to_string())
            }
            CliCommand::Write { pattern: Some(p), .. } | CliCommand::Verify { pattern: p, .. } if *p > 0xFF => {
                Err(format!("pattern {:#X} does not fit in a byte", p))
            }
            CliCommand::Erase { start, end, .. } if end < start => {
                Err(format!("erase range {}..={} is empty", start, end))
            }
            CliCommand::ExtCsd if !self.card.is_mmc() => Err("EXT_CSD exists only on MMC and eMMC".to_string()),
            _ => Ok(()),
        }
    }

    /// Convert Args to BenchConfig
    pub fn to_bench_config(&self) -> BenchConfig {
        let mut card = CardConfig::new(self.card).uhs(!self.no_uhs);
        card = match &self.image {
            Some(path) => card.image(path),
            None => card.capacity_blocks(self.capacity_mib * 2048),
        };
        let host = HostConfig {
            transfer_mode: self.mode.into(),
            auto_cmd: self.auto_cmd.into(),
            enable_uhs: !self.no_uhs,
            ..HostConfig::default()
        };
        BenchConfig::single(SimConfig::with_card(self.card).card(card)).host_config(host)
    }
}

pub fn parse_hex_or_dec(s: &str) -> Result<u64, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("sdhc-cli").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_build_an_adma_sdhc_bench() {
        let args = parse(&["info"]);
        assert!(args.validate().is_ok());
        let config = args.to_bench_config();
        assert_eq!(config.host.transfer_mode, TransferMode::Adma2);
        assert_eq!(config.host.auto_cmd, AutoCmd::Cmd12);
        let card = config.controllers[0][0].card.as_ref().unwrap();
        assert_eq!(card.kind, CardKind::Sdhc);
        assert_eq!(card.capacity_blocks, 64 * 2048);
    }

    #[test]
    fn options_map_onto_driver_config() {
        let args = parse(&["--card", "emmc", "--mode", "pio", "--auto-cmd", "cmd23", "read", "0x10", "4"]);
        let config = args.to_bench_config();
        assert_eq!(config.host.transfer_mode, TransferMode::Pio);
        assert_eq!(config.host.auto_cmd, AutoCmd::Cmd23);
        assert!(matches!(args.command, CliCommand::Read { block: 0x10, count: 4, .. }));
    }

    #[test]
    fn inconsistent_arguments_are_rejected() {
        assert!(parse(&["ext-csd"]).validate().is_err());
        assert!(parse(&["--card", "emmc", "ext-csd"]).validate().is_ok());
        assert!(parse(&["write", "0"]).validate().is_err());
        assert!(parse(&["write", "0", "--pattern", "0x100"]).validate().is_err());
        assert!(parse(&["erase", "10", "2"]).validate().is_err());
        assert!(parse(&["--card", "sdio", "read", "0"]).validate().is_err());
    }

    #[test]
    fn hex_and_decimal_numbers() {
        assert_eq!(parse_hex_or_dec("0x20"), Ok(32));
        assert_eq!(parse_hex_or_dec("32"), Ok(32));
        assert!(parse_hex_or_dec("0xZZ").is_err());
    }
}
