//! Host-controller core for SD, MMC/eMMC and SDIO cards behind an
//! SDHC-class controller.
//!
//! A [`Host`] owns one slot. Requests from any number of threads are
//! serialized per slot; completions arrive through
//! [`HostRegistry::irq_handler`], which the platform's interrupt vector
//! calls with the controller and slot that raised the line.

mod api;
pub mod card;
pub mod command;
pub mod config;
pub mod data;
pub mod dma;
mod enumerate;
pub mod error;
mod host;
mod io;
pub mod irq;
pub mod ops;
mod recovery;
pub mod registry;
pub mod regs;
mod request;
pub mod uhs;

pub use api::BusInfo;
pub use card::{Card, CardType, Cid, Csd, ExtCsd, Scr, SdioInfo, SpeedMode};
pub use command::{CardStatus, Command, R5Flags, Response, ResponseType};
pub use config::{AutoCmd, BusWidth, HostConfig, TransferMode};
pub use data::{DataBuffer, DataDescriptor, Direction, Termination};
pub use dma::{AdmaChain, AdmaDescriptor, DmaError, DmaMap, IdentityDma};
pub use error::{Error, Result};
pub use host::{Host, RequestPhase};
pub use io::{block_count_argument, BlockCountFlags};
pub use irq::HostEvent;
pub use ops::{
    BootPartition, EraseKind, HpiCommand, LockOp, PackedEntry, PackedStatus, Partition, PartitionQuery, PowerOffNotice,
    RpmbFrame, RtcTime, WriteProtectType,
};
pub use registry::{HostRegistry, HostRegistryBuilder};
pub use regs::{Capabilities, Mmio, RegisterBlock};
pub use uhs::SwitchStatus;
