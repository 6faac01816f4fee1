pub mod args;
pub mod bench;
pub mod blockdev;
pub mod card;
pub mod config;
pub mod controller;
pub mod dma;
pub mod faults;
pub mod storage;

// Re-export commonly used types
pub use args::{Args, CliCommand};
pub use bench::{BenchConfig, SimBench};
pub use blockdev::HostStream;
pub use card::{Area, SimCard};
pub use config::{CardConfig, CardKind, ControllerCaps, SimConfig};
pub use controller::SimController;
pub use dma::{BusFault, SimDma};
pub use faults::{Fault, FaultKind, FaultPlan};
