//! Register and protocol definitions for SDHC-class host controllers and SD/MMC/SDIO cards.

pub mod card;
pub mod mmio;
pub mod specs;
