pub mod sdhc;
