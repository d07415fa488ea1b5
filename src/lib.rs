//! FDC8272 - Intel 8272A Floppy Disk Controller emulation in Rust
//!
//! A tick-driven 8272A/uPD765 core for machine emulators:
//! - Command decode and per-command execution state machines
//! - Rotation, index hole, step pulse and byte timing in CPU ticks
//! - DMA and non-DMA transfers, interrupt and Terminal Count handling
//! - Sector-level disk model with raw image loading

pub mod sector;
pub mod disk;
pub mod drive;
pub mod fdc;
pub mod fdc_log;
pub mod config;
pub mod host;
