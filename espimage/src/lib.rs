//! Firmware image synthesis and serial flashing for ESP-class devices
//!
//! The pipeline: parse an ELF32 executable ([`elf`]), turn its sections into
//! one of the two flashable image formats and a list of programmable regions
//! ([`image`]), then stream each region to the on-chip serial bootloader
//! ([`protocol`]) over SLIP framing ([`slip`]).

pub mod elf;
pub mod image;
pub mod protocol;
pub mod slip;

pub use elf::{ElfError, ElfFile, ElfSymbol, ParsedSection};
pub use image::{
    BootloaderSlotImage, FlashFrequency, FlashMode, FlashSize, ImageError, ImageHeader,
    ProgrammableRegion, Segment, SimpleImage, build_regions, detect_app_mode,
};
pub use protocol::{
    BootChannel, BootloaderClient, DEFAULT_RESET_SEQUENCE, ProgressCallback, ProtocolError,
    SerialChannel, SessionState,
};
