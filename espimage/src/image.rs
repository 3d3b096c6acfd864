//! Firmware image synthesis
//!
//! Turns parsed ELF sections into the two flashable image formats the device
//! families understand: the simple RAM/ROM image (magic 0xE9) and the
//! bootloader-managed OTA slot image (legacy 0xEA header plus CRC trailer),
//! and produces the list of programmable regions the flashing stage consumes.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

use crate::elf::{ElfError, ElfFile, ParsedSection};

/// First flash-mapped virtual address window (instruction ROM).
pub const SPI_FLASH_BASE: u32 = 0x4020_0000;
pub const SPI_FLASH_LIMIT: u32 = 0x4030_0000;

/// Second flash-mapped window (data ROM on the newer parts).
pub const DROM_BASE: u32 = 0x3F40_0000;
pub const DROM_LIMIT: u32 = 0x3F80_0000;

/// Fixed size of the legacy bootloader header preceding an OTA application.
pub const BOOT_HEADER_SIZE: u32 = 16;

const SEGMENT_HEADER_SIZE: u32 = 8;
/// Flash-mapped segment data must land at a file offset congruent to its
/// address modulo this mapping granularity.
const FLASH_SEGMENT_ALIGN: u32 = 0x1_0000;

/// The RTC text section is carried even without the allocation flag.
const RTC_TEXT_SECTION: &str = ".rtc.text";

const CHECKSUM_SEED: u8 = 0xEF;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Elf(#[from] ElfError),

    #[error("unknown flash parameter: {0}")]
    UnknownParameter(String),

    #[error("invalid image layout: {0}")]
    Layout(String),
}

pub fn is_flash_mapped(addr: u32) -> bool {
    (SPI_FLASH_BASE..SPI_FLASH_LIMIT).contains(&addr)
        || (DROM_BASE..DROM_LIMIT).contains(&addr)
}

/// Byte offset into the SPI flash that a mapped virtual address occupies.
pub fn flash_offset(addr: u32) -> Option<u32> {
    if (SPI_FLASH_BASE..SPI_FLASH_LIMIT).contains(&addr) {
        Some(addr - SPI_FLASH_BASE)
    } else if (DROM_BASE..DROM_LIMIT).contains(&addr) {
        Some(addr - DROM_BASE)
    } else {
        None
    }
}

/// SPI flash access mode, byte 2 of the image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlashMode {
    #[default]
    Qio = 0,
    Qout = 1,
    Dio = 2,
    Dout = 3,
}

impl FromStr for FlashMode {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "qio" => FlashMode::Qio,
            "qout" => FlashMode::Qout,
            "dio" => FlashMode::Dio,
            "dout" => FlashMode::Dout,
            _ => return Err(ImageError::UnknownParameter(format!("flash mode {s:?}"))),
        })
    }
}

impl fmt::Display for FlashMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlashMode::Qio => "qio",
            FlashMode::Qout => "qout",
            FlashMode::Dio => "dio",
            FlashMode::Dout => "dout",
        })
    }
}

/// SPI flash size code, high nibble of byte 3 of the image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlashSize {
    #[default]
    Size4M = 0,
    Size2M = 1,
    Size8M = 2,
    Size16M = 3,
    Size32M = 4,
    Size16MC1 = 5,
    Size32MC1 = 6,
    Size32MC2 = 7,
}

impl FromStr for FlashSize {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "4m" => FlashSize::Size4M,
            "2m" => FlashSize::Size2M,
            "8m" => FlashSize::Size8M,
            "16m" => FlashSize::Size16M,
            "32m" => FlashSize::Size32M,
            "16m-c1" => FlashSize::Size16MC1,
            "32m-c1" => FlashSize::Size32MC1,
            "32m-c2" => FlashSize::Size32MC2,
            _ => return Err(ImageError::UnknownParameter(format!("flash size {s:?}"))),
        })
    }
}

impl fmt::Display for FlashSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlashSize::Size4M => "4m",
            FlashSize::Size2M => "2m",
            FlashSize::Size8M => "8m",
            FlashSize::Size16M => "16m",
            FlashSize::Size32M => "32m",
            FlashSize::Size16MC1 => "16m-c1",
            FlashSize::Size32MC1 => "32m-c1",
            FlashSize::Size32MC2 => "32m-c2",
        })
    }
}

/// SPI flash frequency code, low nibble of byte 3 of the image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlashFrequency {
    #[default]
    Freq40M = 0,
    Freq26M = 1,
    Freq20M = 2,
    Freq80M = 0x0F,
}

impl FromStr for FlashFrequency {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "40m" => FlashFrequency::Freq40M,
            "26m" => FlashFrequency::Freq26M,
            "20m" => FlashFrequency::Freq20M,
            "80m" => FlashFrequency::Freq80M,
            _ => {
                return Err(ImageError::UnknownParameter(format!(
                    "flash frequency {s:?}"
                )));
            }
        })
    }
}

impl fmt::Display for FlashFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlashFrequency::Freq40M => "40m",
            FlashFrequency::Freq26M => "26m",
            FlashFrequency::Freq20M => "20m",
            FlashFrequency::Freq80M => "80m",
        })
    }
}

/// Flash geometry/mode triple packed into bytes 2-3 of the image header.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageHeader {
    pub size: FlashSize,
    pub frequency: FlashFrequency,
    pub mode: FlashMode,
}

impl ImageHeader {
    pub fn new(frequency: &str, mode: &str, size: &str) -> Result<Self, ImageError> {
        Ok(Self {
            size: size.parse()?,
            frequency: frequency.parse()?,
            mode: mode.parse()?,
        })
    }

    fn packed_size_frequency(&self) -> u8 {
        ((self.size as u8) << 4) | (self.frequency as u8)
    }
}

/// One contiguous block of bytes destined for a target address.
#[derive(Debug, Clone)]
pub struct Segment {
    pub address: u32,
    pub data: Vec<u8>,
    /// Section name the segment came from, for diagnostics.
    pub hint: Option<String>,
}

impl Segment {
    /// Data is zero-padded to the next 4-byte boundary at construction.
    pub fn new(address: u32, mut data: Vec<u8>, hint: Option<String>) -> Self {
        let padded = (data.len() + 3) & !3;
        data.resize(padded, 0);
        Self {
            address,
            data,
            hint,
        }
    }

    pub fn is_flash_mapped(&self) -> bool {
        is_flash_mapped(self.address)
    }
}

fn update_checksum(checksum: &mut u8, data: &[u8]) {
    for &byte in data {
        *checksum ^= byte;
    }
}

fn write_segment(out: &mut Vec<u8>, address: u32, data: &[u8], checksum: &mut u8) {
    out.extend_from_slice(&address.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    update_checksum(checksum, data);
}

/// Zero-pad so the checksum byte lands on a 16-byte boundary, then append it.
fn pad_and_seal(out: &mut Vec<u8>, checksum: u8) {
    let padding = 15 - (out.len() % 16);
    out.resize(out.len() + padding, 0);
    out.push(checksum);
}

fn is_eligible(section: &ParsedSection) -> bool {
    if !section.has_data || section.size == 0 {
        return false;
    }
    section.present_in_memory || section.name == RTC_TEXT_SECTION
}

fn collect_segments(elf: &ElfFile, include_flash: bool) -> Result<Vec<Segment>, ImageError> {
    let mut segments = Vec::new();
    for section in elf.sections() {
        if !is_eligible(section) {
            continue;
        }
        if !include_flash && is_flash_mapped(section.virtual_address) {
            continue;
        }
        let data = elf.load_section(section)?.to_vec();
        segments.push(Segment::new(
            section.virtual_address,
            data,
            Some(section.name.clone()),
        ));
    }
    segments.sort_by_key(|s| s.address);
    Ok(segments)
}

/// Simple (non-bootloader) firmware image, magic 0xE9.
#[derive(Debug)]
pub struct SimpleImage {
    pub header: ImageHeader,
    pub entry_point: u32,
    pub segments: Vec<Segment>,
}

impl SimpleImage {
    /// Build a RAM/IRAM image from every eligible non-flash-mapped section.
    pub fn from_elf(elf: &ElfFile, header: ImageHeader) -> Result<Self, ImageError> {
        Ok(Self {
            header,
            entry_point: elf.entry_point(),
            segments: collect_segments(elf, false)?,
        })
    }

    pub fn save(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut checksum = CHECKSUM_SEED;

        out.push(0xE9);
        out.push(self.segments.len() as u8);
        out.push(self.header.mode as u8);
        out.push(self.header.packed_size_frequency());
        out.extend_from_slice(&self.entry_point.to_le_bytes());

        for segment in &self.segments {
            write_segment(&mut out, segment.address, &segment.data, &mut checksum);
        }

        pad_and_seal(&mut out, checksum);
        out
    }
}

/// Placement of an image inside a bootloader-managed OTA slot.
#[derive(Debug, Clone, Copy)]
pub struct OtaSlot {
    /// Which application slot the image was linked for.
    pub app_slot: u8,
    /// Byte offset of the image inside the bootloader-managed flash region.
    pub image_offset: u32,
}

/// Bootloader-slot firmware image: flash-mapped segments are aligned to the
/// 64 KiB mapping granularity, with an optional legacy 0xEA header and CRC
/// trailer for OTA applications.
#[derive(Debug)]
pub struct BootloaderSlotImage {
    pub header: ImageHeader,
    pub entry_point: u32,
    pub segments: Vec<Segment>,
    pub ota: Option<OtaSlot>,
}

impl BootloaderSlotImage {
    /// Build an image carrying every eligible section, flash-mapped ones
    /// included, without OTA metadata.
    pub fn from_elf(elf: &ElfFile, header: ImageHeader) -> Result<Self, ImageError> {
        Ok(Self {
            header,
            entry_point: elf.entry_point(),
            segments: collect_segments(elf, true)?,
            ota: None,
        })
    }

    /// Build an OTA application image. Exactly one flash-mapped application
    /// section is required; its placement determines the slot offset.
    pub fn from_elf_ota(
        elf: &ElfFile,
        header: ImageHeader,
        app_slot: u8,
    ) -> Result<Self, ImageError> {
        let segments = collect_segments(elf, true)?;

        let flash_mapped = segments.iter().filter(|s| s.is_flash_mapped()).count();
        if flash_mapped != 1 {
            return Err(ImageError::Layout(format!(
                "expected exactly one flash-mapped application section, found {flash_mapped}"
            )));
        }
        let app_offset = segments
            .iter()
            .find_map(|s| flash_offset(s.address))
            .ok_or_else(|| {
                ImageError::Layout("no flash-mapped application section".into())
            })?;
        if app_offset < BOOT_HEADER_SIZE {
            return Err(ImageError::Layout(format!(
                "application section at flash offset 0x{app_offset:x} overlaps the bootloader header"
            )));
        }

        Ok(Self {
            header,
            entry_point: elf.entry_point(),
            segments,
            ota: Some(OtaSlot {
                app_slot,
                image_offset: app_offset - BOOT_HEADER_SIZE,
            }),
        })
    }

    /// Flash byte offset the serialized image must be programmed at.
    pub fn image_offset(&self) -> u32 {
        self.ota.map(|ota| ota.image_offset).unwrap_or(0)
    }

    pub fn save(&self) -> Result<Vec<u8>, ImageError> {
        let mut out = Vec::new();
        let mut checksum = CHECKSUM_SEED;

        // When an OTA slot is present, the single flash-mapped segment rides
        // in the legacy header; everything else goes in the main body.
        let mut body: Vec<&Segment> = self.segments.iter().collect();
        if let Some(ota) = self.ota {
            let position = body
                .iter()
                .position(|s| s.is_flash_mapped())
                .ok_or_else(|| {
                    ImageError::Layout("OTA image without a flash-mapped segment".into())
                })?;
            let app = body.remove(position);

            out.push(0xEA);
            out.push(1);
            out.push(0);
            out.push(ota.app_slot);
            out.extend_from_slice(&self.entry_point.to_le_bytes());
            write_segment(&mut out, app.address, &app.data, &mut checksum);
        }

        out.push(0xE9);
        let count_position = out.len();
        out.push(0); // segment count, backpatched below
        out.push(self.header.mode as u8);
        out.push(self.header.packed_size_frequency());
        out.extend_from_slice(&self.entry_point.to_le_bytes());

        let mut written = 0u8;
        for segment in &body {
            if segment.is_flash_mapped() {
                let next_data = out.len() as u32 + SEGMENT_HEADER_SIZE;
                if next_data % FLASH_SEGMENT_ALIGN
                    != segment.address % FLASH_SEGMENT_ALIGN
                {
                    let padded_data = out.len() as u32 + 2 * SEGMENT_HEADER_SIZE;
                    let padding = segment.address.wrapping_sub(padded_data)
                        % FLASH_SEGMENT_ALIGN;
                    write_segment(&mut out, 0, &vec![0u8; padding as usize], &mut checksum);
                    written += 1;
                }
            }
            write_segment(&mut out, segment.address, &segment.data, &mut checksum);
            written += 1;
        }

        out[count_position] = written;
        pad_and_seal(&mut out, checksum);

        if self.ota.is_some() {
            // Interop quirk: the resident bootloader verifies a CRC32 stored
            // off by one with the sign folded. Keep the arithmetic exactly as
            // the bootloader expects it.
            let crc = crc32fast::hash(&out);
            out.extend_from_slice(&adjust_crc(crc).to_le_bytes());
        }
        Ok(out)
    }
}

fn adjust_crc(crc: u32) -> u32 {
    let signed = crc as i32;
    if signed < 0 {
        (-(signed.wrapping_add(1))) as u32
    } else {
        signed.wrapping_add(1) as u32
    }
}

/// Identify which OTA application slot (if any) an ELF was linked for, from
/// the placement of its flash-mapped sections. Zero means a non-OTA layout.
pub fn detect_app_mode(elf: &ElfFile) -> u8 {
    let mapped: Vec<&ParsedSection> = elf
        .sections()
        .iter()
        .filter(|s| s.has_data && s.size > 0 && is_flash_mapped(s.virtual_address))
        .collect();
    if mapped.len() != 1 {
        log::info!(
            "{} flash-mapped sections found, using a non-OTA layout",
            mapped.len()
        );
        return 0;
    }

    let section = mapped[0];
    let offset = match flash_offset(section.virtual_address) {
        Some(offset) => offset,
        None => return 0,
    };
    if offset % 0x2000 == 0 {
        log::info!(
            "{} maps at flash offset 0x{offset:x}, using a non-OTA layout",
            section.name
        );
        0
    } else if offset == 0x1010 {
        log::info!("{} maps at flash offset 0x1010, OTA application slot 1", section.name);
        1
    } else {
        log::info!(
            "{} maps at flash offset 0x{offset:x}, OTA application slot 2",
            section.name
        );
        2
    }
}

/// Raw contents of a section mapped into a flash window, with the flash byte
/// offset it occupies.
#[derive(Debug, Clone)]
pub struct FlashSection {
    pub offset: u32,
    pub data: Vec<u8>,
}

pub fn flash_sections(elf: &ElfFile) -> Result<Vec<FlashSection>, ImageError> {
    let mut sections = Vec::new();
    for section in elf.sections() {
        if let Some(offset) = flash_offset(section.virtual_address)
            && section.has_data
            && section.size > 0
        {
            sections.push(FlashSection {
                offset,
                data: elf.load_section(section)?.to_vec(),
            });
        }
    }
    Ok(sections)
}

/// One contiguous write the flashing stage must perform.
#[derive(Debug, Clone)]
pub struct ProgrammableRegion {
    pub file_name: PathBuf,
    pub offset: u32,
    pub size: usize,
}

/// Convert one ELF into its flashable artifacts on disk.
///
/// `path_base` is the output path prefix, typically the ELF path minus its
/// extension. A non-OTA build produces `<base>-0x00000.bin` plus one raw file
/// per flash-mapped section; an OTA build produces `<base>-user<N>.bin` at
/// the bootloader slot offset and, when a bootloader binary is supplied,
/// `<base>-boot.bin` patched with the configured flash parameters.
pub fn build_regions(
    elf: &ElfFile,
    path_base: &Path,
    header: ImageHeader,
    bootloader: Option<&Path>,
) -> Result<Vec<ProgrammableRegion>, ImageError> {
    let stem = path_base.as_os_str().to_string_lossy().into_owned();
    let mut regions = Vec::new();

    let app_mode = detect_app_mode(elf);
    if app_mode == 0 {
        let image = SimpleImage::from_elf(elf, header)?;
        let bytes = image.save();
        let file_name = PathBuf::from(format!("{stem}-0x00000.bin"));
        fs::write(&file_name, &bytes)?;
        regions.push(ProgrammableRegion {
            file_name,
            offset: 0,
            size: bytes.len(),
        });

        for section in flash_sections(elf)? {
            let file_name = PathBuf::from(format!("{stem}-0x{:05x}.bin", section.offset));
            fs::write(&file_name, &section.data)?;
            regions.push(ProgrammableRegion {
                file_name,
                offset: section.offset,
                size: section.data.len(),
            });
        }
    } else {
        let image = BootloaderSlotImage::from_elf_ota(elf, header, app_mode)?;

        if let Some(bootloader) = bootloader {
            let mut data = fs::read(bootloader)?;
            if data.len() < 4 {
                return Err(ImageError::Layout("bootloader image too short".into()));
            }
            data[2] = header.mode as u8;
            data[3] = header.packed_size_frequency();
            let file_name = PathBuf::from(format!("{stem}-boot.bin"));
            let size = data.len();
            fs::write(&file_name, &data)?;
            regions.push(ProgrammableRegion {
                file_name,
                offset: 0,
                size,
            });
        } else {
            log::warn!("No bootloader image specified, skipping the bootloader region");
        }

        let bytes = image.save()?;
        let file_name = PathBuf::from(format!("{stem}-user{app_mode}.bin"));
        fs::write(&file_name, &bytes)?;
        regions.push(ProgrammableRegion {
            file_name,
            offset: image.image_offset(),
            size: bytes.len(),
        });
    }
    Ok(regions)
}
