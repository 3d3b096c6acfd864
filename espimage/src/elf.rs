//! ELF32 executable parsing
//!
//! Field-by-field little-endian decoding of the ELF32 header, section header
//! table, string table and symbol table. Only the little-endian 32-bit
//! targets the flasher supports are handled; there is no ELF64 path.
//!
//! The whole file is parsed eagerly into an [`ElfFile`]; all derived data is
//! read-only afterwards.

use std::path::Path;

use thiserror::Error;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// Size of the `e_ident` block at the start of the header.
pub const EI_NIDENT: usize = 16;
/// Encoded size of the ELF32 file header.
pub const EHDR_SIZE: usize = 52;
/// Encoded size of one section header table entry.
pub const SHDR_SIZE: usize = 40;
/// Encoded size of one symbol table entry.
pub const SYM_SIZE: usize = 16;

/// Machine id that overloads the address LSB as an instruction-set marker.
pub const EM_ARM: u16 = 40;

const SHF_ALLOC: u32 = 0x2;

#[derive(Error, Debug)]
pub enum ElfError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not an ELF file")]
    NotAnElf,

    #[error("malformed ELF: {0}")]
    Malformed(String),

    #[error("read of {size} bytes at offset {offset} is outside the file")]
    OutOfRange { offset: u64, size: u64 },
}

/// Raw ELF32 file header, decoded field by field.
#[derive(Debug, Clone)]
pub struct Elf32Header {
    pub ident: [u8; EI_NIDENT],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl Elf32Header {
    pub fn decode(data: &[u8]) -> Result<Self, ElfError> {
        if data.len() < EHDR_SIZE || data[..4] != ELF_MAGIC {
            return Err(ElfError::NotAnElf);
        }
        let mut ident = [0u8; EI_NIDENT];
        ident.copy_from_slice(&data[..EI_NIDENT]);
        Ok(Self {
            ident,
            e_type: read_u16(data, 16),
            e_machine: read_u16(data, 18),
            e_version: read_u32(data, 20),
            e_entry: read_u32(data, 24),
            e_phoff: read_u32(data, 28),
            e_shoff: read_u32(data, 32),
            e_flags: read_u32(data, 36),
            e_ehsize: read_u16(data, 40),
            e_phentsize: read_u16(data, 42),
            e_phnum: read_u16(data, 44),
            e_shentsize: read_u16(data, 46),
            e_shnum: read_u16(data, 48),
            e_shstrndx: read_u16(data, 50),
        })
    }
}

/// Raw section header table entry.
#[derive(Debug, Clone)]
pub struct Elf32SectionHeader {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u32,
    pub sh_addr: u32,
    pub sh_offset: u32,
    pub sh_size: u32,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u32,
    pub sh_entsize: u32,
}

impl Elf32SectionHeader {
    pub fn decode(data: &[u8]) -> Result<Self, ElfError> {
        if data.len() < SHDR_SIZE {
            return Err(ElfError::Malformed("short section header".into()));
        }
        Ok(Self {
            sh_name: read_u32(data, 0),
            sh_type: read_u32(data, 4),
            sh_flags: read_u32(data, 8),
            sh_addr: read_u32(data, 12),
            sh_offset: read_u32(data, 16),
            sh_size: read_u32(data, 20),
            sh_link: read_u32(data, 24),
            sh_info: read_u32(data, 28),
            sh_addralign: read_u32(data, 32),
            sh_entsize: read_u32(data, 36),
        })
    }
}

/// Raw symbol table entry.
#[derive(Debug, Clone)]
pub struct Elf32Symbol {
    pub st_name: u32,
    pub st_value: u32,
    pub st_size: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
}

impl Elf32Symbol {
    pub fn decode(data: &[u8]) -> Result<Self, ElfError> {
        if data.len() < SYM_SIZE {
            return Err(ElfError::Malformed("short symbol table entry".into()));
        }
        Ok(Self {
            st_name: read_u32(data, 0),
            st_value: read_u32(data, 4),
            st_size: read_u32(data, 8),
            st_info: data[12],
            st_other: data[13],
            st_shndx: read_u16(data, 14),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionType {
    Null,
    Progbits,
    Symtab,
    Strtab,
    Nobits,
    Other(u32),
}

impl From<u32> for SectionType {
    fn from(raw: u32) -> Self {
        match raw {
            0 => SectionType::Null,
            1 => SectionType::Progbits,
            2 => SectionType::Symtab,
            3 => SectionType::Strtab,
            8 => SectionType::Nobits,
            other => SectionType::Other(other),
        }
    }
}

/// One section with its name resolved and derived flags computed.
#[derive(Debug, Clone)]
pub struct ParsedSection {
    pub name: String,
    pub section_type: SectionType,
    pub flags: u32,
    pub virtual_address: u32,
    pub offset_in_file: u32,
    pub size: u32,
    pub link: u32,
    pub info: u32,
    pub align: u32,
    pub entry_size: u32,
    /// The section occupies bytes in the file (everything but NOBITS).
    pub has_data: bool,
    /// The section is part of the program's memory image (SHF_ALLOC).
    pub present_in_memory: bool,
}

impl ParsedSection {
    pub fn contains_address(&self, addr: u32) -> bool {
        addr >= self.virtual_address && addr < self.virtual_address + self.size
    }

    pub fn contains_file_offset(&self, off: u32) -> bool {
        off >= self.offset_in_file && off < self.offset_in_file + self.size
    }

    pub fn address_to_section_offset(&self, addr: u32) -> u32 {
        addr - self.virtual_address
    }
}

/// One symbol after filtering and address normalization.
#[derive(Debug, Clone)]
pub struct ElfSymbol {
    pub name: String,
    pub address: u32,
    pub size: u32,
}

/// A fully parsed ELF32 executable.
///
/// The header, string table and section list are decoded once at
/// construction; everything else is derived on demand from the retained file
/// bytes.
pub struct ElfFile {
    data: Vec<u8>,
    header: Elf32Header,
    sections: Vec<ParsedSection>,
}

impl ElfFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ElfError> {
        let data = std::fs::read(path)?;
        Self::parse(data)
    }

    pub fn parse(data: Vec<u8>) -> Result<Self, ElfError> {
        let header = Elf32Header::decode(&data)?;

        let table_end =
            header.e_shoff as u64 + header.e_shnum as u64 * header.e_shentsize as u64;
        if table_end > data.len() as u64 {
            return Err(ElfError::Malformed(
                "section header table extends past end of file".into(),
            ));
        }
        if header.e_shstrndx >= header.e_shnum {
            return Err(ElfError::Malformed("string table index out of range".into()));
        }

        let strtab_hdr = raw_section_header(&data, &header, header.e_shstrndx)?;
        if SectionType::from(strtab_hdr.sh_type) != SectionType::Strtab {
            return Err(ElfError::Malformed(
                "section name table has wrong section type".into(),
            ));
        }
        let strings =
            slice_checked(&data, strtab_hdr.sh_offset, strtab_hdr.sh_size)?.to_vec();

        let mut sections = Vec::with_capacity(header.e_shnum as usize);
        for index in 0..header.e_shnum {
            let shdr = raw_section_header(&data, &header, index)?;
            sections.push(ParsedSection {
                name: resolve_name(&strings, shdr.sh_name),
                section_type: SectionType::from(shdr.sh_type),
                flags: shdr.sh_flags,
                virtual_address: shdr.sh_addr,
                offset_in_file: shdr.sh_offset,
                size: shdr.sh_size,
                link: shdr.sh_link,
                info: shdr.sh_info,
                align: shdr.sh_addralign,
                entry_size: shdr.sh_entsize,
                has_data: SectionType::from(shdr.sh_type) != SectionType::Nobits,
                present_in_memory: shdr.sh_flags & SHF_ALLOC != 0,
            });
        }

        log::debug!(
            "Parsed ELF: machine {}, entry 0x{:08x}, {} sections",
            header.e_machine,
            header.e_entry,
            sections.len()
        );

        Ok(Self {
            data,
            header,
            sections,
        })
    }

    pub fn header(&self) -> &Elf32Header {
        &self.header
    }

    pub fn entry_point(&self) -> u32 {
        self.header.e_entry
    }

    pub fn sections(&self) -> &[ParsedSection] {
        &self.sections
    }

    pub fn find_section_by_name(&self, name: &str) -> Option<&ParsedSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Lowest non-zero section address, or `u32::MAX` when nothing is mapped.
    pub fn first_section_address(&self) -> u32 {
        self.sections
            .iter()
            .filter(|s| s.virtual_address != 0)
            .map(|s| s.virtual_address)
            .min()
            .unwrap_or(u32::MAX)
    }

    /// The raw bytes a section occupies in the file.
    pub fn load_section(&self, section: &ParsedSection) -> Result<&[u8], ElfError> {
        slice_checked(&self.data, section.offset_in_file, section.size)
    }

    /// All usable symbols, in table order.
    ///
    /// Missing `.symtab`/`.strtab` degrades to an empty list rather than an
    /// error. Zero-valued, unnamed and `$`-prefixed symbols are dropped; on
    /// ARM the address LSB (the Thumb-mode marker) is masked off.
    pub fn symbols(&self) -> Result<Vec<ElfSymbol>, ElfError> {
        let (symtab, strtab) = match (
            self.find_section_by_name(".symtab"),
            self.find_section_by_name(".strtab"),
        ) {
            (Some(symtab), Some(strtab)) => (symtab, strtab),
            _ => return Ok(Vec::new()),
        };
        let symtab = self.load_section(symtab)?;
        let strtab = self.load_section(strtab)?;
        let is_arm = self.header.e_machine == EM_ARM;

        let mut symbols = Vec::new();
        for entry in symtab.chunks_exact(SYM_SIZE) {
            let raw = Elf32Symbol::decode(entry)?;
            if raw.st_value == 0 {
                continue;
            }

            let name = if raw.st_name != 0 && (raw.st_name as usize) < strtab.len() {
                resolve_name(strtab, raw.st_name)
            } else {
                String::new()
            };
            if name.is_empty() || name.starts_with('$') {
                continue;
            }

            let mut address = raw.st_value;
            if is_arm {
                address &= !1;
            }

            symbols.push(ElfSymbol {
                name,
                address,
                size: raw.st_size,
            });
        }
        Ok(symbols)
    }
}

fn raw_section_header(
    data: &[u8],
    header: &Elf32Header,
    index: u16,
) -> Result<Elf32SectionHeader, ElfError> {
    let offset = header.e_shoff as usize + index as usize * header.e_shentsize as usize;
    let bytes = data
        .get(offset..offset + SHDR_SIZE)
        .ok_or_else(|| ElfError::Malformed(format!("section header {index} out of range")))?;
    Elf32SectionHeader::decode(bytes)
}

fn slice_checked(data: &[u8], offset: u32, size: u32) -> Result<&[u8], ElfError> {
    let end = offset as u64 + size as u64;
    if end > data.len() as u64 {
        return Err(ElfError::OutOfRange {
            offset: offset as u64,
            size: size as u64,
        });
    }
    Ok(&data[offset as usize..end as usize])
}

/// Resolve a NUL-terminated name out of a string table.
fn resolve_name(strings: &[u8], start: u32) -> String {
    let start = start as usize;
    if start >= strings.len() {
        return String::new();
    }
    let end = strings[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .unwrap_or(strings.len());
    String::from_utf8_lossy(&strings[start..end]).into_owned()
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn header_decode_fixture() {
        let bytes = build_elf(94, 0x4010_0000, &[]);
        let header = Elf32Header::decode(&bytes).unwrap();
        assert_eq!(header.e_machine, 94);
        assert_eq!(header.e_entry, 0x4010_0000);
        assert_eq!(header.e_shentsize, 40);
        assert_eq!(header.e_shnum, 2);
        assert_eq!(header.e_shstrndx, 1);
    }

    #[test]
    fn section_header_decode_fixture() {
        let mut bytes = Vec::new();
        for value in [5u32, 1, 2, 0x4000_0000, 0x100, 0x20, 7, 8, 4, 0] {
            push32(&mut bytes, value);
        }
        let shdr = Elf32SectionHeader::decode(&bytes).unwrap();
        assert_eq!(shdr.sh_name, 5);
        assert_eq!(shdr.sh_type, 1);
        assert_eq!(shdr.sh_flags, 2);
        assert_eq!(shdr.sh_addr, 0x4000_0000);
        assert_eq!(shdr.sh_offset, 0x100);
        assert_eq!(shdr.sh_size, 0x20);
        assert_eq!(shdr.sh_link, 7);
        assert_eq!(shdr.sh_info, 8);
        assert_eq!(shdr.sh_addralign, 4);
        assert_eq!(shdr.sh_entsize, 0);
    }

    #[test]
    fn symbol_decode_fixture() {
        let bytes = sym_entry(3, 0x4000_0101, 12);
        let sym = Elf32Symbol::decode(&bytes).unwrap();
        assert_eq!(sym.st_name, 3);
        assert_eq!(sym.st_value, 0x4000_0101);
        assert_eq!(sym.st_size, 12);
        assert_eq!(sym.st_shndx, 0);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = build_elf(94, 0, &[]);
        bytes[0] = 0x7E;
        assert!(matches!(ElfFile::parse(bytes), Err(ElfError::NotAnElf)));
    }

    #[test]
    fn rejects_truncated_section_table() {
        let mut bytes = build_elf(94, 0, &[]);
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            ElfFile::parse(bytes),
            Err(ElfError::Malformed(_))
        ));
    }

    #[test]
    fn parses_single_text_section() {
        let bytes = build_elf(
            94,
            0x4010_0000,
            &[progbits(".text", 0x6, 0x4010_0000, &[0xAA; 8])],
        );
        let elf = ElfFile::parse(bytes).unwrap();

        let text = elf.find_section_by_name(".text").unwrap();
        assert_eq!(text.name, ".text");
        assert!(text.has_data);
        assert!(text.present_in_memory);
        assert_eq!(text.section_type, SectionType::Progbits);
        assert_eq!(elf.load_section(text).unwrap(), &[0xAA; 8]);
    }

    #[test]
    fn section_address_helpers() {
        let bytes = build_elf(94, 0, &[progbits(".data", 0x3, 0x3FFE_8000, &[0; 16])]);
        let elf = ElfFile::parse(bytes).unwrap();
        let data = elf.find_section_by_name(".data").unwrap();

        assert!(data.contains_address(0x3FFE_8004));
        assert!(!data.contains_address(0x3FFE_8010));
        assert!(data.contains_file_offset(data.offset_in_file));
        assert_eq!(data.address_to_section_offset(0x3FFE_8004), 4);
        assert_eq!(elf.first_section_address(), 0x3FFE_8000);
    }

    #[test]
    fn load_section_out_of_range() {
        let bytes = build_elf(94, 0, &[progbits(".text", 0x6, 0x4010_0000, &[0; 4])]);
        let elf = ElfFile::parse(bytes).unwrap();
        let mut section = elf.find_section_by_name(".text").unwrap().clone();
        section.size = 0x1_0000;
        assert!(matches!(
            elf.load_section(&section),
            Err(ElfError::OutOfRange { .. })
        ));
    }

    #[test]
    fn symbols_empty_without_symtab() {
        let bytes = build_elf(94, 0, &[progbits(".text", 0x6, 0x4010_0000, &[0; 4])]);
        let elf = ElfFile::parse(bytes).unwrap();
        assert!(elf.symbols().unwrap().is_empty());
    }

    fn elf_with_symbols(machine: u16) -> ElfFile {
        // .strtab: "\0main\0$t\0"
        let mut strtab = vec![0u8];
        let main_off = strtab.len() as u32;
        strtab.extend_from_slice(b"main\0");
        let marker_off = strtab.len() as u32;
        strtab.extend_from_slice(b"$t\0");

        let mut symtab = sym_entry(main_off, 0x4010_0021, 8);
        symtab.extend_from_slice(&sym_entry(marker_off, 0x4010_0100, 0));
        symtab.extend_from_slice(&sym_entry(main_off, 0, 4)); // zero value

        let bytes = build_elf(
            machine,
            0,
            &[
                TestSection {
                    name: ".symtab",
                    section_type: 2,
                    flags: 0,
                    addr: 0,
                    data: symtab,
                },
                TestSection {
                    name: ".strtab",
                    section_type: 3,
                    flags: 0,
                    addr: 0,
                    data: strtab,
                },
            ],
        );
        ElfFile::parse(bytes).unwrap()
    }

    #[test]
    fn symbols_filter_markers_and_zero_values() {
        let elf = elf_with_symbols(94);
        let symbols = elf.symbols().unwrap();
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].name, "main");
        assert_eq!(symbols[0].address, 0x4010_0021);
        assert_eq!(symbols[0].size, 8);
    }

    #[test]
    fn symbols_mask_thumb_bit_on_arm() {
        let elf = elf_with_symbols(EM_ARM);
        let symbols = elf.symbols().unwrap();
        assert_eq!(symbols[0].address, 0x4010_0020);
    }
}
