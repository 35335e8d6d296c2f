//! Firmware file formats
use std::borrow::Cow;
use std::path::Path;
use std::str;

use anyhow::Result;
use object::{
    Endianness, elf::FileHeader32, elf::PT_LOAD, read::elf::FileHeader, read::elf::ProgramHeader,
};

use crate::error::Error;

/// Fill value of address gaps, matches erased flash
const GAP_FILL: u8 = 0xff;

/// avr-ld places SRAM and EEPROM sections at and above this address
const AVR_DATA_ORIGIN: u32 = 0x0080_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    IntelHex,
    ELF,
    Binary,
}

/// Address tagged firmware image.
///
/// Sections are kept as loaded. The flat buffer, anchored at address 0, is
/// only built by [`FirmwareImage::to_binary`], after the caller has checked
/// `max_address` against the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    /// Lowest address covered by the file
    pub min_address: u32,
    /// One past the highest address covered by the file
    pub max_address: u32,
    /// Sorted by address, overlaps resolve to the later section
    sections: Vec<(u32, Vec<u8>)>,
}

impl FirmwareImage {
    /// Build from `(address, bytes)` sections, overlaps resolve to the later section
    pub fn from_sections(mut sections: Vec<(u32, Cow<[u8]>)>) -> Result<Self> {
        sections.retain(|(_, s)| !s.is_empty());
        sections.sort_by_key(|(addr, _)| *addr);

        let min_address = sections
            .first()
            .map(|(addr, _)| *addr)
            .ok_or_else(|| anyhow::format_err!("image contains no data"))?;
        let mut max_address = 0;
        for (addr, sect) in &sections {
            let end = u32::try_from(sect.len())
                .ok()
                .and_then(|len| addr.checked_add(len))
                .ok_or_else(|| anyhow::format_err!("section at 0x{:08x} overflows", addr))?;
            max_address = max_address.max(end);
        }

        Ok(FirmwareImage {
            min_address,
            max_address,
            sections: sections
                .into_iter()
                .map(|(addr, sect)| (addr, sect.into_owned()))
                .collect(),
        })
    }

    /// A contiguous image starting at address 0
    pub fn from_binary(data: Vec<u8>) -> Self {
        FirmwareImage {
            min_address: 0,
            max_address: data.len() as u32,
            sections: vec![(0, data)],
        }
    }

    /// Number of bytes between the lowest and highest covered address
    pub fn size(&self) -> usize {
        (self.max_address - self.min_address) as usize
    }

    /// Length of the buffer `to_binary` builds
    pub fn binary_len(&self) -> usize {
        self.max_address as usize
    }

    /// Image bytes from address 0, gaps filled with 0xff.
    ///
    /// Allocates `binary_len()` bytes.
    pub fn to_binary(&self) -> Vec<u8> {
        let mut data = vec![GAP_FILL; self.binary_len()];
        for (addr, sect) in &self.sections {
            let start = *addr as usize;
            data[start..start + sect.len()].copy_from_slice(sect);
        }
        data
    }
}

/// Something that turns a path into a firmware image
pub trait ImageSource {
    fn load(&self, path: &Path) -> crate::error::Result<FirmwareImage>;
}

/// Reads Intel HEX, ELF or raw binary files from disk
#[derive(Debug, Default, Clone, Copy)]
pub struct FileImageSource;

impl ImageSource for FileImageSource {
    fn load(&self, path: &Path) -> crate::error::Result<FirmwareImage> {
        read_firmware_from_file(path).map_err(|source| Error::ImageLoad {
            path: path.to_path_buf(),
            source,
        })
    }
}

pub fn read_firmware_from_file<P: AsRef<Path>>(path: P) -> Result<FirmwareImage> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    let image = match format {
        FirmwareFormat::IntelHex => read_ihex(str::from_utf8(&raw)?)?,
        FirmwareFormat::ELF => objcopy_binary(&raw)?,
        FirmwareFormat::Binary => FirmwareImage::from_binary(raw),
    };
    log::debug!(
        "Image covers 0x{:08x}..0x{:08x} ({} bytes)",
        image.min_address,
        image.max_address,
        image.size()
    );
    Ok(image)
}

pub fn guess_format(path: &Path, raw: &[u8]) -> FirmwareFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihx", "hex", "eep"].contains(&&*ext) {
        return FirmwareFormat::IntelHex;
    }

    if raw.starts_with(&[0x7f, b'E', b'L', b'F']) {
        FirmwareFormat::ELF
    } else if raw.first() == Some(&b':')
        && raw
            .iter()
            .all(|&c| c.is_ascii_hexdigit() || c == b':' || c == b'\n' || c == b'\r')
    {
        FirmwareFormat::IntelHex
    } else {
        FirmwareFormat::Binary
    }
}

pub fn read_ihex(data: &str) -> Result<FirmwareImage> {
    use ihex::Record;

    let mut base_address = 0;

    let mut records = vec![];
    for record in ihex::Reader::new(data) {
        let record = record?;
        use Record::*;
        match record {
            Data { offset, value } => {
                let offset = base_address + offset as u32;

                records.push((offset, value.into()));
            }
            EndOfFile => (),
            ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            StartSegmentAddress { .. } => (),
            ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            StartLinearAddress(_) => (),
        };
    }
    FirmwareImage::from_sections(records)
}

/// Loadable segments of an AVR ELF32, placed at their physical address
pub fn objcopy_binary(elf_data: &[u8]) -> Result<FirmwareImage> {
    match object::FileKind::parse(elf_data)? {
        object::FileKind::Elf32 => (),
        _ => anyhow::bail!("cannot read file as ELF32 format"),
    }
    let elf_header = FileHeader32::<Endianness>::parse(elf_data)?;
    let endian = elf_header.endian()?;

    let mut sections = vec![];
    for segment in elf_header.program_headers(endian, elf_data)? {
        let p_paddr = segment.p_paddr(endian);
        let segment_data = segment
            .data(endian, elf_data)
            .map_err(|_| anyhow::format_err!("Failed to access data for an ELF segment."))?;
        if p_paddr >= AVR_DATA_ORIGIN {
            log::debug!("Skip non-flash segment at {:#010x}", p_paddr);
            continue;
        }
        if !segment_data.is_empty() && segment.p_type(endian) == PT_LOAD {
            log::debug!(
                "Found loadable segment, physical address: {:#010x}, size: {:#x}",
                p_paddr,
                segment_data.len()
            );
            sections.push((p_paddr, Cow::Borrowed(segment_data)));
        }
    }

    if sections.is_empty() {
        anyhow::bail!("empty ELF file");
    }
    FirmwareImage::from_sections(sections)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLINK_HEX: &str = ":100000000C9434000C943E000C943E000C943E0082\n\
                             :040010000C943E000E\n\
                             :00000001FF\n";

    #[test]
    fn ihex_covers_data_records() {
        let image = read_ihex(BLINK_HEX).unwrap();
        assert_eq!(image.min_address, 0);
        assert_eq!(image.max_address, 0x14);
        assert_eq!(image.size(), 0x14);
        let data = image.to_binary();
        assert_eq!(data.len(), 0x14);
        assert_eq!(&data[..4], &[0x0c, 0x94, 0x34, 0x00]);
    }

    #[test]
    fn gaps_are_filled_and_origin_is_zero() {
        let image = FirmwareImage::from_sections(vec![
            (0x10, Cow::Borrowed(&[1u8, 2][..])),
            (0x20, Cow::Borrowed(&[3u8][..])),
        ])
        .unwrap();
        assert_eq!(image.min_address, 0x10);
        assert_eq!(image.max_address, 0x21);
        assert_eq!(image.size(), 0x11);
        assert_eq!(image.binary_len(), 0x21);
        let data = image.to_binary();
        assert_eq!(data.len(), 0x21);
        assert_eq!(data[0], 0xff);
        assert_eq!(data[0x10], 1);
        assert_eq!(data[0x12], 0xff);
        assert_eq!(data[0x20], 3);
    }

    #[test]
    fn high_address_record_is_not_materialized_on_load() {
        let image = read_ihex(":02000004FFFFFC\n:01000000AA55\n:00000001FF\n").unwrap();
        assert_eq!(image.min_address, 0xffff_0000);
        assert_eq!(image.max_address, 0xffff_0001);
        assert_eq!(image.size(), 1);
        assert_eq!(image.binary_len(), 0xffff_0001);
    }

    #[test]
    fn later_section_wins_on_overlap() {
        let image = FirmwareImage::from_sections(vec![
            (0x00, Cow::Borrowed(&[1u8, 1, 1][..])),
            (0x01, Cow::Borrowed(&[2u8][..])),
        ])
        .unwrap();
        assert_eq!(image.to_binary(), [1, 2, 1]);
    }

    #[test]
    fn empty_image_is_rejected() {
        assert!(read_ihex(":00000001FF\n").is_err());
        assert!(FirmwareImage::from_sections(vec![]).is_err());
    }

    #[test]
    fn format_guessing() {
        assert_eq!(
            guess_format(Path::new("fw.hex"), b"garbage"),
            FirmwareFormat::IntelHex
        );
        assert_eq!(
            guess_format(Path::new("fw"), b"\x7fELF\x01\x01"),
            FirmwareFormat::ELF
        );
        assert_eq!(
            guess_format(Path::new("fw.img"), b":00000001FF\r\n"),
            FirmwareFormat::IntelHex
        );
        assert_eq!(
            guess_format(Path::new("fw.bin"), &[0x0c, 0x94]),
            FirmwareFormat::Binary
        );
        assert_eq!(guess_format(Path::new("fw.bin"), &[]), FirmwareFormat::Binary);
    }

    #[test]
    fn missing_file_is_an_image_load_error() {
        let err = FileImageSource
            .load(Path::new("/nonexistent/pdiprog/fw.hex"))
            .unwrap_err();
        assert!(matches!(err, Error::ImageLoad { .. }));
    }
}
