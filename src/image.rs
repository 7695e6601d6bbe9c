use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crc_any::CRC;
use log::{debug, warn};

use crate::error::{Error, Result};

/// Magic of the 512-byte image header.
pub const IMAGE_HEADER_MAGIC: u32 = 0x27CB_8F93;
/// Magic of every 256-byte partition entry.
pub const PARTITION_MAGIC: u32 = 0x91DF_6DA4;

pub(crate) const IMAGE_HEADER_SIZE: usize = 512;
pub(crate) const PARTITION_ENTRY_SIZE: usize = 256;

/// Partition offsets, sizes and erase sizes are declared on this boundary.
const PARTITION_ALIGNMENT: u32 = 4096;

/// CRC-32 as the image format uses it (zlib variant: polynomial
/// 0xEDB88320, initial and final XOR 0xFFFFFFFF).
pub(crate) fn crc32(data: &[u8]) -> u32 {
    let mut crc = CRC::crc32();
    crc.digest(data);
    crc.get_crc() as u32
}

fn fixed_str(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Parsed 512-byte image header.
#[derive(Clone, Debug)]
pub struct ImageHeader {
    pub flags: u32,
    pub version: u32,
    pub part_count: u32,
    pub image_info: String,
    pub chip_info: String,
    pub board_info: String,
    header_crc32: u32,
    parts_crc32: u32,
}

impl ImageHeader {
    fn parse(raw: &[u8; IMAGE_HEADER_SIZE]) -> Result<Self> {
        let magic = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        if magic != IMAGE_HEADER_MAGIC {
            return Err(Error::protocol(format!(
                "invalid image header magic {:#010x}",
                magic
            )));
        }

        let header_crc32 = u32::from_le_bytes(raw[4..8].try_into().unwrap());

        // The stored CRC covers the header with its own CRC field zeroed.
        let mut zeroed = *raw;
        zeroed[4..8].fill(0);
        let calculated = crc32(&zeroed);
        if calculated != header_crc32 {
            return Err(Error::protocol(format!(
                "invalid image header checksum, {:#010x} != {:#010x}",
                header_crc32, calculated
            )));
        }

        Ok(ImageHeader {
            flags: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
            version: u32::from_le_bytes(raw[12..16].try_into().unwrap()),
            part_count: u32::from_le_bytes(raw[16..20].try_into().unwrap()),
            parts_crc32: u32::from_le_bytes(raw[20..24].try_into().unwrap()),
            image_info: fixed_str(&raw[24..56]),
            chip_info: fixed_str(&raw[56..88]),
            board_info: fixed_str(&raw[88..152]),
            header_crc32,
        })
    }
}

/// Parsed 256-byte partition table entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartitionEntry {
    pub name: String,
    pub offset: u32,
    pub size: u32,
    pub erase_size: u32,
    pub max_size: u32,
    pub flags: u32,
    pub content_offset: u32,
    pub content_size: u32,
    pub content_sha256: [u8; 32],
}

impl PartitionEntry {
    fn parse(raw: &[u8]) -> Result<Self> {
        let magic = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        if magic != PARTITION_MAGIC {
            return Err(Error::protocol(format!(
                "invalid partition entry magic {:#010x}",
                magic
            )));
        }

        let entry = PartitionEntry {
            offset: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
            size: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
            erase_size: u32::from_le_bytes(raw[12..16].try_into().unwrap()),
            max_size: u32::from_le_bytes(raw[16..20].try_into().unwrap()),
            flags: u32::from_le_bytes(raw[20..24].try_into().unwrap()),
            content_offset: u32::from_le_bytes(raw[24..28].try_into().unwrap()),
            content_size: u32::from_le_bytes(raw[28..32].try_into().unwrap()),
            content_sha256: raw[32..64].try_into().unwrap(),
            name: fixed_str(&raw[64..96]),
        };

        if entry.content_size > entry.size {
            return Err(Error::protocol(format!(
                "partition '{}' content size {} exceeds partition size {}",
                entry.name, entry.content_size, entry.size
            )));
        }
        for (field, value) in [
            ("offset", entry.offset),
            ("size", entry.size),
            ("erase size", entry.erase_size),
        ] {
            if value % PARTITION_ALIGNMENT != 0 {
                warn!(
                    "partition '{}' {} {:#x} is not aligned to {:#x}",
                    entry.name, field, value, PARTITION_ALIGNMENT
                );
            }
        }

        Ok(entry)
    }
}

/// One burnable item: a partition extracted from the image into the cache
/// directory, in the form the UBOOT burner consumes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageItem {
    pub name: String,

    /// Offset of the partition on the medium.
    pub offset: u64,

    /// Reserved size of the partition on the medium (its max size).
    pub size: u64,

    pub erase_size: u64,

    /// Extracted file holding the partition body.
    pub path: PathBuf,

    /// Length of the extracted file: content plus `0xFF` tail padding.
    pub file_size: u64,
}

/// An opened, validated firmware image.
///
/// `open` reads and checks the header and partition table; partition
/// bodies stay in the file until [`items`] extracts them. The value owns
/// the open file, replacing the singleton of process-wide image state with
/// something that drops at the end of its scope.
///
/// [`items`]: Image::items
pub struct Image {
    pub(crate) file: File,
    header: ImageHeader,
    parts: Vec<PartitionEntry>,
}

impl Image {
    /// Opens an image file and parses its header and partition table.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path)?;

        let mut raw = [0u8; IMAGE_HEADER_SIZE];
        file.read_exact(&mut raw)?;
        let header = ImageHeader::parse(&raw)?;

        let mut table = vec![0u8; header.part_count as usize * PARTITION_ENTRY_SIZE];
        file.read_exact(&mut table)?;

        let calculated = crc32(&table);
        if calculated != header.parts_crc32 {
            return Err(Error::protocol(format!(
                "invalid partition table checksum, {:#010x} != {:#010x}",
                header.parts_crc32, calculated
            )));
        }

        let mut parts = table
            .chunks(PARTITION_ENTRY_SIZE)
            .map(PartitionEntry::parse)
            .collect::<Result<Vec<_>>>()?;
        parts.sort_by_key(|part| part.offset);

        for pair in parts.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            // max_size is the reserved footprint on the medium, the same
            // bound max_offset() reports
            if u64::from(a.offset) + u64::from(a.max_size) > u64::from(b.offset) {
                warn!("partitions '{}' and '{}' overlap", a.name, b.name);
            }
        }

        dump_header(&header);
        dump_parts(&parts);

        Ok(Image {
            file,
            header,
            parts,
        })
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    /// Partition entries, sorted by offset.
    pub fn partitions(&self) -> &[PartitionEntry] {
        &self.parts
    }

    /// Highest medium offset any partition may reach, the bound callers
    /// compare against the medium capacity before burning.
    pub fn max_offset(&self) -> u64 {
        self.parts
            .iter()
            .map(|part| u64::from(part.offset) + u64::from(part.max_size))
            .max()
            .unwrap_or(0)
    }
}

fn dump_header(header: &ImageHeader) {
    debug!("image header:");
    debug!("\tcrc32 {:#010x}", header.header_crc32);
    debug!("\tflags {:#x}", header.flags);
    debug!("\tversion {:#x}", header.version);
    debug!("\tpart count {}", header.part_count);
    debug!("\tpart table crc32 {:#010x}", header.parts_crc32);
    debug!("\timage info '{}'", header.image_info);
    debug!("\tchip info '{}'", header.chip_info);
    debug!("\tboard info '{}'", header.board_info);
}

fn dump_parts(parts: &[PartitionEntry]) {
    for part in parts {
        debug!("partition '{}':", part.name);
        debug!("\toffset {:#x}", part.offset);
        debug!("\tsize {:#x}", part.size);
        debug!("\terase size {:#x}", part.erase_size);
        debug!("\tmax size {:#x}", part.max_size);
        debug!("\tflags {:#x}", part.flags);
        debug!("\tcontent offset {:#x}", part.content_offset);
        debug!("\tcontent size {:#x}", part.content_size);
    }
}
