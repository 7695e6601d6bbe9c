use std::fmt;

use crate::error::{Error, Result};

/// The kind of off-chip non-volatile medium a partition is burned to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum MediumType {
    Invalid = 0,
    Emmc = 1,
    SdCard = 2,
    SpiNand = 3,
    SpiNor = 4,
    Otp = 5,
}

impl MediumType {
    pub(crate) fn from_wire(value: u8) -> Self {
        match value {
            1 => MediumType::Emmc,
            2 => MediumType::SdCard,
            3 => MediumType::SpiNand,
            4 => MediumType::SpiNor,
            5 => MediumType::Otp,
            _ => MediumType::Invalid,
        }
    }
}

impl fmt::Display for MediumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MediumType::Invalid => "INVALID",
            MediumType::Emmc => "EMMC",
            MediumType::SdCard => "SDCARD",
            MediumType::SpiNand => "SPI_NAND",
            MediumType::SpiNor => "SPI_NOR",
            MediumType::Otp => "OTP",
        };
        f.write_str(name)
    }
}

/// Geometry and state of the probed medium, as reported by the `GetInfo`
/// command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MediumInfo {
    /// Total capacity in bytes, a multiple of `erase_size`.
    pub capacity: u64,

    /// Smallest writable unit in bytes.
    pub block_size: u64,

    /// Smallest erasable unit in bytes, a multiple of `block_size`.
    pub erase_size: u64,

    /// Per-command timeout the device asks the host to use.
    pub timeout_ms: u32,

    /// Whether the medium is write protected.
    pub write_protected: bool,

    pub medium_type: MediumType,

    pub valid: bool,
}

/// Size of the `GetInfo` response payload on the wire.
pub(crate) const MEDIUM_INFO_WIRE_SIZE: usize = 32;

fn read_u64(input: &mut &[u8]) -> u64 {
    let (bytes, rest) = input.split_at(8);
    *input = rest;
    u64::from_le_bytes(bytes.try_into().unwrap())
}

impl MediumInfo {
    /// Parses the 32-byte wire representation: three little-endian `u64`
    /// values followed by one packed `u64` holding, from the least
    /// significant bit up, timeout (32 bits), write-protect (8), medium
    /// type (7) and a validity flag (1).
    pub(crate) fn from_wire(raw: &[u8]) -> Result<Self> {
        if raw.len() != MEDIUM_INFO_WIRE_SIZE {
            return Err(Error::protocol(format!(
                "medium info size mismatch, {} != {}",
                raw.len(),
                MEDIUM_INFO_WIRE_SIZE
            )));
        }

        let mut input = raw;
        let capacity = read_u64(&mut input);
        let block_size = read_u64(&mut input);
        let erase_size = read_u64(&mut input);
        let packed = read_u64(&mut input);

        let info = MediumInfo {
            capacity,
            block_size,
            erase_size,
            timeout_ms: packed as u32,
            write_protected: (packed >> 32) as u8 != 0,
            medium_type: MediumType::from_wire(((packed >> 40) & 0x7f) as u8),
            valid: (packed >> 47) & 0x01 != 0,
        };

        if info.block_size == 0 {
            return Err(Error::protocol("medium info has zero block size"));
        }
        if info.erase_size == 0 || info.erase_size % info.block_size != 0 {
            return Err(Error::protocol(format!(
                "erase size {} is not a multiple of block size {}",
                info.erase_size, info.block_size
            )));
        }
        if info.capacity % info.erase_size != 0 {
            return Err(Error::protocol(format!(
                "capacity {} is not a multiple of erase size {}",
                info.capacity, info.erase_size
            )));
        }

        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(
        capacity: u64,
        block_size: u64,
        erase_size: u64,
        timeout_ms: u32,
        wp: bool,
        medium_type: MediumType,
        valid: bool,
    ) -> Vec<u8> {
        let mut raw = Vec::with_capacity(MEDIUM_INFO_WIRE_SIZE);
        raw.extend_from_slice(&capacity.to_le_bytes());
        raw.extend_from_slice(&block_size.to_le_bytes());
        raw.extend_from_slice(&erase_size.to_le_bytes());
        let packed = timeout_ms as u64
            | (u64::from(wp) << 32)
            | ((medium_type as u64 & 0x7f) << 40)
            | (u64::from(valid) << 47);
        raw.extend_from_slice(&packed.to_le_bytes());
        raw
    }

    #[test]
    fn parses_packed_fields() {
        let raw = wire(3_909_091_328, 512, 4096, 1000, false, MediumType::Emmc, true);
        let info = MediumInfo::from_wire(&raw).unwrap();
        assert_eq!(info.capacity, 3_909_091_328);
        assert_eq!(info.block_size, 512);
        assert_eq!(info.erase_size, 4096);
        assert_eq!(info.timeout_ms, 1000);
        assert!(!info.write_protected);
        assert_eq!(info.medium_type, MediumType::Emmc);
        assert!(info.valid);
    }

    #[test]
    fn parses_write_protect() {
        let raw = wire(1 << 20, 512, 4096, 10, true, MediumType::SpiNor, true);
        let info = MediumInfo::from_wire(&raw).unwrap();
        assert!(info.write_protected);
        assert_eq!(info.medium_type, MediumType::SpiNor);
    }

    #[test]
    fn rejects_zero_block_size() {
        let raw = wire(1 << 20, 0, 4096, 10, false, MediumType::Emmc, true);
        assert!(MediumInfo::from_wire(&raw).is_err());
    }

    #[test]
    fn rejects_unaligned_erase_size() {
        let raw = wire(1 << 20, 512, 4097, 10, false, MediumType::Emmc, true);
        assert!(MediumInfo::from_wire(&raw).is_err());
    }

    #[test]
    fn rejects_unaligned_capacity() {
        let raw = wire((1 << 20) + 512, 512, 4096, 10, false, MediumType::Emmc, true);
        assert!(MediumInfo::from_wire(&raw).is_err());
    }

    #[test]
    fn rejects_short_payload() {
        assert!(MediumInfo::from_wire(&[0u8; 16]).is_err());
    }
}
