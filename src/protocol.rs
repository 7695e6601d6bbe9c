use crate::error::{Error, Result};

/// Responses carry the request command with this bit OR-ed in.
pub(crate) const CMD_FLAG_DEV_TO_HOST: u16 = 0x8000;

/// Magic value carried by the reboot command ("Rbot").
pub(crate) const REBOOT_MARK: u64 = 0x5262_6F74;

/// Result codes in a command status wrapper.
pub(crate) const RESULT_OK: u16 = 1;
pub(crate) const RESULT_ERROR_MSG: u16 = 0xFF;

/// Device-supplied error strings are kept to this many bytes.
pub(crate) const ERROR_MSG_SIZE: usize = 128;

/// Generation of the framed protocol the U-Boot loader speaks.
///
/// Version 0 loaders use a 64-byte wrapper with a one-byte size field and
/// only support probe/info/erase/buffered-write/reboot. Version 1 loaders
/// use a 60-byte wrapper with a two-byte size field and add chunked reads,
/// a partition-flag word on writes and separate IN/OUT chunk sizes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProtocolVersion {
    V0,
    V1,
}

impl ProtocolVersion {
    /// Exact wrapper size on the wire.
    pub(crate) fn wrapper_size(self) -> usize {
        match self {
            ProtocolVersion::V0 => 64,
            ProtocolVersion::V1 => 60,
        }
    }

    /// Bytes of inline data a wrapper can carry.
    pub(crate) fn data_capacity(self) -> usize {
        match self {
            ProtocolVersion::V0 => 59,
            ProtocolVersion::V1 => 54,
        }
    }

    /// Size of the leading `{cmd, result, data_size}` header.
    pub(crate) fn header_size(self) -> usize {
        self.wrapper_size() - self.data_capacity()
    }
}

/// Commands understood by the U-Boot loader. The LBA command codes swapped
/// places between the two protocol generations, so codes are resolved
/// through [`Command::code`] rather than a plain discriminant.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Command {
    Nop,
    Reboot,
    Probe,
    GetInfo,
    EraseLba,
    WriteLba,
    WriteLbaChunk,
    ReadLba,
    ReadLbaChunk,
}

impl Command {
    pub(crate) fn code(self, version: ProtocolVersion) -> u16 {
        match self {
            Command::Nop => 0x00,
            Command::Reboot => 0x01,
            Command::Probe => 0x10,
            Command::GetInfo => 0x11,
            Command::EraseLba => match version {
                ProtocolVersion::V0 => 0x21,
                ProtocolVersion::V1 => 0x20,
            },
            Command::WriteLba => match version {
                ProtocolVersion::V0 => 0x20,
                ProtocolVersion::V1 => 0x21,
            },
            Command::WriteLbaChunk => 0x22,
            Command::ReadLba => 0x23,
            Command::ReadLbaChunk => 0x24,
        }
    }
}

/// Builds a command block wrapper around `payload`.
pub(crate) fn encode_cbw(version: ProtocolVersion, cmd: u16, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > version.data_capacity() {
        return Err(Error::protocol(format!(
            "command data size too large: {}",
            payload.len()
        )));
    }

    let mut cbw = vec![0u8; version.wrapper_size()];
    cbw[0..2].copy_from_slice(&cmd.to_le_bytes());
    // result field stays zero in a CBW
    match version {
        ProtocolVersion::V0 => {
            cbw[4] = payload.len() as u8;
            cbw[5..5 + payload.len()].copy_from_slice(payload);
        }
        ProtocolVersion::V1 => {
            cbw[4..6].copy_from_slice(&(payload.len() as u16).to_le_bytes());
            cbw[6..6 + payload.len()].copy_from_slice(payload);
        }
    }
    Ok(cbw)
}

/// The `{cmd, result, data_size}` header leading every status wrapper.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FrameHeader {
    pub cmd: u16,
    pub result: u16,
    pub data_size: u16,
}

impl FrameHeader {
    pub(crate) fn parse(version: ProtocolVersion, raw: &[u8]) -> Result<Self> {
        if raw.len() < version.header_size() {
            return Err(Error::protocol("response shorter than frame header"));
        }
        let cmd = u16::from_le_bytes(raw[0..2].try_into().unwrap());
        let result = u16::from_le_bytes(raw[2..4].try_into().unwrap());
        let data_size = match version {
            ProtocolVersion::V0 => u16::from(raw[4]),
            ProtocolVersion::V1 => u16::from_le_bytes(raw[4..6].try_into().unwrap()),
        };
        Ok(FrameHeader {
            cmd,
            result,
            data_size,
        })
    }
}

/// A decoded command status wrapper.
#[derive(Clone, Debug)]
pub(crate) struct Csw {
    pub header: FrameHeader,
    pub data: Vec<u8>,
}

impl Csw {
    /// Decodes a status wrapper, clamping the advertised data size to the
    /// inline capacity of the wrapper.
    pub(crate) fn parse(version: ProtocolVersion, raw: &[u8]) -> Result<Self> {
        let header = FrameHeader::parse(version, raw)?;
        let offset = version.header_size();
        let available = raw.len() - offset;
        let len = (header.data_size as usize)
            .min(version.data_capacity())
            .min(available);
        Ok(Csw {
            header,
            data: raw[offset..offset + len].to_vec(),
        })
    }

    /// The NUL-terminated string carried in the data area (device error
    /// messages, write-end status), truncated to [`ERROR_MSG_SIZE`].
    pub(crate) fn message(&self) -> String {
        let end = self
            .data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.data.len());
        let mut msg = String::from_utf8_lossy(&self.data[..end]).into_owned();
        msg.truncate(ERROR_MSG_SIZE);
        msg
    }
}
