use std::io::Read;
use std::thread;
use std::time::Duration;

use log::{debug, error, info};

use crate::error::{Error, Result};
use crate::medium::{MediumInfo, MediumType, MEDIUM_INFO_WIRE_SIZE};
use crate::progress::{LogProgress, ProgressSink};
use crate::protocol::{
    encode_cbw, Command, Csw, FrameHeader, ProtocolVersion, CMD_FLAG_DEV_TO_HOST, REBOOT_MARK,
    RESULT_ERROR_MSG, RESULT_OK,
};
use crate::transport::UsbTransport;

/// WriteLba partition flag: SPI-NAND pages are transferred together with
/// their out-of-band area.
pub const SPI_NAND_WRITE_WITH_OOB: u64 = 0x01;

/// Vendor request reading the loader's protocol version (`wValue` selects
/// the version word).
const VERSION_PROBE_REQUEST: u8 = 0;
const VERSION_PROBE_VALUE: u16 = 1;

/// Command timeout until `GetInfo` supplies the medium's own value.
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Short read draining a stale response before a nop.
const NOP_DRAIN_TIMEOUT: Duration = Duration::from_millis(50);

const ERASE_RETRY_SLEEP: Duration = Duration::from_secs(3);
const READ_RETRY_SLEEP: Duration = Duration::from_secs(1);
const READ_RETRIES: usize = 3;

/// The loader needs a moment between accepting a write configuration and
/// the first data chunk.
const WRITE_START_SETTLE: Duration = Duration::from_millis(100);

fn round_down(value: u64, multiple: u64) -> u64 {
    value - (value % multiple)
}

fn round_up(value: u64, multiple: u64) -> u64 {
    value.div_ceil(multiple) * multiple
}

/// Rounds an erase range outward to erase-unit boundaries.
pub(crate) fn align_erase_range(offset: u64, size: u64, erase_size: u64) -> (u64, u64) {
    (
        round_down(offset, erase_size),
        round_up(size, erase_size),
    )
}

/// Burner for a device in UBOOT mode, speaking the framed command protocol
/// over the bulk endpoint pair.
///
/// Construction probes the loader's protocol version and issues a nop to
/// clear any error state left over from a previous session. All commands
/// are strictly ordered; no command is issued before the previous one's
/// terminating status has been consumed.
pub struct UbootBurner<U: UsbTransport> {
    usb: U,
    version: ProtocolVersion,
    medium: MediumType,
    info: Option<MediumInfo>,
    out_chunk_size: u64,
    in_chunk_size: u64,
    timeout: Duration,
    last_error: String,
    rd_buffer: Vec<u8>,
    progress: Box<dyn ProgressSink>,
}

impl<U: UsbTransport> UbootBurner<U> {
    pub fn new(mut usb: U) -> Self {
        let version = probe_version(&mut usb);
        info!("loader protocol version {:?}", version);

        let mut burner = Self {
            usb,
            version,
            medium: MediumType::Invalid,
            info: None,
            out_chunk_size: 512,
            in_chunk_size: 512,
            timeout: DEFAULT_TIMEOUT,
            last_error: String::new(),
            rd_buffer: Vec::new(),
            progress: Box::new(LogProgress::new()),
        };

        // clear error status left by a previous session
        burner.nop();

        burner
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    /// Selects the medium to probe and burn.
    pub fn set_medium_type(&mut self, medium: MediumType) {
        self.medium = medium;
    }

    /// Replaces the progress sink.
    pub fn set_progress_sink(&mut self, sink: Box<dyn ProgressSink>) {
        self.progress = sink;
    }

    /// The most recent device-supplied error string.
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    /// Negotiated `(out, in)` chunk sizes. Meaningful after [`probe`].
    ///
    /// [`probe`]: UbootBurner::probe
    pub fn chunk_sizes(&self) -> (u64, u64) {
        (self.out_chunk_size, self.in_chunk_size)
    }

    /// Re-synchronizes the channel: drains a stale response the device may
    /// still have queued, then exchanges a nop that clears its error state.
    ///
    /// The whole exchange is best effort. A healthy device answers with an
    /// OK status, but a failure here must not abort the session, so the
    /// result is discarded without logging.
    pub fn nop(&mut self) {
        debug!("issue a nop command, clear device error status");

        // A stale response is normal here; read it silently and move on.
        let mut stale = vec![0u8; self.version.wrapper_size()];
        let _ = self.usb.bulk_in(&mut stale, NOP_DRAIN_TIMEOUT);

        if let Ok(cbw) = encode_cbw(self.version, Command::Nop.code(self.version), &[]) {
            if self.send_bulk(&cbw).is_ok() {
                let _ = self.read_csw();
            }
        }
    }

    /// Negotiates the medium with the loader. On success the loader
    /// reports its transfer chunk sizes: one size for both directions on
    /// version 0, separate OUT and IN sizes on version 1. Failure means
    /// the selected medium is not wired on this board.
    pub fn probe(&mut self) -> Result<()> {
        debug!("probe medium {}", self.medium);

        let payload = [self.medium as u8, 0xFF];
        let csw = self.send_cmd(Command::Probe, &payload)?;

        match self.version {
            ProtocolVersion::V0 => {
                if csw.data.len() != 8 {
                    return Err(Error::protocol("probe result size mismatch"));
                }
                let chunk = u64::from_le_bytes(csw.data[0..8].try_into().unwrap());
                self.out_chunk_size = chunk;
                self.in_chunk_size = chunk;
            }
            ProtocolVersion::V1 => {
                if csw.data.len() != 16 {
                    return Err(Error::protocol("probe result size mismatch"));
                }
                self.out_chunk_size = u64::from_le_bytes(csw.data[0..8].try_into().unwrap());
                self.in_chunk_size = u64::from_le_bytes(csw.data[8..16].try_into().unwrap());
            }
        }

        info!(
            "probe ok, out chunk {}, in chunk {}",
            self.out_chunk_size, self.in_chunk_size
        );
        Ok(())
    }

    /// Queries the medium geometry, caching it for the rest of the session.
    /// The reported per-command timeout replaces the default from here on.
    pub fn medium_info(&mut self) -> Result<MediumInfo> {
        if let Some(info) = self.info {
            return Ok(info);
        }

        let csw = self.send_cmd(Command::GetInfo, &[])?;
        if csw.data.len() != MEDIUM_INFO_WIRE_SIZE {
            return Err(Error::protocol(format!(
                "medium info result size mismatch, {} != {}",
                csw.data.len(),
                MEDIUM_INFO_WIRE_SIZE
            )));
        }
        let info = MediumInfo::from_wire(&csw.data)?;

        info!(
            "medium info: capacity {}, block size {}, erase size {}, write protect {}",
            info.capacity, info.block_size, info.erase_size, info.write_protected
        );

        if info.timeout_ms > 0 {
            self.timeout = Duration::from_millis(u64::from(info.timeout_ms));
        }
        self.info = Some(info);
        Ok(info)
    }

    /// Erases a range of the medium. `offset` is rounded down and `size`
    /// up to erase-unit boundaries. Erasing is slow; every time the status
    /// read times out the burner sleeps and retries, up to `max_retry`
    /// times. Callers typically budget `size / 4096` retries.
    pub fn erase(&mut self, offset: u64, size: u64, max_retry: usize) -> Result<()> {
        let info = self.medium_info()?;

        info!("erase medium, offset {}, size {}", offset, size);

        if offset.checked_add(size).map_or(true, |end| end > info.capacity) {
            return Err(Error::precondition("erase range exceeds medium capacity"));
        }
        if info.write_protected {
            return Err(Error::precondition("medium is write protected"));
        }

        let (offset, size) = align_erase_range(offset, size, info.erase_size);

        let mut payload = [0u8; 16];
        payload[0..8].copy_from_slice(&offset.to_le_bytes());
        payload[8..16].copy_from_slice(&size.to_le_bytes());

        let cbw = encode_cbw(self.version, Command::EraseLba.code(self.version), &payload)?;
        self.send_bulk(&cbw)?;

        let mut retries = 0;
        let csw = loop {
            match self.read_csw() {
                Ok(csw) => break csw,
                Err(Error::Timeout) if retries < max_retry => {
                    retries += 1;
                    debug!("erase status read timed out, retry {}", retries);
                    thread::sleep(ERASE_RETRY_SLEEP);
                }
                Err(err) => {
                    error!("erase status read failed: {}", err);
                    return Err(err);
                }
            }
        };

        self.check_resp(Command::EraseLba, csw)?;
        Ok(())
    }

    /// Writes `data` to the medium at `offset`, padding up to a whole
    /// number of blocks.
    pub fn write(&mut self, data: &[u8], offset: u64) -> Result<()> {
        self.write_stream(std::io::Cursor::new(data), data.len() as u64, offset, 0, 0)
    }

    /// Streams `size` bytes from `source` to the medium at `offset`.
    ///
    /// The transfer length is rounded up to a whole number of blocks and
    /// the tail padded with zeros if `source` runs short. `max_size` is the
    /// partition ceiling forwarded to version 1 loaders (0 when unknown);
    /// `part_flags` carries per-partition flags such as
    /// [`SPI_NAND_WRITE_WITH_OOB`], which makes every transfer an integral
    /// number of page-plus-OOB units. Version 0 loaders take neither word.
    pub fn write_stream<R: Read>(
        &mut self,
        mut source: R,
        size: u64,
        offset: u64,
        max_size: u64,
        part_flags: u64,
    ) -> Result<()> {
        let info = self.medium_info()?;

        if offset.checked_add(size).map_or(true, |end| end > info.capacity) {
            return Err(Error::precondition("write range exceeds medium capacity"));
        }
        if info.write_protected {
            return Err(Error::precondition("medium is write protected"));
        }
        if offset % info.erase_size != 0 {
            return Err(Error::precondition(format!(
                "write offset {} is not aligned to erase size {}",
                offset, info.erase_size
            )));
        }

        let mut block_size = info.block_size;
        let mut chunk_size = self.out_chunk_size;
        if self.version == ProtocolVersion::V1
            && info.medium_type == MediumType::SpiNand
            && part_flags & SPI_NAND_WRITE_WITH_OOB != 0
        {
            // Page and OOB travel together, so every bulk transfer has to
            // be an integral number of page+OOB units.
            let unit = info.block_size;
            if chunk_size / unit < 2 {
                return Err(Error::precondition(
                    "chunk size too small for page-plus-OOB transfers",
                ));
            }
            chunk_size = (chunk_size / unit - 1) * unit;
            block_size = unit;
        }

        let aligned_size = round_up(size, block_size);

        let mut payload = Vec::with_capacity(32);
        payload.extend_from_slice(&offset.to_le_bytes());
        payload.extend_from_slice(&aligned_size.to_le_bytes());
        if self.version == ProtocolVersion::V1 {
            payload.extend_from_slice(&max_size.to_le_bytes());
            payload.extend_from_slice(&part_flags.to_le_bytes());
        }

        self.send_cmd(Command::WriteLba, &payload)?;
        info!(
            "write medium configured, offset {}, size {} ({} aligned)",
            offset, size, aligned_size
        );
        thread::sleep(WRITE_START_SETTLE);

        self.progress.progress(0, aligned_size);

        let mut buf = vec![0u8; chunk_size as usize];
        let mut sent = 0u64;
        while sent < aligned_size {
            let want = (aligned_size - sent).min(chunk_size) as usize;
            fill_chunk(&mut source, &mut buf[..want])?;

            if let Err(err) = self.send_bulk(&buf[..want]) {
                error!("write chunk failed at {}", sent);
                return Err(self.write_failure(err));
            }

            sent += want as u64;
            self.progress.progress(sent, aligned_size);
        }

        let csw = self.read_csw()?;
        let csw = self.check_resp(Command::WriteLba, csw)?;
        info!("write end, status '{}'", csw.message());

        self.nop();
        Ok(())
    }

    /// Reads `buf.len()` bytes from the medium at `offset`. Only version 1
    /// loaders implement the chunked read commands.
    pub fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        if self.version == ProtocolVersion::V0 {
            return Err(Error::Unsupported("chunked read requires a version 1 loader"));
        }

        let info = self.medium_info()?;
        let size = buf.len() as u64;

        if offset.checked_add(size).map_or(true, |end| end > info.capacity) {
            return Err(Error::precondition("read range exceeds medium capacity"));
        }

        let mut payload = [0u8; 16];
        payload[0..8].copy_from_slice(&offset.to_le_bytes());
        payload[8..16].copy_from_slice(&size.to_le_bytes());
        self.send_cmd(Command::ReadLba, &payload)?;

        let header_size = self.version.header_size();
        let expected_cmd = Command::ReadLbaChunk.code(self.version) | CMD_FLAG_DEV_TO_HOST;

        let mut received = 0u64;
        while received < size {
            let want = (size - received).min(self.in_chunk_size) as usize;
            let total = header_size + want;
            if self.rd_buffer.len() < total {
                self.rd_buffer.resize(total, 0);
            }

            let mut retries = 0;
            let n = loop {
                match self.usb.bulk_in(&mut self.rd_buffer[..total], self.timeout) {
                    Ok(n) => break n,
                    Err(Error::Timeout) if retries < READ_RETRIES => {
                        retries += 1;
                        debug!("read chunk timed out, retry {}", retries);
                        thread::sleep(READ_RETRY_SLEEP);
                    }
                    Err(err) => return Err(err),
                }
            };
            if n != total {
                return Err(Error::protocol(format!(
                    "read chunk size mismatch, {} != {}",
                    n, total
                )));
            }

            let header = FrameHeader::parse(self.version, &self.rd_buffer[..n])?;
            if header.cmd != expected_cmd {
                return Err(Error::protocol("resp cmd"));
            }
            if header.result != RESULT_OK {
                let csw = Csw::parse(self.version, &self.rd_buffer[..n])?;
                return Err(self.device_error(&csw));
            }
            if header.data_size != want as u16 {
                return Err(Error::protocol(format!(
                    "read chunk reported size mismatch, {} != {}",
                    header.data_size, want
                )));
            }

            buf[received as usize..received as usize + want]
                .copy_from_slice(&self.rd_buffer[header_size..header_size + want]);
            received += want as u64;
        }

        let csw = self.read_csw()?;
        if csw.header.cmd != expected_cmd {
            return Err(Error::protocol("resp cmd"));
        }
        if csw.header.result != RESULT_OK {
            return Err(self.device_error(&csw));
        }
        Ok(())
    }

    /// Resets the chip. The device disconnects without answering.
    pub fn reboot(&mut self) -> Result<()> {
        info!("reboot device");

        let payload = REBOOT_MARK.to_le_bytes();
        let cbw = encode_cbw(self.version, Command::Reboot.code(self.version), &payload)?;
        self.send_bulk(&cbw)
    }

    /// Bulk OUT with the version 1 zero-length-packet quirk: a transfer
    /// that is an exact multiple of the endpoint's max packet size is
    /// followed by an empty transfer to mark the end.
    fn send_bulk(&mut self, data: &[u8]) -> Result<()> {
        self.usb.bulk_out(data, self.timeout)?;

        if self.version == ProtocolVersion::V1 {
            let mps = self.usb.max_out_packet_size();
            if !data.is_empty() && mps > 0 && data.len() % mps == 0 {
                self.usb.bulk_out(&[], self.timeout)?;
            }
        }
        Ok(())
    }

    fn read_csw(&mut self) -> Result<Csw> {
        let size = self.version.wrapper_size();
        let mut raw = vec![0u8; size];
        let n = self.usb.bulk_in(&mut raw, self.timeout)?;
        if n != size {
            return Err(Error::protocol(format!(
                "status wrapper size mismatch, {} != {}",
                n, size
            )));
        }
        Csw::parse(self.version, &raw)
    }

    fn send_cmd(&mut self, cmd: Command, payload: &[u8]) -> Result<Csw> {
        let cbw = encode_cbw(self.version, cmd.code(self.version), payload)?;
        self.send_bulk(&cbw)?;
        let csw = self.read_csw()?;
        self.check_resp(cmd, csw)
    }

    fn check_resp(&mut self, cmd: Command, csw: Csw) -> Result<Csw> {
        let expected = cmd.code(self.version) | CMD_FLAG_DEV_TO_HOST;
        if csw.header.cmd != expected {
            error!(
                "command {:?} answered with cmd {:#06x}",
                cmd, csw.header.cmd
            );
            return Err(Error::protocol("resp cmd"));
        }
        if csw.header.result != RESULT_OK {
            return Err(self.device_error(&csw));
        }
        Ok(csw)
    }

    fn device_error(&mut self, csw: &Csw) -> Error {
        if csw.header.result == RESULT_ERROR_MSG {
            let message = csw.message();
            error!("device reported: {}", message);
            self.last_error = message.clone();
            Error::Device {
                code: csw.header.result,
                message: Some(message),
            }
        } else {
            error!("device result {:#06x}", csw.header.result);
            Error::Device {
                code: csw.header.result,
                message: None,
            }
        }
    }

    /// A failed mid-stream chunk usually means the device aborted the
    /// write; one more read often retrieves a status explaining why.
    fn write_failure(&mut self, err: Error) -> Error {
        let size = self.version.wrapper_size();
        let mut raw = vec![0u8; size];
        match self.usb.bulk_in(&mut raw, self.timeout) {
            Ok(n) if n == size => match Csw::parse(self.version, &raw) {
                Ok(csw) if csw.header.result != RESULT_OK => self.device_error(&csw),
                _ => err,
            },
            _ => err,
        }
    }
}

fn probe_version<U: UsbTransport>(usb: &mut U) -> ProtocolVersion {
    let mut buf = [0u8; 4];
    match usb.control_in(
        VERSION_PROBE_REQUEST,
        VERSION_PROBE_VALUE,
        0,
        &mut buf,
        DEFAULT_TIMEOUT,
    ) {
        Ok(4) => {
            if u32::from_le_bytes(buf) == 0 {
                ProtocolVersion::V0
            } else {
                ProtocolVersion::V1
            }
        }
        _ => ProtocolVersion::V0,
    }
}

/// Fills `buf` from `source`, zero-padding whatever the source no longer
/// provides.
fn fill_chunk<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf[filled..].fill(0);
    Ok(())
}
