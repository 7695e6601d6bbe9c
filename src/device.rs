use std::fmt;
use std::thread;
use std::time::Duration;

use log::{debug, error, warn};

use crate::error::{Error, Result};
use crate::transport::UsbTransport;
use crate::TIMEOUT;

/// Default USB vendor id of the K230.
pub const K230_VID: u16 = 0x29F1;
/// Default USB product id of the K230.
pub const K230_PID: u16 = 0x0230;

/// The bulk endpoint pair this device family exposes. Endpoint discovery
/// normally confirms these; they are the fallback when a configuration
/// descriptor does not list a direction.
const DEFAULT_IN_ENDPOINT: u8 = 0x81;
const DEFAULT_OUT_ENDPOINT: u8 = 0x01;

/// Vendor request reading the NUL-terminated chip-info string.
const EP0_GET_CPU_INFO: u8 = 0;

const CHIP_INFO_RETRIES: usize = 5;
const CHIP_INFO_RETRY_DELAY: Duration = Duration::from_millis(100);
const OPEN_RETRIES: usize = 3;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);
const CLAIM_RETRIES: usize = 20;
const CLAIM_RETRY_DELAY: Duration = Duration::from_millis(500);

/// USB personality a device currently presents.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceKind {
    /// Not a recognized K230 personality.
    Invalid,
    /// Boot ROM: accepts SRAM uploads and jumps to them.
    Brom,
    /// Second-stage loader: speaks the framed burning protocol.
    Uboot,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Invalid => "INVALID",
            DeviceKind::Brom => "BROM",
            DeviceKind::Uboot => "UBOOT",
        };
        f.write_str(name)
    }
}

/// Identity of an enumerated device: USB ids, the stable bus-port path the
/// host assigned, and the personality it answered the identity probe with.
///
/// The path is what survives the BROM→UBOOT re-enumeration, so it is the
/// key used to find the same physical device again.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceInfo {
    pub vid: u16,
    pub pid: u16,
    pub path: String,
    pub kind: DeviceKind,
}

impl DeviceInfo {
    /// Opens and claims the device this info describes. The device is
    /// re-located by its bus-port path, so this works across the
    /// re-enumeration that follows a BROM jump.
    pub fn open<T: rusb::UsbContext>(&self, context: &T) -> Result<DeviceHandle<T>> {
        for device in context.devices()?.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(_) => continue,
            };
            if descriptor.vendor_id() != self.vid || descriptor.product_id() != self.pid {
                continue;
            }
            if device_path(&device) != self.path {
                continue;
            }
            return DeviceHandle::from_usb_device(device);
        }
        Err(Error::DeviceNotFound)
    }
}

/// Bus-port location string, e.g. `"1-2"`.
pub(crate) fn device_path<T: rusb::UsbContext>(device: &rusb::Device<T>) -> String {
    format!("{}-{}", device.bus_number(), device.port_number())
}

/// Classifies a chip-info string.
pub(crate) fn classify(info: &str) -> DeviceKind {
    if info.starts_with("Uboot Stage for K230") {
        DeviceKind::Uboot
    } else if info.starts_with("K230") {
        DeviceKind::Brom
    } else {
        DeviceKind::Invalid
    }
}

/// Chip-info retry loop shared between claimed handles and the raw handles
/// used during enumeration.
fn chip_info_from<F>(mut read: F) -> Result<String>
where
    F: FnMut(&mut [u8]) -> Result<usize>,
{
    let mut buf = [0u8; 32];
    let mut last_err = Error::Timeout;

    for attempt in 0..CHIP_INFO_RETRIES {
        match read(&mut buf) {
            Ok(n) => {
                let end = buf[..n].iter().position(|&b| b == 0).unwrap_or(n);
                return Ok(String::from_utf8_lossy(&buf[..end]).into_owned());
            }
            Err(err) => {
                debug!("read chip info failed (attempt {}): {}", attempt + 1, err);
                last_err = err;
                thread::sleep(CHIP_INFO_RETRY_DELAY);
            }
        }
    }

    Err(last_err)
}

/// Reads the chip-info string through any transport, retrying while the
/// device settles.
pub(crate) fn probe_chip_info<U: UsbTransport>(usb: &mut U) -> Result<String> {
    chip_info_from(|buf| usb.control_in(EP0_GET_CPU_INFO, 0, 0, buf, TIMEOUT))
}

/// Same probe over a bare, unclaimed `rusb` handle. Enumeration classifies
/// devices without claiming them, since the identity request only touches
/// endpoint 0.
pub(crate) fn read_chip_info_raw<T: rusb::UsbContext>(
    handle: &rusb::DeviceHandle<T>,
) -> Result<String> {
    let request_type = rusb::request_type(
        rusb::Direction::In,
        rusb::RequestType::Vendor,
        rusb::Recipient::Device,
    );
    chip_info_from(|buf| {
        Ok(handle.read_control(request_type, EP0_GET_CPU_INFO, 0, 0, buf, TIMEOUT)?)
    })
}

/// Identity probe: chip-info string plus its classification.
pub(crate) fn probe_kind<U: UsbTransport>(usb: &mut U) -> DeviceKind {
    match probe_chip_info(usb) {
        Ok(info) => {
            let kind = classify(&info);
            debug!("chip info '{}', kind {}", info, kind);
            kind
        }
        Err(err) => {
            debug!("chip info probe failed: {}", err);
            DeviceKind::Invalid
        }
    }
}

/// An opened and claimed device.
///
/// While a handle exists, interface 0 is claimed and the kernel driver (if
/// the host had one bound) is detached. Dropping the handle releases the
/// claim and closes the device.
pub struct DeviceHandle<T: rusb::UsbContext> {
    handle: rusb::DeviceHandle<T>,

    /// Address of the bulk IN endpoint.
    ep_in: u8,

    /// Address of the bulk OUT endpoint.
    ep_out: u8,

    /// Max packet size of the bulk OUT endpoint.
    ep_out_mps: u16,
}

impl<T: rusb::UsbContext> DeviceHandle<T> {
    pub(crate) fn from_usb_device(device: rusb::Device<T>) -> Result<Self> {
        // A device fresh out of enumeration may still be settling; give the
        // open a few tries before reporting it.
        let mut handle = None;
        for attempt in 0..OPEN_RETRIES {
            match device.open() {
                Ok(h) => {
                    handle = Some(h);
                    break;
                }
                Err(err) => {
                    warn!("open usb device failed (attempt {}): {}", attempt + 1, err);
                    thread::sleep(OPEN_RETRY_DELAY);
                }
            }
        }
        let mut handle = match handle {
            Some(handle) => handle,
            None => return Err(Error::Usb(rusb::Error::NoDevice)),
        };

        if rusb::supports_detach_kernel_driver() {
            match handle.kernel_driver_active(0) {
                Ok(true) => match handle.detach_kernel_driver(0) {
                    Ok(()) | Err(rusb::Error::NotFound) => {
                        debug!("kernel driver detached");
                    }
                    Err(err) => {
                        error!("detach kernel driver failed: {}", err);
                        return Err(err.into());
                    }
                },
                Ok(false) => {}
                Err(rusb::Error::NotSupported) => {
                    debug!("host does not support kernel driver detach");
                }
                Err(err) => {
                    warn!("kernel driver query failed: {}", err);
                }
            }
        }

        // A previous session may still be releasing the interface, so the
        // claim is retried for a while before giving up with Busy.
        let mut claimed = false;
        for attempt in 0..CLAIM_RETRIES {
            match handle.claim_interface(0) {
                Ok(()) => {
                    debug!("claim interface success, tried {} times", attempt + 1);
                    claimed = true;
                    break;
                }
                Err(err) => {
                    debug!("claim interface failed: {}", err);
                    thread::sleep(CLAIM_RETRY_DELAY);
                }
            }
        }
        if !claimed {
            error!("can not claim interface, another program is using this port");
            return Err(Error::Busy);
        }

        let mut opened = DeviceHandle {
            handle,
            ep_in: DEFAULT_IN_ENDPOINT,
            ep_out: DEFAULT_OUT_ENDPOINT,
            ep_out_mps: 512,
        };
        opened.discover_endpoints(&device)?;

        debug!(
            "device opened, ep_in {:#04x}, ep_out {:#04x}, out mps {}",
            opened.ep_in, opened.ep_out, opened.ep_out_mps
        );

        Ok(opened)
    }

    /// Walks the active configuration and records the bulk endpoint pair.
    /// The device only exposes one pair; if a descriptor were to list
    /// several, the last one wins.
    fn discover_endpoints(&mut self, device: &rusb::Device<T>) -> Result<()> {
        let config = device.active_config_descriptor()?;
        for interface in config.interfaces() {
            for descriptor in interface.descriptors() {
                for endpoint in descriptor.endpoint_descriptors() {
                    if endpoint.transfer_type() != rusb::TransferType::Bulk {
                        continue;
                    }
                    match endpoint.direction() {
                        rusb::Direction::In => self.ep_in = endpoint.address(),
                        rusb::Direction::Out => {
                            self.ep_out = endpoint.address();
                            self.ep_out_mps = endpoint.max_packet_size();
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// The raw chip-info string the device identifies itself with.
    pub fn chip_info(&mut self) -> Result<String> {
        probe_chip_info(self)
    }

    /// Classifies the opened device by its chip-info string.
    pub fn kind(&mut self) -> DeviceKind {
        probe_kind(self)
    }

    /// Releases the interface and closes the device.
    pub fn close(self) {}
}

impl<T: rusb::UsbContext> Drop for DeviceHandle<T> {
    fn drop(&mut self) {
        if let Err(err) = self.handle.release_interface(0) {
            debug!("release interface failed: {}", err);
        }
    }
}

impl<T: rusb::UsbContext> UsbTransport for DeviceHandle<T> {
    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let request_type = rusb::request_type(
            rusb::Direction::In,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );
        Ok(self
            .handle
            .read_control(request_type, request, value, index, buf, timeout)?)
    }

    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        timeout: Duration,
    ) -> Result<()> {
        let request_type = rusb::request_type(
            rusb::Direction::Out,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );
        self.handle
            .write_control(request_type, request, value, index, &[], timeout)?;
        Ok(())
    }

    fn bulk_out(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        let written = self.handle.write_bulk(self.ep_out, data, timeout)?;
        if written != data.len() {
            return Err(Error::protocol(format!(
                "short bulk write, {} != {}",
                written,
                data.len()
            )));
        }
        Ok(written)
    }

    fn bulk_in(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        Ok(self.handle.read_bulk(self.ep_in, buf, timeout)?)
    }

    fn max_out_packet_size(&self) -> usize {
        usize::from(self.ep_out_mps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockTransport, Reply};

    #[test]
    fn classifies_uboot_before_brom() {
        assert_eq!(classify("Uboot Stage for K230"), DeviceKind::Uboot);
        assert_eq!(classify("Uboot Stage for K230 v1.2"), DeviceKind::Uboot);
        assert_eq!(classify("K230"), DeviceKind::Brom);
        assert_eq!(classify("K230 BROM"), DeviceKind::Brom);
        assert_eq!(classify("something else"), DeviceKind::Invalid);
        assert_eq!(classify(""), DeviceKind::Invalid);
    }

    #[test]
    fn chip_info_stops_at_nul() {
        let mut usb = MockTransport::new();
        let mut payload = b"K230\0".to_vec();
        payload.resize(32, 0xA5);
        usb.push_control_reply(Reply::Data(payload));

        let info = probe_chip_info(&mut usb).unwrap();
        assert_eq!(info, "K230");
    }

    #[test]
    fn chip_info_retries_then_succeeds() {
        let mut usb = MockTransport::new();
        usb.push_control_reply(Reply::Timeout);
        usb.push_control_reply(Reply::Data(b"Uboot Stage for K230\0".to_vec()));

        assert_eq!(probe_kind(&mut usb), DeviceKind::Uboot);
        assert_eq!(usb.transfers.len(), 2);
    }

    #[test]
    fn probe_kind_invalid_when_device_stays_silent() {
        let mut usb = MockTransport::new();
        assert_eq!(probe_kind(&mut usb), DeviceKind::Invalid);
    }
}
