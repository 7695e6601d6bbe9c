use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::device::{
    classify, device_path, read_chip_info_raw, DeviceInfo, DeviceKind, K230_PID, K230_VID,
};
use crate::error::{Error, Result};

const ENUM_OPEN_RETRIES: usize = 3;
const ENUM_OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Base trait for a USB context.
pub trait UsbContext: rusb::UsbContext {
    /// Returns information about all connected K230 devices, classified by
    /// the identity probe. Each matching device is briefly opened for the
    /// probe and closed again; nothing is claimed.
    ///
    /// It returns [`Error::Usb`] on USB errors during device enumeration.
    ///
    /// [`Error::Usb`]: crate::Error::Usb
    fn find_devices(&self) -> Result<Vec<DeviceInfo>> {
        self.find_devices_with_ids(K230_VID, K230_PID)
    }

    /// Like [`find_devices`], but for a non-default VID/PID pair.
    ///
    /// [`find_devices`]: #method.find_devices
    fn find_devices_with_ids(&self, vid: u16, pid: u16) -> Result<Vec<DeviceInfo>> {
        let mut found = Vec::new();

        for device in self.devices()?.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(_) => continue,
            };
            if descriptor.vendor_id() != vid || descriptor.product_id() != pid {
                continue;
            }

            let path = device_path(&device);

            // The device may still be settling right after it appeared on
            // the bus, so the probe open gets a few tries.
            let mut handle = None;
            for _ in 0..ENUM_OPEN_RETRIES {
                match device.open() {
                    Ok(h) => {
                        handle = Some(h);
                        break;
                    }
                    Err(err) => {
                        warn!("open usb device failed: {}", err);
                        thread::sleep(ENUM_OPEN_RETRY_DELAY);
                    }
                }
            }
            let handle = match handle {
                Some(handle) => handle,
                None => continue,
            };

            let kind = match read_chip_info_raw(&handle) {
                Ok(info) => classify(&info),
                Err(err) => {
                    warn!("read chip info failed, path {}: {}", path, err);
                    DeviceKind::Invalid
                }
            };
            drop(handle);

            debug!(
                "found usb device vid {:#06x} pid {:#06x} path {} kind {}",
                vid, pid, path, kind
            );

            found.push(DeviceInfo {
                vid,
                pid,
                path,
                kind,
            });
        }

        Ok(found)
    }

    /// Returns one device: the one at `path` if a path is supplied, the
    /// first enumerated one otherwise.
    ///
    /// It returns [`Error::DeviceNotFound`] if nothing matches.
    ///
    /// [`Error::DeviceNotFound`]: crate::Error::DeviceNotFound
    fn pick_device(&self, path: Option<&str>) -> Result<DeviceInfo> {
        let devices = self.find_devices()?;
        if let Some(path) = path {
            devices
                .into_iter()
                .find(|device| device.path == path)
                .ok_or(Error::DeviceNotFound)
        } else {
            devices.into_iter().next().ok_or(Error::DeviceNotFound)
        }
    }
}

/// A USB context, necessary for device enumeration and opening.
pub type Context = rusb::Context;

impl UsbContext for Context {}
impl UsbContext for rusb::GlobalContext {}
