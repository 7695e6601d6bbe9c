use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::brom::BromBurner;
use crate::context::{Context, UsbContext};
use crate::device::{DeviceHandle, DeviceInfo, DeviceKind};
use crate::error::{Error, Result};
use crate::uboot::UbootBurner;

/// How often the device list is polled while waiting for the BROM→UBOOT
/// transition.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// One of the two burner personalities, matching what the device reported
/// at enumeration time.
pub enum Burner<T: rusb::UsbContext> {
    Brom(BromBurner<DeviceHandle<T>>),
    Uboot(UbootBurner<DeviceHandle<T>>),
}

/// Result of one poll of the device list while waiting for a device to
/// come back in UBOOT mode.
#[derive(Clone, Debug)]
pub enum PollStatus {
    /// The device has not (re-)appeared as UBOOT yet.
    Pending,
    /// The device at the watched path reports UBOOT mode.
    Ready(DeviceInfo),
}

/// A burning session. Owns the USB context; everything derived from it
/// (device lists, handles, burners) lives at most as long as the session.
pub struct Session {
    context: Context,
}

impl Session {
    pub fn new() -> Result<Self> {
        let version = rusb::version();
        info!(
            "libusb v{}.{}.{}.{}",
            version.major(),
            version.minor(),
            version.micro(),
            version.nano()
        );

        let context = Context::new()?;
        debug!("usb context initialized");
        Ok(Self { context })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// All connected K230 devices, classified.
    pub fn devices(&self) -> Result<Vec<DeviceInfo>> {
        self.context.find_devices()
    }

    /// The device at `path`, or the first one found.
    pub fn pick_device(&self, path: Option<&str>) -> Result<DeviceInfo> {
        self.context.pick_device(path)
    }

    /// Opens and claims the described device.
    pub fn open(&self, info: &DeviceInfo) -> Result<DeviceHandle<Context>> {
        info.open(&self.context)
    }

    /// Opens the device and wraps it in the burner matching its
    /// personality.
    pub fn request_burner(&self, info: &DeviceInfo) -> Result<Burner<Context>> {
        let handle = self.open(info)?;
        match info.kind {
            DeviceKind::Brom => Ok(Burner::Brom(BromBurner::new(handle))),
            DeviceKind::Uboot => Ok(Burner::Uboot(UbootBurner::new(handle))),
            DeviceKind::Invalid => Err(Error::Unsupported(
                "device is neither in BROM nor in UBOOT mode",
            )),
        }
    }

    /// Waits for the device at `path` to (re-)enumerate in UBOOT mode,
    /// polling the device list until it does. `timeout` of `None` waits
    /// forever; otherwise the wait fails with [`Error::Timeout`] once the
    /// deadline passes.
    ///
    /// This is the ordering point of the BROM→UBOOT handover: after
    /// [`BromBurner::boot_from`] the session must not continue until the
    /// same physical path reports UBOOT.
    pub fn wait_for_uboot(&self, path: &str, timeout: Option<Duration>) -> Result<DeviceInfo> {
        wait_for_uboot_with(|| self.devices(), path, POLL_INTERVAL, timeout)
    }
}

/// One look at a device list.
fn poll_uboot(devices: &[DeviceInfo], path: &str) -> PollStatus {
    match devices
        .iter()
        .find(|device| device.path == path && device.kind == DeviceKind::Uboot)
    {
        Some(device) => PollStatus::Ready(device.clone()),
        None => PollStatus::Pending,
    }
}

fn wait_for_uboot_with<F>(
    mut list: F,
    path: &str,
    interval: Duration,
    timeout: Option<Duration>,
) -> Result<DeviceInfo>
where
    F: FnMut() -> Result<Vec<DeviceInfo>>,
{
    let deadline = timeout.map(|timeout| Instant::now() + timeout);

    loop {
        if let PollStatus::Ready(info) = poll_uboot(&list()?, path) {
            info!("device {} is back in UBOOT mode", info.path);
            return Ok(info);
        }

        debug!("device at {} not in UBOOT mode yet, polling", path);
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(Error::Timeout);
        }
        thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(path: &str, kind: DeviceKind) -> DeviceInfo {
        DeviceInfo {
            vid: 0x29F1,
            pid: 0x0230,
            path: path.to_string(),
            kind,
        }
    }

    #[test]
    fn waits_until_the_same_path_reports_uboot() {
        let mut polls = 0;
        let found = wait_for_uboot_with(
            || {
                polls += 1;
                Ok(match polls {
                    1 => vec![info("1-2", DeviceKind::Brom)],
                    2 => vec![],
                    _ => vec![info("1-2", DeviceKind::Uboot)],
                })
            },
            "1-2",
            Duration::from_millis(1),
            None,
        )
        .unwrap();

        assert_eq!(polls, 3);
        assert_eq!(found.kind, DeviceKind::Uboot);
        assert_eq!(found.path, "1-2");
    }

    #[test]
    fn ignores_other_paths() {
        let mut polls = 0;
        let err = wait_for_uboot_with(
            || {
                polls += 1;
                Ok(vec![info("3-1", DeviceKind::Uboot)])
            },
            "1-2",
            Duration::from_millis(1),
            Some(Duration::from_millis(5)),
        )
        .unwrap_err();

        assert!(matches!(err, Error::Timeout));
        assert!(polls > 1);
    }

    #[test]
    fn deadline_expires() {
        let err = wait_for_uboot_with(
            || Ok(Vec::new()),
            "1-2",
            Duration::from_millis(1),
            Some(Duration::ZERO),
        )
        .unwrap_err();

        assert!(matches!(err, Error::Timeout));
    }
}
