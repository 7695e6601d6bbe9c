//! This crate burns firmware onto Kendryte K230 boards over USB. It talks
//! to the two USB personalities of the chip: the boot ROM, which accepts a
//! loader into on-chip SRAM and jumps to it, and the U-Boot second stage
//! the loader brings up, which exposes a framed command protocol for
//! probing, erasing, writing and reading the board's non-volatile media.
//! It also parses the multi-partition image container those boards ship
//! as, verifying checksums and extracting partitions into a re-usable
//! cache.
//!
//! # Example: burning an image
//! ```rust, no_run
//! use kburn::{Burner, Cache, DeviceKind, Image, MediumType, Session};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::new()?;
//! let mut device = session.pick_device(None)?;
//!
//! // In BROM mode, upload the matching loader and wait for the device to
//! // come back in UBOOT mode at the same USB path.
//! if device.kind == DeviceKind::Brom {
//!     let mut brom = match session.request_burner(&device)? {
//!         Burner::Brom(brom) => brom,
//!         _ => unreachable!(),
//!     };
//!     brom.set_medium_type(MediumType::Emmc);
//!     let loader = brom.loader().expect("no loader for this medium");
//!     brom.write(loader, kburn::DEFAULT_LOAD_ADDRESS)?;
//!     brom.boot_from(kburn::DEFAULT_LOAD_ADDRESS)?;
//!     drop(brom);
//!     device = session.wait_for_uboot(&device.path, None)?;
//! }
//!
//! let mut uboot = match session.request_burner(&device)? {
//!     Burner::Uboot(uboot) => uboot,
//!     _ => unreachable!(),
//! };
//! uboot.set_medium_type(MediumType::Emmc);
//! uboot.probe()?;
//! let info = uboot.medium_info()?;
//!
//! // Burn every partition of the image, re-using the extraction cache.
//! let mut image = Image::open("firmware.kdimg")?;
//! assert!(image.max_offset() <= info.capacity);
//! for item in image.items(&Cache::new())? {
//!     let file = std::fs::File::open(&item.path)?;
//!     uboot.erase(item.offset, item.file_size, (item.file_size / 4096) as usize)?;
//!     uboot.write_stream(file, item.file_size, item.offset, item.size, 0)?;
//! }
//! uboot.reboot()?;
//! # Ok(())
//! # }
//! ```

mod brom;
mod cache;
mod context;
mod device;
mod error;
mod image;
mod medium;
mod progress;
mod protocol;
mod session;
mod transport;
mod uboot;

pub use brom::{
    is_valid_load_address, loader_for, BromBurner, DEFAULT_LOAD_ADDRESS, LOAD_ADDRESS_RANGE,
};
pub use cache::Cache;
pub use context::{Context, UsbContext};
pub use device::{DeviceHandle, DeviceInfo, DeviceKind, K230_PID, K230_VID};
pub use error::{Error, Result};
pub use image::{
    Image, ImageHeader, ImageItem, PartitionEntry, IMAGE_HEADER_MAGIC, PARTITION_MAGIC,
};
pub use medium::{MediumInfo, MediumType};
pub use progress::{LogProgress, NoProgress, ProgressSink};
pub use protocol::ProtocolVersion;
pub use session::{Burner, PollStatus, Session, POLL_INTERVAL};
pub use transport::UsbTransport;
pub use uboot::{UbootBurner, SPI_NAND_WRITE_WITH_OOB};

/// Timeout for control transfers and other short USB exchanges.
pub(crate) const TIMEOUT: std::time::Duration = std::time::Duration::from_millis(1000);
