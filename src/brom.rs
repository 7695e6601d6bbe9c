use crate::error::Result;
use crate::medium::MediumType;
use crate::progress::{LogProgress, ProgressSink};
use crate::transport::UsbTransport;
use crate::TIMEOUT;

use log::{debug, info};

/// Default SRAM address loaders are uploaded to and started from.
pub const DEFAULT_LOAD_ADDRESS: u32 = 0x8036_0000;

/// Valid load-address window. The core treats addresses as opaque; this is
/// the range callers are expected to validate against at their boundary.
pub const LOAD_ADDRESS_RANGE: std::ops::RangeInclusive<u32> = 0x8030_0000..=0x8040_0000;

/// Returns whether `address` lies inside [`LOAD_ADDRESS_RANGE`].
pub fn is_valid_load_address(address: u32) -> bool {
    LOAD_ADDRESS_RANGE.contains(&address)
}

/// Vendor request setting the SRAM address of the following bulk data.
const EP0_SET_DATA_ADDRESS: u8 = 1;
/// Vendor request jumping to a previously set address.
const EP0_PROG_START: u8 = 4;

/// SRAM upload page size. The boot ROM consumes exactly this many bytes per
/// bulk transfer; the value is literally 1000, not 1024.
const SRAM_PAGE_SIZE: usize = 1000;

static LOADER_MMC: &[u8] = include_bytes!("../loaders/k230_loader_mmc.bin");
static LOADER_SPI_NAND: &[u8] = include_bytes!("../loaders/k230_loader_spi_nand.bin");
static LOADER_SPI_NOR: &[u8] = include_bytes!("../loaders/k230_loader_spi_nor.bin");

/// Returns the built-in loader blob for a medium, or `None` for
/// [`MediumType::Invalid`]. The MMC loader also serves SD card and OTP.
pub fn loader_for(medium: MediumType) -> Option<&'static [u8]> {
    match medium {
        MediumType::Emmc | MediumType::SdCard | MediumType::Otp => Some(LOADER_MMC),
        MediumType::SpiNand => Some(LOADER_SPI_NAND),
        MediumType::SpiNor => Some(LOADER_SPI_NOR),
        MediumType::Invalid => None,
    }
}

fn hi16(address: u32) -> u16 {
    (address >> 16) as u16
}

fn lo16(address: u32) -> u16 {
    (address & 0xffff) as u16
}

/// Burner for a device in boot ROM mode: uploads a loader blob into SRAM
/// and makes the chip execute it. After a successful [`boot_from`] the chip
/// re-enumerates in UBOOT mode at the same USB path.
///
/// [`boot_from`]: BromBurner::boot_from
pub struct BromBurner<U: UsbTransport> {
    usb: U,
    medium: MediumType,
    progress: Box<dyn ProgressSink>,
}

impl<U: UsbTransport> BromBurner<U> {
    pub fn new(usb: U) -> Self {
        Self {
            usb,
            medium: MediumType::Invalid,
            progress: Box::new(LogProgress::new()),
        }
    }

    /// Selects the medium the uploaded loader will have to drive. This only
    /// picks the built-in blob; a caller supplying its own loader is
    /// responsible for its medium affinity.
    pub fn set_medium_type(&mut self, medium: MediumType) {
        self.medium = medium;
    }

    /// Replaces the progress sink.
    pub fn set_progress_sink(&mut self, sink: Box<dyn ProgressSink>) {
        self.progress = sink;
    }

    /// The built-in loader matching the configured medium.
    pub fn loader(&self) -> Option<&'static [u8]> {
        loader_for(self.medium)
    }

    /// Uploads `data` into SRAM at `address` in fixed-size pages.
    pub fn write(&mut self, data: &[u8], address: u32) -> Result<()> {
        info!("write loader to {:#x}, size {}", address, data.len());

        self.usb.control_out(
            EP0_SET_DATA_ADDRESS,
            hi16(address),
            lo16(address),
            TIMEOUT,
        )?;

        let size = data.len();
        let pages = size.div_ceil(SRAM_PAGE_SIZE);
        for page in 0..pages {
            let offset = page * SRAM_PAGE_SIZE;
            let chunk = &data[offset..size.min(offset + SRAM_PAGE_SIZE)];

            debug!("write page {} at {:#x}", page, address as usize + offset);
            self.usb.bulk_out(chunk, TIMEOUT)?;

            self.progress.progress(offset as u64, size as u64);
        }
        self.progress.progress(size as u64, size as u64);

        Ok(())
    }

    /// Makes the chip jump to `address`. On success the device drops off
    /// the bus and re-enumerates as UBOOT.
    pub fn boot_from(&mut self, address: u32) -> Result<()> {
        info!("boot from {:#x}", address);

        self.usb
            .control_out(EP0_PROG_START, hi16(address), lo16(address), TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockTransport, Transfer};

    #[test]
    fn loader_selection_by_medium() {
        assert!(std::ptr::eq(
            loader_for(MediumType::Emmc).unwrap(),
            loader_for(MediumType::SdCard).unwrap()
        ));
        assert!(std::ptr::eq(
            loader_for(MediumType::Emmc).unwrap(),
            loader_for(MediumType::Otp).unwrap()
        ));
        assert!(!std::ptr::eq(
            loader_for(MediumType::SpiNand).unwrap(),
            loader_for(MediumType::SpiNor).unwrap()
        ));
        assert!(loader_for(MediumType::Invalid).is_none());
    }

    #[test]
    fn load_address_window() {
        assert!(is_valid_load_address(0x8030_0000));
        assert!(is_valid_load_address(DEFAULT_LOAD_ADDRESS));
        assert!(is_valid_load_address(0x8040_0000));
        assert!(!is_valid_load_address(0x802F_FFFF));
        assert!(!is_valid_load_address(0x8040_0001));
    }

    #[test]
    fn write_uploads_in_sram_pages() {
        let mut burner = BromBurner::new(MockTransport::new());
        let data = vec![0x5Au8; 17_000];
        burner.write(&data, DEFAULT_LOAD_ADDRESS).unwrap();

        let usb = &burner.usb;
        assert_eq!(
            usb.transfers[0],
            Transfer::ControlOut {
                request: EP0_SET_DATA_ADDRESS,
                value: 0x8036,
                index: 0x0000,
            }
        );
        let outs = usb.bulk_outs();
        assert_eq!(outs.len(), 17);
        assert!(outs.iter().all(|chunk| chunk.len() == 1000));
        assert_eq!(outs.iter().map(|chunk| chunk.len()).sum::<usize>(), 17_000);
    }

    #[test]
    fn write_sends_short_tail_page() {
        let mut burner = BromBurner::new(MockTransport::new());
        let data = vec![0u8; 2_345];
        burner.write(&data, DEFAULT_LOAD_ADDRESS).unwrap();

        let outs = burner.usb.bulk_outs();
        assert_eq!(
            outs.iter().map(|chunk| chunk.len()).collect::<Vec<_>>(),
            vec![1000, 1000, 345]
        );
    }

    #[test]
    fn write_reports_progress_per_page() {
        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            move |current: u64, total: u64| seen.borrow_mut().push((current, total))
        };

        let mut burner = BromBurner::new(MockTransport::new());
        burner.set_progress_sink(Box::new(sink));
        burner.write(&[0u8; 2500], DEFAULT_LOAD_ADDRESS).unwrap();

        assert_eq!(
            *seen.borrow(),
            vec![(0, 2500), (1000, 2500), (2000, 2500), (2500, 2500)]
        );
    }

    #[test]
    fn boot_from_issues_prog_start() {
        let mut burner = BromBurner::new(MockTransport::new());
        burner.boot_from(0x8036_0000).unwrap();

        assert_eq!(
            burner.usb.transfers,
            vec![Transfer::ControlOut {
                request: EP0_PROG_START,
                value: 0x8036,
                index: 0x0000,
            }]
        );
    }
}
