use std::time::Duration;

use crate::error::Result;

/// Blocking USB primitives the burners are written against.
///
/// The K230 only ever uses vendor requests on endpoint 0 and a single bulk
/// endpoint pair, so the trait is deliberately narrow. [`DeviceHandle`]
/// implements it on top of `rusb`; the protocol tests drive the burners
/// with a scripted stand-in instead of hardware.
///
/// [`DeviceHandle`]: crate::DeviceHandle
pub trait UsbTransport {
    /// Vendor IN control transfer on endpoint 0. Returns the number of
    /// bytes the device answered with.
    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Vendor OUT control transfer on endpoint 0 without a data stage.
    fn control_out(&mut self, request: u8, value: u16, index: u16, timeout: Duration)
        -> Result<()>;

    /// Bulk OUT transfer. A short write is reported as an error by the
    /// implementation, so `Ok` means the whole buffer went out.
    fn bulk_out(&mut self, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Bulk IN transfer. Returns the number of bytes received; a timeout
    /// surfaces as [`Error::Timeout`](crate::Error::Timeout) so callers can
    /// drive their retry loops.
    fn bulk_in(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Max packet size of the bulk OUT endpoint, needed for the v1
    /// zero-length-packet quirk.
    fn max_out_packet_size(&self) -> usize;
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::time::Duration;

    use super::UsbTransport;
    use crate::error::{Error, Result};

    /// One recorded host-side transfer.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Transfer {
        ControlIn {
            request: u8,
            value: u16,
            index: u16,
            len: usize,
        },
        ControlOut {
            request: u8,
            value: u16,
            index: u16,
        },
        BulkOut(Vec<u8>),
        BulkIn {
            requested: usize,
        },
    }

    /// A scripted answer for an IN direction transfer.
    #[derive(Debug, Clone)]
    pub enum Reply {
        Data(Vec<u8>),
        Timeout,
    }

    /// Transport double that records every transfer and plays back scripted
    /// replies. An exhausted reply queue behaves like a silent device, i.e.
    /// the transfer times out.
    pub struct MockTransport {
        pub transfers: Vec<Transfer>,
        pub control_replies: VecDeque<Reply>,
        pub bulk_replies: VecDeque<Reply>,
        pub mps: usize,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self {
                transfers: Vec::new(),
                control_replies: VecDeque::new(),
                bulk_replies: VecDeque::new(),
                mps: 512,
            }
        }

        pub fn push_control_reply(&mut self, reply: Reply) {
            self.control_replies.push_back(reply);
        }

        pub fn push_bulk_reply(&mut self, reply: Reply) {
            self.bulk_replies.push_back(reply);
        }

        pub fn bulk_outs(&self) -> Vec<&Vec<u8>> {
            self.transfers
                .iter()
                .filter_map(|t| match t {
                    Transfer::BulkOut(data) => Some(data),
                    _ => None,
                })
                .collect()
        }
    }

    impl UsbTransport for MockTransport {
        fn control_in(
            &mut self,
            request: u8,
            value: u16,
            index: u16,
            buf: &mut [u8],
            _timeout: Duration,
        ) -> Result<usize> {
            self.transfers.push(Transfer::ControlIn {
                request,
                value,
                index,
                len: buf.len(),
            });
            match self.control_replies.pop_front() {
                Some(Reply::Data(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Some(Reply::Timeout) | None => Err(Error::Timeout),
            }
        }

        fn control_out(
            &mut self,
            request: u8,
            value: u16,
            index: u16,
            _timeout: Duration,
        ) -> Result<()> {
            self.transfers.push(Transfer::ControlOut {
                request,
                value,
                index,
            });
            Ok(())
        }

        fn bulk_out(&mut self, data: &[u8], _timeout: Duration) -> Result<usize> {
            self.transfers.push(Transfer::BulkOut(data.to_vec()));
            Ok(data.len())
        }

        fn bulk_in(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            self.transfers.push(Transfer::BulkIn {
                requested: buf.len(),
            });
            match self.bulk_replies.pop_front() {
                Some(Reply::Data(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Some(Reply::Timeout) | None => Err(Error::Timeout),
            }
        }

        fn max_out_packet_size(&self) -> usize {
            self.mps
        }
    }
}
