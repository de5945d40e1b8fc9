// Copyright 2025-2026 CEMAXECUTER LLC

//! Streaming runtime for FL2000-based USB 3.0 to VGA adapters repurposed as
//! general purpose 8-bit DACs and SDR transmitters.
//!
//! The adapter's three video DACs become three independent sample channels
//! ([`Mode::Multichan`]), or a single channel routed through the 256-entry
//! palette RAM ([`Mode::Singlechan`]). Samples are pulled from a producer
//! callback and pushed over the bulk endpoint as a continuous, blanking-free
//! byte stream; see [`Fl2kDev::start_tx`].

pub mod convert;
mod device;
pub mod pll;
mod stream;
mod usb;

pub use device::{device_count, device_name, Fl2kDev};

use thiserror::Error;

/// Bytes handed to the producer callback per invocation, in every mode.
pub const FL2K_BUF_LEN: usize = 1280 * 1024;

/// On-wire length of one bulk transfer: 24 output bytes per 8 input samples
/// per channel.
pub const FL2K_XFER_LEN: usize = FL2K_BUF_LEN * 3;

/// Entries in the device's palette RAM.
pub const FL2K_PALETTE_SIZE: usize = 256;

/// Red DAC channel bit for [`Fl2kDev::set_enabled_channels`].
pub const CHAN_R: u8 = 1 << 0;
/// Green DAC channel bit.
pub const CHAN_G: u8 = 1 << 1;
/// Blue DAC channel bit.
pub const CHAN_B: u8 = 1 << 2;

/// Errors returned by the control plane.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fl2kError {
    #[error("invalid parameter")]
    InvalidParam,

    #[error("out of memory")]
    NoMem,

    #[error("wrong streaming state for this operation")]
    Busy,

    #[error("I2C operation timed out")]
    Timeout,

    #[error("not found")]
    NotFound,

    #[error("USB error {0}")]
    Usb(i32),
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, Fl2kError>;

/// DAC output mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// R, G and B carry three independent sample streams.
    Multichan,
    /// One sample stream indexes the 256-entry palette RAM.
    Singlechan,
}

/// Per-invocation record passed to the producer callback.
///
/// The producer points `r_buf` (and `g_buf`/`b_buf` in multichannel mode) at
/// [`FL2K_BUF_LEN`] bytes of its own sample memory before returning. The
/// engine copies out of those buffers before the next invocation and never
/// retains the pointers. A callback left with null pointers transmits the
/// transfer buffer's previous contents.
pub struct DataInfo {
    /// Bytes the engine reads from each set buffer.
    pub len: u32,
    /// Cumulative underflow count at the time of the call.
    pub underflow_cnt: u32,
    /// Set by the engine on the final call after the device was lost.
    pub device_error: bool,
    /// Set to `true` by producers supplying two's-complement samples; the
    /// engine then biases every byte by +128 into unsigned DAC space.
    pub sampletype_signed: bool,
    pub r_buf: *const u8,
    pub g_buf: *const u8,
    pub b_buf: *const u8,
}

impl DataInfo {
    pub(crate) fn new(underflow_cnt: u32) -> Self {
        Self {
            len: FL2K_BUF_LEN as u32,
            underflow_cnt,
            device_error: false,
            sampletype_signed: false,
            r_buf: std::ptr::null(),
            g_buf: std::ptr::null(),
            b_buf: std::ptr::null(),
        }
    }
}

pub(crate) type TxCallback = Box<dyn FnMut(&mut DataInfo) + Send>;
