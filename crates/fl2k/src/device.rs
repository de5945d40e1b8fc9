// Copyright 2025-2026 CEMAXECUTER LLC

use std::os::raw::c_int;
use std::ptr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::stream::{self, StreamState};
use crate::usb;
use crate::{
    DataInfo, Fl2kError, Mode, Result, CHAN_B, CHAN_G, CHAN_R, FL2K_PALETTE_SIZE,
};

const CTRL_IN: u8 = usb::LIBUSB_REQUEST_TYPE_VENDOR | usb::LIBUSB_ENDPOINT_IN;
const CTRL_OUT: u8 = usb::LIBUSB_REQUEST_TYPE_VENDOR | usb::LIBUSB_ENDPOINT_OUT;
const CTRL_TIMEOUT_MS: u32 = 300;

/// Known FL2000 (vendor, product, name) triples.
const KNOWN_DEVICES: &[(u16, u16, &str)] = &[(0x1d5c, 0x2000, "FL2000DX OEM")];

fn find_known_device(vid: u16, pid: u16) -> Option<&'static str> {
    KNOWN_DEVICES
        .iter()
        .find(|&&(v, p, _)| v == vid && p == pid)
        .map(|&(_, _, name)| name)
}

/// Count the FL2000 adapters currently on the bus.
pub fn device_count() -> u32 {
    let mut count = 0;
    unsafe {
        let mut ctx: *mut usb::libusb_context = ptr::null_mut();
        if usb::libusb_init(&mut ctx) < 0 {
            return 0;
        }

        let mut list: *mut *mut usb::libusb_device = ptr::null_mut();
        let cnt = usb::libusb_get_device_list(ctx, &mut list);

        for i in 0..cnt.max(0) as usize {
            let mut dd = std::mem::zeroed::<usb::libusb_device_descriptor>();
            usb::libusb_get_device_descriptor(*list.add(i), &mut dd);
            if find_known_device(dd.idVendor, dd.idProduct).is_some() {
                count += 1;
            }
        }

        if cnt >= 0 {
            usb::libusb_free_device_list(list, 1);
        }
        usb::libusb_exit(ctx);
    }
    count
}

/// Name of the `index`-th adapter on the bus, or `""` when absent.
pub fn device_name(index: u32) -> &'static str {
    let mut found = "";
    unsafe {
        let mut ctx: *mut usb::libusb_context = ptr::null_mut();
        if usb::libusb_init(&mut ctx) < 0 {
            return "";
        }

        let mut list: *mut *mut usb::libusb_device = ptr::null_mut();
        let cnt = usb::libusb_get_device_list(ctx, &mut list);

        let mut count = 0;
        for i in 0..cnt.max(0) as usize {
            let mut dd = std::mem::zeroed::<usb::libusb_device_descriptor>();
            usb::libusb_get_device_descriptor(*list.add(i), &mut dd);
            if let Some(name) = find_known_device(dd.idVendor, dd.idProduct) {
                count += 1;
                if index + 1 == count {
                    found = name;
                    break;
                }
            }
        }

        if cnt >= 0 {
            usb::libusb_free_device_list(list, 1);
        }
        usb::libusb_exit(ctx);
    }
    found
}

/// An opened FL2000 adapter.
///
/// Dropping the handle stops any active transmission, waits for the engine
/// to drain and releases the USB interface.
pub struct Fl2kDev {
    ctx: *mut usb::libusb_context,
    devh: *mut usb::libusb_device_handle,
    mode: Mode,
    enabled_chans: u8,
    rate: f64,
    stream: Option<Arc<StreamState>>,
    usb_thread: Option<JoinHandle<()>>,
}

// Raw libusb pointers; the handle has a single owner and the worker threads
// only touch them through the shared stream state.
unsafe impl Send for Fl2kDev {}

impl Fl2kDev {
    /// Open the `index`-th FL2000 adapter on the bus and run the
    /// initialization register sequence.
    pub fn open(index: u32) -> Result<Self> {
        unsafe {
            let mut ctx: *mut usb::libusb_context = ptr::null_mut();
            let r = usb::libusb_init(&mut ctx);
            if r < 0 {
                return Err(Fl2kError::Usb(r));
            }
            usb::libusb_set_option(ctx, usb::LIBUSB_OPTION_LOG_LEVEL, 3 as c_int);

            let mut list: *mut *mut usb::libusb_device = ptr::null_mut();
            let cnt = usb::libusb_get_device_list(ctx, &mut list);

            let mut device: *mut usb::libusb_device = ptr::null_mut();
            let mut dev_name = "";
            let mut count: u32 = 0;
            for i in 0..cnt.max(0) as usize {
                device = *list.add(i);

                let mut dd = std::mem::zeroed::<usb::libusb_device_descriptor>();
                usb::libusb_get_device_descriptor(device, &mut dd);
                if let Some(name) = find_known_device(dd.idVendor, dd.idProduct) {
                    count += 1;
                    dev_name = name;
                }

                if index + 1 == count {
                    break;
                }
                device = ptr::null_mut();
            }

            if device.is_null() {
                if cnt >= 0 {
                    usb::libusb_free_device_list(list, 1);
                }
                usb::libusb_exit(ctx);
                return Err(Fl2kError::NotFound);
            }

            let mut devh: *mut usb::libusb_device_handle = ptr::null_mut();
            let r = usb::libusb_open(device, &mut devh);
            usb::libusb_free_device_list(list, 1);
            if r < 0 {
                log::error!("usb_open error {}", r);
                if r == usb::LIBUSB_ERROR_ACCESS {
                    log::error!(
                        "Please fix the device permissions, e.g. \
                         by installing the udev rules file"
                    );
                }
                usb::libusb_exit(ctx);
                return Err(Fl2kError::Usb(r));
            }

            // Adapters with an SPI flash for the Windows driver show up with
            // a mass storage interface the kernel grabs; it has to go before
            // the device can be claimed.
            if usb::libusb_kernel_driver_active(devh, 3) == 1 {
                log::warn!(
                    "Kernel mass storage driver is attached, detaching \
                     driver. This may take more than 10 seconds!"
                );
                let r = usb::libusb_detach_kernel_driver(devh, 3);
                if r < 0 {
                    log::error!("Failed to detach mass storage driver: {}", r);
                    usb::libusb_close(devh);
                    usb::libusb_exit(ctx);
                    return Err(Fl2kError::Usb(r));
                }
            }

            let r = usb::libusb_claim_interface(devh, 0);
            if r < 0 {
                log::error!("usb_claim_interface 0 error {}", r);
                usb::libusb_close(devh);
                usb::libusb_exit(ctx);
                return Err(Fl2kError::Usb(r));
            }

            let r = usb::libusb_set_interface_alt_setting(devh, 0, 1);
            if r < 0 {
                // observed hardware variation: some units only expose the
                // bulk endpoint on interface 1
                log::warn!(
                    "Failed to switch interface 0 to altsetting 1, \
                     trying to use interface 1"
                );
                let r = usb::libusb_claim_interface(devh, 1);
                if r < 0 {
                    log::error!("Could not claim interface 1: {}", r);
                }
            }

            let dev = Fl2kDev {
                ctx,
                devh,
                mode: Mode::Multichan,
                enabled_chans: CHAN_R | CHAN_G | CHAN_B,
                rate: 0.0,
                stream: None,
                usb_thread: None,
            };

            dev.init_device()?;
            log::info!("opened {} (index {})", dev_name, index);

            Ok(dev)
        }
    }

    fn read_reg(&self, reg: u16) -> Result<u32> {
        let mut data = [0u8; 4];
        let r = unsafe {
            usb::libusb_control_transfer(
                self.devh,
                CTRL_IN,
                0x40,
                0,
                reg,
                data.as_mut_ptr(),
                4,
                CTRL_TIMEOUT_MS,
            )
        };
        if r < 4 {
            log::error!("short read from register 0x{:04x}", reg);
            return Err(Fl2kError::Usb(r));
        }
        Ok(u32::from_le_bytes(data))
    }

    fn write_reg(&self, reg: u16, val: u32) -> Result<()> {
        let mut data = val.to_le_bytes();
        let r = unsafe {
            usb::libusb_control_transfer(
                self.devh,
                CTRL_OUT,
                0x41,
                0,
                reg,
                data.as_mut_ptr(),
                4,
                CTRL_TIMEOUT_MS,
            )
        };
        if r != 4 {
            return Err(Fl2kError::Usb(r));
        }
        Ok(())
    }

    /// Enable the DACs, suppress hsync/vsync emission and park the PLL at a
    /// safe low frequency.
    fn init_device(&self) -> Result<()> {
        self.write_reg(0x8020, 0xdf00_00cc)?;

        // lowest possible DAC frequency, avoids underruns during init
        self.write_reg(0x802c, 0x0041_6f3f)?;

        self.write_reg(0x8048, 0x7ffb_8004)?;
        self.write_reg(0x803c, 0xd701_004d)?;
        self.write_reg(0x8004, 0x0000_031c)?;
        self.write_reg(0x8004, 0x0010_039d)?;
        self.write_reg(0x8008, 0x0780_0898)?;

        self.write_reg(0x801c, 0x0000_0000)?;
        self.write_reg(0x0070, 0x0418_6085)?;

        // blanking suppression
        self.write_reg(0x8008, 0xfeff_0780)?;
        self.write_reg(0x800c, 0x0000_f001)?;

        // VSYNC timing
        self.write_reg(0x8010, 0x0400_042a)?;
        self.write_reg(0x8014, 0x0010_002d)?;

        self.write_reg(0x8004, 0x0000_0002)?;

        Ok(())
    }

    fn deinit_device(&self) -> Result<()> {
        // TODO: power down DACs and PLL, put the device in reset
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.stream
            .as_ref()
            .map(|st| st.status() != stream::STATUS_INACTIVE)
            .unwrap_or(false)
    }

    /// Program the PLL to the reachable rate closest to `target_freq` Hz.
    /// The decoded rate becomes the effective rate reported by
    /// [`sample_rate`](Self::sample_rate).
    pub fn set_sample_rate(&mut self, target_freq: u32) -> Result<()> {
        let (reg, actual) = crate::pll::freq_to_reg(target_freq);
        let error = actual - target_freq as f64;

        self.rate = actual;

        if error.abs() > 1.0 {
            log::warn!(
                "Requested sample rate {} not possible, using {:.0}, error is {:.0}",
                target_freq,
                actual,
                error
            );
        }

        self.write_reg(0x802c, reg)
    }

    /// Effective (decoded) sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.rate as u32
    }

    /// Load the 256-entry palette RAM with 24-bit `0x00RRGGBB` values and
    /// read it back for verification. Mismatches are logged, not fatal.
    pub fn load_custom_palette(&mut self, palette: &[u32; FL2K_PALETTE_SIZE]) -> Result<()> {
        if self.is_streaming() {
            return Err(Fl2kError::Busy);
        }

        for (i, &entry) in palette.iter().enumerate() {
            if self.write_reg(0x805c, (entry << 8) | i as u32).is_err() {
                log::error!("Error writing palette entry {}!", i);
            }
        }

        for (i, &entry) in palette.iter().enumerate() {
            // the read pointer register has a fixed +1 address offset
            self.write_reg(0x8060, (i as u32 + 1) & 0xff)?;
            let reg = self.read_reg(0x805c)?;

            if reg != entry {
                log::error!(
                    "Palette entry {} mismatch: 0x{:06x}, expected 0x{:06x}",
                    i,
                    reg,
                    entry
                );
            }
        }

        Ok(())
    }

    /// Restrict output to the DAC channels in `chan_mask` (a combination of
    /// [`CHAN_R`], [`CHAN_G`], [`CHAN_B`]) by loading a palette of linear
    /// ramps that is zero on the disabled channels.
    pub fn set_enabled_channels(&mut self, chan_mask: u8) -> Result<()> {
        if chan_mask & !(CHAN_R | CHAN_G | CHAN_B) != 0 {
            return Err(Fl2kError::InvalidParam);
        }

        let mut palette = [0u32; FL2K_PALETTE_SIZE];
        for (i, entry) in palette.iter_mut().enumerate() {
            let i = i as u32;
            let mut val = 0;
            if chan_mask & CHAN_R != 0 {
                val |= i << 16;
            }
            if chan_mask & CHAN_G != 0 {
                val |= i << 8;
            }
            if chan_mask & CHAN_B != 0 {
                val |= i;
            }
            *entry = val;
        }

        self.load_custom_palette(&palette)?;
        self.enabled_chans = chan_mask;
        Ok(())
    }

    /// Switch between multichannel (three independent DAC streams) and
    /// single-channel (palette lookup) output. Rejected while streaming;
    /// idempotent.
    pub fn set_mode(&mut self, mode: Mode) -> Result<()> {
        if self.is_streaming() {
            return Err(Fl2kError::Busy);
        }
        if self.mode == mode {
            return Ok(());
        }

        let mut reg = self.read_reg(0x8004)?;

        match mode {
            Mode::Singlechan => {
                // 256 color palette lookup
                reg |= (1 << 25) | (1 << 26);
                self.set_enabled_channels(CHAN_R)?;
            }
            Mode::Multichan => {
                reg &= !((1 << 25) | (1 << 26));
            }
        }

        self.write_reg(0x8004, reg)?;
        self.mode = mode;

        Ok(())
    }

    /// Currently configured output mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Currently enabled DAC channel mask.
    pub fn enabled_channels(&self) -> u8 {
        self.enabled_chans
    }

    fn i2c_wait_done(&self) -> Result<u32> {
        for _ in 0..10 {
            std::thread::sleep(Duration::from_millis(10));

            let reg = self.read_reg(0x8020)?;
            if reg & (1 << 31) != 0 {
                return Ok(reg);
            }
        }
        Err(Fl2kError::Timeout)
    }

    /// Read 4 bytes from register `reg_addr` of the I2C slave at the 7-bit
    /// address `i2c_addr`, through the adapter's I2C master.
    pub fn i2c_read(&self, i2c_addr: u8, reg_addr: u8, data: &mut [u8; 4]) -> Result<()> {
        let reg = self.read_reg(0x8020)?;

        // preserve bits 18-29; the cleared bit 30 disables periodic
        // repetition of the read
        let mut cmd = reg & 0x3ffc_0000;
        cmd |= (1 << 28) | ((reg_addr as u32) << 8) | (1 << 7) | (i2c_addr as u32 & 0x7f);
        self.write_reg(0x8020, cmd)?;

        let status = self.i2c_wait_done()?;

        // bits 24-27 flag an unacknowledged byte
        if status & (0x0f << 24) != 0 {
            return Err(Fl2kError::NotFound);
        }

        *data = self.read_reg(0x8024)?.to_le_bytes();
        Ok(())
    }

    /// Write 4 bytes to register `reg_addr` of the I2C slave at the 7-bit
    /// address `i2c_addr`.
    pub fn i2c_write(&self, i2c_addr: u8, reg_addr: u8, data: &[u8; 4]) -> Result<()> {
        self.write_reg(0x8028, u32::from_le_bytes(*data))?;

        let reg = self.read_reg(0x8020)?;

        let mut cmd = reg & 0x3ffc_0000;
        cmd |= (1 << 28) | ((reg_addr as u32) << 8) | (i2c_addr as u32 & 0x7f);
        self.write_reg(0x8020, cmd)?;

        let status = self.i2c_wait_done()?;

        if status & (0x0f << 24) != 0 {
            return Err(Fl2kError::NotFound);
        }

        Ok(())
    }

    /// Start transmitting. The engine calls `cb` from a dedicated thread to
    /// pull sample buffers (see [`DataInfo`]) and keeps `n_bufs` bulk
    /// transfers in flight (0 selects the default of 4). Returns
    /// [`Fl2kError::Busy`] unless the engine is inactive.
    pub fn start_tx<F>(&mut self, cb: F, n_bufs: u32) -> Result<()>
    where
        F: FnMut(&mut DataInfo) + Send + 'static,
    {
        if self.is_streaming() {
            return Err(Fl2kError::Busy);
        }
        if let Some(handle) = self.usb_thread.take() {
            let _ = handle.join();
        }

        let (state, usb_thread) =
            stream::start(self.ctx, self.devh, self.mode, Box::new(cb), n_bufs)?;

        self.stream = Some(state);
        self.usb_thread = Some(usb_thread);

        Ok(())
    }

    /// Request the end of transmission. Returns immediately; the engine
    /// drains outstanding transfers in the background. From a stuck drain, a
    /// second call forces the engine inactive. Returns [`Fl2kError::Busy`]
    /// when nothing is streaming.
    pub fn stop_tx(&mut self) -> Result<()> {
        match &self.stream {
            Some(state) => state.request_stop(),
            None => Err(Fl2kError::Busy),
        }
    }
}

impl Drop for Fl2kDev {
    fn drop(&mut self) {
        let mut dev_lost = false;

        if let Some(state) = self.stream.take() {
            if state.status() == stream::STATUS_RUNNING {
                let _ = state.request_stop();
            }
            dev_lost = state.dev_lost();
        }

        // the pump thread's 1 s event timeout bounds this join
        if let Some(handle) = self.usb_thread.take() {
            let _ = handle.join();
        }

        unsafe {
            if !dev_lost {
                let _ = self.deinit_device();
            }
            usb::libusb_release_interface(self.devh, 0);
            usb::libusb_close(self.devh);
            usb::libusb_exit(self.ctx);
        }
    }
}
