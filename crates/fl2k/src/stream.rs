// Copyright 2025-2026 CEMAXECUTER LLC

//! Asynchronous bulk streaming engine.
//!
//! Sample flow: a producer thread pulls buffers from the application
//! callback and permutes them into EMPTY transfer slots; the libusb
//! completion callback, running on the event pump thread, submits the
//! FILLED slot with the lowest sequence number whenever a transfer drains.
//! The pool holds two slots more than the number of in-flight transfers so
//! the producer can fill ahead.
//!
//! Slot states move EMPTY -> FILLED (producer), FILLED -> SUBMITTED and
//! SUBMITTED -> EMPTY (completion callback). The per-slot atomic tag is the
//! only coordination between the two threads besides the condition variable
//! the producer parks on when no slot is EMPTY.

use std::os::raw::{c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::convert;
use crate::usb;
use crate::{DataInfo, Fl2kError, Mode, Result, TxCallback, FL2K_BUF_LEN, FL2K_XFER_LEN};

pub(crate) const STATUS_INACTIVE: u8 = 0;
pub(crate) const STATUS_CANCELING: u8 = 1;
pub(crate) const STATUS_RUNNING: u8 = 2;

const BUF_EMPTY: u8 = 0;
const BUF_SUBMITTED: u8 = 1;
const BUF_FILLED: u8 = 2;

const DEFAULT_BUF_NUMBER: usize = 4;
const BULK_OUT_ENDPOINT: u8 = 0x01;
// the stream is unbounded; individual transfers never time out
const BULK_TIMEOUT_MS: u32 = 0;

const INCR_USBFS_HINT: &str = "Please increase your allowed usbfs buffer size \
     with the following command:\n\
     echo 0 > /sys/module/usbcore/parameters/usbfs_memory_mb";

/// Per-slot metadata shared between the producer thread and the completion
/// callback.
struct XferInfo {
    seq: AtomicU64,
    state: AtomicU8,
}

impl XferInfo {
    fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            state: AtomicU8::new(BUF_EMPTY),
        }
    }
}

/// First slot currently EMPTY, if any.
fn next_empty(infos: &[XferInfo]) -> Option<usize> {
    infos
        .iter()
        .position(|info| info.state.load(Ordering::Acquire) == BUF_EMPTY)
}

/// FILLED slot with the lowest sequence number, if any. Playback order is
/// fill order.
fn next_filled(infos: &[XferInfo]) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;
    for (i, info) in infos.iter().enumerate() {
        if info.state.load(Ordering::Acquire) == BUF_FILLED {
            let seq = info.seq.load(Ordering::Relaxed);
            if best.map_or(true, |(_, best_seq)| seq < best_seq) {
                best = Some((i, seq));
            }
        }
    }
    best.map(|(i, _)| i)
}

/// State shared by the device handle, the two worker threads and the libusb
/// completion callback. Everything except the atomics is set up before the
/// threads start and stays immutable while they run.
pub(crate) struct StreamState {
    ctx: *mut usb::libusb_context,
    devh: *mut usb::libusb_device_handle,
    mode: Mode,
    xfer_num: usize,
    buf_len: usize,
    xfers: Vec<*mut usb::libusb_transfer>,
    bufs: Vec<*mut u8>,
    infos: Box<[XferInfo]>,
    use_zerocopy: bool,

    status: AtomicU8,
    // also serves as libusb's `completed` flag for event handling
    cancel: AtomicI32,
    dev_lost: AtomicBool,
    underflow_cnt: AtomicU32,
    buf_mutex: Mutex<()>,
    buf_cond: Condvar,
}

unsafe impl Send for StreamState {}
unsafe impl Sync for StreamState {}

/// Back-reference handed to libusb as per-transfer user data.
struct SlotCtx {
    state: *const StreamState,
    idx: usize,
}

impl StreamState {
    pub(crate) fn status(&self) -> u8 {
        self.status.load(Ordering::Acquire)
    }

    fn set_status(&self, status: u8) {
        self.status.store(status, Ordering::Release);
    }

    pub(crate) fn dev_lost(&self) -> bool {
        self.dev_lost.load(Ordering::Acquire)
    }

    /// Request the end of streaming. Non-blocking and idempotent: from
    /// RUNNING it starts the drain, from CANCELING it forces the engine
    /// inactive, from INACTIVE it reports `Busy`.
    pub(crate) fn request_stop(&self) -> Result<()> {
        if self.status() == STATUS_RUNNING {
            self.set_status(STATUS_CANCELING);
            self.cancel.store(1, Ordering::Release);
            Ok(())
        } else if self.status() != STATUS_INACTIVE {
            self.set_status(STATUS_INACTIVE);
            Ok(())
        } else {
            Err(Fl2kError::Busy)
        }
    }

    /// Release every transfer and buffer through the route it was allocated
    /// from. Only safe once both worker threads are done with the pool.
    unsafe fn free_transfers(&self) {
        for &xfer in &self.xfers {
            if !xfer.is_null() {
                let slot = (*xfer).user_data as *mut SlotCtx;
                if !slot.is_null() {
                    drop(Box::from_raw(slot));
                }
                usb::libusb_free_transfer(xfer);
            }
        }

        for &buf in &self.bufs {
            if buf.is_null() {
                continue;
            }
            if self.use_zerocopy {
                #[cfg(target_os = "linux")]
                usb::libusb_dev_mem_free(self.devh, buf, self.buf_len);
            } else {
                let slice = ptr::slice_from_raw_parts_mut(buf, self.buf_len);
                drop(Box::from_raw(slice));
            }
        }
    }
}

/// Completion callback; runs on the event pump thread inside
/// `libusb_handle_events`. Submitting the next transfer from here is legal
/// and does not recurse.
unsafe extern "C" fn transfer_callback(xfer: *mut usb::libusb_transfer) {
    let slot = &*((*xfer).user_data as *const SlotCtx);
    let st = &*slot.state;
    let mut r = 0;

    if (*xfer).status == usb::LIBUSB_TRANSFER_COMPLETED && st.status() == STATUS_RUNNING {
        if let Some(next) = next_filled(&st.infos) {
            st.infos[next].state.store(BUF_SUBMITTED, Ordering::Release);
            r = usb::libusb_submit_transfer(st.xfers[next]);
            st.infos[slot.idx].state.store(BUF_EMPTY, Ordering::Release);
            st.buf_cond.notify_one();
        } else {
            // Producer underrun. The stale buffer has to go out again: with
            // blanking suppressed the device hangs permanently if the
            // endpoint idles.
            r = usb::libusb_submit_transfer(xfer);
            st.buf_cond.notify_one();
            st.underflow_cnt.fetch_add(1, Ordering::Relaxed);
            log::warn!("Resubmitted transfer!");
        }
    }

    if ((*xfer).status != usb::LIBUSB_TRANSFER_CANCELLED
        && (*xfer).status != usb::LIBUSB_TRANSFER_COMPLETED)
        || r == usb::LIBUSB_ERROR_NO_DEVICE
    {
        st.dev_lost.store(true, Ordering::Release);
        let _ = st.request_stop();
        st.buf_cond.notify_one();
        log::error!(
            "cb transfer status: {}, submit transfer {}, canceling...",
            (*xfer).status,
            r
        );
    }
}

#[cfg_attr(not(target_os = "linux"), allow(unused_variables, unused_mut))]
unsafe fn alloc_buffers(
    devh: *mut usb::libusb_device_handle,
    buf_num: usize,
    buf_len: usize,
) -> (Vec<*mut u8>, bool) {
    let mut bufs: Vec<*mut u8> = vec![ptr::null_mut(); buf_num];
    let mut use_zerocopy = false;

    #[cfg(target_os = "linux")]
    {
        log::info!("Allocating {} zero-copy buffers", buf_num);
        use_zerocopy = true;

        for (i, slot) in bufs.iter_mut().enumerate() {
            *slot = usb::libusb_dev_mem_alloc(devh, buf_len);

            if slot.is_null() {
                log::warn!(
                    "Failed to allocate zero-copy buffer for transfer {}\n{}\n\
                     Falling back to buffers in userspace",
                    i,
                    INCR_USBFS_HINT
                );
                use_zerocopy = false;
                break;
            }

            // Probe for the kernel usbfs mmap() bug: a correct mapping
            // points at memory the kernel zeroed, a broken one at random
            // pages.
            let probe = std::slice::from_raw_parts(*slot, buf_len);
            if probe[0] != 0 || probe[..buf_len - 1] != probe[1..] {
                log::warn!(
                    "Detected Kernel usbfs mmap() bug, falling back to \
                     buffers in userspace"
                );
                use_zerocopy = false;
                break;
            }
        }

        if !use_zerocopy {
            for slot in bufs.iter_mut() {
                if !slot.is_null() {
                    usb::libusb_dev_mem_free(devh, *slot, buf_len);
                    *slot = ptr::null_mut();
                }
            }
        }
    }

    if !use_zerocopy {
        for slot in bufs.iter_mut() {
            *slot = Box::into_raw(vec![0u8; buf_len].into_boxed_slice()) as *mut u8;
        }
    }

    (bufs, use_zerocopy)
}

/// Allocate the transfer pool, submit the initial transfers and spawn both
/// worker threads. Returns the shared state and the event pump thread's
/// join handle; the pump joins the producer itself before going inactive.
pub(crate) fn start(
    ctx: *mut usb::libusb_context,
    devh: *mut usb::libusb_device_handle,
    mode: Mode,
    cb: TxCallback,
    n_bufs: u32,
) -> Result<(Arc<StreamState>, JoinHandle<()>)> {
    let xfer_num = if n_bufs > 0 {
        n_bufs as usize
    } else {
        DEFAULT_BUF_NUMBER
    };
    // two spare slots fill while the others are on the wire
    let buf_num = xfer_num + 2;
    let buf_len = FL2K_XFER_LEN;

    unsafe {
        let mut xfers: Vec<*mut usb::libusb_transfer> = Vec::with_capacity(buf_num);
        for _ in 0..buf_num {
            let xfer = usb::libusb_alloc_transfer(0);
            if xfer.is_null() {
                for &x in &xfers {
                    usb::libusb_free_transfer(x);
                }
                return Err(Fl2kError::NoMem);
            }
            xfers.push(xfer);
        }

        let (bufs, use_zerocopy) = alloc_buffers(devh, buf_num, buf_len);

        let infos: Box<[XferInfo]> = (0..buf_num).map(|_| XferInfo::new()).collect();

        let state = Arc::new(StreamState {
            ctx,
            devh,
            mode,
            xfer_num,
            buf_len,
            xfers,
            bufs,
            infos,
            use_zerocopy,
            status: AtomicU8::new(STATUS_RUNNING),
            cancel: AtomicI32::new(0),
            dev_lost: AtomicBool::new(false),
            underflow_cnt: AtomicU32::new(0),
            buf_mutex: Mutex::new(()),
            buf_cond: Condvar::new(),
        });

        let state_ptr = Arc::as_ptr(&state);
        for i in 0..buf_num {
            let xfer = state.xfers[i];
            (*xfer).dev_handle = devh;
            (*xfer).endpoint = BULK_OUT_ENDPOINT;
            (*xfer).transfer_type = usb::LIBUSB_TRANSFER_TYPE_BULK;
            (*xfer).timeout = BULK_TIMEOUT_MS;
            (*xfer).buffer = state.bufs[i];
            (*xfer).length = state.buf_len as c_int;
            (*xfer).callback = transfer_callback;
            (*xfer).user_data = Box::into_raw(Box::new(SlotCtx {
                state: state_ptr,
                idx: i,
            })) as *mut c_void;
        }

        for i in 0..state.xfer_num {
            let r = usb::libusb_submit_transfer(state.xfers[i]);
            state.infos[i].state.store(BUF_SUBMITTED, Ordering::Release);

            if r < 0 {
                log::error!("Failed to submit transfer {}\n{}", i, INCR_USBFS_HINT);
                break;
            }
        }

        let producer_state = state.clone();
        let producer = match thread::Builder::new()
            .name("fl2k-sample-worker".to_string())
            .spawn(move || sample_worker(producer_state, cb))
        {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Error spawning sample worker thread: {}", e);
                state.set_status(STATUS_INACTIVE);
                state.free_transfers();
                return Err(Fl2kError::NoMem);
            }
        };

        let pump_state = state.clone();
        let pump = match thread::Builder::new()
            .name("fl2k-usb-worker".to_string())
            .spawn(move || usb_worker(pump_state, producer))
        {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Error spawning USB worker thread: {}", e);
                // the producer exits on its own once it sees the status; the
                // pool is leaked rather than freed under in-flight transfers
                state.set_status(STATUS_INACTIVE);
                state.buf_cond.notify_one();
                return Err(Fl2kError::NoMem);
            }
        };

        Ok((state, pump))
    }
}

/// Producer thread: pulls sample buffers from the application callback and
/// fills EMPTY slots in sequence order.
fn sample_worker(st: Arc<StreamState>, mut cb: TxCallback) {
    let callback_cnt = match st.mode {
        // three single-channel callbacks supply as much data as one
        // multichannel callback, keeping the per-call buffer size constant
        Mode::Singlechan => 3,
        Mode::Multichan => 1,
    };
    let mut underflows = 0u32;
    let mut seq = 0u64;

    while st.status() == STATUS_RUNNING {
        let cnt = st.underflow_cnt.load(Ordering::Relaxed);
        let mut info = [DataInfo::new(cnt), DataInfo::new(cnt), DataInfo::new(cnt)];

        cb(&mut info[0]);

        let cnt = st.underflow_cnt.load(Ordering::Relaxed);
        if cnt > underflows {
            log::warn!("Underflow! Skipped {} buffers", cnt - underflows);
            underflows = cnt;
        }

        let idx = match next_empty(&st.infos) {
            Some(idx) => idx,
            None => {
                let guard = st.buf_mutex.lock().unwrap();
                let _ = st.buf_cond.wait_timeout(guard, Duration::from_secs(1));

                // the device might be gone in the meantime
                if st.status() != STATUS_RUNNING {
                    break;
                }
                match next_empty(&st.infos) {
                    Some(idx) => idx,
                    None => {
                        log::warn!("no free transfer, skipping input buffer");
                        continue;
                    }
                }
            }
        };

        let out = unsafe { std::slice::from_raw_parts_mut(st.bufs[idx], st.buf_len) };

        match st.mode {
            Mode::Singlechan => {
                for i in 0..callback_cnt {
                    let bias = if info[i].sampletype_signed { 128 } else { 0 };
                    let src = info[i].r_buf;
                    if !src.is_null() {
                        let input = unsafe { std::slice::from_raw_parts(src, FL2K_BUF_LEN) };
                        convert::singlechan(
                            &mut out[i * FL2K_BUF_LEN..(i + 1) * FL2K_BUF_LEN],
                            input,
                            bias,
                        );
                    }

                    if i + 1 < callback_cnt {
                        cb(&mut info[i + 1]);
                    }
                }
            }
            Mode::Multichan => {
                let bias = if info[0].sampletype_signed { 128 } else { 0 };
                for (src, scatter) in [
                    (info[0].r_buf, convert::red as fn(&mut [u8], &[u8], u8)),
                    (info[0].g_buf, convert::green),
                    (info[0].b_buf, convert::blue),
                ] {
                    if !src.is_null() {
                        let input = unsafe { std::slice::from_raw_parts(src, FL2K_BUF_LEN) };
                        scatter(out, input, bias);
                    }
                }
            }
        }

        st.infos[idx].seq.store(seq, Ordering::Relaxed);
        seq += 1;
        st.infos[idx].state.store(BUF_FILLED, Ordering::Release);
    }

    // one last callback so the application can unblock after device loss
    if st.dev_lost() {
        let mut info = DataInfo::new(st.underflow_cnt.load(Ordering::Relaxed));
        info.device_error = true;
        cb(&mut info);
    }
}

/// Event pump thread: drives libusb completions while RUNNING, then drains
/// the cancellation of every outstanding transfer, reclaims the pool and
/// parks the engine INACTIVE.
fn usb_worker(st: Arc<StreamState>, producer: JoinHandle<()>) {
    let mut tv = libc::timeval {
        tv_sec: 1,
        tv_usec: 0,
    };
    let mut zerotv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };

    unsafe {
        while st.status() == STATUS_RUNNING {
            usb::libusb_handle_events_timeout_completed(st.ctx, &mut tv, st.cancel.as_ptr());
        }

        loop {
            if st.status() == STATUS_INACTIVE {
                break;
            }

            let r = usb::libusb_handle_events_timeout_completed(st.ctx, &mut tv, st.cancel.as_ptr());
            if r < 0 {
                if r == usb::LIBUSB_ERROR_INTERRUPTED {
                    // stray signal
                    continue;
                }
                break;
            }

            if st.status() == STATUS_CANCELING {
                let mut next_status = STATUS_INACTIVE;

                for &xfer in &st.xfers {
                    if xfer.is_null() {
                        continue;
                    }

                    if (*xfer).status != usb::LIBUSB_TRANSFER_CANCELLED {
                        let r = usb::libusb_cancel_transfer(xfer);
                        // pump events after each cancellation so its status
                        // change is delivered before the next check
                        usb::libusb_handle_events_timeout_completed(
                            st.ctx,
                            &mut zerotv,
                            ptr::null_mut(),
                        );
                        if r < 0 {
                            continue;
                        }
                        next_status = STATUS_CANCELING;
                    }
                }

                if st.dev_lost() || next_status == STATUS_INACTIVE {
                    // deliver whatever completions are still pending from
                    // the cancellations above
                    usb::libusb_handle_events_timeout_completed(
                        st.ctx,
                        &mut zerotv,
                        ptr::null_mut(),
                    );
                    break;
                }
            }
        }

        // wake the producer if it is parked on the condition variable, and
        // wait for it before freeing the pool under it
        st.buf_cond.notify_one();
        let _ = producer.join();
        st.free_transfers();
        st.set_status(STATUS_INACTIVE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(states: &[(u8, u64)]) -> Vec<XferInfo> {
        states
            .iter()
            .map(|&(state, seq)| XferInfo {
                seq: AtomicU64::new(seq),
                state: AtomicU8::new(state),
            })
            .collect()
    }

    #[test]
    fn test_next_filled_is_fifo() {
        let infos = pool(&[
            (BUF_FILLED, 7),
            (BUF_SUBMITTED, 2),
            (BUF_FILLED, 5),
            (BUF_EMPTY, 0),
            (BUF_FILLED, 6),
        ]);
        assert_eq!(next_filled(&infos), Some(2));
    }

    #[test]
    fn test_next_filled_empty_pool() {
        let infos = pool(&[(BUF_EMPTY, 0), (BUF_SUBMITTED, 1)]);
        assert_eq!(next_filled(&infos), None);
    }

    #[test]
    fn test_next_empty_prefers_first() {
        let infos = pool(&[(BUF_SUBMITTED, 0), (BUF_EMPTY, 0), (BUF_EMPTY, 0)]);
        assert_eq!(next_empty(&infos), Some(1));
    }

    #[test]
    fn test_fifo_across_wrapping_sequence() {
        // sequence numbers are u64 and never reused within a session; the
        // smallest outstanding one always plays next
        let infos = pool(&[(BUF_FILLED, u64::MAX - 1), (BUF_FILLED, u64::MAX)]);
        assert_eq!(next_filled(&infos), Some(0));
    }
}
