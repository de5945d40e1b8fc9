// Copyright 2025-2026 CEMAXECUTER LLC

//! Minimal libusb-1.0 bindings: the subset of the synchronous and
//! asynchronous APIs this crate drives.

#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

use std::os::raw::{c_int, c_uchar, c_uint, c_void};

pub type libusb_context = c_void;
pub type libusb_device = c_void;
pub type libusb_device_handle = c_void;

#[repr(C)]
pub struct libusb_device_descriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bcdUSB: u16,
    pub bDeviceClass: u8,
    pub bDeviceSubClass: u8,
    pub bDeviceProtocol: u8,
    pub bMaxPacketSize0: u8,
    pub idVendor: u16,
    pub idProduct: u16,
    pub bcdDevice: u16,
    pub iManufacturer: u8,
    pub iProduct: u8,
    pub iSerialNumber: u8,
    pub bNumConfigurations: u8,
}

pub type libusb_transfer_cb_fn = unsafe extern "C" fn(*mut libusb_transfer);

// Zero isochronous packets everywhere in this crate, so the trailing
// flexible array member of the C struct is omitted.
#[repr(C)]
pub struct libusb_transfer {
    pub dev_handle: *mut libusb_device_handle,
    pub flags: u8,
    pub endpoint: c_uchar,
    pub transfer_type: c_uchar,
    pub timeout: c_uint,
    pub status: c_int,
    pub length: c_int,
    pub actual_length: c_int,
    pub callback: libusb_transfer_cb_fn,
    pub user_data: *mut c_void,
    pub buffer: *mut c_uchar,
    pub num_iso_packets: c_int,
}

pub const LIBUSB_REQUEST_TYPE_VENDOR: u8 = 0x40;
pub const LIBUSB_ENDPOINT_IN: u8 = 0x80;
pub const LIBUSB_ENDPOINT_OUT: u8 = 0x00;

pub const LIBUSB_TRANSFER_TYPE_BULK: c_uchar = 2;

// enum libusb_transfer_status
pub const LIBUSB_TRANSFER_COMPLETED: c_int = 0;
pub const LIBUSB_TRANSFER_CANCELLED: c_int = 3;

// enum libusb_error
pub const LIBUSB_ERROR_ACCESS: c_int = -3;
pub const LIBUSB_ERROR_NO_DEVICE: c_int = -4;
pub const LIBUSB_ERROR_INTERRUPTED: c_int = -10;

pub const LIBUSB_OPTION_LOG_LEVEL: c_int = 0;

extern "C" {
    pub fn libusb_init(ctx: *mut *mut libusb_context) -> c_int;
    pub fn libusb_exit(ctx: *mut libusb_context);
    pub fn libusb_set_option(ctx: *mut libusb_context, option: c_int, ...) -> c_int;

    pub fn libusb_get_device_list(
        ctx: *mut libusb_context,
        list: *mut *mut *mut libusb_device,
    ) -> libc::ssize_t;
    pub fn libusb_free_device_list(list: *mut *mut libusb_device, unref_devices: c_int);
    pub fn libusb_get_device_descriptor(
        dev: *mut libusb_device,
        desc: *mut libusb_device_descriptor,
    ) -> c_int;

    pub fn libusb_open(dev: *mut libusb_device, handle: *mut *mut libusb_device_handle) -> c_int;
    pub fn libusb_close(handle: *mut libusb_device_handle);

    pub fn libusb_kernel_driver_active(
        handle: *mut libusb_device_handle,
        interface_number: c_int,
    ) -> c_int;
    pub fn libusb_detach_kernel_driver(
        handle: *mut libusb_device_handle,
        interface_number: c_int,
    ) -> c_int;
    pub fn libusb_claim_interface(
        handle: *mut libusb_device_handle,
        interface_number: c_int,
    ) -> c_int;
    pub fn libusb_release_interface(
        handle: *mut libusb_device_handle,
        interface_number: c_int,
    ) -> c_int;
    pub fn libusb_set_interface_alt_setting(
        handle: *mut libusb_device_handle,
        interface_number: c_int,
        alternate_setting: c_int,
    ) -> c_int;

    pub fn libusb_control_transfer(
        handle: *mut libusb_device_handle,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: *mut c_uchar,
        length: u16,
        timeout: c_uint,
    ) -> c_int;

    pub fn libusb_alloc_transfer(iso_packets: c_int) -> *mut libusb_transfer;
    pub fn libusb_free_transfer(transfer: *mut libusb_transfer);
    pub fn libusb_submit_transfer(transfer: *mut libusb_transfer) -> c_int;
    pub fn libusb_cancel_transfer(transfer: *mut libusb_transfer) -> c_int;

    pub fn libusb_handle_events_timeout_completed(
        ctx: *mut libusb_context,
        tv: *mut libc::timeval,
        completed: *mut c_int,
    ) -> c_int;

    #[cfg(target_os = "linux")]
    pub fn libusb_dev_mem_alloc(
        handle: *mut libusb_device_handle,
        length: libc::size_t,
    ) -> *mut c_uchar;
    #[cfg(target_os = "linux")]
    pub fn libusb_dev_mem_free(
        handle: *mut libusb_device_handle,
        buffer: *mut c_uchar,
        length: libc::size_t,
    ) -> c_int;
}
