//! The real `libsane` behind the [`Backend`] trait.

use crate::{
    result::sane_try, scanner::Scanner, utils::slice_from_c_array, Backend, Credentials,
    DeviceHandle, DeviceInfo, Result, SaneError,
};
use bstr::{BString, ByteSlice};
use libsane_sys::*;
use once_cell::sync::Lazy;
use std::{
    collections::HashMap,
    ffi::{c_char, CStr, CString},
    fmt::Debug,
    ptr::null_mut,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

/// `sane_init` may only be called once per process.
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Credentials handed to the authorization callback, keyed by device name.
static CREDENTIALS: Lazy<Mutex<HashMap<BString, Credentials>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub struct SaneBackend {
    __private_field: (),
}

impl SaneBackend {
    pub fn new() -> Result<Self> {
        if INITIALIZED.swap(true, Ordering::SeqCst) {
            log::error!("SANE is already initialized in this process");
            return Err(SaneError::DeviceBusy);
        }

        let mut version = 0;

        log::trace!("Call sane_init({:p}, auth_callback)", &mut version);
        if let Err(err) = crate::result::from_status(unsafe {
            sane_init(&mut version, Some(auth_callback))
        }) {
            INITIALIZED.store(false, Ordering::SeqCst);
            return Err(err);
        }

        log::debug!(
            "SANE version {}.{}.{}",
            (version >> 24) & 0xff,
            (version >> 16) & 0xff,
            version & 0xffff,
        );

        Ok(Self {
            __private_field: (),
        })
    }
}

impl Backend for SaneBackend {
    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        let mut device_list = null_mut();

        log::trace!("Call sane_get_devices({:p}, 0)", &mut device_list);
        sane_try!(sane_get_devices(&mut device_list, 0));

        let devices = unsafe { slice_from_c_array(device_list.cast_const()) }
            .iter()
            .map(|device| DeviceInfo::from(*device))
            .collect();

        Ok(devices)
    }

    fn open(
        &self,
        name: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn DeviceHandle>> {
        if let Some(credentials) = credentials {
            if let Ok(mut table) = CREDENTIALS.lock() {
                table.insert(name.into(), credentials.clone());
            }
        }

        let cname = CString::new(name).map_err(|_| SaneError::Inval)?;
        let mut handle = null_mut();

        log::trace!("Call sane_open('{name}', {:p})", &mut handle);
        sane_try!(sane_open(cname.as_ptr(), &mut handle));

        Ok(Box::new(Scanner::new(name.into(), handle)))
    }
}

impl Debug for SaneBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaneBackend").finish()
    }
}

impl Drop for SaneBackend {
    fn drop(&mut self) {
        log::trace!("Call sane_exit()");
        unsafe { sane_exit() };
        INITIALIZED.store(false, Ordering::SeqCst);
    }
}

impl From<&SANE_Device> for DeviceInfo {
    fn from(device: &SANE_Device) -> Self {
        let field = |ptr: SANE_String_Const| {
            unsafe { crate::utils::cstr2bstr(ptr) }
                .map(BString::from)
                .unwrap_or_default()
        };

        Self {
            name: field(device.name),
            vendor: field(device.vendor),
            model: field(device.model),
            ty: field(device.type_),
        }
    }
}

/// Resources look like `device` or `device$MD5-challenge`.
unsafe extern "C" fn auth_callback(
    resource: SANE_String_Const,
    username: *mut SANE_Char,
    password: *mut SANE_Char,
) {
    if resource.is_null() || username.is_null() || password.is_null() {
        return;
    }

    let resource = CStr::from_ptr(resource).to_bytes();
    let device = resource.split_str("$").next().unwrap_or(resource);

    log::debug!("Backend asks credentials for '{}'", device.as_bstr());

    let credentials = match CREDENTIALS.lock() {
        Ok(table) => table.get(device.as_bstr()).cloned(),
        Err(_) => None,
    };

    let Some(credentials) = credentials else {
        log::warn!("No credentials for '{}'", device.as_bstr());
        return;
    };

    copy_field(&credentials.username, username, SANE_MAX_USERNAME_LEN as usize);
    copy_field(&credentials.password, password, SANE_MAX_PASSWORD_LEN as usize);
}

unsafe fn copy_field(value: &str, dst: *mut c_char, capacity: usize) {
    let len = value.len().min(capacity - 1);
    std::ptr::copy_nonoverlapping(value.as_ptr().cast::<c_char>(), dst, len);
    *dst.add(len) = 0;
}
