use bstr::BStr;
use std::ffi::{c_char, CStr};

pub unsafe fn cstr2bstr<'a>(str: *const c_char) -> Option<&'a BStr> {
    str.as_ref()
        .map(|cstr| CStr::from_ptr(cstr).to_bytes().into())
}

/// Borrows a NULL-terminated C array of pointers. A null array is empty.
pub unsafe fn slice_from_c_array<'a, T>(ptr: *const *const T) -> &'a [&'a T]
where
    T: Sized + 'static,
{
    if ptr.is_null() {
        return &[];
    }

    let mut len = 0;
    while !(*ptr.add(len)).is_null() {
        len += 1;
    }

    let slice: &'a [*const T] = core::slice::from_raw_parts(ptr, len);
    std::mem::transmute(slice)
}
