use crate::{
    options::WORD_SIZE, result::sane_try, DeviceHandle, FrameFormat, OptionDescriptor,
    OptionType, OptionValue, Parameters, Result, SaneError, SetInfo,
};
use bstr::BString;
use libsane_sys::*;
use std::{
    ffi::c_void,
    ptr::null_mut,
};

/// An open SANE device.
#[derive(Debug)]
pub struct Scanner {
    name: BString,
    handle: SANE_Handle,
}

// A SANE handle is used from one thread at a time, which `&mut self` ensures.
unsafe impl Send for Scanner {}

impl Scanner {
    pub(crate) fn new(name: BString, handle: SANE_Handle) -> Self {
        Self { name, handle }
    }

    fn raw(&self) -> SANE_Handle {
        self.handle
    }

    fn control_option(
        &mut self,
        index: usize,
        action: SANE_Action,
        value: *mut c_void,
    ) -> Result<SetInfo> {
        let mut info: SANE_Int = 0;

        log::trace!(
            "Call sane_control_option({:p}, {index}, {action}, {value:p}, {:p})",
            self.raw(),
            &mut info,
        );
        sane_try!(sane_control_option(
            self.raw(),
            index as SANE_Int,
            action,
            value,
            &mut info,
        ));

        Ok(SetInfo::from_bits_retain(info as u32))
    }
}

impl DeviceHandle for Scanner {
    fn option_descriptor(&self, index: usize) -> Option<OptionDescriptor> {
        log::trace!("Call sane_get_option_descriptor({:p}, {index})", self.raw());
        let desc = unsafe { sane_get_option_descriptor(self.raw(), index as SANE_Int).as_ref() }?;

        Some(unsafe { OptionDescriptor::from_raw(desc) })
    }

    fn get_option(&mut self, index: usize) -> Result<OptionValue> {
        // Option 0 has no reliable descriptor size on some backends.
        let desc = self.option_descriptor(index).ok_or(SaneError::Inval)?;
        let size = desc.size.max(WORD_SIZE);

        if desc.ty == OptionType::Button {
            return Ok(OptionValue::Button);
        }
        if desc.ty == OptionType::Group {
            return Err(SaneError::Inval);
        }

        let mut buf = vec![0u8; size + 1];
        self.control_option(
            index,
            SANE_Action_SANE_ACTION_GET_VALUE,
            buf.as_mut_ptr().cast(),
        )?;

        let words = || {
            buf[..size - size % WORD_SIZE]
                .chunks_exact(WORD_SIZE)
                .map(|chunk| i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect::<Vec<_>>()
        };

        let value = match desc.ty {
            OptionType::Bool => OptionValue::Bool(words().first().is_some_and(|word| *word != 0)),
            OptionType::Int | OptionType::Fixed if desc.word_count() > 1 => {
                OptionValue::Words(words())
            }
            OptionType::Int => OptionValue::Int(words().first().copied().unwrap_or_default()),
            OptionType::Fixed => {
                OptionValue::Fixed(crate::Fixed(words().first().copied().unwrap_or_default()))
            }
            OptionType::String => {
                let len = buf.iter().position(|byte| *byte == 0).unwrap_or(size);
                OptionValue::String(BString::from(&buf[..len]))
            }
            OptionType::Button | OptionType::Group => return Err(SaneError::Inval),
        };

        Ok(value)
    }

    fn set_option(&mut self, index: usize, value: &OptionValue) -> Result<SetInfo> {
        let desc = self.option_descriptor(index).ok_or(SaneError::Inval)?;

        let mut buf = match value {
            OptionValue::Button => {
                return self.control_option(index, SANE_Action_SANE_ACTION_SET_VALUE, null_mut())
            }
            OptionValue::String(str) => {
                if str.len() >= desc.size {
                    return Err(SaneError::Inval);
                }
                let mut buf = vec![0u8; desc.size];
                buf[..str.len()].copy_from_slice(str);
                buf
            }
            value => value
                .as_words()
                .unwrap_or_default()
                .iter()
                .flat_map(|word| word.to_ne_bytes())
                .collect(),
        };

        if buf.len() < desc.size {
            return Err(SaneError::Inval);
        }

        self.control_option(
            index,
            SANE_Action_SANE_ACTION_SET_VALUE,
            buf.as_mut_ptr().cast(),
        )
    }

    fn set_option_auto(&mut self, index: usize) -> Result<SetInfo> {
        self.control_option(index, SANE_Action_SANE_ACTION_SET_AUTO, null_mut())
    }

    fn parameters(&mut self) -> Result<Parameters> {
        let mut params = unsafe { core::mem::zeroed::<SANE_Parameters>() };

        log::trace!("Call sane_get_parameters({:p}, {:p})", self.raw(), &mut params);
        sane_try!(sane_get_parameters(self.raw(), &mut params));

        Ok(Parameters {
            format: FrameFormat::from(params.format),
            last_frame: params.last_frame != 0,
            bytes_per_line: params.bytes_per_line.max(0) as usize,
            pixels_per_line: params.pixels_per_line.max(0) as usize,
            lines: (params.lines >= 0).then_some(params.lines as usize),
            depth: params.depth.max(0) as usize,
        })
    }

    fn start(&mut self) -> Result<()> {
        log::trace!("Call sane_start({:p})", self.raw());
        sane_try!(sane_start(self.raw()));

        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Err(SaneError::Inval);
        }

        let mut count = 0;
        let len = buf.len().try_into().unwrap_or(SANE_Int::MAX);

        log::trace!(
            "Call sane_read({:p}, {:p}, {len}, {:p})",
            self.raw(),
            buf.as_mut_ptr(),
            &mut count,
        );
        sane_try!(sane_read(self.raw(), buf.as_mut_ptr(), len, &mut count));

        Ok(count.max(0) as usize)
    }

    fn cancel(&mut self) {
        log::trace!("Call sane_cancel({:p})", self.raw());
        unsafe { sane_cancel(self.raw()) };
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        log::trace!("Call sane_close({:p}) for '{}'", self.raw(), self.name);
        unsafe { sane_close(self.raw()) };
    }
}
