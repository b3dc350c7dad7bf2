use crate::{
    Credentials, DeviceInfo, OptionDescriptor, OptionValue, Parameters, Result, SetInfo,
};

/// Entry point of a scanner access library.
pub trait Backend: Send + Sync {
    fn devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Opens a device. `SaneError::AccessDenied` means the device wants
    /// credentials; retry with `Some(credentials)`.
    fn open(&self, name: &str, credentials: Option<&Credentials>)
        -> Result<Box<dyn DeviceHandle>>;
}

/// An open device. Dropping the handle closes the device.
pub trait DeviceHandle: Send {
    /// Descriptor of option `index`; `None` past the last option.
    /// Index 0 is the option count.
    fn option_descriptor(&self, index: usize) -> Option<OptionDescriptor>;

    fn get_option(&mut self, index: usize) -> Result<OptionValue>;

    fn set_option(&mut self, index: usize, value: &OptionValue) -> Result<SetInfo>;

    fn set_option_auto(&mut self, index: usize) -> Result<SetInfo>;

    /// Parameters of the next frame. Valid before `start` as an estimate.
    fn parameters(&mut self) -> Result<Parameters>;

    fn start(&mut self) -> Result<()>;

    /// Reads the next chunk of the current frame.
    /// `Err(SaneError::EOF)` ends the frame.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Abandons the current frame. Idempotent.
    fn cancel(&mut self);

    /// Number of options including option 0, read from option 0 itself.
    fn option_count(&mut self) -> Result<usize> {
        match self.get_option(0)? {
            OptionValue::Int(count) if count > 0 => Ok(count as usize),
            _ => Err(crate::SaneError::Inval),
        }
    }
}
