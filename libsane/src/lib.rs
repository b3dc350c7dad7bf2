#![allow(non_upper_case_globals)]

mod backend;
mod device;
mod fixed;
mod options;
mod parameters;
mod result;
#[cfg(feature = "sys")]
mod sane;
#[cfg(feature = "sys")]
mod scanner;
mod test_backend;
#[cfg(feature = "sys")]
mod utils;

pub use backend::{Backend, DeviceHandle};
pub use device::{Credentials, DeviceInfo};
pub use fixed::Fixed;
pub use options::{
    Capabilities as OptionCapabilities, Constraint as OptionConstraint, OptionDescriptor,
    SetInfo, Type as OptionType, Unit as OptionUnit, Value as OptionValue, WORD_SIZE,
};
pub use parameters::{FrameFormat, Parameters};
pub use result::{Result, SaneError};
#[cfg(feature = "sys")]
pub use sane::SaneBackend;
#[cfg(feature = "sys")]
pub use scanner::Scanner;
pub use test_backend::{
    TestBackend, TestHandle, TestSensors, MODE_COLOR, MODE_GRAY, MODE_LINEART, SOURCE_ADF,
    SOURCE_FLATBED, SOURCE_TRANSPARENCY, TEST_AUTH_DEVICE, TEST_DEVICE, TEST_PASSWORD,
    TEST_USERNAME,
};
