use crate::normalize::ImageFormat;
use libsane::{DeviceInfo, SaneError};
use strum::{Display, IntoStaticStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum ScanStatus {
    NoError,
    Information,
    ErrorGeneral,
}

impl ScanStatus {
    /// How a terminal device status is surfaced to the user.
    pub fn classify(status: Option<SaneError>) -> Self {
        match status {
            None | Some(SaneError::Cancelled) | Some(SaneError::EOF) => Self::NoError,
            Some(SaneError::NoDocs) => Self::Information,
            Some(
                SaneError::Unsupported
                | SaneError::IO
                | SaneError::NoMem
                | SaneError::Inval
                | SaneError::Jammed
                | SaneError::CoverOpen
                | SaneError::DeviceBusy
                | SaneError::AccessDenied,
            ) => Self::ErrorGeneral,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ScanKind {
    Preview,
    Final,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedImage {
    pub kind: ScanKind,
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub bytes_per_line: usize,
    pub format: ImageFormat,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Scan progress in percent.
    Progress(u8),
    /// One preview or one whole (possibly batched) final scan has ended.
    ScanDone {
        status: ScanStatus,
        /// Terminal device status when it was not a clean end of data.
        reason: Option<SaneError>,
        message: String,
    },
    ImageReady(ScannedImage),
    DeviceListUpdated(Vec<DeviceInfo>),
    /// An alert delivered to a caller that listens for them.
    UserMessage { status: ScanStatus, message: String },
    ButtonPressed {
        name: String,
        title: String,
        pressed: bool,
    },
    OptionValueChanged { name: String, value: String },
}

/// Receives alerts nobody listens for.
pub trait Alerter: Send {
    fn alert(&self, status: ScanStatus, message: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlerter;

impl Alerter for LogAlerter {
    fn alert(&self, status: ScanStatus, message: &str) {
        match status {
            ScanStatus::ErrorGeneral => log::error!("{message}"),
            ScanStatus::Information | ScanStatus::NoError => log::info!("{message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(ScanStatus::classify(None), ScanStatus::NoError);
        assert_eq!(ScanStatus::classify(Some(SaneError::Cancelled)), ScanStatus::NoError);
        assert_eq!(ScanStatus::classify(Some(SaneError::EOF)), ScanStatus::NoError);
        assert_eq!(ScanStatus::classify(Some(SaneError::NoDocs)), ScanStatus::Information);
        for err in [
            SaneError::Unsupported,
            SaneError::IO,
            SaneError::NoMem,
            SaneError::Inval,
            SaneError::Jammed,
            SaneError::CoverOpen,
            SaneError::DeviceBusy,
            SaneError::AccessDenied,
        ] {
            assert_eq!(ScanStatus::classify(Some(err)), ScanStatus::ErrorGeneral);
        }
    }
}
