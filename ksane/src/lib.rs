//! Scanner session core: a typed model of device options, the preview and
//! final scan protocol with batch scanning, and pixel normalisation of the
//! acquired frames.
//!
//! A [`Session`] drives one device. Scanning happens on a worker thread;
//! results arrive as [`SessionEvent`]s after [`Session::poll`] or
//! [`Session::wait_idle`].

mod config;
mod discovery;
mod error;
mod events;
pub mod gamma;
pub mod names;
pub mod normalize;
mod option;
mod policy;
mod registry;
mod selection;
mod session;
mod worker;

pub use config::SessionConfig;
pub use discovery::DeviceDiscovery;
pub use error::{KsaneError, NormalizeError, OptionError, Result};
pub use events::{Alerter, LogAlerter, ScanKind, ScanStatus, ScannedImage, SessionEvent};
pub use normalize::{ImageFormat, Raster};
pub use option::{DeviceOption, OptionFlags, OptionKind, OptionState, SetEffects, SharedHandle};
pub use policy::{DefaultHeuristics, Heuristics};
pub use registry::OptionRegistry;
pub use selection::{RegionDetector, Selection};
pub use session::Session;
pub use worker::ScanCanceller;

pub use libsane;
