//! One open device: option mutation policy and the preview/final scan
//! protocol.

use crate::{
    config::SessionConfig,
    discovery::DeviceDiscovery,
    error::{KsaneError, NormalizeError, OptionError, Result},
    events::{Alerter, LogAlerter, ScanKind, ScanStatus, ScannedImage, SessionEvent},
    names::*,
    normalize::{self, ImageFormat, Raster},
    option::{DeviceOption, OptionKind, SetEffects, SharedHandle},
    policy::{DefaultHeuristics, Heuristics},
    registry::{lock, OptionRegistry},
    selection::{RegionDetector, Selection, SelectionQueue},
    worker::{ScanCanceller, ScanOutcome, ScanWorker, WorkerMessage},
};
use libsane::{Backend, Credentials, DeviceInfo, FrameFormat, OptionUnit, SaneError};
use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
    time::Instant,
};
use tokio::sync::mpsc;

/// Longest side of the placeholder preview raster.
const PREVIEW_SIDE: usize = 400;
/// Preview resolution search: step, ceiling and the size to reach.
const PREVIEW_DPI_STEP: f64 = 25.0;
const PREVIEW_DPI_MAX: f64 = 600.0;
const PREVIEW_MIN_PIXELS: usize = 300;

const DEFAULT_DEPTH: i32 = 8;
const DEFAULT_RESOLUTION: f64 = 600.0;

/// Options changed by a preview and put back afterwards.
const PREVIEW_SAVED: [&str; 9] = [
    BIT_DEPTH,
    SCAN_RESOLUTION,
    SCAN_X_RESOLUTION,
    SCAN_Y_RESOLUTION,
    PREVIEW,
    SCAN_TL_X,
    SCAN_TL_Y,
    SCAN_BR_X,
    SCAN_BR_Y,
];

const AREA: [&str; 4] = [SCAN_TL_X, SCAN_TL_Y, SCAN_BR_X, SCAN_BR_Y];
const GAMMA_RGB: [&str; 3] = [GAMMA_VECTOR_R, GAMMA_VECTOR_G, GAMMA_VECTOR_B];

struct OpenDevice {
    // Field order is drop order: the worker lets go of the handle first.
    worker: ScanWorker,
    registry: OptionRegistry,
    handle: SharedHandle,
    name: String,
    scan: Option<ScanKind>,
}

pub struct Session {
    backend: Arc<dyn Backend>,
    discovery: Arc<DeviceDiscovery>,
    config: SessionConfig,
    heuristics: Arc<dyn Heuristics>,
    alerter: Box<dyn Alerter>,
    detector: Option<Box<dyn RegionDetector>>,

    events: mpsc::UnboundedSender<SessionEvent>,
    device_list: mpsc::UnboundedReceiver<Vec<DeviceInfo>>,
    listening_messages: bool,

    device: Option<OpenDevice>,
    canceller: ScanCanceller,
    preview: Arc<Mutex<Raster>>,
    preview_max: (f64, f64),
    preview_dpi: f64,
    auto_select: bool,

    selection: Selection,
    selections: SelectionQueue,

    invert_colors: bool,
    gamma_merged: bool,
    close_pending: bool,
    reload_deadline: Option<Instant>,
    last_poll: Instant,
}

impl Session {
    pub fn new(
        backend: Arc<dyn Backend>,
        discovery: Arc<DeviceDiscovery>,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let device_list = discovery.subscribe();

        let session = Self {
            backend,
            discovery,
            preview_dpi: config.preview_dpi,
            auto_select: config.auto_select,
            config,
            heuristics: Arc::new(DefaultHeuristics),
            alerter: Box::new(LogAlerter),
            detector: None,
            events: events_tx,
            device_list,
            listening_messages: false,
            device: None,
            canceller: ScanCanceller::default(),
            preview: Arc::new(Mutex::new(Raster::new(PREVIEW_SIDE, PREVIEW_SIDE))),
            preview_max: (0.0, 0.0),
            selection: Selection::FULL,
            selections: SelectionQueue::default(),
            invert_colors: false,
            gamma_merged: true,
            close_pending: false,
            reload_deadline: None,
            last_poll: Instant::now(),
        };

        (session, events_rx)
    }

    pub fn set_heuristics(&mut self, heuristics: Arc<dyn Heuristics>) {
        self.heuristics = heuristics;
    }

    pub fn set_alerter(&mut self, alerter: Box<dyn Alerter>) {
        self.alerter = alerter;
    }

    pub fn set_region_detector(&mut self, detector: Box<dyn RegionDetector>) {
        self.detector = Some(detector);
    }

    /// With `true`, alerts arrive as [`SessionEvent::UserMessage`] instead
    /// of going to the [`Alerter`].
    pub fn listen_user_messages(&mut self, listen: bool) {
        self.listening_messages = listen;
    }

    pub fn discovery(&self) -> &Arc<DeviceDiscovery> {
        &self.discovery
    }

    // Open and close

    pub fn open(&mut self, name: &str) -> Result<()> {
        self.open_device(name, None)
    }

    pub fn open_with_credentials(&mut self, name: &str, credentials: Credentials) -> Result<()> {
        self.open_device(name, Some(&credentials))
    }

    fn open_device(&mut self, name: &str, credentials: Option<&Credentials>) -> Result<()> {
        if let Some(device) = &self.device {
            return Err(KsaneError::AlreadyOpen(device.name.clone()));
        }

        log::debug!("Open device '{name}'");

        let handle = match self.backend.open(name, credentials) {
            Ok(handle) => handle,
            Err(SaneError::AccessDenied) => {
                log::info!("Device '{name}' requires authentication");
                return Err(KsaneError::AuthenticationRequired(name.to_owned()));
            }
            Err(source) => {
                return Err(KsaneError::DeviceUnavailable {
                    name: name.to_owned(),
                    source,
                })
            }
        };
        let handle: SharedHandle = Arc::new(Mutex::new(handle));

        let registry = OptionRegistry::open(&handle, self.heuristics.as_ref()).map_err(|source| {
            KsaneError::DeviceUnavailable {
                name: name.to_owned(),
                source,
            }
        })?;

        self.device = Some(OpenDevice {
            worker: ScanWorker::new(handle.clone(), self.preview.clone(), self.canceller.clone()),
            registry,
            handle,
            name: name.to_owned(),
            scan: None,
        });

        self.preview_max = (0.0, 0.0);
        self.selection = Selection::FULL;
        self.selections.clear();
        self.last_poll = Instant::now();

        {
            let mut preview = self.lock_preview();
            preview.resize(PREVIEW_SIDE, PREVIEW_SIDE);
            preview.fill_white();
        }
        self.update_preview_size();

        self.set_default_values();

        if !self.config.defaults.is_empty() {
            let defaults = self.config.defaults.clone();
            match self.set_option_values(&defaults) {
                Ok(0) => {}
                Ok(failed) => log::warn!("{failed} configured default values were not applied"),
                Err(err) => log::warn!("Failed to apply configured default values: {err}"),
            }
        }

        self.sync_gamma();

        log::info!("Device '{name}' opened");

        Ok(())
    }

    /// Closes the device. Returns `false` while a scan is still draining;
    /// call again (after [`Self::poll`]) until it returns `true`.
    pub fn close(&mut self) -> bool {
        self.poll();

        match &self.device {
            None => {
                self.close_pending = false;
                true
            }
            Some(device) if device.scan.is_some() => {
                if !self.close_pending {
                    log::debug!("Close requested during a scan, wait for it to stop");
                    self.close_pending = true;
                    device.worker.cancel();
                }
                false
            }
            Some(_) => {
                self.release();
                true
            }
        }
    }

    fn release(&mut self) {
        if let Some(mut device) = self.device.take() {
            log::debug!("Close device '{}'", device.name);
            // Dropping the worker stops and joins its thread before the
            // handle goes away.
            device.worker.cancel();
            device.registry.clear();
        }

        self.close_pending = false;
        self.reload_deadline = None;
        self.preview_max = (0.0, 0.0);
        self.selections.clear();
        self.selection = Selection::FULL;
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device.as_ref().map(|device| device.name.as_str())
    }

    pub fn is_scanning(&self) -> bool {
        self.device.as_ref().is_some_and(|device| device.scan.is_some())
    }

    fn ensure_idle(&self) -> Result<()> {
        match &self.device {
            None => Err(KsaneError::NotOpen),
            Some(device) if device.scan.is_some() => Err(KsaneError::Busy),
            Some(_) => Ok(()),
        }
    }

    // Option access

    pub fn options(&self) -> impl Iterator<Item = &DeviceOption> {
        self.device
            .iter()
            .flat_map(|device| device.registry.iter())
    }

    pub fn option(&self, name: &str) -> Option<&DeviceOption> {
        self.registry()?.by_name(name)
    }

    fn registry(&self) -> Option<&OptionRegistry> {
        self.device.as_ref().map(|device| &device.registry)
    }

    fn has_option(&self, name: &str) -> bool {
        self.registry().is_some_and(|registry| registry.contains(name))
    }

    fn option_f64(&self, name: &str) -> Option<f64> {
        self.option(name)?.value_as_f64().ok()
    }

    fn option_string(&self, name: &str) -> Option<String> {
        self.option(name)?.value_as_string().ok()
    }

    fn option_max(&self, name: &str) -> Option<f64> {
        self.option(name)?.max_value()
    }

    fn has_area(&self) -> bool {
        AREA.iter().all(|name| self.has_option(name))
    }

    fn resolution_name(&self) -> Option<&'static str> {
        [SCAN_RESOLUTION, SCAN_X_RESOLUTION]
            .into_iter()
            .find(|name| self.has_option(name))
    }

    /// Value of an option as text. `KSane::InvertColors` reports the
    /// session's inversion flag.
    pub fn option_value(&self, name: &str) -> Result<String> {
        if let Some(option) = self.option(name) {
            return option.value_as_string().map_err(|source| KsaneError::Option {
                name: name.to_owned(),
                source,
            });
        }

        if name == INVERT_COLORS {
            return Ok(self.invert_colors.to_string());
        }

        match self.device {
            Some(_) => Err(KsaneError::UnknownOption(name.to_owned())),
            None => Err(KsaneError::NotOpen),
        }
    }

    /// Every readable option value plus `KSane::InvertColors`.
    pub fn option_values(&self) -> BTreeMap<String, String> {
        let mut values: BTreeMap<_, _> = self
            .options()
            .filter(|option| option.has_gui())
            .filter_map(|option| {
                let value = option.value_as_string().ok()?;
                Some((option.name().to_owned(), value))
            })
            .collect();

        values.insert(INVERT_COLORS.to_owned(), self.invert_colors.to_string());
        values
    }

    pub fn set_option_value(&mut self, name: &str, value: &str) -> Result<()> {
        self.ensure_idle()?;

        if !self.has_option(name) && name == INVERT_COLORS {
            self.set_invert_colors(parse_invert(value));
            return Ok(());
        }

        let effects = self.write_option(name, |option| option.set_string(value))?;
        self.after_user_write(name, effects);

        Ok(())
    }

    pub fn set_option_number(&mut self, name: &str, value: f64) -> Result<()> {
        self.ensure_idle()?;

        let effects = self.write_option(name, |option| option.set_f64(value))?;
        self.after_user_write(name, effects);

        Ok(())
    }

    /// Leaves the value of `name` to the device.
    pub fn set_option_auto(&mut self, name: &str) -> Result<()> {
        self.ensure_idle()?;

        let effects = self.write_option(name, DeviceOption::set_auto)?;
        self.after_user_write(name, effects);

        Ok(())
    }

    fn after_user_write(&mut self, name: &str, effects: SetEffects) {
        if GAMMA_RGB.contains(&name) {
            self.sync_gamma();
        }
        if effects.changed && (name == SCAN_SOURCE || name == FILM_TYPE) {
            self.check_invert();
        }
        if AREA.contains(&name) {
            self.sync_selection_from_area();
        }
    }

    /// Applies `values` in device option order; unknown names are ignored.
    /// Returns the number of values the device refused.
    pub fn set_option_values(&mut self, values: &BTreeMap<String, String>) -> Result<usize> {
        self.ensure_idle()?;

        let names: Vec<String> = {
            let mut seen = HashSet::new();
            self.options()
                .filter(|option| option.has_gui() && values.contains_key(option.name()))
                .map(|option| option.name().to_owned())
                .filter(|name| seen.insert(name.clone()))
                .collect()
        };

        let mut failed = 0;
        let mut source_changed = false;
        let mut area_changed = false;

        for name in names {
            let value = &values[&name];
            match self.write_option(&name, |option| option.set_string(value)) {
                Ok(effects) => {
                    source_changed |=
                        effects.changed && (name == SCAN_SOURCE || name == FILM_TYPE);
                    area_changed |= AREA.contains(&name.as_str());
                }
                Err(err) => {
                    log::warn!("Failed to set '{value}': {err}");
                    failed += 1;
                }
            }
        }

        self.sync_gamma();

        if let Some(value) = values.get(INVERT_COLORS) {
            self.set_invert_colors(parse_invert(value));
        } else if source_changed {
            self.check_invert();
        }

        if area_changed {
            self.sync_selection_from_area();
        }

        Ok(failed)
    }

    /// Writes one option and handles what the device answered.
    fn write_option<F>(&mut self, name: &str, write: F) -> Result<SetEffects>
    where
        F: FnOnce(&mut DeviceOption) -> std::result::Result<SetEffects, OptionError>,
    {
        let device = self.device.as_mut().ok_or(KsaneError::NotOpen)?;
        let option = device
            .registry
            .by_name_mut(name)
            .ok_or_else(|| KsaneError::UnknownOption(name.to_owned()))?;

        let effects = write(option).map_err(|source| KsaneError::Option {
            name: name.to_owned(),
            source,
        })?;
        let value = effects
            .changed
            .then(|| option.value_as_string().ok())
            .flatten();

        self.after_write(effects);

        if let Some(value) = value {
            self.emit(SessionEvent::OptionValueChanged {
                name: name.to_owned(),
                value,
            });
        }

        Ok(effects)
    }

    /// Like [`Self::write_option`] for options that may be missing.
    fn try_write<F>(&mut self, name: &str, write: F) -> bool
    where
        F: FnOnce(&mut DeviceOption) -> std::result::Result<SetEffects, OptionError>,
    {
        if !self.has_option(name) {
            return false;
        }

        match self.write_option(name, write) {
            Ok(_) => true,
            Err(err) => {
                log::debug!("{err}");
                false
            }
        }
    }

    fn after_write(&mut self, effects: SetEffects) {
        if effects.reload_options() {
            self.reload_options();
        } else if effects.reload_values() {
            self.schedule_value_reload();
        }
    }

    fn set_default_values(&mut self) {
        self.try_write(SCAN_MODE, |option| option.set_string(SCAN_MODE_COLOR));
        self.try_write(BIT_DEPTH, |option| option.set_i32(DEFAULT_DEPTH));
        if let Some(resolution) = self.resolution_name() {
            self.try_write(resolution, |option| option.set_f64(DEFAULT_RESOLUTION));
        }
    }

    fn schedule_value_reload(&mut self) {
        self.reload_deadline = Some(Instant::now() + self.config.reload_debounce());
    }

    fn flush_pending_reload(&mut self) {
        if self.reload_deadline.take().is_some() {
            self.reload_values();
        }
    }

    fn reload_values(&mut self) {
        let Some(device) = self.device.as_mut() else {
            return;
        };

        let changed = device.registry.read_values();
        self.emit_changed(changed);
    }

    fn reload_options(&mut self) {
        let Some(device) = self.device.as_mut() else {
            return;
        };

        let changed = device.registry.reload(self.heuristics.as_ref());
        self.emit_changed(changed);
        self.update_preview_size();
    }

    fn emit_changed(&self, names: Vec<String>) {
        for name in names {
            if let Some(value) = self.option_string(&name) {
                self.emit(SessionEvent::OptionValueChanged { name, value });
            }
        }
    }

    // Gamma

    /// Whether the red, green and blue curves are identical.
    pub fn gamma_merged(&self) -> bool {
        self.gamma_merged
    }

    fn sync_gamma(&mut self) {
        let curves: Option<Vec<String>> = GAMMA_RGB
            .iter()
            .map(|name| self.option_string(name))
            .collect();

        if let Some(curves) = curves {
            let merged = curves[0] == curves[1] && curves[1] == curves[2];
            if merged != self.gamma_merged {
                log::debug!("Gamma tables {}", if merged { "merged" } else { "split" });
            }
            self.gamma_merged = merged;
        }
    }

    /// Writes one curve to all three colour channels.
    pub fn set_common_gamma(&mut self, curve: &str) -> Result<()> {
        self.ensure_idle()?;

        for name in GAMMA_RGB {
            self.write_option(name, |option| option.set_string(curve))?;
        }
        self.gamma_merged = true;

        Ok(())
    }

    // Colour inversion

    pub fn invert_colors(&self) -> bool {
        self.invert_colors
    }

    /// Sets the inversion applied to scans and inverts the current preview.
    pub fn set_invert_colors(&mut self, invert: bool) {
        if self.invert_colors == invert {
            return;
        }

        self.invert_colors = invert;
        self.lock_preview().invert();
        self.emit(SessionEvent::OptionValueChanged {
            name: INVERT_COLORS.to_owned(),
            value: invert.to_string(),
        });
    }

    fn check_invert(&mut self) {
        if self.is_scanning() {
            return;
        }
        let (Some(source), Some(_)) = (self.option(SCAN_SOURCE), self.option(FILM_TYPE)) else {
            return;
        };

        let source = source.value_as_string().unwrap_or_default();
        let film_type = self.option_string(FILM_TYPE).unwrap_or_default();
        let invert = self.heuristics.wants_inversion(&source, &film_type);
        self.set_invert_colors(invert);
    }

    // Preview raster and selections

    pub fn preview_image(&self) -> Arc<Mutex<Raster>> {
        self.preview.clone()
    }

    fn lock_preview(&self) -> std::sync::MutexGuard<'_, Raster> {
        self.preview.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resets the scan area and the preview raster when the maximum scan
    /// area changed.
    fn update_preview_size(&mut self) {
        let max_x = self.option_max(SCAN_BR_X).unwrap_or(0.0);
        let max_y = self.option_max(SCAN_BR_Y).unwrap_or(0.0);
        if (max_x, max_y) == self.preview_max {
            return;
        }

        log::debug!("Scan area is now {max_x}x{max_y}");
        self.preview_max = (max_x, max_y);

        self.selections.clear();
        self.selection = Selection::FULL;
        self.try_write(SCAN_TL_X, |option| option.set_f64(0.0));
        self.try_write(SCAN_TL_Y, |option| option.set_f64(0.0));
        self.try_write(SCAN_BR_X, |option| option.set_f64(max_x));
        self.try_write(SCAN_BR_Y, |option| option.set_f64(max_y));

        let (width, height) = preview_size(max_x, max_y);
        let mut preview = self.lock_preview();
        preview.resize(width, height);
        preview.fill_white();
    }

    pub fn selection(&self) -> Selection {
        self.selection
    }

    pub fn selections(&self) -> &[Selection] {
        self.selections.as_slice()
    }

    /// Records one more region for the next final scan.
    pub fn add_selection(&mut self, selection: Selection) {
        self.selections.push(selection);
    }

    pub fn clear_selections(&mut self) {
        self.selections.clear();
    }

    /// Makes `selection` the scan area.
    pub fn set_selection(&mut self, selection: Selection) -> Result<()> {
        self.ensure_idle()?;

        self.selection = selection;
        self.apply_selection(selection);

        Ok(())
    }

    /// Sets the scan area in millimetres. A negative coordinate selects the
    /// whole area.
    pub fn set_selection_mm(&mut self, tl_x: f64, tl_y: f64, br_x: f64, br_y: f64) -> Result<()> {
        self.ensure_idle()?;

        if [tl_x, tl_y, br_x, br_y].iter().any(|v| *v < 0.0) {
            self.clear_selections();
            return self.set_selection(Selection::FULL);
        }

        match self.selection_from_mm(tl_x, tl_y, br_x, br_y) {
            Some(selection) => self.set_selection(selection),
            None => Ok(()),
        }
    }

    /// A millimetre rectangle relative to the maximum scan area. `None`
    /// when the device has no scan area.
    pub fn selection_from_mm(&self, tl_x: f64, tl_y: f64, br_x: f64, br_y: f64) -> Option<Selection> {
        let max_x = self.option_max(SCAN_BR_X)?;
        let max_y = self.option_max(SCAN_BR_Y)?;
        if max_x <= 0.0 || max_y <= 0.0 {
            return None;
        }

        let to_device = |mm: f64| match self.option(SCAN_BR_X).map(|option| option.unit()) {
            Some(OptionUnit::Pixel) => mm / 25.4 * self.current_dpi(),
            _ => mm,
        };

        Some(Selection::new(
            to_device(tl_x) / max_x,
            to_device(tl_y) / max_y,
            to_device(br_x) / max_x,
            to_device(br_y) / max_y,
        ))
    }

    /// Writes a selection into the scan area options.
    fn apply_selection(&mut self, selection: Selection) {
        if !self.has_area() {
            return;
        }

        let max_x = self.option_max(SCAN_BR_X).unwrap_or(0.0);
        let max_y = self.option_max(SCAN_BR_Y).unwrap_or(0.0);
        let [tl_x, tl_y, br_x, br_y] = selection.to_device(max_x, max_y);

        self.try_write(SCAN_TL_X, |option| option.set_f64(tl_x));
        self.try_write(SCAN_TL_Y, |option| option.set_f64(tl_y));
        self.try_write(SCAN_BR_X, |option| option.set_f64(br_x));
        self.try_write(SCAN_BR_Y, |option| option.set_f64(br_y));
    }

    /// Follows scan area options written by the caller.
    fn sync_selection_from_area(&mut self) {
        let max_x = self.option_max(SCAN_BR_X).unwrap_or(0.0);
        let max_y = self.option_max(SCAN_BR_Y).unwrap_or(0.0);
        if max_x <= 0.0 || max_y <= 0.0 {
            return;
        }

        let values: Option<Vec<f64>> = AREA.iter().map(|name| self.option_f64(name)).collect();
        if let Some(values) = values {
            self.selection = Selection::new(
                values[0] / max_x,
                values[1] / max_y,
                values[2] / max_x,
                values[3] / max_y,
            );
        }
    }

    pub fn set_auto_select(&mut self, auto_select: bool) {
        self.auto_select = auto_select;
    }

    /// Fixed preview resolution; below 25 dpi a suitable one is searched.
    pub fn set_preview_resolution(&mut self, dpi: f64) {
        self.preview_dpi = dpi;
    }

    // Scan area queries

    pub fn current_dpi(&self) -> f64 {
        self.resolution_name()
            .and_then(|name| self.option_f64(name))
            .unwrap_or(0.0)
    }

    /// Width of the scan area in millimetres.
    pub fn scan_area_width(&self) -> f64 {
        self.scan_area_extent(SCAN_TL_X, SCAN_BR_X)
    }

    /// Height of the scan area in millimetres.
    pub fn scan_area_height(&self) -> f64 {
        self.scan_area_extent(SCAN_TL_Y, SCAN_BR_Y)
    }

    fn scan_area_extent(&self, tl: &str, br: &str) -> f64 {
        let (Some(start), Some(end)) = (self.option_f64(tl), self.option_f64(br)) else {
            return 0.0;
        };
        let extent = end - start;

        match self.option(br).map(|option| option.unit()) {
            Some(OptionUnit::Pixel) => {
                let dpi = self.current_dpi();
                if dpi > 0.0 {
                    extent / dpi * 25.4
                } else {
                    0.0
                }
            }
            _ => extent,
        }
    }

    // Device info

    pub fn vendor(&self) -> Option<String> {
        self.device_info().map(|info| info.vendor.to_string())
    }

    pub fn model(&self) -> Option<String> {
        self.device_info().map(|info| info.model.to_string())
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        let name = self.device_name()?;
        if let Some(info) = self.discovery.find(name) {
            return Some(info);
        }

        log::debug!("Device '{name}' is not listed yet, enumerate again");
        self.discovery.refresh();
        self.discovery.wait();
        self.discovery.find(name)
    }

    // Scanning

    pub fn start_preview(&mut self) -> Result<()> {
        self.ensure_idle()?;

        log::debug!("Start preview scan");

        if let Some(device) = self.device.as_mut() {
            for name in PREVIEW_SAVED {
                if let Some(option) = device.registry.by_name_mut(name) {
                    option.store_current_data();
                }
            }
        }

        if self.has_area() {
            let max_x = self.option_max(SCAN_BR_X).unwrap_or(0.0);
            let max_y = self.option_max(SCAN_BR_Y).unwrap_or(0.0);
            self.try_write(SCAN_TL_X, |option| option.set_f64(0.0));
            self.try_write(SCAN_TL_Y, |option| option.set_f64(0.0));
            self.try_write(SCAN_BR_X, |option| option.set_f64(max_x));
            self.try_write(SCAN_BR_Y, |option| option.set_f64(max_y));
        }

        if let Some(resolution) = self.resolution_name() {
            if self.preview_dpi >= PREVIEW_DPI_STEP {
                self.set_preview_dpi(resolution, self.preview_dpi);
            } else if let Err(err) = self.search_preview_dpi(resolution) {
                log::warn!("Failed to get scan parameters: {err}");
                self.abort_preview(err);
                return Ok(());
            }
        }

        self.try_write(PREVIEW, |option| option.set_f64(1.0));

        self.flush_pending_reload();

        self.selections.clear();
        self.lock_preview().fill_white();
        self.update_preview_size();

        if let Err(err) = self.start_worker(ScanKind::Preview) {
            self.abort_preview(SaneError::IO);
            return Err(err);
        }

        Ok(())
    }

    /// Ends a preview that never reached the worker, putting the saved
    /// options back.
    fn abort_preview(&mut self, err: SaneError) {
        self.mark_scanning(ScanKind::Preview);
        self.preview_done(Err(err));
    }

    fn set_preview_dpi(&mut self, resolution: &str, dpi: f64) {
        self.try_write(resolution, |option| option.set_f64(dpi));
        if resolution == SCAN_X_RESOLUTION {
            self.try_write(SCAN_Y_RESOLUTION, |option| option.set_f64(dpi));
        }
    }

    /// Lowest resolution giving a preview of usable size.
    fn search_preview_dpi(&mut self, resolution: &str) -> std::result::Result<(), SaneError> {
        let min = self
            .option(resolution)
            .and_then(|option| option.min_value())
            .unwrap_or(0.0);

        let mut dpi = min;
        let parameters = loop {
            self.set_preview_dpi(resolution, dpi);

            let Some(device) = self.device.as_ref() else {
                return Err(SaneError::Inval);
            };
            log::trace!("Call sane_get_parameters()");
            let parameters = lock(&device.handle).parameters()?;

            if dpi > PREVIEW_DPI_MAX {
                break parameters;
            }
            dpi += PREVIEW_DPI_STEP;

            let too_small = parameters.pixels_per_line < PREVIEW_MIN_PIXELS
                || parameters
                    .lines
                    .is_some_and(|lines| lines > 0 && lines < PREVIEW_MIN_PIXELS);
            if !too_small {
                break parameters;
            }
        };

        if parameters.pixels_per_line == 0 {
            log::debug!("Device reports empty lines, use the minimum resolution");
            self.set_preview_dpi(resolution, min);
        }

        Ok(())
    }

    pub fn start_final(&mut self) -> Result<()> {
        self.ensure_idle()?;

        log::debug!("Start final scan");

        self.selections.rewind();
        if self.has_area() {
            let current = if self.selection.is_empty() {
                Selection::FULL
            } else {
                self.selection
            };
            if let Some(selection) = self.selections.next(current) {
                self.apply_selection(selection);
            }
        }

        self.flush_pending_reload();

        self.start_worker(ScanKind::Final)
    }

    fn mark_scanning(&mut self, kind: ScanKind) {
        if let Some(device) = self.device.as_mut() {
            device.scan = Some(kind);
        }
    }

    fn start_worker(&mut self, kind: ScanKind) -> Result<()> {
        let invert = self.invert_colors;
        let chunk_size = self.config.read_chunk_size;
        let device = self.device.as_mut().ok_or(KsaneError::NotOpen)?;

        match device.worker.begin(kind, invert, chunk_size) {
            Ok(()) => {
                device.scan = Some(kind);
                self.emit(SessionEvent::Progress(0));
                Ok(())
            }
            Err(err) => {
                log::error!("Failed to start {kind} scan: {err}");
                device.scan = None;
                Err(err)
            }
        }
    }

    /// Asks a running scan to stop. Safe to call when idle. A batch waiting
    /// between two pages ends before the next page.
    pub fn cancel(&self) {
        if let Some(device) = self.device.as_ref().filter(|device| device.scan.is_some()) {
            device.worker.cancel();
        }
    }

    /// A handle for cancelling scans from another thread.
    pub fn canceller(&self) -> ScanCanceller {
        self.canceller.clone()
    }

    pub fn scan_progress(&self) -> u8 {
        self.device
            .as_ref()
            .map_or(0, |device| device.worker.scan_progress())
    }

    /// Whether the preview raster changed size during the running or last
    /// preview.
    pub fn preview_resized(&self) -> bool {
        self.device
            .as_ref()
            .is_some_and(|device| device.worker.image_resized())
    }

    /// Handles everything that became due: scan progress and completion,
    /// debounced value reloads, hardware option polling and device list
    /// updates. Never blocks.
    pub fn poll(&mut self) {
        while let Some(message) = self.device.as_mut().and_then(|device| device.worker.try_recv()) {
            self.handle_worker_message(message);
        }

        if let Some(deadline) = self.reload_deadline {
            if Instant::now() >= deadline && !self.is_scanning() {
                self.flush_pending_reload();
            }
        }

        if self.device.is_some() && !self.is_scanning() {
            self.poll_hardware();
        }

        while let Ok(devices) = self.device_list.try_recv() {
            self.emit(SessionEvent::DeviceListUpdated(devices));
        }
    }

    /// Blocks until no scan is running, batch re-arms included.
    pub fn wait_idle(&mut self) {
        while self.is_scanning() {
            match self.device.as_mut().and_then(|device| device.worker.blocking_recv()) {
                Some(message) => self.handle_worker_message(message),
                None => {
                    log::error!("Scan worker vanished without a result");
                    if let Some(device) = self.device.as_mut() {
                        device.scan = None;
                    }
                }
            }
        }

        self.poll();
    }

    fn poll_hardware(&mut self) {
        if self.last_poll.elapsed() < self.config.poll_interval() {
            return;
        }
        self.last_poll = Instant::now();

        let Some(device) = self.device.as_mut() else {
            return;
        };

        let mut events = Vec::new();
        for option in device.registry.polled_mut() {
            if !matches!(option.read_value(), Ok(true)) {
                continue;
            }

            let event = match option.kind() {
                OptionKind::Boolean => SessionEvent::ButtonPressed {
                    name: option.name().to_owned(),
                    title: option.title(),
                    pressed: option.value_as_f64().is_ok_and(|value| value != 0.0),
                },
                _ => SessionEvent::OptionValueChanged {
                    name: option.name().to_owned(),
                    value: option.value_as_string().unwrap_or_default(),
                },
            };
            events.push(event);
        }

        for event in events {
            self.emit(event);
        }
    }

    fn handle_worker_message(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Progress(progress) => self.emit(SessionEvent::Progress(progress)),
            WorkerMessage::Finished(outcome) => match outcome.kind {
                ScanKind::Preview => self.preview_done(outcome.status),
                ScanKind::Final => self.final_done(outcome),
            },
        }
    }

    fn cancel_frame(&self) {
        if let Some(device) = &self.device {
            log::trace!("Call sane_cancel()");
            lock(&device.handle).cancel();
        }
    }

    fn finish_deferred_close(&mut self) {
        log::debug!("Scan stopped, finish the pending close");
        self.release();
        self.emit(SessionEvent::ScanDone {
            status: ScanStatus::NoError,
            reason: None,
            message: String::new(),
        });
    }

    fn preview_done(&mut self, status: std::result::Result<(), SaneError>) {
        self.cancel_frame();

        if self.close_pending {
            self.finish_deferred_close();
            return;
        }

        if let Some(device) = self.device.as_mut() {
            device.scan = None;
        }

        let mut effects = Vec::new();
        if let Some(device) = self.device.as_mut() {
            for name in PREVIEW_SAVED {
                let Some(option) = device.registry.by_name_mut(name) else {
                    continue;
                };
                match option.restore_saved_data() {
                    Ok(effect) => effects.push(effect),
                    Err(err) => log::warn!("Failed to restore option '{name}': {err}"),
                }
            }
        }
        if effects.iter().any(SetEffects::reload_options) {
            self.reload_options();
        } else if effects.iter().any(SetEffects::reload_values) {
            self.schedule_value_reload();
        }
        self.sync_selection_from_area();

        let reason = status.err().filter(|err| *err != SaneError::EOF);
        let scan_status = ScanStatus::classify(reason);
        let message = describe(reason, scan_status);

        match reason {
            None => {
                let preview = self.lock_preview().clone();
                self.emit(SessionEvent::ImageReady(ScannedImage {
                    kind: ScanKind::Preview,
                    width: preview.width(),
                    height: preview.height(),
                    bytes_per_line: preview.stride(),
                    format: ImageFormat::Rgb8,
                    data: preview.into_data(),
                }));

                if self.auto_select && self.has_area() {
                    self.find_selections();
                }
            }
            Some(_) if scan_status != ScanStatus::NoError => {
                self.alert_user(scan_status, &message);
            }
            Some(_) => {}
        }

        log::debug!("Preview scan finished: {scan_status}");

        self.emit(SessionEvent::ScanDone {
            status: scan_status,
            reason,
            message,
        });
    }

    fn find_selections(&mut self) {
        let Some(detector) = &self.detector else {
            return;
        };

        let regions = {
            let preview = self.preview.lock().unwrap_or_else(PoisonError::into_inner);
            detector.find_regions(&preview)
        };

        log::debug!("Found {} regions in the preview", regions.len());
        self.selections
            .replace(regions.into_iter().filter(|region| !region.is_empty()).collect());
    }

    fn final_done(&mut self, outcome: ScanOutcome) {
        if self.close_pending {
            self.cancel_frame();
            self.finish_deferred_close();
            return;
        }

        let ScanOutcome {
            status,
            parameters,
            data,
            ..
        } = outcome;

        let parameters = match (status, parameters) {
            (Ok(()), Some(parameters)) => parameters,
            (Ok(()), None) => {
                self.final_failed(SaneError::Inval);
                return;
            }
            (Err(err), _) => {
                self.final_failed(err);
                return;
            }
        };

        self.emit(SessionEvent::ImageReady(ScannedImage {
            kind: ScanKind::Final,
            width: parameters.pixels_per_line,
            height: parameters.lines.unwrap_or(0),
            bytes_per_line: parameters.bytes_per_line,
            format: normalize::image_format(&parameters),
            data,
        }));

        if self
            .device
            .as_ref()
            .is_some_and(|device| device.worker.cancel_requested())
        {
            log::debug!("Batch cancelled after a page");
            self.cancel_frame();
            self.finish_final(ScanStatus::NoError, Some(SaneError::Cancelled));
            return;
        }

        // Batch scanning: the feeder, a button or more selections keep going.
        let feeder = self
            .option_string(SCAN_SOURCE)
            .is_some_and(|source| self.heuristics.is_document_feeder(&source));
        if feeder {
            log::debug!("Document feeder in use, scan the next page");
            self.rearm();
            return;
        }

        if self.option_string(WAIT_FOR_BUTTON).as_deref() == Some("true") {
            log::debug!("Wait for the button to scan the next page");
            self.rearm();
            return;
        }

        self.cancel_frame();

        if self.selections.has_more() && self.has_area() {
            // Area options are written while the scan is still ongoing.
            if let Some(selection) = self.selections.next(Selection::FULL) {
                log::debug!("Scan the next selection {selection:?}");
                self.apply_selection(selection);
                self.flush_pending_reload();
                self.rearm();
                return;
            }
        }

        self.finish_final(ScanStatus::NoError, None);
    }

    fn rearm(&mut self) {
        let invert = self.invert_colors;
        let chunk_size = self.config.read_chunk_size;
        let Some(device) = self.device.as_mut() else {
            return;
        };

        if let Err(err) = device.worker.start(ScanKind::Final, invert, chunk_size) {
            log::error!("Failed to continue the batch scan: {err}");
            self.final_failed(SaneError::IO);
        }
    }

    fn final_failed(&mut self, err: SaneError) {
        let reason = (err != SaneError::EOF).then_some(err);
        let status = ScanStatus::classify(reason);

        self.cancel_frame();
        self.finish_final(status, reason);

        if status != ScanStatus::NoError {
            self.alert_user(status, &describe(reason, status));
        }
    }

    fn finish_final(&mut self, status: ScanStatus, reason: Option<SaneError>) {
        if let Some(device) = self.device.as_mut() {
            device.scan = None;
        }

        log::debug!("Final scan finished: {status}");

        self.emit(SessionEvent::ScanDone {
            status,
            reason,
            message: describe(reason, status),
        });
    }

    // Output

    /// Converts a delivered image into an 8-bit RGB raster. Tells the user
    /// when 16-bit samples were cut down.
    pub fn to_raster(&self, image: &ScannedImage) -> std::result::Result<Raster, NormalizeError> {
        let (frame, depth) = match image.format {
            ImageFormat::BlackWhite => (FrameFormat::Gray, 1),
            ImageFormat::GrayScale8 => (FrameFormat::Gray, 8),
            ImageFormat::GrayScale16 => (FrameFormat::Gray, 16),
            ImageFormat::Rgb8 => (FrameFormat::RGB, 8),
            ImageFormat::Rgb16 => (FrameFormat::RGB, 16),
            ImageFormat::None => (FrameFormat::Gray, 0),
        };

        let normalized = normalize::normalize(
            &image.data,
            image.width,
            image.height,
            image.bytes_per_line,
            frame,
            depth,
        )?;

        if normalized.truncated {
            self.alert_user(
                ScanStatus::Information,
                "The image has 16 bits per sample, only 8 bits are shown",
            );
        }

        Ok(normalized.raster)
    }

    // Events

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            log::trace!("Session event receiver was dropped");
        }
    }

    fn alert_user(&self, status: ScanStatus, message: &str) {
        if self.listening_messages {
            self.emit(SessionEvent::UserMessage {
                status,
                message: message.to_owned(),
            });
        } else {
            self.alerter.alert(status, message);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

fn parse_invert(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

fn describe(reason: Option<SaneError>, status: ScanStatus) -> String {
    match (reason, status) {
        (Some(reason), ScanStatus::Information | ScanStatus::ErrorGeneral) => reason.to_string(),
        _ => String::new(),
    }
}

/// Placeholder preview dimensions for a scan area of `max_x` by `max_y`.
fn preview_size(max_x: f64, max_y: f64) -> (usize, usize) {
    if max_x <= 0.0 || max_y <= 0.0 {
        return (PREVIEW_SIDE, PREVIEW_SIDE);
    }

    let side = PREVIEW_SIDE as f64;
    let ratio = max_x / max_y;
    if ratio < 1.0 {
        (PREVIEW_SIDE, (side / ratio) as usize)
    } else {
        ((side * ratio) as usize, PREVIEW_SIDE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_size_keeps_the_aspect_ratio() {
        assert_eq!(preview_size(200.0, 200.0), (400, 400));
        assert_eq!(preview_size(100.0, 200.0), (400, 800));
        assert_eq!(preview_size(300.0, 150.0), (800, 400));
        assert_eq!(preview_size(0.0, 0.0), (400, 400));
    }

    #[test]
    fn invert_values() {
        assert!(parse_invert("TRUE"));
        assert!(parse_invert("1"));
        assert!(!parse_invert("yes"));
        assert!(!parse_invert("false"));
    }

    #[test]
    fn preview_that_cannot_start_restores_the_scan_area() {
        use libsane::{DeviceHandle, OptionValue, TestBackend, TEST_DEVICE};

        let backend: Arc<dyn Backend> = Arc::new(TestBackend::new());
        let discovery = DeviceDiscovery::new(backend.clone()).expect("discovery thread");
        let (mut session, mut events) =
            Session::new(backend.clone(), discovery, SessionConfig::default());
        session.open(TEST_DEVICE).unwrap();
        session.set_option_number(SCAN_BR_X, 100.0).unwrap();

        // A worker stuck on another handle refuses to take the preview.
        let mut other: Box<dyn DeviceHandle> = backend.open(TEST_DEVICE, None).unwrap();
        let wait = (0..)
            .map_while(|i| other.option_descriptor(i).map(|d| (i, d)))
            .find(|(_, d)| d.name() == Some(WAIT_FOR_BUTTON))
            .map(|(i, _)| i)
            .unwrap();
        other.set_option(wait, &OptionValue::Bool(true)).unwrap();
        let mut busy = ScanWorker::new(
            Arc::new(Mutex::new(other)),
            Arc::new(Mutex::new(Raster::new(1, 1))),
            ScanCanceller::default(),
        );
        busy.begin(ScanKind::Final, false, 4096).unwrap();
        std::mem::swap(&mut session.device.as_mut().unwrap().worker, &mut busy);

        assert!(matches!(session.start_preview(), Err(KsaneError::Busy)));
        assert!(!session.is_scanning());
        assert_eq!(
            session.option(SCAN_BR_X).unwrap().value_as_f64().unwrap(),
            100.0
        );

        let mut done = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::ScanDone { status, reason, .. } = event {
                done.push((status, reason));
            }
        }
        assert_eq!(done, vec![(ScanStatus::ErrorGeneral, Some(SaneError::IO))]);
    }

    #[test]
    fn only_failures_carry_a_message() {
        assert_eq!(describe(Some(SaneError::Cancelled), ScanStatus::NoError), "");
        assert_eq!(describe(None, ScanStatus::NoError), "");
        assert!(!describe(Some(SaneError::NoDocs), ScanStatus::Information).is_empty());
    }
}
