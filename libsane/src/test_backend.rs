//! A synthetic scanner that needs no hardware.
//!
//! The device mimics the `test` backend shipped with sane-backends: a flatbed
//! with a document feeder and a transparency unit, a handful of typed
//! options with every constraint shape, a hardware button sensor and a few
//! knobs that shape how frames are delivered (pacing, chunk size, injected
//! read status, hand-scanner and three-pass modes).

use crate::{
    options::{Capabilities, WORD_SIZE}, Backend, Credentials, DeviceHandle, DeviceInfo, Fixed,
    FrameFormat, OptionConstraint, OptionDescriptor, OptionType, OptionUnit, OptionValue,
    Parameters, Result, SaneError, SetInfo,
};
use bstr::{BString, ByteSlice};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

pub const TEST_DEVICE: &str = "test";
pub const TEST_AUTH_DEVICE: &str = "test:auth";
pub const TEST_USERNAME: &str = "test";
pub const TEST_PASSWORD: &str = "test";

pub const MODE_GRAY: &str = "Gray";
pub const MODE_COLOR: &str = "Color";
pub const MODE_LINEART: &str = "Lineart";

pub const SOURCE_FLATBED: &str = "Flatbed";
pub const SOURCE_ADF: &str = "Automatic Document Feeder";
pub const SOURCE_TRANSPARENCY: &str = "Transparency Adapter";

const AREA_MAX_MM: f64 = 200.0;
const BUTTON_POLL_INTERVAL: Duration = Duration::from_millis(10);
const GAMMA_TABLE_LEN: usize = 256;
const READ_RETURN_VALUES: [&str; 12] = [
    "Default",
    "SANE_STATUS_UNSUPPORTED",
    "SANE_STATUS_CANCELLED",
    "SANE_STATUS_DEVICE_BUSY",
    "SANE_STATUS_INVAL",
    "SANE_STATUS_EOF",
    "SANE_STATUS_JAMMED",
    "SANE_STATUS_NO_DOCS",
    "SANE_STATUS_COVER_OPEN",
    "SANE_STATUS_IO_ERROR",
    "SANE_STATUS_NO_MEM",
    "SANE_STATUS_ACCESS_DENIED",
];

/// Hardware state shared by every handle opened from one [`TestBackend`].
#[derive(Debug, Clone, Default)]
pub struct TestSensors {
    button: Arc<AtomicBool>,
    presses: Arc<AtomicUsize>,
}

impl TestSensors {
    pub fn set_button(&self, pressed: bool) {
        self.button.store(pressed, Ordering::SeqCst);
    }

    pub fn button(&self) -> bool {
        self.button.load(Ordering::SeqCst)
    }

    /// Presses and releases the button. A frame started with
    /// `wait-for-button` delivers data only after such a press.
    pub fn press_button(&self) {
        self.presses.fetch_add(1, Ordering::SeqCst);
    }

    fn take_press(&self) -> bool {
        self.presses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |presses| presses.checked_sub(1))
            .is_ok()
    }
}

#[derive(Debug, Default)]
pub struct TestBackend {
    sensors: TestSensors,
}

impl TestBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sensors(&self) -> TestSensors {
        self.sensors.clone()
    }
}

impl Backend for TestBackend {
    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        let device = |name: &str, model: &str| DeviceInfo {
            name: name.into(),
            vendor: "Noname".into(),
            model: model.into(),
            ty: "virtual device".into(),
        };

        Ok(vec![
            device(TEST_DEVICE, "frontend-tester"),
            device(TEST_AUTH_DEVICE, "frontend-tester (protected)"),
        ])
    }

    fn open(
        &self,
        name: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn DeviceHandle>> {
        log::trace!("Open test device '{name}'");

        match name {
            TEST_DEVICE => {}
            TEST_AUTH_DEVICE => match credentials {
                Some(credentials)
                    if credentials.username == TEST_USERNAME
                        && credentials.password == TEST_PASSWORD => {}
                _ => return Err(SaneError::AccessDenied),
            },
            _ => return Err(SaneError::Inval),
        }

        Ok(Box::new(TestHandle::new(self.sensors.clone())))
    }
}

struct TestOption {
    descriptor: OptionDescriptor,
    value: OptionValue,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    parameters: Parameters,
    /// Lines actually produced, also when `parameters.lines` is unknown.
    lines: usize,
    offset: usize,
    injected: Option<SaneError>,
    waiting_for_button: bool,
}

impl Frame {
    fn len(&self) -> usize {
        self.lines * self.parameters.bytes_per_line
    }
}

pub struct TestHandle {
    options: Vec<TestOption>,
    sensors: TestSensors,
    frame: Option<Frame>,
    /// Frame format of the next pass in three-pass mode.
    next_pass: Option<FrameFormat>,
    cancelled: bool,
    pages_left: usize,
}

impl TestHandle {
    fn new(sensors: TestSensors) -> Self {
        let mut handle = Self {
            options: build_options(),
            sensors,
            frame: None,
            next_pass: None,
            cancelled: false,
            pages_left: 0,
        };
        handle.refill_feeder();
        handle
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.options
            .iter()
            .position(|option| option.descriptor.name() == Some(name))
    }

    fn value(&self, name: &str) -> Option<&OptionValue> {
        self.index_of(name).map(|index| &self.options[index].value)
    }

    fn int(&self, name: &str) -> i32 {
        match self.value(name) {
            Some(OptionValue::Int(value)) => *value,
            _ => 0,
        }
    }

    fn float(&self, name: &str) -> f64 {
        match self.value(name) {
            Some(OptionValue::Fixed(value)) => value.to_f64(),
            Some(OptionValue::Int(value)) => *value as f64,
            _ => 0.0,
        }
    }

    fn flag(&self, name: &str) -> bool {
        matches!(self.value(name), Some(OptionValue::Bool(true)))
    }

    fn text(&self, name: &str) -> String {
        match self.value(name) {
            Some(OptionValue::String(value)) => value.to_str_lossy().into_owned(),
            _ => String::new(),
        }
    }

    fn set_active(&mut self, name: &str, active: bool) {
        if let Some(index) = self.index_of(name) {
            self.options[index]
                .descriptor
                .capabilities
                .set(Capabilities::Inactive, !active);
        }
    }

    fn refill_feeder(&mut self) {
        self.pages_left = self.int("feeder-pages").max(0) as usize;
    }

    fn is_scanning(&self) -> bool {
        self.frame.is_some() || self.next_pass.is_some()
    }

    fn compute_parameters(&self, pass: Option<FrameFormat>) -> Parameters {
        let dpi = self.float("resolution").max(1.0);
        let width_mm = (self.float("br-x") - self.float("tl-x")).max(0.0);
        let height_mm = (self.float("br-y") - self.float("tl-y")).max(0.0);

        let pixels_per_line = (width_mm * dpi / 25.4).round() as usize;
        let lines = (height_mm * dpi / 25.4).round() as usize;

        let mode = self.text("mode");
        let mut depth = if mode == MODE_LINEART {
            1
        } else {
            self.int("depth").max(1) as usize
        };
        if mode == MODE_COLOR && depth == 1 {
            depth = 8;
        }

        let (format, last_frame) = if mode == MODE_COLOR {
            match pass {
                Some(FrameFormat::Blue) => (FrameFormat::Blue, true),
                Some(pass) => (pass, false),
                None => (FrameFormat::RGB, true),
            }
        } else {
            (FrameFormat::Gray, true)
        };

        let bytes_per_line = match (format, depth) {
            (FrameFormat::Gray, 1) => pixels_per_line.div_ceil(8),
            (FrameFormat::RGB, depth) => pixels_per_line * 3 * depth / 8,
            (_, depth) => pixels_per_line * depth / 8,
        };

        Parameters {
            format,
            last_frame,
            bytes_per_line,
            pixels_per_line,
            lines: if self.flag("hand-scanner") {
                None
            } else {
                Some(lines)
            },
            depth,
        }
    }

    fn first_pass(&self) -> Option<FrameFormat> {
        (self.text("mode") == MODE_COLOR && self.flag("three-pass")).then_some(FrameFormat::Red)
    }

    fn injected_status(&self) -> Option<SaneError> {
        match self.text("read-return-value").as_str() {
            "SANE_STATUS_UNSUPPORTED" => Some(SaneError::Unsupported),
            "SANE_STATUS_CANCELLED" => Some(SaneError::Cancelled),
            "SANE_STATUS_DEVICE_BUSY" => Some(SaneError::DeviceBusy),
            "SANE_STATUS_INVAL" => Some(SaneError::Inval),
            "SANE_STATUS_EOF" => Some(SaneError::EOF),
            "SANE_STATUS_JAMMED" => Some(SaneError::Jammed),
            "SANE_STATUS_NO_DOCS" => Some(SaneError::NoDocs),
            "SANE_STATUS_COVER_OPEN" => Some(SaneError::CoverOpen),
            "SANE_STATUS_IO_ERROR" => Some(SaneError::IO),
            "SANE_STATUS_NO_MEM" => Some(SaneError::NoMem),
            "SANE_STATUS_ACCESS_DENIED" => Some(SaneError::AccessDenied),
            _ => None,
        }
    }

    /// 16-bit sample of the test picture at pixel (x, y) for `channel`
    /// (0..3 for colour, `None` for gray).
    fn sample(&self, picture: &str, x: usize, y: usize, channel: Option<usize>, frame: &Frame) -> u16 {
        let width = frame.parameters.pixels_per_line.max(1);
        let height = frame.lines.max(1);

        let rgb = match picture {
            "Solid black" => [0, 0, 0],
            "Solid white" => [u16::MAX; 3],
            "Grid" => {
                if (x / 16 + y / 16) % 2 == 0 {
                    [u16::MAX; 3]
                } else {
                    [0, 0, 0]
                }
            }
            _ => {
                let r = (x * u16::MAX as usize / width) as u16;
                let g = (y * u16::MAX as usize / height) as u16;
                [r, g, u16::MAX - r]
            }
        };

        match channel {
            Some(channel) => rgb[channel],
            None => ((rgb[0] as u32 + rgb[1] as u32 + rgb[2] as u32) / 3) as u16,
        }
    }

    fn byte_at(&self, picture: &str, frame: &Frame, offset: usize) -> u8 {
        let parameters = &frame.parameters;
        let line = offset / parameters.bytes_per_line.max(1);
        let column = offset % parameters.bytes_per_line.max(1);
        let bytes_per_sample = if parameters.depth == 16 { 2 } else { 1 };

        match (parameters.format, parameters.depth) {
            (FrameFormat::Gray, 1) => {
                let mut byte = 0u8;
                for bit in 0..8 {
                    let x = column * 8 + bit;
                    if x >= parameters.pixels_per_line {
                        break;
                    }
                    // Lineart: a set bit is black.
                    if self.sample(picture, x, line, None, frame) < 0x8000 {
                        byte |= 0x80 >> bit;
                    }
                }
                byte
            }
            (format, _) => {
                let sample_index = column / bytes_per_sample;
                let (x, channel) = match format {
                    FrameFormat::RGB => (sample_index / 3, Some(sample_index % 3)),
                    FrameFormat::Gray => (sample_index, None),
                    pass => (sample_index, pass.channel()),
                };
                let value = self.sample(picture, x, line, channel, frame);
                if bytes_per_sample == 2 {
                    value.to_ne_bytes()[column % 2]
                } else {
                    (value >> 8) as u8
                }
            }
        }
    }

    fn check_value(descriptor: &OptionDescriptor, value: &OptionValue) -> Result<OptionValue> {
        let constrain_word = |word: i32| -> i32 {
            match &descriptor.constraint {
                OptionConstraint::Range { range, quant } => {
                    let clamped = word.clamp(*range.start(), *range.end());
                    if *quant > 0 {
                        let steps = (clamped as i64 - *range.start() as i64 + *quant as i64 / 2)
                            / *quant as i64;
                        let snapped = *range.start() as i64 + steps * *quant as i64;
                        snapped.min(*range.end() as i64) as i32
                    } else {
                        clamped
                    }
                }
                OptionConstraint::WordList(words) => words
                    .iter()
                    .copied()
                    .min_by_key(|candidate| (*candidate as i64 - word as i64).abs())
                    .unwrap_or(word),
                _ => word,
            }
        };

        match (descriptor.ty, value) {
            (OptionType::Bool, OptionValue::Bool(value)) => Ok(OptionValue::Bool(*value)),
            (OptionType::Int, OptionValue::Int(value)) if descriptor.word_count() == 1 => {
                Ok(OptionValue::Int(constrain_word(*value)))
            }
            (OptionType::Fixed, OptionValue::Fixed(value)) if descriptor.word_count() == 1 => {
                Ok(OptionValue::Fixed(Fixed(constrain_word(value.raw()))))
            }
            (OptionType::Int | OptionType::Fixed, OptionValue::Words(words))
                if words.len() == descriptor.word_count() =>
            {
                Ok(OptionValue::Words(
                    words.iter().map(|word| constrain_word(*word)).collect(),
                ))
            }
            (OptionType::String, OptionValue::String(value)) => {
                if value.len() >= descriptor.size {
                    return Err(SaneError::Inval);
                }
                match &descriptor.constraint {
                    OptionConstraint::StringList(list) => list
                        .iter()
                        .find(|entry| entry.to_lowercase() == value.to_lowercase())
                        .map(|entry| OptionValue::String(entry.clone()))
                        .ok_or(SaneError::Inval),
                    _ => Ok(OptionValue::String(value.clone())),
                }
            }
            (OptionType::Button, _) => Ok(OptionValue::Button),
            _ => Err(SaneError::Inval),
        }
    }

    fn apply_side_effects(&mut self, name: &str) -> SetInfo {
        match name {
            "mode" => {
                let lineart = self.text("mode") == MODE_LINEART;
                self.set_active("depth", !lineart);
                SetInfo::ReloadOptions | SetInfo::ReloadParams
            }
            "source" => {
                let transparency = self.text("source") == SOURCE_TRANSPARENCY;
                self.set_active("film-type", transparency);
                self.refill_feeder();
                SetInfo::ReloadOptions
            }
            "feeder-pages" => {
                self.refill_feeder();
                SetInfo::empty()
            }
            "resolution" | "depth" | "tl-x" | "tl-y" | "br-x" | "br-y" | "hand-scanner"
            | "three-pass" => SetInfo::ReloadParams,
            _ => SetInfo::empty(),
        }
    }
}

impl DeviceHandle for TestHandle {
    fn option_descriptor(&self, index: usize) -> Option<OptionDescriptor> {
        self.options.get(index).map(|option| option.descriptor.clone())
    }

    fn get_option(&mut self, index: usize) -> Result<OptionValue> {
        let option = self.options.get(index).ok_or(SaneError::Inval)?;
        let descriptor = &option.descriptor;

        if descriptor.ty == OptionType::Group || !descriptor.is_active() {
            return Err(SaneError::Inval);
        }

        if descriptor.name() == Some("scan") {
            return Ok(OptionValue::Bool(self.sensors.button()));
        }

        Ok(option.value.clone())
    }

    fn set_option(&mut self, index: usize, value: &OptionValue) -> Result<SetInfo> {
        if index == 0 || self.is_scanning() {
            return Err(if index == 0 {
                SaneError::Inval
            } else {
                SaneError::DeviceBusy
            });
        }

        let option = self.options.get(index).ok_or(SaneError::Inval)?;
        let descriptor = &option.descriptor;
        if !descriptor.is_settable() || !descriptor.is_active() {
            return Err(SaneError::Inval);
        }

        let constrained = Self::check_value(descriptor, value)?;
        let mut info = SetInfo::empty();
        if constrained != *value && !matches!(value, OptionValue::String(_)) {
            info |= SetInfo::Inexact;
        }

        let name = descriptor.name().unwrap_or_default().to_owned();
        log::trace!("Test device: set '{name}' to {constrained}");

        self.options[index].value = constrained;
        Ok(info | self.apply_side_effects(&name))
    }

    fn set_option_auto(&mut self, index: usize) -> Result<SetInfo> {
        let option = self.options.get(index).ok_or(SaneError::Inval)?;
        if !option.descriptor.is_auto_settable() {
            return Err(SaneError::Unsupported);
        }

        let value = match &option.value {
            OptionValue::Int(_) => OptionValue::Int(0),
            OptionValue::Fixed(_) => OptionValue::Fixed(Fixed(0)),
            other => other.clone(),
        };
        self.options[index].value = value;
        Ok(SetInfo::empty())
    }

    fn parameters(&mut self) -> Result<Parameters> {
        match &self.frame {
            Some(frame) => Ok(frame.parameters),
            None => Ok(self.compute_parameters(self.next_pass.or_else(|| self.first_pass()))),
        }
    }

    fn start(&mut self) -> Result<()> {
        if self.frame.is_some() {
            return Err(SaneError::DeviceBusy);
        }

        self.cancelled = false;
        let new_image = self.next_pass.is_none();

        let pass = match self.next_pass {
            Some(pass) => Some(pass),
            None => {
                if self.text("source") == SOURCE_ADF {
                    if self.pages_left == 0 {
                        return Err(SaneError::NoDocs);
                    }
                    self.pages_left -= 1;
                }
                self.first_pass()
            }
        };

        let parameters = self.compute_parameters(pass);
        let lines = {
            let dpi = self.float("resolution").max(1.0);
            let height_mm = (self.float("br-y") - self.float("tl-y")).max(0.0);
            (height_mm * dpi / 25.4).round() as usize
        };

        self.next_pass = match pass {
            Some(FrameFormat::Red) => Some(FrameFormat::Green),
            Some(FrameFormat::Green) => Some(FrameFormat::Blue),
            _ => None,
        };

        self.frame = Some(Frame {
            parameters,
            lines,
            offset: 0,
            injected: self.injected_status(),
            waiting_for_button: new_image && self.flag("wait-for-button"),
        });

        log::trace!("Test device: start frame {parameters:?}");

        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.cancelled {
            self.frame = None;
            self.next_pass = None;
            return Err(SaneError::Cancelled);
        }

        let Some(mut frame) = self.frame else {
            return Err(SaneError::Inval);
        };

        if frame.waiting_for_button {
            if !self.sensors.take_press() {
                thread::sleep(BUTTON_POLL_INTERVAL);
                return Ok(0);
            }
            log::trace!("Test device: button pressed, deliver the frame");
            frame.waiting_for_button = false;
            self.frame = Some(frame);
        }

        if let Some(status) = frame.injected.take() {
            self.frame = None;
            self.next_pass = None;
            return Err(status);
        }

        let delay = self.int("read-delay-duration");
        if delay > 0 {
            thread::sleep(Duration::from_micros(delay as u64));
        }

        let remaining = frame.len() - frame.offset;
        if remaining == 0 {
            self.frame = None;
            return Err(SaneError::EOF);
        }

        let limit = self.int("read-limit-size").max(1) as usize;
        let count = buf.len().min(limit).min(remaining);
        let picture = self.text("test-picture");

        for (i, byte) in buf[..count].iter_mut().enumerate() {
            *byte = self.byte_at(&picture, &frame, frame.offset + i);
        }

        frame.offset += count;
        self.frame = Some(frame);

        Ok(count)
    }

    fn cancel(&mut self) {
        log::trace!("Test device: cancel");

        if self.is_scanning() {
            self.cancelled = true;
        }
        self.next_pass = None;
        if self.frame.is_none() {
            self.cancelled = false;
            self.refill_feeder();
        }
    }
}

fn descriptor(
    name: Option<&str>,
    title: &str,
    ty: OptionType,
    unit: OptionUnit,
    size: usize,
    capabilities: Capabilities,
    constraint: OptionConstraint,
) -> OptionDescriptor {
    OptionDescriptor {
        name: name.map(BString::from),
        title: title.into(),
        description: title.into(),
        ty,
        unit,
        size,
        capabilities,
        constraint,
    }
}

fn settable() -> Capabilities {
    Capabilities::SoftSelect | Capabilities::SoftDetect
}

fn group(title: &str) -> TestOption {
    TestOption {
        descriptor: descriptor(
            None,
            title,
            OptionType::Group,
            OptionUnit::None,
            0,
            Capabilities::empty(),
            OptionConstraint::None,
        ),
        value: OptionValue::Button,
    }
}

fn boolean(name: &str, title: &str, value: bool) -> TestOption {
    TestOption {
        descriptor: descriptor(
            Some(name),
            title,
            OptionType::Bool,
            OptionUnit::None,
            WORD_SIZE,
            settable(),
            OptionConstraint::None,
        ),
        value: OptionValue::Bool(value),
    }
}

fn int_range(name: &str, title: &str, unit: OptionUnit, min: i32, max: i32, quant: i32, value: i32) -> TestOption {
    TestOption {
        descriptor: descriptor(
            Some(name),
            title,
            OptionType::Int,
            unit,
            WORD_SIZE,
            settable(),
            OptionConstraint::Range {
                range: min..=max,
                quant,
            },
        ),
        value: OptionValue::Int(value),
    }
}

fn fixed_range(name: &str, title: &str, unit: OptionUnit, min: f64, max: f64, quant: f64, value: f64) -> TestOption {
    TestOption {
        descriptor: descriptor(
            Some(name),
            title,
            OptionType::Fixed,
            unit,
            WORD_SIZE,
            settable(),
            OptionConstraint::Range {
                range: Fixed::from_f64(min).raw()..=Fixed::from_f64(max).raw(),
                quant: Fixed::from_f64(quant).raw(),
            },
        ),
        value: OptionValue::Fixed(Fixed::from_f64(value)),
    }
}

fn string_list(name: &str, title: &str, list: &[&str], value: &str) -> TestOption {
    let size = list.iter().map(|entry| entry.len()).max().unwrap_or(0) + 1;
    TestOption {
        descriptor: descriptor(
            Some(name),
            title,
            OptionType::String,
            OptionUnit::None,
            size,
            settable(),
            OptionConstraint::StringList(list.iter().map(|entry| BString::from(*entry)).collect()),
        ),
        value: OptionValue::String(value.into()),
    }
}

fn gamma_table(name: &str, title: &str) -> TestOption {
    let identity = (0..GAMMA_TABLE_LEN as i32).collect();
    TestOption {
        descriptor: descriptor(
            Some(name),
            title,
            OptionType::Int,
            OptionUnit::None,
            GAMMA_TABLE_LEN * WORD_SIZE,
            settable(),
            OptionConstraint::Range {
                range: 0..=255,
                quant: 0,
            },
        ),
        value: OptionValue::Words(identity),
    }
}

#[rustfmt::skip]
fn build_options() -> Vec<TestOption> {
    use OptionUnit::*;

    let mut options = vec![
        TestOption {
            descriptor: descriptor(Some(""), "Number of options", OptionType::Int, None, WORD_SIZE, Capabilities::SoftDetect, OptionConstraint::None),
            value: OptionValue::Int(0),
        },
        group("Scan Mode"),
        string_list("mode", "Scan mode", &[MODE_GRAY, MODE_COLOR, MODE_LINEART], MODE_GRAY),
        TestOption {
            descriptor: descriptor(Some("depth"), "Bit depth", OptionType::Int, Bit, WORD_SIZE, settable(), OptionConstraint::WordList(vec![1, 8, 16])),
            value: OptionValue::Int(8),
        },
        fixed_range("resolution", "Scan resolution", Dpi, 1.0, 1200.0, 1.0, 50.0),
        boolean("preview", "Preview", false),
        string_list("source", "Scan source", &[SOURCE_FLATBED, SOURCE_ADF, SOURCE_TRANSPARENCY], SOURCE_FLATBED),
        string_list("film-type", "Film type", &["Positive Film", "Negative Film"], "Positive Film"),
        boolean("wait-for-button", "Wait for button", false),
        group("Geometry"),
        fixed_range("tl-x", "Top-left x", Mm, 0.0, AREA_MAX_MM, 0.0, 0.0),
        fixed_range("tl-y", "Top-left y", Mm, 0.0, AREA_MAX_MM, 0.0, 0.0),
        fixed_range("br-x", "Bottom-right x", Mm, 0.0, AREA_MAX_MM, 0.0, AREA_MAX_MM),
        fixed_range("br-y", "Bottom-right y", Mm, 0.0, AREA_MAX_MM, 0.0, AREA_MAX_MM),
        group("Enhancement"),
        int_range("brightness", "Brightness", Percent, -100, 100, 1, 0),
        int_range("contrast", "Contrast", Percent, -100, 100, 1, 0),
        gamma_table("red-gamma-table", "Red intensity"),
        gamma_table("green-gamma-table", "Green intensity"),
        gamma_table("blue-gamma-table", "Blue intensity"),
        group("Sensors"),
        TestOption {
            descriptor: descriptor(Some("scan"), "Scan button", OptionType::Bool, None, WORD_SIZE, Capabilities::SoftDetect | Capabilities::HardSelect, OptionConstraint::None),
            value: OptionValue::Bool(false),
        },
        group("Testing"),
        int_range("read-limit-size", "Read limit size", None, 1, 64 * 1024, 1, 64 * 1024),
        int_range("read-delay-duration", "Read delay duration", Microsecond, 0, 1_000_000, 1, 0),
        string_list("read-return-value", "Return value of read", &READ_RETURN_VALUES, "Default"),
        int_range("feeder-pages", "Pages in feeder", None, 0, 100, 1, 3),
        boolean("hand-scanner", "Hand-scanner simulation", false),
        boolean("three-pass", "Three-pass simulation", false),
        string_list("test-picture", "Select the test picture", &["Solid black", "Solid white", "Grid", "Color pattern"], "Color pattern"),
        group("Typed options"),
        TestOption {
            descriptor: descriptor(Some("int"), "(1/1) Int", OptionType::Int, None, WORD_SIZE, settable(), OptionConstraint::None),
            value: OptionValue::Int(42),
        },
        int_range("int-constraint-range", "(1/1) Int constraint range", Pixel, 4, 192, 2, 26),
        TestOption {
            descriptor: descriptor(Some("int-constraint-word-list"), "(1/1) Int constraint word list", OptionType::Int, Bit, WORD_SIZE, settable(), OptionConstraint::WordList(vec![-42, -8, 0, 17, 42, 256, 65536, 16_777_216, 1_073_741_824])),
            value: OptionValue::Int(42),
        },
        TestOption {
            descriptor: descriptor(Some("int-constraint-array"), "(1/1) Int constraint array", OptionType::Int, None, 6 * WORD_SIZE, settable(), OptionConstraint::Range { range: -42..=42, quant: 1 }),
            value: OptionValue::Words(vec![-42, -17, 0, 5, 17, 42]),
        },
        TestOption {
            descriptor: descriptor(Some("fixed"), "(1/1) Fixed", OptionType::Fixed, None, WORD_SIZE, settable(), OptionConstraint::None),
            value: OptionValue::Fixed(Fixed::from_f64(42.0)),
        },
        fixed_range("fixed-constraint-range", "(1/1) Fixed constraint range", Microsecond, -42.0, 32767.0, 2.0, 42.0),
        TestOption {
            descriptor: descriptor(Some("fixed-constraint-word-list"), "(1/1) Fixed constraint word list", OptionType::Fixed, None, WORD_SIZE, settable(),
                OptionConstraint::WordList([-32.7, 12.1, 42.0, 129.5].iter().map(|v| Fixed::from_f64(*v).raw()).collect())),
            value: OptionValue::Fixed(Fixed::from_f64(42.0)),
        },
        TestOption {
            descriptor: descriptor(Some("string"), "(1/1) String", OptionType::String, None, 64, settable(), OptionConstraint::None),
            value: OptionValue::String("This is the basic string".into()),
        },
        string_list("string-constraint-string-list", "(1/1) String constraint string list", &["First entry", "Second entry", "This is the very long third entry"], "First entry"),
        TestOption {
            descriptor: descriptor(Some("button"), "(1/1) Button", OptionType::Button, None, 0, settable(), OptionConstraint::None),
            value: OptionValue::Button,
        },
        TestOption {
            descriptor: descriptor(Some("bool-inactive"), "(1/1) Inactive bool", OptionType::Bool, None, WORD_SIZE, settable() | Capabilities::Inactive, OptionConstraint::None),
            value: OptionValue::Bool(false),
        },
    ];

    // Brightness can be left to the device.
    if let Some(option) = options.iter_mut().find(|option| option.descriptor.name() == Some("brightness")) {
        option.descriptor.capabilities |= Capabilities::Automatic;
    }
    // Film type only applies to the transparency unit.
    if let Some(option) = options.iter_mut().find(|option| option.descriptor.name() == Some("film-type")) {
        option.descriptor.capabilities |= Capabilities::Inactive;
    }

    let count = options.len() as i32;
    options[0].value = OptionValue::Int(count);
    options
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Box<dyn DeviceHandle> {
        TestBackend::new()
            .open(TEST_DEVICE, None)
            .expect("test device should open")
    }

    fn index(handle: &dyn DeviceHandle, name: &str) -> usize {
        (0..)
            .map_while(|i| handle.option_descriptor(i).map(|d| (i, d)))
            .find(|(_, d)| d.name() == Some(name))
            .map(|(i, _)| i)
            .expect("option should exist")
    }

    fn read_frame(handle: &mut dyn DeviceHandle) -> Vec<u8> {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match handle.read(&mut buf) {
                Ok(n) => data.extend_from_slice(&buf[..n]),
                Err(SaneError::EOF) => return data,
                Err(err) => panic!("unexpected read error {err}"),
            }
        }
    }

    #[test]
    fn option_zero_is_the_count() {
        let mut handle = open();
        let count = handle.option_count().expect("count");
        assert!(handle.option_descriptor(count - 1).is_some());
        assert!(handle.option_descriptor(count).is_none());
    }

    #[test]
    fn auth_device_requires_credentials() {
        let backend = TestBackend::new();
        assert_eq!(
            backend.open(TEST_AUTH_DEVICE, None).err(),
            Some(SaneError::AccessDenied)
        );
        let wrong = Credentials::new("test", "nope");
        assert_eq!(
            backend.open(TEST_AUTH_DEVICE, Some(&wrong)).err(),
            Some(SaneError::AccessDenied)
        );
        let right = Credentials::new(TEST_USERNAME, TEST_PASSWORD);
        assert!(backend.open(TEST_AUTH_DEVICE, Some(&right)).is_ok());
        assert_eq!(backend.open("missing", None).err(), Some(SaneError::Inval));
    }

    #[test]
    fn frame_size_follows_area_and_resolution() {
        let mut handle = open();
        let res = index(handle.as_ref(), "resolution");
        let br_x = index(handle.as_ref(), "br-x");
        let br_y = index(handle.as_ref(), "br-y");
        handle.set_option(res, &OptionValue::Fixed(Fixed::from_f64(254.0))).unwrap();
        handle.set_option(br_x, &OptionValue::Fixed(Fixed::from_f64(10.0))).unwrap();
        handle.set_option(br_y, &OptionValue::Fixed(Fixed::from_f64(2.0))).unwrap();

        let parameters = handle.parameters().unwrap();
        assert_eq!(parameters.pixels_per_line, 100);
        assert_eq!(parameters.lines, Some(20));
        assert_eq!(parameters.bytes_per_line, 100);

        handle.start().unwrap();
        assert_eq!(read_frame(handle.as_mut()).len(), 100 * 20);
    }

    #[test]
    fn word_list_snaps_to_nearest_and_reports_inexact() {
        let mut handle = open();
        let depth = index(handle.as_ref(), "depth");
        let info = handle.set_option(depth, &OptionValue::Int(10)).unwrap();
        assert!(info.contains(SetInfo::Inexact));
        assert_eq!(handle.get_option(depth).unwrap(), OptionValue::Int(8));
    }

    #[test]
    fn lineart_disables_depth() {
        let mut handle = open();
        let mode = index(handle.as_ref(), "mode");
        let depth = index(handle.as_ref(), "depth");
        let info = handle
            .set_option(mode, &OptionValue::String(MODE_LINEART.into()))
            .unwrap();
        assert!(info.contains(SetInfo::ReloadOptions));
        assert!(!handle.option_descriptor(depth).unwrap().is_active());
        assert_eq!(handle.parameters().unwrap().depth, 1);
    }

    #[test]
    fn feeder_runs_out_of_documents() {
        let mut handle = open();
        let source = index(handle.as_ref(), "source");
        let pages = index(handle.as_ref(), "feeder-pages");
        let res = index(handle.as_ref(), "resolution");
        handle.set_option(res, &OptionValue::Fixed(Fixed::from_f64(5.0))).unwrap();
        handle.set_option(pages, &OptionValue::Int(1)).unwrap();
        handle
            .set_option(source, &OptionValue::String(SOURCE_ADF.into()))
            .unwrap();

        handle.start().unwrap();
        read_frame(handle.as_mut());
        assert_eq!(handle.start().err(), Some(SaneError::NoDocs));

        handle.cancel();
        assert!(handle.start().is_ok());
    }

    #[test]
    fn cancel_ends_the_frame() {
        let mut handle = open();
        handle.start().unwrap();
        let mut buf = [0u8; 16];
        assert!(handle.read(&mut buf).is_ok());
        handle.cancel();
        assert_eq!(handle.read(&mut buf).err(), Some(SaneError::Cancelled));
        assert!(handle.start().is_ok());
    }

    #[test]
    fn frames_wait_for_a_button_press() {
        let backend = TestBackend::new();
        let sensors = backend.sensors();
        let mut handle = backend.open(TEST_DEVICE, None).unwrap();
        let wait = index(handle.as_ref(), "wait-for-button");
        let res = index(handle.as_ref(), "resolution");
        handle.set_option(res, &OptionValue::Fixed(Fixed::from_f64(5.0))).unwrap();
        handle.set_option(wait, &OptionValue::Bool(true)).unwrap();

        handle.start().unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(handle.read(&mut buf), Ok(0));
        assert_eq!(handle.read(&mut buf), Ok(0));

        sensors.press_button();
        assert!(!read_frame(handle.as_mut()).is_empty());

        // The press was used up by the first frame.
        handle.start().unwrap();
        assert_eq!(handle.read(&mut buf), Ok(0));
        handle.cancel();
        assert_eq!(handle.read(&mut buf).err(), Some(SaneError::Cancelled));
    }
}
