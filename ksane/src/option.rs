//! Typed view of one device option.

use crate::{
    error::OptionError,
    gamma::{format_curve, parse_curve},
    names,
    policy::Heuristics,
};
use bitflags::bitflags;
use bstr::ByteSlice;
use libsane::{
    DeviceHandle, Fixed, OptionConstraint, OptionDescriptor, OptionType, OptionUnit, OptionValue,
    SaneError, SetInfo, WORD_SIZE,
};
use std::{
    fmt::Write,
    sync::{Arc, Mutex, MutexGuard, TryLockError},
};
use strum::Display;

/// The device handle shared by the session, its options and the scan worker.
pub type SharedHandle = Arc<Mutex<Box<dyn DeviceHandle>>>;

/// Value shape of an option. Fixed for the lifetime of the option.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionKind {
    Boolean,
    IntRange { min: i32, max: i32, step: i32 },
    IntEnum(Vec<i32>),
    FixedRange { min: Fixed, max: Fixed, step: Fixed },
    FixedEnum(Vec<Fixed>),
    StringEnum(Vec<String>),
    FreeText,
    Button,
    GammaCurve { len: usize, max: i32 },
    /// A descriptor shape we do not understand. Readable, never settable.
    Unsupported,
}

impl OptionKind {
    /// Sorts a descriptor into a kind. Total: anything unexpected ends up as
    /// [`OptionKind::Unsupported`].
    pub fn classify(descriptor: &OptionDescriptor) -> Self {
        let name = descriptor.name().unwrap_or_default();
        let single = descriptor.size == WORD_SIZE;

        match (&descriptor.constraint, descriptor.ty) {
            (_, OptionType::Group) => Self::Unsupported,
            (_, OptionType::Button) => Self::Button,
            (_, OptionType::Bool) => Self::Boolean,

            (OptionConstraint::StringList(list), OptionType::String) => Self::StringEnum(
                list.iter()
                    .map(|entry| entry.to_str_lossy().into_owned())
                    .collect(),
            ),
            (OptionConstraint::None, OptionType::String) => Self::FreeText,

            (OptionConstraint::WordList(list), OptionType::Int) if single => {
                Self::IntEnum(list.clone())
            }
            (OptionConstraint::WordList(list), OptionType::Fixed) if single => {
                Self::FixedEnum(list.iter().copied().map(Fixed).collect())
            }

            (OptionConstraint::Range { range, quant }, OptionType::Int) if single => {
                Self::IntRange {
                    min: *range.start(),
                    max: *range.end(),
                    step: *quant,
                }
            }
            (OptionConstraint::Range { range, quant }, OptionType::Fixed) if single => {
                Self::FixedRange {
                    min: Fixed(*range.start()),
                    max: Fixed(*range.end()),
                    step: Fixed(*quant),
                }
            }
            (OptionConstraint::Range { range, .. }, OptionType::Int)
                if descriptor.word_count() > 1 && names::is_gamma_vector(name) =>
            {
                Self::GammaCurve {
                    len: descriptor.word_count(),
                    max: *range.end(),
                }
            }

            (OptionConstraint::None, OptionType::Int) if single => Self::IntRange {
                min: i32::MIN,
                max: i32::MAX,
                step: 1,
            },
            (OptionConstraint::None, OptionType::Fixed) if single => Self::FixedRange {
                min: Fixed::MIN,
                max: Fixed::MAX,
                step: Fixed(0),
            },

            _ => Self::Unsupported,
        }
    }

    fn same_shape(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum OptionState {
    Active,
    /// Valid but not settable right now.
    Inactive,
    /// Not shown; every get and set is rejected.
    Hidden,
    /// Only the device may choose the value.
    AutoOnly,
}

impl OptionState {
    pub fn of(descriptor: &OptionDescriptor) -> Self {
        let empty = descriptor.size == 0 && descriptor.ty != OptionType::Button;
        if !descriptor.is_detectable() || !descriptor.is_active() || empty {
            Self::Hidden
        } else if !descriptor.is_settable() {
            if descriptor.is_auto_settable() {
                Self::AutoOnly
            } else {
                Self::Inactive
            }
        } else {
            Self::Active
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OptionFlags: u8 {
        const HasGui = 1 << 0;
        const NeedsPolling = 1 << 1;
    }
}

/// What a successful write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetEffects {
    /// The value read back differs from the value before the write.
    pub changed: bool,
    pub info: SetInfo,
}

impl SetEffects {
    pub fn reload_options(&self) -> bool {
        self.info.contains(SetInfo::ReloadOptions)
    }

    pub fn reload_values(&self) -> bool {
        self.info.contains(SetInfo::ReloadParams)
    }

    pub fn inexact(&self) -> bool {
        self.info.contains(SetInfo::Inexact)
    }
}

pub struct DeviceOption {
    handle: SharedHandle,
    index: usize,
    name: String,
    group: Option<String>,
    descriptor: OptionDescriptor,
    kind: OptionKind,
    state: OptionState,
    flags: OptionFlags,
    value: Option<OptionValue>,
    saved: Option<OptionValue>,
}

impl DeviceOption {
    pub(crate) fn new(
        handle: SharedHandle,
        index: usize,
        descriptor: OptionDescriptor,
        group: Option<String>,
        heuristics: &dyn Heuristics,
    ) -> Self {
        let kind = OptionKind::classify(&descriptor);
        let mut option = Self {
            handle,
            index,
            name: descriptor.name().unwrap_or_default().to_owned(),
            group,
            kind,
            state: OptionState::of(&descriptor),
            flags: OptionFlags::empty(),
            descriptor,
            value: None,
            saved: None,
        };
        option.update_flags(heuristics);
        option
    }

    fn update_flags(&mut self, heuristics: &dyn Heuristics) {
        self.flags.set(
            OptionFlags::HasGui,
            !self.name.is_empty() && self.kind != OptionKind::Unsupported,
        );
        self.flags.set(
            OptionFlags::NeedsPolling,
            heuristics.needs_polling(&self.descriptor),
        );
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn title(&self) -> String {
        self.descriptor.title.to_str_lossy().into_owned()
    }

    pub fn description(&self) -> String {
        self.descriptor.description.to_str_lossy().into_owned()
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn kind(&self) -> &OptionKind {
        &self.kind
    }

    pub fn unit(&self) -> OptionUnit {
        self.descriptor.unit
    }

    pub fn state(&self) -> OptionState {
        self.state
    }

    pub fn flags(&self) -> OptionFlags {
        self.flags
    }

    pub fn has_gui(&self) -> bool {
        self.flags.contains(OptionFlags::HasGui)
    }

    pub fn needs_polling(&self) -> bool {
        self.flags.contains(OptionFlags::NeedsPolling)
    }

    pub fn descriptor(&self) -> &OptionDescriptor {
        &self.descriptor
    }

    /// Last value read from the device.
    pub fn cached_value(&self) -> Option<&OptionValue> {
        self.value.as_ref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Box<dyn DeviceHandle>>, OptionError> {
        match self.handle.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(OptionError::HandleBusy),
        }
    }

    fn device<T>(&self, result: Result<T, SaneError>, action: &str) -> Result<T, OptionError> {
        result.map_err(|err| {
            log::warn!("Failed to {action} option '{}' (#{}): {err}", self.name, self.index);
            OptionError::Device(err)
        })
    }

    /// Re-reads descriptor metadata. Constraint lists are refreshed, the
    /// kind itself never changes.
    pub fn read_option(&mut self, heuristics: &dyn Heuristics) -> Result<(), OptionError> {
        let descriptor = self
            .lock()?
            .option_descriptor(self.index)
            .ok_or(OptionError::Device(SaneError::Inval))?;

        let kind = OptionKind::classify(&descriptor);
        if kind.same_shape(&self.kind) {
            self.kind = kind;
        } else {
            log::warn!(
                "Option '{}' (#{}) changed shape from {:?} to {kind:?}, keep the old one",
                self.name,
                self.index,
                self.kind,
            );
        }

        self.state = OptionState::of(&descriptor);
        self.descriptor = descriptor;
        self.update_flags(heuristics);

        Ok(())
    }

    /// Fetches the live value. Returns whether it differs from the cached
    /// one.
    pub fn read_value(&mut self) -> Result<bool, OptionError> {
        if self.state == OptionState::Hidden {
            return Err(OptionError::Hidden);
        }
        if self.kind == OptionKind::Button {
            return Ok(false);
        }

        let value = {
            let mut handle = self.lock()?;
            let result = handle.get_option(self.index);
            drop(handle);
            self.device(result, "read")?
        };

        let changed = self.value.as_ref() != Some(&value);
        self.value = Some(value);
        Ok(changed)
    }

    fn write(&mut self, value: OptionValue) -> Result<SetEffects, OptionError> {
        log::debug!("Set option '{}' (#{}) to {value}", self.name, self.index);

        self.apply(|device, index| device.set_option(index, &value))
    }

    fn apply<F>(&mut self, action: F) -> Result<SetEffects, OptionError>
    where
        F: FnOnce(&mut dyn DeviceHandle, usize) -> Result<SetInfo, SaneError>,
    {
        let before = self.value.clone();

        let info = {
            let mut handle = self.lock()?;
            let result = action(handle.as_mut(), self.index);
            drop(handle);
            self.device(result, "write")?
        };

        if info.contains(SetInfo::Inexact) {
            log::debug!("Device adjusted the value of '{}'", self.name);
        }

        // The device may coerce what was written.
        if self.kind != OptionKind::Button {
            let mut handle = self.lock()?;
            let result = handle.get_option(self.index);
            drop(handle);
            match result {
                Ok(current) => self.value = Some(current),
                Err(err) => log::warn!("Failed to re-read option '{}': {err}", self.name),
            }
        }

        Ok(SetEffects {
            changed: self.value != before,
            info,
        })
    }

    fn check_settable(&self) -> Result<(), OptionError> {
        match self.state {
            OptionState::Hidden => Err(OptionError::Hidden),
            OptionState::Inactive | OptionState::AutoOnly => Err(OptionError::ReadOnly),
            OptionState::Active if self.kind == OptionKind::Unsupported => {
                Err(OptionError::ReadOnly)
            }
            OptionState::Active => Ok(()),
        }
    }

    fn current(&self) -> Result<&OptionValue, OptionError> {
        if self.state == OptionState::Hidden {
            return Err(OptionError::Hidden);
        }
        self.value.as_ref().ok_or(OptionError::TypeMismatch)
    }

    pub fn value_as_f64(&self) -> Result<f64, OptionError> {
        match self.current()? {
            OptionValue::Bool(value) => Ok(*value as i32 as f64),
            OptionValue::Int(value) => Ok(*value as f64),
            OptionValue::Fixed(value) => Ok(value.to_f64()),
            _ => Err(OptionError::TypeMismatch),
        }
    }

    /// The raw value as text: numbers without unit, booleans as
    /// `true`/`false`, gamma curves as comma separated points.
    pub fn value_as_string(&self) -> Result<String, OptionError> {
        match self.current()? {
            OptionValue::Bool(value) => Ok(value.to_string()),
            OptionValue::Int(value) => Ok(value.to_string()),
            OptionValue::Fixed(value) => Ok(format_float(value.to_f64())),
            OptionValue::String(value) => Ok(value.to_str_lossy().into_owned()),
            OptionValue::Words(words) => Ok(format_curve(words)),
            OptionValue::Button => Err(OptionError::TypeMismatch),
        }
    }

    /// The value formatted for display, with its unit.
    pub fn display_value(&self) -> Result<String, OptionError> {
        match self.current()? {
            OptionValue::Int(value) => Ok(format_with_unit(*value as f64, self.unit())),
            OptionValue::Fixed(value) => Ok(format_with_unit(value.to_f64(), self.unit())),
            _ => self.value_as_string(),
        }
    }

    /// Display strings of the allowed values of enumerated options.
    pub fn display_entries(&self) -> Vec<String> {
        match &self.kind {
            OptionKind::IntEnum(list) => list
                .iter()
                .map(|value| format_with_unit(*value as f64, self.unit()))
                .collect(),
            OptionKind::FixedEnum(list) => list
                .iter()
                .map(|value| format_with_unit(value.to_f64(), self.unit()))
                .collect(),
            OptionKind::StringEnum(list) => list.clone(),
            _ => Vec::new(),
        }
    }

    pub fn min_value(&self) -> Option<f64> {
        match &self.kind {
            OptionKind::Boolean => Some(0.0),
            OptionKind::IntRange { min, .. } => Some(*min as f64),
            OptionKind::FixedRange { min, .. } => Some(min.to_f64()),
            OptionKind::IntEnum(list) => list.iter().min().map(|v| *v as f64),
            OptionKind::FixedEnum(list) => list.iter().map(|v| v.raw()).min().map(|v| Fixed(v).to_f64()),
            _ => None,
        }
    }

    pub fn max_value(&self) -> Option<f64> {
        match &self.kind {
            OptionKind::Boolean => Some(1.0),
            OptionKind::IntRange { max, .. } => Some(*max as f64),
            OptionKind::FixedRange { max, .. } => Some(max.to_f64()),
            OptionKind::IntEnum(list) => list.iter().max().map(|v| *v as f64),
            OptionKind::FixedEnum(list) => list.iter().map(|v| v.raw()).max().map(|v| Fixed(v).to_f64()),
            _ => None,
        }
    }

    pub fn step_value(&self) -> Option<f64> {
        match &self.kind {
            OptionKind::IntRange { step, .. } => Some((*step).max(1) as f64),
            OptionKind::FixedRange { step, .. } => Some(step.to_f64()),
            _ => None,
        }
    }

    /// Writes the allowed value nearest to `value`.
    pub fn set_f64(&mut self, value: f64) -> Result<SetEffects, OptionError> {
        self.check_settable()?;

        let raw = match &self.kind {
            OptionKind::Boolean => OptionValue::Bool(value != 0.0),
            OptionKind::IntRange { min, max, step } => OptionValue::Int(
                snap_to_range(value, *min as f64, *max as f64, (*step).max(0) as f64) as i32,
            ),
            OptionKind::IntEnum(list) => OptionValue::Int(
                nearest(list, value, |v| *v as f64).ok_or(OptionError::TypeMismatch)?,
            ),
            OptionKind::FixedRange { min, max, step } => {
                let raw = Fixed::from_f64(value).raw() as f64;
                let snapped = snap_to_range(
                    raw,
                    min.raw() as f64,
                    max.raw() as f64,
                    step.raw().max(0) as f64,
                );
                OptionValue::Fixed(Fixed(snapped as i32))
            }
            OptionKind::FixedEnum(list) => OptionValue::Fixed(
                nearest(list, value, |v| v.to_f64()).ok_or(OptionError::TypeMismatch)?,
            ),
            _ => return Err(OptionError::TypeMismatch),
        };

        self.write(raw)
    }

    pub fn set_i32(&mut self, value: i32) -> Result<SetEffects, OptionError> {
        self.set_f64(value as f64)
    }

    pub fn set_string(&mut self, text: &str) -> Result<SetEffects, OptionError> {
        self.check_settable()?;

        let trimmed = text.trim();
        match &self.kind {
            OptionKind::Boolean => match parse_bool(trimmed) {
                Some(value) => self.write(OptionValue::Bool(value)),
                None => Err(OptionError::Parse(text.to_owned())),
            },
            OptionKind::IntRange { .. }
            | OptionKind::IntEnum(_)
            | OptionKind::FixedRange { .. }
            | OptionKind::FixedEnum(_) => {
                // "600 DPI" and "8 Bits" are accepted as well.
                let number = trimmed.split_whitespace().next().unwrap_or_default();
                let value = number
                    .parse::<f64>()
                    .map_err(|_| OptionError::Parse(text.to_owned()))?;
                self.set_f64(value)
            }
            OptionKind::StringEnum(list) => {
                let entry = list
                    .iter()
                    .find(|entry| entry.trim().eq_ignore_ascii_case(trimmed))
                    .or_else(|| {
                        list.iter()
                            .find(|entry| entry.trim().to_lowercase() == trimmed.to_lowercase())
                    })
                    .cloned()
                    .ok_or_else(|| OptionError::NotInList(text.to_owned()))?;
                self.write(OptionValue::String(entry.into()))
            }
            OptionKind::FreeText => self.write(OptionValue::String(text.into())),
            OptionKind::Button => self.press(),
            OptionKind::GammaCurve { len, max } => {
                let curve = parse_curve(trimmed, *len, *max)?;
                self.write(OptionValue::Words(curve))
            }
            OptionKind::Unsupported => Err(OptionError::ReadOnly),
        }
    }

    pub fn set_curve(&mut self, points: &[i32]) -> Result<SetEffects, OptionError> {
        self.check_settable()?;

        let OptionKind::GammaCurve { len, max } = self.kind else {
            return Err(OptionError::TypeMismatch);
        };
        if points.len() != len {
            return Err(OptionError::TypeMismatch);
        }

        self.write(OptionValue::Words(
            points.iter().map(|point| (*point).clamp(0, max)).collect(),
        ))
    }

    pub fn press(&mut self) -> Result<SetEffects, OptionError> {
        self.check_settable()?;

        if self.kind != OptionKind::Button {
            return Err(OptionError::TypeMismatch);
        }

        self.write(OptionValue::Button)
    }

    /// Lets the device pick the value. The only write an
    /// [`OptionState::AutoOnly`] option accepts.
    pub fn set_auto(&mut self) -> Result<SetEffects, OptionError> {
        match self.state {
            OptionState::Hidden => return Err(OptionError::Hidden),
            OptionState::Inactive => return Err(OptionError::ReadOnly),
            OptionState::Active | OptionState::AutoOnly => {}
        }
        if !self.descriptor.is_auto_settable() {
            return Err(OptionError::ReadOnly);
        }

        log::debug!("Set option '{}' (#{}) to auto", self.name, self.index);

        self.apply(|device, index| device.set_option_auto(index))
    }

    /// Remembers the live value for [`Self::restore_saved_data`]. A later
    /// store replaces an earlier one.
    pub fn store_current_data(&mut self) {
        if self.state == OptionState::Hidden || self.kind == OptionKind::Button {
            return;
        }

        if let Err(err) = self.read_value() {
            log::debug!("Store cached value of '{}': {err}", self.name);
        }
        self.saved = self.value.clone();
    }

    /// Writes the stored value back, whether or not it looks unchanged.
    pub fn restore_saved_data(&mut self) -> Result<SetEffects, OptionError> {
        let Some(saved) = self.saved.clone() else {
            return Ok(SetEffects::default());
        };

        if self.state == OptionState::Hidden {
            return Err(OptionError::Hidden);
        }

        self.write(saved)
    }

    pub fn saved_value(&self) -> Option<&OptionValue> {
        self.saved.as_ref()
    }
}

impl std::fmt::Debug for DeviceOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceOption")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("group", &self.group)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("value", &self.value)
            .finish()
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.to_lowercase().as_str() {
        "true" | "1" | "on" | "yes" => Some(true),
        "false" | "0" | "off" | "no" => Some(false),
        _ => None,
    }
}

/// Nearest entry by absolute difference. Ties go to the smaller entry.
pub(crate) fn nearest<T: Copy>(list: &[T], target: f64, key: impl Fn(&T) -> f64) -> Option<T> {
    let mut sorted = list.to_vec();
    sorted.sort_by(|a, b| key(a).total_cmp(&key(b)));

    let mut best = None;
    let mut best_diff = f64::INFINITY;
    for entry in sorted {
        let diff = (key(&entry) - target).abs();
        if diff < best_diff {
            best = Some(entry);
            best_diff = diff;
        }
    }
    best
}

/// Clamps into `min..=max` and snaps onto the `step` grid anchored at `min`.
/// Half-way values go down. A zero step means any value.
pub(crate) fn snap_to_range(value: f64, min: f64, max: f64, step: f64) -> f64 {
    let clamped = value.clamp(min, max);
    if step <= 0.0 {
        return clamped.round();
    }

    let steps = (clamped - min) / step;
    let lower = steps.floor();
    let steps = if steps - lower > 0.5 { lower + 1.0 } else { lower };

    let mut snapped = min + steps * step;
    if snapped > max {
        snapped -= step;
    }
    snapped
}

fn format_float(value: f64) -> String {
    let text = format!("{value:.4}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" {
        "0".to_owned()
    } else {
        text.to_owned()
    }
}

pub(crate) fn format_with_unit(value: f64, unit: OptionUnit) -> String {
    let mut text = format_float(value);
    let singular = value == 1.0;

    let suffix = match unit {
        OptionUnit::None => "",
        OptionUnit::Pixel if singular => " Pixel",
        OptionUnit::Pixel => " Pixels",
        OptionUnit::Bit if singular => " Bit",
        OptionUnit::Bit => " Bits",
        OptionUnit::Mm => " mm",
        OptionUnit::Dpi => " DPI",
        OptionUnit::Percent => " %",
        OptionUnit::Microsecond => " µs",
    };

    _ = write!(text, "{suffix}");
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsane::OptionCapabilities;

    fn descriptor(
        name: &str,
        ty: OptionType,
        size: usize,
        constraint: OptionConstraint,
    ) -> OptionDescriptor {
        OptionDescriptor {
            name: Some(name.into()),
            title: name.into(),
            description: "".into(),
            ty,
            unit: OptionUnit::None,
            size,
            capabilities: OptionCapabilities::SoftSelect | OptionCapabilities::SoftDetect,
            constraint,
        }
    }

    #[test]
    fn classification_is_total() {
        use OptionConstraint as C;
        use OptionType as T;

        let range = || C::Range { range: 0..=255, quant: 1 };

        assert_eq!(OptionKind::classify(&descriptor("b", T::Bool, 4, C::None)), OptionKind::Boolean);
        assert_eq!(
            OptionKind::classify(&descriptor("i", T::Int, 4, range())),
            OptionKind::IntRange { min: 0, max: 255, step: 1 }
        );
        assert_eq!(
            OptionKind::classify(&descriptor("w", T::Int, 4, C::WordList(vec![1, 8]))),
            OptionKind::IntEnum(vec![1, 8])
        );
        assert_eq!(
            OptionKind::classify(&descriptor("s", T::String, 8, C::StringList(vec!["Gray".into()]))),
            OptionKind::StringEnum(vec!["Gray".to_owned()])
        );
        assert_eq!(OptionKind::classify(&descriptor("t", T::String, 8, C::None)), OptionKind::FreeText);
        assert_eq!(OptionKind::classify(&descriptor("p", T::Button, 0, C::None)), OptionKind::Button);
        assert_eq!(
            OptionKind::classify(&descriptor(names::GAMMA_VECTOR_R, T::Int, 1024, range())),
            OptionKind::GammaCurve { len: 256, max: 255 }
        );
        // Arrays that are not gamma tables are not understood.
        assert_eq!(
            OptionKind::classify(&descriptor("array", T::Int, 24, range())),
            OptionKind::Unsupported
        );
        assert_eq!(
            OptionKind::classify(&descriptor("s", T::String, 8, range())),
            OptionKind::Unsupported
        );
    }

    #[test]
    fn state_follows_capabilities() {
        let mut desc = descriptor("x", OptionType::Int, 4, OptionConstraint::None);
        assert_eq!(OptionState::of(&desc), OptionState::Active);

        desc.capabilities = OptionCapabilities::SoftDetect;
        assert_eq!(OptionState::of(&desc), OptionState::Inactive);

        desc.capabilities = OptionCapabilities::SoftDetect | OptionCapabilities::Automatic;
        assert_eq!(OptionState::of(&desc), OptionState::AutoOnly);

        desc.capabilities = OptionCapabilities::SoftSelect
            | OptionCapabilities::SoftDetect
            | OptionCapabilities::Inactive;
        assert_eq!(OptionState::of(&desc), OptionState::Hidden);

        desc.capabilities = OptionCapabilities::SoftSelect;
        assert_eq!(OptionState::of(&desc), OptionState::Hidden);
    }

    #[test]
    fn nearest_prefers_the_first_ascending_entry_on_ties() {
        let list = [256, -8, 17, 0, 42];
        assert_eq!(nearest(&list, 29.0, |v| *v as f64), Some(17));
        assert_eq!(nearest(&list, 29.5, |v| *v as f64), Some(17));
        assert_eq!(nearest(&list, 31.0, |v| *v as f64), Some(42));
        assert_eq!(nearest(&list, -1000.0, |v| *v as f64), Some(-8));
        assert_eq!(nearest::<i32>(&[], 1.0, |v| *v as f64), None);
    }

    #[test]
    fn range_snapping() {
        assert_eq!(snap_to_range(27.0, 4.0, 192.0, 2.0), 26.0);
        assert_eq!(snap_to_range(27.1, 4.0, 192.0, 2.0), 28.0);
        assert_eq!(snap_to_range(1000.0, 4.0, 192.0, 2.0), 192.0);
        assert_eq!(snap_to_range(-5.0, 4.0, 192.0, 2.0), 4.0);
        assert_eq!(snap_to_range(10.0, 0.0, 9.0, 4.0), 8.0);
        assert_eq!(snap_to_range(3.4, 0.0, 9.0, 0.0), 3.0);
    }

    #[test]
    fn unit_formatting() {
        assert_eq!(format_with_unit(8.0, OptionUnit::Bit), "8 Bits");
        assert_eq!(format_with_unit(1.0, OptionUnit::Bit), "1 Bit");
        assert_eq!(format_with_unit(600.0, OptionUnit::Dpi), "600 DPI");
        assert_eq!(format_with_unit(12.5, OptionUnit::Mm), "12.5 mm");
        assert_eq!(format_with_unit(50.0, OptionUnit::Microsecond), "50 µs");
        assert_eq!(format_with_unit(2.0, OptionUnit::None), "2");
    }

    #[test]
    fn float_formatting_hides_fixed_point_noise() {
        assert_eq!(format_float(Fixed::from_f64(12.1).to_f64()), "12.1");
        assert_eq!(format_float(42.0), "42");
        assert_eq!(format_float(-32.7), "-32.7");
    }

    #[test]
    fn bool_parsing() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
