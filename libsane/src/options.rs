use crate::Fixed;
use bitflags::bitflags;
use bstr::{BString, ByteSlice};
use std::{fmt::Debug, ops};

/// Size of one SANE word in bytes.
pub const WORD_SIZE: usize = 4;

#[derive(Clone, PartialEq)]
pub struct OptionDescriptor {
    pub name: Option<BString>,
    pub title: BString,
    pub description: BString,
    pub ty: Type,
    pub unit: Unit,
    /// Value size in bytes, as the device reports it.
    pub size: usize,
    pub capabilities: Capabilities,
    pub constraint: Constraint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Bool,
    Int,
    Fixed,
    String,
    Button,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    None,
    Pixel,
    Bit,
    Mm,
    Dpi,
    Percent,
    Microsecond,
}

bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const SoftSelect = 1 << 0;
        const HardSelect = 1 << 1;
        const SoftDetect = 1 << 2;
        const Emulated = 1 << 3;
        const Automatic = 1 << 4;
        const Inactive = 1 << 5;
        const Advanced = 1 << 6;

        const _ = !0;
    }
}

bitflags! {
    /// What the device reports back after a value was written.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SetInfo: u32 {
        const Inexact = 1 << 0;
        const ReloadOptions = 1 << 1;
        const ReloadParams = 1 << 2;

        const _ = !0;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    None,
    Range {
        range: ops::RangeInclusive<i32>,
        quant: i32,
    },
    WordList(Vec<i32>),
    StringList(Vec<BString>),
}

/// An option value as it travels to and from the device.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i32),
    Fixed(Fixed),
    /// Option values spanning more than one word, e.g. gamma tables.
    Words(Vec<i32>),
    String(BString),
    /// Buttons carry no value; writing one presses it.
    Button,
}

impl OptionDescriptor {
    pub fn name(&self) -> Option<&str> {
        self.name.as_ref().and_then(|name| name.to_str().ok())
    }

    /// Number of words the value occupies (1 for scalar word options).
    pub fn word_count(&self) -> usize {
        self.size / WORD_SIZE
    }

    pub fn is_settable(&self) -> bool {
        self.capabilities.contains(Capabilities::SoftSelect)
    }

    pub fn is_detectable(&self) -> bool {
        self.capabilities.contains(Capabilities::SoftDetect)
    }

    pub fn is_auto_settable(&self) -> bool {
        self.capabilities.contains(Capabilities::Automatic)
    }

    pub fn is_active(&self) -> bool {
        !self.capabilities.contains(Capabilities::Inactive)
    }
}

impl Debug for OptionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Option")
            .field("name", &self.name)
            .field("title", &self.title)
            .field("type", &self.ty)
            .field("unit", &self.unit)
            .field("size", &self.size)
            .field("capabilities", &self.capabilities)
            .field("constraint", &self.constraint)
            .finish()
    }
}

impl Value {
    pub fn as_words(&self) -> Option<Vec<i32>> {
        match self {
            Value::Bool(value) => Some(vec![*value as i32]),
            Value::Int(value) => Some(vec![*value]),
            Value::Fixed(value) => Some(vec![value.raw()]),
            Value::Words(words) => Some(words.clone()),
            Value::String(_) | Value::Button => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(value) => write!(f, "{value}"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Fixed(value) => write!(f, "{value}"),
            Value::Words(words) => write!(f, "[{} words]", words.len()),
            Value::String(value) => write!(f, "'{value}'"),
            Value::Button => write!(f, "<button>"),
        }
    }
}

#[cfg(feature = "sys")]
mod sys {
    use super::*;
    use crate::utils::cstr2bstr;
    use libsane_sys::*;

    impl OptionDescriptor {
        /// # Safety
        ///
        /// `desc` must point to a descriptor returned by
        /// `sane_get_option_descriptor` for a handle that is still open.
        pub(crate) unsafe fn from_raw(desc: &SANE_Option_Descriptor) -> Self {
            Self {
                name: cstr2bstr(desc.name).map(BString::from),
                title: cstr2bstr(desc.title).map(BString::from).unwrap_or_default(),
                description: cstr2bstr(desc.desc).map(BString::from).unwrap_or_default(),
                ty: desc.type_.into(),
                unit: desc.unit.into(),
                size: desc.size.max(0) as usize,
                capabilities: Capabilities::from_bits_retain(desc.cap as u32),
                constraint: Constraint::from_raw(desc.constraint_type, desc.constraint),
            }
        }
    }

    impl From<SANE_Value_Type> for Type {
        fn from(ty: SANE_Value_Type) -> Self {
            match ty {
                SANE_Value_Type_SANE_TYPE_BOOL => Self::Bool,
                SANE_Value_Type_SANE_TYPE_INT => Self::Int,
                SANE_Value_Type_SANE_TYPE_FIXED => Self::Fixed,
                SANE_Value_Type_SANE_TYPE_STRING => Self::String,
                SANE_Value_Type_SANE_TYPE_BUTTON => Self::Button,
                SANE_Value_Type_SANE_TYPE_GROUP => Self::Group,
                _ => {
                    log::warn!("Unknown option type {ty}, treat as group");
                    Self::Group
                }
            }
        }
    }

    impl From<SANE_Unit> for Unit {
        fn from(unit: SANE_Unit) -> Self {
            match unit {
                SANE_Unit_SANE_UNIT_NONE => Self::None,
                SANE_Unit_SANE_UNIT_PIXEL => Self::Pixel,
                SANE_Unit_SANE_UNIT_BIT => Self::Bit,
                SANE_Unit_SANE_UNIT_MM => Self::Mm,
                SANE_Unit_SANE_UNIT_DPI => Self::Dpi,
                SANE_Unit_SANE_UNIT_PERCENT => Self::Percent,
                SANE_Unit_SANE_UNIT_MICROSECOND => Self::Microsecond,
                _ => Self::None,
            }
        }
    }

    impl Constraint {
        unsafe fn from_raw(
            ty: SANE_Constraint_Type,
            constraint: SANE_Option_Descriptor__bindgen_ty_1,
        ) -> Self {
            match ty {
                SANE_Constraint_Type_SANE_CONSTRAINT_RANGE => match constraint.range.as_ref() {
                    Some(range) => Self::Range {
                        range: range.min..=range.max,
                        quant: range.quant,
                    },
                    None => Self::None,
                },
                SANE_Constraint_Type_SANE_CONSTRAINT_WORD_LIST => {
                    // First word is the list length.
                    let list = constraint.word_list;
                    if list.is_null() {
                        return Self::None;
                    }
                    let len = (*list).max(0) as usize;
                    Self::WordList((1..=len).map(|i| *list.add(i)).collect())
                }
                SANE_Constraint_Type_SANE_CONSTRAINT_STRING_LIST => {
                    let list = constraint.string_list;
                    if list.is_null() {
                        return Self::None;
                    }
                    Self::StringList(
                        (0..usize::MAX)
                            .map_while(|offset| cstr2bstr(*list.add(offset)))
                            .map(BString::from)
                            .collect(),
                    )
                }
                _ => Self::None,
            }
        }
    }
}
