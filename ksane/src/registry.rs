use crate::{
    option::{DeviceOption, SharedHandle},
    policy::Heuristics,
};
use bstr::ByteSlice;
use libsane::{OptionType, SaneError};
use std::{
    collections::HashMap,
    sync::{MutexGuard, PoisonError},
};

/// The options of one open device, in device order.
#[derive(Debug, Default)]
pub struct OptionRegistry {
    options: Vec<DeviceOption>,
    by_name: HashMap<String, usize>,
}

impl OptionRegistry {
    /// Reads every descriptor and value of the device. Option 0 (the count)
    /// and group separators are not options of their own; a group title is
    /// attached to the options that follow it.
    pub fn open(handle: &SharedHandle, heuristics: &dyn Heuristics) -> Result<Self, SaneError> {
        let descriptors = {
            let mut device = lock(handle);
            let count = device.option_count()?;
            (1..count)
                .filter_map(|index| device.option_descriptor(index).map(|desc| (index, desc)))
                .collect::<Vec<_>>()
        };

        let mut registry = Self::default();
        let mut group = None;

        for (index, descriptor) in descriptors {
            if descriptor.ty == OptionType::Group {
                group = Some(descriptor.title.to_str_lossy().into_owned());
                continue;
            }

            let mut option =
                DeviceOption::new(handle.clone(), index, descriptor, group.clone(), heuristics);
            if let Err(err) = option.read_value() {
                log::debug!("No initial value for option '{}' (#{index}): {err}", option.name());
            }

            log::trace!("Found option {option:?}");
            registry.push(option);
        }

        log::debug!("Read {} options", registry.options.len());

        Ok(registry)
    }

    fn push(&mut self, option: DeviceOption) {
        if option.has_gui() {
            if self.by_name.contains_key(option.name()) {
                log::warn!("Duplicate option name '{}', keep the first one", option.name());
            } else {
                self.by_name
                    .insert(option.name().to_owned(), self.options.len());
            }
        }
        self.options.push(option);
    }

    pub fn by_name(&self, name: &str) -> Option<&DeviceOption> {
        self.by_name.get(name).map(|i| &self.options[*i])
    }

    pub fn by_name_mut(&mut self, name: &str) -> Option<&mut DeviceOption> {
        self.by_name.get(name).map(|i| &mut self.options[*i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceOption> {
        self.options.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeviceOption> {
        self.options.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Re-reads descriptors and values of every option. Returns the names
    /// whose value changed.
    pub fn reload(&mut self, heuristics: &dyn Heuristics) -> Vec<String> {
        log::debug!("Reload all options");

        self.options
            .iter_mut()
            .filter_map(|option| {
                if let Err(err) = option.read_option(heuristics) {
                    log::warn!("Failed to reload option '{}': {err}", option.name());
                }
                match option.read_value() {
                    Ok(true) => Some(option.name().to_owned()),
                    _ => None,
                }
            })
            .collect()
    }

    /// Re-reads the value of every option. Returns the names whose value
    /// changed.
    pub fn read_values(&mut self) -> Vec<String> {
        self.options
            .iter_mut()
            .filter_map(|option| match option.read_value() {
                Ok(true) => Some(option.name().to_owned()),
                _ => None,
            })
            .collect()
    }

    /// Options reflecting hardware state that changes on its own.
    pub fn polled_mut(&mut self) -> impl Iterator<Item = &mut DeviceOption> {
        self.options
            .iter_mut()
            .filter(|option| option.needs_polling())
    }

    /// Drops every option. Safe to call repeatedly.
    pub fn clear(&mut self) {
        if !self.options.is_empty() {
            log::debug!("Clear {} options", self.options.len());
        }
        self.options.clear();
        self.by_name.clear();
    }
}

pub(crate) fn lock(handle: &SharedHandle) -> MutexGuard<'_, Box<dyn libsane::DeviceHandle>> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        option::{OptionKind, OptionState},
        policy::DefaultHeuristics,
    };
    use libsane::{Backend, TestBackend, TEST_DEVICE};
    use std::sync::{Arc, Mutex};

    fn open() -> (SharedHandle, OptionRegistry) {
        let handle = TestBackend::new()
            .open(TEST_DEVICE, None)
            .expect("test device should open");
        let handle: SharedHandle = Arc::new(Mutex::new(handle));
        let registry = OptionRegistry::open(&handle, &DefaultHeuristics).expect("registry");
        (handle, registry)
    }

    #[test]
    fn skips_count_and_groups_and_keeps_device_order() {
        let (_, registry) = open();

        assert!(registry.iter().all(|option| option.index() > 0));
        let indices: Vec<_> = registry.iter().map(|option| option.index()).collect();
        let mut sorted = indices.clone();
        sorted.sort();
        assert_eq!(indices, sorted);

        let mode = registry.by_name("mode").expect("mode");
        assert_eq!(mode.group(), Some("Scan Mode"));
        assert_eq!(
            mode.kind(),
            &OptionKind::StringEnum(vec!["Gray".into(), "Color".into(), "Lineart".into()])
        );
        assert!(registry.by_name("missing").is_none());
    }

    #[test]
    fn classifies_test_device_options() {
        let (_, registry) = open();

        let kind = |name| registry.by_name(name).expect(name).kind().clone();
        assert!(matches!(kind("depth"), OptionKind::IntEnum(_)));
        assert!(matches!(kind("resolution"), OptionKind::FixedRange { .. }));
        assert!(matches!(kind("preview"), OptionKind::Boolean));
        assert!(matches!(kind("string"), OptionKind::FreeText));
        assert!(matches!(kind("button"), OptionKind::Button));
        assert!(matches!(kind("red-gamma-table"), OptionKind::GammaCurve { len: 256, max: 255 }));

        // Not understood, hence not reachable by name.
        assert!(registry.by_name("int-constraint-array").is_none());
        assert!(registry
            .iter()
            .any(|option| option.name() == "int-constraint-array"
                && option.kind() == &OptionKind::Unsupported));
    }

    #[test]
    fn flags_button_sensor_for_polling() {
        let (_, mut registry) = open();

        let polled: Vec<_> = registry.polled_mut().map(|option| option.name().to_owned()).collect();
        assert_eq!(polled, vec!["scan".to_owned()]);
        assert_eq!(registry.by_name("scan").unwrap().state(), OptionState::Inactive);
        assert_eq!(registry.by_name("film-type").unwrap().state(), OptionState::Hidden);
        assert_eq!(registry.by_name("bool-inactive").unwrap().state(), OptionState::Hidden);
    }

    #[test]
    fn reload_picks_up_state_changes() {
        let (_, mut registry) = open();

        let effects = registry
            .by_name_mut("source")
            .unwrap()
            .set_string("Transparency Adapter")
            .unwrap();
        assert!(effects.reload_options());
        assert_eq!(registry.by_name("film-type").unwrap().state(), OptionState::Hidden);

        registry.reload(&DefaultHeuristics);
        assert_eq!(registry.by_name("film-type").unwrap().state(), OptionState::Active);
    }

    #[test]
    fn clear_is_idempotent() {
        let (_, mut registry) = open();
        registry.clear();
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.by_name("mode").is_none());
    }
}
