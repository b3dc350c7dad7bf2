use ksane::{
    libsane::{Backend, Fixed, OptionUnit, TestBackend, TEST_DEVICE},
    DefaultHeuristics, OptionError, OptionKind, OptionRegistry, OptionState, SharedHandle,
};
use std::sync::{Arc, Mutex};

fn registry() -> OptionRegistry {
    let handle = TestBackend::new()
        .open(TEST_DEVICE, None)
        .expect("test device should open");
    let handle: SharedHandle = Arc::new(Mutex::new(handle));
    OptionRegistry::open(&handle, &DefaultHeuristics).expect("options")
}

#[test]
fn restore_brings_back_the_stored_value() {
    let mut registry = registry();
    let option = registry.by_name_mut("resolution").unwrap();

    option.set_f64(300.0).unwrap();
    option.store_current_data();
    option.set_f64(75.0).unwrap();
    option.store_current_data();
    option.set_f64(1200.0).unwrap();

    // The last store wins.
    option.restore_saved_data().unwrap();
    assert_eq!(option.value_as_f64().unwrap(), 75.0);
}

#[test]
fn values_snap_to_the_constraint() {
    let mut registry = registry();

    let depth = registry.by_name_mut("depth").unwrap();
    let effects = depth.set_f64(13.0).unwrap();
    assert!(effects.changed);
    assert_eq!(depth.value_as_f64().unwrap(), 16.0);

    let range = registry.by_name_mut("int-constraint-range").unwrap();
    assert_eq!(range.unit(), OptionUnit::Pixel);
    range.set_f64(1000.0).unwrap();
    assert_eq!(range.value_as_f64().unwrap(), 192.0);
    assert_eq!(range.display_value().unwrap(), "192 Pixels");
}

#[test]
fn fixed_values_snap_to_the_nearest_entry() {
    let mut registry = registry();
    let list = registry.by_name_mut("fixed-constraint-word-list").unwrap();
    let low = Fixed::from_f64(12.1).to_f64();

    list.set_f64(27.0).unwrap();
    assert_eq!(list.value_as_f64().unwrap(), low);
    list.set_f64(27.3).unwrap();
    assert_eq!(list.value_as_f64().unwrap(), 42.0);

    // Half way between two entries picks the smaller one.
    list.set_f64((low + 42.0) / 2.0).unwrap();
    assert_eq!(list.value_as_f64().unwrap(), low);
}

#[test]
fn fixed_ranges_round_half_steps_down() {
    let mut registry = registry();
    let range = registry.by_name_mut("fixed-constraint-range").unwrap();
    assert!(matches!(range.kind(), OptionKind::FixedRange { .. }));

    range.set_f64(1.0).unwrap();
    assert_eq!(range.value_as_f64().unwrap(), 0.0);
    range.set_f64(1.5).unwrap();
    assert_eq!(range.value_as_f64().unwrap(), 2.0);
    range.set_f64(-100.0).unwrap();
    assert_eq!(range.value_as_f64().unwrap(), -42.0);
}

#[test]
fn text_values_follow_the_option_kind() {
    let mut registry = registry();

    let mode = registry.by_name_mut("mode").unwrap();
    mode.set_string("lineart").unwrap();
    assert_eq!(mode.value_as_string().unwrap(), "Lineart");
    assert_eq!(
        mode.set_string("Sepia").unwrap_err(),
        OptionError::NotInList("Sepia".to_owned())
    );

    let resolution = registry.by_name_mut("resolution").unwrap();
    resolution.set_string("150 DPI").unwrap();
    assert_eq!(resolution.value_as_f64().unwrap(), 150.0);
    assert!(matches!(
        resolution.set_string("lots"),
        Err(OptionError::Parse(_))
    ));

    let gamma = registry.by_name_mut("red-gamma-table").unwrap();
    assert!(matches!(gamma.kind(), OptionKind::GammaCurve { .. }));
    gamma.set_string("0:0:100").unwrap();
    let points: Vec<i32> = gamma
        .value_as_string()
        .unwrap()
        .split(',')
        .map(|point| point.parse().unwrap())
        .collect();
    assert_eq!(points, (0..256).collect::<Vec<_>>());
}

#[test]
fn hidden_and_read_only_options_refuse_writes() {
    let mut registry = registry();

    let film = registry.by_name_mut("film-type").unwrap();
    assert_eq!(film.state(), OptionState::Hidden);
    assert_eq!(film.set_string("Negative Film"), Err(OptionError::Hidden));
    assert_eq!(film.value_as_string(), Err(OptionError::Hidden));

    let button = registry.by_name_mut("scan").unwrap();
    assert_eq!(button.set_f64(1.0), Err(OptionError::ReadOnly));
}

#[test]
fn automatic_values_are_left_to_the_device() {
    let mut registry = registry();

    let brightness = registry.by_name_mut("brightness").unwrap();
    brightness.set_f64(40.0).unwrap();
    let effects = brightness.set_auto().unwrap();
    assert!(effects.changed);
    assert_eq!(brightness.value_as_f64().unwrap(), 0.0);

    let depth = registry.by_name_mut("depth").unwrap();
    assert_eq!(depth.set_auto(), Err(OptionError::ReadOnly));
}
