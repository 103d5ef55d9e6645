use pulsecompiler_backend::*;
use pulsectrl_backend::*;

fn live_pulser(config: ProgramConfig) -> (Pulser, RecordingTransport) {
    let handle = RecordingTransport::new();
    let bus = BusConfig {
        max_write: 64,
        check_errors: false,
    };
    let mut pulser =
        Pulser::new(config, RunMode::Experiment, bus, Box::new(handle.clone())).unwrap();
    pulser.set_timebase(10e-9).unwrap();
    (pulser, handle)
}

fn add_pulse(pulser: &mut Pulser, num: i64, kind: FunctionKind, pos: f64, len: f64) {
    pulser.new_pulse(num).unwrap();
    pulser.set_pulse_function(num, kind).unwrap();
    pulser.set_pulse_position(num, pos).unwrap();
    pulser.set_pulse_length(num, len).unwrap();
}

#[test]
fn bitmap_program_over_the_bus() {
    let (mut pulser, handle) = live_pulser(ProgramConfig::default());
    pulser.assign_channel(FunctionKind::Mw, 0).unwrap();
    pulser.assign_channel(FunctionKind::PulseShape, 1).unwrap();
    pulser
        .auto_shape_pulses(FunctionKind::Mw, Some(50e-9), Some(50e-9))
        .unwrap();
    add_pulse(&mut pulser, 1, FunctionKind::Mw, 1000e-9, 200e-9);
    pulser.start().unwrap();
    pulser.open().unwrap();

    pulser.update().unwrap();
    // MW gets the first line, the shape companion the second
    assert_eq!(handle.text(), "DATA 0,0,100,20,1\nDATA 0,1,95,30,1\n");

    handle.clear();
    assert!(pulser.update().unwrap().is_empty());
    assert!(handle.writes().is_empty());
}

#[test]
fn delay_chain_program_over_the_bus() {
    let mut config = ProgramConfig::default();
    config.family = HardwareFamily::DelayChain;
    let (mut pulser, handle) = live_pulser(config);
    pulser.assign_channel(FunctionKind::Mw, 0).unwrap();
    add_pulse(&mut pulser, 1, FunctionKind::Mw, 1000e-9, 200e-9);
    pulser.set_pulse_length_change(1, 10e-9).unwrap();
    pulser.start().unwrap();
    pulser.open().unwrap();

    pulser.update().unwrap();
    assert_eq!(handle.text(), "DEL MW,0,100\nDEL MW,1,20\n");

    handle.clear();
    pulser.increment_pulses(None).unwrap();
    pulser.update().unwrap();
    assert_eq!(handle.text(), "DEL MW,1,21\n");

    // Switching the pulse off disables both elements
    handle.clear();
    pulser.change_pulse_length(1, 0.).unwrap();
    pulser.update().unwrap();
    assert_eq!(handle.text(), "DIS MW,0\nDIS MW,1\n");
}

#[test]
fn rejected_update_writes_nothing() {
    let (mut pulser, handle) = live_pulser(ProgramConfig::default());
    pulser.assign_channel(FunctionKind::Mw, 0).unwrap();
    add_pulse(&mut pulser, 1, FunctionKind::Mw, 0., 100e-9);
    add_pulse(&mut pulser, 2, FunctionKind::Mw, 50e-9, 100e-9);
    pulser.start().unwrap();
    pulser.open().unwrap();
    assert!(matches!(
        pulser.update(),
        Err(PulseError::Overlap { first: 1, second: 2, .. })
    ));
    assert!(handle.writes().is_empty());

    // Recoverable errors in a live run leave the pulse alone
    assert!(!pulser.change_pulse_position(2, -10e-9).unwrap());
    assert!(pulser.change_pulse_position(2, 100e-9).unwrap());
    pulser.update().unwrap();
    assert_eq!(handle.text(), "DATA 0,0,0,20,1\n");
}

#[test]
fn long_updates_are_batched() {
    let (mut pulser, handle) = live_pulser(ProgramConfig::default());
    pulser.assign_channel(FunctionKind::Mw, 0).unwrap();
    for num in 0..10 {
        add_pulse(&mut pulser, num, FunctionKind::Mw, num as f64 * 200e-9, 100e-9);
    }
    pulser.start().unwrap();
    pulser.open().unwrap();
    assert_eq!(pulser.update().unwrap().len(), 10);
    let writes = handle.writes();
    assert!(writes.len() > 1);
    assert!(writes.iter().all(|w| w.len() <= 64));
    assert_eq!(handle.text().lines().count(), 10);
}
