use pulsecompiler_backend::*;

fn program(mode: RunMode) -> PulseProgram {
    let mut prog = PulseProgram::new(ProgramConfig::default(), mode).unwrap();
    prog.set_timebase(10e-9).unwrap();
    prog.assign_channel(FunctionKind::Mw, 0).unwrap();
    prog
}

fn add_pulse(prog: &mut PulseProgram, num: i64, kind: FunctionKind, pos: f64, len: f64) {
    prog.new_pulse(num).unwrap();
    prog.set_pulse_function(num, kind).unwrap();
    prog.set_pulse_position(num, pos).unwrap();
    prog.set_pulse_length(num, len).unwrap();
}

#[test]
fn simple_pulse_in_ticks() {
    let mut prog = program(RunMode::Test);
    add_pulse(&mut prog, 1, FunctionKind::Mw, 1000e-9, 200e-9);

    let pulse = prog.state().store().get(1).unwrap();
    assert_eq!(pulse.pos(), Some(100));
    assert_eq!(pulse.len(), Some(20));
    assert!(pulse.is_active());

    prog.start().unwrap();
    let ops = prog.update().unwrap();
    assert_eq!(ops.len(), 1);
    let image = prog.channel_image(0).unwrap();
    assert_eq!(image[[0, 99]], 0);
    assert_eq!(image[[0, 100]], 1);
    assert_eq!(image[[0, 119]], 1);
    assert_eq!(image[[0, 120]], 0);
}

#[test]
fn zero_length_pulse_is_not_programmed() {
    let mut prog = program(RunMode::Test);
    add_pulse(&mut prog, 1, FunctionKind::Mw, 1000e-9, 0.);
    assert!(!prog.state().store().get(1).unwrap().is_active());

    prog.start().unwrap();
    assert!(prog.update().unwrap().is_empty());
    assert_eq!(prog.channel_address(0), None);

    // Switching it on later allocates the line
    assert!(prog.change_pulse_length(1, 200e-9).unwrap());
    assert_eq!(prog.update().unwrap().len(), 1);
    assert_eq!(
        prog.channel_address(0),
        Some(ChannelAddr::Bitmap { field: 0, bit: 0 })
    );
}

#[test]
fn shape_companion_with_explicit_padding() {
    let mut prog = program(RunMode::Test);
    prog.assign_channel(FunctionKind::PulseShape, 1).unwrap();
    prog.auto_shape_pulses(FunctionKind::Mw, Some(50e-9), Some(50e-9))
        .unwrap();
    add_pulse(&mut prog, 1, FunctionKind::Mw, 1000e-9, 200e-9);
    prog.start().unwrap();
    prog.update().unwrap();

    let store = prog.state().store();
    let companion = store.get(1).unwrap().shape_companion().unwrap();
    let shape = store.get(companion).unwrap();
    assert!(shape.is_companion());
    assert_eq!(shape.pos(), Some(95));
    assert_eq!(shape.len(), Some(30));
    assert_eq!(shape.function(), Some(FunctionKind::PulseShape));

    // Companions follow their primary
    prog.change_pulse_position(1, 2000e-9).unwrap();
    prog.update().unwrap();
    let store = prog.state().store();
    assert_eq!(store.get(companion).unwrap().pos(), Some(195));
}

#[test]
fn touching_pulses_pass_overlapping_fail() {
    let mut prog = program(RunMode::Test);
    add_pulse(&mut prog, 1, FunctionKind::Mw, 0., 100e-8);
    add_pulse(&mut prog, 2, FunctionKind::Mw, 100e-8, 50e-8);
    prog.start().unwrap();
    prog.update().unwrap();

    prog.change_pulse_length(1, 101e-8).unwrap();
    match prog.update() {
        Err(PulseError::Overlap {
            function,
            first,
            second,
        }) => {
            assert_eq!(function, "MW");
            assert_eq!(first, 1);
            assert_eq!(second, 2);
        }
        other => panic!("expected an overlap, got {:?}", other),
    }
    // The committed image is the one of the first update
    let image = prog.channel_image(0).unwrap();
    assert_eq!(image[[0, 149]], 1);
    assert_eq!(image[[0, 150]], 0);
}

#[test]
fn negative_change_in_experiment_mode() {
    let mut prog = program(RunMode::Experiment);
    add_pulse(&mut prog, 1, FunctionKind::Mw, 1000e-9, 200e-9);
    prog.start().unwrap();
    prog.update().unwrap();

    assert!(!prog.change_pulse_position(1, -100e-9).unwrap());
    assert!((prog.get_pulse_position(1).unwrap() - 1000e-9).abs() < 1e-15);
    assert!(prog.update().unwrap().is_empty());
}

#[test]
fn phase_cycled_detection() {
    let mut prog = program(RunMode::Test);
    prog.assign_channel(FunctionKind::Detection, 4).unwrap();
    prog.assign_channel(FunctionKind::Detection, 5).unwrap();
    prog.set_phase_setup(FunctionKind::Detection, Phase::PlusX, 4)
        .unwrap();
    prog.set_phase_setup(FunctionKind::Detection, Phase::MinusX, 5)
        .unwrap();
    let phases = parse_phase_sequence(&["+x", "-x", "+x", "-x"]).unwrap();
    prog.set_phase_sequence(0, phases).unwrap();

    add_pulse(&mut prog, 1, FunctionKind::Mw, 0., 100e-9);
    add_pulse(&mut prog, 2, FunctionKind::Detection, 200e-9, 100e-9);
    prog.set_pulse_phase_cycle(2, 0).unwrap();
    prog.start().unwrap();
    prog.update().unwrap();

    let mw = prog.channel_image(0).unwrap();
    let plus = prog.channel_image(4).unwrap();
    let minus = prog.channel_image(5).unwrap();
    assert_eq!(mw.nrows(), 4);
    for row in 0..4 {
        // Uncycled pulses repeat on every row
        assert_eq!(mw[[row, 0]], 1);
        assert_eq!(plus[[row, 20]], u8::from(row % 2 == 0));
        assert_eq!(minus[[row, 20]], u8::from(row % 2 == 1));
    }
}

#[test]
fn undeclared_phase_is_rejected() {
    let mut prog = program(RunMode::Test);
    prog.assign_channel(FunctionKind::Mw, 1).unwrap();
    prog.set_phase_setup(FunctionKind::Mw, Phase::PlusX, 0).unwrap();
    prog.set_phase_setup(FunctionKind::Mw, Phase::MinusX, 1).unwrap();
    prog.set_phase_sequence(3, vec![Phase::PlusX, Phase::PlusY])
        .unwrap();
    add_pulse(&mut prog, 1, FunctionKind::Mw, 0., 100e-9);
    prog.set_pulse_phase_cycle(1, 3).unwrap();
    prog.start().unwrap();
    assert!(matches!(
        prog.update(),
        Err(PulseError::UndeclaredPhase { num: 1, .. })
    ));
}

#[test]
fn delay_chain_family() {
    let mut config = ProgramConfig::default();
    config.family = HardwareFamily::DelayChain;
    let mut prog = PulseProgram::new(config, RunMode::Test).unwrap();
    prog.set_timebase(10e-9).unwrap();
    prog.assign_channel(FunctionKind::Mw, 0).unwrap();
    assert!(prog.set_phase_setup(FunctionKind::Mw, Phase::PlusX, 0).is_err());

    add_pulse(&mut prog, 1, FunctionKind::Mw, 1000e-9, 200e-9);
    prog.set_pulse_position_change(1, 100e-9).unwrap();
    prog.start().unwrap();
    let ops = prog.update().unwrap();
    assert_eq!(
        ops,
        vec![
            HardwareOp::SetElement {
                function: FunctionKind::Mw,
                index: 0,
                ticks: 100
            },
            HardwareOp::SetElement {
                function: FunctionKind::Mw,
                index: 1,
                ticks: 20
            },
        ]
    );
    assert_eq!(prog.channel_address(0), Some(ChannelAddr::Chain { position: 0 }));

    prog.shift_pulses(None).unwrap();
    assert_eq!(
        prog.update().unwrap(),
        vec![HardwareOp::SetElement {
            function: FunctionKind::Mw,
            index: 0,
            ticks: 110
        }]
    );
}

#[test]
fn delay_chain_without_length_elements() {
    let mut config = ProgramConfig::default();
    config.family = HardwareFamily::DelayChain;
    config.delay_chain.has_length_element = false;
    let mut prog = PulseProgram::new(config, RunMode::Test).unwrap();
    prog.set_timebase(10e-9).unwrap();
    prog.assign_channel(FunctionKind::Mw, 0).unwrap();
    add_pulse(&mut prog, 1, FunctionKind::Mw, 1000e-9, 200e-9);
    add_pulse(&mut prog, 2, FunctionKind::Mw, 3000e-9, 200e-9);
    prog.start().unwrap();
    assert_eq!(
        prog.update().unwrap(),
        vec![
            HardwareOp::SetElement {
                function: FunctionKind::Mw,
                index: 0,
                ticks: 100
            },
            HardwareOp::SetElement {
                function: FunctionKind::Mw,
                index: 1,
                ticks: 200
            },
            HardwareOp::SetLength {
                function: FunctionKind::Mw,
                ticks: 20
            },
        ]
    );

    assert!(prog.change_pulse_length(2, 500e-9).unwrap());
    assert_eq!(
        prog.update().unwrap(),
        vec![HardwareOp::SetLength {
            function: FunctionKind::Mw,
            ticks: 50
        }]
    );
    assert_eq!(prog.diagnostics().timing_shifts, 1);
}

#[test]
fn sequence_too_long() {
    let mut config = ProgramConfig::default();
    config.max_ticks = 1000;
    let mut prog = PulseProgram::new(config, RunMode::Test).unwrap();
    prog.set_timebase(10e-9).unwrap();
    prog.assign_channel(FunctionKind::Mw, 0).unwrap();
    add_pulse(&mut prog, 1, FunctionKind::Mw, 9000e-9, 2000e-9);
    prog.start().unwrap();
    assert!(matches!(
        prog.update(),
        Err(PulseError::SequenceTooLong {
            length: 1100,
            max: 1000,
            ..
        })
    ));
    assert_eq!(prog.channel_address(0), None);
}

#[test]
fn dump_file_records_updates() {
    let path = std::env::temp_dir().join(format!("pulse_dump_{}.txt", std::process::id()));
    let mut config = ProgramConfig::default();
    config.dump_file = Some(path.clone());
    let mut prog = PulseProgram::new(config, RunMode::Test).unwrap();
    prog.set_timebase(10e-9).unwrap();
    prog.assign_channel(FunctionKind::Mw, 0).unwrap();
    add_pulse(&mut prog, 1, FunctionKind::Mw, 1000e-9, 200e-9);
    prog.set_pulse_position_change(1, 100e-9).unwrap();
    prog.start().unwrap();
    prog.update().unwrap();
    prog.shift_pulses(None).unwrap();
    prog.update().unwrap();
    drop(prog);

    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(
        text,
        "TB: 0.00000001\nD: 0\n===\nMW:0 0\nMW:0 1 100 20\n\nMW:0 1 110 20\n\n"
    );
}

#[test]
fn yaml_config_drives_the_program() {
    let config = ProgramConfig::from_yaml(
        "family: bitmap\nfields: 1\nbits_per_field: 1\nviolation_policy: fail\n",
    )
    .unwrap();
    let mut prog = PulseProgram::new(config, RunMode::Test).unwrap();
    prog.set_timebase(10e-9).unwrap();
    prog.assign_channel(FunctionKind::Mw, 0).unwrap();
    prog.assign_channel(FunctionKind::Detection, 1).unwrap();
    add_pulse(&mut prog, 1, FunctionKind::Mw, 0., 100e-9);
    add_pulse(&mut prog, 2, FunctionKind::Detection, 200e-9, 100e-9);
    prog.start().unwrap();
    assert!(matches!(
        prog.update(),
        Err(PulseError::ResourceExhausted { .. })
    ));
}

#[test]
fn reset_restores_start_state() {
    let mut prog = program(RunMode::Test);
    add_pulse(&mut prog, 1, FunctionKind::Mw, 1000e-9, 200e-9);
    prog.set_pulse_length_change(1, 10e-9).unwrap();
    prog.start().unwrap();
    prog.update().unwrap();
    for _ in 0..3 {
        prog.increment_pulses(None).unwrap();
    }
    prog.update().unwrap();
    assert!((prog.get_pulse_length(1).unwrap() - 230e-9).abs() < 1e-15);

    prog.reset_pulses(None).unwrap();
    prog.reset_pulses(None).unwrap();
    assert!((prog.get_pulse_length(1).unwrap() - 200e-9).abs() < 1e-15);
    assert_eq!(prog.update().unwrap().len(), 1);
    assert!(prog.update().unwrap().is_empty());
}

#[test]
fn end_of_test_reports_never_active_pulses() {
    let mut prog = program(RunMode::Test);
    add_pulse(&mut prog, 1, FunctionKind::Mw, 0., 100e-9);
    add_pulse(&mut prog, 2, FunctionKind::Mw, 500e-9, 0.);
    prog.start().unwrap();
    prog.update().unwrap();
    let report = prog.end_of_test().unwrap();
    assert_eq!(report.never_active, vec![2]);
    assert!(report.counters.is_clean());
}
