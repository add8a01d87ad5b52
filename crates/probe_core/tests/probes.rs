use probe_core::equation_engine::EquationSystem;
use probe_core::simulation::{simulate, SimulationSettings, StepperKind};
use probe_core::source::{ExpressionQuantity, StateRate, StateValue};
use probe_core::{ErrorCategory, Probe, ProbeConfig, ProbeError, Stage, SystemBuilder};
use std::rc::Rc;

fn config(operation: &str, parameter: f64) -> ProbeConfig {
    ProbeConfig {
        operation: operation.to_string(),
        operation_parameter: parameter,
        ..ProbeConfig::default()
    }
}

/// Falling body: h' = v, v' = -g.
fn falling_body() -> EquationSystem {
    EquationSystem::compile(&["h", "v"], &["g"], &[9.81], &["v", "-g"]).expect("compile")
}

#[test]
fn probes_report_through_a_simulation() {
    let speed: Rc<ExpressionQuantity> = Rc::new(
        ExpressionQuantity::compile("v * v", &["h", "v"], &[]).expect("compile"),
    );
    let mut probes = vec![
        Probe::new("h", Rc::new(StateValue(0))),
        Probe::from_config("v", Rc::new(StateValue(1)), config("integrate", 100.0)),
        Probe::from_config("h", Rc::new(StateValue(0)), config("differentiate", 0.0)),
        Probe::from_config("v2", speed, config("scale", 0.5)),
        Probe::from_config(
            "hidden",
            Rc::new(StateValue(0)),
            ProbeConfig {
                disabled: true,
                ..ProbeConfig::default()
            },
        ),
    ];

    let mut builder = SystemBuilder::new(falling_body());
    for probe in &mut probes {
        probe.realize(&mut builder).expect("realize");
    }
    let system = builder.build();
    assert_eq!(system.num_probe_states(), 1);

    let mut state = system.default_state(0.0, &[100.0, 0.0]).expect("state");
    let settings = SimulationSettings {
        dt: 0.01,
        steps: 100,
        report_interval: 10,
        stepper: StepperKind::Rk4,
    };
    let report = simulate(&system, &mut state, &probes, &settings).expect("simulate");

    assert_eq!(
        report.labels,
        vec!["h", "v_integrate", "h_differentiate", "v2_scale_0.500000X"]
    );
    assert_eq!(report.len(), 11);

    // After one second: h = 100 - g/2, v = -g.
    let g = 9.81;
    let last = report.rows.last().expect("row");
    assert!((last[0] - (100.0 - 0.5 * g)).abs() < 1e-9);
    // The integral of v with initial condition 100 equals h.
    assert!((last[1] - last[0]).abs() < 1e-9);
    assert!((last[2] + g).abs() < 1e-9);
    assert!((last[3] - 0.5 * g * g).abs() < 1e-9);

    let json = serde_json::to_string(&report).expect("serialize");
    assert!(json.contains("v_integrate"));
}

#[test]
fn every_operation_needs_realization_first() {
    let system = SystemBuilder::new(falling_body()).build();
    let mut state = system.default_state(0.0, &[1.0, 0.0]).expect("state");
    system.realize(&mut state, Stage::Report).expect("realize");
    for operation in ["", "integrate", "differentiate", "scale"] {
        let probe = Probe::from_config("M1", Rc::new(StateValue(0)), config(operation, 2.0));
        let err = probe.current_value(&state).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Precondition);
    }
}

#[test]
fn unknown_operation_names_the_legal_set() {
    let mut probe = Probe::from_config("M1", Rc::new(StateValue(0)), config("bogus", 0.0));
    let mut builder = SystemBuilder::new(falling_body());
    let err = probe.realize(&mut builder).unwrap_err();
    assert!(matches!(err, ProbeError::InvalidOperation { .. }));
    let message = err.to_string();
    assert!(message.contains("Probe 'M1'"), "{message}");
    assert!(message.contains("'bogus'"), "{message}");
    assert!(
        message.contains("'', 'integrate', 'differentiate', 'scale'"),
        "{message}"
    );
    assert!(!probe.is_realized());
    assert_eq!(builder.build().total_dimension(), 2);
}

#[test]
fn probe_config_round_trips_through_json() {
    let json = r#"{"disabled": false, "operation": "integrate", "operation_parameter": 1.5}"#;
    let config: ProbeConfig = serde_json::from_str(json).expect("parse");
    let probe = Probe::from_config("M1", Rc::new(StateValue(0)), config.clone());
    assert_eq!(probe.record_label(), "M1_integrate");
    let value = serde_json::to_value(&config).expect("serialize");
    assert_eq!(value["operation"], "integrate");
    assert_eq!(value["operation_parameter"], 1.5);
}

#[test]
fn model_parameters_feed_probe_values() {
    let mut model = falling_body();
    model.set_param("g", 2.0).expect("known parameter");
    assert!(model.set_param("mass", 1.0).is_err());

    let mut probe = Probe::from_config("a", Rc::new(StateRate(1)), config("scale", -1.0));
    let mut builder = SystemBuilder::new(model);
    probe.realize(&mut builder).expect("realize");
    let system = builder.build();
    let mut state = system.default_state(0.0, &[0.0, 0.0]).expect("state");
    system.realize(&mut state, Stage::Acceleration).expect("realize");
    assert_eq!(probe.current_value(&state), Ok(2.0));
}

#[test]
fn quantities_must_fit_the_model_at_build_time() {
    let expression = ExpressionQuantity::compile("z", &["x", "y", "z"], &[]).expect("compile");
    let mut probe = Probe::from_config("z", Rc::new(expression), config("integrate", 0.0));
    let mut builder = SystemBuilder::new(falling_body());
    let err = probe.realize(&mut builder).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert!(err.to_string().contains("reads 3 model coordinates"), "{err}");
    let system = builder.build();
    assert_eq!(system.num_probe_states(), 0);
}
