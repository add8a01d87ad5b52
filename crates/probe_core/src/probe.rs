use crate::error::ProbeError;
use crate::operator::{OperationKind, OperatorStage};
use crate::source::{DerivedQuantitySource, Quantity};
use crate::stage::Stage;
use crate::state::State;
use crate::system::SystemBuilder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;

/// Configurable properties of a probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Whether the probe is disabled. Disabled probes are not reported.
    pub disabled: bool,
    /// The operation to perform on the probe value: `""` (no operation,
    /// just return the probe value), `"integrate"`, `"differentiate"`,
    /// `"scale"`.
    pub operation: String,
    /// For `"integrate"`, the initial condition; for `"scale"`, the scale
    /// factor. Unused otherwise.
    pub operation_parameter: f64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            operation: String::new(),
            operation_parameter: 0.0,
        }
    }
}

/// Configuration, realization, and reporting façade over one operator stage.
pub struct Probe {
    name: String,
    config: ProbeConfig,
    quantity: Rc<dyn Quantity>,
    operator: Option<OperatorStage>,
}

impl Probe {
    pub const CLASS_NAME: &'static str = "Probe";

    pub fn new(name: impl Into<String>, quantity: Rc<dyn Quantity>) -> Self {
        Self::from_config(name, quantity, ProbeConfig::default())
    }

    pub fn from_config(
        name: impl Into<String>,
        quantity: Rc<dyn Quantity>,
        config: ProbeConfig,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            quantity,
            operator: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn is_disabled(&self) -> bool {
        self.config.disabled
    }

    pub fn operation(&self) -> &str {
        &self.config.operation
    }

    pub fn operation_parameter(&self) -> f64 {
        self.config.operation_parameter
    }

    pub fn is_realized(&self) -> bool {
        self.operator.is_some()
    }

    /// The realized operator stage, if any.
    pub fn operator(&self) -> Option<&OperatorStage> {
        self.operator.as_ref()
    }

    pub fn configure(
        &mut self,
        disabled: bool,
        operation: impl Into<String>,
        operation_parameter: f64,
    ) -> Result<(), ProbeError> {
        let config = self.config_mut()?;
        config.disabled = disabled;
        config.operation = operation.into();
        config.operation_parameter = operation_parameter;
        Ok(())
    }

    pub fn set_disabled(&mut self, disabled: bool) -> Result<(), ProbeError> {
        self.config_mut()?.disabled = disabled;
        Ok(())
    }

    pub fn set_operation(&mut self, operation: impl Into<String>) -> Result<(), ProbeError> {
        self.config_mut()?.operation = operation.into();
        Ok(())
    }

    pub fn set_operation_parameter(&mut self, operation_parameter: f64) -> Result<(), ProbeError> {
        self.config_mut()?.operation_parameter = operation_parameter;
        Ok(())
    }

    fn config_mut(&mut self) -> Result<&mut ProbeConfig, ProbeError> {
        if self.operator.is_some() {
            return Err(ProbeError::ConfigurationLocked {
                name: self.name.clone(),
            });
        }
        Ok(&mut self.config)
    }

    /// Binds the configured operation to the host being built. On an
    /// unrecognized operation, or a quantity reading past the model
    /// coordinates, nothing is reserved and the probe stays unrealized.
    pub fn realize<M>(&mut self, builder: &mut SystemBuilder<M>) -> Result<(), ProbeError> {
        if self.operator.is_some() {
            return Err(ProbeError::AlreadyRealized {
                name: self.name.clone(),
            });
        }
        let kind = OperationKind::parse(&self.config.operation).ok_or_else(|| {
            ProbeError::InvalidOperation {
                component: Self::CLASS_NAME,
                name: self.name.clone(),
                operation: self.config.operation.clone(),
            }
        })?;
        let source = DerivedQuantitySource::new(Rc::clone(&self.quantity));
        if source.required_dimension() > builder.model_dimension() {
            return Err(ProbeError::QuantityOutOfRange {
                component: Self::CLASS_NAME,
                name: self.name.clone(),
                required: source.required_dimension(),
                available: builder.model_dimension(),
            });
        }
        let stage = OperatorStage::realize(kind, self.config.operation_parameter, source, builder);
        tracing::debug!(
            probe = %self.name,
            operation = kind.as_str(),
            parameter = self.config.operation_parameter,
            states = stage.num_state_variables_introduced(),
            "probe realized"
        );
        self.operator = Some(stage);
        Ok(())
    }

    fn realized(&self) -> Result<&OperatorStage, ProbeError> {
        self.operator.as_ref().ok_or_else(|| ProbeError::NotRealized {
            name: self.name.clone(),
        })
    }

    pub fn required_stage(&self) -> Result<Stage, ProbeError> {
        Ok(self.realized()?.required_stage())
    }

    /// The value after the operation. Fails before realization, while
    /// disabled, and before the operator's required stage.
    pub fn current_value(&self, state: &State) -> Result<f64, ProbeError> {
        let stage = self.realized()?;
        if self.config.disabled {
            return Err(ProbeError::Disabled {
                name: self.name.clone(),
            });
        }
        stage.current_value(state)
    }

    /// Column label: `name`, `name_scale_<factor>X`, or `name_<operation>`.
    pub fn record_label(&self) -> String {
        match OperationKind::parse(&self.config.operation) {
            Some(OperationKind::Identity) => self.name.clone(),
            Some(OperationKind::Scale) => format!(
                "{}_scale_{:.6}X",
                self.name, self.config.operation_parameter
            ),
            _ => format!("{}_{}", self.name, self.config.operation),
        }
    }

    pub fn record_labels(&self) -> Vec<String> {
        vec![self.record_label()]
    }

    /// Values matching [`record_labels`](Self::record_labels).
    pub fn record_values(&self, state: &State) -> Result<Vec<f64>, ProbeError> {
        Ok(vec![self.current_value(state)?])
    }

    /// The configuration to persist as defaults for `state`. Probe
    /// properties are not state-dependent, so each field keeps its own
    /// value: the operation string stays in `operation` and the parameter
    /// is left as configured.
    pub fn defaults_from_state(&self, _state: &State) -> ProbeConfig {
        self.config.clone()
    }
}

/// Clones configuration and quantity; the clone is unrealized, since a
/// realized operator owns its reserved coordinate exclusively.
impl Clone for Probe {
    fn clone(&self) -> Self {
        Self::from_config(self.name.clone(), Rc::clone(&self.quantity), self.config.clone())
    }
}

impl fmt::Debug for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Probe")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("operator", &self.operator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Probe, ProbeConfig};
    use crate::autodiff::Dual;
    use crate::error::{ErrorCategory, ProbeError};
    use crate::operator::LEGAL_OPERATIONS;
    use crate::source::{ExpressionQuantity, ProbeQuantity, Quantity, Sample, StateRate, StateValue};
    use crate::stage::Stage;
    use crate::system::{HostSystem, SystemBuilder};
    use crate::traits::{DynamicalSystem, Scalar};
    use std::cell::Cell;
    use std::rc::Rc;

    /// x' = rate
    struct Ramp {
        rate: f64,
    }

    impl<T: Scalar> DynamicalSystem<T> for Ramp {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, _t: T, _x: &[T], out: &mut [T]) {
            out[0] = T::lift(self.rate);
        }
    }

    /// Reads `x` and counts real and dual evaluations.
    #[derive(Default)]
    struct CountingQuantity {
        real: Cell<usize>,
        dual: Cell<usize>,
    }

    impl CountingQuantity {
        fn counts(&self) -> (usize, usize) {
            (self.real.get(), self.dual.get())
        }
    }

    impl ProbeQuantity<f64> for CountingQuantity {
        fn evaluate(&self, sample: &Sample<'_, f64>) -> f64 {
            self.real.set(self.real.get() + 1);
            sample.y[0]
        }

        fn required_dimension(&self) -> usize {
            1
        }
    }

    impl ProbeQuantity<Dual> for CountingQuantity {
        fn evaluate(&self, sample: &Sample<'_, Dual>) -> Dual {
            self.dual.set(self.dual.get() + 1);
            sample.y[0]
        }

        fn required_dimension(&self) -> usize {
            1
        }
    }

    fn probe(name: &str, operation: &str, parameter: f64) -> Probe {
        let config = ProbeConfig {
            operation: operation.to_string(),
            operation_parameter: parameter,
            ..ProbeConfig::default()
        };
        Probe::from_config(name, Rc::new(StateValue(0)), config)
    }

    fn realized(mut probe: Probe, rate: f64) -> (Probe, HostSystem<Ramp>) {
        let mut builder = SystemBuilder::new(Ramp { rate });
        probe.realize(&mut builder).expect("realize");
        (probe, builder.build())
    }

    #[test]
    fn defaults_match_an_unconfigured_probe() {
        let probe = Probe::new("M1", Rc::new(StateValue(0)));
        assert!(!probe.is_disabled());
        assert_eq!(probe.operation(), "");
        assert_eq!(probe.operation_parameter(), 0.0);
        assert!(!probe.is_realized());
    }

    #[test]
    fn record_labels_follow_operation() {
        assert_eq!(probe("M1", "", 0.0).record_label(), "M1");
        assert_eq!(probe("M1", "scale", 2.0).record_label(), "M1_scale_2.000000X");
        assert_eq!(probe("M1", "scale", -0.5).record_label(), "M1_scale_-0.500000X");
        assert_eq!(probe("M1", "integrate", 1.0).record_label(), "M1_integrate");
        assert_eq!(probe("M1", "differentiate", 0.0).record_label(), "M1_differentiate");
        let p = probe("M1", "scale", 2.0);
        assert_eq!(p.record_label(), p.record_label());
        assert_eq!(p.record_labels(), vec!["M1_scale_2.000000X".to_string()]);
    }

    #[test]
    fn bogus_operation_is_a_configuration_error() {
        let mut p = probe("M1", "bogus", 0.0);
        let mut builder = SystemBuilder::new(Ramp { rate: 1.0 });
        let err = p.realize(&mut builder).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert!(err.to_string().contains("'bogus'"));
        assert!(!p.is_realized());
        let system = builder.build();
        assert_eq!(system.num_probe_states(), 0);
        assert_eq!(system.total_dimension(), 1);
    }

    #[test]
    fn current_value_before_realize_is_a_precondition_violation() {
        let system = SystemBuilder::new(Ramp { rate: 1.0 }).build();
        let mut state = system.default_state(0.0, &[1.0]).expect("state");
        system.realize(&mut state, Stage::Report).expect("realize");
        for op in LEGAL_OPERATIONS {
            let err = probe("M1", op, 1.0).current_value(&state).unwrap_err();
            assert_eq!(err, ProbeError::NotRealized { name: "M1".into() });
            assert_eq!(err.category(), ErrorCategory::Precondition);
        }
    }

    #[test]
    fn realize_twice_and_late_configuration_are_usage_errors() {
        let (mut p, _system) = realized(probe("M1", "scale", 2.0), 1.0);
        let mut builder = SystemBuilder::new(Ramp { rate: 1.0 });
        let err = p.realize(&mut builder).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Usage);
        assert_eq!(
            p.set_operation("integrate"),
            Err(ProbeError::ConfigurationLocked { name: "M1".into() })
        );
        assert!(p.configure(true, "", 0.0).is_err());
        assert!(p.set_operation_parameter(3.0).is_err());
        assert!(p.set_disabled(true).is_err());
        assert_eq!(p.operation(), "scale");
    }

    #[test]
    fn disabled_probes_report_no_value() {
        let mut p = probe("M1", "", 0.0);
        p.set_disabled(true).expect("configure");
        let (p, system) = realized(p, 1.0);
        let mut state = system.default_state(0.0, &[1.0]).expect("state");
        system.realize(&mut state, Stage::Report).expect("realize");
        assert_eq!(
            p.current_value(&state),
            Err(ProbeError::Disabled { name: "M1".into() })
        );
    }

    #[test]
    fn identity_and_scale_transform_the_source() {
        for k in [2.0, 0.0, -3.5] {
            let mut builder = SystemBuilder::new(Ramp { rate: 1.0 });
            let mut id = probe("a", "", 0.0);
            let mut scale = probe("b", "scale", k);
            id.realize(&mut builder).expect("realize");
            scale.realize(&mut builder).expect("realize");
            let system = builder.build();
            let mut state = system.default_state(0.0, &[4.0]).expect("state");
            system.realize(&mut state, Stage::Acceleration).expect("realize");
            assert_eq!(id.current_value(&state), Ok(4.0));
            assert_eq!(scale.current_value(&state), Ok(k * 4.0));
        }
    }

    #[test]
    fn values_before_required_stage_fail() {
        let (p, system) = realized(probe("M1", "scale", 2.0), 1.0);
        let mut state = system.default_state(0.0, &[4.0]).expect("state");
        system.realize(&mut state, Stage::Dynamics).expect("realize");
        assert_eq!(
            p.current_value(&state),
            Err(ProbeError::StageNotReached {
                required: Stage::Acceleration,
                current: Stage::Dynamics,
            })
        );
        assert_eq!(p.required_stage(), Ok(Stage::Acceleration));
    }

    #[test]
    fn integrate_introduces_one_coordinate_with_initial_condition() {
        let (p, system) = realized(probe("M1", "integrate", 1.25), 1.0);
        let operator = p.operator().expect("operator");
        assert_eq!(operator.num_state_variables_introduced(), 1);
        assert_eq!(operator.required_stage(), Stage::Time);
        assert_eq!(system.num_probe_states(), 1);
        let mut state = system.default_state(0.0, &[0.0]).expect("state");
        assert!(p.current_value(&state).is_err());
        system.realize(&mut state, Stage::Time).expect("realize");
        assert_eq!(p.current_value(&state), Ok(1.25));
        assert_eq!(state.upd_model_y().len(), 1);
    }

    #[test]
    fn source_is_evaluated_once_per_realization() {
        // x' = 1; (operation, value at x = 2, value at x = 3, evaluations per realization)
        let cases = [
            ("", 2.0, 3.0, (1, 0)),
            ("scale", 4.0, 6.0, (1, 0)),
            ("differentiate", 1.0, 1.0, (0, 1)),
        ];
        for (operation, before, after, (real, dual)) in cases {
            let quantity = Rc::new(CountingQuantity::default());
            let config = ProbeConfig {
                operation: operation.to_string(),
                operation_parameter: 2.0,
                ..ProbeConfig::default()
            };
            let mut p = Probe::from_config("M1", quantity.clone(), config);
            let mut builder = SystemBuilder::new(Ramp { rate: 1.0 });
            p.realize(&mut builder).expect("realize");
            let system = builder.build();
            let mut state = system.default_state(0.0, &[2.0]).expect("state");
            system.realize(&mut state, Stage::Report).expect("realize");

            let first = p.current_value(&state).expect("value");
            let second = p.current_value(&state).expect("value");
            assert_eq!(first.to_bits(), second.to_bits(), "operation '{operation}'");
            assert_eq!(first, before, "operation '{operation}'");
            assert_eq!(quantity.counts(), (real, dual), "operation '{operation}'");

            state.upd_model_y()[0] = 3.0;
            system.realize(&mut state, Stage::Report).expect("realize");
            assert_eq!(p.current_value(&state), Ok(after), "operation '{operation}'");
            assert_eq!(p.current_value(&state), Ok(after), "operation '{operation}'");
            assert_eq!(quantity.counts(), (2 * real, 2 * dual), "operation '{operation}'");
        }
    }

    #[test]
    fn quantities_reading_past_the_model_are_configuration_errors() {
        let expression = ExpressionQuantity::compile("z", &["x", "y", "z"], &[]).expect("compile");
        let quantities: [(Rc<dyn Quantity>, usize); 3] = [
            (Rc::new(StateValue(3)), 4),
            (Rc::new(StateRate(1)), 2),
            (Rc::new(expression), 3),
        ];
        for (quantity, required) in quantities {
            for operation in LEGAL_OPERATIONS {
                let config = ProbeConfig {
                    operation: operation.to_string(),
                    ..ProbeConfig::default()
                };
                let mut p = Probe::from_config("M1", Rc::clone(&quantity), config);
                let mut builder = SystemBuilder::new(Ramp { rate: 1.0 });
                let err = p.realize(&mut builder).unwrap_err();
                assert_eq!(
                    err,
                    ProbeError::QuantityOutOfRange {
                        component: Probe::CLASS_NAME,
                        name: "M1".into(),
                        required,
                        available: 1,
                    }
                );
                assert_eq!(err.category(), ErrorCategory::Configuration);
                assert!(!p.is_realized());
                let system = builder.build();
                assert_eq!(system.num_probe_states(), 0);
                assert_eq!(system.num_cache_entries(), 0);
            }
        }
    }

    #[test]
    fn clones_are_unrealized_copies_of_the_configuration() {
        let (p, _) = realized(probe("M1", "integrate", 2.0), 1.0);
        let copy = p.clone();
        assert!(!copy.is_realized());
        assert_eq!(copy.config(), p.config());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: ProbeConfig =
            serde_json::from_str(r#"{"operation": "scale", "operation_parameter": 2.0}"#)
                .expect("parse");
        assert!(!config.disabled);
        let p = Probe::from_config("M1", Rc::new(StateValue(0)), config);
        assert_eq!(p.record_label(), "M1_scale_2.000000X");
        let empty: ProbeConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(empty, ProbeConfig::default());
    }

    #[test]
    fn defaults_keep_operation_and_parameter_separate() {
        let (p, system) = realized(probe("M1", "integrate", 2.0), 1.0);
        let state = system.default_state(0.0, &[0.0]).expect("state");
        let defaults = p.defaults_from_state(&state);
        assert_eq!(defaults.operation, "integrate");
        assert_eq!(defaults.operation_parameter, 2.0);
    }
}
