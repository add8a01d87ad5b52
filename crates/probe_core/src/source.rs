use crate::autodiff::{self, Dual};
use crate::equation_engine::{
    compile_expression, owned, Bytecode, Compiler, ExpressionError, VmScalar, VmStacks,
};
use crate::error::ProbeError;
use crate::stage::Stage;
use crate::state::State;
use crate::traits::Scalar;
use std::fmt;
use std::rc::Rc;

/// Borrowed view of the model coordinates at one instant.
#[derive(Debug, Clone, Copy)]
pub struct Sample<'a, T> {
    pub t: T,
    pub y: &'a [T],
    pub ydot: &'a [T],
}

/// The probe's value computation: a pure function of `(t, y, ẏ)` of the
/// model coordinates, generic over [`Scalar`] so it can be evaluated with
/// `f64` for values and with [`Dual`] for time derivatives.
pub trait ProbeQuantity<T: Scalar> {
    fn evaluate(&self, sample: &Sample<'_, T>) -> T;

    /// Number of model coordinates `evaluate` may index into.
    fn required_dimension(&self) -> usize {
        0
    }
}

/// A quantity evaluable with both reals and duals. This is the object-safe
/// bound probes store.
pub trait Quantity: ProbeQuantity<f64> + ProbeQuantity<Dual> {}

impl<Q: ProbeQuantity<f64> + ProbeQuantity<Dual> + ?Sized> Quantity for Q {}

/// A model coordinate `y[i]`.
#[derive(Debug, Clone, Copy)]
pub struct StateValue(pub usize);

impl<T: Scalar> ProbeQuantity<T> for StateValue {
    fn evaluate(&self, sample: &Sample<'_, T>) -> T {
        sample.y[self.0]
    }

    fn required_dimension(&self) -> usize {
        self.0 + 1
    }
}

/// The rate of a model coordinate `ẏ[i]`.
#[derive(Debug, Clone, Copy)]
pub struct StateRate(pub usize);

impl<T: Scalar> ProbeQuantity<T> for StateRate {
    fn evaluate(&self, sample: &Sample<'_, T>) -> T {
        sample.ydot[self.0]
    }

    fn required_dimension(&self) -> usize {
        self.0 + 1
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Constant(pub f64);

impl<T: Scalar> ProbeQuantity<T> for Constant {
    fn evaluate(&self, _sample: &Sample<'_, T>) -> T {
        T::lift(self.0)
    }
}

/// A quantity written as an expression over coordinate names, their
/// `<name>_dot` rates, `t`, and named parameters.
#[derive(Debug, Clone)]
pub struct ExpressionQuantity {
    source: String,
    bytecode: Bytecode,
    params: Vec<f64>,
    dimension: usize,
    stacks: VmStacks,
}

impl ExpressionQuantity {
    pub fn compile(
        input: &str,
        var_names: &[&str],
        params: &[(&str, f64)],
    ) -> Result<Self, ExpressionError> {
        let param_names: Vec<&str> = params.iter().map(|(name, _)| *name).collect();
        let compiler = Compiler::with_rates(&owned(var_names), &owned(&param_names));
        Ok(Self {
            source: input.to_string(),
            bytecode: compile_expression(&compiler, input)?,
            params: params.iter().map(|(_, value)| *value).collect(),
            dimension: var_names.len(),
            stacks: VmStacks::default(),
        })
    }

    pub fn expression(&self) -> &str {
        &self.source
    }
}

impl<T: VmScalar> ProbeQuantity<T> for ExpressionQuantity {
    fn evaluate(&self, sample: &Sample<'_, T>) -> T {
        self.stacks.run(&self.bytecode, sample, &self.params)
    }

    fn required_dimension(&self) -> usize {
        self.dimension
    }
}

/// Read-only adapter from host state to a probe's raw, pre-operation value.
///
/// Holds no memo: the operator stage owns caching, since each operator
/// needs the raw value at different times.
#[derive(Clone)]
pub struct DerivedQuantitySource {
    quantity: Rc<dyn Quantity>,
}

impl fmt::Debug for DerivedQuantitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedQuantitySource")
            .field("required_stage", &self.required_stage())
            .finish()
    }
}

impl DerivedQuantitySource {
    /// Stage at which forces and accelerations are settled.
    pub const REQUIRED_STAGE: Stage = Stage::Acceleration;

    pub fn new(quantity: Rc<dyn Quantity>) -> Self {
        Self { quantity }
    }

    pub fn required_stage(&self) -> Stage {
        Self::REQUIRED_STAGE
    }

    /// Model coordinates the quantity reads; must not exceed the host's.
    pub fn required_dimension(&self) -> usize {
        ProbeQuantity::<f64>::required_dimension(&*self.quantity)
    }

    /// The raw value at `state`. Fails if `state` has not reached
    /// [`REQUIRED_STAGE`](Self::REQUIRED_STAGE).
    pub fn value(&self, state: &State) -> Result<f64, ProbeError> {
        let sample = state.sample()?;
        Ok(ProbeQuantity::<f64>::evaluate(&*self.quantity, &sample))
    }

    /// Evaluation on an arbitrary sample, used by the host while it forms
    /// derivatives at intermediate integrator stages.
    pub fn value_at(&self, sample: &Sample<'_, f64>) -> f64 {
        ProbeQuantity::<f64>::evaluate(&*self.quantity, sample)
    }

    /// `d/dt` of the raw value along the trajectory through `state`. `ÿ`
    /// must have been computed by the host at `Acceleration`.
    pub fn time_derivative(&self, state: &State) -> Result<f64, ProbeError> {
        let sample = state.sample()?;
        Ok(autodiff::time_derivative(&*self.quantity, &sample, state.model_yddot()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;
    use crate::system::SystemId;

    fn accelerated(y: &[f64]) -> State {
        let mut state = State::new(SystemId::next(), y.len(), y.len(), 0);
        state.upd_model_y().copy_from_slice(y);
        while let Some(next) = state.stage().next() {
            state.mark_realized(next);
        }
        state
    }

    #[test]
    fn value_requires_acceleration_stage() {
        let source = DerivedQuantitySource::new(Rc::new(StateValue(0)));
        let state = State::new(SystemId::next(), 1, 1, 0);
        assert_eq!(
            source.value(&state),
            Err(ProbeError::StageNotReached {
                required: Stage::Acceleration,
                current: Stage::Model,
            })
        );
        assert_eq!(source.value(&accelerated(&[2.5])), Ok(2.5));
    }

    #[test]
    fn expression_reads_coordinates_rates_time_and_params() {
        let quantity = ExpressionQuantity::compile("m * x_dot + t + y", &["x", "y"], &[("m", 2.0)])
            .expect("compile");
        let sample = Sample {
            t: 1.0,
            y: &[0.0, 3.0],
            ydot: &[4.0, 0.0],
        };
        assert_eq!(ProbeQuantity::<f64>::evaluate(&quantity, &sample), 12.0);
        assert_eq!(quantity.expression(), "m * x_dot + t + y");
    }

    #[test]
    fn explicit_time_dependence_is_differentiated() {
        let source = DerivedQuantitySource::new(Rc::new(
            ExpressionQuantity::compile("3 * t", &["x"], &[]).expect("compile"),
        ));
        let state = accelerated(&[0.0]);
        assert!((source.time_derivative(&state).expect("derivative") - 3.0).abs() < 1e-12);
    }

    #[test]
    fn quantities_report_the_coordinates_they_read() {
        assert_eq!(ProbeQuantity::<f64>::required_dimension(&StateValue(3)), 4);
        assert_eq!(ProbeQuantity::<f64>::required_dimension(&StateRate(0)), 1);
        assert_eq!(ProbeQuantity::<f64>::required_dimension(&Constant(2.0)), 0);
        let quantity = ExpressionQuantity::compile("z", &["x", "y", "z"], &[]).expect("compile");
        let source = DerivedQuantitySource::new(Rc::new(quantity));
        assert_eq!(source.required_dimension(), 3);
    }
}
