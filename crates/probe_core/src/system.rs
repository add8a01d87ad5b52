use crate::autodiff::{second_derivatives, Dual};
use crate::error::ProbeError;
use crate::operator::PreOperationValue;
use crate::source::Sample;
use crate::stage::Stage;
use crate::state::{CacheIndex, State, StateIndex};
use crate::traits::{DynamicalSystem, Steppable};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counter for unique [`SystemId`] allocation.
static SYSTEM_COUNTER: AtomicUsize = AtomicUsize::new(1);

/// Identifies the host system a [`State`] or a realized operator belongs to.
///
/// Allocated from a monotonic counter, so two builders never share an id
/// even when their models have identical shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SystemId(usize);

impl SystemId {
    pub(crate) fn next() -> Self {
        Self(SYSTEM_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `d/dt coordinate = integrand`, reserved by an integrate operator.
#[derive(Debug, Clone)]
struct IntegralBinding {
    coordinate: StateIndex,
    initial: f64,
    integrand: PreOperationValue,
}

/// Registry probes realize against while the host system is constructed.
///
/// Probes never hold references into a [`State`]; they hold
/// [`StateIndex`]/[`CacheIndex`] handles handed out here, which stay valid
/// for every state the built system creates.
pub struct SystemBuilder<M> {
    id: SystemId,
    model: M,
    model_dim: usize,
    integrals: Vec<IntegralBinding>,
    cache_len: usize,
    second_derivatives: bool,
}

impl<M: DynamicalSystem<f64>> SystemBuilder<M> {
    pub fn new(model: M) -> Self {
        let model_dim = model.dimension();
        Self {
            id: SystemId::next(),
            model,
            model_dim,
            integrals: Vec::new(),
            cache_len: 0,
            second_derivatives: false,
        }
    }
}

impl<M> SystemBuilder<M> {
    /// The id the built system and all of its states carry.
    pub fn system_id(&self) -> SystemId {
        self.id
    }

    pub fn model_dimension(&self) -> usize {
        self.model_dim
    }

    pub fn allocate_cache_entry(&mut self) -> CacheIndex {
        self.cache_len += 1;
        CacheIndex(self.cache_len - 1)
    }

    /// Reserves one continuous coordinate after the model coordinates.
    pub(crate) fn add_integral(&mut self, initial: f64, integrand: PreOperationValue) -> StateIndex {
        let coordinate = StateIndex(self.model_dim + self.integrals.len());
        self.integrals.push(IntegralBinding {
            coordinate,
            initial,
            integrand,
        });
        coordinate
    }

    /// Asks the host to compute `ÿ` of the model at `Acceleration`.
    pub fn track_second_derivatives(&mut self) {
        self.second_derivatives = true;
    }

    pub fn build(self) -> HostSystem<M> {
        tracing::debug!(
            system = %self.id,
            model_dim = self.model_dim,
            probe_states = self.integrals.len(),
            cache_entries = self.cache_len,
            second_derivatives = self.second_derivatives,
            "host system built"
        );
        HostSystem {
            id: self.id,
            model: self.model,
            model_dim: self.model_dim,
            integrals: self.integrals,
            cache_len: self.cache_len,
            second_derivatives: self.second_derivatives,
        }
    }
}

/// The model plus every coordinate and cache entry probes reserved while it
/// was being built.
pub struct HostSystem<M> {
    id: SystemId,
    model: M,
    model_dim: usize,
    integrals: Vec<IntegralBinding>,
    cache_len: usize,
    second_derivatives: bool,
}

impl<M> HostSystem<M> {
    pub fn system_id(&self) -> SystemId {
        self.id
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_dimension(&self) -> usize {
        self.model_dim
    }

    pub fn num_probe_states(&self) -> usize {
        self.integrals.len()
    }

    /// Cache entries reserved by realized operators.
    pub fn num_cache_entries(&self) -> usize {
        self.cache_len
    }

    /// Model coordinates plus probe-introduced coordinates.
    pub fn total_dimension(&self) -> usize {
        self.model_dim + self.integrals.len()
    }

    /// A state at `t0` with model coordinates `y0` and every integral at its
    /// initial condition, realized to `Model`.
    pub fn default_state(&self, t0: f64, y0: &[f64]) -> Result<State, ProbeError> {
        if y0.len() != self.model_dim {
            return Err(ProbeError::DimensionMismatch {
                what: "initial state",
                expected: self.model_dim,
                actual: y0.len(),
            });
        }
        let mut y = y0.to_vec();
        y.extend(self.integrals.iter().map(|binding| binding.initial));
        let mut state = State::new(self.id, self.model_dim, self.total_dimension(), self.cache_len);
        state.set_continuous(t0, &y);
        Ok(state)
    }

    fn check_state(&self, state: &State) -> Result<(), ProbeError> {
        state.require_system(self.id)?;
        if state.dimension() != self.total_dimension() {
            return Err(ProbeError::DimensionMismatch {
                what: "state",
                expected: self.total_dimension(),
                actual: state.dimension(),
            });
        }
        if state.model_dimension() != self.model_dim {
            return Err(ProbeError::DimensionMismatch {
                what: "model state",
                expected: self.model_dim,
                actual: state.model_dimension(),
            });
        }
        Ok(())
    }
}

impl<M> HostSystem<M>
where
    M: DynamicalSystem<f64> + DynamicalSystem<Dual>,
{
    /// Realizes `state` through every stage up to `target`.
    pub fn realize(&self, state: &mut State, target: Stage) -> Result<(), ProbeError> {
        self.check_state(state)?;
        while state.stage() < target {
            let Some(next) = state.stage().next() else {
                break;
            };
            if next == Stage::Acceleration {
                self.realize_acceleration(state)?;
            } else {
                state.mark_realized(next);
            }
        }
        Ok(())
    }

    fn realize_acceleration(&self, state: &mut State) -> Result<(), ProbeError> {
        let n = self.model_dim;
        let t = state.time();
        {
            let (y, ydot, yddot) = state.derivative_buffers();
            DynamicalSystem::<f64>::apply(&self.model, t, &y[..n], &mut ydot[..n]);
            if self.second_derivatives {
                let mut seed = vec![Dual::constant(0.0); n];
                let mut out = vec![Dual::constant(0.0); n];
                second_derivatives(&self.model, t, &y[..n], &ydot[..n], &mut seed, &mut out, yddot);
            }
        }
        state.mark_realized(Stage::Acceleration);

        // Integrands read the model rates, so they are filled in last.
        for binding in &self.integrals {
            match binding.integrand.value(state) {
                Ok(rate) => state.set_derivative(binding.coordinate, rate),
                Err(err) => {
                    state.invalidate(Stage::Acceleration);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Advances every coordinate, probe integrals included, by one step.
    /// `stepper` must be sized for [`total_dimension`](Self::total_dimension).
    pub fn advance(
        &self,
        state: &mut State,
        stepper: &mut impl Steppable<f64>,
        dt: f64,
    ) -> Result<(), ProbeError> {
        self.check_state(state)?;
        if stepper.dimension() != self.total_dimension() {
            return Err(ProbeError::DimensionMismatch {
                what: "stepper",
                expected: self.total_dimension(),
                actual: stepper.dimension(),
            });
        }
        let mut t = state.time();
        let mut y = state.y().to_vec();
        stepper.step(self, &mut t, &mut y, dt);
        state.set_continuous(t, &y);
        Ok(())
    }
}

/// The augmented vector field the integrator sees.
impl<M: DynamicalSystem<f64>> DynamicalSystem<f64> for HostSystem<M> {
    fn dimension(&self) -> usize {
        self.total_dimension()
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        let n = self.model_dim;
        let (model_out, probe_out) = out.split_at_mut(n);
        self.model.apply(t, &x[..n], model_out);
        let sample = Sample {
            t,
            y: &x[..n],
            ydot: model_out,
        };
        for (slot, binding) in probe_out.iter_mut().zip(&self.integrals) {
            *slot = binding.integrand.value_at(&sample);
        }
    }
}
