use crate::error::ProbeError;
use crate::source::{DerivedQuantitySource, Sample};
use crate::stage::Stage;
use crate::state::{CacheIndex, State, StateIndex};
use crate::system::{SystemBuilder, SystemId};
use serde::{Deserialize, Serialize};

/// Accepted operation strings, in display order.
pub const LEGAL_OPERATIONS: [&str; 4] = ["", "integrate", "differentiate", "scale"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Identity,
    Integrate,
    Differentiate,
    Scale,
}

impl OperationKind {
    /// Exact, case-sensitive match against [`LEGAL_OPERATIONS`].
    pub fn parse(operation: &str) -> Option<Self> {
        match operation {
            "" => Some(Self::Identity),
            "integrate" => Some(Self::Integrate),
            "differentiate" => Some(Self::Differentiate),
            "scale" => Some(Self::Scale),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "",
            Self::Integrate => "integrate",
            Self::Differentiate => "differentiate",
            Self::Scale => "scale",
        }
    }
}

/// The source value memoized once per `Acceleration` realization.
///
/// Shared between an operator stage and, for integrals, the host's
/// derivative evaluation, so both read the same entry.
#[derive(Debug, Clone)]
pub(crate) struct PreOperationValue {
    source: DerivedQuantitySource,
    cache: CacheIndex,
}

impl PreOperationValue {
    fn allocate<M>(source: DerivedQuantitySource, builder: &mut SystemBuilder<M>) -> Self {
        Self {
            source,
            cache: builder.allocate_cache_entry(),
        }
    }

    pub(crate) fn value(&self, state: &State) -> Result<f64, ProbeError> {
        state.cached(self.cache, self.source.required_stage(), || {
            self.source.value(state)
        })
    }

    pub(crate) fn value_at(&self, sample: &Sample<'_, f64>) -> f64 {
        self.source.value_at(sample)
    }
}

#[derive(Debug)]
enum Operator {
    Identity {
        input: PreOperationValue,
    },
    Integrate {
        coordinate: StateIndex,
    },
    Differentiate {
        source: DerivedQuantitySource,
        cache: CacheIndex,
    },
    Scale {
        input: PreOperationValue,
        factor: f64,
        cache: CacheIndex,
    },
}

/// The realized transformation applied to a probe's raw value.
///
/// The operation is chosen from configuration once, at realization, and
/// stored as a closed variant. Evaluation dispatches on the variant and never
/// reinterprets the configuration string.
#[derive(Debug)]
pub struct OperatorStage {
    system: SystemId,
    operator: Operator,
}

impl OperatorStage {
    /// Builds the stage for `kind`, reserving whatever it needs in the host.
    pub(crate) fn realize<M>(
        kind: OperationKind,
        parameter: f64,
        source: DerivedQuantitySource,
        builder: &mut SystemBuilder<M>,
    ) -> Self {
        let operator = match kind {
            OperationKind::Identity => Operator::Identity {
                input: PreOperationValue::allocate(source, builder),
            },
            OperationKind::Integrate => {
                let input = PreOperationValue::allocate(source, builder);
                Operator::Integrate {
                    coordinate: builder.add_integral(parameter, input),
                }
            }
            OperationKind::Differentiate => {
                builder.track_second_derivatives();
                Operator::Differentiate {
                    source,
                    cache: builder.allocate_cache_entry(),
                }
            }
            OperationKind::Scale => {
                let input = PreOperationValue::allocate(source, builder);
                Operator::Scale {
                    input,
                    factor: parameter,
                    cache: builder.allocate_cache_entry(),
                }
            }
        };
        Self {
            system: builder.system_id(),
            operator,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self.operator {
            Operator::Identity { .. } => OperationKind::Identity,
            Operator::Integrate { .. } => OperationKind::Integrate,
            Operator::Differentiate { .. } => OperationKind::Differentiate,
            Operator::Scale { .. } => OperationKind::Scale,
        }
    }

    /// The host system this stage was realized against.
    pub fn system_id(&self) -> SystemId {
        self.system
    }

    /// Earliest stage at which [`current_value`](Self::current_value) succeeds.
    pub fn required_stage(&self) -> Stage {
        match self.operator {
            // The integral is a state coordinate, known as soon as time is.
            Operator::Integrate { .. } => Stage::Time,
            _ => DerivedQuantitySource::REQUIRED_STAGE,
        }
    }

    pub fn num_state_variables_introduced(&self) -> usize {
        match self.operator {
            Operator::Integrate { .. } => 1,
            _ => 0,
        }
    }

    /// The continuous coordinate owned by an integrate stage.
    pub fn coordinate(&self) -> Option<StateIndex> {
        match self.operator {
            Operator::Integrate { coordinate } => Some(coordinate),
            _ => None,
        }
    }

    pub fn current_value(&self, state: &State) -> Result<f64, ProbeError> {
        state.require_system(self.system)?;
        match &self.operator {
            Operator::Identity { input } => input.value(state),
            Operator::Integrate { coordinate } => {
                state.require_stage(Stage::Time)?;
                state.coordinate(*coordinate)
            }
            Operator::Differentiate { source, cache } => {
                state.cached(*cache, self.required_stage(), || source.time_derivative(state))
            }
            Operator::Scale {
                input,
                factor,
                cache,
            } => state.cached(*cache, self.required_stage(), || {
                Ok(*factor * input.value(state)?)
            }),
        }
    }
}
