/// The `probe_core` crate attaches probes to a time-stepping simulation. A probe
/// reads a derived quantity of the model state and reports it either raw or
/// after one operation: integration, differentiation, or scaling.
///
/// Key components:
/// - **Traits**: `Scalar` (numeric type abstraction), `DynamicalSystem` (ODEs), `Steppable` (Solvers).
/// - **Stages**: `Stage` ordering and the versioned, stage-scoped cache in `State`.
/// - **System**: `SystemBuilder` reserves probe coordinates and cache entries; `HostSystem` realizes and advances states.
/// - **Probes**: `Probe` configuration and `OperatorStage` dispatch over the realized operation.
/// - **Equation Engine**: A bytecode VM for user-written models and probe expressions.
/// - **Autodiff**: Dual numbers for exact time derivatives of probe quantities.
pub mod autodiff;
pub mod equation_engine;
pub mod error;
pub mod operator;
pub mod probe;
pub mod report;
pub mod simulation;
pub mod solvers;
pub mod source;
pub mod stage;
pub mod state;
pub mod system;
pub mod traits;

pub use error::{ErrorCategory, ProbeError};
pub use probe::{Probe, ProbeConfig};
pub use stage::Stage;
pub use state::State;
pub use system::{HostSystem, SystemBuilder};
