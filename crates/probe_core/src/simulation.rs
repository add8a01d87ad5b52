use crate::{
    autodiff::Dual,
    probe::Probe,
    report::{ProbeReport, ProbeReporter},
    solvers::{Tsit5, RK4},
    stage::Stage,
    state::State,
    system::HostSystem,
    traits::{DynamicalSystem, Steppable},
};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepperKind {
    #[default]
    Rk4,
    Tsit5,
}

impl StepperKind {
    fn build(self, dim: usize) -> InternalStepper {
        match self {
            StepperKind::Rk4 => InternalStepper::Rk4(RK4::new(dim)),
            StepperKind::Tsit5 => InternalStepper::Tsit5(Tsit5::new(dim)),
        }
    }
}

enum InternalStepper {
    Rk4(RK4<f64>),
    Tsit5(Tsit5<f64>),
}

impl Steppable<f64> for InternalStepper {
    fn dimension(&self) -> usize {
        match self {
            InternalStepper::Rk4(s) => s.dimension(),
            InternalStepper::Tsit5(s) => s.dimension(),
        }
    }

    fn step(
        &mut self,
        system: &impl DynamicalSystem<f64>,
        t: &mut f64,
        state: &mut [f64],
        dt: f64,
    ) {
        match self {
            InternalStepper::Rk4(s) => s.step(system, t, state, dt),
            InternalStepper::Tsit5(s) => s.step(system, t, state, dt),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    pub dt: f64,
    pub steps: usize,
    /// Record a row every `report_interval` steps, plus the initial state.
    pub report_interval: usize,
    pub stepper: StepperKind,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            dt: 0.01,
            steps: 100,
            report_interval: 1,
            stepper: StepperKind::default(),
        }
    }
}

impl SimulationSettings {
    pub fn validate(&self) -> Result<()> {
        if self.dt <= 0.0 || !self.dt.is_finite() {
            bail!("Step size dt must be positive and finite.");
        }
        if self.steps == 0 {
            bail!("Simulation requires at least one integration step.");
        }
        if self.report_interval == 0 {
            bail!("report_interval must be at least 1.");
        }
        Ok(())
    }
}

/// Advances `state` by `settings.steps` steps, recording every enabled
/// probe at the start and after every `report_interval` steps.
///
/// The probes must already be realized against `system`.
pub fn simulate<M>(
    system: &HostSystem<M>,
    state: &mut State,
    probes: &[Probe],
    settings: &SimulationSettings,
) -> Result<ProbeReport>
where
    M: DynamicalSystem<f64> + DynamicalSystem<Dual>,
{
    settings.validate()?;
    if let Some(probe) = probes.iter().find(|p| !p.is_realized()) {
        bail!("Probe '{}' must be realized before simulating.", probe.name());
    }

    let mut stepper = settings.stepper.build(system.total_dimension());
    let mut reporter = ProbeReporter::new(probes);
    tracing::info!(
        steps = settings.steps,
        dt = settings.dt,
        stepper = ?settings.stepper,
        columns = reporter.labels().len(),
        "simulation started"
    );

    record(system, state, &mut reporter)?;
    for step in 1..=settings.steps {
        system
            .advance(state, &mut stepper, settings.dt)
            .with_context(|| format!("Failed to advance step {step}"))?;
        if step % settings.report_interval == 0 || step == settings.steps {
            record(system, state, &mut reporter)
                .with_context(|| format!("Failed to record step {step}"))?;
        }
    }

    let report = reporter.finish();
    tracing::info!(rows = report.len(), t = state.time(), "simulation finished");
    Ok(report)
}

fn record<M>(system: &HostSystem<M>, state: &mut State, reporter: &mut ProbeReporter<'_>) -> Result<()>
where
    M: DynamicalSystem<f64> + DynamicalSystem<Dual>,
{
    system.realize(state, Stage::Report)?;
    reporter.record(state)?;
    Ok(())
}
