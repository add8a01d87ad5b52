use crate::error::ProbeError;
use crate::source::Sample;
use crate::stage::Stage;
use crate::system::SystemId;
use nalgebra::DVector;
use std::cell::Cell;

/// Handle to one continuous coordinate in the state arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateIndex(pub(crate) usize);

impl StateIndex {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Handle to one cache entry in the state's cache arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheIndex(pub(crate) usize);

#[derive(Debug, Clone, Copy, Default)]
struct CacheEntry {
    /// Version of the dependency stage at computation; 0 is never issued.
    token: u64,
    value: f64,
}

/// Host evaluation state: an arena of continuous coordinates plus a cache
/// arena whose entries are keyed to per-stage versions.
///
/// Realizing a stage stamps it with a fresh version drawn from a counter
/// that only grows. A cache entry stores the version of the stage it depends
/// on and is valid exactly while that stage is still realized with the same
/// version.
#[derive(Debug, Clone)]
pub struct State {
    system: SystemId,
    time: f64,
    y: DVector<f64>,
    ydot: DVector<f64>,
    yddot: DVector<f64>,
    model_dim: usize,
    stage: Stage,
    versions: [u64; Stage::COUNT],
    next_version: u64,
    cache: Vec<Cell<CacheEntry>>,
}

impl State {
    /// Allocates a state realized to `Model`. Only the host system creates
    /// states, since it knows the arena sizes.
    pub(crate) fn new(
        system: SystemId,
        model_dim: usize,
        total_dim: usize,
        cache_len: usize,
    ) -> Self {
        let mut state = Self {
            system,
            time: 0.0,
            y: DVector::zeros(total_dim),
            ydot: DVector::zeros(total_dim),
            yddot: DVector::zeros(model_dim),
            model_dim,
            stage: Stage::Empty,
            versions: [0; Stage::COUNT],
            next_version: 1,
            cache: vec![Cell::new(CacheEntry::default()); cache_len],
        };
        state.mark_realized(Stage::Topology);
        state.mark_realized(Stage::Model);
        state
    }

    /// The host system that created this state.
    pub fn system(&self) -> SystemId {
        self.system
    }

    /// Fails unless this state was created by system `expected`.
    pub fn require_system(&self, expected: SystemId) -> Result<(), ProbeError> {
        if self.system != expected {
            return Err(ProbeError::ForeignState {
                what: "system id",
                index: self.system.index(),
            });
        }
        Ok(())
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    /// Sets the time; invalidates `Time` and every later stage.
    pub fn set_time(&mut self, t: f64) {
        self.invalidate(Stage::Time);
        self.time = t;
    }

    /// Every continuous coordinate, model coordinates first.
    pub fn y(&self) -> &[f64] {
        self.y.as_slice()
    }

    pub fn model_y(&self) -> &[f64] {
        &self.y.as_slice()[..self.model_dim]
    }

    /// Mutable access to the model coordinates; invalidates `Position` and
    /// every later stage. Probe-introduced coordinates are not reachable here.
    pub fn upd_model_y(&mut self) -> &mut [f64] {
        self.invalidate(Stage::Position);
        &mut self.y.as_mut_slice()[..self.model_dim]
    }

    /// Time derivatives of every coordinate; valid from `Acceleration`.
    pub fn ydot(&self) -> Result<&[f64], ProbeError> {
        self.require_stage(Stage::Acceleration)?;
        Ok(self.ydot.as_slice())
    }

    pub fn model_dimension(&self) -> usize {
        self.model_dim
    }

    pub fn dimension(&self) -> usize {
        self.y.len()
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Version stamped on `stage` when it was last realized, if it still is.
    pub fn stage_version(&self, stage: Stage) -> Option<u64> {
        (self.stage >= stage).then(|| self.versions[stage.index()])
    }

    /// Drops the realized stage below `stage`, if it had been reached.
    pub fn invalidate(&mut self, stage: Stage) {
        if self.stage >= stage {
            self.stage = stage.prev().unwrap_or(Stage::Empty);
        }
    }

    pub fn require_stage(&self, required: Stage) -> Result<(), ProbeError> {
        if self.stage < required {
            return Err(ProbeError::StageNotReached {
                required,
                current: self.stage,
            });
        }
        Ok(())
    }

    /// Reads the value of a probe-introduced or model coordinate.
    pub fn coordinate(&self, index: StateIndex) -> Result<f64, ProbeError> {
        self.y
            .get(index.0)
            .copied()
            .ok_or(ProbeError::ForeignState {
                what: "state index",
                index: index.0,
            })
    }

    /// `(t, y, ẏ)` of the model coordinates; valid from `Acceleration`.
    pub fn sample(&self) -> Result<Sample<'_, f64>, ProbeError> {
        self.require_stage(Stage::Acceleration)?;
        let n = self.model_dim;
        Ok(Sample {
            t: self.time,
            y: &self.y.as_slice()[..n],
            ydot: &self.ydot.as_slice()[..n],
        })
    }

    pub(crate) fn model_yddot(&self) -> &[f64] {
        self.yddot.as_slice()
    }

    pub(crate) fn mark_realized(&mut self, stage: Stage) {
        self.versions[stage.index()] = self.next_version;
        self.next_version += 1;
        self.stage = stage;
    }

    pub(crate) fn derivative_buffers(&mut self) -> (&[f64], &mut [f64], &mut [f64]) {
        (
            self.y.as_slice(),
            self.ydot.as_mut_slice(),
            self.yddot.as_mut_slice(),
        )
    }

    pub(crate) fn set_derivative(&mut self, index: StateIndex, value: f64) {
        self.ydot[index.0] = value;
    }

    /// Replaces every coordinate after an integrator step.
    pub(crate) fn set_continuous(&mut self, t: f64, y: &[f64]) {
        self.invalidate(Stage::Time);
        self.time = t;
        self.y.as_mut_slice().copy_from_slice(y);
    }

    /// Returns the cached value at `index` if it was computed under the
    /// current version of `depends_on`; otherwise computes and stores it.
    pub(crate) fn cached(
        &self,
        index: CacheIndex,
        depends_on: Stage,
        compute: impl FnOnce() -> Result<f64, ProbeError>,
    ) -> Result<f64, ProbeError> {
        self.require_stage(depends_on)?;
        let cell = self.cache.get(index.0).ok_or(ProbeError::ForeignState {
            what: "cache index",
            index: index.0,
        })?;
        let token = self.versions[depends_on.index()];
        let entry = cell.get();
        if entry.token == token {
            return Ok(entry.value);
        }
        let value = compute()?;
        tracing::trace!(cache = index.0, stage = %depends_on, token, value, "cache refreshed");
        cell.set(CacheEntry { token, value });
        Ok(value)
    }
}
