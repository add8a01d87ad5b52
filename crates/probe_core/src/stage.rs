use serde::{Deserialize, Serialize};
use std::fmt;

/// A point in the host's evaluation order. Later variants imply every
/// earlier stage has been realized; a value depending on a stage is
/// recomputed after that stage is re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    Empty,
    Topology,
    Model,
    Time,
    Position,
    Velocity,
    Dynamics,
    Acceleration,
    Report,
}

impl Stage {
    pub const COUNT: usize = 9;

    pub const ALL: [Stage; Stage::COUNT] = [
        Stage::Empty,
        Stage::Topology,
        Stage::Model,
        Stage::Time,
        Stage::Position,
        Stage::Velocity,
        Stage::Dynamics,
        Stage::Acceleration,
        Stage::Report,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn next(self) -> Option<Stage> {
        Stage::ALL.get(self.index() + 1).copied()
    }

    pub fn prev(self) -> Option<Stage> {
        self.index().checked_sub(1).map(|i| Stage::ALL[i])
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Empty => "Empty",
            Stage::Topology => "Topology",
            Stage::Model => "Model",
            Stage::Time => "Time",
            Stage::Position => "Position",
            Stage::Velocity => "Velocity",
            Stage::Dynamics => "Dynamics",
            Stage::Acceleration => "Acceleration",
            Stage::Report => "Report",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
