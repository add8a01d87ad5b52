use crate::error::ProbeError;
use crate::probe::Probe;
use crate::stage::Stage;
use crate::state::State;
use serde::{Deserialize, Serialize};

/// One column per enabled probe label, one row per recorded instant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub labels: Vec<String>,
    pub times: Vec<f64>,
    pub rows: Vec<Vec<f64>>,
}

impl ProbeReport {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Values recorded under `label`, in time order. `None` for an unknown
    /// label or a row too short to hold the column.
    pub fn column(&self, label: &str) -> Option<Vec<f64>> {
        let index = self.labels.iter().position(|l| l == label)?;
        self.rows.iter().map(|row| row.get(index).copied()).collect()
    }
}

/// Collects rows from the enabled probes of a fixed probe set.
#[derive(Debug)]
pub struct ProbeReporter<'a> {
    probes: Vec<&'a Probe>,
    report: ProbeReport,
}

impl<'a> ProbeReporter<'a> {
    pub fn new(probes: &'a [Probe]) -> Self {
        let probes: Vec<&Probe> = probes.iter().filter(|p| !p.is_disabled()).collect();
        let labels = probes.iter().flat_map(|p| p.record_labels()).collect();
        Self {
            probes,
            report: ProbeReport {
                labels,
                ..ProbeReport::default()
            },
        }
    }

    pub fn labels(&self) -> &[String] {
        &self.report.labels
    }

    /// Appends one row; `state` must be realized to `Report`.
    pub fn record(&mut self, state: &State) -> Result<(), ProbeError> {
        state.require_stage(Stage::Report)?;
        let mut row = Vec::with_capacity(self.report.labels.len());
        for probe in &self.probes {
            row.extend(probe.record_values(state)?);
        }
        self.report.times.push(state.time());
        self.report.rows.push(row);
        Ok(())
    }

    pub fn finish(self) -> ProbeReport {
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::{ProbeReport, ProbeReporter};
    use crate::error::ProbeError;
    use crate::probe::{Probe, ProbeConfig};
    use crate::source::{Constant, StateValue};
    use crate::stage::Stage;
    use crate::system::SystemBuilder;
    use crate::traits::{DynamicalSystem, Scalar};
    use std::rc::Rc;

    struct Still;

    impl<T: Scalar> DynamicalSystem<T> for Still {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, _t: T, _x: &[T], out: &mut [T]) {
            out[0] = T::zero();
        }
    }

    #[test]
    fn reporter_skips_disabled_probes() {
        let mut probes = vec![
            Probe::new("x", Rc::new(StateValue(0))),
            Probe::from_config(
                "c",
                Rc::new(Constant(2.0)),
                ProbeConfig {
                    operation: "scale".into(),
                    operation_parameter: 3.0,
                    ..ProbeConfig::default()
                },
            ),
            Probe::from_config(
                "off",
                Rc::new(Constant(1.0)),
                ProbeConfig {
                    disabled: true,
                    ..ProbeConfig::default()
                },
            ),
        ];
        let mut builder = SystemBuilder::new(Still);
        for probe in &mut probes {
            probe.realize(&mut builder).expect("realize");
        }
        let system = builder.build();
        let mut state = system.default_state(0.0, &[5.0]).expect("state");

        let mut reporter = ProbeReporter::new(&probes);
        assert_eq!(reporter.labels(), &["x", "c_scale_3.000000X"]);
        assert!(matches!(
            reporter.record(&state),
            Err(ProbeError::StageNotReached { .. })
        ));

        system.realize(&mut state, Stage::Report).expect("realize");
        reporter.record(&state).expect("record");
        let report = reporter.finish();
        assert_eq!(report.len(), 1);
        assert_eq!(report.rows[0], vec![5.0, 6.0]);
        assert_eq!(report.column("c_scale_3.000000X"), Some(vec![6.0]));
        assert_eq!(report.column("off"), None);
    }

    #[test]
    fn short_rows_yield_no_column() {
        let report: ProbeReport = serde_json::from_str(
            r#"{"labels": ["a", "b"], "times": [0.0, 1.0], "rows": [[1.0, 2.0], [3.0]]}"#,
        )
        .expect("parse");
        assert_eq!(report.column("a"), Some(vec![1.0, 3.0]));
        assert_eq!(report.column("b"), None);
    }
}
