//! Run metrics collected by the driver and the core phases.
//!
//! Non-convergence is reported here instead of being raised as an error.

use std::fmt;
use std::time::Duration;

/// Per-run metrics, filled in by the phases a run actually executes.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    /// Cut of the initial (geometric) partition.
    pub preliminary_cut: Option<f64>,
    /// Cut after multilevel refinement.
    pub final_cut: Option<f64>,
    /// Imbalance of the initial partition.
    pub preliminary_imbalance: Option<f64>,
    /// Imbalance of the final partition.
    pub final_imbalance: Option<f64>,
    /// Maximum communication volume (max degree of the block graph).
    pub max_comm_volume: Option<usize>,
    /// Total communication volume (edge count of the block graph).
    pub total_comm_volume: Option<usize>,

    /// (max centre displacement, imbalance) per outer k-means iteration.
    pub kmeans_profiling: Vec<(f64, f64)>,
    /// Balance-loop iterations per k-means assignment call.
    pub num_balance_iters: Vec<usize>,
    /// FM gain per communication round, one inner vector per multilevel
    /// level (finest last).
    pub fm_gain_per_round: Vec<Vec<i64>>,

    /// Phases that hit their iteration cap without reaching epsilon.
    pub non_converged_phases: Vec<String>,

    /// Wall-clock per phase.
    pub time_sfc: Option<Duration>,
    pub time_kmeans: Option<Duration>,
    pub time_multilevel: Option<Duration>,
    pub time_total: Option<Duration>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `phase` ran out of iterations before reaching its target.
    pub fn record_non_convergence(&mut self, phase: &str) {
        self.non_converged_phases.push(phase.to_string());
    }

    /// Total FM gain summed over all rounds and levels.
    pub fn total_fm_gain(&self) -> i64 {
        self.fm_gain_per_round
            .iter()
            .flat_map(|r| r.iter())
            .sum()
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn dur(d: &Option<Duration>) -> String {
            d.map_or_else(|| "-".into(), |d| format!("{:.3}s", d.as_secs_f64()))
        }
        writeln!(f, "cut: initial {:?}, final {:?}", self.preliminary_cut, self.final_cut)?;
        writeln!(
            f,
            "imbalance: initial {:?}, final {:?}",
            self.preliminary_imbalance, self.final_imbalance
        )?;
        if let (Some(max), Some(total)) = (self.max_comm_volume, self.total_comm_volume) {
            writeln!(f, "comm volume: max {max}, total {total}")?;
        }
        writeln!(
            f,
            "time: sfc {}, kmeans {}, multilevel {}, total {}",
            dur(&self.time_sfc),
            dur(&self.time_kmeans),
            dur(&self.time_multilevel),
            dur(&self.time_total)
        )?;
        if !self.non_converged_phases.is_empty() {
            writeln!(f, "non-converged: {}", self.non_converged_phases.join(", "))?;
        }
        Ok(())
    }
}
