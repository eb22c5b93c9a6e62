//! Tunables for the partitioning pipeline.

use crate::carve_error::MeshCarveError;

/// Method used to obtain the initial (pre-refinement) partition.
///
/// All methods yield a partition vector with the same contract; the driver
/// dispatches on this enum only.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum InitialPartitioningMethod {
    /// Slice the Hilbert curve into k contiguous, weight-balanced ranges.
    #[default]
    Sfc,
    /// Partition a coarse pixel-grid proxy graph and project back.
    Pixel,
    /// Fiedler-vector bisection of the pixel proxy graph.
    Spectral,
    /// Weighted coordinate multisection.
    Multisection,
    /// Balanced geometric k-means (also run after every other method).
    KMeans,
}

/// Input file format for the graph.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum FileFormat {
    /// METIS-style adjacency text format.
    #[default]
    Metis,
    /// MatrixMarket coordinate format.
    MatrixMarket,
}

/// Settings for the whole pipeline. Field defaults mirror the values the
/// system ships with; see [`Settings::validate`] for the accepted ranges.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Spatial dimension of the coordinates, 2 or 3.
    pub dimensions: usize,
    /// Mesh generator extents.
    pub num_x: usize,
    pub num_y: usize,
    pub num_z: usize,
    /// Number of target blocks k.
    pub num_blocks: usize,
    /// Balance tolerance epsilon.
    pub epsilon: f64,
    /// Bits per axis of the Hilbert curve.
    pub sfc_resolution: u32,
    /// Depth of the coarsening recursion; 0 skips coarsening entirely.
    pub multi_level_rounds: usize,
    /// Local contraction rounds per multilevel step.
    pub coarsening_steps_between_refinement: usize,
    /// Side length of the pixel proxy grid.
    pub pixeled_side_len: usize,
    /// Seed method for the initial partition.
    pub initial_partition: InitialPartitioningMethod,
    /// Graph input format.
    pub file_format: FileFormat,

    // --- local refinement ---
    /// Skip an FM pair when the common border is smaller than this.
    pub min_border_nodes: usize,
    /// Stop FM after this many consecutive rounds without gain (0 = never).
    pub stop_after_no_gain_rounds: usize,
    /// Minimum global gain of a round to start another round.
    pub min_gain_for_next_round: i64,
    /// Hop bound of the border BFS exchanged between an FM pair.
    pub border_depth: usize,
    /// Prefer gain over balance when ordering FM moves.
    pub gain_over_balance: bool,
    /// Break FM ties by geometric distance from the block centre.
    pub use_geometric_tie_breaking: bool,
    /// Drop colours that produced no gain from subsequent rounds.
    pub skip_no_gain_colors: bool,
    /// Skip multilevel/FM refinement entirely.
    pub no_refinement: bool,

    // --- k-means ---
    /// Sample floor per block and process for the ramp-up rounds.
    pub min_sampling_nodes: usize,
    /// Cap on balance-loop iterations inside one assignment.
    pub balance_iterations: usize,
    /// Cap on outer Lloyd iterations.
    pub max_kmeans_iterations: usize,
    /// Exponent alpha of the influence update `w_b/c_b ^ alpha`.
    pub influence_exponent: f64,
    /// Per-iteration cap delta on the relative influence change.
    pub influence_change_cap: f64,
    /// Tighten the influence interval when a block oscillates.
    pub tighten_bounds: bool,
    /// Stop adjusting the influence of blocks already within epsilon.
    pub freeze_balanced_influence: bool,
    /// Contract the influence of blocks whose centre moved far.
    pub erode_influence: bool,

    /// RNG seed; broadcast from rank 0 so every rank derives the same
    /// per-rank streams.
    pub seed: u64,
    /// Emit coordinates annotated with the final block id.
    pub write_debug_coordinates: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dimensions: 3,
            num_x: 32,
            num_y: 32,
            num_z: 32,
            num_blocks: 2,
            epsilon: 0.05,
            sfc_resolution: 17,
            multi_level_rounds: 0,
            coarsening_steps_between_refinement: 3,
            pixeled_side_len: 10,
            initial_partition: InitialPartitioningMethod::Sfc,
            file_format: FileFormat::Metis,
            min_border_nodes: 1,
            stop_after_no_gain_rounds: 0,
            min_gain_for_next_round: 1,
            border_depth: 4,
            gain_over_balance: false,
            use_geometric_tie_breaking: false,
            skip_no_gain_colors: false,
            no_refinement: false,
            min_sampling_nodes: 100,
            balance_iterations: 20,
            max_kmeans_iterations: 50,
            influence_exponent: 0.5,
            influence_change_cap: 0.1,
            tighten_bounds: true,
            freeze_balanced_influence: false,
            erode_influence: false,
            seed: 0,
            write_debug_coordinates: false,
        }
    }
}

impl Settings {
    /// Check settings for internally consistent, in-range values.
    pub fn validate(&self) -> Result<(), MeshCarveError> {
        if self.dimensions != 2 && self.dimensions != 3 {
            return Err(MeshCarveError::Config(format!(
                "dimensions must be 2 or 3, got {}",
                self.dimensions
            )));
        }
        if self.num_blocks < 1 {
            return Err(MeshCarveError::Config(format!(
                "numBlocks must be at least 1, got {}",
                self.num_blocks
            )));
        }
        if !(self.epsilon > 0.0) {
            return Err(MeshCarveError::Config(format!(
                "epsilon must be positive, got {}",
                self.epsilon
            )));
        }
        if self.sfc_resolution == 0 || self.sfc_resolution > 21 {
            return Err(MeshCarveError::Config(format!(
                "sfcResolution must be in 1..=21, got {}",
                self.sfc_resolution
            )));
        }
        if self.pixeled_side_len < 2 {
            return Err(MeshCarveError::Config(format!(
                "pixeledSideLen must be at least 2, got {}",
                self.pixeled_side_len
            )));
        }
        if !(self.influence_change_cap > 0.0 && self.influence_change_cap < 1.0) {
            return Err(MeshCarveError::Config(format!(
                "influenceChangeCap must be in (0,1), got {}",
                self.influence_change_cap
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_dimensions() {
        let s = Settings {
            dimensions: 4,
            ..Settings::default()
        };
        assert!(matches!(s.validate(), Err(MeshCarveError::Config(_))));
    }

    #[test]
    fn rejects_zero_blocks() {
        let s = Settings {
            num_blocks: 0,
            ..Settings::default()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_nonpositive_epsilon() {
        let s = Settings {
            epsilon: 0.0,
            ..Settings::default()
        };
        assert!(s.validate().is_err());
    }
}
