//! Command-line driver for mesh-carve.
//!
//! Reads or generates a mesh, partitions it, reports metrics and writes the
//! partition (and optionally the block graph and annotated coordinates).
//! Exit codes: 0 success, 1 configuration error, 2 input error, 3 runtime
//! failure.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use log::info;

use mesh_carve::algs::block_graph::block_graph;
use mesh_carve::algs::communicator::Communicator;
use mesh_carve::carve_error::MeshCarveError;
use mesh_carve::io;
use mesh_carve::mesh_generation::{structured_mesh_2d, structured_mesh_3d};
use mesh_carve::metrics::Metrics;
use mesh_carve::partitioning::partition_graph;
use mesh_carve::settings::{FileFormat, InitialPartitioningMethod, Settings};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum MethodArg {
    Sfc,
    Pixel,
    Spectral,
    Multisection,
    KMeans,
}

impl From<MethodArg> for InitialPartitioningMethod {
    fn from(m: MethodArg) -> Self {
        match m {
            MethodArg::Sfc => InitialPartitioningMethod::Sfc,
            MethodArg::Pixel => InitialPartitioningMethod::Pixel,
            MethodArg::Spectral => InitialPartitioningMethod::Spectral,
            MethodArg::Multisection => InitialPartitioningMethod::Multisection,
            MethodArg::KMeans => InitialPartitioningMethod::KMeans,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum FormatArg {
    Metis,
    MatrixMarket,
}

/// Geometric graph partitioner for distributed simulations.
#[derive(Parser, Debug)]
#[command(name = "carve", version, about)]
struct Cli {
    /// Read the graph from this file.
    #[arg(long = "graphFile")]
    graph_file: Option<PathBuf>,

    /// Read coordinates from this file (default: graphFile + ".xyz").
    #[arg(long = "coordFile")]
    coord_file: Option<PathBuf>,

    /// Graph file format.
    #[arg(long = "fileFormat", value_enum, default_value = "metis")]
    file_format: FormatArg,

    /// Generate a structured mesh instead of reading files.
    #[arg(long)]
    generate: bool,

    /// Mesh extent in x.
    #[arg(long = "numX", default_value_t = 32)]
    num_x: usize,
    /// Mesh extent in y.
    #[arg(long = "numY", default_value_t = 32)]
    num_y: usize,
    /// Mesh extent in z.
    #[arg(long = "numZ", default_value_t = 32)]
    num_z: usize,

    /// Spatial dimension (2 or 3).
    #[arg(long, default_value_t = 3)]
    dimensions: usize,

    /// Target number of blocks.
    #[arg(long = "numBlocks", default_value_t = 2)]
    num_blocks: usize,

    /// Balance tolerance.
    #[arg(long, default_value_t = 0.05)]
    epsilon: f64,

    /// Depth of the coarsening recursion.
    #[arg(long = "multiLevelRounds", default_value_t = 0)]
    multi_level_rounds: usize,

    /// Local contraction rounds per multilevel step.
    #[arg(long = "coarseningStepsBetweenRefinement", default_value_t = 3)]
    coarsening_steps: usize,

    /// Skip an FM pair below this border size.
    #[arg(long = "minBorderNodes", default_value_t = 1)]
    min_border_nodes: usize,

    /// Stop FM after this many gainless rounds (0 = never).
    #[arg(long = "stopAfterNoGainRounds", default_value_t = 0)]
    stop_after_no_gain_rounds: usize,

    /// Minimum round gain to keep refining.
    #[arg(long = "minGainForNextRound", default_value_t = 1)]
    min_gain_for_next_round: i64,

    /// Hilbert curve bits per axis.
    #[arg(long = "sfcResolution", default_value_t = 17)]
    sfc_resolution: u32,

    /// Seed method for the initial partition.
    #[arg(long = "initialPartition", value_enum, default_value = "sfc")]
    initial_partition: MethodArg,

    /// Pixel grid resolution per axis.
    #[arg(long = "pixeledSideLen", default_value_t = 10)]
    pixeled_side_len: usize,

    /// Order FM moves purely by gain.
    #[arg(long = "gainOverBalance")]
    gain_over_balance: bool,

    /// Break FM ties by distance from the block centre.
    #[arg(long = "useGeometricTieBreaking")]
    use_geometric_tie_breaking: bool,

    /// Drop gainless colours from later FM rounds.
    #[arg(long = "skipNoGainColors")]
    skip_no_gain_colors: bool,

    /// Skip multilevel/FM refinement.
    #[arg(long = "noRefinement")]
    no_refinement: bool,

    /// Write coordinates annotated with block ids.
    #[arg(long = "writeDebugCoordinates")]
    write_debug_coordinates: bool,

    /// Write the partition to this file.
    #[arg(long = "outFile", default_value = "partition.txt")]
    out_file: PathBuf,

    /// Also export the block graph to this file.
    #[arg(long = "blockGraphFile")]
    block_graph_file: Option<PathBuf>,

    /// RNG seed (broadcast from rank 0).
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

impl Cli {
    fn settings(&self) -> Settings {
        Settings {
            dimensions: self.dimensions,
            num_x: self.num_x,
            num_y: self.num_y,
            num_z: self.num_z,
            num_blocks: self.num_blocks,
            epsilon: self.epsilon,
            sfc_resolution: self.sfc_resolution,
            multi_level_rounds: self.multi_level_rounds,
            coarsening_steps_between_refinement: self.coarsening_steps,
            pixeled_side_len: self.pixeled_side_len,
            initial_partition: self.initial_partition.into(),
            file_format: match self.file_format {
                FormatArg::Metis => FileFormat::Metis,
                FormatArg::MatrixMarket => FileFormat::MatrixMarket,
            },
            min_border_nodes: self.min_border_nodes,
            stop_after_no_gain_rounds: self.stop_after_no_gain_rounds,
            min_gain_for_next_round: self.min_gain_for_next_round,
            gain_over_balance: self.gain_over_balance,
            use_geometric_tie_breaking: self.use_geometric_tie_breaking,
            skip_no_gain_colors: self.skip_no_gain_colors,
            no_refinement: self.no_refinement,
            write_debug_coordinates: self.write_debug_coordinates,
            seed: self.seed,
            ..Settings::default()
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    #[cfg(feature = "mpi-support")]
    let comm = mesh_carve::algs::communicator::MpiComm::default();
    #[cfg(not(feature = "mpi-support"))]
    let comm = mesh_carve::algs::communicator::NoComm;

    match run(&cli, &comm) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("carve: {err:#}");
            match err.downcast_ref::<MeshCarveError>() {
                Some(MeshCarveError::Config(_)) => ExitCode::from(1),
                Some(MeshCarveError::Input(_)) | Some(MeshCarveError::Io { .. }) => {
                    ExitCode::from(2)
                }
                _ => ExitCode::from(3),
            }
        }
    }
}

fn run<C: Communicator>(cli: &Cli, comm: &C) -> anyhow::Result<()> {
    let settings = cli.settings();
    settings.validate()?;

    let (graph, coords) = if cli.generate {
        info!(
            "generating a {}x{}{} structured mesh",
            cli.num_x,
            cli.num_y,
            if cli.dimensions == 3 {
                format!("x{}", cli.num_z)
            } else {
                String::new()
            }
        );
        let (graph, coords, _) = if cli.dimensions == 2 {
            structured_mesh_2d(comm, cli.num_x, cli.num_y)?
        } else {
            structured_mesh_3d(comm, cli.num_x, cli.num_y, cli.num_z)?
        };
        (graph, coords)
    } else {
        let graph_file = cli
            .graph_file
            .as_ref()
            .ok_or_else(|| MeshCarveError::Config("need --graphFile or --generate".into()))?;
        let graph = match settings.file_format {
            FileFormat::Metis => io::read_graph_metis(comm, graph_file)?,
            FileFormat::MatrixMarket => io::read_graph_matrix_market(comm, graph_file)?,
        };
        let coord_file = cli
            .coord_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}.xyz", graph_file.display())));
        let coords = io::read_coords_xyz(&coord_file, graph.dist(), cli.dimensions)?;
        info!(
            "read {} vertices, {} local edge endpoints",
            graph.global_n(),
            graph.local_nnz()
        );
        (graph, coords)
    };

    let mut metrics = Metrics::new();
    let part = partition_graph(comm, &graph, &coords, None, &settings, &mut metrics)
        .context("partitioning failed")?;

    if comm.rank() == 0 {
        print!("{metrics}");
    }
    io::write_partition(comm, &cli.out_file, &part)?;
    info!("partition written to {}", cli.out_file.display());

    if let Some(bg_file) = &cli.block_graph_file {
        let bg = block_graph(comm, &graph, &part, settings.num_blocks)?;
        io::write_block_graph(comm, bg_file, &bg)?;
    }
    if settings.write_debug_coordinates {
        let mut p = cli.out_file.clone();
        p.set_extension("debug.xyz");
        io::write_debug_coordinates(comm, &p, &coords, &part)?;
    }
    Ok(())
}
