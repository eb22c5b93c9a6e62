//! Graph, coordinate and partition file I/O.
//!
//! Graphs arrive in METIS adjacency text or MatrixMarket coordinate format,
//! coordinates as one point per line. Files are replicated-read: every rank
//! parses the whole file and keeps the rows of its block distribution.
//! Writers gather at rank 0.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use crate::algs::block_graph::BlockGraph;
use crate::algs::collective::gather_varlen;
use crate::algs::communicator::Communicator;
use crate::carve_error::MeshCarveError;
use crate::dist::{DistGraph, DistVector, Distribution};

fn open(path: &Path) -> Result<BufReader<File>, MeshCarveError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| MeshCarveError::io(path.display().to_string(), e))
}

fn create(path: &Path) -> Result<BufWriter<File>, MeshCarveError> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| MeshCarveError::io(path.display().to_string(), e))
}

fn parse_err(path: &Path, line: usize, what: &str) -> MeshCarveError {
    MeshCarveError::Input(format!("{}:{line}: {what}", path.display()))
}

/// Read a METIS-format graph: header `N E [fmt]`, then one line per vertex
/// listing its 1-based neighbours, optionally interleaved with edge weights
/// when `fmt` ends in 1 (collective: replicated read, block distribution).
pub fn read_graph_metis<C: Communicator>(
    comm: &C,
    path: &Path,
) -> Result<DistGraph, MeshCarveError> {
    let reader = open(path)?;
    let mut lines = reader.lines().enumerate();

    let (header_no, header) = loop {
        match lines.next() {
            Some((no, line)) => {
                let line = line.map_err(|e| MeshCarveError::io(path.display().to_string(), e))?;
                let trimmed = line.trim();
                if !trimmed.is_empty() && !trimmed.starts_with('%') {
                    break (no + 1, trimmed.to_string());
                }
            }
            None => return Err(parse_err(path, 1, "missing header line")),
        }
    };
    let fields: Vec<&str> = header.split_whitespace().collect();
    if fields.len() < 2 {
        return Err(parse_err(path, header_no, "header needs `N E`"));
    }
    let n: usize = fields[0]
        .parse()
        .map_err(|_| parse_err(path, header_no, "bad vertex count"))?;
    let e: usize = fields[1]
        .parse()
        .map_err(|_| parse_err(path, header_no, "bad edge count"))?;
    let has_edge_weights = fields
        .get(2)
        .map_or(false, |fmt| fmt.ends_with('1'));

    let mut full_ia = Vec::with_capacity(n + 1);
    let mut full_ja = Vec::new();
    let mut full_values = Vec::new();
    full_ia.push(0);
    let mut vertex = 0usize;
    for (no, line) in lines {
        if vertex == n {
            break;
        }
        let line = line.map_err(|e| MeshCarveError::io(path.display().to_string(), e))?;
        let trimmed = line.trim();
        if trimmed.starts_with('%') {
            continue;
        }
        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        if has_edge_weights {
            if tokens.len() % 2 != 0 {
                return Err(parse_err(path, no + 1, "odd token count with edge weights"));
            }
            for pair in tokens.chunks_exact(2) {
                let nbr: usize = pair[0]
                    .parse()
                    .map_err(|_| parse_err(path, no + 1, "bad neighbour id"))?;
                let w: f64 = pair[1]
                    .parse()
                    .map_err(|_| parse_err(path, no + 1, "bad edge weight"))?;
                if nbr == 0 || nbr > n {
                    return Err(parse_err(path, no + 1, "neighbour id out of range"));
                }
                full_ja.push(nbr - 1);
                full_values.push(w);
            }
        } else {
            for tok in tokens {
                let nbr: usize = tok
                    .parse()
                    .map_err(|_| parse_err(path, no + 1, "bad neighbour id"))?;
                if nbr == 0 || nbr > n {
                    return Err(parse_err(path, no + 1, "neighbour id out of range"));
                }
                full_ja.push(nbr - 1);
                full_values.push(1.0);
            }
        }
        full_ia.push(full_ja.len());
        vertex += 1;
    }
    if vertex != n {
        return Err(parse_err(
            path,
            header_no,
            &format!("expected {n} vertex lines, found {vertex}"),
        ));
    }
    if full_ja.len() != 2 * e {
        return Err(parse_err(
            path,
            header_no,
            &format!(
                "header promises {e} edges, adjacency lists {} endpoints",
                full_ja.len()
            ),
        ));
    }
    let dist = Distribution::block(comm, n);
    DistGraph::from_replicated(dist, &full_ia, &full_ja, &full_values)
}

/// Read a MatrixMarket coordinate file as a symmetric graph (collective:
/// replicated read, block distribution). Entries present in only one
/// triangle are mirrored.
pub fn read_graph_matrix_market<C: Communicator>(
    comm: &C,
    path: &Path,
) -> Result<DistGraph, MeshCarveError> {
    let reader = open(path)?;
    let mut n = 0usize;
    let mut entries: Vec<(usize, usize, f64)> = Vec::new();
    let mut header_seen = false;
    for (no, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| MeshCarveError::io(path.display().to_string(), e))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('%') {
            continue;
        }
        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        if !header_seen {
            if tokens.len() < 3 {
                return Err(parse_err(path, no + 1, "size line needs `M N nnz`"));
            }
            let rows: usize = tokens[0]
                .parse()
                .map_err(|_| parse_err(path, no + 1, "bad row count"))?;
            let cols: usize = tokens[1]
                .parse()
                .map_err(|_| parse_err(path, no + 1, "bad column count"))?;
            if rows != cols {
                return Err(parse_err(path, no + 1, "matrix must be square"));
            }
            n = rows;
            header_seen = true;
            continue;
        }
        if tokens.len() < 2 {
            return Err(parse_err(path, no + 1, "entry needs `i j [v]`"));
        }
        let i: usize = tokens[0]
            .parse()
            .map_err(|_| parse_err(path, no + 1, "bad row index"))?;
        let j: usize = tokens[1]
            .parse()
            .map_err(|_| parse_err(path, no + 1, "bad column index"))?;
        let v: f64 = tokens
            .get(2)
            .map_or(Ok(1.0), |t| t.parse())
            .map_err(|_| parse_err(path, no + 1, "bad value"))?;
        if i == 0 || i > n || j == 0 || j > n {
            return Err(parse_err(path, no + 1, "index out of range"));
        }
        if i != j {
            entries.push((i - 1, j - 1, v));
        }
    }
    if !header_seen {
        return Err(parse_err(path, 1, "missing size line"));
    }
    // mirror into both triangles, last value wins for duplicates
    let mut rows: Vec<std::collections::BTreeMap<usize, f64>> =
        vec![std::collections::BTreeMap::new(); n];
    for (i, j, v) in entries {
        rows[i].insert(j, v);
        rows[j].insert(i, v);
    }
    let mut full_ia = Vec::with_capacity(n + 1);
    let mut full_ja = Vec::new();
    let mut full_values = Vec::new();
    full_ia.push(0);
    for row in rows {
        for (j, v) in row {
            full_ja.push(j);
            full_values.push(v);
        }
        full_ia.push(full_ja.len());
    }
    let dist = Distribution::block(comm, n);
    DistGraph::from_replicated(dist, &full_ia, &full_ja, &full_values)
}

/// Read coordinates, one point per line with at least `dim` floats
/// (replicated read: every rank parses the file and keeps the rows of
/// `dist`).
pub fn read_coords_xyz(
    path: &Path,
    dist: &Arc<Distribution>,
    dim: usize,
) -> Result<Vec<DistVector<f64>>, MeshCarveError> {
    let reader = open(path)?;
    let n = dist.global_n();
    let mut full = vec![Vec::with_capacity(n); dim];
    let mut points = 0usize;
    for (no, line) in reader.lines().enumerate() {
        if points == n {
            break;
        }
        let line = line.map_err(|e| MeshCarveError::io(path.display().to_string(), e))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('%') {
            continue;
        }
        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        if tokens.len() < dim {
            return Err(parse_err(
                path,
                no + 1,
                &format!("point needs {dim} coordinates"),
            ));
        }
        for d in 0..dim {
            let x: f64 = tokens[d]
                .parse()
                .map_err(|_| parse_err(path, no + 1, "bad coordinate"))?;
            full[d].push(x);
        }
        points += 1;
    }
    if points != n {
        return Err(parse_err(
            path,
            1,
            &format!("expected {n} points, found {points}"),
        ));
    }
    full.into_iter()
        .map(|column| {
            let local: Vec<f64> = dist.owned_ids().iter().map(|&g| column[g]).collect();
            DistVector::new(Arc::clone(dist), local)
        })
        .collect()
}

/// Write the partition as one block id per line in global order (collective:
/// gathered at rank 0; other ranks write nothing).
pub fn write_partition<C: Communicator>(
    comm: &C,
    path: &Path,
    part: &DistVector<usize>,
) -> Result<(), MeshCarveError> {
    let dist = part.dist();
    let pairs: Vec<u64> = part
        .local()
        .iter()
        .enumerate()
        .flat_map(|(lid, &b)| [dist.local_to_global(lid) as u64, b as u64])
        .collect();
    let rows = gather_varlen(comm, 0, &pairs)?;
    if let Some(rows) = rows {
        let mut all: Vec<(u64, u64)> = rows
            .iter()
            .flat_map(|row| row.chunks_exact(2).map(|c| (c[0], c[1])))
            .collect();
        all.sort_unstable_by_key(|&(gid, _)| gid);
        let mut out = create(path)?;
        for (_, block) in all {
            writeln!(out, "{block}")
                .map_err(|e| MeshCarveError::io(path.display().to_string(), e))?;
        }
    }
    Ok(())
}

/// Export a replicated block graph in METIS format (rank 0 writes).
pub fn write_block_graph<C: Communicator>(
    comm: &C,
    path: &Path,
    graph: &BlockGraph,
) -> Result<(), MeshCarveError> {
    if comm.rank() != 0 {
        return Ok(());
    }
    let k = graph.k();
    let edges = graph.edges().len();
    let mut out = create(path)?;
    writeln!(out, "{k} {edges} 001").map_err(|e| MeshCarveError::io(path.display().to_string(), e))?;
    for a in 0..k {
        let (cols, weights) = graph.neighbors(a);
        let line: Vec<String> = cols
            .iter()
            .zip(weights)
            .filter(|(&b, _)| b != a)
            .map(|(&b, &w)| format!("{} {}", b + 1, w))
            .collect();
        writeln!(out, "{}", line.join(" "))
            .map_err(|e| MeshCarveError::io(path.display().to_string(), e))?;
    }
    Ok(())
}

/// Emit coordinates annotated with their block id, one `x [y z] block` line
/// per point in global order (gathered at rank 0).
pub fn write_debug_coordinates<C: Communicator>(
    comm: &C,
    path: &Path,
    coords: &[DistVector<f64>],
    part: &DistVector<usize>,
) -> Result<(), MeshCarveError> {
    let dim = coords.len();
    let dist = part.dist();
    let mut flat: Vec<f64> = Vec::with_capacity(part.local().len() * (dim + 2));
    for (lid, &b) in part.local().iter().enumerate() {
        flat.push(dist.local_to_global(lid) as f64);
        for c in coords {
            flat.push(c.local()[lid]);
        }
        flat.push(b as f64);
    }
    let rows = gather_varlen(comm, 0, &flat)?;
    if let Some(rows) = rows {
        let stride = dim + 2;
        let mut records: Vec<Vec<f64>> = rows
            .iter()
            .flat_map(|row| row.chunks_exact(stride).map(|c| c.to_vec()))
            .collect();
        records.sort_by(|a, b| a[0].partial_cmp(&b[0]).unwrap_or(std::cmp::Ordering::Equal));
        let mut out = create(path)?;
        for rec in records {
            let coords_txt: Vec<String> =
                rec[1..1 + dim].iter().map(|x| format!("{x}")).collect();
            writeln!(out, "{} {}", coords_txt.join(" "), rec[1 + dim] as usize)
                .map_err(|e| MeshCarveError::io(path.display().to_string(), e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;

    fn tmp(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("mesh_carve_io_{}_{name}", std::process::id()));
        p
    }

    #[test]
    fn metis_round_trip_of_a_path_graph() {
        let comm = NoComm;
        let path = tmp("path.graph");
        std::fs::write(&path, "4 3\n2\n1 3\n2 4\n3\n").unwrap();
        let g = read_graph_metis(&comm, &path).unwrap();
        assert_eq!(g.global_n(), 4);
        assert_eq!(g.local_nnz(), 6);
        assert_eq!(g.row(1).0, &[0, 2]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn metis_with_edge_weights() {
        let comm = NoComm;
        let path = tmp("weighted.graph");
        std::fs::write(&path, "3 2 001\n2 5\n1 5 3 2\n2 2\n").unwrap();
        let g = read_graph_metis(&comm, &path).unwrap();
        assert_eq!(g.row(0).1, &[5.0]);
        assert_eq!(g.row(1).1, &[5.0, 2.0]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn metis_rejects_inconsistent_header() {
        let comm = NoComm;
        let path = tmp("bad.graph");
        std::fs::write(&path, "4 9\n2\n1 3\n2 4\n3\n").unwrap();
        assert!(matches!(
            read_graph_metis(&comm, &path),
            Err(MeshCarveError::Input(_))
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn matrix_market_mirrors_single_triangle() {
        let comm = NoComm;
        let path = tmp("tri.mtx");
        std::fs::write(
            &path,
            "%%MatrixMarket matrix coordinate real symmetric\n3 3 2\n2 1 1.5\n3 2 2.5\n",
        )
        .unwrap();
        let g = read_graph_matrix_market(&comm, &path).unwrap();
        assert_eq!(g.global_n(), 3);
        assert_eq!(g.row(0).0, &[1]);
        assert_eq!(g.row(0).1, &[1.5]);
        assert_eq!(g.row(1).0, &[0, 2]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn coords_and_partition_round_trip() {
        let comm = NoComm;
        let cpath = tmp("coords.xyz");
        std::fs::write(&cpath, "0.0 0.0\n1.0 0.0\n0.0 1.0\n1.0 1.0\n").unwrap();
        let dist = Distribution::block(&comm, 4);
        let coords = read_coords_xyz(&cpath, &dist, 2).unwrap();
        assert_eq!(coords.len(), 2);
        assert_eq!(coords[0].local(), &[0.0, 1.0, 0.0, 1.0]);

        let part = DistVector::new(Arc::clone(&dist), vec![0, 1, 1, 0]).unwrap();
        let ppath = tmp("part.txt");
        write_partition(&comm, &ppath, &part).unwrap();
        let text = std::fs::read_to_string(&ppath).unwrap();
        assert_eq!(text, "0\n1\n1\n0\n");
        std::fs::remove_file(&cpath).ok();
        std::fs::remove_file(&ppath).ok();
    }
}
