//! Distributed CSR adjacency.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::algs::collective::exchange_by_plan;
use crate::algs::communicator::Communicator;
use crate::carve_error::MeshCarveError;
use crate::dist::distribution::Distribution;

/// Symmetric sparse adjacency in CSR form, distributed by rows. Invariants:
/// edge (u,v) iff (v,u) with equal weight, non-negative weights, zero
/// diagonal. Column indices are global.
#[derive(Clone, Debug)]
pub struct DistGraph {
    dist: Arc<Distribution>,
    ia: Vec<usize>,
    ja: Vec<usize>,
    values: Vec<f64>,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct RowHeader {
    gid: u64,
    len: u64,
}

impl DistGraph {
    pub fn new(
        dist: Arc<Distribution>,
        ia: Vec<usize>,
        ja: Vec<usize>,
        values: Vec<f64>,
    ) -> Result<Self, MeshCarveError> {
        if ia.len() != dist.local_n() + 1 {
            return Err(MeshCarveError::DistributionMismatch(format!(
                "ia has {} entries for {} local rows",
                ia.len(),
                dist.local_n()
            )));
        }
        if ja.len() != *ia.last().unwrap_or(&0) || values.len() != ja.len() {
            return Err(MeshCarveError::Input(format!(
                "CSR arrays inconsistent: ia end {}, ja {}, values {}",
                ia.last().copied().unwrap_or(0),
                ja.len(),
                values.len()
            )));
        }
        let g = Self {
            dist,
            ia,
            ja,
            values,
        };
        g.validate_local()?;
        Ok(g)
    }

    /// Slice a replicated CSR (identical on every rank) into the local rows
    /// of `dist`.
    pub fn from_replicated(
        dist: Arc<Distribution>,
        full_ia: &[usize],
        full_ja: &[usize],
        full_values: &[f64],
    ) -> Result<Self, MeshCarveError> {
        if full_ia.len() != dist.global_n() + 1 {
            return Err(MeshCarveError::Input(format!(
                "replicated ia has {} entries for {} rows",
                full_ia.len(),
                dist.global_n()
            )));
        }
        let mut ia = Vec::with_capacity(dist.local_n() + 1);
        let mut ja = Vec::new();
        let mut values = Vec::new();
        ia.push(0);
        for gid in dist.owned_ids() {
            let (s, e) = (full_ia[gid], full_ia[gid + 1]);
            ja.extend_from_slice(&full_ja[s..e]);
            values.extend_from_slice(&full_values[s..e]);
            ia.push(ja.len());
        }
        Self::new(dist, ia, ja, values)
    }

    #[inline]
    pub fn dist(&self) -> &Arc<Distribution> {
        &self.dist
    }

    #[inline]
    pub fn global_n(&self) -> usize {
        self.dist.global_n()
    }

    #[inline]
    pub fn local_n(&self) -> usize {
        self.ia.len() - 1
    }

    #[inline]
    pub fn ia(&self) -> &[usize] {
        &self.ia
    }

    #[inline]
    pub fn ja(&self) -> &[usize] {
        &self.ja
    }

    #[inline]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Neighbour ids and edge weights of a local row.
    #[inline]
    pub fn row(&self, lid: usize) -> (&[usize], &[f64]) {
        let (s, e) = (self.ia[lid], self.ia[lid + 1]);
        (&self.ja[s..e], &self.values[s..e])
    }

    #[inline]
    pub fn degree(&self, lid: usize) -> usize {
        self.ia[lid + 1] - self.ia[lid]
    }

    /// Number of locally stored edge endpoints.
    #[inline]
    pub fn local_nnz(&self) -> usize {
        self.ja.len()
    }

    /// Assert that a co-distributed object shares this graph's layout.
    pub fn check_same_layout(
        &self,
        other: &Distribution,
        what: &str,
    ) -> Result<(), MeshCarveError> {
        if !self.dist.same_layout(other) {
            return Err(MeshCarveError::DistributionMismatch(format!(
                "{what} is not aligned with the graph rows"
            )));
        }
        Ok(())
    }

    /// Local structural checks: weights non-negative, diagonal zero, and
    /// symmetry for edges with both endpoints local. One-directional local
    /// pairs are an input error.
    pub fn validate_local(&self) -> Result<(), MeshCarveError> {
        for lid in 0..self.local_n() {
            let gid = self.dist.local_to_global(lid);
            let (cols, weights) = self.row(lid);
            for (&c, &w) in cols.iter().zip(weights) {
                if c == gid {
                    return Err(MeshCarveError::Input(format!(
                        "diagonal entry on row {gid}"
                    )));
                }
                if !(w >= 0.0) {
                    return Err(MeshCarveError::Input(format!(
                        "negative or NaN weight {w} on edge ({gid},{c})"
                    )));
                }
                if let Some(clid) = self.dist.global_to_local(c) {
                    let (back_cols, back_w) = self.row(clid);
                    match back_cols.iter().position(|&b| b == gid) {
                        // aggregated weights may differ by summation order
                        Some(j) if (back_w[j] - w).abs() <= 1e-9 * w.abs().max(1.0) => {}
                        Some(j) => {
                            return Err(MeshCarveError::Input(format!(
                                "asymmetric weight on edge ({gid},{c}): {w} vs {}",
                                back_w[j]
                            )))
                        }
                        None => {
                            return Err(MeshCarveError::Input(format!(
                                "edge ({gid},{c}) present in one direction only"
                            )))
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Move the graph onto `new_dist` (collective). Rows travel whole; the
    /// receiving side reassembles them in ascending global order, which is
    /// the local order of any distribution here.
    pub fn redistribute<C: Communicator>(
        &self,
        comm: &C,
        new_dist: Arc<Distribution>,
    ) -> Result<DistGraph, MeshCarveError> {
        let p = comm.size();
        let mut headers: Vec<Vec<RowHeader>> = (0..p).map(|_| Vec::new()).collect();
        let mut cols: Vec<Vec<u64>> = (0..p).map(|_| Vec::new()).collect();
        let mut weights: Vec<Vec<f64>> = (0..p).map(|_| Vec::new()).collect();
        for lid in 0..self.local_n() {
            let gid = self.dist.local_to_global(lid);
            let target = new_dist.owner_of(gid);
            let (c, w) = self.row(lid);
            headers[target].push(RowHeader {
                gid: gid as u64,
                len: c.len() as u64,
            });
            cols[target].extend(c.iter().map(|&x| x as u64));
            weights[target].extend_from_slice(w);
        }
        let headers = exchange_by_plan(comm, &headers)?;
        let cols = exchange_by_plan(comm, &cols)?;
        let weights = exchange_by_plan(comm, &weights)?;

        // splice incoming rows, then order them by global id
        let mut rows: Vec<(usize, Vec<usize>, Vec<f64>)> = Vec::new();
        for ((hs, cs), ws) in headers.iter().zip(&cols).zip(&weights) {
            let mut at = 0usize;
            for h in hs {
                let len = h.len as usize;
                rows.push((
                    h.gid as usize,
                    cs[at..at + len].iter().map(|&x| x as usize).collect(),
                    ws[at..at + len].to_vec(),
                ));
                at += len;
            }
        }
        rows.sort_unstable_by_key(|r| r.0);

        let mut ia = Vec::with_capacity(new_dist.local_n() + 1);
        let mut ja = Vec::new();
        let mut values = Vec::new();
        ia.push(0);
        for (gid, c, w) in rows {
            debug_assert_eq!(
                new_dist.global_to_local(gid),
                Some(ia.len() - 1),
                "row {gid} arrived out of place"
            );
            ja.extend_from_slice(&c);
            values.extend_from_slice(&w);
            ia.push(ja.len());
        }
        if ia.len() != new_dist.local_n() + 1 {
            return Err(MeshCarveError::DistributionMismatch(format!(
                "received {} rows, target layout owns {}",
                ia.len() - 1,
                new_dist.local_n()
            )));
        }
        DistGraph::new(new_dist, ia, ja, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::run_spmd;

    /// 4-cycle 0-1-2-3-0, unit weights, replicated CSR.
    fn cycle4() -> (Vec<usize>, Vec<usize>, Vec<f64>) {
        let ia = vec![0, 2, 4, 6, 8];
        let ja = vec![1, 3, 0, 2, 1, 3, 0, 2];
        let values = vec![1.0; 8];
        (ia, ja, values)
    }

    #[test]
    fn from_replicated_slices_rows() {
        let results = run_spmd(2, |comm| {
            let dist = Distribution::block(&comm, 4);
            let (ia, ja, values) = cycle4();
            let g = DistGraph::from_replicated(dist, &ia, &ja, &values).unwrap();
            (g.local_n(), g.local_nnz())
        });
        assert_eq!(results, vec![(2, 4), (2, 4)]);
    }

    #[test]
    fn rejects_one_directional_edge() {
        let dist = Distribution::serial(3);
        // edge (0,1) present only as 0 -> 1
        let ia = vec![0, 1, 1, 1];
        let ja = vec![1];
        let values = vec![1.0];
        let err = DistGraph::new(dist, ia, ja, values).unwrap_err();
        assert!(matches!(err, MeshCarveError::Input(_)));
    }

    #[test]
    fn rejects_diagonal() {
        let dist = Distribution::serial(2);
        let ia = vec![0, 1, 1];
        let ja = vec![0];
        let values = vec![1.0];
        assert!(DistGraph::new(dist, ia, ja, values).is_err());
    }

    #[test]
    fn redistribute_preserves_rows() {
        let results = run_spmd(2, |comm| {
            let dist = Distribution::block(&comm, 4);
            let (ia, ja, values) = cycle4();
            let g = DistGraph::from_replicated(dist, &ia, &ja, &values).unwrap();
            // reverse ownership
            let owned: Vec<usize> = if comm.rank() == 0 {
                vec![2, 3]
            } else {
                vec![0, 1]
            };
            let new_dist = Distribution::general(&comm, owned, 4).unwrap();
            let g2 = g.redistribute(&comm, new_dist).unwrap();
            let row0: Vec<usize> = g2.row(0).0.to_vec();
            (g2.local_n(), row0)
        });
        assert_eq!(results[0].0, 2);
        assert_eq!(results[0].1, vec![1, 3]); // row of vertex 2
        assert_eq!(results[1].1, vec![1, 3]); // row of vertex 0
    }
}
