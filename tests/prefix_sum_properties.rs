//! Global prefix sums across rank boundaries.

use mesh_carve::algs::collective::{global_prefix_sum_f64, global_prefix_sum_i64};
use mesh_carve::algs::communicator::run_spmd;
use mesh_carve::prelude::Communicator;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]
    #[test]
    fn matches_the_serial_scan(
        values in proptest::collection::vec(-50i64..50, 1..60),
        ranks in 1usize..5,
    ) {
        // deal the values onto `ranks` contiguous chunks
        let chunk = values.len().div_ceil(ranks);
        let per_rank: Vec<Vec<i64>> = (0..ranks)
            .map(|r| {
                values
                    .iter()
                    .skip(r * chunk)
                    .take(chunk)
                    .copied()
                    .collect()
            })
            .collect();
        let expect: Vec<i64> = values
            .iter()
            .scan(0i64, |acc, &v| {
                *acc += v;
                Some(*acc)
            })
            .collect();
        let per_rank_for_run = per_rank.clone();
        let results = run_spmd(ranks, move |comm| {
            global_prefix_sum_i64(&comm, &per_rank_for_run[comm.rank()], 0).unwrap()
        });
        let got: Vec<i64> = results.into_iter().flatten().collect();
        prop_assert_eq!(got, expect);
    }
}

#[test]
fn offset_shifts_every_entry() {
    let results = run_spmd(3, |comm| {
        let local = vec![1i64; comm.rank() + 1];
        global_prefix_sum_i64(&comm, &local, -1).unwrap()
    });
    let got: Vec<i64> = results.into_iter().flatten().collect();
    // 6 ones, inclusive scan minus one: contracted-id numbering from 0
    assert_eq!(got, vec![0, 1, 2, 3, 4, 5]);
}

#[test]
fn float_prefix_handles_uneven_ranks() {
    let per_rank = vec![vec![0.5f64, 1.5], vec![], vec![2.0, 0.25, 0.25]];
    let per_rank_for_run = per_rank.clone();
    let results = run_spmd(3, move |comm| {
        global_prefix_sum_f64(&comm, &per_rank_for_run[comm.rank()]).unwrap()
    });
    let got: Vec<f64> = results.into_iter().flatten().collect();
    let expect = [0.5, 2.0, 4.0, 4.25, 4.5];
    for (g, e) in got.iter().zip(expect) {
        assert!((g - e).abs() < 1e-12);
    }
}

#[test]
fn empty_local_slices_are_fine() {
    let results = run_spmd(2, |comm| {
        let local: Vec<i64> = if comm.rank() == 0 { vec![] } else { vec![7, 7] };
        global_prefix_sum_i64(&comm, &local, 0).unwrap()
    });
    assert_eq!(results[0], Vec::<i64>::new());
    assert_eq!(results[1], vec![7, 14]);
}
