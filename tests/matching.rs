//! Integration tests for paper-to-student matching.
//!
//! The exact solver is checked against brute force on small random
//! matrices; the batch entry point is checked on hand-built classifier
//! output.

use exam_ingest::matching::{greedy, lap, CostMatrix, INFEASIBLE_COST};
use exam_ingest::{
    match_papers, ClasslistEntry, MatchConfig, MatchError, MatchRequest, Method, PaperDigits,
    TieBreak,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ── Test helpers ─────────────────────────────────────────────────────────────

fn permutations(n: usize) -> Vec<Vec<usize>> {
    fn go(prefix: &mut Vec<usize>, used: &mut [bool], out: &mut Vec<Vec<usize>>) {
        if prefix.len() == used.len() {
            out.push(prefix.clone());
            return;
        }
        for i in 0..used.len() {
            if !used[i] {
                used[i] = true;
                prefix.push(i);
                go(prefix, used, out);
                prefix.pop();
                used[i] = false;
            }
        }
    }
    let mut out = Vec::new();
    go(&mut Vec::new(), &mut vec![false; n], &mut out);
    out
}

fn brute_force_min(m: &CostMatrix) -> f64 {
    permutations(m.rows())
        .iter()
        .map(|p| m.assignment_cost(p))
        .fold(f64::INFINITY, f64::min)
}

/// Scores that strongly favour the digits of `id`.
fn confident(paper: u32, id: &str) -> PaperDigits {
    PaperDigits {
        paper_number: paper,
        digits: id
            .bytes()
            .map(|b| {
                let mut s = [(0.01f64).ln(); 10];
                s[(b - b'0') as usize] = (0.91f64).ln();
                Some(s)
            })
            .collect(),
    }
}

fn student(id: &str, name: &str) -> ClasslistEntry {
    ClasslistEntry {
        student_id: id.into(),
        student_name: name.into(),
    }
}

// ── Exact assignment ─────────────────────────────────────────────────────────

#[test]
fn lap_matches_brute_force_on_random_matrices() {
    let mut rng = StdRng::seed_from_u64(0x9E37_79B9_7F4A_7C15);
    for trial in 0..200 {
        let n = rng.gen_range(1..=6usize);
        let rows: Vec<Vec<f64>> = (0..n)
            .map(|_| (0..n).map(|_| f64::from(rng.gen_range(0..50u32)) / 4.0).collect())
            .collect();
        let m = CostMatrix::from_rows(&rows);

        let a = lap::solve(&m);
        let mut cols = a.row_to_col.clone();
        cols.sort_unstable();
        assert_eq!(cols, (0..n).collect::<Vec<_>>(), "trial {trial}: not a permutation");

        let best = brute_force_min(&m);
        assert!(
            (m.assignment_cost(&a.row_to_col) - best).abs() < 1e-9,
            "trial {trial}: lap {} vs brute force {best}",
            a.total_cost
        );
    }
}

#[test]
fn padded_lap_matches_brute_force_with_infeasible_pairs() {
    let mut rng = StdRng::seed_from_u64(7);
    for trial in 0..300 {
        let (r, c) = (rng.gen_range(1..=6usize), rng.gen_range(1..=6usize));
        let rows: Vec<Vec<f64>> = (0..r)
            .map(|_| {
                (0..c)
                    .map(|_| {
                        if rng.gen_bool(0.3) {
                            INFEASIBLE_COST
                        } else {
                            f64::from(rng.gen_range(0..40u32)) / 4.0
                        }
                    })
                    .collect()
            })
            .collect();
        let square = CostMatrix::from_rows(&rows).padded_square();
        assert_eq!(square.rows(), r.max(c));

        let a = lap::solve(&square);
        let got = square.assignment_cost(&a.row_to_col);
        let best = brute_force_min(&square);
        assert!(
            (got - best).abs() <= 1e-9 * best.abs().max(1.0),
            "trial {trial} ({r}x{c}): lap {got} vs brute force {best}"
        );
    }
}

#[test]
fn lap_picks_the_diagonal() {
    let m = CostMatrix::from_rows(&[[1.0, 9.0, 9.0], [9.0, 1.0, 9.0], [9.0, 9.0, 1.0]]);
    let a = lap::solve(&m);
    assert_eq!(a.row_to_col, vec![0, 1, 2]);
    assert!((a.total_cost - 3.0).abs() < 1e-9);
}

#[test]
fn greedy_never_beats_lap() {
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..100 {
        let n = rng.gen_range(2..=5usize);
        let rows: Vec<Vec<f64>> = (0..n)
            .map(|_| (0..n).map(|_| f64::from(rng.gen_range(0..20u32))).collect())
            .collect();
        let m = CostMatrix::from_rows(&rows);

        let exact = lap::solve(&m).total_cost;
        let picks = greedy::solve(&m);
        let greedy_cost: f64 = picks
            .iter()
            .enumerate()
            .filter_map(|(r, c)| c.map(|c| m.get(r, c)))
            .sum();
        // square and fully feasible: greedy assigns every row
        assert!(picks.iter().all(Option::is_some));
        assert!(greedy_cost + 1e-9 >= exact);
    }
}

// ── Batch matching ───────────────────────────────────────────────────────────

#[test]
fn batch_assigns_each_paper_its_own_student() {
    let roster = vec![
        student("10000001", "Ada Lovelace"),
        student("10000002", "Alan Turing"),
        student("10000003", "Grace Hopper"),
    ];
    let request = MatchRequest {
        papers: vec![
            confident(3, "10000003"),
            confident(1, "10000001"),
            confident(2, "10000002"),
        ],
        roster,
        ..Default::default()
    };
    let report = match_papers(&request, &MatchConfig::default());

    assert!(report.errors.is_empty());
    let lap: Vec<(u32, &str)> = report
        .by_method(Method::Lap)
        .map(|p| (p.paper_number, p.predicted_student_id.as_str()))
        .collect();
    assert_eq!(
        lap,
        vec![(1, "10000001"), (2, "10000002"), (3, "10000003")]
    );
    assert!(report.by_method(Method::Lap).all(|p| !p.needs_review));
    assert_eq!(report.by_method(Method::Greedy).count(), 3);
}

#[test]
fn no_length_compatible_ids_makes_every_paper_infeasible() {
    let request = MatchRequest {
        papers: vec![confident(1, "12345678"), confident(2, "87654321")],
        roster: vec![student("123456", "Short Id"), student("654321", "Also Short")],
        ..Default::default()
    };
    let report = match_papers(&request, &MatchConfig::default());

    assert!(report.predictions.is_empty());
    assert_eq!(
        report.errors,
        vec![
            MatchError::AssignmentInfeasible { paper: 1 },
            MatchError::AssignmentInfeasible { paper: 2 },
        ]
    );
}

#[test]
fn more_papers_than_students_leaves_the_worst_fit_unassigned() {
    let request = MatchRequest {
        papers: vec![confident(1, "11111111"), confident(2, "22222222")],
        roster: vec![student("11111111", "Only Student")],
        ..Default::default()
    };
    let report = match_papers(&request, &MatchConfig::default());

    let lap: Vec<_> = report.by_method(Method::Lap).collect();
    assert_eq!(lap.len(), 1);
    assert_eq!(lap[0].paper_number, 1);
    assert_eq!(report.errors, vec![MatchError::RosterExhausted { paper: 2 }]);
}

#[test]
fn solver_order_tie_break_does_not_flag_ties() {
    // Both papers read identically, so the two optimal assignments tie.
    let blurred = |paper| confident(paper, "12345678");
    let request = MatchRequest {
        papers: vec![blurred(1), blurred(2)],
        roster: vec![student("12345678", "A"), student("12345679", "B")],
        ..Default::default()
    };
    let config = MatchConfig {
        review_cost_threshold: f64::MAX,
        tie_break: TieBreak::SolverOrder,
        run_greedy: false,
    };
    let report = match_papers(&request, &config);

    assert_eq!(report.predictions.len(), 2);
    assert!(report.predictions.iter().all(|p| !p.needs_review));
    assert_eq!(report.by_method(Method::Greedy).count(), 0);
}
