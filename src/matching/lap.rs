//! Exact minimum-cost assignment (Hungarian method with potentials).
//!
//! `O(n³)` on an `n × n` matrix. Deterministic: rows are inserted in index
//! order and the lowest-index column wins every tie, so identical input
//! always yields the identical assignment.
//!
//! The final row/column potentials are an optimal dual. An edge is *tight*
//! when its reduced cost `c[i][j] - u[i] - v[j]` is zero, and every optimal
//! assignment uses tight edges only. That is what [`ambiguous_rows`] relies
//! on to find rows whose column could change without raising the total.

use super::cost::CostMatrix;

const TIGHT_EPS: f64 = 1e-9;

/// Solution of a square assignment problem.
#[derive(Debug, Clone)]
pub struct Assignment {
    /// Column assigned to each row.
    pub row_to_col: Vec<usize>,
    pub total_cost: f64,
    row_potential: Vec<f64>,
    col_potential: Vec<f64>,
}

impl Assignment {
    fn is_tight(&self, cost: &CostMatrix, row: usize, col: usize) -> bool {
        let c = cost.get(row, col);
        let (u, v) = (self.row_potential[row], self.col_potential[col]);
        let reduced = c - u - v;
        reduced.abs() <= TIGHT_EPS * (1.0 + c.abs() + u.abs() + v.abs())
    }
}

/// Solve the assignment problem on a square matrix.
///
/// Pad rectangular problems with [`CostMatrix::padded_square`] first.
pub fn solve(cost: &CostMatrix) -> Assignment {
    let n = cost.rows();
    debug_assert_eq!(n, cost.cols(), "assignment matrix must be square");

    // 1-indexed; index 0 is the virtual column used while growing a path.
    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; n + 1];
    let mut owner = vec![0usize; n + 1];
    let mut way = vec![0usize; n + 1];

    for i in 1..=n {
        owner[0] = i;
        let mut j0 = 0usize;
        let mut min_v = vec![f64::INFINITY; n + 1];
        let mut used = vec![false; n + 1];

        loop {
            used[j0] = true;
            let i0 = owner[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;
            for j in 1..=n {
                if used[j] {
                    continue;
                }
                let reduced = cost.get(i0 - 1, j - 1) - u[i0] - v[j];
                if reduced < min_v[j] {
                    min_v[j] = reduced;
                    way[j] = j0;
                }
                if min_v[j] < delta {
                    delta = min_v[j];
                    j1 = j;
                }
            }
            for j in 0..=n {
                if used[j] {
                    u[owner[j]] += delta;
                    v[j] -= delta;
                } else {
                    min_v[j] -= delta;
                }
            }
            j0 = j1;
            if owner[j0] == 0 {
                break;
            }
        }

        // Flip the augmenting path.
        loop {
            let j1 = way[j0];
            owner[j0] = owner[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut row_to_col = vec![0usize; n];
    for j in 1..=n {
        if owner[j] != 0 {
            row_to_col[owner[j] - 1] = j - 1;
        }
    }
    let total_cost = cost.assignment_cost(&row_to_col);

    Assignment {
        row_to_col,
        total_cost,
        row_potential: u[1..].to_vec(),
        col_potential: v[1..].to_vec(),
    }
}

/// Rows whose column differs in at least one other optimal assignment.
///
/// Row `i` points at row `k` when `i` could take `k`'s column on a tight
/// edge. A row is ambiguous exactly when it lies on a cycle of that graph,
/// i.e. its strongly connected component has more than one member.
pub fn ambiguous_rows(cost: &CostMatrix, assignment: &Assignment) -> Vec<bool> {
    let n = assignment.row_to_col.len();
    let adj: Vec<Vec<usize>> = (0..n)
        .map(|i| {
            (0..n)
                .filter(|&k| k != i && assignment.is_tight(cost, i, assignment.row_to_col[k]))
                .collect()
        })
        .collect();

    let comp = strongly_connected(&adj);
    let mut size = vec![0usize; n];
    for &c in &comp {
        size[c] += 1;
    }
    comp.iter().map(|&c| size[c] > 1).collect()
}

/// Kosaraju's algorithm, iterative. Returns a component id per node.
fn strongly_connected(adj: &[Vec<usize>]) -> Vec<usize> {
    let n = adj.len();

    let mut visited = vec![false; n];
    let mut finish = Vec::with_capacity(n);
    for s in 0..n {
        if visited[s] {
            continue;
        }
        visited[s] = true;
        let mut stack = vec![(s, 0usize)];
        while let Some((node, next)) = stack.pop() {
            if let Some(&w) = adj[node].get(next) {
                stack.push((node, next + 1));
                if !visited[w] {
                    visited[w] = true;
                    stack.push((w, 0));
                }
            } else {
                finish.push(node);
            }
        }
    }

    let mut reverse = vec![Vec::new(); n];
    for (node, out) in adj.iter().enumerate() {
        for &w in out {
            reverse[w].push(node);
        }
    }

    let mut comp = vec![usize::MAX; n];
    let mut next_id = 0;
    for &s in finish.iter().rev() {
        if comp[s] != usize::MAX {
            continue;
        }
        comp[s] = next_id;
        let mut stack = vec![s];
        while let Some(node) = stack.pop() {
            for &w in &reverse[node] {
                if comp[w] == usize::MAX {
                    comp[w] = next_id;
                    stack.push(w);
                }
            }
        }
        next_id += 1;
    }
    comp
}
