//! Cubic B-spline basis over normalized time.

use nalgebra::DMatrix;

const DEGREE: usize = 3;

/// Clamped cubic B-spline basis on [0, 1] with equally spaced interior knots.
#[derive(Debug, Clone)]
pub struct BSplineBasis {
    size: usize,
    knots: Vec<f64>,
}

impl BSplineBasis {
    /// Basis with `size` functions. Needs at least `DEGREE + 1` functions.
    pub fn new(size: usize) -> Option<Self> {
        if size < DEGREE + 1 {
            return None;
        }
        let n_interior = size - DEGREE - 1;
        let mut knots = Vec::with_capacity(size + DEGREE + 1);
        knots.extend(std::iter::repeat(0.0).take(DEGREE + 1));
        for j in 1..=n_interior {
            knots.push(j as f64 / (n_interior + 1) as f64);
        }
        knots.extend(std::iter::repeat(1.0).take(DEGREE + 1));
        Some(Self { size, knots })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Values of all basis functions at `x` (clamped to [0, 1]).
    pub fn evaluate(&self, x: f64) -> Vec<f64> {
        let x = x.clamp(0.0, 1.0);
        let span = self.find_span(x);

        // de Boor / Cox recursion for the DEGREE + 1 non-zero functions
        let mut n = [0.0_f64; DEGREE + 1];
        let mut left = [0.0_f64; DEGREE + 1];
        let mut right = [0.0_f64; DEGREE + 1];
        n[0] = 1.0;
        for j in 1..=DEGREE {
            left[j] = x - self.knots[span + 1 - j];
            right[j] = self.knots[span + j] - x;
            let mut saved = 0.0;
            for r in 0..j {
                let denom = right[r + 1] + left[j - r];
                let temp = if denom == 0.0 { 0.0 } else { n[r] / denom };
                n[r] = saved + right[r + 1] * temp;
                saved = left[j - r] * temp;
            }
            n[j] = saved;
        }

        let mut out = vec![0.0; self.size];
        for (r, value) in n.iter().enumerate() {
            out[span - DEGREE + r] = *value;
        }
        out
    }

    fn find_span(&self, x: f64) -> usize {
        if x >= 1.0 {
            return self.size - 1;
        }
        let mut span = DEGREE;
        while span < self.size - 1 && x >= self.knots[span + 1] {
            span += 1;
        }
        span
    }

    /// Raw basis evaluated at every time point (rows = points).
    pub fn design(&self, times: &[f64]) -> DMatrix<f64> {
        let mut m = DMatrix::zeros(times.len(), self.size);
        for (i, &t) in times.iter().enumerate() {
            for (j, v) in self.evaluate(t).into_iter().enumerate() {
                m[(i, j)] = v;
            }
        }
        m
    }

    /// Column-centered basis with the last column dropped: `size - 1`
    /// columns identifiable alongside an intercept.
    pub fn centered_design(&self, times: &[f64]) -> DMatrix<f64> {
        let raw = self.design(times);
        let n = times.len().max(1) as f64;
        let mut out = raw.columns(0, self.size - 1).into_owned();
        for mut col in out.column_iter_mut() {
            let mean = col.sum() / n;
            col.add_scalar_mut(-mean);
        }
        out
    }
}
