//! Backtracking line search with an optional cap on the step size that keeps
//! every face from flipping orientation.

use serde::{Deserialize, Serialize};

use crate::mesh::TriMesh;
use crate::objective::{Objective, UpdateOptions};
use crate::Error;

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineSearchParams {
    /// Number of trial points evaluated before giving up.
    pub max_backtracking_iterations: u32,
    /// Cap the initial step by the largest step for which no face flips.
    pub flip_avoiding: bool,
    /// Fraction of the flip-free step bound used as the initial step.
    pub safety_factor: f64,
    /// Factor by which the step shrinks after each rejected trial.
    pub step_factor: f64,
    /// Armijo coefficient `c`. A trial step `α` is accepted when
    /// `f(x + αp) < f(x) + cα∇fᵀp`; zero requires plain decrease.
    pub armijo_coefficient: f64,
}

impl Default for LineSearchParams {
    fn default() -> Self {
        LineSearchParams {
            max_backtracking_iterations: 10,
            flip_avoiding: false,
            safety_factor: 0.8,
            step_factor: 0.5,
            armijo_coefficient: 0.0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LineSearchResult {
    /// Step used to produce the final point.
    pub step_size: f64,
    /// Objective value at the final point.
    pub value: f64,
    /// Number of trial points evaluated.
    pub trials: u32,
    /// Whether the final point satisfies the decrease condition.
    pub decreased: bool,
}

/// Connectivity used by the flip-avoiding step bound.
#[derive(Clone, Debug)]
struct FlipGuard {
    faces: Vec<[usize; 3]>,
    num_vertices: usize,
}

#[derive(Clone, Debug, Default)]
pub struct LineSearch {
    pub params: LineSearchParams,
    guard: Option<FlipGuard>,
}

impl LineSearch {
    pub fn new(params: LineSearchParams) -> Self {
        LineSearch {
            params,
            guard: None,
        }
    }

    /// Bound steps so that no face of the given mesh is inverted.
    pub fn enable_flip_avoiding(&mut self, mesh: &TriMesh) {
        self.guard = Some(FlipGuard {
            faces: mesh.faces.clone(),
            num_vertices: mesh.num_vertices(),
        });
        self.params.flip_avoiding = true;
    }

    pub fn disable_flip_avoiding(&mut self) {
        self.params.flip_avoiding = false;
    }

    pub fn is_flip_avoiding(&self) -> bool {
        self.params.flip_avoiding && self.guard.is_some()
    }

    /// The first trial step along `p` from `x`.
    pub fn initial_step(&self, x: &[f64], p: &[f64]) -> f64 {
        match &self.guard {
            Some(guard) if self.params.flip_avoiding => {
                let bound = max_step_before_flip(&guard.faces, guard.num_vertices, x, p);
                (self.params.safety_factor * bound).min(1.0)
            }
            _ => 1.0,
        }
    }

    /// Backtrack along `p` from `x`, where the objective has value `value` and
    /// directional derivative `slope`.
    ///
    /// `x` is overwritten with the last evaluated trial point, which is the
    /// accepted point on success. Trial points are evaluated with value-only
    /// updates.
    pub fn search<O: Objective + ?Sized>(
        &self,
        objective: &O,
        x: &mut [f64],
        p: &[f64],
        value: f64,
        slope: f64,
    ) -> Result<LineSearchResult, Error> {
        let mut result = LineSearchResult {
            step_size: 0.0,
            value,
            trials: 0,
            decreased: false,
        };
        if self.params.max_backtracking_iterations == 0 {
            return Ok(result);
        }

        let x0 = x.to_vec();
        let c = self.params.armijo_coefficient;
        let mut step = self.initial_step(&x0, p);
        for _ in 0..self.params.max_backtracking_iterations {
            for ((xi, &x0i), &pi) in x.iter_mut().zip(x0.iter()).zip(p.iter()) {
                *xi = x0i + step * pi;
            }
            objective.update(x, UpdateOptions::VALUE)?;
            result.value = objective.value();
            result.step_size = step;
            result.trials += 1;
            log::trace!(
                "line search trial {}: step {:.3e}, value {:.6e}",
                result.trials,
                step,
                result.value
            );
            if result.value < value + c * step * slope {
                result.decreased = true;
                break;
            }
            step *= self.params.step_factor;
        }

        if !result.decreased {
            log::warn!(
                "Line search did not decrease the objective after {} trials (value {:.6e} -> {:.6e})",
                result.trials,
                value,
                result.value
            );
        }
        Ok(result)
    }
}

/// The largest step `t` along `p` from `x` before any face changes
/// orientation, or infinity if no face ever flips.
///
/// For a face with UV edge vectors `e1, e2` and direction edge vectors
/// `f1, f2` the signed area along the step is the quadratic
/// `cross(e1 + t f1, e2 + t f2)`.
pub fn max_step_before_flip(faces: &[[usize; 3]], num_vertices: usize, x: &[f64], p: &[f64]) -> f64 {
    let n = num_vertices;
    let cross = |a: [f64; 2], b: [f64; 2]| a[0] * b[1] - a[1] * b[0];
    faces
        .iter()
        .map(|&[i, j, k]| {
            let e1 = [x[j] - x[i], x[n + j] - x[n + i]];
            let e2 = [x[k] - x[i], x[n + k] - x[n + i]];
            let f1 = [p[j] - p[i], p[n + j] - p[n + i]];
            let f2 = [p[k] - p[i], p[n + k] - p[n + i]];
            let a = cross(f1, f2);
            let b = cross(e1, f2) + cross(f1, e2);
            let c = cross(e1, e2);
            smallest_positive_root(a, b, c)
        })
        .fold(f64::INFINITY, f64::min)
}

/// Smallest strictly positive root of `a t² + b t + c`, or infinity if there
/// is none. Double roots only touch zero and are ignored.
fn smallest_positive_root(a: f64, b: f64, c: f64) -> f64 {
    let positive = |t: f64| if t > 0.0 && t.is_finite() { t } else { f64::INFINITY };
    if a == 0.0 {
        if b == 0.0 {
            return f64::INFINITY;
        }
        return positive(-c / b);
    }
    let disc = b * b - 4.0 * a * c;
    if disc <= 0.0 {
        return f64::INFINITY;
    }
    // Numerically stable pair of roots.
    let q = -0.5 * (b + b.signum() * disc.sqrt());
    let r1 = q / a;
    let r2 = if q != 0.0 { c / q } else { f64::INFINITY };
    positive(r1).min(positive(r2))
}
