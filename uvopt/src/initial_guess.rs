//! Starting points for the solver.

use rand::prelude::*;
use serde::{Deserialize, Serialize};
use sprs::{CsMat, FillInReduction, SymmetryCheck, TriMat};
use sprs_ldl::Ldl;

use crate::mesh::TriMesh;
use crate::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitialGuess {
    /// Uniformly random coordinates in `[-1, 1]`.
    Random { seed: u64 },
    /// Tutte embedding with the boundary pinned to the unit circle.
    Harmonic,
    /// Drop the `z` coordinate of every vertex.
    Identity,
}

impl Default for InitialGuess {
    fn default() -> Self {
        InitialGuess::Harmonic
    }
}

impl InitialGuess {
    /// Variable vector `[U(n), V(n)]` for the given mesh.
    pub fn compute(&self, mesh: &TriMesh) -> Result<Vec<f64>, Error> {
        match *self {
            InitialGuess::Random { seed } => Ok(random(mesh, seed)),
            InitialGuess::Harmonic => harmonic(mesh),
            InitialGuess::Identity => Ok(identity(mesh)),
        }
    }
}

/// Convert per-vertex UV points into the `[U(n), V(n)]` layout.
pub fn flatten_uv(uv: &[[f64; 2]]) -> Vec<f64> {
    let mut x: Vec<f64> = uv.iter().map(|p| p[0]).collect();
    x.extend(uv.iter().map(|p| p[1]));
    x
}

/// Per-vertex UV points of the first `2 * num_vertices` entries of `x`.
pub fn unflatten_uv(x: &[f64], num_vertices: usize) -> Vec<[f64; 2]> {
    let n = num_vertices.min(x.len() / 2);
    (0..n).map(|i| [x[i], x[num_vertices + i]]).collect()
}

pub fn identity(mesh: &TriMesh) -> Vec<f64> {
    let uv: Vec<[f64; 2]> = mesh.vertices.iter().map(|p| [p[0], p[1]]).collect();
    flatten_uv(&uv)
}

pub fn random(mesh: &TriMesh, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..2 * mesh.num_vertices())
        .map(|_| rng.gen_range(-1.0..=1.0))
        .collect()
}

/// Uniform weight harmonic embedding.
///
/// The longest boundary loop is mapped onto the unit circle proportionally
/// to arc length and every interior vertex is placed at the average of its
/// neighbours. Vertices not attached to any edge are placed at the origin.
pub fn harmonic(mesh: &TriMesh) -> Result<Vec<f64>, Error> {
    mesh.validate()?;
    let n = mesh.num_vertices();
    let boundary = mesh.boundary_loop().ok_or(Error::NoBoundary)?;

    let mut uv = vec![[0.0; 2]; n];
    let mut pinned = vec![false; n];

    let dist = |a: usize, b: usize| {
        let (p, q) = (mesh.vertices[a], mesh.vertices[b]);
        ((p[0] - q[0]).powi(2) + (p[1] - q[1]).powi(2) + (p[2] - q[2]).powi(2)).sqrt()
    };
    let lengths: Vec<f64> = (0..boundary.len())
        .map(|i| dist(boundary[i], boundary[(i + 1) % boundary.len()]))
        .collect();
    let perimeter: f64 = lengths.iter().sum();
    let mut arc = 0.0;
    for (i, &v) in boundary.iter().enumerate() {
        let t = if perimeter > 0.0 {
            arc / perimeter
        } else {
            i as f64 / boundary.len() as f64
        };
        let angle = 2.0 * std::f64::consts::PI * t;
        uv[v] = [angle.cos(), angle.sin()];
        pinned[v] = true;
        arc += lengths[i];
    }

    let neighbours = mesh.vertex_neighbours();
    let free: Vec<usize> = (0..n)
        .filter(|&v| !pinned[v] && !neighbours[v].is_empty())
        .collect();
    if free.is_empty() {
        return Ok(flatten_uv(&uv));
    }
    let mut index = vec![usize::MAX; n];
    for (i, &v) in free.iter().enumerate() {
        index[v] = i;
    }

    let m = free.len();
    let mut laplacian = TriMat::new((m, m));
    let mut rhs = [vec![0.0; m], vec![0.0; m]];
    for (i, &v) in free.iter().enumerate() {
        laplacian.add_triplet(i, i, neighbours[v].len() as f64);
        for &w in neighbours[v].iter() {
            if pinned[w] {
                rhs[0][i] += uv[w][0];
                rhs[1][i] += uv[w][1];
            } else {
                laplacian.add_triplet(i, index[w], -1.0);
            }
        }
    }
    if m == 1 {
        // A single free vertex has only pinned neighbours.
        let degree = neighbours[free[0]].len() as f64;
        uv[free[0]] = [rhs[0][0] / degree, rhs[1][0] / degree];
        return Ok(flatten_uv(&uv));
    }
    let laplacian: CsMat<f64> = laplacian.to_csc();
    let ldl = Ldl::new()
        .fill_in_reduction(FillInReduction::ReverseCuthillMcKee)
        .check_symmetry(SymmetryCheck::DontCheckSymmetry)
        .numeric(laplacian.view())
        .map_err(|err| {
            log::warn!("Harmonic system could not be factorized: {}", err);
            Error::Factorization
        })?;

    for (k, rhs) in rhs.iter().enumerate() {
        let sol = ldl.solve(rhs);
        if sol.iter().any(|v| !v.is_finite()) {
            return Err(Error::Factorization);
        }
        for (&v, &s) in free.iter().zip(sol.iter()) {
            uv[v][k] = s;
        }
    }
    Ok(flatten_uv(&uv))
}
