//! Meshes and variable vectors shared by unit tests, integration tests and
//! benchmarks.

use std::sync::Arc;

use rand::prelude::*;

use crate::mesh::TriMesh;
use crate::objective::Objective;
use crate::Error;

/// Two triangles covering `[0, 1]²`.
pub fn make_unit_square() -> TriMesh {
    TriMesh::from_planar(
        &[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]],
        vec![[0, 1, 2], [0, 2, 3]],
    )
}

/// A closed tetrahedron with outward facing triangles.
pub fn make_tetrahedron() -> TriMesh {
    TriMesh::new(
        vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
        ],
        vec![[0, 2, 1], [0, 1, 3], [0, 3, 2], [1, 2, 3]],
    )
}

/// Tetrahedron surface with the bottom face removed, leaving a single
/// boundary loop.
pub fn make_open_tetrahedron() -> TriMesh {
    let mut mesh = make_tetrahedron();
    mesh.faces.remove(0);
    mesh
}

/// A regular triangulated grid of `nx` by `ny` cells covering `[0, 1]²`.
///
/// Vertex `(i, j)` has index `j * (nx + 1) + i`.
pub fn make_grid(nx: usize, ny: usize) -> TriMesh {
    let mut vertices = Vec::with_capacity((nx + 1) * (ny + 1));
    for j in 0..=ny {
        for i in 0..=nx {
            vertices.push([i as f64 / nx as f64, j as f64 / ny as f64]);
        }
    }
    let idx = |i: usize, j: usize| j * (nx + 1) + i;
    let mut faces = Vec::with_capacity(2 * nx * ny);
    for j in 0..ny {
        for i in 0..nx {
            faces.push([idx(i, j), idx(i + 1, j), idx(i + 1, j + 1)]);
            faces.push([idx(i, j), idx(i + 1, j + 1), idx(i, j + 1)]);
        }
    }
    TriMesh::from_planar(&vertices, faces)
}

/// A grid lifted out of the plane by a smooth bump.
pub fn make_bumpy_grid(nx: usize, ny: usize) -> TriMesh {
    let mut mesh = make_grid(nx, ny);
    for p in mesh.vertices.iter_mut() {
        p[2] = 0.3 * (std::f64::consts::PI * p[0]).sin() * (std::f64::consts::PI * p[1]).sin()
            + 0.1 * p[0];
    }
    mesh
}

/// Variable vector `[x(n), y(n)]` taking the first two coordinates of each
/// vertex.
pub fn identity_uv(mesh: &TriMesh) -> Vec<f64> {
    let mut x: Vec<f64> = mesh.vertices.iter().map(|p| p[0]).collect();
    x.extend(mesh.vertices.iter().map(|p| p[1]));
    x
}

/// A copy of `x` with every entry shifted uniformly in `[-amount, amount]`.
pub fn perturbed(x: &[f64], amount: f64, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    x.iter()
        .map(|&v| v + rng.gen_range(-amount..=amount))
        .collect()
}

/// Bind the mesh and initialize the given objective.
pub fn init_objective<O: Objective>(mut obj: O, mesh: &TriMesh) -> Result<O, Error> {
    obj.init_mesh(Arc::new(mesh.clone()))?;
    obj.init()?;
    Ok(obj)
}
