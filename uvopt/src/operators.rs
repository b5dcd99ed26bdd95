//! Discrete surface gradient operators.
//!
//! For a face with vertices `v0, v1, v2` the operators give the gradient of
//! each linear hat function expressed in an orthonormal frame tangent to the
//! face. Applying `Dx` and `Dy` to a per-vertex scalar field gives the two
//! components of its (constant) gradient over the face.

use na::{Vector2, Vector3};
use rayon::prelude::*;

use crate::mesh::TriMesh;

/// Per-face surface gradient operators and face areas.
///
/// Degenerate faces carry zero operators and zero area so they contribute
/// nothing to any energy.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiscreteOperators {
    pub dx: Vec<[f64; 3]>,
    pub dy: Vec<[f64; 3]>,
    pub areas: Vec<f64>,
}

impl DiscreteOperators {
    pub fn new(mesh: &TriMesh) -> Self {
        let per_face: Vec<_> = mesh
            .faces
            .par_iter()
            .map(|face| {
                let [p0, p1, p2] = face.map(|v| Vector3::from(mesh.vertices[v]));
                face_operators(p0, p1, p2)
            })
            .collect();

        let mut ops = DiscreteOperators {
            dx: Vec::with_capacity(per_face.len()),
            dy: Vec::with_capacity(per_face.len()),
            areas: Vec::with_capacity(per_face.len()),
        };

        let mut num_degenerate = 0;
        for (fidx, entry) in per_face.into_iter().enumerate() {
            let (dx, dy, area) = entry.unwrap_or_else(|| {
                log::debug!("Face {} is degenerate", fidx);
                num_degenerate += 1;
                ([0.0; 3], [0.0; 3], 0.0)
            });
            ops.dx.push(dx);
            ops.dy.push(dy);
            ops.areas.push(area);
        }

        if num_degenerate > 0 {
            log::warn!(
                "{} degenerate faces found; they will not contribute to any energy",
                num_degenerate
            );
        }
        ops
    }

    pub fn num_faces(&self) -> usize {
        self.areas.len()
    }

    pub fn degenerate_faces(&self) -> Vec<usize> {
        self.areas
            .iter()
            .enumerate()
            .filter(|(_, &a)| a <= 0.0)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Returns `None` for faces with (numerically) zero area.
fn face_operators(
    p0: Vector3<f64>,
    p1: Vector3<f64>,
    p2: Vector3<f64>,
) -> Option<([f64; 3], [f64; 3], f64)> {
    let e1 = p1 - p0;
    let e2 = p2 - p0;
    let n = e1.cross(&e2);
    let double_area = n.norm();
    let scale = e1.norm_squared().max(e2.norm_squared());
    if !double_area.is_finite() || double_area <= f64::EPSILON * scale {
        return None;
    }

    // Local frame: x along the first edge, y completes a right handed frame
    // with the face normal.
    let len1 = e1.norm();
    let x_axis = e1 / len1;
    let y_axis = n.cross(&e1).normalize();

    let q = [
        Vector2::zeros(),
        Vector2::new(len1, 0.0),
        Vector2::new(e2.dot(&x_axis), e2.dot(&y_axis)),
    ];

    let perp = |v: Vector2<f64>| Vector2::new(-v[1], v[0]);
    let mut dx = [0.0; 3];
    let mut dy = [0.0; 3];
    for i in 0..3 {
        let g = perp(q[(i + 2) % 3] - q[(i + 1) % 3]) / double_area;
        dx[i] = g[0];
        dy[i] = g[1];
    }
    Some((dx, dy, 0.5 * double_area))
}
