//! Local area preservation over vertex one-rings.
//!
//! For every vertex `v` with incident faces `ring(v)` the signed area defect
//!
//! ```verbatim
//! S_v = Σ_{f ∈ ring(v)} A_f (det J_f - 1)
//! ```
//!
//! is penalized quadratically, `E = ½ Σ_v S_v²`. Each term only couples the
//! vertices of its one-ring, so Hessian blocks are built in a ring-local
//! variable space `[U_ring, V_ring]` and scattered into the global pattern.

use ahash::AHashMap;
use na::{DMatrix, DVector};
use rayon::prelude::*;

use super::jacobian::{det_gradient, det_hessian, FaceGeometry, FaceJacobians};
use crate::matrix::{project_psd, HessianPattern};
use crate::mesh::TriMesh;
use crate::objective::Energy;
use crate::Error;

#[derive(Clone, Debug)]
struct VertexRing {
    faces: Vec<usize>,
    /// Distinct ring vertices in order of first appearance.
    vertices: Vec<usize>,
    /// Derivative of the stacked face Jacobians with respect to the ring
    /// variables; `4 * faces.len()` rows and `2 * vertices.len()` columns.
    jacobian_dx: DMatrix<f64>,
}

impl VertexRing {
    fn new(geometry: &FaceGeometry, faces: Vec<usize>, vertices: Vec<usize>) -> Self {
        let m = vertices.len();
        let local: AHashMap<usize, usize> =
            vertices.iter().enumerate().map(|(l, &v)| (v, l)).collect();
        let mut jacobian_dx = DMatrix::zeros(4 * faces.len(), 2 * m);
        for (k, &f) in faces.iter().enumerate() {
            let dx = &geometry.operators.dx[f];
            let dy = &geometry.operators.dy[f];
            for (corner, v) in geometry.faces[f].iter().enumerate() {
                let l = local[v];
                jacobian_dx[(4 * k, l)] += dx[corner];
                jacobian_dx[(4 * k + 1, m + l)] += dx[corner];
                jacobian_dx[(4 * k + 2, l)] += dy[corner];
                jacobian_dx[(4 * k + 3, m + l)] += dy[corner];
            }
        }
        VertexRing {
            faces,
            vertices,
            jacobian_dx,
        }
    }

    fn variables(&self, num_vertices: usize) -> Vec<usize> {
        self.vertices
            .iter()
            .copied()
            .chain(self.vertices.iter().map(|&v| num_vertices + v))
            .collect()
    }

    /// Gradient of the ring defect `S_v` with respect to the ring variables.
    fn defect_gradient(&self, geometry: &FaceGeometry, jacobians: &FaceJacobians) -> DVector<f64> {
        let mut w = DVector::zeros(4 * self.faces.len());
        for (k, &f) in self.faces.iter().enumerate() {
            let g = det_gradient(&jacobians.jacobians[f]) * geometry.area(f);
            w.fixed_rows_mut::<4>(4 * k).copy_from(&g);
        }
        self.jacobian_dx.tr_mul(&w)
    }
}

/// Sum of squared one-ring area defects.
#[derive(Debug, Default)]
pub struct OneRingAreaPreserving {
    enforce_psd: bool,
    geometry: FaceGeometry,
    jacobians: FaceJacobians,
    rings: Vec<VertexRing>,
    defects: Vec<f64>,
}

impl OneRingAreaPreserving {
    fn ring_hessian(&self, ring: &VertexRing, defect: f64) -> DMatrix<f64> {
        let t = ring.defect_gradient(&self.geometry, &self.jacobians);
        let mut h = &t * t.transpose();
        let hdet = det_hessian();
        for (k, &f) in ring.faces.iter().enumerate() {
            let dj = ring.jacobian_dx.rows(4 * k, 4);
            let scale = defect * self.geometry.area(f);
            if scale != 0.0 {
                h += dj.transpose() * hdet * dj * scale;
            }
        }
        if self.enforce_psd {
            project_psd(&mut h);
        }
        h
    }
}

impl Energy for OneRingAreaPreserving {
    fn init(&mut self, mesh: &TriMesh) -> Result<(), Error> {
        self.geometry = FaceGeometry::new(mesh);
        self.jacobians = FaceJacobians::new(mesh.num_faces());
        self.rings = mesh
            .vertex_faces()
            .into_iter()
            .filter(|faces| !faces.is_empty())
            .map(|faces| {
                let vertices = mesh.face_vertices(&faces);
                VertexRing::new(&self.geometry, faces, vertices)
            })
            .collect();
        self.defects = vec![0.0; self.rings.len()];
        Ok(())
    }

    fn num_variables(&self) -> usize {
        2 * self.geometry.num_vertices
    }

    fn num_faces(&self) -> usize {
        self.geometry.num_faces()
    }

    fn hessian_elements(&self) -> Vec<Vec<usize>> {
        let n = self.geometry.num_vertices;
        self.rings.iter().map(|ring| ring.variables(n)).collect()
    }

    fn update_x(&mut self, x: &[f64]) -> usize {
        let inverted = self.jacobians.update(&self.geometry, x);
        let geometry = &self.geometry;
        let jacobians = &self.jacobians;
        for (defect, ring) in self.defects.iter_mut().zip(self.rings.iter()) {
            *defect = ring
                .faces
                .iter()
                .map(|&f| geometry.area(f) * (jacobians.determinants[f] - 1.0))
                .sum();
        }
        inverted
    }

    /// Ring terms do not split into per-face contributions, so the per-face
    /// breakdown is left at zero.
    fn value(&self, per_face: &mut [f64]) -> f64 {
        per_face.iter_mut().for_each(|e| *e = 0.0);
        0.5 * self.defects.iter().map(|s| s * s).sum::<f64>()
    }

    fn add_gradient(&self, grad: &mut [f64]) {
        let n = self.geometry.num_vertices;
        for (ring, &defect) in self.rings.iter().zip(self.defects.iter()) {
            if defect == 0.0 {
                continue;
            }
            let t = ring.defect_gradient(&self.geometry, &self.jacobians);
            let m = ring.vertices.len();
            for (l, &v) in ring.vertices.iter().enumerate() {
                grad[v] += defect * t[l];
                grad[n + v] += defect * t[m + l];
            }
        }
    }

    fn add_hessian(&self, pattern: &HessianPattern, values: &mut [f64]) {
        let blocks: Vec<DMatrix<f64>> = self
            .rings
            .par_iter()
            .zip(self.defects.par_iter())
            .map(|(ring, &defect)| self.ring_hessian(ring, defect))
            .collect();
        for (r, block) in blocks.iter().enumerate() {
            pattern.add_element_block(r, block, 1.0, values);
        }
    }

    fn set_enforce_psd(&mut self, enforce: bool) {
        self.enforce_psd = enforce;
    }
}
