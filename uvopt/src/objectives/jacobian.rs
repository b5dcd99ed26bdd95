//! Per-face Jacobians of the flattening map and the energies built on them.
//!
//! Over each face the map from the surface to the UV plane is linear, with a
//! 2x2 Jacobian `J = [[a, b], [c, d]]` where
//!
//! ```verbatim
//! a = Dx·U   b = Dx·V
//! c = Dy·U   d = Dy·V
//! ```
//!
//! Jacobians are stored as vectors `(a, b, c, d)`. Local face variables are
//! ordered `[U0, U1, U2, V0, V1, V2]`.

use std::marker::PhantomData;

use na::{Matrix4, SMatrix, Vector3, Vector4};
use rayon::prelude::*;

use crate::matrix::{project_psd, HessianPattern};
use crate::mesh::TriMesh;
use crate::objective::Energy;
use crate::operators::DiscreteOperators;
use crate::Error;

/// Derivative of `(a, b, c, d)` with respect to the local face variables.
pub type JacobianDx = SMatrix<f64, 4, 6>;

pub type FaceVector = SMatrix<f64, 6, 1>;
pub type FaceMatrix = SMatrix<f64, 6, 6>;

pub fn jacobian_dx(dx: &[f64; 3], dy: &[f64; 3]) -> JacobianDx {
    let mut m = JacobianDx::zeros();
    for i in 0..3 {
        m[(0, i)] = dx[i];
        m[(1, 3 + i)] = dx[i];
        m[(2, i)] = dy[i];
        m[(3, 3 + i)] = dy[i];
    }
    m
}

/// Gradient of `det J = ad - bc` with respect to `(a, b, c, d)`.
#[inline]
pub fn det_gradient(j: &Vector4<f64>) -> Vector4<f64> {
    Vector4::new(j[3], -j[2], -j[1], j[0])
}

/// Constant Hessian of `det J` with respect to `(a, b, c, d)`.
#[inline]
pub fn det_hessian() -> Matrix4<f64> {
    Matrix4::new(
        0.0, 0.0, 0.0, 1.0, //
        0.0, 0.0, -1.0, 0.0, //
        0.0, -1.0, 0.0, 0.0, //
        1.0, 0.0, 0.0, 0.0,
    )
}

#[inline]
pub fn determinant(j: &Vector4<f64>) -> f64 {
    j[0] * j[3] - j[1] * j[2]
}

/// Fixed per-face data shared by all Jacobian based energies.
#[derive(Clone, Debug, Default)]
pub struct FaceGeometry {
    pub faces: Vec<[usize; 3]>,
    pub num_vertices: usize,
    pub operators: DiscreteOperators,
    pub jacobian_dx: Vec<JacobianDx>,
}

impl FaceGeometry {
    pub fn new(mesh: &TriMesh) -> Self {
        let operators = DiscreteOperators::new(mesh);
        let jacobian_dx = operators
            .dx
            .iter()
            .zip(operators.dy.iter())
            .map(|(dx, dy)| jacobian_dx(dx, dy))
            .collect();
        FaceGeometry {
            faces: mesh.faces.clone(),
            num_vertices: mesh.num_vertices(),
            operators,
            jacobian_dx,
        }
    }

    #[inline]
    pub fn num_faces(&self) -> usize {
        self.faces.len()
    }

    #[inline]
    pub fn area(&self, face: usize) -> f64 {
        self.operators.areas[face]
    }

    /// Global indices of the local face variables `[U0, U1, U2, V0, V1, V2]`.
    #[inline]
    pub fn face_variables(&self, face: usize) -> [usize; 6] {
        let [i, j, k] = self.faces[face];
        let n = self.num_vertices;
        [i, j, k, n + i, n + j, n + k]
    }

    /// Gather the local face variables from the global vector.
    #[inline]
    pub fn face_x(&self, face: usize, x: &[f64]) -> FaceVector {
        let vars = self.face_variables(face);
        FaceVector::from_fn(|i, _| x[vars[i]])
    }

    /// Scatter-add a local face gradient into the global gradient.
    #[inline]
    pub fn add_face_gradient(&self, face: usize, local: &FaceVector, grad: &mut [f64]) {
        for (&v, &g) in self.face_variables(face).iter().zip(local.iter()) {
            grad[v] += g;
        }
    }
}

/// Jacobians of the current map, one per face.
#[derive(Clone, Debug, Default)]
pub struct FaceJacobians {
    pub jacobians: Vec<Vector4<f64>>,
    pub determinants: Vec<f64>,
}

impl FaceJacobians {
    pub fn new(num_faces: usize) -> Self {
        FaceJacobians {
            jacobians: vec![Vector4::zeros(); num_faces],
            determinants: vec![0.0; num_faces],
        }
    }

    /// Recompute all Jacobians at `x`, returning the number of inverted faces.
    pub fn update(&mut self, geometry: &FaceGeometry, x: &[f64]) -> usize {
        let ops = &geometry.operators;
        self.jacobians
            .par_iter_mut()
            .zip(self.determinants.par_iter_mut())
            .enumerate()
            .for_each(|(f, (j, det))| {
                let vars = geometry.face_variables(f);
                let u = Vector3::new(x[vars[0]], x[vars[1]], x[vars[2]]);
                let v = Vector3::new(x[vars[3]], x[vars[4]], x[vars[5]]);
                let dx = Vector3::from(ops.dx[f]);
                let dy = Vector3::from(ops.dy[f]);
                *j = Vector4::new(dx.dot(&u), dx.dot(&v), dy.dot(&u), dy.dot(&v));
                *det = determinant(j);
            });
        self.determinants.iter().filter(|&&d| d < 0.0).count()
    }
}

/// A distortion density expressed in terms of the face Jacobian.
pub trait Density: Default + Send + Sync + 'static {
    const NAME: &'static str;
    /// Whether the density Hessian is positive semi-definite everywhere.
    const CONVEX: bool;
    fn value(j: &Vector4<f64>) -> f64;
    fn gradient(j: &Vector4<f64>) -> Vector4<f64>;
    fn hessian(j: &Vector4<f64>) -> Matrix4<f64>;
}

/// The area weighted sum of a [`Density`] over all faces.
#[derive(Debug, Default)]
pub struct JacobianEnergy<D> {
    enforce_psd: bool,
    geometry: FaceGeometry,
    jacobians: FaceJacobians,
    density: PhantomData<D>,
}

impl<D: Density> JacobianEnergy<D> {
    pub fn geometry(&self) -> &FaceGeometry {
        &self.geometry
    }

    pub fn jacobians(&self) -> &FaceJacobians {
        &self.jacobians
    }

    fn face_hessian(&self, face: usize) -> FaceMatrix {
        let area = self.geometry.area(face);
        if area <= 0.0 {
            return FaceMatrix::zeros();
        }
        let dj = &self.geometry.jacobian_dx[face];
        let mut h = dj.transpose() * D::hessian(&self.jacobians.jacobians[face]) * dj * area;
        if self.enforce_psd && !D::CONVEX {
            project_psd(&mut h);
        }
        h
    }
}

impl<D: Density> Energy for JacobianEnergy<D> {
    fn init(&mut self, mesh: &TriMesh) -> Result<(), Error> {
        self.geometry = FaceGeometry::new(mesh);
        self.jacobians = FaceJacobians::new(mesh.num_faces());
        Ok(())
    }

    fn num_variables(&self) -> usize {
        2 * self.geometry.num_vertices
    }

    fn num_faces(&self) -> usize {
        self.geometry.num_faces()
    }

    fn hessian_elements(&self) -> Vec<Vec<usize>> {
        (0..self.geometry.num_faces())
            .map(|f| self.geometry.face_variables(f).to_vec())
            .collect()
    }

    fn update_x(&mut self, x: &[f64]) -> usize {
        self.jacobians.update(&self.geometry, x)
    }

    fn value(&self, per_face: &mut [f64]) -> f64 {
        let mut total = 0.0;
        for (f, e) in per_face.iter_mut().enumerate() {
            let area = self.geometry.area(f);
            *e = if area > 0.0 {
                D::value(&self.jacobians.jacobians[f])
            } else {
                0.0
            };
            total += area * *e;
        }
        total
    }

    fn add_gradient(&self, grad: &mut [f64]) {
        for f in 0..self.geometry.num_faces() {
            let area = self.geometry.area(f);
            if area <= 0.0 {
                continue;
            }
            let dj = &self.geometry.jacobian_dx[f];
            let local = dj.transpose() * D::gradient(&self.jacobians.jacobians[f]) * area;
            self.geometry.add_face_gradient(f, &local, grad);
        }
    }

    fn add_hessian(&self, pattern: &HessianPattern, values: &mut [f64]) {
        let blocks: Vec<FaceMatrix> = (0..self.geometry.num_faces())
            .into_par_iter()
            .map(|f| self.face_hessian(f))
            .collect();
        for (f, block) in blocks.iter().enumerate() {
            pattern.add_element_block(f, block, 1.0, values);
        }
    }

    fn set_enforce_psd(&mut self, enforce: bool) {
        self.enforce_psd = enforce;
    }
}
