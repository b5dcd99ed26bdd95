//! Conformal energy with a per-face area constraint enforced by Lagrange
//! multipliers.
//!
//! The variable vector is extended with one multiplier per face,
//! `[U(n), V(n), λ(nf)]`, and each face contributes
//! `A_f (LSCM(J_f) - λ_f (det J_f - 1))`. Stationary points of this function
//! are the constrained optima, so the Hessian is indefinite by construction
//! and is never projected.

use na::{SMatrix, Vector4};
use rayon::prelude::*;

use super::angle_preserving::AnglePreserving;
use super::jacobian::{det_gradient, det_hessian, determinant, Density, FaceGeometry, FaceJacobians};
use crate::matrix::HessianPattern;
use crate::mesh::TriMesh;
use crate::objective::Energy;
use crate::Error;

type LagrangianBlock = SMatrix<f64, 7, 7>;

#[derive(Debug)]
pub struct Lagrangian {
    /// Coefficient of the quadratic penalty in the augmented value.
    augmentation: f64,
    geometry: FaceGeometry,
    jacobians: FaceJacobians,
    multipliers: Vec<f64>,
}

impl Default for Lagrangian {
    fn default() -> Self {
        Lagrangian {
            augmentation: 1.0,
            geometry: FaceGeometry::default(),
            jacobians: FaceJacobians::default(),
            multipliers: Vec::new(),
        }
    }
}

impl Lagrangian {
    pub fn augmentation(&self) -> f64 {
        self.augmentation
    }

    pub fn set_augmentation(&mut self, k: f64) {
        self.augmentation = k;
    }

    pub fn multipliers(&self) -> &[f64] {
        &self.multipliers
    }

    /// `Σ A_f (det J_f - 1)²` at the current point.
    pub fn constraint_violation(&self) -> f64 {
        self.jacobians
            .determinants
            .iter()
            .enumerate()
            .map(|(f, det)| self.geometry.area(f) * (det - 1.0) * (det - 1.0))
            .sum()
    }

    fn face_value(&self, f: usize) -> f64 {
        let j = &self.jacobians.jacobians[f];
        AnglePreserving::value(j) - self.multipliers[f] * (determinant(j) - 1.0)
    }

    fn face_hessian(&self, f: usize) -> LagrangianBlock {
        let mut block = LagrangianBlock::zeros();
        let area = self.geometry.area(f);
        if area <= 0.0 {
            return block;
        }
        let j = &self.jacobians.jacobians[f];
        let dj = &self.geometry.jacobian_dx[f];
        let hj = AnglePreserving::hessian(j) - det_hessian() * self.multipliers[f];
        block
            .fixed_view_mut::<6, 6>(0, 0)
            .copy_from(&(dj.transpose() * hj * dj * area));
        let coupling = dj.tr_mul(&det_gradient(j)) * (-area);
        block.fixed_view_mut::<6, 1>(0, 6).copy_from(&coupling);
        block
            .fixed_view_mut::<1, 6>(6, 0)
            .copy_from(&coupling.transpose());
        block
    }
}

impl Energy for Lagrangian {
    fn init(&mut self, mesh: &TriMesh) -> Result<(), Error> {
        self.geometry = FaceGeometry::new(mesh);
        self.jacobians = FaceJacobians::new(mesh.num_faces());
        self.multipliers = vec![0.0; mesh.num_faces()];
        Ok(())
    }

    fn num_variables(&self) -> usize {
        2 * self.geometry.num_vertices + self.geometry.num_faces()
    }

    fn num_faces(&self) -> usize {
        self.geometry.num_faces()
    }

    fn hessian_elements(&self) -> Vec<Vec<usize>> {
        let offset = 2 * self.geometry.num_vertices;
        (0..self.geometry.num_faces())
            .map(|f| {
                let mut vars = self.geometry.face_variables(f).to_vec();
                vars.push(offset + f);
                vars
            })
            .collect()
    }

    fn update_x(&mut self, x: &[f64]) -> usize {
        let offset = 2 * self.geometry.num_vertices;
        self.multipliers.copy_from_slice(&x[offset..]);
        self.jacobians.update(&self.geometry, x)
    }

    fn value(&self, per_face: &mut [f64]) -> f64 {
        let mut total = 0.0;
        for (f, e) in per_face.iter_mut().enumerate() {
            *e = self.face_value(f);
            total += self.geometry.area(f) * *e;
        }
        total
    }

    fn add_gradient(&self, grad: &mut [f64]) {
        let offset = 2 * self.geometry.num_vertices;
        for f in 0..self.geometry.num_faces() {
            let area = self.geometry.area(f);
            if area <= 0.0 {
                continue;
            }
            let j = &self.jacobians.jacobians[f];
            let lambda = self.multipliers[f];
            let dj = &self.geometry.jacobian_dx[f];
            let de_dj: Vector4<f64> = AnglePreserving::gradient(j) - det_gradient(j) * lambda;
            let local = dj.tr_mul(&de_dj) * area;
            self.geometry.add_face_gradient(f, &local, grad);
            grad[offset + f] -= area * (determinant(j) - 1.0);
        }
    }

    fn add_hessian(&self, pattern: &HessianPattern, values: &mut [f64]) {
        let blocks: Vec<LagrangianBlock> = (0..self.geometry.num_faces())
            .into_par_iter()
            .map(|f| self.face_hessian(f))
            .collect();
        for (f, block) in blocks.iter().enumerate() {
            pattern.add_element_block(f, block, 1.0, values);
        }
    }

    fn augmented_value(&self) -> Option<f64> {
        let value: f64 = (0..self.geometry.num_faces())
            .map(|f| self.geometry.area(f) * self.face_value(f))
            .sum();
        Some(value + self.augmentation * self.constraint_violation())
    }
}
