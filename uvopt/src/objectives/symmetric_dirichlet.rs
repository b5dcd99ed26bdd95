use na::{Matrix4, Vector4};

use super::jacobian::{det_gradient, det_hessian, determinant, Density};

/// Symmetric Dirichlet isometric distortion density.
///
/// With singular values `σ1, σ2` of the Jacobian this is
/// `σ1² + σ2² + σ1⁻² + σ2⁻²`, written as `|J|²(1 + det⁻²)`. The density is
/// unbounded as `det J → 0`, which keeps faces from collapsing.
#[derive(Copy, Clone, Debug, Default)]
pub struct SymmetricDirichlet;

impl Density for SymmetricDirichlet {
    const NAME: &'static str = "Symmetric Dirichlet";
    const CONVEX: bool = false;

    #[inline]
    fn value(j: &Vector4<f64>) -> f64 {
        let det = determinant(j);
        j.norm_squared() * (1.0 + 1.0 / (det * det))
    }

    #[inline]
    fn gradient(j: &Vector4<f64>) -> Vector4<f64> {
        let det = determinant(j);
        let s = j.norm_squared();
        let q = 1.0 + 1.0 / (det * det);
        j * (2.0 * q) - det_gradient(j) * (2.0 * s / (det * det * det))
    }

    fn hessian(j: &Vector4<f64>) -> Matrix4<f64> {
        let det = determinant(j);
        let s = j.norm_squared();
        let inv = 1.0 / det;
        let inv2 = inv * inv;
        let inv3 = inv2 * inv;
        let q = 1.0 + inv2;
        let g = det_gradient(j);
        let jg = j * g.transpose();
        Matrix4::identity() * (2.0 * q) - (jg + jg.transpose()) * (4.0 * inv3)
            + g * g.transpose() * (6.0 * s * inv2 * inv2)
            - det_hessian() * (2.0 * s * inv3)
    }
}
