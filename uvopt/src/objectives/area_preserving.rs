use na::{Matrix4, Vector4};

use super::jacobian::{det_gradient, det_hessian, determinant, Density};

/// Global area distortion density `(det J - 1)²`.
#[derive(Copy, Clone, Debug, Default)]
pub struct AreaPreserving;

impl Density for AreaPreserving {
    const NAME: &'static str = "Area Preserving";
    const CONVEX: bool = false;

    #[inline]
    fn value(j: &Vector4<f64>) -> f64 {
        let r = determinant(j) - 1.0;
        r * r
    }

    #[inline]
    fn gradient(j: &Vector4<f64>) -> Vector4<f64> {
        det_gradient(j) * (2.0 * (determinant(j) - 1.0))
    }

    #[inline]
    fn hessian(j: &Vector4<f64>) -> Matrix4<f64> {
        let g = det_gradient(j);
        g * g.transpose() * 2.0 + det_hessian() * (2.0 * (determinant(j) - 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectives::test_utils::*;
    use crate::objectives::AreaPreservingObjective;
    use crate::test_utils::*;
    use crate::{Error, Objective, UpdateOptions};
    use approx::assert_relative_eq;

    #[test]
    fn density_derivatives() {
        density_tester::<AreaPreserving>();
    }

    #[test]
    fn objective_derivatives() -> Result<(), Error> {
        derivative_tester(AreaPreservingObjective::default, &make_bumpy_grid(3, 2), 0.1)
    }

    #[test]
    fn unit_square_identity_is_optimal() -> Result<(), Error> {
        let mesh = make_unit_square();
        let obj = init_objective(AreaPreservingObjective::default(), &mesh)?;
        let report = obj.update(&identity_uv(&mesh), UpdateOptions::ALL)?;
        assert_eq!(report.inverted_faces, 0);
        assert_relative_eq!(obj.value(), 0.0, epsilon = 1e-14);
        for g in obj.gradient() {
            assert_relative_eq!(g, 0.0, epsilon = 1e-14);
        }
        Ok(())
    }

    #[test]
    fn mirrored_embedding_reports_inversions() -> Result<(), Error> {
        let mesh = make_unit_square();
        let obj = init_objective(AreaPreservingObjective::default(), &mesh)?;
        let mut x = identity_uv(&mesh);
        // Mirror u.
        x[..mesh.num_vertices()].iter_mut().for_each(|u| *u = -*u);
        let report = obj.update(&x, UpdateOptions::ALL)?;
        assert_eq!(report.inverted_faces, 2);
        // det = -1 on each face, so (det - 1)² = 4 per unit area.
        assert_relative_eq!(obj.value(), 4.0, epsilon = 1e-12);
        Ok(())
    }
}
