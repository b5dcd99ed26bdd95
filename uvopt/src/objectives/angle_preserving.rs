use na::{Matrix4, Vector4};

use super::jacobian::Density;

/// Least squares conformal density `2a² + (b + c)² + 2d²`.
///
/// The density is quadratic in the Jacobian so its Hessian is constant.
#[derive(Copy, Clone, Debug, Default)]
pub struct AnglePreserving;

impl Density for AnglePreserving {
    const NAME: &'static str = "Angle Preserving";
    const CONVEX: bool = true;

    #[inline]
    fn value(j: &Vector4<f64>) -> f64 {
        let (a, b, c, d) = (j[0], j[1], j[2], j[3]);
        2.0 * a * a + (b + c) * (b + c) + 2.0 * d * d
    }

    #[inline]
    fn gradient(j: &Vector4<f64>) -> Vector4<f64> {
        let (a, b, c, d) = (j[0], j[1], j[2], j[3]);
        let bc = 2.0 * (b + c);
        Vector4::new(4.0 * a, bc, bc, 4.0 * d)
    }

    #[inline]
    fn hessian(_: &Vector4<f64>) -> Matrix4<f64> {
        Matrix4::new(
            4.0, 0.0, 0.0, 0.0, //
            0.0, 2.0, 2.0, 0.0, //
            0.0, 2.0, 2.0, 0.0, //
            0.0, 0.0, 0.0, 4.0,
        )
    }
}
