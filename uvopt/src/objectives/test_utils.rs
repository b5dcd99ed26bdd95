use approx::assert_relative_eq;
use na::Vector4;

use super::jacobian::Density;
use crate::mesh::TriMesh;
use crate::objective::Objective;
use crate::test_utils::*;
use crate::Error;

/// Check density derivatives against central differences at a few Jacobians
/// with positive determinant.
pub(crate) fn density_tester<D: Density>() {
    let samples = [
        Vector4::new(1.0, 0.0, 0.0, 1.0),
        Vector4::new(1.3, 0.2, -0.4, 0.8),
        Vector4::new(0.5, -0.7, 0.9, 1.6),
    ];
    let h = 1e-6;
    for j in samples.iter() {
        let g = D::gradient(j);
        let hess = D::hessian(j);
        for i in 0..4 {
            let mut jp = *j;
            jp[i] += h;
            let mut jm = *j;
            jm[i] -= h;
            let fd = (D::value(&jp) - D::value(&jm)) / (2.0 * h);
            assert_relative_eq!(g[i], fd, max_relative = 1e-6, epsilon = 1e-7);
            let fd_col = (D::gradient(&jp) - D::gradient(&jm)) / (2.0 * h);
            for k in 0..4 {
                assert_relative_eq!(hess[(k, i)], fd_col[k], max_relative = 1e-6, epsilon = 1e-6);
            }
        }
        assert_relative_eq!(hess, hess.transpose());
    }
}

/// Check an objective's gradient and Hessian at a few perturbations of the
/// identity embedding. Extra variables beyond the UV block are set to small
/// random values.
pub(crate) fn derivative_tester<O, F>(make: F, mesh: &TriMesh, perturbation: f64) -> Result<(), Error>
where
    O: Objective,
    F: Fn() -> O,
{
    let _ = env_logger::Builder::from_env("UVOPT_LOG").is_test(true).try_init();
    let obj = init_objective(make(), mesh)?;
    let mut x0 = identity_uv(mesh);
    x0.resize(obj.num_variables(), 0.0);

    for seed in 0..3 {
        let x = perturbed(&x0, perturbation, seed);
        let grad_check = obj.check_gradient(&x)?;
        assert!(
            grad_check.passed(),
            "{} gradient mismatch: {:?}",
            obj.name(),
            grad_check
        );
        let hess_check = obj.check_hessian(&x)?;
        assert!(
            hess_check.passed(),
            "{} hessian mismatch: {:?}",
            obj.name(),
            hess_check
        );
    }
    Ok(())
}
