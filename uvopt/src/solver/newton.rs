use lazycell::LazyCell;
use sprs::errors::{LinalgError, SingularMatrixInfo};
use sprs::{FillInReduction, SymmetryCheck};
use sprs_ldl::{Ldl, LdlNumeric};

use super::DescentMethod;
use crate::objective::Objective;
use crate::Error;

/// Newton descent: solves `H p = -g` with a sparse LDLᵀ factorization.
///
/// The symbolic factorization is created on the first solve and reused until
/// the method is reset, since the Hessian pattern of an objective is fixed.
/// When the system is not positive definite, or the resulting direction does
/// not descend, the negative gradient is used instead.
#[derive(Default)]
pub struct Newton {
    ldl: LazyCell<LdlNumeric<f64, usize>>,
    fallbacks: usize,
}

impl Newton {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of iterations that fell back to the negative gradient.
    pub fn fallbacks(&self) -> usize {
        self.fallbacks
    }

    /// Factorize `h`, reusing the symbolic structure of a previous
    /// factorization when one exists.
    fn factor(&mut self, h: sprs::CsMatView<f64>) -> Result<&LdlNumeric<f64, usize>, LinalgError> {
        let mut fresh = false;
        let ldl = self.ldl.try_borrow_mut_with(|| {
            fresh = true;
            Ldl::new()
                .fill_in_reduction(FillInReduction::ReverseCuthillMcKee)
                .check_symmetry(SymmetryCheck::DontCheckSymmetry)
                .numeric(h.view())
        })?;
        if !fresh {
            ldl.update(h.view())?;
        }
        for (i, &di) in ldl.d().iter().enumerate() {
            if di <= 0.0 || !di.is_finite() {
                return Err(LinalgError::SingularMatrix(SingularMatrixInfo {
                    index: i,
                    reason: "D <= 0 in Newton system (not SPD)",
                }));
            }
        }
        Ok(&*ldl)
    }
}

impl std::fmt::Debug for Newton {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Newton")
            .field("factored", &self.ldl.filled())
            .field("fallbacks", &self.fallbacks)
            .finish()
    }
}

impl DescentMethod for Newton {
    fn name(&self) -> &'static str {
        "Newton"
    }

    fn reset(&mut self) {
        self.ldl = LazyCell::new();
        self.fallbacks = 0;
    }

    fn descent_direction(
        &mut self,
        objective: &dyn Objective,
        gradient: &[f64],
        p: &mut [f64],
    ) -> Result<(), Error> {
        let pattern = objective.hessian_pattern();
        let h = pattern.to_symmetric_csc(&objective.hessian_values());
        let rhs: Vec<f64> = gradient.iter().map(|&g| -g).collect();

        let direction = match self.factor(h.view()) {
            Ok(ldl) => {
                let sol = ldl.solve(&rhs);
                let slope: f64 = sol.iter().zip(gradient.iter()).map(|(a, b)| a * b).sum();
                if sol.iter().all(|v| v.is_finite()) && slope < 0.0 {
                    Some(sol)
                } else {
                    log::warn!("Newton direction does not descend (slope {:.3e})", slope);
                    None
                }
            }
            Err(err) => {
                log::warn!("Failed to factorize the Newton system: {}", err);
                None
            }
        };

        match direction {
            Some(sol) => p.copy_from_slice(&sol),
            None => {
                self.fallbacks += 1;
                p.copy_from_slice(&rhs);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objective::UpdateOptions;
    use crate::objectives::{
        AnglePreservingObjective, AreaPreservingObjective, PositionObjective,
    };
    use crate::test_utils::*;
    use crate::total::TotalObjective;
    use approx::assert_relative_eq;

    #[test]
    fn quadratic_is_solved_in_one_step() -> Result<(), Error> {
        let mesh = make_grid(2, 2);
        let mut total = TotalObjective::new();
        let position = PositionObjective::default();
        position
            .handles()
            .unwrap()
            .set(vec![0, 8], vec![[0.0, 0.0], [2.0, 1.0]])?;
        total.add_objective(Box::new(AnglePreservingObjective::default()), 1.0)?;
        total.add_objective(Box::new(position), 10.0)?;
        let total = init_objective(total, &mesh)?;

        let x = perturbed(&identity_uv(&mesh), 0.2, 3);
        total.update(&x, UpdateOptions::ALL)?;
        let g = total.gradient();
        let mut p = vec![0.0; x.len()];
        let mut newton = Newton::new();
        newton.descent_direction(&total, &g, &mut p)?;
        assert_eq!(newton.fallbacks(), 0);

        // The objective is quadratic, so a full Newton step lands on the minimum.
        let x1: Vec<f64> = x.iter().zip(p.iter()).map(|(a, b)| a + b).collect();
        total.update(&x1, UpdateOptions::GRADIENT)?;
        for g in total.gradient() {
            assert_relative_eq!(g, 0.0, epsilon = 1e-8);
        }

        // The second solve reuses the factorization.
        total.update(&x, UpdateOptions::ALL)?;
        newton.descent_direction(&total, &g, &mut p)?;
        assert_eq!(newton.fallbacks(), 0);
        Ok(())
    }

    #[test]
    fn indefinite_systems_fall_back_and_recover() -> Result<(), Error> {
        let mesh = make_grid(2, 2);
        let mut total = TotalObjective::new();
        let position = PositionObjective::default();
        position
            .handles()
            .unwrap()
            .set(vec![0, 8], vec![[0.0, 0.0], [1.0, 1.0]])?;
        total.add_objective(Box::new(AnglePreservingObjective::default()), 1.0)?;
        total.add_objective(Box::new(position), 10.0)?;
        let total = init_objective(total, &mesh)?;
        let x = perturbed(&identity_uv(&mesh), 0.2, 5);
        let mut p = vec![0.0; x.len()];
        let mut newton = Newton::new();

        let solve = |newton: &mut Newton, p: &mut [f64]| -> Result<Vec<f64>, Error> {
            total.update(&x, UpdateOptions::ALL)?;
            let g = total.gradient();
            newton.descent_direction(&total, &g, p)?;
            Ok(g)
        };

        solve(&mut newton, p.as_mut_slice())?;
        assert_eq!(newton.fallbacks(), 0);

        // Negative penalties make the system indefinite.
        total.set_objective_weight(1, -10.0)?;
        let g = solve(&mut newton, p.as_mut_slice())?;
        assert_eq!(newton.fallbacks(), 1);
        for (&pi, &gi) in p.iter().zip(g.iter()) {
            assert_eq!(pi, -gi);
        }

        // The kept structure is refilled numerically once the system is
        // positive definite again.
        total.set_objective_weight(1, 10.0)?;
        solve(&mut newton, p.as_mut_slice())?;
        assert_eq!(newton.fallbacks(), 1);
        assert!(newton.ldl.filled());
        Ok(())
    }

    #[test]
    fn directions_always_descend() -> Result<(), Error> {
        let mesh = make_bumpy_grid(3, 3);
        let obj = init_objective(AreaPreservingObjective::default(), &mesh)?;
        let mut newton = Newton::new();
        for seed in 0..4 {
            let x = perturbed(&identity_uv(&mesh), 0.2, seed);
            obj.update(&x, UpdateOptions::ALL)?;
            let g = obj.gradient();
            let mut p = vec![0.0; x.len()];
            // The exact Hessian is indefinite and singular along translations.
            newton.descent_direction(&obj, &g, &mut p)?;
            let slope: f64 = p.iter().zip(g.iter()).map(|(a, b)| a * b).sum();
            assert!(slope < 0.0);
        }
        Ok(())
    }
}
