use super::DescentMethod;
use crate::objective::Objective;
use crate::Error;

/// Steepest descent, `p = -g`.
#[derive(Copy, Clone, Debug, Default)]
pub struct GradientDescent;

impl DescentMethod for GradientDescent {
    fn name(&self) -> &'static str {
        "Gradient Descent"
    }

    fn descent_direction(
        &mut self,
        _objective: &dyn Objective,
        gradient: &[f64],
        p: &mut [f64],
    ) -> Result<(), Error> {
        p.iter_mut().zip(gradient.iter()).for_each(|(p, &g)| *p = -g);
        Ok(())
    }
}
