use std::sync::Arc;

pub use uvopt::test_utils::*;
use uvopt::objectives::SymmetricDirichletObjective;
use uvopt::{initial_guess, Error, Objective, PositionObjective, TotalObjective, TriMesh};

pub fn init_logger() {
    let _ = env_logger::Builder::from_env("UVOPT_LOG")
        .is_test(true)
        .try_init();
}

/// Symmetric Dirichlet energy plus a positional penalty pinning the given
/// vertices at their harmonic positions. Returns the objective together with
/// the harmonic starting point.
#[allow(dead_code)]
pub fn pinned_dirichlet(
    mesh: &TriMesh,
    pinned: &[usize],
    enforce_psd: bool,
) -> Result<(Arc<TotalObjective>, Vec<f64>), Error> {
    let x0 = initial_guess::harmonic(mesh)?;
    let n = mesh.num_vertices();

    let position = PositionObjective::default();
    if let Some(handles) = position.handles() {
        let targets = pinned.iter().map(|&v| [x0[v], x0[n + v]]).collect();
        handles.set(pinned.to_vec(), targets)?;
    }
    let dirichlet = SymmetricDirichletObjective::default();
    dirichlet.set_enforce_psd(enforce_psd);

    let mut total = TotalObjective::new();
    total.add_objective(Box::new(dirichlet), 1.0)?;
    total.add_objective(Box::new(position), 10.0)?;
    let total = init_objective(total, mesh)?;
    Ok((Arc::new(total), x0))
}
