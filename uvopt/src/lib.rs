#![cfg_attr(feature = "unstable", feature(test))]

//! Interactive surface parameterization.
//!
//! A triangle mesh is flattened into the plane by minimizing a weighted sum of
//! distortion energies over the per-vertex UV coordinates. Energies are
//! evaluated on per-face Jacobians built from discrete surface gradient
//! operators, and minimized by a background Newton or gradient descent solver
//! that can be paused, resumed and reconfigured from another thread.
//!
//! The variable vector is laid out as `[U(n), V(n), extra...]` where `n` is the
//! number of mesh vertices. Only the Lagrangian objective uses extra variables.

pub mod initial_guess;
pub mod matrix;
pub mod mesh;
pub mod objective;
pub mod objectives;
pub mod operators;
pub mod session;
pub mod solver;
pub mod total;

// TODO: This should be feature gated, but the integration tests and benches
// depend on it, which requires passing the feature explicitly via `--features`.
pub mod test_utils;

pub use self::initial_guess::{flatten_uv, unflatten_uv, InitialGuess};
pub use self::mesh::TriMesh;
pub use self::objective::{
    create_objective, DerivativeCheck, Lifecycle, Objective, ObjectiveFunction, ObjectiveKind,
    ObjectiveSnapshot, UpdateOptions, UpdateReport,
};
pub use self::objectives::{HandleSet, LagrangianObjective, PositionObjective};
pub use self::session::{Session, SessionConfig, SolverKind};
pub use self::solver::{
    Callback, CallbackArgs, LineSearchParams, SolveResult, Solver, SolverParams, Status,
    ThreadState,
};
pub use self::total::TotalObjective;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Mesh has no vertices or no faces")]
    EmptyMesh,
    #[error("Face {face} references vertex {vertex} which does not exist")]
    InvalidFaceIndex { face: usize, vertex: usize },
    #[error("Size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("Objective {name:?} is not initialized")]
    Uninitialized { name: String },
    #[error("Objective {name:?} is already initialized")]
    AlreadyInitialized { name: String },
    #[error("Invalid parameter: {name:?}")]
    InvalidParameter { name: String },
    #[error("Operation requires the solver to be stopped")]
    SolverRunning,
    #[error("Invalid handle vertex: {vertex}")]
    InvalidHandle { vertex: usize },
    #[error("Mesh has no boundary loop to pin")]
    NoBoundary,
    #[error("Failed to factorize a sparse system")]
    Factorization,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("File I/O Error")]
    FileIOError {
        #[from]
        source: std::io::Error,
    },
}

/// Maximum absolute value of the given slice.
pub(crate) fn inf_norm(v: &[f64]) -> f64 {
    v.iter().fold(0.0_f64, |acc, &x| acc.max(x.abs()))
}

pub(crate) fn norm(v: &[f64]) -> f64 {
    v.iter().map(|&x| x * x).sum::<f64>().sqrt()
}

/// Lock a mutex, recovering the guard if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
