//! Application context tying a mesh, its energies and a solver together.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::initial_guess::{unflatten_uv, InitialGuess};
use crate::mesh::TriMesh;
use crate::objective::{DerivativeCheck, Objective, UpdateOptions};
use crate::objectives::{
    create_objective, HandleSet, LagrangianObjective, ObjectiveKind, PositionObjective,
};
use crate::solver::{Callback, SolveResult, Solver, SolverParams, ThreadState};
use crate::total::TotalObjective;
use crate::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverKind {
    Newton,
    GradientDescent,
}

impl Default for SolverKind {
    fn default() -> Self {
        SolverKind::Newton
    }
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnergyConfig {
    pub kind: ObjectiveKind,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Project local Hessian blocks onto the PSD cone.
    #[serde(default)]
    pub enforce_psd: bool,
}

impl EnergyConfig {
    pub fn new(kind: ObjectiveKind, weight: f64) -> Self {
        EnergyConfig {
            kind,
            weight,
            enforce_psd: false,
        }
    }
}

/// A vertex pinned by the positional energy. Without a target the vertex is
/// pinned where the initial guess puts it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandleConfig {
    pub vertex: usize,
    #[serde(default)]
    pub target: Option<[f64; 2]>,
}

/// Problem description loaded from RON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub mesh: TriMesh,
    pub energies: Vec<EnergyConfig>,
    #[serde(default)]
    pub handles: Vec<HandleConfig>,
    #[serde(default)]
    pub initial_guess: InitialGuess,
    #[serde(default)]
    pub solver: SolverKind,
    #[serde(default)]
    pub solver_params: SolverParams,
    #[serde(default)]
    pub flip_avoiding: bool,
    #[serde(default)]
    pub hessian_shift: f64,
    /// Augmented Lagrangian coefficient.
    #[serde(default = "default_weight")]
    pub augmentation: f64,
}

impl SessionConfig {
    pub fn new(mesh: TriMesh, energies: Vec<EnergyConfig>) -> Self {
        SessionConfig {
            mesh,
            energies,
            handles: Vec::new(),
            initial_guess: InitialGuess::default(),
            solver: SolverKind::default(),
            solver_params: SolverParams::default(),
            flip_avoiding: false,
            hessian_shift: 0.0,
            augmentation: 1.0,
        }
    }

    pub fn from_ron_str(s: &str) -> Result<Self, Error> {
        ron::de::from_str(s).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn load_from_ron<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_ron_str(&contents)
    }
}

/// Name, weight and current value of one energy term.
#[derive(Clone, Debug, PartialEq)]
pub struct EnergySummary {
    pub name: String,
    pub weight: f64,
    pub value: f64,
}

/// Owns the mesh, the total objective, the positional handles and the solver.
pub struct Session {
    mesh: Arc<TriMesh>,
    total: Arc<TotalObjective>,
    handles: HandleSet,
    solver: Solver,
    solver_kind: SolverKind,
    solver_params: SolverParams,
    flip_avoiding: bool,
}

fn make_solver(kind: SolverKind, params: SolverParams) -> Solver {
    match kind {
        SolverKind::Newton => Solver::newton(params),
        SolverKind::GradientDescent => Solver::gradient_descent(params),
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> Result<Self, Error> {
        let SessionConfig {
            mesh,
            energies,
            handles: handle_configs,
            initial_guess,
            solver: solver_kind,
            solver_params,
            flip_avoiding,
            hessian_shift,
            augmentation,
        } = config;
        mesh.validate()?;
        let mesh = Arc::new(mesh);
        let n = mesh.num_vertices();
        let x_uv = initial_guess.compute(&mesh)?;

        let handles = HandleSet::new();
        let mut vertices = Vec::with_capacity(handle_configs.len());
        let mut targets = Vec::with_capacity(handle_configs.len());
        for h in handle_configs.iter() {
            if h.vertex >= n {
                return Err(Error::InvalidHandle { vertex: h.vertex });
            }
            vertices.push(h.vertex);
            targets.push(h.target.unwrap_or([x_uv[h.vertex], x_uv[n + h.vertex]]));
        }
        handles.set(vertices, targets)?;

        let mut total = TotalObjective::new();
        let mut has_position = false;
        for energy in energies.iter() {
            let objective: Box<dyn Objective> = match energy.kind {
                ObjectiveKind::Position => {
                    has_position = true;
                    Box::new(PositionObjective::with_handles(handles.clone()))
                }
                ObjectiveKind::Lagrangian => {
                    let lagrangian = LagrangianObjective::default();
                    lagrangian.set_augmentation(augmentation);
                    Box::new(lagrangian)
                }
                ref kind => create_objective(kind),
            };
            objective.set_enforce_psd(energy.enforce_psd);
            total.add_objective(objective, energy.weight)?;
        }
        if !has_position && !handles.is_empty() {
            log::warn!("Handles are ignored without a Position energy");
        }
        total.set_hessian_shift(hessian_shift)?;
        total.init_mesh(Arc::clone(&mesh))?;
        total.init()?;
        let total = Arc::new(total);

        let mut session = Session {
            mesh,
            total,
            handles,
            solver: make_solver(solver_kind, solver_params),
            solver_kind,
            solver_params,
            flip_avoiding,
        };
        session.init_solver(x_uv)?;
        log::info!(
            "Session ready: {} vertices, {} faces, {} energies, {} solver",
            n,
            session.mesh.num_faces(),
            session.total.len(),
            session.solver.method_name().unwrap_or("no")
        );
        Ok(session)
    }

    /// (Re)initialize the solver at `x`, padding extra variables with zeros.
    fn init_solver(&mut self, mut x: Vec<f64>) -> Result<(), Error> {
        x.resize(self.total.num_variables(), 0.0);
        if self.flip_avoiding {
            self.solver.enable_flip_avoiding_line_search(&self.mesh)?;
        }
        let total: Arc<dyn Objective> = Arc::clone(&self.total) as Arc<dyn Objective>;
        self.solver.init(total, x)
    }

    /// Stop the solver, run `f`, then restart it if it was active.
    ///
    /// A paused solver is restarted in the paused state.
    fn with_solver_stopped<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let state = self.solver.thread_state();
        self.solver.stop();
        let result = f(self);
        match state {
            ThreadState::Running => self.solver.start()?,
            ThreadState::Paused => {
                self.solver.start()?;
                self.solver.pause();
            }
            ThreadState::Terminated | ThreadState::Terminating => {}
        }
        result
    }

    pub fn mesh(&self) -> &TriMesh {
        &self.mesh
    }

    pub fn total(&self) -> &Arc<TotalObjective> {
        &self.total
    }

    pub fn handles(&self) -> &HandleSet {
        &self.handles
    }

    pub fn solver_kind(&self) -> SolverKind {
        self.solver_kind
    }

    pub fn thread_state(&self) -> ThreadState {
        self.solver.thread_state()
    }

    pub fn start(&mut self) -> Result<(), Error> {
        self.solver.start()
    }

    pub fn pause(&self) {
        self.solver.pause()
    }

    pub fn resume(&mut self) -> Result<(), Error> {
        self.solver.resume()
    }

    pub fn stop(&mut self) {
        self.solver.stop()
    }

    /// Run one solver iteration on the calling thread.
    pub fn step(&mut self) -> Result<bool, Error> {
        Ok(self.solver.step()?.is_none())
    }

    pub fn last_result(&self) -> Option<SolveResult> {
        self.solver.last_result()
    }

    pub fn set_callback(&self, callback: Option<Callback>) {
        self.solver.set_callback(callback)
    }

    /// The published variable vector, if it changed since the last poll.
    pub fn poll(&self) -> Option<Vec<f64>> {
        if self.solver.has_progressed() {
            Some(self.solver.external_x())
        } else {
            None
        }
    }

    /// Most recently published variable vector.
    pub fn x(&self) -> Vec<f64> {
        self.solver.external_x()
    }

    /// Most recently published UV coordinates, one per vertex.
    pub fn uv(&self) -> Vec<[f64; 2]> {
        unflatten_uv(&self.solver.external_x(), self.mesh.num_vertices())
    }

    /// Change the weight of an energy term. Applies from the next iteration.
    pub fn set_weight(&self, index: usize, weight: f64) -> Result<(), Error> {
        self.total.set_objective_weight(index, weight)
    }

    /// Values from the most recent update of each energy term.
    pub fn energy_summaries(&self) -> Vec<EnergySummary> {
        self.total
            .objectives()
            .map(|o| EnergySummary {
                name: o.name().to_string(),
                weight: o.weight(),
                value: o.value(),
            })
            .collect()
    }

    /// Weighted per-face energy from the most recent update.
    pub fn per_face_energy(&self) -> Vec<f64> {
        self.total.per_face_energy()
    }

    /// Switch between Newton and gradient descent, continuing from the
    /// published point.
    pub fn set_solver_kind(&mut self, kind: SolverKind) -> Result<(), Error> {
        if kind == self.solver_kind {
            return Ok(());
        }
        self.with_solver_stopped(|session| {
            let x = session.solver.external_x();
            let callback = session.solver.take_callback();
            session.solver = make_solver(kind, session.solver_params);
            session.solver.set_callback(callback);
            session.solver_kind = kind;
            session.init_solver(x)
        })
    }

    pub fn set_solver_params(&mut self, params: SolverParams) -> Result<(), Error> {
        self.with_solver_stopped(|session| {
            session.solver_params = params;
            session.solver.set_params(params)
        })
    }

    pub fn set_flip_avoiding(&mut self, enable: bool) -> Result<(), Error> {
        self.with_solver_stopped(|session| {
            session.flip_avoiding = enable;
            if enable {
                session.solver.enable_flip_avoiding_line_search(&session.mesh)
            } else {
                session.solver.disable_flip_avoiding_line_search()
            }
        })
    }

    /// Restart from a new initial guess.
    pub fn set_initial_guess(&mut self, guess: InitialGuess) -> Result<(), Error> {
        self.with_solver_stopped(|session| {
            let x = guess.compute(&session.mesh)?;
            session.init_solver(x)
        })
    }

    /// Finite-difference gradient check of every energy term at the published
    /// point.
    pub fn check_gradients(&mut self) -> Result<Vec<(String, DerivativeCheck)>, Error> {
        self.check_derivatives(|o, x| o.check_gradient(x))
    }

    /// Finite-difference Hessian check of every energy term at the published
    /// point.
    pub fn check_hessians(&mut self) -> Result<Vec<(String, DerivativeCheck)>, Error> {
        self.check_derivatives(|o, x| o.check_hessian(x))
    }

    fn check_derivatives(
        &mut self,
        check: impl Fn(&dyn Objective, &[f64]) -> Result<DerivativeCheck, Error>,
    ) -> Result<Vec<(String, DerivativeCheck)>, Error> {
        self.with_solver_stopped(|session| {
            let x = session.solver.external_x();
            let mut results = Vec::with_capacity(session.total.len());
            for objective in session.total.objectives() {
                let m = objective.num_variables();
                let result = check(objective, &x[..m])?;
                if !result.passed() {
                    log::warn!(
                        "{} derivatives mismatch at {:?} (max rel error {:.3e})",
                        objective.name(),
                        result.worst,
                        result.max_rel_error
                    );
                }
                results.push((objective.name().to_string(), result));
            }
            // Leave the total objective consistent with the published point.
            session.total.update(&x, UpdateOptions::ALL)?;
            Ok(results)
        })
    }
}
