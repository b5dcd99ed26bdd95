//! Iterative minimization of an objective on a background thread.
//!
//! A [`Solver`] owns the live variable vector and moves it, together with the
//! descent method and line search, into a worker thread when started. Each
//! iteration refreshes the objective, computes a descent direction, runs the
//! line search and publishes the new point behind a reader-writer lock.
//! Pausing and termination are cooperative: the worker checks its state at
//! the top of every iteration.

mod gradient_descent;
mod line_search;
mod newton;

pub use self::gradient_descent::GradientDescent;
pub use self::line_search::{max_step_before_flip, LineSearch, LineSearchParams, LineSearchResult};
pub use self::newton::Newton;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};

use crate::mesh::TriMesh;
use crate::objective::{Objective, UpdateOptions};
use crate::{inf_norm, lock, Error};

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverParams {
    /// Maximum number of iterations in a single run.
    pub max_iterations: u32,
    /// Stop when the gradient norm drops to this value.
    pub gradient_tolerance: f64,
    /// Stop when an iteration moves no variable by more than this amount.
    pub x_tolerance: f64,
    pub line_search: LineSearchParams,
}

impl Default for SolverParams {
    fn default() -> Self {
        SolverParams {
            max_iterations: u32::MAX,
            gradient_tolerance: 0.0,
            x_tolerance: 0.0,
            line_search: LineSearchParams::default(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Success,
    MaximumIterationsExceeded,
    /// The iteration callback asked to stop.
    Interrupted,
    /// Stopped from the controlling thread.
    Terminated,
    InvalidObjective,
    NothingToSolve,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SolveResult {
    /// Number of completed iterations.
    pub iterations: u32,
    pub status: Status,
}

impl std::fmt::Display for SolveResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Iterations: {}", self.iterations)?;
        write!(f, "Status: {:?}", self.status)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Terminated,
    Running,
    Paused,
    Terminating,
}

/// Data passed to the iteration callback.
#[derive(Debug)]
pub struct CallbackArgs<'a> {
    pub iteration: u32,
    /// Objective value at the new point.
    pub value: f64,
    /// Gradient norm at the start of the iteration.
    pub gradient_norm: f64,
    pub step_size: f64,
    pub x: &'a [f64],
}

/// Called after every iteration. Returning `false` interrupts the run.
pub type Callback = Box<dyn FnMut(CallbackArgs) -> bool + Send + 'static>;

/// A way of choosing the direction of the next step.
pub trait DescentMethod: Send {
    fn name(&self) -> &'static str;
    /// Forget any state carried between iterations.
    fn reset(&mut self) {}
    /// Write a descent direction for the objective, which has been updated at
    /// the current point, into `p`.
    fn descent_direction(
        &mut self,
        objective: &dyn Objective,
        gradient: &[f64],
        p: &mut [f64],
    ) -> Result<(), Error>;
}

/// State shared between the controlling thread and the worker.
struct Shared {
    state: Mutex<ThreadState>,
    wake: Condvar,
    external_x: RwLock<Vec<f64>>,
    progressed: AtomicBool,
    last_result: Mutex<Option<SolveResult>>,
    callback: Mutex<Option<Callback>>,
}

impl Shared {
    fn read_x(&self) -> RwLockReadGuard<'_, Vec<f64>> {
        self.external_x
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_x(&self) -> RwLockWriteGuard<'_, Vec<f64>> {
        self.external_x
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ThreadState) {
        *lock(&self.state) = state;
        self.wake.notify_all();
    }

    /// Block while paused. Returns `false` when asked to terminate.
    fn wait_while_paused(&self) -> bool {
        let mut state = lock(&self.state);
        while *state == ThreadState::Paused {
            state = self
                .wake
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *state != ThreadState::Terminating
    }
}

/// Everything the worker owns while a run is in flight.
struct Work {
    method: Box<dyn DescentMethod>,
    params: SolverParams,
    line_search: LineSearch,
    objective: Option<Arc<dyn Objective>>,
    x: Vec<f64>,
    /// Iterations completed in the current run.
    iterations: u32,
}

impl Work {
    /// Run a single iteration. Returns the status that ends the run, if any.
    fn iterate(&mut self, shared: &Shared) -> Result<Option<Status>, Error> {
        let objective = match &self.objective {
            Some(objective) => Arc::clone(objective),
            None => return Ok(Some(Status::NothingToSolve)),
        };
        if self.x.is_empty() {
            return Ok(Some(Status::NothingToSolve));
        }
        if self.iterations >= self.params.max_iterations {
            return Ok(Some(Status::MaximumIterationsExceeded));
        }

        // Picks up weight and handle changes made since the last iteration.
        objective.update(&self.x, UpdateOptions::ALL)?;
        if !objective.is_valid() {
            log::warn!("Objective {:?} is not valid at the current point", objective.name());
            return Ok(Some(Status::InvalidObjective));
        }
        let value = objective.value();
        let gradient = objective.gradient();
        let gradient_norm = objective.gradient_norm();
        if gradient_norm <= self.params.gradient_tolerance {
            return Ok(Some(Status::Success));
        }

        let mut p = vec![0.0; self.x.len()];
        self.method
            .descent_direction(&*objective, &gradient, &mut p)?;
        let slope: f64 = gradient.iter().zip(p.iter()).map(|(g, p)| g * p).sum();

        let x_prev = self.x.clone();
        let ls = self
            .line_search
            .search(&*objective, &mut self.x, &p, value, slope)?;
        self.iterations += 1;

        {
            let mut external = shared.write_x();
            external.clear();
            external.extend_from_slice(&self.x);
        }
        shared.progressed.store(true, Ordering::Release);

        let dx = inf_norm(
            &x_prev
                .iter()
                .zip(self.x.iter())
                .map(|(a, b)| a - b)
                .collect::<Vec<_>>(),
        );
        log_debug_stats(
            self.iterations,
            ls.trials,
            value,
            ls.value,
            gradient_norm,
            ls.step_size,
            dx,
        );

        if let Some(callback) = lock(&shared.callback).as_mut() {
            let proceed = callback(CallbackArgs {
                iteration: self.iterations,
                value: ls.value,
                gradient_norm,
                step_size: ls.step_size,
                x: &self.x,
            });
            if !proceed {
                return Ok(Some(Status::Interrupted));
            }
        }

        if dx <= self.params.x_tolerance {
            return Ok(Some(Status::Success));
        }
        Ok(None)
    }

    fn finish(&self, shared: &Shared, status: Status) -> SolveResult {
        let result = SolveResult {
            iterations: self.iterations,
            status,
        };
        log::info!(
            "{} solver finished after {} iterations: {:?}",
            self.method.name(),
            result.iterations,
            status
        );
        *lock(&shared.last_result) = Some(result);
        result
    }
}

/// Worker thread body.
fn run(shared: Arc<Shared>, mut work: Work) -> Work {
    log::info!("Starting {} solver", work.method.name());
    log_debug_stats_header();
    let status = loop {
        if !shared.wait_while_paused() {
            break Status::Terminated;
        }
        match work.iterate(&shared) {
            Ok(None) => {}
            Ok(Some(status)) => break status,
            Err(err) => {
                log::error!("Solver iteration failed: {}", err);
                break Status::InvalidObjective;
            }
        }
    };
    work.finish(&shared, status);
    shared.set_state(ThreadState::Terminated);
    work
}

/// A descent solver that runs on its own thread.
///
/// The solver is controlled through `start`, `pause`, `resume` and `stop`,
/// while the most recently published point is available from any thread
/// through `external_x`. Dropping the solver stops the worker.
pub struct Solver {
    shared: Arc<Shared>,
    /// Present whenever no worker is running.
    work: Option<Work>,
    handle: Option<JoinHandle<Work>>,
}

impl Solver {
    pub fn new(method: Box<dyn DescentMethod>, params: SolverParams) -> Self {
        let line_search = LineSearch::new(params.line_search);
        Solver {
            shared: Arc::new(Shared {
                state: Mutex::new(ThreadState::Terminated),
                wake: Condvar::new(),
                external_x: RwLock::new(Vec::new()),
                progressed: AtomicBool::new(false),
                last_result: Mutex::new(None),
                callback: Mutex::new(None),
            }),
            work: Some(Work {
                method,
                params,
                line_search,
                objective: None,
                x: Vec::new(),
                iterations: 0,
            }),
            handle: None,
        }
    }

    pub fn newton(params: SolverParams) -> Self {
        Self::new(Box::new(Newton::new()), params)
    }

    pub fn gradient_descent(params: SolverParams) -> Self {
        Self::new(Box::new(GradientDescent), params)
    }

    pub fn thread_state(&self) -> ThreadState {
        *lock(&self.shared.state)
    }

    /// Reclaim the work from a worker that has finished on its own.
    fn join_finished(&mut self) {
        if self.thread_state() == ThreadState::Terminated {
            self.join();
        }
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(work) => self.work = Some(work),
                Err(_) => log::error!("Solver thread panicked"),
            }
        }
    }

    /// Work owned by the solver, available only while no worker runs.
    fn stopped_work(&mut self) -> Result<&mut Work, Error> {
        self.join_finished();
        if self.thread_state() != ThreadState::Terminated {
            return Err(Error::SolverRunning);
        }
        self.work.as_mut().ok_or(Error::SolverRunning)
    }

    /// Bind an initialized objective and a starting point.
    ///
    /// The objective is updated once at `x0`. Only allowed while the solver is
    /// terminated.
    pub fn init(&mut self, objective: Arc<dyn Objective>, x0: Vec<f64>) -> Result<(), Error> {
        let work = self.stopped_work()?;
        if x0.len() != objective.num_variables() {
            return Err(Error::SizeMismatch {
                expected: objective.num_variables(),
                actual: x0.len(),
            });
        }
        let report = objective.update(&x0, UpdateOptions::ALL)?;
        if report.has_inverted_faces() {
            log::warn!("Initial point has {} inverted faces", report.inverted_faces);
        }
        work.method.reset();
        work.objective = Some(objective);
        work.x = x0.clone();
        work.iterations = 0;
        *self.shared.write_x() = x0;
        *lock(&self.shared.last_result) = None;
        self.shared.progressed.store(true, Ordering::Release);
        Ok(())
    }

    /// Spawn the worker. Does nothing unless the solver is terminated.
    pub fn start(&mut self) -> Result<(), Error> {
        self.join_finished();
        if self.thread_state() != ThreadState::Terminated {
            return Ok(());
        }
        let mut work = match self.work.take() {
            Some(work) => work,
            None => {
                return Err(Error::Uninitialized {
                    name: "solver".to_string(),
                })
            }
        };
        if work.objective.is_none() {
            self.work = Some(work);
            return Err(Error::Uninitialized {
                name: "solver".to_string(),
            });
        }
        work.iterations = 0;
        self.shared.set_state(ThreadState::Running);
        let shared = Arc::clone(&self.shared);
        match std::thread::Builder::new()
            .name("uvopt-solver".to_string())
            .spawn(move || run(shared, work))
        {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.set_state(ThreadState::Terminated);
                Err(err.into())
            }
        }
    }

    pub fn pause(&self) {
        let mut state = lock(&self.shared.state);
        if *state == ThreadState::Running {
            *state = ThreadState::Paused;
        }
    }

    /// Wake a paused worker, or start one if the solver is terminated.
    pub fn resume(&mut self) -> Result<(), Error> {
        let state = self.thread_state();
        match state {
            ThreadState::Paused => {
                self.shared.set_state(ThreadState::Running);
                Ok(())
            }
            ThreadState::Terminated => self.start(),
            _ => Ok(()),
        }
    }

    /// Ask the worker to terminate and wait for it to exit.
    pub fn stop(&mut self) {
        {
            let mut state = lock(&self.shared.state);
            if matches!(*state, ThreadState::Running | ThreadState::Paused) {
                *state = ThreadState::Terminating;
            }
        }
        self.shared.wake.notify_all();
        self.join();
        *lock(&self.shared.state) = ThreadState::Terminated;
    }

    /// Run one iteration on the calling thread.
    ///
    /// Returns the status that would end a threaded run at this point, if
    /// any. Only allowed while the solver is terminated.
    pub fn step(&mut self) -> Result<Option<Status>, Error> {
        let shared = Arc::clone(&self.shared);
        let work = self.stopped_work()?;
        let status = work.iterate(&shared)?;
        if let Some(status) = status {
            work.finish(&shared, status);
        }
        Ok(status)
    }

    /// Install a callback called after every iteration, replacing any
    /// previous one. Takes effect at the next iteration.
    pub fn set_callback(&self, callback: Option<Callback>) {
        *lock(&self.shared.callback) = callback;
    }

    /// Remove the installed callback, if any.
    pub fn take_callback(&self) -> Option<Callback> {
        lock(&self.shared.callback).take()
    }

    pub fn params(&self) -> Option<SolverParams> {
        self.work.as_ref().map(|work| work.params)
    }

    /// Only allowed while the solver is terminated.
    pub fn set_params(&mut self, params: SolverParams) -> Result<(), Error> {
        let work = self.stopped_work()?;
        let flip_avoiding = work.line_search.is_flip_avoiding();
        work.params = params;
        work.line_search.params = params.line_search;
        if flip_avoiding {
            work.line_search.params.flip_avoiding = true;
        }
        Ok(())
    }

    /// Cap line search steps so that no face of `mesh` flips.
    ///
    /// Only allowed while the solver is terminated.
    pub fn enable_flip_avoiding_line_search(&mut self, mesh: &TriMesh) -> Result<(), Error> {
        let work = self.stopped_work()?;
        work.line_search.enable_flip_avoiding(mesh);
        work.params.line_search.flip_avoiding = true;
        Ok(())
    }

    pub fn disable_flip_avoiding_line_search(&mut self) -> Result<(), Error> {
        let work = self.stopped_work()?;
        work.line_search.disable_flip_avoiding();
        work.params.line_search.flip_avoiding = false;
        Ok(())
    }

    pub fn method_name(&self) -> Option<&'static str> {
        self.work.as_ref().map(|work| work.method.name())
    }

    /// Copy of the most recently published point.
    pub fn external_x(&self) -> Vec<f64> {
        self.shared.read_x().clone()
    }

    /// Whether a new point was published since the last call.
    pub fn has_progressed(&self) -> bool {
        self.shared.progressed.swap(false, Ordering::AcqRel)
    }

    /// Result of the last finished run.
    pub fn last_result(&self) -> Option<SolveResult> {
        *lock(&self.shared.last_result)
    }
}

impl Drop for Solver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn log_debug_stats_header() {
    log::debug!("    i |   value    |  value new |   grad-2   |    step    |   d-inf    | ls # ");
    log::debug!("------+------------+------------+------------+------------+------------+------");
}

fn log_debug_stats(
    iterations: u32,
    ls_steps: u32,
    value: f64,
    new_value: f64,
    gradient_norm: f64,
    step: f64,
    dx: f64,
) {
    log::debug!(
        "{i:>5} | {f:10.3e} | {fnew:10.3e} | {g:10.3e} | {s:10.3e} | {dx:10.3e} | {ls:>4} ",
        i = iterations,
        f = value,
        fnew = new_value,
        g = gradient_norm,
        s = step,
        dx = dx,
        ls = ls_steps
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectives::{AnglePreservingObjective, PositionObjective};
    use crate::test_utils::*;
    use crate::total::TotalObjective;
    use std::time::{Duration, Instant};

    /// Angle preserving energy with two pinned corners, which is a strictly
    /// convex quadratic.
    fn pinned_grid() -> Result<(TriMesh, Arc<dyn Objective>), Error> {
        let mesh = make_grid(3, 3);
        let position = PositionObjective::default();
        position
            .handles()
            .unwrap()
            .set(vec![0, 15], vec![[0.0, 0.0], [1.5, 1.0]])?;
        let mut total = TotalObjective::new();
        total.add_objective(Box::new(AnglePreservingObjective::default()), 1.0)?;
        total.add_objective(Box::new(position), 10.0)?;
        let total = init_objective(total, &mesh)?;
        Ok((mesh, Arc::new(total)))
    }

    fn wait_until_terminated(solver: &Solver) {
        let start = Instant::now();
        while solver.thread_state() != ThreadState::Terminated {
            assert!(start.elapsed() < Duration::from_secs(30));
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn start_requires_init() {
        let mut solver = Solver::gradient_descent(SolverParams::default());
        assert!(matches!(solver.start(), Err(Error::Uninitialized { .. })));
        assert_eq!(solver.thread_state(), ThreadState::Terminated);
    }

    #[test]
    fn init_checks_size() -> Result<(), Error> {
        let (_, objective) = pinned_grid()?;
        let mut solver = Solver::newton(SolverParams::default());
        assert!(matches!(
            solver.init(objective, vec![0.0; 3]),
            Err(Error::SizeMismatch { expected: 32, actual: 3 })
        ));
        Ok(())
    }

    #[test]
    fn synchronous_steps_decrease_the_objective() -> Result<(), Error> {
        let (mesh, objective) = pinned_grid()?;
        let mut solver = Solver::gradient_descent(SolverParams::default());
        let x0 = perturbed(&identity_uv(&mesh), 0.1, 7);
        solver.init(Arc::clone(&objective), x0.clone())?;
        assert!(solver.has_progressed());
        assert!(!solver.has_progressed());
        assert_eq!(solver.external_x(), x0);

        let mut prev = objective.value();
        for _ in 0..10 {
            assert_eq!(solver.step()?, None);
            assert!(solver.has_progressed());
            objective.update(&solver.external_x(), UpdateOptions::VALUE)?;
            let value = objective.value();
            assert!(value <= prev);
            prev = value;
        }
        Ok(())
    }

    #[test]
    fn newton_converges_on_a_quadratic() -> Result<(), Error> {
        let (mesh, objective) = pinned_grid()?;
        let params = SolverParams {
            gradient_tolerance: 1e-8,
            max_iterations: 20,
            ..Default::default()
        };
        let mut solver = Solver::newton(params);
        solver.init(objective, perturbed(&identity_uv(&mesh), 0.1, 2))?;
        solver.start()?;
        wait_until_terminated(&solver);
        solver.stop();
        let result = solver.last_result().unwrap();
        assert_eq!(result.status, Status::Success);
        assert!(result.iterations <= 3);
        Ok(())
    }

    #[test]
    fn iteration_limit_and_callback_end_the_run() -> Result<(), Error> {
        let (mesh, objective) = pinned_grid()?;
        let x0 = perturbed(&identity_uv(&mesh), 0.1, 5);
        let params = SolverParams {
            max_iterations: 3,
            ..Default::default()
        };
        let mut solver = Solver::gradient_descent(params);
        solver.init(Arc::clone(&objective), x0.clone())?;
        solver.start()?;
        wait_until_terminated(&solver);
        assert_eq!(
            solver.last_result(),
            Some(SolveResult {
                iterations: 3,
                status: Status::MaximumIterationsExceeded
            })
        );

        solver.set_params(SolverParams::default())?;
        solver.init(objective, x0)?;
        let callback: Callback = Box::new(|args| args.iteration < 2);
        solver.set_callback(Some(callback));
        solver.start()?;
        wait_until_terminated(&solver);
        assert_eq!(
            solver.last_result(),
            Some(SolveResult {
                iterations: 2,
                status: Status::Interrupted
            })
        );
        Ok(())
    }
}
