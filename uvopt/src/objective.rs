//! Objective functions over the UV variable vector.
//!
//! An objective is shared between the solver thread, which updates it, and
//! any number of reader threads (viewers, loggers), which query its last
//! computed quantities. All mutable state lives behind interior locks so the
//! whole interface works through `&self` once the objective is initialized.

use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use sprs::CsMat;

use crate::matrix::HessianPattern;
use crate::mesh::TriMesh;
use crate::objectives::HandleSet;
use crate::{lock, norm, Error};

pub use crate::objectives::{create_objective, ObjectiveKind};

/// Central difference step relative to the magnitude of each variable.
const FD_STEP: f64 = 1e-6;
/// Relative tolerance used when reporting derivative mismatches.
const FD_TOLERANCE: f64 = 1e-4;

/// An `f64` that can be shared between threads.
#[derive(Debug, Default)]
pub(crate) struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(v: f64) -> Self {
        AtomicF64(AtomicU64::new(v.to_bits()))
    }
    #[inline]
    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
    #[inline]
    pub fn store(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed)
    }
}

/// Set of quantities to recompute on an update.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateOptions(u8);

impl UpdateOptions {
    pub const NONE: UpdateOptions = UpdateOptions(0);
    pub const VALUE: UpdateOptions = UpdateOptions(1);
    pub const VALUE_PER_FACE: UpdateOptions = UpdateOptions(1 << 1);
    pub const GRADIENT: UpdateOptions = UpdateOptions(1 << 2);
    pub const HESSIAN: UpdateOptions = UpdateOptions(1 << 3);
    pub const ALL: UpdateOptions = UpdateOptions(0b1111);

    #[inline]
    pub fn contains(self, other: UpdateOptions) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn intersects(self, other: UpdateOptions) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for UpdateOptions {
    type Output = UpdateOptions;
    fn bitor(self, rhs: UpdateOptions) -> UpdateOptions {
        UpdateOptions(self.0 | rhs.0)
    }
}

impl BitAnd for UpdateOptions {
    type Output = UpdateOptions;
    fn bitand(self, rhs: UpdateOptions) -> UpdateOptions {
        UpdateOptions(self.0 & rhs.0)
    }
}

impl BitOrAssign for UpdateOptions {
    fn bitor_assign(&mut self, rhs: UpdateOptions) {
        self.0 |= rhs.0;
    }
}

/// Information returned by an update.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Number of faces whose Jacobian determinant is negative at the new point.
    pub inverted_faces: usize,
}

impl UpdateReport {
    pub fn has_inverted_faces(&self) -> bool {
        self.inverted_faces > 0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// No mesh bound yet.
    Uninitialized,
    /// Mesh bound, sparsity pattern not yet built.
    MeshBound,
    /// Ready to be updated.
    Initialized,
    /// At least one update has completed.
    Updated,
}

/// Quantities computed by the most recent update.
#[derive(Clone, Debug, Default)]
pub struct ObjectiveSnapshot {
    pub value: f64,
    pub per_face: Vec<f64>,
    pub gradient: Vec<f64>,
    pub gradient_norm: f64,
    /// Values matching the rows and columns of the objective's Hessian pattern.
    pub hessian_values: Vec<f64>,
    pub inverted_faces: usize,
    /// Which of the quantities above correspond to the latest update point.
    pub computed: UpdateOptions,
    row_major: Option<CsMat<f64>>,
    col_major: Option<CsMat<f64>>,
}

impl ObjectiveSnapshot {
    pub(crate) fn new(num_variables: usize, num_faces: usize, nnz: usize) -> Self {
        ObjectiveSnapshot {
            per_face: vec![0.0; num_faces],
            gradient: vec![0.0; num_variables],
            hessian_values: vec![0.0; nnz],
            ..Default::default()
        }
    }

    /// Replace the quantities selected by `computed` with the given ones.
    pub(crate) fn publish(
        &mut self,
        computed: UpdateOptions,
        value: f64,
        per_face: Vec<f64>,
        gradient: Vec<f64>,
        hessian_values: Vec<f64>,
        inverted_faces: usize,
    ) {
        if computed.contains(UpdateOptions::VALUE) {
            self.value = value;
        }
        if computed.contains(UpdateOptions::VALUE_PER_FACE) {
            self.per_face = per_face;
        }
        if computed.contains(UpdateOptions::GRADIENT) {
            self.gradient_norm = norm(&gradient);
            self.gradient = gradient;
        }
        if computed.contains(UpdateOptions::HESSIAN) {
            self.hessian_values = hessian_values;
            self.row_major = None;
            self.col_major = None;
        }
        self.inverted_faces = inverted_faces;
        self.computed = computed;
    }
}

/// A scalar function of the variable vector with first and second derivatives.
pub trait Objective: Send + Sync {
    fn name(&self) -> &str;
    fn lifecycle(&self) -> Lifecycle;
    /// Bind the mesh this objective is defined on.
    fn init_mesh(&mut self, mesh: Arc<TriMesh>) -> Result<(), Error>;
    /// Precompute fixed per-mesh data and the Hessian sparsity pattern.
    fn init(&mut self) -> Result<(), Error>;
    fn num_variables(&self) -> usize;
    fn num_faces(&self) -> usize;
    fn hessian_pattern(&self) -> &HessianPattern;
    fn weight(&self) -> f64;
    fn set_weight(&self, weight: f64);
    /// Replace the Hessian by its positive semi-definite projection where the
    /// energy can be indefinite.
    fn set_enforce_psd(&self, enforce: bool);
    /// Recompute the selected quantities at `x`.
    fn update(&self, x: &[f64], options: UpdateOptions) -> Result<UpdateReport, Error>;
    /// The lock guarding the quantities computed by the last update.
    fn snapshot_mutex(&self) -> &Mutex<ObjectiveSnapshot>;

    /// Value including any augmentation terms. Only the Lagrangian objective
    /// augments its value.
    fn augmented_value(&self) -> f64 {
        self.value()
    }

    /// Position handles driven by this objective, if any.
    fn handles(&self) -> Option<HandleSet> {
        None
    }

    fn snapshot(&self) -> ObjectiveSnapshot {
        lock(self.snapshot_mutex()).clone()
    }

    fn value(&self) -> f64 {
        lock(self.snapshot_mutex()).value
    }

    fn per_face_energy(&self) -> Vec<f64> {
        lock(self.snapshot_mutex()).per_face.clone()
    }

    fn gradient(&self) -> Vec<f64> {
        lock(self.snapshot_mutex()).gradient.clone()
    }

    fn gradient_norm(&self) -> f64 {
        lock(self.snapshot_mutex()).gradient_norm
    }

    fn hessian_values(&self) -> Vec<f64> {
        lock(self.snapshot_mutex()).hessian_values.clone()
    }

    /// Lower triangular Hessian triplets `(ii, jj, ss)`.
    fn hessian_triplets(&self) -> (Vec<usize>, Vec<usize>, Vec<f64>) {
        let pattern = self.hessian_pattern();
        (
            pattern.rows().to_vec(),
            pattern.cols().to_vec(),
            self.hessian_values(),
        )
    }

    /// Lower triangular Hessian in CSR format. Built on first request after
    /// each Hessian update.
    fn hessian_row_major(&self) -> CsMat<f64> {
        let pattern = self.hessian_pattern();
        let mut guard = lock(self.snapshot_mutex());
        let snapshot = &mut *guard;
        let values = &snapshot.hessian_values;
        snapshot
            .row_major
            .get_or_insert_with(|| pattern.to_csr(values))
            .clone()
    }

    /// Lower triangular Hessian in CSC format. Built on first request after
    /// each Hessian update.
    fn hessian_col_major(&self) -> CsMat<f64> {
        let pattern = self.hessian_pattern();
        let mut guard = lock(self.snapshot_mutex());
        let snapshot = &mut *guard;
        let values = &snapshot.hessian_values;
        snapshot
            .col_major
            .get_or_insert_with(|| pattern.to_csc(values))
            .clone()
    }

    /// Whether an update has produced a finite value and gradient.
    fn is_valid(&self) -> bool {
        let snapshot = lock(self.snapshot_mutex());
        !snapshot.computed.is_empty()
            && snapshot.value.is_finite()
            && snapshot.gradient.iter().all(|g| g.is_finite())
    }

    /// Compare the analytic gradient at `x` against central differences.
    fn check_gradient(&self, x: &[f64]) -> Result<DerivativeCheck, Error> {
        check_gradient(self, x)
    }

    /// Compare the analytic Hessian at `x` against central differences of the
    /// gradient.
    fn check_hessian(&self, x: &[f64]) -> Result<DerivativeCheck, Error> {
        check_hessian(self, x)
    }
}

/// Per-variant evaluation kernel wrapped by [`ObjectiveFunction`].
pub trait Energy: Send {
    /// Precompute fixed data for the given (validated) mesh.
    fn init(&mut self, mesh: &TriMesh) -> Result<(), Error>;
    fn num_variables(&self) -> usize;
    fn num_faces(&self) -> usize;
    /// Lists of coupled variables, one per Hessian element, in the order
    /// `add_hessian` writes element blocks.
    fn hessian_elements(&self) -> Vec<Vec<usize>>;
    /// Set the current point, returning the number of inverted faces.
    fn update_x(&mut self, x: &[f64]) -> usize;
    /// Total value at the current point. Per face contributions are written
    /// into `per_face`.
    fn value(&self, per_face: &mut [f64]) -> f64;
    fn add_gradient(&self, grad: &mut [f64]);
    fn add_hessian(&self, pattern: &HessianPattern, values: &mut [f64]);

    fn set_enforce_psd(&mut self, _enforce: bool) {}

    fn augmented_value(&self) -> Option<f64> {
        None
    }

    fn handles(&self) -> Option<HandleSet> {
        None
    }
}

/// An [`Objective`] evaluated by an [`Energy`] kernel.
pub struct ObjectiveFunction<E> {
    name: String,
    weight: AtomicF64,
    mesh: Option<Arc<TriMesh>>,
    pattern: HessianPattern,
    initialized: bool,
    energy: Mutex<E>,
    snapshot: Mutex<ObjectiveSnapshot>,
}

impl<E: Energy> ObjectiveFunction<E> {
    pub fn from_energy(name: impl Into<String>, energy: E) -> Self {
        ObjectiveFunction {
            name: name.into(),
            weight: AtomicF64::new(1.0),
            mesh: None,
            pattern: HessianPattern::default(),
            initialized: false,
            energy: Mutex::new(energy),
            snapshot: Mutex::new(ObjectiveSnapshot::default()),
        }
    }

    /// Lock the underlying energy kernel.
    pub fn energy(&self) -> MutexGuard<'_, E> {
        lock(&self.energy)
    }

    pub fn mesh(&self) -> Option<&Arc<TriMesh>> {
        self.mesh.as_ref()
    }

    fn check_initialized(&self) -> Result<(), Error> {
        if self.initialized {
            Ok(())
        } else {
            Err(Error::Uninitialized {
                name: self.name.clone(),
            })
        }
    }
}

impl<E: Energy> Objective for ObjectiveFunction<E> {
    fn name(&self) -> &str {
        &self.name
    }

    fn lifecycle(&self) -> Lifecycle {
        if self.mesh.is_none() {
            Lifecycle::Uninitialized
        } else if !self.initialized {
            Lifecycle::MeshBound
        } else if lock(&self.snapshot).computed.is_empty() {
            Lifecycle::Initialized
        } else {
            Lifecycle::Updated
        }
    }

    fn init_mesh(&mut self, mesh: Arc<TriMesh>) -> Result<(), Error> {
        if self.initialized {
            return Err(Error::AlreadyInitialized {
                name: self.name.clone(),
            });
        }
        mesh.validate()?;
        self.mesh = Some(mesh);
        Ok(())
    }

    fn init(&mut self) -> Result<(), Error> {
        if self.initialized {
            return Err(Error::AlreadyInitialized {
                name: self.name.clone(),
            });
        }
        let mesh = self.mesh.as_ref().ok_or_else(|| Error::Uninitialized {
            name: self.name.clone(),
        })?;

        let energy = self.energy.get_mut().unwrap_or_else(|e| e.into_inner());
        energy.init(mesh)?;
        let n = energy.num_variables();
        self.pattern = HessianPattern::new(n, &energy.hessian_elements());
        *self.snapshot.get_mut().unwrap_or_else(|e| e.into_inner()) =
            ObjectiveSnapshot::new(n, energy.num_faces(), self.pattern.nnz());
        self.initialized = true;

        log::debug!(
            "Initialized {} objective: {} variables, {} Hessian non-zeros",
            self.name,
            n,
            self.pattern.nnz()
        );
        Ok(())
    }

    fn num_variables(&self) -> usize {
        self.pattern.size()
    }

    fn num_faces(&self) -> usize {
        self.mesh.as_ref().map_or(0, |m| m.num_faces())
    }

    fn hessian_pattern(&self) -> &HessianPattern {
        &self.pattern
    }

    fn weight(&self) -> f64 {
        self.weight.load()
    }

    fn set_weight(&self, weight: f64) {
        self.weight.store(weight);
    }

    fn set_enforce_psd(&self, enforce: bool) {
        self.energy().set_enforce_psd(enforce);
    }

    fn update(&self, x: &[f64], options: UpdateOptions) -> Result<UpdateReport, Error> {
        self.check_initialized()?;
        let n = self.num_variables();
        if x.len() != n {
            return Err(Error::SizeMismatch {
                expected: n,
                actual: x.len(),
            });
        }

        let mut energy = self.energy();
        let inverted_faces = energy.update_x(x);

        let mut computed = UpdateOptions::NONE;
        let mut value = 0.0;
        let mut per_face = Vec::new();
        if options.intersects(UpdateOptions::VALUE | UpdateOptions::VALUE_PER_FACE) {
            per_face = vec![0.0; energy.num_faces()];
            value = energy.value(&mut per_face);
            computed |= options & (UpdateOptions::VALUE | UpdateOptions::VALUE_PER_FACE);
            computed |= UpdateOptions::VALUE;
        }

        let mut gradient = Vec::new();
        if options.contains(UpdateOptions::GRADIENT) {
            gradient = vec![0.0; n];
            energy.add_gradient(&mut gradient);
            computed |= UpdateOptions::GRADIENT;
        }

        let mut hessian_values = Vec::new();
        if options.contains(UpdateOptions::HESSIAN) {
            hessian_values = vec![0.0; self.pattern.nnz()];
            energy.add_hessian(&self.pattern, &mut hessian_values);
            computed |= UpdateOptions::HESSIAN;
        }
        drop(energy);

        lock(&self.snapshot).publish(
            computed,
            value,
            per_face,
            gradient,
            hessian_values,
            inverted_faces,
        );

        if inverted_faces > 0 {
            log::trace!("{}: {} inverted faces", self.name, inverted_faces);
        }
        Ok(UpdateReport { inverted_faces })
    }

    fn snapshot_mutex(&self) -> &Mutex<ObjectiveSnapshot> {
        &self.snapshot
    }

    fn augmented_value(&self) -> f64 {
        let augmented = self.energy().augmented_value();
        augmented.unwrap_or_else(|| self.value())
    }

    fn handles(&self) -> Option<HandleSet> {
        self.energy().handles()
    }
}

/// Result of comparing analytic derivatives against finite differences.
#[derive(Clone, Debug, PartialEq)]
pub struct DerivativeCheck {
    pub max_abs_error: f64,
    pub max_rel_error: f64,
    /// Entry with the largest relative error.
    pub worst: Option<(usize, usize)>,
    /// Number of entries exceeding the tolerance.
    pub num_mismatched: usize,
}

impl DerivativeCheck {
    fn new() -> Self {
        DerivativeCheck {
            max_abs_error: 0.0,
            max_rel_error: 0.0,
            worst: None,
            num_mismatched: 0,
        }
    }

    fn compare(&mut self, entry: (usize, usize), analytic: f64, numeric: f64) {
        let abs = (analytic - numeric).abs();
        let rel = abs / analytic.abs().max(numeric.abs()).max(1.0);
        // Also catches NaNs.
        if !(rel <= FD_TOLERANCE) {
            self.num_mismatched += 1;
            if self.num_mismatched <= 10 {
                log::warn!(
                    "Derivative mismatch at {:?}: analytic {:.6e}, numeric {:.6e}",
                    entry,
                    analytic,
                    numeric
                );
            }
        }
        if !(rel <= self.max_rel_error) {
            self.max_rel_error = rel;
            self.worst = Some(entry);
        }
        self.max_abs_error = self.max_abs_error.max(abs);
    }

    pub fn passed(&self) -> bool {
        self.num_mismatched == 0
    }
}

pub fn check_gradient<O: Objective + ?Sized>(
    objective: &O,
    x: &[f64],
) -> Result<DerivativeCheck, Error> {
    objective.update(x, UpdateOptions::VALUE | UpdateOptions::GRADIENT)?;
    let analytic = objective.gradient();

    let mut check = DerivativeCheck::new();
    let mut xp = x.to_vec();
    for i in 0..x.len() {
        let h = FD_STEP * x[i].abs().max(1.0);
        xp[i] = x[i] + h;
        objective.update(&xp, UpdateOptions::VALUE)?;
        let fp = objective.value();
        xp[i] = x[i] - h;
        objective.update(&xp, UpdateOptions::VALUE)?;
        let fm = objective.value();
        xp[i] = x[i];
        check.compare((i, 0), analytic[i], (fp - fm) / (2.0 * h));
    }

    objective.update(x, UpdateOptions::ALL)?;
    log::info!(
        "{} gradient check: max abs error {:.3e}, max rel error {:.3e}",
        objective.name(),
        check.max_abs_error,
        check.max_rel_error
    );
    Ok(check)
}

pub fn check_hessian<O: Objective + ?Sized>(
    objective: &O,
    x: &[f64],
) -> Result<DerivativeCheck, Error> {
    objective.update(x, UpdateOptions::HESSIAN)?;
    let analytic = objective
        .hessian_pattern()
        .to_dense(&objective.hessian_values());

    let mut check = DerivativeCheck::new();
    let mut xp = x.to_vec();
    for j in 0..x.len() {
        let h = FD_STEP * x[j].abs().max(1.0);
        xp[j] = x[j] + h;
        objective.update(&xp, UpdateOptions::GRADIENT)?;
        let gp = objective.gradient();
        xp[j] = x[j] - h;
        objective.update(&xp, UpdateOptions::GRADIENT)?;
        let gm = objective.gradient();
        xp[j] = x[j];
        for i in 0..x.len() {
            check.compare((i, j), analytic[(i, j)], (gp[i] - gm[i]) / (2.0 * h));
        }
    }

    objective.update(x, UpdateOptions::ALL)?;
    log::info!(
        "{} hessian check: max abs error {:.3e}, max rel error {:.3e}",
        objective.name(),
        check.max_abs_error,
        check.max_rel_error
    );
    Ok(check)
}
