//! Weighted sum of objectives.

use std::sync::{Arc, Mutex};

use ahash::AHashSet;

use crate::matrix::HessianPattern;
use crate::mesh::TriMesh;
use crate::objective::{AtomicF64, Lifecycle, Objective, ObjectiveSnapshot, UpdateOptions, UpdateReport};
use crate::objectives::HandleSet;
use crate::{lock, Error};

/// The objective handed to the solver: `Σ w_i f_i` over an ordered list of
/// sub-objectives.
///
/// Sub-objectives with fewer variables than the total act on a prefix of the
/// variable vector. Weights may be changed at any time and are read once per
/// update. Objectives with zero weight are still updated, so their values
/// stay available for display, but they do not contribute to the aggregated
/// gradient, Hessian or per-face energy.
pub struct TotalObjective {
    objectives: Vec<Box<dyn Objective>>,
    weight: AtomicF64,
    hessian_shift: AtomicF64,
    num_variables: usize,
    num_faces: usize,
    pattern: HessianPattern,
    /// Slots of the diagonal entries in `pattern`.
    diagonal_slots: Vec<usize>,
    /// For each sub-objective, the total slot of each of its own slots.
    slot_maps: Vec<Vec<usize>>,
    initialized: bool,
    snapshot: Mutex<ObjectiveSnapshot>,
}

impl Default for TotalObjective {
    fn default() -> Self {
        TotalObjective {
            objectives: Vec::new(),
            weight: AtomicF64::new(1.0),
            hessian_shift: AtomicF64::new(0.0),
            num_variables: 0,
            num_faces: 0,
            pattern: HessianPattern::default(),
            diagonal_slots: Vec::new(),
            slot_maps: Vec::new(),
            initialized: false,
            snapshot: Mutex::new(ObjectiveSnapshot::default()),
        }
    }
}

impl TotalObjective {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an objective with the given weight. The objective may be
    /// uninitialized; `init_mesh` and `init` are forwarded as needed.
    ///
    /// The set of objectives is fixed once the total is initialized, since
    /// the combined Hessian pattern is built in `init`. Adding after that
    /// returns `Error::AlreadyInitialized`; build a new total instead.
    pub fn add_objective(&mut self, objective: Box<dyn Objective>, weight: f64) -> Result<(), Error> {
        if self.initialized {
            return Err(Error::AlreadyInitialized {
                name: self.name().to_string(),
            });
        }
        objective.set_weight(weight);
        self.objectives.push(objective);
        Ok(())
    }

    /// Remove and return the objective at `index`.
    ///
    /// Like `add_objective`, only allowed before the total is initialized.
    /// Weights can still be changed at any time with `set_objective_weight`.
    pub fn remove_objective(&mut self, index: usize) -> Result<Box<dyn Objective>, Error> {
        if self.initialized {
            return Err(Error::AlreadyInitialized {
                name: self.name().to_string(),
            });
        }
        if index >= self.objectives.len() {
            return Err(Error::InvalidParameter {
                name: format!("objective index {}", index),
            });
        }
        Ok(self.objectives.remove(index))
    }

    pub fn len(&self) -> usize {
        self.objectives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objectives.is_empty()
    }

    pub fn objective(&self, index: usize) -> Option<&dyn Objective> {
        self.objectives.get(index).map(|o| o.as_ref())
    }

    pub fn objectives(&self) -> impl Iterator<Item = &dyn Objective> {
        self.objectives.iter().map(|o| o.as_ref())
    }

    pub fn set_objective_weight(&self, index: usize, weight: f64) -> Result<(), Error> {
        let objective = self.objectives.get(index).ok_or_else(|| Error::InvalidParameter {
            name: format!("objective index {}", index),
        })?;
        objective.set_weight(weight);
        Ok(())
    }

    pub fn objective_weight(&self, index: usize) -> Option<f64> {
        self.objectives.get(index).map(|o| o.weight())
    }

    pub fn hessian_shift(&self) -> f64 {
        self.hessian_shift.load()
    }

    /// Set the amount added to every diagonal Hessian entry.
    pub fn set_hessian_shift(&self, shift: f64) -> Result<(), Error> {
        if !(shift >= 0.0) {
            return Err(Error::InvalidParameter {
                name: "hessian_shift".to_string(),
            });
        }
        self.hessian_shift.store(shift);
        Ok(())
    }
}

impl Objective for TotalObjective {
    fn name(&self) -> &str {
        "Total"
    }

    fn lifecycle(&self) -> Lifecycle {
        if !self.initialized {
            if !self.objectives.is_empty()
                && self
                    .objectives
                    .iter()
                    .all(|o| o.lifecycle() != Lifecycle::Uninitialized)
            {
                Lifecycle::MeshBound
            } else {
                Lifecycle::Uninitialized
            }
        } else if lock(&self.snapshot).computed.is_empty() {
            Lifecycle::Initialized
        } else {
            Lifecycle::Updated
        }
    }

    fn init_mesh(&mut self, mesh: Arc<TriMesh>) -> Result<(), Error> {
        if self.initialized {
            return Err(Error::AlreadyInitialized {
                name: self.name().to_string(),
            });
        }
        mesh.validate()?;
        for objective in self.objectives.iter_mut() {
            if objective.lifecycle() == Lifecycle::Uninitialized {
                objective.init_mesh(Arc::clone(&mesh))?;
            }
        }
        self.num_faces = mesh.num_faces();
        Ok(())
    }

    fn init(&mut self) -> Result<(), Error> {
        if self.initialized {
            return Err(Error::AlreadyInitialized {
                name: self.name().to_string(),
            });
        }
        if self.objectives.is_empty() {
            return Err(Error::InvalidParameter {
                name: "objectives".to_string(),
            });
        }
        for objective in self.objectives.iter_mut() {
            if objective.lifecycle() == Lifecycle::MeshBound {
                objective.init()?;
            }
        }
        if let Some(o) = self.objectives.iter().find(|o| o.lifecycle() == Lifecycle::Uninitialized) {
            return Err(Error::Uninitialized {
                name: o.name().to_string(),
            });
        }

        let n = self.objectives.iter().map(|o| o.num_variables()).max().unwrap_or(0);
        self.num_faces = self.objectives.iter().map(|o| o.num_faces()).max().unwrap_or(0);

        let mut positions = AHashSet::new();
        for objective in self.objectives.iter() {
            positions.extend(objective.hessian_pattern().positions());
        }
        positions.extend((0..n).map(|i| (i, i)));
        self.pattern = HessianPattern::from_positions(n, positions);

        let mut slot_maps = Vec::with_capacity(self.objectives.len());
        for objective in self.objectives.iter() {
            let map = objective
                .hessian_pattern()
                .positions()
                .map(|(r, c)| self.pattern.slot(r, c))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(missing_slot)?;
            slot_maps.push(map);
        }
        self.slot_maps = slot_maps;
        self.diagonal_slots = (0..n)
            .map(|i| self.pattern.slot(i, i))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(missing_slot)?;

        self.num_variables = n;
        *self.snapshot.get_mut().unwrap_or_else(|e| e.into_inner()) =
            ObjectiveSnapshot::new(n, self.num_faces, self.pattern.nnz());
        self.initialized = true;
        log::debug!(
            "Initialized total objective: {} terms, {} variables, {} Hessian non-zeros",
            self.objectives.len(),
            n,
            self.pattern.nnz()
        );
        Ok(())
    }

    fn num_variables(&self) -> usize {
        self.num_variables
    }

    fn num_faces(&self) -> usize {
        self.num_faces
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
        for objective in self.objectives.iter() {
            objective.set_enforce_psd(enforce);
        }
    }

    fn update(&self, x: &[f64], options: UpdateOptions) -> Result<UpdateReport, Error> {
        if !self.initialized {
            return Err(Error::Uninitialized {
                name: self.name().to_string(),
            });
        }
        if x.len() != self.num_variables {
            return Err(Error::SizeMismatch {
                expected: self.num_variables,
                actual: x.len(),
            });
        }

        let want_value = options.intersects(UpdateOptions::VALUE | UpdateOptions::VALUE_PER_FACE);
        let mut value = 0.0;
        let mut per_face = if want_value {
            vec![0.0; self.num_faces]
        } else {
            Vec::new()
        };
        let mut gradient = if options.contains(UpdateOptions::GRADIENT) {
            vec![0.0; self.num_variables]
        } else {
            Vec::new()
        };
        let mut hessian_values = if options.contains(UpdateOptions::HESSIAN) {
            vec![0.0; self.pattern.nnz()]
        } else {
            Vec::new()
        };

        let mut inverted_faces = 0;
        for (objective, slot_map) in self.objectives.iter().zip(self.slot_maps.iter()) {
            let m = objective.num_variables();
            let report = objective.update(&x[..m], options)?;
            inverted_faces = inverted_faces.max(report.inverted_faces);

            let w = objective.weight();
            let sub = lock(objective.snapshot_mutex());
            if want_value {
                value += w * sub.value;
            }
            if w == 0.0 {
                continue;
            }
            if want_value {
                for (e, &s) in per_face.iter_mut().zip(sub.per_face.iter()) {
                    *e += w * s;
                }
            }
            if options.contains(UpdateOptions::GRADIENT) {
                for (g, &s) in gradient.iter_mut().zip(sub.gradient.iter()) {
                    *g += w * s;
                }
            }
            if options.contains(UpdateOptions::HESSIAN) {
                for (&slot, &s) in slot_map.iter().zip(sub.hessian_values.iter()) {
                    hessian_values[slot] += w * s;
                }
            }
        }

        if options.contains(UpdateOptions::HESSIAN) {
            let shift = self.hessian_shift.load();
            if shift != 0.0 {
                for &slot in self.diagonal_slots.iter() {
                    hessian_values[slot] += shift;
                }
            }
        }

        let mut computed = options & UpdateOptions::ALL;
        if want_value {
            computed |= UpdateOptions::VALUE;
        }
        lock(&self.snapshot).publish(
            computed,
            value,
            per_face,
            gradient,
            hessian_values,
            inverted_faces,
        );
        Ok(UpdateReport { inverted_faces })
    }

    fn snapshot_mutex(&self) -> &Mutex<ObjectiveSnapshot> {
        &self.snapshot
    }

    fn augmented_value(&self) -> f64 {
        self.objectives
            .iter()
            .map(|o| o.weight() * o.augmented_value())
            .sum()
    }

    fn handles(&self) -> Option<HandleSet> {
        self.objectives.iter().find_map(|o| o.handles())
    }
}

fn missing_slot() -> Error {
    Error::InvalidParameter {
        name: "hessian pattern".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectives::{
        AnglePreservingObjective, AreaPreservingObjective, LagrangianObjective,
        PositionObjective, SymmetricDirichletObjective,
    };
    use crate::test_utils::*;
    use approx::assert_relative_eq;

    fn build_total(mesh: &TriMesh) -> Result<TotalObjective, Error> {
        let mut total = TotalObjective::new();
        total.add_objective(Box::new(AnglePreservingObjective::default()), 1.0)?;
        total.add_objective(Box::new(AreaPreservingObjective::default()), 0.5)?;
        total.add_objective(Box::new(SymmetricDirichletObjective::default()), 0.0)?;
        let position = PositionObjective::default();
        position.handles().unwrap().set(vec![0], vec![[0.2, -0.1]])?;
        total.add_objective(Box::new(position), 3.0)?;
        total.init_mesh(Arc::new(mesh.clone()))?;
        total.init()?;
        Ok(total)
    }

    #[test]
    fn objective_set_is_fixed_after_init() -> Result<(), Error> {
        let mesh = make_grid(2, 2);
        let mut total = TotalObjective::new();
        total.add_objective(Box::new(AreaPreservingObjective::default()), 1.0)?;
        total.add_objective(Box::new(AnglePreservingObjective::default()), 1.0)?;
        let removed = total.remove_objective(0)?;
        assert_eq!(removed.name(), "Area Preserving");
        assert!(total.remove_objective(5).is_err());

        total.init_mesh(Arc::new(mesh))?;
        total.init()?;
        assert!(matches!(
            total.add_objective(Box::new(AreaPreservingObjective::default()), 1.0),
            Err(Error::AlreadyInitialized { .. })
        ));
        assert!(matches!(
            total.remove_objective(0),
            Err(Error::AlreadyInitialized { .. })
        ));
        // Weights stay adjustable.
        total.set_objective_weight(0, 2.0)?;
        assert_eq!(total.objective_weight(0), Some(2.0));
        Ok(())
    }

    #[test]
    fn weighted_sum() -> Result<(), Error> {
        let mesh = make_bumpy_grid(3, 3);
        let total = build_total(&mesh)?;
        let x = perturbed(&identity_uv(&mesh), 0.05, 1);
        total.update(&x, UpdateOptions::ALL)?;

        let mut value = 0.0;
        let mut gradient = vec![0.0; x.len()];
        for obj in total.objectives() {
            value += obj.weight() * obj.value();
            if obj.weight() != 0.0 {
                for (g, s) in gradient.iter_mut().zip(obj.gradient()) {
                    *g += obj.weight() * s;
                }
            }
            // Zero weight objectives are still updated.
            assert!(obj.is_valid());
        }
        assert_relative_eq!(total.value(), value, max_relative = 1e-12);
        for (a, b) in total.gradient().iter().zip(gradient.iter()) {
            assert_relative_eq!(a, b, max_relative = 1e-12, epsilon = 1e-14);
        }
        Ok(())
    }

    #[test]
    fn derivatives() -> Result<(), Error> {
        let mesh = make_bumpy_grid(2, 2);
        let total = build_total(&mesh)?;
        let x = perturbed(&identity_uv(&mesh), 0.05, 2);
        assert!(total.check_gradient(&x)?.passed());
        assert!(total.check_hessian(&x)?.passed());
        Ok(())
    }

    #[test]
    fn pattern_contains_full_diagonal_and_sub_patterns() -> Result<(), Error> {
        let mesh = make_grid(2, 1);
        let total = build_total(&mesh)?;
        let pattern = total.hessian_pattern();
        for i in 0..total.num_variables() {
            assert!(pattern.slot(i, i).is_some());
        }
        for obj in total.objectives() {
            for (r, c) in obj.hessian_pattern().positions() {
                assert!(pattern.slot(r, c).is_some());
            }
        }
        assert!(pattern.positions().all(|(r, c)| r >= c));
        Ok(())
    }

    #[test]
    fn hessian_shift_moves_the_diagonal() -> Result<(), Error> {
        let mesh = make_unit_square();
        let total = build_total(&mesh)?;
        let x = identity_uv(&mesh);
        total.update(&x, UpdateOptions::HESSIAN)?;
        let h0 = total.hessian_values();
        total.set_hessian_shift(0.25)?;
        total.update(&x, UpdateOptions::HESSIAN)?;
        let h1 = total.hessian_values();
        let pattern = total.hessian_pattern();
        for (k, (r, c)) in pattern.positions().enumerate() {
            let expected = if r == c { h0[k] + 0.25 } else { h0[k] };
            assert_relative_eq!(h1[k], expected);
        }
        assert!(total.set_hessian_shift(-1.0).is_err());
        Ok(())
    }

    #[test]
    fn repeated_updates_are_identical() -> Result<(), Error> {
        let mesh = make_bumpy_grid(4, 3);
        let total = build_total(&mesh)?;
        let x = perturbed(&identity_uv(&mesh), 0.05, 3);
        total.update(&x, UpdateOptions::ALL)?;
        let first = total.snapshot();
        total.update(&x, UpdateOptions::ALL)?;
        let second = total.snapshot();
        assert_eq!(first.value.to_bits(), second.value.to_bits());
        assert_eq!(first.gradient, second.gradient);
        assert_eq!(first.hessian_values, second.hessian_values);
        Ok(())
    }

    #[test]
    fn extra_variables_extend_the_total() -> Result<(), Error> {
        let mesh = make_unit_square();
        let mut total = TotalObjective::new();
        total.add_objective(Box::new(AnglePreservingObjective::default()), 1.0)?;
        total.add_objective(Box::new(LagrangianObjective::default()), 1.0)?;
        total.init_mesh(Arc::new(mesh.clone()))?;
        total.init()?;
        assert_eq!(total.num_variables(), 2 * 4 + 2);
        let mut x = identity_uv(&mesh);
        x.extend_from_slice(&[0.0, 0.0]);
        total.update(&x, UpdateOptions::ALL)?;
        assert_eq!(total.gradient().len(), 10);
        assert!(matches!(
            total.add_objective(Box::new(AreaPreservingObjective::default()), 1.0),
            Err(Error::AlreadyInitialized { .. })
        ));
        Ok(())
    }
}
