use std::sync::{Arc, Mutex};

use na::Matrix1;

use crate::matrix::HessianPattern;
use crate::mesh::TriMesh;
use crate::objective::Energy;
use crate::{lock, Error};

#[derive(Clone, Debug, Default, PartialEq)]
struct Handles {
    vertices: Vec<usize>,
    targets: Vec<[f64; 2]>,
    /// Known once the owning objective is initialized.
    num_vertices: Option<usize>,
}

/// Vertices pinned to target UV positions.
///
/// The set is shared between the objective and whoever edits the handles.
/// Edits take effect at the next objective update.
#[derive(Clone, Debug, Default)]
pub struct HandleSet {
    inner: Arc<Mutex<Handles>>,
}

impl HandleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all handles.
    pub fn set(&self, vertices: Vec<usize>, targets: Vec<[f64; 2]>) -> Result<(), Error> {
        if vertices.len() != targets.len() {
            return Err(Error::SizeMismatch {
                expected: vertices.len(),
                actual: targets.len(),
            });
        }
        let mut handles = lock(&self.inner);
        if let Some(n) = handles.num_vertices {
            if let Some(&vertex) = vertices.iter().find(|&&v| v >= n) {
                return Err(Error::InvalidHandle { vertex });
            }
        }
        handles.vertices = vertices;
        handles.targets = targets;
        Ok(())
    }

    /// Move the targets of the current handles.
    pub fn set_targets(&self, targets: Vec<[f64; 2]>) -> Result<(), Error> {
        let mut handles = lock(&self.inner);
        if handles.vertices.len() != targets.len() {
            return Err(Error::SizeMismatch {
                expected: handles.vertices.len(),
                actual: targets.len(),
            });
        }
        handles.targets = targets;
        Ok(())
    }

    /// Translate every target by `delta`.
    pub fn offset(&self, delta: [f64; 2]) {
        let mut handles = lock(&self.inner);
        for t in handles.targets.iter_mut() {
            t[0] += delta[0];
            t[1] += delta[1];
        }
    }

    pub fn clear(&self) {
        let mut handles = lock(&self.inner);
        handles.vertices.clear();
        handles.targets.clear();
    }

    /// Current handle vertices and their targets.
    pub fn snapshot(&self) -> (Vec<usize>, Vec<[f64; 2]>) {
        let handles = lock(&self.inner);
        (handles.vertices.clone(), handles.targets.clone())
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bind(&self, num_vertices: usize) {
        let mut handles = lock(&self.inner);
        handles.num_vertices = Some(num_vertices);
        let Handles {
            vertices, targets, ..
        } = &mut *handles;
        let before = vertices.len();
        let mut keep = vertices.iter().map(|&v| v < num_vertices);
        targets.retain(|_| keep.next().unwrap_or(false));
        vertices.retain(|&v| v < num_vertices);
        if vertices.len() < before {
            log::warn!(
                "Dropped {} handles referencing missing vertices",
                before - vertices.len()
            );
        }
    }
}

/// Quadratic penalty pulling handle vertices towards their targets.
#[derive(Debug, Default)]
pub struct PositionEnergy {
    handles: HandleSet,
    num_vertices: usize,
    num_faces: usize,
    /// Handles captured at the last update with the current UV of each.
    active: Vec<(usize, [f64; 2], [f64; 2])>,
}

impl PositionEnergy {
    pub fn new(handles: HandleSet) -> Self {
        PositionEnergy {
            handles,
            ..Default::default()
        }
    }
}

impl Energy for PositionEnergy {
    fn init(&mut self, mesh: &TriMesh) -> Result<(), Error> {
        self.num_vertices = mesh.num_vertices();
        self.num_faces = mesh.num_faces();
        self.handles.bind(self.num_vertices);
        Ok(())
    }

    fn num_variables(&self) -> usize {
        2 * self.num_vertices
    }

    fn num_faces(&self) -> usize {
        self.num_faces
    }

    /// Every UV variable is its own element, so the pattern is the full
    /// diagonal regardless of which vertices are handles.
    fn hessian_elements(&self) -> Vec<Vec<usize>> {
        (0..2 * self.num_vertices).map(|i| vec![i]).collect()
    }

    fn update_x(&mut self, x: &[f64]) -> usize {
        let n = self.num_vertices;
        let (vertices, targets) = self.handles.snapshot();
        self.active = vertices
            .into_iter()
            .zip(targets)
            .filter(|&(v, _)| v < n)
            .map(|(v, t)| (v, t, [x[v], x[n + v]]))
            .collect();
        0
    }

    fn value(&self, per_face: &mut [f64]) -> f64 {
        per_face.iter_mut().for_each(|e| *e = 0.0);
        self.active
            .iter()
            .map(|(_, t, p)| {
                let (du, dv) = (p[0] - t[0], p[1] - t[1]);
                du * du + dv * dv
            })
            .sum()
    }

    fn add_gradient(&self, grad: &mut [f64]) {
        let n = self.num_vertices;
        for &(v, t, p) in self.active.iter() {
            grad[v] += 2.0 * (p[0] - t[0]);
            grad[n + v] += 2.0 * (p[1] - t[1]);
        }
    }

    fn add_hessian(&self, pattern: &HessianPattern, values: &mut [f64]) {
        let n = self.num_vertices;
        let two = Matrix1::new(2.0);
        for &(v, _, _) in self.active.iter() {
            pattern.add_element_block(v, &two, 1.0, values);
            pattern.add_element_block(n + v, &two, 1.0, values);
        }
    }

    fn handles(&self) -> Option<HandleSet> {
        Some(self.handles.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectives::test_utils::*;
    use crate::objectives::PositionObjective;
    use crate::test_utils::*;
    use crate::{Objective, UpdateOptions};
    use approx::assert_relative_eq;

    fn square_with_handles() -> Result<(TriMesh, PositionObjective), Error> {
        let mesh = make_unit_square();
        let obj = init_objective(PositionObjective::default(), &mesh)?;
        obj.handles()
            .unwrap()
            .set(vec![0, 2], vec![[0.5, 0.5], [1.0, 2.0]])?;
        Ok((mesh, obj))
    }

    #[test]
    fn objective_derivatives() -> Result<(), Error> {
        let mesh = make_grid(2, 2);
        derivative_tester(
            || {
                let obj = PositionObjective::default();
                obj.handles()
                    .unwrap()
                    .set(vec![0, 4, 8], vec![[0.1, 0.2], [0.5, 0.5], [2.0, 1.0]])
                    .unwrap();
                obj
            },
            &mesh,
            0.1,
        )
    }

    #[test]
    fn value_gradient_and_hessian() -> Result<(), Error> {
        let (mesh, obj) = square_with_handles()?;
        let n = mesh.num_vertices();
        obj.update(&identity_uv(&mesh), UpdateOptions::ALL)?;
        // (0 - 0.5)² + (0 - 0.5)² + (1 - 1)² + (1 - 2)²
        assert_relative_eq!(obj.value(), 1.5);
        let g = obj.gradient();
        assert_relative_eq!(g[0], -1.0);
        assert_relative_eq!(g[n], -1.0);
        assert_relative_eq!(g[n + 2], -2.0);

        let pattern = obj.hessian_pattern();
        assert_eq!(pattern.nnz(), 2 * n);
        let h = obj.hessian_values();
        assert_relative_eq!(h[pattern.slot(0, 0).unwrap()], 2.0);
        assert_relative_eq!(h[pattern.slot(1, 1).unwrap()], 0.0);
        Ok(())
    }

    #[test]
    fn handle_edits_apply_on_next_update() -> Result<(), Error> {
        let (mesh, obj) = square_with_handles()?;
        let x = identity_uv(&mesh);
        let handles = obj.handles().unwrap();

        handles.offset([1.0, 0.0]);
        obj.update(&x, UpdateOptions::VALUE)?;
        // (0 - 1.5)² + (0 - 0.5)² + (1 - 2)² + (1 - 2)²
        assert_relative_eq!(obj.value(), 4.5);

        handles.clear();
        obj.update(&x, UpdateOptions::VALUE)?;
        assert_relative_eq!(obj.value(), 0.0);

        assert!(matches!(
            handles.set(vec![7], vec![[0.0, 0.0]]),
            Err(Error::InvalidHandle { vertex: 7 })
        ));
        Ok(())
    }
}
