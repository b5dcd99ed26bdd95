//! Distortion energies and constraints.
//!
//! Each variant is an [`Energy`] kernel wrapped in an [`ObjectiveFunction`],
//! which supplies the shared update, snapshot and sparsity machinery.

mod angle_preserving;
mod area_preserving;
mod edge_pair_angle;
pub mod jacobian;
mod lagrangian;
mod one_ring_area;
mod position;
mod symmetric_dirichlet;

#[cfg(test)]
pub(crate) mod test_utils;

use serde::{Deserialize, Serialize};

pub use self::angle_preserving::AnglePreserving;
pub use self::area_preserving::AreaPreserving;
pub use self::edge_pair_angle::EdgePairAngle;
pub use self::jacobian::{Density, JacobianEnergy};
pub use self::lagrangian::Lagrangian;
pub use self::one_ring_area::OneRingAreaPreserving;
pub use self::position::{HandleSet, PositionEnergy};
pub use self::symmetric_dirichlet::SymmetricDirichlet;

use crate::objective::{Objective, ObjectiveFunction};

pub type AnglePreservingObjective = ObjectiveFunction<JacobianEnergy<AnglePreserving>>;
pub type AreaPreservingObjective = ObjectiveFunction<JacobianEnergy<AreaPreserving>>;
pub type SymmetricDirichletObjective = ObjectiveFunction<JacobianEnergy<SymmetricDirichlet>>;
pub type OneRingAreaPreservingObjective = ObjectiveFunction<OneRingAreaPreserving>;
pub type LagrangianObjective = ObjectiveFunction<Lagrangian>;
pub type PositionObjective = ObjectiveFunction<PositionEnergy>;
pub type EdgePairAngleObjective = ObjectiveFunction<EdgePairAngle>;

impl<D: Density> Default for ObjectiveFunction<JacobianEnergy<D>> {
    fn default() -> Self {
        ObjectiveFunction::from_energy(D::NAME, JacobianEnergy::default())
    }
}

impl Default for OneRingAreaPreservingObjective {
    fn default() -> Self {
        ObjectiveFunction::from_energy("One Ring Area Preserving", OneRingAreaPreserving::default())
    }
}

impl Default for LagrangianObjective {
    fn default() -> Self {
        ObjectiveFunction::from_energy("Lagrangian", Lagrangian::default())
    }
}

impl LagrangianObjective {
    /// `value + k Σ A (det J - 1)²` at the last update point.
    pub fn augmented_value(&self) -> f64 {
        Objective::augmented_value(self)
    }

    pub fn set_augmentation(&self, k: f64) {
        self.energy().set_augmentation(k);
    }
}

impl Default for PositionObjective {
    fn default() -> Self {
        PositionObjective::with_handles(HandleSet::new())
    }
}

impl PositionObjective {
    /// A positional penalty driven by the given (possibly shared) handles.
    pub fn with_handles(handles: HandleSet) -> Self {
        ObjectiveFunction::from_energy("Position", PositionEnergy::new(handles))
    }
}

impl EdgePairAngleObjective {
    pub fn new(edge1: [usize; 2], edge2: [usize; 2]) -> Self {
        ObjectiveFunction::from_energy("Edge Pair Angle", EdgePairAngle::new(edge1, edge2))
    }
}

/// The available objective variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ObjectiveKind {
    AnglePreserving,
    AreaPreserving,
    OneRingAreaPreserving,
    SymmetricDirichlet,
    Lagrangian,
    Position,
    EdgePairAngle { edge1: [usize; 2], edge2: [usize; 2] },
}

/// Create an uninitialized objective of the given kind.
pub fn create_objective(kind: &ObjectiveKind) -> Box<dyn Objective> {
    match *kind {
        ObjectiveKind::AnglePreserving => Box::new(AnglePreservingObjective::default()),
        ObjectiveKind::AreaPreserving => Box::new(AreaPreservingObjective::default()),
        ObjectiveKind::OneRingAreaPreserving => {
            Box::new(OneRingAreaPreservingObjective::default())
        }
        ObjectiveKind::SymmetricDirichlet => Box::new(SymmetricDirichletObjective::default()),
        ObjectiveKind::Lagrangian => Box::new(LagrangianObjective::default()),
        ObjectiveKind::Position => Box::new(PositionObjective::default()),
        ObjectiveKind::EdgePairAngle { edge1, edge2 } => {
            Box::new(EdgePairAngleObjective::new(edge1, edge2))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use crate::{Error, UpdateOptions};
    use std::sync::Arc;

    #[test]
    fn created_objectives_are_named_and_sized() -> Result<(), Error> {
        let mesh = make_unit_square();
        let kinds = [
            (ObjectiveKind::AnglePreserving, 8),
            (ObjectiveKind::AreaPreserving, 8),
            (ObjectiveKind::OneRingAreaPreserving, 8),
            (ObjectiveKind::SymmetricDirichlet, 8),
            (ObjectiveKind::Lagrangian, 10),
            (ObjectiveKind::Position, 8),
            (
                ObjectiveKind::EdgePairAngle {
                    edge1: [0, 1],
                    edge2: [0, 3],
                },
                8,
            ),
        ];
        let mut names = Vec::new();
        for (kind, num_variables) in kinds.iter() {
            let mut obj = create_objective(kind);
            obj.init_mesh(Arc::new(mesh.clone()))?;
            obj.init()?;
            assert_eq!(obj.num_variables(), *num_variables);
            let mut x = identity_uv(&mesh);
            x.resize(*num_variables, 0.0);
            obj.update(&x, UpdateOptions::ALL)?;
            assert_eq!(obj.per_face_energy().len(), 2);
            names.push(obj.name().to_string());
        }
        names.sort();
        names.dedup();
        assert_eq!(names.len(), kinds.len());
        Ok(())
    }
}
