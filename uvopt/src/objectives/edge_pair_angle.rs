use na::{Matrix2, SMatrix, Vector2};

use crate::matrix::HessianPattern;
use crate::mesh::TriMesh;
use crate::objective::Energy;
use crate::Error;

type EdgePairVector = SMatrix<f64, 8, 1>;
type EdgePairMatrix = SMatrix<f64, 8, 8>;

/// Squared edge lengths below this are treated as collapsed edges with zero
/// angle derivatives.
const MIN_EDGE_LENGTH_SQUARED: f64 = 1e-24;

/// Signed angle between two mesh edges in the UV plane,
/// `atan2(Δy1, Δx1) - atan2(Δy2, Δx2)` with `Δ = p(v2) - p(v1)` per edge.
///
/// Local variables are the endpoint coordinates
/// `[x11, y11, x12, y12, x21, y21, x22, y22]`.
#[derive(Clone, Debug, Default)]
pub struct EdgePairAngle {
    edges: [[usize; 2]; 2],
    num_vertices: usize,
    num_faces: usize,
    /// Edge vectors at the current point.
    deltas: [Vector2<f64>; 2],
}

impl EdgePairAngle {
    pub fn new(edge1: [usize; 2], edge2: [usize; 2]) -> Self {
        EdgePairAngle {
            edges: [edge1, edge2],
            ..Default::default()
        }
    }

    pub fn edges(&self) -> [[usize; 2]; 2] {
        self.edges
    }

    fn variables(&self) -> [usize; 8] {
        let n = self.num_vertices;
        let [[a, b], [c, d]] = self.edges;
        [a, n + a, b, n + b, c, n + c, d, n + d]
    }

    /// Angle of a single edge vector.
    fn angle(delta: &Vector2<f64>) -> f64 {
        delta[1].atan2(delta[0])
    }

    /// Gradient of the edge angle with respect to the edge vector.
    fn angle_gradient(delta: &Vector2<f64>) -> Vector2<f64> {
        let r2 = delta.norm_squared();
        if r2 < MIN_EDGE_LENGTH_SQUARED {
            return Vector2::zeros();
        }
        Vector2::new(-delta[1], delta[0]) / r2
    }

    /// Hessian of the edge angle with respect to the edge vector.
    fn angle_hessian(delta: &Vector2<f64>) -> Matrix2<f64> {
        let r2 = delta.norm_squared();
        if r2 < MIN_EDGE_LENGTH_SQUARED {
            return Matrix2::zeros();
        }
        let (x, y) = (delta[0], delta[1]);
        let r4 = r2 * r2;
        let xy = 2.0 * x * y / r4;
        let off = (y * y - x * x) / r4;
        Matrix2::new(xy, off, off, -xy)
    }
}

impl Energy for EdgePairAngle {
    fn init(&mut self, mesh: &TriMesh) -> Result<(), Error> {
        let n = mesh.num_vertices();
        for edge in self.edges.iter() {
            if edge[0] >= n || edge[1] >= n || edge[0] == edge[1] {
                return Err(Error::InvalidParameter {
                    name: format!("edge {:?}", edge),
                });
            }
        }
        self.num_vertices = n;
        self.num_faces = mesh.num_faces();
        Ok(())
    }

    fn num_variables(&self) -> usize {
        2 * self.num_vertices
    }

    fn num_faces(&self) -> usize {
        self.num_faces
    }

    fn hessian_elements(&self) -> Vec<Vec<usize>> {
        vec![self.variables().to_vec()]
    }

    fn update_x(&mut self, x: &[f64]) -> usize {
        let n = self.num_vertices;
        for (delta, &[a, b]) in self.deltas.iter_mut().zip(self.edges.iter()) {
            *delta = Vector2::new(x[b] - x[a], x[n + b] - x[n + a]);
        }
        0
    }

    fn value(&self, per_face: &mut [f64]) -> f64 {
        per_face.iter_mut().for_each(|e| *e = 0.0);
        Self::angle(&self.deltas[0]) - Self::angle(&self.deltas[1])
    }

    fn add_gradient(&self, grad: &mut [f64]) {
        let mut local = EdgePairVector::zeros();
        for (k, sign) in [(0, 1.0), (1, -1.0)] {
            let g = Self::angle_gradient(&self.deltas[k]) * sign;
            // The first endpoint enters the edge vector negatively.
            local.fixed_rows_mut::<2>(4 * k).copy_from(&(-g));
            local.fixed_rows_mut::<2>(4 * k + 2).copy_from(&g);
        }
        for (&v, &g) in self.variables().iter().zip(local.iter()) {
            grad[v] += g;
        }
    }

    fn add_hessian(&self, pattern: &HessianPattern, values: &mut [f64]) {
        let mut local = EdgePairMatrix::zeros();
        for (k, sign) in [(0, 1.0), (1, -1.0)] {
            let h = Self::angle_hessian(&self.deltas[k]) * sign;
            let o = 4 * k;
            local.fixed_view_mut::<2, 2>(o, o).copy_from(&h);
            local.fixed_view_mut::<2, 2>(o + 2, o + 2).copy_from(&h);
            local.fixed_view_mut::<2, 2>(o, o + 2).copy_from(&(-h));
            local.fixed_view_mut::<2, 2>(o + 2, o).copy_from(&(-h));
        }
        pattern.add_element_block(0, &local, 1.0, values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectives::test_utils::*;
    use crate::objectives::EdgePairAngleObjective;
    use crate::test_utils::*;
    use crate::{Objective, UpdateOptions};
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn right_angle() -> Result<(), Error> {
        let mesh = make_unit_square();
        let obj = init_objective(EdgePairAngleObjective::new([0, 3], [0, 1]), &mesh)?;
        obj.update(&identity_uv(&mesh), UpdateOptions::ALL)?;
        assert_relative_eq!(obj.value(), FRAC_PI_2, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn objective_derivatives() -> Result<(), Error> {
        let mesh = make_grid(2, 2);
        derivative_tester(|| EdgePairAngleObjective::new([0, 4], [1, 5]), &mesh, 0.05)?;
        // Edges sharing a vertex produce repeated variables in the element.
        derivative_tester(|| EdgePairAngleObjective::new([4, 0], [4, 2]), &mesh, 0.05)
    }

    #[test]
    fn invalid_edges_are_rejected() {
        let mesh = make_unit_square();
        assert!(init_objective(EdgePairAngleObjective::new([0, 9], [0, 1]), &mesh).is_err());
        assert!(init_objective(EdgePairAngleObjective::new([1, 1], [0, 1]), &mesh).is_err());
    }
}
