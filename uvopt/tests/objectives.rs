mod test_utils;

use std::sync::Arc;

use approx::*;
use uvopt::objectives::*;
use uvopt::*;
pub use test_utils::*;

fn all_kinds() -> Vec<ObjectiveKind> {
    vec![
        ObjectiveKind::AnglePreserving,
        ObjectiveKind::AreaPreserving,
        ObjectiveKind::OneRingAreaPreserving,
        ObjectiveKind::SymmetricDirichlet,
        ObjectiveKind::Lagrangian,
        ObjectiveKind::Position,
        ObjectiveKind::EdgePairAngle {
            edge1: [0, 1],
            edge2: [4, 5],
        },
    ]
}

fn init_kind(kind: &ObjectiveKind, mesh: &TriMesh) -> Result<Box<dyn Objective>, Error> {
    let mut obj = create_objective(kind);
    obj.init_mesh(Arc::new(mesh.clone()))?;
    obj.init()?;
    if let Some(handles) = obj.handles() {
        handles.set(vec![0, 5], vec![[0.0, 0.0], [1.0, 0.5]])?;
    }
    Ok(obj)
}

fn random_point(obj: &dyn Objective, mesh: &TriMesh, seed: u64) -> Vec<f64> {
    let mut x = identity_uv(mesh);
    x.resize(obj.num_variables(), 0.5);
    perturbed(&x, 0.1, seed)
}

/// Finite differences agree with the analytic derivatives of every variant.
#[test]
fn derivatives_match_finite_differences() -> Result<(), Error> {
    init_logger();
    let mesh = make_bumpy_grid(3, 2);
    for kind in all_kinds() {
        let obj = init_kind(&kind, &mesh)?;
        for seed in 0..3 {
            let x = random_point(obj.as_ref(), &mesh, seed);
            let gradient = obj.check_gradient(&x)?;
            assert!(gradient.passed(), "{:?}: {:?}", kind, gradient);
            let hessian = obj.check_hessian(&x)?;
            assert!(hessian.passed(), "{:?}: {:?}", kind, hessian);
        }
    }
    Ok(())
}

/// Patterns are lower triangular, free of duplicates and reproducible.
#[test]
fn hessian_patterns_are_canonical() -> Result<(), Error> {
    let mesh = make_bumpy_grid(3, 3);
    for kind in all_kinds() {
        let a = init_kind(&kind, &mesh)?;
        let b = init_kind(&kind, &mesh)?;
        let pa: Vec<_> = a.hessian_pattern().positions().collect();
        let pb: Vec<_> = b.hessian_pattern().positions().collect();
        assert_eq!(pa, pb, "{:?}", kind);
        assert!(pa.iter().all(|&(r, c)| r >= c), "{:?}", kind);
        let mut sorted = pa.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), pa.len(), "{:?}", kind);
    }
    Ok(())
}

/// Updating twice at the same point gives bit-identical results.
#[test]
fn updates_are_idempotent() -> Result<(), Error> {
    let mesh = make_bumpy_grid(4, 4);
    for kind in all_kinds() {
        let obj = init_kind(&kind, &mesh)?;
        let x = random_point(obj.as_ref(), &mesh, 9);
        obj.update(&x, UpdateOptions::ALL)?;
        let first = obj.snapshot();
        obj.update(&x, UpdateOptions::ALL)?;
        let second = obj.snapshot();
        assert_eq!(first.value.to_bits(), second.value.to_bits(), "{:?}", kind);
        assert_eq!(first.gradient, second.gradient, "{:?}", kind);
        assert_eq!(first.hessian_values, second.hessian_values, "{:?}", kind);
    }
    Ok(())
}

#[test]
fn total_is_the_weighted_sum() -> Result<(), Error> {
    let mesh = make_bumpy_grid(3, 3);
    let weights = [0.5, 0.0, 2.0, 1.5];
    let kinds = [
        ObjectiveKind::AnglePreserving,
        ObjectiveKind::AreaPreserving,
        ObjectiveKind::SymmetricDirichlet,
        ObjectiveKind::OneRingAreaPreserving,
    ];
    let mut total = TotalObjective::new();
    for (kind, &w) in kinds.iter().zip(weights.iter()) {
        total.add_objective(create_objective(kind), w)?;
    }
    let total = init_objective(total, &mesh)?;
    let x = perturbed(&identity_uv(&mesh), 0.05, 4);
    total.update(&x, UpdateOptions::ALL)?;

    let expected: f64 = total.objectives().map(|o| o.weight() * o.value()).sum();
    assert_relative_eq!(total.value(), expected, max_relative = 1e-12);
    // The zero weight term is still evaluated.
    assert!(total.objective(1).unwrap().value() > 0.0);

    total.set_objective_weight(1, 3.0)?;
    total.update(&x, UpdateOptions::VALUE)?;
    let expected: f64 = total.objectives().map(|o| o.weight() * o.value()).sum();
    assert_relative_eq!(total.value(), expected, max_relative = 1e-12);
    Ok(())
}

#[test]
fn identity_square_is_area_preserving() -> Result<(), Error> {
    let mesh = make_unit_square();
    let obj = init_objective(AreaPreservingObjective::default(), &mesh)?;
    let report = obj.update(&identity_uv(&mesh), UpdateOptions::ALL)?;
    assert!(!report.has_inverted_faces());
    assert_relative_eq!(obj.value(), 0.0, epsilon = 1e-14);
    for g in obj.gradient() {
        assert_relative_eq!(g, 0.0, epsilon = 1e-14);
    }
    Ok(())
}

#[test]
fn inverted_face_is_reported_not_raised() -> Result<(), Error> {
    let mesh = make_unit_square();
    let obj = init_objective(AreaPreservingObjective::default(), &mesh)?;
    let mut x = identity_uv(&mesh);
    // Push vertex 1 across the diagonal of the first face.
    x[1] = 0.2;
    x[4 + 1] = 0.8;
    let report = obj.update(&x, UpdateOptions::ALL)?;
    assert!(report.has_inverted_faces());
    assert!(obj.value().is_finite() && obj.value() > 0.0);
    assert!(obj.is_valid());
    Ok(())
}

#[test]
fn sparse_forms_agree() -> Result<(), Error> {
    let mesh = make_bumpy_grid(2, 2);
    let obj = init_objective(SymmetricDirichletObjective::default(), &mesh)?;
    obj.update(&perturbed(&identity_uv(&mesh), 0.1, 1), UpdateOptions::ALL)?;
    let csr = obj.hessian_row_major();
    let csc = obj.hessian_col_major();
    let (ii, jj, ss) = obj.hessian_triplets();
    for ((&r, &c), &v) in ii.iter().zip(jj.iter()).zip(ss.iter()) {
        assert_relative_eq!(*csr.get(r, c).unwrap(), v);
        assert_relative_eq!(*csc.get(r, c).unwrap(), v);
    }
    Ok(())
}
