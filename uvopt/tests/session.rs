mod test_utils;

use std::time::{Duration, Instant};

use approx::*;
use uvopt::session::{EnergyConfig, HandleConfig};
use uvopt::*;
pub use test_utils::*;

fn dragging_config() -> SessionConfig {
    let mut config = SessionConfig::new(
        make_bumpy_grid(4, 4),
        vec![
            EnergyConfig {
                kind: ObjectiveKind::SymmetricDirichlet,
                weight: 1.0,
                enforce_psd: true,
            },
            EnergyConfig::new(ObjectiveKind::Position, 100.0),
        ],
    );
    config.handles = vec![
        HandleConfig {
            vertex: 0,
            target: None,
        },
        HandleConfig {
            vertex: 24,
            target: None,
        },
    ];
    config.flip_avoiding = true;
    config.solver_params.gradient_tolerance = 1e-8;
    config.solver_params.max_iterations = 200;
    config
}

fn run_to_completion(session: &mut Session) -> Result<SolveResult, Error> {
    session.start()?;
    let start = Instant::now();
    while session.thread_state() != ThreadState::Terminated {
        assert!(start.elapsed() < Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(1));
    }
    session.stop();
    Ok(session.last_result().unwrap())
}

/// Moving a handle between runs drags its vertex along.
#[test]
fn handles_drag_vertices() -> Result<(), Error> {
    init_logger();
    let mut session = Session::new(dragging_config())?;
    run_to_completion(&mut session)?;
    let before = session.uv();

    let (vertices, mut targets) = session.handles().snapshot();
    assert_eq!(vertices, vec![0, 24]);
    targets[1][0] += 0.25;
    session.handles().set_targets(targets.clone())?;
    run_to_completion(&mut session)?;
    let after = session.uv();

    assert_relative_eq!(after[24][0], targets[1][0], epsilon = 5e-2);
    assert!(after[24][0] > before[24][0] + 0.1);
    let report = session.total().update(&session.x(), UpdateOptions::VALUE)?;
    assert_eq!(report.inverted_faces, 0);
    Ok(())
}

/// Weight changes are picked up by the next iteration.
#[test]
fn weights_apply_to_the_running_solver() -> Result<(), Error> {
    let mut session = Session::new(dragging_config())?;
    session.set_weight(1, 0.0)?;
    session.step()?;
    let summaries = session.energy_summaries();
    assert_eq!(summaries[1].weight, 0.0);
    assert!(summaries[0].value.is_finite());
    assert_eq!(session.per_face_energy().len(), session.mesh().num_faces());
    assert!(session.set_weight(7, 1.0).is_err());
    Ok(())
}

#[test]
fn config_file_round_trip() -> Result<(), Error> {
    let config = dragging_config();
    let ron = ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::default())
        .map_err(|e| Error::Config(e.to_string()))?;
    let dir = std::env::temp_dir().join("uvopt_session_test");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("dragging.ron");
    std::fs::write(&path, ron)?;
    let loaded = SessionConfig::load_from_ron(&path)?;
    assert_eq!(loaded, config);
    assert!(matches!(
        SessionConfig::load_from_ron(dir.join("missing.ron")),
        Err(Error::FileIOError { .. })
    ));
    Ok(())
}
