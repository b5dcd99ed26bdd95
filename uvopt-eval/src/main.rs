use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use uvopt::{Session, SessionConfig, ThreadState};

const ABOUT: &str = "
Flatten a triangle mesh into the plane by minimizing a weighted sum of distortion energies.";

#[derive(Parser)]
#[clap(author, about = ABOUT, name = "uvopt")]
struct Opt {
    /// Path to the session configuration file in `ron` format.
    #[clap(name = "CONFIG", parse(from_os_str))]
    config: PathBuf,

    /// Output file for the optimized UV coordinates.
    ///
    /// Coordinates are written in `ron` format as a list of `(u, v)` pairs, one per vertex.
    #[clap(name = "OUTPUT", parse(from_os_str))]
    output: PathBuf,

    /// Log file path.
    #[clap(short, long, parse(from_os_str))]
    logfile: Option<PathBuf>,

    /// Override the maximum number of solver iterations.
    #[clap(short, long)]
    iterations: Option<u32>,

    /// Stop the solver after this many milliseconds.
    #[clap(short, long)]
    timeout_ms: Option<u64>,
}

pub fn main() {
    if let Err(err) = try_main() {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}

pub fn try_main() -> Result<()> {
    let _ = env_logger::Builder::from_env("UVOPT_LOG").try_init();

    let opt = Opt::parse();

    match opt.config.extension().and_then(|x| x.to_str()) {
        Some("ron") => {}
        Some(ext) => anyhow::bail!("Unsupported config extension: '.{}'", ext),
        None => anyhow::bail!(
            "Missing file extension in config path: {}",
            opt.config.display()
        ),
    }
    if opt.output.file_name().is_none() {
        anyhow::bail!(
            "Missing output file name in output path: {}",
            opt.output.display()
        );
    }

    // Pre-emptively create the log file. This way we can fail early.
    if let Some(logfile) = opt.logfile.as_ref() {
        let _ = std::fs::File::create(logfile)?;
    }

    let mut config = SessionConfig::load_from_ron(&opt.config)?;
    if let Some(iterations) = opt.iterations {
        config.solver_params.max_iterations = iterations;
    }

    // Write the config so we know how the following log was created.
    if let Some(logfile) = opt.logfile.as_ref() {
        let f = std::fs::File::options().append(true).open(logfile)?;
        let mut buf = std::io::BufWriter::new(f);
        let ron = ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::default())?;
        writeln!(buf, "\nConfig:\n{}", ron)?;
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst))?;
    }

    let mut session = Session::new(config)?;
    log::info!(
        "Optimizing {} vertices and {} faces",
        session.mesh().num_vertices(),
        session.mesh().num_faces()
    );

    let progress = ProgressBar::new_spinner();
    progress.set_style(ProgressStyle::default_spinner().template("{spinner} [{elapsed}] {msg}")?);

    let timeout = opt.timeout_ms.map(Duration::from_millis);
    let start = Instant::now();
    session.start()?;
    while session.thread_state() != ThreadState::Terminated {
        if interrupted.load(Ordering::SeqCst) {
            log::info!("Interrupted");
            break;
        }
        if timeout.map_or(false, |t| start.elapsed() > t) {
            log::info!("Timed out after {:?}", start.elapsed());
            break;
        }
        if session.poll().is_some() {
            let msg = session
                .energy_summaries()
                .iter()
                .map(|e| format!("{}: {:.6e}", e.name, e.weight * e.value))
                .collect::<Vec<_>>()
                .join(", ");
            progress.set_message(msg);
        }
        progress.tick();
        std::thread::sleep(Duration::from_millis(10));
    }
    session.stop();
    progress.finish_and_clear();

    let result = session.last_result();
    if let Some(result) = result.as_ref() {
        eprintln!("{}", result);
    }
    if let Some(logfile) = opt.logfile.as_ref() {
        let mut f = std::fs::File::options().append(true).open(logfile)?;
        match result.as_ref() {
            Some(result) => writeln!(f, "\nResult:\n{}", result)?,
            None => writeln!(f, "\nNo result")?,
        }
    }

    let uv = session.uv();
    let ron = ron::ser::to_string_pretty(&uv, ron::ser::PrettyConfig::default())?;
    std::fs::write(&opt.output, ron)?;
    Ok(())
}
