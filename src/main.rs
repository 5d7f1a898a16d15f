#[cfg(not(target_os = "android"))]
use clap::Parser;
#[cfg(not(target_os = "android"))]
use std::{
    io,
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
#[cfg(not(target_os = "android"))]
use webview_startup::{
    core::{
        config::{parse_config, StartupConfig},
        error::BoxError,
        logging::{init_host_logging, level_filter, StartupExpectation},
    },
    engine::native::NativeEngine,
    Looper, StartupGate,
};

/// Race a number of threads to start an engine that may only start once, on one thread.
#[cfg(not(target_os = "android"))]
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Config file, created with the defaults when missing
    #[arg(long)]
    config: Option<PathBuf>,

    /// Threads asking for the engine at the same time
    #[arg(long, default_value_t = 4)]
    callers: usize,

    /// How long the simulated startup routine takes
    #[arg(long, default_value_t = 50)]
    routine_ms: u64,

    /// Make the simulated startup routine fail
    #[arg(long)]
    fail: bool,

    /// Load the configured engine library instead of simulating one
    #[arg(long)]
    native: bool,

    /// Bind the engine to this thread's own looper instead of a main looper
    #[arg(long)]
    background: bool,
}

#[cfg(not(target_os = "android"))]
#[derive(Debug)]
enum DemoEngine {
    Simulated { started_on: String },
    Native(NativeEngine),
}

#[cfg(not(target_os = "android"))]
impl DemoEngine {
    fn describe(&self) -> String {
        match self {
            Self::Simulated { started_on } => format!("simulated engine started on {started_on}"),
            Self::Native(engine) => format!("native engine {}", engine.path()),
        }
    }
}

#[cfg(not(target_os = "android"))]
fn build_gate(args: &Args, config: &StartupConfig) -> StartupGate<DemoEngine> {
    if args.native {
        let engine_config = config.engine.clone();
        return StartupGate::new(move || {
            NativeEngine::start(&engine_config)
                .map(DemoEngine::Native)
                .map_err(BoxError::from)
        });
    }

    let routine_time = Duration::from_millis(args.routine_ms);
    let fail = args.fail;
    StartupGate::new(move || {
        thread::sleep(routine_time);
        if fail {
            return Err(BoxError::from(io::Error::other("simulated engine failure")));
        }
        Ok(DemoEngine::Simulated {
            started_on: thread::current().name().unwrap_or("<unnamed>").to_string(),
        })
    })
}

#[cfg(not(target_os = "android"))]
fn spawn_callers(
    gate: &StartupGate<DemoEngine>,
    callers: usize,
    require_main: bool,
) -> Vec<thread::JoinHandle<bool>> {
    let race_start = Instant::now();
    (0..callers)
        .map(|index| {
            let gate = gate.clone();
            thread::Builder::new()
                .name(format!("caller-{index}"))
                .spawn(move || match gate.ensure_started(require_main) {
                    Ok(engine) => {
                        log::info!(
                            "caller-{} got the {} after {:?}",
                            index,
                            engine.describe(),
                            race_start.elapsed()
                        );
                        true
                    }
                    Err(err) => {
                        log::error!(
                            "caller-{} failed after {:?}: {}",
                            index,
                            race_start.elapsed(),
                            err
                        );
                        false
                    }
                })
                .startup_expect("Failed to spawn caller thread")
        })
        .collect()
}

#[cfg(not(target_os = "android"))]
fn main() -> ExitCode {
    let args = Args::parse();
    let config = args
        .config
        .as_deref()
        .map(parse_config)
        .unwrap_or_default();
    init_host_logging(level_filter(config.logging.level.as_deref()));

    let gate = build_gate(&args, &config);
    if let Err(err) = gate.run_after_start(|engine| {
        log::info!(
            "Deferred task ran on {} against {}",
            thread::current().name().unwrap_or("<unnamed>"),
            engine.describe()
        )
    }) {
        log::warn!("Could not defer task: {}", err);
    }

    let outcomes: Vec<bool> = if args.background || !config.engine.require_main_looper {
        // This thread is the affinity thread: it runs the routine inline while the
        // callers block, then clears whatever they posted meanwhile
        let looper = Looper::prepare().startup_expect("Failed to prepare looper");
        gate.bind_affinity(Arc::new(looper.handle()))
            .startup_expect("Failed to bind engine to this thread");
        let callers = spawn_callers(&gate, args.callers, false);
        if let Err(err) = gate.ensure_started(false) {
            log::error!("Affinity thread failed to start the engine: {}", err);
        }
        looper.run_pending();
        callers
            .into_iter()
            .map(|caller| caller.join().unwrap_or(false))
            .collect()
    } else {
        let looper = Looper::spawn_main(&config.engine.looper_name)
            .startup_expect("Failed to spawn main looper");
        let outcomes = spawn_callers(&gate, args.callers, true)
            .into_iter()
            .map(|caller| caller.join().unwrap_or(false))
            .collect();
        looper.quit_and_join();
        outcomes
    };

    let succeeded = outcomes.iter().filter(|ok| **ok).count();
    log::info!(
        "{} of {} callers saw a started engine, gate is {:?}",
        succeeded,
        outcomes.len(),
        gate.status()
    );
    if gate.has_started() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(target_os = "android")]
fn main() {}
