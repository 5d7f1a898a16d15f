use crate::{
    core::{
        config::{self, StartupConfig},
        error::LooperError,
        logging::level_filter,
    },
    engine::{
        gate::StartupGate,
        looper::{Looper, SpawnedLooper},
        native::NativeEngine,
    },
};
use jni::{
    objects::{JClass, JString},
    sys::{jboolean, JNI_FALSE, JNI_TRUE},
    JNIEnv,
};
use sentry::integrations::log::{LogFilter, SentryLogger};
use std::{
    path::Path,
    sync::{Arc, Mutex, OnceLock},
};

struct Bridge {
    gate: StartupGate<NativeEngine>,
    _looper: SpawnedLooper,
}

static BRIDGE: OnceLock<Bridge> = OnceLock::new();
static INIT: Mutex<()> = Mutex::new(());

fn init_logging(config: &StartupConfig) {
    let log_level = level_filter(config.logging.level.as_deref());

    let Some(dsn) = config.logging.sentry_dsn.as_deref().filter(|dsn| !dsn.is_empty()) else {
        android_logger::init_once(android_logger::Config::default().with_max_level(log_level));
        return;
    };

    let guard = sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            enable_logs: true,
            ..Default::default()
        },
    ));
    // The client lives for the whole process
    std::mem::forget(guard);

    // Wrap the Android logger with Sentry's logger
    let logger = SentryLogger::with_dest(android_logger::AndroidLogger::default()).filter(|md| {
        match md.level() {
            // A failed engine start is fatal, report it as an event
            log::Level::Error => LogFilter::Event,
            // Ignore trace level records, as they're too verbose
            log::Level::Trace => LogFilter::Ignore,
            _ => LogFilter::Log,
        }
    });
    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        log::set_max_level(log_level);
    } else {
        android_logger::init_once(android_logger::Config::default().with_max_level(log_level));
    }
}

fn build_bridge(config: &StartupConfig) -> Result<Bridge, LooperError> {
    // Java's UI thread cannot pump a Rust queue, so the engine gets a main looper of its own
    let looper = Looper::spawn_main(&config.engine.looper_name)?;
    let engine_config = config.engine.clone();
    let gate = StartupGate::new(move || NativeEngine::start(&engine_config));
    if let Err(err) = gate.bind_affinity(Arc::new(looper.handle.clone())) {
        log::error!("Failed to bind engine looper: {}", err);
    }
    Ok(Bridge {
        gate,
        _looper: looper,
    })
}

fn throw(env: &mut JNIEnv, message: &str) {
    if let Err(err) = env.throw_new("java/lang/IllegalStateException", message) {
        log::error!("Failed to throw `{}`: {}", message, err);
    }
}

const fn to_jboolean(value: bool) -> jboolean {
    if value {
        JNI_TRUE
    } else {
        JNI_FALSE
    }
}

/// `static native boolean nativeInit(String configPath)`; idempotent.
#[no_mangle]
pub extern "system" fn Java_app_webviewstartup_EngineBridge_nativeInit<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    config_path: JString<'local>,
) -> jboolean {
    let _init = INIT.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if BRIDGE.get().is_some() {
        return JNI_TRUE;
    }

    let config_path: String = match env.get_string(&config_path) {
        Ok(path) => path.into(),
        Err(err) => {
            throw(&mut env, &format!("Invalid config path: {err}"));
            return JNI_FALSE;
        }
    };
    let config = config::parse_config(Path::new(&config_path));
    init_logging(&config);
    log::info!("webview-startup {} using {}", config::VERSION, config_path);

    match build_bridge(&config) {
        Ok(bridge) => to_jboolean(BRIDGE.set(bridge).is_ok()),
        Err(err) => {
            throw(&mut env, &format!("Failed to start engine looper: {err}"));
            JNI_FALSE
        }
    }
}

/// `static native boolean nativeEnsureStarted(boolean onMainThread)`; blocks until the
/// engine runs and throws if it never will.
#[no_mangle]
pub extern "system" fn Java_app_webviewstartup_EngineBridge_nativeEnsureStarted<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    on_main_thread: jboolean,
) -> jboolean {
    let Some(bridge) = BRIDGE.get() else {
        throw(&mut env, "nativeInit must be called before nativeEnsureStarted");
        return JNI_FALSE;
    };

    match bridge.gate.ensure_started(on_main_thread == JNI_TRUE) {
        Ok(engine) => {
            log::debug!("Engine {} ready", engine.path());
            JNI_TRUE
        }
        Err(err) => {
            throw(&mut env, &err.to_string());
            JNI_FALSE
        }
    }
}

#[no_mangle]
pub extern "system" fn Java_app_webviewstartup_EngineBridge_nativeHasStarted<'local>(
    _env: JNIEnv<'local>,
    _class: JClass<'local>,
) -> jboolean {
    to_jboolean(BRIDGE.get().is_some_and(|bridge| bridge.gate.has_started()))
}
