//! Module supervisor: ordered init/start/shutdown/stop/finalize with
//! bounded grace periods, plus the global state gate threads wait on
//! before their first productive work.
//!
//! Shutdown is a message on a per-module channel, not a polled global;
//! the `stop` flag exists for the unconditional cancel that follows a
//! missed deadline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded};
use log::{error, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::error::{DpError, DpResult};

/// How hard to push a module out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownLevel {
    /// 100 ms.
    RightNow,
    /// 1.5 s.
    Gracefully,
}

impl ShutdownLevel {
    pub fn deadline(self) -> Duration {
        match self {
            ShutdownLevel::RightNow => Duration::from_millis(100),
            ShutdownLevel::Gracefully => Duration::from_millis(1500),
        }
    }
}

/// Process-wide lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GlobalState {
    Initializing,
    Initialized,
    Starting,
    Started,
    RequestShutdown,
    ShuttingDown,
    Shutdown,
    Finalized,
}

/// The gate module threads block on until startup completes.
pub struct StateGate {
    state: Mutex<GlobalState>,
    cond: Condvar,
}

impl StateGate {
    pub fn new() -> Arc<StateGate> {
        Arc::new(StateGate {
            state: Mutex::new(GlobalState::Initializing),
            cond: Condvar::new(),
        })
    }

    pub fn get(&self) -> GlobalState {
        *self.state.lock()
    }

    /// Advance the state. Going backwards is an invalid transition.
    pub fn set(&self, next: GlobalState) -> DpResult<()> {
        let mut state = self.state.lock();
        if next < *state {
            return Err(DpError::InvalidStateTransition {
                from: format!("{:?}", *state),
                to: format!("{next:?}"),
            });
        }
        *state = next;
        self.cond.notify_all();
        Ok(())
    }

    /// Block until the process is started. Returns `StopRequested` when a
    /// shutdown overtakes the startup instead.
    pub fn wait_started(&self) -> DpResult<()> {
        let mut state = self.state.lock();
        loop {
            if *state >= GlobalState::RequestShutdown {
                return Err(DpError::StopRequested);
            }
            if *state >= GlobalState::Started {
                return Ok(());
            }
            self.cond.wait(&mut state);
        }
    }
}

/// Control handles given to a supervised module thread.
pub struct ThreadCtl {
    pub gate: Arc<StateGate>,
    shutdown_rx: Receiver<ShutdownLevel>,
    stop: Arc<AtomicBool>,
}

impl ThreadCtl {
    /// Non-blocking: has a shutdown been requested or the thread been
    /// cancelled? Loops call this at every safe point.
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed) || !self.shutdown_rx.is_empty()
    }

    /// Block up to `timeout` for a shutdown message; the timer thread's
    /// sleep primitive.
    pub fn wait_shutdown(&self, timeout: Duration) -> bool {
        if self.stop.load(Ordering::Relaxed) {
            return true;
        }
        self.shutdown_rx.recv_timeout(timeout).is_ok()
    }
}

/// A thread the supervisor owns: join handle plus the shutdown channel and
/// cancel flag.
pub struct SpawnedThread {
    name: String,
    handle: Option<JoinHandle<DpResult<()>>>,
    shutdown_tx: Sender<ShutdownLevel>,
    stop: Arc<AtomicBool>,
}

/// Spawn a named module thread wired for supervised shutdown.
pub fn spawn_module_thread(
    name: &str,
    gate: Arc<StateGate>,
    body: impl FnOnce(ThreadCtl) -> DpResult<()> + Send + 'static,
) -> DpResult<SpawnedThread> {
    let (shutdown_tx, shutdown_rx) = bounded(1);
    let stop = Arc::new(AtomicBool::new(false));
    let ctl = ThreadCtl {
        gate,
        shutdown_rx,
        stop: stop.clone(),
    };
    let thread_name = name.to_string();
    let handle = std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let result = body(ctl);
            match &result {
                Ok(()) | Err(DpError::StopRequested) => {
                    info!("thread {thread_name}: exited");
                }
                Err(e) => error!("thread {thread_name}: exited with {e}"),
            }
            result
        })
        .map_err(|_| DpError::NoMemory)?;
    Ok(SpawnedThread {
        name: name.to_string(),
        handle: Some(handle),
        shutdown_tx,
        stop,
    })
}

impl SpawnedThread {
    /// Request shutdown and wait for the thread within the grace deadline.
    pub fn shutdown(&mut self, level: ShutdownLevel) -> DpResult<()> {
        let _ = self.shutdown_tx.try_send(level);
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        match join_with_deadline(handle, level.deadline()) {
            Ok(result) => result,
            Err(handle) => {
                warn!(
                    "thread {}: missed the {:?} shutdown deadline, cancelling",
                    self.name, level
                );
                self.stop.store(true, Ordering::Relaxed);
                self.handle = Some(handle);
                Err(DpError::TimedOut)
            }
        }
    }

    /// Unconditional cancel; the thread sees the flag at its next safe
    /// point.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Reap the thread if it has died; used by finalize.
    pub fn reap(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
            // A still-running cancelled thread is detached; it holds no
            // module state by this point.
        }
    }
}

/// Join with a deadline; hands the handle back on timeout.
pub fn join_with_deadline(
    handle: JoinHandle<DpResult<()>>,
    deadline: Duration,
) -> Result<DpResult<()>, JoinHandle<DpResult<()>>> {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if handle.is_finished() {
            return Ok(handle.join().unwrap_or(Err(DpError::NotOperational)));
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    if handle.is_finished() {
        return Ok(handle.join().unwrap_or(Err(DpError::NotOperational)));
    }
    Err(handle)
}

/// One module's lifecycle callbacks. `init` may hand back a thread for the
/// supervisor to manage; synchronous modules return `None`.
pub trait DpModule: Send {
    fn init(&mut self, gate: &Arc<StateGate>) -> DpResult<Option<SpawnedThread>>;

    fn start(&mut self) -> DpResult<()> {
        Ok(())
    }

    /// Module-specific teardown beyond the supervised thread.
    fn shutdown(&mut self, level: ShutdownLevel) -> DpResult<()> {
        let _ = level;
        Ok(())
    }

    fn stop(&mut self) -> DpResult<()> {
        Ok(())
    }

    fn finalize(&mut self) {}

    fn usage(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        let _ = out;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModuleState {
    Registered,
    Initialized,
    Started,
    ShutDown,
    Finalized,
}

struct ModuleRecord {
    name: String,
    module: Box<dyn DpModule>,
    thread: Option<SpawnedThread>,
    /// Per-module transition lock; transitions are serialized even when
    /// the registry is driven from more than one thread.
    state: Mutex<ModuleState>,
}

/// The ordered module registry. Startup runs in registration order,
/// shutdown/stop/finalize in reverse.
pub struct ModuleRegistry {
    modules: Vec<ModuleRecord>,
    gate: Arc<StateGate>,
}

impl ModuleRegistry {
    pub fn new() -> ModuleRegistry {
        ModuleRegistry {
            modules: Vec::new(),
            gate: StateGate::new(),
        }
    }

    pub fn gate(&self) -> Arc<StateGate> {
        self.gate.clone()
    }

    pub fn register(&mut self, name: &str, module: Box<dyn DpModule>) -> DpResult<()> {
        if self.modules.iter().any(|m| m.name == name) {
            return Err(DpError::AlreadyExists);
        }
        self.modules.push(ModuleRecord {
            name: name.to_string(),
            module,
            thread: None,
            state: Mutex::new(ModuleState::Registered),
        });
        Ok(())
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.name.clone()).collect()
    }

    /// Initialize every module in order. Init failures are fatal to the
    /// caller: the first error aborts the walk.
    pub fn init_all(&mut self) -> DpResult<()> {
        for record in &mut self.modules {
            let mut state = record.state.lock();
            if *state != ModuleState::Registered {
                return Err(DpError::InvalidStateTransition {
                    from: format!("{:?}", *state),
                    to: "Initialized".into(),
                });
            }
            record.thread = record.module.init(&self.gate)?;
            *state = ModuleState::Initialized;
            info!("module {}: initialized", record.name);
        }
        self.gate.set(GlobalState::Initialized)?;
        Ok(())
    }

    /// Start every module in order, then open the global gate. Starting an
    /// already-started module succeeds silently.
    pub fn start_all(&mut self) -> DpResult<()> {
        if self.gate.get() < GlobalState::Starting {
            self.gate.set(GlobalState::Starting)?;
        }
        for record in &mut self.modules {
            let mut state = record.state.lock();
            match *state {
                ModuleState::Started => continue,
                ModuleState::Initialized => {
                    record.module.start()?;
                    *state = ModuleState::Started;
                    info!("module {}: started", record.name);
                }
                other => {
                    return Err(DpError::InvalidStateTransition {
                        from: format!("{other:?}"),
                        to: "Started".into(),
                    });
                }
            }
        }
        if self.gate.get() < GlobalState::Started {
            self.gate.set(GlobalState::Started)?;
        }
        Ok(())
    }

    /// Shut every module down in reverse order within the grace deadline.
    /// Deadline misses cancel the offender and are reported after the walk
    /// completes.
    pub fn shutdown_all(&mut self, level: ShutdownLevel) -> DpResult<()> {
        if self.gate.get() < GlobalState::ShuttingDown {
            self.gate.set(GlobalState::RequestShutdown)?;
            self.gate.set(GlobalState::ShuttingDown)?;
        }
        let mut first_err = None;
        for record in self.modules.iter_mut().rev() {
            let mut state = record.state.lock();
            if *state != ModuleState::Started && *state != ModuleState::Initialized {
                continue;
            }
            let mut result = record.module.shutdown(level);
            if let Some(thread) = record.thread.as_mut() {
                let joined = thread.shutdown(level);
                if result.is_ok() {
                    result = joined;
                }
            }
            match result {
                Ok(()) => info!("module {}: shut down", record.name),
                Err(e) => {
                    warn!("module {}: shutdown failed: {e}", record.name);
                    first_err.get_or_insert(e);
                }
            }
            *state = ModuleState::ShutDown;
        }
        self.gate.set(GlobalState::Shutdown)?;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Unconditional cancellation, reverse order.
    pub fn stop_all(&mut self) {
        for record in self.modules.iter_mut().rev() {
            if let Some(thread) = record.thread.as_ref() {
                thread.stop();
            }
            if let Err(e) = record.module.stop() {
                warn!("module {}: stop failed: {e}", record.name);
            }
        }
    }

    /// Release resources, reverse order, exactly once per module.
    pub fn finalize_all(&mut self) {
        for record in self.modules.iter_mut().rev() {
            let mut state = record.state.lock();
            if *state == ModuleState::Finalized {
                continue;
            }
            if let Some(thread) = record.thread.as_mut() {
                thread.reap();
            }
            record.module.finalize();
            *state = ModuleState::Finalized;
            info!("module {}: finalized", record.name);
        }
        let _ = self.gate.set(GlobalState::Finalized);
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        ModuleRegistry::new()
    }
}
