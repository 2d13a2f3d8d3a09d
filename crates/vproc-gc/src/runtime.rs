//! Runtime construction and cross-vproc coordination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::apply::{LoopExit, Mutator};
use crate::chunk::{ChunkDirectory, ChunkStatus};
use crate::error::{die, ConfigError, RuntimeError};
use crate::gc::major::MajorCollector;
use crate::heap::{HeapConfig, VProcHeap};
use crate::value::{CodeAddr, Value};
use crate::vproc::{VProc, VProcHandle, VProcShared};

/// Runtime-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Heap sizing and vproc count.
    pub heap: HeapConfig,
    /// Preempt every vproc this often. `None` disables the timer.
    pub preemption_quantum: Option<Duration>,
}

/// State every vproc can reach.
#[derive(Debug)]
pub(crate) struct RuntimeShared {
    pub(crate) chunks: ChunkDirectory,
    shutdown: AtomicBool,
    vprocs: Mutex<Vec<VProcHandle>>,
}

impl RuntimeShared {
    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Sets the shutdown flag and forces every vproc to a safe point.
    pub(crate) fn broadcast_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for vp in self.vprocs.lock().iter() {
            vp.wake();
            vp.preempt();
        }
    }

    fn handles(&self) -> Vec<VProcHandle> {
        self.vprocs.lock().clone()
    }
}

/// Owns the chunk directory and every vproc until they are handed to
/// worker threads.
#[derive(Debug)]
pub struct Runtime {
    shared: Arc<RuntimeShared>,
    vprocs: Vec<Option<VProc>>,
    handles: Vec<VProcHandle>,
    timer: Option<PreemptionTimer>,
}

impl Runtime {
    /// Validates `config`, reserves one aligned heap per vproc and registers
    /// each heap in the chunk directory.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.heap.validate()?;
        let shared = Arc::new(RuntimeShared {
            chunks: ChunkDirectory::new(),
            shutdown: AtomicBool::new(false),
            vprocs: Mutex::new(Vec::with_capacity(config.heap.num_vprocs)),
        });

        let mut vprocs = Vec::with_capacity(config.heap.num_vprocs);
        let mut handles = Vec::with_capacity(config.heap.num_vprocs);
        for id in 0..config.heap.num_vprocs {
            let heap = VProcHeap::new(&config.heap)?;
            let owner = u32::try_from(id).map_err(|_| ConfigError::VProcCount(id))?;
            shared
                .chunks
                .register(heap.base(), heap.size(), ChunkStatus::VProc(owner));
            let vp_shared = Arc::new(VProcShared::new(id, heap.limit()));
            let vp = VProc::new(id, heap, vp_shared, Arc::clone(&shared));
            handles.push(vp.handle());
            vprocs.push(Some(vp));
        }
        shared.vprocs.lock().clone_from(&handles);

        let timer = config
            .preemption_quantum
            .map(|quantum| PreemptionTimer::start(Arc::clone(&shared), quantum));

        Ok(Self {
            shared,
            vprocs,
            handles,
            timer,
        })
    }

    /// Number of vprocs.
    #[must_use]
    pub fn num_vprocs(&self) -> usize {
        self.handles.len()
    }

    /// The chunk directory shared by all vprocs.
    #[must_use]
    pub fn chunks(&self) -> &ChunkDirectory {
        &self.shared.chunks
    }

    /// Handle to vproc `id`.
    #[must_use]
    pub fn handle(&self, id: usize) -> Option<VProcHandle> {
        self.handles.get(id).cloned()
    }

    /// Handles to every vproc.
    #[must_use]
    pub fn handles(&self) -> &[VProcHandle] {
        &self.handles
    }

    /// Vproc `id`, if it has not been taken or spawned yet.
    pub fn vproc_mut(&mut self, id: usize) -> Option<&mut VProc> {
        self.vprocs.get_mut(id)?.as_mut()
    }

    /// Removes vproc `id` so the caller can drive it directly.
    pub fn take_vproc(&mut self, id: usize) -> Option<VProc> {
        self.vprocs.get_mut(id)?.take()
    }

    /// `true` once some vproc has begun shutdown.
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.shared.shutdown_requested()
    }

    /// Begins an orderly shutdown from outside any vproc.
    pub fn request_shutdown(&self) {
        self.shared.broadcast_shutdown();
    }

    /// Makes every vproc's next minor collection escalate.
    pub fn request_global_gc(&self) {
        for h in &self.handles {
            h.request_global_gc();
        }
    }

    /// Runs vproc `id` on its own thread, starting at `code` with `arg` and
    /// `env`. An error leaving the execution loop terminates the process.
    pub fn spawn_vproc<M, G>(
        &mut self,
        id: usize,
        mut mutator: M,
        mut major: G,
        code: CodeAddr,
        arg: Value,
        env: Value,
    ) -> Option<JoinHandle<LoopExit>>
    where
        M: Mutator + Send + 'static,
        G: MajorCollector + Send + 'static,
    {
        let mut vp = self.take_vproc(id)?;
        let handle = thread::Builder::new()
            .name(format!("vproc-{id}"))
            .spawn(move || match vp.run(&mut mutator, &mut major, code, arg, env) {
                Ok(exit) => exit,
                Err(err) => die(&err.to_string()),
            });
        match handle {
            Ok(handle) => Some(handle),
            Err(err) => die(&format!("failed to spawn vproc {id}: {err}")),
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop();
        }
    }
}

/// Periodically preempts every vproc.
#[derive(Debug)]
struct PreemptionTimer {
    stop: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl PreemptionTimer {
    fn start(shared: Arc<RuntimeShared>, quantum: Duration) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("vproc-preempt".into())
            .spawn(move || {
                let (lock, cv) = &*thread_stop;
                let mut stopped = lock.lock();
                while !*stopped && !shared.shutdown_requested() {
                    if cv.wait_for(&mut stopped, quantum).timed_out() {
                        for vp in shared.handles() {
                            vp.preempt();
                        }
                    }
                }
            })
            .ok();
        Self { stop, thread }
    }

    fn stop(mut self) {
        let (lock, cv) = &*self.stop;
        *lock.lock() = true;
        cv.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
