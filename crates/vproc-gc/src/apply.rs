//! The vproc execution loop.
//!
//! Mutator code runs until it needs the runtime, then returns a
//! [`RequestCode`]. The loop services the request (collecting, delivering a
//! preemption signal, sleeping or shutting down) and decides what to run
//! next.

use std::time::Duration;

use crate::error::{die, RuntimeError};
use crate::gc::major::MajorCollector;
use crate::gc::minor::minor_gc;
use crate::heap::Field;
use crate::tracing::internal as trace;
use crate::value::{CodeAddr, Value};
use crate::vproc::VProc;

/// Why mutator code returned to the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RequestCode {
    /// The allocation limit was reached or a signal is pending.
    Gc = 0,
    /// The outermost function returned.
    Return = 1,
    /// An exception escaped to the top.
    UncaughtException = 2,
    /// The vproc has nothing to do.
    Sleep = 3,
}

impl TryFrom<u32> for RequestCode {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, u32> {
        match raw {
            0 => Ok(Self::Gc),
            1 => Ok(Self::Return),
            2 => Ok(Self::UncaughtException),
            3 => Ok(Self::Sleep),
            other => Err(other),
        }
    }
}

impl RequestCode {
    /// Decodes a request code produced by generated code; unknown codes are fatal.
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        Self::try_from(raw).unwrap_or_else(|code| die(&format!("unknown request code {code}")))
    }
}

/// What to run next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Code to jump to.
    pub code: CodeAddr,
    /// Standard argument.
    pub arg: Value,
    /// Environment pointer.
    pub env: Value,
    /// Return continuation, `UNIT` when the code must not return.
    pub ret_cont: Value,
    /// Exception continuation, `UNIT` when none.
    pub exn_cont: Value,
}

/// Addresses of the runtime entry stubs generated code is linked with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutatorStubs {
    /// Returning here produces [`RequestCode::Return`].
    pub ret: CodeAddr,
    /// Raising to here produces [`RequestCode::UncaughtException`].
    pub uncaught_exn: CodeAddr,
    /// Resumes a preempted computation from a resume continuation.
    pub resume: CodeAddr,
}

/// The code a vproc runs.
pub trait Mutator {
    /// The runtime stubs this mutator was linked against.
    fn stubs(&self) -> MutatorStubs;

    /// Runs `frame` until it needs the runtime. Before returning the code
    /// saves what it needs to resume in `std_cont` and `std_env_ptr`.
    fn apply(&mut self, vp: &mut VProc, frame: Frame) -> RequestCode;
}

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The shutdown continuation ran and returned.
    ShutdownComplete,
    /// The runtime shut down and this vproc had no shutdown continuation.
    NoShutdownContinuation,
}

impl VProc {
    /// Resolves a continuation object to the frame that resumes it: field 0
    /// is the code address and the object itself is the environment.
    fn cont_frame(&self, k: Value, arg: Value) -> Result<Frame, RuntimeError> {
        let code = self
            .heap()
            .load(k, 0)
            .ok_or(RuntimeError::Protocol("continuation is not a local object"))?;
        Ok(Frame {
            code: CodeAddr(code.raw()),
            arg,
            env: k,
            ret_cont: Value::UNIT,
            exn_cont: Value::UNIT,
        })
    }

    /// Runs mutator code starting at `code` until the runtime shuts down.
    ///
    /// An uncaught exception is returned as an error; the thread entry in
    /// [`crate::Runtime::spawn_vproc`] turns it into process termination.
    pub fn run<M, G>(
        &mut self,
        mutator: &mut M,
        major: &mut G,
        code: CodeAddr,
        arg: Value,
        env: Value,
    ) -> Result<LoopExit, RuntimeError>
    where
        M: Mutator + ?Sized,
        G: MajorCollector + ?Sized,
    {
        let stubs = mutator.stubs();
        let ret_cont = self.alloc_mixed_or_die(&[Field::Word(stubs.ret.0)]);
        let exn_cont = self.alloc_mixed_or_die(&[Field::Word(stubs.uncaught_exn.0)]);
        let mut frame = Frame {
            code,
            arg,
            env,
            ret_cont,
            exn_cont,
        };

        loop {
            if self.runtime().shutdown_requested() && !self.shutdown_pending {
                if self.regs.shutdown_cont == Value::NIL {
                    trace::log_stop(self.id(), "shutdown");
                    return Ok(LoopExit::NoShutdownContinuation);
                }
                // Scheduled once; its return ends the loop.
                frame = self.cont_frame(self.regs.shutdown_cont, Value::UNIT)?;
                self.atomic = true;
                self.sig_pending = false;
                self.shutdown_pending = true;
            }

            trace::log_run(self.id());
            let req = mutator.apply(self, frame);
            trace::log_stop(self.id(), "request");
            let old_limit = self.restore_limit();

            frame = match req {
                RequestCode::Gc => self.handle_gc(major, old_limit, &stubs)?,
                RequestCode::Return => {
                    if self.shutdown_pending {
                        return Ok(LoopExit::ShutdownComplete);
                    }
                    self.runtime().broadcast_shutdown();
                    if self.regs.shutdown_cont == Value::NIL {
                        trace::log_stop(self.id(), "shutdown");
                        return Ok(LoopExit::NoShutdownContinuation);
                    }
                    // The loop head diverts to the shutdown continuation.
                    frame
                }
                RequestCode::UncaughtException => {
                    return Err(RuntimeError::UncaughtException { vproc: self.id() });
                }
                RequestCode::Sleep => self.handle_sleep()?,
            };
        }
    }

    fn handle_gc<G: MajorCollector + ?Sized>(
        &mut self,
        major: &mut G,
        old_limit: usize,
        stubs: &MutatorStubs,
    ) -> Result<Frame, RuntimeError> {
        if self.heap().alloc_ptr() > self.heap().limit() || self.global_gc_pending() {
            minor_gc(self, major);
        }
        if old_limit == 0 {
            self.sig_pending = true;
        }
        if self.sig_pending && !self.atomic {
            let resume_k = self.alloc_mixed_or_die(&[
                Field::Word(stubs.resume.0),
                Field::Word(self.regs.std_cont.raw()),
                Field::Ptr(self.regs.std_env_ptr),
            ]);
            let frame = self.cont_frame(self.regs.sched_cont, resume_k)?;
            self.atomic = true;
            self.sig_pending = false;
            self.stats_mut().record_preemption();
            trace::log_preempt_signal(self.id());
            Ok(frame)
        } else {
            let frame = Frame {
                code: CodeAddr(self.regs.std_cont.raw()),
                arg: Value::UNIT,
                env: self.regs.std_env_ptr,
                ret_cont: Value::UNIT,
                exn_cont: Value::UNIT,
            };
            self.regs.std_arg = Value::UNIT;
            self.regs.std_exn_cont = Value::UNIT;
            Ok(frame)
        }
    }

    fn handle_sleep(&mut self) -> Result<Frame, RuntimeError> {
        let nanos = self
            .heap()
            .load(self.regs.std_arg, 0)
            .ok_or(RuntimeError::Protocol("sleep argument is not a local object"))?
            .raw();
        if self.regs.wakeup_cont == Value::NIL {
            return Err(RuntimeError::Protocol("sleep without a wakeup continuation"));
        }
        let timeout = (nanos != 0).then(|| Duration::from_nanos(nanos));
        let woken = self.sleep(timeout);
        self.stats_mut().sleeps += 1;

        let status = self.alloc_mixed_or_die(&[Field::Ptr(Value::from_bool(woken))]);
        let frame = self.cont_frame(self.regs.wakeup_cont, status)?;
        self.regs.wakeup_cont = Value::NIL;
        Ok(frame)
    }
}
