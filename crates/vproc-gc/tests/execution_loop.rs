//! Integration tests for the vproc execution loop.
//!
//! A scripted mutator stands in for generated code: each call to `apply`
//! runs the next step of the script and returns its request code.

use vproc_gc::{
    CodeAddr, Field, Frame, HeapConfig, InPlaceMajorCollector, LoopExit, Mutator, MutatorStubs,
    RequestCode, Runtime, RuntimeConfig, RuntimeError, VProc, Value,
};

const STUBS: MutatorStubs = MutatorStubs {
    ret: CodeAddr(0x1000),
    uncaught_exn: CodeAddr(0x2000),
    resume: CodeAddr(0x3000),
};

const ENTRY: CodeAddr = CodeAddr(0x4000);
const RESUME_CODE: u64 = 0x5000;

struct Script<F> {
    step: usize,
    frames: Vec<Frame>,
    body: F,
}

impl<F> Script<F>
where
    F: FnMut(usize, &mut VProc, Frame) -> RequestCode,
{
    fn new(body: F) -> Self {
        Self {
            step: 0,
            frames: Vec::new(),
            body,
        }
    }
}

impl<F> Mutator for Script<F>
where
    F: FnMut(usize, &mut VProc, Frame) -> RequestCode,
{
    fn stubs(&self) -> MutatorStubs {
        STUBS
    }

    fn apply(&mut self, vp: &mut VProc, frame: Frame) -> RequestCode {
        let step = self.step;
        self.step += 1;
        self.frames.push(frame);
        (self.body)(step, vp, frame)
    }
}

fn setup() -> (Runtime, VProc) {
    let mut rt = Runtime::new(RuntimeConfig {
        heap: HeapConfig::with_heap_size_log2(20),
        ..RuntimeConfig::default()
    })
    .unwrap();
    let vp = rt.take_vproc(0).unwrap();
    (rt, vp)
}

/// A continuation object whose code is `code`.
fn cont(vp: &mut VProc, code: u64) -> Value {
    vp.heap_mut().alloc_mixed(&[Field::Word(code)]).unwrap()
}

fn run<F>(vp: &mut VProc, script: &mut Script<F>) -> Result<LoopExit, RuntimeError>
where
    F: FnMut(usize, &mut VProc, Frame) -> RequestCode,
{
    vp.run(
        script,
        &mut InPlaceMajorCollector::new(),
        ENTRY,
        Value::from_int(1),
        Value::NIL,
    )
}

#[test]
fn test_entry_frame_carries_runtime_continuations() {
    let (_rt, mut vp) = setup();
    let mut script = Script::new(|_, _: &mut VProc, _| RequestCode::Return);
    let exit = run(&mut vp, &mut script).unwrap();
    assert_eq!(exit, LoopExit::NoShutdownContinuation);

    let first = script.frames[0];
    assert_eq!(first.code, ENTRY);
    assert_eq!(first.arg, Value::from_int(1));
    assert_eq!(first.env, Value::NIL);
    assert_eq!(vp.heap().load(first.ret_cont, 0).unwrap().raw(), STUBS.ret.0);
    assert_eq!(
        vp.heap().load(first.exn_cont, 0).unwrap().raw(),
        STUBS.uncaught_exn.0
    );
}

#[test]
fn test_gc_request_without_pressure_skips_collection() {
    let (_rt, mut vp) = setup();
    let env = vp.heap_mut().alloc_raw(b"env").unwrap();
    let mut script = Script::new(move |step, vp: &mut VProc, _| match step {
        0 => {
            vp.regs.std_cont = Value::from_raw(RESUME_CODE);
            vp.regs.std_env_ptr = env;
            RequestCode::Gc
        }
        _ => RequestCode::Return,
    });
    run(&mut vp, &mut script).unwrap();

    assert_eq!(vp.stats().minor_collections, 0);
    let resumed = script.frames[1];
    assert_eq!(resumed.code, CodeAddr(RESUME_CODE));
    assert_eq!(resumed.env, env);
    assert_eq!(resumed.arg, Value::UNIT);
}

#[test]
fn test_exhausted_nursery_is_collected() {
    let (_rt, mut vp) = setup();
    let mut script = Script::new(|step, vp: &mut VProc, _| match step {
        0 => {
            let env = vp.heap_mut().alloc_raw(b"keep me").unwrap();
            vp.regs.std_env_ptr = env;
            vp.regs.std_cont = Value::from_raw(RESUME_CODE);
            let past_limit = vp.heap().limit() + 8;
            vp.heap_mut().set_alloc_ptr(past_limit);
            assert!(vp.limit_reached());
            RequestCode::Gc
        }
        _ => RequestCode::Return,
    });
    run(&mut vp, &mut script).unwrap();

    assert_eq!(vp.stats().minor_collections, 1);
    let resumed = script.frames[1];
    assert_eq!(resumed.env, vp.regs.std_env_ptr);
    assert_eq!(vp.heap().raw_bytes(resumed.env), Some(&b"keep me"[..]));
    assert!(!vp.limit_reached());
}

#[test]
fn test_preemption_runs_scheduler_with_resume_continuation() {
    let (_rt, mut vp) = setup();
    let sched = cont(&mut vp, 0x7000);
    vp.regs.sched_cont = sched;
    let env = vp.heap_mut().alloc_raw(b"task").unwrap();
    let handle = vp.handle();

    let mut script = Script::new(move |step, vp: &mut VProc, _| match step {
        0 => {
            vp.regs.std_cont = Value::from_raw(RESUME_CODE);
            vp.regs.std_env_ptr = env;
            handle.preempt();
            assert!(vp.limit_reached());
            RequestCode::Gc
        }
        _ => RequestCode::Return,
    });
    run(&mut vp, &mut script).unwrap();

    let sched_frame = script.frames[1];
    assert_eq!(sched_frame.code, CodeAddr(0x7000));
    assert_eq!(sched_frame.env, sched);
    let resume_k = sched_frame.arg;
    let heap = vp.heap();
    assert_eq!(heap.load(resume_k, 0).unwrap().raw(), STUBS.resume.0);
    assert_eq!(heap.load(resume_k, 1).unwrap().raw(), RESUME_CODE);
    assert_eq!(heap.load(resume_k, 2), Some(env));

    assert!(vp.atomic);
    assert!(!vp.sig_pending);
    assert_eq!(vp.stats().preemptions, 1);
}

#[test]
fn test_preemption_is_deferred_while_atomic() {
    let (_rt, mut vp) = setup();
    vp.regs.sched_cont = cont(&mut vp, 0x7000);
    vp.atomic = true;

    let mut script = Script::new(|step, vp: &mut VProc, _| match step {
        0 => {
            vp.regs.std_cont = Value::from_raw(RESUME_CODE);
            vp.handle().preempt();
            RequestCode::Gc
        }
        _ => RequestCode::Return,
    });
    run(&mut vp, &mut script).unwrap();

    assert_eq!(script.frames[1].code, CodeAddr(RESUME_CODE));
    assert!(vp.sig_pending);
    assert_eq!(vp.stats().preemptions, 0);
}

#[test]
fn test_return_runs_shutdown_continuation_once() {
    let (rt, mut vp) = setup();
    let shutdown = cont(&mut vp, 0x9000);
    vp.regs.shutdown_cont = shutdown;

    let mut script = Script::new(|_, _: &mut VProc, _| RequestCode::Return);
    let exit = run(&mut vp, &mut script).unwrap();

    assert_eq!(exit, LoopExit::ShutdownComplete);
    assert!(rt.shutdown_requested());
    assert_eq!(script.frames.len(), 2);
    let frame = script.frames[1];
    assert_eq!(frame.code, CodeAddr(0x9000));
    assert_eq!(frame.env, shutdown);
    assert_eq!(frame.arg, Value::UNIT);
    assert!(vp.atomic);
}

#[test]
fn test_external_shutdown_without_continuation_exits() {
    let (rt, mut vp) = setup();
    rt.request_shutdown();

    let mut script = Script::new(|_, _: &mut VProc, _| RequestCode::Return);
    let exit = run(&mut vp, &mut script).unwrap();
    assert_eq!(exit, LoopExit::NoShutdownContinuation);
    assert!(script.frames.is_empty());
}

#[test]
fn test_sleep_times_out_and_reports_status() {
    let (_rt, mut vp) = setup();
    let wakeup = cont(&mut vp, 0xA000);

    let mut script = Script::new(move |step, vp: &mut VProc, _| match step {
        0 => {
            vp.regs.std_arg = vp.heap_mut().alloc_mixed(&[Field::Word(1_000)]).unwrap();
            vp.regs.wakeup_cont = wakeup;
            RequestCode::Sleep
        }
        _ => RequestCode::Return,
    });
    run(&mut vp, &mut script).unwrap();

    let frame = script.frames[1];
    assert_eq!(frame.code, CodeAddr(0xA000));
    assert_eq!(frame.env, wakeup);
    assert_eq!(vp.heap().load(frame.arg, 0), Some(Value::FALSE));
    assert_eq!(vp.regs.wakeup_cont, Value::NIL);
    assert_eq!(vp.stats().sleeps, 1);
}

#[test]
fn test_sleep_reports_wakeup() {
    let (_rt, mut vp) = setup();
    let wakeup = cont(&mut vp, 0xA000);
    vp.handle().wake();

    let mut script = Script::new(move |step, vp: &mut VProc, _| match step {
        0 => {
            // Zero means sleep until woken.
            vp.regs.std_arg = vp.heap_mut().alloc_mixed(&[Field::Word(0)]).unwrap();
            vp.regs.wakeup_cont = wakeup;
            RequestCode::Sleep
        }
        _ => RequestCode::Return,
    });
    run(&mut vp, &mut script).unwrap();

    assert_eq!(vp.heap().load(script.frames[1].arg, 0), Some(Value::TRUE));
}

#[test]
fn test_sleep_without_wakeup_continuation_is_an_error() {
    let (_rt, mut vp) = setup();
    let mut script = Script::new(|_, vp: &mut VProc, _| {
        vp.regs.std_arg = vp.heap_mut().alloc_mixed(&[Field::Word(10)]).unwrap();
        RequestCode::Sleep
    });
    let err = run(&mut vp, &mut script).unwrap_err();
    assert!(matches!(err, RuntimeError::Protocol(_)));
}

#[test]
fn test_uncaught_exception_is_reported() {
    let (_rt, mut vp) = setup();
    let mut script = Script::new(|_, _: &mut VProc, _| RequestCode::UncaughtException);
    let err = run(&mut vp, &mut script).unwrap_err();
    assert!(matches!(err, RuntimeError::UncaughtException { vproc: 0 }));
}

#[test]
fn test_spawned_vproc_runs_to_completion() {
    let mut rt = Runtime::new(RuntimeConfig {
        heap: HeapConfig {
            num_vprocs: 2,
            ..HeapConfig::with_heap_size_log2(20)
        },
        ..RuntimeConfig::default()
    })
    .unwrap();
    let script = Script::new(|_, _: &mut VProc, _| RequestCode::Return);
    let thread = rt
        .spawn_vproc(1, script, InPlaceMajorCollector::new(), ENTRY, Value::UNIT, Value::NIL)
        .unwrap();
    assert_eq!(thread.join().unwrap(), LoopExit::NoShutdownContinuation);
    assert!(rt.shutdown_requested());

    let again = Script::new(|_, _: &mut VProc, _| RequestCode::Return);
    let respawn = rt.spawn_vproc(
        1,
        again,
        InPlaceMajorCollector::new(),
        ENTRY,
        Value::UNIT,
        Value::NIL,
    );
    assert!(respawn.is_none());
}

