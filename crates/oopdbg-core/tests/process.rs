//! Tests for debuggee process control, driven through the engine and the mock backend

use std::sync::Arc;
use std::thread;

use oopdbg_core::api::{DebugApi, ResumeAction, ThreadContext};
use oopdbg_core::breakpoints::{ARM64_BRK_INSTRUCTION, X86_INT3_INSTRUCTION};
use oopdbg_core::config::{EngineConfig, ProcessConfig};
use oopdbg_core::engine::ExecutionEngine;
use oopdbg_core::error::DebuggerError;
use oopdbg_core::events::{DebugEvent, ExceptionCode};
use oopdbg_core::mock::{ApiCall, MockDebugApi};
use oopdbg_core::process::{Debuggee, DebuggeeProcess, DispatchOutcome, KILL_EXIT_CODE};
use oopdbg_core::types::{Address, Architecture, ProcessId, ProcessState, ThreadId};

const PID: ProcessId = ProcessId(100);
const MAIN: ThreadId = ThreadId(1);
const WORKER: ThreadId = ThreadId(2);
const CODE_BASE: u64 = 0x4000;
const DATA_BASE: u64 = 0x8000;

struct Harness
{
    api: Arc<MockDebugApi>,
    engine: ExecutionEngine,
    process: Arc<DebuggeeProcess>,
}

fn code_bytes() -> Vec<u8>
{
    (0..64u8).map(|i| 0x40 + i).collect()
}

fn context_at(ip: u64) -> ThreadContext
{
    ThreadContext {
        instruction_pointer: Address::new(ip),
        stack_pointer: Address::new(0x7fff_0000),
        flags: 0x202,
    }
}

fn process_config() -> ProcessConfig
{
    ProcessConfig::default().with_architecture(Architecture::X86_64)
}

fn created() -> DebugEvent
{
    DebugEvent::ProcessCreated {
        pid: PID,
        thread: MAIN,
        image_base: Address::new(0x40_0000),
        start_address: Address::new(CODE_BASE + 0x10),
    }
}

fn exception(thread: ThreadId, code: ExceptionCode, address: u64) -> DebugEvent
{
    DebugEvent::Exception {
        pid: PID,
        thread,
        code,
        address: Address::new(address),
        first_chance: true,
    }
}

fn exited(exit_code: u32) -> DebugEvent
{
    DebugEvent::ProcessExited {
        pid: PID,
        thread: MAIN,
        exit_code,
    }
}

fn harness_with(config: ProcessConfig) -> Harness
{
    let api = Arc::new(MockDebugApi::new());
    api.map_region(Address::new(CODE_BASE), code_bytes(), true);
    api.set_context(MAIN, context_at(CODE_BASE + 0x10));

    let engine_config = EngineConfig {
        process: config,
        ..EngineConfig::default()
    };
    let mut engine = ExecutionEngine::new(api.clone(), engine_config);
    let outcome = engine.dispatch(&created()).unwrap();
    assert_eq!(outcome, DispatchOutcome::Halted);
    let process = engine.process(PID).unwrap();
    Harness { api, engine, process }
}

fn harness() -> Harness
{
    harness_with(process_config())
}

/// Halt on a breakpoint hit at `address`, with the thread's IP just past the trap.
fn hit_breakpoint(h: &mut Harness, address: u64)
{
    h.api.set_context(MAIN, context_at(address + 1));
    let outcome = h
        .engine
        .dispatch(&exception(MAIN, ExceptionCode::BREAKPOINT, address))
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Halted);
}

#[test]
fn test_process_created_event_halts_process()
{
    let h = harness();
    assert_eq!(h.process.state(), ProcessState::Halted);
    assert!(h.process.is_halted());
    assert_eq!(h.process.id(), PID);
    assert_eq!(h.process.get_thread_ids(), vec![MAIN]);
    assert_eq!(h.process.get_halted_thread().unwrap().id(), MAIN);
    assert_eq!(h.process.last_debug_event(), Some(created()));
}

#[test]
fn test_continue_resumes_and_second_continue_fails()
{
    let h = harness();
    h.process.continue_execution().unwrap();
    assert_eq!(h.process.state(), ProcessState::Running);
    assert_eq!(h.api.resumes(), vec![(MAIN, ResumeAction::Continue)]);

    let err = h.process.continue_execution().unwrap_err();
    assert!(matches!(err, DebuggerError::NotHalted(ProcessState::Running)));
    assert_eq!(h.process.state(), ProcessState::Running);
    assert_eq!(h.api.resumes().len(), 1);
    assert!(h.process.get_halted_thread().is_none());
}

#[test]
fn test_halted_only_commands_fail_while_running()
{
    let h = harness();
    h.process.continue_execution().unwrap();
    let addr = Address::new(CODE_BASE);

    assert!(matches!(h.process.single_step(), Err(DebuggerError::NotHalted(_))));
    assert!(matches!(
        h.process.continue_and_pass_exception(),
        Err(DebuggerError::NotHalted(_))
    ));
    assert!(matches!(h.process.write_memory(addr, &[0]), Err(DebuggerError::NotHalted(_))));
    assert!(matches!(h.process.set_breakpoint(addr), Err(DebuggerError::NotHalted(_))));
    assert!(matches!(h.process.remove_breakpoint(addr), Err(DebuggerError::NotHalted(_))));
    assert!(matches!(h.process.read_debug_string(), Err(DebuggerError::NotHalted(_))));

    // Reads only need a live process.
    let mut buf = [0u8; 2];
    h.process.read_memory(addr, &mut buf).unwrap();
    assert_eq!(buf, [0x40, 0x41]);
    assert_eq!(h.api.peek(addr, 1), Some(vec![0x40]));
}

#[test]
fn test_breakpoint_set_twice_then_removed()
{
    let h = harness();
    let addr = Address::new(CODE_BASE);

    h.process.set_breakpoint(addr).unwrap();
    assert_eq!(h.api.peek(addr, 1), Some(X86_INT3_INSTRUCTION.to_vec()));
    let bp = h.process.get_breakpoint(addr).unwrap();
    assert_eq!(bp.address(), addr);
    assert_eq!(bp.original_bytes(), &[0x40]);
    assert_eq!(bp.hit_count(), 0);

    assert!(matches!(
        h.process.set_breakpoint(addr),
        Err(DebuggerError::BreakpointExists(a)) if a == addr
    ));

    h.process.remove_breakpoint(addr).unwrap();
    assert!(h.process.get_breakpoint(addr).is_none());
    assert_eq!(h.api.peek(addr, 1), Some(vec![0x40]));
}

#[test]
fn test_remove_missing_breakpoint_fails()
{
    let h = harness();
    let addr = Address::new(CODE_BASE + 3);
    assert!(matches!(
        h.process.remove_breakpoint(addr),
        Err(DebuggerError::NoBreakpoint(a)) if a == addr
    ));
}

#[test]
fn test_breakpoints_listed_in_address_order()
{
    let h = harness();
    for offset in [0x20, 0x04, 0x10] {
        h.process.set_breakpoint(Address::new(CODE_BASE + offset)).unwrap();
    }
    let addresses: Vec<u64> = h
        .process
        .get_breakpoints()
        .iter()
        .map(|bp| bp.address().value())
        .collect();
    assert_eq!(addresses, vec![CODE_BASE + 0x04, CODE_BASE + 0x10, CODE_BASE + 0x20]);
}

#[test]
fn test_raw_write_round_trip_restores_original()
{
    let h = harness();
    let addr = Address::new(CODE_BASE + 8);
    let mut saved = [0u8; 1];
    h.process.read_memory_raw(addr, &mut saved).unwrap();

    h.process.write_memory(addr, &[0xCC]).unwrap();
    let mut now = [0u8; 1];
    h.process.read_memory_raw(addr, &mut now).unwrap();
    assert_eq!(now, [0xCC]);

    h.process.write_memory(addr, &saved).unwrap();
    h.process.read_memory_raw(addr, &mut now).unwrap();
    assert_eq!(now, saved);
}

#[test]
fn test_read_memory_masks_breakpoints()
{
    let h = harness();
    h.process.set_breakpoint(Address::new(CODE_BASE + 2)).unwrap();

    let mut masked = [0u8; 4];
    h.process.read_memory(Address::new(CODE_BASE), &mut masked).unwrap();
    assert_eq!(masked, [0x40, 0x41, 0x42, 0x43]);

    let mut raw = [0u8; 4];
    h.process.read_memory_raw(Address::new(CODE_BASE), &mut raw).unwrap();
    assert_eq!(raw, [0x40, 0x41, 0xCC, 0x43]);
}

#[test]
fn test_write_over_breakpoint_keeps_trap_and_updates_original()
{
    let h = harness();
    let bp = Address::new(CODE_BASE + 2);
    h.process.set_breakpoint(bp).unwrap();

    h.process.write_memory(Address::new(CODE_BASE), &[0xAA; 4]).unwrap();
    assert_eq!(h.api.peek(Address::new(CODE_BASE), 4), Some(vec![0xAA, 0xAA, 0xCC, 0xAA]));
    assert_eq!(h.process.get_breakpoint(bp).unwrap().original_bytes(), &[0xAA]);

    let mut masked = [0u8; 4];
    h.process.read_memory(Address::new(CODE_BASE), &mut masked).unwrap();
    assert_eq!(masked, [0xAA; 4]);

    h.process.remove_breakpoint(bp).unwrap();
    assert_eq!(h.api.peek(bp, 1), Some(vec![0xAA]));
}

#[test]
fn test_memory_access_failures_leave_state_unchanged()
{
    let h = harness();
    h.api.map_region(Address::new(DATA_BASE), vec![7; 16], false);

    let mut buf = [0u8; 8];
    assert!(matches!(
        h.process.read_memory(Address::new(0x1_0000), &mut buf),
        Err(DebuggerError::MemoryAccess { .. })
    ));
    // Straddles the end of the code region.
    let mut tail = [0u8; 8];
    assert!(matches!(
        h.process.read_memory(Address::new(CODE_BASE + 60), &mut tail),
        Err(DebuggerError::MemoryAccess { .. })
    ));
    assert!(matches!(
        h.process.write_memory(Address::new(DATA_BASE), &[1, 2]),
        Err(DebuggerError::MemoryAccess { .. })
    ));
    assert_eq!(h.api.peek(Address::new(DATA_BASE), 2), Some(vec![7, 7]));

    assert!(h.process.set_breakpoint(Address::new(0x1_0000)).is_err());
    assert!(h.process.get_breakpoints().is_empty());

    let mut wrap = [0u8; 4];
    assert!(matches!(
        h.process.read_memory(Address::new(u64::MAX - 1), &mut wrap),
        Err(DebuggerError::MemoryAccess { .. })
    ));
    assert!(h.process.is_halted());
}

#[test]
fn test_breakpoint_hit_counts_and_leaves_ip_without_compat_mode()
{
    let mut h = harness();
    let bp = CODE_BASE + 0x18;
    h.process.set_breakpoint(Address::new(bp)).unwrap();
    h.process.continue_execution().unwrap();

    hit_breakpoint(&mut h, bp);
    assert_eq!(h.process.get_breakpoint(Address::new(bp)).unwrap().hit_count(), 1);
    assert_eq!(h.api.context(MAIN).unwrap().instruction_pointer, Address::new(bp + 1));
}

#[test]
fn test_continue_after_hit_without_compat_mode_rewinds_and_steps_over()
{
    let mut h = harness();
    let bp = Address::new(CODE_BASE + 0x18);
    h.process.set_breakpoint(bp).unwrap();
    h.process.continue_execution().unwrap();
    hit_breakpoint(&mut h, bp.value());
    assert_eq!(h.api.context(MAIN).unwrap().instruction_pointer, bp + 1);
    h.api.take_calls();

    h.process.continue_execution().unwrap();
    assert_eq!(h.api.context(MAIN).unwrap().instruction_pointer, bp);
    assert_eq!(h.api.resumes(), vec![(MAIN, ResumeAction::SingleStep)]);
    assert_eq!(h.api.peek(bp, 1), Some(vec![0x58]));

    h.api.set_context(MAIN, context_at(bp.value() + 2));
    let outcome = h
        .engine
        .dispatch(&exception(MAIN, ExceptionCode::SINGLE_STEP, bp.value() + 2))
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Resumed);
    assert_eq!(h.api.peek(bp, 1), Some(X86_INT3_INSTRUCTION.to_vec()));
    assert_eq!(
        h.api.resumes(),
        vec![(MAIN, ResumeAction::SingleStep), (MAIN, ResumeAction::Continue)]
    );
    assert_eq!(h.process.get_breakpoint(bp).unwrap().hit_count(), 1);
}

#[test]
fn test_removed_breakpoint_still_rewinds_on_resume()
{
    let mut h = harness();
    let bp = Address::new(CODE_BASE + 0x18);
    h.process.set_breakpoint(bp).unwrap();
    h.process.continue_execution().unwrap();
    hit_breakpoint(&mut h, bp.value());

    h.process.remove_breakpoint(bp).unwrap();
    h.api.take_calls();
    h.process.single_step().unwrap();
    assert_eq!(h.api.context(MAIN).unwrap().instruction_pointer, bp);
    assert_eq!(h.api.resumes(), vec![(MAIN, ResumeAction::SingleStep)]);
    assert_eq!(h.api.peek(bp, 1), Some(vec![0x58]));
}

#[test]
fn test_compat_mode_rewinds_instruction_pointer()
{
    let mut h = harness();
    assert!(!h.process.compatibility_mode());
    h.process.enable_compatibility_mode();
    assert!(h.process.compatibility_mode());

    let bp = CODE_BASE + 0x20;
    h.process.set_breakpoint(Address::new(bp)).unwrap();
    h.process.continue_execution().unwrap();

    hit_breakpoint(&mut h, bp);
    assert_eq!(h.api.context(MAIN).unwrap().instruction_pointer, Address::new(bp));
    assert_eq!(
        h.process.get_halted_thread().unwrap().instruction_pointer().unwrap(),
        Address::new(bp)
    );
}

#[test]
fn test_compat_mode_ignores_unknown_trap_address()
{
    let mut h = harness_with(process_config().with_compatibility_mode(true));
    h.process.continue_execution().unwrap();

    // A trap the debugger did not plant: no rewind, no hit.
    hit_breakpoint(&mut h, CODE_BASE + 0x30);
    assert_eq!(h.api.context(MAIN).unwrap().instruction_pointer, Address::new(CODE_BASE + 0x31));
    assert!(h.process.get_breakpoints().is_empty());
}

#[test]
fn test_continue_steps_over_breakpoint_under_ip()
{
    let mut h = harness_with(process_config().with_compatibility_mode(true));
    let bp = Address::new(CODE_BASE + 0x20);
    h.process.set_breakpoint(bp).unwrap();
    h.process.continue_execution().unwrap();
    hit_breakpoint(&mut h, bp.value());
    h.api.take_calls();

    h.process.continue_execution().unwrap();
    assert_eq!(h.process.state(), ProcessState::Running);
    assert_eq!(h.api.resumes(), vec![(MAIN, ResumeAction::SingleStep)]);
    // Original instruction is in place while the thread steps over it.
    assert_eq!(h.api.peek(bp, 1), Some(vec![0x60]));
    let mut raw = [0u8; 1];
    h.process.read_memory_raw(bp, &mut raw).unwrap();
    assert_eq!(raw, [0x60]);

    h.api.set_context(MAIN, context_at(bp.value() + 2));
    let outcome = h
        .engine
        .dispatch(&exception(MAIN, ExceptionCode::SINGLE_STEP, bp.value() + 2))
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Resumed);
    assert_eq!(h.process.state(), ProcessState::Running);
    assert_eq!(h.api.peek(bp, 1), Some(X86_INT3_INSTRUCTION.to_vec()));
    assert_eq!(
        h.api.resumes(),
        vec![(MAIN, ResumeAction::SingleStep), (MAIN, ResumeAction::Continue)]
    );
}

#[test]
fn test_single_step_over_breakpoint_halts_after_step()
{
    let mut h = harness_with(process_config().with_compatibility_mode(true));
    let bp = Address::new(CODE_BASE + 0x20);
    h.process.set_breakpoint(bp).unwrap();
    h.process.continue_execution().unwrap();
    hit_breakpoint(&mut h, bp.value());

    h.process.single_step().unwrap();
    h.api.set_context(MAIN, context_at(bp.value() + 2));
    let step = exception(MAIN, ExceptionCode::SINGLE_STEP, bp.value() + 2);
    assert_eq!(h.engine.dispatch(&step).unwrap(), DispatchOutcome::Halted);

    assert!(h.process.is_halted());
    assert_eq!(h.process.last_debug_event(), Some(step));
    assert_eq!(h.api.peek(bp, 1), Some(X86_INT3_INSTRUCTION.to_vec()));
}

#[test]
fn test_single_step_without_breakpoint()
{
    let h = harness();
    h.process.single_step().unwrap();
    assert_eq!(h.api.resumes(), vec![(MAIN, ResumeAction::SingleStep)]);
    assert_eq!(h.process.state(), ProcessState::Running);
}

#[test]
fn test_pass_exception_forwards_last_exception_code()
{
    let mut h = harness();
    h.process.continue_execution().unwrap();
    h.engine
        .dispatch(&exception(MAIN, ExceptionCode::ACCESS_VIOLATION, 0xdead))
        .unwrap();
    h.api.take_calls();

    h.process.continue_and_pass_exception().unwrap();
    assert_eq!(
        h.api.resumes(),
        vec![(
            MAIN,
            ResumeAction::PassException {
                code: ExceptionCode::ACCESS_VIOLATION
            }
        )]
    );
    assert_eq!(h.process.state(), ProcessState::Running);
}

#[test]
fn test_pass_exception_without_exception_continues()
{
    let h = harness();
    h.process.continue_and_pass_exception().unwrap();
    assert_eq!(h.api.resumes(), vec![(MAIN, ResumeAction::Continue)]);
}

#[test]
fn test_failed_resume_keeps_process_halted()
{
    let h = harness();
    h.api.set_fail_resume(true);
    assert!(matches!(h.process.continue_execution(), Err(DebuggerError::Os(_))));
    assert!(h.process.is_halted());
}

#[test]
fn test_break_execution()
{
    let h = harness();
    assert!(matches!(h.process.break_execution(), Err(DebuggerError::AlreadyHalted)));

    h.process.continue_execution().unwrap();
    h.process.break_execution().unwrap();
    assert!(h.api.calls().contains(&ApiCall::BreakProcess));
    // The process stays running until the break event arrives.
    assert_eq!(h.process.state(), ProcessState::Running);
}

#[test]
fn test_resume_commands_rejected_off_event_loop_thread()
{
    let h = harness();
    let process = Arc::clone(&h.process);
    thread::spawn(move || {
        assert!(matches!(process.continue_execution(), Err(DebuggerError::WrongThread(_))));
        assert!(matches!(process.single_step(), Err(DebuggerError::WrongThread(_))));
        assert!(matches!(
            process.continue_and_pass_exception(),
            Err(DebuggerError::WrongThread(_))
        ));
        // Inspection and patching are allowed from any thread.
        process.set_breakpoint(Address::new(CODE_BASE)).unwrap();
        let mut buf = [0u8; 1];
        process.read_memory(Address::new(CODE_BASE), &mut buf).unwrap();
        assert_eq!(buf, [0x40]);
    })
    .join()
    .unwrap();

    assert!(h.process.is_halted());
    assert!(h.api.resumes().is_empty());
}

#[test]
fn test_break_allowed_from_other_thread()
{
    let h = harness();
    h.process.continue_execution().unwrap();
    let process = Arc::clone(&h.process);
    thread::spawn(move || process.break_execution()).join().unwrap().unwrap();
    assert!(h.api.calls().contains(&ApiCall::BreakProcess));
}

#[test]
fn test_read_debug_string()
{
    let mut h = harness();
    h.api.map_region(Address::new(DATA_BASE), b"hello\0junk".to_vec(), false);
    assert!(matches!(h.process.read_debug_string(), Err(DebuggerError::NoDebugString)));

    h.process.continue_execution().unwrap();
    h.engine
        .dispatch(&DebugEvent::OutputString {
            pid: PID,
            thread: MAIN,
            address: Address::new(DATA_BASE),
            length: 10,
        })
        .unwrap();
    assert_eq!(h.process.read_debug_string().unwrap(), "hello");
}

#[test]
fn test_read_debug_string_unmapped_fails()
{
    let mut h = harness();
    h.process.continue_execution().unwrap();
    h.engine
        .dispatch(&DebugEvent::OutputString {
            pid: PID,
            thread: MAIN,
            address: Address::new(0x9_0000),
            length: 4,
        })
        .unwrap();
    assert!(matches!(
        h.process.read_debug_string(),
        Err(DebuggerError::MemoryAccess { .. })
    ));
}

#[test]
fn test_thread_lifecycle()
{
    let mut h = harness();
    h.engine.set_nexe_layout(PID, Address::new(0x10000), Address::new(0x10080)).unwrap();
    h.process.continue_execution().unwrap();

    h.engine
        .dispatch(&DebugEvent::ThreadCreated {
            pid: PID,
            thread: WORKER,
            start_address: Address::new(0x10200),
        })
        .unwrap();
    assert_eq!(h.process.get_thread_ids(), vec![MAIN, WORKER]);
    let worker = h.process.get_thread(WORKER).unwrap();
    assert!(worker.is_nexe());
    assert_eq!(worker.start_address(), Address::new(0x10200));
    assert_eq!(worker.process_id(), PID);
    assert!(!h.process.get_thread(MAIN).unwrap().is_nexe());
    assert_eq!(h.process.get_halted_thread().unwrap().id(), WORKER);

    h.process.continue_execution().unwrap();
    assert_eq!(h.api.resumes().last(), Some(&(WORKER, ResumeAction::Continue)));

    h.engine
        .dispatch(&DebugEvent::ThreadExited {
            pid: PID,
            thread: WORKER,
            exit_code: 0,
        })
        .unwrap();
    assert_eq!(h.process.get_thread_ids(), vec![MAIN]);
    assert!(h.process.get_thread(WORKER).is_none());
    assert!(h.process.is_halted());
}

#[test]
fn test_event_from_unknown_thread_adds_record()
{
    let mut h = harness();
    h.process.continue_execution().unwrap();
    h.engine
        .dispatch(&exception(ThreadId(77), ExceptionCode::from_signal(11), 0x1234))
        .unwrap();
    assert!(h.process.get_thread(ThreadId(77)).is_some());
    assert_eq!(h.process.get_halted_thread().unwrap().id(), ThreadId(77));
}

#[test]
fn test_exit_makes_process_dead()
{
    let mut h = harness();
    h.process.set_breakpoint(Address::new(CODE_BASE)).unwrap();
    h.process.continue_execution().unwrap();

    assert_eq!(h.engine.dispatch(&exited(3)).unwrap(), DispatchOutcome::Exited);
    assert_eq!(h.process.state(), ProcessState::Dead);
    assert!(h.engine.process(PID).is_none());
    assert!(h.process.get_thread_ids().is_empty());
    assert!(h.process.get_halted_thread().is_none());
    assert_eq!(h.process.last_debug_event(), Some(exited(3)));

    let addr = Address::new(CODE_BASE);
    let mut buf = [0u8; 1];
    let dead = |r: Result<(), DebuggerError>| matches!(r, Err(DebuggerError::ProcessDead(pid)) if pid == PID);
    assert!(dead(h.process.continue_execution()));
    assert!(dead(h.process.continue_and_pass_exception()));
    assert!(dead(h.process.single_step()));
    assert!(dead(h.process.break_execution()));
    assert!(dead(h.process.kill()));
    assert!(dead(h.process.detach()));
    assert!(dead(h.process.read_memory(addr, &mut buf)));
    assert!(dead(h.process.read_memory_raw(addr, &mut buf)));
    assert!(dead(h.process.write_memory(addr, &[0])));
    assert!(dead(h.process.set_breakpoint(Address::new(CODE_BASE + 1))));
    assert!(dead(h.process.remove_breakpoint(addr)));
    assert!(matches!(h.process.read_debug_string(), Err(DebuggerError::ProcessDead(_))));
}

#[test]
fn test_kill_halted_process_resumes_it()
{
    let mut h = harness();
    h.process.kill().unwrap();
    assert_eq!(
        h.api.calls(),
        vec![
            ApiCall::Terminate {
                exit_code: KILL_EXIT_CODE
            },
            ApiCall::Resume {
                thread: MAIN,
                action: ResumeAction::Continue
            },
        ]
    );
    assert_eq!(h.process.state(), ProcessState::Running);

    h.engine.dispatch(&exited(KILL_EXIT_CODE)).unwrap();
    assert_eq!(h.process.state(), ProcessState::Dead);
}

#[test]
fn test_kill_from_other_thread_only_terminates()
{
    let h = harness();
    let process = Arc::clone(&h.process);
    thread::spawn(move || process.kill()).join().unwrap().unwrap();
    assert_eq!(
        h.api.calls(),
        vec![ApiCall::Terminate {
            exit_code: KILL_EXIT_CODE
        }]
    );
    assert!(h.process.is_halted());
}

#[test]
fn test_detach_restores_breakpoints()
{
    let h = harness();
    let first = Address::new(CODE_BASE + 4);
    let second = Address::new(CODE_BASE + 12);
    h.process.set_breakpoint(first).unwrap();
    h.process.set_breakpoint(second).unwrap();

    h.process.detach().unwrap();
    assert_eq!(h.api.peek(first, 1), Some(vec![0x44]));
    assert_eq!(h.api.peek(second, 1), Some(vec![0x4C]));
    assert!(h.api.calls().contains(&ApiCall::Detach));
    assert_eq!(h.process.state(), ProcessState::Dead);
    assert!(h.process.get_breakpoints().is_empty());
    assert!(matches!(h.process.detach(), Err(DebuggerError::ProcessDead(_))));
}

#[test]
fn test_detach_after_hit_rewinds_halted_thread()
{
    let mut h = harness();
    let bp = Address::new(CODE_BASE + 0x18);
    h.process.set_breakpoint(bp).unwrap();
    h.process.continue_execution().unwrap();
    hit_breakpoint(&mut h, bp.value());

    h.process.detach().unwrap();
    assert_eq!(h.api.context(MAIN).unwrap().instruction_pointer, bp);
    assert_eq!(h.api.peek(bp, 1), Some(vec![0x58]));
}

#[test]
fn test_failed_detach_keeps_breakpoints_armed()
{
    let h = harness();
    let bp = Address::new(CODE_BASE + 4);
    h.process.set_breakpoint(bp).unwrap();
    h.api.set_fail_detach(true);

    assert!(matches!(h.process.detach(), Err(DebuggerError::Os(_))));
    assert!(h.process.is_halted());
    assert_eq!(h.process.get_breakpoints().len(), 1);
    assert_eq!(h.api.peek(bp, 1), Some(X86_INT3_INSTRUCTION.to_vec()));

    h.api.set_fail_detach(false);
    h.process.detach().unwrap();
    assert_eq!(h.api.peek(bp, 1), Some(vec![0x44]));
    assert_eq!(h.process.state(), ProcessState::Dead);
}

#[test]
fn test_nexe_address_translation()
{
    let h = harness();
    let ptr = Address::new(0x20);
    assert_eq!(h.process.nexe_to_flat_address(ptr), ptr);

    h.engine
        .set_nexe_layout(PID, Address::new(0x10000), Address::new(0x10080))
        .unwrap();
    assert_eq!(h.process.nexe_mem_base(), Address::new(0x10000));
    assert_eq!(h.process.nexe_entry_point(), Address::new(0x10080));

    let flat = h.process.nexe_to_flat_address(ptr);
    assert_eq!(flat, Address::new(0x10020));
    assert_eq!(h.process.nexe_to_flat_address(flat), flat);

    // Beyond the sandbox range: already flat.
    let outside = Address::new(0x2_0000_0000);
    assert_eq!(h.process.nexe_to_flat_address(outside), outside);
}

#[test]
fn test_nexe_base_below_sandbox_size_overlaps_relative_range()
{
    let h = harness();
    h.engine
        .set_nexe_layout(PID, Address::new(0x10000), Address::new(0x10080))
        .unwrap();
    assert!(h.process.sandbox_size() > 0x10000);

    assert_eq!(h.process.nexe_to_flat_address(Address::new(0x8000)), Address::new(0x18000));
    // Relative pointers at or above the base look like flat sandbox addresses.
    assert_eq!(h.process.nexe_to_flat_address(Address::new(0x20000)), Address::new(0x20000));
}

#[test]
fn test_debug_api_reaches_os_primitives()
{
    let h = harness();
    let debuggee: &dyn Debuggee = h.process.as_ref();
    debuggee.debug_api().break_process(PID).unwrap();
    assert_eq!(h.api.calls(), vec![ApiCall::BreakProcess]);
}

#[test]
fn test_word_size_and_wow()
{
    let h = harness();
    assert_eq!(h.process.word_size_bits(), 64);
    assert!(!h.process.is_wow());

    let api = Arc::new(MockDebugApi::new());
    api.set_wow64(true);
    let process = DebuggeeProcess::new(ProcessId(7), api, &process_config()).unwrap();
    assert!(process.is_wow());
    assert_eq!(process.word_size_bits(), 32);
    assert_eq!(process.state(), ProcessState::Running);
}

#[test]
fn test_arm64_uses_brk_trap()
{
    let h = harness_with(ProcessConfig::default().with_architecture(Architecture::Arm64));
    let addr = Address::new(CODE_BASE + 8);
    h.process.set_breakpoint(addr).unwrap();
    assert_eq!(h.api.peek(addr, 4), Some(ARM64_BRK_INSTRUCTION.to_vec()));
    assert_eq!(h.process.get_breakpoint(addr).unwrap().original_bytes(), &[0x48, 0x49, 0x4A, 0x4B]);

    let mut masked = [0u8; 4];
    h.process.read_memory(addr, &mut masked).unwrap();
    assert_eq!(masked, [0x48, 0x49, 0x4A, 0x4B]);
}

#[test]
fn test_unknown_architecture_is_rejected()
{
    let api = Arc::new(MockDebugApi::new());
    let config = ProcessConfig::default().with_architecture(Architecture::Unknown("mips".to_string()));
    assert!(matches!(
        DebuggeeProcess::new(PID, api, &config),
        Err(DebuggerError::UnsupportedArchitecture(_))
    ));
}
