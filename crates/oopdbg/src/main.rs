use std::process::ExitCode;

use clap::{Parser, Subcommand};
use oopdbg_core::config::{parse_u64, EngineConfig};
use oopdbg_core::engine::{notification_channel, ExecutionEngine};
use oopdbg_core::events::DebugEvent;
use oopdbg_core::platform;
use oopdbg_core::process::{Debuggee, DispatchOutcome};
use oopdbg_core::types::{Address, ProcessId};
use oopdbg_core::{DebuggerError, Result as DebuggerResult};
use oopdbg_utils::{debug, info, init_logging_with, warn, LogConfig, LogLevel};

/// Out-of-process debugger: attach, plant breakpoints, trace debug events.
#[derive(Parser, Debug)]
#[command(name = "oopdbg")]
#[command(version)]
#[command(about = "Out-of-process debugger: attach, plant breakpoints, trace debug events", long_about = None)]
struct Cli
{
    /// Log level (overrides RUST_LOG)
    #[arg(long, global = true, value_parser = parse_log_level)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Attach to a running process and print every debug event until it exits
    Trace
    {
        /// Process ID (PID) to attach to
        pid: u32,
        /// Breakpoint address, planted at the first halt (hex 0x4000 or decimal)
        #[arg(short, long = "break", value_parser = parse_address)]
        breakpoints: Vec<Address>,
        /// Rewind the instruction pointer onto the trap after a breakpoint hit
        #[arg(long, default_value_t = false)]
        compat: bool,
        /// Detach after this many debug events
        #[arg(long)]
        max_events: Option<usize>,
    },
}

fn parse_address(value: &str) -> Result<Address, String>
{
    parse_u64(value)
        .map(Address::new)
        .ok_or_else(|| format!("invalid address: {value}"))
}

fn parse_log_level(value: &str) -> Result<LogLevel, String>
{
    value.parse()
}

fn main() -> ExitCode
{
    let cli = Cli::parse();

    let log_config = match LogConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    };
    let log_config = match cli.log_level {
        Some(level) => log_config.with_level(level),
        None => log_config,
    };
    let _guard = match init_logging_with(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_command(cli: Cli) -> DebuggerResult<()>
{
    match cli.command {
        Commands::Trace {
            pid,
            breakpoints,
            compat,
            max_events,
        } => trace(ProcessId(pid), &breakpoints, compat, max_events),
    }
}

fn trace(pid: ProcessId, breakpoints: &[Address], compat: bool, max_events: Option<usize>) -> DebuggerResult<()>
{
    info!("Attaching to process {pid}");
    let attached = platform::attach(pid)?;
    println!("Attached to process {pid}");

    let mut config = EngineConfig::from_env();
    config.process.compatibility_mode |= compat;
    let (sender, receiver) = notification_channel();
    let mut engine = ExecutionEngine::new(attached.api, config).with_notifications(sender);
    let mut events = attached.events;

    let mut planted = false;
    let mut dispatched = 0usize;
    while max_events.map_or(true, |max| dispatched < max) {
        let Some((event, outcome)) = engine.wait_and_dispatch(events.as_mut())? else {
            continue;
        };
        dispatched += 1;
        println!("{}", event.describe());
        for notification in receiver.try_iter() {
            debug!("{}", notification.describe());
        }

        if outcome != DispatchOutcome::Halted {
            if engine.process(pid).is_none() {
                println!("Process {pid} is gone after {dispatched} events");
                return Ok(());
            }
            continue;
        }
        let Some(process) = engine.process(pid) else {
            continue;
        };

        if !planted {
            for &address in breakpoints {
                match process.set_breakpoint(address) {
                    Ok(()) => info!("Breakpoint set at {address}"),
                    Err(e) => warn!("Cannot set breakpoint at {address}: {e}"),
                }
            }
            planted = true;
        }

        resume(process.as_ref(), &event)?;
    }

    let Some(process) = engine.process(pid) else {
        return Ok(());
    };
    for breakpoint in process.get_breakpoints() {
        println!("  {} hit {} time(s)", breakpoint.address(), breakpoint.hit_count());
    }
    if !process.is_halted() {
        // ptrace can only let go of a stopped tracee.
        process.break_execution()?;
        engine.run_until_halt(events.as_mut(), 50)?;
    }
    engine.detach_all()?;
    println!("Detached from process {pid} after {dispatched} events");
    Ok(())
}

/// Let the debuggee go on after a halt, handing its own signals back to it.
fn resume(process: &dyn Debuggee, event: &DebugEvent) -> DebuggerResult<()>
{
    match event.exception_code() {
        Some(code) if !code.is_breakpoint() && !code.is_single_step() => process.continue_and_pass_exception(),
        _ => match process.continue_execution() {
            Err(DebuggerError::NotHalted(_)) => Ok(()),
            other => other,
        },
    }
}
