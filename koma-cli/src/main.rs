//! Koma CLI - コマンドラインインターフェース
//!
//! シミュレーションターゲットに接続した koma のREPLインターフェース

use anyhow::{anyhow, Result};
use clap::Parser;
use koma_core::{
    ClassFilter, Command, ContextId, DebugProcess, DebuggerSettings, SuspendContext, SuspendListener,
};
use koma_target::{
    Event, EventSet, Location, MethodInfo, SimulatedVm, SuspendPolicy, ThreadId, Value,
};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Koma - debugger coordination engine
#[derive(Parser)]
#[command(name = "koma")]
#[command(version = "0.1.0")]
#[command(about = "Suspend/resume coordination for a simulated multi-threaded target", long_about = None)]
struct Cli {
    /// Number of threads in the simulated target
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// Watchdog threshold for single-threaded invocations (ms)
    #[arg(long, default_value_t = 500)]
    watchdog_ms: u64,

    /// Overrun bound for the stop command (ms)
    #[arg(long, default_value_t = 3000)]
    command_timeout_ms: u64,

    /// Stop in simple getters while stepping
    #[arg(long)]
    no_skip_getters: bool,

    /// Stop in constructors while stepping
    #[arg(long)]
    no_skip_constructors: bool,

    /// Class pattern excluded from stepping (repeatable)
    #[arg(long = "step-filter")]
    step_filters: Vec<String>,

    /// Log level used when KOMA_LOG is not set
    #[arg(long, default_value = "warn")]
    log_level: String,
}

const SOURCE_FILE: &str = "Main.java";

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    println!("Koma - debugger coordination engine");
    println!("Version 0.1.0");
    println!();

    let settings = build_settings(&cli)?;
    let vm = Arc::new(SimulatedVm::new());
    let threads = init_target(&vm, cli.threads.max(1))?;
    let process = DebugProcess::new(vm.clone(), settings);
    process.add_suspend_listener(Arc::new(PrintingListener))?;
    process.attach()?;
    println!("Attached to simulated target with {} thread(s)", threads.len());
    println!();

    run_repl(&process, &vm)?;

    if process.is_attached() {
        process.stop(false)?;
        process.wait_until_detached(Duration::from_secs(5));
    }
    Ok(())
}

/// KOMA_LOG が設定されていればそれを、なければ `--log-level` を使う
fn init_logging(fallback: &str) {
    let filter = EnvFilter::try_from_env("KOMA_LOG").unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_settings(cli: &Cli) -> Result<DebuggerSettings> {
    let mut settings = DebuggerSettings {
        watchdog_threshold: Duration::from_millis(cli.watchdog_ms),
        command_timeout: Duration::from_millis(cli.command_timeout_ms),
        skip_getters: !cli.no_skip_getters,
        skip_constructors: !cli.no_skip_constructors,
        ..DebuggerSettings::default()
    };
    for pattern in &cli.step_filters {
        settings.stepping_filters.push(ClassFilter::new(pattern)?);
    }
    Ok(settings)
}

fn location(line: u32) -> Location {
    Location::new(MethodInfo::new("app.Main", "run", "()V"), SOURCE_FILE, line)
}

/// シミュレーションターゲットのスレッドと呼び出しの振る舞いを用意する
fn init_target(vm: &SimulatedVm, count: usize) -> Result<Vec<ThreadId>> {
    let mut threads = Vec::with_capacity(count);
    for i in 0..count {
        let name = if i == 0 { "main".to_string() } else { format!("worker-{}", i) };
        let t = vm.add_thread(&name);
        vm.set_frames(t, vec![location(1)])?;
        threads.push(t);
    }
    vm.set_invocation_handler(|call| Ok(Value::Str(format!("{}() on {}", call.method.name, call.thread))));
    Ok(threads)
}

/// 停止と再開を表示するリスナー
struct PrintingListener;

impl SuspendListener for PrintingListener {
    fn paused(&self, context: &SuspendContext) {
        match context.thread() {
            Some(t) => println!("\nPaused: {} in {}", context.id(), t),
            None => println!("\nPaused: {}", context.id()),
        }
    }
}

/// REPLループを実行する
fn run_repl(process: &DebugProcess, vm: &SimulatedVm) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;
    let history = history_path();
    if let Some(path) = &history {
        let _ = rl.load_history(path);
    }

    loop {
        let readline = rl.readline("(koma) ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                match Command::parse(line) {
                    Some(Command::Quit) => break,
                    Some(command) => {
                        if let Err(e) = handle_command(process, vm, command) {
                            eprintln!("Error: {}", e);
                        }
                    }
                    None => {
                        println!("Unknown command: {}", line);
                        println!("Type 'help' for available commands.");
                    }
                }
                if !process.is_attached() {
                    println!("Target detached");
                    break;
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    if let Some(path) = &history {
        let _ = rl.save_history(path);
    }
    println!("Goodbye!");
    Ok(())
}

fn history_path() -> Option<PathBuf> {
    home::home_dir().map(|h| h.join(".koma_history"))
}

/// 最後に停止したコンテキスト
fn current_context(process: &DebugProcess) -> Result<ContextId> {
    process
        .paused_contexts()?
        .last()
        .map(|c| c.id())
        .ok_or_else(|| anyhow!("No paused context"))
}

fn handle_command(process: &DebugProcess, vm: &SimulatedVm, command: Command) -> Result<()> {
    match command {
        Command::Help => print_help(),
        Command::Break(position) => {
            let id = process.add_breakpoint(position.clone(), SuspendPolicy::All)?;
            println!("Breakpoint {} set at {}", id, position);
        }
        Command::Delete(id) => {
            if process.remove_breakpoint(id)? {
                println!("Breakpoint {} deleted", id);
            } else {
                println!("No breakpoint {}", id);
            }
        }
        Command::Breakpoints => {
            let breakpoints = process.breakpoints()?;
            if breakpoints.is_empty() {
                println!("No breakpoints");
            }
            for bp in breakpoints {
                let state = if bp.enabled { "enabled" } else { "disabled" };
                println!("  {}. {} ({}, hits: {})", bp.id, bp.position, state, bp.hit_count);
            }
        }
        Command::Continue => {
            let context = current_context(process)?;
            process.resume(context)?;
            println!("Continuing {}", context);
        }
        Command::Step => process.step_into(current_context(process)?, false, None)?,
        Command::Next => process.step_over(current_context(process)?, false)?,
        Command::Finish => process.step_out(current_context(process)?)?,
        Command::Until(position) => {
            process.run_to_cursor(current_context(process)?, position.clone(), false)?;
            println!("Running to {}", position);
        }
        Command::Pause => match process.pause()? {
            Some(context) => println!("Paused all threads ({})", context),
            None => println!("Already paused"),
        },
        Command::Threads => {
            for t in process.threads()? {
                let mut flags = Vec::new();
                if t.suspended {
                    flags.push("suspended");
                }
                if t.frozen {
                    flags.push("frozen");
                }
                if t.evaluating {
                    flags.push("evaluating");
                }
                println!("  {} {} [{}]", t.id, t.name, flags.join(", "));
            }
        }
        Command::ResumeThread(thread) => process.resume_thread(thread)?,
        Command::Freeze(thread) => process.freeze_thread(thread)?,
        Command::Thaw(thread) => process.unfreeze_thread(thread)?,
        Command::Eval(method) => {
            let context = current_context(process)?;
            let value = process.evaluate(context, method, Vec::new())?;
            println!("= {:?}", value);
        }
        Command::Mute(muted) => {
            process.set_breakpoints_muted(muted)?;
            println!("Breakpoints {}", if muted { "muted" } else { "unmuted" });
        }
        Command::Contexts => print!("{}", process.dump()?),
        Command::SimHit(thread, position) => {
            let request = vm
                .breakpoint_at(&position)
                .ok_or_else(|| anyhow!("No breakpoint at {}", position))?;
            vm.emit_breakpoint(thread, request, location(position.line), 1)?;
        }
        Command::SimStep(thread, line, frames) => {
            if vm.emit_step(thread, location(line), frames).is_none() {
                println!("No step request for {}", thread);
            }
        }
        Command::SimThread(name) => {
            let t = vm.add_thread(&name);
            vm.set_frames(t, vec![location(1)])?;
            vm.post(EventSet::new(SuspendPolicy::None, vec![Event::ThreadStart { thread: t }]));
            println!("Started {} ({})", t, name);
        }
        Command::Quit => {}
    }
    Ok(())
}

fn print_help() {
    println!("Available commands:");
    println!();
    println!("  help              - Show this help message");
    println!("  quit/exit/q       - Exit the debugger");
    println!();
    println!("Debug commands:");
    println!("  break <file:line> - Set breakpoint");
    println!("  delete <id>       - Delete breakpoint");
    println!("  breakpoints (bl)  - List breakpoints");
    println!("  continue (c)      - Resume the last paused context");
    println!("  step (s)          - Step into");
    println!("  next (n)          - Step over");
    println!("  finish (f)        - Step out");
    println!("  until <file:line> - Run to position");
    println!("  pause (p)         - Pause all threads");
    println!("  threads (t)       - List threads");
    println!("  resume <tid>      - Resume one thread");
    println!("  freeze <tid>      - Freeze a thread");
    println!("  thaw <tid>        - Unfreeze a thread");
    println!("  eval <method>     - Invoke Class.method in the paused thread");
    println!("  mute [on|off]     - Mute breakpoints");
    println!("  contexts (ctx)    - Show suspend contexts");
    println!();
    println!("Simulation commands:");
    println!("  sim hit <tid> <file:line>      - Hit a breakpoint");
    println!("  sim step <tid> <line> <frames> - Complete a pending step");
    println!("  sim thread <name>              - Start a thread");
    println!();
    println!("Examples:");
    println!("  break Main.java:10");
    println!("  sim hit 1 Main.java:10");
    println!("  next");
    println!("  sim step 1 11 1");
}
