use clap::{Parser, Subcommand};
use log::{error, info};
use parking_lot::Mutex;
use rtscript::{
    config::EngineConfig,
    diagnostics::{emit_syntax_errors, report_config_error, report_script_error},
    language::parser::parse_script,
    runtime::{
        callbacks::{CallbackKind, MessageEvent},
        console::{ConsoleLevel, MemoryConsole},
        debugger::{BreakpointHit, BreakpointSet},
        error::ScriptError,
        processor::ScriptProcessor,
    },
    threading::{
        EngineContext, HostContext, ScriptingWorker, Task, TaskKind, TaskPool, ThreadKind,
    },
};
use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

/// Live-editable script engine for real-time audio hosts
#[derive(Parser)]
#[command(name = "rtscript")]
#[command(version)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and compile a script, running its onInit code
    Check { file: PathBuf },

    /// Compile a script and feed it events through the scheduler
    Run {
        file: PathBuf,

        /// Note-on event as NOTE:VELOCITY, repeatable
        #[arg(long = "note", value_parser = parse_pair)]
        notes: Vec<(i64, i64)>,

        /// Controller event as NUMBER:VALUE, repeatable (128 = pitch bend, 129 = aftertouch)
        #[arg(long = "controller", value_parser = parse_pair)]
        controllers: Vec<(i64, i64)>,

        /// Number of onTimer invocations
        #[arg(long, default_value = "0")]
        timer_ticks: usize,

        /// Halt at this line, repeatable
        #[arg(long = "breakpoint")]
        breakpoints: Vec<u32>,
    },
}

fn parse_pair(raw: &str) -> Result<(i64, i64), String> {
    let (left, right) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected A:B, got `{raw}`"))?;
    let parse = |part: &str| {
        part.trim()
            .parse::<i64>()
            .map_err(|err| format!("`{part}`: {err}"))
    };
    Ok((parse(left)?, parse(right)?))
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match EngineConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                report_config_error(&err);
                return ExitCode::FAILURE;
            }
        },
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Check { file } => check(&file, config),
        Commands::Run {
            file,
            notes,
            controllers,
            timer_ticks,
            breakpoints,
        } => {
            let events = notes
                .into_iter()
                .map(|(note, velocity)| MessageEvent::NoteOn { note, velocity })
                .chain(
                    controllers
                        .into_iter()
                        .map(|(number, value)| MessageEvent::Controller { number, value }),
                )
                .collect();
            run(&file, config, events, timer_ticks, &breakpoints)
        }
    }
}

fn read_source(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(source) => Some(source),
        Err(err) => {
            eprintln!("Failed to read {}: {err}", path.display());
            None
        }
    }
}

fn script_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "script".to_string())
}

fn print_console(console: &MemoryConsole) {
    for line in console.lines() {
        match line.level {
            ConsoleLevel::Output => println!("{}", line.text),
            ConsoleLevel::Error => eprintln!("{}", line.text),
        }
    }
}

fn report_compile_failure(path: &Path, source: &str, err: &ScriptError) {
    let name = path.display().to_string();
    match parse_script(source, Some(path.to_path_buf())) {
        Err(errors) => emit_syntax_errors(&name, source, &errors),
        Ok(_) => report_script_error(&name, source, err),
    }
}

fn check(path: &Path, config: EngineConfig) -> ExitCode {
    let Some(source) = read_source(path) else {
        return ExitCode::FAILURE;
    };
    let console = Arc::new(MemoryConsole::new());
    let processor = ScriptProcessor::new(script_name(path), config).with_console(console.clone());
    let result = processor.compile_file(&source, path);
    print_console(&console);
    match result {
        Ok(()) => {
            println!("{}: ok", path.display());
            ExitCode::SUCCESS
        }
        Err(err) => {
            report_compile_failure(path, &source, &err);
            ExitCode::FAILURE
        }
    }
}

fn run(
    path: &Path,
    config: EngineConfig,
    events: Vec<MessageEvent>,
    timer_ticks: usize,
    breakpoint_lines: &[u32],
) -> ExitCode {
    let Some(source) = read_source(path) else {
        return ExitCode::FAILURE;
    };

    let ctx = Arc::new(HostContext::new(config.audio));
    ctx.register_current_thread(ThreadKind::Message);
    let pool = Arc::new(TaskPool::new(&config));
    let mut worker = match ScriptingWorker::spawn(
        Arc::clone(&pool),
        ctx.clone() as Arc<dyn EngineContext>,
        config.worker_interval(),
    ) {
        Ok(worker) => worker,
        Err(err) => {
            error!("failed to start scripting worker: {err}");
            return ExitCode::FAILURE;
        }
    };

    let console = Arc::new(MemoryConsole::new());
    let processor = Arc::new(
        ScriptProcessor::new(script_name(path), config.clone())
            .with_console(console.clone())
            .with_lock(pool.script_lock().clone()),
    );
    let mut breakpoints = BreakpointSet::new();
    for line in breakpoint_lines {
        breakpoints.add_line(*line);
    }
    processor.set_breakpoints(breakpoints);

    // The host is still initialising, so the compilation runs right here.
    let compile_error = Arc::new(Mutex::new(None));
    let compile = {
        let target = Arc::clone(&processor);
        let compile_error = Arc::clone(&compile_error);
        let source = source.clone();
        let path = path.to_path_buf();
        Task::new(TaskKind::Compilation, processor.owner(), move |_| {
            let result = target.compile_file(&source, path);
            if let Err(err) = &result {
                *compile_error.lock() = Some(err.clone());
            }
            result
        })
    };
    pool.add_job(ctx.as_ref(), compile);
    ctx.set_initialised(true);

    if let Some(err) = compile_error.lock().take() {
        worker.shutdown();
        print_console(&console);
        report_compile_failure(path, &source, &err);
        if let Some(hit) = processor.take_breakpoint_hit() {
            print_breakpoint(&hit);
        }
        return ExitCode::FAILURE;
    }

    for event in events {
        pool.add_job(ctx.as_ref(), processor.message_task(event));
    }
    for _ in 0..timer_ticks {
        pool.add_job(
            ctx.as_ref(),
            processor.callback_task(TaskKind::LowPriorityCallback, CallbackKind::Timer, Vec::new()),
        );
    }

    let limit = config.max_execution_time() * 4 + Duration::from_secs(1);
    let started = Instant::now();
    while pool.pending() > 0 && started.elapsed() < limit {
        thread::sleep(config.worker_interval());
    }
    worker.shutdown();
    info!("scheduler stopped after {:?}", started.elapsed());

    print_console(&console);
    if let Some(hit) = processor.take_breakpoint_hit() {
        print_breakpoint(&hit);
    }
    if console.errors().is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_breakpoint(hit: &BreakpointHit) {
    println!(
        "breakpoint {} hit in {} at line {}, column {}",
        hit.index,
        hit.callback,
        hit.line(),
        hit.column()
    );
    for (name, value) in &hit.locals {
        println!("  {name} = {value}");
    }
    for entry in hit.call_stack.iter().rev() {
        println!("  called from {entry}");
    }
}
