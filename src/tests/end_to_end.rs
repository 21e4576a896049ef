use super::MockContext;
use crate::config::{AudioSettings, EngineConfig};
use crate::runtime::{
    console::MemoryConsole, debugger::BreakpointSet, error::ErrorKind, processor::ScriptProcessor,
    value::Value, CallbackKind, MessageEvent,
};
use crate::threading::{EngineContext, ScriptingWorker, TaskKind, TaskPool, ThreadKind};
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn processor(name: &str, config: EngineConfig) -> (Arc<ScriptProcessor>, Arc<MemoryConsole>) {
    let console = Arc::new(MemoryConsole::new());
    let processor = ScriptProcessor::new(name, config).with_console(console.clone());
    (Arc::new(processor), console)
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let started = Instant::now();
    while !done() && started.elapsed() < Duration::from_secs(3) {
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn compile_and_events_flow_through_the_worker() {
    let ctx = Arc::new(MockContext::new());
    ctx.set_thread(ThreadKind::Message);
    let pool = Arc::new(TaskPool::new(&EngineConfig::default()));
    let mut worker = ScriptingWorker::spawn(
        Arc::clone(&pool),
        ctx.clone() as Arc<dyn EngineContext>,
        Duration::from_millis(2),
    )
    .unwrap();
    let (synth, console) = processor("synth", EngineConfig::default());

    // Not initialised yet: the message thread compiles in place.
    pool.add_job(
        ctx.as_ref(),
        synth.compile_task(
            r#"
reg held = 0;
function onNoteOn(note, velocity) {
    held += 1;
    Console.print("on " + Message.getNoteNumber());
}
function onNoteOff(note, velocity) {
    held -= 1;
}
function onController(number, value) {
    if (number == 128) Console.print("bend " + value);
}
"#,
        ),
    );
    assert!(synth.is_compiled());

    ctx.set_initialised(true);
    for event in [
        MessageEvent::NoteOn {
            note: 64,
            velocity: 90,
        },
        MessageEvent::NoteOff {
            note: 64,
            velocity: 0,
        },
        MessageEvent::NoteOn {
            note: 67,
            velocity: 80,
        },
        MessageEvent::pitch_bend(8192),
    ] {
        pool.add_job(ctx.as_ref(), synth.message_task(event));
    }
    wait_until(|| console.output().len() == 3);
    worker.shutdown();

    assert_eq!(
        console.output(),
        vec!["on 64".to_string(), "on 67".to_string(), "bend 8192".to_string()]
    );
    assert!(matches!(synth.variable("held"), Some(Value::Int(1))));
}

#[test]
fn failed_recompile_keeps_running_callbacks() {
    let ctx = MockContext::initialised();
    let pool = TaskPool::new(&EngineConfig::default());
    let (p, console) = processor("p", EngineConfig::default());

    pool.add_job(
        &ctx,
        p.compile_task("function onTimer() { Console.print(\"v1\"); }"),
    );
    pool.run_pending(&ctx);
    pool.add_job(
        &ctx,
        p.compile_task("function onTimer() { Console.print(\"v2\"); }\nfunction onTimer() {}"),
    );
    let report = pool.run_pending(&ctx);
    assert_eq!(report.failed, 1);

    pool.add_job(
        &ctx,
        p.callback_task(TaskKind::LowPriorityCallback, CallbackKind::Timer, Vec::new()),
    );
    pool.run_pending(&ctx);
    assert_eq!(console.output(), vec!["v1".to_string()]);
}

#[test]
fn message_calls_outside_midi_callbacks_fail() {
    let (p, console) = processor("p", EngineConfig::default());
    p.compile("function onTimer() {\n  var n = Message.getNoteNumber();\n}")
        .unwrap();
    let failure = p.run_callback(CallbackKind::Timer, &[]).unwrap_err();
    let err = failure.error().unwrap();
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert_eq!(err.line(), Some(2));
    assert!(err.message.contains("illegal call outside the right callback"));
    assert_eq!(console.errors().len(), 1);

    let err = p
        .compile("var n = Message.getVelocity();")
        .unwrap_err();
    assert!(err.message.contains("illegal call"));
}

#[test]
fn callbacks_over_budget_still_complete() {
    let config = EngineConfig {
        audio: AudioSettings {
            sample_rate: 1_000_000.0,
            buffer_size: 1,
        },
        ..EngineConfig::default()
    };
    let (p, console) = processor("slow", config);
    p.compile(
        "function onNoteOn(note, velocity) {\n  var x = 0;\n  for (var i = 0; i < 2000; i++) { x += i; }\n  Console.print(\"\" + x);\n}",
    )
    .unwrap();
    p.handle_message(MessageEvent::NoteOn {
        note: 1,
        velocity: 1,
    })
    .unwrap();
    assert_eq!(console.output(), vec!["1999000".to_string()]);
}

#[test]
fn extend_timeout_keeps_long_init_alive() {
    let config = EngineConfig {
        max_execution_time_ms: 20,
        compilation_timeout_extension_ms: 0,
        ..EngineConfig::default()
    };
    let (p, _) = processor("slow-init", config);
    p.compile(
        "Engine.extendTimeOut(2000);\nvar start = Engine.getUptime();\nwhile (Engine.getUptime() - start < 0.05) {}\nvar done = true;",
    )
    .unwrap();
    assert!(matches!(p.variable("done"), Some(Value::Bool(true))));
}

#[test]
fn error_trace_names_helper_functions() {
    let (p, console) = processor("p", EngineConfig::default());
    p.compile(
        "function inner() { return undefinedThing; }\nfunction outer() { return inner(); }\nfunction onTimer() {\n  outer();\n}",
    )
    .unwrap();
    let failure = p.run_callback(CallbackKind::Timer, &[]).unwrap_err();
    let err = failure.error().unwrap();
    let names: Vec<&str> = err
        .call_stack
        .iter()
        .map(|entry| entry.function.as_str())
        .collect();
    assert_eq!(names, vec!["outer", "inner"]);
    assert!(console.errors()[0].contains("called from inner()"));
}

#[test]
fn runaway_recursion_on_the_worker_leaves_it_running() {
    let ctx = Arc::new(MockContext::initialised());
    let pool = Arc::new(TaskPool::new(&EngineConfig::default()));
    let mut worker = ScriptingWorker::spawn(
        Arc::clone(&pool),
        ctx.clone() as Arc<dyn EngineContext>,
        Duration::from_millis(2),
    )
    .unwrap();
    let (deep, deep_console) = processor("deep", EngineConfig::default());
    let (next, console) = processor("next", EngineConfig::default());
    next.compile("function onTimer() { Console.print(\"still here\"); }")
        .unwrap();

    pool.add_job(
        ctx.as_ref(),
        deep.compile_task("function f(n) { return f(n + 1); }\nf(0);"),
    );
    pool.add_job(
        ctx.as_ref(),
        next.callback_task(TaskKind::LowPriorityCallback, CallbackKind::Timer, Vec::new()),
    );
    wait_until(|| !console.output().is_empty());
    assert!(worker.is_running());
    worker.shutdown();

    assert_eq!(console.output(), vec!["still here".to_string()]);
    assert!(!deep.is_compiled());
    assert!(deep_console.errors()[0].contains("Stack overflow"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn breakpoint_captures_the_innermost_frame(count in 1usize..8, pick in 0usize..8) {
        let halt = pick % count;
        let mut source = String::from("var top = 1;\nfunction onTimer() {\n");
        for idx in 0..count {
            source.push_str(&format!("  var v{idx} = {idx}; Console.print(\"s{idx}\");\n"));
        }
        source.push_str("}\n");

        let (p, console) = processor("dbg", EngineConfig::default());
        p.compile(&source).unwrap();
        let mut breakpoints = BreakpointSet::new();
        // Statement `idx` sits on line idx + 3.
        breakpoints.add_line((halt + 3) as u32);
        p.set_breakpoints(breakpoints);

        let failure = p.run_callback(CallbackKind::Timer, &[]).unwrap_err();
        let hit = failure.breakpoint().cloned().unwrap();
        prop_assert_eq!(hit.line() as usize, halt + 3);

        let mut names: Vec<String> = hit.locals.iter().map(|(name, _)| name.clone()).collect();
        names.sort();
        let mut expected: Vec<String> = (0..halt).map(|idx| format!("v{idx}")).collect();
        expected.sort();
        prop_assert_eq!(names, expected);
        prop_assert!(hit.local("top").is_none());

        let printed: Vec<String> = (0..halt).map(|idx| format!("s{idx}")).collect();
        prop_assert_eq!(console.output(), printed);
    }
}
