//! A compiled script instance: owns the root scope, the callback registry and
//! the breakpoints, and is the single entry point tasks use to run script code.

use crate::config::EngineConfig;
use crate::language::{
    ast::{FunctionDef, Program},
    parser::parse_script,
    span::{LineIndex, Location},
};
use crate::runtime::{
    builtins::HostBindings,
    callbacks::{CallbackKind, CallbackRegistry, MessageEvent},
    console::{ConsoleSink, LogConsole},
    deadline::Deadline,
    debugger::{BreakpointHit, BreakpointSet},
    environment::{DeclarationMode, Environment},
    error::{ErrorKind, ScriptError},
    globals::GlobalStore,
    interpreter::{Interpreter, Interrupt, Invocation},
    value::Value,
};
use crate::threading::{OwnerHandle, ScriptLock, Task, TaskKind};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Why a callback did not return a value.
#[derive(Debug, Error)]
pub enum CallbackFailure {
    #[error(transparent)]
    Error(#[from] ScriptError),
    #[error("execution halted at breakpoint {} on line {}", .0.index, .0.line())]
    Breakpoint(Box<BreakpointHit>),
}

impl CallbackFailure {
    pub fn breakpoint(&self) -> Option<&BreakpointHit> {
        match self {
            CallbackFailure::Breakpoint(hit) => Some(hit),
            CallbackFailure::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ScriptError> {
        match self {
            CallbackFailure::Error(err) => Some(err),
            CallbackFailure::Breakpoint(_) => None,
        }
    }
}

struct ScriptState {
    program: Program,
    lines: LineIndex,
    env: Environment,
    functions: HashMap<String, Arc<FunctionDef>>,
    callbacks: CallbackRegistry,
}

pub struct ScriptProcessor {
    owner: Arc<OwnerHandle>,
    config: EngineConfig,
    console: Arc<dyn ConsoleSink>,
    globals: GlobalStore,
    lock: ScriptLock,
    state: Mutex<Option<ScriptState>>,
    breakpoints: Mutex<BreakpointSet>,
    last_break: Mutex<Option<BreakpointHit>>,
    started: Instant,
}

impl ScriptProcessor {
    pub fn new(name: impl Into<String>, config: EngineConfig) -> Self {
        Self {
            owner: OwnerHandle::new(name),
            config,
            console: Arc::new(LogConsole),
            globals: GlobalStore::new(),
            lock: ScriptLock::new(),
            state: Mutex::new(None),
            breakpoints: Mutex::new(BreakpointSet::new()),
            last_break: Mutex::new(None),
            started: Instant::now(),
        }
    }

    pub fn with_console(mut self, console: Arc<dyn ConsoleSink>) -> Self {
        self.console = console;
        self
    }

    /// Shares the global key/value store with other processors.
    pub fn with_globals(mut self, globals: GlobalStore) -> Self {
        self.globals = globals;
        self
    }

    pub fn with_lock(mut self, lock: ScriptLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn owner(&self) -> &Arc<OwnerHandle> {
        &self.owner
    }

    pub fn name(&self) -> &str {
        self.owner.name()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn globals(&self) -> &GlobalStore {
        &self.globals
    }

    pub fn compile(&self, source: &str) -> Result<(), ScriptError> {
        self.compile_source(source, None, self.config.compilation_timeout_extension())
    }

    /// Compiles text loaded from `path`; errors and breakpoints refer to it.
    pub fn compile_file(&self, source: &str, path: impl Into<PathBuf>) -> Result<(), ScriptError> {
        self.compile_source(
            source,
            Some(path.into()),
            self.config.compilation_timeout_extension(),
        )
    }

    /// Parses `source`, registers its callbacks and runs `onInit` against a
    /// fresh state, with the `onInit` deadline pushed out by `extension`. The
    /// previous state and the shared globals stay untouched unless every step
    /// succeeds.
    fn compile_source(
        &self,
        source: &str,
        file: Option<PathBuf>,
        extension: Duration,
    ) -> Result<(), ScriptError> {
        let _guard = self.lock.acquire();
        let lines = LineIndex::new(source);
        let program = parse_script(source, file.clone())
            .map_err(|errors| ScriptError::from_syntax(&errors, &lines, file.clone()))?;

        let max_execution = self.config.max_execution_time();
        let mut callbacks = CallbackRegistry::new();
        let mut functions = HashMap::new();
        callbacks
            .register(
                CallbackKind::Init,
                None,
                CallbackKind::Init.typical_budget(&self.config.audio, max_execution),
            )
            .map_err(|err| compile_error(err.to_string(), None, &file))?;

        for def in &program.functions {
            if functions
                .insert(def.name.clone(), Arc::clone(def))
                .is_some()
            {
                return Err(compile_error(
                    format!("Function `{}` is already defined", def.name),
                    Some(def.location),
                    &file,
                ));
            }
            if let Some(kind) = CallbackKind::from_name(&def.name) {
                let budget = kind.typical_budget(&self.config.audio, max_execution);
                callbacks
                    .register(kind, Some(Arc::clone(def)), budget)
                    .map_err(|err| compile_error(err.to_string(), Some(def.location), &file))?;
            }
        }

        let mut state = ScriptState {
            env: Environment::new(self.config.register_capacity, self.globals.staging()),
            program,
            lines,
            functions,
            callbacks,
        };

        let deadline = Deadline::new(max_execution);
        deadline.extend_by(extension);
        match self.interpret(&mut state, CallbackKind::Init, None, &[], &deadline) {
            Ok(_) => {}
            Err(CallbackFailure::Error(err)) => return Err(err),
            Err(CallbackFailure::Breakpoint(hit)) => {
                return Err(compile_error(
                    format!("Execution halted at breakpoint {} in onInit", hit.index),
                    Some(hit.location),
                    &file,
                ));
            }
        }

        let Some(mut slot) = self.state.try_lock() else {
            return Err(compile_error(
                "Cannot recompile while a callback of this script is running",
                None,
                &file,
            ));
        };
        state.env.commit_globals();
        let registered = state.callbacks.len();
        *slot = Some(state);
        info!("compiled `{}` with {registered} callback(s)", self.name());
        Ok(())
    }

    pub fn is_compiled(&self) -> bool {
        self.state.lock().is_some()
    }

    pub fn has_callback(&self, kind: CallbackKind) -> bool {
        self.state
            .lock()
            .as_ref()
            .is_some_and(|state| state.callbacks.contains(kind))
    }

    /// Reads a variable visible from the root scope of the compiled script.
    pub fn variable(&self, name: &str) -> Option<Value> {
        let state = self.state.lock();
        let env = &state.as_ref()?.env;
        env.lookup(env.root(), name).ok().flatten()
    }

    pub fn set_breakpoints(&self, breakpoints: BreakpointSet) {
        *self.breakpoints.lock() = breakpoints;
    }

    pub fn clear_breakpoints(&self) {
        self.breakpoints.lock().clear();
    }

    /// The most recent breakpoint hit, removed from the processor.
    pub fn take_breakpoint_hit(&self) -> Option<BreakpointHit> {
        self.last_break.lock().take()
    }

    pub fn run_callback(&self, kind: CallbackKind, args: &[Value]) -> Result<Value, CallbackFailure> {
        self.dispatch(kind, args, None)
    }

    /// Runs the MIDI callback matching `event` with the event bound to `Message`.
    pub fn handle_message(&self, event: MessageEvent) -> Result<Value, CallbackFailure> {
        self.dispatch(event.callback(), &event.arguments(), Some(event))
    }

    fn dispatch(
        &self,
        kind: CallbackKind,
        args: &[Value],
        event: Option<MessageEvent>,
    ) -> Result<Value, CallbackFailure> {
        let _guard = self.lock.acquire();
        let Some(mut slot) = self.state.try_lock() else {
            return Err(self.callback_error(kind, "re-entrant call while the script is executing"));
        };
        let Some(state) = slot.as_mut() else {
            return Err(self.callback_error(kind, "script is not compiled"));
        };
        if kind == CallbackKind::Init {
            return Err(self.callback_error(kind, "onInit only runs during compilation"));
        }
        if args.len() != kind.arity() {
            return Err(self.callback_error(
                kind,
                &format!("expected {} argument(s), got {}", kind.arity(), args.len()),
            ));
        }
        if !state.callbacks.contains(kind) {
            debug!("`{}` has no {kind} callback", self.name());
            return Ok(Value::Undefined);
        }
        let deadline = Deadline::new(self.config.max_execution_time());
        self.interpret(state, kind, event, args, &deadline)
    }

    fn callback_error(&self, kind: CallbackKind, message: &str) -> CallbackFailure {
        CallbackFailure::Error(ScriptError::new(ErrorKind::Runtime, message).with_callback(kind.name()))
    }

    fn interpret(
        &self,
        state: &mut ScriptState,
        kind: CallbackKind,
        event: Option<MessageEvent>,
        args: &[Value],
        deadline: &Deadline,
    ) -> Result<Value, CallbackFailure> {
        let ScriptState {
            program,
            lines,
            env,
            functions,
            callbacks,
        } = state;

        let host = HostBindings {
            owner: self.owner.name(),
            console: self.console.as_ref(),
            audio: self.config.audio,
            uptime_origin: self.started,
            repaint: self.owner.repaint_flag(),
        };
        let breakpoints = self.breakpoints.lock().clone();
        let mode = if kind == CallbackKind::Init && self.config.implicit_declarations_in_init {
            DeclarationMode::Implicit
        } else {
            DeclarationMode::Strict
        };
        let invocation = Invocation {
            callback: kind,
            event,
            mode,
            deadline,
            breakpoints: &breakpoints,
            max_call_depth: self.config.max_call_depth,
            lines,
            external_file: program.external_file.as_deref(),
            host: &host,
        };

        let result = if kind == CallbackKind::Init {
            Interpreter::new(env, functions, invocation).run_top_level(&program.statements)
        } else {
            let Some(callback) = callbacks.get_mut(kind) else {
                return Ok(Value::Undefined);
            };
            let Some(def) = callback.function.clone() else {
                return Ok(Value::Undefined);
            };
            let bound = callback.bind(args);
            Interpreter::new(env, functions, invocation).run_function(&def, bound)
        };

        let elapsed = deadline.elapsed();
        let budget = kind.typical_budget(&self.config.audio, self.config.max_execution_time());
        if elapsed > budget {
            warn!(
                "{kind} of `{}` took {elapsed:?}, over its typical budget of {budget:?}",
                self.name()
            );
        }

        match result {
            Ok(value) => Ok(value),
            Err(Interrupt::Fault(fault)) => {
                let err = fault
                    .into_script_error()
                    .with_callback(kind.name())
                    .with_external_file(program.external_file.clone());
                self.console
                    .error(self.name(), &format!("{kind}: {}", err.trace()));
                Err(CallbackFailure::Error(err))
            }
            Err(Interrupt::Breakpoint(hit)) => {
                info!(
                    "`{}` halted at breakpoint {} in {kind}, line {}",
                    self.name(),
                    hit.index,
                    hit.line()
                );
                *self.last_break.lock() = Some((*hit).clone());
                Err(CallbackFailure::Breakpoint(hit))
            }
        }
    }

    pub fn compile_task(self: &Arc<Self>, source: impl Into<String>) -> Task {
        let processor = Arc::clone(self);
        let source = source.into();
        Task::new(TaskKind::Compilation, &self.owner, move |task| {
            processor.compile_source(&source, None, task.timeout_extension)
        })
    }

    /// Wraps a callback invocation. A breakpoint counts as success; the hit
    /// is kept for [`take_breakpoint_hit`](Self::take_breakpoint_hit).
    pub fn callback_task(self: &Arc<Self>, priority: TaskKind, kind: CallbackKind, args: Vec<Value>) -> Task {
        let processor = Arc::clone(self);
        Task::new(priority, &self.owner, move |_| {
            settle(processor.run_callback(kind, &args))
        })
    }

    pub fn message_task(self: &Arc<Self>, event: MessageEvent) -> Task {
        let processor = Arc::clone(self);
        Task::new(TaskKind::HighPriorityCallback, &self.owner, move |_| {
            settle(processor.handle_message(event))
        })
    }
}

fn settle(result: Result<Value, CallbackFailure>) -> Result<(), ScriptError> {
    match result {
        Ok(_) | Err(CallbackFailure::Breakpoint(_)) => Ok(()),
        Err(CallbackFailure::Error(err)) => Err(err),
    }
}

fn compile_error(
    message: impl Into<String>,
    location: Option<Location>,
    file: &Option<PathBuf>,
) -> ScriptError {
    let mut err = ScriptError::new(ErrorKind::Compile, message).with_external_file(file.clone());
    err.location = location;
    err
}
