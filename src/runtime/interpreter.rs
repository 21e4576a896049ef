use crate::language::{
    ast::*,
    span::{LineIndex, Location},
};
use crate::runtime::{
    builtins::{self, BuiltinContext, HostBindings},
    callbacks::{CallbackKind, MessageEvent},
    debugger::{BreakpointHit, BreakpointSet, CallStackEntry},
    deadline::Deadline,
    environment::{DeclarationMode, Environment, ScopeId, ScopeKind},
    error::{RuntimeError, ScriptError},
    value::{apply_binary, Namespace, ObjectValue, Value},
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// How a statement finished.
#[derive(Clone, Debug)]
pub enum Completion {
    Normal,
    Return(Value),
    Break,
    Continue,
}

/// Anything that unwinds past a statement: a breakpoint or a runtime fault.
#[derive(Debug)]
pub enum Interrupt {
    Breakpoint(Box<BreakpointHit>),
    Fault(Fault),
}

#[derive(Debug)]
pub struct Fault {
    pub error: RuntimeError,
    pub location: Option<Location>,
    /// Frames left while unwinding, innermost first.
    pub trace: Vec<CallStackEntry>,
}

impl Fault {
    pub fn into_script_error(self) -> ScriptError {
        let mut trace = self.trace;
        trace.reverse();
        ScriptError::from_runtime(self.error, self.location, trace)
    }
}

impl Interrupt {
    fn at(self, location: Location) -> Self {
        match self {
            Interrupt::Fault(mut fault) => {
                if fault.location.is_none() {
                    fault.location = Some(location);
                }
                Interrupt::Fault(fault)
            }
            other => other,
        }
    }
}

impl From<RuntimeError> for Interrupt {
    fn from(error: RuntimeError) -> Self {
        Interrupt::Fault(Fault {
            error,
            location: None,
            trace: Vec::new(),
        })
    }
}

pub type Exec<T> = Result<T, Interrupt>;

/// Per-invocation inputs of the interpreter.
pub struct Invocation<'a> {
    pub callback: CallbackKind,
    pub event: Option<MessageEvent>,
    pub mode: DeclarationMode,
    pub deadline: &'a Deadline,
    pub breakpoints: &'a BreakpointSet,
    /// Nested script function calls allowed before `StackOverflow`.
    pub max_call_depth: usize,
    pub lines: &'a LineIndex,
    pub external_file: Option<&'a Path>,
    pub host: &'a HostBindings<'a>,
}

pub struct Interpreter<'a> {
    env: &'a mut Environment,
    functions: &'a HashMap<String, Arc<FunctionDef>>,
    invocation: Invocation<'a>,
    call_stack: Vec<CallStackEntry>,
    fired: HashSet<usize>,
}

enum Place {
    Name(String),
    Field(Value, String),
    Element(Value, Value),
}

impl<'a> Interpreter<'a> {
    pub fn new(
        env: &'a mut Environment,
        functions: &'a HashMap<String, Arc<FunctionDef>>,
        invocation: Invocation<'a>,
    ) -> Self {
        Self {
            env,
            functions,
            invocation,
            call_stack: Vec::new(),
            fired: HashSet::new(),
        }
    }

    pub fn call_stack(&self) -> &[CallStackEntry] {
        &self.call_stack
    }

    /// Runs top-level statements directly in the root scope.
    pub fn run_top_level(&mut self, statements: &[Statement]) -> Exec<Value> {
        let root = self.env.root();
        self.execute(statements, root)
    }

    /// Walks `statements` against `scope` and returns the `return` value, if any.
    pub fn execute(&mut self, statements: &[Statement], scope: ScopeId) -> Exec<Value> {
        match self.exec_statements(statements, scope)? {
            Completion::Return(value) => Ok(value),
            Completion::Normal => Ok(Value::Undefined),
            Completion::Break => Err(RuntimeError::StrayControl { statement: "break" }.into()),
            Completion::Continue => Err(RuntimeError::StrayControl {
                statement: "continue",
            }
            .into()),
        }
    }

    /// Invokes a callback body with its bound arguments. The callback itself
    /// does not appear on the call stack.
    pub fn run_function(&mut self, def: &FunctionDef, args: &[Value]) -> Exec<Value> {
        let root = self.env.root();
        let scope = self.env.push_scope(root, ScopeKind::Function);
        let result = self.bind_and_run(def, args, scope);
        self.env.pop_scope(scope);
        result
    }

    fn bind_and_run(&mut self, def: &FunctionDef, args: &[Value], scope: ScopeId) -> Exec<Value> {
        for (idx, param) in def.params.iter().enumerate() {
            let value = args.get(idx).cloned().unwrap_or_default();
            self.env.declare_local(scope, param, value)?;
        }
        self.execute(&def.body.statements, scope)
    }

    fn call_function(
        &mut self,
        def: &Arc<FunctionDef>,
        args: Vec<Value>,
        call_site: Location,
    ) -> Exec<Value> {
        if args.len() != def.params.len() {
            return Err(RuntimeError::ArityMismatch {
                name: def.name.clone(),
                expected: def.params.len(),
                received: args.len(),
            }
            .into());
        }
        if self.call_stack.len() >= self.invocation.max_call_depth {
            return Err(RuntimeError::StackOverflow {
                limit: self.invocation.max_call_depth,
            }
            .into());
        }
        self.call_stack.push(CallStackEntry {
            function: def.name.clone(),
            location: call_site,
            owner: self.invocation.host.owner.to_string(),
        });
        let result = self.run_function(def, &args);
        let entry = self.call_stack.pop();
        match result {
            Err(Interrupt::Fault(mut fault)) => {
                if let Some(entry) = entry {
                    fault.trace.push(entry);
                }
                Err(Interrupt::Fault(fault))
            }
            other => other,
        }
    }

    fn with_scope<T>(
        &mut self,
        parent: ScopeId,
        f: impl FnOnce(&mut Self, ScopeId) -> Exec<T>,
    ) -> Exec<T> {
        let scope = self.env.push_scope(parent, ScopeKind::Block);
        let result = f(self, scope);
        self.env.pop_scope(scope);
        result
    }

    fn exec_statements(&mut self, statements: &[Statement], scope: ScopeId) -> Exec<Completion> {
        for statement in statements {
            match self.exec_statement(statement, scope)? {
                Completion::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Completion::Normal)
    }

    fn exec_statement(&mut self, statement: &Statement, scope: ScopeId) -> Exec<Completion> {
        let location = statement.location;
        if let Err(err) = self.invocation.deadline.check() {
            return Err(Interrupt::from(err).at(location));
        }
        self.check_breakpoint(location, scope)?;
        self.exec_kind(&statement.kind, scope)
            .map_err(|interrupt| interrupt.at(location))
    }

    fn check_breakpoint(&mut self, location: Location, scope: ScopeId) -> Exec<()> {
        if self.invocation.breakpoints.is_empty() {
            return Ok(());
        }
        let callback = self.invocation.callback.name();
        let Some(bp) = self.invocation.breakpoints.find(
            callback,
            self.invocation.external_file,
            &location,
        ) else {
            return Ok(());
        };
        if !self.fired.insert(bp.index) {
            return Ok(());
        }
        let hit = BreakpointHit {
            index: bp.index,
            location,
            callback: callback.to_string(),
            external_file: self.invocation.external_file.map(Path::to_path_buf),
            locals: self.env.frame_locals(scope)?,
            call_stack: self.call_stack.clone(),
        };
        Err(Interrupt::Breakpoint(Box::new(hit)))
    }

    fn exec_kind(&mut self, kind: &StatementKind, scope: ScopeId) -> Exec<Completion> {
        match kind {
            StatementKind::Declare(decl) => {
                self.exec_declare(decl, scope)?;
                Ok(Completion::Normal)
            }
            StatementKind::Expr(expr) => {
                self.eval(expr, scope)?;
                Ok(Completion::Normal)
            }
            StatementKind::If(stmt) => {
                if self.eval(&stmt.condition, scope)?.is_truthy() {
                    self.exec_statement(&stmt.then_branch, scope)
                } else if let Some(else_branch) = &stmt.else_branch {
                    self.exec_statement(else_branch, scope)
                } else {
                    Ok(Completion::Normal)
                }
            }
            StatementKind::While(stmt) => {
                while self.eval(&stmt.condition, scope)?.is_truthy() {
                    match self.exec_statement(&stmt.body, scope)? {
                        Completion::Break => break,
                        Completion::Return(value) => return Ok(Completion::Return(value)),
                        Completion::Normal | Completion::Continue => {}
                    }
                }
                Ok(Completion::Normal)
            }
            StatementKind::DoWhile(stmt) => {
                loop {
                    match self.exec_statement(&stmt.body, scope)? {
                        Completion::Break => break,
                        Completion::Return(value) => return Ok(Completion::Return(value)),
                        Completion::Normal | Completion::Continue => {}
                    }
                    if !self.eval(&stmt.condition, scope)?.is_truthy() {
                        break;
                    }
                }
                Ok(Completion::Normal)
            }
            StatementKind::For(stmt) => self.with_scope(scope, |this, inner| {
                if let Some(init) = &stmt.init {
                    this.exec_statement(init, inner)?;
                }
                loop {
                    if let Some(condition) = &stmt.condition {
                        if !this.eval(condition, inner)?.is_truthy() {
                            break;
                        }
                    }
                    match this.exec_statement(&stmt.body, inner)? {
                        Completion::Break => break,
                        Completion::Return(value) => return Ok(Completion::Return(value)),
                        Completion::Normal | Completion::Continue => {}
                    }
                    if let Some(step) = &stmt.step {
                        this.eval(step, inner)?;
                    }
                    // An empty body still has to observe the deadline.
                    this.invocation.deadline.check()?;
                }
                Ok(Completion::Normal)
            }),
            StatementKind::ForIn(stmt) => {
                let items = match self.eval(&stmt.iterable, scope)? {
                    Value::Array(array) => array.snapshot(),
                    Value::Object(object) => {
                        object.keys().into_iter().map(Value::string).collect()
                    }
                    other => {
                        return Err(RuntimeError::TypeMismatch {
                            message: format!("cannot iterate over {}", other.type_name()),
                        }
                        .into())
                    }
                };
                self.with_scope(scope, |this, inner| {
                    for item in items {
                        this.env.declare_local(inner, &stmt.binding, item)?;
                        match this.exec_statement(&stmt.body, inner)? {
                            Completion::Break => break,
                            Completion::Return(value) => return Ok(Completion::Return(value)),
                            Completion::Normal | Completion::Continue => {}
                        }
                    }
                    Ok(Completion::Normal)
                })
            }
            StatementKind::Switch(stmt) => self.exec_switch(stmt, scope),
            StatementKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, scope)?,
                    None => Value::Undefined,
                };
                Ok(Completion::Return(value))
            }
            StatementKind::Break => Ok(Completion::Break),
            StatementKind::Continue => Ok(Completion::Continue),
            StatementKind::Block(block) => self.with_scope(scope, |this, inner| {
                this.exec_statements(&block.statements, inner)
            }),
        }
    }

    fn exec_declare(&mut self, decl: &DeclareStmt, scope: ScopeId) -> Exec<()> {
        let value = match &decl.value {
            Some(expr) => Some(self.eval(expr, scope)?),
            None => None,
        };
        match decl.kind {
            DeclKind::Var => {
                self.env
                    .declare_local(scope, &decl.name, value.unwrap_or_default())?;
            }
            DeclKind::Const => {
                self.ensure_init_only("const", &decl.name)?;
                self.env
                    .declare_constant(&decl.name, value.unwrap_or_default())?;
            }
            DeclKind::Register => {
                self.ensure_init_only("reg", &decl.name)?;
                self.env
                    .declare_register(&decl.name, value.unwrap_or_default())?;
            }
            DeclKind::Global => {
                self.ensure_init_only("global", &decl.name)?;
                self.env.declare_global(&decl.name, value);
            }
        }
        Ok(())
    }

    fn ensure_init_only(&self, keyword: &str, name: &str) -> Exec<()> {
        if self.invocation.callback == CallbackKind::Init {
            Ok(())
        } else {
            Err(RuntimeError::Unsupported {
                message: format!("`{keyword} {name}` can only be declared in onInit"),
            }
            .into())
        }
    }

    fn exec_switch(&mut self, stmt: &SwitchStmt, scope: ScopeId) -> Exec<Completion> {
        let subject = self.eval(&stmt.subject, scope)?;
        let mut start = None;
        'cases: for (idx, case) in stmt.cases.iter().enumerate() {
            for value in &case.values {
                if self.eval(value, scope)?.loosely_equals(&subject) {
                    start = Some(idx);
                    break 'cases;
                }
            }
        }
        self.with_scope(scope, |this, inner| {
            let bodies = match start {
                Some(idx) => stmt.cases[idx..]
                    .iter()
                    .map(|case| case.body.as_slice())
                    .chain(stmt.default.as_deref())
                    .collect::<Vec<_>>(),
                None => stmt.default.as_deref().into_iter().collect(),
            };
            for body in bodies {
                match this.exec_statements(body, inner)? {
                    Completion::Normal => {}
                    Completion::Break => return Ok(Completion::Normal),
                    other => return Ok(other),
                }
            }
            Ok(Completion::Normal)
        })
    }

    fn builtin_context(&self) -> BuiltinContext<'_> {
        BuiltinContext {
            host: self.invocation.host,
            callback: self.invocation.callback,
            event: self.invocation.event,
            deadline: self.invocation.deadline,
            globals: self.env.globals(),
        }
    }

    fn eval(&mut self, expr: &Expr, scope: ScopeId) -> Exec<Value> {
        match expr {
            Expr::Identifier(ident) => self.lookup(&ident.name, scope),
            Expr::Literal(literal) => Ok(match literal {
                Literal::Int(value, _) => Value::Int(*value),
                Literal::Float(value, _) => Value::Double(*value),
                Literal::Bool(value, _) => Value::Bool(*value),
                Literal::String(value, _) => Value::string(value.as_str()),
                Literal::Undefined(_) => Value::Undefined,
            }),
            Expr::Array(items, _) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, scope)?);
                }
                Ok(Value::array(values))
            }
            Expr::Object(entries, _) => {
                let mut map = BTreeMap::new();
                for entry in entries {
                    let value = self.eval(&entry.value, scope)?;
                    map.insert(entry.key.clone(), value);
                }
                Ok(Value::Object(ObjectValue::from_entries(map)))
            }
            Expr::Member { base, field, .. } => {
                let base = self.eval(base, scope)?;
                Ok(builtins::get_member(&self.builtin_context(), &base, field)?)
            }
            Expr::Index { base, index, .. } => {
                let base = self.eval(base, scope)?;
                let index = self.eval(index, scope)?;
                Ok(read_element(&base, &index)?)
            }
            Expr::Call { callee, args, span } => {
                let call_site = self.invocation.lines.locate(*span);
                self.eval_call(callee, args, call_site, scope)
            }
            Expr::Unary { op, expr, .. } => {
                let value = self.eval(expr, scope)?;
                Ok(apply_unary(*op, value)?)
            }
            Expr::Binary {
                op, left, right, ..
            } => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                Ok(apply_binary(*op, &left, &right)?)
            }
            Expr::Logical {
                op, left, right, ..
            } => {
                let left = self.eval(left, scope)?;
                let short_circuit = match op {
                    LogicalOp::And => !left.is_truthy(),
                    LogicalOp::Or => left.is_truthy(),
                };
                if short_circuit {
                    Ok(left)
                } else {
                    self.eval(right, scope)
                }
            }
            Expr::Conditional {
                condition,
                then_value,
                else_value,
                ..
            } => {
                if self.eval(condition, scope)?.is_truthy() {
                    self.eval(then_value, scope)
                } else {
                    self.eval(else_value, scope)
                }
            }
            Expr::Assign {
                op, target, value, ..
            } => {
                let place = self.place(target, scope)?;
                let rhs = self.eval(value, scope)?;
                let new_value = match op {
                    Some(op) => {
                        let current = self.read_place(&place, scope)?;
                        apply_binary(*op, &current, &rhs)?
                    }
                    None => rhs,
                };
                self.write_place(place, new_value.clone(), scope)?;
                Ok(new_value)
            }
            Expr::Update {
                op, prefix, target, ..
            } => {
                let place = self.place(target, scope)?;
                let current = self.read_place(&place, scope)?;
                let delta = match op {
                    UpdateOp::Increment => 1,
                    UpdateOp::Decrement => -1,
                };
                let updated = match current {
                    Value::Int(i) => Value::Int(i.wrapping_add(delta)),
                    Value::Double(d) => Value::Double(d + delta as f64),
                    ref other => {
                        return Err(RuntimeError::TypeMismatch {
                            message: format!("cannot increment {}", other.type_name()),
                        }
                        .into())
                    }
                };
                self.write_place(place, updated.clone(), scope)?;
                Ok(if *prefix { updated } else { current })
            }
        }
    }

    fn lookup(&mut self, name: &str, scope: ScopeId) -> Exec<Value> {
        if let Some(value) = self.env.lookup(scope, name)? {
            return Ok(value);
        }
        if let Some(def) = self.functions.get(name) {
            return Ok(Value::Function(def.clone()));
        }
        if let Some(namespace) = Namespace::from_name(name) {
            return Ok(Value::Namespace(namespace));
        }
        Err(RuntimeError::UnknownSymbol {
            name: name.to_string(),
        }
        .into())
    }

    fn eval_call(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        call_site: Location,
        scope: ScopeId,
    ) -> Exec<Value> {
        if let Expr::Member { base, field, .. } = callee {
            let base = self.eval(base, scope)?;
            let args = self.eval_args(args, scope)?;
            return match &base {
                Value::Namespace(namespace) => Ok(builtins::call_namespace(
                    &self.builtin_context(),
                    *namespace,
                    field,
                    &args,
                )?),
                Value::Object(object) => match object.get(field) {
                    Some(Value::Function(def)) => self.call_function(&def, args, call_site),
                    _ => Err(RuntimeError::NotCallable {
                        name: field.clone(),
                    }
                    .into()),
                },
                _ => Ok(builtins::call_method(&base, field, &args)?),
            };
        }

        let target = self.eval(callee, scope)?;
        let args = self.eval_args(args, scope)?;
        match target {
            Value::Function(def) => self.call_function(&def, args, call_site),
            other => Err(RuntimeError::NotCallable {
                name: match callee {
                    Expr::Identifier(ident) => ident.name.clone(),
                    _ => other.type_name().to_string(),
                },
            }
            .into()),
        }
    }

    fn eval_args(&mut self, args: &[Expr], scope: ScopeId) -> Exec<Vec<Value>> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg, scope)?);
        }
        Ok(values)
    }

    fn place(&mut self, target: &Expr, scope: ScopeId) -> Exec<Place> {
        match target {
            Expr::Identifier(ident) => Ok(Place::Name(ident.name.clone())),
            Expr::Member { base, field, .. } => {
                let base = self.eval(base, scope)?;
                Ok(Place::Field(base, field.clone()))
            }
            Expr::Index { base, index, .. } => {
                let base = self.eval(base, scope)?;
                let index = self.eval(index, scope)?;
                Ok(Place::Element(base, index))
            }
            _ => Err(RuntimeError::Unsupported {
                message: "invalid assignment target".into(),
            }
            .into()),
        }
    }

    fn read_place(&mut self, place: &Place, scope: ScopeId) -> Exec<Value> {
        match place {
            Place::Name(name) => self.lookup(name, scope),
            Place::Field(base, field) => {
                Ok(builtins::get_member(&self.builtin_context(), base, field)?)
            }
            Place::Element(base, index) => Ok(read_element(base, index)?),
        }
    }

    fn write_place(&mut self, place: Place, value: Value, scope: ScopeId) -> Exec<()> {
        match place {
            Place::Name(name) => {
                // Implicit declarations only apply to top-level code.
                let mode = if self.call_stack.is_empty() {
                    self.invocation.mode
                } else {
                    DeclarationMode::Strict
                };
                self.env.assign(scope, &name, value, mode)?;
            }
            Place::Field(Value::Object(object), field) => object.insert(field, value),
            Place::Field(Value::Namespace(Namespace::Globals), field) => {
                self.env.globals().set(&field, value)
            }
            Place::Field(other, field) => {
                return Err(RuntimeError::TypeMismatch {
                    message: format!("cannot set `{}` on {}", field, other.type_name()),
                }
                .into())
            }
            Place::Element(Value::Array(array), index) => {
                let idx = array_index(&index)?;
                array.set(idx, value)?;
            }
            Place::Element(Value::Object(object), key) => object.insert(key.to_string(), value),
            Place::Element(other, _) => {
                return Err(RuntimeError::TypeMismatch {
                    message: format!("cannot index into {}", other.type_name()),
                }
                .into())
            }
        }
        Ok(())
    }
}

fn array_index(index: &Value) -> Result<usize, RuntimeError> {
    let invalid = || RuntimeError::TypeMismatch {
        message: format!("invalid array index {index}"),
    };
    match index {
        Value::Int(i) => usize::try_from(*i).map_err(|_| invalid()),
        // Casts saturate; writes past `MAX_ARRAY_LEN` are rejected by `ArrayValue::set`.
        Value::Double(d) if d.is_finite() && *d >= 0.0 && d.fract() == 0.0 => Ok(*d as usize),
        _ => Err(invalid()),
    }
}

fn read_element(base: &Value, index: &Value) -> Result<Value, RuntimeError> {
    match base {
        Value::Array(array) => Ok(array.get(array_index(index)?).unwrap_or_default()),
        Value::Object(object) => Ok(object.get(&index.to_string()).unwrap_or_default()),
        Value::String(text) => {
            let idx = array_index(index)?;
            Ok(text
                .chars()
                .nth(idx)
                .map(|ch| Value::string(ch.to_string()))
                .unwrap_or_default())
        }
        other => Err(RuntimeError::TypeMismatch {
            message: format!("cannot index into {}", other.type_name()),
        }),
    }
}

fn apply_unary(op: UnaryOp, value: Value) -> Result<Value, RuntimeError> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
        UnaryOp::Neg => match value {
            Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
            Value::Double(d) => Ok(Value::Double(-d)),
            other => Err(RuntimeError::TypeMismatch {
                message: format!("cannot negate {}", other.type_name()),
            }),
        },
        UnaryOp::BitNot => match value.as_i64() {
            Some(i) => Ok(Value::Int(!i)),
            None => Err(RuntimeError::TypeMismatch {
                message: format!("operator `~` cannot be applied to {}", value.type_name()),
            }),
        },
    }
}
