//! Builtin API namespaces and the methods available on arrays and strings.

use crate::config::AudioSettings;
use crate::runtime::{
    callbacks::{CallbackKind, MessageEvent},
    console::ConsoleSink,
    deadline::Deadline,
    error::{RuntimeError, RuntimeResult},
    globals::GlobalStore,
    value::{ArrayValue, Namespace, Value},
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Host services a running script can reach.
pub struct HostBindings<'a> {
    pub owner: &'a str,
    pub console: &'a dyn ConsoleSink,
    pub audio: AudioSettings,
    pub uptime_origin: Instant,
    pub repaint: &'a AtomicBool,
}

pub struct BuiltinContext<'a> {
    pub host: &'a HostBindings<'a>,
    pub callback: CallbackKind,
    pub event: Option<MessageEvent>,
    pub deadline: &'a Deadline,
    pub globals: &'a GlobalStore,
}

pub fn get_member(ctx: &BuiltinContext<'_>, base: &Value, field: &str) -> RuntimeResult<Value> {
    match base {
        Value::Namespace(Namespace::Globals) => Ok(ctx.globals.get(field).unwrap_or_default()),
        Value::Namespace(Namespace::Math) => match field {
            "PI" => Ok(Value::Double(std::f64::consts::PI)),
            "E" => Ok(Value::Double(std::f64::consts::E)),
            _ => Err(unknown_member(base, field)),
        },
        Value::Namespace(_) => Err(unknown_member(base, field)),
        Value::Array(array) => match field {
            "length" => Ok(Value::Int(array.len() as i64)),
            _ => Err(unknown_member(base, field)),
        },
        Value::String(text) => match field {
            "length" => Ok(Value::Int(text.chars().count() as i64)),
            _ => Err(unknown_member(base, field)),
        },
        Value::Object(object) => Ok(object.get(field).unwrap_or_default()),
        other => Err(RuntimeError::TypeMismatch {
            message: format!("cannot read `{}` of {}", field, other.type_name()),
        }),
    }
}

pub fn call_namespace(
    ctx: &BuiltinContext<'_>,
    namespace: Namespace,
    method: &str,
    args: &[Value],
) -> RuntimeResult<Value> {
    match namespace {
        Namespace::Console => console(ctx, method, args),
        Namespace::Math => math(method, args),
        Namespace::Message => message(ctx, method, args),
        Namespace::Engine => engine(ctx, method, args),
        Namespace::Content => match method {
            "repaint" => {
                expect_args("Content.repaint", args, 0)?;
                ctx.host.repaint.store(true, Ordering::Release);
                Ok(Value::Undefined)
            }
            _ => Err(unknown_function(namespace, method)),
        },
        Namespace::Globals => Err(RuntimeError::NotCallable {
            name: format!("Globals.{method}"),
        }),
    }
}

pub fn call_method(base: &Value, method: &str, args: &[Value]) -> RuntimeResult<Value> {
    match base {
        Value::Array(array) => array_method(array, method, args),
        Value::String(text) => match method {
            "indexOf" => {
                expect_args("String.indexOf", args, 1)?;
                let needle = args[0].to_string();
                let index = text
                    .find(needle.as_str())
                    .map(|byte| text[..byte].chars().count() as i64)
                    .unwrap_or(-1);
                Ok(Value::Int(index))
            }
            "contains" => {
                expect_args("String.contains", args, 1)?;
                Ok(Value::Bool(text.contains(args[0].to_string().as_str())))
            }
            _ => Err(unknown_member(base, method)),
        },
        other => Err(RuntimeError::NotCallable {
            name: format!("{}.{}", other.type_name(), method),
        }),
    }
}

fn array_method(array: &ArrayValue, method: &str, args: &[Value]) -> RuntimeResult<Value> {
    match method {
        "push" => {
            let mut len = array.len();
            for value in args {
                len = array.push(value.clone());
            }
            Ok(Value::Int(len as i64))
        }
        "pop" => {
            expect_args("Array.pop", args, 0)?;
            Ok(array.pop().unwrap_or_default())
        }
        "indexOf" => {
            expect_args("Array.indexOf", args, 1)?;
            Ok(Value::Int(
                array.index_of(&args[0]).map(|i| i as i64).unwrap_or(-1),
            ))
        }
        "contains" => {
            expect_args("Array.contains", args, 1)?;
            Ok(Value::Bool(array.index_of(&args[0]).is_some()))
        }
        "clear" => {
            expect_args("Array.clear", args, 0)?;
            array.clear();
            Ok(Value::Undefined)
        }
        _ => Err(RuntimeError::NotCallable {
            name: format!("Array.{method}"),
        }),
    }
}

fn console(ctx: &BuiltinContext<'_>, method: &str, args: &[Value]) -> RuntimeResult<Value> {
    match method {
        "print" => {
            let text = args
                .iter()
                .map(|value| value.to_string())
                .collect::<Vec<_>>()
                .join(" ");
            ctx.host.console.print(ctx.host.owner, &text);
            Ok(Value::Undefined)
        }
        "assertTrue" => {
            expect_args("Console.assertTrue", args, 1)?;
            if args[0].is_truthy() {
                Ok(Value::Undefined)
            } else {
                Err(RuntimeError::AssertionFailed {
                    message: format!("{} is not true", args[0]),
                })
            }
        }
        "assertEqual" => {
            expect_args("Console.assertEqual", args, 2)?;
            if args[0].loosely_equals(&args[1]) {
                Ok(Value::Undefined)
            } else {
                Err(RuntimeError::AssertionFailed {
                    message: format!("{} != {}", args[0], args[1]),
                })
            }
        }
        _ => Err(unknown_function(Namespace::Console, method)),
    }
}

fn math(method: &str, args: &[Value]) -> RuntimeResult<Value> {
    let name = format!("Math.{method}");
    match method {
        "abs" => {
            expect_args(&name, args, 1)?;
            match &args[0] {
                Value::Int(i) => Ok(Value::Int(i.wrapping_abs())),
                other => Ok(Value::Double(number(&name, other)?.abs())),
            }
        }
        "min" | "max" => {
            expect_args(&name, args, 2)?;
            if let (Value::Int(a), Value::Int(b)) = (&args[0], &args[1]) {
                let picked = if method == "min" { *a.min(b) } else { *a.max(b) };
                return Ok(Value::Int(picked));
            }
            let a = number(&name, &args[0])?;
            let b = number(&name, &args[1])?;
            Ok(Value::Double(if method == "min" { a.min(b) } else { a.max(b) }))
        }
        "floor" | "ceil" | "round" => {
            expect_args(&name, args, 1)?;
            let x = number(&name, &args[0])?;
            let rounded = match method {
                "floor" => x.floor(),
                "ceil" => x.ceil(),
                _ => x.round(),
            };
            Ok(Value::Int(rounded as i64))
        }
        "sqrt" | "sin" | "cos" => {
            expect_args(&name, args, 1)?;
            let x = number(&name, &args[0])?;
            let result = match method {
                "sqrt" => x.sqrt(),
                "sin" => x.sin(),
                _ => x.cos(),
            };
            Ok(Value::Double(result))
        }
        "pow" => {
            expect_args(&name, args, 2)?;
            let base = number(&name, &args[0])?;
            let exp = number(&name, &args[1])?;
            Ok(Value::Double(base.powf(exp)))
        }
        "range" => {
            expect_args(&name, args, 3)?;
            if let (Value::Int(v), Value::Int(lo), Value::Int(hi)) = (&args[0], &args[1], &args[2])
            {
                return Ok(Value::Int((*v).max(*lo).min(*hi)));
            }
            let v = number(&name, &args[0])?;
            let lo = number(&name, &args[1])?;
            let hi = number(&name, &args[2])?;
            Ok(Value::Double(v.max(lo).min(hi)))
        }
        _ => Err(unknown_function(Namespace::Math, method)),
    }
}

fn message(ctx: &BuiltinContext<'_>, method: &str, args: &[Value]) -> RuntimeResult<Value> {
    let name = format!("Message.{method}");
    expect_args(&name, args, 0)?;
    let illegal = || RuntimeError::IllegalCallContext {
        function: name.clone(),
    };
    if !ctx.callback.is_midi() {
        return Err(illegal());
    }
    let event = ctx.event.ok_or_else(illegal)?;
    let value = match (method, event) {
        ("getNoteNumber", MessageEvent::NoteOn { note, .. })
        | ("getNoteNumber", MessageEvent::NoteOff { note, .. }) => note,
        ("getVelocity", MessageEvent::NoteOn { velocity, .. })
        | ("getVelocity", MessageEvent::NoteOff { velocity, .. }) => velocity,
        ("getControllerNumber", MessageEvent::Controller { number, .. }) => number,
        ("getControllerValue", MessageEvent::Controller { value, .. }) => value,
        ("getNoteNumber" | "getVelocity" | "getControllerNumber" | "getControllerValue", _) => {
            return Err(illegal())
        }
        _ => return Err(unknown_function(Namespace::Message, method)),
    };
    Ok(Value::Int(value))
}

fn engine(ctx: &BuiltinContext<'_>, method: &str, args: &[Value]) -> RuntimeResult<Value> {
    let name = format!("Engine.{method}");
    match method {
        "getSampleRate" => {
            expect_args(&name, args, 0)?;
            Ok(Value::Double(ctx.host.audio.sample_rate))
        }
        "getBufferSize" => {
            expect_args(&name, args, 0)?;
            Ok(Value::Int(i64::from(ctx.host.audio.buffer_size)))
        }
        "getUptime" => {
            expect_args(&name, args, 0)?;
            Ok(Value::Double(ctx.host.uptime_origin.elapsed().as_secs_f64()))
        }
        "extendTimeOut" => {
            expect_args(&name, args, 1)?;
            let ms = number(&name, &args[0])?;
            if ms > 0.0 {
                ctx.deadline.extend_by(Duration::from_millis(ms as u64));
            }
            Ok(Value::Undefined)
        }
        _ => Err(unknown_function(Namespace::Engine, method)),
    }
}

fn number(name: &str, value: &Value) -> RuntimeResult<f64> {
    value.as_f64().ok_or_else(|| RuntimeError::TypeMismatch {
        message: format!("{name} expects a number, found {}", value.type_name()),
    })
}

fn expect_args(name: &str, args: &[Value], expected: usize) -> RuntimeResult<()> {
    if args.len() != expected {
        Err(RuntimeError::ArityMismatch {
            name: name.into(),
            expected,
            received: args.len(),
        })
    } else {
        Ok(())
    }
}

fn unknown_function(namespace: Namespace, method: &str) -> RuntimeError {
    RuntimeError::UnknownSymbol {
        name: format!("{}.{}", namespace.name(), method),
    }
}

fn unknown_member(base: &Value, field: &str) -> RuntimeError {
    RuntimeError::UnknownSymbol {
        name: format!("{}.{}", base, field),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::console::MemoryConsole;

    struct Fixture {
        console: MemoryConsole,
        repaint: AtomicBool,
        deadline: Deadline,
        globals: GlobalStore,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                console: MemoryConsole::new(),
                repaint: AtomicBool::new(false),
                deadline: Deadline::new(Duration::from_millis(100)),
                globals: GlobalStore::new(),
            }
        }

        fn with<R>(
            &self,
            callback: CallbackKind,
            event: Option<MessageEvent>,
            f: impl FnOnce(&BuiltinContext<'_>) -> R,
        ) -> R {
            let host = HostBindings {
                owner: "test",
                console: &self.console,
                audio: AudioSettings::default(),
                uptime_origin: Instant::now(),
                repaint: &self.repaint,
            };
            let ctx = BuiltinContext {
                host: &host,
                callback,
                event,
                deadline: &self.deadline,
                globals: &self.globals,
            };
            f(&ctx)
        }
    }

    #[test]
    fn message_calls_outside_midi_callbacks_are_illegal() {
        let fixture = Fixture::new();
        let err = fixture
            .with(CallbackKind::Timer, None, |ctx| {
                call_namespace(ctx, Namespace::Message, "getNoteNumber", &[])
            })
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Message.getNoteNumber: illegal call outside the right callback"
        );
    }

    #[test]
    fn message_reads_the_current_event() {
        let fixture = Fixture::new();
        let event = MessageEvent::NoteOn {
            note: 64,
            velocity: 90,
        };
        let note = fixture
            .with(CallbackKind::NoteOn, Some(event), |ctx| {
                call_namespace(ctx, Namespace::Message, "getNoteNumber", &[])
            })
            .unwrap();
        assert!(matches!(note, Value::Int(64)));
    }

    #[test]
    fn extend_timeout_moves_the_deadline() {
        let fixture = Fixture::new();
        fixture
            .with(CallbackKind::Init, None, |ctx| {
                call_namespace(ctx, Namespace::Engine, "extendTimeOut", &[Value::Int(400)])
            })
            .unwrap();
        assert_eq!(fixture.deadline.limit(), Duration::from_millis(500));
    }

    #[test]
    fn repaint_sets_the_pending_flag() {
        let fixture = Fixture::new();
        fixture
            .with(CallbackKind::Control, None, |ctx| {
                call_namespace(ctx, Namespace::Content, "repaint", &[])
            })
            .unwrap();
        assert!(fixture.repaint.load(Ordering::Acquire));
    }

    #[test]
    fn console_print_joins_arguments() {
        let fixture = Fixture::new();
        fixture
            .with(CallbackKind::Init, None, |ctx| {
                call_namespace(
                    ctx,
                    Namespace::Console,
                    "print",
                    &[Value::from("gain"), Value::Double(0.5)],
                )
            })
            .unwrap();
        assert_eq!(fixture.console.output(), vec!["gain 0.5".to_string()]);
    }

    #[test]
    fn array_methods_mutate_shared_storage() {
        let array = Value::array(vec![Value::Int(1)]);
        call_method(&array, "push", &[Value::Int(2), Value::Int(3)]).unwrap();
        let idx = call_method(&array, "indexOf", &[Value::Int(3)]).unwrap();
        assert!(matches!(idx, Value::Int(2)));
        let popped = call_method(&array, "pop", &[]).unwrap();
        assert!(matches!(popped, Value::Int(3)));
    }
}
