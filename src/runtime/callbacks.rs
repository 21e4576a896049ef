use crate::config::AudioSettings;
use crate::language::ast::FunctionDef;
use crate::runtime::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Callback `{name}` is already defined")]
    Duplicate { name: String },
    #[error("Callback `{name}` takes {expected} parameters, found {found}")]
    Arity {
        name: String,
        expected: usize,
        found: usize,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    Init,
    NoteOn,
    NoteOff,
    Controller,
    Timer,
    AllNotesOff,
    Control,
}

impl CallbackKind {
    pub const ALL: [CallbackKind; 7] = [
        CallbackKind::Init,
        CallbackKind::NoteOn,
        CallbackKind::NoteOff,
        CallbackKind::Controller,
        CallbackKind::Timer,
        CallbackKind::AllNotesOff,
        CallbackKind::Control,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CallbackKind::Init => "onInit",
            CallbackKind::NoteOn => "onNoteOn",
            CallbackKind::NoteOff => "onNoteOff",
            CallbackKind::Controller => "onController",
            CallbackKind::Timer => "onTimer",
            CallbackKind::AllNotesOff => "onAllNotesOff",
            CallbackKind::Control => "onControl",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn arity(self) -> usize {
        match self {
            CallbackKind::Init | CallbackKind::Timer | CallbackKind::AllNotesOff => 0,
            CallbackKind::NoteOn
            | CallbackKind::NoteOff
            | CallbackKind::Controller
            | CallbackKind::Control => 2,
        }
    }

    pub fn is_midi(self) -> bool {
        matches!(
            self,
            CallbackKind::NoteOn | CallbackKind::NoteOff | CallbackKind::Controller
        )
    }

    /// Expected run time used for overrun warnings. Callbacks tied to the audio
    /// clock get one buffer, the rest get the configured maximum.
    pub fn typical_budget(self, audio: &AudioSettings, max_execution: Duration) -> Duration {
        match self {
            CallbackKind::NoteOn
            | CallbackKind::NoteOff
            | CallbackKind::Controller
            | CallbackKind::Timer
            | CallbackKind::AllNotesOff => audio.buffer_duration(),
            CallbackKind::Init | CallbackKind::Control => max_execution,
        }
    }
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The MIDI event a callback is reacting to, exposed through `Message.*`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageEvent {
    NoteOn { note: i64, velocity: i64 },
    NoteOff { note: i64, velocity: i64 },
    Controller { number: i64, value: i64 },
}

impl MessageEvent {
    pub const PITCH_BEND: i64 = 128;
    pub const AFTERTOUCH: i64 = 129;

    pub fn pitch_bend(value: i64) -> Self {
        MessageEvent::Controller {
            number: Self::PITCH_BEND,
            value,
        }
    }

    pub fn aftertouch(value: i64) -> Self {
        MessageEvent::Controller {
            number: Self::AFTERTOUCH,
            value,
        }
    }

    pub fn callback(&self) -> CallbackKind {
        match self {
            MessageEvent::NoteOn { .. } => CallbackKind::NoteOn,
            MessageEvent::NoteOff { .. } => CallbackKind::NoteOff,
            MessageEvent::Controller { .. } => CallbackKind::Controller,
        }
    }

    pub fn arguments(&self) -> [Value; 2] {
        match *self {
            MessageEvent::NoteOn { note, velocity } | MessageEvent::NoteOff { note, velocity } => {
                [Value::Int(note), Value::Int(velocity)]
            }
            MessageEvent::Controller { number, value } => [Value::Int(number), Value::Int(value)],
        }
    }
}

#[derive(Clone, Debug)]
pub struct Callback {
    pub kind: CallbackKind,
    pub function: Option<Arc<FunctionDef>>,
    pub budget: Duration,
    args: Vec<Value>,
}

impl Callback {
    fn new(kind: CallbackKind, function: Option<Arc<FunctionDef>>, budget: Duration) -> Self {
        Self {
            kind,
            function,
            budget,
            args: Vec::with_capacity(kind.arity()),
        }
    }

    /// Rebinds the parameter values, reusing the existing allocation.
    pub fn bind(&mut self, args: &[Value]) -> &[Value] {
        self.args.clear();
        self.args.extend_from_slice(args);
        self.args
            .resize(self.kind.arity().max(args.len()), Value::Undefined);
        &self.args
    }

    pub fn bound_args(&self) -> &[Value] {
        &self.args
    }
}

#[derive(Clone, Debug, Default)]
pub struct CallbackRegistry {
    callbacks: HashMap<CallbackKind, Callback>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: CallbackKind,
        function: Option<Arc<FunctionDef>>,
        budget: Duration,
    ) -> Result<(), RegistryError> {
        if self.callbacks.contains_key(&kind) {
            return Err(RegistryError::Duplicate {
                name: kind.name().to_string(),
            });
        }
        if let Some(def) = &function {
            if def.params.len() != kind.arity() {
                return Err(RegistryError::Arity {
                    name: kind.name().to_string(),
                    expected: kind.arity(),
                    found: def.params.len(),
                });
            }
        }
        self.callbacks
            .insert(kind, Callback::new(kind, function, budget));
        Ok(())
    }

    pub fn get(&self, kind: CallbackKind) -> Option<&Callback> {
        self.callbacks.get(&kind)
    }

    pub fn get_mut(&mut self, kind: CallbackKind) -> Option<&mut Callback> {
        self.callbacks.get_mut(&kind)
    }

    pub fn contains(&self, kind: CallbackKind) -> bool {
        self.callbacks.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::{
        ast::Block,
        span::{Location, Span},
    };

    fn def(name: &str, params: &[&str]) -> Arc<FunctionDef> {
        Arc::new(FunctionDef {
            name: name.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            body: Block {
                statements: Vec::new(),
                span: Span::default(),
            },
            location: Location::default(),
        })
    }

    #[test]
    fn names_round_trip() {
        for kind in CallbackKind::ALL {
            assert_eq!(CallbackKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(CallbackKind::from_name("onSomething"), None);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = CallbackRegistry::new();
        registry
            .register(CallbackKind::Timer, Some(def("onTimer", &[])), Duration::ZERO)
            .unwrap();
        let err = registry
            .register(CallbackKind::Timer, Some(def("onTimer", &[])), Duration::ZERO)
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::Duplicate {
                name: "onTimer".into()
            }
        );
    }

    #[test]
    fn arity_is_checked_at_registration() {
        let mut registry = CallbackRegistry::new();
        let err = registry
            .register(
                CallbackKind::NoteOn,
                Some(def("onNoteOn", &["note"])),
                Duration::ZERO,
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::Arity { expected: 2, found: 1, .. }));
    }

    #[test]
    fn midi_budget_is_one_buffer() {
        let audio = AudioSettings {
            sample_rate: 44_100.0,
            buffer_size: 441,
        };
        let budget = CallbackKind::NoteOn.typical_budget(&audio, Duration::from_millis(500));
        assert_eq!(budget, Duration::from_millis(10));
        let init = CallbackKind::Init.typical_budget(&audio, Duration::from_millis(500));
        assert_eq!(init, Duration::from_millis(500));
    }

    #[test]
    fn binding_reuses_parameter_storage() {
        let mut registry = CallbackRegistry::new();
        registry
            .register(
                CallbackKind::NoteOn,
                Some(def("onNoteOn", &["n", "v"])),
                Duration::ZERO,
            )
            .unwrap();
        let callback = registry.get_mut(CallbackKind::NoteOn).unwrap();
        callback.bind(&[Value::Int(60), Value::Int(100)]);
        let before = callback.bound_args().as_ptr();
        callback.bind(&[Value::Int(61), Value::Int(90)]);
        assert_eq!(callback.bound_args().as_ptr(), before);
        assert!(matches!(callback.bound_args()[0], Value::Int(61)));
    }
}
