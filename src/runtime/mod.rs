pub mod builtins;
pub mod callbacks;
pub mod console;
pub mod deadline;
pub mod debugger;
pub mod environment;
pub mod error;
pub mod globals;
pub mod interpreter;
pub mod processor;
pub mod registers;
pub mod value;

pub use callbacks::{CallbackKind, MessageEvent};
pub use error::{ErrorKind, ScriptError};
pub use interpreter::Interpreter;
pub use processor::{CallbackFailure, ScriptProcessor};
pub use value::Value;
