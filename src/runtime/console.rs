use log::{error, info};
use parking_lot::Mutex;

/// Destination for script output and callback errors.
pub trait ConsoleSink: Send + Sync {
    fn print(&self, owner: &str, message: &str);
    fn error(&self, owner: &str, message: &str);
}

/// Forwards script output to the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogConsole;

impl ConsoleSink for LogConsole {
    fn print(&self, owner: &str, message: &str) {
        info!(target: "rtscript::console", "{owner}: {message}");
    }

    fn error(&self, owner: &str, message: &str) {
        error!(target: "rtscript::console", "{owner}: {message}");
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsoleLevel {
    Output,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsoleLine {
    pub level: ConsoleLevel,
    pub owner: String,
    pub text: String,
}

/// Collects lines in memory.
#[derive(Debug, Default)]
pub struct MemoryConsole {
    lines: Mutex<Vec<ConsoleLine>>,
}

impl MemoryConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<ConsoleLine> {
        self.lines.lock().clone()
    }

    pub fn output(&self) -> Vec<String> {
        self.filtered(ConsoleLevel::Output)
    }

    pub fn errors(&self) -> Vec<String> {
        self.filtered(ConsoleLevel::Error)
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }

    fn filtered(&self, level: ConsoleLevel) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|line| line.level == level)
            .map(|line| line.text.clone())
            .collect()
    }

    fn push(&self, level: ConsoleLevel, owner: &str, text: &str) {
        self.lines.lock().push(ConsoleLine {
            level,
            owner: owner.to_string(),
            text: text.to_string(),
        });
    }
}

impl ConsoleSink for MemoryConsole {
    fn print(&self, owner: &str, message: &str) {
        self.push(ConsoleLevel::Output, owner, message);
    }

    fn error(&self, owner: &str, message: &str) {
        self.push(ConsoleLevel::Error, owner, message);
    }
}
