//! Breakpoints, call stack entries and the snapshot handed to a debugger view.

use crate::language::span::Location;
use crate::runtime::value::Value;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq)]
pub struct CallStackEntry {
    pub function: String,
    pub location: Location,
    pub owner: String,
}

impl fmt::Display for CallStackEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}() at line {}, column {} ({})",
            self.function, self.location.line, self.location.column, self.owner
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Breakpoint {
    pub index: usize,
    pub line: u32,
    pub column: Option<u32>,
    /// Restricts the breakpoint to one callback; `None` matches every callback.
    pub callback: Option<String>,
    pub external_file: Option<PathBuf>,
}

impl Breakpoint {
    fn matches(&self, callback: &str, file: Option<&Path>, location: &Location) -> bool {
        if self.line != location.line {
            return false;
        }
        if self.column.is_some_and(|column| column != location.column) {
            return false;
        }
        if self
            .callback
            .as_deref()
            .is_some_and(|expected| expected != callback)
        {
            return false;
        }
        self.external_file.as_deref() == file
    }
}

#[derive(Clone, Debug, Default)]
pub struct BreakpointSet {
    breakpoints: Vec<Breakpoint>,
}

impl BreakpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a breakpoint on `line` and returns its index.
    pub fn add_line(&mut self, line: u32) -> usize {
        self.add(line, None, None, None)
    }

    pub fn add(
        &mut self,
        line: u32,
        column: Option<u32>,
        callback: Option<String>,
        external_file: Option<PathBuf>,
    ) -> usize {
        let index = self.breakpoints.len();
        self.breakpoints.push(Breakpoint {
            index,
            line,
            column,
            callback,
            external_file,
        });
        index
    }

    pub fn remove_line(&mut self, line: u32) {
        self.breakpoints.retain(|bp| bp.line != line);
    }

    pub fn clear(&mut self) {
        self.breakpoints.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.iter()
    }

    pub fn find(
        &self,
        callback: &str,
        file: Option<&Path>,
        location: &Location,
    ) -> Option<&Breakpoint> {
        self.breakpoints
            .iter()
            .find(|bp| bp.matches(callback, file, location))
    }
}

/// State captured when execution halts on a breakpoint.
#[derive(Clone, Debug)]
pub struct BreakpointHit {
    pub index: usize,
    pub location: Location,
    pub callback: String,
    pub external_file: Option<PathBuf>,
    /// Variables of the innermost frame, innermost block first.
    pub locals: Vec<(String, Value)>,
    pub call_stack: Vec<CallStackEntry>,
}

impl BreakpointHit {
    pub fn line(&self) -> u32 {
        self.location.line
    }

    pub fn column(&self) -> u32 {
        self.location.column
    }

    pub fn offset(&self) -> usize {
        self.location.offset()
    }

    pub fn local(&self, name: &str) -> Option<&Value> {
        self.locals
            .iter()
            .find(|(local, _)| local == name)
            .map(|(_, value)| value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::span::Span;

    fn at(line: u32, column: u32) -> Location {
        Location {
            span: Span::new(0, 1),
            line,
            column,
        }
    }

    #[test]
    fn callback_filter_limits_matches() {
        let mut set = BreakpointSet::new();
        set.add(3, None, Some("onNoteOn".into()), None);
        assert!(set.find("onNoteOn", None, &at(3, 5)).is_some());
        assert!(set.find("onTimer", None, &at(3, 5)).is_none());
    }

    #[test]
    fn external_file_breakpoints_ignore_main_script() {
        let mut set = BreakpointSet::new();
        set.add(1, Some(1), None, Some(PathBuf::from("lib.js")));
        assert!(set.find("onInit", None, &at(1, 1)).is_none());
        assert!(set
            .find("onInit", Some(Path::new("lib.js")), &at(1, 1))
            .is_some());
    }
}
