use crate::{
    config::ConfigError,
    language::errors::{SyntaxError, SyntaxErrors},
    runtime::error::ScriptError,
};
use miette::{Diagnostic, NamedSource, Report, SourceSpan};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic, Clone)]
#[error("{message}")]
#[diagnostic(code(rtscript::syntax))]
pub struct SyntaxDiagnostic {
    #[source_code]
    src: NamedSource<String>,
    #[label("here")]
    span: SourceSpan,
    #[help]
    help: Option<String>,
    message: String,
}

impl SyntaxDiagnostic {
    pub fn from_error(src: NamedSource<String>, err: &SyntaxError) -> Self {
        Self {
            src,
            span: err.to_source_span(),
            help: err.help.clone(),
            message: err.message.clone(),
        }
    }
}

/// A [`ScriptError`] paired with the text it points into.
#[derive(Debug, Error, Diagnostic)]
#[error("{error}")]
pub struct ScriptDiagnostic {
    #[source_code]
    src: NamedSource<String>,
    #[label("{label}")]
    span: Option<SourceSpan>,
    label: String,
    #[help]
    help: Option<String>,
    error: ScriptError,
}

impl ScriptDiagnostic {
    pub fn new(name: &str, source: &str, error: ScriptError) -> Self {
        let span = error.offset().map(|offset| {
            let start = offset.min(source.len());
            let len = usize::from(start < source.len());
            SourceSpan::from((start, len))
        });
        let label = match &error.callback {
            Some(callback) => format!("in {callback}"),
            None => "here".to_string(),
        };
        let help = (!error.call_stack.is_empty()).then(|| {
            error
                .call_stack
                .iter()
                .rev()
                .map(|entry| format!("called from {entry}"))
                .collect::<Vec<_>>()
                .join("\n")
        });
        Self {
            src: NamedSource::new(name, source.to_string()),
            span,
            label,
            help,
            error,
        }
    }
}

pub fn render_syntax_errors(name: &str, source: &str, errors: &SyntaxErrors) -> Vec<String> {
    let src = NamedSource::new(name, source.to_string());
    errors
        .errors
        .iter()
        .map(|err| format!("{:?}", Report::new(SyntaxDiagnostic::from_error(src.clone(), err))))
        .collect()
}

pub fn emit_syntax_errors(name: &str, source: &str, errors: &SyntaxErrors) {
    for rendered in render_syntax_errors(name, source, errors) {
        eprintln!("{rendered}");
    }
}

pub fn render_script_error(name: &str, source: &str, error: &ScriptError) -> String {
    format!("{:?}", Report::new(ScriptDiagnostic::new(name, source, error.clone())))
}

pub fn report_script_error(name: &str, source: &str, error: &ScriptError) {
    eprintln!("{}", render_script_error(name, source, error));
}

pub fn report_config_error(error: &ConfigError) {
    eprintln!("Configuration error: {error}");
}
