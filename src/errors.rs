// File: src/errors.rs
//
// Error handling and reporting for the Alto language.
// Provides structured error types with source location information
// and pretty-printed error messages.

use colored::Colorize;
use std::fmt;

/// Source location information for tracking where code appears in a file
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub row: usize,
    pub column: usize,
    pub file: Option<String>,
}

impl SourceLocation {
    pub fn new(row: usize, column: usize) -> Self {
        Self { row, column, file: None }
    }

    pub fn with_file(row: usize, column: usize, file: String) -> Self {
        Self { row, column, file: Some(file) }
    }

    pub fn unknown() -> Self {
        Self { row: 0, column: 0, file: None }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(ref file) = self.file {
            write!(f, "{}:{}:{}", file, self.row, self.column)
        } else {
            write!(f, "{}:{}", self.row, self.column)
        }
    }
}

/// Types of errors that can occur in Alto
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unrecognized character in the source text
    LexError,
    /// Unexpected token, missing token, or disallowed construct
    ParseError,
    /// Identifier that does not resolve to any visible declaration
    ResolveError,
    /// Import still unsatisfied after the resolving callback ran
    ImportUnresolved,
    /// Internal invariant violation; not producible from emitter output
    RuntimeFault,
    /// User exception that escaped the top-level run
    UnhandledException,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::LexError => write!(f, "Lex Error"),
            ErrorKind::ParseError => write!(f, "Parse Error"),
            ErrorKind::ResolveError => write!(f, "Resolve Error"),
            ErrorKind::ImportUnresolved => write!(f, "Unresolved Import"),
            ErrorKind::RuntimeFault => write!(f, "Runtime Fault"),
            ErrorKind::UnhandledException => write!(f, "Unhandled Exception"),
        }
    }
}

/// A structured error with location information
#[derive(Debug, Clone)]
pub struct AltoError {
    pub kind: ErrorKind,
    pub message: String,
    pub location: SourceLocation,
    pub source_line: Option<String>,
    pub trace: Option<String>,
}

impl AltoError {
    pub fn new(kind: ErrorKind, message: String, location: SourceLocation) -> Self {
        Self { kind, message, location, source_line: None, trace: None }
    }

    pub fn with_source(mut self, source_line: String) -> Self {
        self.source_line = Some(source_line);
        self
    }

    pub fn with_trace(mut self, trace: String) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Create a lex error
    pub fn lex_error(message: String, location: SourceLocation) -> Self {
        Self::new(ErrorKind::LexError, message, location)
    }

    /// Create a parse error
    pub fn parse_error(message: String, location: SourceLocation) -> Self {
        Self::new(ErrorKind::ParseError, message, location)
    }

    /// Create a resolve error
    pub fn resolve_error(message: String, location: SourceLocation) -> Self {
        Self::new(ErrorKind::ResolveError, message, location)
    }

    /// Create an internal fault; these indicate malformed bytecode rather
    /// than a user mistake
    pub fn fault(message: String) -> Self {
        Self::new(ErrorKind::RuntimeFault, message, SourceLocation::unknown())
    }
}

impl fmt::Display for AltoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Error header with kind and message
        let kind_str = format!("{}", self.kind);
        writeln!(f, "{}: {}", kind_str.red().bold(), self.message.bold())?;

        // Location arrow
        if self.location.row > 0 {
            let location_str = format!("  --> {}", self.location);
            writeln!(f, "{}", location_str.bright_blue())?;
        }

        // Source code context with a caret under the column
        if let Some(ref source) = self.source_line {
            let row = self.location.row;
            let column = self.location.column;

            writeln!(f, "   {}", "|".bright_blue())?;
            writeln!(f, "{} {} {}", format!("{:3}", row).bright_blue(), "|".bright_blue(), source)?;
            writeln!(
                f,
                "   {} {}{}",
                "|".bright_blue(),
                " ".repeat(column.saturating_sub(1)),
                "^".red().bold()
            )?;
            writeln!(f, "   {}", "|".bright_blue())?;
        }

        if let Some(ref trace) = self.trace {
            for line in trace.lines() {
                writeln!(f, "{}", line.bright_black())?;
            }
        }

        Ok(())
    }
}

impl std::error::Error for AltoError {}
