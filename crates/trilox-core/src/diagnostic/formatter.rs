//! Color-aware diagnostic output
//!
//! Respects the `NO_COLOR` environment variable and auto-detects terminal
//! capabilities via `termcolor`; falls back to plain text otherwise.

use super::{Diagnostic, TraceFrame};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Always,
    Never,
    Auto,
}

impl ColorMode {
    fn to_color_choice(self) -> ColorChoice {
        if std::env::var("NO_COLOR").is_ok() {
            return ColorChoice::Never;
        }
        match self {
            ColorMode::Always => ColorChoice::Always,
            ColorMode::Never => ColorChoice::Never,
            ColorMode::Auto => ColorChoice::Auto,
        }
    }
}

pub struct DiagnosticFormatter {
    color_mode: ColorMode,
}

impl DiagnosticFormatter {
    pub fn new(color_mode: ColorMode) -> Self {
        Self { color_mode }
    }

    pub fn auto() -> Self {
        Self::new(ColorMode::Auto)
    }

    pub fn plain() -> Self {
        Self::new(ColorMode::Never)
    }

    /// Print every aggregated compile error, one per line, to stderr.
    pub fn emit_compile_errors(&self, diagnostics: &[Diagnostic]) {
        let mut stream = StandardStream::stderr(self.color_mode.to_color_choice());
        for diag in diagnostics {
            let _ = self.write_diagnostic(&mut stream, diag);
        }
    }

    /// Print a runtime error followed by its unwound call-frame trace.
    pub fn emit_runtime_error(&self, message: &str, trace: &[TraceFrame]) {
        let mut stream = StandardStream::stderr(self.color_mode.to_color_choice());
        let mut spec = ColorSpec::new();
        spec.set_fg(Some(Color::Red)).set_bold(true);
        let _ = stream.set_color(&spec);
        let _ = write!(stream, "error");
        let _ = stream.reset();
        let _ = writeln!(stream, ": {message}");
        for frame in trace {
            let _ = writeln!(stream, "  {frame}");
        }
    }

    fn write_diagnostic(
        &self,
        w: &mut impl WriteColor,
        diag: &Diagnostic,
    ) -> std::io::Result<()> {
        let mut spec = ColorSpec::new();
        spec.set_fg(Some(Color::Red)).set_bold(true);
        w.set_color(&spec)?;
        write!(w, "error")?;
        w.reset()?;
        writeln!(w, ": [line {}] {}", diag.line, diag.message)
    }
}
