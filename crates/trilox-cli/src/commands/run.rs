//! Run command - execute Trilox source files

use anyhow::{Context, Result};
use std::fs;
use trilox_core::diagnostic::formatter::DiagnosticFormatter;
use trilox_core::{InterpretResult, Vm, VmConfig};

/// Run a Trilox source file.
///
/// Compiles and executes the source file, streaming `disp` output to
/// stdout. Compile errors and an unwound runtime trace print to stderr.
pub fn run(file_path: &str, config_path: Option<&str>) -> Result<()> {
    let source = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read source file: {file_path}"))?;

    let config = load_config(config_path)?;
    let mut vm = Vm::new(config);
    let formatter = DiagnosticFormatter::auto();

    match vm.interpret(&source) {
        InterpretResult::Ok => Ok(()),
        InterpretResult::CompileError(diagnostics) => {
            formatter.emit_compile_errors(&diagnostics);
            Err(anyhow::anyhow!("Failed to compile {file_path}"))
        }
        InterpretResult::RuntimeError { message, trace } => {
            formatter.emit_runtime_error(&message, &trace);
            Err(anyhow::anyhow!("Failed to execute {file_path}"))
        }
    }
}

fn load_config(config_path: Option<&str>) -> Result<VmConfig> {
    let Some(path) = config_path else {
        return Ok(VmConfig::default());
    };
    let source = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {path}"))?;
    VmConfig::from_toml(&source).with_context(|| format!("Failed to parse config file: {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_run_simple_program() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "var x = 1 + 2; disp(x)").unwrap();

        let result = run(temp_file.path().to_str().unwrap(), None);
        assert!(result.is_ok());
    }

    #[test]
    fn test_run_missing_file() {
        let result = run("nonexistent.trx", None);
        assert!(result.is_err());
    }

    #[test]
    fn test_run_compile_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "var x = ").unwrap();

        let result = run(temp_file.path().to_str().unwrap(), None);
        assert!(result.is_err());
    }

    #[test]
    fn test_run_unknown_config_is_an_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "disp(1)").unwrap();

        let result = run(temp_file.path().to_str().unwrap(), Some("nonexistent.toml"));
        assert!(result.is_err());
    }
}
