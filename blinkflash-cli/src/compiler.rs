//! `mrbc`-backed compiler.
//!
//! The source is written to a scratch directory, compiled with
//! `mrbc -o program.mrb program.rb` and the bytecode read back.

use async_trait::async_trait;
use blinkflash::{CompileResult, Compiler};
use log::debug;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::time::Instant;

const SOURCE_NAME: &str = "program.rb";
const OUTPUT_NAME: &str = "program.mrb";

/// Runs the external mruby compiler.
#[derive(Debug, Clone)]
pub(crate) struct MrbcCompiler {
    program: PathBuf,
}

impl MrbcCompiler {
    pub(crate) fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, dir: &Path, source: &str) -> Result<Vec<u8>, String> {
        let input = dir.join(SOURCE_NAME);
        let output = dir.join(OUTPUT_NAME);
        tokio::fs::write(&input, source)
            .await
            .map_err(|e| format!("Failed to write source: {e}"))?;

        debug!("Running {} -o {}", self.program.display(), output.display());
        let result = Command::new(&self.program)
            .arg("-o")
            .arg(&output)
            .arg(&input)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("Failed to run {}: {e}", self.program.display()))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr).trim().to_string();
            return Err(if stderr.is_empty() {
                match result.status.code() {
                    Some(code) => format!("mrbc failed with exit code: {code}"),
                    None => "mrbc terminated by signal".to_string(),
                }
            } else {
                stderr
            });
        }

        tokio::fs::read(&output)
            .await
            .map_err(|e| format!("mrbc produced no bytecode: {e}"))
    }
}

#[async_trait]
impl Compiler for MrbcCompiler {
    async fn compile(&self, source: &str) -> CompileResult {
        let started = Instant::now();
        let result = match tempfile::tempdir() {
            Ok(dir) => self.run(dir.path(), source).await,
            Err(e) => Err(format!("Failed to create scratch directory: {e}")),
        };
        let compile_time = started.elapsed();
        match result {
            Ok(bytecode) => CompileResult::Success {
                bytecode,
                compile_time,
            },
            Err(error) => CompileResult::Failure {
                error,
                compile_time,
            },
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Write an executable shell script standing in for mrbc.
    fn fake_mrbc(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("mrbc");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn test_compile_success_reads_output() {
        let dir = tempfile::tempdir().unwrap();
        // $2 is the output path, $3 the source.
        let mrbc = fake_mrbc(dir.path(), r#"printf 'RITE' > "$2"; cat "$3" >> "$2""#);

        let result = MrbcCompiler::new(mrbc).compile("puts 1").await;
        match result {
            CompileResult::Success { bytecode, .. } => assert_eq!(bytecode, b"RITEputs 1"),
            CompileResult::Failure { error, .. } => panic!("unexpected failure: {error}"),
        }
    }

    #[tokio::test]
    async fn test_compile_failure_uses_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let mrbc = fake_mrbc(dir.path(), "echo 'syntax error, line 1' >&2; exit 1");

        let result = MrbcCompiler::new(mrbc).compile("def").await;
        assert_eq!(
            result,
            CompileResult::Failure {
                error: "syntax error, line 1".to_string(),
                compile_time: result.compile_time(),
            }
        );
    }

    #[tokio::test]
    async fn test_compile_failure_without_stderr_reports_code() {
        let dir = tempfile::tempdir().unwrap();
        let mrbc = fake_mrbc(dir.path(), "exit 3");

        let result = MrbcCompiler::new(mrbc).compile("").await;
        match result {
            CompileResult::Failure { error, .. } => {
                assert_eq!(error, "mrbc failed with exit code: 3");
            },
            CompileResult::Success { .. } => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_compile_missing_program() {
        let result = MrbcCompiler::new("/nonexistent/bin/mrbc")
            .compile("puts 1")
            .await;
        assert!(result.size().is_none());
    }
}
