//! Compile-and-send.
//!
//! The engine does not compile Ruby itself. A [`Compiler`] turns source into
//! mruby bytecode and [`build_and_send`] pushes the result to the connected
//! device, reporting both timings.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::session::Session;
use crate::transfer::{FirmwareImage, Slot, TransferOutcome};

/// Outcome of one compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileResult {
    /// Bytecode was produced.
    Success {
        /// Compiled bytecode.
        bytecode: Vec<u8>,
        /// Time the compiler took.
        compile_time: Duration,
    },
    /// The compiler rejected the source.
    Failure {
        /// Compiler diagnostics.
        error: String,
        /// Time the compiler took.
        compile_time: Duration,
    },
}

impl CompileResult {
    /// Time the compiler took, successful or not.
    pub fn compile_time(&self) -> Duration {
        match self {
            Self::Success { compile_time, .. } | Self::Failure { compile_time, .. } => *compile_time,
        }
    }

    /// Bytecode length, when compilation succeeded.
    pub fn size(&self) -> Option<usize> {
        match self {
            Self::Success { bytecode, .. } => Some(bytecode.len()),
            Self::Failure { .. } => None,
        }
    }
}

/// Ruby to mruby bytecode compiler.
#[async_trait]
pub trait Compiler: Send + Sync {
    /// Compile `source`.
    async fn compile(&self, source: &str) -> CompileResult;
}

/// Timings and size of a build-and-send run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    /// Compiler time.
    pub compile_time: Duration,
    /// Transfer summary.
    pub transfer: TransferOutcome,
    /// Bytecode size.
    pub size: usize,
}

/// Compile `source` and send it to `slot` on the session's device.
///
/// The connection is checked before compiling so a missing device does not
/// cost a compile.
pub async fn build_and_send<F>(
    session: &Session,
    compiler: &dyn Compiler,
    source: &str,
    slot: Slot,
    progress: F,
) -> Result<BuildReport>
where
    F: FnMut(usize, usize) + Send,
{
    let events = session.events();
    if let Err(e) = session.mtu().await {
        events.status(e.status_line());
        return Err(e);
    }

    let (bytecode, compile_time) = match compiler.compile(source).await {
        CompileResult::Success {
            bytecode,
            compile_time,
        } => (bytecode, compile_time),
        CompileResult::Failure { error, .. } => {
            events.status(error.clone());
            return Err(Error::Compile(error));
        },
    };
    events.status(format!("mrbc success!: ({:.2}ms)", millis(compile_time)));

    let size = bytecode.len();
    let image = FirmwareImage::new(bytecode, slot)?;
    let started = Instant::now();
    let transfer = session.send_firmware(&image, progress).await?;
    events.status(format!(
        "Sending bytecode: Complete! ({:.2}ms)",
        millis(started.elapsed())
    ));

    Ok(BuildReport {
        compile_time,
        transfer,
        size,
    })
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SessionEvent;
    use crate::link::sim::{SimCentral, SimDevice};
    use crate::session::SessionConfig;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Pretends to compile by echoing the source bytes.
    #[derive(Default)]
    struct EchoCompiler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Compiler for EchoCompiler {
        async fn compile(&self, source: &str) -> CompileResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if source.contains("syntax error") {
                return CompileResult::Failure {
                    error: "temp.rb:1: syntax error".into(),
                    compile_time: Duration::from_millis(3),
                };
            }
            CompileResult::Success {
                bytecode: source.as_bytes().to_vec(),
                compile_time: Duration::from_millis(5),
            }
        }
    }

    fn session() -> (Session, Arc<SimDevice>) {
        let (central, device) = SimCentral::with_default_device();
        (Session::spawn(Arc::new(central), SessionConfig::default()), device)
    }

    #[test]
    fn test_compile_result_accessors() {
        let ok = CompileResult::Success {
            bytecode: vec![0; 12],
            compile_time: Duration::from_millis(4),
        };
        assert_eq!(ok.size(), Some(12));
        assert_eq!(ok.compile_time(), Duration::from_millis(4));

        let failed = CompileResult::Failure {
            error: "bad".into(),
            compile_time: Duration::from_millis(1),
        };
        assert_eq!(failed.size(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_connected_skips_compile() {
        let (session, _device) = session();
        let compiler = EchoCompiler::default();

        let err = build_and_send(&session, &compiler, "puts 1", Slot::Two, |_, _| {})
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NotConnected));
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compile_failure_sends_nothing() {
        let (session, device) = session();
        session.connect().await.unwrap();
        let mut rx = session.subscribe();

        let err = build_and_send(
            &session,
            &EchoCompiler::default(),
            "syntax error here",
            Slot::Two,
            |_, _| {},
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Compile(_)));
        assert!(device.frames().is_empty());
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::Status("temp.rb:1: syntax error".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_and_send_reports_metrics() {
        let (session, device) = session();
        session.connect().await.unwrap();

        let report = build_and_send(
            &session,
            &EchoCompiler::default(),
            "3.times { |i| puts i }",
            Slot::One,
            |_, _| {},
        )
        .await
        .unwrap();

        assert_eq!(report.size, 22);
        assert_eq!(report.compile_time, Duration::from_millis(5));
        assert_eq!(report.transfer.slot, Slot::One);
        assert_eq!(device.slot(1).as_deref(), Some(&b"3.times { |i| puts i }"[..]));
    }
}
