//! Command implementations.
//!
//! Each subcommand is implemented in its own module. They share a
//! [`Context`]: the session, the loaded configuration and the Ctrl+C token.

pub(crate) mod completions;
pub(crate) mod console;
pub(crate) mod control;
pub(crate) mod scan;
pub(crate) mod send;

use anyhow::{Context as _, Result};
use blinkflash::link::sim::SimCentral;
use blinkflash::{
    Central, ConnectOutcome, DeviceInfo, Session, SessionEvent, Slot, clean_console_text,
    prefix_lines,
};
use ::console::style;
use dialoguer::{Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use std::future::Future;
use std::io::{IsTerminal, Write as _};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::{Cli, CliError, use_fancy_output};

/// Status lines emitted once per Data frame; logged, not printed.
const CHUNK_STATUS_PREFIX: &str = "Send [D]ata Ok";

/// What the event printer shows on stdout.
#[derive(Debug, Default)]
struct ConsoleView {
    enabled: AtomicBool,
    timestamp: AtomicBool,
}

/// Shared state for one CLI invocation.
pub(crate) struct Context {
    pub(crate) quiet: bool,
    non_interactive: bool,
    device: Option<String>,
    pub(crate) config: Config,
    pub(crate) session: Session,
    pub(crate) interrupt: CancellationToken,
    view: Arc<ConsoleView>,
    printer: JoinHandle<()>,
    printer_stop: CancellationToken,
}

impl Context {
    pub(crate) async fn new(cli: &Cli, config: Config) -> Result<Self> {
        let session_config = config.session_config()?;
        let central = open_central(cli).await?;
        let session = Session::spawn(central, session_config);

        let interrupt = CancellationToken::new();
        let on_signal = interrupt.clone();
        if let Err(e) = ctrlc::set_handler(move || on_signal.cancel()) {
            warn!("Failed to install Ctrl+C handler: {e}");
        }

        let view = Arc::new(ConsoleView::default());
        let printer_stop = CancellationToken::new();
        let printer = tokio::spawn(print_events(
            session.subscribe(),
            view.clone(),
            cli.quiet,
            printer_stop.clone(),
        ));

        Ok(Self {
            quiet: cli.quiet,
            non_interactive: cli.non_interactive,
            device: cli.device.clone().or_else(|| config.device.name.clone()),
            config,
            session,
            interrupt,
            view,
            printer,
            printer_stop,
        })
    }

    /// Stop the session and flush the event printer.
    pub(crate) async fn close(self) {
        self.session.shutdown().await;
        self.printer_stop.cancel();
        let _ = self.printer.await;
    }

    /// Run `fut` unless Ctrl+C arrives first.
    pub(crate) async fn interruptible<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = blinkflash::Result<T>>,
    {
        tokio::select! {
            result = fut => Ok(result?),
            () = self.interrupt.cancelled() => {
                Err(CliError::Cancelled("Interrupted".to_string()).into())
            }
        }
    }

    /// Resolve the slot from the flag, the config file, then the default.
    pub(crate) fn slot(&self, flag: Option<u8>) -> Result<Slot> {
        if let Some(n) = flag {
            return Ok(Slot::try_from(n)?);
        }
        Ok(self.config.slot()?.unwrap_or_default())
    }

    /// Start printing device console text to stdout.
    pub(crate) fn show_console(&self, timestamp: bool) {
        self.view.timestamp.store(timestamp, Ordering::Relaxed);
        self.view.enabled.store(true, Ordering::Relaxed);
    }

    /// Scan, pick a device and connect to it.
    pub(crate) async fn connect(&self) -> Result<DeviceInfo> {
        let device = self.pick_device().await?;
        match self
            .interruptible(self.session.connect_to(device.clone()))
            .await
            .with_context(|| format!("Failed to connect to {}", device.name))?
        {
            ConnectOutcome::Connected { device, mtu } => {
                if !self.quiet {
                    eprintln!(
                        "{} Connected to {} (MTU {}, {})",
                        style("✓").green(),
                        style(&device.name).cyan(),
                        mtu.value,
                        mtu.source
                    );
                }
                Ok(device)
            },
            ConnectOutcome::AlreadyConnected | ConnectOutcome::AlreadyConnecting => Ok(device),
        }
    }

    async fn pick_device(&self) -> Result<DeviceInfo> {
        if !self.quiet {
            eprintln!("{} Scanning for devices...", style("⏳").yellow());
        }
        let mut found = self.interruptible(self.session.scan()).await?;
        debug!("Scan returned {} device(s)", found.len());

        if let Some(name) = &self.device {
            return found
                .into_iter()
                .find(|d| &d.name == name)
                .ok_or(blinkflash::Error::DeviceNotFound)
                .with_context(|| format!("No device named '{name}' in range"));
        }

        match found.len() {
            0 => Err(blinkflash::Error::DeviceNotFound.into()),
            1 => Ok(found.remove(0)),
            _ if self.non_interactive => Err(CliError::Usage(
                "Multiple devices found; pass --device NAME in non-interactive mode".to_string(),
            )
            .into()),
            _ => select_device(found),
        }
    }

    /// Progress bar for a transfer of `total` bytes.
    pub(crate) fn progress_bar(&self, total: usize) -> ProgressBar {
        if self.quiet || !use_fancy_output() {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total as u64);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    }
}

async fn open_central(cli: &Cli) -> Result<Arc<dyn Central>> {
    if cli.sim {
        let (central, _device) = SimCentral::with_default_device();
        return Ok(Arc::new(central));
    }

    #[cfg(feature = "ble")]
    {
        let central = blinkflash::link::ble::BleCentral::new()
            .await
            .context("Failed to open Bluetooth adapter")?;
        Ok(Arc::new(central))
    }

    #[cfg(not(feature = "ble"))]
    {
        Err(CliError::Usage(
            "This build has no Bluetooth support; rebuild with `--features ble` or pass --sim"
                .to_string(),
        )
        .into())
    }
}

fn select_device(found: Vec<DeviceInfo>) -> Result<DeviceInfo> {
    if !(std::io::stdin().is_terminal() && std::io::stderr().is_terminal()) {
        return Err(CliError::Usage(
            "Interactive device selection requires a terminal; pass --device NAME".to_string(),
        )
        .into());
    }

    let items: Vec<String> = found.iter().map(ToString::to_string).collect();
    let choice = tokio::task::block_in_place(|| {
        Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Select a device")
            .items(&items)
            .default(0)
            .interact_opt()
    })
    .map_err(|e| CliError::Usage(format!("Device prompt failed: {e}")))?;

    match choice {
        Some(index) => found
            .into_iter()
            .nth(index)
            .ok_or_else(|| blinkflash::Error::DiscoveryCancelled.into()),
        None => Err(blinkflash::Error::DiscoveryCancelled.into()),
    }
}

/// Print status lines to stderr and, when enabled, console text to stdout.
async fn print_events(
    mut events: tokio::sync::broadcast::Receiver<SessionEvent>,
    view: Arc<ConsoleView>,
    quiet: bool,
    stop: CancellationToken,
) {
    let mut at_line_start = true;
    loop {
        // Drain queued events before honoring the stop request.
        let event = tokio::select! {
            biased;
            event = events.recv() => event,
            () = stop.cancelled() => break,
        };
        match event {
            Ok(SessionEvent::Status(line)) => {
                if !quiet && !line.starts_with(CHUNK_STATUS_PREFIX) {
                    eprintln!("{} {line}", style("›").dim());
                }
            },
            Ok(SessionEvent::Console(text)) => {
                if view.enabled.load(Ordering::Relaxed) {
                    let text = clean_console_text(&text);
                    let text = if view.timestamp.load(Ordering::Relaxed) {
                        let prefix = format!("[{}] ", timestamp());
                        prefix_lines(&text, &prefix, &mut at_line_start)
                    } else {
                        text
                    };
                    let mut stdout = std::io::stdout();
                    let _ = stdout.write_all(text.as_bytes());
                    let _ = stdout.flush();
                }
            },
            Ok(SessionEvent::StateChanged(state)) => debug!("State: {state}"),
            Err(RecvError::Lagged(n)) => warn!("Dropped {n} session events"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Wall-clock time of day as `HH:MM:SS.mmm` (UTC).
fn timestamp() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs() % 86_400;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        now.subsec_millis()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_format() {
        let ts = timestamp();
        assert_eq!(ts.len(), 12);
        assert_eq!(&ts[2..3], ":");
        assert_eq!(&ts[8..9], ".");
    }
}
