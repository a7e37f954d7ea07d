//! Device console streaming.
//!
//! Console text is printed by the event printer once enabled; this module
//! only decides when streaming ends:
//! - Ctrl+C: graceful exit
//! - the session gives up reconnecting: error

use anyhow::{Context as _, Result};
use blinkflash::ConnectionState;
use console::style;

use super::Context;

/// Connect and stream the device console until Ctrl+C.
pub(crate) async fn cmd_console(ctx: &Context, timestamp: bool) -> Result<()> {
    ctx.connect().await?;
    follow(ctx, timestamp).await
}

/// Stream the console of the connected device until Ctrl+C.
pub(crate) async fn follow(ctx: &Context, timestamp: bool) -> Result<()> {
    ctx.show_console(timestamp);
    if !ctx.quiet {
        eprintln!(
            "{} {}",
            style("›").dim(),
            style("Streaming device console (Ctrl+C to exit)").dim()
        );
    }

    let mut state = ctx.session.watch_state();
    loop {
        tokio::select! {
            () = ctx.interrupt.cancelled() => return Ok(()),
            changed = state.changed() => {
                if changed.is_err() {
                    return Err(blinkflash::Error::SessionClosed.into());
                }
                let current = *state.borrow_and_update();
                if current == ConnectionState::Disconnected {
                    return Err(blinkflash::Error::NotConnected)
                        .context("Connection lost and reconnection gave up");
                }
            }
        }
    }
}
