//! Reset and reload control frames.

use anyhow::Result;
use console::style;

use super::Context;

/// Reset the device.
pub(crate) async fn cmd_reset(ctx: &Context) -> Result<()> {
    ctx.connect().await?;
    ctx.interruptible(ctx.session.send_reset()).await?;
    if !ctx.quiet {
        eprintln!("{} Device reset", style("🔄").cyan());
    }
    Ok(())
}

/// Reload the program stored on the device.
pub(crate) async fn cmd_reload(ctx: &Context) -> Result<()> {
    ctx.connect().await?;
    ctx.interruptible(ctx.session.send_reload()).await?;
    if !ctx.quiet {
        eprintln!("{} Program reloaded", style("🔄").cyan());
    }
    Ok(())
}
