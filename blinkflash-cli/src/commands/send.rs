//! Bytecode transfer commands.

use anyhow::{Context as _, Result};
use blinkflash::{FirmwareImage, TransferOutcome, build_and_send};
use console::style;
use std::path::{Path, PathBuf};

use super::Context;
use crate::compiler::MrbcCompiler;

/// Default compiler executable, looked up on `PATH`.
const DEFAULT_MRBC: &str = "mrbc";

/// Send a precompiled `.mrb` file.
pub(crate) async fn cmd_send(
    ctx: &Context,
    file: &Path,
    slot: Option<u8>,
    console: bool,
) -> Result<()> {
    let slot = ctx.slot(slot)?;
    if !ctx.quiet {
        eprintln!(
            "{} Loading bytecode: {}",
            style("📦").cyan(),
            file.display()
        );
    }
    let bytecode = std::fs::read(file)
        .with_context(|| format!("Failed to read bytecode file: {}", file.display()))?;
    let image = FirmwareImage::new(bytecode, slot)?;

    ctx.connect().await?;

    let pb = ctx.progress_bar(image.len());
    pb.set_message(format!("slot {slot}"));
    let result = ctx
        .interruptible(ctx.session.send_firmware(&image, |sent, _| {
            pb.set_position(sent as u64);
        }))
        .await;
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            pb.abandon();
            return Err(e);
        },
    };
    pb.finish_and_clear();
    print_summary(ctx, &outcome);

    if console {
        super::console::follow(ctx, false).await?;
    }
    Ok(())
}

/// Compile a Ruby source with `mrbc` and send the result.
pub(crate) async fn cmd_run(
    ctx: &Context,
    file: &Path,
    slot: Option<u8>,
    mrbc: Option<&Path>,
    console: bool,
) -> Result<()> {
    let slot = ctx.slot(slot)?;
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read Ruby source: {}", file.display()))?;

    let program = mrbc
        .map(Path::to_path_buf)
        .or_else(|| ctx.config.compiler.mrbc.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MRBC));
    let compiler = MrbcCompiler::new(program);

    ctx.connect().await?;

    let pb = ctx.progress_bar(0);
    let report = ctx
        .interruptible(build_and_send(
            &ctx.session,
            &compiler,
            &source,
            slot,
            |sent, total| {
                pb.set_length(total as u64);
                pb.set_position(sent as u64);
            },
        ))
        .await;
    let report = match report {
        Ok(report) => report,
        Err(e) => {
            pb.abandon();
            return Err(e);
        },
    };
    pb.finish_and_clear();
    print_summary(ctx, &report.transfer);

    if console {
        super::console::follow(ctx, false).await?;
    }
    Ok(())
}

fn print_summary(ctx: &Context, outcome: &TransferOutcome) {
    if ctx.quiet {
        return;
    }
    eprintln!(
        "\n{} Sent {} bytes to slot {} ({} frames, CRC16=0x{:04X}, MTU={}, {:.2}s)",
        style("🎉").green().bold(),
        outcome.total_bytes,
        outcome.slot,
        outcome.chunks,
        outcome.checksum,
        outcome.mtu,
        outcome.elapsed.as_secs_f64()
    );
}
