//! Device discovery.

use anyhow::Result;
use blinkflash::DeviceInfo;
use console::style;

use super::Context;

/// List OpenBlink devices in range.
pub(crate) async fn cmd_scan(ctx: &Context, json: bool) -> Result<()> {
    if !json && !ctx.quiet {
        eprintln!("{} Scanning for devices...", style("⏳").yellow());
    }
    let devices = ctx.interruptible(ctx.session.scan()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&scan_json(&devices))?);
        return Ok(());
    }

    eprintln!("{}", style("Devices in range:").bold().underlined());
    if devices.is_empty() {
        eprintln!("  {}", style("No devices found").dim());
    } else {
        for device in &devices {
            eprintln!(
                "  {} {} {}",
                style("•").cyan(),
                style(&device.name).green().bold(),
                style(format!("({})", device.id)).dim()
            );
        }
    }
    Ok(())
}

fn scan_json(devices: &[DeviceInfo]) -> serde_json::Value {
    let list: Vec<_> = devices
        .iter()
        .map(|d| {
            serde_json::json!({
                "id": d.id,
                "name": d.name,
            })
        })
        .collect();
    serde_json::json!({
        "ok": true,
        "data": {
            "devices": list,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_json_shape() {
        let value = scan_json(&[DeviceInfo::new("sim:OpenBlink-SIM", "OpenBlink-SIM")]);
        assert_eq!(value["ok"], true);
        assert_eq!(value["data"]["devices"][0]["name"], "OpenBlink-SIM");
        assert_eq!(value["data"]["devices"][0]["id"], "sim:OpenBlink-SIM");
    }

    #[test]
    fn test_scan_json_empty() {
        let value = scan_json(&[]);
        assert!(value["data"]["devices"].as_array().unwrap().is_empty());
    }
}
