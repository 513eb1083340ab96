//! Port listing and board probing.

use anyhow::Result;
use console::style;

use boardlink::{DetectedPort, detect_ports, format_port_list};

use crate::{Cli, use_fancy_output};
use crate::config::Config;
use crate::session::Session;

fn port_json(port: &DetectedPort) -> serde_json::Value {
    serde_json::json!({
        "name": port.name,
        "device": port.device.name(),
        "known": port.device.is_known(),
        "vid": port.vid,
        "pid": port.pid,
        "manufacturer": port.manufacturer,
        "product": port.product,
        "serial": port.serial,
    })
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let mut detected = detect_ports();
    detected.sort_by_key(|p| p.device.probe_rank());

    if json {
        let ports: Vec<serde_json::Value> = detected.iter().map(port_json).collect();
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());
    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    if !use_fancy_output() {
        for line in format_port_list(&detected) {
            eprintln!("  {line}");
        }
        return Ok(());
    }

    for port in &detected {
        let device_type = if port.device.is_known() {
            format!(" [{}]", style(port.device.name()).yellow())
        } else {
            String::new()
        };
        let vid_pid = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
            _ => String::new(),
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{device_type}{vid_pid}{product}",
            style("•").green(),
            style(&port.name).cyan(),
        );
    }
    Ok(())
}

/// Scan command: probe ports and print the board's port on stdout.
pub(crate) fn cmd_scan(cli: &Cli, config: &mut Config) -> Result<()> {
    let session = Session::scan(cli, config)?;
    if let Some(port) = session.board.port() {
        println!("{port}");
    }
    Ok(())
}
