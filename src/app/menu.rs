use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::info;

use crate::app::apple::backup;
use crate::app::catalog;
use crate::app::config::AppConfig;
use crate::app::models::BackupOptions;
use crate::app::notify::Notifier;
use crate::app::registry::DeviceRegistry;
use crate::app::serialize;

const DEVICES_JSON: &str = "./out/devices.json";
const DEVICES_CSV: &str = "./out/devices.csv";

pub struct MenuContext {
    pub registry: Arc<DeviceRegistry>,
    pub notifier: Arc<Notifier>,
    pub config: AppConfig,
}

/// Interactive loop over stdin/stdout. Everything here goes through the
/// public APIs of the core components; input and output are injected so
/// the loop is scriptable.
pub fn run<R: BufRead, W: Write>(
    ctx: &MenuContext,
    input: &mut R,
    output: &mut W,
) -> std::io::Result<()> {
    loop {
        print_menu(output)?;
        let Some(choice) = read_line(input)? else {
            return Ok(());
        };
        match choice.as_str() {
            "1" => list_devices(ctx, output)?,
            "2" => export_snapshots(ctx, output)?,
            "3" => test_apple_connection(input, output)?,
            "4" => run_backup(ctx, input, output)?,
            "5" => scan_catalog(ctx, output)?,
            "6" => set_webhook(ctx, input, output)?,
            "7" => set_tcp_endpoint(ctx, input, output)?,
            "q" | "Q" => {
                writeln!(output, "bye")?;
                return Ok(());
            }
            "" => {}
            other => writeln!(output, "unknown choice: {other}")?,
        }
    }
}

fn print_menu<W: Write>(output: &mut W) -> std::io::Result<()> {
    writeln!(output)?;
    writeln!(output, "== devicewatcher ==")?;
    writeln!(output, " 1) list devices")?;
    writeln!(output, " 2) write devices.json / devices.csv")?;
    writeln!(output, " 3) test apple connection")?;
    writeln!(output, " 4) backup apple device")?;
    writeln!(output, " 5) scan backup catalog")?;
    writeln!(output, " 6) set webhook url")?;
    writeln!(output, " 7) set tcp notify endpoint")?;
    writeln!(output, " q) quit")?;
    write!(output, "> ")?;
    output.flush()
}

fn read_line<R: BufRead>(input: &mut R) -> std::io::Result<Option<String>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

fn prompt<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    label: &str,
) -> std::io::Result<Option<String>> {
    write!(output, "{label}: ")?;
    output.flush()?;
    read_line(input)
}

fn list_devices(ctx: &MenuContext, output: &mut impl Write) -> std::io::Result<()> {
    let devices = ctx.registry.snapshot();
    writeln!(output, "{} device(s)", devices.len())?;
    for device in devices {
        let age = ctx
            .registry
            .online_since(&device.uid)
            .and_then(|since| SystemTime::now().duration_since(since).ok())
            .map(|age| format!("{}s", age.as_secs()))
            .unwrap_or_else(|| "-".to_string());
        writeln!(
            output,
            "  [{}] {} {} online={} state={} online_for={}",
            device.device_type.as_str(),
            device.uid,
            if device.display_name.is_empty() {
                "-"
            } else {
                &device.display_name
            },
            device.online,
            if device.adb_state.is_empty() {
                "-"
            } else {
                &device.adb_state
            },
            age,
        )?;
    }
    Ok(())
}

fn export_snapshots(ctx: &MenuContext, output: &mut impl Write) -> std::io::Result<()> {
    let devices = ctx.registry.snapshot();
    serialize::write_devices_json(Path::new(DEVICES_JSON), &devices)?;
    serialize::write_devices_csv(Path::new(DEVICES_CSV), &devices)?;
    writeln!(output, "wrote {DEVICES_JSON} and {DEVICES_CSV}")?;
    Ok(())
}

fn test_apple_connection<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
) -> std::io::Result<()> {
    let Some(udid) = prompt(input, output, "udid")? else {
        return Ok(());
    };
    match backup::test_connection(&udid) {
        Ok(info) => writeln!(
            output,
            "ok: {} ({}, iOS {})",
            info.display_name, info.model, info.os_version
        ),
        Err(err) => writeln!(output, "failed: {err}"),
    }
}

fn run_backup<R: BufRead, W: Write>(
    ctx: &MenuContext,
    input: &mut R,
    output: &mut W,
) -> std::io::Result<()> {
    let Some(udid) = prompt(input, output, "udid")? else {
        return Ok(());
    };
    let Some(dir) = prompt(
        input,
        output,
        &format!(
            "backup dir (empty = {})",
            ctx.config.backup_root.display()
        ),
    )?
    else {
        return Ok(());
    };

    let backup_dir = if dir.is_empty() {
        ctx.config.backup_root.join(&udid)
    } else {
        dir.into()
    };
    let options = BackupOptions::new(backup_dir);

    info!(udid = %udid, "starting backup from menu");
    writeln!(output, "backing up, this can take a while...")?;
    match backup::perform_backup(&udid, &options) {
        Ok(()) => writeln!(output, "backup finished: {}", options.backup_dir.display()),
        Err(err) => writeln!(output, "backup failed: {err}"),
    }
}

fn scan_catalog(ctx: &MenuContext, output: &mut impl Write) -> std::io::Result<()> {
    let scan = catalog::scan_backup_root(&ctx.config.backup_root);
    writeln!(
        output,
        "{} backup(s), {} skipped, {} bytes total under {}",
        scan.records.len(),
        scan.skipped,
        scan.total_bytes(),
        ctx.config.backup_root.display()
    )?;
    for record in &scan.records {
        writeln!(
            output,
            "  {} {} ({}, iOS {}) {} bytes",
            record.udid,
            if record.device_name.is_empty() {
                "-"
            } else {
                &record.device_name
            },
            record.product_type,
            record.ios_version,
            record.total_bytes,
        )?;
    }
    Ok(())
}

fn set_webhook<R: BufRead, W: Write>(
    ctx: &MenuContext,
    input: &mut R,
    output: &mut W,
) -> std::io::Result<()> {
    if let Some(url) = prompt(input, output, "webhook url (empty disables)")? {
        ctx.notifier.set_webhook_url(&url);
        writeln!(output, "webhook set")?;
    }
    Ok(())
}

fn set_tcp_endpoint<R: BufRead, W: Write>(
    ctx: &MenuContext,
    input: &mut R,
    output: &mut W,
) -> std::io::Result<()> {
    if let Some(endpoint) = prompt(input, output, "host:port (empty disables)")? {
        ctx.notifier.set_tcp_endpoint(&endpoint);
        writeln!(output, "tcp endpoint set")?;
    }
    Ok(())
}
