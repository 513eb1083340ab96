//! Backup and restore commands.

use anyhow::{Result, bail};
use console::style;
use dialoguer::{Confirm, Error as DialoguerError, theme::ColorfulTheme};
use log::warn;
use std::io::IsTerminal;
use std::path::Path;

use boardlink::{BackupReport, Command, Payload, RestoreReport};

use crate::config::Config;
use crate::session::Session;
use crate::{Cli, CliError};

fn count_line(label: &str, items: &[String]) -> Option<String> {
    (!items.is_empty()).then(|| format!("  {label:<12} {}", items.len()))
}

fn backup_summary(report: &BackupReport) -> Vec<String> {
    [
        count_line("Downloaded", &report.transferred),
        count_line("Unchanged", &report.skipped),
        count_line("Orphaned", &report.orphaned),
        count_line("Unreadable", &report.broken),
    ]
    .into_iter()
    .flatten()
    .collect()
}

fn restore_summary(report: &RestoreReport) -> Vec<String> {
    [
        count_line("Uploaded", &report.transferred),
        count_line("Unchanged", &report.skipped),
        count_line("Extra", &report.deletion_candidates),
        count_line("Unreadable", &report.broken),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Backup command implementation.
pub(crate) fn cmd_backup(cli: &Cli, config: &mut Config, archive: &Path) -> Result<()> {
    let mut session = Session::open(cli, config)?;
    let Payload::Backup(report) = session.call(Command::Backup {
        archive: archive.to_path_buf(),
    })?
    else {
        bail!("Unexpected reply to a backup");
    };

    session.ui.note(&format!(
        "{} Backed up to {}",
        style("✓").green(),
        style(archive.display()).cyan()
    ));
    for line in backup_summary(&report) {
        session.ui.note(&line);
    }
    for path in &report.broken {
        warn!("Unreadable on the board, kept from the previous archive: {path}");
    }
    Ok(())
}

/// Restore command implementation.
pub(crate) fn cmd_restore(
    cli: &Cli,
    config: &mut Config,
    archive: &Path,
    delete_extra: bool,
) -> Result<()> {
    if !archive.is_file() {
        bail!("Archive {} does not exist", archive.display());
    }

    let mut session = Session::open(cli, config)?;
    let Payload::Restore(report) = session.call(Command::Restore {
        archive: archive.to_path_buf(),
    })?
    else {
        bail!("Unexpected reply to a restore");
    };

    session.ui.note(&format!(
        "{} Restored {}",
        style("✓").green(),
        style(archive.display()).cyan()
    ));
    for line in restore_summary(&report) {
        session.ui.note(&line);
    }
    for path in &report.broken {
        warn!("Unreadable on the board, not restored: {path}");
    }

    let extra = &report.deletion_candidates;
    if extra.is_empty() {
        return Ok(());
    }
    if !delete_extra {
        for path in extra {
            println!("{path}");
        }
        session.ui.note(&format!(
            "{} Files above are not in the archive; pass --delete-extra to remove them",
            style("ℹ").blue()
        ));
        return Ok(());
    }

    if !cli.non_interactive && !confirm_deletion(extra.len())? {
        return Err(CliError::Cancelled("Nothing deleted".to_string()).into());
    }

    for path in extra {
        session.call(Command::Remove { path: path.clone() })?;
        session.ui.note(&format!("  {} {path}", style("-").red()));
    }
    Ok(())
}

fn confirm_deletion(count: usize) -> Result<bool> {
    if !std::io::stdin().is_terminal() || !std::io::stderr().is_terminal() {
        return Err(CliError::Usage(
            "Deleting files needs confirmation; use --non-interactive to skip it".to_string(),
        )
        .into());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Delete {count} file(s) that are not in the archive?"))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);
    Ok(confirmed)
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Nothing deleted".to_string()).into()
            } else {
                CliError::Usage(format!("Prompt failed: {io_err}")).into()
            }
        },
    }
}
