use std::io::{self, Write};

use crate::commands::CommandResult;
use crate::error::CliError;

pub fn render(report: &CommandResult, pretty: bool) -> Result<(), CliError> {
    let stdout = io::stdout();
    write_report(&mut stdout.lock(), report, pretty)
}

fn write_report(writer: &mut impl Write, report: &CommandResult, pretty: bool) -> Result<(), CliError> {
    let payload = if pretty {
        serde_json::to_string_pretty(report)?
    } else {
        serde_json::to_string(report)?
    };
    writeln!(writer, "{payload}")?;
    writer.flush()?;
    Ok(())
}
