pub mod chef;
pub mod cluster;
pub mod error;
pub mod gateway;
pub mod known_hosts;
pub mod poll;
pub mod provision;
pub mod ssh;
pub mod types;

use execute::Execute;
use log::info;
use std::process::{Command, Stdio};

pub use error::{Error, Result};

/// Run a local command to completion, turning a non-zero exit into an
/// error carrying its stderr.
pub(crate) fn check_command(mut command: Command) -> Result<()> {
    info!("run: {:?}", command);
    command.stdout(Stdio::null());
    command.stderr(Stdio::piped());

    let description = format!("{:?}", command);
    let failed = |details: String| Error::LocalCommand {
        command: description.clone(),
        details,
    };

    match command.execute_output() {
        Ok(output) => match output.status.code() {
            Some(0) => Ok(()),
            Some(_) => Err(failed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
            None => Err(failed("interrupted".to_string())),
        },
        Err(e) => Err(failed(e.to_string())),
    }
}
