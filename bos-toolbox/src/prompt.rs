//! Password prompt for batch runs.

use anyhow::{Context, Result};
use dialoguer::Password;
use std::io::{stdin, IsTerminal};

pub fn ask_default_password() -> Result<String> {
    Password::new()
        .with_prompt("Default password")
        .allow_empty_password(true)
        .interact()
        .context("Failed to read password input")
}

/// Password override for a run. A batch without any password asks once, when a
/// terminal is attached. An empty answer means no password.
pub fn password_override_with<P>(
    cli: Option<String>,
    configured: Option<&str>,
    batch: bool,
    interactive: bool,
    ask: P,
) -> Result<Option<String>>
where
    P: FnOnce() -> Result<String>,
{
    if cli.is_some() || configured.is_some() || !batch || !interactive {
        return Ok(cli);
    }
    let password = ask()?;
    Ok(Some(password).filter(|p| !p.is_empty()))
}

pub fn password_override(
    cli: Option<String>,
    configured: Option<&str>,
    batch: bool,
) -> Result<Option<String>> {
    password_override_with(
        cli,
        configured,
        batch,
        stdin().is_terminal(),
        ask_default_password,
    )
}
