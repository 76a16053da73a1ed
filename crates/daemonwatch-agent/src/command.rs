//! Invocation of external system commands

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use daemonwatch_common::{LookupError, LookupResult};

/// Runs a command, providing its stdout lines.
///
/// A non-zero exit status is only treated as a failure if the command also
/// wrote to stderr. Tools like lsof exit with 1 when nothing matched, which
/// isn't an error for our purposes.
pub fn call(program: &str, args: &[String]) -> LookupResult<Vec<String>> {
    let display = command_line(program, args);

    let output = Command::new(program)
        .args(args)
        .env("LC_ALL", "C")
        .output()
        .map_err(|e| LookupError::command(&display, e))?;

    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() && !stderr.trim().is_empty() {
        return Err(LookupError::command(
            &display,
            format!("{} ({})", stderr.trim(), output.status),
        ));
    }

    let stdout = String::from_utf8(output.stdout)
        .map_err(|e| LookupError::parse(program, format!("output isn't utf-8: {}", e)))?;

    Ok(stdout.lines().map(str::to_string).collect())
}

/// Human readable form of a command invocation, for error messages
pub fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Locates an executable on our PATH.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;

    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
