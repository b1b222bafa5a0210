use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::info;

use crate::error::{Result, VmediaError};

#[derive(Debug)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

pub fn run_command(program: &str, args: &[&str]) -> Result<CommandOutput> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| VmediaError::Message(format!("Failed to run {program}: {e}")))?;
    let output = CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };
    log_command(program, args, &output);
    Ok(output)
}

/// Run a command and turn a non-zero exit into an error carrying stderr.
pub fn run_checked(program: &str, args: &[&str]) -> Result<CommandOutput> {
    let output = run_command(program, args)?;
    if !output.success() {
        return Err(VmediaError::Message(format!(
            "{program} failed: {}",
            output.stderr.trim()
        )));
    }
    Ok(output)
}

fn log_command(program: &str, args: &[&str], output: &CommandOutput) {
    let mut parts = vec![format!("cmd={program} {}", args.join(" "))];
    if let Some(code) = output.exit_code {
        parts.push(format!("exit={code}"));
    }
    let stderr = output.stderr.trim();
    let stdout = output.stdout.trim();
    if !stderr.is_empty() {
        parts.push(format!("stderr={stderr}"));
    } else if !stdout.is_empty() {
        parts.push(format!("stdout={stdout}"));
    }
    info!("{}", parts.join(" | "));
}

/// Answers whether a directory is the root of a mounted file system.
pub trait MountTable: Send + Sync {
    fn is_mount_point(&self, path: &Path) -> io::Result<bool>;
}

/// Mount table of the running host, read from `/proc/self/mountinfo`.
#[derive(Debug, Clone)]
pub struct ProcMountTable {
    mountinfo: PathBuf,
}

impl Default for ProcMountTable {
    fn default() -> Self {
        Self {
            mountinfo: PathBuf::from("/proc/self/mountinfo"),
        }
    }
}

impl MountTable for ProcMountTable {
    fn is_mount_point(&self, path: &Path) -> io::Result<bool> {
        let target = fs::canonicalize(path)?;
        let table = fs::read_to_string(&self.mountinfo)?;
        Ok(parse_mount_points(&table).iter().any(|m| *m == target))
    }
}

/// Extract mount points (fifth column) from mountinfo text.
pub fn parse_mount_points(mountinfo: &str) -> Vec<PathBuf> {
    mountinfo
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape_mount_field(field)))
        .collect()
}

// mountinfo escapes space, tab, newline and backslash as three-digit octal.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let code = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(code) = code {
                out.push(code);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}
