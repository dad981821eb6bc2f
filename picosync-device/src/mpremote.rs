//! [`DeviceTool`] backed by the `mpremote` command line.
//!
//! Every invocation is a fresh process with a bounded wait: the child is
//! killed once the deadline passes and the call reports
//! [`ToolError::TimedOut`].

use std::ffi::OsString;
use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::runtime::{Builder, Handle};
use tokio::time::timeout;

use picosync_core::{EngineSettings, ToolSettings};

use crate::error::ToolError;
use crate::tool::{DeviceListing, DeviceTool, RemoteEntry};

/// Removes regular files (stat mode bit 0x8000) in the device root.
const WIPE_SCRIPT: &str =
    "import os\nfor f in os.listdir():\n    if os.stat(f)[0] & 0x8000:\n        os.remove(f)\n";

const MACHINE_SCRIPT: &str = "import sys; print(sys.implementation._machine)";

#[derive(Debug, Clone)]
pub struct Mpremote {
    program: String,
    timeout: Duration,
}

impl Mpremote {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn from_settings(tool: &ToolSettings, engine: &EngineSettings) -> Self {
        Self::new(tool.program.clone(), engine.transfer_timeout())
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn run(&self, operation: &'static str, args: &[OsString]) -> Result<String, ToolError> {
        block_on(self.output(operation, args))?
    }

    async fn output(&self, operation: &'static str, args: &[OsString]) -> Result<String, ToolError> {
        tracing::debug!("{} {:?}", self.program, args);
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) if source.kind() == std::io::ErrorKind::NotFound => {
                return Err(ToolError::NotInstalled {
                    program: self.program.clone(),
                })
            }
            Ok(Err(source)) => {
                return Err(ToolError::Spawn {
                    program: self.program.clone(),
                    source,
                })
            }
            // Dropping the output future drops the child, which kills it.
            Err(_) => {
                tracing::warn!("{} {} killed after {:?}", self.program, operation, self.timeout);
                return Err(ToolError::TimedOut {
                    operation,
                    after: self.timeout,
                });
            }
        };

        let out = String::from_utf8_lossy(&output.stdout).into_owned();
        let err = String::from_utf8_lossy(&output.stderr);
        if output.status.success() {
            Ok(out)
        } else {
            Err(ToolError::Failed {
                operation,
                code: output.status.code(),
                message: failure_message(&err, &out),
            })
        }
    }
}

/// Drive `future` to completion from synchronous code.
///
/// Inside the daemon the tool is only called from `spawn_blocking` threads,
/// where the ambient runtime handle can block. Outside any runtime (the CLI's
/// `devices` command, plain tests) a throwaway current-thread runtime is used.
fn block_on<F: Future>(future: F) -> Result<F::Output, ToolError> {
    match Handle::try_current() {
        Ok(handle) => Ok(handle.block_on(future)),
        Err(_) => {
            let runtime = Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|source| ToolError::Io {
                    path: "tokio runtime".into(),
                    source,
                })?;
            Ok(runtime.block_on(future))
        }
    }
}

impl DeviceTool for Mpremote {
    fn list_devices(&self) -> Result<Vec<DeviceListing>, ToolError> {
        let out = self.run("list devices", &list_args())?;
        Ok(parse_device_list(&out))
    }

    fn copy_file(&self, port: &str, local: &Path, remote: &str) -> Result<(), ToolError> {
        if !local.is_file() {
            return Err(ToolError::LocalMissing {
                path: local.to_path_buf(),
            });
        }
        let mut args = connect_args(port, "cp");
        args.push(local.as_os_str().to_os_string());
        args.push(remote.into());
        self.run("cp", &args).map(drop)
    }

    fn remove_path(&self, port: &str, remote: &str) -> Result<(), ToolError> {
        let mut args = connect_args(port, "rm");
        args.push("-r".into());
        args.push(remote.into());
        self.run("rm", &args).map(drop)
    }

    fn make_dir(&self, port: &str, remote: &str) -> Result<(), ToolError> {
        let mut args = connect_args(port, "mkdir");
        args.push(remote.into());
        self.run("mkdir", &args).map(drop)
    }

    fn reset(&self, port: &str) -> Result<(), ToolError> {
        self.run("reset", &connect_args(port, "reset")).map(drop)
    }

    fn list_dir(&self, port: &str, remote: &str) -> Result<Vec<RemoteEntry>, ToolError> {
        let mut args = connect_args(port, "ls");
        args.push(remote.into());
        let out = self.run("ls", &args)?;
        Ok(parse_dir_listing(&out))
    }

    fn wipe(&self, port: &str) -> Result<(), ToolError> {
        let mut args = connect_args(port, "exec");
        args.push(WIPE_SCRIPT.into());
        self.run("wipe", &args).map(drop)
    }

    fn machine(&self, port: &str) -> Result<String, ToolError> {
        let mut args = connect_args(port, "exec");
        args.push(MACHINE_SCRIPT.into());
        let out = self.run("machine", &args)?;
        Ok(out.trim().to_string())
    }
}

fn list_args() -> Vec<OsString> {
    vec!["connect".into(), "list".into()]
}

fn connect_args(port: &str, command: &str) -> Vec<OsString> {
    vec!["connect".into(), port.into(), command.into()]
}

fn failure_message(stderr: &str, stdout: &str) -> String {
    match (stderr.trim(), stdout.trim()) {
        ("", "") => "no output".to_string(),
        (err, "") => err.to_string(),
        ("", out) => out.to_string(),
        (err, out) => format!("{err}\n{out}"),
    }
}

/// Parse `mpremote connect list` output.
///
/// Each line reads `<port> <serial> <vid>:<pid> <manufacturer> <product>`,
/// with `None` for absent strings and `0000:0000` when the ids are unknown.
pub fn parse_device_list(stdout: &str) -> Vec<DeviceListing> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let port = tokens.next()?.to_string();
            let serial = tokens.next().filter(|s| *s != "None").map(str::to_string);
            let (vid, pid) = tokens.next().map(parse_ids).unwrap_or((None, None));
            let description = tokens
                .filter(|t| *t != "None")
                .collect::<Vec<_>>()
                .join(" ");
            Some(DeviceListing {
                port,
                serial,
                vid,
                pid,
                description,
            })
        })
        .collect()
}

fn parse_ids(token: &str) -> (Option<u16>, Option<u16>) {
    let Some((vid, pid)) = token.split_once(':') else {
        return (None, None);
    };
    let parse = |hex: &str| u16::from_str_radix(hex, 16).ok().filter(|v| *v != 0);
    (parse(vid), parse(pid))
}

/// Parse `mpremote ls` output: a `ls :<dir>` header, then `<size> <name>` rows
/// where directories carry a trailing `/`.
pub fn parse_dir_listing(stdout: &str) -> Vec<RemoteEntry> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("ls "))
        .filter_map(|line| {
            let (size, name) = line.split_once(char::is_whitespace)?;
            let name = name.trim();
            let is_dir = name.ends_with('/');
            Some(RemoteEntry {
                name: name.trim_end_matches('/').to_string(),
                size: size.parse().ok(),
                is_dir,
            })
        })
        .collect()
}
