use std::io::{BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::log_sanitize::clean_engine_line;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// One engine run: what to execute and the limits it runs under.
pub struct Invocation<'a> {
    pub binary: &'a str,
    pub args: &'a [String],
    pub env: &'a [(String, String)],
    pub timeout: Duration,
    pub max_output_bytes: usize,
    /// Values scrubbed from anything logged or echoed back in errors.
    pub secrets: &'a [&'a str],
}

#[derive(Debug, Clone)]
pub struct EngineOutput {
    /// `None` when the child was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl EngineOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }
}

/// Spawn the engine with no stdin, drain both pipes line by line, and block
/// until it exits. The child is killed when the deadline passes or its combined
/// output exceeds the byte bound. A nonzero exit is not an error here.
pub fn run(inv: &Invocation<'_>) -> Result<EngineOutput> {
    let mut cmd = Command::new(inv.binary);
    cmd.args(inv.args);
    for (k, v) in inv.env {
        cmd.env(k, v);
    }

    // Own process group so a timeout takes down anything the engine forked.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    debug!(
        binary = inv.binary,
        args = %clean_engine_line(&inv.args.join(" "), inv.secrets),
        timeout_secs = inv.timeout.as_secs(),
        "running backup engine"
    );

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            Error::ProcessExecution(format!("failed to start '{}': {e}", inv.binary))
        })?;

    let line_cap = inv.max_output_bytes.saturating_add(1);
    let (tx, rx) = mpsc::channel::<(Stream, String)>();
    if let Some(out) = child.stdout.take() {
        let tx = tx.clone();
        std::thread::spawn(move || read_output_stream(out, Stream::Stdout, line_cap, tx));
    }
    if let Some(err) = child.stderr.take() {
        let tx = tx.clone();
        std::thread::spawn(move || read_output_stream(err, Stream::Stderr, line_cap, tx));
    }
    drop(tx);

    let deadline = Instant::now() + inv.timeout;
    let mut total = 0usize;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok((stream, line)) => {
                total = total.saturating_add(line.len() + 1);
                if total > inv.max_output_bytes {
                    terminate(&mut child);
                    return Err(Error::ProcessExecution(format!(
                        "output exceeded {} bytes; process killed",
                        inv.max_output_bytes
                    )));
                }
                trace!(?stream, line = %clean_engine_line(&line, inv.secrets), "engine");
                match stream {
                    Stream::Stdout => stdout.push(line),
                    Stream::Stderr => stderr.push(line),
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                terminate(&mut child);
                return Err(Error::ProcessExecution(format!(
                    "timed out after {}s; process killed",
                    inv.timeout.as_secs()
                )));
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = child
        .wait()
        .map_err(|e| Error::ProcessExecution(format!("wait failed: {e}")))?;
    debug!(code = ?status.code(), "backup engine exited");
    Ok(EngineOutput {
        code: status.code(),
        stdout,
        stderr,
    })
}

fn terminate(child: &mut Child) {
    let pgid = child.id();
    kill_pgroup(pgid, false);
    kill_pgroup(pgid, true);
    let _ = child.kill();
    let _ = child.wait();
}

fn kill_pgroup(pgid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        // Negative PID targets the whole process group.
        let _ = unsafe { libc::kill(-(pgid as i32), sig) };
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, force);
    }
}

fn read_output_stream<R: Read>(
    reader: R,
    stream: Stream,
    max_pending: usize,
    tx: mpsc::Sender<(Stream, String)>,
) {
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        for b in &buf[..n] {
            if *b == b'\n' || *b == b'\r' {
                if pending.is_empty() {
                    continue;
                }
                let line = String::from_utf8_lossy(&pending).into_owned();
                pending.clear();
                if tx.send((stream, line)).is_err() {
                    return;
                }
            } else {
                pending.push(*b);
                if pending.len() >= max_pending {
                    let line = String::from_utf8_lossy(&pending).into_owned();
                    pending.clear();
                    if tx.send((stream, line)).is_err() {
                        return;
                    }
                }
            }
        }
    }

    if !pending.is_empty() {
        let line = String::from_utf8_lossy(&pending).into_owned();
        let _ = tx.send((stream, line));
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration, max: usize) -> Result<EngineOutput> {
        let args = vec!["-c".to_string(), script.to_string()];
        run(&Invocation {
            binary: "/bin/sh",
            args: &args,
            env: &[("SNAPVAULT_TEST_VAR".into(), "hello".into())],
            timeout,
            max_output_bytes: max,
            secrets: &[],
        })
    }

    #[test]
    fn splits_streams_and_reports_exit_code() {
        let out = sh(
            "echo one; echo two 1>&2; printf 'three\\r\\nfour'; echo \"$SNAPVAULT_TEST_VAR\" 1>&2; exit 3",
            Duration::from_secs(10),
            1 << 20,
        )
        .expect("run");
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
        assert_eq!(out.stdout, vec!["one", "three", "four"]);
        assert_eq!(out.stderr, vec!["two", "hello"]);
    }

    #[test]
    fn timeout_kills_the_process_group() {
        let started = Instant::now();
        let err = sh("sleep 30 & sleep 30; wait", Duration::from_millis(300), 1 << 20)
            .unwrap_err();
        assert!(matches!(err, Error::ProcessExecution(ref m) if m.contains("timed out")));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn output_bound_is_enforced() {
        let err = sh(
            "i=0; while [ $i -lt 5000 ]; do echo 0123456789abcdef; i=$((i+1)); done",
            Duration::from_secs(10),
            4096,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ProcessExecution(ref m) if m.contains("exceeded")));
    }

    #[test]
    fn missing_binary_is_execution_error() {
        let err = run(&Invocation {
            binary: "/nonexistent/restic",
            args: &[],
            env: &[],
            timeout: Duration::from_secs(1),
            max_output_bytes: 1024,
            secrets: &[],
        })
        .unwrap_err();
        assert!(matches!(err, Error::ProcessExecution(_)));
    }
}
