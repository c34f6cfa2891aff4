//! Process Executor - runs one task's child process and captures its output
//!
//! stdout and stderr are both piped; a reader task per pipe forwards
//! chunks to a single collector, which feeds the output multiplexer and
//! the optional output file in arrival order. The run ends when the
//! process exits, even if a descendant still holds the pipes.

use super::output::{OutputMux, CHUNK_SIZE};
use super::task::{Priority, Task, SPAWN_FAILED_EXIT_CODE};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;

/// How long buffered output is still collected once the process has exited
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: i32,
    /// Set when the process never started
    pub spawn_error: Option<String>,
    /// Set when saving the output failed; the exit code is unaffected
    pub output_error: Option<String>,
}

impl ExecOutcome {
    fn spawn_failed(reason: String) -> Self {
        Self {
            exit_code: SPAWN_FAILED_EXIT_CODE,
            spawn_error: Some(reason),
            output_error: None,
        }
    }
}

/// Task executor - spawns processes and waits for them
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Run a task to completion. Never fails: problems are reported in the outcome.
    pub async fn run(&self, task: &Task, mux: &OutputMux) -> ExecOutcome {
        let spec = &task.spec;
        log::info!(
            "Starting task {}: {} {:?} (in {})",
            task.id,
            spec.exec_name,
            spec.args,
            spec.work_dir
        );

        let mut cmd = Command::new(&spec.exec_name);
        cmd.args(&spec.args)
            .current_dir(&spec.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_priority(&mut cmd, spec.priority);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::error!("Task {} failed to start {}: {}", task.id, spec.exec_name, e);
                return ExecOutcome::spawn_failed(e.to_string());
            }
        };

        let mut sink = OutputSink::new(task.id, mux, task.output_file()).await;

        let (tx, mut rx) = mpsc::channel::<io::Result<Vec<u8>>>(32);
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(stderr, tx.clone())));
        }
        drop(tx);

        // Completion is the process exiting, not its pipes closing: a
        // backgrounded descendant may keep them open indefinitely.
        let mut pipes_open = true;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                msg = rx.recv(), if pipes_open => match msg {
                    Some(msg) => sink.accept(msg).await,
                    None => pipes_open = false,
                },
            }
        };

        if pipes_open {
            let drain = async {
                while let Some(msg) = rx.recv().await {
                    sink.accept(msg).await;
                }
            };
            if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
                log::debug!("Task {} output still held open after exit", task.id);
            }
        }
        for handle in pumps {
            handle.abort();
        }
        let mut output_error = sink.finish().await;

        let exit_code = match status {
            Ok(status) => exit_code_of(status),
            Err(e) => {
                log::error!("Task {} wait failed: {}", task.id, e);
                output_error.get_or_insert_with(|| e.to_string());
                SPAWN_FAILED_EXIT_CODE
            }
        };

        if exit_code == 0 {
            log::info!("Task {} completed (exit: {})", task.id, exit_code);
        } else {
            log::warn!("Task {} failed (exit: {})", task.id, exit_code);
        }

        ExecOutcome {
            exit_code,
            spawn_error: None,
            output_error,
        }
    }
}

async fn pump<R>(mut reader: R, tx: mpsc::Sender<io::Result<Vec<u8>>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
}

/// Where captured output goes: the multiplexer and the optional file
struct OutputSink<'a> {
    task_id: u32,
    mux: &'a OutputMux,
    file: Option<File>,
    error: Option<String>,
}

impl<'a> OutputSink<'a> {
    async fn new(task_id: u32, mux: &'a OutputMux, path: Option<PathBuf>) -> OutputSink<'a> {
        let mut sink = Self {
            task_id,
            mux,
            file: None,
            error: None,
        };
        if let Some(path) = path {
            match open_output(&path).await {
                Ok(f) => sink.file = Some(f),
                Err(e) => {
                    log::warn!("Task {} cannot save output to {}: {}", task_id, path.display(), e);
                    sink.error = Some(format!("{}: {}", path.display(), e));
                }
            }
        }
        sink
    }

    async fn accept(&mut self, msg: io::Result<Vec<u8>>) {
        let chunk = match msg {
            Ok(chunk) => chunk,
            Err(e) => {
                log::warn!("Task {} output capture failed: {}", self.task_id, e);
                self.error = Some(format!("output capture failed: {}", e));
                return;
            }
        };

        self.mux.publish(&chunk);
        if let Some(f) = self.file.as_mut() {
            if let Err(e) = f.write_all(&chunk).await {
                log::warn!("Task {} output write failed: {}", self.task_id, e);
                self.error = Some(e.to_string());
                self.file = None;
            }
        }
    }

    /// Flush the file; returns the first capture problem, if any
    async fn finish(mut self) -> Option<String> {
        if let Some(mut f) = self.file.take() {
            if let Err(e) = f.flush().await {
                self.error.get_or_insert_with(|| e.to_string());
            }
        }
        self.error
    }
}

async fn open_output(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    File::create(path).await
}

#[cfg(unix)]
fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(SPAWN_FAILED_EXIT_CODE)
}

#[cfg(not(unix))]
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(SPAWN_FAILED_EXIT_CODE)
}

/// Map the priority onto `nice` in the child before exec.
///
/// Raising priority usually needs privileges; a refused `setpriority`
/// leaves the child at normal priority.
#[cfg(unix)]
fn apply_priority(cmd: &mut Command, priority: Priority) {
    let nice = priority.nice_value();
    if nice == 0 {
        return;
    }
    // SAFETY: only async-signal-safe libc calls run between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            libc::setpriority(libc::PRIO_PROCESS, 0, nice);
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_priority(_cmd: &mut Command, priority: Priority) {
    if priority != Priority::Normal {
        log::debug!("Process priority {} not supported on this platform", priority);
    }
}
