// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::output::{Record, Sink, Stream};
use crate::{Error, ErrorKind};

/// A fully resolved command line for one instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl InstanceSpec {
    pub fn new<P, I, A>(program: P, args: I) -> Self
    where
        P: Into<String>,
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// How a started process ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Termination {
    /// Exited with status 0
    Success,
    /// Exited with a non-zero status
    ExitStatus(i32),
    /// Terminated by the signal with this number
    Signaled(i32),
    /// Waiting on the process failed, or it ended in some other way
    WaitFailed(String),
}

impl Termination {
    fn from_wait(result: std::io::Result<ExitStatus>) -> Self {
        let status = match result {
            Ok(status) => status,
            Err(e) => return Termination::WaitFailed(e.to_string()),
        };

        if status.success() {
            Termination::Success
        } else if let Some(code) = status.code() {
            Termination::ExitStatus(code)
        } else if let Some(signo) = status.signal() {
            Termination::Signaled(signo)
        } else {
            Termination::WaitFailed(status.to_string())
        }
    }

    fn to_record(&self, id: usize) -> Record {
        match self {
            Termination::Success => Record::Status {
                id,
                message: self.to_string(),
            },
            _ => Record::Error {
                id,
                message: self.to_string(),
            },
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Termination::Success => f.write_str("program exited successfully"),
            Termination::ExitStatus(code) => write!(f, "program exited with status {}", code),
            Termination::Signaled(signo) => match Signal::try_from(signo) {
                Ok(signal) => write!(f, "program killed by signal {} ({})", signo, signal),
                Err(_) => write!(f, "program killed by signal {}", signo),
            },
            Termination::WaitFailed(ref e) => write!(f, "program failed: {}", e),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum State {
    Created,
    Running,
    /// The process could not be spawned, there is nothing to wait on or kill
    StartupFailed(String),
    Terminated(Termination),
}

type KillReply = oneshot::Sender<nix::Result<()>>;

/// One child process, its output readers and its waiter
///
/// The child itself is owned by the waiter task, kills are requested over a channel
/// and delivered by that task, so a signal is never sent to a reaped pid.
pub struct Instance {
    id: usize,
    spec: InstanceSpec,
    state: State,
    pid: Option<u32>,
    kill_tx: Option<mpsc::UnboundedSender<KillReply>>,
    waiter: Option<JoinHandle<Termination>>,
}

impl Instance {
    pub fn new(id: usize, spec: InstanceSpec) -> Self {
        Self {
            id,
            spec,
            state: State::Created,
            pid: None,
            kill_tx: None,
            waiter: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// OS process id, once started
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Spawn the process and the tasks reading its output and waiting on it
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, sink: Arc<dyn Sink>) -> Result<(), Error> {
        if self.state != State::Created {
            return Err(Error::from("instance already started"));
        }

        let (child, stdout, stderr) = match self.spawn() {
            Ok(spawned) => spawned,
            Err(e) => {
                self.state = State::StartupFailed(e.to_string());
                return Err(e);
            }
        };

        let pid = child.id();
        debug!(id = self.id, program = %self.spec.program, ?pid, "instance started");

        // reported before any reader can emit output
        let message = match pid {
            Some(pid) => format!("program started (pid: {})", pid),
            None => "program started".to_string(),
        };
        sink.emit(Record::Status {
            id: self.id,
            message,
        });

        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let readers = (
            tokio::spawn(read_stream(self.id, Stream::Stdout, stdout, Arc::clone(&sink))),
            tokio::spawn(read_stream(self.id, Stream::Stderr, stderr, Arc::clone(&sink))),
        );
        self.waiter = Some(tokio::spawn(supervise(
            self.id, child, pid, readers, kill_rx, sink,
        )));
        self.kill_tx = Some(kill_tx);
        self.pid = pid;
        self.state = State::Running;

        Ok(())
    }

    fn spawn(&self) -> Result<(Child, ChildStdout, ChildStderr), Error> {
        let mut child = Command::new(&self.spec.program)
            .args(&self.spec.args)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ErrorKind::Spawn {
                program: self.spec.program.clone(),
                source,
            })?;

        // dropping the child on the error paths kills it
        let stdout = child
            .stdout
            .take()
            .ok_or(ErrorKind::MissingPipe(Stream::Stdout))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ErrorKind::MissingPipe(Stream::Stderr))?;

        Ok((child, stdout, stderr))
    }

    /// Send SIGKILL to the process
    ///
    /// Fails if the instance was never started or the process has already been waited on.
    pub async fn kill(&self) -> Result<(), Error> {
        let kill_tx = self
            .kill_tx
            .as_ref()
            .ok_or(ErrorKind::NotRunning(self.id))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        kill_tx
            .send(reply_tx)
            .map_err(|_| ErrorKind::NotRunning(self.id))?;

        match reply_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(ErrorKind::Kill {
                id: self.id,
                source,
            }
            .into()),
            // the waiter reaped the process before handling the request
            Err(_) => Err(ErrorKind::NotRunning(self.id).into()),
        }
    }

    /// Wait for both output streams to be drained and the process to exit
    ///
    /// Returns `None` if no process was ever started. Calling this again after the
    /// instance terminated returns the same termination.
    pub async fn join(&mut self) -> Option<Termination> {
        if let State::Terminated(ref termination) = self.state {
            return Some(termination.clone());
        }

        let waiter = self.waiter.take()?;
        let termination = match waiter.await {
            Ok(termination) => termination,
            Err(e) => {
                warn!(id = self.id, "waiter task failed: {}", e);
                Termination::WaitFailed(e.to_string())
            }
        };

        self.kill_tx = None;
        self.state = State::Terminated(termination.clone());
        Some(termination)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("spec", &self.spec)
            .field("state", &self.state)
            .field("pid", &self.pid)
            .finish()
    }
}

/// Drain the output, then wait on the child, handling kill requests throughout
async fn supervise(
    id: usize,
    mut child: Child,
    pid: Option<u32>,
    readers: (JoinHandle<()>, JoinHandle<()>),
    mut kill_rx: mpsc::UnboundedReceiver<KillReply>,
    sink: Arc<dyn Sink>,
) -> Termination {
    let drained = async move {
        let (stdout, stderr) = readers;
        if let Err(e) = stdout.await {
            warn!(id, "stdout reader failed: {}", e);
        }
        if let Err(e) = stderr.await {
            warn!(id, "stderr reader failed: {}", e);
        }
    };
    tokio::pin!(drained);

    loop {
        tokio::select! {
            () = &mut drained => break,
            Some(reply) = kill_rx.recv() => {
                let _ = reply.send(send_kill(id, pid));
            }
        }
    }

    let result = loop {
        tokio::select! {
            result = child.wait() => break result,
            Some(reply) = kill_rx.recv() => {
                let _ = reply.send(send_kill(id, pid));
            }
        }
    };

    let termination = Termination::from_wait(result);
    debug!(id, ?termination, "instance terminated");
    sink.emit(termination.to_record(id));

    termination
}

/// Only called while the child is still owned and not yet reaped
fn send_kill(id: usize, pid: Option<u32>) -> nix::Result<()> {
    let pid = pid.ok_or(nix::errno::Errno::ESRCH)?;

    signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL).map(|()| {
        debug!(id, pid, "sent SIGKILL");
    })
}

/// Emit every line of `output`, a trailing unterminated line is emitted at end of stream
async fn read_stream<R>(id: usize, stream: Stream, output: R, sink: Arc<dyn Sink>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(output);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }

                sink.emit(Record::Output {
                    id,
                    stream,
                    line: String::from_utf8_lossy(&buf).into_owned(),
                });
            }
            Err(e) => {
                warn!(id, %stream, "read failed: {}", e);
                sink.emit(Record::Error {
                    id,
                    message: format!("cannot read {}: {}", stream, e),
                });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::output::Collector;

    use super::*;

    fn sh(script: &str) -> InstanceSpec {
        InstanceSpec::new("/bin/sh", vec!["-c", script])
    }

    async fn run(script: &str) -> (Termination, Arc<Collector>) {
        let collector = Arc::new(Collector::new());
        let mut instance = Instance::new(1, sh(script));

        instance.start(collector.clone()).unwrap();
        assert_eq!(instance.state(), &State::Running);
        assert!(instance.pid().is_some());

        let termination = instance.join().await.unwrap();
        assert_eq!(instance.state(), &State::Terminated(termination.clone()));
        (termination, collector)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_success_with_both_streams() {
        let (termination, collector) = run("echo hello; echo oops >&2; echo world").await;

        assert_eq!(termination, Termination::Success);
        assert_eq!(collector.lines(1, Stream::Stdout), vec!["hello", "world"]);
        assert_eq!(collector.lines(1, Stream::Stderr), vec!["oops"]);

        let records = collector.records();
        match records.first() {
            Some(Record::Status { id: 1, message }) => assert!(message.starts_with("program started")),
            other => panic!("unexpected first record: {:?}", other),
        }
        assert_eq!(
            records.last(),
            Some(&Record::Status {
                id: 1,
                message: "program exited successfully".to_string()
            })
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_exit_status() {
        let (termination, collector) = run("exit 7").await;

        assert_eq!(termination, Termination::ExitStatus(7));
        assert_eq!(
            collector.records().last(),
            Some(&Record::Error {
                id: 1,
                message: "program exited with status 7".to_string()
            })
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_killed_by_signal() {
        let (termination, collector) = run("kill -9 $$").await;

        assert_eq!(termination, Termination::Signaled(9));
        assert_eq!(
            collector.records().last(),
            Some(&Record::Error {
                id: 1,
                message: "program killed by signal 9 (SIGKILL)".to_string()
            })
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unterminated_line_is_flushed() {
        let (termination, collector) = run("head -c 10000 /dev/zero | tr '\\0' x").await;

        assert_eq!(termination, Termination::Success);
        let lines = collector.lines(1, Stream::Stdout);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), 10000);
        assert!(lines[0].bytes().all(|b| b == b'x'));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_small_writes_are_one_line() {
        let (_, collector) =
            run("printf ab; sleep 0.1; printf 'cd\\r\\n'; sleep 0.1; printf ef").await;

        assert_eq!(collector.lines(1, Stream::Stdout), vec!["abcd", "ef"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_output() {
        let (termination, collector) = run("true").await;

        assert_eq!(termination, Termination::Success);
        assert!(collector
            .records()
            .iter()
            .all(|r| !matches!(r, Record::Output { .. })));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_output_precedes_exit_status() {
        let (_, collector) = run("for i in 1 2 3; do echo $i; echo $i >&2; done; exit 3").await;

        let records = collector.records();
        let exit_idx = records
            .iter()
            .position(|r| matches!(r, Record::Error { .. }))
            .unwrap();
        assert_eq!(exit_idx, records.len() - 1);
        assert_eq!(
            records
                .iter()
                .filter(|r| matches!(r, Record::Output { .. }))
                .count(),
            6
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_startup_failure() {
        let collector = Arc::new(Collector::new());
        let mut instance = Instance::new(4, InstanceSpec::new("/nonexistent/mrun-test", Vec::<String>::new()));

        let err = instance.start(collector.clone()).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Spawn { .. }));
        assert!(matches!(instance.state(), State::StartupFailed(_)));
        assert_eq!(instance.pid(), None);

        assert!(matches!(
            instance.kill().await.unwrap_err().kind(),
            ErrorKind::NotRunning(4)
        ));
        assert_eq!(instance.join().await, None);
        assert!(collector.records().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_kill() {
        let collector = Arc::new(Collector::new());
        let mut instance = Instance::new(2, InstanceSpec::new("sleep", vec!["30"]));

        instance.start(collector.clone()).unwrap();
        instance.kill().await.unwrap();

        assert_eq!(instance.join().await, Some(Termination::Signaled(9)));
        assert!(matches!(
            instance.kill().await.unwrap_err().kind(),
            ErrorKind::NotRunning(2)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_twice() {
        let collector = Arc::new(Collector::new());
        let mut instance = Instance::new(1, sh("true"));

        instance.start(collector.clone()).unwrap();
        assert!(instance.start(collector.clone()).is_err());
        assert_eq!(instance.join().await, Some(Termination::Success));
        assert_eq!(instance.join().await, Some(Termination::Success));
    }

    #[test]
    fn test_termination_display() {
        assert_eq!(
            Termination::Signaled(15).to_string(),
            "program killed by signal 15 (SIGTERM)"
        );
        assert_eq!(
            Termination::WaitFailed("boom".to_string()).to_string(),
            "program failed: boom"
        );
    }
}
