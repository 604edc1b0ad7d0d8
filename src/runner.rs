//! Background execution of the external tool.
//!
//! A worker task owns the child process. Lines read from its merged
//! stdout/stderr pipe, followed by one terminal status, travel over a channel
//! to the [`ProcessHandle`]. The handle replays them to a [`RunObserver`] on
//! whichever thread calls [`ProcessHandle::dispatch`], normally the UI thread
//! once per frame, so observers never run concurrently with UI mutation.

use std::fmt;
use std::io::{self, PipeReader, Read};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// How long a cancelled run waits for buffered output before reporting
const READER_GRACE: Duration = Duration::from_secs(2);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(1);

/// Terminal outcome of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Exited with code 0
    Success,
    /// Exited non-zero; `None` when killed by a signal
    Failure(Option<i32>),
    /// The executable could not be started
    LaunchError(String),
    /// Stopped through [`ProcessHandle::cancel`]
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => f.write_str("success"),
            RunStatus::Failure(Some(code)) => write!(f, "exit code {code}"),
            RunStatus::Failure(None) => f.write_str("terminated by signal"),
            RunStatus::LaunchError(msg) => write!(f, "launch error: {msg}"),
            RunStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug)]
enum RunEvent {
    Line(String),
    Completed(RunStatus),
}

/// Receives the output of a run. Called only from [`ProcessHandle::dispatch`].
pub trait RunObserver {
    /// One line of output, trailing whitespace removed.
    fn on_line(&mut self, line: &str);
    /// Always the last call for a handle, made exactly once.
    fn on_complete(&mut self, status: &RunStatus);
}

/// Launches processes on a Tokio runtime.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    runtime: Handle,
}

impl ProcessRunner {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Starts `argv[0]` with the remaining arguments and returns immediately.
    ///
    /// Launch failures are not returned here; they arrive as
    /// [`RunStatus::LaunchError`] through the handle like any other outcome.
    pub fn start(&self, argv: Vec<String>) -> ProcessHandle {
        let id = NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed);
        let (event_tx, events) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();

        info!(run = id, ?argv, "Starting external process");
        self.runtime
            .spawn(supervise(id, argv.clone(), event_tx, cancel_rx));

        ProcessHandle {
            id,
            argv,
            events,
            cancel: Some(cancel_tx),
            status: None,
        }
    }

    pub fn cancel(&self, handle: &mut ProcessHandle) {
        handle.cancel();
    }
}

/// One in-flight invocation. Dropping a live handle kills the process.
#[derive(Debug)]
pub struct ProcessHandle {
    id: u64,
    argv: Vec<String>,
    events: UnboundedReceiver<RunEvent>,
    cancel: Option<oneshot::Sender<()>>,
    status: Option<RunStatus>,
}

impl ProcessHandle {
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// True until the terminal status has been dispatched.
    pub fn is_live(&self) -> bool {
        self.status.is_none()
    }

    pub fn status(&self) -> Option<&RunStatus> {
        self.status.as_ref()
    }

    /// Asks the worker to kill the process. The terminal
    /// [`RunStatus::Cancelled`] still comes through [`dispatch`](Self::dispatch).
    pub fn cancel(&mut self) {
        if !self.is_live() {
            return;
        }
        if let Some(cancel) = self.cancel.take() {
            debug!(run = self.id, "Cancel requested");
            let _ = cancel.send(());
        }
    }

    /// Delivers every queued event to `observer`, in order, without blocking.
    /// Returns true once the run has completed; later calls do nothing.
    pub fn dispatch<O: RunObserver + ?Sized>(&mut self, observer: &mut O) -> bool {
        while self.is_live() {
            match self.events.try_recv() {
                Ok(RunEvent::Line(line)) => observer.on_line(&line),
                Ok(RunEvent::Completed(status)) => self.complete(status, observer),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    warn!(run = self.id, "Worker stopped without a status");
                    self.complete(RunStatus::Failure(None), observer);
                }
            }
        }
        !self.is_live()
    }

    fn complete<O: RunObserver + ?Sized>(&mut self, status: RunStatus, observer: &mut O) {
        observer.on_complete(&status);
        self.status = Some(status);
        self.cancel = None;
    }
}

async fn supervise(
    id: u64,
    argv: Vec<String>,
    events: UnboundedSender<RunEvent>,
    mut cancel: oneshot::Receiver<()>,
) {
    let status = match spawn_merged(&argv) {
        Ok((mut child, reader)) => {
            let pgid = child.id();
            let line_tx = events.clone();
            let mut pump = tokio::task::spawn_blocking(move || pump_lines(id, reader, &line_tx));

            let mut status = tokio::select! {
                waited = child.wait() => exit_status(id, waited),
                _ = &mut cancel => {
                    info!(run = id, "Killing external process");
                    kill_process_group(id, pgid);
                    if let Err(err) = child.kill().await {
                        warn!(run = id, error = %err, "Kill failed");
                    }
                    RunStatus::Cancelled
                }
            };

            // The tool may have exited while something it started still
            // holds the pipe, so cancel stays live until the output closes.
            let mut drained = false;
            if status != RunStatus::Cancelled {
                tokio::select! {
                    joined = &mut pump => {
                        report_pump(id, joined);
                        drained = true;
                    }
                    _ = &mut cancel => {
                        info!(run = id, "Killing processes left holding the output");
                        kill_process_group(id, pgid);
                        status = RunStatus::Cancelled;
                    }
                }
            }
            if !drained {
                match tokio::time::timeout(READER_GRACE, &mut pump).await {
                    Ok(joined) => report_pump(id, joined),
                    Err(_) => debug!(run = id, "Output still open after cancel, not waiting"),
                }
            }
            status
        }
        Err(err) => {
            warn!(run = id, program = ?argv.first(), error = %err, "Failed to launch external process");
            RunStatus::LaunchError(err.to_string())
        }
    };

    info!(run = id, %status, "External process finished");
    let _ = events.send(RunEvent::Completed(status));
}

fn report_pump(id: u64, joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        warn!(run = id, error = %err, "Output reader failed");
    }
}

/// SIGKILLs every process in the child's group, so helpers the tool started
/// (ffmpeg) die with it.
#[cfg(unix)]
fn kill_process_group(id: u64, pgid: Option<u32>) {
    let Some(pgid) = pgid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(run = id, error = %io::Error::last_os_error(), "Process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_id: u64, _pgid: Option<u32>) {}

/// Spawns with stdout and stderr sharing one pipe, so lines keep their
/// production order across both streams. On unix the child leads its own
/// process group.
fn spawn_merged(argv: &[String]) -> io::Result<(Child, PipeReader)> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty argument vector"))?;

    let (reader, writer) = io::pipe()?;
    let stderr_writer = writer.try_clone()?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(writer)
        .stderr(stderr_writer)
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);
    #[cfg(windows)]
    command.creation_flags(CREATE_NO_WINDOW);

    let child = command.spawn()?;
    // The command still holds our copies of the write end; EOF needs them gone.
    drop(command);
    Ok((child, reader))
}

fn exit_status(id: u64, waited: io::Result<ExitStatus>) -> RunStatus {
    match waited {
        Ok(status) if status.success() => RunStatus::Success,
        Ok(status) => RunStatus::Failure(status.code()),
        Err(err) => {
            warn!(run = id, error = %err, "Waiting on external process failed");
            RunStatus::Failure(None)
        }
    }
}

/// Blocking read loop; runs on Tokio's blocking pool.
fn pump_lines(id: u64, mut reader: PipeReader, events: &UnboundedSender<RunEvent>) {
    let mut splitter = LineSplitter::default();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                for line in splitter.feed(&buf[..n]) {
                    if events.send(RunEvent::Line(line)).is_err() {
                        return;
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(run = id, error = %err, "Read failed, treating as end of output");
                break;
            }
        }
    }
    if let Some(line) = splitter.finish() {
        let _ = events.send(RunEvent::Line(line));
    }
}

/// Splits a byte stream on `\n`, `\r\n` and bare `\r`.
#[derive(Debug, Default)]
struct LineSplitter {
    pending: Vec<u8>,
    after_cr: bool,
}

impl LineSplitter {
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            let after_cr = std::mem::take(&mut self.after_cr);
            match byte {
                b'\n' if after_cr => {}
                b'\n' => lines.push(self.take_line()),
                b'\r' => {
                    lines.push(self.take_line());
                    self.after_cr = true;
                }
                _ => self.pending.push(byte),
            }
        }
        lines
    }

    /// Unterminated tail, if any.
    fn finish(&mut self) -> Option<String> {
        (!self.pending.is_empty()).then(|| self.take_line())
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.pending).trim_end().to_owned();
        self.pending.clear();
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Seen {
        Line(String),
        Done(RunStatus),
    }

    #[derive(Default)]
    struct Recorder {
        seen: Vec<Seen>,
    }

    impl RunObserver for Recorder {
        fn on_line(&mut self, line: &str) {
            self.seen.push(Seen::Line(line.to_owned()));
        }

        fn on_complete(&mut self, status: &RunStatus) {
            self.seen.push(Seen::Done(status.clone()));
        }
    }

    fn line(s: &str) -> Seen {
        Seen::Line(s.to_owned())
    }

    fn runner() -> ProcessRunner {
        ProcessRunner::new(Handle::current())
    }

    #[cfg(unix)]
    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_owned(), "-c".to_owned(), script.to_owned()]
    }

    async fn run_to_end(handle: &mut ProcessHandle, recorder: &mut Recorder) -> RunStatus {
        let finished = tokio::time::timeout(Duration::from_secs(10), async {
            while !handle.dispatch(recorder) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(finished.is_ok(), "run did not finish in time");
        handle.status().cloned().unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lines_arrive_in_order_then_success() {
        let mut handle = runner().start(sh("echo line1; echo line2"));
        let mut rec = Recorder::default();

        assert_eq!(run_to_end(&mut handle, &mut rec).await, RunStatus::Success);
        assert_eq!(
            rec.seen,
            vec![line("line1"), line("line2"), Seen::Done(RunStatus::Success)]
        );
        assert!(!handle.is_live());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_is_merged_in_production_order() {
        let mut handle = runner().start(sh("echo out; echo err 1>&2; echo out2; echo err2 1>&2"));
        let mut rec = Recorder::default();

        run_to_end(&mut handle, &mut rec).await;
        assert_eq!(
            rec.seen,
            vec![
                line("out"),
                line("err"),
                line("out2"),
                line("err2"),
                Seen::Done(RunStatus::Success)
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_failure_with_code() {
        let mut handle = runner().start(sh("echo 'ERROR: unavailable'; exit 3"));
        let mut rec = Recorder::default();

        assert_eq!(run_to_end(&mut handle, &mut rec).await, RunStatus::Failure(Some(3)));
        assert_eq!(rec.seen[0], line("ERROR: unavailable"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn killed_by_signal_has_no_code() {
        let mut handle = runner().start(sh("kill -9 $$"));
        let mut rec = Recorder::default();

        assert_eq!(run_to_end(&mut handle, &mut rec).await, RunStatus::Failure(None));
    }

    #[tokio::test]
    async fn missing_binary_reports_launch_error_only() {
        let mut handle = runner().start(vec!["definitely-not-a-real-binary-3f9a".to_owned()]);
        let mut rec = Recorder::default();

        let status = run_to_end(&mut handle, &mut rec).await;
        assert!(matches!(status, RunStatus::LaunchError(_)));
        assert_eq!(rec.seen.len(), 1);
        assert!(matches!(rec.seen[0], Seen::Done(RunStatus::LaunchError(_))));
    }

    #[tokio::test]
    async fn empty_argv_reports_launch_error() {
        let mut handle = runner().start(Vec::new());
        let mut rec = Recorder::default();

        assert!(matches!(
            run_to_end(&mut handle, &mut rec).await,
            RunStatus::LaunchError(_)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_kills_and_still_completes() {
        let mut handle = runner().start(sh("echo started; exec sleep 30"));
        let mut rec = Recorder::default();
        wait_for_first_line(&mut handle, &mut rec).await;

        runner().cancel(&mut handle);
        assert_eq!(run_to_end(&mut handle, &mut rec).await, RunStatus::Cancelled);
        assert_eq!(rec.seen, vec![line("started"), Seen::Done(RunStatus::Cancelled)]);
    }

    #[cfg(unix)]
    async fn wait_for_first_line(handle: &mut ProcessHandle, rec: &mut Recorder) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while rec.seen.is_empty() {
                handle.dispatch(rec);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_after_tool_exit_stops_lingering_writer() {
        // sh exits at once; the backgrounded sleep keeps the pipe open
        let mut handle = runner().start(sh("sleep 8 & echo hi"));
        let mut rec = Recorder::default();
        wait_for_first_line(&mut handle, &mut rec).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let cancelled_at = std::time::Instant::now();
        handle.cancel();
        assert_eq!(run_to_end(&mut handle, &mut rec).await, RunStatus::Cancelled);
        assert!(cancelled_at.elapsed() < Duration::from_secs(4));
        assert_eq!(rec.seen, vec![line("hi"), Seen::Done(RunStatus::Cancelled)]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_kills_processes_the_tool_started() {
        let mut handle = runner().start(sh("sleep 30 & echo started; wait"));
        let mut rec = Recorder::default();
        wait_for_first_line(&mut handle, &mut rec).await;

        let cancelled_at = std::time::Instant::now();
        handle.cancel();
        assert_eq!(run_to_end(&mut handle, &mut rec).await, RunStatus::Cancelled);
        // Finishing before the reader grace ran out means the sleep let go of the pipe
        assert!(cancelled_at.elapsed() < READER_GRACE);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dropping_a_live_handle_kills_the_child() {
        let mut handle = runner().start(sh("echo $$; exec sleep 30"));
        let mut rec = Recorder::default();
        wait_for_first_line(&mut handle, &mut rec).await;
        let Seen::Line(pid) = &rec.seen[0] else {
            panic!("expected the pid line, got {:?}", rec.seen[0]);
        };
        let pid: libc::pid_t = pid.parse().unwrap();

        drop(handle);

        let gone = tokio::time::timeout(Duration::from_secs(5), async {
            // SAFETY: signal 0 only checks that the pid exists.
            while unsafe { libc::kill(pid, 0) } == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(gone.is_ok(), "child {pid} still alive after its handle was dropped");
    }

    #[test]
    fn vanished_worker_completes_as_failure() {
        let (event_tx, events) = mpsc::unbounded_channel();
        let mut handle = ProcessHandle {
            id: 0,
            argv: vec!["yt-dlp".to_owned()],
            events,
            cancel: None,
            status: None,
        };
        event_tx.send(RunEvent::Line("partial".to_owned())).unwrap();
        drop(event_tx);

        let mut rec = Recorder::default();
        assert!(handle.dispatch(&mut rec));
        assert!(handle.dispatch(&mut rec));
        assert_eq!(
            rec.seen,
            vec![line("partial"), Seen::Done(RunStatus::Failure(None))]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dispatch_after_completion_is_inert() {
        let mut handle = runner().start(sh("echo only"));
        let mut rec = Recorder::default();
        run_to_end(&mut handle, &mut rec).await;

        handle.cancel();
        assert!(handle.dispatch(&mut rec));
        assert_eq!(rec.seen.len(), 2);
        assert_eq!(handle.status(), Some(&RunStatus::Success));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unterminated_last_line_is_delivered() {
        let mut handle = runner().start(sh("printf 'a\\rb\\r\\nc'"));
        let mut rec = Recorder::default();

        run_to_end(&mut handle, &mut rec).await;
        assert_eq!(
            rec.seen,
            vec![line("a"), line("b"), line("c"), Seen::Done(RunStatus::Success)]
        );
    }

    #[test]
    fn splitter_handles_every_line_ending() {
        let mut splitter = LineSplitter::default();
        let mut lines = splitter.feed(b"one\ntwo\r\nthree\rfour  \t\n\nfi");
        lines.extend(splitter.feed(b"ve\r"));
        lines.extend(splitter.feed(b"\nsix"));
        lines.extend(splitter.finish());
        assert_eq!(lines, vec!["one", "two", "three", "four", "", "five", "six"]);
    }

    #[test]
    fn splitter_replaces_invalid_utf8() {
        let mut splitter = LineSplitter::default();
        let lines = splitter.feed(b"caf\xff\n");
        assert_eq!(lines, vec!["caf\u{fffd}"]);
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn status_display_mentions_exit_code() {
        assert_eq!(RunStatus::Failure(Some(2)).to_string(), "exit code 2");
        assert_eq!(RunStatus::Failure(None).to_string(), "terminated by signal");
    }
}
