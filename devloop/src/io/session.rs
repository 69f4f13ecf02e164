//! Long-lived code-generation agent processes.
//!
//! An [`AgentSession`] owns at most one child process. Reader threads forward
//! stdout/stderr lines into a bounded channel; [`AgentSession::send`] writes a
//! prompt and polls that channel until the reply is complete:
//!
//! - a line containing the completion marker ends the reply normally
//! - a line containing the error marker ends it as an agent-reported error
//! - silence for `idle_timeout_ms` after some output ends it as idle
//! - the caller's timeout ends it with [`AgentError::Timeout`]
//!
//! A crashed process (EOF on stdout, broken pipe) is replaced wholesale and the
//! prompt replayed, with bounded exponential backoff between attempts. A
//! process whose last exchange timed out or went idle may still be answering
//! that prompt, so it is replaced before the next one is written.

use std::collections::{BTreeMap, VecDeque};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{Receiver, RecvTimeoutError, sync_channel};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::retry::BackoffPolicy;
use crate::core::types::{AgentReply, ReplyEnd};
use crate::error::AgentError;
use crate::io::process::{PipeEvent, Stream, spawn_line_reader};

const STDERR_TAIL_LINES: usize = 20;

/// One request/response conversation partner.
///
/// [`AgentSession`] is the process-backed implementation; tests script replies.
pub trait Agent {
    /// Send a prompt and wait for the reply, restarting a crashed backend as needed.
    fn exchange(&mut self, prompt: &str, timeout: Duration) -> Result<AgentReply, AgentError>;

    /// Cheap liveness probe. Never errors.
    fn health_check(&mut self) -> bool;

    /// Replace the backend with a fresh one. Counts as a restart.
    fn restart(&mut self) -> Result<(), AgentError>;

    /// Restarts performed so far.
    fn restarts(&self) -> u32;

    fn shutdown(&mut self, graceful: bool);
}

/// Creates one agent per task run.
pub trait AgentLauncher: Send + Sync {
    type Agent: Agent;

    fn launch(&self, workdir: &Path) -> Result<Self::Agent, AgentError>;
}

/// Agent process settings (`[agent]` config section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Program and arguments. The prompt arrives on stdin. Empty until configured.
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Line fragment announcing readiness. `None` means ready on spawn.
    pub ready_marker: Option<String>,
    pub completion_marker: String,
    pub error_marker: Option<String>,
    /// Line written after each prompt so the agent knows where it ends.
    pub prompt_terminator: Option<String>,
    /// Prompt used by `health_check` for a round trip. `None` checks liveness only.
    pub health_probe: Option<String>,
    pub startup_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub health_timeout_ms: u64,
    /// Grace period for each step of a graceful stop.
    pub stop_grace_ms: u64,
    /// Bounded line queue between reader threads and `send`.
    pub queue_capacity: usize,
    pub restart: BackoffPolicy,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            env: BTreeMap::new(),
            ready_marker: None,
            completion_marker: "<<DONE>>".to_string(),
            error_marker: Some("<<ERROR>>".to_string()),
            prompt_terminator: Some("<<<END>>>".to_string()),
            health_probe: None,
            startup_timeout_ms: 30_000,
            idle_timeout_ms: 120_000,
            health_timeout_ms: 10_000,
            stop_grace_ms: 2_000,
            queue_capacity: 1_024,
            restart: BackoffPolicy::default(),
        }
    }
}

/// A live child process with its reader threads.
pub struct AgentProcessHandle {
    child: Child,
    stdin: Option<ChildStdin>,
    events: Receiver<PipeEvent>,
    readers: Vec<JoinHandle<()>>,
    started_at: Instant,
}

impl AgentProcessHandle {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn exit_description(&mut self) -> String {
        match self.child.wait_timeout(Duration::from_millis(200)) {
            Ok(Some(status)) => status.to_string(),
            Ok(None) => "output closed while the process kept running".to_string(),
            Err(e) => format!("status unavailable: {e}"),
        }
    }

    /// Stop the process and detach its readers. Always consumes the handle.
    fn release(self, graceful: bool, grace: Duration) {
        let Self {
            mut child,
            stdin,
            events,
            readers,
            ..
        } = self;
        let pid = child.id();

        // EOF on stdin is the politest stop request.
        drop(stdin);
        let mut exited = matches!(child.try_wait(), Ok(Some(_)));
        if graceful && !exited {
            for signal in [Signal::Interrupt, Signal::Terminate] {
                send_signal(pid, signal);
                if matches!(child.wait_timeout(grace), Ok(Some(_))) {
                    debug!(pid, ?signal, "agent exited after signal");
                    exited = true;
                    break;
                }
            }
        }
        if !exited {
            if let Err(e) = child.kill() {
                debug!(pid, err = %e, "kill failed");
            }
            child.wait().ok();
        }

        // Not joined: a grandchild may still hold the pipes. Readers exit on
        // EOF or on their next send once the receiver is gone.
        drop(events);
        drop(readers);
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Interrupt,
    Terminate,
}

#[cfg(unix)]
#[allow(unsafe_code, reason = "libc::kill has no safe wrapper in std")]
fn send_signal(pid: u32, signal: Signal) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    let sig = match signal {
        Signal::Interrupt => libc::SIGINT,
        Signal::Terminate => libc::SIGTERM,
    };
    // SAFETY: plain syscall on a pid we spawned; no memory is shared.
    let rc = unsafe { libc::kill(pid, sig) };
    if rc != 0 {
        debug!(pid, ?signal, "signal delivery failed");
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: Signal) {}

pub struct AgentSession {
    settings: AgentSettings,
    workdir: PathBuf,
    handle: Option<AgentProcessHandle>,
    restarts: u32,
    /// The last exchange ended before the agent finished its reply.
    busy: bool,
}

impl AgentSession {
    /// Spawn the agent and wait for readiness.
    #[instrument(skip_all, fields(workdir = %workdir.display()))]
    pub fn start(workdir: &Path, settings: AgentSettings) -> Result<Self, AgentError> {
        let mut session = Self {
            settings,
            workdir: workdir.to_path_buf(),
            handle: None,
            restarts: 0,
            busy: false,
        };
        session.spawn()?;
        Ok(session)
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(AgentProcessHandle::pid)
    }

    fn spawn(&mut self) -> Result<(), AgentError> {
        let Some((program, args)) = self.settings.command.split_first() else {
            return Err(AgentError::Startup {
                reason: "agent command is empty".to_string(),
            });
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&self.settings.env)
            .current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| AgentError::Startup {
            reason: format!("spawn {program}: {e}"),
        })?;
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            child.kill().ok();
            child.wait().ok();
            return Err(AgentError::Startup {
                reason: "agent pipes were not captured".to_string(),
            });
        };

        let (tx, events) = sync_channel(self.settings.queue_capacity.max(1));
        let readers = vec![
            spawn_line_reader(stdout, Stream::Stdout, tx.clone()),
            spawn_line_reader(stderr, Stream::Stderr, tx),
        ];
        let mut handle = AgentProcessHandle {
            child,
            stdin: Some(stdin),
            events,
            readers,
            started_at: Instant::now(),
        };

        if let Err(err) = self.wait_ready(&mut handle) {
            handle.release(false, self.grace());
            return Err(err);
        }
        info!(pid = handle.pid(), "agent started");
        self.handle = Some(handle);
        Ok(())
    }

    fn wait_ready(&self, handle: &mut AgentProcessHandle) -> Result<(), AgentError> {
        let Some(marker) = self.settings.ready_marker.as_deref() else {
            return Ok(());
        };
        let deadline = Instant::now() + Duration::from_millis(self.settings.startup_timeout_ms);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AgentError::Startup {
                    reason: format!(
                        "no readiness signal within {}ms",
                        self.settings.startup_timeout_ms
                    ),
                });
            }
            match handle.events.recv_timeout(remaining) {
                Ok(PipeEvent::Line(Stream::Stdout, line)) if line.contains(marker) => {
                    return Ok(());
                }
                Ok(PipeEvent::Line(stream, line)) => {
                    debug!(?stream, line = %line, "agent startup output");
                }
                Ok(PipeEvent::Closed(Stream::Stderr)) => {}
                Ok(PipeEvent::Closed(Stream::Stdout)) | Err(RecvTimeoutError::Disconnected) => {
                    return Err(AgentError::Startup {
                        reason: format!("exited before ready ({})", handle.exit_description()),
                    });
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    fn grace(&self) -> Duration {
        Duration::from_millis(self.settings.stop_grace_ms)
    }

    /// Release the current process, if any, and spawn a new one.
    pub fn restart(&mut self) -> Result<(), AgentError> {
        if let Some(handle) = self.handle.take() {
            handle.release(false, self.grace());
        }
        self.restarts += 1;
        self.busy = false;
        self.spawn()
    }

    /// Single exchange with the current process. No restart on failure.
    ///
    /// If the previous exchange timed out or went idle, the process is replaced
    /// first so its late output cannot complete this one.
    #[instrument(
        skip_all,
        fields(
            prompt_len = prompt.len(),
            timeout_ms = timeout.as_millis() as u64
        )
    )]
    pub fn send(&mut self, prompt: &str, timeout: Duration) -> Result<AgentReply, AgentError> {
        if self.busy {
            debug!("replacing agent still busy with an earlier prompt");
            self.restart()?;
        }
        let settings = &self.settings;
        let handle = self.handle.as_mut().ok_or(AgentError::NotRunning)?;

        // Output from an earlier exchange that timed out must not leak into this one.
        let mut stale = 0usize;
        loop {
            match handle.events.try_recv() {
                Ok(PipeEvent::Closed(Stream::Stdout)) => {
                    return Err(AgentError::Crashed {
                        status: handle.exit_description(),
                    });
                }
                Ok(_) => stale += 1,
                Err(_) => break,
            }
        }
        if stale > 0 {
            debug!(stale, "dropped stale agent output");
        }

        write_prompt(handle, prompt, settings.prompt_terminator.as_deref())?;
        let result = collect_reply(handle, settings, timeout);
        self.busy = matches!(
            result,
            Err(AgentError::Timeout { .. })
                | Ok(AgentReply {
                    ended: ReplyEnd::Idle,
                    ..
                })
        );
        result
    }

    /// Send with crash recovery: restart with backoff and replay the prompt.
    ///
    /// Replays share `timeout` with the first attempt. When the next backoff
    /// would overrun it, the exchange ends as [`AgentError::Timeout`].
    pub fn send_with_recovery(
        &mut self,
        prompt: &str,
        timeout: Duration,
    ) -> Result<AgentReply, AgentError> {
        let deadline = Instant::now() + timeout;
        let mut last = match self.send(prompt, timeout) {
            Err(err) if err.needs_restart() => err,
            other => return other,
        };
        let out_of_time = || AgentError::Timeout {
            timeout,
            partial: String::new(),
        };

        let policy = self.settings.restart.clone();
        for attempt in 1..=policy.max_attempts {
            let delay = policy.delay_for(attempt);
            if Instant::now() + delay >= deadline {
                warn!(attempt, error = %last, "no time left to restart agent");
                return Err(out_of_time());
            }
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %last,
                "agent session lost, restarting"
            );
            if let Some(handle) = self.handle.take() {
                handle.release(false, self.grace());
            }
            thread::sleep(delay);
            self.restarts += 1;
            self.busy = false;

            if let Err(err) = self.spawn() {
                last = err;
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(out_of_time());
            }
            match self.send(prompt, remaining) {
                Err(err) if err.needs_restart() => last = err,
                other => return other,
            }
        }

        self.stop(false);
        Err(AgentError::Unrecoverable {
            attempts: policy.max_attempts,
            last: last.to_string(),
        })
    }

    /// False when the process is gone or still busy with an unfinished reply.
    pub fn health_check(&mut self) -> bool {
        if self.busy {
            return false;
        }
        let Some(handle) = self.handle.as_mut() else {
            return false;
        };
        if !matches!(handle.child.try_wait(), Ok(None)) {
            return false;
        }
        match self.settings.health_probe.clone() {
            Some(probe) => {
                let timeout = Duration::from_millis(self.settings.health_timeout_ms);
                matches!(
                    self.send(&probe, timeout),
                    Ok(AgentReply {
                        ended: ReplyEnd::Completed,
                        ..
                    })
                )
            }
            None => true,
        }
    }

    /// Stop the process: interrupt, then terminate, then kill. Always releases the handle.
    #[instrument(skip_all, fields(graceful))]
    pub fn stop(&mut self, graceful: bool) {
        if let Some(handle) = self.handle.take() {
            let pid = handle.pid();
            handle.release(graceful, self.grace());
            info!(pid, graceful, "agent stopped");
        }
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        self.stop(false);
    }
}

impl Agent for AgentSession {
    fn exchange(&mut self, prompt: &str, timeout: Duration) -> Result<AgentReply, AgentError> {
        self.send_with_recovery(prompt, timeout)
    }

    fn health_check(&mut self) -> bool {
        AgentSession::health_check(self)
    }

    fn restart(&mut self) -> Result<(), AgentError> {
        AgentSession::restart(self)
    }

    fn restarts(&self) -> u32 {
        self.restarts
    }

    fn shutdown(&mut self, graceful: bool) {
        self.stop(graceful);
    }
}

fn write_prompt(
    handle: &mut AgentProcessHandle,
    prompt: &str,
    terminator: Option<&str>,
) -> Result<(), AgentError> {
    let Some(stdin) = handle.stdin.as_mut() else {
        return Err(AgentError::NotRunning);
    };
    let mut payload = String::with_capacity(prompt.len() + 16);
    payload.push_str(prompt);
    if !payload.ends_with('\n') {
        payload.push('\n');
    }
    if let Some(terminator) = terminator {
        payload.push_str(terminator);
        payload.push('\n');
    }
    let written = stdin
        .write_all(payload.as_bytes())
        .and_then(|()| stdin.flush());
    match written {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::BrokenPipe => Err(AgentError::Crashed {
            status: format!("broken pipe ({})", handle.exit_description()),
        }),
        Err(e) => Err(AgentError::Io(e)),
    }
}

fn collect_reply(
    handle: &mut AgentProcessHandle,
    settings: &AgentSettings,
    timeout: Duration,
) -> Result<AgentReply, AgentError> {
    let idle = Duration::from_millis(settings.idle_timeout_ms);
    let deadline = Instant::now() + timeout;
    let mut buffer = String::new();
    let mut stderr_tail: VecDeque<String> = VecDeque::new();
    let mut last_output = Instant::now();

    let finish = |text: String, ended: ReplyEnd, tail: VecDeque<String>| AgentReply {
        text,
        ended,
        stderr_tail: Vec::from(tail).join("\n"),
    };

    loop {
        let now = Instant::now();
        let remaining = deadline.saturating_duration_since(now);
        if remaining.is_zero() {
            warn!(partial_len = buffer.len(), "agent reply timed out");
            return Err(AgentError::Timeout {
                timeout,
                partial: buffer,
            });
        }
        let wait = if buffer.trim().is_empty() {
            remaining
        } else {
            remaining.min(idle.saturating_sub(now.duration_since(last_output)))
        };

        match handle.events.recv_timeout(wait) {
            Ok(PipeEvent::Line(Stream::Stdout, line)) => {
                last_output = Instant::now();
                if let Some(idx) = line.find(settings.completion_marker.as_str()) {
                    buffer.push_str(&line[..idx]);
                    return Ok(finish(buffer, ReplyEnd::Completed, stderr_tail));
                }
                if let Some(marker) = settings.error_marker.as_deref()
                    && line.contains(marker)
                {
                    buffer.push_str(&line);
                    return Ok(finish(buffer, ReplyEnd::ErrorMarker, stderr_tail));
                }
                buffer.push_str(&line);
                buffer.push('\n');
            }
            Ok(PipeEvent::Line(Stream::Stderr, line)) => {
                if stderr_tail.len() == STDERR_TAIL_LINES {
                    stderr_tail.pop_front();
                }
                stderr_tail.push_back(line);
            }
            Ok(PipeEvent::Closed(Stream::Stderr)) => {}
            Ok(PipeEvent::Closed(Stream::Stdout)) | Err(RecvTimeoutError::Disconnected) => {
                return Err(AgentError::Crashed {
                    status: handle.exit_description(),
                });
            }
            Err(RecvTimeoutError::Timeout) => {
                if !buffer.trim().is_empty() && last_output.elapsed() >= idle {
                    debug!(idle_ms = settings.idle_timeout_ms, "agent went idle");
                    return Ok(finish(buffer, ReplyEnd::Idle, stderr_tail));
                }
            }
        }
    }
}

/// Launches an [`AgentSession`] per task.
#[derive(Debug, Clone)]
pub struct ProcessAgentLauncher {
    settings: AgentSettings,
}

impl ProcessAgentLauncher {
    pub fn new(settings: AgentSettings) -> Self {
        Self { settings }
    }
}

impl AgentLauncher for ProcessAgentLauncher {
    type Agent = AgentSession;

    fn launch(&self, workdir: &Path) -> Result<AgentSession, AgentError> {
        AgentSession::start(workdir, self.settings.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ECHO_AGENT: &str = r#"echo READY
while IFS= read -r line; do
  if [ "$line" = "<<<END>>>" ]; then
    echo "work complete"
    echo "<<DONE>>"
  fi
done"#;

    fn settings(script: &str) -> AgentSettings {
        AgentSettings {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            ready_marker: Some("READY".to_string()),
            startup_timeout_ms: 5_000,
            idle_timeout_ms: 5_000,
            stop_grace_ms: 500,
            restart: BackoffPolicy {
                max_attempts: 2,
                base_delay_ms: 10,
                max_delay_ms: 50,
                multiplier: 2.0,
                jitter: 0.0,
            },
            ..AgentSettings::default()
        }
    }

    #[test]
    fn exchange_collects_until_completion_marker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut session = AgentSession::start(temp.path(), settings(ECHO_AGENT)).expect("start");
        let reply = session
            .send("do the thing", Duration::from_secs(5))
            .expect("send");
        assert_eq!(reply.ended, ReplyEnd::Completed);
        assert_eq!(reply.text, "work complete\n");
        assert!(session.health_check());

        let again = session.send("again", Duration::from_secs(5)).expect("send");
        assert_eq!(again.text, "work complete\n");
        session.stop(true);
        assert!(!session.is_running());
        assert!(!session.health_check());
    }

    #[test]
    fn error_marker_ends_reply() {
        let script = r#"while IFS= read -r line; do
  if [ "$line" = "<<<END>>>" ]; then echo "cannot proceed <<ERROR>>"; fi
done"#;
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = settings(script);
        cfg.ready_marker = None;
        let mut session = AgentSession::start(temp.path(), cfg).expect("start");
        let reply = session.send("x", Duration::from_secs(5)).expect("send");
        assert_eq!(reply.ended, ReplyEnd::ErrorMarker);
        assert!(reply.text.contains("cannot proceed"));
    }

    #[test]
    fn silent_process_times_out() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = settings("echo READY; while IFS= read -r line; do :; done");
        cfg.idle_timeout_ms = 50;
        let mut session = AgentSession::start(temp.path(), cfg).expect("start");
        let err = session
            .send("anyone there?", Duration::from_millis(300))
            .expect_err("timeout");
        assert!(matches!(err, AgentError::Timeout { ref partial, .. } if partial.is_empty()));
    }

    #[test]
    fn quiet_output_ends_as_idle() {
        let script = r#"while IFS= read -r line; do
  if [ "$line" = "<<<END>>>" ]; then echo "partial answer"; fi
done"#;
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = settings(script);
        cfg.ready_marker = None;
        cfg.idle_timeout_ms = 100;
        let mut session = AgentSession::start(temp.path(), cfg).expect("start");
        let reply = session.send("x", Duration::from_secs(5)).expect("send");
        assert_eq!(reply.ended, ReplyEnd::Idle);
        assert_eq!(reply.text, "partial answer\n");
    }

    /// Agent that answers each prompt slowly, naming the prompt it answers.
    const SLOW_AGENT: &str = r#"echo READY
while IFS= read -r line; do
  if [ "$line" = "<<<END>>>" ]; then
    echo "thinking about $prompt"
    sleep 0.6
    echo "reply for $prompt"
    echo "<<DONE>>"
  else
    prompt="$line"
  fi
done"#;

    #[test]
    fn late_reply_does_not_complete_the_next_prompt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut session = AgentSession::start(temp.path(), settings(SLOW_AGENT)).expect("start");
        let err = session
            .send("first", Duration::from_millis(200))
            .expect_err("timeout");
        assert!(matches!(err, AgentError::Timeout { .. }));
        assert!(!session.health_check());

        let reply = session.send("second", Duration::from_secs(5)).expect("send");
        assert_eq!(reply.ended, ReplyEnd::Completed);
        assert_eq!(reply.text, "thinking about second\nreply for second\n");
        assert_eq!(session.restarts(), 1);
        assert!(session.health_check());
    }

    #[test]
    fn idle_reply_replaces_the_process_before_the_next_prompt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = settings(SLOW_AGENT);
        cfg.idle_timeout_ms = 100;
        let mut session = AgentSession::start(temp.path(), cfg).expect("start");
        let first = session.send("first", Duration::from_secs(5)).expect("send");
        assert_eq!(first.ended, ReplyEnd::Idle);
        assert_eq!(first.text, "thinking about first\n");

        let second = session.send("second", Duration::from_secs(5)).expect("send");
        assert_eq!(second.text, "thinking about second\n");
        assert_eq!(session.restarts(), 1);
    }

    #[test]
    fn explicit_restart_spawns_a_new_process() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut session = AgentSession::start(temp.path(), settings(ECHO_AGENT)).expect("start");
        let before = session.pid();
        session.restart().expect("restart");
        assert_ne!(session.pid(), before);
        assert_eq!(session.restarts(), 1);
        assert!(session.health_check());
    }

    #[test]
    fn missing_ready_signal_is_a_startup_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = settings("sleep 5");
        cfg.startup_timeout_ms = 100;
        let err = AgentSession::start(temp.path(), cfg)
            .err()
            .expect("startup error");
        assert!(matches!(err, AgentError::Startup { .. }));
    }

    /// Verifies a crash mid-session restarts the process and replays the prompt.
    #[test]
    fn crash_recovers_with_restart() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = r#"echo READY
while IFS= read -r line; do
  if [ "$line" = "<<<END>>>" ]; then
    if [ ! -f crashed.flag ]; then touch crashed.flag; exit 1; fi
    echo "recovered"
    echo "<<DONE>>"
  fi
done"#;
        let mut session = AgentSession::start(temp.path(), settings(script)).expect("start");
        let reply = session
            .exchange("work", Duration::from_secs(5))
            .expect("recovered exchange");
        assert_eq!(reply.text, "recovered\n");
        assert_eq!(session.restarts(), 1);
    }

    #[test]
    fn repeated_crashes_are_unrecoverable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = "echo READY; read -r line; exit 3";
        let mut session = AgentSession::start(temp.path(), settings(script)).expect("start");
        let err = session
            .exchange("work", Duration::from_secs(5))
            .expect_err("unrecoverable");
        assert!(matches!(err, AgentError::Unrecoverable { attempts: 2, .. }));
        assert!(!session.is_running());
    }

    /// Verifies that restart backoff stops once the caller's timeout is spent.
    #[test]
    fn recovery_stays_within_the_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = settings("echo READY; read -r line; exit 3");
        cfg.restart = BackoffPolicy {
            max_attempts: 5,
            base_delay_ms: 400,
            max_delay_ms: 400,
            multiplier: 1.0,
            jitter: 0.0,
        };
        let mut session = AgentSession::start(temp.path(), cfg).expect("start");
        let started = Instant::now();
        let err = session
            .exchange("work", Duration::from_millis(500))
            .expect_err("out of time");
        assert!(matches!(err, AgentError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_millis(1_500));
        assert!(session.restarts() <= 1);
    }

    #[test]
    fn empty_command_fails_to_start() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = AgentSettings {
            command: Vec::new(),
            ..AgentSettings::default()
        };
        assert!(matches!(
            AgentSession::start(temp.path(), cfg),
            Err(AgentError::Startup { .. })
        ));
    }
}
