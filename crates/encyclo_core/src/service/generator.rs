//! Content generator collaborator.
//!
//! # Responsibility
//! - Define the contract for the external topic -> markdown generator.
//! - Bound every generator call by a deadline, and keep track of calls that
//!   outlived it.
//!
//! # Invariants
//! - A call that outlives its deadline is reported as `Timeout`; its eventual
//!   output is discarded.
//! - The cancel token of an expired call is set before the caller regains
//!   control.
//! - An exit hook registered on an abandoned worker runs exactly once, after
//!   the generator returned or unwound.

use crate::content::briefings::LinkBriefing;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// Generator failure. The resolver treats every variant as `GenerationFailed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratorError {
    Timeout,
    /// Output was empty or unusable.
    Malformed(String),
    /// Upstream service failed.
    Upstream(String),
}

impl Display for GeneratorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "generator timed out"),
            Self::Malformed(message) => write!(f, "generator returned malformed output: {message}"),
            Self::Upstream(message) => write!(f, "generator upstream failure: {message}"),
        }
    }
}

impl Error for GeneratorError {}

impl GeneratorError {
    /// Stable short code used in log lines.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Malformed(_) => "malformed",
            Self::Upstream(_) => "upstream_failure",
        }
    }
}

/// Cooperative cancellation flag shared with a running generator.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a generator is given for one topic.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Display title, e.g. `Giant Squid`.
    pub title: String,
    /// Caller-supplied framing for the article, if any.
    pub summary_hint: Option<String>,
    /// Excerpts from articles that already link to this topic.
    pub link_briefings: Vec<LinkBriefing>,
    pub timeout: Duration,
    /// Set once the resolver stopped waiting; long-running generators should
    /// poll it and return early.
    pub cancel: CancelToken,
}

impl GenerationRequest {
    pub fn new(title: impl Into<String>, timeout: Duration) -> Self {
        Self {
            title: title.into(),
            summary_hint: None,
            link_briefings: Vec::new(),
            timeout,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_summary_hint(mut self, summary_hint: Option<String>) -> Self {
        self.summary_hint = summary_hint;
        self
    }

    pub fn with_link_briefings(mut self, link_briefings: Vec<LinkBriefing>) -> Self {
        self.link_briefings = link_briefings;
        self
    }
}

/// Produces markdown for a topic.
///
/// Implementations should honour `request.timeout` and `request.cancel`
/// themselves where they can; the resolver enforces the deadline regardless.
pub trait ContentGenerator: Send + Sync {
    fn generate(&self, request: &GenerationRequest) -> Result<String, GeneratorError>;
}

impl<F> ContentGenerator for F
where
    F: Fn(&GenerationRequest) -> Result<String, GeneratorError> + Send + Sync,
{
    fn generate(&self, request: &GenerationRequest) -> Result<String, GeneratorError> {
        self(request)
    }
}

/// Callback run on the worker thread once an abandoned generator exits.
pub type ExitHook = Box<dyn FnOnce() + Send>;

enum WorkerState {
    Running,
    Exited,
    Abandoned(ExitHook),
}

struct WorkerExit {
    state: Mutex<WorkerState>,
    exited: Condvar,
}

impl WorkerExit {
    fn state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Flips the worker to `Exited` on every way out of the thread, unwinding
/// included, and runs a pending exit hook.
struct ExitNotifier(Arc<WorkerExit>);

impl Drop for ExitNotifier {
    fn drop(&mut self) {
        let previous = std::mem::replace(&mut *self.0.state(), WorkerState::Exited);
        self.0.exited.notify_all();
        if let WorkerState::Abandoned(hook) = previous {
            hook();
        }
    }
}

/// Handle to a generator worker whose caller stopped waiting.
pub struct AbandonedWorker {
    exit: Arc<WorkerExit>,
}

impl AbandonedWorker {
    pub fn has_exited(&self) -> bool {
        matches!(*self.exit.state(), WorkerState::Exited)
    }

    /// Runs `hook` on the worker thread once the generator returns.
    ///
    /// Returns `false` when the worker had already exited; `hook` then runs
    /// on the calling thread before this returns.
    pub fn on_exit(self, hook: ExitHook) -> bool {
        let mut state = self.exit.state();
        if matches!(*state, WorkerState::Running) {
            *state = WorkerState::Abandoned(hook);
            return true;
        }
        drop(state);
        hook();
        false
    }

    /// Blocks until the worker exits or `limit` elapses; returns whether it exited.
    pub fn wait_for_exit(&self, limit: Duration) -> bool {
        let state = self.exit.state();
        let (state, _) = self
            .exit
            .exited
            .wait_timeout_while(state, limit, |state| !matches!(state, WorkerState::Exited))
            .unwrap_or_else(PoisonError::into_inner);
        matches!(*state, WorkerState::Exited)
    }
}

/// Outcome of [`run_with_deadline`].
pub enum Deadline {
    Finished(Result<String, GeneratorError>),
    /// Deadline passed; the worker was told to cancel but may still be running.
    Expired(AbandonedWorker),
}

/// Runs `generator` on a worker thread and waits at most `request.timeout`.
pub fn run_with_deadline(
    generator: &Arc<dyn ContentGenerator>,
    request: GenerationRequest,
) -> Deadline {
    let (tx, rx) = mpsc::sync_channel(1);
    let exit = Arc::new(WorkerExit {
        state: Mutex::new(WorkerState::Running),
        exited: Condvar::new(),
    });
    let worker_exit = Arc::clone(&exit);
    let worker_generator = Arc::clone(generator);
    let timeout = request.timeout;
    let cancel = request.cancel.clone();

    let spawned = thread::Builder::new()
        .name("encyclo-generator".to_string())
        .spawn(move || {
            let _exit = ExitNotifier(worker_exit);
            let result = worker_generator.generate(&request);
            // Receiver is gone when the caller already timed out.
            let _ = tx.send(result);
        });
    if let Err(err) = spawned {
        return Deadline::Finished(Err(GeneratorError::Upstream(format!(
            "failed to spawn generator: {err}"
        ))));
    }

    match rx.recv_timeout(timeout) {
        Ok(result) => Deadline::Finished(result),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            cancel.cancel();
            Deadline::Expired(AbandonedWorker { exit })
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Deadline::Finished(Err(
            GeneratorError::Upstream("generator worker exited without a result".to_string()),
        )),
    }
}
