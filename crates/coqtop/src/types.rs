use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Identifier of a point in the proof-script state tree.
pub type StateId = u64;

/// Caller-chosen identifier correlating an `Add` with its later edit feedback.
pub type EditId = i64;

/// Errors that can occur while talking to coqtop.
#[derive(Debug, thiserror::Error)]
pub enum CoqError {
    /// The coqtop process (or its wrapper) could not be started.
    #[error("Could not spawn coqtop: {0}")]
    Spawn(String),

    /// coqtop answered the call with a failure value.
    #[error("{0}")]
    Failure(Failure),

    /// A call did not complete within its deadline.
    #[error("{call}: timed out after {millis}ms")]
    Timeout { call: &'static str, millis: u64 },

    /// The session was torn down while the call was outstanding.
    #[error("coqtop session closed: {0}")]
    Closed(String),

    /// Unexpected response shape or an internal protocol invariant was broken.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The call needs a running coqtop and none is attached.
    #[error("coqtop is not running")]
    NotRunning,

    /// IO error from channel or process communication.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoqError {
    /// The failure payload, if this is a protocol-level failure.
    pub fn as_failure(&self) -> Option<&Failure> {
        match self {
            CoqError::Failure(f) => Some(f),
            _ => None,
        }
    }

    /// Whether the error invalidated the whole session (as opposed to a single call).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoqError::Spawn(_) | CoqError::Timeout { .. } | CoqError::Closed(_)
        )
    }
}

/// Half-open `[start, stop)` offset range into the submitted command text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Location {
    pub start: usize,
    pub stop: usize,
}

/// The terminal error shape coqtop reports for a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    /// State the failure refers to, when coqtop names one.
    pub state_id: Option<StateId>,
    pub message: String,
    pub location: Option<Location>,
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.location {
            Some(loc) => write!(f, "{} @ {}-{}", self.message, loc.start, loc.stop),
            None => f.write_str(&self.message),
        }
    }
}

/// A hypothesis of a goal, split at its first `:` or `:=`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hypothesis {
    pub identifier: String,
    pub relation: String,
    pub expression: String,
}

impl Hypothesis {
    /// Split a pretty-printed hypothesis such as `n, m : nat` or `x := 3 : nat`.
    ///
    /// Text without a separator becomes an expression with an empty identifier.
    pub fn parse(text: &str) -> Self {
        match text.find(':') {
            Some(pos) => {
                let identifier = text[..pos].trim().to_string();
                let rest = &text[pos + 1..];
                let (relation, expression) = match rest.strip_prefix('=') {
                    Some(value) => (":=", value),
                    None => (":", rest),
                };
                Hypothesis {
                    identifier,
                    relation: relation.to_string(),
                    expression: expression.trim().to_string(),
                }
            }
            None => Hypothesis {
                identifier: String::new(),
                relation: String::new(),
                expression: text.trim().to_string(),
            },
        }
    }
}

/// A goal snapshot returned by a `Goal` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Goal {
    pub id: u64,
    pub hypotheses: Vec<Hypothesis>,
    pub goal: String,
}

/// Result of a `Goal` call. Every list is `None` when no proof is open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GoalResult {
    pub goals: Option<Vec<Goal>>,
    pub background_goals: Option<Vec<Goal>>,
    pub shelved_goals: Option<Vec<Goal>>,
    pub abandoned_goals: Option<Vec<Goal>>,
}

/// Result of an `Add` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddResult {
    /// The new tip.
    pub state_id: StateId,
    /// Set when coqtop parked an unrelated branch to process this one.
    pub unfocused_state_id: Option<StateId>,
    pub message: String,
}

/// Alternate focus returned by `Edit_at` when the target lies in a closed proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NewFocus {
    /// State to focus on (the new tip).
    pub state_id: StateId,
    /// State that finalizes the refocused branch.
    pub qed_state_id: StateId,
    /// Tip to restore once the branch is finished.
    pub old_tip: StateId,
}

/// Result of an `Edit_at` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EditAtResult {
    pub new_focus: Option<NewFocus>,
}

/// Severity of a coqtop message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MessageLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
}

impl MessageLevel {
    pub fn from_wire(val: &str) -> Option<Self> {
        match val {
            "debug" => Some(MessageLevel::Debug),
            "info" => Some(MessageLevel::Info),
            "notice" => Some(MessageLevel::Notice),
            "warning" => Some(MessageLevel::Warning),
            "error" => Some(MessageLevel::Error),
            _ => None,
        }
    }
}

/// A message emitted by coqtop (query output, warnings, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub level: MessageLevel,
    pub message: String,
}

/// Processing status of a sentence, reported through state feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SentenceStatus {
    AddedAxiom,
    ProcessingIn,
    InProgress,
    Processed,
    Incomplete,
    Complete,
}

/// State of a coqtop proof worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Idle,
    Proof,
    Dead,
}

/// Status update for one worker lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    /// Worker name, e.g. `proofworker:0`.
    pub id: String,
    pub state: WorkerState,
    /// Name of the proof being checked, for `Proof` workers.
    pub ident: Option<String>,
}

impl WorkerStatus {
    /// Interpret the `(id, status)` string pair coqtop sends, e.g.
    /// `("proofworker:0", "proof: foo")`.
    pub fn from_wire(id: &str, status: &str) -> Self {
        let (state, ident) = if status.eq_ignore_ascii_case("idle") {
            (WorkerState::Idle, None)
        } else if status.eq_ignore_ascii_case("dead") {
            (WorkerState::Dead, None)
        } else {
            let ident = status
                .split_once(':')
                .map(|(_, name)| name.trim().to_string())
                .filter(|name| !name.is_empty());
            (WorkerState::Proof, ident)
        };
        WorkerStatus {
            id: id.to_string(),
            state,
            ident,
        }
    }
}

/// A library loaded while processing a state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileLoaded {
    pub module: String,
    pub file_path: String,
}

/// Error carried by state or edit feedback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorMessage {
    pub message: String,
    pub location: Option<Location>,
}

/// Timing entry of one Ltac profiling node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LtacProfEntry {
    pub total: f64,
    pub local: f64,
    pub ncalls: u64,
    pub max_total: f64,
}

/// Recursive Ltac profiling tree keyed by tactic name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LtacProfTree {
    pub entry: LtacProfEntry,
    pub children: BTreeMap<String, LtacProfTree>,
}

/// Result of `LtacProfResults`: top-level trees keyed by tactic name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LtacProfResults {
    pub results: BTreeMap<String, LtacProfTree>,
}

/// Configuration for a coqtop session.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CoqTopSettings {
    /// Directory containing the `coqtop` binary.
    #[serde(default = "default_coq_path")]
    pub coq_path: PathBuf,

    /// Optional wrapper executable that forwards to the real coqtop.
    #[serde(default)]
    pub wrapper: Option<PathBuf>,

    /// Extra arguments appended to the coqtop command line.
    #[serde(default)]
    pub args: Vec<String>,

    /// Loopback host the channel listeners bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Deadline for `Init`, also bounding channel accept.
    #[serde(default = "default_init_timeout")]
    pub init_timeout_ms: u64,

    /// Deadline after which `Quit` is forced.
    #[serde(default = "default_quit_timeout")]
    pub quit_timeout_ms: u64,

    /// Optional deadline for every other call; an interrupt is sent on expiry.
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
}

impl Default for CoqTopSettings {
    fn default() -> Self {
        Self {
            coq_path: default_coq_path(),
            wrapper: None,
            args: Vec::new(),
            host: default_host(),
            init_timeout_ms: default_init_timeout(),
            quit_timeout_ms: default_quit_timeout(),
            call_timeout_ms: None,
        }
    }
}

impl CoqTopSettings {
    /// Settings pointing at an auto-discovered coqtop installation.
    ///
    /// Returns `None` if no coqtop binary can be found.
    pub fn with_discovered_coqbin() -> Option<Self> {
        let coq_path = discover_coqbin()?;
        Some(Self {
            coq_path,
            ..Self::default()
        })
    }

    /// Full path of the coqtop binary.
    pub fn coqtop_binary(&self) -> PathBuf {
        self.coq_path.join(coqtop_file_name())
    }

    /// The wrapper to launch through, if one is configured and exists on disk.
    pub fn usable_wrapper(&self) -> Option<&Path> {
        self.wrapper
            .as_deref()
            .filter(|w| !w.as_os_str().is_empty() && w.is_file())
    }
}

fn coqtop_file_name() -> &'static str {
    if cfg!(windows) {
        "coqtop.exe"
    } else {
        "coqtop"
    }
}

/// Auto-discover the directory holding the coqtop binary.
///
/// Discovery chain (first match wins):
/// 1. `COQBIN` environment variable
/// 2. the first `PATH` entry containing a coqtop binary
pub fn discover_coqbin() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("COQBIN") {
        let p = PathBuf::from(path);
        if p.join(coqtop_file_name()).is_file() {
            return Some(p);
        }
        tracing::warn!(
            "COQBIN={} set but {} not found there",
            p.display(),
            coqtop_file_name()
        );
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).find(|dir| dir.join(coqtop_file_name()).is_file())
}

fn default_coq_path() -> PathBuf {
    PathBuf::new()
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_init_timeout() -> u64 {
    3000
}
fn default_quit_timeout() -> u64 {
    1000
}
