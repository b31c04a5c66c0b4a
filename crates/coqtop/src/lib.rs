//! Async client for coqtop's XML IDE protocol.
//!
//! A [`CoqTop`] session spawns and supervises one coqtop process, connects
//! its main and control channels over loopback TCP, and exposes the protocol
//! calls (`Init`, `Add`, `Edit_at`, `Goal`, `Query`, ...) as async methods.
//! Out-of-band feedback is delivered to a [`SessionObserver`].
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use coqtop::{CoqTop, CoqTopSettings, NoopObserver};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = CoqTopSettings::with_discovered_coqbin()
//!     .expect("coqtop not found; set COQBIN or add it to PATH");
//!
//! let coq = CoqTop::new(settings, Arc::new(NoopObserver));
//! let root = coq.init().await?;
//! let edit_id = coq.next_edit_id();
//! let added = coq.add("Theorem t : True.", edit_id, root, false).await?;
//! let goals = coq.goal().await?;
//! println!("{:?} at state {}", goals.goals, added.state_id);
//! coq.edit_at(root).await?;
//! coq.quit().await;
//! # Ok(())
//! # }
//! ```
//!
//! Calls are answered strictly in order and only one is in flight at a time;
//! [`CoqTop::interrupt`] may be sent while another call is pending.

pub mod correlator;
pub mod decoder;
pub mod envelope;
pub mod feedback;
pub mod process;
pub mod protocol;
pub mod session;
pub mod tracker;
pub mod transport;
pub mod types;
pub mod xml;

pub use decoder::{ProtocolEvent, StreamDecoder, ValueResponse, XmlStreamDecoder};
pub use envelope::{Envelope, Expiry};
pub use feedback::{NoopObserver, SessionObserver};
pub use protocol::{CoqRequest, CoqValue, OptionValue};
pub use session::{CoqTop, DecoderFactory};
pub use tracker::{EditAtOutcome, EditTracker, Phase};
pub use transport::ChannelLayout;
pub use types::{
    discover_coqbin, AddResult, CoqError, CoqTopSettings, EditAtResult, EditId, ErrorMessage,
    Failure, FileLoaded, Goal, GoalResult, Hypothesis, Location, LtacProfEntry, LtacProfResults,
    LtacProfTree, Message, MessageLevel, NewFocus, SentenceStatus, StateId, WorkerState,
    WorkerStatus,
};
