use std::collections::BTreeMap;

use crate::decoder::{EditFeedback, StateFeedback};
use crate::types::{ErrorMessage, FileLoaded, Message, SentenceStatus, StateId, WorkerStatus};

/// Receives out-of-band events from a coqtop session.
///
/// Every method has a no-op default, so implementors only override what they
/// care about. Methods are called from the session's reader task and must not
/// block.
pub trait SessionObserver: Send + Sync {
    fn on_state_status(
        &self,
        _state_id: StateId,
        _route: i64,
        _status: SentenceStatus,
        _worker: Option<&str>,
    ) {
    }

    fn on_state_error(&self, _state_id: StateId, _route: i64, _error: &ErrorMessage) {}

    fn on_worker_status(&self, _state_id: StateId, _route: i64, _workers: &[WorkerStatus]) {}

    fn on_file_dependencies(
        &self,
        _state_id: StateId,
        _route: i64,
        _dependencies: &BTreeMap<String, Vec<String>>,
    ) {
    }

    fn on_file_loaded(&self, _state_id: StateId, _route: i64, _file: &FileLoaded) {}

    fn on_edit_feedback(&self, _feedback: &EditFeedback) {}

    /// A message no pending call was waiting for.
    fn on_message(&self, _message: &Message) {}

    /// The session lost its prover; `reason` says why.
    fn on_closed(&self, _reason: &str) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// Fan a state feedback out to every applicable observer method.
pub fn dispatch_state(observer: &dyn SessionObserver, feedback: &StateFeedback) {
    let StateFeedback {
        state_id,
        route,
        ..
    } = *feedback;
    tracing::debug!(state_id, route, ?feedback, "State feedback");

    if let Some(sentence) = &feedback.sentence {
        observer.on_state_status(state_id, route, sentence.status, sentence.worker.as_deref());
    }
    if let Some(error) = &feedback.error {
        observer.on_state_error(state_id, route, error);
    }
    if let Some(workers) = &feedback.worker_status {
        observer.on_worker_status(state_id, route, workers);
    }
    if let Some(deps) = &feedback.file_dependencies {
        observer.on_file_dependencies(state_id, route, deps);
    }
    if let Some(file) = &feedback.file_loaded {
        observer.on_file_loaded(state_id, route, file);
    }
}

pub fn dispatch_edit(observer: &dyn SessionObserver, feedback: &EditFeedback) {
    tracing::debug!(edit_id = feedback.edit_id, route = feedback.route, "Edit feedback");
    observer.on_edit_feedback(feedback);
}

pub fn dispatch_message(observer: &dyn SessionObserver, message: &Message) {
    tracing::debug!(level = ?message.level, message = %message.message, "Message");
    observer.on_message(message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::SentenceFeedback;
    use crate::types::{Location, WorkerState};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl SessionObserver for Recorder {
        fn on_state_status(&self, id: StateId, _: i64, status: SentenceStatus, _: Option<&str>) {
            self.seen.lock().unwrap().push(format!("status {id} {status:?}"));
        }
        fn on_state_error(&self, id: StateId, _: i64, error: &ErrorMessage) {
            self.seen.lock().unwrap().push(format!("error {id} {}", error.message));
        }
        fn on_worker_status(&self, id: StateId, _: i64, workers: &[WorkerStatus]) {
            self.seen.lock().unwrap().push(format!("workers {id} {}", workers.len()));
        }
    }

    #[test]
    fn every_payload_reaches_its_method() {
        let observer = Recorder::default();
        let feedback = StateFeedback {
            state_id: 7,
            route: 1,
            sentence: Some(SentenceFeedback {
                status: SentenceStatus::Processed,
                worker: None,
            }),
            error: Some(ErrorMessage {
                message: "oops".into(),
                location: Some(Location { start: 0, stop: 2 }),
            }),
            worker_status: Some(vec![WorkerStatus {
                id: "proofworker:0".into(),
                state: WorkerState::Idle,
                ident: None,
            }]),
            ..StateFeedback::default()
        };
        dispatch_state(&observer, &feedback);
        assert_eq!(
            *observer.seen.lock().unwrap(),
            vec!["status 7 Processed", "error 7 oops", "workers 7 1"]
        );
    }

    #[test]
    fn unhandled_events_are_ignored() {
        // file_loaded has no override on Recorder and must not panic.
        let observer = Recorder::default();
        let feedback = StateFeedback {
            state_id: 1,
            file_loaded: Some(FileLoaded {
                module: "Coq.Init.Prelude".into(),
                file_path: "/lib/Prelude.vo".into(),
            }),
            ..StateFeedback::default()
        };
        dispatch_state(&observer, &feedback);
        dispatch_state(&NoopObserver, &feedback);
        assert!(observer.seen.lock().unwrap().is_empty());
    }
}
