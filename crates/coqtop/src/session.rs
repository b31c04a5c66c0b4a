use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::correlator::{Correlator, ValueReply};
use crate::decoder::{ProtocolEvent, StreamDecoder, XmlStreamDecoder};
use crate::envelope::{self, Envelope, Expiry, Waited};
use crate::feedback::{self, SessionObserver};
use crate::process::{self, ProcessGuard};
use crate::protocol::{self, CoqRequest, CoqValue};
use crate::tracker::{EditAtOutcome, EditTracker};
use crate::transport::{self, BoxedReader, BoxedWriter, ChannelLayout, Channels, Listeners};
use crate::types::{
    AddResult, CoqError, CoqTopSettings, EditAtResult, EditId, GoalResult, LtacProfResults,
    StateId,
};

/// Creates a fresh decoder for every connection.
pub type DecoderFactory = Arc<dyn Fn() -> Box<dyn StreamDecoder> + Send + Sync>;

/// A session with one coqtop process, driving one document.
///
/// Calls are single-flight: each public call holds the session's call lock
/// until its reply arrives, so concurrent callers queue up in order.
/// [`CoqTop::interrupt`] is the exception and can be sent at any time;
/// [`CoqTop::quit`] and [`CoqTop::reset_coq`] force their way past a call
/// that never completes.
///
/// Calls that need a live prover start one on demand.
pub struct CoqTop {
    shared: Arc<Shared>,
    call_lock: AsyncMutex<()>,
}

struct Shared {
    settings: CoqTopSettings,
    observer: Arc<dyn SessionObserver>,
    decoder: DecoderFactory,
    inner: Mutex<Inner>,
}

struct Inner {
    correlator: Correlator,
    tracker: EditTracker,
    link: Option<Link>,
    next_link_id: u64,
}

/// A live connection: channels, background tasks and (usually) a process.
struct Link {
    id: u64,
    writer: Arc<AsyncMutex<BoxedWriter>>,
    _idle_writers: Vec<BoxedWriter>,
    _process: Option<ProcessGuard>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Link {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl CoqTop {
    pub fn new(settings: CoqTopSettings, observer: Arc<dyn SessionObserver>) -> Self {
        Self::with_decoder(
            settings,
            observer,
            Arc::new(|| Box::new(XmlStreamDecoder::new()) as Box<dyn StreamDecoder>),
        )
    }

    /// Like [`CoqTop::new`] with a custom decoder for the main channel.
    pub fn with_decoder(
        settings: CoqTopSettings,
        observer: Arc<dyn SessionObserver>,
        decoder: DecoderFactory,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                observer,
                decoder,
                inner: Mutex::new(Inner {
                    correlator: Correlator::new(),
                    tracker: EditTracker::new(),
                    link: None,
                    next_link_id: 0,
                }),
            }),
            call_lock: AsyncMutex::new(()),
        }
    }

    pub fn settings(&self) -> &CoqTopSettings {
        &self.shared.settings
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().link.is_some()
    }

    /// Snapshot of the edit-state tracker.
    pub fn tracker(&self) -> EditTracker {
        self.shared.lock().tracker.clone()
    }

    /// A fresh edit id for [`CoqTop::add`].
    pub fn next_edit_id(&self) -> EditId {
        self.shared.lock().tracker.next_edit_id()
    }

    /// Tear down any current prover, start a new one and run `Init`.
    ///
    /// An outstanding call is failed with [`CoqError::Closed`] first, so a
    /// hung call cannot keep the reset waiting.
    pub async fn reset_coq(&self) -> Result<StateId, CoqError> {
        self.shared.teardown("reset");
        let _guard = self.call_lock.lock().await;
        self.reset_locked().await?;
        self.init_locked(None).await
    }

    async fn reset_locked(&self) -> Result<(), CoqError> {
        self.shared.teardown("reset");
        self.shared.lock().tracker = EditTracker::new();

        let settings = &self.shared.settings;
        let wrapper = settings.usable_wrapper();
        let layout = match wrapper {
            Some(_) => ChannelLayout::Shared,
            None => ChannelLayout::native(),
        };
        let listeners = Listeners::bind(&settings.host, layout).await?;
        let cmd = process::coqtop_command(
            settings,
            wrapper,
            &listeners.main_arg()?,
            &listeners.control_arg()?,
        );
        let mut child = process::spawn(cmd)?;

        let deadline = Duration::from_millis(settings.init_timeout_ms);
        let accepted = tokio::select! {
            accepted = listeners.accept(deadline) => accepted,
            status = child.wait() => Err(CoqError::Spawn(match status {
                Ok(status) => format!("coqtop exited before connecting ({status})"),
                Err(e) => format!("coqtop exited before connecting: {e}"),
            })),
        };
        let channels = match accepted {
            Ok(channels) => channels,
            Err(e) => {
                tracing::warn!(error = %e, "coqtop failed to connect");
                let _ = child.kill().await;
                return Err(e);
            }
        };

        self.shared.install(channels, Some(child));
        tracing::info!(?layout, wrapper = wrapper.is_some(), "coqtop started");
        Ok(())
    }

    /// Drive a prover over already-connected streams instead of a spawned
    /// process. Replaces any current link.
    pub async fn attach<R, W>(&self, reader: R, writer: W)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let _guard = self.call_lock.lock().await;
        self.shared.teardown("reattached");
        self.shared.lock().tracker = EditTracker::new();
        self.shared.install(
            Channels {
                main_reader: Box::new(reader),
                main_writer: Box::new(writer),
                passive: Vec::new(),
                idle_writers: Vec::new(),
            },
            None,
        );
        tracing::debug!("Attached to prover streams");
    }

    /// Restart and initialize the prover if it is gone.
    async fn ensure_running(&self) -> Result<(), CoqError> {
        if !self.is_running() {
            tracing::info!("coqtop not running, starting it");
            self.reset_locked().await?;
            self.init_locked(None).await?;
        }
        Ok(())
    }

    /// Shut the prover down, forcing it if it does not answer in time.
    ///
    /// If another call still holds the session after `quit_timeout_ms`, the
    /// link is torn down without sending `Quit`.
    pub async fn quit(&self) {
        let grace = Duration::from_millis(self.shared.settings.quit_timeout_ms);
        let _guard = match tokio::time::timeout(grace, self.call_lock.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                tracing::info!(millis = grace.as_millis() as u64, "Call still running, forcing quit");
                self.shared.teardown("quit");
                return;
            }
        };
        if !self.is_running() {
            return;
        }
        match self
            .call(CoqRequest::Quit, Envelope::quit(&self.shared.settings))
            .await
        {
            Ok(_) => tracing::info!("Quit"),
            Err(e) => tracing::info!(error = %e, "Forced quit"),
        }
        self.shared.teardown("quit");
    }

    /// Ask coqtop to abandon the computation in progress.
    ///
    /// Does not wait for the call lock. coqtop answers the interrupted call
    /// (usually with a failure) and sends no value for the interrupt itself,
    /// so nothing is sent when no call is outstanding.
    pub async fn interrupt(&self) -> Result<(), CoqError> {
        if !self.is_running() {
            return Ok(());
        }
        if self.shared.lock().correlator.outstanding() == 0 {
            tracing::debug!("No call in progress, interrupt not sent");
            return Ok(());
        }
        self.send_interrupt().await
    }

    async fn send_interrupt(&self) -> Result<(), CoqError> {
        tracing::info!("Interrupting coqtop");
        self.send_with(&CoqRequest::Interrupt, |_| ()).await
    }

    pub async fn init(&self) -> Result<StateId, CoqError> {
        self.init_with_script(None).await
    }

    /// `Init`, naming the script file being edited.
    pub async fn init_with_script(&self, script: Option<&str>) -> Result<StateId, CoqError> {
        let _guard = self.call_lock.lock().await;
        if !self.is_running() {
            self.reset_locked().await?;
        }
        self.init_locked(script).await
    }

    async fn init_locked(&self, script: Option<&str>) -> Result<StateId, CoqError> {
        let request = CoqRequest::Init {
            script: script.map(str::to_string),
        };
        let value = self
            .call(request, Envelope::init(&self.shared.settings))
            .await?;
        let state_id = protocol::parse_init(&value)?;
        self.shared.lock().tracker.on_init(state_id);
        tracing::info!(state_id, "Init");
        Ok(state_id)
    }

    /// Add `text` as a new sentence on top of `state_id`.
    pub async fn add(
        &self,
        text: &str,
        edit_id: EditId,
        state_id: StateId,
        verbose: bool,
    ) -> Result<AddResult, CoqError> {
        let _guard = self.call_lock.lock().await;
        self.ensure_running().await?;
        let request = CoqRequest::Add {
            text: text.to_string(),
            edit_id,
            state_id,
            verbose,
        };
        let value = self.call(request, self.call_envelope()).await?;
        let result = protocol::parse_add(&value)?;
        self.shared.lock().tracker.on_add(&result);
        tracing::debug!(
            edit_id,
            parent = state_id,
            state_id = result.state_id,
            unfocused = ?result.unfocused_state_id,
            "Add"
        );
        Ok(result)
    }

    /// Move the tip back to `state_id`.
    pub async fn edit_at(&self, state_id: StateId) -> Result<EditAtResult, CoqError> {
        let _guard = self.call_lock.lock().await;
        self.ensure_running().await?;
        let value = self
            .call(CoqRequest::EditAt { state_id }, self.call_envelope())
            .await?;
        let result = protocol::parse_edit_at(&value)?;
        let outcome = self.shared.lock().tracker.on_edit_at(state_id, &result);
        match outcome {
            EditAtOutcome::Rewound { tip } => tracing::debug!(tip, "Edit_at rewound"),
            EditAtOutcome::FocusChanged(focus) => tracing::debug!(
                tip = focus.state_id,
                qed = focus.qed_state_id,
                old_tip = focus.old_tip,
                "Edit_at opened a proof branch"
            ),
        }
        Ok(result)
    }

    pub async fn goal(&self) -> Result<GoalResult, CoqError> {
        let _guard = self.call_lock.lock().await;
        self.ensure_running().await?;
        let value = self.call(CoqRequest::Goal, self.call_envelope()).await?;
        protocol::parse_goal(&value)
    }

    /// Run a query in the context of `state_id` (0 for the tip) and return
    /// the message it prints.
    pub async fn query(&self, text: &str, state_id: StateId) -> Result<String, CoqError> {
        let _guard = self.call_lock.lock().await;
        self.ensure_running().await?;
        let request = CoqRequest::Query {
            text: text.to_string(),
            state_id,
        };
        let envelope = self.call_envelope();
        let mut reply = self.send(&request, true).await?;
        self.await_value("Query", envelope, &mut reply.value).await?;

        let message = reply
            .message
            .ok_or_else(|| CoqError::Protocol("Query registered without a message slot".into()))?;
        let received = match envelope.deadline {
            Some(deadline) => tokio::time::timeout(deadline, message)
                .await
                .map_err(|_| CoqError::Timeout {
                    call: "Query",
                    millis: envelope.millis(),
                })?,
            None => message.await,
        };
        let message = received.map_err(|_| CoqError::Closed("query message dropped".into()))?;
        tracing::debug!(query = text, level = ?message.level, "Query answered");
        Ok(message.message)
    }

    /// Set `Printing Width`. Does nothing if coqtop is not running.
    pub async fn resize_window(&self, columns: u32) -> Result<(), CoqError> {
        let _guard = self.call_lock.lock().await;
        if !self.is_running() {
            return Ok(());
        }
        self.call(CoqRequest::resize_window(columns), self.call_envelope())
            .await?;
        tracing::debug!(columns, "Resized window");
        Ok(())
    }

    pub async fn ltac_profiling_set(&self, enabled: bool) -> Result<(), CoqError> {
        let _guard = self.call_lock.lock().await;
        self.ensure_running().await?;
        self.call(CoqRequest::LtacProfSet { enabled }, self.call_envelope())
            .await?;
        Ok(())
    }

    pub async fn ltac_profiling_results(&self) -> Result<LtacProfResults, CoqError> {
        let _guard = self.call_lock.lock().await;
        self.ensure_running().await?;
        let value = self
            .call(CoqRequest::LtacProfResults, self.call_envelope())
            .await?;
        protocol::parse_ltacprof_results(&value)
    }

    fn call_envelope(&self) -> Envelope {
        Envelope::call(&self.shared.settings)
    }

    async fn call(&self, request: CoqRequest, envelope: Envelope) -> Result<CoqValue, CoqError> {
        let mut reply = self.send(&request, false).await?;
        self.await_value(request.name(), envelope, &mut reply.value)
            .await
    }

    async fn send(
        &self,
        request: &CoqRequest,
        wants_message: bool,
    ) -> Result<crate::correlator::PendingReply, CoqError> {
        let call = request.name();
        self.send_with(request, |c| c.register(call, wants_message))
            .await
    }

    /// Write `request`, registering its waiter under the write lock first.
    async fn send_with<T>(
        &self,
        request: &CoqRequest,
        register: impl FnOnce(&mut Correlator) -> T,
    ) -> Result<T, CoqError> {
        let (link_id, writer) = {
            let inner = self.shared.lock();
            let link = inner.link.as_ref().ok_or(CoqError::NotRunning)?;
            (link.id, Arc::clone(&link.writer))
        };
        let mut writer = writer.lock().await;
        let registered = {
            let mut inner = self.shared.lock();
            if inner.link.as_ref().map(|l| l.id) != Some(link_id) {
                return Err(CoqError::Closed("connection replaced".into()));
            }
            register(&mut inner.correlator)
        };

        let xml = request.to_xml();
        tracing::debug!(call = request.name(), %xml, "Sending call");
        let written = async {
            writer.write_all(xml.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            drop(writer);
            self.shared
                .teardown_link(link_id, &format!("main channel write failed: {e}"));
            return Err(CoqError::Io(e));
        }
        Ok(registered)
    }

    async fn await_value(
        &self,
        call: &'static str,
        envelope: Envelope,
        rx: &mut oneshot::Receiver<ValueReply>,
    ) -> Result<CoqValue, CoqError> {
        let millis = envelope.millis();
        if let Waited::Done(result) = envelope::wait(envelope.deadline, rx).await {
            return result;
        }
        match envelope.on_expiry {
            Expiry::Swallow => Err(CoqError::Timeout { call, millis }),
            Expiry::Fatal => {
                tracing::warn!(call, millis, "Call timed out");
                self.shared
                    .teardown(&format!("{call}: timed out after {millis}ms"));
                Err(CoqError::Timeout { call, millis })
            }
            Expiry::Interrupt => {
                tracing::warn!(call, millis, "Call timed out, sending interrupt");
                self.send_interrupt().await?;
                match envelope::wait(envelope.deadline, rx).await {
                    Waited::Done(result) => result,
                    Waited::Expired => {
                        tracing::warn!(call, millis, "Interrupted call still pending");
                        self.shared
                            .teardown(&format!("{call}: unresponsive after interrupt"));
                        Err(CoqError::Timeout { call, millis })
                    }
                }
            }
        }
    }
}

impl Drop for CoqTop {
    fn drop(&mut self) {
        self.shared.teardown("session dropped");
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `channels` the live link and start its background tasks.
    fn install(self: &Arc<Self>, channels: Channels, child: Option<Child>) {
        let mut inner = self.lock();
        let id = inner.next_link_id;
        inner.next_link_id += 1;

        let mut tasks = vec![tokio::spawn(read_main(
            Arc::downgrade(self),
            id,
            channels.main_reader,
            (self.decoder)(),
        ))];
        for (name, reader) in channels.passive {
            tasks.push(transport::spawn_logger(name, reader));
        }
        let process = child.map(|child| {
            let session = Arc::downgrade(self);
            process::supervise(child, move |reason| {
                if let Some(session) = session.upgrade() {
                    session.teardown_link(id, &reason);
                }
            })
        });

        inner.link = Some(Link {
            id,
            writer: Arc::new(AsyncMutex::new(channels.main_writer)),
            _idle_writers: channels.idle_writers,
            _process: process,
            tasks,
        });
    }

    /// Tear down the link `id` if it is still the live one.
    fn teardown_link(&self, id: u64, reason: &str) {
        self.teardown_if(reason, |link| link.map(|l| l.id) == Some(id));
    }

    /// The single cleanup path: reject waiters, drop the link (which kills
    /// the process and stops its tasks) and notify the observer.
    ///
    /// Safe to call repeatedly; the observer hears about each link once.
    fn teardown(&self, reason: &str) {
        self.teardown_if(reason, |_| true);
    }

    /// [`Shared::teardown`] if `applies` holds for the current link, checked
    /// under the same lock that takes the link.
    fn teardown_if(&self, reason: &str, applies: impl FnOnce(Option<&Link>) -> bool) {
        let link = {
            let mut inner = self.lock();
            if !applies(inner.link.as_ref()) {
                return;
            }
            inner.correlator.fail_all(reason);
            let link = inner.link.take();
            if link.is_some() {
                inner.tracker.close();
            }
            link
        };
        if let Some(link) = link {
            tracing::info!(reason, link = link.id, "coqtop session closed");
            drop(link);
            self.observer.on_closed(reason);
        }
    }

    fn handle_event(&self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Value(response) => {
                tracing::debug!(?response, "Value");
                if !self.lock().correlator.resolve_value(response) {
                    tracing::warn!("Value with no pending call, dropped");
                }
            }
            ProtocolEvent::Message(message) => {
                let unclaimed = self.lock().correlator.deliver_message(message);
                if let Some(message) = unclaimed {
                    feedback::dispatch_message(self.observer.as_ref(), &message);
                }
            }
            ProtocolEvent::StateFeedback(fb) => {
                feedback::dispatch_state(self.observer.as_ref(), &fb)
            }
            ProtocolEvent::EditFeedback(fb) => feedback::dispatch_edit(self.observer.as_ref(), &fb),
            ProtocolEvent::Unknown(what) => tracing::debug!(%what, "Ignoring unknown element"),
            ProtocolEvent::ParseError(error) => {
                tracing::warn!(%error, "Undecodable data on main channel")
            }
        }
    }
}

/// Feed the main channel into the decoder until it closes.
async fn read_main(
    shared: Weak<Shared>,
    link_id: u64,
    mut reader: BoxedReader,
    mut decoder: Box<dyn StreamDecoder>,
) {
    let mut buf = vec![0u8; 16 * 1024];
    let reason = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break "main channel closed".to_string(),
            Ok(n) => n,
            Err(e) => break format!("main channel read failed: {e}"),
        };
        let Some(session) = shared.upgrade() else {
            return;
        };
        for event in decoder.feed(&buf[..n]) {
            session.handle_event(event);
        }
    };
    tracing::debug!(link = link_id, %reason, "Main channel reader stopped");
    if let Some(session) = shared.upgrade() {
        session.teardown_link(link_id, &reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::NoopObserver;

    fn session() -> CoqTop {
        CoqTop::new(CoqTopSettings::default(), Arc::new(NoopObserver))
    }

    #[tokio::test]
    async fn fresh_session_is_not_running() {
        let coq = session();
        assert!(!coq.is_running());
        assert_eq!(coq.tracker().tip(), None);
        // No-ops without a prover.
        coq.resize_window(80).await.unwrap();
        coq.interrupt().await.unwrap();
        coq.quit().await;
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_before_channels() {
        let coq = CoqTop::new(
            CoqTopSettings {
                coq_path: "/definitely/not/here".into(),
                ..CoqTopSettings::default()
            },
            Arc::new(NoopObserver),
        );
        let err = coq.init().await.unwrap_err();
        assert!(matches!(err, CoqError::Spawn(_)), "{err:?}");
        assert!(!coq.is_running());
    }

    #[tokio::test]
    async fn dropped_peer_closes_link() {
        let coq = session();
        let (client, server) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(client);
        coq.attach(reader, writer).await;
        assert!(coq.is_running());

        drop(server);
        for _ in 0..100 {
            if !coq.is_running() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!coq.is_running());
    }

    #[tokio::test]
    async fn stale_link_teardown_leaves_new_link_alone() {
        let coq = session();
        let (first, _first_peer) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(first);
        coq.attach(reader, writer).await;
        let stale_id = coq.shared.lock().link.as_ref().map(|l| l.id).unwrap();

        let (second, _second_peer) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(second);
        coq.attach(reader, writer).await;

        coq.shared.teardown_link(stale_id, "old process exited");
        assert!(coq.is_running());
        let live_id = coq.shared.lock().link.as_ref().map(|l| l.id).unwrap();
        coq.shared.teardown_link(live_id, "process exited");
        assert!(!coq.is_running());
    }
}
