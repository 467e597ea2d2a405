use crate::client::{ClientError, GatewayApi};
use crate::push::{run_push_channel, PushConnector, PushEvent, ReconnectPolicy};
use crate::visibility::{Visibility, VisibilityScheduler};
use gwc_core::approvals::{ApprovalBook, ApprovalEntry};
use gwc_core::event_stream::decode_json;
use gwc_core::pairing::{PairingAttempt, PairingPhase, PairingTransition, SuccessMatcher, SuccessSource};
use gwc_core::sequence::{OperationClass, SequenceGuard, SequenceToken};
use gwc_core::wire::{ActionResponse, PairingEvent, PendingContacts};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

const COMMAND_QUEUE: usize = 32;
const EVENT_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Linked by scanning a rotating code streamed from the gateway.
    Qr,
    /// Linked by submitting a bot token.
    Token,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSpec {
    pub id: String,
    pub account: Option<String>,
    pub kind: ChannelKind,
    /// Inbound contacts must be approved before they can talk to agents.
    pub accepts_inbound: bool,
}

impl ChannelSpec {
    pub fn qr(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            account: None,
            kind: ChannelKind::Qr,
            accepts_inbound: false,
        }
    }

    pub fn token(id: impl Into<String>) -> Self {
        Self {
            kind: ChannelKind::Token,
            ..Self::qr(id)
        }
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn with_inbound_approval(mut self) -> Self {
        self.accepts_inbound = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPhase {
    #[default]
    Inactive,
    AwaitingApproval,
    Approved,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PairingView {
    pub channel: Option<ChannelSpec>,
    pub attempt: Option<PairingAttempt>,
    pub approval: ApprovalPhase,
    pub approvals: Vec<ApprovalEntry>,
    pub approval_error: Option<String>,
    pub malformed_events: u64,
}

impl PairingView {
    pub fn phase(&self) -> PairingPhase {
        self.attempt
            .as_ref()
            .map(|attempt| attempt.phase)
            .unwrap_or(PairingPhase::Idle)
    }

    pub fn code(&self) -> Option<&str> {
        self.attempt.as_ref().and_then(|attempt| attempt.code.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct PairingOptions {
    pub approval_poll_interval: Duration,
    pub matcher: SuccessMatcher,
}

impl Default for PairingOptions {
    fn default() -> Self {
        Self {
            approval_poll_interval: Duration::from_millis(4_000),
            matcher: SuccessMatcher::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("pairing session is closed")]
pub struct SessionClosed;

#[derive(Debug)]
enum Command {
    Select(ChannelSpec),
    ConnectWithToken(String),
    Retry { preserve_log: bool },
    Approve(String),
    Close,
}

/// Handle to one pairing flow.
///
/// The actor behind it owns the attempt, its push channel, the channel
/// connect call and the inbound approval poll. Selecting another channel or
/// closing tears all of them down before anything new starts.
#[derive(Debug)]
pub struct PairingSession {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<PairingView>,
    task: JoinHandle<()>,
}

impl PairingSession {
    pub fn spawn<A, F, C>(
        api: Arc<A>,
        connectors: F,
        visibility: watch::Receiver<Visibility>,
        options: PairingOptions,
    ) -> Self
    where
        A: GatewayApi,
        F: Fn(&ChannelSpec) -> C + Send + 'static,
        C: PushConnector,
    {
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (view_tx, view) = watch::channel(PairingView::default());
        let (stream_tx, stream_rx) = mpsc::channel(EVENT_QUEUE);
        let (poll_tx, poll_rx) = mpsc::channel(EVENT_QUEUE);

        let actor = PairingActor {
            api,
            connectors,
            visibility,
            options,
            guard: SequenceGuard::new(),
            spec: None,
            attempt: None,
            last_token: None,
            stream: None,
            approval_poll: None,
            approvals: ApprovalBook::new(),
            malformed_events: 0,
            view_tx,
            stream_tx,
            poll_tx,
        };
        let task = tokio::spawn(actor.run(command_rx, stream_rx, poll_rx));
        Self {
            commands,
            view,
            task,
        }
    }

    /// Tears down the current attempt and starts one for `spec`. QR channels
    /// open their push channel immediately; token channels wait for
    /// [`PairingSession::connect_with_token`].
    pub async fn select_channel(&self, spec: ChannelSpec) -> Result<(), SessionClosed> {
        self.send(Command::Select(spec)).await
    }

    pub async fn connect_with_token(&self, token: impl Into<String>) -> Result<(), SessionClosed> {
        self.send(Command::ConnectWithToken(token.into())).await
    }

    pub async fn retry(&self, preserve_log: bool) -> Result<(), SessionClosed> {
        self.send(Command::Retry { preserve_log }).await
    }

    /// Approves an inbound contact. Repeated calls for a code that is already
    /// approved or still being approved are no-ops.
    pub async fn approve(&self, code: impl Into<String>) -> Result<(), SessionClosed> {
        self.send(Command::Approve(code.into())).await
    }

    /// Ends the current attempt and closes everything it opened.
    pub async fn close(&self) -> Result<(), SessionClosed> {
        self.send(Command::Close).await
    }

    pub fn view(&self) -> PairingView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PairingView> {
        self.view.clone()
    }

    async fn send(&self, command: Command) -> Result<(), SessionClosed> {
        self.commands.send(command).await.map_err(|_| SessionClosed)
    }
}

impl Drop for PairingSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Aborts the wrapped task when dropped.
#[derive(Debug)]
struct OwnedTask(JoinHandle<()>);

impl Drop for OwnedTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

type ConnectResult = (SequenceToken, Result<ActionResponse, ClientError>);
type ApproveResult = (SequenceToken, String, Result<ActionResponse, ClientError>);

struct PairingActor<A, F> {
    api: Arc<A>,
    connectors: F,
    visibility: watch::Receiver<Visibility>,
    options: PairingOptions,
    guard: SequenceGuard,
    spec: Option<ChannelSpec>,
    attempt: Option<PairingAttempt>,
    last_token: Option<String>,
    stream: Option<OwnedTask>,
    approval_poll: Option<VisibilityScheduler>,
    approvals: ApprovalBook,
    malformed_events: u64,
    view_tx: watch::Sender<PairingView>,
    stream_tx: mpsc::Sender<(SequenceToken, PushEvent)>,
    poll_tx: mpsc::Sender<(SequenceToken, Result<PendingContacts, ClientError>)>,
}

impl<A, F, C> PairingActor<A, F>
where
    A: GatewayApi,
    F: Fn(&ChannelSpec) -> C + Send + 'static,
    C: PushConnector,
{
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut stream_rx: mpsc::Receiver<(SequenceToken, PushEvent)>,
        mut poll_rx: mpsc::Receiver<(SequenceToken, Result<PendingContacts, ClientError>)>,
    ) {
        let mut connects: JoinSet<ConnectResult> = JoinSet::new();
        let mut approvals: JoinSet<ApproveResult> = JoinSet::new();

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.handle_command(command, &mut connects, &mut approvals);
                }
                Some((token, event)) = stream_rx.recv() => {
                    self.handle_push(token, event);
                }
                Some((token, result)) = poll_rx.recv() => {
                    self.handle_poll(token, result);
                }
                Some(joined) = connects.join_next(), if !connects.is_empty() => {
                    if let Ok((token, result)) = joined {
                        self.handle_connect(token, result);
                    }
                }
                Some(joined) = approvals.join_next(), if !approvals.is_empty() => {
                    if let Ok((epoch, code, result)) = joined {
                        self.handle_approval(epoch, code, result);
                    }
                }
            }
            self.publish();
        }
        self.teardown();
    }

    fn handle_command(
        &mut self,
        command: Command,
        connects: &mut JoinSet<ConnectResult>,
        approvals: &mut JoinSet<ApproveResult>,
    ) {
        match command {
            Command::Select(spec) => {
                self.teardown();
                info!(
                    event = "pairing_channel_selected",
                    channel = %spec.id,
                    kind = ?spec.kind
                );
                let mut attempt = PairingAttempt::new(spec.id.clone(), spec.account.clone());
                let kind = spec.kind;
                self.spec = Some(spec);
                if kind == ChannelKind::Qr {
                    attempt.begin();
                    self.attempt = Some(attempt);
                    self.open_stream();
                } else {
                    self.attempt = Some(attempt);
                }
            }
            Command::ConnectWithToken(token) => {
                let Some(spec) = self.spec.as_ref() else {
                    return;
                };
                if spec.kind != ChannelKind::Token {
                    debug!(event = "pairing_token_ignored", channel = %spec.id);
                    return;
                }
                let channel = spec.id.clone();
                let Some(attempt) = self.attempt.as_mut() else {
                    return;
                };
                let started = match attempt.phase {
                    PairingPhase::Idle => attempt.begin(),
                    PairingPhase::Error => attempt.retry(true),
                    _ => PairingTransition::Ignored,
                };
                if started != PairingTransition::Started {
                    return;
                }
                self.last_token = Some(token.clone());
                self.spawn_connect(connects, channel, token);
            }
            Command::Retry { preserve_log } => {
                let Some(spec) = self.spec.clone() else {
                    return;
                };
                let Some(attempt) = self.attempt.as_mut() else {
                    return;
                };
                match spec.kind {
                    ChannelKind::Qr => {
                        if attempt.retry(preserve_log) == PairingTransition::Started {
                            info!(event = "pairing_retry", channel = %spec.id);
                            self.open_stream();
                        }
                    }
                    ChannelKind::Token => {
                        let Some(token) = self.last_token.clone() else {
                            return;
                        };
                        if attempt.retry(preserve_log) == PairingTransition::Started {
                            info!(event = "pairing_retry", channel = %spec.id);
                            self.spawn_connect(connects, spec.id, token);
                        }
                    }
                }
            }
            Command::Approve(code) => self.begin_approval(code, approvals),
            Command::Close => {
                self.teardown();
                info!(event = "pairing_closed");
            }
        }
    }

    /// Closes the push channel, stops the approval poll and invalidates every
    /// in-flight result of the previous attempt.
    fn teardown(&mut self) {
        if self.stream.take().is_some() {
            info!(event = "pairing_channel_closed", reason = "teardown");
        }
        self.approval_poll = None;
        self.guard.next_token(OperationClass::PairingStream);
        self.guard.next_token(OperationClass::ChannelConnect);
        self.guard.next_token(OperationClass::ApprovalPoll);
        self.spec = None;
        self.attempt = None;
        self.last_token = None;
        self.approvals = ApprovalBook::new();
        self.malformed_events = 0;
    }

    fn open_stream(&mut self) {
        let Some(spec) = self.spec.as_ref() else {
            return;
        };
        let token = self.guard.next_token(OperationClass::PairingStream);
        let connector = (self.connectors)(spec);
        let forward_to = self.stream_tx.clone();
        let task = tokio::spawn(async move {
            let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE);
            let forward = async move {
                while let Some(event) = events_rx.recv().await {
                    if forward_to.send((token, event)).await.is_err() {
                        break;
                    }
                }
            };
            tokio::join!(
                run_push_channel(connector, ReconnectPolicy::Never, None, events_tx),
                forward,
            );
        });
        debug!(event = "pairing_channel_opened", channel = %spec.id, token = %token);
        self.stream = Some(OwnedTask(task));
    }

    fn close_stream(&mut self, reason: &str) {
        if self.stream.take().is_some() {
            self.guard.next_token(OperationClass::PairingStream);
            info!(event = "pairing_channel_closed", reason);
        }
    }

    fn spawn_connect(&mut self, connects: &mut JoinSet<ConnectResult>, channel: String, token: String) {
        let seq = self.guard.next_token(OperationClass::ChannelConnect);
        let api = self.api.clone();
        connects.spawn(async move { (seq, api.add_channel(&channel, &token).await) });
    }

    fn handle_push(&mut self, token: SequenceToken, event: PushEvent) {
        if !self.guard.is_current(&OperationClass::PairingStream, token) {
            return;
        }
        let transition = match event {
            PushEvent::Connected => {
                debug!(event = "pairing_stream_connected");
                return;
            }
            PushEvent::Message(text) => match decode_json::<PairingEvent>(&text) {
                Ok(event) => {
                    let Some(attempt) = self.attempt.as_mut() else {
                        return;
                    };
                    attempt.apply(&event, &self.options.matcher)
                }
                Err(err) => {
                    self.malformed_events += 1;
                    debug!(event = "pairing_event_malformed", error = %err);
                    return;
                }
            },
            PushEvent::Disconnected { reason } => {
                self.stream = None;
                let Some(attempt) = self.attempt.as_mut() else {
                    return;
                };
                let transition = attempt.transport_closed();
                if transition == PairingTransition::Failed {
                    warn!(event = "pairing_stream_lost", reason = %reason);
                }
                transition
            }
        };
        self.after_transition(transition);
    }

    fn after_transition(&mut self, transition: PairingTransition) {
        match transition {
            PairingTransition::Succeeded(source) => {
                info!(event = "pairing_succeeded", source = ?source);
                self.close_stream("success");
                self.start_approval_poll();
            }
            PairingTransition::Failed => {
                let message = self
                    .attempt
                    .as_ref()
                    .and_then(|attempt| attempt.error_message.clone())
                    .unwrap_or_default();
                warn!(event = "pairing_failed", error = %message);
                self.close_stream("error");
            }
            PairingTransition::CodeRotated => {
                let rotations = self
                    .attempt
                    .as_ref()
                    .map(|attempt| attempt.code_rotations)
                    .unwrap_or_default();
                debug!(event = "pairing_code_rotated", rotations);
            }
            _ => {}
        }
    }

    fn handle_connect(&mut self, token: SequenceToken, result: Result<ActionResponse, ClientError>) {
        if !self.guard.is_current(&OperationClass::ChannelConnect, token) {
            debug!(event = "channel_connect_superseded", token = %token);
            return;
        }
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        let transition = match result.map(|response| response.into_result("channel connect failed")) {
            Ok(Ok(())) => attempt.succeed(SuccessSource::ChannelConnect),
            Ok(Err(message)) => attempt.fail(message),
            Err(err) => attempt.fail(err.user_message()),
        };
        self.after_transition(transition);
    }

    fn start_approval_poll(&mut self) {
        let Some(spec) = self.spec.as_ref() else {
            return;
        };
        if !spec.accepts_inbound {
            return;
        }
        let epoch = self.guard.next_token(OperationClass::ApprovalPoll);
        let api = self.api.clone();
        let results = self.poll_tx.clone();
        let mut scheduler = VisibilityScheduler::new(self.visibility.clone());
        scheduler.start_chained(self.options.approval_poll_interval, move || {
            let api = api.clone();
            let results = results.clone();
            async move {
                let result = api.pending_contacts().await;
                let _ = results.send((epoch, result)).await;
            }
        });
        info!(event = "approval_poll_started", channel = %spec.id);
        self.approval_poll = Some(scheduler);
    }

    fn handle_poll(&mut self, epoch: SequenceToken, result: Result<PendingContacts, ClientError>) {
        if !self.guard.is_current(&OperationClass::ApprovalPoll, epoch) {
            return;
        }
        let Some(spec) = self.spec.as_ref() else {
            return;
        };
        match result {
            Ok(pending) => {
                let channel = spec.id.as_str();
                let added = self.approvals.merge(
                    pending
                        .dm
                        .into_iter()
                        .filter(|request| request.channel == channel),
                );
                if added > 0 {
                    info!(event = "approval_requests_received", added);
                }
            }
            Err(err) => {
                debug!(event = "approval_poll_failed", error = %err);
            }
        }
    }

    fn begin_approval(&mut self, code: String, approvals: &mut JoinSet<ApproveResult>) {
        let Some(epoch) = self.guard.current(&OperationClass::ApprovalPoll) else {
            return;
        };
        if !self.approvals.begin(&code) {
            debug!(event = "approval_noop", code = %code);
            return;
        }
        let channel = self
            .approvals
            .request(&code)
            .map(|request| request.channel.clone())
            .unwrap_or_default();
        let api = self.api.clone();
        approvals.spawn(async move {
            let result = api.approve_dm(&channel, &code).await;
            (epoch, code, result)
        });
    }

    fn handle_approval(
        &mut self,
        epoch: SequenceToken,
        code: String,
        result: Result<ActionResponse, ClientError>,
    ) {
        if !self.guard.is_current(&OperationClass::ApprovalPoll, epoch) {
            return;
        }
        let outcome = match result {
            Ok(response) => response.into_result("approval failed"),
            Err(err) => Err(err.user_message()),
        };
        match &outcome {
            Ok(()) => info!(event = "approval_granted", code = %code),
            Err(error) => warn!(event = "approval_failed", code = %code, error = %error),
        }
        self.approvals.finish(&code, outcome);
    }

    fn approval_phase(&self) -> ApprovalPhase {
        if self.approval_poll.is_none() && self.approvals.is_empty() {
            return ApprovalPhase::Inactive;
        }
        let any_approved = self
            .approvals
            .entries()
            .iter()
            .any(|entry| self.approvals.is_approved(&entry.request.code));
        if any_approved {
            ApprovalPhase::Approved
        } else {
            ApprovalPhase::AwaitingApproval
        }
    }

    fn publish(&self) {
        let view = PairingView {
            channel: self.spec.clone(),
            attempt: self.attempt.clone(),
            approval: self.approval_phase(),
            approvals: self.approvals.entries(),
            approval_error: self.approvals.last_error().map(str::to_string),
            malformed_events: self.malformed_events,
        };
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}
