#![allow(dead_code)]

use futures_util::stream::{self, StreamExt};
use gwc_core::wire::{
    ActionResponse, ChannelState, GatewayStatus, ModelInfo, ModelListResponse, PairingRequest,
    PendingContacts, Snapshot,
};
use gwc_live::client::{ClientError, GatewayApi};
use gwc_live::push::{PushConnector, PushError, PushStream};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

pub async fn advance(ms: u64) {
    tokio::time::advance(Duration::from_millis(ms)).await;
    settle().await;
}

fn http_error(status: u16) -> ClientError {
    ClientError::Http {
        status,
        body: String::new(),
    }
}

pub fn snapshot(online: bool, version: &str) -> Snapshot {
    Snapshot {
        gateway: GatewayStatus {
            online,
            latency_ms: Some(7),
            version: Some(version.to_string()),
            port: Some(18789),
        },
        channels: vec![ChannelState {
            id: "telegram".to_string(),
            connected: true,
            account: None,
        }],
        ..Snapshot::default()
    }
}

#[derive(Debug, Default)]
pub struct Calls {
    pub snapshot: AtomicUsize,
    pub health: AtomicUsize,
    pub test_key: AtomicUsize,
    pub list_models: AtomicUsize,
    pub add_channel: AtomicUsize,
    pub approve_dm: AtomicUsize,
    pub pending_contacts: AtomicUsize,
}

impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Scripted gateway. Unscripted snapshot and health calls fail; unscripted
/// actions succeed.
#[derive(Default)]
pub struct FakeGateway {
    pub calls: Calls,
    snapshots: Mutex<VecDeque<(u64, Result<Snapshot, u16>)>>,
    health: Mutex<VecDeque<bool>>,
    keys: Mutex<HashMap<String, (u64, Result<(), String>)>>,
    tested_keys: Mutex<Vec<String>>,
    models: Mutex<Vec<ModelInfo>>,
    add_outcomes: Mutex<VecDeque<Result<(), String>>>,
    pending: Mutex<Vec<PairingRequest>>,
    approve_delay_ms: Mutex<u64>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_snapshot(&self, delay_ms: u64, result: Result<Snapshot, u16>) {
        self.snapshots.lock().unwrap().push_back((delay_ms, result));
    }

    pub fn push_health(&self, healthy: bool) {
        self.health.lock().unwrap().push_back(healthy);
    }

    pub fn script_key(&self, key: &str, delay_ms: u64, result: Result<(), &str>) {
        self.keys.lock().unwrap().insert(
            key.to_string(),
            (delay_ms, result.map_err(str::to_string)),
        );
    }

    pub fn tested_keys(&self) -> Vec<String> {
        self.tested_keys.lock().unwrap().clone()
    }

    pub fn set_models(&self, ids: &[&str]) {
        *self.models.lock().unwrap() = ids
            .iter()
            .map(|id| ModelInfo {
                id: id.to_string(),
                name: id.to_string(),
            })
            .collect();
    }

    pub fn push_add_outcome(&self, outcome: Result<(), &str>) {
        self.add_outcomes
            .lock()
            .unwrap()
            .push_back(outcome.map_err(str::to_string));
    }

    pub fn set_pending(&self, requests: Vec<PairingRequest>) {
        *self.pending.lock().unwrap() = requests;
    }

    pub fn set_approve_delay(&self, ms: u64) {
        *self.approve_delay_ms.lock().unwrap() = ms;
    }
}

async fn pause(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

fn action(result: Result<(), String>) -> ActionResponse {
    match result {
        Ok(()) => ActionResponse {
            ok: true,
            error: None,
        },
        Err(error) => ActionResponse {
            ok: false,
            error: Some(error),
        },
    }
}

impl GatewayApi for FakeGateway {
    async fn fetch_snapshot(&self) -> Result<Snapshot, ClientError> {
        self.calls.snapshot.fetch_add(1, Ordering::SeqCst);
        let next = self.snapshots.lock().unwrap().pop_front();
        let Some((delay, result)) = next else {
            return Err(http_error(503));
        };
        pause(delay).await;
        result.map_err(http_error)
    }

    async fn probe_health(&self) -> Result<(), ClientError> {
        self.calls.health.fetch_add(1, Ordering::SeqCst);
        let healthy = self.health.lock().unwrap().pop_front().unwrap_or(false);
        if healthy {
            Ok(())
        } else {
            Err(http_error(502))
        }
    }

    async fn test_key(&self, _provider: &str, token: &str) -> Result<ActionResponse, ClientError> {
        self.calls.test_key.fetch_add(1, Ordering::SeqCst);
        self.tested_keys.lock().unwrap().push(token.to_string());
        let scripted = self.keys.lock().unwrap().get(token).cloned();
        let (delay, result) = scripted.unwrap_or((0, Ok(())));
        pause(delay).await;
        Ok(action(result))
    }

    async fn list_models(
        &self,
        _provider: &str,
        _token: &str,
    ) -> Result<ModelListResponse, ClientError> {
        self.calls.list_models.fetch_add(1, Ordering::SeqCst);
        let models = self.models.lock().unwrap().clone();
        Ok(ModelListResponse {
            ok: true,
            models,
            error: None,
        })
    }

    async fn add_channel(&self, _channel: &str, _token: &str) -> Result<ActionResponse, ClientError> {
        self.calls.add_channel.fetch_add(1, Ordering::SeqCst);
        let outcome = self.add_outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()));
        Ok(action(outcome))
    }

    async fn approve_dm(&self, _channel: &str, _code: &str) -> Result<ActionResponse, ClientError> {
        self.calls.approve_dm.fetch_add(1, Ordering::SeqCst);
        let delay = *self.approve_delay_ms.lock().unwrap();
        pause(delay).await;
        Ok(action(Ok(())))
    }

    async fn pending_contacts(&self) -> Result<PendingContacts, ClientError> {
        self.calls.pending_contacts.fetch_add(1, Ordering::SeqCst);
        let dm = self.pending.lock().unwrap().clone();
        Ok(PendingContacts { dm })
    }
}

pub enum Script {
    /// Delivers the messages and keeps the connection open.
    Hang(Vec<String>),
    /// Delivers the messages and closes the connection.
    End(Vec<String>),
    Refuse,
}

pub fn msgs(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub label: String,
    closed: Arc<AtomicBool>,
}

impl Connection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct CloseFlag(Arc<AtomicBool>);

impl Drop for CloseFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Hands out scripted push connections keyed by label and records every
/// connection so tests can check it was closed.
#[derive(Clone, Default)]
pub struct ScriptedPush {
    scripts: Arc<Mutex<HashMap<String, VecDeque<Script>>>>,
    connections: Arc<Mutex<Vec<Connection>>>,
}

impl ScriptedPush {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, label: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .entry(label.to_string())
            .or_default()
            .push_back(script);
    }

    pub fn connector(&self, label: &str) -> ScriptedConnector {
        ScriptedConnector {
            label: label.to_string(),
            push: self.clone(),
        }
    }

    pub fn connections(&self, label: &str) -> Vec<Connection> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .filter(|connection| connection.label == label)
            .cloned()
            .collect()
    }
}

pub struct ScriptedConnector {
    label: String,
    push: ScriptedPush,
}

impl PushConnector for ScriptedConnector {
    async fn connect(&self) -> Result<PushStream, PushError> {
        let script = self
            .push
            .scripts
            .lock()
            .unwrap()
            .get_mut(&self.label)
            .and_then(VecDeque::pop_front);
        let (messages, hang) = match script {
            None | Some(Script::Refuse) => {
                return Err(PushError::Connect(format!("{} refused", self.label)))
            }
            Some(Script::Hang(messages)) => (messages, true),
            Some(Script::End(messages)) => (messages, false),
        };
        let closed = Arc::new(AtomicBool::new(false));
        self.push.connections.lock().unwrap().push(Connection {
            label: self.label.clone(),
            closed: closed.clone(),
        });
        let flag = CloseFlag(closed);
        let items = stream::iter(messages.into_iter().map(Ok));
        let tail = if hang {
            stream::pending().boxed()
        } else {
            stream::empty().boxed()
        };
        Ok(items
            .chain(tail)
            .map(move |item| {
                let _keep = &flag;
                item
            })
            .boxed())
    }
}
