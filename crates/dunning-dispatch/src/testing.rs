//! Scripted transport and document fetcher for engine tests.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dunning_core::error::{DunningError, Result};
use dunning_core::traits::{DocumentFetcher, Transport};
use dunning_core::types::{OutgoingMessage, TypingEvent};

/// What the next `send` to a recipient does.
#[derive(Debug, Clone, PartialEq)]
pub enum SendResult {
    Ok,
    Timeout,
    Disconnected,
    InvalidRecipient,
    Rejected,
    /// Never completes.
    Hang,
}

type ConnectHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct TransportState {
    connected: bool,
    scripts: HashMap<String, VecDeque<SendResult>>,
    connect_script: VecDeque<bool>,
    connect_calls: u32,
    connect_hook: Option<ConnectHook>,
    send_calls: Vec<String>,
    sent: Vec<OutgoingMessage>,
    composed: usize,
}

/// Transport double. Clones share state, so a test keeps one handle while
/// the executor owns another.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<TransportState>>,
    compose: bool,
}

impl ScriptedTransport {
    pub fn connected() -> Self {
        let t = Self::default();
        t.state.lock().unwrap().connected = true;
        t
    }

    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn with_compose(mut self) -> Self {
        self.compose = true;
        self
    }

    /// Queue results for sends to `id`; once drained, sends succeed.
    pub fn script(&self, id: &str, results: Vec<SendResult>) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(id.to_string(), results.into());
    }

    /// Queue connect outcomes; once drained, connects succeed.
    pub fn script_connects(&self, outcomes: Vec<bool>) {
        self.state.lock().unwrap().connect_script = outcomes.into();
    }

    /// Run `hook` at the start of every connect call.
    pub fn on_connect<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.state.lock().unwrap().connect_hook = Some(Arc::new(hook));
    }

    /// Successfully delivered messages.
    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Recipient of every send call, whatever its result.
    pub fn send_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().send_calls.clone()
    }

    pub fn connect_calls(&self) -> u32 {
        self.state.lock().unwrap().connect_calls
    }

    pub fn composed(&self) -> usize {
        self.state.lock().unwrap().composed
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn connect(&mut self) -> Result<()> {
        let hook = self.state.lock().unwrap().connect_hook.clone();
        if let Some(hook) = hook {
            hook();
        }
        let mut state = self.state.lock().unwrap();
        state.connect_calls += 1;
        let ok = state.connect_script.pop_front().unwrap_or(true);
        state.connected = ok;
        if ok {
            Ok(())
        } else {
            Err(DunningError::Disconnected("scripted connect failure".into()))
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.state.lock().unwrap().connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    async fn send(&self, message: &OutgoingMessage) -> Result<()> {
        let result = {
            let mut state = self.state.lock().unwrap();
            state.send_calls.push(message.recipient_id.clone());
            let result = state
                .scripts
                .get_mut(&message.recipient_id)
                .and_then(|q| q.pop_front())
                .unwrap_or(SendResult::Ok);
            match result {
                SendResult::Ok => state.sent.push(message.clone()),
                SendResult::Disconnected => state.connected = false,
                _ => {}
            }
            result
        };

        match result {
            SendResult::Ok => Ok(()),
            SendResult::Timeout => Err(DunningError::Timeout(30)),
            SendResult::Disconnected => Err(DunningError::Disconnected("connection reset".into())),
            SendResult::InvalidRecipient => {
                Err(DunningError::InvalidRecipient("number does not exist".into()))
            }
            SendResult::Rejected => Err(DunningError::Rejected("recipient blocked".into())),
            SendResult::Hang => futures::future::pending().await,
        }
    }

    fn supports_compose(&self) -> bool {
        self.compose
    }

    async fn compose(&self, _recipient_id: &str, _event: &TypingEvent) -> Result<()> {
        self.state.lock().unwrap().composed += 1;
        Ok(())
    }
}

/// What the fetcher does on a call.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchBehavior {
    Found(PathBuf),
    Missing,
    Fail,
    Hang,
}

/// Fetcher double. Behaviours apply call by call; the last one repeats.
#[derive(Clone)]
pub struct ScriptedFetcher {
    behaviors: Vec<FetchBehavior>,
    calls: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

impl ScriptedFetcher {
    pub fn new(behavior: FetchBehavior) -> Self {
        Self::sequence(vec![behavior])
    }

    pub fn sequence(behaviors: Vec<FetchBehavior>) -> Self {
        Self {
            behaviors,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DocumentFetcher for ScriptedFetcher {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch(
        &self,
        customer_id: &str,
        protocol: Option<&str>,
        _timeout: Duration,
    ) -> Result<Option<PathBuf>> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((customer_id.to_string(), protocol.map(String::from)));
            calls.len() - 1
        };
        let behavior = self
            .behaviors
            .get(call)
            .or_else(|| self.behaviors.last())
            .cloned()
            .unwrap_or(FetchBehavior::Missing);
        match behavior {
            FetchBehavior::Found(path) => Ok(Some(path)),
            FetchBehavior::Missing => Ok(None),
            FetchBehavior::Fail => Err(DunningError::Document("portal returned 500".into())),
            FetchBehavior::Hang => futures::future::pending().await,
        }
    }
}
