//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use roomsync::channel::LoopbackHub;
use roomsync::gateway::{CommandRequest, CompletionGateway};
use roomsync::session::{SessionUpdate, SyncSession};
use roomsync::{Result, SyncConfig, SyncError};

/// Completion service double: counts calls, records queries and replays
/// canned outcomes in order. Once the script runs out it answers `"ok"`.
#[derive(Default)]
pub struct ScriptedGateway {
    calls: AtomicUsize,
    queries: Mutex<Vec<String>>,
    script: Mutex<VecDeque<std::result::Result<String, String>>>,
    delay: Option<Duration>,
}

impl ScriptedGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_script(outcomes: Vec<std::result::Result<&str, &str>>) -> Arc<Self> {
        let gw = Self::default();
        if let Ok(mut script) = gw.script.lock() {
            script.extend(
                outcomes
                    .into_iter()
                    .map(|o| o.map(str::to_string).map_err(str::to_string)),
            );
        }
        Arc::new(gw)
    }

    /// Every call sleeps for `delay` before answering.
    pub fn delayed(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionGateway for ScriptedGateway {
    async fn complete(&self, request: &CommandRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(request.query.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(text)) => Ok(text),
            Some(Err(reason)) => Err(SyncError::AssistantUnavailable(reason)),
            None => Ok("ok".to_string()),
        }
    }
}

pub fn config(name: &str) -> SyncConfig {
    SyncConfig {
        username: name.to_string(),
        ..SyncConfig::default()
    }
}

pub fn loopback_session(hub: &LoopbackHub, name: &str, gateway: Arc<ScriptedGateway>) -> SyncSession {
    SyncSession::new(&config(name), Arc::new(hub.connect(name)), gateway)
}

/// Tick until nothing happens for `quiet`, returning every update seen.
pub async fn settle_for(session: &mut SyncSession, quiet: Duration) -> Vec<SessionUpdate> {
    let mut updates = Vec::new();
    while let Ok(Some(update)) = tokio::time::timeout(quiet, session.tick()).await {
        updates.push(update);
    }
    updates
}

pub async fn settle(session: &mut SyncSession) -> Vec<SessionUpdate> {
    settle_for(session, Duration::from_millis(100)).await
}
