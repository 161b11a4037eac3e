//! In-memory transport driven by the test itself.

use crate::error::TransportError;
use crate::transport::{Transport, TransportEvent, TransportEventSender, TransportState};
use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct Script {
    events: Option<TransportEventSender>,
    state: Option<TransportState>,
    refuse_connects: bool,
    outcomes: VecDeque<bool>,
    connects: Vec<(String, u16)>,
    written: Vec<Bytes>,
    kills: usize,
    destroyed: bool,
}

/// Transport whose connection outcomes and inbound data are scripted
#[derive(Clone, Default)]
pub(crate) struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    fn emit(script: &Script, event: TransportEvent) {
        if let Some(events) = &script.events {
            let _ = events.send(event);
        }
    }

    /// Every later connect fails with "connection refused"
    pub(crate) fn refuse_connects(&self) {
        self.script().refuse_connects = true;
    }

    /// Outcome of the next connect, ahead of the default
    pub(crate) fn push_connect_outcome(&self, succeeds: bool) {
        self.script().outcomes.push_back(succeeds);
    }

    /// Simulate the remote side dropping the connection
    pub(crate) fn drop_connection(&self, reason: Option<&str>) {
        let mut script = self.script();
        script.state = Some(TransportState::Disconnected);
        Self::emit(
            &script,
            TransportEvent::Disconnected {
                reason: reason.map(str::to_owned),
            },
        );
    }

    /// Deliver inbound bytes
    pub(crate) fn deliver(&self, data: Bytes) {
        Self::emit(&self.script(), TransportEvent::Data(data));
    }

    pub(crate) fn written(&self) -> Vec<Bytes> {
        self.script().written.clone()
    }

    pub(crate) fn connects(&self) -> Vec<(String, u16)> {
        self.script().connects.clone()
    }

    pub(crate) fn kills(&self) -> usize {
        self.script().kills
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.script().destroyed
    }
}

impl Transport for ScriptedTransport {
    fn bind(&self, events: TransportEventSender) {
        self.script().events = Some(events);
    }

    fn connect(&self, host: &str, port: u16) {
        let mut script = self.script();
        script.connects.push((host.to_owned(), port));
        if script.state == Some(TransportState::Connected) {
            return;
        }

        let default = !script.refuse_connects;
        if script.outcomes.pop_front().unwrap_or(default) {
            script.state = Some(TransportState::Connected);
            Self::emit(&script, TransportEvent::Connected);
        } else {
            script.state = Some(TransportState::Disconnected);
            Self::emit(
                &script,
                TransportEvent::Error {
                    message: "connection refused".to_string(),
                    kind: io::ErrorKind::ConnectionRefused,
                },
            );
        }
    }

    fn write(&self, data: Bytes) -> Result<(), TransportError> {
        let mut script = self.script();
        if script.state != Some(TransportState::Connected) {
            return Err(TransportError::NotConnected);
        }
        script.written.push(data);
        Ok(())
    }

    fn disconnect(&self, reason: Option<String>) {
        let mut script = self.script();
        if script.state != Some(TransportState::Connected) {
            return;
        }
        script.state = Some(TransportState::Disconnected);
        Self::emit(&script, TransportEvent::Disconnected { reason });
    }

    fn kill(&self) {
        let mut script = self.script();
        script.state = Some(TransportState::Disconnected);
        script.kills += 1;
    }

    fn destroy(&self) {
        let mut script = self.script();
        script.state = Some(TransportState::Disconnected);
        script.destroyed = true;
        script.events = None;
    }

    fn state(&self) -> TransportState {
        self.script().state.unwrap_or(TransportState::Disconnected)
    }
}
