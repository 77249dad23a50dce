//! Remote-peer controller: selects one reachable upstream candidate out of an
//! ordered list and drives a connect -> verify -> use -> reattempt cycle.
//!
//! Like [`crate::server_logics`], this is pure state plus effects -- no
//! sockets. The owning actor feeds it channel-lifecycle events and periodic
//! ticks, and turns the effects it returns into real connect/disconnect calls.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::CustomServer;
use crate::logging;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Stopped,
    Connecting,
    Verifying,
    Started,
    WaitingReattempt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteControllerEffect {
    Connect(CustomServer),
    Disconnect,
    SendStatusRequest,
}

pub struct RemoteController {
    clock: Arc<dyn Clock>,
    candidates: Vec<CustomServer>,
    index: usize,
    state: RemoteState,
    connect_timeout_ms: u64,
    reattempt_wait_ms: u64,
    deadline_ms: Option<u64>,
}

impl RemoteController {
    pub fn new(clock: Arc<dyn Clock>, connect_timeout: Duration, reattempt_wait: Duration) -> Self {
        Self {
            clock,
            candidates: Vec::new(),
            index: 0,
            state: RemoteState::Stopped,
            connect_timeout_ms: connect_timeout.as_millis() as u64,
            reattempt_wait_ms: reattempt_wait.as_millis() as u64,
            deadline_ms: None,
        }
    }

    pub fn state(&self) -> RemoteState {
        self.state
    }

    pub fn current_candidate(&self) -> Option<&CustomServer> {
        self.candidates.get(self.index)
    }

    /// STOPPED + Start -> connect to `candidates[0]`, arm the connect timeout.
    pub fn start(&mut self, candidates: Vec<CustomServer>) -> Vec<RemoteControllerEffect> {
        self.candidates = candidates;
        self.index = 0;
        self.enter_connecting().into_iter().collect()
    }

    fn enter_connecting(&mut self) -> Option<RemoteControllerEffect> {
        let candidate = self.candidates.get(self.index)?.clone();
        self.state = RemoteState::Connecting;
        self.arm_connect_timeout();
        logging::log_remote_event("connecting", &format!("{}:{}", candidate.ip, candidate.port));
        Some(RemoteControllerEffect::Connect(candidate))
    }

    fn arm_connect_timeout(&mut self) {
        self.deadline_ms = Some(self.clock.now_millis() + self.connect_timeout_ms);
    }

    fn arm_reattempt_timer(&mut self) {
        self.deadline_ms = Some(self.clock.now_millis() + self.reattempt_wait_ms);
    }

    /// Any state + Stop -> STOPPED, timers cancelled.
    pub fn stop(&mut self) -> Vec<RemoteControllerEffect> {
        let was_live = !matches!(self.state, RemoteState::Stopped);
        self.state = RemoteState::Stopped;
        self.deadline_ms = None;
        if was_live {
            vec![RemoteControllerEffect::Disconnect]
        } else {
            Vec::new()
        }
    }

    /// CONNECTING + channel open -> issue `StatusRequest`, enter VERIFYING.
    /// The connect timeout keeps running: it covers socket-open through
    /// `Status` reply as a single 1 s budget, not two.
    pub fn on_channel_open(&mut self) -> Vec<RemoteControllerEffect> {
        if self.state != RemoteState::Connecting {
            return Vec::new();
        }
        self.state = RemoteState::Verifying;
        vec![RemoteControllerEffect::SendStatusRequest]
    }

    /// VERIFYING + `Status` reply -> STARTED.
    pub fn on_status_reply(&mut self) {
        if self.state == RemoteState::Verifying {
            self.state = RemoteState::Started;
            self.deadline_ms = None;
            let name = self.current_candidate().map(|c| c.name.as_str()).unwrap_or("?");
            logging::log_remote_event("started", name);
        }
    }

    /// CONNECTING/VERIFYING + timeout/refused/unexpected packet -> disconnect,
    /// advance candidate. STARTED + remote closes channel -> WAITING_REATTEMPT.
    pub fn on_channel_problem(&mut self) -> Vec<RemoteControllerEffect> {
        match self.state {
            RemoteState::Connecting | RemoteState::Verifying => self.advance_or_reattempt(),
            RemoteState::Started => {
                self.state = RemoteState::WaitingReattempt;
                self.arm_reattempt_timer();
                logging::log_remote_event("disconnected", "upstream closed the channel");
                vec![RemoteControllerEffect::Disconnect]
            }
            RemoteState::Stopped | RemoteState::WaitingReattempt => Vec::new(),
        }
    }

    fn advance_or_reattempt(&mut self) -> Vec<RemoteControllerEffect> {
        let mut effects = vec![RemoteControllerEffect::Disconnect];
        self.index += 1;
        if self.index < self.candidates.len() {
            effects.extend(self.enter_connecting());
        } else {
            self.state = RemoteState::WaitingReattempt;
            self.arm_reattempt_timer();
        }
        effects
    }

    /// Drive timers; call on every fast tick.
    pub fn tick(&mut self) -> Vec<RemoteControllerEffect> {
        let now = self.clock.now_millis();
        let expired = matches!(self.deadline_ms, Some(d) if now >= d);
        if !expired {
            return Vec::new();
        }

        match self.state {
            RemoteState::Connecting | RemoteState::Verifying => {
                self.deadline_ms = None;
                self.advance_or_reattempt()
            }
            RemoteState::WaitingReattempt => {
                self.index = 0;
                self.deadline_ms = None;
                self.enter_connecting().into_iter().collect()
            }
            _ => Vec::new(),
        }
    }

    /// Update the effective candidate list (settings change or shared
    /// directory refresh). If the new list agrees with the old one up
    /// through `index`, the live connection is left untouched; otherwise the
    /// controller restarts from index 0.
    pub fn update_candidates(&mut self, new_candidates: Vec<CustomServer>) -> Vec<RemoteControllerEffect> {
        if new_candidates == self.candidates {
            return Vec::new();
        }

        // `self.index` can sit one past the end of `self.candidates` while
        // WAITING_REATTEMPT (the candidate list was just exhausted), so slice
        // defensively with `get` rather than indexing straight through.
        let prefix_agrees = self.state != RemoteState::Stopped
            && match (self.candidates.get(..=self.index), new_candidates.get(..=self.index)) {
                (Some(old_prefix), Some(new_prefix)) => old_prefix == new_prefix,
                _ => false,
            };

        if prefix_agrees {
            self.candidates = new_candidates;
            return Vec::new();
        }

        let was_live = !matches!(self.state, RemoteState::Stopped);
        self.candidates = new_candidates;
        self.index = 0;
        self.state = RemoteState::Stopped;
        self.deadline_ms = None;

        let mut effects = Vec::new();
        if was_live {
            effects.push(RemoteControllerEffect::Disconnect);
        }
        effects.extend(self.enter_connecting());
        effects
    }
}
