//! Scripted [`Endpoint`] for exercising the state machines without a network.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{
    AccountEvents, AccountId, AudioSink, CallEvents, CallId, CallInfo, CallOptions, EngineError, Endpoint,
    InviteState, MediaError, RedirectOp,
};
use crate::player::{PlaybackSource, FRAME_SAMPLES};
use crate::settings::AccountConfig;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Debug, Clone)]
pub enum CallStep {
    State(InviteState, u16),
    Media,
    Redirect(String),
    Pause(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkMode {
    Consume,
    Hold,
    Fail,
}

/// Audio sink that either drains the source inline, keeps it until
/// `stop_transmit`, or refuses it.
#[derive(Debug)]
pub struct MockSink {
    mode: SinkMode,
    samples: AtomicUsize,
    starts: AtomicUsize,
    held: Mutex<Option<PlaybackSource>>,
}

impl MockSink {
    fn with_mode(mode: SinkMode) -> Self {
        Self {
            mode,
            samples: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            held: Mutex::new(None),
        }
    }

    pub fn consuming() -> Self {
        Self::with_mode(SinkMode::Consume)
    }

    pub fn holding() -> Self {
        Self::with_mode(SinkMode::Hold)
    }

    pub fn failing() -> Self {
        Self::with_mode(SinkMode::Fail)
    }

    pub fn samples(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

impl AudioSink for MockSink {
    fn start_transmit(&self, mut source: PlaybackSource) -> Result<(), MediaError> {
        match self.mode {
            SinkMode::Fail => {
                self.starts.fetch_add(1, Ordering::SeqCst);
                drop(source);
                Err(MediaError::NotActive)
            }
            SinkMode::Hold => {
                *lock(&self.held) = Some(source);
                self.starts.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            SinkMode::Consume => {
                self.starts.fetch_add(1, Ordering::SeqCst);
                let mut frame = [0i16; FRAME_SAMPLES];
                loop {
                    let n = source.read_frame(&mut frame);
                    if n == 0 {
                        break;
                    }
                    self.samples.fetch_add(n, Ordering::SeqCst);
                }
                Ok(())
            }
        }
    }

    fn stop_transmit(&self) {
        let held = lock(&self.held).take();
        drop(held);
    }
}

struct MockCall {
    events: Weak<dyn CallEvents>,
    info: CallInfo,
}

/// Records every command as a short string and plays back a script of
/// notifications from background threads.
pub struct MockEndpoint {
    registration: Option<(u16, bool)>,
    steps: Vec<CallStep>,
    media_ok: bool,
    fail_transport: bool,
    sink: Arc<MockSink>,
    commands: Mutex<Vec<String>>,
    calls: Arc<Mutex<HashMap<CallId, MockCall>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU32,
    hung_up: Arc<AtomicBool>,
}

impl MockEndpoint {
    /// `registration` is the (code, active) pair reported after `add_account`;
    /// `None` never reports.
    pub fn new(registration: Option<(u16, bool)>, steps: Vec<CallStep>) -> Self {
        Self {
            registration,
            steps,
            media_ok: true,
            fail_transport: false,
            sink: Arc::new(MockSink::consuming()),
            commands: Mutex::new(Vec::new()),
            calls: Arc::new(Mutex::new(HashMap::new())),
            threads: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
            hung_up: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_sink(mut self, sink: MockSink) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn without_media(mut self) -> Self {
        self.media_ok = false;
        self
    }

    pub fn failing_transport(mut self) -> Self {
        self.fail_transport = true;
        self
    }

    pub fn sink(&self) -> &Arc<MockSink> {
        &self.sink
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    fn record(&self, command: impl Into<String>) {
        lock(&self.commands).push(command.into());
    }

    fn spawn(&self, f: impl FnOnce() + Send + 'static) {
        let handle = thread::spawn(f);
        lock(&self.threads).push(handle);
    }

    /// Move `call` to `state` and tell its owner.
    fn notify_state(calls: &Mutex<HashMap<CallId, MockCall>>, call: CallId, state: InviteState, code: u16) -> bool {
        let (events, info) = {
            let mut calls = lock(calls);
            let Some(entry) = calls.get_mut(&call) else {
                return false;
            };
            if entry.info.state == InviteState::Disconnected {
                return false;
            }
            entry.info = CallInfo::new(call, &entry.info.remote_uri, state, code, reason_for(code));
            (entry.events.clone(), entry.info.clone())
        };
        match events.upgrade() {
            Some(events) => {
                events.on_call_state(&info);
                true
            }
            None => false,
        }
    }
}

fn reason_for(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        403 => "Forbidden",
        408 => "Request Timeout",
        486 => "Busy Here",
        487 => "Request Terminated",
        _ => "",
    }
}

impl Endpoint for MockEndpoint {
    fn create_transport(&self, local_port: u16) -> Result<SocketAddr, EngineError> {
        self.record(format!("create_transport {local_port}"));
        if self.fail_transport {
            return Err(EngineError::Transport(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "port taken",
            )));
        }
        Ok(SocketAddr::from(([127, 0, 0, 1], 5060)))
    }

    fn start(&self) -> Result<(), EngineError> {
        self.record("start");
        Ok(())
    }

    fn shutdown(&self) {
        self.record("shutdown");
        let threads: Vec<_> = lock(&self.threads).drain(..).collect();
        for handle in threads {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn add_account(&self, config: &AccountConfig, events: Weak<dyn AccountEvents>) -> Result<AccountId, EngineError> {
        self.record(format!("add_account {}", config.id_uri));
        let id = AccountId(self.next_id.fetch_add(1, Ordering::SeqCst));
        if let Some((code, active)) = self.registration {
            self.spawn(move || {
                thread::sleep(Duration::from_millis(5));
                if let Some(events) = events.upgrade() {
                    events.on_reg_state(code, reason_for(code), active);
                }
            });
        }
        Ok(id)
    }

    fn remove_account(&self, account: AccountId) {
        self.record(format!("remove_account {}", account.0));
    }

    fn make_call(
        &self,
        account: AccountId,
        destination: &str,
        options: &CallOptions,
        events: Weak<dyn CallEvents>,
    ) -> Result<CallId, EngineError> {
        self.record(format!("make_call {} {destination}", account.0));
        if options.audio_count != 1 || options.video_count != 0 {
            return Err(EngineError::UnsupportedMedia("exactly one audio stream"));
        }
        let id = CallId(self.next_id.fetch_add(1, Ordering::SeqCst));
        lock(&self.calls).insert(
            id,
            MockCall {
                events: events.clone(),
                info: CallInfo::new(id, destination, InviteState::Null, 0, ""),
            },
        );

        let steps = self.steps.clone();
        let calls = self.calls.clone();
        let hung_up = self.hung_up.clone();
        self.spawn(move || {
            for step in steps {
                if hung_up.load(Ordering::SeqCst) {
                    return;
                }
                match step {
                    CallStep::State(state, code) => {
                        if !Self::notify_state(&calls, id, state, code) {
                            return;
                        }
                    }
                    CallStep::Media => match events.upgrade() {
                        Some(events) => events.on_media_state(id),
                        None => return,
                    },
                    CallStep::Redirect(target) => {
                        let Some(events) = events.upgrade() else { return };
                        if events.on_redirected(&target) == RedirectOp::Accept {
                            if let Some(entry) = lock(&calls).get_mut(&id) {
                                entry.info.remote_uri = target;
                            }
                        } else if !Self::notify_state(&calls, id, InviteState::Disconnected, 302) {
                            return;
                        }
                    }
                    CallStep::Pause(d) => thread::sleep(d),
                }
            }
        });
        Ok(id)
    }

    fn call_info(&self, call: CallId) -> Option<CallInfo> {
        lock(&self.calls).get(&call).map(|c| c.info.clone())
    }

    fn audio_media(&self, call: CallId) -> Result<Arc<dyn AudioSink>, MediaError> {
        let active = lock(&self.calls)
            .get(&call)
            .is_some_and(|c| c.info.state != InviteState::Disconnected);
        if self.media_ok && active {
            let sink: Arc<dyn AudioSink> = self.sink.clone();
            Ok(sink)
        } else {
            Err(MediaError::NotActive)
        }
    }

    fn hangup(&self, call: CallId) {
        self.record(format!("hangup {}", call.0));
        let code = match lock(&self.calls).get(&call).map(|c| c.info.state) {
            Some(InviteState::Disconnected) | None => return,
            Some(InviteState::Confirmed) => 200,
            Some(_) => 487,
        };
        self.hung_up.store(true, Ordering::SeqCst);
        let calls = self.calls.clone();
        self.spawn(move || {
            MockEndpoint::notify_state(&calls, call, InviteState::Disconnected, code);
        });
    }

    fn hangup_all(&self) {
        self.record("hangup_all");
        let active: Vec<CallId> = lock(&self.calls)
            .iter()
            .filter(|(_, c)| c.info.state != InviteState::Disconnected)
            .map(|(id, _)| *id)
            .collect();
        for call in active {
            self.hangup(call);
        }
    }
}
