use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::account::Account;
use crate::engine::{
    AudioSink, CallEvents, CallId, CallInfo, CallOptions, EngineError, Endpoint, InviteState, RedirectOp,
};
use crate::player::{PlaybackOutcome, Player};
use crate::sync::Rendezvous;
use crate::tasks::task::{self, AppTask, TaskMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Initiating,
    Early,
    Connecting,
    Confirmed,
    Disconnected,
}

impl From<InviteState> for CallStatus {
    fn from(state: InviteState) -> Self {
        match state {
            InviteState::Null | InviteState::Calling => CallStatus::Initiating,
            InviteState::Early => CallStatus::Early,
            InviteState::Connecting => CallStatus::Connecting,
            InviteState::Confirmed => CallStatus::Confirmed,
            InviteState::Disconnected => CallStatus::Disconnected,
        }
    }
}

/// Why [`Call::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallWake {
    PlaybackDone,
    Disconnected,
}

struct CallState {
    status: CallStatus,
    remote: String,
    state_text: String,
    last_status: u16,
    playback_started: bool,
    playback: Option<JoinHandle<()>>,
    sink: Option<Arc<dyn AudioSink>>,
}

/// One outbound call. Plays its clip once media is up and wakes the driver
/// when the clip is done or the call ends.
pub struct Call {
    endpoint: Arc<dyn Endpoint>,
    id: OnceLock<CallId>,
    player: Option<Arc<Player>>,
    state: Mutex<CallState>,
    gate: Arc<Rendezvous>,
    playback_done: Arc<AtomicBool>,
}

impl Call {
    pub fn make_call(
        endpoint: Arc<dyn Endpoint>,
        account: &Account,
        destination: &str,
        options: CallOptions,
        player: Option<Player>,
    ) -> Result<Arc<Self>, EngineError> {
        let account_id = account.id().ok_or(EngineError::UnknownAccount)?;
        let call = Arc::new(Self {
            endpoint,
            id: OnceLock::new(),
            player: player.map(Arc::new),
            state: Mutex::new(CallState {
                status: CallStatus::Initiating,
                remote: destination.to_string(),
                state_text: InviteState::Null.as_str().to_string(),
                last_status: 0,
                playback_started: false,
                playback: None,
                sink: None,
            }),
            gate: Arc::new(Rendezvous::default()),
            playback_done: Arc::new(AtomicBool::new(false)),
        });

        let weak: Weak<Call> = Arc::downgrade(&call);
        let events: Weak<dyn CallEvents> = weak;
        let id = call.endpoint.make_call(account_id, destination, &options, events)?;
        let _ = call.id.set(id);
        Ok(call)
    }

    fn lock(&self) -> MutexGuard<'_, CallState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn id(&self) -> Option<CallId> {
        self.id.get().copied()
    }

    pub fn status(&self) -> CallStatus {
        self.lock().status
    }

    /// Remote URI, state text and last SIP status as last reported.
    pub fn describe(&self) -> (String, String, u16) {
        let st = self.lock();
        (st.remote.clone(), st.state_text.clone(), st.last_status)
    }

    fn wake_reason(&self) -> Option<CallWake> {
        if self.lock().status == CallStatus::Disconnected {
            Some(CallWake::Disconnected)
        } else if self.playback_done.load(Ordering::SeqCst) {
            Some(CallWake::PlaybackDone)
        } else {
            None
        }
    }

    /// Block until the clip has been played or the call is gone.
    pub fn wait(&self) -> CallWake {
        loop {
            if let Some(reason) = self.wake_reason() {
                return reason;
            }
            self.gate.wait();
        }
    }

    pub fn wait_within(&self, timeout: Duration) -> Option<CallWake> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(reason) = self.wake_reason() {
                return Some(reason);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() || !self.gate.wait_timeout(left) {
                return self.wake_reason();
            }
        }
    }

    pub fn wait_for_disconnect(&self) {
        while self.status() != CallStatus::Disconnected {
            self.gate.wait();
        }
    }

    pub fn wait_for_disconnect_within(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.status() == CallStatus::Disconnected {
                return true;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() || !self.gate.wait_timeout(left) {
                return self.status() == CallStatus::Disconnected;
            }
        }
    }

    pub fn hangup(&self) {
        if let Some(id) = self.id() {
            self.endpoint.hangup(id);
        }
    }
}

impl CallEvents for Call {
    fn on_call_state(&self, info: &CallInfo) {
        log::info!("*** Call: {} [ {} ]", info.remote_uri, info.state_text);

        let disconnected = {
            let mut st = self.lock();
            if st.status == CallStatus::Disconnected {
                return;
            }
            st.status = info.state.into();
            st.remote.clone_from(&info.remote_uri);
            st.state_text.clone_from(&info.state_text);
            st.last_status = info.last_status;
            st.status == CallStatus::Disconnected
        };
        if disconnected {
            if info.last_status >= 300 {
                log::info!("call ended: {} {}", info.last_status, info.last_reason);
            }
            self.gate.signal();
        }
    }

    fn on_media_state(&self, call: CallId) {
        let sink = match self.endpoint.audio_media(call) {
            Ok(sink) => sink,
            Err(e) => {
                log::warn!("Failed to get audio media: {e}");
                return;
            }
        };
        let Some(player) = self.player.clone() else {
            return;
        };

        {
            let mut st = self.lock();
            if st.playback_started || st.status == CallStatus::Disconnected {
                return;
            }
            st.playback_started = true;
            st.sink = Some(sink.clone());
        }

        let playback = PlaybackTask {
            player,
            sink,
            gate: self.gate.clone(),
            done: self.playback_done.clone(),
        };
        match task::start(playback) {
            Ok(handle) => self.lock().playback = Some(handle),
            Err(e) => log::error!("cannot start playback: {e}"),
        }
    }

    fn on_redirected(&self, target: &str) -> RedirectOp {
        log::info!("*** Redirected to {target}");
        RedirectOp::Accept
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        let (status, playback, sink) = {
            let mut st = self.lock();
            (st.status, st.playback.take(), st.sink.take())
        };
        if status != CallStatus::Disconnected {
            self.hangup();
        }
        if let Some(sink) = &sink {
            sink.stop_transmit();
        }
        if let Some(handle) = playback {
            // The task may attach its source after the first stop.
            while !handle.is_finished() && handle.thread().id() != thread::current().id() {
                if let Some(sink) = &sink {
                    sink.stop_transmit();
                }
                thread::sleep(Duration::from_millis(10));
            }
            task::join(handle);
        }
    }
}

/// Plays the clip off the engine thread, then wakes the call's waiter.
struct PlaybackTask {
    player: Arc<Player>,
    sink: Arc<dyn AudioSink>,
    gate: Arc<Rendezvous>,
    done: Arc<AtomicBool>,
}

impl AppTask for PlaybackTask {
    fn meta(&self) -> TaskMeta {
        TaskMeta {
            name: "playback",
            stack_bytes: None,
        }
    }

    fn into_runner(self: Box<Self>) -> Box<dyn FnOnce() + Send + 'static> {
        Box::new(move || {
            match self.player.start_and_wait(&*self.sink) {
                Ok(PlaybackOutcome::Finished) => {}
                Ok(PlaybackOutcome::Interrupted) => log::debug!("playback cut short"),
                Err(e) => log::warn!("Playback failed: {e}"),
            }
            self.done.store(true, Ordering::SeqCst);
            self.gate.signal();
        })
    }
}
