//! UDP engine around the sans-IO [`SipStack`].
//!
//! One `sip` worker thread owns the socket and the stack. The API side talks
//! to it over an mpsc channel and reads call state and media handles from
//! maps the worker keeps up to date.

use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::mpsc::{channel, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rtp_audio::Codec;
use sdp::{SessionDescription, OFFERED_PAYLOAD_TYPES};
use sip_core::{
    parse_message, AccountKey, AccountParams, CallKey, CoreEvent, DialogState, LocalContact, NextHop, Outgoing,
    SipStack, SipUri,
};

use super::media::RtpStream;
use super::{
    AccountEvents, AccountId, AudioSink, CallEvents, CallId, CallInfo, CallOptions, EngineError, Endpoint,
    InviteState, MediaError, RedirectOp,
};
use crate::messages::{EngineCommand, EngineCommandReceiver, EngineCommandSender};
use crate::settings::{AccountConfig, EngineConfig};
use crate::tasks::task::{self, AppTask, TaskMeta};

const RECV_TIMEOUT: Duration = Duration::from_millis(20);
/// How long shutdown waits for outstanding transactions (unREGISTER, BYE).
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const RX_BUF_SIZE: usize = 8192;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// State the worker publishes for the API side.
#[derive(Default)]
struct Shared {
    calls: Mutex<HashMap<CallId, CallInfo>>,
    media: Mutex<HashMap<CallId, Arc<RtpStream>>>,
}

impl Shared {
    fn drop_media(&self, call: CallId) {
        let stream = lock(&self.media).remove(&call);
        if let Some(stream) = stream {
            stream.stop_transmit();
        }
    }
}

/// SIP user agent over UDP with G.711 media.
pub struct SipEngine {
    config: EngineConfig,
    shared: Arc<Shared>,
    socket: Mutex<Option<UdpSocket>>,
    commands: Mutex<Option<EngineCommandSender>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SipEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
            socket: Mutex::new(None),
            commands: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    fn send(&self, command: EngineCommand) -> Result<(), EngineError> {
        let commands = lock(&self.commands);
        let sender = commands.as_ref().ok_or(EngineError::NotStarted)?;
        sender.send(command).map_err(|_| EngineError::Shutdown)
    }
}

fn seed() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    nanos ^ ((std::process::id() as u64) << 32)
}

impl Endpoint for SipEngine {
    fn create_transport(&self, local_port: u16) -> Result<SocketAddr, EngineError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, local_port))?;
        let addr = socket.local_addr()?;
        log::info!("SIP transport listening on UDP {addr}");
        *lock(&self.socket) = Some(socket);
        Ok(addr)
    }

    fn start(&self) -> Result<(), EngineError> {
        let socket = lock(&self.socket).take().ok_or(EngineError::NotStarted)?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;

        let (tx, rx) = channel();
        let worker = SipWorker::new(socket, rx, self.shared.clone());
        let handle = task::start(worker)?;
        *lock(&self.commands) = Some(tx);
        *lock(&self.worker) = Some(handle);
        Ok(())
    }

    fn shutdown(&self) {
        if let Some(commands) = lock(&self.commands).take() {
            let _ = commands.send(EngineCommand::Shutdown);
        }
        let worker = lock(&self.worker).take();
        if let Some(handle) = worker {
            task::join(handle);
        }
    }

    fn add_account(&self, config: &AccountConfig, events: Weak<dyn AccountEvents>) -> Result<AccountId, EngineError> {
        let (reply, response) = channel();
        self.send(EngineCommand::AddAccount {
            config: config.clone(),
            expires: self.config.registration_expires,
            events,
            reply,
        })?;
        response.recv().map_err(|_| EngineError::Shutdown)?
    }

    fn remove_account(&self, account: AccountId) {
        let _ = self.send(EngineCommand::RemoveAccount(account));
    }

    fn make_call(
        &self,
        account: AccountId,
        destination: &str,
        options: &CallOptions,
        events: Weak<dyn CallEvents>,
    ) -> Result<CallId, EngineError> {
        if options.audio_count != 1 {
            return Err(EngineError::UnsupportedMedia("exactly one audio stream is supported"));
        }
        if options.video_count != 0 {
            return Err(EngineError::UnsupportedMedia("video is not supported"));
        }
        let (reply, response) = channel();
        self.send(EngineCommand::MakeCall {
            account,
            destination: destination.to_string(),
            events,
            reply,
        })?;
        response.recv().map_err(|_| EngineError::Shutdown)?
    }

    fn call_info(&self, call: CallId) -> Option<CallInfo> {
        lock(&self.shared.calls).get(&call).cloned()
    }

    fn audio_media(&self, call: CallId) -> Result<Arc<dyn AudioSink>, MediaError> {
        let stream = lock(&self.shared.media).get(&call).cloned().ok_or(MediaError::NotActive)?;
        let sink: Arc<dyn AudioSink> = stream;
        Ok(sink)
    }

    fn hangup(&self, call: CallId) {
        let _ = self.send(EngineCommand::Hangup(call));
    }

    fn hangup_all(&self) {
        let _ = self.send(EngineCommand::HangupAll);
    }
}

impl Drop for SipEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct CallSlot {
    events: Weak<dyn CallEvents>,
    /// Media socket advertised in the offer, until the answer arrives.
    rtp: Option<UdpSocket>,
    ssrc: u32,
}

fn invite_state(state: DialogState) -> InviteState {
    match state {
        DialogState::Null => InviteState::Null,
        DialogState::Calling => InviteState::Calling,
        DialogState::Early => InviteState::Early,
        DialogState::Connecting => InviteState::Connecting,
        DialogState::Confirmed => InviteState::Confirmed,
        DialogState::Terminated => InviteState::Disconnected,
    }
}

struct SipWorker {
    socket: UdpSocket,
    commands: EngineCommandReceiver,
    shared: Arc<Shared>,
    seed: u64,
    stack: Option<SipStack>,
    accounts: HashMap<AccountKey, Weak<dyn AccountEvents>>,
    calls: HashMap<CallKey, CallSlot>,
    hops: HashMap<String, SocketAddr>,
    rx_buf: Vec<u8>,
}

impl AppTask for SipWorker {
    fn meta(&self) -> TaskMeta {
        TaskMeta {
            name: "sip",
            stack_bytes: Some(256 * 1024),
        }
    }

    fn into_runner(mut self: Box<Self>) -> Box<dyn FnOnce() + Send + 'static> {
        Box::new(move || {
            self.run();
        })
    }
}

impl SipWorker {
    fn new(socket: UdpSocket, commands: EngineCommandReceiver, shared: Arc<Shared>) -> Self {
        Self {
            socket,
            commands,
            shared,
            seed: seed(),
            stack: None,
            accounts: HashMap::new(),
            calls: HashMap::new(),
            hops: HashMap::new(),
            rx_buf: vec![0u8; RX_BUF_SIZE],
        }
    }

    fn run(&mut self) {
        match self.socket.local_addr() {
            Ok(addr) => log::info!("SIP task started on {addr}"),
            Err(_) => log::info!("SIP task started"),
        }

        loop {
            if !self.poll_commands() {
                break;
            }
            self.receive();
            self.poll_timers();
        }

        self.drain();
        let calls: Vec<CallId> = self.calls.keys().map(|k| CallId(k.0)).collect();
        for call in calls {
            self.shared.drop_media(call);
        }
        log::info!("SIP task stopped");
    }

    /// Returns false once the engine asked us to stop.
    fn poll_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(EngineCommand::Shutdown) => return false,
                Ok(cmd) => self.handle_command(cmd),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => {
                    log::warn!("engine command channel closed");
                    return false;
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: EngineCommand) {
        let now = Instant::now();
        match cmd {
            EngineCommand::AddAccount {
                config,
                expires,
                events,
                reply,
            } => {
                let (result, out) = match self.add_account(config, expires, events, now) {
                    Ok((id, out)) => (Ok(id), out),
                    Err(e) => (Err(e), Vec::new()),
                };
                let _ = reply.send(result);
                self.process(out);
            }
            EngineCommand::RemoveAccount(id) => {
                let key = AccountKey(id.0);
                self.accounts.remove(&key);
                if let Some(stack) = self.stack.as_mut() {
                    let out = stack.remove_account(key, now);
                    self.process(out);
                }
            }
            EngineCommand::MakeCall {
                account,
                destination,
                events,
                reply,
            } => {
                let (result, out) = match self.make_call(account, &destination, events, now) {
                    Ok((id, out)) => (Ok(id), out),
                    Err(e) => (Err(e), Vec::new()),
                };
                let _ = reply.send(result);
                self.process(out);
            }
            EngineCommand::Hangup(call) => {
                if let Some(stack) = self.stack.as_mut() {
                    let out = stack.hangup(CallKey(call.0), now);
                    self.process(out);
                }
            }
            EngineCommand::HangupAll => {
                if let Some(stack) = self.stack.as_mut() {
                    let out = stack.hangup_all(now);
                    self.process(out);
                }
            }
            EngineCommand::Shutdown => {}
        }
    }

    fn add_account(
        &mut self,
        config: AccountConfig,
        expires: u32,
        events: Weak<dyn AccountEvents>,
        now: Instant,
    ) -> Result<(AccountId, Vec<CoreEvent>), EngineError> {
        if self.stack.is_none() {
            let first_hop = config.proxy.as_deref().unwrap_or(&config.registrar_uri);
            let dest = self.resolve(&NextHop::Uri(first_hop.to_string()))?;
            let ip = self.local_ip_toward(dest)?;
            let port = self.socket.local_addr()?.port();
            log::info!("local contact {ip}:{port}");
            self.stack = Some(SipStack::new(LocalContact::new(&ip.to_string(), port), self.seed));
        }
        let stack = self.stack.as_mut().ok_or(EngineError::NotStarted)?;

        let params = AccountParams {
            aor: config.id_uri,
            registrar: config.registrar_uri,
            proxy: config.proxy,
            realm: config.realm,
            username: config.user,
            password: config.password,
            expires,
        };
        let (key, out) = stack.add_account(params, now)?;
        self.accounts.insert(key, events);
        Ok((AccountId(key.0), out))
    }

    fn make_call(
        &mut self,
        account: AccountId,
        destination: &str,
        events: Weak<dyn CallEvents>,
        now: Instant,
    ) -> Result<(CallId, Vec<CoreEvent>), EngineError> {
        if !self.accounts.contains_key(&AccountKey(account.0)) {
            return Err(EngineError::UnknownAccount);
        }
        let stack = self.stack.as_mut().ok_or(EngineError::UnknownAccount)?;

        let local_ip: IpAddr = stack.local().host.parse().unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let rtp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        let rtp_port = rtp.local_addr()?.port();
        let session_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let offer = SessionDescription::offer(local_ip, rtp_port, session_id).render();

        let (key, out) = stack.make_call(AccountKey(account.0), destination, &offer, now)?;
        let id = CallId(key.0);
        log::debug!("call {} to {destination}, RTP on port {rtp_port}", id.0);
        lock(&self.shared.calls).insert(id, CallInfo::new(id, destination, InviteState::Null, 0, ""));
        self.calls.insert(
            key,
            CallSlot {
                events,
                rtp: Some(rtp),
                ssrc: (self.seed >> 32) as u32 ^ key.0.wrapping_mul(0x9e37_79b9),
            },
        );
        Ok((id, out))
    }

    fn receive(&mut self) {
        let (len, from) = match self.socket.recv_from(&mut self.rx_buf) {
            Ok(received) => received,
            Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => return,
            Err(e) => {
                log::warn!("SIP recv error: {e}");
                return;
            }
        };

        let Ok(text) = std::str::from_utf8(&self.rx_buf[..len]) else {
            log::debug!("dropping non UTF-8 datagram from {from}");
            return;
        };
        let msg = match parse_message(text) {
            Ok(msg) => msg,
            Err(e) => {
                // Keep-alives are a bare CRLF.
                if !text.trim().is_empty() {
                    log::debug!("dropping unparsable datagram from {from}: {e}");
                }
                return;
            }
        };
        log::trace!("recv from {from}:\n{text}");

        let Some(stack) = self.stack.as_mut() else {
            return;
        };
        let out = stack.on_message(msg, from, Instant::now());
        self.process(out);
    }

    fn poll_timers(&mut self) {
        if let Some(stack) = self.stack.as_mut() {
            let out = stack.poll(Instant::now());
            self.process(out);
        }
    }

    /// Hang up what is left, unregister and give the transactions a moment.
    fn drain(&mut self) {
        let Some(stack) = self.stack.as_mut() else {
            return;
        };
        let now = Instant::now();
        let mut out = stack.hangup_all(now);
        let accounts: Vec<AccountKey> = self.accounts.drain().map(|(k, _)| k).collect();
        for key in accounts {
            out.extend(stack.remove_account(key, now));
        }
        self.process(out);

        let deadline = now + DRAIN_TIMEOUT;
        while Instant::now() < deadline && !self.stack.as_ref().map_or(true, SipStack::is_idle) {
            self.receive();
            self.poll_timers();
        }
    }

    fn process(&mut self, events: Vec<CoreEvent>) {
        let mut queue: VecDeque<CoreEvent> = events.into();
        while let Some(event) = queue.pop_front() {
            match event {
                CoreEvent::Send(out) => self.transmit(out),
                CoreEvent::Registration {
                    account,
                    code,
                    reason,
                    active,
                } => {
                    log::debug!("account {} registration {code} {reason}", account.0);
                    let target = self.accounts.get(&account).and_then(|w| w.upgrade());
                    if let Some(target) = target {
                        target.on_reg_state(code, &reason, active);
                    }
                }
                CoreEvent::CallState {
                    call,
                    state,
                    code,
                    reason,
                    remote,
                } => self.on_call_state(call, state, code, &reason, &remote),
                CoreEvent::RemoteMedia { call, sdp } => self.on_remote_media(call, &sdp),
                CoreEvent::Redirected { call, target } => {
                    let op = match self.calls.get(&call).and_then(|c| c.events.upgrade()) {
                        Some(events) => events.on_redirected(&target),
                        None => RedirectOp::Reject,
                    };
                    if let Some(stack) = self.stack.as_mut() {
                        let more = match op {
                            RedirectOp::Accept => stack.follow_redirect(call, Instant::now()),
                            RedirectOp::Reject => stack.reject_redirect(call),
                        };
                        queue.extend(more);
                    }
                }
            }
        }
    }

    fn on_call_state(&mut self, call: CallKey, state: DialogState, code: u16, reason: &str, remote: &str) {
        let id = CallId(call.0);
        let info = CallInfo::new(id, remote, invite_state(state), code, reason);
        lock(&self.shared.calls).insert(id, info.clone());

        let disconnected = info.state == InviteState::Disconnected;
        if disconnected {
            self.shared.drop_media(id);
        }
        let target = self.calls.get(&call).and_then(|c| c.events.upgrade());
        if let Some(target) = target {
            target.on_call_state(&info);
        }
        if disconnected {
            self.calls.remove(&call);
        }
    }

    fn on_remote_media(&mut self, call: CallKey, sdp_text: &str) {
        let id = CallId(call.0);
        let Some(slot) = self.calls.get_mut(&call) else {
            return;
        };

        let offered: Vec<u8> = OFFERED_PAYLOAD_TYPES.iter().map(|(pt, _)| *pt).collect();
        let usable = match sdp::parse(sdp_text) {
            Ok(answer) if answer.accepts_audio() => answer
                .media_address()
                .zip(answer.first_common_payload(&offered).and_then(Codec::from_payload_type)),
            Ok(_) => None,
            Err(e) => {
                log::warn!("cannot parse remote SDP: {e}");
                None
            }
        };

        match usable {
            Some((remote, codec)) => {
                let existing = lock(&self.shared.media).get(&id).cloned();
                if let Some(stream) = existing {
                    log::debug!("media of call {} now {remote} {}", id.0, codec.encoding_name());
                    stream.retarget(remote, codec);
                } else if let Some(socket) = slot.rtp.take() {
                    match RtpStream::new(socket, remote, codec, slot.ssrc) {
                        Ok(stream) => {
                            log::info!("media up: {remote} using {}", codec.encoding_name());
                            lock(&self.shared.media).insert(id, Arc::new(stream));
                        }
                        Err(e) => log::warn!("cannot set up RTP: {e}"),
                    }
                }
            }
            None => {
                log::info!("remote SDP has no usable audio stream");
                self.shared.drop_media(id);
            }
        }

        let target = slot.events.upgrade();
        if let Some(target) = target {
            target.on_media_state(id);
        }
    }

    fn transmit(&mut self, out: Outgoing) {
        let dest = match self.resolve(&out.next_hop) {
            Ok(dest) => dest,
            Err(e) => {
                log::warn!("not sending: {e}");
                return;
            }
        };
        log::trace!("send to {dest}:\n{}", out.payload);
        if let Err(e) = self.socket.send_to(out.payload.as_bytes(), dest) {
            log::warn!("SIP send to {dest} failed: {e}");
        }
    }

    fn resolve(&mut self, hop: &NextHop) -> Result<SocketAddr, EngineError> {
        let uri = match hop {
            NextHop::Addr(addr) => return Ok(*addr),
            NextHop::Uri(uri) => uri,
        };
        let (host, port) = SipUri::parse(uri)?.host_port();
        let key = format!("{host}:{port}");
        if let Some(addr) = self.hops.get(&key) {
            return Ok(*addr);
        }

        let addr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|_| EngineError::Resolve(key.clone()))?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| EngineError::Resolve(key.clone()))?;
        log::debug!("{key} resolves to {addr}");
        self.hops.insert(key, addr);
        Ok(addr)
    }

    /// Address the OS would use to reach `dest`.
    fn local_ip_toward(&self, dest: SocketAddr) -> io::Result<IpAddr> {
        let bound = self.socket.local_addr()?.ip();
        if !bound.is_unspecified() {
            return Ok(bound);
        }
        let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        probe.connect(dest)?;
        Ok(probe.local_addr()?.ip())
    }
}
