use std::{
    collections::BTreeMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use crate::{
    auth::{authorization_header, parse_challenge, ClientNonce, DigestCredentials},
    dialog::{build_response_for_request, Dialog, DialogState, InviteOutcome},
    message::{header_value, parse_cseq, Header, Message, Method, Request, Response},
    registration::{RegistrationResult, RegistrationState, RegistrationTransaction},
    transaction::{ClientTransactions, TIMER_B},
    uri::{header_param, name_addr_uri, SipUri},
    Result, SipError,
};

pub const DEFAULT_EXPIRES: u32 = 300;
/// Redirect hops followed for one call before giving up.
pub const MAX_REDIRECTS: u8 = 5;
const MAX_AUTH_ATTEMPTS: u8 = 3;

/// Address we put in Via and Contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalContact {
    pub host: String,
    pub port: u16,
}

impl LocalContact {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    fn host_for_uri(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    pub fn via(&self, branch: &str) -> Header {
        Header::new(
            "Via",
            &format!("SIP/2.0/UDP {}:{};branch={};rport", self.host_for_uri(), self.port, branch),
        )
    }

    pub fn contact_uri(&self, user: Option<&str>) -> String {
        match user {
            Some(user) => format!("sip:{}@{}:{}", user, self.host_for_uri(), self.port),
            None => format!("sip:{}:{}", self.host_for_uri(), self.port),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccountKey(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallKey(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountParams {
    /// Address of record, e.g. `sip:120@pbx.example.com`.
    pub aor: String,
    pub registrar: String,
    /// Outbound proxy every request is routed through.
    pub proxy: Option<String>,
    /// `*` answers any realm.
    pub realm: String,
    pub username: String,
    pub password: String,
    pub expires: u32,
}

impl AccountParams {
    fn credentials(&self) -> DigestCredentials<'_> {
        DigestCredentials {
            realm: &self.realm,
            username: &self.username,
            password: &self.password,
        }
    }
}

/// Where to send a rendered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextHop {
    /// Resolve this SIP URI (host, port, maddr).
    Uri(String),
    /// Reply straight to the source of a request.
    Addr(SocketAddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub payload: String,
    pub next_hop: NextHop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    Send(Outgoing),
    Registration {
        account: AccountKey,
        code: u16,
        reason: String,
        active: bool,
    },
    CallState {
        call: CallKey,
        state: DialogState,
        code: u16,
        reason: String,
        remote: String,
    },
    /// Session description from the answer; media can start.
    RemoteMedia { call: CallKey, sdp: String },
    /// The call got a 3xx. Answer with `follow_redirect` or `reject_redirect`.
    Redirected { call: CallKey, target: String },
}

#[derive(Debug)]
struct AccountEntry {
    params: AccountParams,
    reg: RegistrationTransaction,
    reg_call_id: String,
    contact: String,
    branch: Option<String>,
    refresh_at: Option<Instant>,
    removing: bool,
    auth_attempts: u8,
}

#[derive(Debug)]
struct CallEntry {
    account: AccountKey,
    dialog: Dialog,
    pending_targets: Vec<String>,
    redirects: u8,
    auth_attempts: u8,
    cancel_deadline: Option<Instant>,
}

/// Sans-IO user agent: accounts, outgoing calls and their transactions.
#[derive(Debug)]
pub struct SipStack {
    local: LocalContact,
    accounts: BTreeMap<AccountKey, AccountEntry>,
    calls: BTreeMap<CallKey, CallEntry>,
    transactions: ClientTransactions,
    next_id: u32,
    rng: u64,
}

impl SipStack {
    /// `seed` feeds the generator for tags, branches and Call-IDs.
    pub fn new(local: LocalContact, seed: u64) -> Self {
        Self {
            local,
            accounts: BTreeMap::new(),
            calls: BTreeMap::new(),
            transactions: ClientTransactions::new(),
            next_id: 0,
            rng: seed | 1,
        }
    }

    pub fn local(&self) -> &LocalContact {
        &self.local
    }

    /// No request of ours is waiting for an answer.
    pub fn is_idle(&self) -> bool {
        self.transactions.is_empty()
    }

    fn token(&mut self) -> String {
        // xorshift64*
        let mut x = self.rng;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng = x;
        format!("{:016x}", x.wrapping_mul(0x2545_f491_4f6c_dd1d))
    }

    fn branch(&mut self) -> String {
        format!("z9hG4bK{}", self.token())
    }

    fn next_id(&mut self) -> u32 {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }

    /// Add an account and send its first REGISTER.
    pub fn add_account(&mut self, params: AccountParams, now: Instant) -> Result<(AccountKey, Vec<CoreEvent>)> {
        let aor = SipUri::parse(&params.aor)?;
        SipUri::parse(&params.registrar)?;
        if let Some(proxy) = &params.proxy {
            SipUri::parse(proxy)?;
        }

        let key = AccountKey(self.next_id());
        let reg_call_id = format!("{}@{}", self.token(), self.local.host);
        let from_tag = self.token();
        let expires = if params.expires == 0 { DEFAULT_EXPIRES } else { params.expires };
        let contact = self.local.contact_uri(aor.user.as_deref());

        self.accounts.insert(
            key,
            AccountEntry {
                params,
                reg: RegistrationTransaction::new(reg_call_id.clone(), from_tag, expires),
                reg_call_id,
                contact,
                branch: None,
                refresh_at: None,
                removing: false,
                auth_attempts: 0,
            },
        );

        let mut events = Vec::new();
        self.send_register(key, expires, now, &mut events);
        Ok((key, events))
    }

    /// Drop an account, removing its binding first when it has one.
    pub fn remove_account(&mut self, key: AccountKey, now: Instant) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        let Some(entry) = self.accounts.get_mut(&key) else {
            return events;
        };
        if entry.reg.state() == RegistrationState::Registered {
            entry.removing = true;
            self.send_register(key, 0, now, &mut events);
        } else {
            if let Some(branch) = entry.branch.take() {
                self.transactions.abandon(&branch, Method::Register);
            }
            self.accounts.remove(&key);
        }
        events
    }

    fn send_register(&mut self, key: AccountKey, expires: u32, now: Instant, events: &mut Vec<CoreEvent>) {
        let branch = self.branch();
        let cnonce = self.token();
        let Some(entry) = self.accounts.get_mut(&key) else {
            return;
        };

        let mut extra = Vec::new();
        if let Some(proxy) = &entry.params.proxy {
            extra.push(Header::new("Route", &loose_route(proxy)));
        }
        if let Some(challenge) = entry.reg.last_challenge().cloned() {
            let nc = entry.reg.note_answered(&challenge);
            let client_nonce = ClientNonce { cnonce: &cnonce, nc };
            match authorization_header(
                &challenge,
                &entry.params.credentials(),
                "REGISTER",
                &entry.params.registrar,
                Some(&client_nonce),
            ) {
                Ok(header) => extra.push(header),
                Err(e) => log::warn!("REGISTER sent without credentials: {e}"),
            }
        }

        let req = entry.reg.build_register(
            &entry.params.registrar,
            &entry.params.aor,
            &entry.contact,
            &self.local,
            &branch,
            expires,
            extra,
        );
        if let Some(old) = entry.branch.replace(branch.clone()) {
            self.transactions.abandon(&old, Method::Register);
        }
        entry.refresh_at = None;
        dispatch(&mut self.transactions, &req, &branch, now, events);
    }

    /// Place a call from `account` to `target` with `sdp` as the offer.
    pub fn make_call(
        &mut self,
        account: AccountKey,
        target: &str,
        sdp: &str,
        now: Instant,
    ) -> Result<(CallKey, Vec<CoreEvent>)> {
        let target = SipUri::parse(target)?.to_string();
        let entry = self
            .accounts
            .get(&account)
            .ok_or(SipError::InvalidState("unknown account"))?;
        let aor = entry.params.aor.clone();
        let contact = entry.contact.clone();
        let proxy = entry.params.proxy.clone();

        let key = CallKey(self.next_id());
        let call_id = format!("{}@{}", self.token(), self.local.host);
        let tag = self.token();
        let dialog = Dialog::new(call_id, tag, &aor, &target, &contact, sdp).with_outbound_proxy(proxy.as_deref());
        self.calls.insert(
            key,
            CallEntry {
                account,
                dialog,
                pending_targets: Vec::new(),
                redirects: 0,
                auth_attempts: 0,
                cancel_deadline: None,
            },
        );

        let mut events = Vec::new();
        self.send_invite(key, Vec::new(), now, &mut events);
        if let Some(entry) = self.calls.get(&key) {
            events.push(call_state_event(key, &entry.dialog));
        }
        Ok((key, events))
    }

    fn send_invite(&mut self, key: CallKey, extra: Vec<Header>, now: Instant, events: &mut Vec<CoreEvent>) {
        let branch = self.branch();
        let Some(entry) = self.calls.get_mut(&key) else {
            return;
        };
        let req = entry.dialog.build_invite(&self.local, &branch, extra);
        dispatch(&mut self.transactions, &req, &branch, now, events);
    }

    /// Hang up: CANCEL while ringing, BYE once answered.
    pub fn hangup(&mut self, call: CallKey, now: Instant) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        let branch = self.branch();
        let Some(entry) = self.calls.get_mut(&call) else {
            return events;
        };

        if !entry.pending_targets.is_empty() {
            entry.pending_targets.clear();
            let (code, reason) = (entry.dialog.last_status, entry.dialog.last_reason.clone());
            entry.dialog.terminate(code, &reason);
            events.push(call_state_event(call, &entry.dialog));
            return events;
        }

        match entry.dialog.state {
            DialogState::Calling | DialogState::Early if !entry.dialog.is_cancelled() => {
                let invite_branch = entry.dialog.invite_branch().map(str::to_string);
                if let (Some(cancel), Some(invite_branch)) = (entry.dialog.build_cancel(), invite_branch) {
                    entry.cancel_deadline = Some(now + TIMER_B);
                    dispatch(&mut self.transactions, &cancel, &invite_branch, now, &mut events);
                }
            }
            DialogState::Connecting | DialogState::Confirmed => {
                if let Some(bye) = entry.dialog.build_bye(&self.local, &branch) {
                    entry.dialog.last_status = 200;
                    entry.dialog.last_reason = "Normal call clearing".to_string();
                    dispatch(&mut self.transactions, &bye, &branch, now, &mut events);
                    events.push(call_state_event(call, &entry.dialog));
                }
            }
            _ => {}
        }
        events
    }

    pub fn hangup_all(&mut self, now: Instant) -> Vec<CoreEvent> {
        let keys: Vec<CallKey> = self.calls.keys().copied().collect();
        keys.into_iter().flat_map(|key| self.hangup(key, now)).collect()
    }

    /// Send the INVITE to the first target of the last 3xx.
    pub fn follow_redirect(&mut self, call: CallKey, now: Instant) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        let Some(entry) = self.calls.get_mut(&call) else {
            return events;
        };
        if entry.pending_targets.is_empty() {
            return events;
        }
        let target = entry.pending_targets.remove(0);
        entry.pending_targets.clear();
        entry.redirects += 1;
        entry.auth_attempts = 0;
        log::debug!("following redirect to {target}");
        entry.dialog.retarget(&target);
        self.send_invite(call, Vec::new(), now, &mut events);
        events
    }

    pub fn reject_redirect(&mut self, call: CallKey) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        if let Some(entry) = self.calls.get_mut(&call) {
            entry.pending_targets.clear();
            let (code, reason) = (entry.dialog.last_status, entry.dialog.last_reason.clone());
            entry.dialog.terminate(code, &reason);
            events.push(call_state_event(call, &entry.dialog));
        }
        events
    }

    /// Feed one parsed message received from `source`.
    pub fn on_message(&mut self, msg: Message, source: SocketAddr, now: Instant) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        match msg {
            Message::Response(resp) => {
                let Some((_, method)) = resp.header("CSeq").and_then(parse_cseq) else {
                    log::warn!("response without CSeq dropped");
                    return events;
                };
                let branch = top_branch(&resp.headers).unwrap_or_default();
                let live = self.transactions.on_response(&branch, method, resp.status_code, now);
                match method {
                    Method::Register if live => self.on_register_response(&resp, &branch, now, &mut events),
                    Method::Invite if live || !resp.is_provisional() => {
                        self.on_invite_response(&resp, &branch, now, &mut events)
                    }
                    _ if !live => log::debug!("stray {} response for {}", resp.status_code, method),
                    _ => log::debug!("{} response for {}", resp.status_code, method),
                }
            }
            Message::Request(req) => self.on_request(&req, source, &mut events),
        }
        events
    }

    fn on_register_response(&mut self, resp: &Response, branch: &str, now: Instant, events: &mut Vec<CoreEvent>) {
        let call_id = resp.header("Call-ID").unwrap_or("");
        let Some((&key, entry)) = self.accounts.iter_mut().find(|(_, a)| a.reg_call_id == call_id) else {
            log::debug!("REGISTER response for unknown Call-ID {call_id}");
            return;
        };
        if entry.branch.as_deref() != Some(branch) {
            return;
        }
        let Some(result) = entry.reg.handle_response(resp, &entry.contact) else {
            return;
        };
        entry.branch = None;

        match result {
            RegistrationResult::Registered(expires) => {
                entry.auth_attempts = 0;
                entry.refresh_at = Some(now + Duration::from_secs(entry.reg.next_refresh_interval_secs()));
                events.push(CoreEvent::Registration {
                    account: key,
                    code: resp.status_code,
                    reason: resp.reason.clone(),
                    active: expires > 0,
                });
            }
            RegistrationResult::Unregistered => {
                events.push(CoreEvent::Registration {
                    account: key,
                    code: resp.status_code,
                    reason: resp.reason.clone(),
                    active: false,
                });
                if entry.removing {
                    self.accounts.remove(&key);
                }
            }
            RegistrationResult::AuthRequired => {
                entry.auth_attempts += 1;
                let answerable = entry
                    .reg
                    .last_challenge()
                    .is_some_and(|c| entry.params.credentials().matches(c));
                if answerable && entry.auth_attempts <= MAX_AUTH_ATTEMPTS {
                    let expires = entry.reg.requested_expires();
                    self.send_register(key, expires, now, events);
                } else {
                    self.registration_failed(key, resp.status_code, &resp.reason, events);
                }
            }
            RegistrationResult::IntervalTooBrief(min) => {
                log::info!("registrar wants at least {min}s, retrying");
                self.send_register(key, min, now, events);
            }
            RegistrationResult::Failed(code) => self.registration_failed(key, code, &resp.reason, events),
        }
    }

    fn registration_failed(&mut self, key: AccountKey, code: u16, reason: &str, events: &mut Vec<CoreEvent>) {
        events.push(CoreEvent::Registration {
            account: key,
            code,
            reason: reason.to_string(),
            active: false,
        });
        if self.accounts.get(&key).is_some_and(|a| a.removing) {
            self.accounts.remove(&key);
        }
    }

    fn on_invite_response(&mut self, resp: &Response, branch: &str, now: Instant, events: &mut Vec<CoreEvent>) {
        let call_id = resp.header("Call-ID").unwrap_or("");
        let Some(key) = self
            .calls
            .iter()
            .find(|(_, c)| c.dialog.call_id == call_id)
            .map(|(k, _)| *k)
        else {
            log::debug!("INVITE response for unknown Call-ID {call_id}");
            return;
        };
        let ack_branch = self.branch();
        let Some(entry) = self.calls.get_mut(&key) else {
            return;
        };

        let same_invite = entry.dialog.invite_branch() == Some(branch);
        let outcome = entry.dialog.on_invite_response(resp);
        if resp.status_code >= 300 && same_invite {
            if let Some(ack) = entry.dialog.build_ack_for_failure(resp) {
                send_once(&ack, events);
            }
        }

        match outcome {
            InviteOutcome::Trying => {}
            InviteOutcome::Early => events.push(call_state_event(key, &entry.dialog)),
            InviteOutcome::Answered => {
                entry.cancel_deadline = None;
                if entry.dialog.is_cancelled() {
                    // CANCEL crossed the 2xx on the wire.
                    let ack = entry.dialog.build_ack(&self.local, &ack_branch);
                    send_once(&ack, events);
                    entry.dialog.confirm(ack);
                    let bye_events = self.hangup(key, now);
                    events.extend(bye_events);
                    return;
                }
                events.push(call_state_event(key, &entry.dialog));
                let ack = entry.dialog.build_ack(&self.local, &ack_branch);
                send_once(&ack, events);
                entry.dialog.confirm(ack);
                events.push(call_state_event(key, &entry.dialog));
                if !resp.body.trim().is_empty() {
                    events.push(CoreEvent::RemoteMedia {
                        call: key,
                        sdp: resp.body.clone(),
                    });
                }
            }
            InviteOutcome::AckAgain => {
                if let Some(ack) = entry.dialog.last_ack() {
                    send_once(ack, events);
                }
            }
            InviteOutcome::AnsweredTooLate => {
                let ack = entry.dialog.build_ack(&self.local, &ack_branch);
                send_once(&ack, events);
                let bye_branch = self.branch();
                if let Some(entry) = self.calls.get_mut(&key) {
                    if let Some(bye) = entry.dialog.build_bye(&self.local, &bye_branch) {
                        dispatch(&mut self.transactions, &bye, &bye_branch, now, events);
                    }
                }
            }
            InviteOutcome::Redirect(targets) => {
                if entry.redirects >= MAX_REDIRECTS {
                    log::warn!("too many redirects, giving up");
                    entry.dialog.terminate(resp.status_code, &resp.reason);
                    events.push(call_state_event(key, &entry.dialog));
                } else {
                    let target = targets[0].clone();
                    entry.pending_targets = targets;
                    events.push(CoreEvent::Redirected { call: key, target });
                }
            }
            InviteOutcome::Challenge => {
                entry.auth_attempts += 1;
                let attempts = entry.auth_attempts;
                let header = if attempts <= MAX_AUTH_ATTEMPTS {
                    self.invite_credentials(key, resp)
                } else {
                    None
                };
                match header {
                    Some(header) => self.send_invite(key, vec![header], now, events),
                    None => {
                        if let Some(entry) = self.calls.get_mut(&key) {
                            entry.dialog.terminate(resp.status_code, &resp.reason);
                            events.push(call_state_event(key, &entry.dialog));
                        }
                    }
                }
            }
            InviteOutcome::Failed => {
                entry.cancel_deadline = None;
                events.push(call_state_event(key, &entry.dialog));
            }
        }
    }

    fn invite_credentials(&mut self, key: CallKey, resp: &Response) -> Option<Header> {
        let proxy = resp.status_code == 407;
        let name = if proxy { "Proxy-Authenticate" } else { "WWW-Authenticate" };
        let challenge = resp
            .headers
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .find_map(|h| parse_challenge(&h.value, proxy).ok())?;
        let cnonce = self.token();
        let entry = self.calls.get(&key)?;
        let account = self.accounts.get(&entry.account)?;
        let client_nonce = ClientNonce { cnonce: &cnonce, nc: 1 };
        authorization_header(
            &challenge,
            &account.params.credentials(),
            "INVITE",
            entry.dialog.request_uri(),
            Some(&client_nonce),
        )
        .map_err(|e| log::warn!("cannot answer INVITE challenge: {e}"))
        .ok()
    }

    fn on_request(&mut self, req: &Request, source: SocketAddr, events: &mut Vec<CoreEvent>) {
        let call_key = self
            .calls
            .iter()
            .find(|(_, c)| c.dialog.matches_request(req))
            .map(|(k, _)| *k);

        match req.method {
            Method::Ack => {}
            Method::Bye => {
                let Some(entry) = call_key.and_then(|k| self.calls.get_mut(&k)) else {
                    reply(req, 481, "Call/Transaction Does Not Exist", source, events);
                    return;
                };
                let was_live = entry.dialog.state != DialogState::Terminated;
                match entry.dialog.handle_incoming_bye(req) {
                    Ok(resp) => {
                        events.push(CoreEvent::Send(Outgoing {
                            payload: resp.render(),
                            next_hop: NextHop::Addr(source),
                        }));
                        if was_live {
                            if let Some(key) = call_key {
                                events.push(call_state_event(key, &entry.dialog));
                            }
                        }
                    }
                    Err(e) => log::warn!("BYE rejected: {e}"),
                }
            }
            Method::Invite => {
                let in_dialog = req.header("To").and_then(|to| header_param(to, "tag")).is_some();
                match call_key.and_then(|k| self.calls.get(&k)) {
                    Some(entry) if in_dialog && entry.dialog.state.is_established() => {
                        // Session refresh: answer with the session we already have.
                        let Ok(mut resp) = build_response_for_request(req, 200, "OK") else {
                            return;
                        };
                        resp.headers.retain(|h| !h.name.eq_ignore_ascii_case("Content-Length"));
                        resp.add_header(Header::new("Contact", &format!("<{}>", entry.dialog.contact())));
                        resp.add_header(Header::new("Content-Type", "application/sdp"));
                        resp.add_header(Header::new("Content-Length", &entry.dialog.local_sdp().len().to_string()));
                        resp.set_body(entry.dialog.local_sdp());
                        events.push(CoreEvent::Send(Outgoing {
                            payload: resp.render(),
                            next_hop: NextHop::Addr(source),
                        }));
                        if !req.body.trim().is_empty() {
                            if let Some(key) = call_key {
                                events.push(CoreEvent::RemoteMedia {
                                    call: key,
                                    sdp: req.body.clone(),
                                });
                            }
                        }
                    }
                    _ => reply(req, 486, "Busy Here", source, events),
                }
            }
            Method::Options => reply(req, 200, "OK", source, events),
            Method::Cancel => reply(req, 481, "Call/Transaction Does Not Exist", source, events),
            other => {
                log::debug!("answering {other} with 501");
                reply(req, 501, "Not Implemented", source, events);
            }
        }
    }

    /// Drive timers: retransmissions, timeouts, registration refresh.
    pub fn poll(&mut self, now: Instant) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        let (retransmits, timeouts) = self.transactions.poll(now);
        events.extend(retransmits.into_iter().map(CoreEvent::Send));

        for timeout in timeouts {
            match timeout.method {
                Method::Register => {
                    let key = self
                        .accounts
                        .iter()
                        .find(|(_, a)| a.branch.as_deref() == Some(timeout.branch.as_str()))
                        .map(|(k, _)| *k);
                    if let Some(key) = key {
                        if let Some(entry) = self.accounts.get_mut(&key) {
                            entry.branch = None;
                            entry.reg.handle_timeout();
                        }
                        self.registration_failed(key, 408, "Request Timeout", &mut events);
                    }
                }
                Method::Invite => {
                    for (key, entry) in self.calls.iter_mut() {
                        if entry.dialog.invite_branch() == Some(timeout.branch.as_str())
                            && entry.dialog.state != DialogState::Terminated
                        {
                            entry.dialog.terminate(408, "Request Timeout");
                            events.push(call_state_event(*key, &entry.dialog));
                        }
                    }
                }
                method => log::warn!("{method} {} timed out", timeout.branch),
            }
        }

        let due: Vec<AccountKey> = self
            .accounts
            .iter()
            .filter(|(_, a)| !a.removing && a.refresh_at.is_some_and(|at| at <= now))
            .map(|(k, _)| *k)
            .collect();
        for key in due {
            if let Some(expires) = self.accounts.get(&key).map(|a| a.reg.requested_expires()) {
                log::debug!("refreshing registration");
                self.send_register(key, expires, now, &mut events);
            }
        }

        for (key, entry) in self.calls.iter_mut() {
            if entry.cancel_deadline.is_some_and(|at| at <= now) {
                entry.cancel_deadline = None;
                if let Some(branch) = entry.dialog.invite_branch() {
                    self.transactions.abandon(branch, Method::Invite);
                }
                entry.dialog.terminate(487, "Request Terminated");
                events.push(call_state_event(*key, &entry.dialog));
            }
        }

        events
    }
}

fn call_state_event(call: CallKey, dialog: &Dialog) -> CoreEvent {
    CoreEvent::CallState {
        call,
        state: dialog.state,
        code: dialog.last_status,
        reason: dialog.last_reason.clone(),
        remote: dialog.remote_uri().to_string(),
    }
}

/// Send a request and track it for retransmission.
fn dispatch(
    transactions: &mut ClientTransactions,
    req: &Request,
    branch: &str,
    now: Instant,
    events: &mut Vec<CoreEvent>,
) {
    let out = Outgoing {
        payload: req.render(),
        next_hop: next_hop_for(req),
    };
    transactions.start(branch, req.method, &out, now);
    events.push(CoreEvent::Send(out));
}

/// Send a request that no transaction retransmits (ACK).
fn send_once(req: &Request, events: &mut Vec<CoreEvent>) {
    events.push(CoreEvent::Send(Outgoing {
        payload: req.render(),
        next_hop: next_hop_for(req),
    }));
}

fn reply(req: &Request, status: u16, reason: &str, source: SocketAddr, events: &mut Vec<CoreEvent>) {
    match build_response_for_request(req, status, reason) {
        Ok(resp) => events.push(CoreEvent::Send(Outgoing {
            payload: resp.render(),
            next_hop: NextHop::Addr(source),
        })),
        Err(e) => log::warn!("cannot answer {}: {e}", req.method),
    }
}

/// First Route entry, else the Request-URI.
fn next_hop_for(req: &Request) -> NextHop {
    match req.header("Route") {
        Some(route) => {
            let first = crate::message::split_list(route).first().copied().unwrap_or(route);
            NextHop::Uri(name_addr_uri(first).to_string())
        }
        None => NextHop::Uri(req.uri.clone()),
    }
}

fn top_branch(headers: &[Header]) -> Option<String> {
    let via = header_value(headers, "Via")?;
    let first = crate::message::split_list(via).first().copied().unwrap_or(via);
    header_param(first, "branch").map(str::to_string)
}

fn loose_route(proxy: &str) -> String {
    let uri = name_addr_uri(proxy);
    if uri.contains(";lr") {
        format!("<{uri}>")
    } else {
        format!("<{uri};lr>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::parse_message;

    fn source() -> SocketAddr {
        "198.51.100.7:5060".parse().unwrap()
    }

    fn stack() -> SipStack {
        SipStack::new(LocalContact::new("192.0.2.1", 5062), 42)
    }

    fn params() -> AccountParams {
        AccountParams {
            aor: "sip:120@example.com".into(),
            registrar: "sip:example.com".into(),
            proxy: None,
            realm: "*".into(),
            username: "120".into(),
            password: "secret".into(),
            expires: 300,
        }
    }

    fn sent(events: &[CoreEvent]) -> Vec<Request> {
        events
            .iter()
            .filter_map(|e| match e {
                CoreEvent::Send(out) => match parse_message(&out.payload).ok()? {
                    Message::Request(r) => Some(r),
                    Message::Response(_) => None,
                },
                _ => None,
            })
            .collect()
    }

    fn sent_responses(events: &[CoreEvent]) -> Vec<Response> {
        events
            .iter()
            .filter_map(|e| match e {
                CoreEvent::Send(out) => match parse_message(&out.payload).ok()? {
                    Message::Response(r) => Some(r),
                    Message::Request(_) => None,
                },
                _ => None,
            })
            .collect()
    }

    fn answer(req: &Request, status: u16, to_tag: Option<&str>) -> Response {
        let mut resp = build_response_for_request(req, status, "Reason").unwrap();
        if let Some(tag) = to_tag {
            for h in resp.headers.iter_mut().filter(|h| h.name == "To") {
                h.value = format!("{};tag={tag}", h.value);
            }
        }
        resp
    }

    fn registered(stack: &mut SipStack, now: Instant) -> AccountKey {
        let (key, events) = stack.add_account(params(), now).unwrap();
        let register = sent(&events).remove(0);
        let ok = answer(&register, 200, Some("r"));
        stack.on_message(Message::Response(ok), source(), now);
        key
    }

    #[test]
    fn registers_after_digest_challenge() {
        let mut stack = stack();
        let now = Instant::now();
        let (key, events) = stack.add_account(params(), now).unwrap();
        let register = sent(&events).remove(0);
        assert_eq!(register.method, Method::Register);
        assert_eq!(register.header("Contact"), Some("<sip:120@192.0.2.1:5062>"));

        let mut challenge = answer(&register, 401, Some("r"));
        challenge.add_header(Header::new("WWW-Authenticate", r#"Digest realm="pbx", nonce="abc", qop="auth""#));
        let events = stack.on_message(Message::Response(challenge), source(), now);
        let retry = sent(&events).remove(0);
        assert_eq!(retry.header("CSeq"), Some("2 REGISTER"));
        let auth = retry.header("Authorization").unwrap();
        assert!(auth.contains("username=\"120\""));
        assert!(auth.contains("nc=00000001"));

        let events = stack.on_message(Message::Response(answer(&retry, 200, Some("r"))), source(), now);
        assert_eq!(
            events,
            vec![CoreEvent::Registration {
                account: key,
                code: 200,
                reason: "Reason".into(),
                active: true
            }]
        );
        assert!(stack.is_idle());
    }

    #[test]
    fn forbidden_registration_is_reported() {
        let mut stack = stack();
        let now = Instant::now();
        let (key, events) = stack.add_account(params(), now).unwrap();
        let register = sent(&events).remove(0);
        let events = stack.on_message(Message::Response(answer(&register, 403, Some("r"))), source(), now);
        assert!(matches!(
            events.as_slice(),
            [CoreEvent::Registration { account, code: 403, active: false, .. }] if *account == key
        ));
    }

    #[test]
    fn register_times_out_with_408() {
        let mut stack = stack();
        let now = Instant::now();
        let (key, _) = stack.add_account(params(), now).unwrap();
        let events = stack.poll(now + TIMER_B);
        assert!(events.iter().any(|e| matches!(
            e,
            CoreEvent::Registration { account, code: 408, active: false, .. } if *account == key
        )));
    }

    #[test]
    fn call_is_answered_then_remote_hangs_up() {
        let mut stack = stack();
        let now = Instant::now();
        let account = registered(&mut stack, now);

        let (call, events) = stack.make_call(account, "sip:103@example.com", "v=0\r\n", now).unwrap();
        let invite = sent(&events).remove(0);
        assert_eq!(invite.method, Method::Invite);
        assert!(matches!(events.last(), Some(CoreEvent::CallState { state: DialogState::Calling, .. })));

        let events = stack.on_message(Message::Response(answer(&invite, 180, Some("b"))), source(), now);
        assert!(matches!(
            events.as_slice(),
            [CoreEvent::CallState { state: DialogState::Early, code: 180, .. }]
        ));

        let mut ok = answer(&invite, 200, Some("b"));
        ok.add_header(Header::new("Contact", "<sip:103@198.51.100.7>"));
        ok.set_body("v=0\r\nm=audio 4000 RTP/AVP 0\r\n");
        let events = stack.on_message(Message::Response(ok), source(), now);
        let acks = sent(&events);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].method, Method::Ack);
        assert_eq!(acks[0].uri, "sip:103@198.51.100.7");
        let states: Vec<DialogState> = events
            .iter()
            .filter_map(|e| match e {
                CoreEvent::CallState { state, .. } => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![DialogState::Connecting, DialogState::Confirmed]);
        assert!(events.iter().any(|e| matches!(e, CoreEvent::RemoteMedia { call: c, .. } if *c == call)));

        let mut bye = Request::new(Method::Bye, "sip:120@192.0.2.1:5062");
        bye.add_header(Header::new("Via", "SIP/2.0/UDP 198.51.100.7;branch=z9hG4bKbye"));
        bye.add_header(Header::new("From", "<sip:103@example.com>;tag=b"));
        bye.add_header(Header::new("To", invite.header("From").unwrap()));
        bye.add_header(Header::new("Call-ID", invite.header("Call-ID").unwrap()));
        bye.add_header(Header::new("CSeq", "1 BYE"));
        let events = stack.on_message(Message::Request(bye), source(), now);
        assert_eq!(sent_responses(&events)[0].status_code, 200);
        assert!(events.iter().any(|e| matches!(
            e,
            CoreEvent::CallState { state: DialogState::Terminated, code: 200, .. }
        )));
    }

    #[test]
    fn local_hangup_sends_bye_and_disconnects() {
        let mut stack = stack();
        let now = Instant::now();
        let account = registered(&mut stack, now);
        let (call, events) = stack.make_call(account, "sip:103@example.com", "v=0\r\n", now).unwrap();
        let invite = sent(&events).remove(0);
        stack.on_message(Message::Response(answer(&invite, 200, Some("b"))), source(), now);

        let events = stack.hangup(call, now);
        let bye = sent(&events).remove(0);
        assert_eq!(bye.method, Method::Bye);
        assert!(matches!(
            events.last(),
            Some(CoreEvent::CallState { state: DialogState::Terminated, .. })
        ));
        assert!(stack.hangup(call, now).is_empty());
    }

    #[test]
    fn hangup_while_ringing_cancels() {
        let mut stack = stack();
        let now = Instant::now();
        let account = registered(&mut stack, now);
        let (call, events) = stack.make_call(account, "sip:103@example.com", "v=0\r\n", now).unwrap();
        let invite = sent(&events).remove(0);
        stack.on_message(Message::Response(answer(&invite, 180, Some("b"))), source(), now);

        let events = stack.hangup(call, now);
        let cancel = sent(&events).remove(0);
        assert_eq!(cancel.method, Method::Cancel);
        assert_eq!(cancel.header("Via"), invite.header("Via"));

        let events = stack.on_message(Message::Response(answer(&invite, 487, Some("b"))), source(), now);
        assert_eq!(sent(&events)[0].method, Method::Ack);
        assert!(matches!(
            events.last(),
            Some(CoreEvent::CallState { state: DialogState::Terminated, code: 487, .. })
        ));
    }

    #[test]
    fn redirect_is_offered_then_followed() {
        let mut stack = stack();
        let now = Instant::now();
        let account = registered(&mut stack, now);
        let (call, events) = stack.make_call(account, "sip:103@example.com", "v=0\r\n", now).unwrap();
        let invite = sent(&events).remove(0);

        let mut moved = answer(&invite, 302, Some("x"));
        moved.add_header(Header::new("Contact", "<sip:200@other.example.com>"));
        let events = stack.on_message(Message::Response(moved), source(), now);
        assert!(events.contains(&CoreEvent::Redirected {
            call,
            target: "sip:200@other.example.com".into()
        }));

        let events = stack.follow_redirect(call, now);
        let retry = sent(&events).remove(0);
        assert_eq!(retry.uri, "sip:200@other.example.com");
        assert_ne!(retry.header("Via"), invite.header("Via"));
    }

    #[test]
    fn answers_options_and_rejects_unknown_requests() {
        let mut stack = stack();
        let now = Instant::now();
        let mut options = Request::new(Method::Options, "sip:120@192.0.2.1:5062");
        options.add_header(Header::new("Via", "SIP/2.0/UDP 198.51.100.7;branch=z9hG4bKo"));
        options.add_header(Header::new("From", "<sip:probe@example.com>;tag=p"));
        options.add_header(Header::new("To", "<sip:120@example.com>"));
        options.add_header(Header::new("Call-ID", "probe-1"));
        options.add_header(Header::new("CSeq", "1 OPTIONS"));
        let events = stack.on_message(Message::Request(options.clone()), source(), now);
        assert!(matches!(&events[0], CoreEvent::Send(out) if out.next_hop == NextHop::Addr(source())));
        assert_eq!(sent_responses(&events)[0].status_code, 200);

        options.method = Method::Info;
        options.headers.retain(|h| h.name != "CSeq");
        options.add_header(Header::new("CSeq", "2 INFO"));
        let events = stack.on_message(Message::Request(options), source(), now);
        assert_eq!(sent_responses(&events)[0].status_code, 501);
    }

    #[test]
    fn outbound_proxy_routes_requests() {
        let mut stack = stack();
        let now = Instant::now();
        let params = AccountParams {
            proxy: Some("sip:proxy.example.com:5070".into()),
            ..params()
        };
        let (_, events) = stack.add_account(params, now).unwrap();
        match &events[0] {
            CoreEvent::Send(out) => {
                assert_eq!(out.next_hop, NextHop::Uri("sip:proxy.example.com:5070;lr".into()))
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
