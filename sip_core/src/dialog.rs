use crate::{
    message::{header_value, header_values, parse_cseq, Header, Method, Request, Response},
    registration::format_cseq,
    stack::LocalContact,
    uri::{header_param, name_addr_uri},
    Result, SipError,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    #[default]
    Null,
    Calling,
    Early,
    Connecting,
    Confirmed,
    Terminated,
}

impl DialogState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialogState::Null => "NULL",
            DialogState::Calling => "CALLING",
            DialogState::Early => "EARLY",
            DialogState::Connecting => "CONNECTING",
            DialogState::Confirmed => "CONFIRMED",
            DialogState::Terminated => "DISCONNCTD",
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(self, DialogState::Connecting | DialogState::Confirmed)
    }
}

/// What a response to our INVITE means for the dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InviteOutcome {
    /// 100 Trying or a stray provisional: nothing visible changed.
    Trying,
    /// 1xx with a To tag: the call is ringing / has early media.
    Early,
    /// First 2xx: send the ACK, the dialog is now confirmed.
    Answered,
    /// 2xx retransmission: the stored ACK has to go out again.
    AckAgain,
    /// 2xx that arrived after we gave up on the call: ACK it, then BYE.
    AnsweredTooLate,
    /// 3xx with the alternative targets, in preference order.
    Redirect(Vec<String>),
    /// 401/407: the INVITE has to be sent again with credentials.
    Challenge,
    /// Any other final failure.
    Failed,
}

/// UAC side of one INVITE dialog.
#[derive(Debug, Clone)]
pub struct Dialog {
    pub state: DialogState,
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
    pub last_status: u16,
    pub last_reason: String,
    local_uri: String,
    remote_uri: String,
    request_uri: String,
    remote_target: Option<String>,
    preloaded_route: Option<String>,
    route_set: Vec<String>,
    contact: String,
    sdp_offer: String,
    cseq: u32,
    invite_cseq: u32,
    last_invite: Option<Request>,
    last_ack: Option<Request>,
    cancelled: bool,
}

impl Dialog {
    pub fn new(
        call_id: String,
        local_tag: String,
        local_uri: &str,
        remote_uri: &str,
        contact: &str,
        sdp_offer: &str,
    ) -> Self {
        Self {
            state: DialogState::Null,
            call_id,
            local_tag,
            remote_tag: None,
            last_status: 0,
            last_reason: String::new(),
            local_uri: local_uri.to_string(),
            remote_uri: remote_uri.to_string(),
            request_uri: remote_uri.to_string(),
            remote_target: None,
            preloaded_route: None,
            route_set: Vec::new(),
            contact: contact.to_string(),
            sdp_offer: sdp_offer.to_string(),
            cseq: 0,
            invite_cseq: 0,
            last_invite: None,
            last_ack: None,
            cancelled: false,
        }
    }

    /// Route every request of this dialog through an outbound proxy.
    pub fn with_outbound_proxy(mut self, proxy: Option<&str>) -> Self {
        self.preloaded_route = proxy.map(loose_route);
        self
    }

    pub fn remote_uri(&self) -> &str {
        &self.remote_uri
    }

    pub fn request_uri(&self) -> &str {
        &self.request_uri
    }

    pub fn local_sdp(&self) -> &str {
        &self.sdp_offer
    }

    pub fn contact(&self) -> &str {
        &self.contact
    }

    pub fn invite_branch(&self) -> Option<&str> {
        self.last_invite
            .as_ref()
            .and_then(|r| r.header("Via"))
            .and_then(|via| header_param(via, "branch"))
    }

    /// Point the next INVITE at another target (3xx handling).
    pub fn retarget(&mut self, target: &str) {
        self.request_uri = target.to_string();
    }

    /// Build (or rebuild, after a challenge or redirect) the INVITE.
    pub fn build_invite(&mut self, local: &LocalContact, branch: &str, extra_headers: Vec<Header>) -> Request {
        self.cseq = self.cseq.wrapping_add(1);
        self.invite_cseq = self.cseq;
        self.remote_tag = None;
        self.remote_target = None;
        self.route_set.clear();
        self.state = DialogState::Calling;

        let mut req = Request::new(Method::Invite, &self.request_uri);
        req.add_header(local.via(branch));
        req.add_header(Header::new("Max-Forwards", "70"));
        req.add_header(Header::new("From", &format!("<{}>;tag={}", self.local_uri, self.local_tag)));
        req.add_header(Header::new("To", &format!("<{}>", self.remote_uri)));
        req.add_header(Header::new("Call-ID", &self.call_id));
        req.add_header(Header::new("CSeq", &format_cseq(self.invite_cseq, Method::Invite)));
        if let Some(route) = &self.preloaded_route {
            req.add_header(Header::new("Route", route));
        }
        for header in extra_headers {
            req.add_header(header);
        }
        req.add_header(Header::new("Contact", &format!("<{}>", self.contact)));
        req.add_header(Header::new("Allow", "INVITE, ACK, BYE, CANCEL, OPTIONS"));
        req.add_header(Header::new("Content-Type", "application/sdp"));
        req.add_header(Header::new("Content-Length", &self.sdp_offer.len().to_string()));
        req.set_body(&self.sdp_offer);

        self.last_invite = Some(req.clone());
        req
    }

    pub fn on_invite_response(&mut self, resp: &Response) -> InviteOutcome {
        let status = resp.status_code;
        let to_tag = header_value(&resp.headers, "To")
            .and_then(|to| header_param(to, "tag"))
            .map(str::to_string);

        if status >= 200 && status < 300 {
            if self.state == DialogState::Terminated {
                self.learn_dialog(resp, to_tag);
                return InviteOutcome::AnsweredTooLate;
            }
            if self.state.is_established() {
                return InviteOutcome::AckAgain;
            }
        } else if self.state == DialogState::Terminated || self.state.is_established() {
            // Late provisional or final after the fact: nothing to do.
            return InviteOutcome::Trying;
        }

        self.last_status = status;
        self.last_reason = resp.reason.clone();

        match status {
            100 => InviteOutcome::Trying,
            101..=199 => {
                if to_tag.is_none() {
                    return InviteOutcome::Trying;
                }
                self.learn_dialog(resp, to_tag);
                self.state = DialogState::Early;
                InviteOutcome::Early
            }
            200..=299 => {
                self.learn_dialog(resp, to_tag);
                self.state = DialogState::Connecting;
                InviteOutcome::Answered
            }
            300..=399 => {
                let targets: Vec<String> = header_values(&resp.headers, "Contact")
                    .into_iter()
                    .map(|c| name_addr_uri(c).to_string())
                    .filter(|c| !c.is_empty())
                    .collect();
                if targets.is_empty() {
                    self.state = DialogState::Terminated;
                    InviteOutcome::Failed
                } else {
                    InviteOutcome::Redirect(targets)
                }
            }
            401 | 407 if !self.cancelled => InviteOutcome::Challenge,
            _ => {
                self.state = DialogState::Terminated;
                InviteOutcome::Failed
            }
        }
    }

    fn learn_dialog(&mut self, resp: &Response, to_tag: Option<String>) {
        if to_tag.is_some() {
            self.remote_tag = to_tag;
        }
        if let Some(contact) = header_values(&resp.headers, "Contact").first() {
            self.remote_target = Some(name_addr_uri(contact).to_string());
        }
        // UAC uses the Record-Route set in reverse order.
        let mut routes: Vec<String> = header_values(&resp.headers, "Record-Route")
            .into_iter()
            .map(str::to_string)
            .collect();
        if !routes.is_empty() {
            routes.reverse();
            self.route_set = routes;
        }
    }

    /// Mark the dialog confirmed once the ACK for the 2xx went out.
    pub fn confirm(&mut self, ack: Request) {
        self.last_ack = Some(ack);
        if self.state == DialogState::Connecting {
            self.state = DialogState::Confirmed;
        }
    }

    pub fn last_ack(&self) -> Option<&Request> {
        self.last_ack.as_ref()
    }

    /// ACK for a 2xx: its own transaction, sent to the remote target.
    pub fn build_ack(&self, local: &LocalContact, branch: &str) -> Request {
        let mut req = self.in_dialog_request(Method::Ack, local, branch, self.invite_cseq);
        req.add_header(Header::new("Content-Length", "0"));
        req
    }

    /// ACK for a non-2xx final response: part of the INVITE transaction.
    pub fn build_ack_for_failure(&self, resp: &Response) -> Option<Request> {
        let invite = self.last_invite.as_ref()?;
        let mut req = Request::new(Method::Ack, &invite.uri);
        copy_header(&mut req, invite, "Via");
        req.add_header(Header::new("Max-Forwards", "70"));
        copy_header(&mut req, invite, "From");
        let to = header_value(&resp.headers, "To").or_else(|| invite.header("To"))?;
        req.add_header(Header::new("To", to));
        copy_header(&mut req, invite, "Call-ID");
        req.add_header(Header::new("CSeq", &format_cseq(self.invite_cseq, Method::Ack)));
        for route in header_values(&invite.headers, "Route") {
            req.add_header(Header::new("Route", route));
        }
        req.add_header(Header::new("Content-Length", "0"));
        Some(req)
    }

    /// CANCEL for the pending INVITE. Only valid before a final response.
    pub fn build_cancel(&mut self) -> Option<Request> {
        if !matches!(self.state, DialogState::Calling | DialogState::Early) {
            return None;
        }
        let invite = self.last_invite.as_ref()?;
        let mut req = Request::new(Method::Cancel, &invite.uri);
        copy_header(&mut req, invite, "Via");
        req.add_header(Header::new("Max-Forwards", "70"));
        copy_header(&mut req, invite, "From");
        copy_header(&mut req, invite, "To");
        copy_header(&mut req, invite, "Call-ID");
        req.add_header(Header::new("CSeq", &format_cseq(self.invite_cseq, Method::Cancel)));
        for route in header_values(&invite.headers, "Route") {
            req.add_header(Header::new("Route", route));
        }
        req.add_header(Header::new("Content-Length", "0"));
        self.cancelled = true;
        Some(req)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn build_bye(&mut self, local: &LocalContact, branch: &str) -> Option<Request> {
        if !self.state.is_established() && self.remote_tag.is_none() {
            return None;
        }
        self.cseq = self.cseq.wrapping_add(1);
        let mut req = self.in_dialog_request(Method::Bye, local, branch, self.cseq);
        req.add_header(Header::new("Content-Length", "0"));
        self.state = DialogState::Terminated;
        Some(req)
    }

    /// Mark the dialog terminated (local give-up, timeout, remote BYE).
    pub fn terminate(&mut self, status: u16, reason: &str) {
        if self.state != DialogState::Terminated {
            self.state = DialogState::Terminated;
            self.last_status = status;
            self.last_reason = reason.to_string();
        }
    }

    fn in_dialog_request(&self, method: Method, local: &LocalContact, branch: &str, cseq: u32) -> Request {
        let target = self.remote_target.as_deref().unwrap_or(&self.request_uri);
        let mut req = Request::new(method, target);
        req.add_header(local.via(branch));
        req.add_header(Header::new("Max-Forwards", "70"));
        req.add_header(Header::new("From", &format!("<{}>;tag={}", self.local_uri, self.local_tag)));
        let to = match &self.remote_tag {
            Some(tag) => format!("<{}>;tag={}", self.remote_uri, tag),
            None => format!("<{}>", self.remote_uri),
        };
        req.add_header(Header::new("To", &to));
        req.add_header(Header::new("Call-ID", &self.call_id));
        req.add_header(Header::new("CSeq", &format_cseq(cseq, method)));
        if let Some(route) = &self.preloaded_route {
            req.add_header(Header::new("Route", route));
        }
        for route in &self.route_set {
            req.add_header(Header::new("Route", route));
        }
        req
    }

    /// Does an incoming in-dialog request belong to this dialog?
    pub fn matches_request(&self, req: &Request) -> bool {
        let call_id_ok = req.header("Call-ID") == Some(self.call_id.as_str());
        let to_tag_ok = req
            .header("To")
            .and_then(|to| header_param(to, "tag"))
            .map_or(true, |tag| tag == self.local_tag);
        call_id_ok && to_tag_ok
    }

    /// Remote BYE: the dialog is over, answer 200.
    pub fn handle_incoming_bye(&mut self, req: &Request) -> Result<Response> {
        if !self.matches_request(req) {
            return Err(SipError::Invalid("BYE for another dialog"));
        }
        self.terminate(200, "Normal call clearing");
        build_response_for_request(req, 200, "OK")
    }
}

/// Build a response that mirrors the transaction headers of `req`.
pub fn build_response_for_request(req: &Request, status: u16, reason: &str) -> Result<Response> {
    let mut resp = Response::new(status, reason);

    let vias = req
        .headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("Via"))
        .cloned()
        .collect::<Vec<_>>();
    if vias.is_empty() {
        return Err(SipError::Invalid("missing Via"));
    }
    for via in vias {
        resp.add_header(via);
    }

    for name in ["From", "To", "Call-ID", "CSeq"] {
        let value = req
            .header(name)
            .ok_or(SipError::Invalid("missing transaction header"))?;
        resp.add_header(Header::new(name, value));
    }
    if req.header("CSeq").and_then(parse_cseq).is_none() {
        return Err(SipError::Invalid("malformed CSeq"));
    }

    resp.add_header(Header::new("Content-Length", "0"));
    Ok(resp)
}

fn copy_header(dst: &mut Request, src: &Request, name: &str) {
    if let Some(value) = src.header(name) {
        dst.add_header(Header::new(name, value));
    }
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

    fn local() -> LocalContact {
        LocalContact::new("192.0.2.1", 5062)
    }

    fn dialog() -> Dialog {
        Dialog::new(
            "call-1".into(),
            "ltag".into(),
            "sip:120@example.com",
            "sip:103@example.com",
            "sip:120@192.0.2.1:5062",
            "v=0\r\n",
        )
    }

    fn response(status: u16, to_tag: Option<&str>) -> Response {
        let mut resp = Response::new(status, "Reason");
        let to = match to_tag {
            Some(t) => format!("<sip:103@example.com>;tag={t}"),
            None => "<sip:103@example.com>".to_string(),
        };
        resp.add_header(Header::new("To", &to));
        resp.add_header(Header::new("Contact", "<sip:103@198.51.100.7:5060>"));
        resp
    }

    #[test]
    fn outgoing_call_reaches_confirmed() {
        let mut dlg = dialog();
        let invite = dlg.build_invite(&local(), "z9hG4bKa", Vec::new());
        assert_eq!(invite.method, Method::Invite);
        assert_eq!(invite.header("CSeq"), Some("1 INVITE"));
        assert_eq!(invite.header("Content-Length"), Some("5"));
        assert_eq!(dlg.state, DialogState::Calling);
        assert_eq!(dlg.invite_branch(), Some("z9hG4bKa"));

        assert_eq!(dlg.on_invite_response(&response(100, None)), InviteOutcome::Trying);
        assert_eq!(dlg.on_invite_response(&response(180, Some("r1"))), InviteOutcome::Early);
        assert_eq!(dlg.state, DialogState::Early);

        assert_eq!(dlg.on_invite_response(&response(200, Some("r1"))), InviteOutcome::Answered);
        assert_eq!(dlg.state, DialogState::Connecting);
        let ack = dlg.build_ack(&local(), "z9hG4bKb");
        assert_eq!(ack.uri, "sip:103@198.51.100.7:5060");
        assert_eq!(ack.header("CSeq"), Some("1 ACK"));
        assert_eq!(ack.header("To"), Some("<sip:103@example.com>;tag=r1"));
        dlg.confirm(ack);
        assert_eq!(dlg.state, DialogState::Confirmed);

        assert_eq!(dlg.on_invite_response(&response(200, Some("r1"))), InviteOutcome::AckAgain);

        let bye = dlg.build_bye(&local(), "z9hG4bKc").unwrap();
        assert_eq!(bye.header("CSeq"), Some("2 BYE"));
        assert_eq!(dlg.state, DialogState::Terminated);
    }

    #[test]
    fn redirect_lists_contacts_and_retarget_rebuilds_invite() {
        let mut dlg = dialog();
        dlg.build_invite(&local(), "z9hG4bK1", Vec::new());
        let mut resp = Response::new(302, "Moved Temporarily");
        resp.add_header(Header::new("To", "<sip:103@example.com>;tag=x"));
        resp.add_header(Header::new("Contact", "<sip:200@other.example.com>, <sip:201@other.example.com>"));
        assert_eq!(
            dlg.on_invite_response(&resp),
            InviteOutcome::Redirect(vec![
                "sip:200@other.example.com".to_string(),
                "sip:201@other.example.com".to_string()
            ])
        );
        let ack = dlg.build_ack_for_failure(&resp).unwrap();
        assert_eq!(ack.uri, "sip:103@example.com");
        assert_eq!(ack.header("To"), Some("<sip:103@example.com>;tag=x"));

        dlg.retarget("sip:200@other.example.com");
        let invite = dlg.build_invite(&local(), "z9hG4bK2", Vec::new());
        assert_eq!(invite.uri, "sip:200@other.example.com");
        assert_eq!(invite.header("To"), Some("<sip:103@example.com>"));
        assert_eq!(invite.header("CSeq"), Some("2 INVITE"));
    }

    #[test]
    fn failure_terminates_and_cancel_only_while_pending() {
        let mut dlg = dialog().with_outbound_proxy(Some("sip:proxy.example.com"));
        let invite = dlg.build_invite(&local(), "z9hG4bK1", Vec::new());
        assert_eq!(invite.header("Route"), Some("<sip:proxy.example.com;lr>"));

        let cancel = dlg.build_cancel().unwrap();
        assert_eq!(cancel.header("Via"), invite.header("Via"));
        assert_eq!(cancel.header("CSeq"), Some("1 CANCEL"));
        assert!(dlg.is_cancelled());

        assert_eq!(dlg.on_invite_response(&response(487, Some("t"))), InviteOutcome::Failed);
        assert_eq!(dlg.state, DialogState::Terminated);
        assert_eq!(dlg.last_status, 487);
        assert!(dlg.build_cancel().is_none());
    }

    #[test]
    fn answers_remote_bye() {
        let mut dlg = dialog();
        dlg.build_invite(&local(), "z9hG4bK1", Vec::new());
        dlg.on_invite_response(&response(200, Some("r1")));

        let mut bye = Request::new(Method::Bye, "sip:120@192.0.2.1:5062");
        bye.add_header(Header::new("Via", "SIP/2.0/UDP 198.51.100.7;branch=z9hG4bKx"));
        bye.add_header(Header::new("From", "<sip:103@example.com>;tag=r1"));
        bye.add_header(Header::new("To", "<sip:120@example.com>;tag=ltag"));
        bye.add_header(Header::new("Call-ID", "call-1"));
        bye.add_header(Header::new("CSeq", "7 BYE"));

        let ok = dlg.handle_incoming_bye(&bye).unwrap();
        assert_eq!(ok.status_code, 200);
        assert_eq!(ok.header("CSeq"), Some("7 BYE"));
        assert_eq!(dlg.state, DialogState::Terminated);

        bye.headers.retain(|h| h.name != "Call-ID");
        bye.add_header(Header::new("Call-ID", "other"));
        assert!(dlg.handle_incoming_bye(&bye).is_err());
    }
}
