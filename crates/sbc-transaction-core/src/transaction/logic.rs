//! State tables for the four transaction kinds.
//!
//! [`TransactionLogic`] is pure: it consumes one event (an outbound send, an
//! inbound message, a timer fire) and returns the [`Action`]s the runner must
//! perform. It never touches the network or the clock, which keeps every
//! transition testable without a runtime.

use std::net::SocketAddr;
use std::time::Duration;

use sbc_sip_core::header::names;
use sbc_sip_core::{SipMessage, Via, props};

use crate::error::{Result, TransactionError};
use crate::timer::{TimerSettings, TimerType};
use crate::transaction::{TransactionKey, TransactionKind, TransactionState};

/// Side effects requested by the state machine
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Action {
    /// Send to the peer: request target for clients, response target for servers
    Transmit(SipMessage),
    /// Send to an explicit address (ACK for 2xx to the dialog target)
    TransmitTo(SipMessage, SocketAddr),
    /// Report a response to the client transaction user
    Deliver(SipMessage),
    /// Report a timeout (client user, or the IST ACK waiter)
    Timeout,
    /// Hand a new request to the server transaction user
    DispatchRequest(SipMessage),
    /// The ACK for an IST error response arrived
    AckReceived(SipMessage),
    StartTimer(TimerType, Duration),
    CancelTimer(TimerType),
    Terminate,
}

#[derive(Debug)]
pub(crate) struct TransactionLogic {
    key: TransactionKey,
    kind: TransactionKind,
    state: TransactionState,
    reliable: bool,
    settings: TimerSettings,
    will_send_ack_for_2xx: bool,
    request: Option<SipMessage>,
    last_response: Option<SipMessage>,
    ack: Option<(SipMessage, Option<SocketAddr>)>,
    timer_a: Duration,
    timer_e: Duration,
    timer_g: Duration,
    finalized: bool,
}

impl TransactionLogic {
    pub(crate) fn new(
        key: TransactionKey,
        kind: TransactionKind,
        reliable: bool,
        settings: TimerSettings,
    ) -> Self {
        TransactionLogic {
            key,
            kind,
            state: TransactionState::Idle,
            reliable,
            timer_a: settings.timer_a(),
            timer_e: settings.timer_e(),
            timer_g: settings.timer_g(),
            settings,
            will_send_ack_for_2xx: false,
            request: None,
            last_response: None,
            ack: None,
            finalized: false,
        }
    }

    /// A forked branch of an INVITE client transaction
    pub(crate) fn new_child(
        key: TransactionKey,
        reliable: bool,
        settings: TimerSettings,
        request: SipMessage,
        will_send_ack_for_2xx: bool,
    ) -> Self {
        let mut logic = Self::new(key, TransactionKind::InviteClient, reliable, settings);
        logic.state = TransactionState::Child;
        logic.request = Some(request);
        logic.will_send_ack_for_2xx = will_send_ack_for_2xx;
        logic
    }

    pub(crate) fn set_will_send_ack_for_2xx(&mut self, value: bool) {
        self.will_send_ack_for_2xx = value;
    }

    pub(crate) fn state(&self) -> TransactionState {
        self.state
    }

    /// True once a final response or timeout has been reported to the user
    pub(crate) fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub(crate) fn mark_finalized(&mut self) -> bool {
        !std::mem::replace(&mut self.finalized, true)
    }

    /// Changes state. Nothing may leave TERMINATED.
    pub(crate) fn transition(&mut self, next: TransactionState) -> Result<()> {
        if self.state == TransactionState::Terminated {
            return Err(TransactionError::AlreadyTerminated(self.key.clone()));
        }
        self.state = next;
        Ok(())
    }

    fn enter(&mut self, next: TransactionState, actions: &mut Vec<Action>) {
        if self.transition(next).is_ok() && next == TransactionState::Terminated {
            actions.push(Action::Terminate);
        }
    }

    fn invalid(&self, message: &str) -> TransactionError {
        TransactionError::InvalidState {
            key: self.key.clone(),
            message: format!("{} in {} {}", message, self.kind, self.state),
        }
    }

    /// Outbound message: the request for clients, a response for servers
    pub(crate) fn on_send(&mut self, message: SipMessage) -> Result<Vec<Action>> {
        match self.kind {
            TransactionKind::InviteClient | TransactionKind::NonInviteClient => {
                self.send_request(message)
            }
            TransactionKind::InviteServer => self.ist_send_response(message),
            TransactionKind::NonInviteServer => self.nist_send_response(message),
        }
    }

    fn send_request(&mut self, request: SipMessage) -> Result<Vec<Action>> {
        if !request.is_request() {
            return Err(TransactionError::InvalidMessage(
                "client transactions send requests".to_string(),
            ));
        }
        if self.state != TransactionState::Idle {
            return Err(self.invalid("request already sent"));
        }

        if let Some(timeout) = request
            .property(props::TRANSACTION_TIMEOUT)
            .and_then(|v| v.parse::<u64>().ok())
        {
            let base = TimerSettings::base_from_timeout(Duration::from_millis(timeout));
            self.timer_a = base;
            self.timer_e = base;
        }

        let mut actions = vec![
            Action::Transmit(request.clone()),
            Action::StartTimer(TimerType::MaxLifetime, self.settings.max_lifetime),
        ];
        self.request = Some(request);
        self.transition(TransactionState::Trying)?;

        match self.kind {
            TransactionKind::InviteClient => {
                if !self.reliable {
                    actions.push(Action::StartTimer(TimerType::A, self.timer_a));
                }
                actions.push(Action::StartTimer(TimerType::B, self.timer_a * 64));
            }
            _ => {
                if !self.reliable {
                    actions.push(Action::StartTimer(TimerType::E, self.timer_e));
                }
                actions.push(Action::StartTimer(TimerType::F, self.timer_e * 64));
            }
        }
        Ok(actions)
    }

    fn ist_send_response(&mut self, response: SipMessage) -> Result<Vec<Action>> {
        if !response.is_response() {
            return Err(TransactionError::InvalidMessage(
                "server transactions send responses".to_string(),
            ));
        }
        if self.state != TransactionState::Proceeding {
            return Err(self.invalid("response after final"));
        }
        let mut actions = vec![Action::Transmit(response.clone())];
        if response.is_1xx() {
            self.last_response = Some(response);
        } else if response.is_2xx() {
            self.last_response = Some(response);
            self.enter(TransactionState::Terminated, &mut actions);
        } else {
            self.last_response = Some(response);
            self.transition(TransactionState::Completed)?;
            if !self.reliable {
                actions.push(Action::StartTimer(TimerType::G, self.timer_g));
            }
            actions.push(Action::StartTimer(TimerType::H, self.settings.timer_h()));
        }
        Ok(actions)
    }

    fn nist_send_response(&mut self, response: SipMessage) -> Result<Vec<Action>> {
        if !response.is_response() {
            return Err(TransactionError::InvalidMessage(
                "server transactions send responses".to_string(),
            ));
        }
        if !matches!(self.state, TransactionState::Trying | TransactionState::Proceeding) {
            return Err(self.invalid("response after final"));
        }
        let mut actions = vec![Action::Transmit(response.clone())];
        let provisional = response.is_1xx();
        self.last_response = Some(response);
        if provisional {
            self.transition(TransactionState::Proceeding)?;
        } else if self.reliable {
            self.enter(TransactionState::Terminated, &mut actions);
        } else {
            self.transition(TransactionState::Completed)?;
            actions.push(Action::StartTimer(TimerType::J, self.settings.timer_j()));
        }
        Ok(actions)
    }

    /// ACK for a 2xx, sent by the user of an INVITE client transaction
    pub(crate) fn on_ack_for_2xx(&mut self, ack: SipMessage, target: SocketAddr) -> Vec<Action> {
        let actions = vec![Action::TransmitTo(ack.clone(), target)];
        if self.state == TransactionState::AckPending {
            self.ack = Some((ack, Some(target)));
        }
        actions
    }

    /// Another branch of the same INVITE delivered a final response.
    ///
    /// An early branch stops its retransmission and timeout timers and is
    /// settled without a terminal event of its own; it lingers in COMPLETED
    /// for Timer D to absorb late responses on unreliable transports.
    pub(crate) fn on_branch_final(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        let early = matches!(
            self.state,
            TransactionState::Trying | TransactionState::Child | TransactionState::Proceeding
        );
        if self.kind != TransactionKind::InviteClient || !early {
            return actions;
        }
        self.finalized = true;
        actions.push(Action::CancelTimer(TimerType::A));
        actions.push(Action::CancelTimer(TimerType::B));
        let _ = self.transition(TransactionState::Completed);
        if self.reliable {
            self.enter(TransactionState::Terminated, &mut actions);
        } else {
            actions.push(Action::StartTimer(TimerType::D, self.settings.timer_d));
        }
        actions
    }

    /// Inbound message for this transaction
    pub(crate) fn on_receive(&mut self, message: SipMessage, source: SocketAddr) -> Vec<Action> {
        match self.kind {
            TransactionKind::InviteClient if message.is_response() => self.ict_receive(message),
            TransactionKind::NonInviteClient if message.is_response() => self.nict_receive(message),
            TransactionKind::InviteServer if message.is_request() => {
                self.ist_receive(message, source)
            }
            TransactionKind::NonInviteServer if message.is_request() => {
                self.nist_receive(message, source)
            }
            _ => Vec::new(),
        }
    }

    fn ict_receive(&mut self, response: SipMessage) -> Vec<Action> {
        let mut actions = Vec::new();
        let early = matches!(
            self.state,
            TransactionState::Trying | TransactionState::Child | TransactionState::Proceeding
        );

        if response.is_1xx() {
            if early {
                actions.push(Action::CancelTimer(TimerType::A));
                actions.push(Action::CancelTimer(TimerType::B));
                let _ = self.transition(TransactionState::Proceeding);
                actions.push(Action::Deliver(response));
            }
        } else if response.is_2xx() {
            match self.state {
                _ if early => {
                    actions.push(Action::CancelTimer(TimerType::A));
                    actions.push(Action::CancelTimer(TimerType::B));
                    actions.push(Action::Deliver(response));
                    if self.will_send_ack_for_2xx && !self.reliable {
                        let _ = self.transition(TransactionState::AckPending);
                        actions.push(Action::StartTimer(TimerType::D, self.settings.timer_d));
                    } else {
                        self.enter(TransactionState::Terminated, &mut actions);
                    }
                }
                TransactionState::AckPending => {
                    if let Some((ack, Some(target))) = &self.ack {
                        actions.push(Action::TransmitTo(ack.clone(), *target));
                    }
                }
                _ => {}
            }
        } else if response.is_error_response() {
            match self.state {
                _ if early => {
                    actions.push(Action::CancelTimer(TimerType::A));
                    actions.push(Action::CancelTimer(TimerType::B));
                    let _ = self.transition(TransactionState::Completed);
                    actions.push(Action::Deliver(response.clone()));
                    if let Some(request) = &self.request {
                        let ack = build_ack(request, &response);
                        actions.push(Action::Transmit(ack.clone()));
                        self.ack = Some((ack, None));
                    }
                    if self.reliable {
                        self.enter(TransactionState::Terminated, &mut actions);
                    } else {
                        actions.push(Action::StartTimer(TimerType::D, self.settings.timer_d));
                    }
                }
                TransactionState::Completed => {
                    if let Some((ack, _)) = &self.ack {
                        actions.push(Action::Transmit(ack.clone()));
                    }
                }
                _ => {}
            }
        }
        actions
    }

    fn nict_receive(&mut self, response: SipMessage) -> Vec<Action> {
        let mut actions = Vec::new();
        if !matches!(self.state, TransactionState::Trying | TransactionState::Proceeding) {
            return actions;
        }
        if response.is_1xx() {
            let _ = self.transition(TransactionState::Proceeding);
            actions.push(Action::Deliver(response));
        } else {
            actions.push(Action::CancelTimer(TimerType::E));
            actions.push(Action::CancelTimer(TimerType::F));
            let _ = self.transition(TransactionState::Completed);
            actions.push(Action::Deliver(response));
            if self.reliable {
                self.enter(TransactionState::Terminated, &mut actions);
            } else {
                actions.push(Action::StartTimer(TimerType::K, self.settings.timer_k()));
            }
        }
        actions
    }

    fn ist_receive(&mut self, request: SipMessage, source: SocketAddr) -> Vec<Action> {
        let mut actions = Vec::new();
        if request.is_request_method("ACK") {
            if self.state == TransactionState::Completed {
                actions.push(Action::CancelTimer(TimerType::H));
                if self.reliable {
                    self.enter(TransactionState::Terminated, &mut actions);
                } else {
                    actions.push(Action::CancelTimer(TimerType::G));
                    let _ = self.transition(TransactionState::Confirmed);
                    actions.push(Action::StartTimer(TimerType::I, self.settings.timer_i()));
                }
                actions.push(Action::AckReceived(request));
            }
            return actions;
        }

        match self.state {
            TransactionState::Idle => {
                let request = fix_top_via(request, source);
                self.request = Some(request.clone());
                let _ = self.transition(TransactionState::Proceeding);
                actions.push(Action::StartTimer(TimerType::MaxLifetime, self.settings.max_lifetime));
                actions.push(Action::DispatchRequest(request));
            }
            TransactionState::Proceeding | TransactionState::Completed => {
                if let Some(last) = &self.last_response {
                    actions.push(Action::Transmit(last.clone()));
                }
            }
            _ => {}
        }
        actions
    }

    fn nist_receive(&mut self, request: SipMessage, source: SocketAddr) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.state {
            TransactionState::Idle => {
                let request = fix_top_via(request, source);
                self.request = Some(request.clone());
                let _ = self.transition(TransactionState::Trying);
                actions.push(Action::StartTimer(TimerType::MaxLifetime, self.settings.max_lifetime));
                actions.push(Action::DispatchRequest(request));
            }
            TransactionState::Proceeding | TransactionState::Completed => {
                if let Some(last) = &self.last_response {
                    actions.push(Action::Transmit(last.clone()));
                }
            }
            _ => {}
        }
        actions
    }

    /// Timer fire
    pub(crate) fn on_timer(&mut self, timer: TimerType) -> Vec<Action> {
        let mut actions = Vec::new();
        match timer {
            TimerType::A => {
                if self.state == TransactionState::Trying {
                    if let Some(request) = &self.request {
                        actions.push(Action::Transmit(request.clone()));
                    }
                    self.timer_a *= 2;
                    actions.push(Action::StartTimer(TimerType::A, self.timer_a));
                }
            }
            TimerType::B => {
                if matches!(
                    self.state,
                    TransactionState::Trying | TransactionState::Child | TransactionState::Proceeding
                ) {
                    actions.push(Action::Timeout);
                    self.enter(TransactionState::Terminated, &mut actions);
                }
            }
            TimerType::E => match self.state {
                TransactionState::Trying => {
                    if let Some(request) = &self.request {
                        actions.push(Action::Transmit(request.clone()));
                    }
                    self.timer_e = (self.timer_e * 2).min(self.settings.t2);
                    actions.push(Action::StartTimer(TimerType::E, self.timer_e));
                }
                TransactionState::Proceeding => {
                    if let Some(request) = &self.request {
                        actions.push(Action::Transmit(request.clone()));
                    }
                    actions.push(Action::StartTimer(TimerType::E, self.settings.t2));
                }
                _ => {}
            },
            TimerType::F => {
                if self.state != TransactionState::Completed {
                    actions.push(Action::Timeout);
                    self.enter(TransactionState::Terminated, &mut actions);
                }
            }
            TimerType::G => {
                if self.state == TransactionState::Completed {
                    if let Some(last) = &self.last_response {
                        actions.push(Action::Transmit(last.clone()));
                    }
                    self.timer_g = (self.timer_g * 2).min(self.settings.t2);
                    actions.push(Action::StartTimer(TimerType::G, self.timer_g));
                }
            }
            TimerType::H => {
                if self.state == TransactionState::Completed {
                    actions.push(Action::CancelTimer(TimerType::G));
                    actions.push(Action::Timeout);
                    self.enter(TransactionState::Terminated, &mut actions);
                }
            }
            TimerType::D | TimerType::I | TimerType::J | TimerType::K => {
                self.enter(TransactionState::Terminated, &mut actions);
            }
            TimerType::MaxLifetime => {
                if self.kind.is_client() && !self.finalized {
                    actions.push(Action::Timeout);
                }
                self.enter(TransactionState::Terminated, &mut actions);
            }
        }
        actions
    }
}

/// Fills `received`/`rport` on the top Via when the client asked for rport
fn fix_top_via(mut request: SipMessage, source: SocketAddr) -> SipMessage {
    if let Some(mut via) = request.top_via() {
        if via.has_param("rport") {
            via.set_param("rport", Some(&source.port().to_string()));
            via.set_param("received", Some(&source.ip().to_string()));
            let _ = request.remove_header_at(names::VIA, 0);
            request.prepend_header(names::VIA, via.to_string());
        }
    }
    request
}

/// ACK for a non-2xx final response, built from the original request
pub(crate) fn build_ack(request: &SipMessage, response: &SipMessage) -> SipMessage {
    let uri = request.request_uri().unwrap_or_default();
    let mut ack = SipMessage::request("ACK", uri);
    if let Some(via) = request.header(names::VIA) {
        ack.set_header(names::VIA, via);
    }
    for route in request.header_values(names::ROUTE) {
        ack.append_header(names::ROUTE, route);
    }
    if let Some(from) = request.header(names::FROM) {
        ack.set_header(names::FROM, from);
    }
    if let Some(to) = response.header(names::TO) {
        ack.set_header(names::TO, to);
    }
    if let Some(call_id) = request.header(names::CALL_ID) {
        ack.set_header(names::CALL_ID, call_id);
    }
    if let Some(cseq) = request.cseq() {
        ack.set_header(names::CSEQ, format!("{} ACK", cseq.number));
    }
    ack.set_header(names::MAX_FORWARDS, "70");
    ack.set_header(names::CONTENT_LENGTH, "0");
    ack
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str) -> SipMessage {
        let mut req = SipMessage::request(method, "sip:bob@192.0.2.20");
        req.set_header(names::VIA, "SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKlogic;rport");
        req.set_header(names::FROM, "<sip:alice@example.com>;tag=a");
        req.set_header(names::TO, "<sip:bob@example.com>");
        req.set_header(names::CALL_ID, "logic@test");
        req.set_header(names::CSEQ, format!("1 {}", method));
        req.set_header(names::CONTENT_TYPE, "application/sdp");
        req.set_body("v=0\r\n");
        req
    }

    fn logic(kind: TransactionKind, reliable: bool) -> TransactionLogic {
        TransactionLogic::new(TransactionKey::new("k"), kind, reliable, TimerSettings::default())
    }

    fn source() -> SocketAddr {
        "203.0.113.9:6000".parse().unwrap()
    }

    fn has_timer(actions: &[Action], timer: TimerType) -> bool {
        actions.iter().any(|a| matches!(a, Action::StartTimer(t, _) if *t == timer))
    }

    #[test]
    fn test_ict_unreliable_send_starts_a_and_b() {
        let mut ict = logic(TransactionKind::InviteClient, false);
        let actions = ict.on_send(request("INVITE")).unwrap();
        assert_eq!(ict.state(), TransactionState::Trying);
        assert!(matches!(actions[0], Action::Transmit(_)));
        assert!(has_timer(&actions, TimerType::A));
        assert!(actions.contains(&Action::StartTimer(TimerType::B, Duration::from_secs(32))));
        assert!(ict.on_send(request("INVITE")).is_err());
    }

    #[test]
    fn test_branch_final_settles_an_early_ict() {
        let mut ict = logic(TransactionKind::InviteClient, false);
        ict.on_send(request("INVITE")).unwrap();
        let ringing = request("INVITE").create_response_with_tag(180, None, Some("a")).unwrap();
        ict.on_receive(ringing, source());

        let actions = ict.on_branch_final();
        assert_eq!(ict.state(), TransactionState::Completed);
        assert!(ict.is_finalized());
        assert!(has_timer(&actions, TimerType::D));
        assert!(!actions.iter().any(|a| matches!(a, Action::Timeout | Action::Deliver(_))));

        // MaxLifetime on a settled branch reports nothing
        let actions = ict.on_timer(TimerType::MaxLifetime);
        assert!(!actions.contains(&Action::Timeout));
        assert!(ict.on_branch_final().is_empty());
    }

    #[test]
    fn test_ict_reliable_skips_timer_a() {
        let mut ict = logic(TransactionKind::InviteClient, true);
        let actions = ict.on_send(request("INVITE")).unwrap();
        assert!(!has_timer(&actions, TimerType::A));
        assert!(has_timer(&actions, TimerType::B));
    }

    #[test]
    fn test_ict_timer_a_doubles() {
        let mut ict = logic(TransactionKind::InviteClient, false);
        ict.on_send(request("INVITE")).unwrap();
        let first = ict.on_timer(TimerType::A);
        assert!(first.contains(&Action::StartTimer(TimerType::A, Duration::from_millis(1000))));
        let second = ict.on_timer(TimerType::A);
        assert!(second.contains(&Action::StartTimer(TimerType::A, Duration::from_millis(2000))));
    }

    #[test]
    fn test_transaction_timeout_property_scales_timers() {
        let mut ict = logic(TransactionKind::InviteClient, false);
        let mut req = request("INVITE");
        req.set_property(props::TRANSACTION_TIMEOUT, "6400");
        let actions = ict.on_send(req).unwrap();
        assert!(actions.contains(&Action::StartTimer(TimerType::A, Duration::from_millis(100))));
        assert!(actions.contains(&Action::StartTimer(TimerType::B, Duration::from_millis(6400))));
    }

    #[test]
    fn test_ict_error_response_acks_and_waits_d() {
        let mut ict = logic(TransactionKind::InviteClient, false);
        let req = request("INVITE");
        ict.on_send(req.clone()).unwrap();
        let busy = req.create_response_with_tag(486, None, Some("b")).unwrap();

        let actions = ict.on_receive(busy.clone(), source());
        assert_eq!(ict.state(), TransactionState::Completed);
        assert!(actions.iter().any(|a| matches!(a, Action::Deliver(r) if r.status_code() == Some(486))));
        let ack = actions
            .iter()
            .find_map(|a| match a {
                Action::Transmit(m) if m.is_request_method("ACK") => Some(m.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(ack.header(names::CSEQ), Some("1 ACK"));
        assert_eq!(ack.to_tag().as_deref(), Some("b"));
        assert!(!ack.has_body());
        assert!(!ack.has_header(names::CONTENT_TYPE));
        assert!(has_timer(&actions, TimerType::D));

        // Retransmitted error response re-sends the ACK and is not delivered again
        let again = ict.on_receive(busy, source());
        assert_eq!(again, vec![Action::Transmit(ack)]);

        let done = ict.on_timer(TimerType::D);
        assert_eq!(done, vec![Action::Terminate]);
        assert_eq!(ict.state(), TransactionState::Terminated);
    }

    #[test]
    fn test_ict_2xx_terminates_by_default() {
        let mut ict = logic(TransactionKind::InviteClient, false);
        let req = request("INVITE");
        ict.on_send(req.clone()).unwrap();
        let ok = req.create_response_with_tag(200, None, Some("b")).unwrap();
        let actions = ict.on_receive(ok, source());
        assert!(actions.contains(&Action::Terminate));
        assert_eq!(ict.state(), TransactionState::Terminated);
    }

    #[test]
    fn test_ict_ack_pending_absorbs_2xx_retransmissions() {
        let mut ict = logic(TransactionKind::InviteClient, false);
        ict.set_will_send_ack_for_2xx(true);
        let req = request("INVITE");
        ict.on_send(req.clone()).unwrap();
        let ok = req.create_response_with_tag(200, None, Some("b")).unwrap();
        let actions = ict.on_receive(ok.clone(), source());
        assert_eq!(ict.state(), TransactionState::AckPending);
        assert!(has_timer(&actions, TimerType::D));

        let target: SocketAddr = "192.0.2.20:5060".parse().unwrap();
        let ack = SipMessage::request("ACK", "sip:bob@192.0.2.20");
        let sent = ict.on_ack_for_2xx(ack.clone(), target);
        assert_eq!(sent, vec![Action::TransmitTo(ack.clone(), target)]);

        let again = ict.on_receive(ok, source());
        assert_eq!(again, vec![Action::TransmitTo(ack, target)]);
    }

    #[test]
    fn test_ict_timer_b_times_out_once() {
        let mut ict = logic(TransactionKind::InviteClient, false);
        ict.on_send(request("INVITE")).unwrap();
        let actions = ict.on_timer(TimerType::B);
        assert_eq!(actions, vec![Action::Timeout, Action::Terminate]);
        assert!(ict.on_timer(TimerType::B).is_empty());
    }

    #[test]
    fn test_child_behaves_like_trying() {
        let req = request("INVITE");
        let mut child = TransactionLogic::new_child(
            TransactionKey::new("k:t2"),
            false,
            TimerSettings::default(),
            req.clone(),
            false,
        );
        assert_eq!(child.state(), TransactionState::Child);
        let ringing = req.create_response_with_tag(180, None, Some("t2")).unwrap();
        let actions = child.on_receive(ringing, source());
        assert!(actions.iter().any(|a| matches!(a, Action::Deliver(_))));
        assert_eq!(child.state(), TransactionState::Proceeding);
    }

    #[test]
    fn test_nict_flow() {
        let mut nict = logic(TransactionKind::NonInviteClient, false);
        let req = request("BYE");
        let actions = nict.on_send(req.clone()).unwrap();
        assert!(has_timer(&actions, TimerType::E));
        assert!(has_timer(&actions, TimerType::F));

        let e = nict.on_timer(TimerType::E);
        assert!(e.contains(&Action::StartTimer(TimerType::E, Duration::from_millis(1000))));

        let trying = req.create_response(100, None).unwrap();
        nict.on_receive(trying, source());
        assert_eq!(nict.state(), TransactionState::Proceeding);
        let e = nict.on_timer(TimerType::E);
        assert!(e.contains(&Action::StartTimer(TimerType::E, Duration::from_secs(4))));

        let ok = req.create_response(200, None).unwrap();
        let actions = nict.on_receive(ok.clone(), source());
        assert_eq!(nict.state(), TransactionState::Completed);
        assert!(has_timer(&actions, TimerType::K));
        assert!(nict.on_receive(ok, source()).is_empty());
        assert!(nict.on_timer(TimerType::F).is_empty());
    }

    #[test]
    fn test_nict_timer_e_caps_at_t2() {
        let mut nict = logic(TransactionKind::NonInviteClient, false);
        nict.on_send(request("OPTIONS")).unwrap();
        let mut last = Duration::ZERO;
        for _ in 0..6 {
            for action in nict.on_timer(TimerType::E) {
                if let Action::StartTimer(TimerType::E, d) = action {
                    last = d;
                }
            }
        }
        assert_eq!(last, Duration::from_secs(4));
    }

    #[test]
    fn test_ist_error_response_and_ack() {
        let mut ist = logic(TransactionKind::InviteServer, false);
        let req = request("INVITE");
        let actions = ist.on_receive(req.clone(), source());
        let dispatched = actions
            .iter()
            .find_map(|a| match a {
                Action::DispatchRequest(m) => Some(m.clone()),
                _ => None,
            })
            .unwrap();
        let via = dispatched.top_via().unwrap();
        assert_eq!(via.rport(), Some(6000));
        assert_eq!(via.param("received"), Some("203.0.113.9"));
        assert_eq!(ist.state(), TransactionState::Proceeding);

        let ringing = req.create_response_with_tag(180, None, Some("s")).unwrap();
        ist.on_send(ringing.clone()).unwrap();
        // Retransmitted INVITE re-sends the last provisional
        assert_eq!(ist.on_receive(req.clone(), source()), vec![Action::Transmit(ringing)]);

        let busy = req.create_response_with_tag(486, None, Some("s")).unwrap();
        let actions = ist.on_send(busy.clone()).unwrap();
        assert_eq!(ist.state(), TransactionState::Completed);
        assert!(has_timer(&actions, TimerType::G));
        assert!(has_timer(&actions, TimerType::H));

        let g = ist.on_timer(TimerType::G);
        assert!(g.contains(&Action::Transmit(busy)));
        assert!(g.contains(&Action::StartTimer(TimerType::G, Duration::from_millis(1000))));

        let mut ack = req.clone();
        ack.set_method("ACK").unwrap();
        ack.set_header(names::CSEQ, "1 ACK");
        let actions = ist.on_receive(ack, source());
        assert_eq!(ist.state(), TransactionState::Confirmed);
        assert!(has_timer(&actions, TimerType::I));
        assert!(actions.iter().any(|a| matches!(a, Action::AckReceived(_))));
        assert_eq!(ist.on_timer(TimerType::I), vec![Action::Terminate]);
    }

    #[test]
    fn test_ist_timer_h_reports_timeout() {
        let mut ist = logic(TransactionKind::InviteServer, true);
        let req = request("INVITE");
        ist.on_receive(req.clone(), source());
        let actions = ist.on_send(req.create_response(500, None).unwrap()).unwrap();
        assert!(!has_timer(&actions, TimerType::G));
        let h = ist.on_timer(TimerType::H);
        assert!(h.contains(&Action::Timeout));
        assert!(h.contains(&Action::Terminate));
    }

    #[test]
    fn test_ist_2xx_terminates() {
        let mut ist = logic(TransactionKind::InviteServer, false);
        let req = request("INVITE");
        ist.on_receive(req.clone(), source());
        let actions = ist.on_send(req.create_response(200, None).unwrap()).unwrap();
        assert!(actions.contains(&Action::Terminate));
        assert!(ist.on_send(req.create_response(200, None).unwrap()).is_err());
    }

    #[test]
    fn test_nist_flow() {
        let mut nist = logic(TransactionKind::NonInviteServer, false);
        let req = request("OPTIONS");
        nist.on_receive(req.clone(), source());
        assert_eq!(nist.state(), TransactionState::Trying);
        // Retransmission before any response is absorbed
        assert!(nist.on_receive(req.clone(), source()).is_empty());

        let ok = req.create_response(200, None).unwrap();
        let actions = nist.on_send(ok.clone()).unwrap();
        assert_eq!(nist.state(), TransactionState::Completed);
        assert!(has_timer(&actions, TimerType::J));
        assert_eq!(nist.on_receive(req, source()), vec![Action::Transmit(ok)]);
        assert_eq!(nist.on_timer(TimerType::J), vec![Action::Terminate]);
    }

    #[test]
    fn test_nist_reliable_final_terminates() {
        let mut nist = logic(TransactionKind::NonInviteServer, true);
        let req = request("BYE");
        nist.on_receive(req.clone(), source());
        let actions = nist.on_send(req.create_response(200, None).unwrap()).unwrap();
        assert!(actions.contains(&Action::Terminate));
    }

    #[test]
    fn test_no_transition_out_of_terminated() {
        let mut nist = logic(TransactionKind::NonInviteServer, true);
        nist.transition(TransactionState::Terminated).unwrap();
        let err = nist.transition(TransactionState::Terminated).unwrap_err();
        assert!(matches!(err, TransactionError::AlreadyTerminated(_)));
        assert!(nist.transition(TransactionState::Proceeding).is_err());
    }

    #[test]
    fn test_max_lifetime_times_out_unfinished_client() {
        let mut nict = logic(TransactionKind::NonInviteClient, true);
        nict.on_send(request("OPTIONS")).unwrap();
        assert_eq!(nict.on_timer(TimerType::MaxLifetime), vec![Action::Timeout, Action::Terminate]);

        let mut nist = logic(TransactionKind::NonInviteServer, true);
        nist.on_receive(request("OPTIONS"), source());
        assert_eq!(nist.on_timer(TimerType::MaxLifetime), vec![Action::Terminate]);
    }
}
