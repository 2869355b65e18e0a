use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sbc_core::config::{DisconnectConfig, DomainLimitConfig};
use sbc_core::{SbcConfig, SbcManager};
use sbc_sip_core::header::names;
use sbc_sip_core::testing::{RecordingTransport, SentMessage};
use sbc_sip_core::{SipMessage, SipUri, TransportEvent, TransportTable, TransportType};

const WAIT: Duration = Duration::from_secs(5);

const OFFER: &str = "v=0\r\no=alice 1001 1 IN IP4 203.0.113.5\r\ns=-\r\nc=IN IP4 203.0.113.5\r\nt=0 0\r\nm=audio 4000 RTP/AVP 0\r\n";
const ANSWER: &str = "v=0\r\no=bob 2002 1 IN IP4 192.0.2.20\r\ns=-\r\nc=IN IP4 192.0.2.20\r\nt=0 0\r\nm=audio 5000 RTP/AVP 0\r\n";

fn sbc_addr() -> SocketAddr {
    "10.0.0.1:5060".parse().unwrap()
}

fn ua() -> SocketAddr {
    "203.0.113.5:5060".parse().unwrap()
}

fn far() -> SocketAddr {
    "192.0.2.20:5060".parse().unwrap()
}

struct Harness {
    sbc: Arc<SbcManager>,
    transport: Arc<RecordingTransport>,
}

impl Harness {
    async fn new(config: SbcConfig) -> Self {
        let transport = RecordingTransport::new(sbc_addr(), TransportType::Udp);
        let table = Arc::new(TransportTable::new());
        table.add(transport.clone()).unwrap();
        let sbc = SbcManager::builder(config).transports(table).build().unwrap();
        sbc.start().await.unwrap();
        Harness { sbc, transport }
    }

    async fn deliver(&self, message: SipMessage, source: SocketAddr) {
        let event = TransportEvent::MessageReceived { message, source, destination: sbc_addr() };
        self.sbc.handle_transport_event(event).await.unwrap();
    }

    async fn from_ua(&self, message: SipMessage) {
        self.deliver(message, ua()).await;
    }

    async fn from_far(&self, message: SipMessage) {
        self.deliver(message, far()).await;
    }

    async fn find<F>(&self, timeout: Duration, predicate: F) -> Option<SentMessage>
    where
        F: Fn(&SentMessage) -> bool,
    {
        self.transport.wait_for(timeout, predicate).await
    }

    /// Waits for a request with `method` sent to `destination`
    async fn request_to(&self, destination: SocketAddr, method: &str) -> SipMessage {
        self.find(WAIT, |s| s.destination == destination && s.message.is_request_method(method))
            .await
            .unwrap_or_else(|| panic!("no {} sent to {}", method, destination))
            .message
    }

    /// Waits for a response with `code` to a `method` request sent to `destination`
    async fn response_to(&self, destination: SocketAddr, code: u16, method: &str) -> SipMessage {
        self.find(WAIT, |s| {
            s.destination == destination
                && s.message.status_code() == Some(code)
                && s.message.cseq_method().as_deref() == Some(method)
        })
        .await
        .unwrap_or_else(|| panic!("no {} response to {} sent to {}", code, method, destination))
        .message
    }
}

fn base_request(method: &str, uri: &str, branch: &str, call_id: &str, cseq: u32) -> SipMessage {
    let mut req = SipMessage::request(method, uri);
    req.set_header(names::VIA, format!("SIP/2.0/UDP 203.0.113.5:5060;branch={}", branch));
    req.set_header(names::FROM, "<sip:alice@example.com>;tag=alice");
    req.set_header(names::TO, "<sip:bob@example.com>");
    req.set_header(names::CALL_ID, call_id);
    req.set_header(names::CSEQ, format!("{} {}", cseq, method));
    req.set_header(names::MAX_FORWARDS, "70");
    req.set_header(names::CONTACT, "<sip:alice@203.0.113.5:5060>");
    req
}

fn invite(call_id: &str) -> SipMessage {
    let mut req = base_request("INVITE", "sip:bob@192.0.2.20", "z9hG4bKua-invite", call_id, 1);
    req.set_header(names::CONTENT_TYPE, "application/sdp");
    req.set_body(OFFER);
    req
}

/// Response from the far end to a request the SBC forwarded
fn far_response(forwarded: &SipMessage, code: u16, body: Option<&str>) -> SipMessage {
    let mut response = forwarded.create_response_with_tag(code, None, Some("far")).unwrap();
    response.set_header(names::CONTACT, "<sip:bob@192.0.2.20:5060>");
    if let Some(body) = body {
        response.set_header(names::CONTENT_TYPE, "application/sdp");
        response.set_body(body);
    }
    response
}

/// Request from the UA inside the dialog established by `answer`
fn in_dialog(method: &str, answer: &SipMessage, branch: &str, cseq: u32) -> SipMessage {
    let contact = answer.header(names::CONTACT).unwrap();
    let target = sbc_sip_core::header::uri_part(contact).to_string();
    let mut req = base_request(method, &target, branch, answer.call_id().unwrap(), cseq);
    req.set_header(names::TO, answer.header(names::TO).unwrap());
    req
}

/// Runs an INVITE through to the 200 seen by the UA
async fn establish(harness: &Harness, call_id: &str) -> (SipMessage, SipMessage) {
    harness.from_ua(invite(call_id)).await;
    let forwarded = harness.request_to(far(), "INVITE").await;
    harness.from_far(far_response(&forwarded, 200, Some(ANSWER))).await;
    let answer = harness.response_to(ua(), 200, "INVITE").await;
    (forwarded, answer)
}

#[tokio::test(start_paused = true)]
async fn options_to_the_sbc_is_answered_locally() {
    let harness = Harness::new(SbcConfig::default()).await;
    let options = base_request("OPTIONS", "sip:10.0.0.1:5060", "z9hG4bKopt", "opt-1", 1);
    harness.from_ua(options).await;

    let response = harness.response_to(ua(), 200, "OPTIONS").await;
    assert!(response.header(names::ALLOW).unwrap().contains("INVITE"));
    assert!(harness.find(Duration::from_millis(100), |s| s.destination != ua()).await.is_none());
    harness.sbc.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn invite_is_bridged_with_topology_hidden() {
    let harness = Harness::new(SbcConfig::default()).await;
    harness.from_ua(invite("call-1")).await;

    let trying = harness.response_to(ua(), 100, "INVITE").await;
    assert_eq!(trying.via_branch(), "z9hG4bKua-invite");

    let forwarded = harness.request_to(far(), "INVITE").await;
    assert_eq!(forwarded.header_count(names::VIA), 1);
    assert!(forwarded.top_via().unwrap().to_string().contains("10.0.0.1:5060"));
    assert_ne!(forwarded.via_branch(), "z9hG4bKua-invite");
    assert_eq!(forwarded.max_forwards(), Some(69));
    assert!(forwarded.header(names::CONTACT).unwrap().contains("sbc-session-id="));
    assert!(forwarded.header(names::CONTACT).unwrap().contains("sbc-call-index=2"));
    assert_eq!(forwarded.body(), OFFER);

    harness.from_far(far_response(&forwarded, 180, None)).await;
    harness.response_to(ua(), 180, "INVITE").await;

    harness.from_far(far_response(&forwarded, 200, Some(ANSWER))).await;
    let answer = harness.response_to(ua(), 200, "INVITE").await;
    assert_eq!(answer.via_branch(), "z9hG4bKua-invite");
    assert_eq!(answer.to_tag().as_deref(), Some("far"));
    assert_eq!(answer.body(), ANSWER);
    let contact = answer.header(names::CONTACT).unwrap();
    assert!(contact.contains("10.0.0.1:5060"));
    assert!(contact.contains("sbc-call-index=1"));
    assert_eq!(harness.sbc.services().dialogs.len(), 1);

    // ACK for the 2xx crosses over with the INVITE's CSeq
    harness.from_ua(in_dialog("ACK", &answer, "z9hG4bKua-ack", 1)).await;
    let ack = harness.request_to(far(), "ACK").await;
    assert_eq!(ack.header(names::CSEQ), Some("1 ACK"));
    assert_eq!(ack.request_uri(), Some("sip:bob@192.0.2.20:5060"));
    assert_eq!(ack.call_id(), forwarded.call_id());

    harness.from_ua(in_dialog("BYE", &answer, "z9hG4bKua-bye", 2)).await;
    let bye = harness.request_to(far(), "BYE").await;
    assert_eq!(bye.header(names::CSEQ), Some("2 BYE"));
    assert_eq!(bye.to_tag().as_deref(), Some("far"));
    assert_eq!(bye.from_tag(), forwarded.from_tag());

    harness.from_far(far_response(&bye, 200, None)).await;
    harness.response_to(ua(), 200, "BYE").await;
    assert!(harness.sbc.services().dialogs.is_empty());
    harness.sbc.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unanswered_invite_gets_408_and_drops_the_dialog() {
    let harness = Harness::new(SbcConfig::default()).await;
    harness.from_ua(invite("call-timeout")).await;
    harness.request_to(far(), "INVITE").await;

    // Timer B is 64*T1
    let timeout = harness
        .find(Duration::from_secs(40), |s| s.destination == ua() && s.message.status_code() == Some(408))
        .await
        .expect("408 sent upstream")
        .message;
    assert_eq!(timeout.via_branch(), "z9hG4bKua-invite");
    assert!(harness.sbc.services().dialogs.is_empty());
    assert_eq!(harness.sbc.services().pending_invites(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_follows_the_forwarded_invite() -> anyhow::Result<()> {
    let harness = Harness::new(SbcConfig::default()).await;
    harness.from_ua(invite("call-cancel")).await;
    let forwarded = harness.request_to(far(), "INVITE").await;

    let mut cancel = base_request("CANCEL", "sip:bob@192.0.2.20", "z9hG4bKua-invite", "call-cancel", 1);
    cancel.remove_header(names::CONTACT);
    harness.from_ua(cancel).await;

    let relayed = harness.request_to(far(), "CANCEL").await;
    assert_eq!(relayed.via_branch(), forwarded.via_branch());
    assert_eq!(relayed.header(names::CSEQ), Some("1 CANCEL"));
    assert!(!relayed.has_body());

    harness.sbc.stop().await?;
    assert!(harness.sbc.handle_transport_event(TransportEvent::MessageReceived {
        message: invite("call-late"),
        source: ua(),
        destination: sbc_addr(),
    })
    .await
    .is_err());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn exhausted_pool_runs_inline() {
    let config = SbcConfig::from_toml_str("[workers]\npool_size = 1").unwrap();
    let harness = Harness::new(config).await;
    let workers = harness.sbc.manager().workers().clone();
    let blocker = workers
        .try_spawn(tokio::time::sleep(Duration::from_secs(3600)))
        .unwrap_or_else(|_| panic!("pool should have a free slot"));
    assert_eq!(workers.available(), 0);

    let options = base_request("OPTIONS", "sip:10.0.0.1:5060", "z9hG4bKinline", "inline-1", 1);
    harness.from_ua(options).await;
    harness.response_to(ua(), 200, "OPTIONS").await;

    let stats = harness.sbc.stats();
    assert_eq!(stats.inline, 1);
    assert_eq!(stats.created, 1);
    blocker.abort();
}

#[tokio::test(start_paused = true)]
async fn early_bye_is_held_back() {
    let mut config = SbcConfig::default();
    config.disconnect = Some(DisconnectConfig { min_connect_time_secs: 10, yield_time_secs: 2 });
    let harness = Harness::new(config).await;
    let (_, answer) = establish(&harness, "call-early").await;

    harness.from_ua(in_dialog("BYE", &answer, "z9hG4bKua-early-bye", 2)).await;
    let early = harness
        .find(Duration::from_millis(1500), |s| s.destination == far() && s.message.is_request_method("BYE"))
        .await;
    assert!(early.is_none());

    harness.request_to(far(), "BYE").await;
    assert_eq!(harness.sbc.stats().delayed_disconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn subscription_routes_notify_and_expires() {
    let harness = Harness::new(SbcConfig::default()).await;
    let mut subscribe = base_request("SUBSCRIBE", "sip:presence@192.0.2.20", "z9hG4bKsub1", "sub-1", 1);
    subscribe.set_header(names::EVENT, "presence");
    subscribe.set_header(names::EXPIRES, "3600");
    harness.from_ua(subscribe).await;

    let forwarded = harness.request_to(far(), "SUBSCRIBE").await;
    assert!(forwarded.header(names::CONTACT).unwrap().contains("10.0.0.1:5060"));
    let mut accepted = forwarded.create_response_with_tag(202, None, Some("n1")).unwrap();
    accepted.set_header(names::CONTACT, "<sip:presence@192.0.2.20:5060>");
    accepted.set_header(names::EXPIRES, "3600");
    harness.from_far(accepted).await;
    let accepted = harness.response_to(ua(), 202, "SUBSCRIBE").await;
    assert_eq!(harness.sbc.services().subscriptions.len(), 1);

    let mut notify = SipMessage::request("NOTIFY", "sip:alice@10.0.0.1:5060");
    notify.set_header(names::VIA, "SIP/2.0/UDP 192.0.2.20:5060;branch=z9hG4bKn1");
    notify.set_header(names::FROM, "<sip:presence@192.0.2.20>;tag=n1");
    notify.set_header(names::TO, "<sip:alice@example.com>;tag=alice");
    notify.set_header(names::CALL_ID, "sub-1");
    notify.set_header(names::CSEQ, "1 NOTIFY");
    notify.set_header(names::EVENT, "presence");
    notify.set_header(names::SUBSCRIPTION_STATE, "active;expires=3600");
    notify.set_header(names::MAX_FORWARDS, "70");
    harness.from_far(notify).await;

    let relayed = harness.request_to(ua(), "NOTIFY").await;
    assert_eq!(relayed.request_uri(), Some("sip:alice@203.0.113.5:5060"));
    assert_eq!(relayed.header(names::FROM), accepted.header(names::TO));
    assert!(relayed.top_via().unwrap().to_string().contains("10.0.0.1:5060"));

    let mut unsubscribe = in_dialog("SUBSCRIBE", &accepted, "z9hG4bKsub2", 2);
    unsubscribe.set_header(names::EVENT, "presence");
    unsubscribe.set_header(names::EXPIRES, "0");
    harness.from_ua(unsubscribe).await;

    let refresh = harness
        .find(WAIT, |s| s.destination == far() && s.message.header(names::EXPIRES) == Some("0"))
        .await
        .expect("refresh forwarded")
        .message;
    assert_eq!(refresh.request_uri(), Some("sip:presence@192.0.2.20:5060"));
    let mut ended = refresh.create_response(200, None).unwrap();
    ended.set_header(names::EXPIRES, "0");
    harness.from_far(ended).await;
    harness.response_to(ua(), 200, "SUBSCRIBE").await;
    assert!(harness.sbc.services().subscriptions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn local_100rel_terminates_prack_on_both_legs() {
    let mut config = SbcConfig::default();
    config.features.local_100rel = true;
    let harness = Harness::new(config).await;

    let mut offer = invite("call-rel");
    offer.set_header(names::SUPPORTED, "100rel");
    harness.from_ua(offer).await;
    let forwarded = harness.request_to(far(), "INVITE").await;
    assert!(forwarded.header(names::SUPPORTED).unwrap().contains("100rel"));
    assert!(forwarded.header(names::ALLOW).unwrap().contains("PRACK"));

    let mut progress = far_response(&forwarded, 183, Some(ANSWER));
    progress.set_header(names::REQUIRE, "100rel");
    progress.set_header(names::RSEQ, "7");
    harness.from_far(progress).await;

    let prack = harness.request_to(far(), "PRACK").await;
    assert_eq!(prack.header(names::RACK), Some("7 1 INVITE"));
    assert_eq!(prack.call_id(), forwarded.call_id());
    assert_eq!(prack.to_tag().as_deref(), Some("far"));
    harness.from_far(far_response(&prack, 200, None)).await;

    let reliable = harness.response_to(ua(), 183, "INVITE").await;
    assert_eq!(reliable.header(names::RSEQ), Some("1"));
    assert!(reliable.header(names::REQUIRE).unwrap().contains("100rel"));
    assert!(harness.sbc.services().reliable.contains("call-rel", 1));

    let mut ua_prack = in_dialog("PRACK", &reliable, "z9hG4bKua-prack", 2);
    ua_prack.set_header(names::RACK, "1 1 INVITE");
    harness.from_ua(ua_prack).await;
    harness.response_to(ua(), 200, "PRACK").await;
    assert!(harness.sbc.services().reliable.is_empty());

    // the UA's PRACK never reaches the far end
    let contact_uri: SipUri = sbc_sip_core::header::uri_part(reliable.header(names::CONTACT).unwrap())
        .parse()
        .unwrap();
    assert_eq!(contact_uri.socket_addr(), Some(sbc_addr()));
    let pracks = harness.transport.sent_matching("PRACK");
    assert!(pracks.iter().all(|s| s.destination == far() && s.message.header(names::RACK) == Some("7 1 INVITE")));
}

/// Runs a presence SUBSCRIBE through to the 202 seen by the UA
async fn subscribe(harness: &Harness, call_id: &str, record_routes: &[&str]) -> SipMessage {
    let branch = format!("z9hG4bK{}", call_id);
    let mut request = base_request("SUBSCRIBE", "sip:presence@192.0.2.20", &branch, call_id, 1);
    request.set_header(names::EVENT, "presence");
    request.set_header(names::EXPIRES, "3600");
    harness.from_ua(request).await;

    let forwarded = harness.request_to(far(), "SUBSCRIBE").await;
    let mut accepted = forwarded.create_response_with_tag(202, None, Some("n1")).unwrap();
    accepted.set_header(names::CONTACT, "<sip:presence@192.0.2.20:5060>");
    accepted.set_header(names::EXPIRES, "3600");
    for rr in record_routes {
        accepted.append_header(names::RECORD_ROUTE, *rr);
    }
    harness.from_far(accepted).await;
    harness.response_to(ua(), 202, "SUBSCRIBE").await
}

/// In-dialog SUBSCRIBE from the UA with the given expiry
fn resubscribe(accepted: &SipMessage, branch: &str, cseq: u32, expires: &str) -> SipMessage {
    let mut request = in_dialog("SUBSCRIBE", accepted, branch, cseq);
    request.set_header(names::EVENT, "presence");
    request.set_header(names::EXPIRES, expires);
    request
}

#[tokio::test(start_paused = true)]
async fn bye_follows_the_reversed_record_route_of_the_answer() {
    let harness = Harness::new(SbcConfig::default()).await;
    harness.from_ua(invite("call-rr")).await;
    let forwarded = harness.request_to(far(), "INVITE").await;

    let mut answer = far_response(&forwarded, 200, Some(ANSWER));
    answer.append_header(names::RECORD_ROUTE, "<sip:198.51.100.2:5060;lr>");
    answer.append_header(names::RECORD_ROUTE, "<sip:198.51.100.1:5060;lr>");
    harness.from_far(answer).await;
    let answer = harness.response_to(ua(), 200, "INVITE").await;

    harness.from_ua(in_dialog("BYE", &answer, "z9hG4bKua-rr-bye", 2)).await;
    let proxy: SocketAddr = "198.51.100.1:5060".parse().unwrap();
    let bye = harness.request_to(proxy, "BYE").await;
    let routes: Vec<&str> = bye.header_values(names::ROUTE).collect();
    assert_eq!(routes, ["<sip:198.51.100.1:5060;lr>", "<sip:198.51.100.2:5060;lr>"]);
    assert_eq!(bye.request_uri(), Some("sip:bob@192.0.2.20:5060"));
    assert_eq!(bye.to_tag().as_deref(), Some("far"));
}

#[tokio::test(start_paused = true)]
async fn subscription_refresh_carries_the_notifier_route_set() {
    let harness = Harness::new(SbcConfig::default()).await;
    let accepted = subscribe(
        &harness,
        "sub-rr",
        &["<sip:198.51.100.2:5060;lr>", "<sip:198.51.100.1:5060;lr>", "<sip:10.0.0.1:5060;lr>"],
    )
    .await;

    harness.from_ua(resubscribe(&accepted, "z9hG4bKsub-rr-2", 2, "1800")).await;
    let refresh = harness
        .find(WAIT, |s| s.destination == far() && s.message.header(names::EXPIRES) == Some("1800"))
        .await
        .expect("refresh forwarded")
        .message;
    let routes: Vec<&str> = refresh.header_values(names::ROUTE).collect();
    assert_eq!(routes, ["<sip:198.51.100.1:5060;lr>", "<sip:198.51.100.2:5060;lr>"]);
    assert_eq!(refresh.request_uri(), Some("sip:presence@192.0.2.20:5060"));
    assert_eq!(refresh.header_count(names::VIA), 1);
}

#[tokio::test(start_paused = true)]
async fn refresh_answered_481_forgets_the_subscription() {
    let harness = Harness::new(SbcConfig::default()).await;
    let accepted = subscribe(&harness, "sub-481", &[]).await;
    assert_eq!(harness.sbc.services().subscriptions.len(), 1);

    harness.from_ua(resubscribe(&accepted, "z9hG4bKsub-481-2", 2, "1800")).await;
    let refresh = harness
        .find(WAIT, |s| s.destination == far() && s.message.header(names::EXPIRES) == Some("1800"))
        .await
        .expect("refresh forwarded")
        .message;
    harness.from_far(refresh.create_response(481, None).unwrap()).await;
    harness.response_to(ua(), 481, "SUBSCRIBE").await;
    assert!(harness.sbc.services().subscriptions.is_empty());

    // later refreshes are refused without reaching the notifier
    harness.from_ua(resubscribe(&accepted, "z9hG4bKsub-481-3", 3, "1800")).await;
    let refused = harness
        .find(WAIT, |s| {
            s.destination == ua()
                && s.message.status_code() == Some(481)
                && s.message.cseq().map(|c| c.number) == Some(3)
        })
        .await;
    assert!(refused.is_some());
    assert_eq!(harness.transport.sent_matching("SUBSCRIBE").iter().filter(|s| s.destination == far()).count(), 2);
}

#[tokio::test(start_paused = true)]
async fn unanswered_unsubscribe_forgets_the_subscription() {
    let harness = Harness::new(SbcConfig::default()).await;
    let accepted = subscribe(&harness, "sub-lost", &[]).await;

    harness.from_ua(resubscribe(&accepted, "z9hG4bKsub-lost-2", 2, "0")).await;
    harness
        .find(WAIT, |s| s.destination == far() && s.message.header(names::EXPIRES) == Some("0"))
        .await
        .expect("unsubscribe forwarded");

    let timeout = harness
        .find(Duration::from_secs(40), |s| {
            s.destination == ua() && s.message.status_code() == Some(408)
        })
        .await;
    assert!(timeout.is_some());
    assert!(harness.sbc.services().subscriptions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn challenged_unsubscribe_keeps_the_subscription() {
    let harness = Harness::new(SbcConfig::default()).await;
    let accepted = subscribe(&harness, "sub-auth", &[]).await;

    harness.from_ua(resubscribe(&accepted, "z9hG4bKsub-auth-2", 2, "0")).await;
    let unsubscribe = harness
        .find(WAIT, |s| s.destination == far() && s.message.header(names::EXPIRES) == Some("0"))
        .await
        .expect("unsubscribe forwarded")
        .message;
    let mut challenge = unsubscribe.create_response(407, None).unwrap();
    challenge.set_header("Proxy-Authenticate", "Digest realm=\"example.com\", nonce=\"abc\"");
    harness.from_far(challenge).await;
    harness.response_to(ua(), 407, "SUBSCRIBE").await;
    assert_eq!(harness.sbc.services().subscriptions.len(), 1);
}

const UA_BINDING: &str = "sip:alice@192.168.1.10:5060;rinstance=x";

fn register(branch: &str, cseq: u32, expires: &str) -> SipMessage {
    let mut req = base_request("REGISTER", "sip:192.0.2.20", branch, "reg-1", cseq);
    req.set_header(names::TO, "<sip:alice@example.com>");
    req.set_header(names::CONTACT, format!("<{}>", UA_BINDING));
    req.set_header(names::EXPIRES, expires);
    req
}

/// Registrar answer echoing the bindings it accepted
fn registrar_ok(forwarded: &SipMessage, bindings: &[&str]) -> SipMessage {
    let mut response = forwarded.create_response_with_tag(200, None, Some("reg")).unwrap();
    response.remove_header(names::CONTACT);
    for binding in bindings {
        response.append_header(names::CONTACT, *binding);
    }
    response
}

fn invite_from_far(uri: &str, branch: &str, call_id: &str) -> SipMessage {
    let mut req = base_request("INVITE", uri, branch, call_id, 1);
    req.set_header(names::VIA, format!("SIP/2.0/UDP 192.0.2.20:5060;branch={}", branch));
    req.set_header(names::FROM, "<sip:carol@carrier.example.com>;tag=carol");
    req.set_header(names::TO, "<sip:alice@example.com>");
    req.set_header(names::CONTACT, "<sip:carol@192.0.2.20:5060>");
    req
}

/// Registers the UA binding and returns the Contact minted for it upstream
async fn registered(harness: &Harness) -> String {
    harness.from_ua(register("z9hG4bKreg1", 1, "600")).await;
    let forwarded = harness.request_to(far(), "REGISTER").await;
    let minted = forwarded.header(names::CONTACT).unwrap().to_string();
    harness.from_far(registrar_ok(&forwarded, &[minted.as_str()])).await;
    harness.response_to(ua(), 200, "REGISTER").await;
    minted
}

#[tokio::test(start_paused = true)]
async fn register_relays_a_minted_contact_and_maps_it_back() {
    let harness = Harness::new(SbcConfig::default()).await;
    harness.from_ua(register("z9hG4bKreg1", 1, "600")).await;

    let forwarded = harness.request_to(far(), "REGISTER").await;
    let minted = forwarded.header(names::CONTACT).unwrap().to_string();
    assert!(minted.starts_with("<sip:sbc-reg-alice-"));
    assert!(minted.contains("@10.0.0.1:5060"));
    assert!(minted.ends_with(";expires=600"));
    assert!(!minted.contains("192.168.1.10"));
    assert!(!forwarded.has_header(names::EXPIRES));
    assert_eq!(forwarded.header_count(names::VIA), 1);

    let other = "<sip:alice@198.51.100.9:5060>;expires=120";
    harness.from_far(registrar_ok(&forwarded, &[minted.as_str(), other])).await;
    let accepted = harness.response_to(ua(), 200, "REGISTER").await;
    let contacts: Vec<&str> = accepted.header_values(names::CONTACT).collect();
    assert_eq!(contacts, [format!("<{}>;expires=600", UA_BINDING).as_str(), other]);

    let registrar = &harness.sbc.services().registrar;
    assert_eq!(registrar.len(), 1);
    let record = registrar.find_by_user("alice").unwrap();
    assert_eq!(record.contact, UA_BINDING);
    assert_eq!(record.packet_source, ua());
    assert_eq!(record.target(), ua());
    assert_eq!(record.aor, "sip:alice@example.com");
    harness.sbc.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn invite_to_a_minted_contact_reaches_the_registered_ua() {
    let harness = Harness::new(SbcConfig::default()).await;
    let minted = registered(&harness).await;
    let target = sbc_sip_core::header::uri_part(&minted).to_string();

    harness.from_far(invite_from_far(&target, "z9hG4bKfar-invite", "call-in")).await;
    let delivered = harness.request_to(ua(), "INVITE").await;
    assert_eq!(delivered.request_uri(), Some(UA_BINDING));
    assert_eq!(delivered.header_count(names::VIA), 1);
    assert!(delivered.top_via().unwrap().to_string().contains("10.0.0.1:5060"));
    assert!(delivered.header(names::CONTACT).unwrap().contains("10.0.0.1:5060"));
    harness.sbc.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unregister_forgets_the_binding() {
    let harness = Harness::new(SbcConfig::default()).await;
    let minted = registered(&harness).await;
    harness.transport.clear();

    harness.from_ua(register("z9hG4bKreg2", 2, "0")).await;
    let forwarded = harness.request_to(far(), "REGISTER").await;
    assert!(forwarded.header(names::CONTACT).unwrap().ends_with(";expires=0"));
    harness.from_far(registrar_ok(&forwarded, &[])).await;
    let accepted = harness.response_to(ua(), 200, "REGISTER").await;
    assert!(!accepted.has_header(names::CONTACT));
    assert!(harness.sbc.services().registrar.is_empty());

    let target = sbc_sip_core::header::uri_part(&minted).to_string();
    harness.from_far(invite_from_far(&target, "z9hG4bKfar-late", "call-late")).await;
    let refused = harness.response_to(far(), 404, "INVITE").await;
    assert_eq!(refused.reason(), Some("Registration Not Found"));
    assert!(harness.find(Duration::from_millis(100), |s| s.destination == ua()).await.is_none());
    harness.sbc.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn domain_channel_limit_refuses_the_extra_call() {
    let mut config = SbcConfig::default();
    config.limits.domains.push(DomainLimitConfig {
        domain: "example.com".into(),
        max_channels: 1,
        enabled: true,
    });
    let harness = Harness::new(config).await;
    let (_, answer) = establish(&harness, "call-a").await;
    let cdr = &harness.sbc.services().cdr;
    assert_eq!(cdr.open_records(), 1);

    let mut second = invite("call-b");
    second.set_header(names::VIA, "SIP/2.0/UDP 203.0.113.5:5060;branch=z9hG4bKua-invite-b");
    harness.from_ua(second).await;
    let refused = harness.response_to(ua(), 403, "INVITE").await;
    assert_eq!(refused.reason(), Some("Channel Count Exceeded"));
    assert_eq!(refused.call_id(), Some("call-b"));
    assert_eq!(cdr.limits().domain_count("example.com"), 1);

    harness.from_ua(in_dialog("BYE", &answer, "z9hG4bKua-bye", 2)).await;
    let bye = harness.request_to(far(), "BYE").await;
    harness.from_far(far_response(&bye, 200, None)).await;
    harness.response_to(ua(), 200, "BYE").await;
    assert_eq!(cdr.open_records(), 0);
    assert_eq!(cdr.limits().domain_count("example.com"), 0);

    harness.transport.clear();
    let mut third = invite("call-c");
    third.set_header(names::VIA, "SIP/2.0/UDP 203.0.113.5:5060;branch=z9hG4bKua-invite-c");
    harness.from_ua(third).await;
    let forwarded = harness.request_to(far(), "INVITE").await;
    assert_eq!(forwarded.call_id(), Some("call-c"));
    harness.sbc.stop().await.unwrap();
}
