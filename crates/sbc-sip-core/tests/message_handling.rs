use sbc_sip_core::header::{self, names};
use sbc_sip_core::{SipMessage, SipUri, Via};

const RESPONSE: &str = "SIP/2.0 183 Session Progress\r\n\
Via: SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bKleg2;rport=5060;received=192.0.2.1\r\n\
From: <sip:alice@example.com>;tag=from1\r\n\
To: <sip:bob@example.com>;tag=to1\r\n\
Call-ID: leg2@sbc\r\n\
CSeq: 2 INVITE\r\n\
Require: 100rel\r\n\
RSeq: 1\r\n\
Contact: <sip:bob@198.51.100.20:5070;transport=udp>\r\n\
Content-Type: application/sdp\r\n\
Content-Length: 5\r\n\
\r\n\
v=0\r\n";

#[test]
fn reliable_provisional_response_is_readable() {
    let response = SipMessage::parse(RESPONSE).unwrap();
    assert!(response.is_response());
    assert!(response.is_1xx_code(183));
    assert!(!response.is_final_response());
    assert!(response.is_mid_dialog());
    assert!(header::has_token(response.header(names::REQUIRE).unwrap(), "100rel"));
    assert_eq!(response.header(names::RSEQ), Some("1"));
    assert_eq!(response.transaction_id(None).unwrap(), "invite2z9hG4bKleg2");

    let via: Via = response.header(names::VIA).unwrap().parse().unwrap();
    assert_eq!(via.rport(), Some(5060));

    let contact: SipUri = header::uri_part(response.header(names::CONTACT).unwrap())
        .parse()
        .unwrap();
    assert_eq!(contact.socket_addr(), Some("198.51.100.20:5070".parse().unwrap()));
    assert_eq!(contact.param("transport"), Some("udp"));
}

#[test]
fn response_to_a_bare_request_is_well_formed() {
    let mut request = SipMessage::request("options", "sip:sbc.example.com");
    request.set_header(names::VIA, "SIP/2.0/TCP 203.0.113.4:5060;branch=z9hG4bKopt");
    request.set_header(names::FROM, "<sip:carol@example.com>;tag=c");
    request.set_header(names::TO, "<sip:sbc.example.com>");
    request.set_header(names::CALL_ID, "carol-1");
    request.set_header(names::CSEQ, "7 OPTIONS");

    let response = request.create_response_with_tag(200, None, Some("sbc")).unwrap();
    let text = response.to_string();
    assert!(text.starts_with("SIP/2.0 200 OK\r\n"));
    assert!(text.contains("To: <sip:sbc.example.com>;tag=sbc\r\n"));
    assert!(text.ends_with("Content-Length: 0\r\n\r\n"));
}
