use quicfuscate::fingerprint::{BrowserProfile, FingerprintProfile, OsProfile};
use quicfuscate::masquerade::MasqueradePipeline;

/// A client-side pipeline wraps a request; a server-side pipeline (with its
/// own independent dynamic table) decodes it back to the same header list
/// and payload, exercising the HEADERS+DATA framing across C3/C4/C8 together.
#[test]
fn wrap_outbound_then_process_inbound_recovers_headers_and_payload() {
    let profile = FingerprintProfile::new(BrowserProfile::Chrome, OsProfile::Windows);
    let mut client = MasqueradePipeline::new(profile.clone(), None, 4096);
    let mut server = MasqueradePipeline::new(profile, None, 4096);

    let stream_id = 0u64;
    let wire = client.wrap_outbound(stream_id, "example.com", "/", b"hello world").unwrap();

    let effect = server.process_inbound(stream_id, &wire).unwrap();
    assert_eq!(effect.data, b"hello world".to_vec());
    let headers = effect.headers.expect("first write carries a HEADERS frame");
    assert!(headers.contains(&(":authority".to_string(), "example.com".to_string())));
    assert!(headers.contains(&(":path".to_string(), "/".to_string())));
}

#[test]
fn second_write_on_same_stream_carries_no_headers_frame() {
    let profile = FingerprintProfile::new(BrowserProfile::Firefox, OsProfile::Linux);
    let mut client = MasqueradePipeline::new(profile.clone(), None, 4096);
    let mut server = MasqueradePipeline::new(profile, None, 4096);

    let stream_id = 0u64;
    let first = client.wrap_outbound(stream_id, "example.com", "/", b"part one").unwrap();
    let second = client.wrap_outbound(stream_id, "example.com", "/", b"part two").unwrap();

    let first_effect = server.process_inbound(stream_id, &first).unwrap();
    assert!(first_effect.headers.is_some());
    let second_effect = server.process_inbound(stream_id, &second).unwrap();
    assert!(second_effect.headers.is_none());
    assert_eq!(second_effect.data, b"part two".to_vec());
}
