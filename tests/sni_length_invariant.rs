use quicfuscate::sni;

const SNI_EXTENSION_TYPE: u16 = 0x0000;

/// Builds a minimal well-formed ClientHello-shaped buffer carrying `hostname`
/// as its only extension. Mirrors the fixture `sni` keeps for its own unit
/// tests, rebuilt here since that helper is private to the crate.
fn build_client_hello(hostname: &str) -> Vec<u8> {
    let host = hostname.as_bytes();
    let mut sni_entry = vec![0u8];
    sni_entry.extend_from_slice(&(host.len() as u16).to_be_bytes());
    sni_entry.extend_from_slice(host);

    let mut sni_list = Vec::new();
    sni_list.extend_from_slice(&(sni_entry.len() as u16).to_be_bytes());
    sni_list.extend_from_slice(&sni_entry);

    let mut sni_ext = Vec::new();
    sni_ext.extend_from_slice(&SNI_EXTENSION_TYPE.to_be_bytes());
    sni_ext.extend_from_slice(&(sni_list.len() as u16).to_be_bytes());
    sni_ext.extend_from_slice(&sni_list);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend(std::iter::repeat(0u8).take(32));
    body.push(0);
    body.extend_from_slice(&2u16.to_be_bytes());
    body.extend_from_slice(&[0x13, 0x01]);
    body.push(1);
    body.push(0);
    body.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
    body.extend_from_slice(&sni_ext);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&[0, 0, 0]);
    let hs_len = body.len() as u32;
    handshake[1..4].copy_from_slice(&hs_len.to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

fn record_len(buf: &[u8]) -> usize {
    u16::from_be_bytes(buf[3..5].try_into().unwrap()) as usize
}

/// Chaining front -> pad -> split exercises every length-fixup path in one
/// buffer; the record length field must stay equal to the true payload
/// length after each step (sni.rs's sole documented invariant).
#[test]
fn fronting_then_padding_then_splitting_keeps_record_length_consistent() {
    let ch = build_client_hello("example.com");

    let fronted = sni::front(&ch, "cdn.example.net").unwrap();
    assert_eq!(record_len(&fronted), fronted.len() - 5);

    let target = fronted.len() + 64;
    let padded = sni::pad(&fronted, target).unwrap();
    assert_eq!(padded.len(), target);
    assert_eq!(record_len(&padded), padded.len() - 5);

    let split = sni::split(&padded).unwrap();
    assert_eq!(split.len(), padded.len() + 1);
    assert_eq!(record_len(&split), split.len() - 5);
}

#[test]
fn omit_after_front_leaves_no_sni_extension() {
    let ch = build_client_hello("example.com");
    let fronted = sni::front(&ch, "cdn.example.net").unwrap();
    let omitted = sni::omit(&fronted).unwrap();
    assert_eq!(record_len(&omitted), omitted.len() - 5);
    assert!(sni::omit(&omitted).is_err());
}
