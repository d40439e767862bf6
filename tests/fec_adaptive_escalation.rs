use quicfuscate::fec::{AdaptiveFec, FecConfig, FecMode};

/// A sudden, saturating loss burst fills the burst-detection window and must
/// trip the emergency override straight to `Extreme`, independent of the
/// PID's normal dwell-time throttling (fec.rs's one documented "emergency"
/// edge case).
#[test]
fn saturating_loss_burst_escalates_directly_to_extreme() {
    let config = FecConfig::default();
    assert_eq!(config.burst_window, 20);
    let mut fec = AdaptiveFec::new(config);
    assert_eq!(fec.current_mode(), FecMode::Zero);

    fec.report_loss(20, 20);
    let mode = fec.retune();

    assert_eq!(mode, FecMode::Extreme);
    assert_eq!(fec.current_mode(), FecMode::Extreme);
}

#[test]
fn no_loss_keeps_mode_at_zero() {
    let mut fec = AdaptiveFec::new(FecConfig::default());
    fec.report_loss(0, 50);
    let mode = fec.retune();
    assert_eq!(mode, FecMode::Zero);
}

/// The codec recovers a single dropped source packet per parity group from
/// the surviving sources and its matching parity packet. `Light` mode's
/// default 16-packet window with a single parity group (17/16 overhead)
/// keeps this concrete and deterministic.
#[test]
fn adaptive_fec_recovers_single_dropped_packet_per_group() {
    let mut config = FecConfig::default();
    config.initial_mode = FecMode::Light;
    let fec = AdaptiveFec::new(config);

    let sources: Vec<Vec<u8>> = (0..16u8).map(|i| vec![i; 8]).collect();
    let parity = fec.encode(&sources).expect("window size matches codec k");

    let mut received: Vec<Option<Vec<u8>>> = sources.iter().cloned().map(Some).collect();
    received[0] = None;
    let parity_opts: Vec<Option<Vec<u8>>> = parity.into_iter().map(Some).collect();

    let recovered = fec.decode(&mut received, &parity_opts);
    assert!(recovered >= 1);
    assert_eq!(received[0], Some(sources[0].clone()));
}
