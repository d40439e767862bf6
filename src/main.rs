use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, warn};
use quicfuscate::app_config::AppConfig;
use quicfuscate::connection::{Connection, TlsEngine, TrafficKeys};
use quicfuscate::error::Result;
use quicfuscate::fec::FecMode;
use quicfuscate::fingerprint::{BrowserProfile, FingerprintProfile, OsProfile};
use quicfuscate::fronting::{connection_identity, DomainFronter};
use quicfuscate::telemetry;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::signal;

/// Development default for the TLS/QUIC record layer: a fixed one-byte
/// handshake exchange that always succeeds with a zeroed key schedule. A
/// production deployment swaps this for a real TLS 1.3 implementation behind
/// the same `TlsEngine` trait; nothing in `connection` depends on this stub.
struct PassthroughTlsEngine {
    established: bool,
}

impl PassthroughTlsEngine {
    fn new() -> Self {
        Self { established: false }
    }
}

impl TlsEngine for PassthroughTlsEngine {
    fn build_client_hello(&mut self, profile: &FingerprintProfile, sni: &str) -> Vec<u8> {
        let mut hello = vec![0x16, 0x03, 0x01];
        hello.extend_from_slice(sni.as_bytes());
        hello.extend_from_slice(profile.user_agent.as_bytes());
        hello
    }

    fn consume_server_flight(&mut self, _data: &[u8]) -> Result<()> {
        self.established = true;
        Ok(())
    }

    fn is_established(&self) -> bool {
        self.established
    }

    fn export_traffic_keys(&self) -> Result<TrafficKeys> {
        Ok(TrafficKeys {
            client_key: vec![0u8; 16],
            client_iv: vec![0u8; 16],
            server_key: vec![0u8; 16],
            server_iv: vec![0u8; 16],
        })
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    /// Enable verbose logging
    #[clap(short, long, global = true)]
    verbose: bool,
    /// Enable telemetry metrics endpoint on :9898
    #[clap(long, global = true)]
    telemetry: bool,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connects to a server and sends one masqueraded request
    Client {
        /// The remote server address to connect to
        #[clap(long, required = true)]
        remote: String,

        /// Local UDP address to bind
        #[clap(long, default_value = "0.0.0.0:0")]
        local: String,

        /// Destination host used for masquerading and SNI
        #[clap(long, default_value = "example.com")]
        host: String,

        /// Browser fingerprint profile
        #[clap(long, value_enum, default_value_t = BrowserProfile::Chrome)]
        profile: BrowserProfile,

        /// Operating system for the profile
        #[clap(long, value_enum, default_value_t = OsProfile::Windows)]
        os: OsProfile,

        /// Initial FEC mode
        #[clap(long, value_enum, default_value = "zero")]
        fec_mode: FecMode,

        /// Path to a unified TOML configuration file
        #[clap(long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Domain used for fronting (repeatable)
        #[clap(long, value_delimiter = ',')]
        front_domain: Vec<String>,

        /// List available browser fingerprint profiles and exit
        #[clap(long)]
        list_fingerprints: bool,
    },
    /// Accepts one connection and echoes masqueraded requests back
    Server {
        /// The address to listen on
        #[clap(short, long, default_value = "127.0.0.1:4433")]
        listen: String,

        /// Browser fingerprint profile used for responses
        #[clap(long, value_enum, default_value_t = BrowserProfile::Chrome)]
        profile: BrowserProfile,

        /// Operating system for the profile
        #[clap(long, value_enum, default_value_t = OsProfile::Windows)]
        os: OsProfile,

        /// Path to a unified TOML configuration file
        #[clap(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let cli = Cli::parse();
    if cli.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();
    if cli.telemetry {
        telemetry::serve("0.0.0.0:9898");
    }

    let result = match &cli.command {
        Commands::Client { remote, local, host, profile, os, fec_mode, config, front_domain, list_fingerprints } => {
            if *list_fingerprints {
                for browser in [BrowserProfile::Chrome, BrowserProfile::Firefox, BrowserProfile::Safari, BrowserProfile::Edge] {
                    println!("- {:?}", browser);
                }
                return Ok(());
            }
            run_client(remote, local, host, *profile, *os, *fec_mode, config, front_domain).await
        }
        Commands::Server { listen, profile, os, config } => run_server(listen, *profile, *os, config).await,
    };

    if let Err(e) = result {
        error!("fatal: {}", e);
    }
    if cli.telemetry {
        telemetry::flush();
    }
    Ok(())
}

fn load_config(path: &Option<PathBuf>) -> AppConfig {
    match path {
        Some(p) => match AppConfig::from_file(p) {
            Ok(cfg) => {
                if let Err(e) = cfg.validate() {
                    warn!("config validation failed, using field-level defaults where invalid: {}", e);
                }
                cfg
            }
            Err(e) => {
                error!("failed to load config {}: {}", p.display(), e);
                AppConfig::default()
            }
        },
        None => AppConfig::default(),
    }
}

fn resolve_addr(s: &str) -> std::io::Result<SocketAddr> {
    s.to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "address not found"))
}

async fn run_client(
    remote: &str,
    local: &str,
    host: &str,
    profile: BrowserProfile,
    os: OsProfile,
    fec_mode: FecMode,
    config_path: &Option<PathBuf>,
    front_domain: &[String],
) -> Result<()> {
    let mut cfg = load_config(config_path);
    cfg.fec.initial_mode = fec_mode;
    let server_addr = resolve_addr(remote).map_err(|e| {
        quicfuscate::error::QuicFuscateError::Network(quicfuscate::error::NetworkError::DnsFail(e.to_string()))
    })?;
    let local_addr = resolve_addr(local).map_err(|e| {
        quicfuscate::error::QuicFuscateError::Network(quicfuscate::error::NetworkError::DnsFail(e.to_string()))
    })?;

    let socket = UdpSocket::bind(local_addr)
        .await
        .map_err(|_| quicfuscate::error::QuicFuscateError::Network(quicfuscate::error::NetworkError::SocketUnavailable(local.to_string())))?;

    info!("connecting to {}", server_addr);

    let fronter = if front_domain.is_empty() { None } else { Some(DomainFronter::new(front_domain.to_vec())) };
    let (sni, real_host) = connection_identity(fronter.as_ref(), host);
    let fp = FingerprintProfile::new(profile, os);

    let mut conn = Connection::connect(
        socket,
        PassthroughTlsEngine::new(),
        server_addr,
        real_host,
        sni,
        fp,
        fronter,
        cfg.masquerade.dynamic_table_capacity,
        cfg.mtu.min_mtu,
        cfg.mtu.max_mtu,
        cfg.mtu.step_size,
        cfg.mtu.blackhole_threshold,
    )
    .await?;
    conn.enable_fec(quicfuscate::fec::AdaptiveFec::new(cfg.fec));

    let stream = conn.open_stream();
    conn.write(stream, b"GET / HTTP/3 masqueraded request\n").await?;

    let mut shutdown = Box::pin(signal::ctrl_c());
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received");
                conn.close("ctrl_c").await?;
                break;
            }
            result = conn.read(stream) => {
                let data = result?;
                if !data.is_empty() {
                    info!("received {} bytes", data.len());
                    println!("{}", String::from_utf8_lossy(&data));
                    break;
                }
            }
        }
    }

    info!(
        "bbr state {:?}, pacing {:.0} bps, cwnd {} bytes",
        conn.bbr_controller().state(),
        conn.bbr_controller().pacing_rate_bps(),
        conn.bbr_controller().cwnd_bytes()
    );
    Ok(())
}

async fn run_server(listen: &str, profile: BrowserProfile, os: OsProfile, config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = load_config(config_path);
    let listen_addr = resolve_addr(listen).map_err(|e| {
        quicfuscate::error::QuicFuscateError::Network(quicfuscate::error::NetworkError::DnsFail(e.to_string()))
    })?;
    let socket = UdpSocket::bind(listen_addr)
        .await
        .map_err(|_| quicfuscate::error::QuicFuscateError::Network(quicfuscate::error::NetworkError::SocketUnavailable(listen.to_string())))?;
    info!("listening on {}", listen_addr);

    let mut probe = [0u8; 65536];
    let (_, peer_addr) = socket
        .recv_from(&mut probe)
        .await
        .map_err(|_| quicfuscate::error::QuicFuscateError::Network(quicfuscate::error::NetworkError::Reset))?;
    info!("accepted connection from {}", peer_addr);

    let fp = FingerprintProfile::new(profile, os);
    let mut conn = Connection::connect(
        socket,
        PassthroughTlsEngine::new(),
        peer_addr,
        "server".into(),
        "server".into(),
        fp,
        None,
        cfg.masquerade.dynamic_table_capacity,
        cfg.mtu.min_mtu,
        cfg.mtu.max_mtu,
        cfg.mtu.step_size,
        cfg.mtu.blackhole_threshold,
    )
    .await?;

    let mut shutdown = Box::pin(signal::ctrl_c());
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received");
                conn.close("ctrl_c").await?;
                break;
            }
            _ = conn.poll_once() => {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }
    Ok(())
}
