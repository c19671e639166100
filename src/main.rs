use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn, Span};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use peercam::codec::passthrough::picture_sequence;
use peercam::codec::{
    select_encoder, CodecFeeder, DecoderWorker, EncoderConfig, EncoderFactory, EncoderWorker,
    FeederOptions, FrameCodecAdapter, PassthroughDecoderFactory, PassthroughEncoderFactory,
    RawFrame,
};
use peercam::config::{self, AppConfig, ConfigStore, TransportKind};
use peercam::events::{EventBus, SessionEvent};
use peercam::protocol::{PacketTag, RemoteCommand};
use peercam::session::{PeerLink, SessionManager};
use peercam::transport::{
    ChannelMessage, DiscoveryEvent, MemoryNetwork, PeerInfo, PeerRole, RtcTransport, Transport,
};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// peercam command line arguments
#[derive(Parser, Debug)]
#[command(name = "peercam")]
#[command(version, about = "Peer-to-peer live video and photo streaming", long_about = None)]
struct CliArgs {
    /// Config file (default: $PEERCAM_CONFIG or <config dir>/peercam/config.json)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a sender and a receiver in one process over the in-memory network
    Demo {
        /// Frames to stream
        #[arg(long, default_value_t = 90)]
        frames: u64,
        /// Lose every Nth delta picture (0 = no loss)
        #[arg(long, default_value_t = 0)]
        loss_every: usize,
    },
    /// List peers advertising on the local network
    Discover {
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Advertise and accept streams until interrupted
    Receive,
    /// Stream a test pattern to a peer
    Send {
        /// Peer id to connect to
        #[arg(long)]
        peer: String,
        /// Frames to stream (0 = until interrupted)
        #[arg(long, default_value_t = 300)]
        frames: u64,
        /// Send a photo every N frames (0 = only on request)
        #[arg(long, default_value_t = 0)]
        photo_every: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting peercam v{}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.unwrap_or_else(config::default_config_path);
    tracing::info!("Config file: {}", config_path.display());
    let store = ConfigStore::new(&config_path).await?;
    if store.get().node.peer_id.is_empty() {
        let peer_id = uuid::Uuid::new_v4().simple().to_string();
        tracing::info!("Generated peer id {}", peer_id);
        store.update(|c| c.node.peer_id = peer_id).await?;
    }
    let config = store.get();

    match args.command {
        Command::Demo { frames, loss_every } => run_demo(&config, frames, loss_every).await,
        Command::Discover { seconds } => run_discover(&config, seconds).await,
        Command::Receive => run_receive(&config).await,
        Command::Send {
            peer,
            frames,
            photo_every,
        } => run_send(&config, &peer, frames, photo_every).await,
    }
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "peercam=error,webrtc=error",
        LogLevel::Warn => "peercam=warn,webrtc=warn",
        LogLevel::Info => "peercam=info,webrtc=warn",
        LogLevel::Verbose => "peercam=debug,webrtc=warn",
        LogLevel::Debug => "peercam=debug,webrtc=info",
        LogLevel::Trace => "peercam=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

fn local_peer(config: &AppConfig) -> PeerInfo {
    PeerInfo::new(
        config.node.peer_id.clone(),
        config.node.display_name.clone(),
        config.node.role,
    )
}

async fn build_transport(config: &AppConfig) -> anyhow::Result<Arc<dyn Transport>> {
    match config.transport.kind {
        TransportKind::Rtc => {
            let transport = RtcTransport::bind(
                local_peer(config),
                &config.transport,
                config.storage.resource_dir(),
            )
            .await?;
            tracing::info!("Signaling on port {}", transport.signaling_port());
            Ok(Arc::new(transport))
        }
        TransportKind::Memory => {
            anyhow::bail!("the memory transport only connects peers inside one process; use `demo`")
        }
    }
}

fn session_manager(
    config: &AppConfig,
    transport: Arc<dyn Transport>,
    events: Arc<EventBus>,
) -> SessionManager {
    SessionManager::new(
        transport,
        events,
        config.session.clone(),
        Duration::from_millis(config.transport.invite_timeout_ms),
        &Span::current(),
    )
}

fn encoder_factory() -> anyhow::Result<Arc<dyn EncoderFactory>> {
    let factories: Vec<Arc<dyn EncoderFactory>> = vec![Arc::new(PassthroughEncoderFactory)];
    select_encoder(&factories).context("no encoder available")
}

/// Deterministic test-pattern frame
fn test_pattern(config: &EncoderConfig, sequence: u64) -> RawFrame {
    let len = ((config.width * config.height) / 64).max(16) as usize;
    let data: Vec<u8> = (0..len)
        .map(|i| (i as u64).wrapping_mul(31).wrapping_add(sequence) as u8)
        .collect();
    RawFrame::new(data, config.width, config.height, sequence)
}

/// JPEG-shaped placeholder photo
fn test_photo(sequence: u64) -> Bytes {
    let mut data = vec![0xFF, 0xD8, 0xFF, 0xE0];
    data.extend_from_slice(&sequence.to_be_bytes());
    data.extend_from_slice(&[0xFF, 0xD9]);
    Bytes::from(data)
}

/// Log session events until the bus closes
fn log_events(mut rx: broadcast::Receiver<SessionEvent>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!("event: {}", json),
                    Err(e) => warn!("Cannot serialize event: {}", e),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("Event log lagged by {}", n),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Drive the receive pipeline of one link until its stream ends
async fn receive_stream(link: PeerLink, options: FeederOptions) -> anyhow::Result<u64> {
    let mut stream = link
        .take_stream_receiver()
        .context("stream receiver already taken")?;
    let (picture_tx, mut picture_rx) = mpsc::unbounded_channel();
    let feeder = CodecFeeder::new(
        Arc::new(PassthroughDecoderFactory),
        picture_tx,
        options,
        &Span::current(),
    );
    let decoder = Arc::new(DecoderWorker::spawn(feeder, None, &Span::current()));
    let peer = link.peer().id.clone();

    let counter = tokio::spawn(async move {
        let mut pictures = 0u64;
        while let Some(picture) = picture_rx.recv().await {
            pictures += 1;
            if pictures % 30 == 1 {
                info!(
                    "Picture {:?} ({}x{}, key: {})",
                    picture_sequence(&picture),
                    picture.width,
                    picture.height,
                    picture.key
                );
            }
        }
        pictures
    });

    while let Some(message) = stream.recv().await {
        match message {
            ChannelMessage::Data(data) => {
                if let Err(e) = decoder.deliver(data).await {
                    warn!("Decoder stopped: {}", e);
                    break;
                }
            }
            ChannelMessage::Resource { name, path, size } => {
                info!("Stored photo {} ({} bytes) at {}", name, size, path.display());
            }
        }
    }

    let stats = decoder.stats().await?;
    decoder.shutdown().await;
    drop(decoder);
    let pictures = counter.await?;
    info!(
        "Stream from {} ended: {} pictures, stats {}",
        peer,
        pictures,
        serde_json::to_string(&stats)?
    );
    Ok(pictures)
}

/// Stream `frames` test-pattern frames over `link`, answering peer commands
async fn send_stream(
    link: PeerLink,
    config: EncoderConfig,
    frames: u64,
    photo_every: u64,
    mut events: broadcast::Receiver<SessionEvent>,
) -> anyhow::Result<()> {
    let (packet_tx, mut packet_rx) = mpsc::channel(64);
    let encoder = EncoderWorker::spawn(
        encoder_factory()?,
        config.clone(),
        FrameCodecAdapter::new(&Span::current()),
        packet_tx,
        &Span::current(),
    );

    let sender = link.clone();
    let pump = tokio::spawn(async move {
        let mut sent = 0u64;
        while let Some(packet) = packet_rx.recv().await {
            if let Err(e) = sender.send_packet(&packet).await {
                warn!("Send failed, stopping: {}", e);
                break;
            }
            sent += 1;
        }
        sent
    });

    let peer = link.peer().id.clone();
    let mut ticker = tokio::time::interval(Duration::from_secs(1) / config.fps.max(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sequence = 0u64;

    loop {
        if frames > 0 && sequence >= frames {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                if !link.is_connected() {
                    warn!("Link to {} closed", peer);
                    break;
                }
                if !encoder.try_submit(test_pattern(&config, sequence)) {
                    warn!("Encoder busy, frame {} dropped", sequence);
                }
                if photo_every > 0 && sequence > 0 && sequence % photo_every == 0 {
                    let name = format!("photo-{}.jpg", sequence);
                    if let Err(e) = link.send_photo(&name, test_photo(sequence)).await {
                        warn!("Photo {} not sent: {}", name, e);
                    }
                }
                sequence += 1;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::CommandReceived { peer_id, command }) if peer_id == peer => {
                    match command {
                        RemoteCommand::RequestKeyFrame => encoder.request_keyframe().await?,
                        RemoteCommand::CapturePhoto => {
                            let name = format!("capture-{}.jpg", sequence);
                            if let Err(e) = link.send_photo(&name, test_photo(sequence)).await {
                                warn!("Photo {} not sent: {}", name, e);
                            }
                        }
                        RemoteCommand::StopStreaming => {
                            info!("{} asked to stop streaming", peer);
                            break;
                        }
                        other => info!("Ignoring {:?} from {}", other, peer),
                    }
                }
                Ok(SessionEvent::Disconnected { peer_id, reason }) if peer_id == peer => {
                    warn!("Disconnected from {}: {}", peer, reason);
                    break;
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    let stats = encoder.stats().await?;
    encoder.shutdown().await;
    drop(encoder);
    let sent = pump.await?;
    info!(
        "Sent {} packets for {} frames, stats {}",
        sent,
        sequence,
        serde_json::to_string(&stats)?
    );
    Ok(())
}

async fn run_demo(config: &AppConfig, frames: u64, loss_every: usize) -> anyhow::Result<()> {
    let network = MemoryNetwork::with_resource_dir(config.storage.resource_dir());
    let events = Arc::new(EventBus::new());
    log_events(events.subscribe());

    let sender = session_manager(
        config,
        Arc::new(network.join(PeerInfo::new("demo-sender", "Demo sender", PeerRole::Phone))),
        events.clone(),
    );
    let receiver = session_manager(
        config,
        Arc::new(network.join(PeerInfo::new(
            "demo-receiver",
            "Demo receiver",
            PeerRole::Tablet,
        ))),
        events.clone(),
    );
    let mut sender_links = sender.take_established().context("links already taken")?;
    let mut receiver_links = receiver.take_established().context("links already taken")?;
    let mut discovered = events.subscribe();
    receiver.start(true).await?;
    sender.start(true).await?;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match discovered.recv().await {
                Ok(SessionEvent::PeerFound { peer_id, .. }) if peer_id == "demo-receiver" => break,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await
    .context("receiver not discovered")?;

    if loss_every > 0 {
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        network.set_loss(move |data| {
            data.first() == Some(&PacketTag::DeltaPicture.as_byte())
                && counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % loss_every
                    == loss_every - 1
        });
        info!("Losing every {}th delta picture", loss_every);
    }

    sender.connect("demo-receiver").await?;
    let sender_link = tokio::time::timeout(Duration::from_secs(5), sender_links.recv())
        .await
        .context("handshake timed out")?
        .context("session manager stopped")?;
    let receiver_link = tokio::time::timeout(Duration::from_secs(5), receiver_links.recv())
        .await
        .context("handshake timed out")?
        .context("session manager stopped")?;

    let options = FeederOptions {
        orientation_prefix: config.codec.orientation_prefix,
    };
    let receiving = tokio::spawn(receive_stream(receiver_link, options));

    let mut encoder_config = EncoderConfig::from(&config.codec);
    // the demo does not need real-time pacing
    encoder_config.fps = encoder_config.fps.max(240);
    send_stream(sender_link.clone(), encoder_config, frames, 30, events.subscribe()).await?;

    // let the tail of the stream drain before closing
    tokio::time::sleep(Duration::from_millis(200)).await;
    sender_link.close().await;
    let pictures = receiving.await??;
    println!("demo: {} frames sent, {} pictures decoded", frames, pictures);

    sender.shutdown().await;
    receiver.shutdown().await;
    Ok(())
}

async fn run_discover(config: &AppConfig, seconds: u64) -> anyhow::Result<()> {
    let transport = build_transport(config).await?;
    transport.start_advertising().await?;
    let mut discovery = transport.browse().await?;

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = discovery.recv() => match event {
                Some(DiscoveryEvent::Found(peer)) => {
                    println!("found {} ({}, {})", peer.id, peer.display_name, peer.role)
                }
                Some(DiscoveryEvent::Lost(id)) => println!("lost  {}", id),
                None => break,
            },
        }
    }

    transport.shutdown().await;
    Ok(())
}

async fn run_receive(config: &AppConfig) -> anyhow::Result<()> {
    let events = Arc::new(EventBus::new());
    log_events(events.subscribe());
    let manager = session_manager(config, build_transport(config).await?, events);
    let mut links = manager.take_established().context("links already taken")?;
    manager.start(true).await?;
    info!("Waiting for peers as {}", config.node.peer_id);

    let options = FeederOptions {
        orientation_prefix: config.codec.orientation_prefix,
    };
    loop {
        tokio::select! {
            link = links.recv() => match link {
                Some(link) => {
                    info!("Receiving from {}", link.peer().id);
                    let options = options.clone();
                    tokio::spawn(async move {
                        if let Err(e) = receive_stream(link, options).await {
                            warn!("Receive pipeline failed: {}", e);
                        }
                    });
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}

async fn run_send(
    config: &AppConfig,
    peer: &str,
    frames: u64,
    photo_every: u64,
) -> anyhow::Result<()> {
    let events = Arc::new(EventBus::new());
    log_events(events.subscribe());
    let manager = session_manager(config, build_transport(config).await?, events.clone());
    let mut links = manager.take_established().context("links already taken")?;
    let mut found = events.subscribe();
    manager.start(true).await?;

    let wait = Duration::from_millis(config.transport.invite_timeout_ms);
    tokio::time::timeout(wait, async {
        loop {
            match found.recv().await {
                Ok(SessionEvent::PeerFound { peer_id, .. }) if peer_id == peer => break,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await
    .with_context(|| format!("peer {} not found", peer))?;

    manager.connect(peer).await?;
    let link = tokio::time::timeout(wait, async {
        loop {
            tokio::select! {
                link = links.recv() => return link.map(Ok),
                event = found.recv() => match event {
                    Ok(SessionEvent::ConnectionFailed { peer_id, reason }) if peer_id == peer => {
                        let error = anyhow::anyhow!("connection to {} failed: {}", peer, reason);
                        return Some(Err(error));
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    })
    .await
    .context("handshake timed out")?
    .context("session manager stopped")??;
    info!("Streaming to {} ({:?})", peer, link.plan());

    let result = send_stream(
        link.clone(),
        EncoderConfig::from(&config.codec),
        frames,
        photo_every,
        events.subscribe(),
    )
    .await;
    link.close().await;
    manager.shutdown().await;
    result
}
