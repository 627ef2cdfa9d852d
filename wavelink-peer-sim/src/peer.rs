use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

// ---

use wavelink_domain::wire::{self, TYPE_HEARTBEAT, TYPE_TRACEBUF2};
use wavelink_domain::{tracebuf, Frame, FrameDecoder, Logo, OutputUnit};

// ---

use super::PeerSimConfig;

// ---------------------------------------------------------------------------
// ReceivedUnit
// ---------------------------------------------------------------------------

/// One waveform frame as seen by the simulated destination.
#[derive(Debug, Clone)]
pub struct ReceivedUnit {
    // ---
    pub unit: OutputUnit,

    /// Rolling sequence carried by the frame, in ack mode.
    pub ack_seq: Option<u16>,

    /// 0 for the first connection, 1 after the first reconnect, ...
    pub connection: usize,
}

// ---------------------------------------------------------------------------
// PeerStats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct PeerStats {
    // ---
    pub connections: AtomicUsize,
    pub data_frames: AtomicU64,
    pub heartbeats: AtomicU64,
    pub acks_sent: AtomicU64,
    pub resyncs: AtomicU64,
    pub bad_payloads: AtomicU64,
}

// ---------------------------------------------------------------------------
// PeerSim
// ---------------------------------------------------------------------------

/// Simulated destination.  Dropping it stops every task it spawned.
pub struct PeerSim {
    // ---
    units_rx: mpsc::UnboundedReceiver<ReceivedUnit>,
    stats: Arc<PeerStats>,
    local_addr: Option<SocketAddr>,
    task: JoinHandle<()>,
}

// ---

impl PeerSim {
    // ---
    /// Listen on an ephemeral loopback port and serve every connection the
    /// sender makes (for destinations the sender connects out to).
    pub async fn listen(cfg: PeerSimConfig) -> io::Result<Self> {
        // ---
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;
        let (units_tx, units_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(PeerStats::default());

        let task = {
            let stats = Arc::clone(&stats);
            tokio::spawn(async move {
                loop {
                    let (stream, peer) = match listener.accept().await {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!("peer-sim: accept failed: {e}");
                            return;
                        }
                    };
                    let connection = stats.connections.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(%peer, connection, "peer-sim: sender connected");
                    tokio::spawn(serve(
                        stream,
                        cfg.clone(),
                        connection,
                        units_tx.clone(),
                        Arc::clone(&stats),
                    ));
                }
            })
        };

        Ok(Self {
            units_rx,
            stats,
            local_addr: Some(local_addr),
            task,
        })
    }

    // ---

    /// Dial `addr` and keep re-dialling whenever the connection ends (for
    /// destinations the sender accepts from).
    pub async fn connect(addr: SocketAddr, cfg: PeerSimConfig) -> io::Result<Self> {
        // ---
        let (units_tx, units_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(PeerStats::default());

        let task = {
            let stats = Arc::clone(&stats);
            tokio::spawn(async move {
                loop {
                    match TcpStream::connect(addr).await {
                        Ok(stream) => {
                            let connection = stats.connections.fetch_add(1, Ordering::Relaxed);
                            serve(
                                stream,
                                cfg.clone(),
                                connection,
                                units_tx.clone(),
                                Arc::clone(&stats),
                            )
                            .await;
                        }
                        Err(e) => tracing::debug!(%addr, "peer-sim: dial failed: {e}"),
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            })
        };

        Ok(Self {
            units_rx,
            stats,
            local_addr: None,
            task,
        })
    }

    // ---

    /// Listening address (only for [`PeerSim::listen`]).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn stats(&self) -> &PeerStats {
        &self.stats
    }

    /// Next received unit, or `None` if nothing arrives within `wait`.
    pub async fn next_unit(&mut self, wait: Duration) -> Option<ReceivedUnit> {
        tokio::time::timeout(wait, self.units_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Collect `n` units, stopping early if the stream goes quiet for `wait`.
    pub async fn collect(&mut self, n: usize, wait: Duration) -> Vec<ReceivedUnit> {
        // ---
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            match self.next_unit(wait).await {
                Some(unit) => out.push(unit),
                None => break,
            }
        }
        out
    }
}

// ---

impl Drop for PeerSim {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

async fn send(writer: &Mutex<OwnedWriteHalf>, bytes: &[u8]) -> io::Result<()> {
    writer.lock().await.write_all(bytes).await
}

/// Serve one connection until the sender hangs up or the drop cue fires.
async fn serve(
    stream: TcpStream,
    cfg: PeerSimConfig,
    connection: usize,
    units_tx: mpsc::UnboundedSender<ReceivedUnit>,
    stats: Arc<PeerStats>,
) {
    // ---
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));

    let heartbeat = cfg.heartbeat_interval.map(|every| {
        let writer = Arc::clone(&writer);
        let frame = wire::encode_frame(
            Logo::new(cfg.inst, cfg.module, TYPE_HEARTBEAT),
            None,
            cfg.heartbeat_text.as_bytes(),
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if send(&writer, &frame).await.is_err() {
                    return;
                }
            }
        })
    });

    let first = connection == 0;
    let mut decoder = FrameDecoder::new().with_ack_mode(cfg.ack);
    let mut frames = Vec::new();
    let mut data_frames = 0usize;
    let mut buf = vec![0u8; 16 * 1024];

    'conn: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        let before = decoder.resyncs();
        decoder.push(&buf[..n], &mut frames);
        stats
            .resyncs
            .fetch_add(decoder.resyncs() - before, Ordering::Relaxed);

        for frame in frames.drain(..) {
            let (logo, ack_seq, payload) = match frame {
                Frame::Message {
                    logo,
                    ack_seq,
                    payload,
                } => (logo, ack_seq, payload),
                Frame::Ack(_) => continue,
            };

            match logo.msg_type {
                TYPE_HEARTBEAT => {
                    stats.heartbeats.fetch_add(1, Ordering::Relaxed);
                }
                TYPE_TRACEBUF2 => {
                    let unit = match tracebuf::decode(&payload) {
                        Ok(unit) => unit,
                        Err(e) => {
                            tracing::warn!("peer-sim: bad tracebuf: {e}");
                            stats.bad_payloads.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                    };
                    data_frames += 1;
                    stats.data_frames.fetch_add(1, Ordering::Relaxed);
                    let _ = units_tx.send(ReceivedUnit {
                        unit,
                        ack_seq,
                        connection,
                    });

                    let acking = cfg.ack && !(first && cfg.ack_limit.is_some_and(|l| data_frames > l));
                    if let (true, Some(seq)) = (acking, ack_seq) {
                        if send(&writer, &wire::encode_ack(seq)).await.is_err() {
                            break 'conn;
                        }
                        stats.acks_sent.fetch_add(1, Ordering::Relaxed);
                    }

                    if first && cfg.drop_after_frames == Some(data_frames) {
                        tracing::debug!(data_frames, "peer-sim: dropping link on cue");
                        break 'conn;
                    }
                }
                other => tracing::debug!(msg_type = other, "peer-sim: ignoring message"),
            }
        }
    }

    if let Some(task) = heartbeat {
        task.abort();
    }
    // Dropping both halves closes the socket.
}
