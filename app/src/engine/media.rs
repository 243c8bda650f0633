use std::io::{self, ErrorKind::WouldBlock};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rtp_audio::{Codec, Packetizer, RtpPacket, FRAME_CAPACITY, SAMPLES_PER_FRAME};

use super::{AudioSink, MediaError};
use crate::player::PlaybackSource;
use crate::tasks::task::{self, AppTask, TaskMeta};

const FRAME_INTERVAL: Duration = Duration::from_millis(20);
const RX_BUF_SIZE: usize = 1500;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

struct Transmit {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Outbound G.711 stream of one call.
pub struct RtpStream {
    socket: Arc<UdpSocket>,
    remote: Arc<Mutex<SocketAddr>>,
    codec: Mutex<Codec>,
    ssrc: u32,
    tx: Mutex<Option<Transmit>>,
}

impl RtpStream {
    pub fn new(socket: UdpSocket, remote: SocketAddr, codec: Codec, ssrc: u32) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: Arc::new(socket),
            remote: Arc::new(Mutex::new(remote)),
            codec: Mutex::new(codec),
            ssrc,
            tx: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn remote(&self) -> SocketAddr {
        *lock(&self.remote)
    }

    pub fn codec(&self) -> Codec {
        *lock(&self.codec)
    }

    /// New answer from the peer. A codec change applies to the next
    /// transmission.
    pub fn retarget(&self, remote: SocketAddr, codec: Codec) {
        *lock(&self.remote) = remote;
        *lock(&self.codec) = codec;
    }
}

impl AudioSink for RtpStream {
    fn start_transmit(&self, source: PlaybackSource) -> Result<(), MediaError> {
        let mut tx = lock(&self.tx);
        if tx.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return Err(MediaError::Busy);
        }
        if let Some(done) = tx.take() {
            task::join(done.handle);
        }

        let codec = self.codec();
        let stop = Arc::new(AtomicBool::new(false));
        let sender = RtpTxTask {
            socket: self.socket.clone(),
            remote: self.remote.clone(),
            packetizer: Packetizer::new(codec, self.ssrc, (self.ssrc >> 16) as u16, self.ssrc.rotate_left(7)),
            source,
            stop: stop.clone(),
        };
        let handle = task::start(sender)?;
        log::debug!("RTP TX to {} using {}", self.remote(), codec.encoding_name());
        *tx = Some(Transmit { stop, handle });
        Ok(())
    }

    fn stop_transmit(&self) {
        let Some(tx) = lock(&self.tx).take() else {
            return;
        };
        tx.stop.store(true, Ordering::SeqCst);
        task::join(tx.handle);
    }
}

impl Drop for RtpStream {
    fn drop(&mut self) {
        self.stop_transmit();
    }
}

/// Paces one playback source onto the wire, one packet every 20 ms.
struct RtpTxTask {
    socket: Arc<UdpSocket>,
    remote: Arc<Mutex<SocketAddr>>,
    packetizer: Packetizer,
    source: PlaybackSource,
    stop: Arc<AtomicBool>,
}

impl AppTask for RtpTxTask {
    fn meta(&self) -> TaskMeta {
        TaskMeta {
            name: "rtp-tx",
            stack_bytes: Some(64 * 1024),
        }
    }

    fn into_runner(mut self: Box<Self>) -> Box<dyn FnOnce() + Send + 'static> {
        Box::new(move || {
            self.run();
        })
    }
}

impl RtpTxTask {
    fn run(&mut self) {
        let mut frame = [0i16; SAMPLES_PER_FRAME];
        let mut rx = [0u8; RX_BUF_SIZE];
        let mut sent = 0usize;
        let mut next = Instant::now();

        while !self.stop.load(Ordering::SeqCst) {
            self.learn_peer(&mut rx);

            let n = self.source.read_frame(&mut frame);
            if n == 0 {
                break;
            }
            match self.packetizer.packetize(&frame[..n]) {
                Ok(packet) => {
                    let to = *lock(&self.remote);
                    match self.socket.send_to(&packet, to) {
                        Ok(_) => sent += 1,
                        Err(e) => log::warn!("RTP TX to {to} failed: {e}"),
                    }
                }
                Err(e) => log::warn!("RTP TX: packetize failed: {e:?}"),
            }

            next += FRAME_INTERVAL;
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            } else {
                next = now;
            }
        }
        log::debug!("RTP TX finished after {sent} packets");
    }

    /// Symmetric RTP: send to wherever the peer's media actually comes from.
    fn learn_peer(&mut self, buf: &mut [u8]) {
        loop {
            match self.socket.recv_from(buf) {
                Ok((len, from)) => {
                    if RtpPacket::<FRAME_CAPACITY>::unpack(&buf[..len]).is_err() {
                        continue;
                    }
                    let mut remote = lock(&self.remote);
                    if *remote != from {
                        log::info!("RTP peer moved from {} to {from}", *remote);
                        *remote = from;
                    }
                }
                Err(ref e) if e.kind() == WouldBlock => break,
                Err(e) => {
                    log::debug!("RTP RX: {e}");
                    break;
                }
            }
        }
    }
}
