//! Mock MR device for integration testing.
//!
//! The device either listens for a dialing master or dials a listening one,
//! records every frame it receives and answers read-signal requests on the
//! all-signals block with a configurable payload.
//!
//! # Example
//!
//! ```ignore
//! use mock_mr_device::{MockMrDevice, MrBehavior};
//!
//! let device = MockMrDevice::listen(MrBehavior::Normal).await.unwrap();
//! device.set_signals(vec![0u8; 64]);
//! // Point an MrMaster at `device.local_addr()`
//! ```

#![allow(dead_code)]

use bytes::{BufMut, BytesMut};
use hmi_plcio::mr::{
    checksum, data_block, function_code, MrHeader, MrTrailer, DEFAULT_END_MARKER,
    DEFAULT_LEADING_MARKER,
};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How the device frames its replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MrBehavior {
    /// Well-formed replies.
    Normal,
    /// Replies end with the wrong end marker.
    BadEndMarker,
    /// Replies start with the wrong leading marker.
    BadLeadingMarker,
    /// Replies carry a checksum off by one.
    BadChecksum,
    /// Never reply.
    Silent,
}

/// A frame received from the master.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFrame {
    pub header: MrHeader,
    pub payload: Vec<u8>,
    pub trailer: MrTrailer,
}

impl ReceivedFrame {
    /// Returns true if the trailer checksum matches the payload.
    pub fn checksum_ok(&self) -> bool {
        checksum(&self.payload) == self.trailer.checksum
    }
}

struct Shared {
    behavior: Mutex<MrBehavior>,
    signals: Mutex<Vec<u8>>,
    received: Mutex<Vec<ReceivedFrame>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    connections: AtomicUsize,
}

/// A mock MR device.
pub struct MockMrDevice {
    local_addr: Option<SocketAddr>,
    shared: Arc<Shared>,
    epoch: watch::Sender<u64>,
    task: JoinHandle<()>,
}

impl MockMrDevice {
    /// Listen on `127.0.0.1:0` for a dialing master.
    pub async fn listen(behavior: MrBehavior) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;
        let shared = Self::shared(behavior);
        let (epoch, _) = watch::channel(0u64);

        let task = tokio::spawn({
            let shared = Arc::clone(&shared);
            let epoch = epoch.subscribe();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    serve(stream, &shared, epoch.clone()).await;
                }
            }
        });

        Ok(Self {
            local_addr: Some(local_addr),
            shared,
            epoch,
            task,
        })
    }

    /// Dial a master listening on `127.0.0.1:port`, redialing whenever the
    /// connection ends.
    pub fn dial(port: u16, behavior: MrBehavior) -> Self {
        let shared = Self::shared(behavior);
        let (epoch, _) = watch::channel(0u64);

        let task = tokio::spawn({
            let shared = Arc::clone(&shared);
            let epoch = epoch.subscribe();
            async move {
                loop {
                    match TcpStream::connect(("127.0.0.1", port)).await {
                        Ok(stream) => serve(stream, &shared, epoch.clone()).await,
                        Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                    }
                }
            }
        });

        Self {
            local_addr: None,
            shared,
            epoch,
            task,
        }
    }

    fn shared(behavior: MrBehavior) -> Arc<Shared> {
        Arc::new(Shared {
            behavior: Mutex::new(behavior),
            signals: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            writer: tokio::sync::Mutex::new(None),
            connections: AtomicUsize::new(0),
        })
    }

    /// Listening address. Panics for a dialing device.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr.expect("dialing device has no listen address")
    }

    pub fn set_behavior(&self, behavior: MrBehavior) {
        *lock(&self.shared.behavior) = behavior;
    }

    /// Payload returned for read-all-signal requests.
    pub fn set_signals(&self, signals: Vec<u8>) {
        *lock(&self.shared.signals) = signals;
    }

    /// Frames received so far.
    pub fn received(&self) -> Vec<ReceivedFrame> {
        lock(&self.shared.received).clone()
    }

    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Send the current signals unprompted.
    pub async fn push_signals(&self) -> io::Result<()> {
        let frame = signals_frame(&self.shared, 0);
        match self.shared.writer.lock().await.as_mut() {
            Some(writer) => writer.write_all(&frame).await,
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no master")),
        }
    }

    /// Close the current connection.
    pub fn hang_up(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
    }
}

impl Drop for MockMrDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

async fn serve(stream: TcpStream, shared: &Shared, mut epoch: watch::Receiver<u64>) {
    epoch.borrow_and_update();
    let (mut reader, writer) = stream.into_split();
    *shared.writer.lock().await = Some(writer);
    shared.connections.fetch_add(1, Ordering::SeqCst);

    loop {
        let frame = tokio::select! {
            _ = epoch.changed() => break,
            frame = read_frame(&mut reader) => frame,
        };
        let Ok(frame) = frame else {
            break;
        };

        let answer = frame.header.function_code == function_code::READ_SIGNAL
            && frame.header.db == data_block::FOR_ALL
            && *lock(&shared.behavior) != MrBehavior::Silent;
        let addr0 = frame.header.addr0;
        lock(&shared.received).push(frame);

        if answer {
            let reply = signals_frame(shared, addr0);
            if let Some(writer) = shared.writer.lock().await.as_mut() {
                if writer.write_all(&reply).await.is_err() {
                    break;
                }
            }
        }
    }

    *shared.writer.lock().await = None;
}

async fn read_frame(reader: &mut tokio::net::tcp::OwnedReadHalf) -> io::Result<ReceivedFrame> {
    let mut header = [0u8; MrHeader::SIZE];
    reader.read_exact(&mut header).await?;
    let header = MrHeader::decode(&header)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

    let mut payload = vec![0u8; usize::from(header.size)];
    reader.read_exact(&mut payload).await?;
    let mut trailer = [0u8; MrTrailer::SIZE];
    reader.read_exact(&mut trailer).await?;

    Ok(ReceivedFrame {
        header,
        payload,
        trailer: MrTrailer {
            checksum: u16::from_be_bytes([trailer[0], trailer[1]]),
            end_marker: u16::from_be_bytes([trailer[2], trailer[3]]),
        },
    })
}

/// A read-signal reply on the all-signals block, framed per the behavior.
fn signals_frame(shared: &Shared, addr0: u16) -> BytesMut {
    let signals = lock(&shared.signals).clone();
    let behavior = *lock(&shared.behavior);

    let leading = if behavior == MrBehavior::BadLeadingMarker {
        b'#'
    } else {
        DEFAULT_LEADING_MARKER
    };
    let mut sum = checksum(&signals);
    if behavior == MrBehavior::BadChecksum {
        sum = sum.wrapping_add(1);
    }
    let end = if behavior == MrBehavior::BadEndMarker {
        0x0A0D
    } else {
        DEFAULT_END_MARKER
    };

    let size = signals.len() as u16;
    let mut frame = BytesMut::new();
    MrHeader {
        leading,
        function_code: function_code::READ_SIGNAL,
        db: data_block::FOR_ALL,
        addr0,
        addrn: addr0 + size.saturating_sub(1),
        size,
    }
    .encode(&mut frame);
    frame.put_slice(&signals);
    frame.put_u16(sum);
    frame.put_u16(end);
    frame
}
