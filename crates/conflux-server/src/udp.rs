//! The datagram engine: a fixed ring of outstanding receives on one
//! UDP socket, a queued send path, and filter-based source checking.
//!
//! While the socket is hosted, `RECEIVE_TARGET` receive workers each
//! keep one receive outstanding; the posted-receive and posted-write
//! counters are maintained across completions and checked to be zero
//! when the engine is torn down.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use conflux_wire::types::MAX_DATAGRAM;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::RelayError;
use crate::filter::Filter;

/// Outstanding receives the engine keeps posted while hosting.
pub const RECEIVE_TARGET: usize = 16;

/// Consumer of received datagrams.
#[async_trait::async_trait]
pub trait DatagramHandler: Send + Sync {
    /// Called once per datagram that passed the source filter.
    async fn handle_datagram(&self, from: SocketAddr, buf: &[u8]);

    /// Called when an asynchronous send fails.
    fn on_send_error(&self, err: RelayError) {
        debug!("datagram send error: {err}");
    }
}

/// Fixed-size receive buffers, recycled between completions.
struct BufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    fn new(buf_size: usize, max_pool_size: usize) -> Self {
        Self {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    fn get(&self) -> BytesMut {
        let mut buf = {
            let mut buffers = self.buffers.lock().expect("pool poisoned");
            buffers.pop().unwrap_or_else(|| {
                trace!("no buffer in pool: allocating");
                BytesMut::with_capacity(self.buf_size)
            })
        };
        buf.resize(self.buf_size, 0);
        buf
    }

    fn put(&self, mut buf: BytesMut) {
        if buf.capacity() != self.buf_size {
            // Grew through reallocation; let it drop.
            return;
        }
        buf.clear();
        let mut buffers = self.buffers.lock().expect("pool poisoned");
        if buffers.len() < buffers.capacity() {
            buffers.push(buf);
        }
    }
}

/// Cloneable handle for submitting datagram sends.
#[derive(Clone)]
pub struct DatagramSender {
    tx: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
}

impl DatagramSender {
    /// Queues one datagram. Sends after the engine unhosts are
    /// silently discarded, matching the transport's delivery promises.
    pub fn send(&self, addr: SocketAddr, buf: Vec<u8>) {
        let _ = self.tx.send((addr, buf));
    }
}

impl std::fmt::Debug for DatagramSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DatagramSender")
    }
}

/// A hosted UDP socket with its receive ring and send queue.
pub struct DatagramEngine {
    local_addr: SocketAddr,
    receives_posted: Arc<AtomicUsize>,
    writes_posted: Arc<AtomicUsize>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    send_tx: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
}

impl DatagramEngine {
    /// Binds the socket described by `filter` and starts the receive
    /// ring and the send queue.
    ///
    /// # Errors
    ///
    /// Returns the bind error; nothing is spawned on failure.
    pub async fn host(
        filter: Filter,
        handler: Arc<dyn DatagramHandler>,
    ) -> Result<Self, RelayError> {
        let socket = Arc::new(filter.bind_udp().await?);
        let local_addr = socket.local_addr().map_err(RelayError::Transport)?;

        let pool = Arc::new(BufferPool::new(MAX_DATAGRAM, RECEIVE_TARGET));
        let receives_posted = Arc::new(AtomicUsize::new(0));
        let writes_posted = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let (send_tx, send_rx) = mpsc::unbounded_channel();

        let mut tasks = Vec::with_capacity(RECEIVE_TARGET + 1);
        tasks.push(tokio::spawn(send_loop(
            Arc::clone(&socket),
            send_rx,
            Arc::clone(&writes_posted),
            Arc::clone(&handler),
            cancel.clone(),
        )));
        for _ in 0..RECEIVE_TARGET {
            tasks.push(tokio::spawn(receive_loop(
                Arc::clone(&socket),
                filter.clone(),
                Arc::clone(&pool),
                Arc::clone(&handler),
                Arc::clone(&receives_posted),
                cancel.clone(),
            )));
        }

        debug!(%local_addr, "datagram engine hosted");
        Ok(Self {
            local_addr,
            receives_posted,
            writes_posted,
            cancel,
            tasks,
            send_tx,
        })
    }

    /// The bound local address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle for queuing sends.
    #[must_use]
    pub fn sender(&self) -> DatagramSender {
        DatagramSender {
            tx: self.send_tx.clone(),
        }
    }

    /// Receives currently outstanding; at most [`RECEIVE_TARGET`].
    #[must_use]
    pub fn receives_posted(&self) -> usize {
        self.receives_posted.load(Ordering::SeqCst)
    }

    /// Sends currently in flight.
    #[must_use]
    pub fn writes_posted(&self) -> usize {
        self.writes_posted.load(Ordering::SeqCst)
    }

    /// Stops issuing receives, drains in-flight work, releases the
    /// socket. The counters must be back at zero once everything has
    /// drained.
    ///
    /// # Panics
    ///
    /// Panics if a posted receive or send leaked through teardown.
    pub async fn unhost(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        assert_eq!(
            self.receives_posted.load(Ordering::SeqCst),
            0,
            "posted receive leaked through teardown"
        );
        assert_eq!(
            self.writes_posted.load(Ordering::SeqCst),
            0,
            "posted send leaked through teardown"
        );
        debug!(local_addr = %self.local_addr, "datagram engine unhosted");
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    filter: Filter,
    pool: Arc<BufferPool>,
    handler: Arc<dyn DatagramHandler>,
    receives_posted: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    loop {
        let mut buf = pool.get();
        receives_posted.fetch_add(1, Ordering::SeqCst);
        let completion = tokio::select! {
            () = cancel.cancelled() => None,
            r = socket.recv_from(&mut buf[..]) => Some(r),
        };
        receives_posted.fetch_sub(1, Ordering::SeqCst);

        match completion {
            None => {
                pool.put(buf);
                return;
            }
            Some(Err(e)) => {
                pool.put(buf);
                debug!("datagram receive error: {e}");
            }
            Some(Ok((n, from))) => {
                // A source failing the filter is unauthorised datagram
                // traffic; it is dropped without a report so spoofing
                // cannot amplify into error spam.
                if filter.matches_remote(&from) {
                    handler.handle_datagram(from, &buf[..n]).await;
                }
                pool.put(buf);
            }
        }
    }
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    mut send_rx: mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>,
    writes_posted: Arc<AtomicUsize>,
    handler: Arc<dyn DatagramHandler>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            () = cancel.cancelled() => break,
            item = send_rx.recv() => item,
        };
        match item {
            Some((addr, buf)) => send_one(&socket, addr, &buf, &writes_posted, &*handler).await,
            None => return,
        }
    }
    // Drain what was already queued before the cancel landed.
    while let Ok((addr, buf)) = send_rx.try_recv() {
        send_one(&socket, addr, &buf, &writes_posted, &*handler).await;
    }
}

async fn send_one(
    socket: &UdpSocket,
    addr: SocketAddr,
    buf: &[u8],
    writes_posted: &AtomicUsize,
    handler: &dyn DatagramHandler,
) {
    writes_posted.fetch_add(1, Ordering::SeqCst);
    if let Err(e) = socket.send_to(buf, addr).await {
        handler.on_send_error(RelayError::Transport(e));
    }
    writes_posted.fetch_sub(1, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    struct Collector {
        seen: AsyncMutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: AsyncMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl DatagramHandler for Collector {
        async fn handle_datagram(&self, from: SocketAddr, buf: &[u8]) {
            self.seen.lock().await.push((from, buf.to_vec()));
        }
    }

    fn loopback_filter() -> Filter {
        Filter::local_port(0).with_local_ip("127.0.0.1".parse().unwrap())
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within timeout");
    }

    #[tokio::test]
    async fn receive_ring_reaches_target_while_hosting() {
        let engine = DatagramEngine::host(loopback_filter(), Collector::new())
            .await
            .unwrap();
        wait_for(|| engine.receives_posted() == RECEIVE_TARGET).await;
        assert!(engine.receives_posted() <= RECEIVE_TARGET);
        engine.unhost().await;
    }

    #[tokio::test]
    async fn delivers_datagrams_to_the_handler() {
        let collector = Collector::new();
        let engine = DatagramEngine::host(
            loopback_filter(),
            Arc::clone(&collector) as Arc<dyn DatagramHandler>,
        )
        .await
        .unwrap();
        let target = engine.local_addr();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"blast", target).await.unwrap();

        wait_for(|| collector.seen.try_lock().map_or(false, |s| !s.is_empty())).await;
        let seen = collector.seen.lock().await;
        assert_eq!(seen[0].1, b"blast");
        assert_eq!(seen[0].0, client.local_addr().unwrap());
        drop(seen);
        engine.unhost().await;
    }

    #[tokio::test]
    async fn filtered_sources_are_dropped_silently() {
        let allowed = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let blocked = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let collector = Collector::new();
        let filter = loopback_filter().with_remote(allowed.local_addr().unwrap());
        let engine = DatagramEngine::host(filter, Arc::clone(&collector) as Arc<dyn DatagramHandler>)
            .await
            .unwrap();
        let target = engine.local_addr();

        blocked.send_to(b"spoof", target).await.unwrap();
        allowed.send_to(b"legit", target).await.unwrap();

        wait_for(|| collector.seen.try_lock().map_or(false, |s| !s.is_empty())).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = collector.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, b"legit");
        drop(seen);
        engine.unhost().await;
    }

    #[tokio::test]
    async fn send_path_delivers_and_counters_drain() {
        let engine = DatagramEngine::host(loopback_filter(), Collector::new())
            .await
            .unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        engine
            .sender()
            .send(peer.local_addr().unwrap(), b"out".to_vec());

        let mut buf = [0u8; 16];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"out");

        // unhost asserts receives_posted == 0 && writes_posted == 0
        engine.unhost().await;
    }
}
