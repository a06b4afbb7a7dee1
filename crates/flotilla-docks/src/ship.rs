//! Ships: framed byte pipes over one physical transport
//!
//! A ship moves opaque loads of bytes and never interprets them. Transport
//! failures surface as `ShipSunk`, which makes the owning crane abandon.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

use flotilla_core::{Error, Result};

/// Default load size of TCP ships
pub const TCP_LOAD_SIZE: usize = 4096;

/// A duplex framed byte pipe over one physical transport
#[async_trait]
pub trait Ship: Send + Sync {
    /// Write one load of bytes to the transport.
    async fn load(&self, data: &[u8]) -> Result<()>;

    /// Read the next chunk of bytes off the transport.
    async fn unload(&self) -> Result<Vec<u8>>;

    /// Half-close the sending side and release the transport.
    async fn sink(&self);

    /// Whether the transport itself is already encrypted.
    fn is_secure(&self) -> bool;

    /// Whether this side dialed the connection.
    fn is_mine(&self) -> bool;

    /// Preferred maximum size of a single load.
    fn load_size(&self) -> usize;

    /// Loads below this size are worth batching before writing.
    fn optimal_min_load_size(&self) -> usize {
        self.load_size() * 2
    }
}

/// In-memory ship pair for tests
pub struct TestShip {
    secure: bool,
    mine: bool,
    load_size: usize,
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    sunk: AtomicBool,
    counterpart: parking_lot::Mutex<Option<Arc<TestShip>>>,
}

impl TestShip {
    /// Create a ship pair; this end is returned, the other is obtained via
    /// [`TestShip::reverse`].
    pub fn new(secure: bool, load_size: usize) -> Arc<Self> {
        let (a_tx, a_rx) = mpsc::channel(256);
        let (b_tx, b_rx) = mpsc::channel(256);

        let near = Arc::new(Self {
            secure,
            mine: true,
            load_size,
            tx: a_tx,
            rx: Mutex::new(b_rx),
            sunk: AtomicBool::new(false),
            counterpart: parking_lot::Mutex::new(None),
        });
        let far = Arc::new(Self {
            secure,
            mine: false,
            load_size,
            tx: b_tx,
            rx: Mutex::new(a_rx),
            sunk: AtomicBool::new(false),
            counterpart: parking_lot::Mutex::new(None),
        });

        *near.counterpart.lock() = Some(far);
        near
    }

    /// Take the other end of the pair. Panics when taken twice.
    pub fn reverse(&self) -> Arc<TestShip> {
        self.counterpart
            .lock()
            .take()
            .expect("test ship reversed twice")
    }
}

#[async_trait]
impl Ship for TestShip {
    async fn load(&self, data: &[u8]) -> Result<()> {
        if self.sunk.load(Ordering::SeqCst) {
            return Err(Error::ShipSunk("test ship sunk".to_string()));
        }
        self.tx
            .send(data.to_vec())
            .await
            .map_err(|_| Error::ShipSunk("test ship peer gone".to_string()))
    }

    async fn unload(&self) -> Result<Vec<u8>> {
        let mut rx = self.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| Error::ShipSunk("test ship peer gone".to_string()))
    }

    async fn sink(&self) {
        self.sunk.store(true, Ordering::SeqCst);
        let mut rx = self.rx.lock().await;
        rx.close();
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn is_mine(&self) -> bool {
        self.mine
    }

    fn load_size(&self) -> usize {
        self.load_size
    }
}

/// A ship over a plain TCP stream
pub struct TcpShip {
    mine: bool,
    read_half: Mutex<tokio::net::tcp::OwnedReadHalf>,
    write_half: Mutex<tokio::net::tcp::OwnedWriteHalf>,
    sunk: AtomicBool,
}

impl TcpShip {
    fn new(stream: TcpStream, mine: bool) -> Self {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        Self {
            mine,
            read_half: Mutex::new(read_half),
            write_half: Mutex::new(write_half),
            sunk: AtomicBool::new(false),
        }
    }

    /// Wrap a stream accepted from a listener.
    pub fn accept(stream: TcpStream) -> Self {
        Self::new(stream, false)
    }

    /// Dial a peer.
    pub async fn connect(addr: std::net::SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| Error::ShipSunk(format!("failed to dial {addr}: {err}")))?;
        Ok(Self::new(stream, true))
    }
}

#[async_trait]
impl Ship for TcpShip {
    async fn load(&self, data: &[u8]) -> Result<()> {
        if self.sunk.load(Ordering::SeqCst) {
            return Err(Error::ShipSunk("tcp ship sunk".to_string()));
        }
        let mut write_half = self.write_half.lock().await;
        write_half
            .write_all(data)
            .await
            .map_err(|err| Error::ShipSunk(format!("tcp write failed: {err}")))
    }

    async fn unload(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; TCP_LOAD_SIZE];
        let mut read_half = self.read_half.lock().await;
        let n = read_half
            .read(&mut buf)
            .await
            .map_err(|err| Error::ShipSunk(format!("tcp read failed: {err}")))?;
        if n == 0 {
            return Err(Error::ShipSunk("tcp peer closed".to_string()));
        }
        buf.truncate(n);
        Ok(buf)
    }

    async fn sink(&self) {
        self.sunk.store(true, Ordering::SeqCst);
        let mut write_half = self.write_half.lock().await;
        let _ = write_half.shutdown().await;
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn is_mine(&self) -> bool {
        self.mine
    }

    fn load_size(&self) -> usize {
        TCP_LOAD_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ship_pair_moves_bytes() {
        let near = TestShip::new(true, 100);
        let far = near.reverse();

        near.load(b"ahoy").await.unwrap();
        assert_eq!(far.unload().await.unwrap(), b"ahoy");

        far.load(b"ahoy back").await.unwrap();
        assert_eq!(near.unload().await.unwrap(), b"ahoy back");
    }

    #[tokio::test]
    async fn sunk_ship_errors() {
        let near = TestShip::new(true, 100);
        let far = near.reverse();

        near.sink().await;
        assert!(matches!(near.load(b"x").await, Err(Error::ShipSunk(_))));

        // The far end sees the closed pipe on unload.
        drop(near);
        assert!(matches!(far.unload().await, Err(Error::ShipSunk(_))));
    }

    #[tokio::test]
    async fn tcp_ship_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            TcpShip::accept(stream)
        });
        let client = TcpShip::connect(addr).await.unwrap();
        let server = accept.await.unwrap();

        client.load(b"over tcp").await.unwrap();
        assert_eq!(server.unload().await.unwrap(), b"over tcp");

        server.sink().await;
        assert!(matches!(client.unload().await, Err(Error::ShipSunk(_))));
    }
}
