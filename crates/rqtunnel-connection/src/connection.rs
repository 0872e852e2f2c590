//! Managed TCP connection with optional stream encryption and half-close
//!
//! A [`ManagedConnection`] owns one socket. Reads are decrypted and writes
//! encrypted when the connection is [`Transform::Ciphered`]. The read and
//! write directions can be shut down independently, and both operations are
//! idempotent.

use rqtunnel_cipher::{Cipher, CipherSpec, Decryptor, Encryptor};
use socket2::SockRef;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

/// Byte transform applied to a connection
#[derive(Debug)]
pub enum Transform {
    /// Bytes pass through untouched (local legs)
    Plain,
    /// Bytes are encrypted on write and decrypted on read (the protected leg)
    Ciphered(Cipher),
}

impl Transform {
    /// Transform for the protected leg under `spec`.
    ///
    /// The `none` method maps to [`Transform::Plain`] so no keystream runs.
    pub fn protected(spec: &CipherSpec) -> Self {
        if spec.is_identity() {
            Transform::Plain
        } else {
            Transform::Ciphered(spec.new_cipher())
        }
    }

    pub fn is_ciphered(&self) -> bool {
        matches!(self, Transform::Ciphered(_))
    }

    fn into_halves(self) -> (Option<Encryptor>, Option<Decryptor>) {
        match self {
            Transform::Plain => (None, None),
            Transform::Ciphered(cipher) => {
                let (encryptor, decryptor) = cipher.into_split();
                (Some(encryptor), Some(decryptor))
            }
        }
    }
}

/// Close bookkeeping shared by the two halves of one socket
#[derive(Debug)]
struct CloseState {
    peer: Option<SocketAddr>,
    read_closed: AtomicBool,
    write_closed: AtomicBool,
    released: AtomicBool,
}

impl CloseState {
    /// Log the release once both directions are down.
    fn half_closed(&self) {
        let both = self.read_closed.load(Ordering::Acquire)
            && self.write_closed.load(Ordering::Acquire);
        if both
            && self
                .released
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            debug!(peer = ?self.peer, "Connection fully closed");
        }
    }
}

/// Read direction of a managed connection
#[derive(Debug)]
pub struct ConnReader {
    half: OwnedReadHalf,
    decryptor: Option<Decryptor>,
    state: Arc<CloseState>,
}

impl ConnReader {
    /// Read and decrypt. Returns `Ok(0)` at EOF or after [`close_read`](Self::close_read).
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_read_closed() {
            return Ok(0);
        }
        let n = self.half.read(buf).await?;
        self.decrypt(&mut buf[..n]);
        Ok(n)
    }

    /// Wait until the socket has data, EOF or an error pending.
    pub async fn readable(&self) -> io::Result<()> {
        self.half.readable().await
    }

    /// Non-blocking read; `WouldBlock` when nothing is pending.
    pub fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_read_closed() {
            return Ok(0);
        }
        let n = self.half.try_read(buf)?;
        self.decrypt(&mut buf[..n]);
        Ok(n)
    }

    fn decrypt(&mut self, buf: &mut [u8]) {
        if let Some(decryptor) = self.decryptor.as_mut() {
            decryptor.decrypt(buf);
        }
    }

    /// Shut down the read half. Calling it again is a no-op.
    pub fn close_read(&mut self) -> io::Result<()> {
        if self.state.read_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = match SockRef::from(self.half.as_ref()).shutdown(Shutdown::Read) {
            // Peer already gone, nothing left to shut down
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        };
        self.state.half_closed();
        result
    }

    pub fn is_read_closed(&self) -> bool {
        self.state.read_closed.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.state.peer
    }
}

/// Write direction of a managed connection
#[derive(Debug)]
pub struct ConnWriter {
    half: OwnedWriteHalf,
    encryptor: Option<Encryptor>,
    state: Arc<CloseState>,
}

impl ConnWriter {
    /// Encrypt `buf` in place and write all of it.
    ///
    /// On a ciphered connection `buf` holds ciphertext afterwards. Writing
    /// after [`close_write`](Self::close_write) fails with `BrokenPipe`.
    pub async fn write_all(&mut self, buf: &mut [u8]) -> io::Result<()> {
        if self.is_write_closed() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write half already closed",
            ));
        }
        if let Some(encryptor) = self.encryptor.as_mut() {
            encryptor.encrypt(buf);
        }
        self.half.write_all(buf).await
    }

    /// Shut down the write half, sending EOF to the peer. Calling it again is a no-op.
    pub async fn close_write(&mut self) -> io::Result<()> {
        if self.state.write_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = match self.half.shutdown().await {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        };
        self.state.half_closed();
        result
    }

    pub fn is_write_closed(&self) -> bool {
        self.state.write_closed.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.state.peer
    }
}

/// One socket plus its optional cipher
///
/// The socket is released when both halves have been dropped.
#[derive(Debug)]
pub struct ManagedConnection {
    reader: ConnReader,
    writer: ConnWriter,
}

impl ManagedConnection {
    pub fn new(stream: TcpStream, transform: Transform) -> Self {
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let (encryptor, decryptor) = transform.into_halves();

        let state = Arc::new(CloseState {
            peer,
            read_closed: AtomicBool::new(false),
            write_closed: AtomicBool::new(false),
            released: AtomicBool::new(false),
        });

        Self {
            reader: ConnReader {
                half: read_half,
                decryptor,
                state: state.clone(),
            },
            writer: ConnWriter {
                half: write_half,
                encryptor,
                state,
            },
        }
    }

    /// Plaintext connection (local legs)
    pub fn plain(stream: TcpStream) -> Self {
        Self::new(stream, Transform::Plain)
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf).await
    }

    pub async fn write_all(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.writer.write_all(buf).await
    }

    pub async fn close_write(&mut self) -> io::Result<()> {
        self.writer.close_write().await
    }

    pub fn close_read(&mut self) -> io::Result<()> {
        self.reader.close_read()
    }

    pub fn is_read_closed(&self) -> bool {
        self.reader.is_read_closed()
    }

    pub fn is_write_closed(&self) -> bool {
        self.writer.is_write_closed()
    }

    /// True once both directions have been shut down
    pub fn is_closed(&self) -> bool {
        self.reader.state.released.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.reader.peer_addr()
    }

    pub fn into_split(self) -> (ConnReader, ConnWriter) {
        (self.reader, self.writer)
    }
}
