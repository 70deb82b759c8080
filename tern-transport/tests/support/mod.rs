//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use crossbeam::channel::{self, Receiver, Sender};

use tern_codec::{Codec, I64Codec};
use tern_core::{CodecError, DefaultSocketFactory, SocketFactory, SocketOptions};

pub const INJECTED: &str = "Injected fault";

/// Install a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// A one-shot gate: every `wait` blocks until `open` is called.
#[derive(Clone)]
pub struct Gate {
    open: Arc<parking_lot::Mutex<Option<Sender<()>>>>,
    rx: Receiver<()>,
}

impl Gate {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        Self {
            open: Arc::new(parking_lot::Mutex::new(Some(tx))),
            rx,
        }
    }

    pub fn wait(&self) {
        // Disconnects once the sender is dropped.
        let _ = self.rx.recv();
    }

    pub fn open(&self) {
        self.open.lock().take();
    }
}

/// Which half of a codec fails while faults are switched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOn {
    Never,
    Encode,
    Decode,
}

/// How a [`FaultyCodec`] fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Return a `CodecError`.
    Error,
    /// Panic with the injected message.
    Panic,
}

/// An `i64` codec that fails on demand.
#[derive(Debug, Clone)]
pub struct FaultyCodec {
    fail_on: FailOn,
    kind: FaultKind,
    enabled: Arc<AtomicBool>,
}

impl FaultyCodec {
    pub fn new(fail_on: FailOn, enabled: &Arc<AtomicBool>) -> Self {
        Self::with_kind(fail_on, FaultKind::Error, enabled)
    }

    pub fn with_kind(fail_on: FailOn, kind: FaultKind, enabled: &Arc<AtomicBool>) -> Self {
        Self {
            fail_on,
            kind,
            enabled: enabled.clone(),
        }
    }

    fn failing(&self, op: FailOn) -> bool {
        let failing = self.fail_on == op && self.enabled.load(Ordering::SeqCst);
        if failing && self.kind == FaultKind::Panic {
            panic!("{INJECTED}");
        }
        failing
    }
}

impl Codec for FaultyCodec {
    type Item = i64;

    fn encode(&self, item: &i64, dst: &mut BytesMut) -> Result<(), CodecError> {
        if self.failing(FailOn::Encode) {
            return Err(CodecError::Encode(INJECTED.to_string()));
        }
        I64Codec.encode(item, dst)
    }

    fn decode(&self, src: &[u8]) -> Result<i64, CodecError> {
        if self.failing(FailOn::Decode) {
            return Err(CodecError::Decode(INJECTED.to_string()));
        }
        I64Codec.decode(src)
    }
}

/// A socket factory whose connect or configure step fails on demand.
#[derive(Debug, Clone, Default)]
pub struct FaultyFactory {
    pub fail_connect: Arc<AtomicBool>,
    pub fail_configure: Arc<AtomicBool>,
}

impl SocketFactory for FaultyFactory {
    fn connect(&self, addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(io::Error::other(INJECTED));
        }
        DefaultSocketFactory.connect(addr, timeout)
    }

    fn configure(&self, stream: &TcpStream, options: &SocketOptions) -> io::Result<()> {
        if self.fail_configure.load(Ordering::SeqCst) {
            return Err(io::Error::other(INJECTED));
        }
        DefaultSocketFactory.configure(stream, options)
    }
}

/// Deterministic stand-in for random call values.
pub fn value(worker: usize, call: usize) -> i64 {
    let seed = (((worker as u64) << 32) | call as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    seed as i64
}
