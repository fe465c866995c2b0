//! Virtual tap interface
//!
//! A [`TapInterface`] is the consumer-facing half of an engine interface: a
//! frame source ([`FrameReader`]) and a frame sink ([`FrameWriter`]).
//!
//! Inbound frames are only queued once somebody listens. Until the source is
//! acquired, and again after every reader has been dropped, frames are
//! discarded so an unattended interface never accumulates memory.

use std::cell::{Cell, RefCell, RefMut};
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Sink, Stream, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{trace, warn};

use crate::engine::InterfaceHandle;
use crate::error::TapError;
use crate::network::{Ipv4Cidr, MacAddress};

/// One link-layer frame
pub type Frame = Bytes;

/// Engine-side operations of an interface, provided by the binding that created it
pub(crate) trait InterfacePort {
    fn send_frame(&self, handle: InterfaceHandle, frame: &[u8]) -> Result<(), TapError>;

    fn mac_address(&self, handle: InterfaceHandle) -> Result<MacAddress, TapError>;

    fn ipv4_address(&self, handle: InterfaceHandle) -> Result<Option<Ipv4Addr>, TapError>;

    fn ipv4_netmask(&self, handle: InterfaceHandle) -> Result<Option<Ipv4Addr>, TapError>;

    fn set_enabled(&self, handle: InterfaceHandle, enabled: bool) -> Result<(), TapError>;
}

/// Receiving side of an interface; only the stack's dispatcher hands frames to it
pub(crate) trait FrameInbox {
    fn deliver(&self, frame: Frame);
}

/// Per-interface frame counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceStats {
    /// Inbound frames queued to at least one reader
    pub frames_received: u64,
    /// Inbound frames discarded (not listening, no reader, or full queues)
    pub frames_dropped: u64,
    /// Outbound frames accepted by the engine
    pub frames_sent: u64,
    /// Outbound frames the engine rejected or that could not be marshaled
    pub send_failures: u64,
}

struct Inner {
    handle: InterfaceHandle,
    port: Weak<dyn InterfacePort>,
    queue_depth: usize,
    listening: Cell<bool>,
    detached: Cell<bool>,
    readers: RefCell<Vec<mpsc::Sender<Frame>>>,
    stats: Cell<InterfaceStats>,
}

/// A virtual network interface backed by the engine
///
/// Cloning yields another handle to the same interface. Inbound frames only
/// ever come from the engine; there is no public way to inject one:
///
/// ```compile_fail
/// use tap_bridge::iface::interface::FrameInbox;
/// ```
#[derive(Clone)]
pub struct TapInterface {
    inner: Rc<Inner>,
}

impl TapInterface {
    pub(crate) fn new(
        handle: InterfaceHandle,
        port: Weak<dyn InterfacePort>,
        queue_depth: usize,
    ) -> Self {
        TapInterface {
            inner: Rc::new(Inner {
                handle,
                port,
                queue_depth,
                listening: Cell::new(false),
                detached: Cell::new(false),
                readers: RefCell::new(Vec::new()),
                stats: Cell::new(InterfaceStats::default()),
            }),
        }
    }

    pub fn handle(&self) -> InterfaceHandle {
        self.inner.handle
    }

    /// Whether both values refer to the same interface object
    pub fn same_as(&self, other: &TapInterface) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening.get()
    }

    /// False once the interface was removed or its stack dropped
    pub fn is_attached(&self) -> bool {
        !self.inner.detached.get() && self.inner.port.strong_count() > 0
    }

    pub fn stats(&self) -> InterfaceStats {
        self.inner.stats.get()
    }

    fn port(&self) -> Result<Rc<dyn InterfacePort>, TapError> {
        if self.inner.detached.get() {
            return Err(TapError::Detached);
        }
        self.inner.port.upgrade().ok_or(TapError::Detached)
    }

    fn update_stats(&self, update: impl FnOnce(&mut InterfaceStats)) {
        let mut stats = self.inner.stats.get();
        update(&mut stats);
        self.inner.stats.set(stats);
    }

    /// MAC address as currently configured in the engine
    pub fn mac_address(&self) -> Result<MacAddress, TapError> {
        self.port()?.mac_address(self.handle())
    }

    pub fn ipv4_address(&self) -> Result<Option<Ipv4Addr>, TapError> {
        self.port()?.ipv4_address(self.handle())
    }

    pub fn ipv4_netmask(&self) -> Result<Option<Ipv4Addr>, TapError> {
        self.port()?.ipv4_netmask(self.handle())
    }

    /// Address and prefix length, `None` unless both address and netmask are set
    pub fn ipv4_cidr(&self) -> Result<Option<Ipv4Cidr>, TapError> {
        let port = self.port()?;
        let address = port.ipv4_address(self.handle())?;
        let netmask = port.ipv4_netmask(self.handle())?;
        match (address, netmask) {
            (Some(address), Some(netmask)) => Ok(Some(Ipv4Cidr::from_netmask(address, netmask)?)),
            _ => Ok(None),
        }
    }

    pub fn enable(&self) -> Result<(), TapError> {
        self.port()?.set_enabled(self.handle(), true)
    }

    pub fn disable(&self) -> Result<(), TapError> {
        self.port()?.set_enabled(self.handle(), false)
    }

    /// Hand one frame to the engine, propagating any failure
    ///
    /// [`FrameWriter`] is the non-failing variant.
    pub fn send(&self, frame: &[u8]) -> Result<(), TapError> {
        let result = self
            .port()
            .and_then(|port| port.send_frame(self.handle(), frame));
        self.update_stats(|stats| match result {
            Ok(()) => stats.frames_sent += 1,
            Err(_) => stats.send_failures += 1,
        });
        result
    }

    pub fn writer(&self) -> FrameWriter {
        FrameWriter {
            iface: self.clone(),
        }
    }

    /// Acquire the frame source
    ///
    /// Fails with [`TapError::AlreadyListening`] while an earlier reader is alive.
    pub fn reader(&self) -> Result<FrameReader, TapError> {
        let mut readers = self.claim()?;
        Ok(self.open_reader(&mut readers))
    }

    /// Iterate over inbound frames; equivalent to [`TapInterface::reader`]
    ///
    /// The stream ends only when the interface is removed or its stack dropped.
    pub fn frames(&self) -> Result<FrameReader, TapError> {
        self.reader()
    }

    /// Acquire the frame source once and split it into two readers that both
    /// observe every frame
    pub fn tee(&self) -> Result<(FrameReader, FrameReader), TapError> {
        let mut readers = self.claim()?;
        let first = self.open_reader(&mut readers);
        let second = self.open_reader(&mut readers);
        Ok((first, second))
    }

    /// Acquire the frame source now and forward every frame into `sink`
    ///
    /// The returned future completes when the source ends or the sink fails.
    pub fn pipe_to<S>(
        &self,
        sink: S,
    ) -> Result<impl Future<Output = Result<(), S::Error>>, TapError>
    where
        S: Sink<Frame>,
    {
        let reader = self.reader()?;
        Ok(reader.map(Ok::<Frame, S::Error>).forward(sink))
    }

    fn claim(&self) -> Result<RefMut<'_, Vec<mpsc::Sender<Frame>>>, TapError> {
        if self.inner.detached.get() {
            return Err(TapError::Detached);
        }
        let mut readers = self.inner.readers.borrow_mut();
        readers.retain(|tx| !tx.is_closed());
        if !readers.is_empty() {
            return Err(TapError::AlreadyListening);
        }
        self.inner.listening.set(true);
        Ok(readers)
    }

    fn open_reader(&self, readers: &mut Vec<mpsc::Sender<Frame>>) -> FrameReader {
        let (tx, rx) = mpsc::channel(self.inner.queue_depth);
        readers.push(tx);
        FrameReader {
            handle: self.handle(),
            rx,
        }
    }

    /// Close all readers and refuse further engine calls
    pub(crate) fn detach(&self) {
        self.inner.detached.set(true);
        self.inner.readers.borrow_mut().clear();
    }
}

impl FrameInbox for TapInterface {
    fn deliver(&self, frame: Frame) {
        let handle = self.handle();
        if !self.inner.listening.get() {
            trace!(%handle, len = frame.len(), "not listening, dropping frame");
            self.update_stats(|stats| stats.frames_dropped += 1);
            return;
        }

        let mut readers = self.inner.readers.borrow_mut();
        readers.retain(|tx| !tx.is_closed());
        let mut queued = false;
        for tx in readers.iter() {
            match tx.try_send(frame.clone()) {
                Ok(()) => queued = true,
                Err(TrySendError::Full(_)) => {
                    warn!(%handle, len = frame.len(), "reader queue full, dropping frame");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        drop(readers);

        if queued {
            trace!(%handle, len = frame.len(), "frame queued");
            self.update_stats(|stats| stats.frames_received += 1);
        } else {
            self.update_stats(|stats| stats.frames_dropped += 1);
        }
    }
}

impl fmt::Debug for TapInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TapInterface")
            .field("handle", &self.handle())
            .field("listening", &self.is_listening())
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Frame source of an interface
///
/// Frames arrive in the order the engine emitted them. Dropping the reader
/// stops buffering for the interface.
#[derive(Debug)]
pub struct FrameReader {
    handle: InterfaceHandle,
    rx: mpsc::Receiver<Frame>,
}

impl FrameReader {
    pub fn handle(&self) -> InterfaceHandle {
        self.handle
    }

    /// Next frame, or `None` once the interface is gone and the queue is drained
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Next frame if one is already queued
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }
}

impl Stream for FrameReader {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        self.rx.poll_recv(cx)
    }
}

/// Frame sink of an interface
///
/// Send failures are logged and counted in [`InterfaceStats::send_failures`];
/// they never reach the writer and never close the sink.
#[derive(Debug, Clone)]
pub struct FrameWriter {
    iface: TapInterface,
}

impl FrameWriter {
    pub fn write(&self, frame: &[u8]) {
        if let Err(err) = self.iface.send(frame) {
            warn!(
                handle = %self.iface.handle(),
                len = frame.len(),
                error = %err,
                "engine did not accept frame, dropping it"
            );
        }
    }
}

impl Sink<Frame> for FrameWriter {
    type Error = Infallible;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, frame: Frame) -> Result<(), Infallible> {
        self.write(&frame);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }
}
