//! Bridge between a [`TapInterface`] and a kernel TAP device

use std::cell::{Cell, RefCell};
use std::io;
use std::process::Command;
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tun_tap::{Iface, Mode};

use crate::error::TapError;
use crate::network::Ipv4Cidr;

use super::interface::{Frame, TapInterface};

/// Ethernet header, 1500 bytes of payload and one VLAN tag
const HOST_FRAME_BUFFER: usize = 1518;

/// A kernel TAP device carrying raw Ethernet frames
///
/// The device is read by one thread, started by the first [`HostTap::bridge`]
/// and kept for the lifetime of the `HostTap`. It blocks in the kernel read, so
/// after the `HostTap` is dropped it exits on the next frame the host sends.
pub struct HostTap {
    iface: Arc<Iface>,
    inbound: DeviceFrames,
}

/// Frames read from the device, handed to one bridge run at a time
#[derive(Default)]
struct DeviceFrames {
    started: Cell<bool>,
    rx: RefCell<Option<mpsc::Receiver<Frame>>>,
}

/// Exclusive use of [`DeviceFrames`]; gives the receiver back on drop
struct ClaimedFrames<'a> {
    owner: &'a DeviceFrames,
    rx: Option<mpsc::Receiver<Frame>>,
}

impl DeviceFrames {
    /// Take the receiver, starting the reader through `spawn` on first use
    fn claim<F>(&self, queue_depth: usize, spawn: F) -> Result<ClaimedFrames<'_>, TapError>
    where
        F: FnOnce(mpsc::Sender<Frame>) -> io::Result<()>,
    {
        if !self.started.get() {
            let (tx, rx) = mpsc::channel(queue_depth.max(1));
            spawn(tx)?;
            self.started.set(true);
            *self.rx.borrow_mut() = Some(rx);
        }
        let rx = self.rx.borrow_mut().take().ok_or(TapError::AlreadyListening)?;
        Ok(ClaimedFrames {
            owner: self,
            rx: Some(rx),
        })
    }
}

impl ClaimedFrames<'_> {
    async fn recv(&mut self) -> Option<Frame> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

impl Drop for ClaimedFrames<'_> {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            *self.owner.rx.borrow_mut() = Some(rx);
        }
    }
}

impl HostTap {
    /// Open (or create) the TAP device `name`. Usually requires CAP_NET_ADMIN.
    pub fn open(name: &str) -> Result<Self, TapError> {
        let iface = Iface::without_packet_info(name, Mode::Tap)?;
        info!(name = iface.name(), "opened host tap device");
        Ok(HostTap {
            iface: Arc::new(iface),
            inbound: DeviceFrames::default(),
        })
    }

    pub fn name(&self) -> &str {
        self.iface.name()
    }

    /// Assign `cidr` to the host side of the device and bring the link up
    pub fn configure(&self, cidr: &Ipv4Cidr) -> Result<(), TapError> {
        run_ip(&["addr", "add", &cidr.to_string(), "dev", self.name()])?;
        run_ip(&["link", "set", "up", "dev", self.name()])?;
        info!(name = self.name(), %cidr, "host tap device configured");
        Ok(())
    }

    /// Move frames both ways between the device and `tap` until either side closes
    ///
    /// Holds the frame source of `tap` for the whole run. At most `queue_depth`
    /// frames wait for the engine; the depth is fixed by the first run. Frames
    /// the host sends between runs wait for the next one. Fails with
    /// [`TapError::AlreadyListening`] while another run uses this device.
    pub async fn bridge(&self, tap: &TapInterface, queue_depth: usize) -> Result<(), TapError> {
        let mut outbound = tap.reader()?;
        let writer = tap.writer();

        let mut inbound = self.inbound.claim(queue_depth, |tx| {
            let device = Arc::clone(&self.iface);
            thread::Builder::new()
                .name(format!("{}-rx", self.name()))
                .spawn(move || read_device(&device, &tx))
                .map(drop)
        })?;

        debug!(name = self.name(), handle = %tap.handle(), "bridging host tap device");
        loop {
            tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        if let Err(err) = self.iface.send(&frame) {
                            warn!(name = self.name(), error = %err, "host tap write failed");
                        }
                    }
                    None => break,
                },
                frame = inbound.recv() => match frame {
                    Some(frame) => writer.write(&frame),
                    None => break,
                },
            }
        }
        debug!(name = self.name(), handle = %tap.handle(), "bridge closed");
        Ok(())
    }
}

fn read_device(device: &Iface, tx: &mpsc::Sender<Frame>) {
    let mut buf = [0u8; HOST_FRAME_BUFFER];
    loop {
        match device.recv(&mut buf) {
            Ok(len) => {
                if tx.blocking_send(Bytes::copy_from_slice(&buf[..len])).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(name = device.name(), error = %err, "host tap read failed");
                break;
            }
        }
    }
}

fn run_ip(args: &[&str]) -> io::Result<()> {
    let status = Command::new("ip").args(args).status()?;
    if !status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("`ip {}` exited with {status}", args.join(" ")),
        ));
    }
    Ok(())
}
