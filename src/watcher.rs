/*
 * This file is part of raphael-thermal.
 *
 * Copyright (C) 2025 raphael-thermal contributors
 *
 * raphael-thermal is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * raphael-thermal is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with raphael-thermal. If not, see <https://www.gnu.org/licenses/>.
 */

//! Event-driven scheduling of the throttling engine.
//!
//! The watcher thread sleeps until the next sensor is due, a kernel thermal
//! uevent names a watched zone, or someone wakes it.

use std::collections::BTreeSet;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thermal_error::{Result, ThermalError};
use tracing::{debug, error, info, trace, warn};

use crate::constants::timing::SHUTDOWN_POLL;
use crate::constants::uevent::{ALL_GROUPS, MSG_LEN};

/// Wakes a blocked [`EventSource::poll`] from another thread
#[derive(Clone)]
pub struct Waker(Arc<dyn Fn() + Send + Sync>);

impl Waker {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn wake(&self) {
        (self.0)()
    }
}

/// Source of raw uevent datagrams
pub trait EventSource: Send {
    /// Block for at most `timeout`. Returns the datagrams received, which is
    /// empty on timeout or wake-up.
    fn poll(&mut self, timeout: Duration) -> Result<Vec<Vec<u8>>>;

    fn waker(&self) -> Waker;
}

fn last_os_error(what: &str) -> ThermalError {
    ThermalError::Watcher(format!("{what}: {}", io::Error::last_os_error()))
}

/// Kernel uevent multicast socket paired with an eventfd for wake-ups
pub struct UeventSocket {
    sock: OwnedFd,
    wake: Arc<OwnedFd>,
}

impl UeventSocket {
    pub fn open() -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                libc::NETLINK_KOBJECT_UEVENT,
            )
        };
        if fd < 0 {
            return Err(last_os_error("failed to open uevent socket"));
        }
        let sock = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut sa: libc::sockaddr_nl = unsafe { mem::zeroed() };
        sa.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        sa.nl_groups = ALL_GROUPS;
        let rc = unsafe {
            libc::bind(
                sock.as_raw_fd(),
                &sa as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(last_os_error("failed to bind uevent socket"));
        }

        let efd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if efd < 0 {
            return Err(last_os_error("failed to create eventfd"));
        }
        let wake = Arc::new(unsafe { OwnedFd::from_raw_fd(efd) });

        info!("uevent socket opened");
        Ok(Self { sock, wake })
    }

    fn drain(&self) -> Vec<Vec<u8>> {
        let mut msgs = Vec::new();
        let mut buf = [0u8; MSG_LEN];
        loop {
            let mut sa: libc::sockaddr_nl = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
            let n = unsafe {
                libc::recvfrom(
                    self.sock.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                    &mut sa as *mut _ as *mut libc::sockaddr,
                    &mut len,
                )
            };
            if n <= 0 {
                break;
            }
            // Only the kernel (port id 0) is trusted
            if sa.nl_pid != 0 {
                trace!(pid = sa.nl_pid, "ignoring uevent from user space");
                continue;
            }
            let n = n as usize;
            if n >= MSG_LEN {
                warn!(len = n, "dropping oversized uevent");
                continue;
            }
            msgs.push(buf[..n].to_vec());
        }
        msgs
    }

    fn clear_wake(&self) {
        let mut counter = 0u64;
        unsafe {
            libc::read(
                self.wake.as_raw_fd(),
                &mut counter as *mut u64 as *mut libc::c_void,
                mem::size_of::<u64>(),
            );
        }
    }
}

impl EventSource for UeventSocket {
    fn poll(&mut self, timeout: Duration) -> Result<Vec<Vec<u8>>> {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let mut fds = [
            libc::pollfd { fd: self.sock.as_raw_fd(), events: libc::POLLIN, revents: 0 },
            libc::pollfd { fd: self.wake.as_raw_fd(), events: libc::POLLIN, revents: 0 },
        ];
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(ThermalError::Watcher(format!("poll failed: {err}")));
        }

        if fds[1].revents & libc::POLLIN != 0 {
            self.clear_wake();
        }
        if fds[0].revents & libc::POLLIN != 0 {
            return Ok(self.drain());
        }
        Ok(Vec::new())
    }

    fn waker(&self) -> Waker {
        let wake = Arc::clone(&self.wake);
        Waker::new(move || {
            let one = 1u64;
            unsafe {
                libc::write(
                    wake.as_raw_fd(),
                    &one as *const u64 as *const libc::c_void,
                    mem::size_of::<u64>(),
                );
            }
        })
    }
}

/// In-process source fed through a channel. An empty message only wakes.
pub struct ChannelSource {
    rx: Receiver<Vec<u8>>,
    tx: Sender<Vec<u8>>,
}

impl ChannelSource {
    pub fn new() -> (Self, Sender<Vec<u8>>) {
        let (tx, rx) = mpsc::channel();
        (Self { rx, tx: tx.clone() }, tx)
    }
}

impl EventSource for ChannelSource {
    fn poll(&mut self, timeout: Duration) -> Result<Vec<Vec<u8>>> {
        match self.rx.recv_timeout(timeout) {
            Ok(first) => {
                let mut msgs: Vec<Vec<u8>> = std::iter::once(first).chain(self.rx.try_iter()).collect();
                msgs.retain(|m| !m.is_empty());
                Ok(msgs)
            }
            Err(RecvTimeoutError::Timeout) => Ok(Vec::new()),
            Err(RecvTimeoutError::Disconnected) => Err(ThermalError::Watcher("event channel closed".into())),
        }
    }

    fn waker(&self) -> Waker {
        let tx = self.tx.clone();
        Waker::new(move || {
            let _ = tx.send(Vec::new());
        })
    }
}

/// Extract the zone name from a thermal uevent if it is one of `watched`.
///
/// Records are NUL separated. The first `SUBSYSTEM=` record must be
/// `SUBSYSTEM=thermal`; the following `NAME=` record names the zone.
pub fn parse_uevent(msg: &[u8], watched: &BTreeSet<String>) -> Option<String> {
    let mut thermal_event = false;
    for record in msg.split(|&b| b == 0) {
        if record.is_empty() {
            break;
        }
        if let Some(subsystem) = record.strip_prefix(b"SUBSYSTEM=") {
            if subsystem != b"thermal" {
                return None;
            }
            thermal_event = true;
        } else if let Some(name) = record.strip_prefix(b"NAME=") {
            if !thermal_event {
                continue;
            }
            let name = String::from_utf8_lossy(name);
            if watched.contains(name.as_ref()) {
                debug!(sensor = %name, "thermal uevent");
                return Some(name.into_owned());
            }
            return None;
        }
    }
    None
}

/// Background thread driving the engine
pub struct ThermalWatcher {
    watched: BTreeSet<String>,
    stop: Arc<AtomicBool>,
    waker: Option<Waker>,
    handle: Option<JoinHandle<()>>,
}

impl ThermalWatcher {
    pub fn new() -> Self {
        Self {
            watched: BTreeSet::new(),
            stop: Arc::new(AtomicBool::new(false)),
            waker: None,
            handle: None,
        }
    }

    /// Zones whose uevents force an evaluation. Must be called before `start`.
    pub fn register_files_to_watch(&mut self, sensors: &BTreeSet<String>) {
        self.watched.extend(sensors.iter().cloned());
        debug!(count = self.watched.len(), "watching thermal zones");
    }

    pub fn watched(&self) -> &BTreeSet<String> {
        &self.watched
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Spawn the watcher thread. `tick` receives the zones reported since the
    /// previous call and returns how long to sleep.
    pub fn start<S, F>(&mut self, mut source: S, mut tick: F) -> Result<()>
    where
        S: EventSource + 'static,
        F: FnMut(&BTreeSet<String>) -> Duration + Send + 'static,
    {
        if self.handle.is_some() {
            return Err(ThermalError::Watcher("watcher already running".into()));
        }
        self.stop.store(false, Ordering::Release);
        self.waker = Some(source.waker());

        let watched = self.watched.clone();
        let stop = Arc::clone(&self.stop);
        let handle = thread::Builder::new()
            .name("thermal-watcher".into())
            .spawn(move || {
                let mut sleep = Duration::ZERO;
                let mut last_tick = Instant::now();
                let mut triggered = BTreeSet::new();

                while !stop.load(Ordering::Acquire) {
                    let elapsed = last_tick.elapsed();
                    if elapsed < sleep {
                        let msgs = match source.poll(sleep - elapsed) {
                            Ok(m) => m,
                            Err(e) => {
                                error!(error = %e, "uevent poll failed");
                                thread::sleep(SHUTDOWN_POLL);
                                continue;
                            }
                        };
                        if stop.load(Ordering::Acquire) {
                            break;
                        }
                        triggered.extend(msgs.iter().filter_map(|m| parse_uevent(m, &watched)));
                        if !msgs.is_empty() && triggered.is_empty() {
                            continue;
                        }
                    }

                    last_tick = Instant::now();
                    sleep = tick(&triggered);
                    trace!(sleep_ms = sleep.as_millis() as u64, "watcher sleeping");
                    triggered.clear();
                }
                info!("thermal watcher stopped");
            })
            .map_err(|e| ThermalError::Watcher(format!("failed to spawn watcher: {e}")))?;

        self.handle = Some(handle);
        info!("thermal watcher started");
        Ok(())
    }

    /// Force an evaluation now
    pub fn wake(&self) {
        if let Some(w) = &self.waker {
            w.wake();
        }
    }

    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else { return };
        self.stop.store(true, Ordering::Release);
        self.wake();
        if handle.join().is_err() {
            error!("thermal watcher thread panicked");
        }
    }
}

impl Default for ThermalWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThermalWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
