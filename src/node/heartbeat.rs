//! Storage node liveness announcements to the master.

use std::net::SocketAddr;

use crate::master::NodeMsg;
use crate::utils::{tcp_connect_with_timeout, write_framed, DfsError};

use rand::prelude::*;

use tokio::io::AsyncWriteExt;
use tokio::time::{self, Duration, Instant};

/// Every this many beats a `REGISTER` is sent in place of a `HEARTBEAT`, so
/// that a node the master has evicted (or a restarted master) picks it up
/// again. Re-registering a live node only refreshes it.
const REREGISTER_EVERY: u64 = 10;

/// Sends `REGISTER` until one gets through, then a `HEARTBEAT` every
/// interval (plus a random jitter so that nodes started together spread
/// out), with a periodic `REGISTER` mixed in. Failed sends are swallowed and
/// retried at the next beat.
pub(crate) struct Heartbeater {
    /// My node ID.
    me: String,

    /// Port my chunk server listens on.
    chunk_port: u16,

    /// Master's node-facing address.
    master_addr: SocketAddr,

    send_interval: Duration,
    send_jitter: Duration,
    io_timeout: Duration,

    /// True once a `REGISTER` has been delivered.
    registered: bool,

    /// Number of beats delivered since the last `REGISTER`.
    beats_since_register: u64,

    /// Deadline of the next beat.
    next_beat: Instant,
}

impl Heartbeater {
    /// Creates a new heartbeater. The first beat is due immediately.
    pub(crate) fn new_and_setup(
        me: String,
        chunk_port: u16,
        master_addr: SocketAddr,
        send_interval: Duration,
        send_jitter: Duration,
        io_timeout: Duration,
    ) -> Result<Self, DfsError> {
        if send_interval.is_zero() {
            return logged_err!(
                "invalid heartbeat send_interval {:?}",
                send_interval
            );
        }
        Ok(Heartbeater {
            me,
            chunk_port,
            master_addr,
            send_interval,
            send_jitter,
            io_timeout,
            registered: false,
            beats_since_register: 0,
            next_beat: Instant::now(),
        })
    }

    /// Has a `REGISTER` been delivered yet?
    pub(crate) fn registered(&self) -> bool {
        self.registered
    }

    /// Waits until the next beat is due. Typically, this should be used as a
    /// branch of a `tokio::select!`.
    pub(crate) async fn tick(&self) {
        time::sleep_until(self.next_beat).await;
    }

    /// Sends one beat and schedules the next.
    pub(crate) async fn beat(&mut self) {
        let reregister = self.beats_since_register + 1 >= REREGISTER_EVERY;
        let msg = if self.registered && !reregister {
            NodeMsg::Heartbeat {
                node: self.me.clone(),
            }
        } else {
            NodeMsg::Register {
                node: self.me.clone(),
                chunk_port: self.chunk_port,
            }
        };

        match self.send(&msg).await {
            Ok(()) => match msg {
                NodeMsg::Register { .. } => {
                    if !self.registered {
                        pf_info!(
                            "registered with master '{}'",
                            self.master_addr
                        );
                        self.registered = true;
                    }
                    self.beats_since_register = 0;
                }
                NodeMsg::Heartbeat { .. } => self.beats_since_register += 1,
            },
            Err(e) => {
                if self.registered {
                    pf_debug!(
                        "heartbeat to '{}' failed: {}",
                        self.master_addr,
                        e
                    );
                } else {
                    pf_warn!(
                        "registering with '{}' failed, will retry: {}",
                        self.master_addr,
                        e
                    );
                }
            }
        }

        let jitter_ms = self.send_jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        self.next_beat = Instant::now() + self.send_interval + jitter;
    }

    /// Heartbeater thread function. Beats forever; the owner aborts it.
    pub(crate) async fn heartbeat_thread(mut self) {
        pf_debug!("heartbeat thread spawned");
        loop {
            self.tick().await;
            self.beat().await;
        }
    }

    /// Delivers one message on a fresh connection.
    async fn send(&self, msg: &NodeMsg) -> Result<(), DfsError> {
        let mut stream =
            tcp_connect_with_timeout(self.master_addr, self.io_timeout).await?;
        write_framed(&mut stream, &msg.to_string(), None, self.io_timeout)
            .await?;
        time::timeout(self.io_timeout, stream.shutdown()).await??;
        Ok(())
    }
}
