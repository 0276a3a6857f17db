// src/server.rs
//! The reactor: one thread owning the listener, the epoll instance, the
//! fd-indexed connection table, the idle-timer list and the signal
//! self-pipe. Readiness on a connection is dispatched to the worker pool;
//! a periodic SIGALRM, serialized through the self-pipe, drives timer
//! ticks; SIGTERM (or a shutdown handle) stops the loop cooperatively.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use std::net::SocketAddr;

use crate::config::{ConcurrencyMode, ServerConfig, TriggerMode};
use crate::conn::HttpConn;
use crate::error::EmberResult;
use crate::router::Router;
use crate::store::StorePool;
use crate::sync::lock_or_recover;
use crate::syscalls::{self, Epoll, HANGUP_EVENTS, READ_EVENT, WRITE_EVENT};
use crate::timer::{TimerHandle, TimerList};
use crate::worker::{Phase, WorkerPool};

const MAX_EVENT_NUMBER: usize = 10_000;

/// State reachable from worker threads. The connection slots carry their
/// own mutexes; the one-shot rearm discipline keeps them uncontended.
pub(crate) struct Shared {
    pub(crate) epoll: Epoll,
    pub(crate) conns: Vec<Mutex<HttpConn>>,
    pub(crate) user_count: AtomicUsize,
    pub(crate) pipe_wr: i32,
}

pub struct Server {
    cfg: ServerConfig,
    shared: Arc<Shared>,
    pool: WorkerPool,
    listen_fd: i32,
    pipe_rd: i32,
    timers: TimerList,
    timer_slots: Vec<Option<TimerHandle>>,
    reclaim_rx: Receiver<i32>,
}

/// Clonable handle that stops the event loop from another thread by
/// writing the SIGTERM byte into the self-pipe.
#[derive(Clone)]
pub struct ShutdownHandle {
    pipe_wr: i32,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        syscalls::notify_pipe(self.pipe_wr, libc::SIGTERM as u8);
    }
}

impl Server {
    pub fn new(
        cfg: ServerConfig,
        router: Arc<Router>,
        stores: Arc<StorePool>,
    ) -> EmberResult<Self> {
        cfg.validate()?;

        let epoll = Epoll::new()?;
        let listen_fd = syscalls::create_listen_socket(cfg.port, cfg.opt_linger)?;
        epoll.add(listen_fd, READ_EVENT, cfg.listener_trigger(), false)?;

        let (pipe_rd, pipe_wr) = syscalls::create_signal_pipe()?;
        epoll.add(pipe_rd, READ_EVENT, TriggerMode::Level, false)?;
        syscalls::install_signal_handlers(pipe_wr)?;

        let conns = (0..cfg.max_fd)
            .map(|_| Mutex::new(HttpConn::vacant(&cfg.root)))
            .collect();
        let shared = Arc::new(Shared {
            epoll,
            conns,
            user_count: AtomicUsize::new(0),
            pipe_wr,
        });

        let (reclaim_tx, reclaim_rx) = mpsc::channel();
        let pool = WorkerPool::new(
            cfg.mode,
            cfg.thread_num,
            cfg.max_request,
            Arc::clone(&shared),
            router,
            stores,
            reclaim_tx,
        )?;

        let timer_slots = vec![None; cfg.max_fd];
        Ok(Self {
            cfg,
            shared,
            pool,
            listen_fd,
            pipe_rd,
            timers: TimerList::new(),
            timer_slots,
            reclaim_rx,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            pipe_wr: self.shared.pipe_wr,
        }
    }

    pub fn active_users(&self) -> usize {
        self.shared.user_count.load(Ordering::Relaxed)
    }

    /// Block on the event loop until SIGTERM or a fatal epoll error.
    pub fn run(&mut self) -> EmberResult<()> {
        log::info!("listening on 0.0.0.0:{}", self.cfg.port);
        syscalls::schedule_alarm(self.cfg.timeslot);

        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENT_NUMBER];
        let mut timeout = false;
        let mut stop = false;
        while !stop {
            let ready = match self.shared.epoll.wait(&mut events, -1) {
                Ok(n) => n,
                Err(e) => {
                    log::error!("epoll failure: {}", e);
                    return Err(e.into());
                }
            };
            for i in 0..ready {
                let fd = events[i].u64 as i32;
                let flags = events[i].events;
                if fd == self.listen_fd {
                    self.deal_client_data();
                } else if flags & HANGUP_EVENTS != 0 {
                    self.deal_timer(fd);
                } else if fd == self.pipe_rd && flags & READ_EVENT != 0 {
                    self.deal_with_signal(&mut timeout, &mut stop);
                } else if flags & READ_EVENT != 0 {
                    self.deal_with_read(fd);
                } else if flags & WRITE_EVENT != 0 {
                    self.deal_with_write(fd);
                }
            }
            if timeout {
                self.timer_tick();
                timeout = false;
            }
        }
        syscalls::cancel_alarm();
        log::info!("stop signal received, closing listener");
        Ok(())
    }

    /// Accept new clients: once per wake under a level-triggered
    /// listener, drained to exhaustion under edge-triggered.
    fn deal_client_data(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => {
                    let over_table = fd as usize >= self.shared.conns.len();
                    let over_count =
                        self.shared.user_count.load(Ordering::Relaxed) >= self.cfg.max_fd;
                    if over_table || over_count {
                        log::error!("refusing client {}: server busy", peer);
                        syscalls::show_error(fd, "INTERNAL SERVER BUSY");
                        break;
                    }
                    self.register_connection(fd, peer);
                }
                Ok(None) => break,
                Err(e) => {
                    log::error!("accept error: {}", e);
                    break;
                }
            }
            if self.cfg.listener_trigger() == TriggerMode::Level {
                break;
            }
        }
    }

    fn register_connection(&mut self, fd: i32, peer: SocketAddr) {
        {
            let mut conn = lock_or_recover(&self.shared.conns[fd as usize]);
            conn.init(fd, peer, self.cfg.conn_trigger());
        }
        self.shared.user_count.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self
            .shared
            .epoll
            .add(fd, READ_EVENT, self.cfg.conn_trigger(), true)
        {
            log::error!("failed to register fd {}: {}", fd, e);
            lock_or_recover(&self.shared.conns[fd as usize]).close();
            syscalls::close_fd(fd);
            self.shared.user_count.fetch_sub(1, Ordering::Relaxed);
            return;
        }

        let expire = now_secs() + self.cfg.idle_deadline();
        let handle = self.timers.add(expire, fd);
        self.timer_slots[fd as usize] = Some(handle);
        log::info!("accepted client {} on fd {}", peer, fd);
    }

    /// Drain the self-pipe: signal numbers from the handlers plus the
    /// reclaim token workers use to hand a dead connection back.
    fn deal_with_signal(&mut self, timeout: &mut bool, stop: &mut bool) {
        let mut buf = [0u8; 1024];
        match syscalls::recv_bytes(self.pipe_rd, &mut buf) {
            Ok(n) if n > 0 => {
                for &byte in &buf[..n] {
                    if byte == libc::SIGALRM as u8 {
                        *timeout = true;
                    } else if byte == libc::SIGTERM as u8 {
                        *stop = true;
                    } else if byte == syscalls::RECLAIM_TOKEN {
                        self.drain_reclaims();
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                if e.kind() != std::io::ErrorKind::WouldBlock {
                    log::error!("failure draining the signal pipe: {}", e);
                }
            }
        }
    }

    fn drain_reclaims(&mut self) {
        while let Ok(fd) = self.reclaim_rx.try_recv() {
            self.deal_timer(fd);
        }
    }

    fn deal_with_read(&mut self, fd: i32) {
        match self.cfg.mode {
            ConcurrencyMode::Reactor => {
                self.refresh_timer(fd);
                if !self.pool.append(fd, Phase::Read) {
                    log::error!("work queue full, leaving fd {} armed for read", fd);
                    let _ = self
                        .shared
                        .epoll
                        .modify(fd, READ_EVENT, self.cfg.conn_trigger(), true);
                }
            }
            ConcurrencyMode::Proactor => {
                let (ok, peer) = {
                    let mut conn = lock_or_recover(&self.shared.conns[fd as usize]);
                    if !conn.is_open() {
                        return;
                    }
                    (conn.read_once(), conn.peer())
                };
                if ok {
                    log::info!("handling data from client {}", peer);
                    self.refresh_timer(fd);
                    if !self.pool.append_p(fd) {
                        log::error!("work queue full, leaving fd {} armed for read", fd);
                        let _ = self
                            .shared
                            .epoll
                            .modify(fd, READ_EVENT, self.cfg.conn_trigger(), true);
                    }
                } else {
                    self.deal_timer(fd);
                }
            }
        }
    }

    fn deal_with_write(&mut self, fd: i32) {
        match self.cfg.mode {
            ConcurrencyMode::Reactor => {
                self.refresh_timer(fd);
                if !self.pool.append(fd, Phase::Write) {
                    log::error!("work queue full, leaving fd {} armed for write", fd);
                    let _ = self
                        .shared
                        .epoll
                        .modify(fd, WRITE_EVENT, self.cfg.conn_trigger(), true);
                }
            }
            ConcurrencyMode::Proactor => {
                let (ok, peer) = {
                    let mut conn = lock_or_recover(&self.shared.conns[fd as usize]);
                    if !conn.is_open() {
                        return;
                    }
                    (conn.write(&self.shared.epoll), conn.peer())
                };
                if ok {
                    log::debug!("sent data to client {}", peer);
                    self.refresh_timer(fd);
                } else {
                    self.deal_timer(fd);
                }
            }
        }
    }

    /// Push the idle deadline forward on any activity.
    fn refresh_timer(&mut self, fd: i32) {
        if let Some(handle) = self.timer_slots[fd as usize] {
            self.timers.adjust(handle, now_secs() + self.cfg.idle_deadline());
            log::debug!("refreshed idle timer for fd {}", fd);
        }
    }

    /// Unlink the timer and close the connection.
    fn deal_timer(&mut self, fd: i32) {
        if fd as usize >= self.timer_slots.len() {
            return;
        }
        if let Some(handle) = self.timer_slots[fd as usize].take() {
            self.timers.remove(handle);
        }
        self.close_connection(fd);
    }

    fn close_connection(&mut self, fd: i32) {
        let mut conn = lock_or_recover(&self.shared.conns[fd as usize]);
        if !conn.is_open() {
            return;
        }
        conn.close();
        drop(conn);
        let _ = self.shared.epoll.delete(fd);
        syscalls::close_fd(fd);
        self.shared.user_count.fetch_sub(1, Ordering::Relaxed);
        log::info!("close fd {}", fd);
    }

    /// Fire expired timers and rearm the alarm for the next period.
    fn timer_tick(&mut self) {
        let now = now_secs();
        let mut expired = Vec::new();
        self.timers.tick(now, |fd| expired.push(fd));
        for fd in expired {
            self.timer_slots[fd as usize] = None;
            self.close_connection(fd);
        }
        log::info!("timer tick");
        syscalls::schedule_alarm(self.cfg.timeslot);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        for slot in self.shared.conns.iter() {
            let mut conn = lock_or_recover(slot);
            if conn.is_open() {
                let fd = conn.fd();
                conn.close();
                syscalls::close_fd(fd);
            }
        }
        syscalls::close_fd(self.listen_fd);
        syscalls::close_fd(self.pipe_rd);
        syscalls::close_fd(self.shared.pipe_wr);
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
