// src/config.rs
use std::env;
use std::path::PathBuf;

use crate::error::{EmberError, EmberResult};

/// How epoll reports readiness for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Level,
    Edge,
}

/// Whether the reactor performs the read/write syscalls itself before
/// handing off (Proactor) or delegates them to a worker (Reactor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyMode {
    Proactor,
    Reactor,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Asynchronous log sink (queue + drain thread) instead of in-line writes.
    pub log_async: bool,
    /// 0..3 selecting listener,connection trigger modes in {LT,ET}^2.
    pub trigger_mode: u8,
    pub opt_linger: bool,
    pub store_size: usize,
    pub thread_num: usize,
    pub close_log: bool,
    pub mode: ConcurrencyMode,
    /// Static document root.
    pub root: PathBuf,
    /// Connection table size; also the accept ceiling.
    pub max_fd: usize,
    /// Worker queue capacity.
    pub max_request: usize,
    /// Alarm period in seconds; idle connections live 3 periods.
    pub timeslot: u64,
    pub log_path: PathBuf,
    pub log_queue_size: usize,
    pub log_split_lines: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let root = env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("root");
        Self {
            port: 9906,
            log_async: false,
            trigger_mode: 0,
            opt_linger: false,
            store_size: 8,
            thread_num: 8,
            close_log: false,
            mode: ConcurrencyMode::Proactor,
            root,
            max_fd: 65_536,
            max_request: 10_000,
            timeslot: 5,
            log_path: PathBuf::from("./ServerLog/server.log"),
            log_queue_size: 800,
            log_split_lines: 800_000,
        }
    }
}

impl ServerConfig {
    pub fn listener_trigger(&self) -> TriggerMode {
        if self.trigger_mode & 0b10 != 0 {
            TriggerMode::Edge
        } else {
            TriggerMode::Level
        }
    }

    pub fn conn_trigger(&self) -> TriggerMode {
        if self.trigger_mode & 0b01 != 0 {
            TriggerMode::Edge
        } else {
            TriggerMode::Level
        }
    }

    /// Seconds an idle connection is kept before reclamation.
    pub fn idle_deadline(&self) -> u64 {
        3 * self.timeslot
    }

    pub(crate) fn validate(&self) -> EmberResult<()> {
        if self.thread_num == 0 {
            return Err(EmberError::Config("worker count must be positive".into()));
        }
        if self.store_size == 0 {
            return Err(EmberError::Config("store pool size must be positive".into()));
        }
        if self.max_request == 0 {
            return Err(EmberError::Config("work queue capacity must be positive".into()));
        }
        if self.max_fd == 0 {
            return Err(EmberError::Config("fd ceiling must be positive".into()));
        }
        if self.trigger_mode > 3 {
            return Err(EmberError::Config(format!(
                "trigger mode {} out of range 0..=3",
                self.trigger_mode
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_cli_table() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 9906);
        assert!(!cfg.log_async);
        assert_eq!(cfg.trigger_mode, 0);
        assert!(!cfg.opt_linger);
        assert_eq!(cfg.store_size, 8);
        assert_eq!(cfg.thread_num, 8);
        assert!(!cfg.close_log);
        assert_eq!(cfg.mode, ConcurrencyMode::Proactor);
        assert_eq!(cfg.timeslot, 5);
        assert_eq!(cfg.idle_deadline(), 15);
        assert!(cfg.root.ends_with("root"));
    }

    #[test]
    fn trigger_index_splits_into_both_modes() {
        let mut cfg = ServerConfig::default();
        let expected = [
            (TriggerMode::Level, TriggerMode::Level),
            (TriggerMode::Level, TriggerMode::Edge),
            (TriggerMode::Edge, TriggerMode::Level),
            (TriggerMode::Edge, TriggerMode::Edge),
        ];
        for (index, (listener, conn)) in expected.into_iter().enumerate() {
            cfg.trigger_mode = index as u8;
            assert_eq!(cfg.listener_trigger(), listener);
            assert_eq!(cfg.conn_trigger(), conn);
        }
    }

    #[test]
    fn zero_sized_pools_fail_validation() {
        let mut cfg = ServerConfig::default();
        cfg.thread_num = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ServerConfig::default();
        cfg.store_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ServerConfig::default();
        cfg.max_request = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ServerConfig::default();
        cfg.trigger_mode = 4;
        assert!(cfg.validate().is_err());
    }
}
