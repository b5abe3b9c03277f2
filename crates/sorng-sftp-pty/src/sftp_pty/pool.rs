//! Bounded set of sftp sessions shared by the transfer manager.
//!
//! The pool itself is plain data. The manager mutates it only while holding
//! its state lock and performs any connect / disconnect outside that lock,
//! so every method here is synchronous.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::sftp_pty::session::SftpSession;
use crate::sftp_pty::types::*;

/// A session currently running one file of work.
pub struct ActiveSlot {
    pub session: Arc<SftpSession>,
    pub work: FileWork,
}

pub struct SessionPool {
    max: usize,
    idle: Vec<Arc<SftpSession>>,
    active: HashMap<String, ActiveSlot>,
}

impl SessionPool {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            idle: Vec::new(),
            active: HashMap::new(),
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.active.len() < self.max
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.active.len(),
            idle: self.idle.len(),
            max: self.max,
        }
    }

    /// Change the limit; returns idle sessions that no longer fit.
    pub fn set_max(&mut self, max: usize) -> Vec<Arc<SftpSession>> {
        self.max = max.max(1);
        self.trim_idle()
    }

    fn trim_idle(&mut self) -> Vec<Arc<SftpSession>> {
        let room = self.max.saturating_sub(self.active.len());
        if self.idle.len() > room {
            self.idle.split_off(room)
        } else {
            Vec::new()
        }
    }

    /// A connected idle session, discarding any that died while parked.
    pub fn take_idle(&mut self) -> Option<Arc<SftpSession>> {
        while let Some(session) = self.idle.pop() {
            if session.is_connected() {
                return Some(session);
            }
            debug!("Dropping dead idle session {}", session.id());
        }
        None
    }

    pub fn activate(&mut self, session: Arc<SftpSession>, work: FileWork) {
        self.active
            .insert(session.id().to_string(), ActiveSlot { session, work });
    }

    pub fn finish(&mut self, session_id: &str) -> Option<ActiveSlot> {
        self.active.remove(session_id)
    }

    /// Park a healthy session if there is room. Returns it when there is not,
    /// so the caller can disconnect it outside the lock.
    pub fn release(&mut self, session: Arc<SftpSession>) -> Option<Arc<SftpSession>> {
        if session.is_connected() && self.idle.len() + self.active.len() < self.max {
            self.idle.push(session);
            None
        } else {
            Some(session)
        }
    }

    /// Remove every active slot working for `transfer_id`.
    pub fn take_transfer(&mut self, transfer_id: &str) -> Vec<ActiveSlot> {
        let ids: Vec<String> = self
            .active
            .iter()
            .filter(|(_, slot)| slot.work.transfer_id == transfer_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.active.remove(&id))
            .collect()
    }

    /// Empty the pool: `(active, idle)`.
    pub fn drain(&mut self) -> (Vec<Arc<SftpSession>>, Vec<Arc<SftpSession>>) {
        let active = self.active.drain().map(|(_, slot)| slot.session).collect();
        let idle = std::mem::take(&mut self.idle);
        (active, idle)
    }
}
