use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use crate::types::ReceiveTarget;

/// `taskid → origin conversation`, filled when the worker accepts a user
/// message and read when that task's result comes back.
#[derive(Clone, Debug)]
pub struct TaskDirectory {
    ttl_secs: i64,
    entries: Arc<Mutex<HashMap<String, (ReceiveTarget, i64)>>>,
}

impl TaskDirectory {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            ttl_secs,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn remember(&self, taskid: &str, target: ReceiveTarget, now_sec: i64) {
        if taskid.is_empty() {
            return;
        }
        let mut entries = self.entries.lock();
        prune_locked(&mut entries, now_sec, self.ttl_secs);
        entries.insert(taskid.to_string(), (target, now_sec));
    }

    pub fn resolve(&self, taskid: &str, now_sec: i64) -> Option<ReceiveTarget> {
        let mut entries = self.entries.lock();
        prune_locked(&mut entries, now_sec, self.ttl_secs);
        entries.get(taskid).map(|(target, _)| target.clone())
    }

    pub fn forget(&self, taskid: &str) {
        self.entries.lock().remove(taskid);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn prune_locked(entries: &mut HashMap<String, (ReceiveTarget, i64)>, now_sec: i64, ttl: i64) {
    let cutoff = now_sec.saturating_sub(ttl);
    entries.retain(|_, (_, recorded_at)| *recorded_at >= cutoff);
}
