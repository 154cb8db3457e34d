use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use crate::model::{FileKey, LivenessState, LoadingData};

/// Event sink for everything observers care about (UI, CLI, log file).
/// Every method defaults to a no-op so sinks only implement what they show.
pub trait Logger: Send + Sync {
    fn liveness(&self, _node: &str, _from: LivenessState, _to: LivenessState) {}
    fn reconcile_start(&self, _node: &str, _root: &str) {}
    fn reconcile_done(&self, _node: &str, _changed: usize, _added: usize, _removed: usize) {}
    fn placement_added(&self, _node: &str, _key: &FileKey) {}
    fn placement_removed(&self, _node: &str, _key: &FileKey) {}
    fn progress(&self, _node: &str, _key: &FileKey, _loading: &LoadingData) {}
    fn transfer_done(&self, _node: &str, _key: &FileKey, _bytes: u64) {}
    fn error(&self, _context: &str, _subject: &str, _msg: &str) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn liveness(&self, node: &str, from: LivenessState, to: LivenessState) {
        self.line(&format!("LIVENESS node={node} from={from} to={to}"));
    }
    fn reconcile_start(&self, node: &str, root: &str) {
        self.line(&format!("RECONCILE node={node} root={root}"));
    }
    fn reconcile_done(&self, node: &str, changed: usize, added: usize, removed: usize) {
        self.line(&format!(
            "RECONCILED node={node} changed={changed} added={added} removed={removed}"
        ));
    }
    fn placement_added(&self, node: &str, key: &FileKey) {
        self.line(&format!("ADD node={} file={}", node, key));
    }
    fn placement_removed(&self, node: &str, key: &FileKey) {
        self.line(&format!("REMOVE node={} file={}", node, key));
    }
    fn transfer_done(&self, node: &str, key: &FileKey, bytes: u64) {
        self.line(&format!("TRANSFER node={} file={} bytes={}", node, key, bytes));
    }
    fn error(&self, context: &str, subject: &str, msg: &str) {
        self.line(&format!("ERROR ctx={} subject={} msg={}", context, subject, msg));
    }
}

/// Forwards every event to several sinks
pub struct TeeLogger(pub Vec<std::sync::Arc<dyn Logger>>);

impl Logger for TeeLogger {
    fn liveness(&self, node: &str, from: LivenessState, to: LivenessState) {
        self.0.iter().for_each(|l| l.liveness(node, from, to));
    }
    fn reconcile_start(&self, node: &str, root: &str) {
        self.0.iter().for_each(|l| l.reconcile_start(node, root));
    }
    fn reconcile_done(&self, node: &str, changed: usize, added: usize, removed: usize) {
        self.0
            .iter()
            .for_each(|l| l.reconcile_done(node, changed, added, removed));
    }
    fn placement_added(&self, node: &str, key: &FileKey) {
        self.0.iter().for_each(|l| l.placement_added(node, key));
    }
    fn placement_removed(&self, node: &str, key: &FileKey) {
        self.0.iter().for_each(|l| l.placement_removed(node, key));
    }
    fn progress(&self, node: &str, key: &FileKey, loading: &LoadingData) {
        self.0.iter().for_each(|l| l.progress(node, key, loading));
    }
    fn transfer_done(&self, node: &str, key: &FileKey, bytes: u64) {
        self.0.iter().for_each(|l| l.transfer_done(node, key, bytes));
    }
    fn error(&self, context: &str, subject: &str, msg: &str) {
        self.0.iter().for_each(|l| l.error(context, subject, msg));
    }
}
