//! Cheap content fingerprints for preview images

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::model::NodeId;

const FNV_OFFSET: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// Number of bytes of a 32x32 RGBA grid
pub const DEFAULT_SAMPLES: usize = 32 * 32 * 4;

pub trait ContentFingerprint: Send + Sync {
    fn fingerprint(&self, data: &[u8]) -> u32;
}

/// FNV-1a over at most `samples` evenly spaced bytes
#[derive(Debug, Clone, Copy)]
pub struct Fnv1a {
    samples: usize,
}

impl Default for Fnv1a {
    fn default() -> Self {
        Self {
            samples: DEFAULT_SAMPLES,
        }
    }
}

impl Fnv1a {
    pub fn with_samples(samples: usize) -> Self {
        Self {
            samples: samples.max(1),
        }
    }
}

pub fn fnv1a(bytes: impl IntoIterator<Item = u8>) -> u32 {
    bytes.into_iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ b as u32).wrapping_mul(FNV_PRIME)
    })
}

impl ContentFingerprint for Fnv1a {
    fn fingerprint(&self, data: &[u8]) -> u32 {
        if data.len() <= self.samples {
            return fnv1a(data.iter().copied());
        }
        let len = data.len();
        let n = self.samples;
        fnv1a((0..n).map(|i| data[i * len / n]))
    }
}

/// Remembers the last fingerprint per node
pub struct PreviewTracker<F: ContentFingerprint = Fnv1a> {
    hasher: F,
    last: Mutex<HashMap<NodeId, u32>>,
}

impl Default for PreviewTracker<Fnv1a> {
    fn default() -> Self {
        Self::new(Fnv1a::default())
    }
}

impl<F: ContentFingerprint> PreviewTracker<F> {
    pub fn new(hasher: F) -> Self {
        Self {
            hasher,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// True when `data` differs from the previous preview of `node`
    pub fn observe(&self, node: &str, data: &[u8]) -> bool {
        let fp = self.hasher.fingerprint(data);
        self.last.lock().insert(node.to_string(), fp) != Some(fp)
    }

    pub fn forget(&self, node: &str) {
        self.last.lock().remove(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_fnv1a_values() {
        assert_eq!(fnv1a(std::iter::empty()), 0x811c_9dc5);
        assert_eq!(fnv1a(b"a".iter().copied()), 0xe40c_292c);
        assert_eq!(fnv1a(b"foobar".iter().copied()), 0xbf9c_f968);
    }

    #[test]
    fn sampling_caps_the_work() {
        let f = Fnv1a::with_samples(4);
        let big: Vec<u8> = (0..=255).collect();
        // indices 0, 64, 128, 192
        assert_eq!(f.fingerprint(&big), fnv1a([0u8, 64, 128, 192]));
        assert_eq!(f.fingerprint(b"ab"), fnv1a(b"ab".iter().copied()));
    }

    #[test]
    fn tracker_reports_changes_per_node() {
        let tracker = PreviewTracker::default();
        assert!(tracker.observe("n1", b"frame-1"));
        assert!(!tracker.observe("n1", b"frame-1"));
        assert!(tracker.observe("n2", b"frame-1"));
        assert!(tracker.observe("n1", b"frame-2"));
        tracker.forget("n1");
        assert!(tracker.observe("n1", b"frame-2"));
    }
}
