use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDecision {
    Authorised,
    Queued,
}

/// Node-wide cap on the number of peers served at once. A peer holding a slot
/// may fetch any file it declared interest in; others wait in arrival order.
#[derive(Debug)]
pub struct UploadSlots {
    max_peers: usize,
    active: HashMap<Uuid, HashSet<Uuid>>,
    waiting: VecDeque<(Uuid, Uuid)>,
}

impl UploadSlots {
    pub fn new(max_peers: usize) -> Self {
        Self {
            max_peers: max_peers.max(1),
            active: HashMap::new(),
            waiting: VecDeque::new(),
        }
    }

    pub fn is_authorised(&self, conn: &Uuid, file: &Uuid) -> bool {
        self.active
            .get(conn)
            .map(|files| files.contains(file))
            .unwrap_or(false)
    }

    pub fn request(&mut self, conn: Uuid, file: Uuid) -> SlotDecision {
        if let Some(files) = self.active.get_mut(&conn) {
            files.insert(file);
            return SlotDecision::Authorised;
        }
        if self.active.len() < self.max_peers {
            self.active.entry(conn).or_default().insert(file);
            return SlotDecision::Authorised;
        }
        if !self.waiting.contains(&(conn, file)) {
            self.waiting.push_back((conn, file));
        }
        SlotDecision::Queued
    }

    /// Drops interest in one file; returns the `(conn, file)` pairs that were
    /// granted a slot as a result.
    pub fn release(&mut self, conn: Uuid, file: Uuid) -> Vec<(Uuid, Uuid)> {
        self.waiting.retain(|entry| *entry != (conn, file));
        if let Some(files) = self.active.get_mut(&conn) {
            files.remove(&file);
            if files.is_empty() {
                self.active.remove(&conn);
            }
        }
        self.promote()
    }

    pub fn release_connection(&mut self, conn: Uuid) -> Vec<(Uuid, Uuid)> {
        self.waiting.retain(|(c, _)| *c != conn);
        self.active.remove(&conn);
        self.promote()
    }

    fn promote(&mut self) -> Vec<(Uuid, Uuid)> {
        let mut granted = Vec::new();
        while self.active.len() < self.max_peers {
            let (conn, _) = match self.waiting.front() {
                Some(entry) => *entry,
                None => break,
            };
            let files: Vec<Uuid> = self
                .waiting
                .iter()
                .filter(|(c, _)| *c == conn)
                .map(|(_, f)| *f)
                .collect();
            self.waiting.retain(|(c, _)| *c != conn);
            let slot = self.active.entry(conn).or_default();
            for file in files {
                slot.insert(file);
                granted.push((conn, file));
            }
        }
        granted
    }

    pub fn active_peers(&self) -> Vec<Uuid> {
        self.active.keys().copied().collect()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waiting_peer_promoted_on_release() {
        let mut slots = UploadSlots::new(1);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (f1, f2) = (Uuid::new_v4(), Uuid::new_v4());

        assert_eq!(slots.request(a, f1), SlotDecision::Authorised);
        assert_eq!(slots.request(a, f2), SlotDecision::Authorised);
        assert_eq!(slots.request(b, f1), SlotDecision::Queued);
        assert_eq!(slots.request(b, f2), SlotDecision::Queued);
        assert!(!slots.is_authorised(&b, &f1));

        assert!(slots.release(a, f1).is_empty());
        let granted = slots.release(a, f2);
        assert_eq!(granted, vec![(b, f1), (b, f2)]);
        assert!(slots.is_authorised(&b, &f2));
        assert_eq!(slots.waiting_len(), 0);
    }

    #[test]
    fn test_disconnect_frees_slot() {
        let mut slots = UploadSlots::new(1);
        let (a, b, f) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        slots.request(a, f);
        slots.request(b, f);

        assert_eq!(slots.release_connection(a), vec![(b, f)]);
        assert_eq!(slots.active_peers(), vec![b]);
    }
}
