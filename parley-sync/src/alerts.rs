//! Test alerts held until acknowledged by any of the user's sessions.
//!
//! The server fans `test:alert` out to every session of a user. Whichever
//! session acknowledges first wins: it clears locally and the server pushes
//! `test:alert:acknowledged` to the rest, which clear on receipt.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::model::TestAlert;

#[derive(Debug, Default)]
pub struct AlertBoard {
    alerts: HashMap<String, TestAlert>,
    /// Ids already acknowledged, so a late duplicate does not resurrect one.
    acknowledged: HashSet<String>,
    /// Acknowledgement order, oldest first, for eviction.
    ack_order: VecDeque<String>,
}

const ACK_HISTORY: usize = 256;

impl AlertBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold an incoming alert. Returns `false` for duplicates or alerts
    /// already acknowledged elsewhere.
    pub fn receive(&mut self, alert: TestAlert) -> bool {
        if self.alerts.contains_key(&alert.id) || self.acknowledged.contains(&alert.id) {
            return false;
        }
        self.alerts.insert(alert.id.clone(), alert);
        true
    }

    /// Clear an alert, whether acknowledged here or by another session.
    /// Returns whether it was still active.
    pub fn clear(&mut self, id: &str) -> bool {
        if self.acknowledged.insert(id.to_string()) {
            self.ack_order.push_back(id.to_string());
            if self.ack_order.len() > ACK_HISTORY {
                if let Some(oldest) = self.ack_order.pop_front() {
                    self.acknowledged.remove(&oldest);
                }
            }
        }
        self.alerts.remove(id).is_some()
    }

    /// Active alerts, oldest first.
    pub fn active(&self) -> Vec<TestAlert> {
        let mut alerts: Vec<TestAlert> = self.alerts.values().cloned().collect();
        alerts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        alerts
    }

    pub fn reset(&mut self) {
        self.alerts.clear();
        self.acknowledged.clear();
        self.ack_order.clear();
    }
}
