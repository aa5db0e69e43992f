use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex},
};

use serde::Serialize;

use crate::detector::DetectorKind;

pub(crate) const FRAME_HISTORY_CAPACITY: usize = 64;
pub(crate) const ALERT_LOG_CAPACITY: usize = 200;

/// Encoded display frame with the cycle metadata it was produced in.
#[derive(Clone)]
pub(crate) struct FramePacket {
    pub(crate) jpeg: Vec<u8>,
    pub(crate) cycle: u64,
    pub(crate) timestamp_ms: i64,
    pub(crate) crowd_count: Option<usize>,
}

#[derive(Clone, Debug, Serialize)]
pub struct AlertRecord {
    pub timestamp: String,
    pub message: String,
    pub important: bool,
}

pub(crate) type SharedFrame = Arc<Mutex<Option<FramePacket>>>;
pub(crate) type FrameHistory = Arc<Mutex<VecDeque<FramePacket>>>;

/// Most recent display/log entries, newest last.
#[derive(Clone, Default)]
pub struct AlertLog {
    entries: Arc<Mutex<VecDeque<AlertRecord>>>,
}

impl AlertLog {
    pub fn push(&self, record: AlertRecord) {
        if let Ok(mut guard) = self.entries.lock() {
            guard.push_back(record);
            while guard.len() > ALERT_LOG_CAPACITY {
                guard.pop_front();
            }
        }
    }

    pub fn snapshot(&self) -> Vec<AlertRecord> {
        self.entries
            .lock()
            .map(|guard| guard.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Controller snapshot published after every tick and control command.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PipelineStatus {
    pub state: &'static str,
    pub mode: Option<&'static str>,
    pub active: Vec<DetectorKind>,
    pub unavailable: Vec<DetectorKind>,
    pub confidence: BTreeMap<DetectorKind, f32>,
    pub file: Option<String>,
    pub cycle: u64,
    pub crowd_count: Option<usize>,
}

pub(crate) type SharedStatus = Arc<Mutex<PipelineStatus>>;
