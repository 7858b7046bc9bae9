//! Per-platform admission control
//!
//! Each platform lane admits at most `cap` concurrent sub-jobs, where the cap
//! never exceeds the worker pool size. A worker that dequeues a job for a
//! full lane parks it there instead of blocking; the next worker to finish a
//! job on that lane takes the parked job over together with the slot.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use crate::types::PlatformId;

#[derive(Debug)]
struct Lane<J> {
    running: usize,
    parked: VecDeque<J>,
}

impl<J> Default for Lane<J> {
    fn default() -> Self {
        Self {
            running: 0,
            parked: VecDeque::new(),
        }
    }
}

pub struct AdmissionGate<J> {
    caps: HashMap<PlatformId, usize>,
    default_cap: usize,
    lanes: Mutex<HashMap<PlatformId, Lane<J>>>,
}

impl<J> AdmissionGate<J> {
    /// `pool_size` bounds every lane, including lanes without an explicit cap
    pub fn new(caps: &HashMap<PlatformId, usize>, pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            caps: caps
                .iter()
                .map(|(platform, cap)| (*platform, (*cap).clamp(1, pool_size)))
                .collect(),
            default_cap: pool_size,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Effective cap for a platform
    pub fn cap(&self, platform: PlatformId) -> usize {
        self.caps.get(&platform).copied().unwrap_or(self.default_cap)
    }

    /// Take a slot for `job`, or park it when the lane is full
    ///
    /// Returns the job back when it may run now.
    pub fn admit(&self, platform: PlatformId, job: J) -> Option<J> {
        let cap = self.cap(platform);
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        let lane = lanes.entry(platform).or_default();

        if lane.running < cap {
            lane.running += 1;
            Some(job)
        } else {
            lane.parked.push_back(job);
            None
        }
    }

    /// Give back a slot on `platform`
    ///
    /// If a job is parked on the lane it is returned and inherits the slot;
    /// the caller must run (or skip and release again) that job.
    pub fn release(&self, platform: PlatformId) -> Option<J> {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        let lane = lanes.entry(platform).or_default();

        match lane.parked.pop_front() {
            Some(job) => Some(job),
            None => {
                lane.running = lane.running.saturating_sub(1);
                None
            }
        }
    }

    #[cfg(test)]
    fn running(&self, platform: PlatformId) -> usize {
        self.lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&platform)
            .map_or(0, |lane| lane.running)
    }

    #[cfg(test)]
    fn parked(&self, platform: PlatformId) -> usize {
        self.lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&platform)
            .map_or(0, |lane| lane.parked.len())
    }
}
