//! Last known locker state, as seen by the app-facing side.
//!
//! Every mutator returns the message(s) the caller must broadcast to the app
//! group in the same step, so the cache and what apps were told never diverge.

use std::collections::{HashMap, HashSet};

use cube_core::{Compartment, Device, LockEvent, LockStatus, Message};

/// Compartments, devices and per-lock status.
///
/// Compartments and devices are always the latest full snapshot from one
/// upstream. Lock statuses are upserted per lock and only cleared by
/// [`StateCache::reset`].
#[derive(Debug, Default)]
pub struct StateCache {
    compartments: Vec<Compartment>,
    devices: Vec<Device>,
    lock_status: HashMap<String, LockStatus>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the compartment snapshot.
    pub fn on_compartments(&mut self, compartments: Vec<Compartment>) -> Message {
        self.compartments = compartments;
        Message::compartments(self.compartments.clone())
    }

    /// Replace the device snapshot.
    pub fn on_devices(&mut self, devices: Vec<Device>) -> Message {
        self.devices = devices;
        Message::devices(self.devices.clone())
    }

    /// Record the status carried by `event`.
    pub fn on_lock(&mut self, event: LockEvent) -> Message {
        let _ = self.lock_status.insert(event.lock.clone(), event.status);
        Message::Lock(event)
    }

    /// Messages a newly connected app needs before any live event:
    /// compartments, devices, then one lock event per known lock that belongs
    /// to a compartment.
    pub fn replay(&self) -> Vec<Message> {
        let mut messages = vec![
            Message::compartments(self.compartments.clone()),
            Message::devices(self.devices.clone()),
        ];
        let mut seen = HashSet::new();
        // Both the primary and the secondary lock belong to their compartment.
        for compartment in &self.compartments {
            for lock in compartment.locks() {
                let Some(status) = self.lock_status.get(lock) else {
                    continue;
                };
                if seen.insert(lock) {
                    messages.push(Message::Lock(
                        LockEvent::new(lock, *status)
                            .with_compartment(Some(compartment.number.clone())),
                    ));
                }
            }
        }
        messages
    }

    /// Forget everything; returns the empty snapshots to broadcast.
    pub fn reset(&mut self) -> [Message; 2] {
        self.compartments.clear();
        self.devices.clear();
        self.lock_status.clear();
        [Message::compartments(Vec::new()), Message::devices(Vec::new())]
    }

    pub fn lock_status(&self, lock: &str) -> Option<LockStatus> {
        self.lock_status.get(lock).copied()
    }

    /// Compartment owning `lock` as primary or secondary lock.
    pub fn compartment_for_lock(&self, lock: &str) -> Option<&Compartment> {
        self.compartments.iter().find(|c| c.has_lock(lock))
    }

    pub fn compartments(&self) -> &[Compartment] {
        &self.compartments
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn known_locks(&self) -> usize {
        self.lock_status.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compartments.is_empty() && self.devices.is_empty() && self.lock_status.is_empty()
    }
}
