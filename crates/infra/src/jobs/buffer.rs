//! Which queues are currently buffering.

use std::collections::HashSet;
use std::sync::RwLock;

/// Tracks the queues whose new jobs are diverted into the buffer.
///
/// The buffer id of a queue is the queue name itself.
#[derive(Debug, Default)]
pub struct JobBuffer {
    active: RwLock<HashSet<String>>,
}

impl JobBuffer {
    pub fn new<I, S>(initial: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            active: RwLock::new(initial.into_iter().map(Into::into).collect()),
        }
    }

    pub fn buffer_id(queue_name: &str) -> &str {
        queue_name
    }

    /// Returns whether the setting changed.
    pub fn set_buffering(&self, queue_name: &str, active: bool) -> bool {
        let mut set = self.active.write().unwrap_or_else(|e| e.into_inner());
        if active {
            set.insert(queue_name.to_string())
        } else {
            set.remove(queue_name)
        }
    }

    pub fn is_buffering(&self, queue_name: &str) -> bool {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(queue_name)
    }

    pub fn buffering_queues(&self) -> Vec<String> {
        let mut queues: Vec<_> = self
            .active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        queues.sort();
        queues
    }
}
