/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! In-process wake notifications.
//!
//! Channels are plain names; a publish runs every callback registered for that
//! name with the opaque payload. Delivery is best-effort and single-process.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

type Callback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct NotifyHub {
    subscribers: Arc<Mutex<HashMap<String, Vec<Callback>>>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, channel: &str, callback: impl Fn(&str) + Send + Sync + 'static) {
        let mut subs = match self.subscribers.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        subs.entry(channel.to_string())
            .or_default()
            .push(Arc::new(callback));
    }

    pub fn publish(&self, channel: &str, payload: &str) {
        // Snapshot so callbacks may subscribe or publish themselves.
        let callbacks: Vec<Callback> = {
            let subs = match self.subscribers.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            subs.get(channel).cloned().unwrap_or_default()
        };
        for cb in callbacks {
            cb(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn publish_reaches_only_matching_channel() {
        let hub = NotifyHub::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(String::new()));
        {
            let hits = hits.clone();
            let seen = seen.clone();
            hub.subscribe("collection_changed", move |p| {
                hits.fetch_add(1, Ordering::SeqCst);
                *seen.lock().unwrap() = p.to_string();
            });
        }
        hub.publish("new_background_job", "");
        hub.publish("collection_changed", "https://a.example/users/a/inbox");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(&*seen.lock().unwrap(), "https://a.example/users/a/inbox");
    }
}
