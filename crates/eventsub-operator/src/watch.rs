//! Typed lifecycle stream over the EventSubscription watch
//!
//! The raw watcher only reports "applied" and "deleted". This module
//! classifies applies into first sightings, spec changes and deletion
//! requests by tracking the last generation seen for each object uid.

use crate::crd::EventSubscription;
use futures::{future, Stream, StreamExt};
use kube::runtime::watcher::{self, watcher};
use kube::runtime::WatchStreamExt;
use kube::{Api, ResourceExt};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// A lifecycle transition of one subscription
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// First sighting of the object
    Added(EventSubscription),
    /// The spec generation changed
    Modified(EventSubscription),
    /// Deletion requested while our finalizer holds the object
    DeleteRequested(EventSubscription),
    /// The object is gone from the store
    Removed(EventSubscription),
}

impl SubscriptionEvent {
    /// Event kind for logs
    pub fn kind(&self) -> &'static str {
        match self {
            SubscriptionEvent::Added(_) => "Added",
            SubscriptionEvent::Modified(_) => "Modified",
            SubscriptionEvent::DeleteRequested(_) => "DeleteRequested",
            SubscriptionEvent::Removed(_) => "Removed",
        }
    }

    /// The subscription the event is about
    pub fn subscription(&self) -> &EventSubscription {
        match self {
            SubscriptionEvent::Added(s)
            | SubscriptionEvent::Modified(s)
            | SubscriptionEvent::DeleteRequested(s)
            | SubscriptionEvent::Removed(s) => s,
        }
    }

    /// Routing key: the subscription's unique id
    pub fn unique_id(&self) -> Option<&str> {
        self.subscription().unique_id()
    }
}

/// Turns raw watcher events into [`SubscriptionEvent`]s
#[derive(Debug, Default)]
pub struct EventClassifier {
    generations: HashMap<String, i64>,
    relisted: Option<HashSet<String>>,
}

impl EventClassifier {
    /// Classify one watcher event; `None` when nothing needs handling
    pub fn classify(
        &mut self,
        event: watcher::Event<EventSubscription>,
    ) -> Option<SubscriptionEvent> {
        match event {
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                None
            }
            watcher::Event::InitApply(subscription) => {
                if let (Some(relisted), Some(uid)) =
                    (self.relisted.as_mut(), subscription.unique_id())
                {
                    relisted.insert(uid.to_string());
                }
                self.classify_apply(subscription)
            }
            watcher::Event::InitDone => {
                // Forget objects that vanished while the watch was down
                if let Some(relisted) = self.relisted.take() {
                    self.generations.retain(|uid, _| relisted.contains(uid));
                }
                None
            }
            watcher::Event::Apply(subscription) => self.classify_apply(subscription),
            watcher::Event::Delete(subscription) => {
                if let Some(uid) = subscription.unique_id() {
                    self.generations.remove(uid);
                }
                Some(SubscriptionEvent::Removed(subscription))
            }
        }
    }

    fn classify_apply(&mut self, subscription: EventSubscription) -> Option<SubscriptionEvent> {
        let Some(uid) = subscription.unique_id().map(str::to_string) else {
            warn!(name = %subscription.name_any(), "Subscription without uid, ignoring");
            return None;
        };
        let generation = subscription.metadata.generation.unwrap_or(0);
        let previous = self.generations.insert(uid, generation);

        if subscription.is_deleting() {
            return subscription
                .has_finalizer()
                .then_some(SubscriptionEvent::DeleteRequested(subscription));
        }

        match previous {
            None => Some(SubscriptionEvent::Added(subscription)),
            Some(seen) if seen != generation => Some(SubscriptionEvent::Modified(subscription)),
            Some(_) => {
                debug!(name = %subscription.name_any(), generation, "Metadata-only update, skipping");
                None
            }
        }
    }

    /// Number of objects currently tracked
    pub fn tracked(&self) -> usize {
        self.generations.len()
    }
}

/// Infinite stream of classified subscription events.
///
/// Watch errors are logged and the watcher resumes with its default
/// backoff.
pub fn subscription_events(
    api: Api<EventSubscription>,
    config: watcher::Config,
) -> impl Stream<Item = SubscriptionEvent> + Send {
    let mut classifier = EventClassifier::default();
    watcher(api, config)
        .default_backoff()
        .filter_map(move |event| {
            let classified = match event {
                Ok(event) => classifier.classify(event),
                Err(e) => {
                    warn!(error = %e, "Subscription watch error");
                    None
                }
            };
            future::ready(classified)
        })
}
