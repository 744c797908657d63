//! Ordered pin collection.
//!
//! Pins live in an id-keyed arena; a separate vector holds the display order.
//! Every mutation renumbers `order` densely, persists the full list and
//! publishes the matching [`PinEvent`].

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::collaborators::PinStore;
use crate::events::{EventBus, PinEvent};
use crate::models::{Pin, PinId, ThreadDescriptor};

pub struct PinRegistry {
    pins: HashMap<PinId, Pin>,
    ordered: Vec<PinId>,
    next_id: i64,
    store: Arc<dyn PinStore>,
    events: EventBus,
}

impl std::fmt::Debug for PinRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinRegistry")
            .field("pins", &self.ordered.len())
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl PinRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn PinStore>, events: EventBus) -> Self {
        Self {
            pins: HashMap::new(),
            ordered: Vec::new(),
            next_id: 1,
            store,
            events,
        }
    }

    /// Build a registry from stored pins.
    ///
    /// Pins are sorted by their stored order and renumbered. A pin whose
    /// thread is already present is dropped, keeping the first one.
    #[must_use]
    pub fn from_loaded(mut loaded: Vec<Pin>, store: Arc<dyn PinStore>, events: EventBus) -> Self {
        loaded.sort_by_key(|p| p.order);
        let mut registry = Self::new(store, events);
        for mut pin in loaded {
            if registry.find_by_thread(pin.thread()).is_some() {
                debug!(thread = %pin.thread(), "Dropping duplicate stored pin");
                continue;
            }
            registry.assign_ids(&mut pin);
            registry.ordered.push(pin.id);
            registry.pins.insert(pin.id, pin);
        }
        registry.renumber();
        registry
    }

    /// Insert a new pin at the top.
    ///
    /// Returns `false` without touching anything if the thread is already pinned.
    pub fn create(&mut self, pin: Pin) -> bool {
        if !self.insert_at_top(pin) {
            return false;
        }
        self.persist();
        if let Some(pin) = self.ordered.first().and_then(|id| self.pins.get(id)) {
            self.events.publish(PinEvent::PinAdded(pin.clone()));
        }
        true
    }

    /// Re-insert previously removed pins, keeping their relative order.
    ///
    /// Returns how many were actually added.
    pub fn add_all(&mut self, mut pins: Vec<Pin>) -> usize {
        pins.sort_by_key(|p| p.order);
        let mut added = 0;
        for pin in pins.into_iter().rev() {
            if self.create(pin) {
                added += 1;
            }
        }
        added
    }

    pub fn delete(&mut self, id: PinId) -> Option<Pin> {
        let index = self.index_of(id)?;
        self.ordered.remove(index);
        let removed = self.pins.remove(&id);
        self.renumber();
        self.persist();
        self.events.publish(PinEvent::PinRemoved(index));
        removed
    }

    pub fn delete_many(&mut self, ids: &[PinId]) -> Vec<Pin> {
        let removed: Vec<Pin> = ids.iter().filter_map(|id| self.pins.remove(id)).collect();
        if removed.is_empty() {
            return removed;
        }
        self.ordered.retain(|id| self.pins.contains_key(id));
        self.renumber();
        self.persist();
        self.events.publish(PinEvent::PinsChanged(self.all()));
        removed
    }

    /// Replace the pin for the same thread, or append it if there is none.
    ///
    /// Returns the id the pin is stored under.
    pub fn update(&mut self, pin: Pin) -> PinId {
        let id = self.upsert(pin);
        self.persist();
        self.publish_changed(id);
        id
    }

    pub fn update_many(&mut self, pins: Vec<Pin>) -> Vec<PinId> {
        let ids: Vec<PinId> = pins.into_iter().map(|pin| self.upsert(pin)).collect();
        self.persist();
        for id in &ids {
            self.publish_changed(*id);
        }
        ids
    }

    /// Reassign `order` from the current positions and persist.
    pub fn reorder(&mut self) {
        self.renumber();
        self.persist();
    }

    /// Move a pin to a new position.
    pub fn move_pin(&mut self, id: PinId, to: usize) -> bool {
        let Some(from) = self.index_of(id) else {
            return false;
        };
        self.ordered.remove(from);
        let to = to.min(self.ordered.len());
        self.ordered.insert(to, id);
        self.reorder();
        self.events.publish(PinEvent::PinsChanged(self.all()));
        true
    }

    /// Pins that are neither 404'd nor archived.
    #[must_use]
    pub fn active_pins(&self) -> Vec<&Pin> {
        self.iter().filter(|p| p.is_active()).collect()
    }

    #[must_use]
    pub fn has_active_pins(&self) -> bool {
        self.iter().any(Pin::is_active)
    }

    /// Active pins the user wants polled, or nothing at all when watching is
    /// switched off globally.
    #[must_use]
    pub fn watching_pins(&self, watch_enabled: bool) -> Vec<&Pin> {
        if !watch_enabled {
            return Vec::new();
        }
        self.iter().filter(|p| p.is_active() && p.watching).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pin> {
        self.ordered.iter().filter_map(|id| self.pins.get(id))
    }

    #[must_use]
    pub fn all(&self) -> Vec<Pin> {
        self.iter().cloned().collect()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<PinId> {
        self.ordered.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    #[must_use]
    pub fn find_by_id(&self, id: PinId) -> Option<&Pin> {
        self.pins.get(&id)
    }

    /// Mutable access for in-place changes. Callers persist and publish.
    pub fn get_mut(&mut self, id: PinId) -> Option<&mut Pin> {
        self.pins.get_mut(&id)
    }

    #[must_use]
    pub fn find_by_loadable_id(&self, loadable_id: i64) -> Option<&Pin> {
        self.iter().find(|p| p.loadable.id == loadable_id)
    }

    #[must_use]
    pub fn find_by_thread(&self, thread: &ThreadDescriptor) -> Option<&Pin> {
        self.iter().find(|p| p.thread() == thread)
    }

    #[must_use]
    pub fn index_of(&self, id: PinId) -> Option<usize> {
        self.ordered.iter().position(|p| *p == id)
    }

    /// Save the full list. Fire-and-forget.
    pub fn persist(&self) {
        self.store.save_pins(self.all());
    }

    pub fn publish_changed(&self, id: PinId) {
        if let Some(pin) = self.pins.get(&id) {
            self.events.publish(PinEvent::PinChanged(pin.clone()));
        }
    }

    pub fn publish_all_changed(&self) {
        self.events.publish(PinEvent::PinsChanged(self.all()));
    }

    fn insert_at_top(&mut self, mut pin: Pin) -> bool {
        if self.find_by_thread(pin.thread()).is_some() {
            return false;
        }
        self.assign_ids(&mut pin);
        self.ordered.insert(0, pin.id);
        self.pins.insert(pin.id, pin);
        self.renumber();
        true
    }

    fn upsert(&mut self, mut pin: Pin) -> PinId {
        if let Some(existing) = self.find_by_thread(pin.thread()).map(|p| p.id) {
            pin.id = existing;
            pin.order = self.pins[&existing].order;
            self.pins.insert(existing, pin);
            return existing;
        }
        self.assign_ids(&mut pin);
        let id = pin.id;
        self.ordered.push(id);
        self.pins.insert(id, pin);
        self.renumber();
        id
    }

    /// Give `pin` a free id. Pins without a loadable id reuse the pin id.
    fn assign_ids(&mut self, pin: &mut Pin) {
        pin.id = self.claim_id(pin.id);
        if pin.loadable.id <= 0 {
            pin.loadable.id = pin.id.0;
        }
    }

    /// Keep a requested id if it is valid and free, otherwise hand out a new one.
    fn claim_id(&mut self, requested: PinId) -> PinId {
        let id = if requested.0 > 0 && !self.pins.contains_key(&requested) {
            requested
        } else {
            PinId(self.next_id)
        };
        self.next_id = self.next_id.max(id.0 + 1);
        id
    }

    fn renumber(&mut self) {
        for (index, id) in self.ordered.iter().enumerate() {
            if let Some(pin) = self.pins.get_mut(id) {
                pin.order = index as i32;
            }
        }
    }
}
