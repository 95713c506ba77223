/// Topic registry - identifier to state binding
///
/// A topic is a named slice of application state that clients can read and
/// update. The registry is filled once at startup and then frozen behind an
/// `Arc`, so the dispatch loop and every producer read it without locking.
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::BrokerError;

/// JSON object body of a topic
pub type StateBody = Map<String, Value>;

/// State owner shared between its service and the broker
pub type SharedState<T> = Arc<RwLock<T>>;

/// Outcome of applying a client body to a state owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateUpdateResult {
    /// State changed, subscribers should be told
    Changed,
    /// Body applied cleanly but nothing differed
    Unchanged,
    /// Body rejected, state untouched
    Error,
}

impl StateUpdateResult {
    pub fn from_changed(changed: bool) -> Self {
        if changed {
            StateUpdateResult::Changed
        } else {
            StateUpdateResult::Unchanged
        }
    }

    pub fn is_changed(&self) -> bool {
        matches!(self, StateUpdateResult::Changed)
    }
}

/// A state type that knows how to read itself into and update itself from JSON
pub trait TopicState: Send + Sync + 'static {
    fn read(&self, root: &mut StateBody);
    fn update(&mut self, root: &StateBody) -> StateUpdateResult;
}

/// Type-erased binding stored in the registry, one per topic
pub trait TopicBinding: Send + Sync {
    fn serialize(&self) -> StateBody;
    fn update(&self, body: &StateBody) -> StateUpdateResult;
}

struct StateBinding<T> {
    state: SharedState<T>,
}

impl<T: TopicState> TopicBinding for StateBinding<T> {
    fn serialize(&self) -> StateBody {
        let mut root = StateBody::new();
        self.state.read().read(&mut root);
        root
    }

    fn update(&self, body: &StateBody) -> StateUpdateResult {
        self.state.write().update(body)
    }
}

struct FnBinding<T, R, U> {
    state: SharedState<T>,
    read: R,
    update: U,
}

impl<T, R, U> TopicBinding for FnBinding<T, R, U>
where
    T: Send + Sync + 'static,
    R: Fn(&T, &mut StateBody) + Send + Sync,
    U: Fn(&StateBody, &mut T) -> StateUpdateResult + Send + Sync,
{
    fn serialize(&self) -> StateBody {
        let mut root = StateBody::new();
        (self.read)(&*self.state.read(), &mut root);
        root
    }

    fn update(&self, body: &StateBody) -> StateUpdateResult {
        (self.update)(body, &mut *self.state.write())
    }
}

/// Registry of every topic served by the broker
#[derive(Default)]
pub struct TopicRegistry {
    topics: HashMap<String, Box<dyn TopicBinding>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a topic to a state owner with explicit read/update functions
    pub fn register<T, R, U>(
        &mut self,
        topic: impl Into<String>,
        state: SharedState<T>,
        read: R,
        update: U,
    ) -> Result<(), BrokerError>
    where
        T: Send + Sync + 'static,
        R: Fn(&T, &mut StateBody) + Send + Sync + 'static,
        U: Fn(&StateBody, &mut T) -> StateUpdateResult + Send + Sync + 'static,
    {
        self.register_binding(topic, Box::new(FnBinding { state, read, update }))
    }

    /// Bind a topic to a state owner implementing `TopicState`
    pub fn register_state<T: TopicState>(
        &mut self,
        topic: impl Into<String>,
        state: SharedState<T>,
    ) -> Result<(), BrokerError> {
        self.register_binding(topic, Box::new(StateBinding { state }))
    }

    /// Store a binding; an already-bound identifier keeps its original binding
    pub fn register_binding(
        &mut self,
        topic: impl Into<String>,
        binding: Box<dyn TopicBinding>,
    ) -> Result<(), BrokerError> {
        let topic = topic.into();
        if self.topics.contains_key(&topic) {
            return Err(BrokerError::DuplicateTopic { topic });
        }
        self.topics.insert(topic, binding);
        Ok(())
    }

    pub fn lookup(&self, topic: &str) -> Result<&dyn TopicBinding, BrokerError> {
        self.topics
            .get(topic)
            .map(|b| b.as_ref())
            .ok_or_else(|| BrokerError::TopicNotFound {
                topic: topic.to_string(),
            })
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Registered identifiers, sorted
    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.topics.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

/// Copy `root[key]` into `target` when present, parseable and different
///
/// Returns true when `target` changed. Values of the wrong type are ignored.
pub fn update_field<T>(root: &StateBody, key: &str, target: &mut T) -> bool
where
    T: DeserializeOwned + PartialEq,
{
    let Some(raw) = root.get(key) else {
        return false;
    };
    match T::deserialize(raw) {
        Ok(value) if value != *target => {
            *target = value;
            true
        }
        _ => false,
    }
}

/// Wrap a value as a shared state owner
pub fn shared<T>(state: T) -> SharedState<T> {
    Arc::new(RwLock::new(state))
}
