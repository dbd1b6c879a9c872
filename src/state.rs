use crate::models::now_millis;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const MAX_HISTORY: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("No state at key '{0}'")]
    Missing(String),
    #[error("Invalid state: {0}")]
    Invalid(String),
    #[error("State (de)serialization failed for '{key}': {source}")]
    Serde {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

// One entry of the diagnostic change log
#[derive(Clone, Debug, PartialEq)]
pub struct StateChange {
    pub timestamp: i64,
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Value,
}

pub type Subscriber = Arc<dyn Fn(&Value) + Send + Sync>;
pub type Unsubscribe = Box<dyn FnOnce() + Send + Sync>;

struct Store {
    state: Value,
    history: VecDeque<StateChange>,
    // Keys awaiting notification, in first-write order; last value wins
    pending: Vec<(String, Value)>,
}

/// Observable store holding the whole session state as a JSON tree.
///
/// Reads hand out clones, writes are cloned in, and a write equal to the current
/// value is dropped. Subscribers are notified per key once writes have been quiet
/// for the debounce window, seeing only the last value written.
pub struct StateManager {
    me: Weak<StateManager>,
    store: Mutex<Store>,
    subscribers: Mutex<HashMap<String, Vec<(u64, Subscriber)>>>,
    next_subscriber: AtomicU64,
    debounce: Duration,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking subscriber never holds these locks, so poisoning only
    // happens on a bug inside this module; keep serving the data.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StateManager {
    pub fn new(debounce: Duration) -> Arc<Self> {
        Arc::new_cyclic(|me| StateManager {
            me: me.clone(),
            store: Mutex::new(Store {
                state: Value::Object(Map::new()),
                history: VecDeque::new(),
                pending: Vec::new(),
            }),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(0),
            debounce,
            flush_task: Mutex::new(None),
        })
    }

    /// Replaces the whole state. History and pending notifications are discarded.
    pub fn initialize<T: Serialize>(&self, initial: &T) -> Result<(), StateError> {
        let value = serde_json::to_value(initial).map_err(|source| StateError::Serde {
            key: String::new(),
            source,
        })?;
        let mut store = lock(&self.store);
        store.state = value;
        store.history.clear();
        store.pending.clear();
        log::debug!("State initialized");
        Ok(())
    }

    /// Clone of the value at a dot-delimited key path, or of the whole state
    /// when `key` is `None`. `None` is returned if any segment is absent.
    pub fn get_state(&self, key: Option<&str>) -> Option<Value> {
        let store = lock(&self.store);
        match key {
            None => Some(store.state.clone()),
            Some(key) => lookup(&store.state, key).cloned(),
        }
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, StateError> {
        let value = self
            .get_state(Some(key))
            .ok_or_else(|| StateError::Missing(key.to_string()))?;
        serde_json::from_value(value).map_err(|source| StateError::Serde {
            key: key.to_string(),
            source,
        })
    }

    /// Writes `value` at `key`. Returns whether the state actually changed.
    pub fn set_state<T: Serialize>(&self, key: &str, value: &T, silent: bool) -> Result<bool, StateError> {
        let value = serde_json::to_value(value).map_err(|source| StateError::Serde {
            key: key.to_string(),
            source,
        })?;
        Ok(self.set_value(key, value, silent))
    }

    pub fn set_value(&self, key: &str, value: Value, silent: bool) -> bool {
        let changed = {
            let mut store = lock(&self.store);
            Self::write(&mut store, key, value, silent)
        };
        if changed && !silent {
            self.schedule_flush();
        }
        changed
    }

    /// Read-modify-write of a typed value under the store lock, so concurrent
    /// tasks cannot interleave between the read and the write.
    ///
    /// `f` must not call back into this store.
    pub fn update<T, R, F>(&self, key: &str, f: F) -> Result<R, StateError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> R,
    {
        let (result, changed) = {
            let mut store = lock(&self.store);
            let current = lookup(&store.state, key)
                .cloned()
                .ok_or_else(|| StateError::Missing(key.to_string()))?;
            let mut typed: T = serde_json::from_value(current).map_err(|source| StateError::Serde {
                key: key.to_string(),
                source,
            })?;
            let result = f(&mut typed);
            let value = serde_json::to_value(&typed).map_err(|source| StateError::Serde {
                key: key.to_string(),
                source,
            })?;
            let changed = Self::write(&mut store, key, value, false);
            (result, changed)
        };
        if changed {
            self.schedule_flush();
        }
        Ok(result)
    }

    fn write(store: &mut Store, key: &str, value: Value, silent: bool) -> bool {
        let old_value = lookup(&store.state, key).cloned();
        if old_value.as_ref() == Some(&value) {
            log::trace!("State '{}' unchanged, skipping", key);
            return false;
        }

        assign(&mut store.state, key, value.clone());

        if store.history.len() == MAX_HISTORY {
            store.history.pop_front();
        }
        store.history.push_back(StateChange {
            timestamp: now_millis(),
            key: key.to_string(),
            old_value,
            new_value: value.clone(),
        });

        if !silent {
            match store.pending.iter_mut().find(|(k, _)| k == key) {
                Some(entry) => entry.1 = value,
                None => store.pending.push((key.to_string(), value)),
            }
        }
        true
    }

    /// Registers `callback` for batched notifications on `key`.
    pub fn subscribe<F>(&self, key: &str, callback: F) -> Unsubscribe
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        lock(&self.subscribers)
            .entry(key.to_string())
            .or_default()
            .push((id, Arc::new(callback)));

        let me = self.me.clone();
        let key = key.to_string();
        Box::new(move || {
            if let Some(manager) = me.upgrade() {
                let mut subscribers = lock(&manager.subscribers);
                if let Some(list) = subscribers.get_mut(&key) {
                    list.retain(|(sid, _)| *sid != id);
                }
            }
        })
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        lock(&self.subscribers).get(key).map(|l| l.len()).unwrap_or(0)
    }

    // Restarts the quiet-period timer. Without a runtime there is nothing to
    // defer on, so notifications go out immediately.
    fn schedule_flush(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.flush();
            return;
        };
        let me = self.me.clone();
        let debounce = self.debounce;
        let task = handle.spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Some(manager) = me.upgrade() {
                manager.flush();
            }
        });
        if let Some(previous) = lock(&self.flush_task).replace(task) {
            previous.abort();
        }
    }

    /// Dispatches all pending notifications now.
    pub fn flush(&self) {
        let pending = std::mem::take(&mut lock(&self.store).pending);
        for (key, value) in pending {
            let listeners: Vec<Subscriber> = lock(&self.subscribers)
                .get(&key)
                .map(|l| l.iter().map(|(_, s)| s.clone()).collect())
                .unwrap_or_default();
            log::debug!("Notifying {} subscriber(s) of '{}'", listeners.len(), key);
            for listener in listeners {
                if catch_unwind(AssertUnwindSafe(|| listener(&value))).is_err() {
                    log::error!("Subscriber for '{}' panicked", key);
                }
            }
        }
    }

    pub fn history(&self) -> Vec<StateChange> {
        lock(&self.store).history.iter().cloned().collect()
    }

    /// Boot-time sanity check of the state shape.
    pub fn validate(&self) -> Result<(), StateError> {
        let store = lock(&self.store);
        for key in ["chats", "chatHistory", "aiTypes"] {
            if !matches!(lookup(&store.state, key), Some(Value::Array(_))) {
                return Err(StateError::Invalid(format!("'{}' must be an array", key)));
            }
        }
        if let Some(Value::Array(chats)) = lookup(&store.state, "chats") {
            for (i, chat) in chats.iter().enumerate() {
                if !chat.get("id").map(Value::is_string).unwrap_or(false) {
                    return Err(StateError::Invalid(format!("chat #{} has no string id", i)));
                }
                if !chat.get("aiModelId").map(Value::is_number).unwrap_or(false) {
                    return Err(StateError::Invalid(format!("chat #{} has no numeric aiModelId", i)));
                }
            }
        }
        Ok(())
    }
}

fn lookup<'a>(root: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.').try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

// Creates plain-object nodes for missing (or scalar) intermediate segments.
fn assign(root: &mut Value, key: &str, value: Value) {
    let segments: Vec<&str> = key.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut node = root;
    for segment in parents {
        node = child_mut(node, segment);
    }

    if let Value::Array(items) = node {
        if let Some(slot) = last.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
            *slot = value;
            return;
        }
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        map.insert(last.to_string(), value);
    }
}

fn child_mut<'a>(node: &'a mut Value, segment: &str) -> &'a mut Value {
    let index = match &*node {
        Value::Array(items) => segment.parse::<usize>().ok().filter(|i| *i < items.len()),
        _ => None,
    };
    match (node, index) {
        (Value::Array(items), Some(i)) => &mut items[i],
        (node, _) => {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            match node {
                Value::Object(map) => map
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
                _ => unreachable!("node was just replaced by an object"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> Arc<StateManager> {
        let manager = StateManager::new(Duration::from_millis(50));
        manager
            .initialize(&json!({ "chats": [], "chatHistory": [], "aiTypes": [], "ui": { "isMobile": false } }))
            .unwrap();
        manager
    }

    fn recorder(manager: &StateManager, key: &str) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        // Subscriptions live for the whole test
        let _keep = manager.subscribe(key, move |v| s.lock().unwrap().push(v.clone()));
        seen
    }

    #[test]
    fn get_returns_clones_at_paths() {
        let manager = store();
        assert_eq!(manager.get_state(Some("ui.isMobile")), Some(json!(false)));
        assert_eq!(manager.get_state(Some("ui.missing.deeper")), None);
        assert!(manager.get_state(None).unwrap().get("chats").is_some());

        let value = json!({ "nested": [1, 2] });
        manager.set_value("extra", value.clone(), true);
        let mut read = manager.get_state(Some("extra")).unwrap();
        assert_eq!(read, value);
        read["nested"] = json!("mutated");
        assert_eq!(manager.get_state(Some("extra")), Some(value));
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let manager = store();
        manager.set_value("a.b.c", json!(3), true);
        assert_eq!(manager.get_state(Some("a")), Some(json!({ "b": { "c": 3 } })));
    }

    #[test]
    fn array_indices_address_elements() {
        let manager = store();
        manager.set_value("chats", json!([{ "id": "x", "aiModelId": 1 }]), true);
        assert_eq!(manager.get_state(Some("chats.0.id")), Some(json!("x")));
        manager.set_value("chats.0.aiModelId", json!(2), true);
        assert_eq!(manager.get_state(Some("chats.0.aiModelId")), Some(json!(2)));
    }

    #[test]
    fn equal_writes_are_skipped() {
        let manager = store();
        assert!(manager.set_value("ui.isMobile", json!(true), true));
        assert!(!manager.set_value("ui.isMobile", json!(true), true));
        assert_eq!(manager.history().len(), 1);
    }

    #[test]
    fn history_is_bounded() {
        let manager = store();
        for i in 0..(MAX_HISTORY + 20) {
            manager.set_value("counter", json!(i), true);
        }
        let history = manager.history();
        assert_eq!(history.len(), MAX_HISTORY);
        assert_eq!(history.last().unwrap().new_value, json!(MAX_HISTORY + 19));
        assert_eq!(history[0].old_value, Some(json!(19)));
    }

    #[tokio::test(start_paused = true)]
    async fn writes_within_window_notify_once_with_last_value() {
        let manager = store();
        let seen = recorder(&manager, "counter");
        for i in 0..5 {
            manager.set_value("counter", json!(i), false);
        }
        assert!(seen.lock().unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*seen.lock().unwrap(), vec![json!(4)]);
    }

    #[tokio::test(start_paused = true)]
    async fn notification_waits_for_quiet_period() {
        let manager = store();
        let seen = recorder(&manager, "counter");
        manager.set_value("counter", json!(1), false);
        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.set_value("counter", json!(2), false);

        // The second write restarts the window
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(seen.lock().unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock().unwrap(), vec![json!(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn each_key_gets_its_own_notification() {
        let manager = store();
        let a = recorder(&manager, "a");
        let b = recorder(&manager, "b");
        manager.set_value("a", json!(1), false);
        manager.set_value("b", json!(2), false);
        manager.set_value("a", json!(3), false);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*a.lock().unwrap(), vec![json!(3)]);
        assert_eq!(*b.lock().unwrap(), vec![json!(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_writes_do_not_notify() {
        let manager = store();
        let seen = recorder(&manager, "quiet");
        manager.set_value("quiet", json!(1), true);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(manager.get_state(Some("quiet")), Some(json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_subscriber_is_contained() {
        let manager = store();
        let _bad = manager.subscribe("k", |_| panic!("subscriber failure"));
        let seen = recorder(&manager, "k");
        manager.set_value("k", json!("v"), false);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(*seen.lock().unwrap(), vec![json!("v")]);
        assert_eq!(manager.get_state(Some("k")), Some(json!("v")));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let manager = store();
        let seen = Arc::new(Mutex::new(0));
        let s = seen.clone();
        let unsubscribe = manager.subscribe("k", move |_| *s.lock().unwrap() += 1);
        // No runtime here, so dispatch is immediate
        manager.set_value("k", json!(1), false);
        unsubscribe();
        manager.set_value("k", json!(2), false);
        assert_eq!(*seen.lock().unwrap(), 1);
        assert_eq!(manager.subscriber_count("k"), 0);
    }

    #[test]
    fn update_is_read_modify_write() {
        let manager = store();
        manager.set_value("list", json!([1, 2]), true);
        let len = manager
            .update("list", |list: &mut Vec<i64>| {
                list.push(3);
                list.len()
            })
            .unwrap();
        assert_eq!(len, 3);
        assert_eq!(manager.get_state(Some("list")), Some(json!([1, 2, 3])));
        assert!(matches!(
            manager.update("absent", |_: &mut Vec<i64>| ()),
            Err(StateError::Missing(_))
        ));
    }

    #[test]
    fn validate_checks_shape() {
        let manager = store();
        assert!(manager.validate().is_ok());

        manager.set_value("chats", json!([{ "id": 5, "aiModelId": 1 }]), true);
        assert!(manager.validate().is_err());

        manager.set_value("chats", json!([{ "id": "c", "aiModelId": "1" }]), true);
        assert!(manager.validate().is_err());

        manager.set_value("chats", json!([]), true);
        manager.set_value("aiTypes", json!({}), true);
        assert!(matches!(manager.validate(), Err(StateError::Invalid(_))));
    }
}
