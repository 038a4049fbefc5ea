//! Materialized per-key state for late joiners of a shared watcher

use std::collections::BTreeMap;

use serde_json::Value;

use modelwatch_types::{Event, EventType, Payload, WatchKey, object_ref};

/// Last known state of one key, rebuilt from the events flowing through it
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Snapshot {
    /// Collections and event lists, keyed by `namespace/name`
    Items {
        objects: Option<BTreeMap<String, Value>>,
        cursor: Option<String>,
    },
    /// A single object; `None` until the first INITIAL or after deletion
    Object {
        object: Option<Value>,
        cursor: Option<String>,
    },
    /// Poll results replace each other wholesale
    Latest(Option<Event>),
}

impl Snapshot {
    pub(crate) fn for_key(key: &WatchKey) -> Self {
        match key {
            WatchKey::Collection { .. } | WatchKey::Events { .. } => Self::Items {
                objects: None,
                cursor: None,
            },
            WatchKey::Single { .. } => Self::Object {
                object: None,
                cursor: None,
            },
            WatchKey::Logs { .. } => Self::Latest(None),
        }
    }

    pub(crate) fn apply(&mut self, event: &Event) {
        match (self, event.event_type, &event.payload) {
            (Self::Items { objects, cursor }, EventType::Initial, Payload::Items(items)) => {
                *objects = Some(
                    items
                        .iter()
                        .filter_map(|obj| object_ref(obj).map(|id| (id, obj.clone())))
                        .collect(),
                );
                *cursor = event.cursor.clone();
            }
            (Self::Items { objects, cursor }, change, Payload::Object(obj)) if change.is_change() => {
                // changes before the first INITIAL cannot be placed
                let (Some(objects), Some(id)) = (objects.as_mut(), object_ref(obj)) else {
                    return;
                };
                if change == EventType::Deleted {
                    objects.remove(&id);
                } else {
                    objects.insert(id, obj.clone());
                }
                if event.cursor.is_some() {
                    *cursor = event.cursor.clone();
                }
            }
            (Self::Object { object, cursor }, kind, Payload::Object(obj))
                if kind == EventType::Initial || kind.is_change() =>
            {
                *object = (kind != EventType::Deleted).then(|| obj.clone());
                *cursor = event.cursor.clone();
            }
            (Self::Latest(latest), EventType::Update, _) => *latest = Some(event.clone()),
            _ => {}
        }
    }

    /// Synthesized first event for a channel joining now, if the state is known
    pub(crate) fn replay(&self) -> Option<Event> {
        match self {
            Self::Items {
                objects: Some(objects),
                cursor,
            } => Some(Event::initial_items(
                objects.values().cloned().collect(),
                cursor.clone(),
            )),
            Self::Object {
                object: Some(object),
                cursor,
            } => Some(Event::initial_object(object.clone(), cursor.clone())),
            Self::Latest(latest) => latest.clone(),
            _ => None,
        }
    }
}
