//! Generic diff-and-apply between a desired and a current set of
//! appliance records.
//!
//! Plugins inject equality, ownership and the mutating calls through
//! [`DiffHandler`]; the driver only decides which mutation each key needs.
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::opnsense::{self, Record};

/// Per-kind behavior of a reconcile pass.
///
/// `equal` compares only the fields the controller cares about; fields it
/// does not compare are left untouched on update. `owned` guards deletion:
/// records that do not satisfy it are never mutated, regardless of key
/// collisions.
#[async_trait]
pub trait DiffHandler {
    fn equal(&self, current: &Record, desired: &Record) -> bool;

    fn owned(&self, current: &Record) -> bool;

    async fn add(&self, key: &str, desired: &Record) -> opnsense::Result<()>;

    async fn update(&self, uuid: &str, desired: &Record) -> opnsense::Result<()>;

    async fn delete(&self, uuid: &str) -> opnsense::Result<()>;

    /// Commit hook, invoked once iff at least one mutation succeeded.
    /// The default is a no-op for plugins that run several diffs per pass
    /// and commit once at the end.
    async fn on_change(&self) -> opnsense::Result<()> {
        Ok(())
    }
}

/// Converge `current` towards `desired`, one independent mutation per key.
///
/// A failed mutation is logged and does not abort the pass. Iteration is in
/// key order on both sides. Returns whether any mutation succeeded.
pub async fn apply<H>(
    desired: &BTreeMap<String, Record>,
    current: &BTreeMap<String, Record>,
    handler: &H,
) -> bool
where
    H: DiffHandler + Sync,
{
    let mut changed = false;

    for (key, want) in desired {
        match current.get(key) {
            None => match handler.add(key, want).await {
                Ok(()) => changed = true,
                Err(err) => warn!("failed to add {}: {}", key, err),
            },
            Some(have) => {
                if handler.equal(have, want) {
                    continue;
                }
                match uuid_of(have) {
                    Some(uuid) => match handler.update(uuid, want).await {
                        Ok(()) => changed = true,
                        Err(err) => warn!("failed to update {}: {}", key, err),
                    },
                    None => warn!("current record {} has no uuid, skipping update", key),
                }
            }
        }
    }

    for (key, have) in current {
        if desired.contains_key(key) || !handler.owned(have) {
            continue;
        }
        match uuid_of(have) {
            Some(uuid) => match handler.delete(uuid).await {
                Ok(()) => changed = true,
                Err(err) => warn!("failed to delete {}: {}", key, err),
            },
            None => warn!("current record {} has no uuid, skipping delete", key),
        }
    }

    if changed {
        if let Err(err) = handler.on_change().await {
            warn!("commit failed: {}", err);
        }
    }
    changed
}

fn uuid_of(record: &Record) -> Option<&str> {
    record.get("uuid").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::opnsense::Error;

    // Records the mutation sequence; equality is subset-match over desired
    // keys and ownership is an `owned: true` marker field.
    #[derive(Default)]
    struct Recording {
        ops: Mutex<Vec<String>>,
        fail_op: Option<&'static str>,
    }

    impl Recording {
        fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }

        fn record(&self, op: String) -> opnsense::Result<()> {
            if let Some(fail) = self.fail_op {
                if op.starts_with(fail) {
                    return Err(Error::Status {
                        status: 500,
                        path: op,
                        body: "boom".to_owned(),
                    });
                }
            }
            self.ops.lock().unwrap().push(op);
            Ok(())
        }
    }

    #[async_trait]
    impl DiffHandler for Recording {
        fn equal(&self, current: &Record, desired: &Record) -> bool {
            desired.iter().all(|(k, v)| current.get(k) == Some(v))
        }

        fn owned(&self, current: &Record) -> bool {
            current.get("owned").and_then(Value::as_bool).unwrap_or(false)
        }

        async fn add(&self, key: &str, _desired: &Record) -> opnsense::Result<()> {
            self.record(format!("add:{}", key))
        }

        async fn update(&self, uuid: &str, _desired: &Record) -> opnsense::Result<()> {
            self.record(format!("update:{}", uuid))
        }

        async fn delete(&self, uuid: &str) -> opnsense::Result<()> {
            self.record(format!("delete:{}", uuid))
        }

        async fn on_change(&self) -> opnsense::Result<()> {
            self.record("commit".to_owned())
        }
    }

    fn record(value: serde_json::Value) -> Record {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {:?}", other),
        }
    }

    fn to_map(entries: Vec<(&str, serde_json::Value)>) -> BTreeMap<String, Record> {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_owned(), record(v)))
            .collect()
    }

    #[tokio::test]
    async fn adds_updates_and_deletes_in_key_order() {
        let desired = to_map(vec![
            ("b", json!({"value": "2"})),
            ("a", json!({"value": "1"})),
            ("c", json!({"value": "3"})),
        ]);
        let current = to_map(vec![
            ("b", json!({"uuid": "uuid-b", "value": "old", "owned": true})),
            ("z", json!({"uuid": "uuid-z", "owned": true})),
            ("y", json!({"uuid": "uuid-y", "owned": true})),
        ]);
        let handler = Recording::default();

        assert!(apply(&desired, &current, &handler).await);
        assert_eq!(
            handler.ops(),
            vec!["add:a", "update:uuid-b", "add:c", "delete:uuid-y", "delete:uuid-z", "commit"]
        );
    }

    #[tokio::test]
    async fn unowned_records_are_never_deleted() {
        let desired = BTreeMap::new();
        let current = to_map(vec![
            ("stray", json!({"uuid": "uuid-1", "value": "manual"})),
            ("managed", json!({"uuid": "uuid-2", "owned": true})),
        ]);
        let handler = Recording::default();

        assert!(apply(&desired, &current, &handler).await);
        assert_eq!(handler.ops(), vec!["delete:uuid-2", "commit"]);
    }

    #[tokio::test]
    async fn converged_state_makes_no_mutations_and_no_commit() {
        let desired = to_map(vec![("a", json!({"value": "1"}))]);
        let current = to_map(vec![(
            "a",
            json!({"uuid": "uuid-a", "value": "1", "owned": true}),
        )]);
        let handler = Recording::default();

        assert!(!apply(&desired, &current, &handler).await);
        assert!(handler.ops().is_empty());
    }

    #[tokio::test]
    async fn failed_mutation_does_not_abort_the_pass() {
        let desired = to_map(vec![
            ("a", json!({"value": "1"})),
            ("b", json!({"value": "2"})),
        ]);
        let current = to_map(vec![("gone", json!({"uuid": "uuid-g", "owned": true}))]);
        let handler = Recording {
            fail_op: Some("add:a"),
            ..Recording::default()
        };

        // The other mutations still run and the commit hook still fires.
        assert!(apply(&desired, &current, &handler).await);
        assert_eq!(handler.ops(), vec!["add:b", "delete:uuid-g", "commit"]);
    }

    #[tokio::test]
    async fn records_without_uuid_are_skipped() {
        let desired = to_map(vec![("a", json!({"value": "new"}))]);
        let current = to_map(vec![
            ("a", json!({"value": "old"})),
            ("b", json!({"owned": true})),
        ]);
        let handler = Recording::default();

        assert!(!apply(&desired, &current, &handler).await);
        assert!(handler.ops().is_empty());
    }
}
