//! Keyspace layout.
//!
//! One flat keyspace partitioned by a short type tag:
//!
//! | Entity       | Key                                              |
//! |--------------|--------------------------------------------------|
//! | Topic        | `"T:" + name`                                    |
//! | Subscription | `"S:" + object_id + ":" + sub_name`              |
//! | Snapshot     | `"SS:" + object_id + ":" + sub_name + ":" + name`|
//! | Message      | `"M:" + object_id + ":" + offset_bytes`          |
//!
//! Each builder takes the tail component as an `Option`; passing `None`
//! yields the prefix that starts a `Seek`-based enumeration of the entity's
//! range. The object-id is a fixed 16 bytes, so the `:` delimiter never needs
//! escaping to keep prefixes unambiguous.

use uuid::Uuid;

use crate::offset::Offset;

const TOPIC_TAG: &[u8] = b"T:";
const SUBSCRIPTION_TAG: &[u8] = b"S:";
const SNAPSHOT_TAG: &[u8] = b"SS:";
const MESSAGE_TAG: &[u8] = b"M:";
const DELIMITER: u8 = b':';

/// Key of the topic record for `name`.
pub fn topic(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(TOPIC_TAG.len() + name.len());
    key.extend_from_slice(TOPIC_TAG);
    key.extend_from_slice(name.as_bytes());
    key
}

/// Key of one subscription, or with `None` the prefix covering every
/// subscription of the topic.
pub fn subscription(topic_id: &Uuid, name: Option<&str>) -> Vec<u8> {
    let mut key = Vec::with_capacity(
        SUBSCRIPTION_TAG.len() + 17 + name.map_or(0, str::len),
    );
    key.extend_from_slice(SUBSCRIPTION_TAG);
    key.extend_from_slice(topic_id.as_bytes());
    key.push(DELIMITER);
    if let Some(name) = name {
        key.extend_from_slice(name.as_bytes());
    }
    key
}

/// Key of one snapshot, or with `None` the prefix covering every snapshot of
/// the `(topic, subscription)` pair.
pub fn snapshot(topic_id: &Uuid, subscription: &str, name: Option<&str>) -> Vec<u8> {
    let mut key = Vec::with_capacity(
        SNAPSHOT_TAG.len() + 17 + subscription.len() + 1 + name.map_or(0, str::len),
    );
    key.extend_from_slice(SNAPSHOT_TAG);
    key.extend_from_slice(topic_id.as_bytes());
    key.push(DELIMITER);
    key.extend_from_slice(subscription.as_bytes());
    key.push(DELIMITER);
    if let Some(name) = name {
        key.extend_from_slice(name.as_bytes());
    }
    key
}

/// Key of one message, or with `None` the prefix covering every message of
/// the topic.
pub fn message(topic_id: &Uuid, offset: Option<&Offset>) -> Vec<u8> {
    let mut key = Vec::with_capacity(MESSAGE_TAG.len() + 17 + crate::offset::ENCODED_LEN);
    key.extend_from_slice(MESSAGE_TAG);
    key.extend_from_slice(topic_id.as_bytes());
    key.push(DELIMITER);
    if let Some(offset) = offset {
        key.extend_from_slice(&offset.encode());
    }
    key
}
