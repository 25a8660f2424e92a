//! Storage-event decoding. Only object creation and removal are
//! honoured; anything else is logged and ignored.

use serde::Deserialize;
use tracing::info;

use crate::error::Result;
use crate::repository::{Config, RepositoryOptions, Variables, get_repository};

#[derive(Debug, Deserialize)]
pub struct EventNotification {
    #[serde(rename = "Records", default)]
    pub records: Vec<EventRecord>,
}

#[derive(Debug, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "eventName")]
    pub event_name: String,
    pub s3: S3Entity,
}

#[derive(Debug, Deserialize)]
pub struct S3Entity {
    pub bucket: BucketEntity,
    pub object: ObjectEntity,
}

#[derive(Debug, Deserialize)]
pub struct BucketEntity {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ObjectEntity {
    pub key: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Add,
    Remove,
}

impl Action {
    pub fn from_event_name(event_name: &str) -> Option<Self> {
        if event_name.starts_with("ObjectCreated:") {
            Some(Action::Add)
        } else if event_name.starts_with("ObjectRemoved:") {
            Some(Action::Remove)
        } else {
            None
        }
    }
}

/// Apply one event record to its repository. Returns the repository URL
/// that was updated, or `None` when the event kind is not handled.
pub async fn handle_record(record: &EventRecord, config: &Config) -> Result<Option<String>> {
    let Some(action) = Action::from_event_name(&record.event_name) else {
        info!(event = %record.event_name, "ignoring unsupported event");
        return Ok(None);
    };
    let key = record.s3.object.key.as_str();
    let mut repo = get_repository(key, &Variables::new(), config, RepositoryOptions::default())
        .await?;
    match action {
        Action::Add => {
            repo.add(key, true).await?;
        }
        Action::Remove => {
            repo.remove(key).await?;
        }
    }
    let summary = repo.close().await?;
    info!(
        bucket = %record.s3.bucket.name,
        key,
        url = %summary.url,
        "applied storage event"
    );
    Ok(Some(summary.url))
}
