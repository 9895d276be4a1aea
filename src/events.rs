// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Types
//!
//! Payloads carried in message envelopes. Each payload is registered under a
//! `type` discriminant and declares whether unknown fields are an error
//! (`Strict`) or only logged (`Lenient`). Webhook payloads are lenient since
//! their shape is owned by GitHub.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// How unknown fields in envelope data are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// Unknown fields fail validation
    Strict,
    /// Unknown fields are logged and dropped
    Lenient,
}

/// A payload that can travel as envelope `data`.
pub trait EventPayload: Serialize + DeserializeOwned + Send + 'static {
    /// Envelope discriminant
    const TYPE: &'static str;
    const STRICTNESS: Strictness;

    fn into_event(self) -> Event;
}

/// Every registered payload, serialized as `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    #[serde(rename = "github-push")]
    GithubPush(GithubPush),

    #[serde(rename = "github-installation")]
    GithubInstallation(InstallationEvent),

    #[serde(rename = "dependency-update")]
    DependencyUpdate(DependencyUpdate),
}

impl Event {
    /// The envelope `type` of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::GithubPush(_) => GithubPush::TYPE,
            Event::GithubInstallation(_) => InstallationEvent::TYPE,
            Event::DependencyUpdate(_) => DependencyUpdate::TYPE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubCommit {
    pub id: Option<String>,
    pub tree_id: Option<String>,
    pub distinct: Option<bool>,
    pub message: Option<String>,
    /// ISO 8601, as sent by GitHub
    pub timestamp: Option<String>,
    pub url: Option<String>,
    pub author: Option<JsonValue>,
    pub committer: Option<JsonValue>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

/// GitHub `push` webhook.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubPush {
    #[serde(rename = "ref")]
    pub git_ref: Option<String>,
    pub before: Option<String>,
    pub after: Option<String>,
    pub created: Option<bool>,
    pub deleted: Option<bool>,
    pub forced: Option<bool>,
    pub base_ref: Option<String>,
    pub compare: Option<String>,
    pub commits: Vec<GithubCommit>,
    pub head_commit: Option<JsonValue>,
    pub repository: Option<JsonValue>,
    pub pusher: Option<JsonValue>,
    pub sender: Option<JsonValue>,
}

impl EventPayload for GithubPush {
    const TYPE: &'static str = "github-push";
    const STRICTNESS: Strictness = Strictness::Lenient;

    fn into_event(self) -> Event {
        Event::GithubPush(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallationAction {
    Created,
    Deleted,
    Suspend,
    Unsuspend,
    NewPermissionsAccepted,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Installation {
    pub id: Option<u64>,
    pub account: Option<JsonValue>,
    pub repository_selection: Option<String>,
    pub access_tokens_url: Option<String>,
    pub repositories_url: Option<String>,
    pub html_url: Option<String>,
    pub app_id: Option<u64>,
    pub target_id: Option<u64>,
    pub target_type: Option<String>,
    pub permissions: Option<JsonValue>,
    pub events: Vec<String>,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
    pub single_file_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Repository {
    pub id: Option<u64>,
    pub name: Option<String>,
    pub full_name: Option<String>,
}

/// GitHub `installation` webhook.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallationEvent {
    pub action: Option<InstallationAction>,
    pub installation: Option<Installation>,
    /// Absent when the installation is being deleted
    pub repositories: Option<Vec<Repository>>,
    pub sender: Option<JsonValue>,
}

impl EventPayload for InstallationEvent {
    const TYPE: &'static str = "github-installation";
    const STRICTNESS: Strictness = Strictness::Lenient;

    fn into_event(self) -> Event {
        Event::GithubInstallation(self)
    }
}

/// Request to check one dependency for new versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencyUpdate {
    pub name: Option<String>,
    pub version: Option<String>,
    /// Package ecosystem, e.g. `npm`
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

impl EventPayload for DependencyUpdate {
    const TYPE: &'static str = "dependency-update";
    const STRICTNESS: Strictness = Strictness::Strict;

    fn into_event(self) -> Event {
        Event::DependencyUpdate(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn should_tag_events_with_their_type() {
        let event = DependencyUpdate {
            name: Some("lodash".to_owned()),
            version: Some("4.17.21".to_owned()),
            kind: Some("npm".to_owned()),
        }
        .into_event();

        assert_eq!(event.kind(), "dependency-update");
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "dependency-update",
                "data": {"name": "lodash", "version": "4.17.21", "type": "npm"}
            })
        );
    }

    #[test]
    fn should_read_github_push_payload() {
        let push: GithubPush = serde_json::from_value(json!({
            "ref": "refs/heads/main",
            "commits": [{"id": "abc", "added": ["README.md"]}],
            "repository": {"full_name": "octo/repo"}
        }))
        .unwrap();

        assert_eq!(push.git_ref.as_deref(), Some("refs/heads/main"));
        assert_eq!(push.commits[0].added, vec!["README.md"]);
        assert_eq!(push.into_event().kind(), "github-push");
    }

    #[test]
    fn should_tolerate_new_installation_actions() {
        let event: InstallationEvent = serde_json::from_value(json!({
            "action": "transferred",
            "installation": {"id": 42, "events": ["push"]}
        }))
        .unwrap();

        assert_eq!(event.action, Some(InstallationAction::Unknown));
        assert_eq!(event.installation.unwrap().id, Some(42));
        assert_eq!(event.repositories, None);
    }
}
