//! Domain Models - Locally Stored Entities
//!
//! Defines the versioned objects the application keeps offline:
//! - Bookmark: synced against the remote backend through the mutation queue
//! - Conversation: AI chat history
//! - Note: free-form notes
//!
//! Every entity carries a `version` that is incremented on each local
//! mutation; version comparison (never wall-clock time) decides conflicts.

use crate::storage::Entity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

// ============================================================================
// Principal
// ============================================================================

/// Authenticated identity on whose behalf storage and sync run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub email: String,
    pub display_name: String,
}

// ============================================================================
// Bookmarks
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon_url: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bookmark {
    pub fn new(user_id: &str, title: &str, url: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            url: url.to_string(),
            description: None,
            tags: Vec::new(),
            folder: None,
            favicon_url: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a partial update and bump the version
    pub fn apply(&mut self, patch: &BookmarkPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(url) = &patch.url {
            self.url = url.clone();
        }
        if let Some(description) = &patch.description {
            self.description = Some(description.clone());
        }
        if let Some(tags) = &patch.tags {
            self.tags = tags.clone();
        }
        if let Some(folder) = &patch.folder {
            self.folder = Some(folder.clone());
        }
        if let Some(favicon_url) = &patch.favicon_url {
            self.favicon_url = Some(favicon_url.clone());
        }
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

/// Fields accepted when creating a bookmark
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookmarkDraft {
    pub title: String,
    pub url: String,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub folder: Option<String>,
    pub favicon_url: Option<String>,
}

/// Partial update; `None` leaves a field untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookmarkPatch {
    pub title: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub folder: Option<String>,
    pub favicon_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BookmarkFilter {
    pub folder: Option<String>,
    pub tag: Option<String>,
    /// Case-insensitive match on title, url and description
    pub search: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookmarkSort {
    Created,
    Updated,
    Title,
}

impl Entity for Bookmark {
    const COLLECTION: &'static str = "bookmarks";
    type Filter = BookmarkFilter;
    type SortField = BookmarkSort;

    fn id(&self) -> &str {
        &self.id
    }

    fn owner_id(&self) -> &str {
        &self.user_id
    }

    fn matches(&self, filter: &BookmarkFilter) -> bool {
        if let Some(folder) = &filter.folder {
            if self.folder.as_deref() != Some(folder.as_str()) {
                return false;
            }
        }
        if let Some(tag) = &filter.tag {
            if !self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
                return false;
            }
        }
        if let Some(search) = &filter.search {
            let needle = search.to_lowercase();
            let haystack = format!(
                "{} {} {}",
                self.title,
                self.url,
                self.description.as_deref().unwrap_or("")
            )
            .to_lowercase();
            if !haystack.contains(&needle) {
                return false;
            }
        }
        true
    }

    fn compare_by(&self, other: &Self, field: BookmarkSort) -> Ordering {
        match field {
            BookmarkSort::Created => self.created_at.cmp(&other.created_at),
            BookmarkSort::Updated => self.updated_at.cmp(&other.updated_at),
            BookmarkSort::Title => self.title.to_lowercase().cmp(&other.title.to_lowercase()),
        }
    }
}

// ============================================================================
// Conversations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub archived: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(user_id: &str, title: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            messages: Vec::new(),
            archived: false,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push_message(&mut self, role: MessageRole, content: &str) {
        let now = Utc::now();
        self.messages.push(ChatMessage {
            role,
            content: content.to_string(),
            created_at: now,
        });
        self.version += 1;
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConversationFilter {
    pub archived: Option<bool>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationSort {
    Updated,
    Title,
}

impl Entity for Conversation {
    const COLLECTION: &'static str = "conversations";
    type Filter = ConversationFilter;
    type SortField = ConversationSort;

    fn id(&self) -> &str {
        &self.id
    }

    fn owner_id(&self) -> &str {
        &self.user_id
    }

    fn matches(&self, filter: &ConversationFilter) -> bool {
        if let Some(archived) = filter.archived {
            if self.archived != archived {
                return false;
            }
        }
        if let Some(search) = &filter.search {
            let needle = search.to_lowercase();
            let in_title = self.title.to_lowercase().contains(&needle);
            let in_messages = self
                .messages
                .iter()
                .any(|m| m.content.to_lowercase().contains(&needle));
            if !in_title && !in_messages {
                return false;
            }
        }
        true
    }

    fn compare_by(&self, other: &Self, field: ConversationSort) -> Ordering {
        match field {
            ConversationSort::Updated => self.updated_at.cmp(&other.updated_at),
            ConversationSort::Title => self.title.to_lowercase().cmp(&other.title.to_lowercase()),
        }
    }
}

// ============================================================================
// Notes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub pinned: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Note {
    pub fn new(user_id: &str, title: &str, content: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            content: content.to_string(),
            tags: Vec::new(),
            pinned: false,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NoteFilter {
    pub pinned: Option<bool>,
    pub tag: Option<String>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteSort {
    Updated,
    Title,
    /// Pinned notes first, then most recently updated
    PinnedFirst,
}

impl Entity for Note {
    const COLLECTION: &'static str = "notes";
    type Filter = NoteFilter;
    type SortField = NoteSort;

    fn id(&self) -> &str {
        &self.id
    }

    fn owner_id(&self) -> &str {
        &self.user_id
    }

    fn matches(&self, filter: &NoteFilter) -> bool {
        if let Some(pinned) = filter.pinned {
            if self.pinned != pinned {
                return false;
            }
        }
        if let Some(tag) = &filter.tag {
            if !self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
                return false;
            }
        }
        if let Some(search) = &filter.search {
            let needle = search.to_lowercase();
            if !self.title.to_lowercase().contains(&needle)
                && !self.content.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        true
    }

    fn compare_by(&self, other: &Self, field: NoteSort) -> Ordering {
        match field {
            NoteSort::Updated => self.updated_at.cmp(&other.updated_at),
            NoteSort::Title => self.title.to_lowercase().cmp(&other.title.to_lowercase()),
            NoteSort::PinnedFirst => other
                .pinned
                .cmp(&self.pinned)
                .then_with(|| other.updated_at.cmp(&self.updated_at)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bookmark_apply_bumps_version() {
        let mut bookmark = Bookmark::new("user-1", "Rust", "https://rust-lang.org");
        assert_eq!(bookmark.version, 1);

        bookmark.apply(&BookmarkPatch {
            title: Some("Rust Lang".to_string()),
            tags: Some(vec!["lang".to_string()]),
            ..Default::default()
        });

        assert_eq!(bookmark.version, 2);
        assert_eq!(bookmark.title, "Rust Lang");
        assert_eq!(bookmark.url, "https://rust-lang.org");
        assert_eq!(bookmark.tags, vec!["lang".to_string()]);
    }

    #[test]
    fn test_bookmark_serialization_skips_empty_options() {
        let bookmark = Bookmark::new("user-1", "Rust", "https://rust-lang.org");
        let json = serde_json::to_value(&bookmark).unwrap();

        assert!(json.get("description").is_none());
        assert_eq!(json["version"], 1);

        let back: Bookmark = serde_json::from_value(json).unwrap();
        assert_eq!(back, bookmark);
    }

    #[test]
    fn test_conversation_push_message() {
        let mut conversation = Conversation::new("user-1", "Chat");
        conversation.push_message(MessageRole::User, "Summarize this page");

        assert_eq!(conversation.messages.len(), 1);
        assert_eq!(conversation.version, 2);
        assert!(conversation.matches(&ConversationFilter {
            search: Some("summarize".to_string()),
            ..Default::default()
        }));
    }

    #[test]
    fn test_bookmark_tag_filter_is_case_insensitive() {
        let mut bookmark = Bookmark::new("user-1", "Docs", "https://docs.rs");
        bookmark.tags = vec!["Rust".to_string()];

        assert!(bookmark.matches(&BookmarkFilter {
            tag: Some("rust".to_string()),
            ..Default::default()
        }));
    }
}
