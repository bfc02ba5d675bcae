use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::content::ContentStructure;
use crate::injectable::LocaleMap;

/// Tenant-scoped categorization of templates ("document type" on the
/// wire). Its code is immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentClassification {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub code: String,
    #[serde(default)]
    pub name: LocaleMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Template metadata. Content lives in versions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Template {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub folder_id: Option<Uuid>,
    pub classification_id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Logical deletion; only legal while no version is published.
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Template {
    /// Filename-safe slug of the template name, used as the fallback for
    /// the suggested download filename.
    pub fn filename_slug(&self) -> String {
        let slug: String = self
            .name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        let collapsed = slug
            .split('-')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("-");
        if collapsed.is_empty() {
            "document".to_string()
        } else {
            collapsed
        }
    }
}

/// State machine of a template version. ARCHIVED is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VersionState {
    Draft,
    Scheduled,
    Published,
    Archived,
}

impl VersionState {
    /// Only drafts accept content edits.
    pub fn allows_edit(&self) -> bool {
        matches!(self, VersionState::Draft)
    }

    /// States a production render may use. Drafts and scheduled versions
    /// are preview-only.
    pub fn renderable_in_production(&self) -> bool {
        matches!(self, VersionState::Published)
    }

    pub fn renderable_in_preview(&self) -> bool {
        matches!(
            self,
            VersionState::Published | VersionState::Scheduled | VersionState::Draft
        )
    }
}

impl std::fmt::Display for VersionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VersionState::Draft => "DRAFT",
            VersionState::Scheduled => "SCHEDULED",
            VersionState::Published => "PUBLISHED",
            VersionState::Archived => "ARCHIVED",
        };
        f.write_str(s)
    }
}

/// A versioned snapshot of a template's content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateVersion {
    pub id: Uuid,
    pub template_id: Uuid,
    pub version_number: i32,
    pub name: Option<String>,
    pub state: VersionState,
    pub content: Option<ContentStructure>,
    /// Set while state is SCHEDULED; cleared on fire or cancel.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    /// Optimistic-lock column; every mutation must carry the value it read.
    pub updated_at: DateTime<Utc>,
}

impl TemplateVersion {
    pub fn new_draft(template_id: Uuid, version_number: i32, created_by: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            template_id,
            version_number,
            name: None,
            state: VersionState::Draft,
            content: None,
            scheduled_at: None,
            published_at: None,
            archived_at: None,
            created_by,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_content(&self) -> bool {
        self.content.as_ref().is_some_and(|c| !c.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Node;

    #[test]
    fn state_guards() {
        assert!(VersionState::Draft.allows_edit());
        assert!(!VersionState::Published.allows_edit());
        assert!(!VersionState::Scheduled.allows_edit());
        assert!(!VersionState::Archived.allows_edit());
        assert!(VersionState::Published.renderable_in_production());
        assert!(!VersionState::Draft.renderable_in_production());
        assert!(VersionState::Draft.renderable_in_preview());
    }

    #[test]
    fn filename_slug_collapses_punctuation() {
        let mut t = Template {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            folder_id: None,
            classification_id: None,
            name: "Monthly Invoice (v2)".to_string(),
            description: String::new(),
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(t.filename_slug(), "monthly-invoice-v2");
        t.name = "???".to_string();
        assert_eq!(t.filename_slug(), "document");
    }

    #[test]
    fn new_draft_is_empty() {
        let v = TemplateVersion::new_draft(Uuid::new_v4(), 1, None);
        assert_eq!(v.state, VersionState::Draft);
        assert!(!v.has_content());

        let mut v2 = v.clone();
        v2.content = Some(ContentStructure::new(Node::Doc {
            content: vec![Node::paragraph("hello")],
        }));
        assert!(v2.has_content());
    }
}
