use serde::{Deserialize, Serialize};

/// Identity and scope of the request being served. Passed through every
/// layer so that policy checks and quota accounting see the same subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub project_id: String,
    pub user_id: String,
    pub is_admin: bool,
}

impl RequestContext {
    pub fn new(project_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            user_id: user_id.into(),
            is_admin: false,
        }
    }

    pub fn admin(project_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            user_id: user_id.into(),
            is_admin: true,
        }
    }

    /// An admin-scoped copy of this context, used for internal operations
    /// that must see all records regardless of project.
    pub fn elevated(&self) -> Self {
        Self {
            is_admin: true,
            ..self.clone()
        }
    }
}
