use crate::{RequestContext, Result, StorageError};
use std::collections::HashMap;

/// The authorization oracle. Action strings follow `<domain>:<action>`,
/// e.g. `volume:attach` or `backup:create`; the target carries at least
/// the owning project and user of the object being acted on.
pub trait PolicyEngine: Send + Sync {
    fn enforce(
        &self,
        context: &RequestContext,
        action: &str,
        target: &HashMap<String, String>,
    ) -> Result<()>;
}

/// Default rules: admins may do anything, project members may act on
/// objects owned by their own project, and `admin_api` actions require
/// admin.
pub struct DefaultPolicy;

impl PolicyEngine for DefaultPolicy {
    fn enforce(
        &self,
        context: &RequestContext,
        action: &str,
        target: &HashMap<String, String>,
    ) -> Result<()> {
        if context.is_admin {
            return Ok(());
        }
        if action.starts_with("admin:") {
            return Err(StorageError::AdminRequired);
        }
        match target.get("project_id") {
            Some(project) if *project == context.project_id => Ok(()),
            _ => Err(StorageError::NotAuthorized {
                action: action.to_string(),
            }),
        }
    }
}

/// Build the standard policy target for an object owned by a context.
pub fn policy_target(context: &RequestContext) -> HashMap<String, String> {
    let mut target = HashMap::new();
    target.insert("project_id".to_string(), context.project_id.clone());
    target.insert("user_id".to_string(), context.user_id.clone());
    target
}
