//! Agent resolution: recipient addresses to matched agent ids.

use std::sync::Arc;

use tracing::debug;

use crate::error::DatabaseError;
use crate::store::Database;

pub struct AgentResolver {
    db: Arc<dyn Database>,
}

impl AgentResolver {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Distinct agents in the workspace whose mailboxes intersect
    /// `recipients`. Expects normalized (lower-cased) addresses.
    pub async fn resolve(
        &self,
        workspace_id: &str,
        recipients: &[String],
    ) -> Result<Vec<String>, DatabaseError> {
        if recipients.is_empty() {
            return Ok(Vec::new());
        }
        let agents = self.db.agents_for_addresses(workspace_id, recipients).await?;
        debug!(
            workspace_id,
            recipients = recipients.len(),
            agents = agents.len(),
            "Resolved agents"
        );
        Ok(agents)
    }
}
