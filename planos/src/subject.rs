//! Subject directory: the current capability grants and approvals per agent.
//!
//! The engine resolves a plan's subject here at submission time and again at
//! every queue delivery, so grants revoked in between are observed before any
//! RPC is attempted. The in-memory implementation below is the reference;
//! production deployments back this surface with an external store.

use crate::policy_gate::{RunMode, Subject};
use crate::types::CapabilityId;
use std::collections::HashMap;
use std::sync::RwLock;

/// Mutable in-memory registry of subjects keyed by agent identifier.
#[derive(Debug, Default)]
pub struct SubjectDirectory {
    subjects: RwLock<HashMap<String, Subject>>,
}

impl SubjectDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, subject: Subject) {
        let mut subjects = self.subjects.write().unwrap_or_else(|e| e.into_inner());
        subjects.insert(subject.agent.clone(), subject);
    }

    /// Current snapshot of an agent's grants, if registered.
    pub fn subject(&self, agent: &str) -> Option<Subject> {
        let subjects = self.subjects.read().unwrap_or_else(|e| e.into_inner());
        subjects.get(agent).cloned()
    }

    pub fn grant_capability(&self, agent: &str, capability: impl Into<CapabilityId>) {
        let mut subjects = self.subjects.write().unwrap_or_else(|e| e.into_inner());
        if let Some(subject) = subjects.get_mut(agent) {
            let capability = capability.into();
            if !subject.capabilities.contains(&capability) {
                subject.capabilities.push(capability);
            }
        }
    }

    pub fn revoke_capability(&self, agent: &str, capability: &str) {
        let mut subjects = self.subjects.write().unwrap_or_else(|e| e.into_inner());
        if let Some(subject) = subjects.get_mut(agent) {
            subject.capabilities.retain(|c| c != capability);
        }
    }

    pub fn record_approval(&self, agent: &str, capability: impl Into<CapabilityId>, granted: bool) {
        let mut subjects = self.subjects.write().unwrap_or_else(|e| e.into_inner());
        if let Some(subject) = subjects.get_mut(agent) {
            subject.approvals.insert(capability.into(), granted);
        }
    }

    pub fn revoke_approval(&self, agent: &str, capability: &str) {
        let mut subjects = self.subjects.write().unwrap_or_else(|e| e.into_inner());
        if let Some(subject) = subjects.get_mut(agent) {
            subject.approvals.remove(capability);
        }
    }

    pub fn set_run_mode(&self, agent: &str, run_mode: RunMode) {
        let mut subjects = self.subjects.write().unwrap_or_else(|e| e.into_inner());
        if let Some(subject) = subjects.get_mut(agent) {
            subject.run_mode = run_mode;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revocation_is_visible_to_later_lookups() {
        let directory = SubjectDirectory::new();
        directory.register(
            Subject::new("agent-1", RunMode::Consumer)
                .with_capabilities(vec!["repo.read".to_string()])
                .with_approval("repo.write", true),
        );

        let before = directory.subject("agent-1").unwrap();
        assert!(before.holds("repo.read"));
        assert!(before.approval_granted("repo.write"));

        directory.revoke_capability("agent-1", "repo.read");
        directory.revoke_approval("agent-1", "repo.write");

        let after = directory.subject("agent-1").unwrap();
        assert!(!after.holds("repo.read"));
        assert!(!after.approval_granted("repo.write"));
    }

    #[test]
    fn grant_is_idempotent() {
        let directory = SubjectDirectory::new();
        directory.register(Subject::new("agent-1", RunMode::Consumer));
        directory.grant_capability("agent-1", "repo.read");
        directory.grant_capability("agent-1", "repo.read");
        let subject = directory.subject("agent-1").unwrap();
        assert_eq!(subject.capabilities, vec!["repo.read".to_string()]);
    }
}
