//! In-process store with the same save semantics as the SQLite store.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::HealthCheckStore;
use crate::model::HealthCheck;

#[derive(Default)]
pub struct MemoryStore {
    // (creation sequence, document), keyed by id
    checks: RwLock<BTreeMap<String, (u64, HealthCheck)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HealthCheckStore for MemoryStore {
    async fn load(&self, id: &str) -> Result<Option<HealthCheck>> {
        Ok(self.checks.read().await.get(id).map(|(_, c)| c.clone()))
    }

    async fn save(&self, check: &HealthCheck) -> Result<Option<HealthCheck>> {
        let mut checks = self.checks.write().await;

        let stored = match &check.id {
            Some(id) => match checks.get_mut(id) {
                Some((_, stored)) => stored,
                None => return Ok(None),
            },
            None => {
                let id = Uuid::new_v4().to_string();
                let next_seq = checks.values().map(|(seq, _)| *seq + 1).max().unwrap_or(0);
                let mut fresh = check.clone();
                fresh.id = Some(id.clone());
                fresh.execution_logs.clear();
                &mut checks.entry(id).or_insert((next_seq, fresh)).1
            }
        };

        for log in &check.execution_logs {
            match stored.execution_logs.iter_mut().find(|l| l.id == log.id) {
                Some(existing) if !existing.is_terminal() => *existing = log.clone(),
                Some(_) => {}
                None => stored.execution_logs.push(log.clone()),
            }
        }

        Ok(Some(stored.clone()))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.checks.write().await.remove(id);
        Ok(())
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.checks.read().await.contains_key(id))
    }

    async fn list_all(&self) -> Result<Vec<HealthCheck>> {
        let checks = self.checks.read().await;
        let mut all: Vec<_> = checks.values().collect();
        all.sort_by_key(|(seq, _)| *seq);
        Ok(all.into_iter().map(|(_, c)| c.clone()).collect())
    }
}
