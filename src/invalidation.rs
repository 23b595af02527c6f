use std::{fmt, str::FromStr, sync::Arc};
use tracing::{debug, info, warn};

use crate::{backend::SharedBackend, metrics::Metrics};

/// Removes every key matching a glob pattern.
///
/// Matching keys are collected first and then deleted with a single bulk
/// call. Keys written between the scan and the delete survive; that is
/// accepted for write-path invalidation.
///
/// Rate-limit ledgers live in the same keyspace but belong to the limiter:
/// keys under the ledger prefix are never deleted, whatever the pattern.
pub struct PatternInvalidator {
    backend: SharedBackend,
    ledger_prefix: String,
    metrics: Arc<Metrics>,
}

impl PatternInvalidator {
    pub fn new(backend: SharedBackend, ledger_prefix: &str, metrics: Arc<Metrics>) -> Self {
        Self {
            backend,
            ledger_prefix: format!("{}:", ledger_prefix),
            metrics,
        }
    }

    /// Delete all keys matching `pattern`; returns how many were removed.
    /// Backend failures are logged and reported as zero.
    pub async fn clear_pattern(&self, pattern: &str) -> u64 {
        let keys: Vec<String> = match self.backend.keys(pattern).await {
            Ok(keys) => keys
                .into_iter()
                .filter(|key| !key.starts_with(&self.ledger_prefix))
                .collect(),
            Err(e) => {
                warn!(pattern, error = %e, "Key scan failed, nothing invalidated");
                return 0;
            }
        };
        if keys.is_empty() {
            debug!(pattern, "No keys to invalidate");
            return 0;
        }

        match self.backend.delete(&keys).await {
            Ok(deleted) => {
                debug!(pattern, deleted, "Invalidated cache keys");
                self.metrics.record_invalidated_keys(deleted);
                deleted
            }
            Err(e) => {
                warn!(pattern, keys = keys.len(), error = %e, "Bulk delete failed");
                0
            }
        }
    }

    /// Clear the cached views of one entity family after a write.
    pub async fn invalidate_entity(&self, entity: Entity, id: Option<&str>) -> u64 {
        let mut total = 0;
        for pattern in EntityInvalidation::patterns(entity, id) {
            total += self.clear_pattern(&pattern).await;
        }
        info!(entity = %entity, id = id.unwrap_or("-"), deleted = total, "Entity cache invalidated");
        total
    }

    /// Drop every key in the cache namespace.
    pub async fn clear_all(&self) -> u64 {
        self.clear_pattern("*").await
    }
}

/// Business entities whose cached views are invalidated together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entity {
    Pca,
    Contratacao,
    Ata,
    Contrato,
}

impl Entity {
    pub const ALL: [Entity; 4] = [Entity::Pca, Entity::Contratacao, Entity::Ata, Entity::Contrato];

    pub fn as_str(self) -> &'static str {
        match self {
            Entity::Pca => "pca",
            Entity::Contratacao => "contratacao",
            Entity::Ata => "ata",
            Entity::Contrato => "contrato",
        }
    }

    /// Prefix of the paginated list keys.
    fn list_prefix(self) -> &'static str {
        match self {
            Entity::Pca => "pca_list",
            Entity::Contratacao => "contratacoes_list",
            Entity::Ata => "atas_list",
            Entity::Contrato => "contratos_list",
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Entity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pca" => Ok(Entity::Pca),
            "contratacao" | "contratacoes" => Ok(Entity::Contratacao),
            "ata" | "atas" => Ok(Entity::Ata),
            "contrato" | "contratos" => Ok(Entity::Contrato),
            other => Err(format!("unknown entity '{}'", other)),
        }
    }
}

/// Pattern families cleared after a write to an entity.
pub struct EntityInvalidation;

impl EntityInvalidation {
    /// List, statistics and (when an id is given) detail patterns.
    pub fn patterns(entity: Entity, id: Option<&str>) -> Vec<String> {
        let mut patterns = vec![
            format!("{}_*", entity.list_prefix()),
            format!("{}_stats_*", entity.as_str()),
        ];
        if let Some(id) = id {
            patterns.push(format!("{}_{}", entity.as_str(), escape_glob(id)));
        }
        patterns
    }
}

/// Escape glob metacharacters so an id only matches itself.
fn escape_glob(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CacheBackend, InMemoryBackend};

    async fn seeded() -> (PatternInvalidator, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        for key in [
            "pca_list_ano:2024_page:1",
            "pca_list_ano:2024_page:2",
            "pca_stats_2024",
            "pca_1",
            "pca_10",
            "contratacoes_list_page:1",
            "contratacao_stats_geral",
            "contratacao_9",
            "atas_list_page:1",
            "contrato_3",
            "rate_limit:ip:10.0.0.1",
            "rate_limit:/api/v1/ata:user:42",
        ] {
            backend.set_ex(key, "{}", 300).await.unwrap();
        }
        let invalidator =
            PatternInvalidator::new(backend.clone(), "rate_limit", Arc::new(Metrics::default()));
        (invalidator, backend)
    }

    #[test]
    fn test_entity_patterns() {
        assert_eq!(
            EntityInvalidation::patterns(Entity::Pca, Some("1")),
            vec!["pca_list_*", "pca_stats_*", "pca_1"]
        );
        assert_eq!(
            EntityInvalidation::patterns(Entity::Contratacao, None),
            vec!["contratacoes_list_*", "contratacao_stats_*"]
        );
        assert_eq!(
            EntityInvalidation::patterns(Entity::Ata, Some("a*b")),
            vec!["atas_list_*", "ata_stats_*", r"ata_a\*b"]
        );
        assert_eq!(
            EntityInvalidation::patterns(Entity::Contrato, Some("3"))[0],
            "contratos_list_*"
        );
    }

    #[test]
    fn test_entity_parsing() {
        assert_eq!("PCA".parse::<Entity>().unwrap(), Entity::Pca);
        assert_eq!("contratacoes".parse::<Entity>().unwrap(), Entity::Contratacao);
        assert!("fornecedor".parse::<Entity>().is_err());
    }

    #[tokio::test]
    async fn test_clear_pattern_removes_only_matches() {
        let (invalidator, backend) = seeded().await;
        assert_eq!(invalidator.clear_pattern("pca_list_*").await, 2);
        assert!(!backend.exists("pca_list_ano:2024_page:1").await.unwrap());
        assert!(backend.exists("pca_stats_2024").await.unwrap());
        assert_eq!(invalidator.clear_pattern("pca_list_*").await, 0);
    }

    #[tokio::test]
    async fn test_invalidate_entity_with_id() {
        let (invalidator, backend) = seeded().await;
        assert_eq!(invalidator.invalidate_entity(Entity::Pca, Some("1")).await, 4);
        assert!(backend.exists("pca_10").await.unwrap());
        assert!(backend.exists("contratacao_9").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalidate_entity_without_id_keeps_details() {
        let (invalidator, backend) = seeded().await;
        assert_eq!(invalidator.invalidate_entity(Entity::Contratacao, None).await, 2);
        assert!(backend.exists("contratacao_9").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_all() {
        let (invalidator, backend) = seeded().await;
        assert_eq!(invalidator.clear_all().await, 10);
        assert_eq!(backend.len(), 2);
    }

    #[tokio::test]
    async fn test_backend_failure_returns_zero() {
        let (invalidator, backend) = seeded().await;
        backend.set_available(false);
        assert_eq!(invalidator.clear_pattern("*").await, 0);
        backend.set_available(true);
        assert_eq!(backend.len(), 12);
    }

    #[tokio::test]
    async fn test_ledgers_survive_broad_patterns() {
        let (invalidator, backend) = seeded().await;
        assert_eq!(invalidator.clear_pattern("rate_limit:*").await, 0);
        assert_eq!(invalidator.clear_pattern("*_stats_*").await, 2);
        assert_eq!(invalidator.clear_all().await, 8);
        assert!(backend.exists("rate_limit:ip:10.0.0.1").await.unwrap());
        assert!(backend.exists("rate_limit:/api/v1/ata:user:42").await.unwrap());
    }
}
