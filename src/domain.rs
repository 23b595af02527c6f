//! Long-lived reference tables (modalities, statuses, contract types, ...).
//!
//! Tables are rebuilt only from the static definitions below and cached under
//! `domain:<name>` with the domain TTL (24h by default).

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};
use tracing::{debug, info};

use crate::{
    cache::CacheService,
    error::{GovernanceError, Result},
    metrics::Metrics,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainTableKind {
    ModalidadesContratacao,
    SituacoesContratacao,
    TiposContrato,
    AmparosLegais,
    PortesEmpresa,
}

impl DomainTableKind {
    pub const ALL: [DomainTableKind; 5] = [
        DomainTableKind::ModalidadesContratacao,
        DomainTableKind::SituacoesContratacao,
        DomainTableKind::TiposContrato,
        DomainTableKind::AmparosLegais,
        DomainTableKind::PortesEmpresa,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DomainTableKind::ModalidadesContratacao => "modalidades_contratacao",
            DomainTableKind::SituacoesContratacao => "situacoes_contratacao",
            DomainTableKind::TiposContrato => "tipos_contrato",
            DomainTableKind::AmparosLegais => "amparos_legais",
            DomainTableKind::PortesEmpresa => "portes_empresa",
        }
    }

    /// Cache key of the table.
    pub fn cache_key(self) -> String {
        format!("domain:{}", self.name())
    }

    /// Static source of the table.
    fn source(self) -> &'static [(u32, &'static str)] {
        match self {
            DomainTableKind::ModalidadesContratacao => MODALIDADES_CONTRATACAO,
            DomainTableKind::SituacoesContratacao => SITUACOES_CONTRATACAO,
            DomainTableKind::TiposContrato => TIPOS_CONTRATO,
            DomainTableKind::AmparosLegais => AMPAROS_LEGAIS,
            DomainTableKind::PortesEmpresa => PORTES_EMPRESA,
        }
    }

    fn build(self) -> DomainTable {
        DomainTable {
            name: self.name().to_string(),
            entries: self
                .source()
                .iter()
                .map(|(code, label)| (*code, label.to_string()))
                .collect(),
        }
    }
}

impl fmt::Display for DomainTableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DomainTableKind {
    type Err = GovernanceError;

    fn from_str(s: &str) -> Result<Self> {
        DomainTableKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| GovernanceError::UnknownDomainTable(s.to_string()))
    }
}

/// A code → label mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainTable {
    pub name: String,
    pub entries: BTreeMap<u32, String>,
}

impl DomainTable {
    pub fn label(&self, code: u32) -> Option<&str> {
        self.entries.get(&code).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct DomainCacheService {
    cache: Arc<CacheService>,
    ttl_secs: u64,
    metrics: Arc<Metrics>,
}

impl DomainCacheService {
    pub fn new(cache: Arc<CacheService>, ttl_secs: u64, metrics: Arc<Metrics>) -> Self {
        Self {
            cache,
            ttl_secs,
            metrics,
        }
    }

    /// Cached table, rebuilt from its static source on a miss.
    pub async fn get_table(&self, name: &str) -> Result<DomainTable> {
        let kind: DomainTableKind = name.parse()?;
        Ok(self.table(kind).await)
    }

    pub async fn table(&self, kind: DomainTableKind) -> DomainTable {
        match self.cache.get::<DomainTable>(&kind.cache_key()).await {
            Some(table) if !table.is_empty() => table,
            _ => self.rebuild(kind).await,
        }
    }

    /// Drop the cached copy and rebuild it.
    pub async fn refresh_table(&self, name: &str) -> Result<DomainTable> {
        let kind: DomainTableKind = name.parse()?;
        self.cache.delete(&kind.cache_key()).await;
        Ok(self.rebuild(kind).await)
    }

    /// Make sure every table is cached; returns how many tables are served.
    pub async fn warm_all(&self) -> usize {
        let tables = join_all(DomainTableKind::ALL.into_iter().map(|kind| self.table(kind))).await;
        info!(tables = tables.len(), "Domain caches updated");
        tables.len()
    }

    async fn rebuild(&self, kind: DomainTableKind) -> DomainTable {
        let table = kind.build();
        let cached = self
            .cache
            .set(&kind.cache_key(), &table, Some(self.ttl_secs))
            .await;
        debug!(table = kind.name(), entries = table.len(), cached, "Rebuilt domain table");
        self.metrics.record_domain_table_rebuild(kind.name());
        table
    }
}

const MODALIDADES_CONTRATACAO: &[(u32, &str)] = &[
    (1, "Concorrência"),
    (2, "Tomada de Preços"),
    (3, "Convite"),
    (4, "Concurso"),
    (5, "Leilão"),
    (6, "Pregão Eletrônico"),
    (7, "Pregão Presencial"),
    (8, "Dispensa de Licitação"),
    (9, "Inexigibilidade de Licitação"),
    (10, "Diálogo Competitivo"),
    (11, "Procedimento de Manifestação de Interesse"),
    (12, "Credenciamento"),
    (13, "Pré-qualificação"),
    (14, "Concurso de Projeto"),
    (15, "Licitação para Contratação Integrada"),
    (16, "Licitação para Concessão"),
    (17, "Compras Governamentais"),
];

const SITUACOES_CONTRATACAO: &[(u32, &str)] = &[
    (1, "Planejamento"),
    (2, "Publicada"),
    (3, "Aberta"),
    (4, "Em Análise"),
    (5, "Homologada"),
    (6, "Adjudicada"),
    (7, "Cancelada"),
    (8, "Revogada"),
    (9, "Anulada"),
    (10, "Fracassada"),
    (11, "Deserta"),
    (12, "Suspensa"),
    (13, "Prorrogada"),
    (14, "Reabertura"),
    (15, "Republicada"),
];

const TIPOS_CONTRATO: &[(u32, &str)] = &[
    (1, "Compra"),
    (2, "Serviço"),
    (3, "Obra"),
    (4, "Serviço de Engenharia"),
    (5, "Concessão"),
    (6, "Permissão"),
    (7, "Alienação"),
    (8, "Locação"),
    (9, "Fornecimento"),
    (10, "Prestação de Serviço"),
];

const AMPAROS_LEGAIS: &[(u32, &str)] = &[
    (1, "Art. 24, II - Guerra ou grave perturbação da ordem"),
    (2, "Art. 24, IV - Emergência ou calamidade pública"),
    (3, "Art. 24, V - Não acudiram interessados"),
    (4, "Art. 24, VIII - Segurança nacional"),
    (5, "Art. 24, X - Compra ou locação de imóvel"),
    (6, "Art. 25, I - Exclusividade de fornecimento"),
    (7, "Art. 25, II - Serviços técnicos profissionais"),
    (8, "Art. 25, III - Contratação de pessoa jurídica"),
    (9, "Art. 75 - Acordo-quadro"),
    (10, "Art. 76 - Ata de registro de preços"),
];

const PORTES_EMPRESA: &[(u32, &str)] = &[
    (1, "Micro Empresa"),
    (2, "Pequena Empresa"),
    (3, "Média Empresa"),
    (4, "Grande Empresa"),
    (5, "Cooperativa"),
    (6, "Organização Social"),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{CacheBackend, InMemoryBackend},
        config::CacheConfig,
        utils::ManualClock,
    };
    use std::time::Duration;

    fn service() -> (DomainCacheService, Arc<InMemoryBackend>, ManualClock, Arc<Metrics>) {
        let clock = ManualClock::new(1_700_000_000.0);
        let backend = Arc::new(InMemoryBackend::with_clock(Arc::new(clock.clone())));
        let metrics = Arc::new(Metrics::default());
        let cache = Arc::new(CacheService::new(
            backend.clone(),
            &CacheConfig::default(),
            metrics.clone(),
        ));
        let domain = DomainCacheService::new(cache, 86_400, metrics.clone());
        (domain, backend, clock, metrics)
    }

    #[tokio::test]
    async fn test_get_table_builds_and_caches() {
        let (domain, backend, _clock, _metrics) = service();
        let table = domain.get_table("modalidades_contratacao").await.unwrap();
        assert_eq!(table.len(), 17);
        assert_eq!(table.label(6), Some("Pregão Eletrônico"));
        assert!(backend.exists("domain:modalidades_contratacao").await.unwrap());
    }

    #[tokio::test]
    async fn test_cached_table_is_served_until_ttl() {
        let (domain, backend, clock, _metrics) = service();
        domain.get_table("tipos_contrato").await.unwrap();

        // A cached copy wins over the static source while it lives.
        let stale = DomainTable {
            name: "tipos_contrato".into(),
            entries: [(1, "Compra antiga".to_string())].into_iter().collect(),
        };
        backend
            .set_ex("domain:tipos_contrato", &serde_json::to_string(&stale).unwrap(), 86_400)
            .await
            .unwrap();
        assert_eq!(domain.get_table("tipos_contrato").await.unwrap(), stale);

        clock.advance(Duration::from_secs(86_400));
        assert_eq!(domain.get_table("tipos_contrato").await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_unknown_table_is_an_error() {
        let (domain, _backend, _clock, _metrics) = service();
        assert!(matches!(
            domain.get_table("fornecedores").await,
            Err(GovernanceError::UnknownDomainTable(name)) if name == "fornecedores"
        ));
    }

    #[tokio::test]
    async fn test_warm_all_caches_every_table() {
        let (domain, backend, _clock, _metrics) = service();
        assert_eq!(domain.warm_all().await, 5);
        for kind in DomainTableKind::ALL {
            assert!(backend.exists(&kind.cache_key()).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_refresh_table_rebuilds_from_source() {
        let (domain, backend, _clock, _metrics) = service();
        backend
            .set_ex("domain:portes_empresa", r#"{"name":"portes_empresa","entries":{"1":"X"}}"#, 86_400)
            .await
            .unwrap();
        let table = domain.refresh_table("portes_empresa").await.unwrap();
        assert_eq!(table.label(1), Some("Micro Empresa"));
        assert_eq!(table.len(), 6);
    }

    #[tokio::test]
    async fn test_backend_down_still_serves_tables() {
        let (domain, backend, _clock, _metrics) = service();
        backend.set_available(false);
        let table = domain.get_table("amparos_legais").await.unwrap();
        assert_eq!(table.len(), 10);
        assert_eq!(table.label(10), Some("Art. 76 - Ata de registro de preços"));
    }
}
