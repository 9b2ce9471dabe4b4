use analysis_core::{ProviderKind, SubScoreProvider};
use std::sync::Arc;
use std::time::Duration;

use crate::config::OrchestratorConfig;
use crate::http_provider::HttpSubScoreProvider;

/// Static description of an optional provider. Read-only while requests run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderDescriptor {
    pub kind: ProviderKind,
    pub name: String,
    pub enabled: bool,
    /// Blend weight in [0, 1].
    pub weight: f64,
    pub timeout: Duration,
}

impl ProviderDescriptor {
    pub fn new(kind: ProviderKind, weight: f64, timeout: Duration) -> Self {
        Self {
            kind,
            name: kind.name().to_string(),
            enabled: true,
            weight: if weight.is_finite() { weight.clamp(0.0, 1.0) } else { 0.0 },
            timeout,
        }
    }

    pub fn default_weight(kind: ProviderKind) -> f64 {
        match kind {
            ProviderKind::Macroeconomic => 0.15,
            ProviderKind::Sentiment => 0.20,
            ProviderKind::Esg => 0.10,
            ProviderKind::ShortInterest => 0.10,
        }
    }

    pub fn default_for(kind: ProviderKind) -> Self {
        Self::new(kind, Self::default_weight(kind), Duration::from_secs(5))
    }

    fn disabled(kind: ProviderKind) -> Self {
        Self {
            enabled: false,
            ..Self::default_for(kind)
        }
    }
}

/// A descriptor paired with its client. Enabled only when both agree.
#[derive(Clone)]
pub struct RegisteredProvider {
    pub descriptor: ProviderDescriptor,
    client: Option<Arc<dyn SubScoreProvider>>,
}

impl RegisteredProvider {
    pub fn is_enabled(&self) -> bool {
        self.descriptor.enabled && self.client.is_some()
    }

    pub fn client(&self) -> Option<&Arc<dyn SubScoreProvider>> {
        if self.descriptor.enabled {
            self.client.as_ref()
        } else {
            None
        }
    }
}

/// Every optional provider kind, in adjustment order, each enabled or not.
///
/// Built once at startup; nothing mutates it afterwards.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Vec<RegisteredProvider>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    /// Registry with every provider disabled.
    pub fn new() -> Self {
        Self {
            providers: ProviderKind::ADJUSTMENT_ORDER
                .iter()
                .map(|&kind| RegisteredProvider {
                    descriptor: ProviderDescriptor::disabled(kind),
                    client: None,
                })
                .collect(),
        }
    }

    /// Enable `kind` with its default descriptor.
    pub fn with_provider(self, kind: ProviderKind, client: Arc<dyn SubScoreProvider>) -> Self {
        self.with_descriptor(ProviderDescriptor::default_for(kind), Some(client))
    }

    pub fn with_descriptor(
        mut self,
        descriptor: ProviderDescriptor,
        client: Option<Arc<dyn SubScoreProvider>>,
    ) -> Self {
        if let Some(slot) = self
            .providers
            .iter_mut()
            .find(|p| p.descriptor.kind == descriptor.kind)
        {
            *slot = RegisteredProvider { descriptor, client };
        }
        self
    }

    /// HTTP providers for every kind whose endpoint is configured.
    pub fn from_config(config: &OrchestratorConfig) -> anyhow::Result<Self> {
        let timeout = config.provider_timeout();
        let endpoints = [
            (ProviderKind::Macroeconomic, &config.macro_provider_url),
            (ProviderKind::Sentiment, &config.sentiment_provider_url),
            (ProviderKind::Esg, &config.esg_provider_url),
            (ProviderKind::ShortInterest, &config.short_interest_provider_url),
        ];

        let mut registry = Self::new();
        for (kind, url) in endpoints {
            match url {
                Some(url) => {
                    let client = HttpSubScoreProvider::new(kind.name(), url.clone(), timeout)?;
                    let descriptor = ProviderDescriptor::new(
                        kind,
                        ProviderDescriptor::default_weight(kind),
                        timeout,
                    );
                    registry = registry.with_descriptor(descriptor, Some(Arc::new(client)));
                    tracing::info!("Provider {} enabled ({})", kind.name(), url);
                }
                None => tracing::info!("Provider {} disabled (no endpoint configured)", kind.name()),
            }
        }
        Ok(registry)
    }

    pub fn get(&self, kind: ProviderKind) -> Option<&RegisteredProvider> {
        self.providers.iter().find(|p| p.descriptor.kind == kind)
    }

    pub fn is_enabled(&self, kind: ProviderKind) -> bool {
        self.get(kind).map(|p| p.is_enabled()).unwrap_or(false)
    }

    /// All providers in adjustment order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredProvider> {
        self.providers.iter()
    }

    pub fn enabled_descriptors(&self) -> Vec<ProviderDescriptor> {
        self.providers
            .iter()
            .filter(|p| p.is_enabled())
            .map(|p| p.descriptor.clone())
            .collect()
    }
}
