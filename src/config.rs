//! Configuração do hub carregada a partir de `collecthub.toml`.
//!
//! A struct [`HubConfig`] contém todos os parâmetros configuráveis: tamanho do
//! pool de workers, capacidades dos dois limitadores, política de backoff e
//! modo de encerramento do stream de resultados.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `COLLECTHUB_WORKERS` tem precedência sobre o arquivo.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::error::HubError;
use crate::registry::validate_options;
use crate::state_machine::JobOptions;

/// Nome do arquivo de configuração procurado no diretório atual.
pub const CONFIG_FILE: &str = "collecthub.toml";

/// Variável de ambiente que sobrescreve `workers`.
pub const WORKERS_ENV: &str = "COLLECTHUB_WORKERS";

/// Configuração de nível superior carregada de `collecthub.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Número de workers concorrentes no pool.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacidade do limitador de recuperação (descoberta + download).
    #[serde(default = "default_retrieval_capacity")]
    pub retrieval_capacity: usize,

    /// Capacidade do limitador de extração (chamadas ao LLM).
    #[serde(default = "default_extraction_capacity")]
    pub extraction_capacity: usize,

    /// Parâmetros do backoff exponencial entre tentativas.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Quando `stream_results()` deve encerrar.
    #[serde(default)]
    pub stream_close: StreamClose,

    /// Opções aplicadas a jobs submetidos sem opções explícitas.
    #[serde(default)]
    pub defaults: JobOptions,
}

/// Parâmetros do backoff: `min(max, base * multiplier^(n-1))` com jitter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BackoffConfig {
    /// Atraso base em milissegundos.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Fator multiplicativo por tentativa.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Teto do atraso em milissegundos.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Fração de jitter uniforme, em [0, 1].
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

/// Política de encerramento do stream de resultados.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamClose {
    /// Encerra quando todos os jobs conhecidos estão terminais.
    #[default]
    WhenIdle,
    /// Permanece aberto para submissões futuras até o shutdown do hub.
    KeepOpen,
}

// Valor padrão para workers: 4.
fn default_workers() -> usize {
    4
}

// Valor padrão para o limitador de recuperação: 5 (como o limite de scrapes concorrentes).
fn default_retrieval_capacity() -> usize {
    5
}

// Valor padrão para o limitador de extração: 8.
fn default_extraction_capacity() -> usize {
    8
}

// Valor padrão para o atraso base: 500ms.
fn default_base_delay_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

// Valor padrão para o teto: 30s.
fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            retrieval_capacity: default_retrieval_capacity(),
            extraction_capacity: default_extraction_capacity(),
            backoff: BackoffConfig::default(),
            stream_close: StreamClose::default(),
            defaults: JobOptions::default(),
        }
    }
}

impl HubConfig {
    /// Carrega a configuração de `collecthub.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Carrega a configuração de um caminho arbitrário.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<HubConfig>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração.
        if let Ok(raw) = std::env::var(WORKERS_ENV)
            && !raw.is_empty()
        {
            config.apply_workers_override(&raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_workers_override(&mut self, raw: &str) -> Result<()> {
        self.workers = raw
            .trim()
            .parse()
            .with_context(|| format!("{WORKERS_ENV} must be a positive integer, got {raw:?}"))?;
        Ok(())
    }

    /// Rejeita configurações inválidas no momento da construção do hub.
    pub fn validate(&self) -> std::result::Result<(), HubError> {
        if self.workers == 0 {
            return Err(HubError::Config("workers must be at least 1".into()));
        }
        let b = &self.backoff;
        if !b.multiplier.is_finite() || b.multiplier < 1.0 {
            return Err(HubError::Config(format!(
                "backoff.multiplier must be >= 1, got {}",
                b.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&b.jitter) {
            return Err(HubError::Config(format!(
                "backoff.jitter must be within [0, 1], got {}",
                b.jitter
            )));
        }
        if b.max_delay_ms < b.base_delay_ms {
            return Err(HubError::Config(
                "backoff.max_delay_ms must not be below backoff.base_delay_ms".into(),
            ));
        }
        validate_options(&self.defaults).map_err(|e| match e {
            HubError::Validation(msg) => HubError::Config(format!("defaults: {msg}")),
            other => other,
        })
    }
}
