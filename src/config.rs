//! Configuração do processador de jobs carregada a partir de `pnpjob.toml`.
//!
//! A struct [`ProcessorConfig`] contém os orçamentos de retentativa, as
//! velocidades e o nível de log. Valores não presentes no arquivo usam
//! defaults sensíveis. A variável de ambiente `PNPJOB_LOG` tem precedência
//! sobre o arquivo para o nível de log.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Nome do arquivo de configuração procurado no diretório atual.
pub const CONFIG_FILE: &str = "pnpjob.toml";

/// Configuração de nível superior carregada de `pnpjob.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Retentativas de alimentação por alimentador antes de desabilitá-lo.
    #[serde(default = "default_feed_retry_count")]
    pub feed_retry_count: u32,

    /// Retentativas de pick antes de falhar o posicionamento.
    #[serde(default)]
    pub pick_retry_count: u32,

    /// Retentativas de alinhamento por visão.
    #[serde(default = "default_align_retry_count")]
    pub align_retry_count: u32,

    /// Estaciona o cabeçote ao final de um job concluído.
    #[serde(default)]
    pub park_when_complete: bool,

    /// Fator de velocidade para movimentos até a altura segura.
    #[serde(default = "default_speed")]
    pub safe_z_speed: f64,

    /// Fator de velocidade para os demais movimentos.
    #[serde(default = "default_speed")]
    pub move_speed: f64,

    /// Filtro padrão do `tracing` quando `RUST_LOG` não está definido.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Valor padrão para retentativas de alimentação: 3.
fn default_feed_retry_count() -> u32 {
    3
}

// Valor padrão para retentativas de alinhamento: 1.
fn default_align_retry_count() -> u32 {
    1
}

fn default_speed() -> f64 {
    1.0
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            feed_retry_count: default_feed_retry_count(),
            pick_retry_count: 0,
            align_retry_count: default_align_retry_count(),
            park_when_complete: false,
            safe_z_speed: default_speed(),
            move_speed: default_speed(),
            log_level: default_log_level(),
        }
    }
}

impl ProcessorConfig {
    /// Carrega a configuração de `pnpjob.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        let path = Path::new(CONFIG_FILE);
        let config = if path.exists() {
            Self::read(path)?
        } else {
            Self::default()
        };
        Ok(config.with_env())
    }

    /// Carrega a configuração de um caminho explícito, que precisa existir.
    pub fn load_from(path: &Path) -> Result<Self> {
        Ok(Self::read(path)?.with_env())
    }

    fn read(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config in {}", path.display()))
    }

    // Variável de ambiente tem precedência sobre o arquivo para o nível de log.
    fn with_env(mut self) -> Self {
        if let Ok(level) = std::env::var("PNPJOB_LOG")
            && !level.is_empty()
        {
            self.log_level = level;
        }
        self
    }
}
