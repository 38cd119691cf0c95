//! Configuração do mediabatch carregada a partir de `mediabatch.toml`.
//!
//! A struct [`BatchConfig`] contém todos os parâmetros ajustáveis dos pipelines.
//! Campos ausentes no arquivo usam valores padrão.
//! A variável de ambiente `MEDIABATCH_STATE_DIR` tem precedência sobre o arquivo.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "mediabatch.toml";

/// Configuração de nível superior carregada de `mediabatch.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Diretório com worklists, journals e ledgers, um subdiretório por estágio.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Executável do ffmpeg.
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,

    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,

    /// Intervalo entre redesenhos do painel de progresso.
    #[serde(default = "default_render_interval_ms")]
    pub render_interval_ms: u64,

    /// Número de workers por estágio. `None` deriva o valor dos núcleos disponíveis.
    #[serde(default)]
    pub measure_jobs: Option<usize>,
    #[serde(default)]
    pub apply_jobs: Option<usize>,
    #[serde(default)]
    pub hls_jobs: Option<usize>,

    #[serde(default)]
    pub loudness: LoudnessTarget,

    #[serde(default)]
    pub hls: HlsSettings,
}

/// Alvos EBU R128 repassados ao filtro `loudnorm`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoudnessTarget {
    #[serde(default = "default_integrated")]
    pub integrated: f64,
    #[serde(default = "default_true_peak")]
    pub true_peak: f64,
    #[serde(default = "default_lra")]
    pub lra: f64,

    /// Extensões (sem ponto, sem distinção de maiúsculas) consideradas na varredura.
    #[serde(default = "default_audio_extensions")]
    pub extensions: Vec<String>,

    /// Substitui a fonte pela cópia normalizada depois de verificada.
    /// Desligado, a cópia fica ao lado da fonte.
    #[serde(default = "default_replace_source")]
    pub replace_source: bool,
}

/// Parâmetros do empacotamento HLS.
#[derive(Debug, Clone, Deserialize)]
pub struct HlsSettings {
    #[serde(default = "default_bitrates")]
    pub bitrates: Vec<String>,

    #[serde(default = "default_codec")]
    pub codec: String,

    /// Duração alvo de cada segmento, em segundos.
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u32,

    /// Apaga a fonte depois que todas as variantes forem verificadas.
    /// `hls cleanup` faz a mesma remoção depois.
    #[serde(default)]
    pub delete_source: bool,
}

// Valor padrão para o diretório de estado: "mediabatch-state".
fn default_state_dir() -> PathBuf {
    PathBuf::from("mediabatch-state")
}

// Valor padrão para o ffmpeg: procurado no PATH.
fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

// Valor padrão para o ffprobe: procurado no PATH.
fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

// Valor padrão para o intervalo de redesenho: 500ms.
fn default_render_interval_ms() -> u64 {
    500
}

// Valor padrão para a loudness integrada: -24 LUFS.
fn default_integrated() -> f64 {
    -24.0
}

// Valor padrão para o true peak: -2 dBTP.
fn default_true_peak() -> f64 {
    -2.0
}

// Valor padrão para o LRA: 7 LU.
fn default_lra() -> f64 {
    7.0
}

// Valor padrão para as extensões: flac, wav, mp3 e m4a.
fn default_audio_extensions() -> Vec<String> {
    ["flac", "wav", "mp3", "m4a"].iter().map(|s| s.to_string()).collect()
}

// Valor padrão para a substituição da fonte: ligada.
fn default_replace_source() -> bool {
    true
}

// Valor padrão para os bitrates: 128k, 192k, 256k e 320k.
fn default_bitrates() -> Vec<String> {
    ["128k", "192k", "256k", "320k"].iter().map(|s| s.to_string()).collect()
}

// Valor padrão para o codec: "libfdk_aac".
fn default_codec() -> String {
    "libfdk_aac".to_string()
}

// Valor padrão para a duração do segmento: 10s.
fn default_segment_seconds() -> u32 {
    10
}

impl Default for LoudnessTarget {
    fn default() -> Self {
        Self {
            integrated: default_integrated(),
            true_peak: default_true_peak(),
            lra: default_lra(),
            extensions: default_audio_extensions(),
            replace_source: default_replace_source(),
        }
    }
}

impl Default for HlsSettings {
    fn default() -> Self {
        Self {
            bitrates: default_bitrates(),
            codec: default_codec(),
            segment_seconds: default_segment_seconds(),
            delete_source: false,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            render_interval_ms: default_render_interval_ms(),
            measure_jobs: None,
            apply_jobs: None,
            hls_jobs: None,
            loudness: LoudnessTarget::default(),
            hls: HlsSettings::default(),
        }
    }
}

impl BatchConfig {
    /// Carrega `path`, ou `mediabatch.toml` no diretório atual quando nenhum caminho é dado.
    /// Sem o arquivo padrão, usa os valores padrão; um arquivo explícito ausente é erro.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)?
                } else {
                    Self::default()
                }
            }
        };

        // Variável de ambiente tem precedência sobre o arquivo para o diretório de estado.
        if let Ok(dir) = std::env::var("MEDIABATCH_STATE_DIR")
            && !dir.is_empty()
        {
            config.state_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = toml::from_str::<BatchConfig>(&contents)
            .map_err(crate::error::BatchError::from)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        use crate::error::BatchError;

        if self.hls.bitrates.is_empty() {
            return Err(BatchError::Config("hls.bitrates must not be empty".into()).into());
        }
        if let Some(bad) = self
            .hls
            .bitrates
            .iter()
            .find(|b| crate::stages::hls::bandwidth_bps(b).is_none())
        {
            return Err(BatchError::Config(format!("unrecognized hls bitrate {bad:?}")).into());
        }
        if self.loudness.extensions.is_empty() {
            return Err(BatchError::Config("loudness.extensions must not be empty".into()).into());
        }
        if self.render_interval_ms == 0 {
            return Err(BatchError::Config("render_interval_ms must be positive".into()).into());
        }
        Ok(())
    }

    pub fn render_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.render_interval_ms)
    }
}

/// Resolve o número de workers: um valor explícito prevalece, senão o total
/// de núcleos dividido por `divisor`. Nunca menos que um.
pub fn worker_count(configured: Option<usize>, divisor: usize) -> usize {
    if let Some(n) = configured {
        return n.max(1);
    }
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores / divisor.max(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = BatchConfig::default();
        assert_eq!(config.state_dir, PathBuf::from("mediabatch-state"));
        assert_eq!(config.ffmpeg, "ffmpeg");
        assert_eq!(config.render_interval_ms, 500);
        assert_eq!(config.loudness.integrated, -24.0);
        assert_eq!(config.loudness.true_peak, -2.0);
        assert_eq!(config.loudness.lra, 7.0);
        assert!(config.loudness.replace_source);
        assert!(!config.hls.delete_source);
        assert_eq!(config.hls.bitrates, vec!["128k", "192k", "256k", "320k"]);
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            state_dir = "/srv/state"
            hls_jobs = 3

            [loudness]
            integrated = -16.0
            replace_source = false

            [hls]
            bitrates = ["96k"]
            delete_source = true
        "#;
        let config: BatchConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/srv/state"));
        assert_eq!(config.hls_jobs, Some(3));
        assert_eq!(config.measure_jobs, None);
        assert_eq!(config.loudness.integrated, -16.0);
        assert_eq!(config.loudness.lra, 7.0);
        assert!(!config.loudness.replace_source);
        assert_eq!(config.hls.bitrates, vec!["96k"]);
        assert_eq!(config.hls.codec, "libfdk_aac");
        assert!(config.hls.delete_source);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let result = BatchConfig::load(Some(Path::new("/definitely/not/here.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn validate_rejects_empty_bitrates() {
        let mut config = BatchConfig::default();
        config.hls.bitrates.clear();
        assert!(config.validate().is_err());

        config.hls.bitrates = vec!["128k".into(), "loud".into()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("\"loud\""));

        // Overflow de u64 é rejeitado em vez de entrar em pânico.
        config.hls.bitrates = vec!["18446744073709552k".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn worker_count_honours_override_and_floor() {
        assert_eq!(worker_count(Some(6), 4), 6);
        assert_eq!(worker_count(Some(0), 1), 1);
        assert!(worker_count(None, 1) >= 1);
        assert!(worker_count(None, 1024) >= 1);
    }
}
