//! HTTP bridges to model services
//!
//! Each model runs in its own service process. Requests are JSON; audio
//! moves as WAV files on a shared filesystem, the bridge writing its output
//! to the path we hand it. Without the `bridge` feature every bridge
//! reports itself unavailable.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{BackendCapability, GenerationBackend, GenerationCall, GenerationFailure, HardwareProbe};
use crate::config::PipelineConfig;
use crate::engine::{export_audio, import_audio, AudioBuffer, ExportFormat};
use crate::error::{GenerationFailureKind, Result, SongError};
use crate::registry::ModelRegistry;
use crate::request::StyleHints;
use crate::stems::{StemSeparator, Stems};
use crate::vocal::VocalSynthesizer;

/// Timeout for `/health` probes
#[cfg(feature = "bridge")]
const HEALTH_TIMEOUT_SECS: u64 = 5;

/// Failure talking to a bridge
#[derive(Debug, Clone)]
struct BridgeError {
    kind: GenerationFailureKind,
    message: String,
}

impl BridgeError {
    fn new(kind: GenerationFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn into_failure(self) -> GenerationFailure {
        GenerationFailure::new(self.kind, self.message)
    }

    fn into_error(self, component: &str) -> SongError {
        SongError::backend(component, format!("{}: {}", self.kind, self.message))
    }
}

/// Common response envelope of every bridge
#[derive(Debug, Deserialize)]
struct BridgeResponse {
    success: bool,
    #[serde(default)]
    output_path: Option<String>,
    #[serde(default)]
    stems: BTreeMap<String, String>,
    #[serde(default)]
    processing_time_ms: u64,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

impl BridgeResponse {
    fn into_result(self) -> std::result::Result<Self, BridgeError> {
        if self.success {
            return Ok(self);
        }
        let kind = match self.error_code.as_deref() {
            Some("OOM") | Some("RESOURCE_EXHAUSTED") => GenerationFailureKind::ResourceExhausted,
            Some("PERMISSION") => GenerationFailureKind::Permission,
            Some("TIMEOUT") => GenerationFailureKind::Timeout,
            _ => GenerationFailureKind::Backend,
        };
        Err(BridgeError::new(
            kind,
            self.error_message
                .unwrap_or_else(|| "bridge reported failure without a message".to_string()),
        ))
    }
}

/// Thin blocking client for one bridge URL
#[derive(Debug, Clone)]
struct BridgeClient {
    url: String,
    timeout_ms: u64,
}

impl BridgeClient {
    fn new(url: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            timeout_ms,
        }
    }

    #[cfg(feature = "bridge")]
    fn health(&self) -> bool {
        let client = match reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(HEALTH_TIMEOUT_SECS))
            .build()
        {
            Ok(client) => client,
            Err(_) => return false,
        };
        match client.get(format!("{}/health", self.url)).send() {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    #[cfg(not(feature = "bridge"))]
    fn health(&self) -> bool {
        false
    }

    #[cfg(feature = "bridge")]
    fn post<R: Serialize>(&self, endpoint: &str, request: &R) -> std::result::Result<BridgeResponse, BridgeError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_millis(self.timeout_ms))
            .build()
            .map_err(|e| BridgeError::new(GenerationFailureKind::Backend, e.to_string()))?;

        let url = format!("{}/{}", self.url, endpoint);
        let response = client.post(&url).json(request).send().map_err(|e| {
            if e.is_timeout() {
                BridgeError::new(
                    GenerationFailureKind::Timeout,
                    format!("no response from {} after {} ms", url, self.timeout_ms),
                )
            } else if e.is_connect() {
                BridgeError::new(
                    GenerationFailureKind::Backend,
                    format!("cannot connect to bridge at {}: {}", self.url, e),
                )
            } else {
                BridgeError::new(GenerationFailureKind::Backend, e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(BridgeError::new(
                GenerationFailureKind::Backend,
                format!("bridge returned {}", response.status()),
            ));
        }

        let parsed = response.json::<BridgeResponse>().map_err(|e| {
            BridgeError::new(
                GenerationFailureKind::InvalidOutput,
                format!("invalid response from bridge: {}", e),
            )
        })?;
        debug!(url = %url, ms = parsed.processing_time_ms, "bridge call finished");
        parsed.into_result()
    }

    #[cfg(not(feature = "bridge"))]
    fn post<R: Serialize>(&self, _endpoint: &str, _request: &R) -> std::result::Result<BridgeResponse, BridgeError> {
        Err(BridgeError::new(
            GenerationFailureKind::Backend,
            format!(
                "bridge support not compiled (needed for {}). Build with --features bridge",
                self.url
            ),
        ))
    }
}

/// Scratch WAV path removed on drop
struct ScratchFile(PathBuf);

impl ScratchFile {
    fn new(label: &str) -> Self {
        Self(std::env::temp_dir().join(format!("songchain-{}-{}.wav", label, Uuid::new_v4())))
    }

    fn path(&self) -> &Path {
        &self.0
    }

    fn path_string(&self) -> String {
        self.0.to_string_lossy().to_string()
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn read_output(path: Option<&str>, fallback: &Path) -> std::result::Result<AudioBuffer, BridgeError> {
    let path = path.map(PathBuf::from).unwrap_or_else(|| fallback.to_path_buf());
    import_audio(&path).map_err(|e| {
        BridgeError::new(
            GenerationFailureKind::InvalidOutput,
            format!("cannot read bridge output {}: {}", path.display(), e),
        )
    })
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    lyrics: Option<&'a str>,
    duration_seconds: f64,
    conditioning_path: Option<String>,
    output_path: String,
    sample_rate: u32,
    channels: usize,
    temperature: f32,
    guidance_scale: f32,
    inference_steps: u32,
    seed: Option<u64>,
}

/// Generation model reached over HTTP
pub struct HttpGenerationBackend {
    name: String,
    capability: BackendCapability,
    client: BridgeClient,
}

impl HttpGenerationBackend {
    pub fn new(name: impl Into<String>, capability: BackendCapability, url: &str, timeout_ms: u64) -> Self {
        Self {
            name: name.into(),
            capability,
            client: BridgeClient::new(url, timeout_ms),
        }
    }

    pub fn url(&self) -> &str {
        &self.client.url
    }
}

impl GenerationBackend for HttpGenerationBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> BackendCapability {
        self.capability
    }

    fn is_available(&self) -> bool {
        self.client.health()
    }

    fn generate(&self, call: &GenerationCall) -> std::result::Result<AudioBuffer, GenerationFailure> {
        let output = ScratchFile::new("gen");
        let conditioning = match &call.conditioning {
            Some(seed) => {
                let file = ScratchFile::new("seed");
                export_audio(seed, file.path(), ExportFormat::float32()).map_err(|e| {
                    GenerationFailure::new(
                        GenerationFailureKind::Backend,
                        format!("cannot write conditioning audio: {}", e),
                    )
                })?;
                Some(file)
            }
            None => None,
        };

        let request = GenerateRequest {
            prompt: &call.prompt,
            lyrics: call.lyrics.as_deref(),
            duration_seconds: call.duration_secs,
            conditioning_path: conditioning.as_ref().map(ScratchFile::path_string),
            output_path: output.path_string(),
            sample_rate: call.sample_rate,
            channels: call.layout.num_channels(),
            temperature: call.params.temperature,
            guidance_scale: call.params.guidance_scale,
            inference_steps: call.params.inference_steps,
            seed: call.params.seed,
        };

        let response = self
            .client
            .post("generate", &request)
            .map_err(BridgeError::into_failure)?;
        read_output(response.output_path.as_deref(), output.path()).map_err(BridgeError::into_failure)
    }
}

#[derive(Debug, Serialize)]
struct SeparateRequest {
    input_path: String,
    output_dir: String,
}

/// Stem separator reached over HTTP
pub struct HttpStemSeparator {
    client: BridgeClient,
    stem_names: Vec<String>,
}

impl HttpStemSeparator {
    pub fn new(url: &str, timeout_ms: u64) -> Self {
        Self {
            client: BridgeClient::new(url, timeout_ms),
            stem_names: ["vocals", "drums", "bass", "other"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl StemSeparator for HttpStemSeparator {
    fn name(&self) -> &str {
        "http-separator"
    }

    fn is_available(&self) -> bool {
        self.client.health()
    }

    fn stem_names(&self) -> Vec<String> {
        self.stem_names.clone()
    }

    fn separate(&self, waveform: &AudioBuffer) -> Result<Stems> {
        let input = ScratchFile::new("mix");
        export_audio(waveform, input.path(), ExportFormat::float32())?;
        let output_dir = std::env::temp_dir().join(format!("songchain-stems-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&output_dir)?;

        let request = SeparateRequest {
            input_path: input.path_string(),
            output_dir: output_dir.to_string_lossy().to_string(),
        };
        let result = self
            .client
            .post("separate", &request)
            .map_err(|e| e.into_error("separator"))
            .and_then(|response| {
                response
                    .stems
                    .iter()
                    .map(|(name, path)| Ok((name.clone(), import_audio(Path::new(path))?)))
                    .collect::<Result<Stems>>()
            });

        if let Err(e) = std::fs::remove_dir_all(&output_dir) {
            warn!(dir = %output_dir.display(), error = %e, "could not remove stem scratch directory");
        }
        result
    }
}

#[derive(Debug, Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
    genre: Option<&'a str>,
    mood: Option<&'a str>,
    tempo_bpm: Option<u32>,
    output_path: String,
}

/// Singing voice synthesizer reached over HTTP
pub struct HttpVocalSynthesizer {
    client: BridgeClient,
}

impl HttpVocalSynthesizer {
    pub fn new(url: &str, timeout_ms: u64) -> Self {
        Self {
            client: BridgeClient::new(url, timeout_ms),
        }
    }
}

impl VocalSynthesizer for HttpVocalSynthesizer {
    fn name(&self) -> &str {
        "http-vocals"
    }

    fn is_available(&self) -> bool {
        self.client.health()
    }

    fn synthesize(&self, text: &str, style: &StyleHints) -> Result<AudioBuffer> {
        let output = ScratchFile::new("vocal");
        let request = SynthesizeRequest {
            text,
            genre: style.genre.as_deref(),
            mood: style.mood.as_deref(),
            tempo_bpm: style.tempo_bpm,
            output_path: output.path_string(),
        };
        let response = self
            .client
            .post("synthesize", &request)
            .map_err(|e| e.into_error("vocals"))?;
        read_output(response.output_path.as_deref(), output.path()).map_err(|e| e.into_error("vocals"))
    }
}

/// Registry wired to the bridges named in `config`
pub fn registry_from_config(config: &PipelineConfig, hardware: HardwareProbe) -> ModelRegistry {
    let backends = &config.backends;
    ModelRegistry::builder()
        .hardware(hardware)
        .primary(Arc::new(HttpGenerationBackend::new(
            "primary-bridge",
            BackendCapability::primary(backends),
            &backends.primary_url,
            backends.timeout_ms,
        )))
        .fallback(Arc::new(HttpGenerationBackend::new(
            "fallback-bridge",
            BackendCapability::fallback(backends),
            &backends.fallback_url,
            backends.timeout_ms,
        )))
        .separator(Arc::new(HttpStemSeparator::new(
            &config.stems.separator_url,
            backends.timeout_ms,
        )))
        .vocals(Arc::new(HttpVocalSynthesizer::new(
            &config.vocals.synth_url,
            backends.timeout_ms,
        )))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = BridgeClient::new("http://localhost:8001/", 1000);
        assert_eq!(client.url, "http://localhost:8001");
    }

    #[test]
    fn test_failure_codes_map_to_kinds() {
        let response: BridgeResponse = serde_json::from_str(
            r#"{"success": false, "error_code": "OOM", "error_message": "CUDA out of memory"}"#,
        )
        .unwrap();
        let err = response.into_result().unwrap_err();
        assert_eq!(err.kind, GenerationFailureKind::ResourceExhausted);
        assert_eq!(err.message, "CUDA out of memory");
    }

    #[test]
    fn test_success_response_passes_through() {
        let response: BridgeResponse =
            serde_json::from_str(r#"{"success": true, "output_path": "/tmp/x.wav"}"#).unwrap();
        let ok = response.into_result().unwrap();
        assert_eq!(ok.output_path.as_deref(), Some("/tmp/x.wav"));
    }

    #[cfg(not(feature = "bridge"))]
    #[test]
    fn test_bridges_unavailable_without_feature() {
        use crate::config::BackendConfig;

        let backend = HttpGenerationBackend::new(
            "primary-bridge",
            BackendCapability::primary(&BackendConfig::default()),
            "http://localhost:1",
            1000,
        );
        assert!(!backend.is_available());
        assert!(!HttpStemSeparator::new("http://localhost:1", 1000).is_available());
    }

    #[test]
    fn test_scratch_file_removed_on_drop() {
        let scratch = ScratchFile::new("test");
        std::fs::write(scratch.path(), b"x").unwrap();
        let path = scratch.path().to_path_buf();
        drop(scratch);
        assert!(!path.exists());
    }
}
