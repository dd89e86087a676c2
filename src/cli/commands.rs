//! CLI Command Implementations
//!
//! Implements the actual logic for each CLI command.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::backend::bridge::registry_from_config;
use crate::backend::mock::synthetic_registry;
use crate::backend::{HardwareClass, HardwareProbe};
use crate::cli::SongArgs;
use crate::config::PipelineConfig;
use crate::engine::ExportFormat;
use crate::error::{Result, SongError};
use crate::estimator::TimeEstimator;
use crate::pipeline::SongPipeline;
use crate::registry::ModelRegistry;
use crate::request::{ClipLayout, GenerationRequest};
use crate::telemetry::TracingObserver;

/// Load the configuration file if given, then apply environment overrides
pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => {
            info!("Loading configuration: {}", path.display());
            PipelineConfig::load(path)?
        }
        None => PipelineConfig::default(),
    };
    let config = config.with_env_overrides();
    config.validate()?;
    Ok(config)
}

fn build_registry(config: &PipelineConfig, synthetic: bool) -> ModelRegistry {
    let hardware = HardwareProbe::detect();
    if synthetic {
        info!("Using synthetic backends");
        synthetic_registry(config, hardware)
    } else {
        registry_from_config(config, hardware)
    }
}

/// Turn CLI song arguments into a request
pub fn build_request(args: &SongArgs, config: &PipelineConfig) -> Result<GenerationRequest> {
    let lyrics = match (&args.lyrics, &args.lyrics_file) {
        (Some(lyrics), _) => Some(lyrics.clone()),
        (None, Some(path)) => Some(std::fs::read_to_string(path)?),
        (None, None) => None,
    };

    let mut params = crate::request::GenerationParams {
        inference_steps: config.backends.inference_steps,
        ..Default::default()
    };
    if let Some(steps) = args.steps {
        params.inference_steps = steps;
    }
    params.seed = args.seed;

    let audio = &config.audio;
    let mut builder = GenerationRequest::builder(args.prompt.clone())
        .clip_count(args.clips.unwrap_or(audio.default_clips))
        .layout(ClipLayout::new(audio.lead_in_secs, audio.main_secs, audio.lead_out_secs))
        .params(params)
        .backend_preference(args.backend)
        .instruments(args.instruments.iter().cloned());
    if let Some(lyrics) = lyrics {
        builder = builder.lyrics(lyrics);
    }
    if let Some(genre) = &args.genre {
        builder = builder.genre(genre.clone());
    }
    if let Some(mood) = &args.mood {
        builder = builder.mood(mood.clone());
    }
    if let Some(tempo) = args.tempo {
        builder = builder.tempo_bpm(tempo);
    }
    builder.build()
}

/// Parse `cpu` or `nvidia:<vram GB>`
pub fn parse_hardware(spec: &str) -> Result<HardwareClass> {
    let spec = spec.trim().to_ascii_lowercase();
    if spec == "cpu" {
        return Ok(HardwareClass::Cpu);
    }
    if let Some(vram) = spec.strip_prefix("nvidia:") {
        let vram_gb: f32 = vram.parse().map_err(|_| SongError::InvalidRequest {
            reason: format!("bad VRAM size '{}'", vram),
        })?;
        return Ok(HardwareClass::NvidiaGpu { vram_gb });
    }
    Err(SongError::InvalidRequest {
        reason: format!("unknown hardware '{}', expected cpu or nvidia:<GB>", spec),
    })
}

fn export_format(bit_depth: u16) -> Result<ExportFormat> {
    match bit_depth {
        16 => Ok(ExportFormat::default()),
        24 => Ok(ExportFormat::high_quality()),
        32 => Ok(ExportFormat::float32()),
        other => Err(SongError::InvalidRequest {
            reason: format!("unsupported bit depth {}", other),
        }),
    }
}

/// Generate a song and export it.
pub fn generate(
    config: PipelineConfig,
    synthetic: bool,
    args: &SongArgs,
    output: &Path,
    bit_depth: u16,
    report_path: Option<&Path>,
) -> Result<()> {
    let format = export_format(bit_depth)?;
    let request = build_request(args, &config)?;
    let registry = Arc::new(build_registry(&config, synthetic));

    let estimate = TimeEstimator::new(&config).estimate(&request, &registry.hardware().class);
    println!("{}", estimate.summary());

    let pipeline = SongPipeline::new(registry, config).with_observer(Arc::new(TracingObserver));
    let song = match pipeline.run(request) {
        Ok(song) => song,
        Err(err) => {
            eprintln!("Generation failed: {}", err.friendly_message());
            for suggestion in err.recovery_suggestions() {
                eprintln!("  - {}", suggestion);
            }
            return Err(err);
        }
    };

    for notice in song.notices() {
        warn!("{}", notice.message);
        println!("Note: {}", notice.message);
    }

    let export = song.export_wav(output, format)?;
    println!(
        "Song written: {} ({:.1}s, {} Hz, {} ch, {}-bit)",
        export.path.display(),
        export.duration_secs,
        export.sample_rate,
        export.channels,
        export.bit_depth
    );
    println!("SHA-256: {}", export.sha256);

    if let Some(path) = report_path {
        let report = serde_json::to_string_pretty(&song.report())?;
        std::fs::write(path, report)?;
        println!("Report written: {}", path.display());
    }

    Ok(())
}

/// Print a time estimate.
pub fn estimate(config: &PipelineConfig, args: &SongArgs, hardware: Option<&str>, json: bool) -> Result<()> {
    let request = build_request(args, config)?;
    let hardware = match hardware {
        Some(spec) => parse_hardware(spec)?,
        None => HardwareProbe::detect().class,
    };
    let estimate = TimeEstimator::new(config).estimate(&request, &hardware);
    if json {
        println!("{}", serde_json::to_string_pretty(&estimate)?);
    } else {
        println!("{}", estimate.summary());
    }
    Ok(())
}

/// Show hardware and collaborator availability.
pub fn probe(config: &PipelineConfig, synthetic: bool, json: bool) -> Result<()> {
    let registry = build_registry(config, synthetic);
    let health = registry.health_check();
    if json {
        println!("{}", serde_json::to_string_pretty(&health)?);
        return Ok(());
    }

    println!("Hardware: {}", registry.hardware().summary());
    println!("{:-<60}", "");
    for component in &health.components {
        let status = if component.available { "available" } else { "unavailable" };
        println!("{:<12} {:<24} {}", component.role, component.name, status);
    }
    println!("{:-<60}", "");
    if health.can_generate() {
        println!("Ready to generate.");
    } else {
        println!("No usable generation backend.");
    }
    Ok(())
}

/// Write the default configuration.
pub fn init_config(path: &Path) -> Result<()> {
    PipelineConfig::default().save(path)?;
    println!("Configuration written: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::BackendPreference;
    use test_case::test_case;

    fn args() -> SongArgs {
        SongArgs {
            prompt: "night drive".into(),
            lyrics: None,
            lyrics_file: None,
            clips: None,
            genre: Some("synthwave".into()),
            mood: None,
            tempo: Some(100),
            instruments: vec![],
            backend: BackendPreference::Auto,
            seed: Some(7),
            steps: None,
        }
    }

    #[test]
    fn test_request_uses_config_defaults() {
        let config = PipelineConfig::default();
        let request = build_request(&args(), &config).unwrap();
        assert_eq!(request.clip_count(), config.audio.default_clips);
        assert_eq!(request.params().seed, Some(7));
        assert_eq!(request.params().inference_steps, 27);
        assert_eq!(request.attributes().tempo_bpm, Some(100));
    }

    #[test]
    fn test_lyrics_file_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lyrics.txt");
        std::fs::write(&path, "[Chorus]\nla la").unwrap();
        let mut args = args();
        args.lyrics_file = Some(path);
        let request = build_request(&args, &PipelineConfig::default()).unwrap();
        assert_eq!(request.lyrics(), Some("[Chorus]\nla la"));
    }

    #[test_case("cpu", HardwareClass::Cpu ; "cpu")]
    #[test_case("nvidia:12", HardwareClass::NvidiaGpu { vram_gb: 12.0 } ; "nvidia")]
    fn test_parse_hardware(spec: &str, expected: HardwareClass) {
        assert_eq!(parse_hardware(spec).unwrap(), expected);
    }

    #[test]
    fn test_bad_bit_depth() {
        assert!(export_format(8).is_err());
    }

    #[test]
    fn test_init_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        init_config(&path).unwrap();
        assert_eq!(load_config(Some(&path)).unwrap().audio.sample_rate, 44_100);
    }
}
