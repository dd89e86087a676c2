//! Hardware detection
//!
//! Classifies the machine as NVIDIA GPU, other GPU or CPU-only. The
//! primary backend only runs on NVIDIA hardware with enough VRAM; AMD and
//! other GPUs are treated as CPU-class for generation.

use serde::{Deserialize, Serialize};
use std::process::Command;
use tracing::debug;

/// Coarse hardware class used by backend selection and time estimation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum HardwareClass {
    /// CUDA-capable GPU with this much free VRAM
    NvidiaGpu { vram_gb: f32 },
    /// A GPU the primary backend cannot use (e.g. AMD)
    OtherGpu { name: String },
    /// No usable GPU
    Cpu,
}

impl HardwareClass {
    pub fn is_nvidia(&self) -> bool {
        matches!(self, HardwareClass::NvidiaGpu { .. })
    }

    pub fn vram_gb(&self) -> f32 {
        match self {
            HardwareClass::NvidiaGpu { vram_gb } => *vram_gb,
            _ => 0.0,
        }
    }

    pub fn label(&self) -> String {
        match self {
            HardwareClass::NvidiaGpu { vram_gb } => format!("NVIDIA GPU ({:.1} GB free)", vram_gb),
            HardwareClass::OtherGpu { name } => format!("{} (not usable for primary)", name),
            HardwareClass::Cpu => "CPU only".to_string(),
        }
    }
}

/// Information about a detected NVIDIA GPU
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub name: String,
    pub vram_total_gb: f32,
    pub vram_available_gb: f32,
    pub driver_version: String,
}

/// Result of probing the machine once at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareProbe {
    pub class: HardwareClass,
    pub gpu: Option<GpuInfo>,
}

impl HardwareProbe {
    /// Probe the system via `nvidia-smi`, then `rocm-smi`
    pub fn detect() -> Self {
        if let Some(gpu) = detect_nvidia() {
            return Self::from_gpu(gpu);
        }
        if let Some(name) = detect_amd() {
            return Self {
                class: HardwareClass::OtherGpu { name },
                gpu: None,
            };
        }
        Self::cpu()
    }

    /// A CPU-only machine
    pub fn cpu() -> Self {
        Self {
            class: HardwareClass::Cpu,
            gpu: None,
        }
    }

    /// A machine with the given NVIDIA GPU
    pub fn from_gpu(gpu: GpuInfo) -> Self {
        Self {
            class: HardwareClass::NvidiaGpu {
                vram_gb: gpu.vram_available_gb,
            },
            gpu: Some(gpu),
        }
    }

    /// Synthetic NVIDIA probe for tests and estimates
    pub fn nvidia(vram_gb: f32) -> Self {
        Self::from_gpu(GpuInfo {
            name: "NVIDIA (assumed)".to_string(),
            vram_total_gb: vram_gb,
            vram_available_gb: vram_gb,
            driver_version: "unknown".to_string(),
        })
    }

    /// Human-readable summary
    pub fn summary(&self) -> String {
        match &self.gpu {
            Some(gpu) => format!(
                "GPU: {}\nVRAM: {:.1}GB total, {:.1}GB available\nDriver: {}",
                gpu.name, gpu.vram_total_gb, gpu.vram_available_gb, gpu.driver_version
            ),
            None => format!("Hardware: {}", self.class.label()),
        }
    }
}

/// Parse one line of `nvidia-smi --format=csv,noheader,nounits`
pub(crate) fn parse_nvidia_smi_line(line: &str) -> Option<GpuInfo> {
    let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
    if parts.len() < 4 {
        return None;
    }
    let vram_total_mb: f32 = parts[1].parse().ok()?;
    let vram_free_mb: f32 = parts[2].parse().ok()?;
    Some(GpuInfo {
        name: parts[0].to_string(),
        vram_total_gb: vram_total_mb / 1024.0,
        vram_available_gb: vram_free_mb / 1024.0,
        driver_version: parts[3].to_string(),
    })
}

fn detect_nvidia() -> Option<GpuInfo> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total,memory.free,driver_version",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let gpu = parse_nvidia_smi_line(stdout.lines().next()?);
    debug!(?gpu, "nvidia-smi probe");
    gpu
}

fn detect_amd() -> Option<String> {
    let output = Command::new("rocm-smi").arg("--showproductname").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let name = stdout
        .lines()
        .find(|line| line.contains("Card series") || line.contains("Radeon"))
        .and_then(|line| line.split(':').last())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "AMD GPU".to_string());
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nvidia_smi_line() {
        let gpu = parse_nvidia_smi_line("NVIDIA GeForce RTX 4090, 24564, 20480, 550.54").unwrap();
        assert_eq!(gpu.name, "NVIDIA GeForce RTX 4090");
        assert!((gpu.vram_available_gb - 20.0).abs() < 1e-3);
        assert_eq!(gpu.driver_version, "550.54");
    }

    #[test]
    fn test_parse_rejects_short_lines() {
        assert!(parse_nvidia_smi_line("NVIDIA, 100").is_none());
        assert!(parse_nvidia_smi_line("NVIDIA, abc, 100, 1").is_none());
    }

    #[test]
    fn test_detect_always_returns_a_class() {
        let probe = HardwareProbe::detect();
        assert!(!probe.summary().is_empty());
    }

    #[test]
    fn test_class_helpers() {
        assert!(HardwareProbe::nvidia(12.0).class.is_nvidia());
        assert_eq!(HardwareProbe::cpu().class.vram_gb(), 0.0);
        assert!(!HardwareClass::OtherGpu {
            name: "Radeon".into()
        }
        .is_nvidia());
    }
}
