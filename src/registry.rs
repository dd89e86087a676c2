//! Model registry
//!
//! Explicit, injectable holder of every model collaborator: the two
//! generation backends, the stem separator, the effects engine and the
//! vocal synthesizer. Built once at startup and shared by reference;
//! tests substitute mocks through the builder.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{BackendKind, GenerationBackend, HardwareClass, HardwareProbe};
use crate::dsp::DspEffectsEngine;
use crate::error::Result;
use crate::stems::{EffectsEngine, StemSeparator};
use crate::vocal::VocalSynthesizer;

/// Availability of one registered component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub role: String,
    pub name: String,
    pub available: bool,
    pub initialized: bool,
}

/// Snapshot returned by [`ModelRegistry::health_check`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryHealth {
    pub hardware: HardwareClass,
    pub components: Vec<ComponentHealth>,
}

impl RegistryHealth {
    pub fn component(&self, role: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.role == role)
    }

    /// At least one generation backend can run
    pub fn can_generate(&self) -> bool {
        ["primary", "fallback"]
            .iter()
            .filter_map(|role| self.component(role))
            .any(|c| c.available)
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    leased: bool,
    /// Generation calls still running, including ones their song gave up on
    in_flight: usize,
    /// `release` was asked for while a call was still running
    release_pending: bool,
}

/// Who is using the accelerator
///
/// A song holds the lease; every generation call holds an [`InFlightCall`]
/// until the backend returns, even after a timeout or cancellation has
/// abandoned it. The device is free only when both are gone.
#[derive(Debug, Default)]
pub(crate) struct DeviceGate {
    state: Mutex<DeviceState>,
    idle: Condvar,
}

impl DeviceGate {
    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait<'a>(&self, state: MutexGuard<'a, DeviceState>) -> MutexGuard<'a, DeviceState> {
        self.idle.wait(state).unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count a generation call as running until the guard drops
    pub(crate) fn begin_call(self: &Arc<Self>) -> InFlightCall {
        self.state().in_flight += 1;
        InFlightCall {
            gate: Arc::clone(self),
        }
    }
}

/// A generation call running on the device
///
/// Moved into the worker thread so it drops when the backend returns.
#[derive(Debug)]
pub(crate) struct InFlightCall {
    gate: Arc<DeviceGate>,
}

impl Drop for InFlightCall {
    fn drop(&mut self) {
        let mut state = self.gate.state();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            self.gate.idle.notify_all();
        }
    }
}

/// Exclusive use of the accelerator for one song
///
/// Held from backend selection until the song is Ready or Failed.
pub struct DeviceLease<'a> {
    gate: &'a DeviceGate,
}

impl Drop for DeviceLease<'_> {
    fn drop(&mut self) {
        self.gate.state().leased = false;
        self.gate.idle.notify_all();
    }
}

impl fmt::Debug for DeviceLease<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeviceLease")
    }
}

/// Registry of model collaborators
pub struct ModelRegistry {
    hardware: HardwareProbe,
    primary: Option<Arc<dyn GenerationBackend>>,
    fallback: Option<Arc<dyn GenerationBackend>>,
    separator: Option<Arc<dyn StemSeparator>>,
    effects: Arc<dyn EffectsEngine>,
    vocals: Option<Arc<dyn VocalSynthesizer>>,
    initialized: Mutex<HashSet<BackendKind>>,
    device: Arc<DeviceGate>,
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("hardware", &self.hardware.class)
            .field("primary", &self.primary.as_ref().map(|b| b.name().to_string()))
            .field("fallback", &self.fallback.as_ref().map(|b| b.name().to_string()))
            .field("separator", &self.separator.as_ref().map(|s| s.name().to_string()))
            .field("effects", &self.effects.name())
            .field("vocals", &self.vocals.as_ref().map(|v| v.name().to_string()))
            .finish()
    }
}

impl ModelRegistry {
    pub fn builder() -> ModelRegistryBuilder {
        ModelRegistryBuilder::default()
    }

    pub fn hardware(&self) -> &HardwareProbe {
        &self.hardware
    }

    pub fn generation_backend(&self, kind: BackendKind) -> Option<Arc<dyn GenerationBackend>> {
        match kind {
            BackendKind::Primary => self.primary.clone(),
            BackendKind::Fallback => self.fallback.clone(),
        }
    }

    pub fn separator(&self) -> Option<Arc<dyn StemSeparator>> {
        self.separator.clone()
    }

    pub fn effects(&self) -> Arc<dyn EffectsEngine> {
        Arc::clone(&self.effects)
    }

    pub fn vocal_synthesizer(&self) -> Option<Arc<dyn VocalSynthesizer>> {
        self.vocals.clone()
    }

    /// Initialize a generation backend once
    pub fn ensure_initialized(&self, kind: BackendKind) -> Result<()> {
        let mut initialized = self.initialized_set();
        if initialized.contains(&kind) {
            return Ok(());
        }
        if let Some(backend) = self.generation_backend(kind) {
            debug!(backend = backend.name(), "initializing backend");
            backend.initialize()?;
            initialized.insert(kind);
        }
        Ok(())
    }

    /// Eagerly initialize every available generation backend
    ///
    /// Failures are logged and reported through the returned health
    /// snapshot; selection later treats an uninitializable backend as
    /// unusable.
    pub fn load(&self) -> RegistryHealth {
        for kind in [BackendKind::Primary, BackendKind::Fallback] {
            let Some(backend) = self.generation_backend(kind) else {
                continue;
            };
            if !backend.is_available() {
                info!(backend = backend.name(), "backend not available, skipping load");
                continue;
            }
            if let Err(e) = self.ensure_initialized(kind) {
                warn!(backend = backend.name(), error = %e, "backend failed to load");
            }
        }
        self.health_check()
    }

    /// Probe availability of every component
    pub fn health_check(&self) -> RegistryHealth {
        let initialized = self.initialized_set().clone();
        let mut components = Vec::new();

        for kind in [BackendKind::Primary, BackendKind::Fallback] {
            if let Some(backend) = self.generation_backend(kind) {
                let hardware_ok = backend
                    .capability()
                    .hardware()
                    .satisfied_by(&self.hardware.class);
                components.push(ComponentHealth {
                    role: kind.to_string(),
                    name: backend.name().to_string(),
                    available: hardware_ok && backend.is_available(),
                    initialized: initialized.contains(&kind),
                });
            }
        }
        if let Some(separator) = &self.separator {
            components.push(ComponentHealth {
                role: "separator".to_string(),
                name: separator.name().to_string(),
                available: separator.is_available(),
                initialized: false,
            });
        }
        components.push(ComponentHealth {
            role: "effects".to_string(),
            name: self.effects.name().to_string(),
            available: self.effects.is_available(),
            initialized: false,
        });
        if let Some(vocals) = &self.vocals {
            components.push(ComponentHealth {
                role: "vocals".to_string(),
                name: vocals.name().to_string(),
                available: vocals.is_available(),
                initialized: false,
            });
        }

        RegistryHealth {
            hardware: self.hardware.class.clone(),
            components,
        }
    }

    /// Release every initialized backend
    ///
    /// While a generation call is still running the release is deferred
    /// until the device is next acquired or waited idle.
    pub fn release(&self) {
        {
            let mut state = self.device.state();
            if state.in_flight > 0 {
                warn!(in_flight = state.in_flight, "generation call still running, deferring release");
                state.release_pending = true;
                return;
            }
        }
        self.release_backends();
    }

    /// Take the accelerator for one song
    ///
    /// Blocks while another song holds it or while any generation call,
    /// abandoned or not, is still running on it.
    pub fn acquire_device(&self) -> DeviceLease<'_> {
        let pending_release = {
            let mut state = self.device.state();
            if state.leased || state.in_flight > 0 {
                debug!(in_flight = state.in_flight, "waiting for device");
            }
            while state.leased || state.in_flight > 0 {
                state = self.device.wait(state);
            }
            state.leased = true;
            std::mem::take(&mut state.release_pending)
        };
        if pending_release {
            self.release_backends();
        }
        DeviceLease { gate: &self.device }
    }

    /// Whether a song holds the accelerator or a generation call is running
    pub fn device_busy(&self) -> bool {
        let state = self.device.state();
        state.leased || state.in_flight > 0
    }

    /// Wait until no song holds the device and no call is running on it
    ///
    /// Applies a deferred release. Returns false if `timeout` passed first.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let pending_release = {
            let mut state = self.device.state();
            while state.leased || state.in_flight > 0 {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                state = match self.device.idle.wait_timeout(state, deadline - now) {
                    Ok((state, _)) => state,
                    Err(poisoned) => poisoned.into_inner().0,
                };
            }
            std::mem::take(&mut state.release_pending)
        };
        if pending_release {
            self.release_backends();
        }
        true
    }

    pub(crate) fn device_gate(&self) -> Arc<DeviceGate> {
        Arc::clone(&self.device)
    }

    fn release_backends(&self) {
        let mut initialized = self.initialized_set();
        for kind in initialized.drain() {
            if let Some(backend) = self.generation_backend(kind) {
                debug!(backend = backend.name(), "releasing backend");
                backend.release();
            }
        }
    }

    fn initialized_set(&self) -> MutexGuard<'_, HashSet<BackendKind>> {
        self.initialized
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Builder for [`ModelRegistry`]
#[derive(Default)]
pub struct ModelRegistryBuilder {
    hardware: Option<HardwareProbe>,
    primary: Option<Arc<dyn GenerationBackend>>,
    fallback: Option<Arc<dyn GenerationBackend>>,
    separator: Option<Arc<dyn StemSeparator>>,
    effects: Option<Arc<dyn EffectsEngine>>,
    vocals: Option<Arc<dyn VocalSynthesizer>>,
}

impl ModelRegistryBuilder {
    pub fn hardware(mut self, hardware: HardwareProbe) -> Self {
        self.hardware = Some(hardware);
        self
    }

    pub fn primary(mut self, backend: Arc<dyn GenerationBackend>) -> Self {
        self.primary = Some(backend);
        self
    }

    pub fn fallback(mut self, backend: Arc<dyn GenerationBackend>) -> Self {
        self.fallback = Some(backend);
        self
    }

    pub fn separator(mut self, separator: Arc<dyn StemSeparator>) -> Self {
        self.separator = Some(separator);
        self
    }

    pub fn effects(mut self, effects: Arc<dyn EffectsEngine>) -> Self {
        self.effects = Some(effects);
        self
    }

    pub fn vocals(mut self, vocals: Arc<dyn VocalSynthesizer>) -> Self {
        self.vocals = Some(vocals);
        self
    }

    /// Finish; hardware is probed now if not supplied
    pub fn build(self) -> ModelRegistry {
        ModelRegistry {
            hardware: self.hardware.unwrap_or_else(HardwareProbe::detect),
            primary: self.primary,
            fallback: self.fallback,
            separator: self.separator,
            effects: self.effects.unwrap_or_else(|| Arc::new(DspEffectsEngine)),
            vocals: self.vocals,
            initialized: Mutex::new(HashSet::new()),
            device: Arc::new(DeviceGate::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::SyntheticBackend;
    use crate::config::BackendConfig;

    fn registry() -> (ModelRegistry, Arc<SyntheticBackend>) {
        let primary = Arc::new(SyntheticBackend::primary(&BackendConfig::default()));
        let registry = ModelRegistry::builder()
            .hardware(HardwareProbe::nvidia(16.0))
            .primary(primary.clone())
            .fallback(Arc::new(SyntheticBackend::fallback(&BackendConfig::default())))
            .build();
        (registry, primary)
    }

    #[test]
    fn test_initialize_once() {
        let (registry, primary) = registry();
        registry.ensure_initialized(BackendKind::Primary).unwrap();
        registry.ensure_initialized(BackendKind::Primary).unwrap();
        assert_eq!(primary.initialize_count(), 1);
    }

    #[test]
    fn test_release_clears_initialized() {
        let (registry, primary) = registry();
        registry.load();
        registry.release();
        assert_eq!(primary.release_count(), 1);
        assert!(!registry.health_check().component("primary").unwrap().initialized);
    }

    #[test]
    fn test_health_reports_hardware_mismatch() {
        let registry = ModelRegistry::builder()
            .hardware(HardwareProbe::cpu())
            .primary(Arc::new(SyntheticBackend::primary(&BackendConfig::default())))
            .build();
        let health = registry.health_check();
        assert!(!health.component("primary").unwrap().available);
        assert!(!health.can_generate());
        assert_eq!(health.component("effects").unwrap().name, "dsp");
    }

    #[test]
    fn test_device_lease_is_exclusive() {
        let (registry, _) = registry();
        let lease = registry.acquire_device();
        assert!(registry.device_busy());
        drop(lease);
        assert!(!registry.device_busy());
    }

    #[test]
    fn test_running_call_keeps_device_busy() {
        let (registry, _) = registry();
        let call = registry.device_gate().begin_call();
        assert!(registry.device_busy());
        assert!(!registry.wait_for_idle(Duration::from_millis(20)));

        let registry = Arc::new(registry);
        let waiter = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                let _lease = registry.acquire_device();
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        drop(call);
        waiter.join().unwrap();
        assert!(!registry.device_busy());
    }

    #[test]
    fn test_release_deferred_while_call_runs() {
        let (registry, primary) = registry();
        registry.load();
        let call = registry.device_gate().begin_call();

        registry.release();
        assert_eq!(primary.release_count(), 0);

        drop(call);
        assert!(registry.wait_for_idle(Duration::from_secs(1)));
        assert_eq!(primary.release_count(), 1);
        assert!(!registry.health_check().component("primary").unwrap().initialized);
    }

    #[test]
    fn test_deferred_release_applied_on_next_acquire() {
        let (registry, primary) = registry();
        registry.load();
        let call = registry.device_gate().begin_call();
        registry.release();
        drop(call);

        let _lease = registry.acquire_device();
        assert_eq!(primary.release_count(), 1);
    }
}
