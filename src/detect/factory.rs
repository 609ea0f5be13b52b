use anyhow::{anyhow, Result};
#[cfg(feature = "backend-tract")]
use std::sync::{Arc, Mutex};

use super::backend::DetectorBackend;
use super::backends::StubBackend;
use crate::config::{DetectorKind, DetectorSettings};
use crate::SourceId;

/// Builds one detector instance per source.
///
/// Sources never share a backend instance: `detect` takes `&mut self`, and
/// a shared instance behind a lock would let one slow source throttle all
/// the others.
pub trait DetectorFactory: Send + Sync {
    fn create(&self, source: &SourceId) -> Result<Box<dyn DetectorBackend>>;
}

/// Factory driven by the `detector` configuration section.
pub struct BackendFactory {
    settings: DetectorSettings,
    target_label: String,
    #[cfg(feature = "backend-tract")]
    plan: Mutex<Option<super::backends::tract::SharedPlan>>,
}

impl BackendFactory {
    pub fn new(settings: DetectorSettings, target_label: impl Into<String>) -> Self {
        Self {
            settings,
            target_label: target_label.into(),
            #[cfg(feature = "backend-tract")]
            plan: Mutex::new(None),
        }
    }

    #[cfg(feature = "backend-tract")]
    fn tract_backend(&self) -> Result<Box<dyn DetectorBackend>> {
        use super::backends::tract::{load_plan, TractBackend};

        let model_path = self
            .settings
            .model_path
            .as_ref()
            .ok_or_else(|| anyhow!("detector.model_path is required for the tract backend"))?;
        let plan = {
            let mut cached = self
                .plan
                .lock()
                .map_err(|_| anyhow!("detector plan lock poisoned"))?;
            match cached.as_ref() {
                Some(plan) => plan.clone(),
                None => {
                    let plan = load_plan(
                        model_path,
                        self.settings.input_width,
                        self.settings.input_height,
                    )?;
                    *cached = Some(plan.clone());
                    plan
                }
            }
        };
        Ok(Box::new(TractBackend::new(
            plan,
            self.settings.input_width,
            self.settings.input_height,
            Arc::new(self.settings.labels.clone()),
        )))
    }
}

impl DetectorFactory for BackendFactory {
    fn create(&self, source: &SourceId) -> Result<Box<dyn DetectorBackend>> {
        let mut backend: Box<dyn DetectorBackend> = match self.settings.backend {
            DetectorKind::Stub => Box::new(StubBackend::new(self.target_label.clone())),
            DetectorKind::Tract => {
                #[cfg(feature = "backend-tract")]
                {
                    self.tract_backend()?
                }
                #[cfg(not(feature = "backend-tract"))]
                {
                    return Err(anyhow!(
                        "tract detector requires the backend-tract feature"
                    ));
                }
            }
        };
        backend.warm_up()?;
        log::debug!("detector '{}' ready for {}", backend.name(), source);
        Ok(backend)
    }
}
