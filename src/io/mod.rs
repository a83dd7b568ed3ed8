use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::coverage::{Origin, RasterConfig};
use crate::physics::link_budget::{LinkBudgetConfig, PropagationModel};
use crate::physics::los::LosSettings;

/// Everything an operator can tune, as stored on disk.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Environment preset. Applied over `link` by [`EngineSettings::effective_link`].
    pub model: Option<PropagationModel>,
    pub link: LinkBudgetConfig,
    pub raster: RasterConfig,
    pub los: LosSettings,
}

impl EngineSettings {
    pub fn effective_link(&self) -> LinkBudgetConfig {
        let link = match self.model {
            Some(model) => self.link.clone().with_model(model),
            None => self.link.clone(),
        };
        link.sanitized()
    }
}

pub fn load_settings_from_json(path: impl AsRef<Path>) -> anyhow::Result<EngineSettings> {
    let path = path.as_ref();
    let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = std::io::BufReader::new(file);
    let settings = serde_json::from_reader(reader).with_context(|| format!("parsing {}", path.display()))?;
    Ok(settings)
}

pub fn save_settings_to_json(path: impl AsRef<Path>, settings: &EngineSettings) -> anyhow::Result<()> {
    let path = path.as_ref();
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

pub fn load_origins_from_json(path: impl AsRef<Path>) -> anyhow::Result<Vec<Origin>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let origins = serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(origins)
}
