use serde::{Deserialize, Serialize};

use crate::geo::GeoPoint;

/// A transmitter location for coverage rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Origin {
    pub position: GeoPoint,
    /// Stable device identifier when the origin follows a tracked device.
    pub id: Option<String>,
    /// Generated key for manually placed origins.
    pub key: Option<String>,
    /// Absolute transmitter height (MSL). Overrides the raster AGL/MSL settings.
    pub absolute_tx_height_m: Option<f64>,
}

impl Origin {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            position: GeoPoint::new(lat, lon),
            id: None,
            key: None,
            absolute_tx_height_m: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_tx_height(mut self, msl_m: f64) -> Self {
        self.absolute_tx_height_m = Some(msl_m);
        self
    }

    pub fn stable_key(&self) -> Option<&str> {
        self.id.as_deref().or(self.key.as_deref())
    }
}

/// The caller's current transmitter selection.
#[derive(Debug, Clone, Default)]
pub struct OriginSet {
    origins: Vec<Origin>,
    multi: bool,
    seq: u64,
}

impl OriginSet {
    pub fn new(multi: bool) -> Self {
        Self { origins: Vec::new(), multi, seq: 0 }
    }

    pub fn set_multi(&mut self, multi: bool) {
        self.multi = multi;
    }

    /// Places or moves an origin. In single-origin mode the selection is replaced.
    /// Device origins are matched by `id`; manual ones by exact position.
    pub fn upsert(&mut self, position: GeoPoint, id: Option<String>) -> &Origin {
        if !self.multi {
            self.origins.clear();
        }
        let existing = match &id {
            Some(id) => self.origins.iter().position(|o| o.id.as_deref() == Some(id.as_str())),
            None if self.multi => self.origins.iter().position(|o| o.id.is_none() && o.position == position),
            None => None,
        };

        let idx = match existing {
            Some(idx) => {
                self.origins[idx].position = position;
                idx
            }
            None => {
                let key = if id.is_none() {
                    self.seq += 1;
                    Some(format!("manual-{}", self.seq))
                } else {
                    None
                };
                self.origins.push(Origin { position, id, key, absolute_tx_height_m: None });
                self.origins.len() - 1
            }
        };
        &self.origins[idx]
    }

    /// Device registry hook: moves the origin tied to `id`, if any.
    pub fn move_device(&mut self, id: &str, position: GeoPoint) -> bool {
        match self.origins.iter_mut().find(|o| o.id.as_deref() == Some(id)) {
            Some(origin) => {
                origin.position = position;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Origin> {
        let idx = self.origins.iter().position(|o| o.stable_key() == Some(key))?;
        Some(self.origins.remove(idx))
    }

    pub fn clear(&mut self) {
        self.origins.clear();
    }

    pub fn as_slice(&self) -> &[Origin] {
        &self.origins
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }
}
