//! Static (location, category) -> device mapping.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use telemetry_model::Category;

/// One configured route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub location: String,
    pub category: Category,
    pub device_id: String,
}

impl RouteEntry {
    pub fn new(location: &str, category: Category, device_id: &str) -> Self {
        Self {
            location: location.to_string(),
            category,
            device_id: device_id.to_string(),
        }
    }
}

/// Routes shipped with the gateway for the two pilot sites.
pub fn default_routes() -> Vec<RouteEntry> {
    vec![
        RouteEntry::new("Lt2SGLC", Category::Organic, "DEV-LT2-ORG"),
        RouteEntry::new("Lt2SGLC", Category::Inorganic, "DEV-LT2-ANO"),
        RouteEntry::new("Lt2SGLC", Category::Residual, "DEV-LT2-RES"),
        RouteEntry::new("KantinSGLC", Category::Organic, "DEV_KANTIN_LT1_ORGANIC"),
        RouteEntry::new("KantinSGLC", Category::Inorganic, "DEV_KANTIN_LT1_ANORGANIC"),
        RouteEntry::new("KantinSGLC", Category::Residual, "DEV_KANTIN_LT1_RESIDUE"),
    ]
}

#[derive(Debug, Clone, Default)]
pub struct DeviceRoutes {
    routes: HashMap<(String, Category), String>,
}

impl DeviceRoutes {
    /// Later entries for the same (location, category) win.
    pub fn from_entries(entries: &[RouteEntry]) -> Self {
        let mut routes = HashMap::with_capacity(entries.len());
        for e in entries {
            let key = (e.location.clone(), e.category);
            if let Some(prev) = routes.insert(key, e.device_id.clone()) {
                warn!(
                    location = %e.location,
                    category = %e.category,
                    replaced = %prev,
                    device_id = %e.device_id,
                    "duplicate device route"
                );
            }
        }
        Self { routes }
    }

    pub fn resolve(&self, location: &str, category: Category) -> Option<&str> {
        self.routes
            .get(&(location.to_string(), category))
            .map(String::as_str)
    }

    pub fn contains_device(&self, device_id: &str) -> bool {
        self.routes.values().any(|d| d == device_id)
    }

    /// Every routed device id, sorted and de-duplicated.
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.routes.values().cloned().collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
