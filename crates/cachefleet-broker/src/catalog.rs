//! Service catalog advertised at `GET /v2/catalog`.

use cachefleet_core::config::CatalogConfig;
use serde::Serialize;

pub const SHARED_PLAN_NAME: &str = "shared-vm";
pub const DEDICATED_PLAN_NAME: &str = "dedicated-vm";

/// Which provider serves a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    Shared,
    Dedicated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Catalog {
    pub services: Vec<Service>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub description: String,
    pub bindable: bool,
    pub plans: Vec<Plan>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub description: String,
}

impl Catalog {
    /// One service offering the plans of the configured providers.
    pub fn new(config: &CatalogConfig, shared: bool, dedicated: bool) -> Self {
        let mut plans = Vec::new();
        if shared {
            plans.push(Plan {
                id: config.shared_plan_id.clone(),
                name: SHARED_PLAN_NAME.into(),
                description: "Instance on a shared host, isolated by port".into(),
            });
        }
        if dedicated {
            plans.push(Plan {
                id: config.dedicated_plan_id.clone(),
                name: DEDICATED_PLAN_NAME.into(),
                description: "Instance on its own node".into(),
            });
        }
        Self {
            services: vec![Service {
                id: config.service_id.clone(),
                name: config.service_name.clone(),
                description: config.description.clone(),
                bindable: true,
                plans,
            }],
        }
    }

    pub fn plan_kind(&self, config: &CatalogConfig, plan_id: &str) -> Option<PlanKind> {
        let offered = self
            .services
            .iter()
            .flat_map(|s| &s.plans)
            .any(|p| p.id == plan_id);
        if !offered {
            return None;
        }
        if plan_id == config.shared_plan_id {
            Some(PlanKind::Shared)
        } else if plan_id == config.dedicated_plan_id {
            Some(PlanKind::Dedicated)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offers_only_configured_plans() {
        let config = CatalogConfig::default();
        let catalog = Catalog::new(&config, false, true);
        let json = serde_json::to_value(&catalog).unwrap();
        assert_eq!(json["services"][0]["name"], "p-redis");
        assert_eq!(json["services"][0]["bindable"], true);
        assert_eq!(json["services"][0]["plans"].as_array().unwrap().len(), 1);
        assert_eq!(json["services"][0]["plans"][0]["name"], "dedicated-vm");

        assert_eq!(
            catalog.plan_kind(&config, &config.dedicated_plan_id),
            Some(PlanKind::Dedicated)
        );
        assert_eq!(catalog.plan_kind(&config, &config.shared_plan_id), None);
        assert_eq!(catalog.plan_kind(&config, "unknown"), None);
    }

    #[test]
    fn both_plans_in_order() {
        let config = CatalogConfig::default();
        let catalog = Catalog::new(&config, true, true);
        let names: Vec<&str> = catalog.services[0]
            .plans
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["shared-vm", "dedicated-vm"]);
    }
}
