//! Ordered deployment steps for a bundle
//!
//! Charms are added first (each once), then services are deployed, then
//! relations are added in bundle order.
//!
//! The same plan is exposed to consoles as a change set: one record per
//! step plus one `addUnit` record per unit, each naming the records it
//! depends on.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};

use crate::bundle::{Bundle, BundleError, Relation, ServiceSpec};

/// Units a single service may ask for in a change set
pub const MAX_CHANGE_SET_UNITS: u64 = 1000;

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    AddCharm(String),
    Deploy { service: String, spec: ServiceSpec },
    Relate(Relation),
}

impl Step {
    /// Progress note for this step
    pub fn describe(&self) -> String {
        match self {
            Step::AddCharm(charm) => format!("adding charm {}", charm),
            Step::Deploy { service, spec } => format!(
                "deploying service {} ({}, {} unit{})",
                service,
                spec.charm,
                spec.num_units,
                if spec.num_units == 1 { "" } else { "s" }
            ),
            Step::Relate(relation) => {
                format!("adding relation {} -> {}", relation.from, relation.to)
            }
        }
    }
}

pub fn plan(bundle: &Bundle) -> Vec<Step> {
    let mut charms = BTreeSet::new();
    let mut steps: Vec<Step> = bundle
        .services()
        .values()
        .filter(|spec| charms.insert(spec.charm.clone()))
        .map(|spec| Step::AddCharm(spec.charm.clone()))
        .collect();

    steps.extend(bundle.services().iter().map(|(service, spec)| Step::Deploy {
        service: service.clone(),
        spec: spec.clone(),
    }));
    steps.extend(bundle.relations().iter().cloned().map(Step::Relate));
    steps
}

/// Result payload describing what a deployment did
pub fn summary(bundle: &Bundle) -> Value {
    json!({
        "services": bundle.services().keys().collect::<Vec<_>>(),
        "units": bundle.unit_count(),
        "relations": bundle.relations().len(),
    })
}

/// One record of a change set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: String,
    pub method: String,
    pub args: Vec<Value>,
    pub requires: Vec<String>,
}

/// Change set for a bundle, in plan order followed by unit placement
pub fn change_set(bundle: &Bundle) -> Result<Vec<Change>, BundleError> {
    if let Some((service, _)) = bundle
        .services()
        .iter()
        .find(|(_, spec)| spec.num_units > MAX_CHANGE_SET_UNITS)
    {
        return Err(BundleError::InvalidService {
            service: service.clone(),
            reason: format!("num_units exceeds {}", MAX_CHANGE_SET_UNITS),
        });
    }

    let mut changes: Vec<Change> = Vec::new();
    let mut charm_ids: HashMap<String, String> = HashMap::new();
    let mut service_ids: HashMap<String, String> = HashMap::new();
    for step in plan(bundle) {
        match step {
            Step::AddCharm(charm) => {
                let id = push(&mut changes, "addCharm", "addCharm", vec![json!(charm)], vec![]);
                charm_ids.insert(charm, id);
            }
            Step::Deploy { service, spec } => {
                let requires: Vec<String> =
                    charm_ids.get(&spec.charm).cloned().into_iter().collect();
                let args = vec![
                    json!(spec.charm),
                    json!(service),
                    Value::Object(spec.options),
                ];
                let id = push(&mut changes, "addService", "deploy", args, requires);
                service_ids.insert(service, id);
            }
            Step::Relate(relation) => {
                let (from_service, to_service) = relation.services();
                let requires: Vec<String> = [from_service, to_service]
                    .iter()
                    .filter_map(|service| service_ids.get(*service).cloned())
                    .collect();
                let args = vec![
                    json!(placeholder(&relation.from, &service_ids)),
                    json!(placeholder(&relation.to, &service_ids)),
                ];
                push(&mut changes, "addRelation", "addRelation", args, requires);
            }
        }
    }

    for (service, spec) in bundle.services() {
        let Some(service_id) = service_ids.get(service).cloned() else {
            continue;
        };
        for _ in 0..spec.num_units {
            let args = vec![json!(format!("${}", service_id)), json!(1), Value::Null];
            push(&mut changes, "addUnit", "addUnit", args, vec![service_id.clone()]);
        }
    }
    Ok(changes)
}

/// Append a record and return its id (`{prefix}-{index}`)
fn push(
    changes: &mut Vec<Change>,
    prefix: &str,
    method: &str,
    args: Vec<Value>,
    requires: Vec<String>,
) -> String {
    let id = format!("{}-{}", prefix, changes.len());
    changes.push(Change {
        id: id.clone(),
        method: method.to_string(),
        args,
        requires,
    });
    id
}

/// `wiki:db` becomes `$addService-3:db`
fn placeholder(endpoint: &str, service_ids: &HashMap<String, String>) -> String {
    let (service, relation) = match endpoint.split_once(':') {
        Some((service, relation)) => (service, Some(relation)),
        None => (endpoint, None),
    };
    let id = service_ids
        .get(service)
        .map(String::as_str)
        .unwrap_or(service);
    match relation {
        Some(relation) => format!("${}:{}", id, relation),
        None => format!("${}", id),
    }
}
