//! Shared fixtures for the integration scenarios.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use keystone::action::{Action, ActionInputs, ActionOutputs, ActionRegistry, ActionScope};
use keystone::error::{ActionError, Result};
use keystone::graph::{Behavior, Graph, NodeId, NodeKind, NodeSpec, StaticClass};
use keystone::module::{Module, ModuleInputs};
use keystone::planner::{Diff, DiffAction};
use keystone::serialization::ClassRegistry;

pub const APP: &str = "@example/app";
pub const REGION: &str = "@example/region";
pub const ENVIRONMENT: &str = "@example/environment";
pub const VPC: &str = "@example/vpc";
pub const SUBNET: &str = "@example/subnet";
pub const BUCKET: &str = "@example/bucket";

/// Model and resource classes used by every scenario.
pub fn classes() -> ClassRegistry {
    let mut classes = ClassRegistry::new();
    classes
        .register(StaticClass::model("@example", "app", "name"))
        .unwrap();
    classes
        .register(StaticClass::model("@example", "region", "regionId"))
        .unwrap();
    classes
        .register(StaticClass::model("@example", "environment", "environmentName"))
        .unwrap();
    classes
        .register(StaticClass::resource("@example", "vpc", "vpcId"))
        .unwrap();
    classes
        .register(StaticClass::resource("@example", "subnet", "subnetId"))
        .unwrap();
    classes
        .register(StaticClass::shared("@example", "bucket", "bucketName"))
        .unwrap();
    classes
}

/// Ordered log of `(action, context)` pairs handled or reverted.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<(String, String)>>>);

impl CallLog {
    pub fn push(&self, action: &str, context: &str) {
        self.0
            .lock()
            .unwrap()
            .push((action.to_string(), context.to_string()));
    }

    pub fn contexts(&self, action: &str) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == action)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn count(&self, action: &str, context: &str) -> usize {
        self.contexts(action).iter().filter(|c| *c == context).count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// Translates model changes into resources.
///
/// Apps own a VPC, regions own a subnet inside the app's VPC, and every app
/// shares the `logs` bucket.
pub struct TopologyAction {
    pub log: CallLog,
}

#[async_trait]
impl Action for TopologyAction {
    fn name(&self) -> &str {
        "topology"
    }

    fn filter(&self, diff: &Diff) -> bool {
        matches!(diff.action(), DiffAction::Add | DiffAction::Delete)
    }

    async fn handle(
        &self,
        diff: &Diff,
        _inputs: &ActionInputs,
        scope: &mut ActionScope<'_>,
    ) -> Result<ActionOutputs> {
        self.log.push(self.name(), diff.context());
        let identity = diff.value().as_str().unwrap_or_default().to_string();
        let resources = &mut *scope.resources;

        match (diff.node_type(), diff.action()) {
            ("app", DiffAction::Add) => {
                resources.ensure_node(NodeSpec::new(VPC, format!("vpc-{identity}")))?;
                let bucket = resources.ensure_node(NodeSpec::new(BUCKET, "logs"))?;
                resources.share(bucket, diff.context())?;
            }
            ("app", DiffAction::Delete) => {
                if let Some(vpc) = resources.id_of(&format!("{VPC}=vpc-{identity}")) {
                    resources.remove(vpc)?;
                }
                if let Some(bucket) = resources.id_of(&format!("{BUCKET}=logs")) {
                    resources.release(bucket, diff.context())?;
                }
            }
            ("region", DiffAction::Add) => {
                let app = scope
                    .models
                    .dereference(diff.context())?
                    .parents()
                    .next()
                    .and_then(|parent| scope.models.find(parent))
                    .map(|app| app.identity().to_string())
                    .unwrap_or_default();
                let vpc = resources
                    .id_of(&format!("{VPC}=vpc-{app}"))
                    .ok_or_else(|| ActionError::new(format!("no VPC for app {app}")))?;
                let subnet =
                    resources.ensure_node(NodeSpec::new(SUBNET, format!("subnet-{identity}")))?;
                resources.add_behavior(
                    vpc,
                    subnet,
                    Behavior::new("vpcId", DiffAction::Add, "subnetId", DiffAction::Add),
                )?;
                resources.add_behavior(
                    subnet,
                    vpc,
                    Behavior::new("subnetId", DiffAction::Delete, "vpcId", DiffAction::Delete),
                )?;
            }
            ("region", DiffAction::Delete) => {
                if let Some(subnet) = resources.id_of(&format!("{SUBNET}=subnet-{identity}")) {
                    resources.remove(subnet)?;
                }
            }
            _ => {}
        }

        Ok(ActionOutputs::new())
    }
}

/// Provisions and destroys resources, optionally failing on one context.
pub struct ProvisionAction {
    pub log: CallLog,
    pub fail_on: Arc<Mutex<Option<String>>>,
}

impl ProvisionAction {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            fail_on: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl Action for ProvisionAction {
    fn name(&self) -> &str {
        "provision"
    }

    fn filter(&self, diff: &Diff) -> bool {
        matches!(diff.action(), DiffAction::Add | DiffAction::Delete)
    }

    async fn handle(
        &self,
        diff: &Diff,
        _inputs: &ActionInputs,
        scope: &mut ActionScope<'_>,
    ) -> Result<ActionOutputs> {
        self.log.push(self.name(), diff.context());
        if self.fail_on.lock().unwrap().as_deref() == Some(diff.context()) {
            return Err(ActionError::new(format!("provider rejected {}", diff.context())).into());
        }

        let mut outputs = ActionOutputs::new();
        if diff.action() == DiffAction::Add {
            let arn = format!("arn:example:{}", diff.value().as_str().unwrap_or_default());
            if let Some(id) = scope.resources.id_of(diff.context()) {
                scope.resources.set_response(id, "arn", Value::from(arn.clone()))?;
            }
            outputs.insert(format!("{}.arn", diff.context()), Value::from(arn));
        }
        Ok(outputs)
    }

    async fn revert(
        &self,
        diff: &Diff,
        _inputs: &ActionInputs,
        _outputs: &ActionOutputs,
        _scope: &mut ActionScope<'_>,
    ) -> Result<ActionOutputs> {
        self.log.push("revert", diff.context());
        Ok(ActionOutputs::new())
    }
}

/// Builds `app=<app>` with one region and an optional environment.
pub struct TopologyModule {
    pub id: String,
}

impl Module for TopologyModule {
    fn module_id(&self) -> &str {
        &self.id
    }

    fn on_init(&self, inputs: &ModuleInputs, graph: &mut Graph) -> Result<Vec<NodeId>> {
        let app: String = inputs.get("app")?;
        let region: String = inputs.get("region")?;
        let environment: Option<String> = inputs.get_opt("environment")?;

        let app = graph.add_node(NodeSpec::new(APP, app))?;
        let region = graph.add_child(app, NodeSpec::new(REGION, region))?;
        if let Some(environment) = environment {
            graph.add_child(region, NodeSpec::new(ENVIRONMENT, environment))?;
        }
        Ok(vec![app])
    }

    fn register_metadata(&self, inputs: &ModuleInputs) -> Result<Map<String, Value>> {
        let mut metadata = Map::new();
        if let Some(cidr) = inputs.get_opt::<String>("cidr")? {
            metadata.insert(String::from("cidr"), Value::from(cidr));
        }
        Ok(metadata)
    }
}

/// Actions used by the scenarios, with a handle on the failure switch.
pub struct Fixture {
    pub actions: ActionRegistry,
    pub log: CallLog,
    pub fail_on: Arc<Mutex<Option<String>>>,
}

pub fn fixture() -> Fixture {
    let log = CallLog::default();
    let provision = ProvisionAction::new(log.clone());
    let fail_on = Arc::clone(&provision.fail_on);
    let provision: Arc<dyn Action> = Arc::new(provision);

    let mut actions = ActionRegistry::new();
    actions
        .register(NodeKind::Model, Arc::new(TopologyAction { log: log.clone() }))
        .unwrap();
    actions
        .register(NodeKind::Resource, Arc::clone(&provision))
        .unwrap();
    actions
        .register(NodeKind::SharedResource, provision)
        .unwrap();

    Fixture {
        actions,
        log,
        fail_on,
    }
}

/// Model graph with one app per `(app, region)` pair.
pub fn models(classes: &Arc<ClassRegistry>, apps: &[(&str, &str, Option<&str>)]) -> Graph {
    let mut graph = Graph::new(Arc::clone(classes));
    for (app, region, environment) in apps {
        let app = graph.add_node(NodeSpec::new(APP, *app)).unwrap();
        let region = graph.add_child(app, NodeSpec::new(REGION, *region)).unwrap();
        if let Some(environment) = environment {
            graph
                .add_child(region, NodeSpec::new(ENVIRONMENT, *environment))
                .unwrap();
        }
    }
    graph
}

/// Module inputs for [`TopologyModule`].
pub fn topology_inputs(app: &str, region: &str) -> ModuleInputs {
    ModuleInputs::from_value(json!({ "app": app, "region": region }))
}

/// Stops `ProvisionAction` from failing.
pub fn heal(fail_on: &Arc<Mutex<Option<String>>>) {
    *fail_on.lock().unwrap() = None;
}

/// Makes `ProvisionAction` fail on `context`.
pub fn break_on(fail_on: &Arc<Mutex<Option<String>>>, context: &str) {
    *fail_on.lock().unwrap() = Some(context.to_string());
}

pub fn response_map(graph: &Graph, context: &str) -> BTreeMap<String, Value> {
    graph
        .find(context)
        .map(|node| {
            node.response()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}
