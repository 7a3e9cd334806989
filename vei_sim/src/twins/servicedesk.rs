//! Service desk twin: incidents and access requests with approvals.

use super::{arg_str, opt_str};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use vei_core::{
    Affordance, ArgKind, ArgsSchema, ConnectorError, ProviderContext, SideEffect, StateStore, ToolProvider,
    ToolSpec,
};

const INCIDENTS: &str = "servicedesk.incidents";
const REQUESTS: &str = "servicedesk.requests";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub author: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub title: String,
    pub status: String,
    pub priority: String,
    pub assignee: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub history: Vec<Value>,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub stage: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    pub id: String,
    pub title: String,
    pub status: String,
    pub requester: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub approvals: Vec<Approval>,
    #[serde(default)]
    pub history: Vec<Value>,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

/// Seed tickets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceDeskConfig {
    pub incidents: Vec<Incident>,
    pub requests: Vec<AccessRequest>,
}

impl Default for ServiceDeskConfig {
    fn default() -> Self {
        Self {
            incidents: vec![Incident {
                id: "INC-4201".to_string(),
                title: "Procurement portal outage".to_string(),
                status: "IN_PROGRESS".to_string(),
                priority: "P2".to_string(),
                assignee: Some("maya.ops".to_string()),
                description: "Procurement UI throws 500 when approving requests.".to_string(),
                history: vec![
                    json!({ "status": "NEW" }),
                    json!({ "status": "IN_PROGRESS", "assignee": "maya.ops" }),
                ],
                comments: Vec::new(),
            }],
            requests: vec![AccessRequest {
                id: "REQ-8801".to_string(),
                title: "Access: Procurement Admin".to_string(),
                status: "PENDING_APPROVAL".to_string(),
                requester: "amy@macrocompute.example".to_string(),
                description: "Need elevated rights to review MacroBook vendor contract.".to_string(),
                approvals: vec![
                    Approval {
                        stage: "manager".to_string(),
                        status: "APPROVED".to_string(),
                    },
                    Approval {
                        stage: "security".to_string(),
                        status: "PENDING".to_string(),
                    },
                ],
                history: Vec::new(),
                comments: Vec::new(),
            }],
        }
    }
}

fn agent_comment(body: &str) -> Value {
    json!({ "author": "agent", "body": body })
}

/// The service desk twin.
#[derive(Debug, Clone, Default)]
pub struct ServiceDeskTwin {
    config: ServiceDeskConfig,
}

impl ServiceDeskTwin {
    pub fn new(config: ServiceDeskConfig) -> Self {
        Self { config }
    }

    fn incident(ctx: &ProviderContext<'_>, id: &str) -> Result<Incident, ConnectorError> {
        ctx.read_as(INCIDENTS, id)?.ok_or_else(|| {
            ConnectorError::new("servicedesk.incident_not_found", format!("Unknown incident: {}", id))
        })
    }

    fn request(ctx: &ProviderContext<'_>, id: &str) -> Result<AccessRequest, ConnectorError> {
        ctx.read_as(REQUESTS, id)?.ok_or_else(|| {
            ConnectorError::new("servicedesk.request_not_found", format!("Unknown request: {}", id))
        })
    }

    fn update_incident(&self, args: &Value, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        let mut incident = Self::incident(ctx, arg_str(args, "incident_id")?)?;
        if let Some(status) = opt_str(args, "status") {
            incident.status = status.to_string();
            incident.history.push(json!({ "status": status }));
        }
        if let Some(assignee) = opt_str(args, "assignee") {
            incident.assignee = Some(assignee.to_string());
            incident.history.push(json!({ "assignee": assignee }));
        }
        if let Some(body) = opt_str(args, "comment") {
            ctx.push(INCIDENTS, &incident.id, "comments", agent_comment(body));
        }
        ctx.merge(
            INCIDENTS,
            &incident.id,
            json!({ "status": incident.status, "assignee": incident.assignee, "history": incident.history }),
        )?;
        Ok(json!({ "incident_id": incident.id, "status": incident.status, "assignee": incident.assignee }))
    }

    fn update_request(&self, args: &Value, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        let mut request = Self::request(ctx, arg_str(args, "request_id")?)?;
        if let Some(status) = opt_str(args, "status") {
            request.status = status.to_string();
            request.history.push(json!({ "status": status }));
        }
        if let (Some(stage), Some(status)) = (opt_str(args, "approval_stage"), opt_str(args, "approval_status")) {
            match request.approvals.iter_mut().find(|a| a.stage == stage) {
                Some(approval) => approval.status = status.to_string(),
                None => request.approvals.push(Approval {
                    stage: stage.to_string(),
                    status: status.to_string(),
                }),
            }
            request
                .history
                .push(json!({ "approval_stage": stage, "approval_status": status }));
        }
        if let Some(body) = opt_str(args, "comment") {
            ctx.push(REQUESTS, &request.id, "comments", agent_comment(body));
        }
        ctx.merge(
            REQUESTS,
            &request.id,
            json!({ "status": request.status, "approvals": request.approvals, "history": request.history }),
        )?;
        Ok(json!({ "request_id": request.id, "status": request.status }))
    }
}

impl ToolProvider for ServiceDeskTwin {
    fn connector(&self) -> &str {
        "servicedesk"
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec::new("servicedesk.list_incidents", "List incidents")
                .with_args(
                    ArgsSchema::new()
                        .optional("status", ArgKind::Str)
                        .optional("priority", ArgKind::Str),
                )
                .generic(),
            ToolSpec::new("servicedesk.get_incident", "Fetch an incident")
                .with_args(ArgsSchema::new().required("incident_id", ArgKind::Str))
                .concrete(),
            ToolSpec::new("servicedesk.update_incident", "Change status, assignee or comment on an incident")
                .with_args(
                    ArgsSchema::new()
                        .required("incident_id", ArgKind::Str)
                        .optional("status", ArgKind::Str)
                        .optional("assignee", ArgKind::Str)
                        .optional("comment", ArgKind::Str),
                )
                .with_side_effects(&[SideEffect::Write])
                .generic(),
            ToolSpec::new("servicedesk.list_requests", "List service requests")
                .with_args(ArgsSchema::new().optional("status", ArgKind::Str))
                .generic(),
            ToolSpec::new("servicedesk.get_request", "Fetch a service request")
                .with_args(ArgsSchema::new().required("request_id", ArgKind::Str))
                .concrete(),
            ToolSpec::new("servicedesk.update_request", "Change status or record an approval on a request")
                .with_args(
                    ArgsSchema::new()
                        .required("request_id", ArgKind::Str)
                        .optional("status", ArgKind::Str)
                        .optional("approval_stage", ArgKind::Str)
                        .optional("approval_status", ArgKind::Str)
                        .optional("comment", ArgKind::Str),
                )
                .with_side_effects(&[SideEffect::Write])
                .generic(),
        ]
    }

    fn initialize(&self, ctx: &mut ProviderContext<'_>) -> Result<(), ConnectorError> {
        for incident in &self.config.incidents {
            ctx.put(INCIDENTS, &incident.id, incident)?;
        }
        for request in &self.config.requests {
            ctx.put(REQUESTS, &request.id, request)?;
        }
        Ok(())
    }

    fn call(&self, tool: &str, args: &Value, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        match tool {
            "servicedesk.list_incidents" => {
                let status = opt_str(args, "status");
                let priority = opt_str(args, "priority");
                let rows: Vec<Value> = ctx
                    .list(INCIDENTS)
                    .into_values()
                    .filter_map(|doc| serde_json::from_value::<Incident>(doc).ok())
                    .filter(|i| status.map_or(true, |s| i.status == s))
                    .filter(|i| priority.map_or(true, |p| i.priority == p))
                    .map(|i| {
                        json!({
                            "id": i.id,
                            "title": i.title,
                            "status": i.status,
                            "priority": i.priority,
                            "assignee": i.assignee,
                        })
                    })
                    .collect();
                Ok(json!({ "count": rows.len(), "incidents": rows }))
            }
            "servicedesk.get_incident" => Ok(json!(Self::incident(ctx, arg_str(args, "incident_id")?)?)),
            "servicedesk.update_incident" => self.update_incident(args, ctx),
            "servicedesk.list_requests" => {
                let status = opt_str(args, "status");
                let rows: Vec<Value> = ctx
                    .list(REQUESTS)
                    .into_values()
                    .filter_map(|doc| serde_json::from_value::<AccessRequest>(doc).ok())
                    .filter(|r| status.map_or(true, |s| r.status == s))
                    .map(|r| json!({ "id": r.id, "title": r.title, "status": r.status, "requester": r.requester }))
                    .collect();
                Ok(json!({ "count": rows.len(), "requests": rows }))
            }
            "servicedesk.get_request" => Ok(json!(Self::request(ctx, arg_str(args, "request_id")?)?)),
            "servicedesk.update_request" => self.update_request(args, ctx),
            other => Err(ConnectorError::new("unknown_tool", other)),
        }
    }

    fn summary(&self, store: &StateStore) -> Option<String> {
        let open = store
            .family(INCIDENTS)
            .map(|f| f.values().filter(|i| i["status"] != "RESOLVED" && i["status"] != "CLOSED").count())
            .unwrap_or(0);
        let pending = store
            .family(REQUESTS)
            .map(|f| f.values().filter(|r| r["status"] == "PENDING_APPROVAL").count())
            .unwrap_or(0);
        Some(format!(
            "ServiceDesk: {} open incidents, {} requests awaiting approval",
            open, pending
        ))
    }

    fn affordances(&self, store: &StateStore) -> Vec<Affordance> {
        let mut out = Vec::new();
        for id in store.family(INCIDENTS).into_iter().flat_map(|f| f.keys()) {
            out.push(Affordance {
                tool: "servicedesk.get_incident".to_string(),
                args: json!({ "incident_id": id }),
                label: format!("Open incident {}", id),
                id: format!("incident:{}", id),
            });
        }
        for id in store.family(REQUESTS).into_iter().flat_map(|f| f.keys()) {
            out.push(Affordance {
                tool: "servicedesk.get_request".to_string(),
                args: json!({ "request_id": id }),
                label: format!("Open request {}", id),
                id: format!("request:{}", id),
            });
        }
        out
    }
}
