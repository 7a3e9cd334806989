//! Okta-style identity twin: users, groups and SSO applications.

use super::{arg_str, opt_bool, opt_str};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use vei_core::{
    Affordance, ArgKind, ArgsSchema, ConnectorError, ProviderContext, SideEffect, StateStore, ToolProvider,
    ToolSpec,
};

const USERS: &str = "okta.users";
const GROUPS: &str = "okta.groups";
const APPS: &str = "okta.apps";
const RESETS: &str = "okta.reset_tokens";

/// Lifetime of a password reset token.
pub const RESET_TOKEN_TTL_MS: u64 = 3_600_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub login: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub department: String,
    #[serde(default = "active")]
    pub status: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub applications: Vec<String>,
}

fn active() -> String {
    "ACTIVE".to_string()
}

impl User {
    fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }

    fn summary(&self) -> Value {
        json!({
            "id": self.id,
            "email": self.email,
            "login": self.login,
            "display_name": self.display_name(),
            "status": self.status,
            "department": self.department,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub assignments: Vec<String>,
}

/// Seed directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub users: Vec<User>,
    pub groups: Vec<Group>,
    pub applications: Vec<Application>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        let user = |id: &str, login: &str, first: &str, last: &str, title: &str, dept: &str, status: &str| User {
            id: id.to_string(),
            email: format!("{}@example.com", login),
            login: login.to_string(),
            first_name: first.to_string(),
            last_name: last.to_string(),
            title: title.to_string(),
            department: dept.to_string(),
            status: status.to_string(),
            groups: Vec::new(),
            applications: Vec::new(),
        };
        Self {
            users: vec![
                user("USR-9001", "jane", "Jane", "Castillo", "Security Lead", "Security", "ACTIVE"),
                user("USR-9002", "mike", "Mike", "Dorsey", "IT Analyst", "IT", "SUSPENDED"),
            ],
            groups: vec![
                Group {
                    id: "GRP-security".to_string(),
                    name: "Security Admins".to_string(),
                    description: "Manage identity profiles and MFA".to_string(),
                    members: vec!["USR-9001".to_string()],
                },
                Group {
                    id: "GRP-it".to_string(),
                    name: "IT Support".to_string(),
                    description: String::new(),
                    members: vec!["USR-9002".to_string()],
                },
            ],
            applications: vec![Application {
                id: "APP-sso".to_string(),
                label: "Macro SSO".to_string(),
                description: "Corporate identity provider".to_string(),
                assignments: vec!["USR-9001".to_string(), "USR-9002".to_string()],
            }],
        }
    }
}

impl IdentityConfig {
    /// Users with group and app memberships mirrored from the group and
    /// app side.
    fn synced_users(&self) -> Vec<User> {
        let mut users = self.users.clone();
        for user in &mut users {
            for group in self.groups.iter().filter(|g| g.members.contains(&user.id)) {
                if !user.groups.contains(&group.id) {
                    user.groups.push(group.id.clone());
                }
            }
            for app in self.applications.iter().filter(|a| a.assignments.contains(&user.id)) {
                if !user.applications.contains(&app.id) {
                    user.applications.push(app.id.clone());
                }
            }
        }
        users
    }
}

fn text_matches(needle: &str, haystacks: &[&str]) -> bool {
    needle.is_empty() || haystacks.iter().any(|h| h.to_lowercase().contains(needle))
}

/// The identity twin.
#[derive(Debug, Clone, Default)]
pub struct IdentityTwin {
    config: IdentityConfig,
}

impl IdentityTwin {
    pub fn new(config: IdentityConfig) -> Self {
        Self { config }
    }

    fn user(ctx: &ProviderContext<'_>, id: &str) -> Result<User, ConnectorError> {
        ctx.read_as(USERS, id)?
            .ok_or_else(|| ConnectorError::new("okta.user_not_found", format!("Unknown user: {}", id)))
    }

    fn group(ctx: &ProviderContext<'_>, id: &str) -> Result<Group, ConnectorError> {
        ctx.read_as(GROUPS, id)?
            .ok_or_else(|| ConnectorError::new("okta.group_not_found", format!("Unknown group: {}", id)))
    }

    fn all<T: serde::de::DeserializeOwned>(ctx: &ProviderContext<'_>, family: &str) -> Result<Vec<T>, ConnectorError> {
        ctx.list(family)
            .into_values()
            .map(|doc| serde_json::from_value(doc).map_err(|e| ConnectorError::new("decode_error", e.to_string())))
            .collect()
    }

    fn list_users(&self, args: &Value, ctx: &ProviderContext<'_>) -> Result<Value, ConnectorError> {
        let status = opt_str(args, "status").map(str::to_uppercase);
        let needle = opt_str(args, "query").unwrap_or_default().trim().to_lowercase();
        let include_groups = opt_bool(args, "include_groups");

        let mut users: Vec<User> = Self::all(ctx, USERS)?;
        users.sort_by(|a, b| (&a.status, &a.email).cmp(&(&b.status, &b.email)));
        let rows: Vec<Value> = users
            .iter()
            .filter(|u| status.as_deref().map_or(true, |s| u.status.eq_ignore_ascii_case(s)))
            .filter(|u| text_matches(&needle, &[u.email.as_str(), u.display_name().as_str()]))
            .map(|u| {
                let mut row = u.summary();
                if include_groups {
                    row["groups"] = json!(u.groups);
                }
                row
            })
            .collect();
        Ok(json!({ "count": rows.len(), "users": rows }))
    }

    fn set_status(
        &self,
        user: &User,
        status: &str,
        ctx: &mut ProviderContext<'_>,
    ) -> Result<(), ConnectorError> {
        ctx.merge(USERS, &user.id, json!({ "status": status }))
    }

    fn reset_password(&self, user_id: &str, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        let user = Self::user(ctx, user_id)?;
        if !matches!(user.status.as_str(), "ACTIVE" | "PROVISIONED" | "SUSPENDED") {
            return Err(ConnectorError::new(
                "okta.invalid_state",
                format!("Cannot reset password for {} user", user.status.to_lowercase()),
            ));
        }
        let token = format!("RST-{:04}-{}", ctx.count(RESETS) + 1, user.id);
        let expires_ms = ctx.now() + RESET_TOKEN_TTL_MS;
        ctx.put(RESETS, &token, &json!({ "user_id": user.id, "expires_at_ms": expires_ms }))?;
        Ok(json!({ "user_id": user.id, "reset_token": token, "expires_ms": RESET_TOKEN_TTL_MS }))
    }
}

impl ToolProvider for IdentityTwin {
    fn connector(&self) -> &str {
        "okta"
    }

    fn tools(&self) -> Vec<ToolSpec> {
        let user_id = || ArgsSchema::new().required("user_id", ArgKind::Str);
        vec![
            ToolSpec::new("okta.list_users", "List directory users, optionally filtered by status or query")
                .with_args(
                    ArgsSchema::new()
                        .optional("status", ArgKind::Str)
                        .optional("query", ArgKind::Str)
                        .optional("include_groups", ArgKind::Bool),
                )
                .with_latency(350, 120)
                .generic(),
            ToolSpec::new("okta.get_user", "Fetch a user profile")
                .with_args(user_id())
                .with_latency(320, 90)
                .concrete(),
            ToolSpec::new("okta.activate_user", "Activate a user")
                .with_args(user_id())
                .with_side_effects(&[SideEffect::Write])
                .with_latency(420, 140)
                .generic(),
            ToolSpec::new("okta.deactivate_user", "Deprovision a user")
                .with_args(user_id().optional("reason", ArgKind::Str))
                .with_side_effects(&[SideEffect::Write])
                .with_latency(450, 150)
                .generic(),
            ToolSpec::new("okta.reset_password", "Issue a password reset token")
                .with_args(user_id())
                .with_side_effects(&[SideEffect::Write])
                .with_latency(380, 110)
                .generic(),
            ToolSpec::new("okta.list_groups", "List groups")
                .with_args(
                    ArgsSchema::new()
                        .optional("query", ArgKind::Str)
                        .optional("include_members", ArgKind::Bool),
                )
                .with_latency(330, 100)
                .generic(),
            ToolSpec::new("okta.assign_group", "Add a user to a group")
                .with_args(user_id().required("group_id", ArgKind::Str))
                .with_side_effects(&[SideEffect::Write])
                .with_latency(410, 140)
                .generic(),
            ToolSpec::new("okta.list_applications", "List SSO applications")
                .with_args(ArgsSchema::new().optional("query", ArgKind::Str))
                .with_latency(300, 80)
                .generic(),
            ToolSpec::new("okta.assign_application", "Assign an application to a user")
                .with_args(user_id().required("app_id", ArgKind::Str))
                .with_side_effects(&[SideEffect::Write])
                .with_latency(420, 130)
                .generic(),
        ]
    }

    fn initialize(&self, ctx: &mut ProviderContext<'_>) -> Result<(), ConnectorError> {
        for user in self.config.synced_users() {
            ctx.put(USERS, &user.id, &user)?;
        }
        for group in &self.config.groups {
            ctx.put(GROUPS, &group.id, group)?;
        }
        for app in &self.config.applications {
            ctx.put(APPS, &app.id, app)?;
        }
        Ok(())
    }

    fn call(&self, tool: &str, args: &Value, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        match tool {
            "okta.list_users" => self.list_users(args, ctx),
            "okta.get_user" => Ok(json!(Self::user(ctx, arg_str(args, "user_id")?)?)),
            "okta.activate_user" => {
                let user = Self::user(ctx, arg_str(args, "user_id")?)?;
                let changed = user.status != "ACTIVE";
                if changed {
                    self.set_status(&user, "ACTIVE", ctx)?;
                }
                Ok(json!({ "id": user.id, "status": "ACTIVE", "changed": changed }))
            }
            "okta.deactivate_user" => {
                let user = Self::user(ctx, arg_str(args, "user_id")?)?;
                if user.status == "DEPROVISIONED" {
                    return Err(ConnectorError::new(
                        "okta.invalid_state",
                        format!("User already deprovisioned: {}", user.id),
                    ));
                }
                self.set_status(&user, "DEPROVISIONED", ctx)?;
                Ok(json!({
                    "id": user.id,
                    "status": "DEPROVISIONED",
                    "reason": opt_str(args, "reason").unwrap_or("manual"),
                }))
            }
            "okta.reset_password" => self.reset_password(arg_str(args, "user_id")?, ctx),
            "okta.list_groups" => {
                let needle = opt_str(args, "query").unwrap_or_default().trim().to_lowercase();
                let include_members = opt_bool(args, "include_members");
                let mut groups: Vec<Group> = Self::all(ctx, GROUPS)?;
                groups.sort_by(|a, b| a.name.cmp(&b.name));
                let rows: Vec<Value> = groups
                    .iter()
                    .filter(|g| text_matches(&needle, &[g.name.as_str()]))
                    .map(|g| {
                        let mut row = json!({ "id": g.id, "name": g.name, "description": g.description });
                        if include_members {
                            row["members"] = json!(g.members);
                        }
                        row
                    })
                    .collect();
                Ok(json!({ "count": rows.len(), "groups": rows }))
            }
            "okta.assign_group" => {
                let user = Self::user(ctx, arg_str(args, "user_id")?)?;
                let mut group = Self::group(ctx, arg_str(args, "group_id")?)?;
                if !group.members.contains(&user.id) {
                    group.members.push(user.id.clone());
                    ctx.put(GROUPS, &group.id, &group)?;
                }
                if !user.groups.contains(&group.id) {
                    ctx.push(USERS, &user.id, "groups", json!(group.id));
                }
                Ok(json!({ "group_id": group.id, "user_id": user.id, "members": group.members.len() }))
            }
            "okta.list_applications" => {
                let needle = opt_str(args, "query").unwrap_or_default().trim().to_lowercase();
                let mut apps: Vec<Application> = Self::all(ctx, APPS)?;
                apps.sort_by(|a, b| a.label.cmp(&b.label));
                let rows: Vec<Value> = apps
                    .iter()
                    .filter(|a| text_matches(&needle, &[a.label.as_str()]))
                    .map(|a| json!({ "id": a.id, "label": a.label, "description": a.description }))
                    .collect();
                Ok(json!({ "count": rows.len(), "applications": rows }))
            }
            "okta.assign_application" => {
                let user = Self::user(ctx, arg_str(args, "user_id")?)?;
                let app_id = arg_str(args, "app_id")?;
                let mut app: Application = ctx.read_as(APPS, app_id)?.ok_or_else(|| {
                    ConnectorError::new("okta.app_not_found", format!("Unknown application: {}", app_id))
                })?;
                if !app.assignments.contains(&user.id) {
                    app.assignments.push(user.id.clone());
                    ctx.put(APPS, &app.id, &app)?;
                }
                if !user.applications.contains(&app.id) {
                    ctx.push(USERS, &user.id, "applications", json!(app.id));
                }
                Ok(json!({ "user_id": user.id, "app_id": app.id, "assignments": app.assignments.len() }))
            }
            other => Err(ConnectorError::new("unknown_tool", other)),
        }
    }

    fn summary(&self, store: &StateStore) -> Option<String> {
        let users = store.family(USERS)?;
        let suspended = users.values().filter(|u| u["status"] == "SUSPENDED").count();
        Some(format!(
            "Okta: {} users ({} suspended), {} groups",
            users.len(),
            suspended,
            store.count(GROUPS)
        ))
    }

    fn affordances(&self, store: &StateStore) -> Vec<Affordance> {
        store
            .family(USERS)
            .map(|users| {
                users
                    .keys()
                    .map(|id| Affordance {
                        tool: "okta.get_user".to_string(),
                        args: json!({ "user_id": id }),
                        label: format!("View user {}", id),
                        id: format!("user:{}", id),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_router;
    use super::*;

    #[test]
    fn test_seed_memberships_are_synced() {
        let mut router = test_router(IdentityTwin::default());
        let jane = router.dispatch("okta.get_user", &json!({ "user_id": "USR-9001" })).unwrap();
        assert_eq!(jane["groups"], json!(["GRP-security"]));
        assert_eq!(jane["applications"], json!(["APP-sso"]));
    }

    #[test]
    fn test_list_users_sorted_by_status_then_email() {
        let mut router = test_router(IdentityTwin::default());
        let listed = router.dispatch("okta.list_users", &json!({})).unwrap();
        assert_eq!(listed["count"], 2);
        assert_eq!(listed["users"][0]["id"], "USR-9001");
        assert_eq!(listed["users"][1]["status"], "SUSPENDED");

        let filtered = router
            .dispatch("okta.list_users", &json!({ "status": "suspended", "include_groups": true }))
            .unwrap();
        assert_eq!(filtered["count"], 1);
        assert_eq!(filtered["users"][0]["groups"], json!(["GRP-it"]));
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut router = test_router(IdentityTwin::default());
        let activated = router.dispatch("okta.activate_user", &json!({ "user_id": "USR-9002" })).unwrap();
        assert_eq!(activated["changed"], true);
        let again = router.dispatch("okta.activate_user", &json!({ "user_id": "USR-9002" })).unwrap();
        assert_eq!(again["changed"], false);

        let gone = router.dispatch("okta.deactivate_user", &json!({ "user_id": "USR-9002" })).unwrap();
        assert_eq!(gone["reason"], "manual");
        let err = router
            .dispatch("okta.deactivate_user", &json!({ "user_id": "USR-9002" }))
            .unwrap_err();
        assert_eq!(err.code(), "okta.invalid_state");
        let err = router.dispatch("okta.reset_password", &json!({ "user_id": "USR-9002" })).unwrap_err();
        assert_eq!(err.code(), "okta.invalid_state");
    }

    #[test]
    fn test_reset_tokens_are_sequential() {
        let mut router = test_router(IdentityTwin::default());
        let first = router.dispatch("okta.reset_password", &json!({ "user_id": "USR-9001" })).unwrap();
        let second = router.dispatch("okta.reset_password", &json!({ "user_id": "USR-9002" })).unwrap();
        assert_eq!(first["reset_token"], "RST-0001-USR-9001");
        assert_eq!(second["reset_token"], "RST-0002-USR-9002");
        assert_eq!(second["expires_ms"], RESET_TOKEN_TTL_MS);
    }

    #[test]
    fn test_assign_group_updates_both_sides() {
        let mut router = test_router(IdentityTwin::default());
        let assigned = router
            .dispatch("okta.assign_group", &json!({ "user_id": "USR-9002", "group_id": "GRP-security" }))
            .unwrap();
        assert_eq!(assigned["members"], 2);
        let mike = router.dispatch("okta.get_user", &json!({ "user_id": "USR-9002" })).unwrap();
        assert_eq!(mike["groups"], json!(["GRP-it", "GRP-security"]));

        let err = router
            .dispatch("okta.assign_group", &json!({ "user_id": "USR-1", "group_id": "GRP-it" }))
            .unwrap_err();
        assert_eq!(err.code(), "okta.user_not_found");
        let err = router
            .dispatch("okta.assign_group", &json!({ "user_id": "USR-9001", "group_id": "GRP-x" }))
            .unwrap_err();
        assert_eq!(err.code(), "okta.group_not_found");
    }
}
