//! CRM twin: contacts, companies, deals and activity log.

use super::{arg_str, next_id, not_found, opt_bool, opt_str, to_cents};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use vei_core::{
    ArgKind, ArgsSchema, ConnectorError, ProviderContext, SideEffect, StateStore, ToolProvider, ToolSpec,
};
use vei_env::LogicalTime;

const CONTACTS: &str = "crm.contacts";
const COMPANIES: &str = "crm.companies";
const DEALS: &str = "crm.deals";
const ACTIVITIES: &str = "crm.activities";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub do_not_contact: bool,
    pub company_id: Option<String>,
    pub created_ms: LogicalTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: String,
    pub name: String,
    pub domain: String,
    pub created_ms: LogicalTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deal {
    pub id: String,
    pub name: String,
    pub amount_cents: i64,
    pub stage: String,
    pub contact_id: Option<String>,
    pub company_id: Option<String>,
    pub created_ms: LogicalTime,
    pub updated_ms: LogicalTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub kind: String,
    pub contact_id: Option<String>,
    pub deal_id: Option<String>,
    pub note: String,
    pub time_ms: LogicalTime,
}

/// The CRM twin.
#[derive(Debug, Clone, Default)]
pub struct CrmTwin;

impl CrmTwin {
    fn contact(ctx: &ProviderContext<'_>, id: &str) -> Result<Contact, ConnectorError> {
        ctx.read_as(CONTACTS, id)?
            .ok_or_else(|| not_found("unknown_contact", "contact", id))
    }

    fn company(ctx: &ProviderContext<'_>, id: &str) -> Result<Company, ConnectorError> {
        ctx.read_as(COMPANIES, id)?
            .ok_or_else(|| not_found("unknown_company", "company", id))
    }

    fn deal(ctx: &ProviderContext<'_>, id: &str) -> Result<Deal, ConnectorError> {
        ctx.read_as(DEALS, id)?.ok_or_else(|| not_found("unknown_deal", "deal", id))
    }

    fn create_contact(&self, args: &Value, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        let contact = Contact {
            id: next_id(ctx, CONTACTS, "C"),
            email: arg_str(args, "email")?.to_string(),
            first_name: opt_str(args, "first_name").unwrap_or_default().to_string(),
            last_name: opt_str(args, "last_name").unwrap_or_default().to_string(),
            do_not_contact: opt_bool(args, "do_not_contact"),
            company_id: None,
            created_ms: ctx.now(),
        };
        ctx.put(CONTACTS, &contact.id, &contact)?;
        Ok(json!({ "id": contact.id }))
    }

    fn create_deal(&self, args: &Value, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        let contact_id = opt_str(args, "contact_id").map(str::to_string);
        let company_id = opt_str(args, "company_id").map(str::to_string);
        if let Some(id) = &contact_id {
            Self::contact(ctx, id)?;
            ctx.require(CONTACTS, id);
        }
        if let Some(id) = &company_id {
            Self::company(ctx, id)?;
            ctx.require(COMPANIES, id);
        }
        let deal = Deal {
            id: next_id(ctx, DEALS, "D"),
            name: arg_str(args, "name")?.to_string(),
            amount_cents: to_cents(args.get("amount").unwrap_or(&Value::Null))?,
            stage: opt_str(args, "stage").unwrap_or("New").to_string(),
            contact_id,
            company_id,
            created_ms: ctx.now(),
            updated_ms: ctx.now(),
        };
        ctx.put(DEALS, &deal.id, &deal)?;
        Ok(json!({ "id": deal.id }))
    }

    fn log_activity(&self, args: &Value, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        let kind = arg_str(args, "kind")?;
        let contact_id = opt_str(args, "contact_id");
        if let Some(id) = contact_id {
            let contact = Self::contact(ctx, id)?;
            if kind == "email_outreach" && contact.do_not_contact && ctx.seeded_error() {
                return Err(ConnectorError::new("consent_violation", "Contact is marked do-not-contact."));
            }
        }
        let deal_id = opt_str(args, "deal_id");
        if let Some(id) = deal_id {
            Self::deal(ctx, id)?;
        }
        let activity = Activity {
            id: next_id(ctx, ACTIVITIES, "A"),
            kind: kind.to_string(),
            contact_id: contact_id.map(str::to_string),
            deal_id: deal_id.map(str::to_string),
            note: opt_str(args, "note").unwrap_or_default().to_string(),
            time_ms: ctx.now(),
        };
        ctx.put(ACTIVITIES, &activity.id, &activity)?;
        Ok(json!({ "ok": true, "id": activity.id }))
    }
}

fn get_by_id() -> ArgsSchema {
    ArgsSchema::new().required("id", ArgKind::Str)
}

impl ToolProvider for CrmTwin {
    fn connector(&self) -> &str {
        "crm"
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec::new("crm.create_contact", "Create a contact")
                .with_args(
                    ArgsSchema::new()
                        .required("email", ArgKind::Str)
                        .optional("first_name", ArgKind::Str)
                        .optional("last_name", ArgKind::Str)
                        .optional("do_not_contact", ArgKind::Bool),
                )
                .with_side_effects(&[SideEffect::Write])
                .generic(),
            ToolSpec::new("crm.get_contact", "Fetch a contact").with_args(get_by_id()).generic(),
            ToolSpec::new("crm.list_contacts", "List contacts").generic(),
            ToolSpec::new("crm.create_company", "Create a company")
                .with_args(
                    ArgsSchema::new()
                        .required("name", ArgKind::Str)
                        .optional("domain", ArgKind::Str),
                )
                .with_side_effects(&[SideEffect::Write])
                .generic(),
            ToolSpec::new("crm.get_company", "Fetch a company").with_args(get_by_id()).generic(),
            ToolSpec::new("crm.list_companies", "List companies").generic(),
            ToolSpec::new("crm.associate_contact_company", "Link a contact to a company")
                .with_args(
                    ArgsSchema::new()
                        .required("contact_id", ArgKind::Str)
                        .required("company_id", ArgKind::Str),
                )
                .with_side_effects(&[SideEffect::Write])
                .generic(),
            ToolSpec::new("crm.create_deal", "Open a deal")
                .with_args(
                    ArgsSchema::new()
                        .required("name", ArgKind::Str)
                        .required("amount", ArgKind::Amount)
                        .optional("stage", ArgKind::Str)
                        .optional("contact_id", ArgKind::Str)
                        .optional("company_id", ArgKind::Str),
                )
                .with_side_effects(&[SideEffect::Write])
                .generic(),
            ToolSpec::new("crm.get_deal", "Fetch a deal").with_args(get_by_id()).generic(),
            ToolSpec::new("crm.list_deals", "List deals").generic(),
            ToolSpec::new("crm.update_deal_stage", "Move a deal to another stage")
                .with_args(
                    ArgsSchema::new()
                        .required("id", ArgKind::Str)
                        .required("stage", ArgKind::Str),
                )
                .with_side_effects(&[SideEffect::Write])
                .generic(),
            ToolSpec::new("crm.log_activity", "Record an activity")
                .with_args(
                    ArgsSchema::new()
                        .required("kind", ArgKind::Str)
                        .optional("contact_id", ArgKind::Str)
                        .optional("deal_id", ArgKind::Str)
                        .optional("note", ArgKind::Str),
                )
                .with_side_effects(&[SideEffect::Write])
                .generic(),
        ]
    }

    fn call(&self, tool: &str, args: &Value, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        match tool {
            "crm.create_contact" => self.create_contact(args, ctx),
            "crm.get_contact" => Ok(json!(Self::contact(ctx, arg_str(args, "id")?)?)),
            "crm.list_contacts" => Ok(json!(ctx.list(CONTACTS).into_values().collect::<Vec<_>>())),
            "crm.create_company" => {
                let company = Company {
                    id: next_id(ctx, COMPANIES, "CO"),
                    name: arg_str(args, "name")?.to_string(),
                    domain: opt_str(args, "domain").unwrap_or_default().to_string(),
                    created_ms: ctx.now(),
                };
                ctx.put(COMPANIES, &company.id, &company)?;
                Ok(json!({ "id": company.id }))
            }
            "crm.get_company" => Ok(json!(Self::company(ctx, arg_str(args, "id")?)?)),
            "crm.list_companies" => Ok(json!(ctx.list(COMPANIES).into_values().collect::<Vec<_>>())),
            "crm.associate_contact_company" => {
                let contact_id = arg_str(args, "contact_id")?;
                let company_id = arg_str(args, "company_id")?;
                Self::contact(ctx, contact_id)?;
                Self::company(ctx, company_id)?;
                ctx.require(COMPANIES, company_id);
                ctx.merge(CONTACTS, contact_id, json!({ "company_id": company_id }))?;
                Ok(json!({ "ok": true }))
            }
            "crm.create_deal" => self.create_deal(args, ctx),
            "crm.get_deal" => Ok(json!(Self::deal(ctx, arg_str(args, "id")?)?)),
            "crm.list_deals" => Ok(json!(ctx.list(DEALS).into_values().collect::<Vec<_>>())),
            "crm.update_deal_stage" => {
                let id = arg_str(args, "id")?;
                let stage = arg_str(args, "stage")?;
                Self::deal(ctx, id)?;
                let now = ctx.now();
                ctx.merge(DEALS, id, json!({ "stage": stage, "updated_ms": now }))?;
                Ok(json!({ "ok": true, "stage": stage }))
            }
            "crm.log_activity" => self.log_activity(args, ctx),
            other => Err(ConnectorError::new("unknown_tool", other)),
        }
    }

    fn summary(&self, store: &StateStore) -> Option<String> {
        Some(format!(
            "CRM: {} contacts, {} companies, {} deals, {} activities",
            store.count(CONTACTS),
            store.count(COMPANIES),
            store.count(DEALS),
            store.count(ACTIVITIES)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_router;
    use super::*;
    use std::sync::Arc;
    use vei_core::{Router, RouterConfig};

    #[test]
    fn test_contact_company_deal_flow() {
        let mut router = test_router(CrmTwin);
        let contact = router
            .dispatch("crm.create_contact", &json!({ "email": "amy@acme.example", "first_name": "Amy" }))
            .unwrap();
        assert_eq!(contact, json!({ "id": "C-1" }));
        router
            .dispatch("crm.create_company", &json!({ "name": "Acme", "domain": "acme.example" }))
            .unwrap();
        router
            .dispatch("crm.associate_contact_company", &json!({ "contact_id": "C-1", "company_id": "CO-1" }))
            .unwrap();
        let deal = router
            .dispatch(
                "crm.create_deal",
                &json!({ "name": "Laptops", "amount": 6398, "contact_id": "C-1", "company_id": "CO-1" }),
            )
            .unwrap();
        assert_eq!(deal["id"], "D-1");

        let moved = router
            .dispatch("crm.update_deal_stage", &json!({ "id": "D-1", "stage": "Negotiation" }))
            .unwrap();
        assert_eq!(moved, json!({ "ok": true, "stage": "Negotiation" }));

        let fetched = router.dispatch("crm.get_deal", &json!({ "id": "D-1" })).unwrap();
        assert_eq!(fetched["amount_cents"], 639_800);
        assert_eq!(fetched["stage"], "Negotiation");
        let contact = router.dispatch("crm.get_contact", &json!({ "id": "C-1" })).unwrap();
        assert_eq!(contact["company_id"], "CO-1");
    }

    #[test]
    fn test_unknown_references() {
        let mut router = test_router(CrmTwin);
        let err = router
            .dispatch("crm.associate_contact_company", &json!({ "contact_id": "C-1", "company_id": "CO-1" }))
            .unwrap_err();
        assert_eq!(err.code(), "unknown_contact");
        let err = router
            .dispatch("crm.update_deal_stage", &json!({ "id": "D-4", "stage": "Won" }))
            .unwrap_err();
        assert_eq!(err.code(), "unknown_deal");
    }

    #[test]
    fn test_outreach_to_do_not_contact_is_seeded() {
        let providers: Vec<Arc<dyn ToolProvider>> = vec![Arc::new(CrmTwin)];
        let config = RouterConfig::new(3).with_error_rate("crm", 1.0);
        let mut router = Router::new(config, providers).unwrap();
        router
            .dispatch("crm.create_contact", &json!({ "email": "no@acme.example", "do_not_contact": true }))
            .unwrap();
        let err = router
            .dispatch("crm.log_activity", &json!({ "kind": "email_outreach", "contact_id": "C-1" }))
            .unwrap_err();
        assert_eq!(err.code(), "consent_violation");

        // Other kinds are always allowed
        let ok = router
            .dispatch("crm.log_activity", &json!({ "kind": "call", "contact_id": "C-1", "note": "left voicemail" }))
            .unwrap();
        assert_eq!(ok, json!({ "ok": true, "id": "A-1" }));
    }
}
