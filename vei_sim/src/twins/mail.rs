//! Mail twin: compose, reply and the seeded vendor-reply workflow.

use super::{arg_str, opt_str};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use vei_core::{
    Affordance, ArgKind, ArgsSchema, ConnectorError, ProviderContext, SideEffect, StateStore, ToolProvider,
    ToolSpec,
};
use vei_env::LogicalTime;

const MESSAGES: &str = "mail.messages";

/// Delay of a vendor's reply to a composed message.
pub const VENDOR_REPLY_DELAY_MS: u64 = 15_000;

/// Mail world settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    /// The agent's own address
    pub address: String,

    /// Bodies a vendor may answer with; one is drawn per composed message
    pub vendor_reply_variants: Vec<String>,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            address: "me@example".to_string(),
            vendor_reply_variants: vec![
                "Thanks - Price: $3199, ETA: 5-7 business days.".to_string(),
                "> On Mon, we received your request\nPRICE: USD 3,199\nEta: within 5-7 business days\n--\nBest, MacroCompute"
                    .to_string(),
                "quote attached (inline): total: $3,199.00, ETA: 5 business days. Regards, Sales".to_string(),
                "PRICE - $3199; eta: approx. 1 week\n\n\nJohn Doe\nSales Representative\nMacroCompute".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Folder {
    Inbox,
    Sent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub subj: String,
    pub time: LogicalTime,
    pub unread: bool,
    pub folder: Folder,
    pub headers: Value,
    pub body_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
}

impl MailMessage {
    fn new(id: String, from: &str, to: &str, subj: &str, body_text: &str, time: LogicalTime) -> Self {
        Self {
            id,
            from: from.to_string(),
            to: to.to_string(),
            subj: subj.to_string(),
            time,
            unread: false,
            folder: Folder::Sent,
            headers: json!({ "From": from, "To": to, "Subject": subj }),
            body_text: body_text.to_string(),
            in_reply_to: None,
        }
    }

    /// Numeric part of `m<n>` ids, for stable ordering.
    fn seq(&self) -> u64 {
        self.id.trim_start_matches('m').parse().unwrap_or(0)
    }
}

fn next_mail_id(ctx: &ProviderContext<'_>) -> String {
    format!("m{}", ctx.count(MESSAGES) + 1)
}

/// The mail twin.
#[derive(Debug, Clone, Default)]
pub struct MailTwin {
    config: MailConfig,
}

impl MailTwin {
    pub fn new(config: MailConfig) -> Self {
        Self { config }
    }

    fn message(ctx: &ProviderContext<'_>, id: &str) -> Result<MailMessage, ConnectorError> {
        ctx.read_as::<MailMessage>(MESSAGES, id)?
            .ok_or_else(|| ConnectorError::new("unknown_message", format!("Unknown mail id: {}", id)))
    }

    /// Inbox, newest first.
    fn inbox(store: &StateStore) -> Vec<MailMessage> {
        let mut messages: Vec<MailMessage> = store
            .family(MESSAGES)
            .map(|family| {
                family
                    .values()
                    .filter_map(|doc| serde_json::from_value::<MailMessage>(doc.clone()).ok())
                    .filter(|m| m.folder == Folder::Inbox)
                    .collect()
            })
            .unwrap_or_default();
        messages.sort_by(|a, b| b.seq().cmp(&a.seq()));
        messages
    }

    fn compose(
        &self,
        to: &str,
        subj: &str,
        body_text: &str,
        ctx: &mut ProviderContext<'_>,
    ) -> Result<Value, ConnectorError> {
        let id = next_mail_id(ctx);
        let message = MailMessage::new(id.clone(), &self.config.address, to, subj, body_text, ctx.now());
        ctx.put(MESSAGES, &id, &message)?;

        let variants = &self.config.vendor_reply_variants;
        let body = if variants.is_empty() {
            String::new()
        } else {
            let idx = ctx.randint(0, variants.len() as i64 - 1) as usize;
            variants.get(idx).cloned().unwrap_or_default()
        };
        ctx.schedule(
            VENDOR_REPLY_DELAY_MS,
            "mail",
            json!({
                "in_reply_to": id,
                "from": to,
                "subj": format!("Re: {}", subj),
                "body_text": body,
            }),
        );
        Ok(json!({ "id": id }))
    }
}

impl ToolProvider for MailTwin {
    fn connector(&self) -> &str {
        "mail"
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec::new("mail.list", "List inbox messages, newest first")
                .with_args(ArgsSchema::new().optional("folder", ArgKind::Str))
                .generic(),
            ToolSpec::new("mail.open", "Open a message")
                .with_args(ArgsSchema::new().required("id", ArgKind::Str))
                .concrete(),
            ToolSpec::new("mail.compose", "Send a new message")
                .with_args(
                    ArgsSchema::new()
                        .required("to", ArgKind::Str)
                        .required("subj", ArgKind::Str)
                        .required("body_text", ArgKind::Str)
                        .optional("attachments", ArgKind::Array),
                )
                .with_side_effects(&[SideEffect::Write, SideEffect::Schedule])
                .generic(),
            ToolSpec::new("mail.reply", "Reply to a message")
                .with_args(
                    ArgsSchema::new()
                        .required("id", ArgKind::Str)
                        .required("body_text", ArgKind::Str),
                )
                .with_side_effects(&[SideEffect::Write, SideEffect::Schedule])
                .generic(),
        ]
    }

    fn call(&self, tool: &str, args: &Value, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        match tool {
            "mail.list" => match opt_str(args, "folder").map(str::to_ascii_lowercase).as_deref() {
                None | Some("inbox") => Ok(json!(Self::inbox(ctx.store()))),
                Some(other) => Err(ConnectorError::new("unknown_folder", format!("Unknown folder: {}", other))),
            },
            "mail.open" => {
                let message = Self::message(ctx, arg_str(args, "id")?)?;
                Ok(json!({ "headers": message.headers, "body_text": message.body_text, "parts": [] }))
            }
            "mail.compose" => self.compose(
                arg_str(args, "to")?,
                arg_str(args, "subj")?,
                arg_str(args, "body_text")?,
                ctx,
            ),
            "mail.reply" => {
                let original = Self::message(ctx, arg_str(args, "id")?)?;
                self.compose(
                    &original.from,
                    &format!("Re: {}", original.subj),
                    arg_str(args, "body_text")?,
                    ctx,
                )
            }
            other => Err(ConnectorError::new("unknown_tool", other)),
        }
    }

    fn check_event(&self, payload: &Value, store: &StateStore) -> Result<(), ConnectorError> {
        arg_str(payload, "from")?;
        arg_str(payload, "subj")?;
        arg_str(payload, "body_text")?;
        if let Some(parent) = opt_str(payload, "in_reply_to") {
            if store.read(MESSAGES, parent).is_none() {
                return Err(ConnectorError::new("unknown_message", format!("Unknown mail id: {}", parent)));
            }
        }
        Ok(())
    }

    fn deliver(&self, payload: &Value, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        let in_reply_to = opt_str(payload, "in_reply_to").map(str::to_string);
        if let Some(parent) = &in_reply_to {
            // A reply to a message that never existed is a kernel bug
            Self::message(ctx, parent)?;
        }
        let id = next_mail_id(ctx);
        let mut message = MailMessage::new(
            id.clone(),
            arg_str(payload, "from")?,
            &self.config.address,
            arg_str(payload, "subj")?,
            arg_str(payload, "body_text")?,
            ctx.now(),
        );
        message.unread = true;
        message.folder = Folder::Inbox;
        message.in_reply_to = in_reply_to;
        ctx.put(MESSAGES, &id, &message)?;
        Ok(json!({ "id": id }))
    }

    fn accepts_events(&self) -> bool {
        true
    }

    fn summary(&self, store: &StateStore) -> Option<String> {
        let inbox = Self::inbox(store);
        let unread = inbox.iter().filter(|m| m.unread).count();
        let latest = inbox
            .first()
            .map(|m| format!("; latest from {}: {}", m.from, m.subj))
            .unwrap_or_default();
        Some(format!("Mail: {} in inbox, {} unread{}", inbox.len(), unread, latest))
    }

    fn affordances(&self, store: &StateStore) -> Vec<Affordance> {
        Self::inbox(store)
            .into_iter()
            .map(|m| Affordance {
                tool: "mail.open".to_string(),
                args: json!({ "id": m.id }),
                label: format!("Open \"{}\" from {}", m.subj, m.from),
                id: format!("open:{}", m.id),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_router;
    use super::*;

    fn compose_quote(router: &mut vei_core::Router) -> Value {
        router
            .dispatch(
                "mail.compose",
                &json!({ "to": "sales@vendor.example", "subj": "Quote request", "body_text": "Price and ETA?" }),
            )
            .unwrap()
    }

    #[test]
    fn test_compose_schedules_vendor_reply() {
        let mut router = test_router(MailTwin::default());
        assert_eq!(compose_quote(&mut router), json!({ "id": "m1" }));
        assert_eq!(router.pending().total, 1);
        assert_eq!(router.dispatch("mail.list", &json!({})).unwrap(), json!([]));

        router.tick(VENDOR_REPLY_DELAY_MS as i64).unwrap();
        let inbox = router.dispatch("mail.list", &json!({})).unwrap();
        let reply = &inbox[0];
        assert_eq!(reply["id"], "m2");
        assert_eq!(reply["from"], "sales@vendor.example");
        assert_eq!(reply["subj"], "Re: Quote request");
        assert_eq!(reply["unread"], true);
        assert_eq!(reply["in_reply_to"], "m1");
        let body = reply["body_text"].as_str().unwrap();
        assert!(MailConfig::default().vendor_reply_variants.iter().any(|v| v == body));
    }

    #[test]
    fn test_vendor_reply_is_seeded() {
        let body = || {
            let mut router = test_router(MailTwin::default());
            compose_quote(&mut router);
            router.tick(VENDOR_REPLY_DELAY_MS as i64).unwrap();
            router.dispatch("mail.list", &json!({})).unwrap()[0]["body_text"].clone()
        };
        assert_eq!(body(), body());
    }

    #[test]
    fn test_reply_goes_to_sender() {
        let mut router = test_router(MailTwin::default());
        compose_quote(&mut router);
        router.tick(VENDOR_REPLY_DELAY_MS as i64).unwrap();
        router
            .dispatch("mail.reply", &json!({ "id": "m2", "body_text": "Thanks" }))
            .unwrap();
        let sent: MailMessage =
            serde_json::from_value(router.store().read(MESSAGES, "m3").unwrap().clone()).unwrap();
        assert_eq!(sent.to, "sales@vendor.example");
        assert_eq!(sent.subj, "Re: Re: Quote request");
        assert_eq!(sent.folder, Folder::Sent);
    }

    #[test]
    fn test_open_unknown_message() {
        let mut router = test_router(MailTwin::default());
        let err = router.dispatch("mail.open", &json!({ "id": "m9" })).unwrap_err();
        assert_eq!(err.code(), "unknown_message");
    }

    #[test]
    fn test_orphan_reply_is_rejected_on_inject() {
        let mut router = test_router(MailTwin::default());
        let err = router
            .inject(
                "mail",
                json!({ "in_reply_to": "m7", "from": "x@y", "subj": "Re: ?", "body_text": "" }),
                0,
            )
            .unwrap_err();
        assert_eq!(err.code(), "invalid_action");
    }
}
