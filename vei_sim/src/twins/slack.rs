//! Slack twin: channels, messages and the CFO approval workflow.

use super::{arg_str, opt_str};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::OnceLock;
use vei_core::{
    Affordance, ArgKind, ArgsSchema, ConnectorError, ProviderContext, SideEffect, StateStore, ToolProvider,
    ToolSpec,
};

const CHANNELS: &str = "slack.channels";

/// Delay of the CFO's approval reply.
pub const APPROVED_DELAY_MS: u64 = 12_000;
/// Delay of the over-cap pushback.
pub const OVER_CAP_DELAY_MS: u64 = 10_000;
/// Delay of the "what amount?" question.
pub const MISSING_AMOUNT_DELAY_MS: u64 = 9_000;
/// Delay of an off-topic derail message.
pub const DERAIL_DELAY_MS: u64 = 7_000;

/// Slack world settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    pub channels: Vec<String>,

    /// Largest amount the CFO approves without pushback
    pub budget_cap_usd: i64,

    /// Probability that a sent message triggers an off-topic reply
    pub derail_prob: f64,

    /// First message of the first channel
    pub initial_message: String,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            channels: vec!["#procurement".to_string()],
            budget_cap_usd: 3500,
            derail_prob: 0.1,
            initial_message: "Reminder: citations required for any request over $2k.".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub ts: String,
    pub user: String,
    pub text: String,
    pub thread_ts: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    pub messages: Vec<Message>,
    pub unread: u64,
}

static AMOUNT_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// First 3-6 digit number in `text` (commas ignored), the way the CFO
/// reads a request.
fn requested_amount(text: &str) -> Result<Option<i64>, ConnectorError> {
    let re = AMOUNT_RE
        .get_or_init(|| Regex::new(r"\$?([0-9]{3,6})").ok())
        .as_ref()
        .ok_or_else(|| ConnectorError::new("slack.internal", "amount pattern failed to compile"))?;
    let cleaned = text.replace(',', "");
    Ok(re
        .captures(&cleaned)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok()))
}

/// The Slack twin.
#[derive(Debug, Clone, Default)]
pub struct SlackTwin {
    config: SlackConfig,
}

impl SlackTwin {
    pub fn new(config: SlackConfig) -> Self {
        Self { config }
    }

    fn channel(ctx: &ProviderContext<'_>, name: &str) -> Result<Channel, ConnectorError> {
        ctx.read_as::<Channel>(CHANNELS, name)?
            .ok_or_else(|| ConnectorError::new("unknown_channel", format!("Unknown Slack channel: {}", name)))
    }

    fn send_message(&self, args: &Value, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        let name = arg_str(args, "channel")?;
        let text = arg_str(args, "text")?;
        let channel = Self::channel(ctx, name)?;

        let ts = (channel.messages.len() + 1).to_string();
        let message = Message {
            ts: ts.clone(),
            user: "agent".to_string(),
            text: text.to_string(),
            thread_ts: opt_str(args, "thread_ts").map(str::to_string),
        };
        ctx.require(CHANNELS, name);
        ctx.push(CHANNELS, name, "messages", json!(message));

        // One draw per message, taken before the workflow check
        if ctx.next_random() < self.config.derail_prob {
            ctx.schedule(
                DERAIL_DELAY_MS,
                "slack",
                json!({ "channel": name, "text": "Could someone update the Q3 KPI sheet?", "thread_ts": ts }),
            );
        }

        let lower = text.to_lowercase();
        if lower.contains("approve") || lower.contains("summary") || lower.contains("budget") {
            let (delay, reply) = match requested_amount(text)? {
                Some(amount) if amount <= self.config.budget_cap_usd => {
                    (APPROVED_DELAY_MS, ":white_check_mark: Approved")
                }
                Some(_) => (OVER_CAP_DELAY_MS, "Need clearer budget justification (over cap)."),
                None => (MISSING_AMOUNT_DELAY_MS, "What is the budget amount?"),
            };
            ctx.schedule(delay, "slack", json!({ "channel": name, "text": reply, "thread_ts": ts }));
        }
        Ok(json!({ "ts": ts }))
    }
}

impl ToolProvider for SlackTwin {
    fn connector(&self) -> &str {
        "slack"
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec::new("slack.list_channels", "List Slack channels").generic(),
            ToolSpec::new("slack.open_channel", "Open a channel and read its messages")
                .with_args(ArgsSchema::new().required("channel", ArgKind::Str))
                .concrete(),
            ToolSpec::new("slack.send_message", "Post a message to a channel")
                .with_args(
                    ArgsSchema::new()
                        .required("channel", ArgKind::Str)
                        .required("text", ArgKind::Str)
                        .optional("thread_ts", ArgKind::Str),
                )
                .with_side_effects(&[SideEffect::Write, SideEffect::Schedule])
                .generic(),
            ToolSpec::new("slack.react", "Add an emoji reaction to a message")
                .with_args(
                    ArgsSchema::new()
                        .required("channel", ArgKind::Str)
                        .required("ts", ArgKind::Str)
                        .required("emoji", ArgKind::Str),
                )
                .generic(),
            ToolSpec::new("slack.fetch_thread", "Read a thread")
                .with_args(
                    ArgsSchema::new()
                        .required("channel", ArgKind::Str)
                        .required("thread_ts", ArgKind::Str),
                )
                .generic(),
        ]
    }

    fn initialize(&self, ctx: &mut ProviderContext<'_>) -> Result<(), ConnectorError> {
        for (i, name) in self.config.channels.iter().enumerate() {
            let messages = if i == 0 {
                vec![Message {
                    ts: "1".to_string(),
                    user: "itops".to_string(),
                    text: self.config.initial_message.clone(),
                    thread_ts: None,
                }]
            } else {
                Vec::new()
            };
            ctx.put(
                CHANNELS,
                name,
                &Channel {
                    name: name.clone(),
                    messages,
                    unread: 0,
                },
            )?;
        }
        Ok(())
    }

    fn call(&self, tool: &str, args: &Value, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        match tool {
            "slack.list_channels" => Ok(json!(ctx.list(CHANNELS).keys().collect::<Vec<_>>())),
            "slack.open_channel" => {
                let channel = Self::channel(ctx, arg_str(args, "channel")?)?;
                Ok(json!({ "messages": channel.messages, "unread_count": channel.unread }))
            }
            "slack.send_message" => self.send_message(args, ctx),
            "slack.react" => {
                let channel = Self::channel(ctx, arg_str(args, "channel")?)?;
                let ts = arg_str(args, "ts")?;
                if !channel.messages.iter().any(|m| m.ts == ts) {
                    return Err(ConnectorError::new("unknown_message", format!("No message {} in {}", ts, channel.name)));
                }
                Ok(json!({ "ok": true }))
            }
            "slack.fetch_thread" => {
                let channel = Self::channel(ctx, arg_str(args, "channel")?)?;
                let thread_ts = arg_str(args, "thread_ts")?;
                let base: u64 = thread_ts.parse().unwrap_or(0);
                let messages: Vec<&Message> = channel
                    .messages
                    .iter()
                    .filter(|m| m.thread_ts.as_deref().map_or(true, |t| t == thread_ts))
                    .filter(|m| m.ts.parse::<u64>().unwrap_or(0) >= base)
                    .collect();
                Ok(json!({ "messages": messages }))
            }
            other => Err(ConnectorError::new("unknown_tool", other)),
        }
    }

    fn check_event(&self, payload: &Value, store: &StateStore) -> Result<(), ConnectorError> {
        let channel = arg_str(payload, "channel")?;
        arg_str(payload, "text")?;
        if store.read(CHANNELS, channel).is_none() {
            return Err(ConnectorError::new("unknown_channel", format!("Unknown Slack channel: {}", channel)));
        }
        Ok(())
    }

    fn deliver(&self, payload: &Value, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        let name = arg_str(payload, "channel")?;
        let channel = Self::channel(ctx, name)?;
        let ts = (channel.messages.len() + 1).to_string();
        let message = Message {
            ts: ts.clone(),
            user: opt_str(payload, "user").unwrap_or("cfo").to_string(),
            text: arg_str(payload, "text")?.to_string(),
            thread_ts: opt_str(payload, "thread_ts").map(str::to_string),
        };
        ctx.push(CHANNELS, name, "messages", json!(message));
        ctx.merge(CHANNELS, name, json!({ "unread": channel.unread + 1 }))?;
        Ok(json!({ "ok": true, "ts": ts }))
    }

    fn accepts_events(&self) -> bool {
        true
    }

    fn summary(&self, store: &StateStore) -> Option<String> {
        let channels = store.family(CHANNELS)?;
        let mut parts = Vec::new();
        for (name, doc) in channels.iter() {
            let channel: Channel = serde_json::from_value(doc.clone()).ok()?;
            let latest = channel
                .messages
                .last()
                .map(|m| format!("{}: {}", m.user, m.text))
                .unwrap_or_default();
            parts.push(format!("{} ({} unread) latest {}", name, channel.unread, latest));
        }
        Some(format!("Slack: {}", parts.join("; ")))
    }

    fn affordances(&self, store: &StateStore) -> Vec<Affordance> {
        store
            .family(CHANNELS)
            .map(|channels| {
                channels
                    .keys()
                    .map(|name| Affordance {
                        tool: "slack.open_channel".to_string(),
                        args: json!({ "channel": name }),
                        label: format!("Open {}", name),
                        id: format!("open:{}", name),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
