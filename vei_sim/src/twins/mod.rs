//! Connector twins.
//!
//! Every twin is a stateless `ToolProvider`: configuration lives in the
//! struct, mutable state lives in the kernel's store under
//! `<connector>.<family>` names, so `reset` rebuilds a twin from scratch.

pub mod browser;
pub mod crm;
pub mod docs;
pub mod erp;
pub mod identity;
pub mod mail;
pub mod servicedesk;
pub mod slack;

pub use browser::BrowserTwin;
pub use crm::CrmTwin;
pub use docs::DocsTwin;
pub use erp::ErpTwin;
pub use identity::IdentityTwin;
pub use mail::MailTwin;
pub use servicedesk::ServiceDeskTwin;
pub use slack::SlackTwin;

use serde_json::Value;
use vei_core::{ConnectorError, ProviderContext};

/// Required string argument.
pub(crate) fn arg_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ConnectorError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ConnectorError::invalid_args(format!("missing string argument '{}'", key)))
}

/// Optional string argument (`null` counts as absent).
pub(crate) fn opt_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

pub(crate) fn opt_bool(args: &Value, key: &str) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Largest money amount a twin accepts, in cents ($10 trillion).
pub(crate) const MAX_CENTS: i64 = 1_000_000_000_000_000;

/// Converts a money value (`3199`, `3199.5`, `"3,199.00"`) to integer cents.
///
/// Non-finite amounts and amounts beyond [`MAX_CENTS`] are rejected.
pub(crate) fn to_cents(value: &Value) -> Result<i64, ConnectorError> {
    let amount = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.replace(',', "").trim().trim_start_matches('$').parse::<f64>().ok(),
        Value::Null => Some(0.0),
        _ => None,
    }
    .filter(|a| a.is_finite())
    .ok_or_else(|| ConnectorError::invalid_args(format!("not a money amount: {}", value)))?;
    let cents = (amount * 100.0).round();
    if cents.abs() > MAX_CENTS as f64 {
        return Err(ConnectorError::invalid_args(format!("money amount out of range: {}", value)));
    }
    Ok(cents as i64)
}

/// `a * b` for money arithmetic, failing instead of overflowing.
pub(crate) fn checked_amount(qty: i64, unit_cents: i64) -> Result<i64, ConnectorError> {
    qty.checked_mul(unit_cents)
        .ok_or_else(|| ConnectorError::invalid_args(format!("line amount overflows: {} x {} cents", qty, unit_cents)))
}

/// Sum of money amounts, failing instead of overflowing.
pub(crate) fn checked_total(amounts: impl IntoIterator<Item = i64>) -> Result<i64, ConnectorError> {
    amounts.into_iter().try_fold(0i64, |acc, cents| {
        acc.checked_add(cents)
            .ok_or_else(|| ConnectorError::invalid_args("total amount overflows"))
    })
}

/// Next sequential id in a family (`PO-1`, `PO-2`, ...).
pub(crate) fn next_id(ctx: &ProviderContext<'_>, family: &str, prefix: &str) -> String {
    format!("{}-{}", prefix, ctx.count(family) + 1)
}

/// Error for a missing entity, e.g. `unknown_po: Unknown PO: PO-9`.
pub(crate) fn not_found(code: &str, what: &str, id: &str) -> ConnectorError {
    ConnectorError::new(code, format!("Unknown {}: {}", what, id))
}

/// Router over a single twin with the default kernel config.
#[cfg(test)]
pub(crate) fn test_router(provider: impl vei_core::ToolProvider + 'static) -> vei_core::Router {
    let providers: Vec<std::sync::Arc<dyn vei_core::ToolProvider>> = vec![std::sync::Arc::new(provider)];
    vei_core::Router::new(vei_core::RouterConfig::new(vei_env::DEFAULT_SEED), providers).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_to_cents_accepts_numbers_and_strings() {
        assert_eq!(to_cents(&json!(3199)).unwrap(), 319_900);
        assert_eq!(to_cents(&json!(12.345)).unwrap(), 1_235);
        assert_eq!(to_cents(&json!("3,199.00")).unwrap(), 319_900);
        assert_eq!(to_cents(&json!("$25")).unwrap(), 2_500);
        assert!(to_cents(&json!("soon")).is_err());
        assert!(to_cents(&json!([1])).is_err());
    }

    #[test]
    fn test_money_out_of_range_is_rejected() {
        assert_eq!(to_cents(&json!(1e20)).unwrap_err().code, "invalid_args");
        assert_eq!(to_cents(&json!("inf")).unwrap_err().code, "invalid_args");
        assert_eq!(to_cents(&json!("NaN")).unwrap_err().code, "invalid_args");
        assert_eq!(to_cents(&json!(-1e14)).unwrap_err().code, "invalid_args");
        assert_eq!(to_cents(&json!(1e13)).unwrap(), MAX_CENTS);

        assert_eq!(checked_amount(3, 100).unwrap(), 300);
        assert!(checked_amount(i64::MAX, 2).is_err());
        assert_eq!(checked_total([1, 2, 3]).unwrap(), 6);
        assert!(checked_total([MAX_CENTS, i64::MAX]).is_err());
    }

    #[test]
    fn test_arg_helpers() {
        let args = json!({ "channel": "#procurement", "flag": true, "n": 3 });
        assert_eq!(arg_str(&args, "channel").unwrap(), "#procurement");
        assert_eq!(arg_str(&args, "n").unwrap_err().code, "invalid_args");
        assert_eq!(opt_str(&args, "missing"), None);
        assert!(opt_bool(&args, "flag"));
        assert!(!opt_bool(&args, "missing"));
    }
}
