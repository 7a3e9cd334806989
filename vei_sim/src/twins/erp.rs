//! ERP twin: purchase orders, goods receipts, invoices, three-way match
//! and payments. All money is integer cents.

use super::{arg_str, checked_amount, checked_total, next_id, not_found, opt_str, to_cents};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use vei_core::{
    ArgKind, ArgsSchema, ConnectorError, ProviderContext, SideEffect, StateStore, ToolProvider, ToolSpec,
};
use vei_env::LogicalTime;

const POS: &str = "erp.pos";
const RECEIPTS: &str = "erp.receipts";
const INVOICES: &str = "erp.invoices";
const PAYMENTS: &str = "erp.payments";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    pub line_no: usize,
    pub item_id: String,
    #[serde(default)]
    pub desc: String,
    pub qty: i64,
    pub unit_price_cents: i64,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrder {
    pub id: String,
    pub vendor: String,
    pub currency: String,
    pub status: String,
    pub lines: Vec<Line>,
    pub total_cents: i64,
    pub created_ms: LogicalTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedLine {
    pub item_id: String,
    pub qty: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoodsReceipt {
    pub id: String,
    pub po_id: String,
    pub lines: Vec<ReceivedLine>,
    pub time_ms: LogicalTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub po_id: String,
    pub vendor: String,
    pub status: String,
    pub lines: Vec<Line>,
    pub amount_cents: i64,
    pub paid_cents: i64,
    pub match_status: Option<String>,
    pub time_ms: LogicalTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub invoice_id: String,
    pub amount_cents: i64,
    pub time_ms: LogicalTime,
}

/// Parses priced lines, numbering them from 1.
fn parse_lines(args: &Value) -> Result<Vec<Line>, ConnectorError> {
    let raw = args
        .get("lines")
        .and_then(Value::as_array)
        .ok_or_else(|| ConnectorError::invalid_args("missing array argument 'lines'"))?;
    raw.iter()
        .enumerate()
        .map(|(i, line)| {
            let line_no = i + 1;
            let qty = line.get("qty").and_then(Value::as_i64).unwrap_or(0);
            let unit_price_cents = to_cents(line.get("unit_price").unwrap_or(&Value::Null))?;
            let amount_cents = checked_amount(qty, unit_price_cents)?;
            let item_id = match line.get("item_id") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => line_no.to_string(),
            };
            Ok(Line {
                line_no,
                item_id,
                desc: opt_str(line, "desc").unwrap_or_default().to_string(),
                qty,
                unit_price_cents,
                amount_cents,
            })
        })
        .collect()
}

fn quantities<'a>(items: impl Iterator<Item = (&'a String, i64)>) -> BTreeMap<&'a str, i64> {
    let mut map = BTreeMap::new();
    for (item, qty) in items {
        let total = map.entry(item.as_str()).or_insert(0i64);
        *total = total.saturating_add(qty);
    }
    map
}

/// Compares PO, invoice and (optionally) receipt.
///
/// Amounts must agree within one cent; every item's invoiced quantity
/// must equal the ordered one and must not exceed what was received.
pub fn three_way_match(po: &PurchaseOrder, invoice: &Invoice, receipt: Option<&GoodsReceipt>) -> Value {
    let amount_ok = po.total_cents.abs_diff(invoice.amount_cents) <= 1;
    let po_qty = quantities(po.lines.iter().map(|l| (&l.item_id, l.qty)));
    let inv_qty = quantities(invoice.lines.iter().map(|l| (&l.item_id, l.qty)));
    let rcpt_qty = receipt
        .map(|r| quantities(r.lines.iter().map(|l| (&l.item_id, l.qty))))
        .unwrap_or_default();

    let items: BTreeSet<&str> = po_qty.keys().chain(inv_qty.keys()).copied().collect();
    let mismatches: Vec<Value> = items
        .into_iter()
        .filter_map(|item| {
            let ordered = po_qty.get(item).copied().unwrap_or(0);
            let invoiced = inv_qty.get(item).copied().unwrap_or(0);
            let received = rcpt_qty.get(item).copied().unwrap_or(0);
            let bad = ordered != invoiced || (receipt.is_some() && invoiced > received);
            bad.then(|| json!({ "item_id": item, "po": ordered, "invoice": invoiced, "received": received }))
        })
        .collect();

    let status = if amount_ok && mismatches.is_empty() { "MATCH" } else { "MISMATCH" };
    json!({
        "status": status,
        "amount_ok": amount_ok,
        "qty_mismatches": mismatches,
        "po_id": po.id,
        "invoice_id": invoice.id,
        "receipt_id": receipt.map(|r| r.id.clone()),
    })
}

/// The ERP twin.
#[derive(Debug, Clone, Default)]
pub struct ErpTwin;

impl ErpTwin {
    fn po(ctx: &ProviderContext<'_>, id: &str) -> Result<PurchaseOrder, ConnectorError> {
        ctx.read_as(POS, id)?.ok_or_else(|| not_found("unknown_po", "PO", id))
    }

    fn invoice(ctx: &ProviderContext<'_>, id: &str) -> Result<Invoice, ConnectorError> {
        ctx.read_as(INVOICES, id)?
            .ok_or_else(|| not_found("unknown_invoice", "invoice", id))
    }

    fn create_po(&self, args: &Value, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        let lines = parse_lines(args)?;
        let total_cents = checked_total(lines.iter().map(|l| l.amount_cents))?;
        let po = PurchaseOrder {
            id: next_id(ctx, POS, "PO"),
            vendor: arg_str(args, "vendor")?.to_string(),
            currency: opt_str(args, "currency").unwrap_or("USD").to_string(),
            status: "OPEN".to_string(),
            total_cents,
            lines,
            created_ms: ctx.now(),
        };
        ctx.put(POS, &po.id, &po)?;
        Ok(json!({ "id": po.id, "total_cents": po.total_cents, "currency": po.currency }))
    }

    fn receive_goods(&self, args: &Value, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        let po_id = arg_str(args, "po_id")?;
        Self::po(ctx, po_id)?;
        let lines = args
            .get("lines")
            .and_then(Value::as_array)
            .ok_or_else(|| ConnectorError::invalid_args("missing array argument 'lines'"))?
            .iter()
            .map(|l| ReceivedLine {
                item_id: match l.get("item_id") {
                    Some(Value::Number(n)) => n.to_string(),
                    other => other.and_then(Value::as_str).unwrap_or_default().to_string(),
                },
                qty: l.get("qty").and_then(Value::as_i64).unwrap_or(0),
            })
            .collect();
        let receipt = GoodsReceipt {
            id: next_id(ctx, RECEIPTS, "RCPT"),
            po_id: po_id.to_string(),
            lines,
            time_ms: ctx.now(),
        };
        ctx.require(POS, po_id);
        ctx.put(RECEIPTS, &receipt.id, &receipt)?;
        Ok(json!({ "id": receipt.id }))
    }

    fn submit_invoice(&self, args: &Value, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        let po_id = arg_str(args, "po_id")?;
        Self::po(ctx, po_id)?;
        if ctx.seeded_error() {
            return Err(ConnectorError::new(
                "validation_error",
                "Duplicate invoice number or invalid tax.",
            ));
        }
        let lines = parse_lines(args)?;
        let amount_cents = checked_total(lines.iter().map(|l| l.amount_cents))?;
        let invoice = Invoice {
            id: next_id(ctx, INVOICES, "INV"),
            po_id: po_id.to_string(),
            vendor: arg_str(args, "vendor")?.to_string(),
            status: "OPEN".to_string(),
            amount_cents,
            lines,
            paid_cents: 0,
            match_status: None,
            time_ms: ctx.now(),
        };
        ctx.require(POS, po_id);
        ctx.put(INVOICES, &invoice.id, &invoice)?;
        Ok(json!({ "id": invoice.id, "amount_cents": invoice.amount_cents }))
    }

    fn match_three_way(&self, args: &Value, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        let po_id = arg_str(args, "po_id")?;
        let invoice_id = arg_str(args, "invoice_id")?;
        let unknown = || ConnectorError::new("unknown_ref", "PO or invoice not found");
        let po: PurchaseOrder = ctx.read_as(POS, po_id)?.ok_or_else(unknown)?;
        let invoice: Invoice = ctx.read_as(INVOICES, invoice_id)?.ok_or_else(unknown)?;
        let receipt: Option<GoodsReceipt> = match opt_str(args, "receipt_id") {
            Some(id) => Some(
                ctx.read_as(RECEIPTS, id)?
                    .ok_or_else(|| not_found("unknown_ref", "receipt", id))?,
            ),
            None => None,
        };

        let result = three_way_match(&po, &invoice, receipt.as_ref());
        ctx.merge(INVOICES, invoice_id, json!({ "match_status": result["status"] }))?;
        Ok(result)
    }

    fn post_payment(&self, args: &Value, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        let invoice_id = arg_str(args, "invoice_id")?;
        let invoice = Self::invoice(ctx, invoice_id)?;
        if ctx.fault_triggered(ctx.error_rate() / 2.0) {
            return Err(ConnectorError::new("payment_rejected", "Bank rejected payment."));
        }
        let amount_cents = to_cents(args.get("amount").unwrap_or(&Value::Null))?;
        if amount_cents <= 0 {
            return Err(ConnectorError::invalid_args("payment amount must be positive"));
        }
        let paid = invoice.paid_cents.saturating_add(amount_cents);
        let status = if paid >= invoice.amount_cents { "PAID" } else { invoice.status.as_str() };
        let paid_cents = paid.min(invoice.amount_cents);

        let payment = Payment {
            id: next_id(ctx, PAYMENTS, "PAY"),
            invoice_id: invoice_id.to_string(),
            amount_cents,
            time_ms: ctx.now(),
        };
        ctx.put(PAYMENTS, &payment.id, &payment)?;
        ctx.merge(INVOICES, invoice_id, json!({ "paid_cents": paid_cents, "status": status }))?;
        Ok(json!({ "id": payment.id, "status": status, "paid_cents": paid_cents }))
    }
}

impl ToolProvider for ErpTwin {
    fn connector(&self) -> &str {
        "erp"
    }

    fn tools(&self) -> Vec<ToolSpec> {
        let priced_lines = || {
            ArgsSchema::new()
                .required("vendor", ArgKind::Str)
                .required("lines", ArgKind::Array)
        };
        vec![
            ToolSpec::new("erp.create_po", "Create a purchase order")
                .with_args(priced_lines().optional("currency", ArgKind::Str))
                .with_side_effects(&[SideEffect::Write])
                .generic(),
            ToolSpec::new("erp.get_po", "Fetch a purchase order")
                .with_args(ArgsSchema::new().required("id", ArgKind::Str))
                .generic(),
            ToolSpec::new("erp.list_pos", "List purchase orders").generic(),
            ToolSpec::new("erp.receive_goods", "Record a goods receipt against a PO")
                .with_args(
                    ArgsSchema::new()
                        .required("po_id", ArgKind::Str)
                        .required("lines", ArgKind::Array),
                )
                .with_side_effects(&[SideEffect::Write])
                .generic(),
            ToolSpec::new("erp.submit_invoice", "Submit a vendor invoice against a PO")
                .with_args(priced_lines().required("po_id", ArgKind::Str))
                .with_side_effects(&[SideEffect::Write])
                .generic(),
            ToolSpec::new("erp.get_invoice", "Fetch an invoice")
                .with_args(ArgsSchema::new().required("id", ArgKind::Str))
                .generic(),
            ToolSpec::new("erp.list_invoices", "List invoices").generic(),
            ToolSpec::new("erp.match_three_way", "Match PO, invoice and receipt")
                .with_args(
                    ArgsSchema::new()
                        .required("po_id", ArgKind::Str)
                        .required("invoice_id", ArgKind::Str)
                        .optional("receipt_id", ArgKind::Str),
                )
                .with_side_effects(&[SideEffect::Write])
                .generic(),
            ToolSpec::new("erp.post_payment", "Pay an invoice")
                .with_args(
                    ArgsSchema::new()
                        .required("invoice_id", ArgKind::Str)
                        .required("amount", ArgKind::Amount),
                )
                .with_side_effects(&[SideEffect::Write])
                .generic(),
        ]
    }

    fn call(&self, tool: &str, args: &Value, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        match tool {
            "erp.create_po" => self.create_po(args, ctx),
            "erp.get_po" => Ok(json!(Self::po(ctx, arg_str(args, "id")?)?)),
            "erp.list_pos" => Ok(json!(ctx.list(POS).into_values().collect::<Vec<_>>())),
            "erp.receive_goods" => self.receive_goods(args, ctx),
            "erp.submit_invoice" => self.submit_invoice(args, ctx),
            "erp.get_invoice" => Ok(json!(Self::invoice(ctx, arg_str(args, "id")?)?)),
            "erp.list_invoices" => Ok(json!(ctx.list(INVOICES).into_values().collect::<Vec<_>>())),
            "erp.match_three_way" => self.match_three_way(args, ctx),
            "erp.post_payment" => self.post_payment(args, ctx),
            other => Err(ConnectorError::new("unknown_tool", other)),
        }
    }

    fn summary(&self, store: &StateStore) -> Option<String> {
        let open = store
            .family(INVOICES)
            .map(|f| f.values().filter(|inv| inv["status"] != "PAID").count())
            .unwrap_or(0);
        Some(format!(
            "ERP: {} POs, {} receipts, {} invoices ({} unpaid)",
            store.count(POS),
            store.count(RECEIPTS),
            store.count(INVOICES),
            open
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_router;
    use super::*;
    use std::sync::Arc;
    use vei_core::{Router, RouterConfig};

    fn laptops(unit_price: Value) -> Value {
        json!([{ "item_id": "MBP16", "desc": "MacroBook Pro 16", "qty": 2, "unit_price": unit_price }])
    }

    fn with_po(router: &mut Router) {
        let po = router
            .dispatch(
                "erp.create_po",
                &json!({ "vendor": "MacroCompute", "currency": "USD", "lines": laptops(json!(3199)) }),
            )
            .unwrap();
        assert_eq!(po, json!({ "id": "PO-1", "total_cents": 639_800, "currency": "USD" }));
    }

    #[test]
    fn test_procure_to_pay() {
        let mut router = test_router(ErpTwin);
        with_po(&mut router);
        let rcpt = router
            .dispatch("erp.receive_goods", &json!({ "po_id": "PO-1", "lines": [{ "item_id": "MBP16", "qty": 2 }] }))
            .unwrap();
        assert_eq!(rcpt["id"], "RCPT-1");
        let inv = router
            .dispatch(
                "erp.submit_invoice",
                &json!({ "vendor": "MacroCompute", "po_id": "PO-1", "lines": laptops(json!("3,199.00")) }),
            )
            .unwrap();
        assert_eq!(inv, json!({ "id": "INV-1", "amount_cents": 639_800 }));

        let matched = router
            .dispatch(
                "erp.match_three_way",
                &json!({ "po_id": "PO-1", "invoice_id": "INV-1", "receipt_id": "RCPT-1" }),
            )
            .unwrap();
        assert_eq!(matched["status"], "MATCH");

        let paid = router
            .dispatch("erp.post_payment", &json!({ "invoice_id": "INV-1", "amount": 6398 }))
            .unwrap();
        assert_eq!(paid["status"], "PAID");
        assert!(router.findings().is_empty());
    }

    #[test]
    fn test_short_receipt_is_mismatch() {
        let mut router = test_router(ErpTwin);
        with_po(&mut router);
        router
            .dispatch("erp.receive_goods", &json!({ "po_id": "PO-1", "lines": [{ "item_id": "MBP16", "qty": 1 }] }))
            .unwrap();
        router
            .dispatch(
                "erp.submit_invoice",
                &json!({ "vendor": "MacroCompute", "po_id": "PO-1", "lines": laptops(json!(3199)) }),
            )
            .unwrap();
        let matched = router
            .dispatch(
                "erp.match_three_way",
                &json!({ "po_id": "PO-1", "invoice_id": "INV-1", "receipt_id": "RCPT-1" }),
            )
            .unwrap();
        assert_eq!(matched["status"], "MISMATCH");
        assert_eq!(matched["qty_mismatches"][0]["received"], 1);

        router
            .dispatch("erp.post_payment", &json!({ "invoice_id": "INV-1", "amount": 100 }))
            .unwrap();
        assert!(router.findings().iter().any(|f| f.code == "erp.payment_without_match"));
    }

    #[test]
    fn test_oversized_amounts_rejected_without_panicking() {
        let mut router = test_router(ErpTwin);
        let err = router
            .dispatch("erp.create_po", &json!({ "vendor": "MacroCompute", "lines": laptops(json!(1e20)) }))
            .unwrap_err();
        assert_eq!(err.code(), "invalid_args");

        let huge_qty = json!([{ "item_id": "MBP16", "qty": i64::MAX, "unit_price": 3199 }]);
        let err = router
            .dispatch("erp.create_po", &json!({ "vendor": "MacroCompute", "lines": huge_qty }))
            .unwrap_err();
        assert_eq!(err.code(), "invalid_args");

        let lines = json!([
            { "item_id": "A", "qty": 1_000, "unit_price": 9e12 },
            { "item_id": "B", "qty": 1_000, "unit_price": 9e12 },
        ]);
        let err = router
            .dispatch("erp.create_po", &json!({ "vendor": "MacroCompute", "lines": lines }))
            .unwrap_err();
        assert_eq!(err.code(), "invalid_args");

        assert_eq!(router.store().revision(), 0);
        assert!(!router.is_halted());
        with_po(&mut router);
    }

    #[test]
    fn test_unknown_references() {
        let mut router = test_router(ErpTwin);
        let err = router.dispatch("erp.get_po", &json!({ "id": "PO-9" })).unwrap_err();
        assert_eq!(err.code(), "unknown_po");
        let err = router
            .dispatch("erp.match_three_way", &json!({ "po_id": "PO-9", "invoice_id": "INV-9" }))
            .unwrap_err();
        assert_eq!(err.code(), "unknown_ref");
        let err = router
            .dispatch("erp.post_payment", &json!({ "invoice_id": "INV-9", "amount": 1 }))
            .unwrap_err();
        assert_eq!(err.code(), "unknown_invoice");
    }

    #[test]
    fn test_seeded_validation_error() {
        let config = RouterConfig::new(7).with_error_rate("erp", 1.0);
        let providers: Vec<Arc<dyn ToolProvider>> = vec![Arc::new(ErpTwin)];
        let mut router = Router::new(config, providers).unwrap();
        with_po(&mut router);
        let revision = router.store().revision();
        let err = router
            .dispatch(
                "erp.submit_invoice",
                &json!({ "vendor": "MacroCompute", "po_id": "PO-1", "lines": laptops(json!(3199)) }),
            )
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");
        assert_eq!(router.store().revision(), revision);
    }

    #[test]
    fn test_amount_tolerance_is_one_cent() {
        let line = |cents: i64| Line {
            line_no: 1,
            item_id: "A".into(),
            desc: String::new(),
            qty: 1,
            unit_price_cents: cents,
            amount_cents: cents,
        };
        let po = PurchaseOrder {
            id: "PO-1".into(),
            vendor: "v".into(),
            currency: "USD".into(),
            status: "OPEN".into(),
            lines: vec![line(1000)],
            total_cents: 1000,
            created_ms: 0,
        };
        let mut invoice = Invoice {
            id: "INV-1".into(),
            po_id: "PO-1".into(),
            vendor: "v".into(),
            status: "OPEN".into(),
            lines: vec![line(1001)],
            amount_cents: 1001,
            paid_cents: 0,
            match_status: None,
            time_ms: 0,
        };
        assert_eq!(three_way_match(&po, &invoice, None)["status"], "MATCH");
        invoice.amount_cents = 1002;
        assert_eq!(three_way_match(&po, &invoice, None)["status"], "MISMATCH");
    }
}
