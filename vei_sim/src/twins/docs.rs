//! Document store twin.

use super::{arg_str, next_id, opt_str};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use vei_core::{
    ArgKind, ArgsSchema, ConnectorError, ProviderContext, SideEffect, StateStore, ToolProvider, ToolSpec,
};

const DOCUMENTS: &str = "docs.documents";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// The docs twin, optionally seeded with documents.
#[derive(Debug, Clone, Default)]
pub struct DocsTwin {
    seed: Vec<Document>,
}

impl DocsTwin {
    pub fn new(seed: Vec<Document>) -> Self {
        Self { seed }
    }

    fn document(ctx: &ProviderContext<'_>, id: &str) -> Result<Document, ConnectorError> {
        ctx.read_as(DOCUMENTS, id)?
            .ok_or_else(|| ConnectorError::new("docs.not_found", format!("unknown document: {}", id)))
    }

    fn tags(args: &Value) -> Option<Vec<String>> {
        args.get("tags").and_then(Value::as_array).map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
    }

    fn all(ctx: &ProviderContext<'_>) -> Vec<Document> {
        ctx.list(DOCUMENTS)
            .into_values()
            .filter_map(|doc| serde_json::from_value(doc).ok())
            .collect()
    }
}

impl ToolProvider for DocsTwin {
    fn connector(&self) -> &str {
        "docs"
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec::new("docs.list", "List documents").generic(),
            ToolSpec::new("docs.read", "Read a document")
                .with_args(ArgsSchema::new().required("doc_id", ArgKind::Str))
                .generic(),
            ToolSpec::new("docs.search", "Search titles and bodies")
                .with_args(ArgsSchema::new().required("query", ArgKind::Str))
                .generic(),
            ToolSpec::new("docs.create", "Create a document")
                .with_args(
                    ArgsSchema::new()
                        .required("title", ArgKind::Str)
                        .required("body", ArgKind::Str)
                        .optional("tags", ArgKind::Array),
                )
                .with_side_effects(&[SideEffect::Write])
                .generic(),
            ToolSpec::new("docs.update", "Edit a document")
                .with_args(
                    ArgsSchema::new()
                        .required("doc_id", ArgKind::Str)
                        .optional("title", ArgKind::Str)
                        .optional("body", ArgKind::Str)
                        .optional("tags", ArgKind::Array),
                )
                .with_side_effects(&[SideEffect::Write])
                .generic(),
        ]
    }

    fn initialize(&self, ctx: &mut ProviderContext<'_>) -> Result<(), ConnectorError> {
        for doc in &self.seed {
            ctx.put(DOCUMENTS, &doc.doc_id, doc)?;
        }
        Ok(())
    }

    fn call(&self, tool: &str, args: &Value, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        match tool {
            "docs.list" => Ok(json!(Self::all(ctx)
                .into_iter()
                .map(|d| json!({ "doc_id": d.doc_id, "title": d.title, "tags": d.tags }))
                .collect::<Vec<_>>())),
            "docs.read" => Ok(json!(Self::document(ctx, arg_str(args, "doc_id")?)?)),
            "docs.search" => {
                let needle = arg_str(args, "query")?.trim().to_lowercase();
                if needle.is_empty() {
                    return Ok(json!([]));
                }
                Ok(json!(Self::all(ctx)
                    .into_iter()
                    .filter(|d| d.title.to_lowercase().contains(&needle) || d.body.to_lowercase().contains(&needle))
                    .map(|d| json!({ "doc_id": d.doc_id, "title": d.title }))
                    .collect::<Vec<_>>()))
            }
            "docs.create" => {
                let doc = Document {
                    doc_id: next_id(ctx, DOCUMENTS, "DOC"),
                    title: arg_str(args, "title")?.to_string(),
                    body: arg_str(args, "body")?.to_string(),
                    tags: Self::tags(args).unwrap_or_default(),
                };
                ctx.put(DOCUMENTS, &doc.doc_id, &doc)?;
                Ok(json!({ "doc_id": doc.doc_id, "title": doc.title }))
            }
            "docs.update" => {
                let mut doc = Self::document(ctx, arg_str(args, "doc_id")?)?;
                if let Some(title) = opt_str(args, "title") {
                    doc.title = title.to_string();
                }
                if let Some(body) = opt_str(args, "body") {
                    doc.body = body.to_string();
                }
                if let Some(tags) = Self::tags(args) {
                    doc.tags = tags;
                }
                ctx.put(DOCUMENTS, &doc.doc_id, &doc)?;
                Ok(json!({ "doc_id": doc.doc_id, "title": doc.title }))
            }
            other => Err(ConnectorError::new("unknown_tool", other)),
        }
    }

    fn summary(&self, store: &StateStore) -> Option<String> {
        Some(format!("Docs: {} documents", store.count(DOCUMENTS)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_router;
    use super::*;

    #[test]
    fn test_create_then_search() {
        let mut router = test_router(DocsTwin::default());
        let created = router
            .dispatch(
                "docs.create",
                &json!({ "title": "Laptop quote", "body": "MacroBook Pro 16 at $3199", "tags": ["procurement"] }),
            )
            .unwrap();
        assert_eq!(created, json!({ "doc_id": "DOC-1", "title": "Laptop quote" }));

        let hits = router.dispatch("docs.search", &json!({ "query": "macrobook" })).unwrap();
        assert_eq!(hits, json!([{ "doc_id": "DOC-1", "title": "Laptop quote" }]));
        assert_eq!(router.dispatch("docs.search", &json!({ "query": "  " })).unwrap(), json!([]));
    }

    #[test]
    fn test_update_and_read() {
        let seed = vec![Document {
            doc_id: "DOC-1".to_string(),
            title: "Policy".to_string(),
            body: "Quotes over $2k need citations.".to_string(),
            tags: Vec::new(),
        }];
        let mut router = test_router(DocsTwin::new(seed));
        router
            .dispatch("docs.update", &json!({ "doc_id": "DOC-1", "tags": ["policy"] }))
            .unwrap();
        let doc = router.dispatch("docs.read", &json!({ "doc_id": "DOC-1" })).unwrap();
        assert_eq!(doc["tags"], json!(["policy"]));
        assert_eq!(doc["title"], "Policy");

        let created = router
            .dispatch("docs.create", &json!({ "title": "Notes", "body": "" }))
            .unwrap();
        assert_eq!(created["doc_id"], "DOC-2");
    }

    #[test]
    fn test_read_unknown() {
        let mut router = test_router(DocsTwin::default());
        let err = router.dispatch("docs.read", &json!({ "doc_id": "DOC-9" })).unwrap_err();
        assert_eq!(err.code(), "docs.not_found");
    }
}
