//! Argument schemas for registered tools.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Accepted JSON shape of one argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    Str,
    Int,
    Number,
    Bool,
    Object,
    Array,
    /// Money: a JSON number or a numeric string such as `"3,199.00"`
    Amount,
    Any,
}

impl ArgKind {
    fn label(self) -> &'static str {
        match self {
            ArgKind::Str => "str",
            ArgKind::Int => "int",
            ArgKind::Number => "number",
            ArgKind::Bool => "bool",
            ArgKind::Object => "object",
            ArgKind::Array => "array",
            ArgKind::Amount => "amount",
            ArgKind::Any => "any",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            ArgKind::Str => value.is_string(),
            ArgKind::Int => value.is_i64() || value.is_u64(),
            ArgKind::Number => value.is_number(),
            ArgKind::Bool => value.is_boolean(),
            ArgKind::Object => value.is_object(),
            ArgKind::Array => value.is_array(),
            ArgKind::Amount => value.is_number() || value.is_string(),
            ArgKind::Any => true,
        }
    }
}

/// One named argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgField {
    pub name: String,
    pub kind: ArgKind,
    pub required: bool,
}

/// Ordered argument list of a tool. Unknown arguments are rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgsSchema {
    pub fields: Vec<ArgField>,
}

impl ArgsSchema {
    /// A schema with no arguments.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &str, kind: ArgKind) -> Self {
        self.fields.push(ArgField {
            name: name.to_string(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: &str, kind: ArgKind) -> Self {
        self.fields.push(ArgField {
            name: name.to_string(),
            kind,
            required: false,
        });
        self
    }

    /// Validates call arguments. `null` is treated as `{}`.
    ///
    /// Checks run in a fixed order (shape, unknown keys in sorted order,
    /// declared fields in declaration order) so the same bad call always
    /// yields the same message.
    pub fn validate(&self, args: &Value) -> Result<(), String> {
        let empty = Map::new();
        let obj = match args {
            Value::Null => &empty,
            Value::Object(map) => map,
            other => return Err(format!("args must be an object, got {}", other)),
        };

        for key in obj.keys() {
            if !self.fields.iter().any(|f| &f.name == key) {
                return Err(format!("unexpected argument '{}'", key));
            }
        }

        for field in &self.fields {
            match obj.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(format!("missing required argument '{}'", field.name));
                }
                None | Some(Value::Null) => {}
                Some(value) if !field.kind.accepts(value) => {
                    return Err(format!(
                        "argument '{}' must be {}",
                        field.name,
                        field.kind.label()
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Compact rendering for action menus: `{"query": "str", "top_k": "int?"}`.
    pub fn to_menu_value(&self) -> Value {
        let mut map = Map::new();
        for field in &self.fields {
            let label = if field.required {
                field.kind.label().to_string()
            } else {
                format!("{}?", field.kind.label())
            };
            map.insert(field.name.clone(), Value::String(label));
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn send_message() -> ArgsSchema {
        ArgsSchema::new()
            .required("channel", ArgKind::Str)
            .required("text", ArgKind::Str)
            .optional("thread_ts", ArgKind::Str)
    }

    #[test]
    fn test_valid_args() {
        let schema = send_message();
        assert!(schema
            .validate(&json!({"channel": "#procurement", "text": "hi"}))
            .is_ok());
        assert!(schema
            .validate(&json!({"channel": "#procurement", "text": "hi", "thread_ts": null}))
            .is_ok());
    }

    #[test]
    fn test_missing_and_unknown_args() {
        let schema = send_message();
        assert_eq!(
            schema.validate(&json!({"channel": "#procurement"})),
            Err("missing required argument 'text'".to_string())
        );
        assert_eq!(
            schema.validate(&json!({"channel": "#p", "text": "x", "urgent": true})),
            Err("unexpected argument 'urgent'".to_string())
        );
        assert!(schema.validate(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_kind_mismatch() {
        let schema = ArgsSchema::new()
            .required("qty", ArgKind::Int)
            .required("unit_price", ArgKind::Amount);
        assert!(schema.validate(&json!({"qty": 2, "unit_price": "3,199.00"})).is_ok());
        assert!(schema.validate(&json!({"qty": 2, "unit_price": 3199.5})).is_ok());
        assert_eq!(
            schema.validate(&json!({"qty": 1.5, "unit_price": 1})),
            Err("argument 'qty' must be int".to_string())
        );
    }

    #[test]
    fn test_null_is_empty_object() {
        assert!(ArgsSchema::new().validate(&Value::Null).is_ok());
    }

    #[test]
    fn test_menu_rendering() {
        let menu = send_message().to_menu_value();
        assert_eq!(menu, json!({"channel": "str", "text": "str", "thread_ts": "str?"}));
    }

    proptest! {
        #[test]
        fn prop_validation_is_deterministic(keys in proptest::collection::vec("[a-z]{1,6}", 0..6)) {
            let schema = send_message();
            let mut map = Map::new();
            for k in &keys {
                map.insert(k.clone(), json!(1));
            }
            let args = Value::Object(map);
            prop_assert_eq!(schema.validate(&args), schema.validate(&args));
        }
    }
}
