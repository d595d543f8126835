use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// One bot as the editor publishes it: identity plus the Bot API token the
/// dispatcher needs. Everything else hangs off the bot id.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BotConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub token: String,
}

/// Node type tag as stored by the editor. `regular` is the legacy spelling
/// of `message` and maps onto it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum NodeTypeTag {
    #[serde(alias = "regular")]
    Message,
    Input,
    Choice,
    Condition,
}

/// Per-node settings payload. The editor writes one loose object; which
/// fields apply depends on the node type and is resolved in [`RawCommandNode::build`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct NodeSettings {
    /// Variable captured by `input` nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    /// Branch rule for `condition` nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionRule>,
}

/// A node exactly as it appears in a published bot definition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RawCommandNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub node_type: NodeTypeTag,
    #[serde(default, alias = "content_blocks")]
    pub blocks: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keyboard: Vec<Button>,
    #[serde(default)]
    pub settings: NodeSettings,
}

impl RawCommandNode {
    /// Normalize the loose wire shape into the closed [`NodeKind`] variant.
    /// Anomalies (condition without a rule, input without a variable) are
    /// tolerated and logged; the engine fails open on them.
    pub fn build(self) -> CommandNode {
        let kind = match self.node_type {
            NodeTypeTag::Message => NodeKind::Message,
            NodeTypeTag::Choice => NodeKind::Choice,
            NodeTypeTag::Input => {
                let variable = self
                    .settings
                    .variable
                    .as_deref()
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string);
                if variable.is_none() {
                    warn!(node = %self.id, "input node has no capture variable");
                }
                NodeKind::Input { variable }
            }
            NodeTypeTag::Condition => {
                if self.settings.condition.is_none() {
                    warn!(node = %self.id, "condition node has no rule, branch will default to true");
                }
                NodeKind::Condition {
                    rule: self.settings.condition,
                }
            }
        };
        CommandNode {
            id: self.id,
            name: self.name,
            kind,
            blocks: self.blocks,
            keyboard: self.keyboard,
        }
    }
}

/// Node kinds are a closed set; adding one is a compile-time-checked
/// extension point for every `match` in the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Message,
    Choice,
    Input { variable: Option<String> },
    Condition { rule: Option<ConditionRule> },
}

impl NodeKind {
    pub fn awaits_input(&self) -> bool {
        matches!(self, NodeKind::Input { .. })
    }
}

/// A node after normalization, as the engine sees it.
#[derive(Debug, Clone)]
pub struct CommandNode {
    pub id: String,
    pub name: Option<String>,
    pub kind: NodeKind,
    pub blocks: Vec<ContentBlock>,
    pub keyboard: Vec<Button>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    Text,
    Image,
    Video,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BlockSettings {
    /// Suppress the link preview on text blocks.
    #[serde(default, alias = "disablePreview")]
    pub disable_preview: bool,
    /// Deliver image/video blocks behind a spoiler cover.
    #[serde(default, alias = "hasSpoiler")]
    pub spoiler: bool,
}

/// One unit of outbound content inside a node; text carries `content`,
/// image/video carry `url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ContentBlock {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BlockKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub settings: BlockSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ButtonKind {
    Url,
    #[serde(alias = "node-link")]
    Node,
    Pay,
}

/// An inline-keyboard button. `value` is a URL, a target node id or a
/// product id depending on `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Button {
    #[serde(default)]
    pub id: String,
    pub text: String,
    #[serde(rename = "type")]
    pub kind: ButtonKind,
    pub value: String,
}

/// Directed transition between two nodes. `source_handle` is `None` for the
/// default/auto edge, `"true"`/`"false"` on condition branches; anything else
/// (button-encoded handles drawn by the editor) is kept but never consulted.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Edge {
    pub source: String,
    #[serde(default, alias = "sourceHandle", skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    pub target: String,
}

/// Condition operators are a closed set; anything the editor emits outside
/// it lands on `Unknown`, which evaluates fail-open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    #[default]
    Equals,
    NotEquals,
    Greater,
    Less,
    Contains,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConditionRule {
    #[serde(default)]
    pub variable: String,
    #[serde(default)]
    pub operator: ConditionOp,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    #[default]
    String,
    Number,
    Boolean,
}

/// A variable declared in the editor: referenced as `{name}` in text blocks
/// and by name in condition rules.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VariableDef {
    pub name: String,
    #[serde(default, rename = "type")]
    pub var_type: VarType,
    #[serde(default, rename = "default")]
    pub default_value: Option<Value>,
}

/// Shop product, read-only to the engine; only used to build invoices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Product {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_editor_node_parses_and_builds() {
        let node: RawCommandNode = serde_json::from_value(json!({
            "id": "n1",
            "name": "start",
            "type": "message",
            "content_blocks": [
                {"id": "b1", "type": "text", "content": "Hello {name}"},
                {"id": "b2", "type": "image", "url": "https://x/y.png", "settings": {"spoiler": true}}
            ],
            "keyboard": [
                {"id": "k1", "text": "Docs", "type": "url", "value": "https://docs"}
            ]
        }))
        .unwrap();

        let node = node.build();
        assert_eq!(node.kind, NodeKind::Message);
        assert_eq!(node.blocks.len(), 2);
        assert!(node.blocks[1].settings.spoiler);
        assert_eq!(node.keyboard[0].kind, ButtonKind::Url);
    }

    #[test]
    fn test_regular_aliases_message() {
        let node: RawCommandNode =
            serde_json::from_value(json!({"id": "n", "type": "regular"})).unwrap();
        assert_eq!(node.build().kind, NodeKind::Message);
    }

    #[test]
    fn test_input_node_settings_normalization() {
        let node: RawCommandNode = serde_json::from_value(json!({
            "id": "n",
            "type": "input",
            "settings": {"variable": "  age  "}
        }))
        .unwrap();
        assert_eq!(
            node.build().kind,
            NodeKind::Input { variable: Some("age".into()) }
        );

        let blank: RawCommandNode = serde_json::from_value(json!({
            "id": "n",
            "type": "input",
            "settings": {"variable": "   "}
        }))
        .unwrap();
        assert_eq!(blank.build().kind, NodeKind::Input { variable: None });
    }

    #[test]
    fn test_unknown_operator_normalizes() {
        let rule: ConditionRule = serde_json::from_value(json!({
            "variable": "x",
            "operator": "matches_regex",
            "value": "y"
        }))
        .unwrap();
        assert_eq!(rule.operator, ConditionOp::Unknown);

        let defaulted: ConditionRule =
            serde_json::from_value(json!({"variable": "x", "value": 1})).unwrap();
        assert_eq!(defaulted.operator, ConditionOp::Equals);
    }

    #[test]
    fn test_edge_accepts_react_flow_naming() {
        let edge: Edge = serde_json::from_value(json!({
            "source": "a",
            "sourceHandle": "true",
            "target": "b"
        }))
        .unwrap();
        assert_eq!(edge.source_handle.as_deref(), Some("true"));
    }
}
