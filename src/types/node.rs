use crate::types::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 规则中的节点定义
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleNode {
    /// 规则内唯一
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    /// 编辑器布局数据,引擎忽略
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub declared_inputs: Vec<String>,
    #[serde(default)]
    pub declared_outputs: Vec<String>,
    /// 显式标记的入口节点
    #[serde(default)]
    pub entry: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// 节点之间的连接
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConnection {
    #[serde(default)]
    pub id: String,
    pub from_node: String,
    #[serde(default = "default_port")]
    pub from_port: String,
    pub to_node: String,
    #[serde(default = "default_port")]
    pub to_port: String,
}

fn default_port() -> String {
    "output".to_string()
}

/// 节点执行结果
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    /// 单条替换消息
    Single(Message),
    /// 扇出,每条消息独立继续遍历
    Many(Vec<Message>),
    /// 丢弃 / 过滤
    None,
}

impl NodeOutcome {
    pub fn into_messages(self) -> Vec<Message> {
        match self {
            NodeOutcome::Single(msg) => vec![msg],
            NodeOutcome::Many(msgs) => msgs,
            NodeOutcome::None => Vec::new(),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, NodeOutcome::None)
    }
}

impl From<Option<Message>> for NodeOutcome {
    fn from(msg: Option<Message>) -> Self {
        msg.map_or(NodeOutcome::None, NodeOutcome::Single)
    }
}

/// 空列表视为丢弃
impl From<Vec<Message>> for NodeOutcome {
    fn from(msgs: Vec<Message>) -> Self {
        if msgs.is_empty() {
            NodeOutcome::None
        } else {
            NodeOutcome::Many(msgs)
        }
    }
}
