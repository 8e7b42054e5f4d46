use crate::types::{Rule, RuleConnection, RuleError, RuleNode};
use std::collections::{HashMap, HashSet};

/// 未匹配到路由时使用的端口
pub const DEFAULT_PORT: &str = "default";

/// 已校验的规则图
///
/// 构造时检查节点 id 唯一、连接端点存在、从入口可达部分无环。
#[derive(Debug, Clone)]
pub struct RuleGraph {
    rule: Rule,
    index: HashMap<String, usize>,
    outgoing: HashMap<String, Vec<usize>>,
    entries: Vec<String>,
}

impl RuleGraph {
    pub fn compile(rule: Rule) -> Result<Self, RuleError> {
        let mut index = HashMap::with_capacity(rule.nodes.len());
        for (i, node) in rule.nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(RuleError::DuplicateNode(node.id.clone()));
            }
        }

        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut has_incoming = HashSet::new();
        for (i, conn) in rule.connections.iter().enumerate() {
            for end in [&conn.from_node, &conn.to_node] {
                if !index.contains_key(end) {
                    return Err(RuleError::InvalidConnection(format!(
                        "连接 {} 引用了不存在的节点 {}",
                        conn.id, end
                    )));
                }
            }
            outgoing.entry(conn.from_node.clone()).or_default().push(i);
            has_incoming.insert(conn.to_node.clone());
        }

        let flagged: Vec<String> = rule
            .nodes
            .iter()
            .filter(|n| n.entry)
            .map(|n| n.id.clone())
            .collect();
        let entries = if flagged.is_empty() {
            rule.nodes
                .iter()
                .filter(|n| !has_incoming.contains(&n.id))
                .map(|n| n.id.clone())
                .collect()
        } else {
            flagged
        };

        if entries.is_empty() && !rule.nodes.is_empty() {
            return Err(RuleError::CyclicGraph(format!(
                "规则 {} 没有入口节点,所有节点都在环上",
                rule.name
            )));
        }

        let graph = Self {
            rule,
            index,
            outgoing,
            entries,
        };
        graph.check_cycles()?;
        Ok(graph)
    }

    /// 从每个入口做 DFS,栈中重复出现即为环
    fn check_cycles(&self) -> Result<(), RuleError> {
        let mut visited = HashSet::new();
        let mut stack = Vec::new();
        for entry in &self.entries {
            self.visit(entry, &mut visited, &mut stack)?;
        }
        Ok(())
    }

    fn visit<'g>(
        &'g self,
        node_id: &'g str,
        visited: &mut HashSet<&'g str>,
        stack: &mut Vec<&'g str>,
    ) -> Result<(), RuleError> {
        if stack.contains(&node_id) {
            let cycle_path: Vec<String> = stack
                .iter()
                .skip_while(|id| **id != node_id)
                .chain(std::iter::once(&node_id))
                .map(|id| match self.node(id) {
                    Some(node) => format!("{}[{}]", node.id, node.type_name),
                    None => format!("未知节点({})", id),
                })
                .collect();
            return Err(RuleError::CyclicGraph(cycle_path.join(" -> ")));
        }

        // 已检查过该节点
        if !visited.insert(node_id) {
            return Ok(());
        }

        stack.push(node_id);
        for conn in self.outgoing(node_id) {
            self.visit(&conn.to_node, visited, stack)?;
        }
        stack.pop();
        Ok(())
    }

    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    pub fn node(&self, node_id: &str) -> Option<&RuleNode> {
        self.index.get(node_id).map(|&i| &self.rule.nodes[i])
    }

    pub fn entry_nodes(&self) -> &[String] {
        &self.entries
    }

    pub fn outgoing<'g>(&'g self, node_id: &str) -> impl Iterator<Item = &'g RuleConnection> + 'g {
        self.outgoing
            .get(node_id)
            .into_iter()
            .flatten()
            .map(move |&i| &self.rule.connections[i])
    }

    pub fn is_terminal(&self, node_id: &str) -> bool {
        self.outgoing.get(node_id).map_or(true, Vec::is_empty)
    }

    /// 选择后续连接
    ///
    /// 无路由时走所有出边;有路由时走 `fromPort` 相同的出边,
    /// 否则走 `default` 端口,都没有则返回空(消息被丢弃)。
    pub fn next_connections(&self, node_id: &str, route: Option<&str>) -> Vec<&RuleConnection> {
        let connections: Vec<&RuleConnection> = self.outgoing(node_id).collect();
        let Some(route) = route else {
            return connections;
        };

        let matched: Vec<&RuleConnection> = connections
            .iter()
            .copied()
            .filter(|c| c.from_port == route)
            .collect();
        if !matched.is_empty() {
            return matched;
        }

        connections
            .into_iter()
            .filter(|c| c.from_port == DEFAULT_PORT)
            .collect()
    }
}
