use super::graph::RuleGraph;
use crate::collaborators::RuleRepository;
use crate::types::{RuleError, RuleStatus, TriggerType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// 已编译的活动规则缓存
///
/// 规则变更(激活/停用/更新)后调用 [`RuleCatalog::reload`],
/// 编译失败的规则在仓库中标记为 ERROR。
pub struct RuleCatalog {
    repository: Arc<dyn RuleRepository>,
    rules: RwLock<Vec<Arc<RuleGraph>>>,
    generation: AtomicU64,
}

impl RuleCatalog {
    pub fn new(repository: Arc<dyn RuleRepository>) -> Self {
        Self {
            repository,
            rules: RwLock::new(Vec::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// 重新加载所有 ACTIVE 规则,返回成功编译的数量
    pub async fn reload(&self) -> Result<usize, RuleError> {
        let active = self
            .repository
            .find_active()
            .await
            .map_err(RuleError::Repository)?;

        let mut compiled = Vec::with_capacity(active.len());
        for rule in active {
            let (tenant_id, rule_id, name) = (rule.tenant_id.clone(), rule.id, rule.name.clone());
            match RuleGraph::compile(rule) {
                Ok(graph) => compiled.push(Arc::new(graph)),
                Err(e) => {
                    warn!(%rule_id, "Rule {} failed to compile, marking ERROR: {}", name, e);
                    if let Err(e) = self
                        .repository
                        .set_status(&tenant_id, rule_id, RuleStatus::Error)
                        .await
                    {
                        warn!(%rule_id, "Failed to mark rule as ERROR: {:#}", e);
                    }
                }
            }
        }

        // 高优先级在前,同优先级保持仓库顺序
        compiled.sort_by(|a, b| b.rule().priority.cmp(&a.rule().priority));

        let count = compiled.len();
        *self.rules.write().await = compiled;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(generation, "Loaded {} active rules", count);
        Ok(count)
    }

    /// 匹配资产与触发类型的规则,按优先级排序
    pub async fn candidates(
        &self,
        asset_type: Option<&str>,
        asset_id: Option<&str>,
        trigger: &TriggerType,
    ) -> Vec<Arc<RuleGraph>> {
        self.rules
            .read()
            .await
            .iter()
            .filter(|graph| graph.rule().applies_to(asset_type, asset_id, trigger))
            .cloned()
            .collect()
    }

    /// 全部活动规则,按优先级排序
    pub async fn all(&self) -> Vec<Arc<RuleGraph>> {
        self.rules.read().await.clone()
    }

    /// 按 (租户, 规则) 查找,其他租户的同 id 规则不可见
    pub async fn get(&self, tenant_id: &str, rule_id: Uuid) -> Option<Arc<RuleGraph>> {
        self.rules
            .read()
            .await
            .iter()
            .find(|graph| graph.rule().id == rule_id && graph.rule().tenant_id == tenant_id)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.rules.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rules.read().await.is_empty()
    }

    /// 每次 reload 加一
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for RuleCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleCatalog")
            .field("generation", &self.generation())
            .finish()
    }
}
