use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::future::Cache;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::graph::{BotConfig, CommandNode, Edge, Product, VariableDef};

/// Nodes named this are the flow's designated entry point.
pub const ENTRY_NODE_NAME: &str = "start";

/// Per-(bot, end-user) pointer into the flow graph. Overwritten on every
/// node visit, never deleted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub current_node: String,
    pub awaiting_input: bool,
    pub updated_at: DateTime<Utc>,
}

impl SessionState {
    pub fn at(node: &str, awaiting_input: bool) -> Self {
        Self {
            current_node: node.to_string(),
            awaiting_input,
            updated_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait BotStore: Send + Sync {
    async fn bot(&self, bot_id: &str) -> Option<BotConfig>;
}

/// Read side of the flow graph. Every traversal step is a fresh lookup; the
/// graph is owned by the editor, not the engine.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn node(&self, bot_id: &str, node_id: &str) -> Option<CommandNode>;
    /// The node flagged as the flow entry (by name).
    async fn entry_node(&self, bot_id: &str) -> Option<CommandNode>;
    /// Outgoing edge by `(source, handle)`. `None` is the default/auto
    /// handle. When the data holds duplicates, the first in stored order
    /// wins — lookup must stay deterministic.
    async fn edge(&self, bot_id: &str, source: &str, handle: Option<&str>) -> Option<Edge>;
}

#[async_trait]
pub trait VariableStore: Send + Sync {
    async fn declared(&self, bot_id: &str) -> Vec<VariableDef>;
    /// All stored `(name → raw text)` pairs for one end-user.
    async fn values(&self, bot_id: &str, user_id: &str) -> HashMap<String, String>;
    /// Replace-or-insert one value, keyed by `(bot, user, name)`.
    async fn upsert(&self, bot_id: &str, user_id: &str, name: &str, value: &str);
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, bot_id: &str, user_id: &str) -> Option<SessionState>;
    /// Atomic replace-or-insert keyed by `(bot, user)`; first-contact races
    /// must resolve to a single surviving row.
    async fn upsert(&self, bot_id: &str, user_id: &str, state: SessionState);
}

#[async_trait]
pub trait ProductStore: Send + Sync {
    async fn product(&self, bot_id: &str, product_id: &str) -> Option<Product>;
}

#[derive(Debug)]
struct BotEntry {
    config: BotConfig,
    nodes: HashMap<String, CommandNode>,
    entry: Option<String>,
    edges: Vec<Edge>,
    variables: Vec<VariableDef>,
    products: HashMap<String, Product>,
}

/// Process-local implementation of every collaborator contract, fed by the
/// bot-definition registry. Sessions sit in a TTL cache so idle
/// conversations age out on their own.
#[derive(Debug)]
pub struct MemoryStore {
    bots: DashMap<String, Arc<BotEntry>>,
    values: DashMap<String, HashMap<String, String>>,
    sessions: Cache<String, SessionState>,
}

fn pair_key(bot_id: &str, user_id: &str) -> String {
    format!("{bot_id}|{user_id}")
}

impl MemoryStore {
    pub fn new(session_ttl_secs: u64) -> Arc<Self> {
        let sessions = Cache::builder()
            .time_to_idle(Duration::from_secs(session_ttl_secs))
            .build();
        Arc::new(Self {
            bots: DashMap::new(),
            values: DashMap::new(),
            sessions,
        })
    }

    /// Install or replace one bot's graph wholesale. The entry pointer is
    /// resolved here, first match in definition order.
    pub fn install(
        &self,
        config: BotConfig,
        nodes: Vec<CommandNode>,
        edges: Vec<Edge>,
        variables: Vec<VariableDef>,
        products: Vec<Product>,
    ) {
        let entry = nodes
            .iter()
            .find(|n| n.name.as_deref() == Some(ENTRY_NODE_NAME))
            .map(|n| n.id.clone());
        let entry_count = nodes.len();
        let bot_id = config.id.clone();
        let entry_map = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        let products = products.into_iter().map(|p| (p.id.clone(), p)).collect();
        self.bots.insert(
            bot_id.clone(),
            Arc::new(BotEntry {
                config,
                nodes: entry_map,
                entry,
                edges,
                variables,
                products,
            }),
        );
        info!(bot = %bot_id, nodes = entry_count, "installed bot graph");
    }

    pub fn remove_bot(&self, bot_id: &str) {
        self.bots.remove(bot_id);
        info!(bot = %bot_id, "removed bot graph");
    }

    pub fn bot_ids(&self) -> Vec<String> {
        self.bots.iter().map(|e| e.key().clone()).collect()
    }

    fn entry_for(&self, bot_id: &str) -> Option<Arc<BotEntry>> {
        self.bots.get(bot_id).map(|e| e.value().clone())
    }
}

#[async_trait]
impl BotStore for MemoryStore {
    async fn bot(&self, bot_id: &str) -> Option<BotConfig> {
        self.entry_for(bot_id).map(|e| e.config.clone())
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    async fn node(&self, bot_id: &str, node_id: &str) -> Option<CommandNode> {
        self.entry_for(bot_id)?.nodes.get(node_id).cloned()
    }

    async fn entry_node(&self, bot_id: &str) -> Option<CommandNode> {
        let entry = self.entry_for(bot_id)?;
        entry.nodes.get(entry.entry.as_deref()?).cloned()
    }

    async fn edge(&self, bot_id: &str, source: &str, handle: Option<&str>) -> Option<Edge> {
        self.entry_for(bot_id)?
            .edges
            .iter()
            .find(|e| e.source == source && e.source_handle.as_deref() == handle)
            .cloned()
    }
}

#[async_trait]
impl VariableStore for MemoryStore {
    async fn declared(&self, bot_id: &str) -> Vec<VariableDef> {
        self.entry_for(bot_id)
            .map(|e| e.variables.clone())
            .unwrap_or_default()
    }

    async fn values(&self, bot_id: &str, user_id: &str) -> HashMap<String, String> {
        self.values
            .get(&pair_key(bot_id, user_id))
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    async fn upsert(&self, bot_id: &str, user_id: &str, name: &str, value: &str) {
        self.values
            .entry(pair_key(bot_id, user_id))
            .or_default()
            .insert(name.to_string(), value.to_string());
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, bot_id: &str, user_id: &str) -> Option<SessionState> {
        self.sessions.get(&pair_key(bot_id, user_id)).await
    }

    async fn upsert(&self, bot_id: &str, user_id: &str, state: SessionState) {
        self.sessions.insert(pair_key(bot_id, user_id), state).await;
    }
}

#[async_trait]
impl ProductStore for MemoryStore {
    async fn product(&self, bot_id: &str, product_id: &str) -> Option<Product> {
        self.entry_for(bot_id)?.products.get(product_id).cloned()
    }
}
