use dashmap::DashMap;
use moka::future::Cache;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::eval::{self, VarSnapshot};
use crate::graph::{BotConfig, NodeKind};
use crate::store::{BotStore, GraphStore, ProductStore, SessionState, SessionStore, VariableStore};
use crate::telegram::{CallbackAction, Outbound, SendError, Update, decode_callback};

/// Free-text command that (re)starts the flow from its entry node.
pub const START_COMMAND: &str = "/start";

#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration error: nothing was done for this update.
    #[error("bot {0} is not registered")]
    UnknownBot(String),
    /// Transport failure; traversal stopped, state written so far stays.
    #[error(transparent)]
    Send(#[from] SendError),
    /// An auto-advance chain revisited a node within one update.
    #[error("auto-advance loop at node {node}")]
    CyclicFlow { node: String },
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::UnknownBot(_))
    }
}

/// What an inbound envelope means for the engine.
#[derive(Debug, Clone)]
enum Intent {
    Text { user: String, text: String },
    Callback { user: String, data: String },
    Ignored,
}

impl Intent {
    fn user(&self) -> Option<&str> {
        match self {
            Intent::Text { user, .. } | Intent::Callback { user, .. } => Some(user),
            Intent::Ignored => None,
        }
    }
}

fn classify(update: &Update) -> Intent {
    if let Some(message) = &update.message {
        if let Some(from) = &message.from {
            return Intent::Text {
                user: from.id.to_string(),
                text: message.text.clone().unwrap_or_default(),
            };
        }
    }
    if let Some(callback) = &update.callback_query {
        if let Some(from) = &callback.from {
            return Intent::Callback {
                user: from.id.to_string(),
                data: callback.data.clone().unwrap_or_default(),
            };
        }
    }
    Intent::Ignored
}

/// Replays the flow graph against one conversation per inbound update:
/// resolves the entry point, captures input, walks auto-advance chains and
/// dispatches content. Updates for the same (bot, user) pair are serialized
/// behind a per-pair mutex; duplicate deliveries are absorbed by a TTL
/// cache keyed on the platform's update id.
pub struct FlowEngine {
    bots: Arc<dyn BotStore>,
    graph: Arc<dyn GraphStore>,
    variables: Arc<dyn VariableStore>,
    sessions: Arc<dyn SessionStore>,
    products: Arc<dyn ProductStore>,
    outbound: Arc<dyn Outbound>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    seen: Cache<String, ()>,
}

impl FlowEngine {
    pub fn new(
        bots: Arc<dyn BotStore>,
        graph: Arc<dyn GraphStore>,
        variables: Arc<dyn VariableStore>,
        sessions: Arc<dyn SessionStore>,
        products: Arc<dyn ProductStore>,
        outbound: Arc<dyn Outbound>,
        dedup_ttl_secs: u64,
    ) -> Self {
        let seen = Cache::builder()
            .max_capacity(100_000)
            .time_to_live(Duration::from_secs(dedup_ttl_secs))
            .build();
        Self {
            bots,
            graph,
            variables,
            sessions,
            products,
            outbound,
            locks: DashMap::new(),
            seen,
        }
    }

    /// Entry point per inbound update. Returns `Ok` whenever the update was
    /// handled to a defined stopping point, including "nothing to do".
    #[tracing::instrument(name = "handle_update", skip(self, update), fields(bot = %bot_id))]
    pub async fn handle_update(&self, bot_id: &str, update: &Update) -> Result<(), EngineError> {
        let bot = self
            .bots
            .bot(bot_id)
            .await
            .ok_or_else(|| EngineError::UnknownBot(bot_id.to_string()))?;

        let intent = classify(update);
        let Some(user) = intent.user().map(str::to_string) else {
            debug!("unrecognized envelope, acknowledged and dropped");
            return Ok(());
        };

        // Marked seen only after success so the platform may retry failures.
        let dedup_key = update.update_id.map(|id| format!("{bot_id}|{id}"));
        if let Some(key) = &dedup_key {
            if self.seen.get(key).await.is_some() {
                debug!(update = %key, "duplicate delivery, skipped");
                return Ok(());
            }
        }

        let lock = self.user_lock(bot_id, &user);
        let _guard = lock.lock().await;

        self.process(&bot, &user, &intent).await?;

        if let Some(key) = dedup_key {
            self.seen.insert(key, ()).await;
        }
        Ok(())
    }

    fn user_lock(&self, bot_id: &str, user: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(format!("{bot_id}|{user}"))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn snapshot(&self, bot_id: &str, user: &str) -> VarSnapshot {
        let declared = self.variables.declared(bot_id).await;
        let stored = self.variables.values(bot_id, user).await;
        eval::snapshot(&declared, &stored)
    }

    async fn process(&self, bot: &BotConfig, user: &str, intent: &Intent) -> Result<(), EngineError> {
        let mut vars = self.snapshot(&bot.id, user).await;

        // Entry resolution, in fixed priority order: start command,
        // navigation callback, payment short-circuit, input capture.
        let target = match intent {
            Intent::Text { text, .. } if text == START_COMMAND => {
                self.graph.entry_node(&bot.id).await.map(|n| n.id)
            }
            Intent::Callback { data, .. } => match decode_callback(data) {
                Some(CallbackAction::Navigate(node_id)) => Some(node_id),
                Some(CallbackAction::Pay(product_id)) => {
                    return self.issue_invoice(bot, user, &product_id).await;
                }
                None => None,
            },
            Intent::Text { text, .. } if !text.is_empty() => {
                self.capture_input(bot, user, text, &mut vars).await
            }
            _ => None,
        };

        let Some(target) = target else {
            debug!("no target node resolved, nothing to do");
            return Ok(());
        };
        self.traverse(bot, user, target, &vars).await
    }

    /// Step 3d: free text while the session waits on an `input` node stores
    /// the text into the node's variable and advances via the default edge.
    async fn capture_input(
        &self,
        bot: &BotConfig,
        user: &str,
        text: &str,
        vars: &mut VarSnapshot,
    ) -> Option<String> {
        let session = self.sessions.get(&bot.id, user).await?;
        if !session.awaiting_input {
            return None;
        }
        let node = self.graph.node(&bot.id, &session.current_node).await?;
        let NodeKind::Input { variable } = &node.kind else {
            return None;
        };
        if let Some(name) = variable {
            self.variables.upsert(&bot.id, user, name, text).await;
            *vars = self.snapshot(&bot.id, user).await;
            debug!(variable = %name, node = %node.id, "captured input");
        }
        self.graph
            .edge(&bot.id, &node.id, None)
            .await
            .map(|e| e.target)
    }

    /// Payment callbacks never traverse: fetch the product, send the
    /// invoice, done. An unknown product id is a broken graph and stops
    /// silently.
    async fn issue_invoice(
        &self,
        bot: &BotConfig,
        user: &str,
        product_id: &str,
    ) -> Result<(), EngineError> {
        match self.products.product(&bot.id, product_id).await {
            Some(product) => {
                self.outbound
                    .send_invoice(&bot.token, user, &product, user)
                    .await?;
                info!(product = %product.id, "invoice sent");
                Ok(())
            }
            None => {
                debug!(product = %product_id, "payment callback for unknown product");
                Ok(())
            }
        }
    }

    /// Iterative walk over the graph. Session state is written for every
    /// visited node before its content goes out; a missing node or edge
    /// stops the walk silently; a revisit within this update aborts with
    /// [`EngineError::CyclicFlow`].
    async fn traverse(
        &self,
        bot: &BotConfig,
        user: &str,
        start: String,
        vars: &VarSnapshot,
    ) -> Result<(), EngineError> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut next = Some(start);

        while let Some(node_id) = next.take() {
            if !visited.insert(node_id.clone()) {
                warn!(node = %node_id, "auto-advance chain loops, aborting");
                return Err(EngineError::CyclicFlow { node: node_id });
            }
            let Some(node) = self.graph.node(&bot.id, &node_id).await else {
                debug!(node = %node_id, "node missing, stopping traversal");
                break;
            };

            self.sessions
                .upsert(&bot.id, user, SessionState::at(&node.id, node.kind.awaits_input()))
                .await;

            match &node.kind {
                NodeKind::Condition { rule } => {
                    // Control flow only: pick the tagged branch, dispatch nothing.
                    let branch = eval::evaluate_condition(rule.as_ref(), vars);
                    let handle = if branch { "true" } else { "false" };
                    next = self
                        .graph
                        .edge(&bot.id, &node.id, Some(handle))
                        .await
                        .map(|e| e.target);
                }
                NodeKind::Message | NodeKind::Choice | NodeKind::Input { .. } => {
                    let blocks: Vec<_> = node
                        .blocks
                        .iter()
                        .map(|b| eval::interpolate_block(b, vars))
                        .collect();
                    self.outbound
                        .send_blocks(&bot.token, user, &blocks, &node.keyboard)
                        .await?;
                    // Input nodes pause the chain until the next update.
                    next = if node.kind.awaits_input() {
                        None
                    } else {
                        self.graph
                            .edge(&bot.id, &node.id, None)
                            .await
                            .map(|e| e.target)
                    };
                }
            }
        }
        Ok(())
    }
}
