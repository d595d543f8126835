use anyhow::{Context, Result};
use dashmap::DashMap;
use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::graph::{BotConfig, Edge, Product, RawCommandNode, VariableDef};
use crate::store::MemoryStore;

/// One published bot as the editor exports it: identity plus the full flow
/// graph, declared variables and shop products.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BotDefinition {
    pub bot: BotConfig,
    #[serde(default)]
    pub nodes: Vec<RawCommandNode>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub variables: Vec<VariableDef>,
    #[serde(default)]
    pub products: Vec<Product>,
}

impl BotDefinition {
    pub fn from_path(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("reading bot definition {}", path.display()))?;
        let def: BotDefinition = serde_json::from_str(&json)
            .with_context(|| format!("parsing bot definition {}", path.display()))?;
        Ok(def)
    }

    /// Normalize and install this definition, replacing any previous graph
    /// for the same bot id.
    pub fn install_into(self, store: &MemoryStore) -> String {
        let bot_id = self.bot.id.clone();
        let nodes = self.nodes.into_iter().map(RawCommandNode::build).collect();
        store.install(self.bot, nodes, self.edges, self.variables, self.products);
        bot_id
    }
}

/// Keeps the store in sync with a directory of `*.json` bot definitions:
/// startup scan plus hot reload on change.
pub struct BotRegistry {
    store: Arc<MemoryStore>,
    by_path: DashMap<PathBuf, String>,
}

fn is_definition(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("json")
}

impl BotRegistry {
    pub fn new(store: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            by_path: DashMap::new(),
        })
    }

    /// Scan `dir` once, installing every definition that parses. Files that
    /// fail to parse are logged and skipped; the editor may leave a bot
    /// half-published and the rest should still come up.
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating bots dir {}", dir.display()))?;
        }
        let mut loaded = 0;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !is_definition(&path) {
                continue;
            }
            match self.load_file(&path) {
                Ok(bot_id) => {
                    info!(bot = %bot_id, file = %path.display(), "loaded bot definition");
                    loaded += 1;
                }
                Err(e) => error!(file = %path.display(), "failed to load bot definition: {e:#}"),
            }
        }
        Ok(loaded)
    }

    fn load_file(&self, path: &Path) -> Result<String> {
        let bot_id = BotDefinition::from_path(path)?.install_into(&self.store);
        self.by_path.insert(path.to_path_buf(), bot_id.clone());
        Ok(bot_id)
    }

    fn remove_file(&self, path: &Path) {
        if let Some((_, bot_id)) = self.by_path.remove(path) {
            self.store.remove_bot(&bot_id);
        }
    }

    /// Watch `dir` and reload definitions as they change. Poll-based so it
    /// also works on filesystems without native notification.
    pub fn watch(self: Arc<Self>, dir: PathBuf) -> JoinHandle<()> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<notify::Result<Event>>();
        tokio::spawn(async move {
            let mut watcher = match PollWatcher::new(
                move |res| {
                    let _ = tx.send(res);
                },
                Config::default().with_poll_interval(Duration::from_secs(2)),
            ) {
                Ok(w) => w,
                Err(e) => {
                    error!("failed to create bots watcher: {e}");
                    return;
                }
            };
            if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
                error!(dir = %dir.display(), "failed to watch bots dir: {e}");
                return;
            }
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(event) => self.handle_event(event),
                    Err(e) => warn!("bots watcher error: {e}"),
                }
            }
        })
    }

    fn handle_event(&self, event: Event) {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => {
                for path in event.paths.into_iter().filter(|p| is_definition(p)) {
                    match self.load_file(&path) {
                        Ok(bot_id) => info!(bot = %bot_id, file = %path.display(), "reloaded bot definition"),
                        Err(e) => warn!(file = %path.display(), "failed to reload: {e:#}"),
                    }
                }
            }
            EventKind::Remove(_) => {
                for path in event.paths.iter().filter(|p| is_definition(p)) {
                    self.remove_file(path);
                }
            }
            _ => {}
        }
    }
}
