//! Per-node working memory.
//!
//! Two keyed stores: facts (the right memory of a beta node, the whole memory
//! of an alpha node) and tokens (the left memory of a beta node, the whole
//! memory of a terminal). Iteration follows insertion order, which is what
//! makes join output order deterministic.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::types::{Fact, FactId, Token, TokenId};

/// Insertion-ordered map with constant-time lookup by key.
///
/// Removal shifts the tail so iteration keeps insertion order.
#[derive(Debug, Clone)]
struct OrderedStore<V> {
    entries: IndexMap<String, V>,
}

impl<V> Default for OrderedStore<V> {
    fn default() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }
}

impl<V> OrderedStore<V> {
    /// Insert or overwrite; an overwritten entry keeps its position.
    fn insert(&mut self, key: String, value: V) -> Option<V> {
        self.entries.insert(key, value)
    }

    fn remove(&mut self, key: &str) -> Option<V> {
        self.entries.shift_remove(key)
    }

    fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(key)
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    /// Remove every entry matching the predicate, returning them in order.
    fn drain_where(&mut self, mut pred: impl FnMut(&V) -> bool) -> Vec<V> {
        if !self.entries.values().any(&mut pred) {
            return Vec::new();
        }
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|(_, v)| pred(v));
        self.entries = kept.into_iter().collect();
        removed.into_iter().map(|(_, v)| v).collect()
    }
}

/// Working memory of one node.
#[derive(Debug, Clone, Default)]
pub struct WorkingMemory {
    facts: OrderedStore<Arc<Fact>>,
    tokens: OrderedStore<Token>,
}

impl WorkingMemory {
    /// Empty memory.
    pub fn new() -> Self {
        Self::default()
    }

    // ---------------------------------------------------------------------
    // Facts
    // ---------------------------------------------------------------------

    /// Insert or overwrite a fact by identifier. Returns the previous entry.
    pub fn add_fact(&mut self, fact: Arc<Fact>) -> Option<Arc<Fact>> {
        self.facts.insert(fact.id.clone(), fact)
    }

    /// Remove a fact. Idempotent.
    pub fn remove_fact(&mut self, id: &str) -> Option<Arc<Fact>> {
        self.facts.remove(id)
    }

    /// Look up a fact.
    pub fn get_fact(&self, id: &str) -> Option<&Arc<Fact>> {
        self.facts.get(id)
    }

    /// Whether the fact is held.
    pub fn contains_fact(&self, id: &str) -> bool {
        self.facts.contains(id)
    }

    /// Facts in insertion order.
    pub fn facts(&self) -> impl Iterator<Item = &Arc<Fact>> {
        self.facts.values()
    }

    /// Owned snapshot of the facts, in insertion order.
    pub fn list_facts(&self) -> Vec<Arc<Fact>> {
        self.facts.values().cloned().collect()
    }

    /// Number of facts.
    pub fn fact_count(&self) -> usize {
        self.facts.len()
    }

    // ---------------------------------------------------------------------
    // Tokens
    // ---------------------------------------------------------------------

    /// Insert or overwrite a token by identifier. Returns the previous entry.
    pub fn add_token(&mut self, token: Token) -> Option<Token> {
        self.tokens.insert(token.id.clone(), token)
    }

    /// Remove a token. Idempotent.
    pub fn remove_token(&mut self, id: &str) -> Option<Token> {
        self.tokens.remove(id)
    }

    /// Look up a token.
    pub fn get_token(&self, id: &str) -> Option<&Token> {
        self.tokens.get(id)
    }

    /// Whether the token is held.
    pub fn contains_token(&self, id: &str) -> bool {
        self.tokens.contains(id)
    }

    /// Tokens in insertion order.
    pub fn tokens(&self) -> impl Iterator<Item = &Token> {
        self.tokens.values()
    }

    /// Owned snapshot of the tokens, in insertion order.
    pub fn list_tokens(&self) -> Vec<Token> {
        self.tokens.values().cloned().collect()
    }

    /// Number of tokens.
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Remove every token referencing the fact.
    pub fn remove_tokens_with_fact(&mut self, fact_id: &str) -> Vec<Token> {
        self.tokens.drain_where(|t| t.contains_fact(fact_id))
    }

    /// Remove every token derived from the given parent.
    pub fn remove_tokens_with_parent(&mut self, parent: &str) -> Vec<Token> {
        self.tokens
            .drain_where(|t| t.parent.as_deref() == Some(parent))
    }

    /// True when neither facts nor tokens are held.
    pub fn is_empty(&self) -> bool {
        self.facts.len() == 0 && self.tokens.len() == 0
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.facts.clear();
        self.tokens.clear();
    }

    /// Serializable copy of the memory.
    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            facts: self.facts.values().map(|f| f.as_ref().clone()).collect(),
            tokens: self.tokens.values().cloned().collect(),
        }
    }

    /// Rebuild a memory from a snapshot, preserving order.
    pub fn from_snapshot(snapshot: MemorySnapshot) -> Self {
        let mut memory = Self::new();
        for fact in snapshot.facts {
            memory.add_fact(Arc::new(fact));
        }
        for token in snapshot.tokens {
            memory.add_token(token);
        }
        memory
    }
}

/// Persisted form of a node memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    /// Facts in insertion order
    pub facts: Vec<Fact>,
    /// Tokens in insertion order
    pub tokens: Vec<Token>,
}

impl MemorySnapshot {
    /// Identifiers of the stored facts.
    pub fn fact_ids(&self) -> Vec<FactId> {
        self.facts.iter().map(|f| f.id.clone()).collect()
    }

    /// Identifiers of the stored tokens.
    pub fn token_ids(&self) -> Vec<TokenId> {
        self.tokens.iter().map(|t| t.id.clone()).collect()
    }
}
