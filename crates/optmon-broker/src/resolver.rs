//! Symbol to instrument-token resolution.

use optmon_core::Exchange;
use std::collections::HashMap;

/// Resolves a trading symbol on an exchange to the venue's instrument token.
pub trait TokenResolver: Send + Sync {
    fn resolve_token(&self, symbol: &str, exchange: Exchange) -> Option<String>;
}

/// Resolver backed by a fixed table.
#[derive(Debug, Default, Clone)]
pub struct StaticTokenResolver {
    tokens: HashMap<(Exchange, String), String>,
}

impl StaticTokenResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace one row. Symbols are matched case-insensitively.
    pub fn insert(&mut self, symbol: &str, exchange: Exchange, token: impl Into<String>) {
        self.tokens
            .insert((exchange, symbol.to_ascii_uppercase()), token.into());
    }

    #[must_use]
    pub fn with(mut self, symbol: &str, exchange: Exchange, token: impl Into<String>) -> Self {
        self.insert(symbol, exchange, token);
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl TokenResolver for StaticTokenResolver {
    fn resolve_token(&self, symbol: &str, exchange: Exchange) -> Option<String> {
        self.tokens
            .get(&(exchange, symbol.to_ascii_uppercase()))
            .cloned()
    }
}
