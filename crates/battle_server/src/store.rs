//! Backing store selection.
//!
//! The server only tracks which persistence binding is current. Battles copy
//! the name when they start, so swapping it never reaches a running battle.

use crate::error::StoreError;
use tokio::sync::RwLock;

#[derive(Debug)]
pub struct BackingStore {
    current: RwLock<String>,
    /// Selectable names; empty accepts any
    available: Vec<String>,
}

impl BackingStore {
    pub fn new(initial: impl Into<String>, available: Vec<String>) -> Self {
        Self {
            current: RwLock::new(initial.into()),
            available,
        }
    }

    pub async fn current(&self) -> String {
        self.current.read().await.clone()
    }

    pub fn accepts(&self, name: &str) -> bool {
        self.available.is_empty() || self.available.iter().any(|s| s.eq_ignore_ascii_case(name))
    }

    /// Make `name` current and return the previous selection.
    pub async fn swap(&self, name: &str) -> Result<String, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::EmptyName);
        }
        if !self.accepts(name) {
            return Err(StoreError::Unknown(name.to_string()));
        }
        let mut current = self.current.write().await;
        Ok(std::mem::replace(&mut *current, name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn swap_returns_previous() {
        let store = BackingStore::new("sqlite", vec!["sqlite".into(), "postgresql".into()]);
        assert_eq!(store.swap(" postgresql ").await.unwrap(), "sqlite");
        assert_eq!(store.current().await, "postgresql");

        assert_eq!(store.swap("").await, Err(StoreError::EmptyName));
        assert_eq!(store.swap("mysql").await, Err(StoreError::Unknown("mysql".into())));
        assert_eq!(store.current().await, "postgresql");
    }
}
