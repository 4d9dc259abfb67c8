use std::collections::HashMap;
use std::sync::Mutex;

use crate::sync::lock;

/// Author data picked up while loading works. Only avatars for now, since the detail API
/// exposes them as a side effect and nothing else does.
#[derive(Default)]
pub struct UserCache {
    avatars: Mutex<HashMap<String, String>>,
}

impl UserCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_avatar(&self, user_id: &str, url: &str) {
        if user_id.is_empty() || url.is_empty() {
            return;
        }
        lock(&self.avatars).insert(user_id.to_string(), url.to_string());
    }

    pub fn avatar_url(&self, user_id: &str) -> Option<String> {
        lock(&self.avatars).get(user_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignores_empty_values() {
        let users = UserCache::new();
        users.add_avatar("", "https://example.com/a.png");
        users.add_avatar("7", "");
        assert!(users.avatar_url("7").is_none());

        users.add_avatar("7", "https://example.com/a.png");
        assert_eq!(users.avatar_url("7").as_deref(), Some("https://example.com/a.png"));
    }
}
