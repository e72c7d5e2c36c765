use std::collections::HashSet;

use crate::configuration::types::AccessConfig;

/// Decides whether a principal may run privileged operations such as
/// listing every instance or removing someone else's.
pub trait Authorizer: Send + Sync {
    fn is_admin(&self, principal: u64) -> bool;
}

/// Fixed set of administrator ids, read from `[access] admin_ids`.
#[derive(Debug, Clone, Default)]
pub struct AdminList {
    admins: HashSet<u64>,
}

impl AdminList {
    pub fn new(admins: impl IntoIterator<Item = u64>) -> Self {
        Self {
            admins: admins.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.admins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.admins.is_empty()
    }
}

impl From<&AccessConfig> for AdminList {
    fn from(access: &AccessConfig) -> Self {
        Self::new(access.admin_ids.iter().copied())
    }
}

impl Authorizer for AdminList {
    fn is_admin(&self, principal: u64) -> bool {
        self.admins.contains(&principal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_list_from_config() {
        let access = AccessConfig {
            admin_ids: vec![1, 18_446_744_073_709_551_615, 1],
        };
        let admins = AdminList::from(&access);
        assert_eq!(admins.len(), 2);
        assert!(admins.is_admin(1));
        assert!(admins.is_admin(u64::MAX));
        assert!(!admins.is_admin(2));
    }

    #[test]
    fn test_empty_list_admits_nobody() {
        let admins = AdminList::default();
        assert!(admins.is_empty());
        assert!(!admins.is_admin(0));
    }
}
