use crate::models::Vote;
use async_trait::async_trait;
use std::collections::HashSet;

/// Gate consulted before any administrative transition. The lifecycle trusts
/// the answer as-is.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn can_manage(&self, actor: &str, vote: &Vote) -> bool;
}

pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn can_manage(&self, _actor: &str, _vote: &Vote) -> bool {
        true
    }
}

/// Only the listed actors may manage votes.
pub struct AdminList {
    admins: HashSet<String>,
}

impl AdminList {
    pub fn new(admins: HashSet<String>) -> Self {
        Self { admins }
    }
}

#[async_trait]
impl Authorizer for AdminList {
    async fn can_manage(&self, actor: &str, _vote: &Vote) -> bool {
        self.admins.contains(actor)
    }
}

/// Picks the gate matching the configured admin list.
pub fn from_admin_users(admins: &HashSet<String>) -> Box<dyn Authorizer> {
    if admins.is_empty() {
        Box::new(AllowAll)
    } else {
        Box::new(AdminList::new(admins.clone()))
    }
}
