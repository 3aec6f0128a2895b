// Subscription Manager (component F): per-connection scope and per-session
// subscription, routing events by category to the set of connections that
// should receive them.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Session,
    Observer,
}

#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub scope: Scope,
    pub session_subs: HashSet<String>,
    pub fleet_subscribed: bool,
    pub fleet_cursor: i64,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            scope: Scope::Global,
            session_subs: HashSet::new(),
            fleet_subscribed: false,
            fleet_cursor: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Category<'a> {
    Lifecycle,
    Session(&'a str),
    Commander,
    Fleet,
    Direct,
}

pub struct SubscriptionManager<ConnId> {
    connections: HashMap<ConnId, ConnectionState>,
}

impl<ConnId: std::hash::Hash + Eq + Clone> SubscriptionManager<ConnId> {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    pub fn register(&mut self, conn: ConnId) {
        self.connections.insert(conn, ConnectionState::default());
    }

    pub fn unregister(&mut self, conn: &ConnId) {
        self.connections.remove(conn);
    }

    pub fn set_scope(&mut self, conn: &ConnId, scope: Scope) {
        if let Some(state) = self.connections.get_mut(conn) {
            state.scope = scope;
        }
    }

    pub fn subscribe(&mut self, conn: &ConnId, session_id: String) {
        if let Some(state) = self.connections.get_mut(conn) {
            state.session_subs.insert(session_id);
        }
    }

    pub fn unsubscribe(&mut self, conn: &ConnId, session_id: &str) {
        if let Some(state) = self.connections.get_mut(conn) {
            state.session_subs.remove(session_id);
        }
    }

    pub fn fleet_subscribe(&mut self, conn: &ConnId, from_cursor: i64) {
        if let Some(state) = self.connections.get_mut(conn) {
            state.fleet_subscribed = true;
            state.fleet_cursor = from_cursor;
        }
    }

    /// Advances a fleet-subscribed connection's replay cursor after events
    /// up to and including `cursor` have been delivered to it.
    pub fn set_fleet_cursor(&mut self, conn: &ConnId, cursor: i64) {
        if let Some(state) = self.connections.get_mut(conn) {
            state.fleet_cursor = cursor;
        }
    }

    pub fn state(&self, conn: &ConnId) -> Option<&ConnectionState> {
        self.connections.get(conn)
    }

    /// Returns the set of connections that should receive a message in the
    /// given category, per each connection's subscribed scope.
    pub fn recipients(&self, category: &Category) -> Vec<ConnId> {
        self.connections
            .iter()
            .filter(|(_, state)| matches(state, category))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

fn matches(state: &ConnectionState, category: &Category) -> bool {
    match category {
        Category::Lifecycle => true,
        Category::Session(sid) => match state.scope {
            Scope::Global => true,
            Scope::Session => state.session_subs.contains(*sid),
            Scope::Observer => false,
        },
        Category::Commander => matches!(state.scope, Scope::Global | Scope::Session),
        Category::Fleet => state.fleet_subscribed,
        Category::Direct => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_reaches_every_scope() {
        let mut mgr: SubscriptionManager<u32> = SubscriptionManager::new();
        mgr.register(1);
        mgr.set_scope(&1, Scope::Observer);
        mgr.register(2);

        let recipients = mgr.recipients(&Category::Lifecycle);
        assert_eq!(recipients.len(), 2);
    }

    #[test]
    fn session_category_requires_subscription_under_session_scope() {
        let mut mgr: SubscriptionManager<u32> = SubscriptionManager::new();
        mgr.register(1);
        mgr.set_scope(&1, Scope::Session);

        assert!(mgr.recipients(&Category::Session("abc")).is_empty());

        mgr.subscribe(&1, "abc".to_string());
        assert_eq!(mgr.recipients(&Category::Session("abc")), vec![1]);
    }

    #[test]
    fn observer_scope_never_gets_session_events() {
        let mut mgr: SubscriptionManager<u32> = SubscriptionManager::new();
        mgr.register(1);
        mgr.set_scope(&1, Scope::Observer);
        mgr.subscribe(&1, "abc".to_string());

        assert!(mgr.recipients(&Category::Session("abc")).is_empty());
    }

    #[test]
    fn fleet_category_requires_explicit_subscription_regardless_of_scope() {
        let mut mgr: SubscriptionManager<u32> = SubscriptionManager::new();
        mgr.register(1);
        mgr.set_scope(&1, Scope::Global);
        assert!(mgr.recipients(&Category::Fleet).is_empty());

        mgr.fleet_subscribe(&1, 0);
        assert_eq!(mgr.recipients(&Category::Fleet), vec![1]);
    }

    #[test]
    fn direct_category_is_always_empty() {
        let mut mgr: SubscriptionManager<u32> = SubscriptionManager::new();
        mgr.register(1);
        mgr.fleet_subscribe(&1, 0);
        assert!(mgr.recipients(&Category::Direct).is_empty());
    }
}
