//! The hook pipeline: ordered, priority-sorted, asynchronous
//! per-(direction, packet-type) interception.
//!
//! One connection's worth of work runs on a single spawned task with no
//! cross-task locking, so the whole table lives behind a single `RefCell`
//! — no `Mutex`, no `Send` bound on handlers.

use async_trait::async_trait;
use mp_protocol::{PacketData, ProxyError};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

// Re-exported so downstream crates that key off `(Direction, type)` (every
// caller of `HookTable::register`) can pull it from here rather than also
// depending on `mp-protocol` directly for a single type.
pub use mp_protocol::Direction;

/// The outcome of a hook, controlling pipeline continuation and whether
/// the packet is ultimately forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Continue,
    CancelHooks,
    Cancel,
}

/// A single traversal of the hook pipeline for one packet or local
/// lifecycle event. Mutating `data` mutates what will be forwarded.
pub struct Event {
    pub r#type: String,
    pub direction: Direction,
    pub data: PacketData,
}

/// A hook handler. Implementors observe and may mutate `event.data` in
/// place; the returned `EventAction` controls traversal.
///
/// `?Send`: handlers run on the single cooperative executor and are never
/// moved across a thread boundary, so there is no reason to pay for
/// `Send` bounds here.
#[async_trait(?Send)]
pub trait HookHandler {
    async fn handle(&self, event: &mut Event) -> EventAction;
}

pub type HookId = u64;

struct HookEntry {
    id: HookId,
    priority: i32,
    owner: Option<String>,
    handler: Rc<dyn HookHandler>,
}

/// A registered hook. Returned by `register`, consumed by `unregister`.
#[derive(Debug, Clone)]
pub struct Hook {
    pub id: HookId,
    pub scope: Direction,
    pub r#type: String,
    pub priority: i32,
}

/// Priority-ordered list of hooks for one `(scope, type)` pair.
///
/// A `Vec` with stable insertion-order ties gives the same traversal
/// order a doubly-linked list would, without unsafe pointer juggling.
#[derive(Default)]
struct HookList {
    entries: Vec<HookEntry>,
}

impl HookList {
    /// Insert after all existing entries of priority <= `entry.priority`,
    /// before all of greater priority.
    fn insert(&mut self, entry: HookEntry) {
        let pos = self
            .entries
            .iter()
            .position(|e| e.priority > entry.priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, entry);
    }

    fn remove(&mut self, id: HookId) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| e.id == id) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }

    fn contains(&self, id: HookId) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }
}

/// One table per proxy instance: `(Direction, type) -> HookList`.
#[derive(Default)]
pub struct HookTable {
    lists: HashMap<(Direction, String), HookList>,
    next_id: Cell<HookId>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `register(scope, type, handler, priority) -> Hook`, creating the
    /// list for `(scope, type)` if absent.
    pub fn register(
        &mut self,
        scope: Direction,
        r#type: impl Into<String>,
        handler: Rc<dyn HookHandler>,
        priority: i32,
        owner: Option<String>,
    ) -> Hook {
        let type_name = r#type.into();
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.lists
            .entry((scope, type_name.clone()))
            .or_default()
            .insert(HookEntry {
                id,
                priority,
                owner,
                handler,
            });
        Hook {
            id,
            scope,
            r#type: type_name,
            priority,
        }
    }

    /// O(1) removal of a hook from its list.
    pub fn unregister(&mut self, hook: &Hook) -> Result<(), ProxyError> {
        let list = self
            .lists
            .get_mut(&(hook.scope, hook.r#type.clone()))
            .ok_or_else(|| ProxyError::UnknownName(format!("hook {}", hook.id)))?;
        if list.remove(hook.id) {
            Ok(())
        } else {
            Err(ProxyError::UnknownName(format!("hook {}", hook.id)))
        }
    }

    /// Unregister every hook owned by `module_name` (used by module
    /// unload/reload to release owned hooks).
    pub fn unregister_owned_by(&mut self, module_name: &str) {
        for list in self.lists.values_mut() {
            list.entries
                .retain(|e| e.owner.as_deref() != Some(module_name));
        }
    }

    pub fn hook_count(&self, scope: Direction, r#type: &str) -> usize {
        self.lists
            .get(&(scope, r#type.to_owned()))
            .map(|l| l.entries.len())
            .unwrap_or(0)
    }

    pub fn table_size(&self) -> usize {
        self.lists.values().map(|l| l.entries.len()).sum()
    }
}

/// Run `execute(scope, type, data)` against `table`.
///
/// Takes the table by `&RefCell<HookTable>` rather than as a method so the
/// borrow scope around each handler invocation can be kept short: a
/// handler awaited here may itself call `table.borrow_mut()` to
/// register/unregister hooks, which would panic if we held a `Ref` across
/// the `.await`. The traversal snapshots `(id, handler)` pairs before it
/// starts and re-checks membership before each call, which gives exactly
/// the semantics §4.A demands: removals of already-visited or
/// not-yet-visited hooks take effect immediately, insertions made mid-pass
/// are not visited in this pass.
pub async fn execute(
    table: &RefCell<HookTable>,
    scope: Direction,
    r#type: &str,
    data: PacketData,
) -> Result<(bool, PacketData), ProxyError> {
    let key = (scope, r#type.to_owned());
    let snapshot: Vec<(HookId, Rc<dyn HookHandler>)> = {
        let t = table.borrow();
        t.lists
            .get(&key)
            .map(|l| l.entries.iter().map(|e| (e.id, e.handler.clone())).collect())
            .unwrap_or_default()
    };

    let mut event = Event {
        r#type: r#type.to_owned(),
        direction: scope,
        data,
    };

    for (id, handler) in snapshot {
        let still_present = {
            let t = table.borrow();
            t.lists.get(&key).map(|l| l.contains(id)).unwrap_or(false)
        };
        if !still_present {
            continue;
        }
        match handler.handle(&mut event).await {
            EventAction::Continue => continue,
            EventAction::CancelHooks => return Ok((true, event.data)),
            EventAction::Cancel => return Ok((false, event.data)),
        }
    }

    Ok((true, event.data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    struct RecordingHook {
        label: &'static str,
        action: EventAction,
        log: Rc<StdRefCell<Vec<&'static str>>>,
    }

    #[async_trait(?Send)]
    impl HookHandler for RecordingHook {
        async fn handle(&self, _event: &mut Event) -> EventAction {
            self.log.borrow_mut().push(self.label);
            self.action
        }
    }

    fn hook(
        label: &'static str,
        action: EventAction,
        log: &Rc<StdRefCell<Vec<&'static str>>>,
    ) -> Rc<dyn HookHandler> {
        Rc::new(RecordingHook {
            label,
            action,
            log: log.clone(),
        })
    }

    #[tokio::test]
    async fn priority_tie_break_preserves_registration_order() {
        // S5: h1@100, h2@50, h3@100 registered in that order must fire h2, h1, h3.
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let table = RefCell::new(HookTable::new());
        table.borrow_mut().register(
            Direction::ClientToServer,
            "chat",
            hook("h1", EventAction::Continue, &log),
            100,
            None,
        );
        table.borrow_mut().register(
            Direction::ClientToServer,
            "chat",
            hook("h2", EventAction::Continue, &log),
            50,
            None,
        );
        table.borrow_mut().register(
            Direction::ClientToServer,
            "chat",
            hook("h3", EventAction::Continue, &log),
            100,
            None,
        );

        let (forwarded, _) = execute(&table, Direction::ClientToServer, "chat", PacketData::Null)
            .await
            .unwrap();

        assert!(forwarded);
        assert_eq!(*log.borrow(), vec!["h2", "h1", "h3"]);
    }

    #[tokio::test]
    async fn cancel_suppresses_forward_and_stops_traversal() {
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let table = RefCell::new(HookTable::new());
        table.borrow_mut().register(
            Direction::ClientToServer,
            "chat",
            hook("first", EventAction::Cancel, &log),
            100,
            None,
        );
        table.borrow_mut().register(
            Direction::ClientToServer,
            "chat",
            hook("second", EventAction::Continue, &log),
            200,
            None,
        );

        let (forwarded, _) = execute(&table, Direction::ClientToServer, "chat", PacketData::Null)
            .await
            .unwrap();

        assert!(!forwarded);
        assert_eq!(*log.borrow(), vec!["first"]);
    }

    #[tokio::test]
    async fn cancel_hooks_stops_traversal_but_forwards() {
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let table = RefCell::new(HookTable::new());
        table.borrow_mut().register(
            Direction::ClientToServer,
            "chat",
            hook("first", EventAction::CancelHooks, &log),
            100,
            None,
        );
        table.borrow_mut().register(
            Direction::ClientToServer,
            "chat",
            hook("second", EventAction::Continue, &log),
            200,
            None,
        );

        let (forwarded, _) = execute(&table, Direction::ClientToServer, "chat", PacketData::Null)
            .await
            .unwrap();

        assert!(forwarded);
        assert_eq!(*log.borrow(), vec!["first"]);
    }

    #[tokio::test]
    async fn unregister_during_traversal_skips_removed_but_not_later_hooks() {
        // Invariant 3: h1 unregisters h2; h2 must not run, h3 still runs.
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let table = Rc::new(RefCell::new(HookTable::new()));

        let h2 = table.borrow_mut().register(
            Direction::Local,
            "tick",
            hook("h2", EventAction::Continue, &log),
            200,
            None,
        );

        struct UnregisterH2 {
            table: Rc<RefCell<HookTable>>,
            target: Hook,
            log: Rc<StdRefCell<Vec<&'static str>>>,
        }
        #[async_trait(?Send)]
        impl HookHandler for UnregisterH2 {
            async fn handle(&self, _event: &mut Event) -> EventAction {
                self.log.borrow_mut().push("h1");
                self.table.borrow_mut().unregister(&self.target).ok();
                EventAction::Continue
            }
        }

        table.borrow_mut().register(
            Direction::Local,
            "tick",
            Rc::new(UnregisterH2 {
                table: table.clone(),
                target: h2,
                log: log.clone(),
            }),
            100,
            None,
        );
        table.borrow_mut().register(
            Direction::Local,
            "tick",
            hook("h3", EventAction::Continue, &log),
            300,
            None,
        );

        let (forwarded, _) = execute(&table, Direction::Local, "tick", PacketData::Null)
            .await
            .unwrap();

        assert!(forwarded);
        assert_eq!(*log.borrow(), vec!["h1", "h3"]);
    }

    #[tokio::test]
    async fn empty_list_forwards_by_default() {
        let table = RefCell::new(HookTable::new());
        let (forwarded, _) = execute(&table, Direction::ServerToClient, "unused", PacketData::Null)
            .await
            .unwrap();
        assert!(forwarded);
    }
}
