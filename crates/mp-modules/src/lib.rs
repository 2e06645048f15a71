//! Module lifecycle (SPEC_FULL.md §4.D): import, load, unload and
//! hot-reload of proxy modules, plus the owned-hook/owned-command
//! bookkeeping that makes unload safe.
//!
//! There is no dynamic code loader here — this is a compiled binary, not
//! a scripting host. A [`ModuleFactory`] stands in for "load the module's
//! class from a file": it is a registered constructor keyed by a stable
//! string, and "re-import from path" (§4.D step 2-3) becomes "re-invoke
//! the same factory". The version chain (`current`/`previous`), state
//! migration, and owned-resource release all work exactly as described.

use async_trait::async_trait;
use mp_commands::{Command, CommandDescriptor, CommandRegistry};
use mp_hooks::{Direction, Hook, HookHandler, HookTable};
use mp_protocol::{ProxyError, ProxyHandle};
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

/// Type-erased per-module key/value store, used to carry state across a
/// reload (§4.D step 5: "copy every key named in `state_preserve_keys`
/// from the old instance into the new one"). Values are moved, not
/// cloned, so live handles (timers, graph references) transfer intact.
#[derive(Default)]
pub struct ModuleState(HashMap<String, Box<dyn Any>>);

impl ModuleState {
    pub fn new() -> Self {
        ModuleState(HashMap::new())
    }

    pub fn insert<T: 'static>(&mut self, key: impl Into<String>, value: T) {
        self.0.insert(key.into(), Box::new(value));
    }

    pub fn get<T: 'static>(&self, key: &str) -> Option<&T> {
        self.0.get(key).and_then(|b| b.downcast_ref())
    }

    pub fn get_mut<T: 'static>(&mut self, key: &str) -> Option<&mut T> {
        self.0.get_mut(key).and_then(|b| b.downcast_mut())
    }

    fn take_raw(&mut self, key: &str) -> Option<Box<dyn Any>> {
        self.0.remove(key)
    }

    fn put_raw(&mut self, key: String, value: Box<dyn Any>) {
        self.0.insert(key, value);
    }
}

/// A proxy module. Object-safe so the registry can hold a collection of
/// heterogeneous modules behind `Box<dyn Module>`.
#[async_trait(?Send)]
pub trait Module {
    /// Self-declared name. The registry keys modules by this, not by the
    /// factory key used to build them (§4.D: modules name themselves).
    fn name(&self) -> String;

    /// Keys to migrate into a freshly-built instance of this module on
    /// reload. Empty by default: most modules hold nothing worth saving.
    fn state_preserve_keys(&self) -> Vec<String> {
        Vec::new()
    }

    fn state_mut(&mut self) -> &mut ModuleState;

    /// Hydrate from this module's entry in the proxy's `module_config`
    /// table, if any. Called once, right after construction.
    fn set_config(&mut self, _config: Option<serde_json::Value>) {}

    async fn on_load(&mut self, ctx: &ModuleContext, reloading: bool) -> Result<(), ProxyError>;
    async fn on_unload(&mut self, ctx: &ModuleContext, reloading: bool) -> Result<(), ProxyError>;

    /// Dispatch target for callbacks bound through
    /// [`ModuleContext::bind_callback`]. Default no-op; modules that
    /// register timers or other indirect callbacks override this.
    fn invoke_callback(&mut self, _key: &str) {}
}

/// Handed to a module on load/unload: the means by which it registers
/// hooks and commands against the live proxy, and the handle other
/// subsystems use to reach it reload-safely.
///
/// Hooks and commands registered through `self` are tracked as *owned* by
/// this module and released automatically on unload (§4.D step "release
/// owned hooks and commands"), so modules never need their own cleanup
/// bookkeeping.
pub struct ModuleContext {
    module_name: String,
    hooks: Rc<RefCell<HookTable>>,
    commands: Rc<RefCell<CommandRegistry>>,
    proxy: Rc<dyn ProxyHandle>,
    owned_hooks: RefCell<Vec<Hook>>,
    owned_commands: RefCell<Vec<Command>>,
    self_slot: RefCell<Weak<RefCell<ModuleSlot>>>,
    registry: Weak<RefCell<ModuleRegistry>>,
}

impl ModuleContext {
    /// The proxy handle (§3 `Module {proxy: ref}`): hooks and commands a
    /// module constructs during `on_load` capture a clone of this to reach
    /// back into the live connection (inject packets, tear down upstream,
    /// read status) without the registry threading it through every call.
    pub fn proxy(&self) -> Rc<dyn ProxyHandle> {
        self.proxy.clone()
    }

    /// Direct access to the shared command registry, for modules (namely
    /// the core module) that need to execute dispatch themselves rather
    /// than just register descriptors into it.
    pub fn commands(&self) -> Rc<RefCell<CommandRegistry>> {
        self.commands.clone()
    }

    /// Direct access to the shared hook table, for introspection the
    /// per-module `register_hook` helper doesn't cover (e.g. the built-in
    /// `module` command's `list` subcommand).
    pub fn hooks(&self) -> Rc<RefCell<HookTable>> {
        self.hooks.clone()
    }

    /// Back-reference to the owning registry, for the built-in `module`
    /// command (§4.F: `load`/`unload`/`reload`/`import`) to drive other
    /// modules' lifecycle. `None` only in the brief window before
    /// [`ModuleRegistry::bind_self`] has run, which no module ever
    /// observes since it is called immediately after the registry is
    /// wrapped in its `Rc<RefCell<_>>`, before any `import`/`load`.
    pub fn modules(&self) -> Option<Rc<RefCell<ModuleRegistry>>> {
        self.registry.upgrade()
    }

    pub fn register_hook(
        &self,
        scope: Direction,
        r#type: impl Into<String>,
        handler: Rc<dyn HookHandler>,
        priority: i32,
    ) -> Hook {
        let hook = self.hooks.borrow_mut().register(
            scope,
            r#type,
            handler,
            priority,
            Some(self.module_name.clone()),
        );
        self.owned_hooks.borrow_mut().push(hook.clone());
        hook
    }

    pub fn register_command(&self, descriptor: CommandDescriptor) -> Result<Command, ProxyError> {
        let command = self.commands.borrow_mut().register(descriptor)?;
        self.owned_commands.borrow_mut().push(command.clone());
        Ok(command)
    }

    pub fn unregister_command(&self, command: &Command) -> Result<(), ProxyError> {
        self.commands.borrow_mut().unregister(command)?;
        self.owned_commands.borrow_mut().retain(|c| c.name != command.name);
        Ok(())
    }

    /// Release everything this module registered. Called by the registry
    /// as the last step of unload; safe to call even if nothing was ever
    /// registered.
    fn release_owned(&self) {
        self.hooks.borrow_mut().unregister_owned_by(&self.module_name);
        self.owned_hooks.borrow_mut().clear();
        let mut commands = self.commands.borrow_mut();
        for command in self.owned_commands.borrow_mut().drain(..) {
            let _ = commands.unregister(&command);
        }
    }

    /// A callback bound to whichever instance of this module is current
    /// at the time it fires, following the reload chain so a timer set up
    /// before a reload still reaches the replacement module (§4.D
    /// "callbacks registered before a reload must route to the new
    /// instance").
    pub fn bind_callback(&self, key: impl Into<String>) -> BoundCallback {
        BoundCallback {
            slot: self.self_slot.borrow().clone(),
            key: key.into(),
        }
    }
}

/// A callback handle produced by [`ModuleContext::bind_callback`]. Firing
/// it walks the `current` chain to the live instance and dispatches
/// `invoke_callback`, so it keeps working across reloads.
///
/// `Clone` so a module that restarts a one-shot timer repeatedly (the core
/// module's keepalive timeouts) can hand a fresh future a copy of the same
/// bound target instead of re-deriving it from a `ModuleContext` it may no
/// longer have on hand (`invoke_callback` itself only gets `&mut self`).
#[derive(Clone)]
pub struct BoundCallback {
    slot: Weak<RefCell<ModuleSlot>>,
    key: String,
}

impl BoundCallback {
    pub fn fire(&self) {
        let Some(mut slot) = self.slot.upgrade() else {
            return;
        };
        loop {
            let next = slot.borrow().current.upgrade();
            match next {
                Some(n) => slot = n,
                None => break,
            }
        }
        slot.borrow_mut().module.invoke_callback(&self.key);
    }
}

struct ModuleSlot {
    module: Box<dyn Module>,
    origin_key: String,
    loaded: bool,
    ctx: Rc<ModuleContext>,
    /// Weak pointer to the instance that replaced this one, if any. Weak
    /// so a long reload history doesn't keep every prior instance alive.
    current: Weak<RefCell<ModuleSlot>>,
    /// Strong pointer to the instance this one replaced. Collapsed to
    /// `None` whenever this slot itself gets replaced (§4.D step 7), so
    /// the chain never holds more than two links strongly at once.
    previous: Option<Rc<RefCell<ModuleSlot>>>,
}

/// Builds a module instance. `key` is the stable identifier the registry
/// uses to re-invoke this same constructor on reload — the realized
/// stand-in for "re-import from filesystem path".
pub struct ModuleFactory {
    pub key: String,
    pub build: Rc<dyn Fn() -> Box<dyn Module>>,
}

/// Owns every imported module and the shared hook/command tables they
/// register against.
pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
    modules: HashMap<String, Rc<RefCell<ModuleSlot>>>,
    hooks: Rc<RefCell<HookTable>>,
    commands: Rc<RefCell<CommandRegistry>>,
    proxy: Rc<dyn ProxyHandle>,
    module_config: HashMap<String, serde_json::Value>,
    self_handle: RefCell<Weak<RefCell<ModuleRegistry>>>,
}

impl ModuleRegistry {
    pub fn new(
        hooks: Rc<RefCell<HookTable>>,
        commands: Rc<RefCell<CommandRegistry>>,
        proxy: Rc<dyn ProxyHandle>,
    ) -> Self {
        ModuleRegistry {
            factories: HashMap::new(),
            modules: HashMap::new(),
            hooks,
            commands,
            proxy,
            module_config: HashMap::new(),
            self_handle: RefCell::new(Weak::new()),
        }
    }

    /// Record the `Rc<RefCell<_>>` this registry lives inside once its
    /// owner (the proxy core) has allocated it, so contexts built by
    /// later `import` calls can hand modules a [`ModuleContext::modules`]
    /// back-reference. Mirrors the `DeferredHandle`-then-patch pattern
    /// `mp-proxy-core` uses for `ProxyHandle` — the registry must exist
    /// before it can be wrapped, so the handle is filled in a moment
    /// after construction rather than threaded through `new`.
    pub fn bind_self(&self, handle: Weak<RefCell<ModuleRegistry>>) {
        *self.self_handle.borrow_mut() = handle;
    }

    pub fn set_module_config(&mut self, config: HashMap<String, serde_json::Value>) {
        self.module_config = config;
    }

    pub fn register_factory(&mut self, factory: ModuleFactory) {
        self.factories.insert(factory.key.clone(), factory);
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.modules.get(name).map(|s| s.borrow().loaded).unwrap_or(false)
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }

    fn build_slot(&self, factory_key: &str) -> Result<Rc<RefCell<ModuleSlot>>, ProxyError> {
        let factory = self
            .factories
            .get(factory_key)
            .ok_or_else(|| ProxyError::UnknownName(factory_key.to_owned()))?;
        let mut module = (factory.build)();
        let name = module.name();
        module.set_config(self.module_config.get(&name).cloned());

        let ctx = Rc::new(ModuleContext {
            module_name: name,
            hooks: self.hooks.clone(),
            commands: self.commands.clone(),
            proxy: self.proxy.clone(),
            owned_hooks: RefCell::new(Vec::new()),
            owned_commands: RefCell::new(Vec::new()),
            self_slot: RefCell::new(Weak::new()),
            registry: self.self_handle.borrow().clone(),
        });

        let slot = Rc::new(RefCell::new(ModuleSlot {
            module,
            origin_key: factory_key.to_owned(),
            loaded: false,
            ctx,
            current: Weak::new(),
            previous: None,
        }));
        slot.borrow().ctx.self_slot.replace(Rc::downgrade(&slot));
        Ok(slot)
    }

    /// Import (§4.D step 1): instantiate `factory_key`'s module and insert
    /// it under its self-declared name. Fails if that name is already
    /// taken. Returns the module's name.
    pub fn import(&mut self, factory_key: &str) -> Result<String, ProxyError> {
        let slot = self.build_slot(factory_key)?;
        let name = slot.borrow().module.name();
        if self.modules.contains_key(&name) {
            return Err(ProxyError::DuplicateName(name));
        }
        self.modules.insert(name.clone(), slot);
        Ok(name)
    }

    /// Load (§4.D): calls `on_load(reloading = false)` and marks the
    /// module active.
    pub async fn load(&mut self, name: &str) -> Result<(), ProxyError> {
        let slot = self
            .modules
            .get(name)
            .cloned()
            .ok_or_else(|| ProxyError::UnknownName(name.to_owned()))?;
        if slot.borrow().loaded {
            return Err(ProxyError::InvalidState(format!("{name} already loaded")));
        }
        let ctx = slot.borrow().ctx.clone();
        slot.borrow_mut().module.on_load(&ctx, false).await?;
        slot.borrow_mut().loaded = true;
        tracing::info!(module = name, "module loaded");
        Ok(())
    }

    /// Unload (§4.D): calls `on_unload`, then releases every hook and
    /// command the module owns. Unloading the core module outside a
    /// reload is rejected (invariant 9: the proxy must never be left with
    /// no core behavior).
    pub async fn unload(&mut self, name: &str, reloading: bool) -> Result<(), ProxyError> {
        if name == "core" && !reloading {
            return Err(ProxyError::InvalidState(
                "core module cannot be unloaded outside a reload".into(),
            ));
        }
        let slot = self
            .modules
            .get(name)
            .cloned()
            .ok_or_else(|| ProxyError::UnknownName(name.to_owned()))?;
        if !slot.borrow().loaded {
            return Err(ProxyError::InvalidState(format!("{name} not loaded")));
        }
        let ctx = slot.borrow().ctx.clone();
        slot.borrow_mut().module.on_unload(&ctx, reloading).await?;
        ctx.release_owned();
        slot.borrow_mut().loaded = false;
        tracing::info!(module = name, reloading, "module unloaded");
        Ok(())
    }

    /// Reload (§4.D steps 1-8): rebuild `name` from the same factory,
    /// migrate preserved state, swap it in, and thread the version chain
    /// so in-flight callbacks still reach the live instance.
    pub async fn reload(&mut self, name: &str) -> Result<String, ProxyError> {
        let old_slot = self
            .modules
            .get(name)
            .cloned()
            .ok_or_else(|| ProxyError::UnknownName(name.to_owned()))?;
        let factory_key = old_slot.borrow().origin_key.clone();

        let new_slot = self.build_slot(&factory_key)?;
        let new_name = new_slot.borrow().module.name();

        let old_ctx = old_slot.borrow().ctx.clone();
        old_slot
            .borrow_mut()
            .module
            .on_unload(&old_ctx, true)
            .await?;
        old_ctx.release_owned();

        let preserve_keys = new_slot.borrow().module.state_preserve_keys();
        {
            let mut old = old_slot.borrow_mut();
            let mut new = new_slot.borrow_mut();
            for key in preserve_keys {
                if let Some(value) = old.module.state_mut().take_raw(&key) {
                    new.module.state_mut().put_raw(key, value);
                }
            }
        }

        let new_ctx = new_slot.borrow().ctx.clone();
        new_slot.borrow_mut().module.on_load(&new_ctx, true).await?;
        new_slot.borrow_mut().loaded = true;

        {
            let mut old = old_slot.borrow_mut();
            old.current = Rc::downgrade(&new_slot);
            old.loaded = false;
            if let Some(grandparent) = old.previous.take() {
                grandparent.borrow_mut().current = Rc::downgrade(&new_slot);
            }
        }
        new_slot.borrow_mut().previous = Some(old_slot);

        if new_name != name {
            self.modules.remove(name);
        }
        self.modules.insert(new_name.clone(), new_slot);
        tracing::info!(old = name, new = new_name.as_str(), "module reloaded");
        Ok(new_name)
    }
}
