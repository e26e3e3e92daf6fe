//! In-memory host bridge for VM tests.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::bytecode::compile::compile;
use crate::runtime::host::{EntityId, EntityLookup, EventSink};
use crate::runtime::script::{ArgBag, RuntimeContext, ScriptDefinition};

#[derive(Default)]
pub struct FakeWorld {
    /// Every untargeted event, in firing order.
    pub fired: Vec<(String, ArgBag)>,
    names: HashMap<String, EntityId>,
    contexts: HashMap<EntityId, RuntimeContext>,
    lent: HashSet<EntityId>,
    next_id: EntityId,
}

impl FakeWorld {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    /// Adds a named entity without a script.
    pub fn spawn(&mut self, name: &str) -> EntityId {
        let id = self.next_id;
        self.next_id += 1;
        self.names.insert(name.to_string(), id);
        id
    }

    /// Adds a named entity running `source` from its initial state.
    pub fn spawn_scripted(&mut self, name: &str, source: &str) -> EntityId {
        let def = Rc::new(compile(&format!("{}.zephyr", name), source).unwrap());
        self.spawn_with(name, def)
    }

    pub fn spawn_with(&mut self, name: &str, def: Rc<ScriptDefinition>) -> EntityId {
        let id = self.spawn(name);
        let initial = def.initial_state().to_string();
        let ctx = RuntimeContext::new(def, &initial).unwrap().with_owner(id);
        self.contexts.insert(id, ctx);
        id
    }

    pub fn context(&self, id: EntityId) -> &RuntimeContext {
        &self.contexts[&id]
    }

    pub fn fired_names(&self) -> Vec<&str> {
        self.fired.iter().map(|(name, _)| name.as_str()).collect()
    }
}

impl EventSink for FakeWorld {
    fn fire_event(&mut self, event: &str, args: &ArgBag) {
        self.fired.push((event.to_string(), args.clone()));
    }
}

impl EntityLookup for FakeWorld {
    fn resolve(&self, name: &str) -> Option<EntityId> {
        self.names.get(name).copied()
    }

    fn take_context(&mut self, id: EntityId) -> Option<RuntimeContext> {
        let ctx = self.contexts.remove(&id)?;
        self.lent.insert(id);
        Some(ctx)
    }

    fn return_context(&mut self, id: EntityId, context: RuntimeContext) {
        self.lent.remove(&id);
        self.contexts.insert(id, context);
    }

    fn has_script(&self, id: EntityId) -> bool {
        self.contexts.contains_key(&id) || self.lent.contains(&id)
    }
}
