use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::bytecode::Chunk;
use crate::bytecode::compile::ARGS_PREFIX;
use crate::lang::value::{Value, ValueType};
use crate::runtime::host::EntityId;
use crate::runtime::runtime_error::RuntimeFault;

/// The compiled program for one source file.
///
/// Handlers are keyed by state, then event. A definition is shared
/// read-only by every context bound to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptDefinition {
    pub name: String,
    /// Source path the definition was compiled from.
    pub path: String,
    /// Declared states in source order. The first one is the initial state.
    pub states: Vec<String>,
    handlers: BTreeMap<String, BTreeMap<String, Chunk>>,
    /// Variables declared with a type anywhere in the script.
    declared: BTreeMap<String, ValueType>,
}

impl ScriptDefinition {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        states: Vec<String>,
        handlers: BTreeMap<String, BTreeMap<String, Chunk>>,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            states,
            handlers,
            declared: BTreeMap::new(),
        }
    }

    pub fn with_declared(mut self, declared: BTreeMap<String, ValueType>) -> Self {
        self.declared = declared;
        self
    }

    pub fn declared_type(&self, name: &str) -> Option<ValueType> {
        self.declared.get(name).copied()
    }

    /// What reading `name` yields before anything is assigned to it: the
    /// declared type's default, or `Number(0)` for undeclared names.
    pub fn unset_value(&self, name: &str) -> Value {
        self.declared_type(name)
            .unwrap_or(ValueType::Number)
            .default_value()
    }

    pub fn has_state(&self, state: &str) -> bool {
        self.states.iter().any(|s| s == state)
    }

    pub fn initial_state(&self) -> &str {
        self.states.first().map(String::as_str).unwrap_or("")
    }

    pub fn handler(&self, state: &str, event: &str) -> Option<&Chunk> {
        self.handlers.get(state)?.get(event)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.values().map(|events| events.len()).sum()
    }

    /// Every `(state, event, chunk)` in state then event order.
    pub fn handlers(&self) -> impl Iterator<Item = (&str, &str, &Chunk)> {
        self.handlers.iter().flat_map(|(state, events)| {
            events
                .iter()
                .map(move |(event, chunk)| (state.as_str(), event.as_str(), chunk))
        })
    }

    /// Encodes the definition as postcard bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// Named parameters passed into a handler invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArgBag {
    values: BTreeMap<String, Value>,
}

impl ArgBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// One entity's mutable script state.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    definition: Rc<ScriptDefinition>,
    state: String,
    variables: HashMap<String, Value>,
    owner: Option<EntityId>,
}

impl RuntimeContext {
    /// Binds a fresh context to `definition`, starting in `initial_state`.
    pub fn new(
        definition: Rc<ScriptDefinition>,
        initial_state: &str,
    ) -> Result<Self, RuntimeFault> {
        if !definition.has_state(initial_state) {
            return Err(RuntimeFault::UnknownState(initial_state.to_string()));
        }
        Ok(Self {
            definition,
            state: initial_state.to_string(),
            variables: HashMap::new(),
            owner: None,
        })
    }

    /// Records which entity owns this context, so that events the entity
    /// fires at itself re-enter this context.
    pub fn with_owner(mut self, owner: EntityId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn owner(&self) -> Option<EntityId> {
        self.owner
    }

    pub fn definition(&self) -> &Rc<ScriptDefinition> {
        &self.definition
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    /// Switches state. Fails, leaving the current state, if the bound
    /// definition does not declare `state`.
    pub fn change_state(&mut self, state: &str) -> Result<(), RuntimeFault> {
        if !self.definition.has_state(state) {
            return Err(RuntimeFault::UnknownState(state.to_string()));
        }
        self.state = state.to_string();
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    /// Binds `args` under their reserved `args.` names, returning whatever
    /// argument entries were bound before.
    pub(crate) fn bind_args(&mut self, args: &ArgBag) -> Vec<(String, Value)> {
        let previous = self.unbind_args();
        for (name, value) in args.iter() {
            self.variables
                .insert(format!("{}{}", ARGS_PREFIX, name), value.clone());
        }
        previous
    }

    /// Drops the current argument entries and reinstates `previous`.
    pub(crate) fn restore_args(&mut self, previous: Vec<(String, Value)>) {
        self.unbind_args();
        self.variables.extend(previous);
    }

    fn unbind_args(&mut self) -> Vec<(String, Value)> {
        let names: Vec<String> = self
            .variables
            .keys()
            .filter(|name| name.starts_with(ARGS_PREFIX))
            .cloned()
            .collect();
        names
            .into_iter()
            .filter_map(|name| self.variables.remove_entry(&name))
            .collect()
    }

    /// Points this context at a recompiled definition.
    ///
    /// State and variables survive. Returns false if the old state no longer
    /// exists, in which case the context falls back to the initial state.
    pub fn rebind(&mut self, definition: Rc<ScriptDefinition>) -> bool {
        let kept = definition.has_state(&self.state);
        if !kept {
            self.state = definition.initial_state().to_string();
        }
        self.definition = definition;
        kept
    }
}
