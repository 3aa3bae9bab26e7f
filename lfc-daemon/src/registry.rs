//! Command registry: name -> handler table with help strings
//!
//! The registry lock guards only the map. `call` clones the handler out and
//! executes it unlocked, so a slow handler never blocks add/remove/list (or
//! another handler registering commands).

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use lfc_error::{LfcError, Result};

/// A registered RPC handler. Params arrive as the raw JSON `params` value
/// (JSON null when absent).
pub type Handler = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

struct Command {
    handler: Handler,
    help: String,
}

#[derive(Default)]
pub struct CommandRegistry {
    commands: Mutex<BTreeMap<String, Command>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a named command.
    pub fn register<F>(&self, name: &str, help: &str, handler: F)
    where
        F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.commands.lock().insert(
            name.to_string(),
            Command {
                handler: Arc::new(handler),
                help: help.to_string(),
            },
        );
    }

    pub fn remove(&self, name: &str) -> bool {
        self.commands.lock().remove(name).is_some()
    }

    pub fn clear(&self) {
        self.commands.lock().clear();
    }

    pub fn exists(&self, name: &str) -> bool {
        self.commands.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.commands.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.lock().is_empty()
    }

    /// Sorted `(name, help)` pairs.
    pub fn list(&self) -> Vec<(String, String)> {
        self.commands
            .lock()
            .iter()
            .map(|(name, cmd)| (name.clone(), cmd.help.clone()))
            .collect()
    }

    /// Sorted command list as a JSON array of `{name, help}` objects.
    pub fn list_json(&self) -> Value {
        Value::Array(
            self.commands
                .lock()
                .iter()
                .map(|(name, cmd)| {
                    serde_json::json!({ "name": name, "help": cmd.help })
                })
                .collect(),
        )
    }

    pub fn help(&self, name: &str) -> Option<String> {
        self.commands.lock().get(name).map(|c| c.help.clone())
    }

    /// Dispatch a method call. The handler runs without the registry lock
    /// held.
    pub fn call(&self, method: &str, params: &Value) -> Result<Value> {
        let handler = {
            let guard = self.commands.lock();
            guard
                .get(method)
                .map(|c| c.handler.clone())
                .ok_or_else(|| LfcError::CommandNotFound(method.to_string()))?
        };
        handler(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_list_help() {
        let reg = CommandRegistry::new();
        reg.register("b.second", "second", |_| Ok(json!(2)));
        reg.register("a.first", "first", |_| Ok(json!(1)));

        assert_eq!(reg.len(), 2);
        assert!(reg.exists("a.first"));
        let names: Vec<String> = reg.list().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a.first", "b.second"]);
        assert_eq!(reg.help("b.second").unwrap(), "second");
        assert!(reg.help("missing").is_none());

        let listing = reg.list_json();
        assert_eq!(listing[0]["name"], "a.first");
        assert_eq!(listing[1]["help"], "second");

        assert!(reg.remove("a.first"));
        assert!(!reg.exists("a.first"));
    }

    #[test]
    fn test_call_unknown_method() {
        let reg = CommandRegistry::new();
        match reg.call("nope", &Value::Null) {
            Err(LfcError::CommandNotFound(name)) => assert_eq!(name, "nope"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_handler_runs_without_lock() {
        // A handler that mutates the registry would deadlock if call() held
        // the lock during execution.
        let reg = Arc::new(CommandRegistry::new());
        let reg_inner = reg.clone();
        reg.register("outer", "", move |_| {
            reg_inner.register("inner", "added from handler", |_| Ok(Value::Null));
            Ok(json!("ok"))
        });

        assert_eq!(reg.call("outer", &Value::Null).unwrap(), json!("ok"));
        assert!(reg.exists("inner"));
    }
}
