//! Evaluation context and variable scopes

use serde_json::Value;

use super::options::Options;
use super::Engine;

/// A frame of variable bindings, linked to the frame it shadows
#[derive(Debug, Clone, Default)]
pub struct Scope<'a> {
    bindings: Vec<(String, Value)>,
    parent: Option<&'a Scope<'a>>,
}

impl Scope<'static> {
    /// Root frame
    pub fn new(bindings: Vec<(String, Value)>) -> Self {
        Self {
            bindings,
            parent: None,
        }
    }
}

impl<'a> Scope<'a> {
    /// Frame shadowing `parent`
    pub fn with_parent(parent: Option<&'a Scope<'a>>, bindings: Vec<(String, Value)>) -> Self {
        Self { bindings, parent }
    }

    /// Nearest binding of `name`
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        let mut frame = Some(self);
        while let Some(scope) = frame {
            if let Some((_, value)) = scope.bindings.iter().rev().find(|(n, _)| n == name) {
                return Some(value);
            }
            frame = scope.parent;
        }
        None
    }

    /// Bindings of this frame only
    pub fn bindings(&self) -> &[(String, Value)] {
        &self.bindings
    }

    /// Every visible binding, nearest frame winning
    pub fn flatten(&self) -> Vec<(String, Value)> {
        let mut out: Vec<(String, Value)> = Vec::new();
        let mut frame = Some(self);
        while let Some(scope) = frame {
            for (name, value) in &scope.bindings {
                if !out.iter().any(|(n, _)| n == name) {
                    out.push((name.clone(), value.clone()));
                }
            }
            frame = scope.parent;
        }
        out
    }
}

/// Per-evaluation context: engine, `$$ROOT` and the variable frames
#[derive(Clone, Copy)]
pub struct Context<'a> {
    engine: &'a Engine,
    root: &'a Value,
    scope: Option<&'a Scope<'a>>,
}

impl<'a> Context<'a> {
    /// Context rooted at `root` with no variables
    pub fn new(engine: &'a Engine, root: &'a Value) -> Self {
        Self {
            engine,
            root,
            scope: None,
        }
    }

    /// Engine handle
    pub fn engine(&self) -> &'a Engine {
        self.engine
    }

    /// Engine options
    pub fn options(&self) -> &'a Options {
        self.engine.options()
    }

    /// Value of `$$ROOT`
    pub fn root(&self) -> &'a Value {
        self.root
    }

    /// Innermost frame
    pub fn scope(&self) -> Option<&'a Scope<'a>> {
        self.scope
    }

    /// Same variables, new root
    pub fn with_root<'b>(&self, root: &'b Value) -> Context<'b>
    where
        'a: 'b,
    {
        Context {
            engine: self.engine,
            root,
            scope: self.scope,
        }
    }

    /// Same root, `scope` as innermost frame
    pub fn with_scope<'b>(&self, scope: &'b Scope<'b>) -> Context<'b>
    where
        'a: 'b,
    {
        Context {
            engine: self.engine,
            root: self.root,
            scope: Some(scope),
        }
    }

    /// User variable lookup
    pub fn variable(&self, name: &str) -> Option<&'a Value> {
        self.scope.and_then(|scope| scope.lookup(name))
    }
}
