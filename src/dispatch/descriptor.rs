//! Interface descriptors: the method and event tables of an endpoint.

use serde::{Deserialize, Serialize};

use crate::ipc::message::MethodRef;
use crate::types::{Error, Result};

/// One callable method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub id: u32,
    pub name: String,
    pub arity: usize,
    /// Whether explicit cancellation and caller deadlines apply to this method.
    pub cancellable: bool,
}

/// Methods and events exposed by one interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub name: String,
    pub methods: Vec<MethodDescriptor>,
    pub events: Vec<String>,
}

impl InterfaceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn method(&self, id: u32) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.id == id)
    }

    pub fn method_by_name(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(name))
    }

    /// Look up a method by id, or by name ignoring case.
    pub fn resolve(&self, method: &MethodRef) -> Result<&MethodDescriptor> {
        let found = match method {
            MethodRef::Id(id) => self.method(*id),
            MethodRef::Name(name) => self.method_by_name(name),
        };
        found.ok_or_else(|| {
            Error::method_not_found(format!("{} has no method {}", self.name, method))
        })
    }

    /// Rewrite a by-name reference to the method's id. Unknown names are
    /// left alone so the callee reports them.
    pub fn bind(&self, method: &mut MethodRef) {
        if let MethodRef::Name(name) = method {
            if let Some(found) = self.method_by_name(name) {
                *method = MethodRef::Id(found.id);
            }
        }
    }

    /// Canonical spelling of an event name.
    pub fn event(&self, name: &str) -> Option<&str> {
        self.events
            .iter()
            .find(|e| e.eq_ignore_ascii_case(name))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> InterfaceDescriptor {
        InterfaceDescriptor {
            name: "calc".into(),
            methods: vec![
                MethodDescriptor {
                    id: 0,
                    name: "Add".into(),
                    arity: 2,
                    cancellable: false,
                },
                MethodDescriptor {
                    id: 1,
                    name: "Wait".into(),
                    arity: 1,
                    cancellable: true,
                },
            ],
            events: vec!["Changed".into()],
        }
    }

    #[test]
    fn test_name_resolution_ignores_case() {
        let d = descriptor();
        assert_eq!(d.resolve(&MethodRef::Name("wait".into())).unwrap().id, 1);
        assert_eq!(d.resolve(&MethodRef::Id(0)).unwrap().name, "Add");
    }

    #[test]
    fn test_bind_rewrites_known_names_only() {
        let d = descriptor();
        let mut method = MethodRef::Name("WAIT".into());
        d.bind(&mut method);
        assert_eq!(method, MethodRef::Id(1));

        let mut method = MethodRef::Name("Sub".into());
        d.bind(&mut method);
        assert_eq!(method, MethodRef::Name("Sub".into()));
    }

    #[test]
    fn test_unknown_method() {
        let d = descriptor();
        assert!(matches!(d.resolve(&MethodRef::Id(9)), Err(Error::MethodNotFound(_))));
        assert!(d.resolve(&MethodRef::Name("Sub".into())).is_err());
    }

    #[test]
    fn test_event_lookup_ignores_case() {
        assert_eq!(descriptor().event("CHANGED"), Some("Changed"));
        assert_eq!(descriptor().event("Gone"), None);
    }
}
