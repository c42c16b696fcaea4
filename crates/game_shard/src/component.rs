use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::error::WorldError;

pub type ComponentId = u32;

/// A typed component. The name must be unique and stable across releases;
/// the numeric id is assigned at registration time in registration order.
pub trait Component: Serialize + DeserializeOwned {
    fn name() -> &'static str;
}

/// An erased component value, ready to be attached to an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentData {
    pub name: &'static str,
    pub value: JsonValue,
}

impl ComponentData {
    pub fn of<T: Component>(component: &T) -> Result<Self, WorldError> {
        Ok(Self {
            name: T::name(),
            value: serde_json::to_value(component)?,
        })
    }
}

/// Name/id table for registered components. Ids are the vector indices, so
/// the mapping is bijective and stable for a fixed registration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComponentRegistry {
    names: Vec<String>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str) -> Result<ComponentId, WorldError> {
        if self.names.iter().any(|existing| existing == name) {
            return Err(WorldError::ComponentAlreadyRegistered {
                name: name.to_string(),
            });
        }
        let id = self.names.len() as ComponentId;
        self.names.push(name.to_string());
        Ok(id)
    }

    pub fn id_by_name(&self, name: &str) -> Result<ComponentId, WorldError> {
        self.names
            .iter()
            .position(|existing| existing == name)
            .map(|index| index as ComponentId)
            .ok_or_else(|| WorldError::ComponentNotRegistered {
                name: name.to_string(),
            })
    }

    pub fn id_of<T: Component>(&self) -> Result<ComponentId, WorldError> {
        self.id_by_name(T::name())
    }

    pub fn name_by_id(&self, id: ComponentId) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Health {
        value: i64,
    }

    impl Component for Health {
        fn name() -> &'static str {
            "health"
        }
    }

    #[test]
    fn ids_follow_registration_order() {
        let mut registry = ComponentRegistry::new();
        assert_eq!(registry.register("alpha").expect("register"), 0);
        assert_eq!(registry.register("beta").expect("register"), 1);
        assert_eq!(registry.register("gamma").expect("register"), 2);
        assert_eq!(registry.id_by_name("beta").expect("lookup"), 1);
        assert_eq!(registry.name_by_id(2), Some("gamma"));
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut registry = ComponentRegistry::new();
        registry.register("alpha").expect("register");
        assert_eq!(
            registry.register("alpha"),
            Err(WorldError::ComponentAlreadyRegistered {
                name: "alpha".to_string()
            })
        );
    }

    #[test]
    fn typed_lookup_uses_component_name() {
        let mut registry = ComponentRegistry::new();
        registry.register("health").expect("register");
        assert_eq!(registry.id_of::<Health>().expect("lookup"), 0);
        let data = ComponentData::of(&Health { value: 10 }).expect("encode");
        assert_eq!(data.name, "health");
        assert_eq!(data.value, serde_json::json!({"value": 10}));
    }
}
